// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resource rules and resource tree scanning.
//!
//! A bundle's resources are classified by an ordered list of regular
//! expression rules. Each rule carries a weight and flags saying whether
//! matched files are optional, omitted from the seal, nested code, or
//! excluded from processing entirely.
//!
//! For any path, the matching rule with the highest weight wins, with ties
//! resolved in favor of the rule declared first. An exclusion rule that
//! matches wins immediately, regardless of weight.
//!
//! Rules are serialized in `CodeResources` files as a dictionary mapping
//! the pattern to either a boolean or a dictionary of attributes. `true`
//! denotes a default rule and `false` an omitting rule.

use {
    crate::error::CodeSignError,
    bitflags::bitflags,
    log::{debug, warn},
    plist::{Dictionary, Value},
    std::path::{Path, PathBuf},
};

bitflags! {
    /// Attributes of a resource rule.
    pub struct RuleFlags: u32 {
        /// Matched files may be absent.
        const OPTIONAL = 0x01;
        /// Matched files are not sealed.
        const OMITTED = 0x02;
        /// Matched entries are nested code.
        const NESTED = 0x04;
        /// Matched entries are not processed at all. Never serialized.
        const EXCLUSION = 0x08;
        /// Rule applies to the top of the resource tree.
        const TOP = 0x10;
    }
}

/// A single resource rule.
#[derive(Clone, Debug)]
pub struct Rule {
    /// The regular expression source.
    pub pattern: String,
    /// Explicit weight. `None` means the default weight of 1.
    pub weight: Option<u32>,
    pub flags: RuleFlags,
    re: regex::Regex,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.weight == other.weight && self.flags == other.flags
    }
}

impl Eq for Rule {}

impl Rule {
    pub fn new(pattern: impl ToString) -> Result<Self, CodeSignError> {
        let pattern = pattern.to_string();
        let re = regex::Regex::new(&pattern)
            .map_err(|e| CodeSignError::ResourceRuleBadRegex(pattern.clone(), e))?;

        Ok(Self {
            pattern,
            weight: None,
            flags: RuleFlags::empty(),
            re,
        })
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.flags |= RuleFlags::OPTIONAL;
        self
    }

    #[must_use]
    pub fn omit(mut self) -> Self {
        self.flags |= RuleFlags::OMITTED;
        self
    }

    #[must_use]
    pub fn nested(mut self) -> Self {
        self.flags |= RuleFlags::NESTED;
        self
    }

    #[must_use]
    pub fn exclude(mut self) -> Self {
        self.flags |= RuleFlags::EXCLUSION;
        self
    }

    #[must_use]
    pub fn top(mut self) -> Self {
        self.flags |= RuleFlags::TOP;
        self
    }

    #[must_use]
    pub fn weight(mut self, v: u32) -> Self {
        self.weight = Some(v);
        self
    }

    /// The weight used for rule selection.
    pub fn effective_weight(&self) -> u32 {
        self.weight.unwrap_or(1)
    }

    pub fn is_optional(&self) -> bool {
        self.flags.contains(RuleFlags::OPTIONAL)
    }

    pub fn is_omitted(&self) -> bool {
        self.flags.contains(RuleFlags::OMITTED)
    }

    pub fn is_nested(&self) -> bool {
        self.flags.contains(RuleFlags::NESTED)
    }

    pub fn is_exclusion(&self) -> bool {
        self.flags.contains(RuleFlags::EXCLUSION)
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.re.is_match(path)
    }

    /// Parse a rule from its `CodeResources` value.
    pub fn from_plist(pattern: &str, value: &Value) -> Result<Self, CodeSignError> {
        let rule = Self::new(pattern)?;

        match value {
            Value::Boolean(true) => Ok(rule),
            Value::Boolean(false) => Ok(rule.omit()),
            Value::Dictionary(dict) => {
                let mut rule = rule;

                for (key, value) in dict {
                    let flag = match key.as_str() {
                        "weight" => {
                            let weight = value
                                .as_real()
                                .or_else(|| value.as_signed_integer().map(|v| v as f64))
                                .filter(|v| *v >= 0.0 && *v <= u32::MAX as f64)
                                .ok_or_else(|| {
                                    CodeSignError::ResourceRulesInvalid(format!(
                                        "rule {} weight is not a non-negative number: {:?}",
                                        pattern, value
                                    ))
                                })?;
                            rule.weight = Some(weight as u32);
                            continue;
                        }
                        "omit" => RuleFlags::OMITTED,
                        "optional" => RuleFlags::OPTIONAL,
                        "nested" => RuleFlags::NESTED,
                        "top" => RuleFlags::TOP,
                        key => {
                            return Err(CodeSignError::ResourceRulesInvalid(format!(
                                "unexpected key in rule {}: {}",
                                pattern, key
                            )));
                        }
                    };

                    let enabled = value.as_boolean().ok_or_else(|| {
                        CodeSignError::ResourceRulesInvalid(format!(
                            "rule {} key {} is not a boolean",
                            pattern, key
                        ))
                    })?;
                    rule.flags.set(flag, enabled);
                }

                Ok(rule)
            }
            _ => Err(CodeSignError::ResourceRulesInvalid(format!(
                "rule {} has invalid value {:?}",
                pattern, value
            ))),
        }
    }

    /// Serialize to a `CodeResources` rule value.
    pub fn to_plist(&self) -> Value {
        if self.flags.is_empty() && self.weight.is_none() {
            return Value::Boolean(true);
        }

        let mut dict = Dictionary::new();

        for (flag, key) in [
            (RuleFlags::NESTED, "nested"),
            (RuleFlags::OMITTED, "omit"),
            (RuleFlags::OPTIONAL, "optional"),
            (RuleFlags::TOP, "top"),
        ] {
            if self.flags.contains(flag) {
                dict.insert(key.to_string(), Value::Boolean(true));
            }
        }

        if let Some(weight) = self.weight {
            dict.insert("weight".to_string(), Value::Real(weight as f64));
        }

        Value::Dictionary(dict)
    }
}

/// What kind of entry a resource scan found.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A symlink and its target.
    Symlink(String),
    /// A directory holding nested code. Its contents are not scanned.
    NestedBundle,
}

/// An entry found by [RuleSet::scan].
#[derive(Clone, Debug)]
pub struct ScanEntry {
    /// Filesystem path of the entry.
    pub path: PathBuf,
    /// Path relative to the resource root, `/` separated.
    pub relative_path: String,
    pub kind: EntryKind,
}

/// Controls failure handling of [RuleSet::scan].
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanOptions {
    /// Skip unreadable directories instead of failing.
    pub tolerate_unreadable: bool,
    /// Skip sockets, devices and other special files instead of failing.
    pub tolerate_unsupported: bool,
}

/// A compiled, ordered set of resource rules.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Compile rules from a `CodeResources` `rules` or `rules2` dictionary.
    ///
    /// Declaration order is the dictionary order.
    pub fn compile(dict: &Dictionary) -> Result<Self, CodeSignError> {
        let rules = dict
            .iter()
            .map(|(pattern, value)| Rule::from_plist(pattern, value))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { rules })
    }

    /// The default `rules` (version 1) set.
    ///
    /// `resources_dir` denotes whether the bundle has a `Resources/` directory.
    pub fn default_v1(resources_dir: bool) -> Result<Self, CodeSignError> {
        let mut slf = Self::default();

        slf.add_rule(Rule::new("^version.plist$")?);

        if resources_dir {
            slf.add_rule(Rule::new("^Resources/")?);
            slf.add_rule(Rule::new("^Resources/.*\\.lproj/")?.optional().weight(1000));
            slf.add_rule(Rule::new("^Resources/Base\\.lproj/")?.weight(1010));
            slf.add_rule(
                Rule::new("^Resources/.*\\.lproj/locversion.plist$")?
                    .omit()
                    .weight(1100),
            );
        } else {
            slf.add_rule(Rule::new("^.*")?);
            slf.add_rule(Rule::new("^.*\\.lproj")?.optional().weight(1000));
            slf.add_rule(Rule::new("^Base\\.lproj")?.weight(1010));
            slf.add_rule(
                Rule::new("^.*\\.lproj/locversion.plist$")?
                    .omit()
                    .weight(1100),
            );
        }

        Ok(slf)
    }

    /// The default `rules2` (version 2) set.
    pub fn default_v2(resources_dir: bool) -> Result<Self, CodeSignError> {
        let mut slf = Self::default();

        slf.add_rule(Rule::new("^.*")?);

        if resources_dir {
            slf.add_rule(Rule::new("^[^/]+$")?.nested().weight(10));
            slf.add_rule(
                Rule::new("^(Frameworks|SharedFrameworks|PlugIns|Plug-ins|XPCServices|Helpers|MacOS|Library/(Automator|Spotlight|LoginItems))/")?
                    .nested()
                    .weight(10),
            );
        }

        slf.add_rule(Rule::new(".*\\.dSYM($|/)")?.weight(11));
        slf.add_rule(Rule::new("^(.*/)?\\.DS_Store$")?.omit().weight(2000));
        slf.add_rule(Rule::new("^Info\\.plist$")?.omit().weight(20));
        slf.add_rule(Rule::new("^version\\.plist$")?.weight(20));
        slf.add_rule(Rule::new("^embedded\\.provisionprofile$")?.weight(20));
        slf.add_rule(Rule::new("^PkgInfo$")?.omit().weight(20));

        if resources_dir {
            slf.add_rule(Rule::new("^Resources/")?.weight(20));
            slf.add_rule(Rule::new("^Resources/.*\\.lproj/")?.optional().weight(1000));
            slf.add_rule(Rule::new("^Resources/Base\\.lproj/")?.weight(1010));
            slf.add_rule(
                Rule::new("^Resources/.*\\.lproj/locversion.plist$")?
                    .omit()
                    .weight(1100),
            );
        } else {
            slf.add_rule(Rule::new("^.*\\.lproj/")?.optional().weight(1000));
            slf.add_rule(Rule::new("^Base\\.lproj")?.weight(1010));
            slf.add_rule(
                Rule::new("^.*\\.lproj/locversion.plist$")?
                    .omit()
                    .weight(1100),
            );
        }

        Ok(slf)
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Add an exclusion rule for a pattern.
    pub fn add_exclusion(&mut self, pattern: impl ToString) -> Result<(), CodeSignError> {
        self.rules.push(Rule::new(pattern)?.exclude());

        Ok(())
    }

    /// Add the exclusions every signer applies.
    ///
    /// `main_executable` is the resource root relative path of the bundle's
    /// main executable, if any.
    pub fn add_signer_exclusions(
        &mut self,
        main_executable: Option<&str>,
    ) -> Result<(), CodeSignError> {
        self.add_exclusion("^_CodeSignature/")?;
        self.add_exclusion("^CodeResources$")?;

        if let Some(path) = main_executable {
            self.add_exclusion(format!("^{}$", regex::escape(path)))?;
        }

        Ok(())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Serialize non-exclusion rules to a `CodeResources` dictionary.
    pub fn to_dictionary(&self) -> Dictionary {
        self.rules
            .iter()
            .filter(|r| !r.is_exclusion())
            .map(|r| (r.pattern.clone(), r.to_plist()))
            .collect::<Dictionary>()
    }

    /// Find the rule governing a path.
    ///
    /// `None` means no rule matched, which differs from an omitting rule.
    pub fn find_rule(&self, path: &str) -> Option<&Rule> {
        let mut best: Option<&Rule> = None;

        for rule in &self.rules {
            if !rule.is_match(path) {
                continue;
            }

            if rule.is_exclusion() {
                return Some(rule);
            }

            match best {
                Some(current) if current.effective_weight() >= rule.effective_weight() => {}
                _ => best = Some(rule),
            }
        }

        best
    }

    /// Walk the resource tree rooted at `root`.
    ///
    /// `visitor` is called for every file, symlink and nested bundle that is
    /// not covered by an omitting or exclusion rule, along with its rule.
    /// Entries matching no rule are reported with `None`.
    ///
    /// Traversal is in lexicographic order of file names.
    pub fn scan<F>(
        &self,
        root: &Path,
        options: &ScanOptions,
        mut visitor: F,
    ) -> Result<(), CodeSignError>
    where
        F: FnMut(ScanEntry, Option<&Rule>) -> Result<(), CodeSignError>,
    {
        let mut walker = walkdir::WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if options.tolerate_unreadable => {
                    warn!("skipping unreadable resource: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let relative_path = relative_path(root, entry.path())?;
            let file_type = entry.file_type();

            let rule = self.find_rule(&relative_path);

            if let Some(rule) = rule {
                if rule.is_exclusion() {
                    debug!("{} excluded by rule {}", relative_path, rule.pattern);
                    if file_type.is_dir() {
                        walker.skip_current_dir();
                    }
                    continue;
                }
            }

            if file_type.is_dir() {
                let nested = rule.map(|r| r.is_nested()).unwrap_or(false)
                    && entry.file_name().to_string_lossy().contains('.');

                if nested {
                    walker.skip_current_dir();
                    visitor(
                        ScanEntry {
                            path: entry.path().to_path_buf(),
                            relative_path,
                            kind: EntryKind::NestedBundle,
                        },
                        rule,
                    )?;
                }

                continue;
            }

            if rule.map(|r| r.is_omitted()).unwrap_or(false) {
                debug!("{} omitted from seal", relative_path);
                continue;
            }

            if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?
                    .to_string_lossy()
                    .replace('\\', "/");

                let stripped = rule.map(|r| {
                    let mut r = r.clone();
                    r.flags.remove(RuleFlags::NESTED);
                    r
                });

                visitor(
                    ScanEntry {
                        path: entry.path().to_path_buf(),
                        relative_path,
                        kind: EntryKind::Symlink(target),
                    },
                    stripped.as_ref(),
                )?;
            } else if file_type.is_file() {
                visitor(
                    ScanEntry {
                        path: entry.path().to_path_buf(),
                        relative_path,
                        kind: EntryKind::File,
                    },
                    rule,
                )?;
            } else if options.tolerate_unsupported {
                warn!("skipping unsupported resource type: {}", relative_path);
            } else {
                return Err(CodeSignError::UnsupportedResourceType(relative_path));
            }
        }

        Ok(())
    }
}

/// Compute the `/` separated path of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> Result<String, CodeSignError> {
    let rel = path.strip_prefix(root).map_err(|_| {
        CodeSignError::InternalError(format!(
            "{} is not under {}",
            path.display(),
            root.display()
        ))
    })?;

    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    #[test]
    fn highest_weight_wins() -> Result<(), CodeSignError> {
        let mut rules = RuleSet::default();
        rules.add_rule(Rule::new("^Resources/.*\\.lproj/")?.optional().weight(1000));
        rules.add_rule(Rule::new("^Resources/")?.weight(20));
        rules.add_rule(Rule::new("^.*")?);

        let rule = rules.find_rule("Resources/en.lproj/foo.strings").unwrap();
        assert_eq!(rule.pattern, "^Resources/.*\\.lproj/");
        assert!(rule.is_optional());

        assert_eq!(rules.find_rule("Resources/foo").unwrap().pattern, "^Resources/");
        assert_eq!(rules.find_rule("foo").unwrap().pattern, "^.*");

        Ok(())
    }

    #[test]
    fn ties_keep_first_declared() -> Result<(), CodeSignError> {
        let mut rules = RuleSet::default();
        rules.add_rule(Rule::new("^a")?.optional().weight(5));
        rules.add_rule(Rule::new("^ab")?.weight(5));

        assert!(rules.find_rule("abc").unwrap().is_optional());

        Ok(())
    }

    #[test]
    fn exclusion_short_circuits() -> Result<(), CodeSignError> {
        let mut rules = RuleSet::default_v2(true)?;
        rules.add_signer_exclusions(Some("MacOS/main"))?;

        assert!(rules.find_rule("_CodeSignature/CodeResources").unwrap().is_exclusion());
        assert!(rules.find_rule("MacOS/main").unwrap().is_exclusion());
        assert!(!rules.find_rule("MacOS/helper").unwrap().is_exclusion());

        Ok(())
    }

    #[test]
    fn unmatched_is_none() -> Result<(), CodeSignError> {
        let rules = RuleSet::default_v1(true)?;
        assert!(rules.find_rule("MacOS/main").is_none());
        assert!(rules.find_rule("version.plist").is_some());

        Ok(())
    }

    #[test]
    fn compile_plist() -> Result<(), CodeSignError> {
        let value = Value::from_reader_xml(
            indoc! {r#"
                <?xml version="1.0" encoding="UTF-8"?>
                <plist version="1.0">
                <dict>
                    <key>^.*</key>
                    <true/>
                    <key>^Info\.plist$</key>
                    <false/>
                    <key>^[^/]+$</key>
                    <dict>
                        <key>nested</key>
                        <true/>
                        <key>weight</key>
                        <real>10</real>
                    </dict>
                </dict>
                </plist>
            "#}
            .as_bytes(),
        )?;

        let dict = value.as_dictionary().unwrap();
        let rules = RuleSet::compile(dict)?;
        assert_eq!(rules.rules().len(), 3);
        assert!(rules
            .rules()
            .iter()
            .any(|r| r.pattern == "^Info\\.plist$" && r.is_omitted()));
        assert!(rules.find_rule("Foo.framework").unwrap().is_nested());

        let serialized = rules.to_dictionary();
        assert_eq!(serialized.get("^.*"), Some(&Value::Boolean(true)));
        assert_eq!(RuleSet::compile(&serialized)?, rules);

        let mut bad = Dictionary::new();
        bad.insert("(".into(), Value::Boolean(true));
        assert!(matches!(
            RuleSet::compile(&bad),
            Err(CodeSignError::ResourceRuleBadRegex(..))
        ));

        let mut bad = Dictionary::new();
        bad.insert("^a".into(), Value::String("yes".into()));
        assert!(matches!(
            RuleSet::compile(&bad),
            Err(CodeSignError::ResourceRulesInvalid(_))
        ));

        Ok(())
    }

    #[test]
    fn scan_tree() -> Result<(), CodeSignError> {
        let td = tempfile::TempDir::new()?;
        let root = td.path();

        std::fs::create_dir_all(root.join("Resources/en.lproj"))?;
        std::fs::create_dir_all(root.join("Frameworks/Foo.framework/Versions"))?;
        std::fs::create_dir_all(root.join("_CodeSignature"))?;
        std::fs::write(root.join("Resources/en.lproj/a.strings"), b"a")?;
        std::fs::write(root.join("Resources/.DS_Store"), b"x")?;
        std::fs::write(root.join("Frameworks/Foo.framework/Versions/x"), b"x")?;
        std::fs::write(root.join("_CodeSignature/CodeResources"), b"x")?;
        std::fs::write(root.join("Info.plist"), b"x")?;

        let mut rules = RuleSet::default_v2(true)?;
        rules.add_signer_exclusions(None)?;

        let mut seen = vec![];
        rules.scan(root, &ScanOptions::default(), |entry, rule| {
            seen.push((entry.relative_path, entry.kind, rule.map(|r| r.is_optional())));
            Ok(())
        })?;

        assert_eq!(
            seen,
            vec![
                (
                    "Frameworks/Foo.framework".to_string(),
                    EntryKind::NestedBundle,
                    Some(false)
                ),
                (
                    "Resources/en.lproj/a.strings".to_string(),
                    EntryKind::File,
                    Some(true)
                ),
            ]
        );

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn scan_symlink_not_nested() -> Result<(), CodeSignError> {
        let td = tempfile::TempDir::new()?;
        let root = td.path();

        std::fs::create_dir_all(root.join("Frameworks/Real.framework"))?;
        std::os::unix::fs::symlink("Real.framework", root.join("Frameworks/Link.framework"))?;

        let rules = RuleSet::default_v2(true)?;

        let mut seen = vec![];
        rules.scan(root, &ScanOptions::default(), |entry, rule| {
            seen.push((entry.kind, rule.map(|r| r.is_nested())));
            Ok(())
        })?;

        assert_eq!(
            seen,
            vec![
                (EntryKind::Symlink("Real.framework".into()), Some(false)),
                (EntryKind::NestedBundle, Some(true)),
            ]
        );

        Ok(())
    }
}
