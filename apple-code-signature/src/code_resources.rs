// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functionality related to "code resources," external resources captured in signatures.
//!
//! Bundles can contain a `_CodeSignature/CodeResources` XML plist file
//! denoting seals for resources not in the binary. The signature data
//! in the binary records the digest of this file so integrity is transitively
//! verified.
//!
//! The file carries two parallel schemas. The legacy (version 1) schema
//! consists of the `files` and `rules` keys. The current (version 2) schema
//! consists of `files2` and `rules2`.
//!
//! We coerce [plist::Value] instances into typed values by hand instead of
//! deriving `Deserialize` because the `plist` crate's derived enum handling
//! can't express the untagged seal variants used by this format.

use {
    crate::{
        digest::{hash_file, DigestSet, DigestType},
        error::CodeSignError,
        pool::LimitedAsync,
        resource_rules::{EntryKind, RuleSet, ScanEntry, ScanOptions},
    },
    log::{debug, info},
    plist::{Dictionary, Value},
    std::{collections::BTreeMap, io::Write, path::Path},
};

/// Bundle relative path of the resource seal file.
pub const CODE_RESOURCES_PATH: &str = "_CodeSignature/CodeResources";

/// Digests recorded for every sealed file.
pub const SEAL_DIGESTS: [DigestType; 2] = [DigestType::Sha1, DigestType::Sha256];

/// The seal of a single resource.
#[derive(Clone, Eq, PartialEq)]
pub enum ResourceSeal {
    /// A regular file. `hash` is SHA-1 and `hash2` is SHA-256.
    File {
        hash: Option<Vec<u8>>,
        hash2: Option<Vec<u8>>,
        optional: bool,
    },
    /// A symlink and its target.
    Symlink { target: String, optional: bool },
    /// Nested code sealed by its cdhash and designated requirement.
    Nested {
        cdhash: Vec<u8>,
        requirement: String,
        optional: bool,
    },
}

impl std::fmt::Debug for ResourceSeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File {
                hash,
                hash2,
                optional,
            } => f
                .debug_struct("File")
                .field("hash", &hash.as_ref().map(hex::encode))
                .field("hash2", &hash2.as_ref().map(hex::encode))
                .field("optional", optional)
                .finish(),
            Self::Symlink { target, optional } => f
                .debug_struct("Symlink")
                .field("target", target)
                .field("optional", optional)
                .finish(),
            Self::Nested {
                cdhash,
                requirement,
                optional,
            } => f
                .debug_struct("Nested")
                .field("cdhash", &hex::encode(cdhash))
                .field("requirement", requirement)
                .field("optional", optional)
                .finish(),
        }
    }
}

fn expect_data(section: &str, key: &str, value: &Value) -> Result<Vec<u8>, CodeSignError> {
    value.as_data().map(|x| x.to_vec()).ok_or_else(|| {
        CodeSignError::BadDictionaryFormat(format!(
            "expected <data> for {} {} entry, got {:?}",
            section, key, value
        ))
    })
}

fn expect_bool(section: &str, key: &str, value: &Value) -> Result<bool, CodeSignError> {
    value.as_boolean().ok_or_else(|| {
        CodeSignError::BadDictionaryFormat(format!(
            "expected boolean for {} {} entry, got {:?}",
            section, key, value
        ))
    })
}

fn expect_string(section: &str, key: &str, value: &Value) -> Result<String, CodeSignError> {
    value.as_string().map(|x| x.to_string()).ok_or_else(|| {
        CodeSignError::BadDictionaryFormat(format!(
            "expected string for {} {} entry, got {:?}",
            section, key, value
        ))
    })
}

impl ResourceSeal {
    /// Decode a value of the version 1 `files` dictionary.
    pub fn from_files_value(v: &Value) -> Result<Self, CodeSignError> {
        match v {
            Value::Data(digest) => Ok(Self::File {
                hash: Some(digest.to_vec()),
                hash2: None,
                optional: false,
            }),
            Value::Dictionary(dict) => {
                let mut hash = None;
                let mut optional = false;

                for (key, value) in dict {
                    match key.as_str() {
                        "hash" => hash = Some(expect_data("files", key, value)?),
                        "optional" => optional = expect_bool("files", key, value)?,
                        key => {
                            return Err(CodeSignError::BadDictionaryFormat(format!(
                                "unexpected key in files dict: {}",
                                key
                            )));
                        }
                    }
                }

                let hash = hash.ok_or_else(|| {
                    CodeSignError::BadDictionaryFormat("files entry missing hash".to_string())
                })?;

                Ok(Self::File {
                    hash: Some(hash),
                    hash2: None,
                    optional,
                })
            }
            _ => Err(CodeSignError::BadDictionaryFormat(format!(
                "bad value in files <dict>; expected <data> or <dict>, got {:?}",
                v
            ))),
        }
    }

    /// Decode a value of the version 2 `files2` dictionary.
    pub fn from_files2_value(v: &Value) -> Result<Self, CodeSignError> {
        let dict = match v {
            Value::Data(digest) => {
                return Ok(Self::File {
                    hash: Some(digest.to_vec()),
                    hash2: None,
                    optional: false,
                })
            }
            Value::Dictionary(dict) => dict,
            _ => {
                return Err(CodeSignError::BadDictionaryFormat(format!(
                    "files2 value should be a dict, got {:?}",
                    v
                )))
            }
        };

        let mut hash = None;
        let mut hash2 = None;
        let mut cdhash = None;
        let mut requirement = None;
        let mut symlink = None;
        let mut optional = false;

        for (key, value) in dict {
            match key.as_str() {
                "hash" => hash = Some(expect_data("files2", key, value)?),
                "hash2" => hash2 = Some(expect_data("files2", key, value)?),
                "cdhash" => cdhash = Some(expect_data("files2", key, value)?),
                "requirement" => requirement = Some(expect_string("files2", key, value)?),
                "symlink" => symlink = Some(expect_string("files2", key, value)?),
                "optional" => optional = expect_bool("files2", key, value)?,
                key => {
                    return Err(CodeSignError::BadDictionaryFormat(format!(
                        "unexpected key in files2 dict entry: {}",
                        key
                    )));
                }
            }
        }

        match (symlink, cdhash, requirement, hash.is_some() || hash2.is_some()) {
            (Some(target), None, None, false) => Ok(Self::Symlink { target, optional }),
            (None, Some(cdhash), Some(requirement), false) => Ok(Self::Nested {
                cdhash,
                requirement,
                optional,
            }),
            (None, None, None, true) => Ok(Self::File {
                hash,
                hash2,
                optional,
            }),
            _ => Err(CodeSignError::BadDictionaryFormat(format!(
                "files2 entry has conflicting or missing keys: {:?}",
                dict.keys().collect::<Vec<_>>()
            ))),
        }
    }

    /// Encode as a `files` value. Only files with a SHA-1 hash have one.
    pub fn to_files_value(&self) -> Option<Value> {
        match self {
            Self::File {
                hash: Some(hash),
                optional: false,
                ..
            } => Some(Value::Data(hash.clone())),
            Self::File {
                hash: Some(hash),
                optional: true,
                ..
            } => {
                let mut dict = Dictionary::new();
                dict.insert("hash".to_string(), Value::Data(hash.clone()));
                dict.insert("optional".to_string(), Value::Boolean(true));

                Some(Value::Dictionary(dict))
            }
            _ => None,
        }
    }

    /// Encode as a `files2` value.
    pub fn to_files2_value(&self) -> Value {
        let mut dict = Dictionary::new();

        match self {
            Self::File { hash, hash2, .. } => {
                if let Some(hash) = hash {
                    dict.insert("hash".to_string(), Value::Data(hash.clone()));
                }
                if let Some(hash2) = hash2 {
                    dict.insert("hash2".to_string(), Value::Data(hash2.clone()));
                }
            }
            Self::Symlink { target, .. } => {
                dict.insert("symlink".to_string(), Value::String(target.clone()));
            }
            Self::Nested {
                cdhash,
                requirement,
                ..
            } => {
                dict.insert("cdhash".to_string(), Value::Data(cdhash.clone()));
                dict.insert(
                    "requirement".to_string(),
                    Value::String(requirement.clone()),
                );
            }
        }

        if self.is_optional() {
            dict.insert("optional".to_string(), Value::Boolean(true));
        }

        Value::Dictionary(dict)
    }

    pub fn is_optional(&self) -> bool {
        match self {
            Self::File { optional, .. }
            | Self::Symlink { optional, .. }
            | Self::Nested { optional, .. } => *optional,
        }
    }

    /// Whether file digests satisfy every hash recorded in this seal.
    ///
    /// Seals of other kinds and seals without any hash never match.
    pub fn matches_digests(&self, digests: &DigestSet) -> bool {
        match self {
            Self::File { hash, hash2, .. } => {
                if hash.is_none() && hash2.is_none() {
                    return false;
                }

                let check = |expected: &Option<Vec<u8>>, digest: DigestType| match expected {
                    Some(expected) => digests.get(digest) == Some(expected.as_slice()),
                    None => true,
                };

                check(hash, DigestType::Sha1) && check(hash2, DigestType::Sha256)
            }
            _ => false,
        }
    }

    /// Digest types needed to check this seal.
    pub fn digest_types(&self) -> Vec<DigestType> {
        match self {
            Self::File { hash, hash2, .. } => {
                let mut res = vec![];
                if hash.is_some() {
                    res.push(DigestType::Sha1);
                }
                if hash2.is_some() {
                    res.push(DigestType::Sha256);
                }
                res
            }
            _ => vec![],
        }
    }
}

/// Represents a `_CodeSignature/CodeResources` XML plist.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodeResources {
    /// Version 1 seals.
    pub files: BTreeMap<String, ResourceSeal>,
    /// Version 2 seals.
    pub files2: BTreeMap<String, ResourceSeal>,
    /// Version 1 rules, in declaration order.
    pub rules: Option<Dictionary>,
    /// Version 2 rules, in declaration order.
    pub rules2: Option<Dictionary>,
}

impl CodeResources {
    /// Construct an instance by parsing an XML plist.
    pub fn from_xml(xml: &[u8]) -> Result<Self, CodeSignError> {
        let plist = Value::from_reader_xml(xml)?;

        let dict = plist.into_dictionary().ok_or_else(|| {
            CodeSignError::BadDictionaryFormat("plist root element should be a <dict>".to_string())
        })?;

        let mut res = Self::default();

        for (key, value) in dict.iter() {
            let section = value.as_dictionary().ok_or_else(|| {
                CodeSignError::BadDictionaryFormat(format!(
                    "expecting {} to be a dict, got {:?}",
                    key, value
                ))
            })?;

            match key.as_str() {
                "files" => {
                    for (path, value) in section {
                        res.files
                            .insert(path.to_string(), ResourceSeal::from_files_value(value)?);
                    }
                }
                "files2" => {
                    for (path, value) in section {
                        res.files2
                            .insert(path.to_string(), ResourceSeal::from_files2_value(value)?);
                    }
                }
                "rules" => res.rules = Some(section.clone()),
                "rules2" => res.rules2 = Some(section.clone()),
                key => {
                    return Err(CodeSignError::BadDictionaryFormat(format!(
                        "unexpected key in root dict: {}",
                        key
                    )));
                }
            }
        }

        Ok(res)
    }

    /// Serialize to XML in the formatting conventions of Apple's tooling.
    pub fn to_xml(&self) -> Result<Vec<u8>, CodeSignError> {
        let mut data = Vec::<u8>::new();
        Value::from(self).to_writer_xml(&mut data)?;

        // Apple's writer omits the space in empty elements and emits a
        // trailing newline.
        let data = String::from_utf8(data)
            .map_err(|_| CodeSignError::InternalError("plist XML is not UTF-8".into()))?
            .replace("<dict />", "<dict/>")
            .replace("<true />", "<true/>")
            .replace("<false />", "<false/>");

        let mut data = data.into_bytes();
        data.push(b'\n');

        Ok(data)
    }

    pub fn to_writer_xml(&self, mut writer: impl Write) -> Result<(), CodeSignError> {
        writer.write_all(&self.to_xml()?)?;

        Ok(())
    }

    /// Whether version 2 data is present.
    pub fn has_v2(&self) -> bool {
        self.rules2.is_some()
    }

    /// Compile the version 1 rules.
    pub fn compile_rules(&self) -> Result<Option<RuleSet>, CodeSignError> {
        self.rules.as_ref().map(RuleSet::compile).transpose()
    }

    /// Compile the version 2 rules.
    pub fn compile_rules2(&self) -> Result<Option<RuleSet>, CodeSignError> {
        self.rules2.as_ref().map(RuleSet::compile).transpose()
    }
}

impl From<&CodeResources> for Value {
    fn from(cr: &CodeResources) -> Self {
        let mut dict = Dictionary::new();

        dict.insert(
            "files".to_string(),
            Value::Dictionary(
                cr.files
                    .iter()
                    .filter_map(|(path, seal)| seal.to_files_value().map(|v| (path.clone(), v)))
                    .collect::<Dictionary>(),
            ),
        );

        dict.insert(
            "files2".to_string(),
            Value::Dictionary(
                cr.files2
                    .iter()
                    .map(|(path, seal)| (path.clone(), seal.to_files2_value()))
                    .collect::<Dictionary>(),
            ),
        );

        if let Some(rules) = &cr.rules {
            dict.insert("rules".to_string(), Value::Dictionary(rules.clone()));
        }

        if let Some(rules2) = &cr.rules2 {
            dict.insert("rules2".to_string(), Value::Dictionary(rules2.clone()));
        }

        Value::Dictionary(dict)
    }
}

/// The seal of nested code, produced by signing it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NestedSeal {
    pub cdhash: Vec<u8>,
    /// Designated requirement of the nested code, in text form.
    pub requirement: String,
}

/// Builds the resource seal of a bundle.
///
/// Files are hashed on a [LimitedAsync] pool while the tree is scanned.
/// Symlinks and nested code are sealed on the scanning thread.
#[derive(Clone, Debug)]
pub struct ResourceSealer {
    rules: Option<RuleSet>,
    rules2: RuleSet,
    pool: LimitedAsync,
    options: ScanOptions,
}

impl ResourceSealer {
    /// Construct an instance using version 2 rules.
    ///
    /// Rules should already carry the signer exclusions.
    pub fn new(rules2: RuleSet) -> Self {
        Self {
            rules: None,
            rules2,
            pool: LimitedAsync::default(),
            options: ScanOptions::default(),
        }
    }

    /// Also emit a version 1 seal using the given rules.
    #[must_use]
    pub fn with_v1_rules(mut self, rules: RuleSet) -> Self {
        self.rules = Some(rules);
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: LimitedAsync) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn with_scan_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    /// Seal the resource tree at `root`.
    ///
    /// `nested` is called for each nested code directory and must return its
    /// seal, typically by signing it.
    pub fn seal<F>(&self, root: &Path, mut nested: F) -> Result<CodeResources, CodeSignError>
    where
        F: FnMut(&ScanEntry) -> Result<NestedSeal, CodeSignError>,
    {
        let mut resources = CodeResources {
            rules: self.rules.as_ref().map(|r| r.to_dictionary()),
            rules2: Some(self.rules2.to_dictionary()),
            ..Default::default()
        };

        let mut direct = BTreeMap::new();

        let hashed = self.pool.run(
            |submit| {
                self.rules2.scan(root, &self.options, |entry, rule| {
                    // Anything the scan yields must be sealed or validation
                    // reports it as added.
                    let optional = match rule {
                        Some(rule) => rule.is_optional(),
                        None => {
                            debug!(
                                "{} matches no rule; sealing as required",
                                entry.relative_path
                            );
                            false
                        }
                    };

                    match &entry.kind {
                        EntryKind::File => submit((entry, optional)),
                        EntryKind::Symlink(target) => {
                            debug!("sealing symlink {} -> {}", entry.relative_path, target);
                            direct.insert(
                                entry.relative_path.clone(),
                                ResourceSeal::Symlink {
                                    target: target.clone(),
                                    optional,
                                },
                            );
                            Ok(())
                        }
                        EntryKind::NestedBundle => {
                            info!("sealing nested code {}", entry.relative_path);
                            let seal = nested(&entry)?;
                            direct.insert(
                                entry.relative_path.clone(),
                                ResourceSeal::Nested {
                                    cdhash: seal.cdhash,
                                    requirement: seal.requirement,
                                    optional,
                                },
                            );
                            Ok(())
                        }
                    }
                })
            },
            |(entry, optional): (ScanEntry, bool)| {
                debug!("sealing resource {}", entry.relative_path);
                let digests = hash_file(&entry.path, &SEAL_DIGESTS).map_err(|e| match e {
                    CodeSignError::Io(source) => CodeSignError::UnreadableResource {
                        path: entry.relative_path.clone(),
                        source,
                    },
                    e => e,
                })?;

                Ok((entry.relative_path, optional, digests))
            },
        )?;

        let mut sha1_by_path = BTreeMap::new();

        for (path, optional, digests) in hashed {
            let hash = digests.get(DigestType::Sha1).map(|x| x.to_vec());
            if let Some(hash) = &hash {
                sha1_by_path.insert(path.clone(), hash.clone());
            }

            resources.files2.insert(
                path,
                ResourceSeal::File {
                    hash,
                    hash2: digests.get(DigestType::Sha256).map(|x| x.to_vec()),
                    optional,
                },
            );
        }
        resources.files2.extend(direct);

        if let Some(rules) = &self.rules {
            rules.scan(root, &self.options, |entry, rule| {
                // Legacy seals only cover paths their rules match. Symlinks are
                // sealed by the content of what they point to.
                let rule = match rule {
                    Some(rule) if entry.kind != EntryKind::NestedBundle => rule,
                    _ => return Ok(()),
                };

                let hash = match sha1_by_path.get(&entry.relative_path) {
                    Some(hash) if entry.kind == EntryKind::File => hash.clone(),
                    _ => {
                        let data = std::fs::read(&entry.path).map_err(|source| {
                            CodeSignError::UnreadableResource {
                                path: entry.relative_path.clone(),
                                source,
                            }
                        })?;
                        DigestType::Sha1.digest_data(&data)?
                    }
                };

                resources.files.insert(
                    entry.relative_path,
                    ResourceSeal::File {
                        hash: Some(hash),
                        hash2: None,
                        optional: rule.is_optional(),
                    },
                );

                Ok(())
            })?;
        }

        info!(
            "sealed {} resources ({} legacy)",
            resources.files2.len(),
            resources.files.len()
        );

        Ok(resources)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    const SNIPPET: &str = indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
        <plist version="1.0">
        <dict>
          <key>files</key>
          <dict>
            <key>Resources/app.sig</key>
            <data>Y0SEPxyC6hCQ+rl4LTRmXy7F9DQ=</data>
            <key>Resources/en.lproj/InfoPlist.strings</key>
            <dict>
              <key>hash</key>
              <data>U8LTYe+cVqPcBu9aLvcyyfp+dAg=</data>
              <key>optional</key>
              <true/>
            </dict>
          </dict>
          <key>files2</key>
          <dict>
            <key>Library/LaunchServices/updater</key>
            <dict>
              <key>hash2</key>
              <data>iMnDHpWkKTI6xLi9Av93eNuIhxXhv3C18D4fljCfw2Y=</data>
            </dict>
            <key>Frameworks/Helper.framework</key>
            <dict>
              <key>cdhash</key>
              <data>NevNMzQBub9OjomMUAk2xBumyHM=</data>
              <key>requirement</key>
              <string>identifier "com.example.helper" and anchor apple generic</string>
            </dict>
            <key>MacOS/link</key>
            <dict>
              <key>symlink</key>
              <string>../Resources/target</string>
            </dict>
          </dict>
          <key>rules</key>
          <dict>
            <key>^Resources/</key>
            <true/>
            <key>^Resources/.*\.lproj/</key>
            <dict>
              <key>optional</key>
              <true/>
              <key>weight</key>
              <real>1000</real>
            </dict>
          </dict>
          <key>rules2</key>
          <dict>
            <key>^(.*/)?\.DS_Store$</key>
            <dict>
              <key>omit</key>
              <true/>
              <key>weight</key>
              <real>2000</real>
            </dict>
            <key>^[^/]+$</key>
            <dict>
              <key>nested</key>
              <true/>
              <key>weight</key>
              <real>10</real>
            </dict>
          </dict>
        </dict>
        </plist>
    "#};

    #[test]
    fn parse_and_roundtrip() -> Result<(), CodeSignError> {
        let resources = CodeResources::from_xml(SNIPPET.as_bytes())?;

        assert_eq!(resources.files.len(), 2);
        assert!(resources.files["Resources/en.lproj/InfoPlist.strings"].is_optional());

        assert!(matches!(
            &resources.files2["MacOS/link"],
            ResourceSeal::Symlink { target, optional: false } if target == "../Resources/target"
        ));
        assert!(matches!(
            &resources.files2["Frameworks/Helper.framework"],
            ResourceSeal::Nested { cdhash, .. } if cdhash.len() == 20
        ));
        assert!(matches!(
            &resources.files2["Library/LaunchServices/updater"],
            ResourceSeal::File { hash: None, hash2: Some(_), optional: false }
        ));

        let rules2 = resources.compile_rules2()?.unwrap();
        assert!(rules2.find_rule("Foo.app").unwrap().is_nested());

        let resources2 = CodeResources::from_xml(&resources.to_xml()?)?;
        assert_eq!(resources, resources2);

        Ok(())
    }

    #[test]
    fn conflicting_seal_keys() {
        let mut dict = Dictionary::new();
        dict.insert("symlink".to_string(), Value::String("a".into()));
        dict.insert("hash2".to_string(), Value::Data(vec![0; 32]));

        assert!(matches!(
            ResourceSeal::from_files2_value(&Value::Dictionary(dict)),
            Err(CodeSignError::BadDictionaryFormat(_))
        ));

        assert!(ResourceSeal::from_files_value(&Value::Boolean(true)).is_err());
    }

    #[test]
    fn digest_matching() -> Result<(), CodeSignError> {
        let content = b"hello world";
        let digests = DigestSet(vec![
            (DigestType::Sha1, DigestType::Sha1.digest_data(content)?),
            (DigestType::Sha256, DigestType::Sha256.digest_data(content)?),
        ]);

        let seal = ResourceSeal::File {
            hash: Some(DigestType::Sha1.digest_data(content)?),
            hash2: Some(DigestType::Sha256.digest_data(content)?),
            optional: false,
        };
        assert!(seal.matches_digests(&digests));

        let seal = ResourceSeal::File {
            hash: None,
            hash2: Some(DigestType::Sha256.digest_data(b"other")?),
            optional: false,
        };
        assert!(!seal.matches_digests(&digests));

        let seal = ResourceSeal::Symlink {
            target: "x".into(),
            optional: false,
        };
        assert!(!seal.matches_digests(&digests));

        Ok(())
    }

    #[test]
    fn seal_tree() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let root = temp.path();

        std::fs::create_dir_all(root.join("Resources/en.lproj"))?;
        std::fs::create_dir_all(root.join("Frameworks/Helper.framework"))?;
        std::fs::create_dir_all(root.join("_CodeSignature"))?;
        std::fs::write(root.join("Resources/data.txt"), b"data")?;
        std::fs::write(root.join("Resources/en.lproj/Strings.strings"), b"strings")?;
        std::fs::write(root.join("Resources/.DS_Store"), b"junk")?;
        std::fs::write(root.join("Frameworks/Helper.framework/Helper"), b"code")?;
        std::fs::write(root.join("_CodeSignature/CodeResources"), b"old")?;
        std::fs::write(root.join("Info.plist"), b"<plist/>")?;

        #[cfg(unix)]
        std::os::unix::fs::symlink("data.txt", root.join("Resources/alias.txt"))?;

        let mut rules2 = RuleSet::default_v2(true)?;
        rules2.add_signer_exclusions(None)?;
        let mut rules = RuleSet::default_v1(true)?;
        rules.add_signer_exclusions(None)?;

        let mut nested_seen = vec![];

        let resources = ResourceSealer::new(rules2)
            .with_v1_rules(rules)
            .with_pool(LimitedAsync::new(2))
            .seal(root, |entry| {
                nested_seen.push(entry.relative_path.clone());
                Ok(NestedSeal {
                    cdhash: vec![0x42; 20],
                    requirement: "cdhash H\"4242424242424242424242424242424242424242\"".into(),
                })
            })?;

        assert_eq!(nested_seen, vec!["Frameworks/Helper.framework".to_string()]);

        assert!(resources.files2.contains_key("Resources/data.txt"));
        assert!(resources.files2["Resources/en.lproj/Strings.strings"].is_optional());
        assert!(!resources.files2.contains_key("Resources/.DS_Store"));
        assert!(!resources.files2.contains_key("Info.plist"));
        assert!(!resources.files2.contains_key("_CodeSignature/CodeResources"));
        assert!(!resources
            .files2
            .contains_key("Frameworks/Helper.framework/Helper"));
        assert!(matches!(
            resources.files2["Frameworks/Helper.framework"],
            ResourceSeal::Nested { .. }
        ));

        #[cfg(unix)]
        assert_eq!(
            resources.files2["Resources/alias.txt"],
            ResourceSeal::Symlink {
                target: "data.txt".into(),
                optional: false
            }
        );

        let expected = DigestType::Sha256.digest_data(b"data")?;
        assert!(matches!(
            &resources.files2["Resources/data.txt"],
            ResourceSeal::File { hash2: Some(h), .. } if h == &expected
        ));

        // The legacy seal only covers Resources/ files.
        assert!(resources.files.contains_key("Resources/data.txt"));
        assert!(!resources.files.contains_key("Frameworks/Helper.framework/Helper"));
        assert!(resources.rules.is_some());

        // Legacy symlink seals digest the target's content.
        #[cfg(unix)]
        assert_eq!(
            resources.files["Resources/alias.txt"],
            ResourceSeal::File {
                hash: Some(DigestType::Sha1.digest_data(b"data")?),
                hash2: None,
                optional: false,
            }
        );

        let parsed = CodeResources::from_xml(&resources.to_xml()?)?;
        assert_eq!(parsed, resources);

        Ok(())
    }

    #[test]
    fn unmatched_entries_sealed() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let root = temp.path();

        std::fs::create_dir_all(root.join("Resources"))?;
        std::fs::write(root.join("Resources/data.txt"), b"data")?;
        std::fs::write(root.join("extra.txt"), b"extra")?;

        let mut rules2 = RuleSet::default();
        rules2.add_rule(crate::resource_rules::Rule::new("^Resources/")?.optional());
        rules2.add_signer_exclusions(None)?;

        let resources = ResourceSealer::new(rules2).seal(root, |_| {
            Err(CodeSignError::InternalError("no nested code expected".into()))
        })?;

        assert!(resources.files2["Resources/data.txt"].is_optional());
        assert!(!resources.files2["extra.txt"].is_optional());
        assert_eq!(resources.files2.len(), 2);

        Ok(())
    }
}
