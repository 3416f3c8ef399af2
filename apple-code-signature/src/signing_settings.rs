// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code signing settings.

use {
    crate::{
        cms::{SigningIdentity, SigningTime},
        code_directory::{CodeSignatureFlags, ExecutableSegmentFlags},
        code_requirement::{CodeRequirements, RequirementType},
        digest::DigestType,
        embedded_signature::{
            read_blob_header, Blob, CodeSigningMagic, RequirementBlob, RequirementSetBlob,
        },
        entitlements::parse_entitlements_xml,
        error::CodeSignError,
        macho::{parse_slices, parse_version_nibbles, MachOSignable},
        requirement_text::parse_requirements,
    },
    goblin::mach::cputype::{
        CpuType, CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32, CPU_TYPE_X86_64,
    },
    log::info,
    std::{collections::BTreeMap, fmt::Formatter, sync::Arc},
};

/// Denotes the scope for a setting.
///
/// Settings have an associated scope defined by this type. This allows settings
/// to apply to exactly what you want them to apply to.
///
/// Scopes can be converted from a string representation. The following syntax is
/// recognized:
///
/// * `@main` - Maps to [SettingsScope::Main]
/// * `@<int>` - e.g. `@0`. Maps to [SettingsScope::MultiArchIndex].
/// * `@[cpu_type=<int>]` - e.g. `@[cpu_type=7]`. Maps to [SettingsScope::MultiArchCpuType].
/// * `@[cpu_type=<string>]` - e.g. `@[cpu_type=x86_64]`. Maps to [SettingsScope::MultiArchCpuType]
///    for recognized string values (see below).
/// * `<string>` - e.g. `path/to/file`. Maps to [SettingsScope::Path].
/// * `<string>@<int>` - e.g. `path/to/file@0`. Maps to [SettingsScope::PathMultiArchIndex].
/// * `<string>@[cpu_type=<int>]` - e.g. `path/to/file@[cpu_type=7]`. Maps to
///   [SettingsScope::PathMultiArchCpuType].
/// * `<string>@[cpu_type=<string>]` - e.g. `path/to/file@[cpu_type=arm64]`. Maps to
///   [SettingsScope::PathMultiArchCpuType] for recognized string values (see below).
///
/// # Recognized cpu_type String Values
///
/// * `arm` -> [CPU_TYPE_ARM]
/// * `arm64` -> [CPU_TYPE_ARM64]
/// * `arm64_32` -> [CPU_TYPE_ARM64_32]
/// * `x86_64` -> [CPU_TYPE_X86_64]
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SettingsScope {
    // Variant order matters: re-scoping iterates keys in sorted order and last
    // write wins, so variants go from widest to most granular.
    /// The main entity being signed.
    Main,

    /// Filesystem path relative to the main entity being signed.
    Path(String),

    /// A single Mach-O binary within a fat binary, by 0-based index.
    MultiArchIndex(usize),

    /// A single Mach-O binary within a fat binary, by CPU type.
    MultiArchCpuType(CpuType),

    /// Combination of [SettingsScope::Path] and [SettingsScope::MultiArchIndex].
    PathMultiArchIndex(String, usize),

    /// Combination of [SettingsScope::Path] and [SettingsScope::MultiArchCpuType].
    PathMultiArchCpuType(String, CpuType),
}

impl std::fmt::Display for SettingsScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => f.write_str("main signing target"),
            Self::Path(path) => f.write_fmt(format_args!("path {}", path)),
            Self::MultiArchIndex(index) => f.write_fmt(format_args!(
                "fat/universal Mach-O binaries at index {}",
                index
            )),
            Self::MultiArchCpuType(cpu_type) => f.write_fmt(format_args!(
                "fat/universal Mach-O binaries for CPU {}",
                cpu_type
            )),
            Self::PathMultiArchIndex(path, index) => f.write_fmt(format_args!(
                "fat/universal Mach-O binaries at index {} under path {}",
                index, path
            )),
            Self::PathMultiArchCpuType(path, cpu_type) => f.write_fmt(format_args!(
                "fat/universal Mach-O binaries for CPU {} under path {}",
                cpu_type, path
            )),
        }
    }
}

enum AtExpr {
    Index(usize),
    CpuType(CpuType),
}

impl SettingsScope {
    fn parse_at_expr(at_expr: &str) -> Result<AtExpr, CodeSignError> {
        if let Ok(index) = at_expr.parse::<usize>() {
            return Ok(AtExpr::Index(index));
        }

        let v = at_expr
            .strip_prefix('[')
            .and_then(|v| v.strip_suffix(']'))
            .ok_or_else(|| {
                CodeSignError::ParseSettingsScope(format!(
                    "in '{}', @ expression not recognized",
                    at_expr
                ))
            })?;

        let (key, value) = v.split_once('=').ok_or_else(|| {
            CodeSignError::ParseSettingsScope(format!(
                "'{}' sub-expression isn't of form <key>=<value>",
                v
            ))
        })?;

        if key != "cpu_type" {
            return Err(CodeSignError::ParseSettingsScope(format!(
                "in '@{}', {} not recognized; must be cpu_type",
                at_expr, key
            )));
        }

        let cpu_type = match value {
            "arm" => CPU_TYPE_ARM,
            "arm64" => CPU_TYPE_ARM64,
            "arm64_32" => CPU_TYPE_ARM64_32,
            "x86_64" => CPU_TYPE_X86_64,
            _ => value.parse::<u32>().map_err(|_| {
                CodeSignError::ParseSettingsScope(format!(
                    "in '@{}', cpu_type value {} not recognized",
                    at_expr, value
                ))
            })?,
        };

        Ok(AtExpr::CpuType(cpu_type))
    }
}

impl AsRef<SettingsScope> for SettingsScope {
    fn as_ref(&self) -> &SettingsScope {
        self
    }
}

impl TryFrom<&str> for SettingsScope {
    type Error = CodeSignError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s == "@main" {
            Ok(Self::Main)
        } else if let Some(at_expr) = s.strip_prefix('@') {
            Ok(match Self::parse_at_expr(at_expr)? {
                AtExpr::Index(index) => Self::MultiArchIndex(index),
                AtExpr::CpuType(cpu_type) => Self::MultiArchCpuType(cpu_type),
            })
        } else if let Some((path, at_expr)) = s.rsplit_once('@') {
            Ok(match Self::parse_at_expr(at_expr)? {
                AtExpr::Index(index) => Self::PathMultiArchIndex(path.to_string(), index),
                AtExpr::CpuType(cpu_type) => Self::PathMultiArchCpuType(path.to_string(), cpu_type),
            })
        } else {
            Ok(Self::Path(s.to_string()))
        }
    }
}

/// Source of explicit internal requirements.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequirementsSource {
    /// Requirement language text defining the designated requirement.
    ///
    /// A leading `designated =>` is accepted and ignored.
    Text(String),

    /// Compiled requirements, as produced by `csreq -b`.
    ///
    /// Either a requirement set blob or a single requirement blob, which is
    /// taken as the designated requirement.
    Blob(Vec<u8>),
}

impl RequirementsSource {
    /// Resolve the requirement set this source describes.
    pub fn to_requirement_set(&self) -> Result<RequirementSetBlob<'static>, CodeSignError> {
        match self {
            Self::Text(text) => {
                let text = text.trim_start();
                let text = text
                    .strip_prefix("designated")
                    .and_then(|rest| rest.trim_start().strip_prefix("=>"))
                    .unwrap_or(text);

                let requirements = parse_requirements(text)?;

                let mut set = RequirementSetBlob::default();
                requirements.add_to_requirement_set(&mut set, RequirementType::Designated)?;

                Ok(set)
            }
            Self::Blob(data) => {
                let (magic, _, _) = read_blob_header(data)?;

                match CodeSigningMagic::from(magic) {
                    CodeSigningMagic::RequirementSet => {
                        Ok(RequirementSetBlob::from_blob_bytes(data)?.to_owned())
                    }
                    CodeSigningMagic::Requirement => {
                        // Parse the expressions to reject garbage early.
                        let (requirements, _) = CodeRequirements::parse_blob(data)?;

                        let mut set = RequirementSetBlob::default();
                        set.set_requirements(
                            RequirementType::Designated,
                            RequirementBlob::try_from(&requirements)?,
                        );

                        Ok(set)
                    }
                    _ => Err(CodeSignError::BadMagic("requirement blob")),
                }
            }
        }
    }
}

/// Represents code signing settings.
///
/// This type holds settings related to a single logical signing operation.
/// Some settings (such as the signing identity) are global. Other settings
/// (such as the entitlements or designated requirement) can be applied on a
/// more granular, scoped basis. The scoping of these lower-level settings is
/// controlled via [SettingsScope]. If a setting is specified with a scope, it
/// only applies to that scope.
///
/// When the signing operation traverses into nested entities (the individual
/// Mach-O binaries of a fat binary or nested bundles), a new instance is
/// derived by re-scoping, so a complex entity is signed from a single
/// [SigningSettings].
#[derive(Clone, Default)]
pub struct SigningSettings {
    // Global settings.
    signing_identity: Option<Arc<dyn SigningIdentity>>,
    digest_types: Vec<DigestType>,
    signing_time: SigningTime,
    identifier_prefix: Option<String>,
    page_size: Option<u32>,
    resource_rules: Option<plist::Dictionary>,
    detached: bool,
    dry_run: bool,
    top_directory: bool,
    skip_v1_seal: bool,
    single_threaded: bool,

    // Scope-specific settings.
    team_id: BTreeMap<SettingsScope, String>,
    identifiers: BTreeMap<SettingsScope, String>,
    entitlements: BTreeMap<SettingsScope, plist::Value>,
    requirements: BTreeMap<SettingsScope, RequirementsSource>,
    code_signature_flags: BTreeMap<SettingsScope, CodeSignatureFlags>,
    executable_segment_flags: BTreeMap<SettingsScope, ExecutableSegmentFlags>,
    runtime_version: BTreeMap<SettingsScope, semver::Version>,
    info_plist_data: BTreeMap<SettingsScope, Vec<u8>>,
    code_resources_data: BTreeMap<SettingsScope, Vec<u8>>,
}

impl std::fmt::Debug for SigningSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningSettings")
            .field("adhoc", &self.signing_identity.is_none())
            .field("digest_types", &self.digest_types())
            .field("signing_time", &self.signing_time)
            .field("identifier_prefix", &self.identifier_prefix)
            .field("page_size", &self.page_size)
            .field("detached", &self.detached)
            .field("dry_run", &self.dry_run)
            .field("team_id", &self.team_id)
            .field("identifiers", &self.identifiers)
            .finish_non_exhaustive()
    }
}

fn remap<T: Clone>(
    map: &BTreeMap<SettingsScope, T>,
    key_map: &impl Fn(SettingsScope) -> Option<SettingsScope>,
) -> BTreeMap<SettingsScope, T> {
    map.iter()
        .filter_map(|(key, value)| key_map(key.clone()).map(|key| (key, value.clone())))
        .collect::<BTreeMap<_, _>>()
}

impl SigningSettings {
    /// Obtain the signing identity, if any.
    ///
    /// `None` denotes ad-hoc signing.
    pub fn signing_identity(&self) -> Option<&Arc<dyn SigningIdentity>> {
        self.signing_identity.as_ref()
    }

    /// Set the identity producing the cryptographic signature over code.
    ///
    /// If this is not called, signing will lack a cryptographic signature and will only
    /// contain digests of content. This is known as "ad-hoc" mode.
    pub fn set_signing_identity(&mut self, identity: Arc<dyn SigningIdentity>) {
        self.signing_identity = Some(identity);
    }

    /// Obtain the digest types to use, primary first.
    pub fn digest_types(&self) -> Vec<DigestType> {
        if self.digest_types.is_empty() {
            vec![DigestType::default()]
        } else {
            self.digest_types.clone()
        }
    }

    /// Set the digest types to use. One code directory is emitted per type.
    pub fn set_digest_types(&mut self, digests: impl IntoIterator<Item = DigestType>) {
        self.digest_types.clear();

        for digest in digests {
            if !self.digest_types.contains(&digest) {
                self.digest_types.push(digest);
            }
        }
    }

    pub fn signing_time(&self) -> &SigningTime {
        &self.signing_time
    }

    pub fn set_signing_time(&mut self, time: SigningTime) {
        self.signing_time = time;
    }

    /// Prefix applied to derived identifiers lacking a dot.
    pub fn identifier_prefix(&self) -> Option<&str> {
        self.identifier_prefix.as_deref()
    }

    pub fn set_identifier_prefix(&mut self, prefix: impl ToString) {
        self.identifier_prefix = Some(prefix.to_string());
    }

    /// Page size override for code hashing.
    pub fn page_size(&self) -> Option<u32> {
        self.page_size
    }

    /// Override the page size. Must be 0 (unpaged) or a power of two.
    pub fn set_page_size(&mut self, page_size: u32) -> Result<(), CodeSignError> {
        if page_size != 0 && !page_size.is_power_of_two() {
            return Err(CodeSignError::CodeDirectoryMalformed(
                "page size must be a power of two",
            ));
        }

        self.page_size = Some(page_size);
        Ok(())
    }

    /// Resource rules (`rules2` form) overriding the defaults when sealing bundles.
    pub fn resource_rules(&self) -> Option<&plist::Dictionary> {
        self.resource_rules.as_ref()
    }

    /// Set resource rules from a plist whose root dictionary holds `rules2`
    /// (and optionally `rules`), or is itself a rules dictionary.
    pub fn set_resource_rules_xml(&mut self, xml: &[u8]) -> Result<(), CodeSignError> {
        let value = plist::Value::from_reader_xml(xml)?;

        let dict = value.into_dictionary().ok_or_else(|| {
            CodeSignError::ResourceRulesInvalid("resource rules root is not a dictionary".into())
        })?;

        let rules = match dict.get("rules2") {
            Some(plist::Value::Dictionary(d)) => d.clone(),
            Some(_) => {
                return Err(CodeSignError::ResourceRulesInvalid(
                    "rules2 is not a dictionary".into(),
                ))
            }
            None => dict,
        };

        // Compile now so malformed rules fail before any signing work.
        crate::resource_rules::RuleSet::compile(&rules)?;
        self.resource_rules = Some(rules);

        Ok(())
    }

    /// Whether to emit a detached signature instead of embedding it.
    pub fn detached(&self) -> bool {
        self.detached
    }

    pub fn set_detached(&mut self, value: bool) {
        self.detached = value;
    }

    /// Whether to perform every step except writing results.
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn set_dry_run(&mut self, value: bool) {
        self.dry_run = value;
    }

    /// Whether to emit the top directory slot index.
    pub fn top_directory(&self) -> bool {
        self.top_directory
    }

    pub fn set_top_directory(&mut self, value: bool) {
        self.top_directory = value;
    }

    /// Whether to emit the legacy `files` / `rules` resource seal.
    pub fn seal_v1(&self) -> bool {
        !self.skip_v1_seal
    }

    pub fn set_seal_v1(&mut self, value: bool) {
        self.skip_v1_seal = !value;
    }

    pub fn single_threaded(&self) -> bool {
        self.single_threaded
    }

    pub fn set_single_threaded(&mut self, value: bool) {
        self.single_threaded = value;
    }

    /// Obtain the team identifier for a given scope.
    pub fn team_id(&self, scope: impl AsRef<SettingsScope>) -> Option<&str> {
        self.team_id.get(scope.as_ref()).map(|x| x.as_str())
    }

    /// Set the team identifier for signed binaries.
    ///
    /// It must agree with the signing certificate's team, if any.
    pub fn set_team_id(&mut self, scope: SettingsScope, value: impl ToString) {
        self.team_id.insert(scope, value.to_string());
    }

    /// Obtain the binary identifier string for a given scope.
    pub fn binary_identifier(&self, scope: impl AsRef<SettingsScope>) -> Option<&str> {
        self.identifiers.get(scope.as_ref()).map(|s| s.as_str())
    }

    /// Set the binary identifier string for a binary at a path.
    ///
    /// The binary identifier should be a DNS-like name and should uniquely identify the
    /// binary. e.g. `com.example.my_program`
    pub fn set_binary_identifier(&mut self, scope: SettingsScope, value: impl ToString) {
        self.identifiers.insert(scope, value.to_string());
    }

    /// Obtain the entitlements plist as a [plist::Value].
    pub fn entitlements_plist(&self, scope: impl AsRef<SettingsScope>) -> Option<&plist::Value> {
        self.entitlements.get(scope.as_ref())
    }

    /// Obtain the entitlements XML string for a given scope.
    pub fn entitlements_xml(
        &self,
        scope: impl AsRef<SettingsScope>,
    ) -> Result<Option<String>, CodeSignError> {
        if let Some(value) = self.entitlements_plist(scope) {
            let mut buffer = vec![];
            value.to_writer_xml(&mut buffer)?;

            Ok(Some(
                String::from_utf8(buffer)
                    .map_err(|e| CodeSignError::EntitlementsBadUtf8(e.utf8_error()))?,
            ))
        } else {
            Ok(None)
        }
    }

    /// Set the entitlements to sign via an XML string.
    ///
    /// The value should be an XML plist with a dictionary root.
    pub fn set_entitlements_xml(
        &mut self,
        scope: SettingsScope,
        value: impl ToString,
    ) -> Result<(), CodeSignError> {
        let value = parse_entitlements_xml(&value.to_string())?;
        self.entitlements.insert(scope, value);

        Ok(())
    }

    /// Obtain the explicit requirements for a given scope.
    pub fn requirements(&self, scope: impl AsRef<SettingsScope>) -> Option<&RequirementsSource> {
        self.requirements.get(scope.as_ref())
    }

    /// Set explicit internal requirements.
    ///
    /// The source is resolved eagerly so that malformed requirements fail
    /// before any signing work.
    pub fn set_requirements(
        &mut self,
        scope: SettingsScope,
        source: RequirementsSource,
    ) -> Result<(), CodeSignError> {
        source.to_requirement_set()?;
        self.requirements.insert(scope, source);

        Ok(())
    }

    /// Obtain the code signature flags for a given scope.
    pub fn code_signature_flags(&self, scope: impl AsRef<SettingsScope>) -> Option<CodeSignatureFlags> {
        self.code_signature_flags.get(scope.as_ref()).copied()
    }

    /// Set code signature flags for signed binaries.
    pub fn set_code_signature_flags(&mut self, scope: SettingsScope, flags: CodeSignatureFlags) {
        self.code_signature_flags.insert(scope, flags);
    }

    /// Add a code signature flag for a scope.
    pub fn add_code_signature_flags(&mut self, scope: SettingsScope, flags: CodeSignatureFlags) {
        *self
            .code_signature_flags
            .entry(scope)
            .or_insert_with(CodeSignatureFlags::empty) |= flags;
    }

    /// Obtain the executable segment flags for a given scope.
    pub fn executable_segment_flags(
        &self,
        scope: impl AsRef<SettingsScope>,
    ) -> Option<ExecutableSegmentFlags> {
        self.executable_segment_flags.get(scope.as_ref()).copied()
    }

    pub fn set_executable_segment_flags(
        &mut self,
        scope: SettingsScope,
        flags: ExecutableSegmentFlags,
    ) {
        self.executable_segment_flags.insert(scope, flags);
    }

    /// Obtain the hardened runtime version override for a given scope.
    pub fn runtime_version(&self, scope: impl AsRef<SettingsScope>) -> Option<&semver::Version> {
        self.runtime_version.get(scope.as_ref())
    }

    /// Set the hardened runtime version recorded when `runtime` is flagged.
    pub fn set_runtime_version(&mut self, scope: SettingsScope, version: semver::Version) {
        self.runtime_version.insert(scope, version);
    }

    /// Obtain the `Info.plist` data digested into the info slot.
    pub fn info_plist_data(&self, scope: impl AsRef<SettingsScope>) -> Option<&[u8]> {
        self.info_plist_data
            .get(scope.as_ref())
            .map(|x| x.as_slice())
    }

    /// Define the `Info.plist` content of a binary.
    ///
    /// When signing bundles, this is set automatically from the bundle.
    pub fn set_info_plist_data(&mut self, scope: SettingsScope, data: Vec<u8>) {
        self.info_plist_data.insert(scope, data);
    }

    /// Obtain the `CodeResources` data digested into the resource slot.
    pub fn code_resources_data(&self, scope: impl AsRef<SettingsScope>) -> Option<&[u8]> {
        self.code_resources_data
            .get(scope.as_ref())
            .map(|x| x.as_slice())
    }

    /// Define the resource seal content of a binary.
    ///
    /// When signing bundles, this is set automatically after sealing.
    pub fn set_code_resources_data(&mut self, scope: SettingsScope, data: Vec<u8>) {
        self.code_resources_data.insert(scope, data);
    }

    /// Import existing state from Mach-O data.
    ///
    /// Explicit settings are honored. Otherwise the identifier, flags,
    /// runtime version and entitlements of an existing signature carry over.
    pub fn import_settings_from_macho(&mut self, macho_data: &[u8]) -> Result<(), CodeSignError> {
        info!("inferring default signing settings from Mach-O binary");

        for slice in parse_slices(macho_data)? {
            let scope_main = SettingsScope::Main;
            let scope_index = SettingsScope::MultiArchIndex(slice.index);
            let scope_arch = SettingsScope::MultiArchCpuType(slice.cputype);

            let scopes = [&scope_main, &scope_index, &scope_arch];

            let sig = match slice.macho.code_signature()? {
                Some(sig) => sig,
                None => continue,
            };

            if let Some(cd) = sig.code_directory()? {
                if scopes.iter().any(|s| self.identifiers.contains_key(s)) {
                    info!("using binary identifier from settings");
                } else {
                    info!("preserving existing binary identifier in Mach-O");
                    self.set_binary_identifier(scope_index.clone(), cd.ident.to_string());
                }

                let flags = cd.flags
                    - CodeSignatureFlags::ADHOC
                    - CodeSignatureFlags::LINKER_SIGNED;

                if scopes.iter().any(|s| self.code_signature_flags.contains_key(s)) {
                    info!("using code signature flags from settings");
                } else if !flags.is_empty() {
                    info!("preserving code signature flags in existing Mach-O signature");
                    self.set_code_signature_flags(scope_index.clone(), flags);
                }

                if scopes
                    .iter()
                    .any(|s| self.executable_segment_flags.contains_key(s))
                {
                    info!("using executable segment flags from settings");
                } else if let Some(flags) = cd.exec_seg_flags {
                    if !flags.is_empty() {
                        info!("preserving executable segment flags in existing Mach-O signature");
                        self.set_executable_segment_flags(scope_index.clone(), flags);
                    }
                }

                if scopes.iter().any(|s| self.runtime_version.contains_key(s)) {
                    info!("using runtime version from settings");
                } else if let Some(version) = cd.runtime {
                    info!("preserving runtime version in existing Mach-O signature");
                    self.set_runtime_version(scope_index.clone(), parse_version_nibbles(version));
                }
            }

            if let Some(entitlements) = sig.entitlements()? {
                if scopes.iter().any(|s| self.entitlements.contains_key(s)) {
                    info!("using entitlements from settings");
                } else {
                    info!("preserving existing entitlements in Mach-O");
                    self.set_entitlements_xml(scope_index.clone(), entitlements.as_str())?;
                }
            }
        }

        Ok(())
    }

    /// Convert this instance to settings appropriate for a nested bundle.
    #[must_use]
    pub fn as_nested_bundle_settings(&self, bundle_path: &str) -> Self {
        self.clone_strip_prefix(bundle_path, format!("{}/", bundle_path))
    }

    /// Convert this instance to settings appropriate for a Mach-O binary in a bundle.
    #[must_use]
    pub fn as_bundle_macho_settings(&self, path: &str) -> Self {
        self.clone_strip_prefix(path, path.to_string())
    }

    /// Convert this instance to settings appropriate for a nested Mach-O binary.
    ///
    /// Any scoped settings for the Mach-O binary index and CPU type are
    /// promoted to the main scope. CPU type settings take precedence over
    /// index scoped settings.
    #[must_use]
    pub fn as_nested_macho_settings(&self, index: usize, cpu_type: CpuType) -> Self {
        self.clone_with_filter_map(|key| {
            if key == SettingsScope::Main
                || key == SettingsScope::MultiArchCpuType(cpu_type)
                || key == SettingsScope::MultiArchIndex(index)
            {
                Some(SettingsScope::Main)
            } else {
                None
            }
        })
    }

    // Clones this instance, promoting `main_path` to the main scope and stripping
    // a prefix from other keys.
    fn clone_strip_prefix(&self, main_path: &str, prefix: String) -> Self {
        self.clone_with_filter_map(|key| match key {
            SettingsScope::Main => Some(SettingsScope::Main),
            SettingsScope::Path(path) => {
                if path == main_path {
                    Some(SettingsScope::Main)
                } else {
                    path.strip_prefix(&prefix)
                        .map(|path| SettingsScope::Path(path.to_string()))
                }
            }
            SettingsScope::MultiArchIndex(index) => Some(SettingsScope::MultiArchIndex(index)),
            SettingsScope::MultiArchCpuType(cpu_type) => {
                Some(SettingsScope::MultiArchCpuType(cpu_type))
            }
            SettingsScope::PathMultiArchIndex(path, index) => {
                if path == main_path {
                    Some(SettingsScope::MultiArchIndex(index))
                } else {
                    path.strip_prefix(&prefix)
                        .map(|path| SettingsScope::PathMultiArchIndex(path.to_string(), index))
                }
            }
            SettingsScope::PathMultiArchCpuType(path, cpu_type) => {
                if path == main_path {
                    Some(SettingsScope::MultiArchCpuType(cpu_type))
                } else {
                    path.strip_prefix(&prefix)
                        .map(|path| SettingsScope::PathMultiArchCpuType(path.to_string(), cpu_type))
                }
            }
        })
    }

    fn clone_with_filter_map(
        &self,
        key_map: impl Fn(SettingsScope) -> Option<SettingsScope>,
    ) -> Self {
        Self {
            signing_identity: self.signing_identity.clone(),
            digest_types: self.digest_types.clone(),
            signing_time: self.signing_time,
            identifier_prefix: self.identifier_prefix.clone(),
            page_size: self.page_size,
            resource_rules: self.resource_rules.clone(),
            detached: self.detached,
            dry_run: self.dry_run,
            top_directory: self.top_directory,
            skip_v1_seal: self.skip_v1_seal,
            single_threaded: self.single_threaded,
            team_id: remap(&self.team_id, &key_map),
            identifiers: remap(&self.identifiers, &key_map),
            entitlements: remap(&self.entitlements, &key_map),
            requirements: remap(&self.requirements, &key_map),
            code_signature_flags: remap(&self.code_signature_flags, &key_map),
            executable_segment_flags: remap(&self.executable_segment_flags, &key_map),
            runtime_version: remap(&self.runtime_version, &key_map),
            info_plist_data: remap(&self.info_plist_data, &key_map),
            code_resources_data: remap(&self.code_resources_data, &key_map),
        }
    }
}
