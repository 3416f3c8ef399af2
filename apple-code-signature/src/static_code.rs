// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Static validation of signed code on disk.

A [StaticCode] represents a Mach-O binary (thin or universal) or a bundle
along with its signature. Validation happens in stages:

1. The directory stage decodes every code directory, picks the strongest,
   verifies the CMS envelope and special slot digests.
2. The executable stage re-reads the binary from disk and compares every
   page against the recorded page digests.
3. The resource stage re-scans a bundle's resources against its
   `CodeResources` seal, recursing into nested code.

The outcome of each stage is remembered for the lifetime of the instance.
Failures are replayed verbatim on later calls. Attaching a new signature
or calling [StaticCode::reset] forgets everything.

# Caveats

Validation performed here will vary from what Apple's operating systems do.
Trust in certificate chains is delegated to a [TrustEvaluator], which by
default knows no anchors.
*/

use {
    crate::{
        cms::{
            certificate_subject, verify_cms, CmsInfo, TrustEvaluator, TrustPolicy, TrustResult,
            ValidityTrustEvaluator,
        },
        code_directory::{cdhash, CodeDirectoryBlob, CodeDirectorySet, CodeSignatureFlags},
        code_requirement::{
            adhoc_designated_requirement, certificate_designated_requirement,
            CodeRequirementExpression, CodeRequirements, RequirementContext, RequirementType,
        },
        code_resources::{CodeResources, NestedSeal, ResourceSeal, CODE_RESOURCES_PATH},
        digest::{code_slot_count, hash_file, paged_digests, DigestType},
        embedded_signature::{BlobData, CodeSigningSlot, DetachedSignature, EmbeddedSignature},
        entitlements::parse_entitlements_xml,
        error::{CodeSignError, ErrorKind},
        macho::{parse_slices, MachOSignable, MachOSlice},
        pool::{CancellationToken, LimitedAsync},
        requirement_text::parse_requirement_expression,
        resource_rules::{EntryKind, RuleSet, ScanOptions},
        validation::{CollectingContext, ProblemKind, ResourceProblem, ValidationContext},
    },
    apple_bundles::DirectoryBundle,
    chrono::{DateTime, Utc},
    log::{debug, info, warn},
    std::{
        collections::{BTreeMap, BTreeSet},
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Sample paths of executable code that omission rules must not cover.
const EXECUTABLE_SAMPLE_PATHS: [&str; 3] = [
    "MacOS/executable",
    "Frameworks/Library.framework/Library",
    "Frameworks/library.dylib",
];

/// Controls what [StaticCode::validate] checks.
#[derive(Clone, Debug)]
pub struct ValidationFlags {
    /// Re-hash the executable pages.
    pub check_executable: bool,
    /// Validate the resource seal of bundles.
    pub check_resources: bool,
    /// Treat weak resource rules and envelopes as errors.
    pub strict: bool,
    /// Compare the top directory index against the signature's slots.
    pub check_top_directory: bool,
    /// Tolerate expired certificates without a secure timestamp.
    pub allow_expired: bool,
    /// Forbid network access during trust evaluation.
    pub no_network: bool,
    /// Validate resources on the calling thread only.
    pub single_threaded: bool,
    /// Validate every architecture of a universal binary.
    pub all_architectures: bool,
    /// Skip resources that cannot be read while scanning.
    pub tolerate_unreadable: bool,
    /// Skip resources of unsupported file types while scanning.
    pub tolerate_unsupported_entries: bool,
    /// Ignore problems with legacy `SC_Info/` store metadata.
    pub legacy_sc_info_tolerance: bool,
    pub cancellation: CancellationToken,
}

impl Default for ValidationFlags {
    fn default() -> Self {
        Self {
            check_executable: true,
            check_resources: true,
            strict: false,
            check_top_directory: false,
            allow_expired: false,
            no_network: false,
            single_threaded: false,
            all_architectures: false,
            tolerate_unreadable: false,
            tolerate_unsupported_entries: false,
            legacy_sc_info_tolerance: false,
            cancellation: CancellationToken::default(),
        }
    }
}

impl ValidationFlags {
    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            tolerate_unreadable: self.tolerate_unreadable,
            tolerate_unsupported: self.tolerate_unsupported_entries,
        }
    }
}

/// Counts of resources checked against a seal.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResourceCounts {
    /// Entries recorded in the seal.
    pub sealed: usize,
    /// Entries found on disk and checked.
    pub checked: usize,
    /// Nested code objects validated.
    pub nested: usize,
}

/// Validation outcome of a single architecture.
#[derive(Clone, Debug, PartialEq)]
pub struct ArchitectureReport {
    pub index: usize,
    pub cputype: u32,
    pub identifier: String,
    pub team_id: Option<String>,
    pub flags: CodeSignatureFlags,
    /// Digest type of the selected code directory.
    pub digest_type: DigestType,
    /// cdhash of the selected code directory.
    pub cdhash: Vec<u8>,
    /// One cdhash per code directory, sorted by digest type id.
    pub cd_hashes: Vec<(DigestType, Vec<u8>)>,
    pub signing_time: Option<DateTime<Utc>>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Subjects of the signing certificate chain, leaf first.
    pub certificates: Vec<String>,
}

/// The result of a successful validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationReport {
    pub path: PathBuf,
    pub identifier: String,
    pub team_id: Option<String>,
    pub flags: CodeSignatureFlags,
    pub cd_hashes: Vec<(DigestType, Vec<u8>)>,
    pub digest_type: DigestType,
    pub signing_time: Option<DateTime<Utc>>,
    /// Present when resources were validated.
    pub resources: Option<ResourceCounts>,
    pub architectures: Vec<ArchitectureReport>,
}

/// The layout of a bundle relevant to validation.
#[derive(Clone, Debug)]
pub struct BundleLayout {
    /// Directory holding `_CodeSignature`, e.g. `Foo.app/Contents`.
    pub resource_root: PathBuf,
    pub info_plist: PathBuf,
    /// Main executable path relative to `resource_root`.
    pub main_executable: String,
}

impl BundleLayout {
    pub fn resolve(root: &Path) -> Result<Self, CodeSignError> {
        let bundle =
            DirectoryBundle::new_from_path(root).map_err(CodeSignError::DirectoryBundle)?;

        let resource_root = if bundle.shallow() {
            root.to_path_buf()
        } else {
            root.join("Contents")
        };

        let main_exe = bundle
            .main_executable()
            .map_err(CodeSignError::DirectoryBundle)?
            .ok_or_else(|| CodeSignError::BundleNoMainExecutable(root.to_path_buf()))?;

        let main_executable = if bundle.shallow() {
            main_exe
        } else {
            format!("MacOS/{}", main_exe)
        };

        Ok(Self {
            resource_root,
            info_plist: bundle.info_plist_path(),
            main_executable,
        })
    }

    pub fn main_executable_path(&self) -> PathBuf {
        self.resource_root.join(&self.main_executable)
    }
}

/// Directory stage facts about one architecture.
#[derive(Debug)]
struct ArchDirectory {
    index: usize,
    cputype: u32,
    identifier: String,
    team_id: Option<String>,
    flags: CodeSignatureFlags,
    platform: u8,
    digest_type: DigestType,
    page_size: u32,
    code_limit: u64,
    code_hashes: Vec<Vec<u8>>,
    special_hashes: BTreeMap<CodeSigningSlot, Vec<u8>>,
    cdhash: Vec<u8>,
    cd_hashes: Vec<(DigestType, Vec<u8>)>,
    /// Slot ids in canonical order: code directory, specials, alternates, signature.
    slots: Vec<u32>,
    top_directory: Option<Vec<u32>>,
    cms: Option<CmsInfo>,
    trust: TrustResult,
    entitlements: Option<plist::Dictionary>,
    designated: Option<CodeRequirements<'static>>,
}

impl ArchDirectory {
    fn report(&self) -> ArchitectureReport {
        ArchitectureReport {
            index: self.index,
            cputype: self.cputype,
            identifier: self.identifier.clone(),
            team_id: self.team_id.clone(),
            flags: self.flags,
            digest_type: self.digest_type,
            cdhash: self.cdhash.clone(),
            cd_hashes: self.cd_hashes.clone(),
            signing_time: self.cms.as_ref().and_then(|c| c.signing_time),
            timestamp: self.cms.as_ref().and_then(|c| c.timestamp),
            certificates: self
                .cms
                .as_ref()
                .map(|c| c.certificates.iter().map(certificate_subject).collect())
                .unwrap_or_default(),
        }
    }
}

type Outcome<T> = Result<Arc<T>, Arc<CodeSignError>>;

/// A remembered stage outcome, keyed by the inputs that produced it.
struct Memo<K, T>(Option<(K, Outcome<T>)>);

impl<K, T> Default for Memo<K, T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<K: PartialEq, T> Memo<K, T> {
    fn get_or_compute(
        &mut self,
        key: K,
        compute: impl FnOnce() -> Result<T, CodeSignError>,
    ) -> Result<Arc<T>, CodeSignError> {
        if let Some((cached, outcome)) = &self.0 {
            if *cached == key {
                return outcome.clone().map_err(CodeSignError::Replayed);
            }
        }

        match compute() {
            Ok(value) => {
                let value = Arc::new(value);
                self.0 = Some((key, Ok(value.clone())));
                Ok(value)
            }
            // Partial results of a cancelled run are never trusted.
            Err(e) if e.kind() == ErrorKind::Cancelled => Err(e),
            Err(e) => {
                let e = Arc::new(e);
                self.0 = Some((key, Err(e.clone())));
                Err(CodeSignError::Replayed(e))
            }
        }
    }

    fn clear(&mut self) {
        self.0 = None;
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct DirectoryKey {
    all_architectures: bool,
    allow_expired: bool,
    no_network: bool,
    strict: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct ResourceKey {
    strict: bool,
    allow_expired: bool,
    no_network: bool,
    tolerate_unreadable: bool,
    tolerate_unsupported_entries: bool,
    legacy_sc_info_tolerance: bool,
}

/// Signed code on disk, validated lazily.
pub struct StaticCode {
    path: PathBuf,
    executable: PathBuf,
    bundle: Option<BundleLayout>,
    detached: Option<Vec<u8>>,
    cputype: Option<u32>,
    trust: Arc<dyn TrustEvaluator + Send + Sync>,
    directory: Memo<DirectoryKey, Vec<ArchDirectory>>,
    executable_state: Memo<Vec<usize>, ()>,
    resources: Memo<ResourceKey, ResourceCounts>,
}

impl std::fmt::Debug for StaticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCode")
            .field("path", &self.path)
            .field("executable", &self.executable)
            .field("bundle", &self.bundle)
            .field("detached", &self.detached.is_some())
            .field("cputype", &self.cputype)
            .finish()
    }
}

impl StaticCode {
    /// Open a Mach-O binary or a bundle directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CodeSignError> {
        let path = path.as_ref().to_path_buf();

        let (executable, bundle) = if path.is_dir() {
            let layout = BundleLayout::resolve(&path)?;
            (layout.main_executable_path(), Some(layout))
        } else {
            (path.clone(), None)
        };

        if !executable.is_file() {
            return Err(CodeSignError::BundleNoMainExecutable(executable));
        }

        Ok(Self {
            path,
            executable,
            bundle,
            detached: None,
            cputype: None,
            trust: Arc::new(ValidityTrustEvaluator::default()),
            directory: Memo::default(),
            executable_state: Memo::default(),
            resources: Memo::default(),
        })
    }

    /// Validate against a detached signature instead of the embedded one.
    #[must_use]
    pub fn with_detached_signature(mut self, data: Vec<u8>) -> Self {
        self.attach_detached_signature(data);
        self
    }

    /// Select the architecture validated when not validating all of them.
    #[must_use]
    pub fn with_cpu_type(mut self, cputype: u32) -> Self {
        self.cputype = Some(cputype);
        self.reset();
        self
    }

    #[must_use]
    pub fn with_trust_evaluator(mut self, trust: Arc<dyn TrustEvaluator + Send + Sync>) -> Self {
        self.trust = trust;
        self.reset();
        self
    }

    /// Attach a detached signature, forgetting prior validation results.
    pub fn attach_detached_signature(&mut self, data: Vec<u8>) {
        self.detached = Some(data);
        self.reset();
    }

    /// Forget every remembered validation outcome.
    pub fn reset(&mut self) {
        debug!("resetting validation state of {}", self.path.display());
        self.directory.clear();
        self.executable_state.clear();
        self.resources.clear();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_bundle(&self) -> bool {
        self.bundle.is_some()
    }

    fn directories(
        &mut self,
        flags: &ValidationFlags,
    ) -> Result<Arc<Vec<ArchDirectory>>, CodeSignError> {
        let key = DirectoryKey {
            all_architectures: flags.all_architectures,
            allow_expired: flags.allow_expired,
            no_network: flags.no_network,
            strict: flags.strict,
        };

        let mut memo = std::mem::take(&mut self.directory);
        let res = memo.get_or_compute(key, || self.compute_directories(flags));
        self.directory = memo;

        res
    }

    fn compute_directories(
        &self,
        flags: &ValidationFlags,
    ) -> Result<Vec<ArchDirectory>, CodeSignError> {
        info!("validating signature of {}", self.path.display());

        let data = std::fs::read(&self.executable)?;
        let slices = parse_slices(&data)?;

        let detached = match &self.detached {
            Some(data) => Some(DetachedSignature::from_bytes(data)?),
            None => None,
        };

        let selected: Vec<&MachOSlice> = if flags.all_architectures {
            slices.iter().collect()
        } else {
            let slice = match self.cputype {
                Some(cputype) => slices.iter().find(|s| s.cputype == cputype).ok_or_else(|| {
                    CodeSignError::InvalidBinary(format!("no architecture with CPU type {}", cputype))
                })?,
                None => slices
                    .first()
                    .ok_or_else(|| CodeSignError::InvalidBinary("no Mach-O slices".into()))?,
            };
            vec![slice]
        };

        let mut res = vec![];

        for slice in selected {
            flags.cancellation.check()?;
            debug!(
                "validating code directories of architecture {} (CPU type {})",
                slice.index, slice.cputype
            );

            let directory = match &detached {
                Some(detached) => {
                    let sig = detached
                        .for_cpu_type(slice.cputype)
                        .ok_or_else(|| CodeSignError::Unsigned(self.path.clone()))?;
                    self.validate_arch_directory(slice, sig, flags)?
                }
                None => {
                    let sig = slice
                        .macho
                        .code_signature()?
                        .ok_or_else(|| CodeSignError::Unsigned(self.path.clone()))?;
                    self.validate_arch_directory(slice, &sig, flags)?
                }
            };

            res.push(directory);
        }

        if let Some(first) = res.first() {
            for other in &res[1..] {
                if other.team_id != first.team_id {
                    return Err(CodeSignError::TeamIdentifierMismatch(
                        first.team_id.clone().unwrap_or_default(),
                        other.team_id.clone().unwrap_or_default(),
                    ));
                }
            }
        }

        Ok(res)
    }

    fn validate_arch_directory(
        &self,
        slice: &MachOSlice,
        sig: &EmbeddedSignature,
        flags: &ValidationFlags,
    ) -> Result<ArchDirectory, CodeSignError> {
        let mut set = CodeDirectorySet::default();
        let mut by_slot = vec![];

        for entry in sig.blobs.iter().filter(|b| b.slot.is_code_directory()) {
            let cd = match BlobData::from_blob_bytes(entry.data)? {
                BlobData::CodeDirectory(cd) => cd,
                _ => return Err(CodeSignError::BadMagic("code directory blob")),
            };

            by_slot.push((entry.slot, cd.hash_type, entry.data));
            set.insert_with_data(*cd, entry.data.to_vec())?;
        }

        let primary_data = sig
            .find_slot(CodeSigningSlot::CodeDirectory)
            .map(|entry| entry.data)
            .ok_or_else(|| CodeSignError::SignatureInvalid("no code directory".into()))?;

        let (best, best_data) = match (set.best(), set.best_data()) {
            (Some(best), Some(data)) => (best, data),
            _ => {
                let digest = set.iter().next().map(|cd| cd.hash_type).unwrap_or(DigestType::None);
                return Err(CodeSignError::UnsupportedDigestAlgorithm(digest.into()));
            }
        };

        debug!(
            "selected {} code directory out of {}",
            best.hash_type,
            set.len()
        );

        let best_cdhash = cdhash(best_data, best.hash_type)?;

        by_slot.sort_by_key(|(slot, _, _)| *slot);
        let slot_cdhashes = by_slot
            .iter()
            .filter(|(_, digest, _)| digest.strength() > 0)
            .map(|(_, digest, data)| cdhash(data, *digest))
            .collect::<Result<Vec<_>, _>>()?;

        let cms = self.verify_envelope(sig, best.flags, primary_data, &slot_cdhashes, &best_cdhash)?;

        let trust = match &cms {
            Some(cms) => {
                // Only a time-stamp authority can vouch for the signing time.
                let policy = TrustPolicy {
                    signing_time: cms.timestamp,
                    timestamped: cms.is_timestamped(),
                    no_network: flags.no_network,
                    allow_expired: flags.allow_expired,
                };

                self.trust.evaluate(&cms.certificates, &policy)?
            }
            None => TrustResult::default(),
        };

        self.verify_special_slots(sig, best, flags)?;

        let entitlements = match sig.entitlements()? {
            Some(blob) => parse_entitlements_xml(blob.as_str())?.into_dictionary(),
            None => None,
        };

        let designated = match sig.code_requirements()? {
            Some(set) => match set.requirements.get(&RequirementType::Designated) {
                Some(blob) => Some(blob.parse_expressions()?.to_owned()),
                None => None,
            },
            None => None,
        };

        let present = sig
            .blobs
            .iter()
            .map(|b| b.slot)
            .collect::<BTreeSet<CodeSigningSlot>>();
        let mut slots = vec![];
        slots.extend(
            present
                .iter()
                .filter(|s| **s == CodeSigningSlot::CodeDirectory)
                .map(|s| u32::from(*s)),
        );
        slots.extend(
            present
                .iter()
                .filter(|s| s.is_code_directory_special_slot())
                .map(|s| u32::from(*s)),
        );
        slots.extend(
            present
                .iter()
                .filter(|s| s.is_alternate_code_directory())
                .map(|s| u32::from(*s)),
        );
        slots.extend(
            present
                .iter()
                .filter(|s| **s == CodeSigningSlot::Signature)
                .map(|s| u32::from(*s)),
        );

        Ok(ArchDirectory {
            index: slice.index,
            cputype: slice.cputype,
            identifier: best.ident.to_string(),
            team_id: best.team_name.as_ref().map(|t| t.to_string()),
            flags: best.flags,
            platform: best.platform,
            digest_type: best.hash_type,
            page_size: best.page_size,
            code_limit: best.effective_code_limit(),
            code_hashes: best.code_hashes.iter().map(|d| d.to_vec()).collect(),
            special_hashes: best
                .special_hashes
                .iter()
                .map(|(slot, digest)| (*slot, digest.to_vec()))
                .collect(),
            cdhash: best_cdhash,
            cd_hashes: set.cd_hashes()?,
            slots,
            top_directory: sig.top_directory()?.map(|top| top.slots),
            cms,
            trust,
            entitlements,
            designated,
        })
    }

    /// Verify the CMS envelope and its hash agility attestation.
    fn verify_envelope(
        &self,
        sig: &EmbeddedSignature,
        flags: CodeSignatureFlags,
        primary_data: &[u8],
        slot_cdhashes: &[Vec<u8>],
        best_cdhash: &[u8],
    ) -> Result<Option<CmsInfo>, CodeSignError> {
        let signature = sig.signature_data()?.filter(|data| !data.is_empty());
        let adhoc = flags.contains(CodeSignatureFlags::ADHOC);

        let data = match (adhoc, signature) {
            (true, Some(_)) => {
                return Err(CodeSignError::SignatureInvalid(
                    "ad-hoc code directory carries a CMS signature".into(),
                ))
            }
            (true, None) => {
                debug!("ad-hoc signature; no CMS envelope to verify");
                return Ok(None);
            }
            (false, None) => {
                return Err(CodeSignError::SignatureInvalid(
                    "code directory is not ad-hoc but has no CMS signature".into(),
                ))
            }
            (false, Some(data)) => data,
        };

        let cms = verify_cms(data, primary_data)?;

        match &cms.cdhashes {
            Some(claimed) => {
                if claimed.as_slice() != slot_cdhashes {
                    return Err(CodeSignError::SignatureInvalid(
                        "signed cdhashes do not match code directories".into(),
                    ));
                }
                if !claimed.iter().any(|h| h.as_slice() == best_cdhash) {
                    return Err(CodeSignError::SignatureInvalid(
                        "selected code directory is not attested by the signature".into(),
                    ));
                }
            }
            None if slot_cdhashes.len() > 1 => {
                return Err(CodeSignError::SignatureInvalid(
                    "alternate code directories are not attested by the signature".into(),
                ));
            }
            None => {}
        }

        Ok(Some(cms))
    }

    fn verify_special_slots(
        &self,
        sig: &EmbeddedSignature,
        cd: &CodeDirectoryBlob,
        flags: &ValidationFlags,
    ) -> Result<(), CodeSignError> {
        let matches = |data: &[u8], recorded: &[u8]| -> Result<bool, CodeSignError> {
            Ok(!recorded.is_empty() && cd.hash_type.digest_data(data)?.starts_with(recorded))
        };

        for (slot, recorded) in &cd.special_hashes {
            if slot.has_external_content() {
                continue;
            }

            match sig.find_slot(*slot) {
                Some(entry) => {
                    if !matches(entry.data, &recorded.data[..])? {
                        return Err(CodeSignError::SpecialSlotMismatch(u32::from(*slot)));
                    }
                }
                None if recorded.is_null() => {}
                None => return Err(CodeSignError::SpecialSlotMismatch(u32::from(*slot))),
            }
        }

        for entry in &sig.blobs {
            if entry.slot.is_code_directory_special_slot()
                && !entry.slot.has_external_content()
                && cd
                    .special_hashes
                    .get(&entry.slot)
                    .map(|d| d.is_null())
                    .unwrap_or(true)
            {
                return Err(CodeSignError::SpecialSlotMismatch(u32::from(entry.slot)));
            }
        }

        let recorded = cd
            .special_hashes
            .get(&CodeSigningSlot::Info)
            .filter(|d| !d.is_null());

        match (&self.bundle, recorded) {
            (Some(bundle), Some(recorded)) => {
                let data = std::fs::read(&bundle.info_plist)?;
                if !matches(&data, &recorded.data[..])? {
                    return Err(CodeSignError::SpecialSlotMismatch(u32::from(
                        CodeSigningSlot::Info,
                    )));
                }
            }
            (Some(_), None) if flags.strict => {
                return Err(CodeSignError::SpecialSlotMismatch(u32::from(
                    CodeSigningSlot::Info,
                )));
            }
            (Some(_), None) => warn!("Info.plist is not bound to the signature"),
            (None, Some(_)) => debug!("cannot verify Info.plist digest outside a bundle"),
            (None, None) => {}
        }

        Ok(())
    }

    /// Validate the code directories and the cryptographic envelope.
    pub fn validate_directory(&mut self, flags: &ValidationFlags) -> Result<(), CodeSignError> {
        self.directories(flags).map(|_| ())
    }

    /// Re-hash the executable on disk and compare against the page digests.
    pub fn validate_executable(&mut self, flags: &ValidationFlags) -> Result<(), CodeSignError> {
        let directories = self.directories(flags)?;
        let key = directories.iter().map(|d| d.index).collect::<Vec<_>>();

        let mut memo = std::mem::take(&mut self.executable_state);
        let res = memo.get_or_compute(key, || self.compute_executable(&directories, flags));
        self.executable_state = memo;

        res.map(|_| ())
    }

    fn compute_executable(
        &self,
        directories: &[ArchDirectory],
        flags: &ValidationFlags,
    ) -> Result<(), CodeSignError> {
        // Always the bytes on disk now, never what the directory stage read.
        let data = std::fs::read(&self.executable)?;
        let slices = parse_slices(&data)?;

        for directory in directories {
            flags.cancellation.check()?;

            let slice = slices
                .iter()
                .find(|s| s.index == directory.index && s.cputype == directory.cputype)
                .ok_or_else(|| {
                    CodeSignError::InvalidBinary(format!(
                        "architecture {} no longer present",
                        directory.index
                    ))
                })?;

            let code = usize::try_from(directory.code_limit)
                .ok()
                .and_then(|limit| slice.data.get(..limit))
                .ok_or_else(|| {
                    CodeSignError::SignatureInvalid(format!(
                        "code limit {} exceeds binary size {}",
                        directory.code_limit,
                        slice.data.len()
                    ))
                })?;

            let expected_slots = code_slot_count(directory.code_limit, directory.page_size)?;
            if directory.code_hashes.len() as u64 != expected_slots {
                return Err(CodeSignError::SignatureInvalid(format!(
                    "code directory has {} code slots; expected {}",
                    directory.code_hashes.len(),
                    expected_slots
                )));
            }

            let actual = paged_digests(code, directory.digest_type, directory.page_size as usize)?;

            for (page, (recorded, actual)) in directory.code_hashes.iter().zip(actual.iter()).enumerate() {
                if !actual.starts_with(recorded) || recorded.is_empty() {
                    warn!(
                        "page {} of architecture {} has digest {}; recorded {}",
                        page,
                        directory.index,
                        hex::encode(actual),
                        hex::encode(recorded)
                    );
                    return Err(CodeSignError::PageHashMismatch { page });
                }
            }

            debug!(
                "{} code pages of architecture {} verified",
                directory.code_hashes.len(),
                directory.index
            );
        }

        Ok(())
    }

    /// Compare the top directory index against the slots present.
    ///
    /// Signatures without a top directory pass.
    pub fn validate_top_directory(&mut self, flags: &ValidationFlags) -> Result<(), CodeSignError> {
        for directory in self.directories(flags)?.iter() {
            if let Some(recorded) = &directory.top_directory {
                if recorded != &directory.slots {
                    return Err(CodeSignError::SignatureInvalid(format!(
                        "top directory lists slots {:x?} but signature has {:x?}",
                        recorded, directory.slots
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate bundle resources against the resource seal.
    ///
    /// Code that is not a bundle has no resources and trivially passes.
    pub fn validate_resources(
        &mut self,
        flags: &ValidationFlags,
    ) -> Result<ResourceCounts, CodeSignError> {
        let directories = self.directories(flags)?;

        let key = ResourceKey {
            strict: flags.strict,
            allow_expired: flags.allow_expired,
            no_network: flags.no_network,
            tolerate_unreadable: flags.tolerate_unreadable,
            tolerate_unsupported_entries: flags.tolerate_unsupported_entries,
            legacy_sc_info_tolerance: flags.legacy_sc_info_tolerance,
        };

        let mut memo = std::mem::take(&mut self.resources);
        let res = memo.get_or_compute(key, || self.compute_resources(&directories, flags));
        self.resources = memo;

        res.map(|counts| *counts)
    }

    fn compute_resources(
        &self,
        directories: &[ArchDirectory],
        flags: &ValidationFlags,
    ) -> Result<ResourceCounts, CodeSignError> {
        let bundle = match &self.bundle {
            Some(bundle) => bundle,
            None => return Ok(ResourceCounts::default()),
        };

        let directory = directories
            .first()
            .ok_or_else(|| CodeSignError::InternalError("no validated architecture".into()))?;

        let seal_path = bundle.resource_root.join(CODE_RESOURCES_PATH);
        let recorded = directory
            .special_hashes
            .get(&CodeSigningSlot::ResourceDir)
            .filter(|d| d.iter().any(|b| *b != 0));

        if !seal_path.is_file() {
            return if recorded.is_some() || has_unsealed_resources(bundle, flags)? {
                Err(CodeSignError::ResourceRulesInvalid(
                    "missing resource envelope".into(),
                ))
            } else {
                debug!("bundle has no resources to validate");
                Ok(ResourceCounts::default())
            };
        }

        let seal_data = std::fs::read(&seal_path)?;

        for directory in directories {
            let recorded = directory
                .special_hashes
                .get(&CodeSigningSlot::ResourceDir)
                .filter(|d| d.iter().any(|b| *b != 0))
                .ok_or_else(|| {
                    CodeSignError::SpecialSlotMismatch(u32::from(CodeSigningSlot::ResourceDir))
                })?;

            if !directory
                .digest_type
                .digest_data(&seal_data)?
                .starts_with(recorded)
            {
                return Err(CodeSignError::SpecialSlotMismatch(u32::from(
                    CodeSigningSlot::ResourceDir,
                )));
            }
        }

        let resources = CodeResources::from_xml(&seal_data)?;

        let (mut rules, files, v2) = if let Some(rules) = resources.compile_rules2()? {
            (rules, &resources.files2, true)
        } else if let Some(rules) = resources.compile_rules()? {
            if flags.strict {
                return Err(CodeSignError::WeakResourceEnvelope);
            }
            warn!("resource envelope is version 1 only");
            (rules, &resources.files, false)
        } else {
            return Err(CodeSignError::ResourceRulesInvalid(
                "resource envelope has no rules".into(),
            ));
        };

        if flags.strict {
            check_rule_strength(&rules, &bundle.main_executable)?;
        }

        rules.add_signer_exclusions(Some(&bundle.main_executable))?;

        let pool = LimitedAsync::for_path(&bundle.resource_root, flags.single_threaded)
            .with_cancellation(flags.cancellation.clone());

        let mut seen = BTreeSet::new();
        let mut problems: Vec<(usize, ResourceProblem)> = vec![];
        let mut counts = ResourceCounts {
            sealed: files.len(),
            ..Default::default()
        };
        let mut sequence = 0;

        let hashed = pool.run(
            |submit| {
                rules.scan(&bundle.resource_root, &flags.scan_options(), |entry, rule| {
                    flags.cancellation.check()?;

                    let seq = sequence;
                    sequence += 1;

                    let seal = match files.get(&entry.relative_path) {
                        Some(seal) => seal,
                        // Legacy rules only claim the paths they match.
                        None => {
                            if v2 || rule.is_some() {
                                problems.push((
                                    seq,
                                    problem(ProblemKind::Added, &entry.relative_path, None),
                                ));
                            }
                            return Ok(());
                        }
                    };

                    seen.insert(entry.relative_path.clone());
                    counts.checked += 1;

                    match (&entry.kind, seal) {
                        (EntryKind::File, ResourceSeal::File { .. }) => submit(FileJob {
                            seq,
                            path: entry.path,
                            relative_path: entry.relative_path,
                            seal: seal.clone(),
                        }),
                        // Legacy seals digest the symlink target's content.
                        (EntryKind::Symlink(_), ResourceSeal::File { .. }) if !v2 => {
                            submit(FileJob {
                                seq,
                                path: entry.path,
                                relative_path: entry.relative_path,
                                seal: seal.clone(),
                            })
                        }
                        (EntryKind::Symlink(target), ResourceSeal::Symlink { target: sealed, .. }) => {
                            if target != sealed {
                                problems.push((
                                    seq,
                                    problem(
                                        ProblemKind::Altered,
                                        &entry.relative_path,
                                        Some(format!("symlink target {} != {}", target, sealed)),
                                    ),
                                ));
                            }
                            Ok(())
                        }
                        (
                            EntryKind::NestedBundle,
                            ResourceSeal::Nested {
                                cdhash,
                                requirement,
                                ..
                            },
                        ) => {
                            info!("validating nested code {}", entry.relative_path);
                            counts.nested += 1;

                            match self.validate_nested(&entry.path, cdhash, requirement, flags) {
                                Ok(()) => Ok(()),
                                Err(e)
                                    if matches!(
                                        e.kind(),
                                        ErrorKind::Revoked | ErrorKind::Cancelled
                                    ) =>
                                {
                                    Err(e)
                                }
                                Err(e) => {
                                    problems.push((
                                        seq,
                                        problem(
                                            ProblemKind::BadNestedCode,
                                            &entry.relative_path,
                                            Some(e.to_string()),
                                        ),
                                    ));
                                    Ok(())
                                }
                            }
                        }
                        (kind, seal) => {
                            problems.push((
                                seq,
                                problem(
                                    ProblemKind::BadKind,
                                    &entry.relative_path,
                                    Some(format!("found {:?}; sealed as {:?}", kind, seal)),
                                ),
                            ));
                            Ok(())
                        }
                    }
                })
            },
            |job: FileJob| {
                let digests = match hash_file(&job.path, &job.seal.digest_types()) {
                    Ok(digests) => digests,
                    Err(CodeSignError::Io(e)) => {
                        return Ok((
                            job.seq,
                            Some(problem(
                                ProblemKind::Altered,
                                &job.relative_path,
                                Some(format!("unreadable: {}", e)),
                            )),
                        ));
                    }
                    Err(e) => return Err(e),
                };

                if job.seal.matches_digests(&digests) {
                    Ok((job.seq, None))
                } else {
                    Ok((
                        job.seq,
                        Some(problem(ProblemKind::Altered, &job.relative_path, None)),
                    ))
                }
            },
        )?;

        problems.extend(
            hashed
                .into_iter()
                .filter_map(|(seq, problem)| problem.map(|p| (seq, p))),
        );
        problems.sort_by_key(|(seq, _)| *seq);

        let mut context = CollectingContext::with_legacy_sc_info_tolerance(flags.legacy_sc_info_tolerance);

        for (_, problem) in problems {
            context.report_problem(problem);
        }

        for (path, seal) in files {
            if !seen.contains(path) && !seal.is_optional() {
                context.report_problem(problem(ProblemKind::Missing, path, None));
            }
        }

        for problem in context.problems() {
            warn!("{} {}", problem.kind, problem.path);
        }
        context.finish()?;

        info!(
            "{} of {} sealed resources verified ({} nested)",
            counts.checked, counts.sealed, counts.nested
        );

        Ok(counts)
    }

    fn validate_nested(
        &self,
        path: &Path,
        sealed_cdhash: &[u8],
        requirement: &str,
        flags: &ValidationFlags,
    ) -> Result<(), CodeSignError> {
        let requirement = parse_requirement_expression(requirement)?;

        let mut nested = StaticCode::open(path)?.with_trust_evaluator(self.trust.clone());
        let report = nested.validate(flags, Some(&requirement))?;

        let cdhash = report
            .architectures
            .first()
            .map(|a| a.cdhash.as_slice())
            .unwrap_or_default();

        if cdhash != sealed_cdhash {
            return Err(CodeSignError::BadNestedCode {
                path: path.display().to_string(),
                reason: format!(
                    "cdhash {} does not match sealed {}",
                    hex::encode(cdhash),
                    hex::encode(sealed_cdhash)
                ),
            });
        }

        Ok(())
    }

    /// The cdhashes of the first validated architecture.
    ///
    /// One hash per code directory, sorted by digest type id.
    pub fn cd_hashes(
        &mut self,
        flags: &ValidationFlags,
    ) -> Result<Vec<(DigestType, Vec<u8>)>, CodeSignError> {
        let directories = self.directories(flags)?;

        Ok(directories
            .first()
            .map(|d| d.cd_hashes.clone())
            .unwrap_or_default())
    }

    /// The designated requirement.
    ///
    /// This is the explicit requirement if the signature has one. Otherwise
    /// it is derived: from the certificate chain for signed code and from the
    /// cdhashes for ad-hoc signed code.
    pub fn designated_requirement(
        &mut self,
        flags: &ValidationFlags,
    ) -> Result<CodeRequirementExpression<'static>, CodeSignError> {
        let directories = self.directories(flags)?;
        designated_requirement_of(&directories)
    }

    /// Facts the code is evaluated against in requirements.
    pub fn requirement_context(
        &mut self,
        flags: &ValidationFlags,
    ) -> Result<RequirementContext, CodeSignError> {
        let directories = self.directories(flags)?;
        self.context_of(&directories)
    }

    fn context_of(&self, directories: &[ArchDirectory]) -> Result<RequirementContext, CodeSignError> {
        let first = directories
            .first()
            .ok_or_else(|| CodeSignError::InternalError("no validated architecture".into()))?;

        let info_plist = match &self.bundle {
            Some(bundle) => plist::Value::from_file(&bundle.info_plist)?.into_dictionary(),
            None => None,
        };

        Ok(RequirementContext {
            identifier: Some(first.identifier.clone()),
            cdhashes: directories
                .iter()
                .flat_map(|d| d.cd_hashes.iter().map(|(_, h)| h.clone()))
                .collect(),
            info_plist,
            entitlements: first.entitlements.clone(),
            certificates: first
                .cms
                .as_ref()
                .map(|c| c.certificates.clone())
                .unwrap_or_default(),
            anchor_apple: first.trust.anchor_apple,
            anchor_trusted: first.trust.anchor_trusted,
            platform: (first.platform != 0).then(|| first.platform as u32),
        })
    }

    /// Run every applicable validation stage.
    ///
    /// When `requirement` is given, the code must also satisfy it.
    pub fn validate(
        &mut self,
        flags: &ValidationFlags,
        requirement: Option<&CodeRequirementExpression>,
    ) -> Result<ValidationReport, CodeSignError> {
        let directories = self.directories(flags)?;

        if flags.check_top_directory || flags.strict {
            self.validate_top_directory(flags)?;
        }

        if flags.check_executable {
            self.validate_executable(flags)?;
        }

        let resources = if flags.check_resources && self.bundle.is_some() {
            Some(self.validate_resources(flags)?)
        } else {
            None
        };

        if let Some(requirement) = requirement {
            let context = self.context_of(&directories)?;

            if !requirement.evaluate(&context) {
                return Err(CodeSignError::RequirementFailed(requirement.to_string()));
            }
            debug!("code satisfies requirement {}", requirement);
        }

        let architectures = directories.iter().map(|d| d.report()).collect::<Vec<_>>();
        let first = architectures
            .first()
            .ok_or_else(|| CodeSignError::InternalError("no validated architecture".into()))?;

        Ok(ValidationReport {
            path: self.path.clone(),
            identifier: first.identifier.clone(),
            team_id: first.team_id.clone(),
            flags: first.flags,
            cd_hashes: first.cd_hashes.clone(),
            digest_type: first.digest_type,
            signing_time: first.timestamp.or(first.signing_time),
            resources,
            architectures,
        })
    }

    /// The seal a parent bundle records for this code.
    pub fn nested_seal(&mut self, flags: &ValidationFlags) -> Result<NestedSeal, CodeSignError> {
        let directories = self.directories(flags)?;

        let cdhash = directories
            .first()
            .map(|d| d.cdhash.clone())
            .ok_or_else(|| CodeSignError::InternalError("no validated architecture".into()))?;

        Ok(NestedSeal {
            cdhash,
            requirement: designated_requirement_of(&directories)?.to_string(),
        })
    }
}

/// A file whose digests are checked on the pool.
struct FileJob {
    seq: usize,
    path: PathBuf,
    relative_path: String,
    seal: ResourceSeal,
}

fn problem(kind: ProblemKind, path: &str, detail: Option<String>) -> ResourceProblem {
    ResourceProblem {
        kind,
        path: path.to_string(),
        detail,
    }
}

/// Whether a bundle without a seal has anything that should have been sealed.
fn has_unsealed_resources(bundle: &BundleLayout, flags: &ValidationFlags) -> Result<bool, CodeSignError> {
    let resources_dir = bundle.resource_root.join("Resources").is_dir();
    let mut rules = RuleSet::default_v2(resources_dir)?;
    rules.add_signer_exclusions(Some(&bundle.main_executable))?;

    let mut found = false;
    rules.scan(&bundle.resource_root, &flags.scan_options(), |entry, _| {
        debug!("unsealed resource {}", entry.relative_path);
        found = true;
        Ok(())
    })?;

    Ok(found)
}

/// Reject version 2 rules that omit executable code from the seal.
fn check_rule_strength(rules: &RuleSet, main_executable: &str) -> Result<(), CodeSignError> {
    for path in std::iter::once(main_executable).chain(EXECUTABLE_SAMPLE_PATHS.iter().copied()) {
        if let Some(rule) = rules.find_rule(path) {
            if rule.is_omitted() {
                return Err(CodeSignError::WeakResourceRules(format!(
                    "rule {} omits {}",
                    rule.pattern, path
                )));
            }
        }
    }

    Ok(())
}

fn designated_requirement_of(
    directories: &[ArchDirectory],
) -> Result<CodeRequirementExpression<'static>, CodeSignError> {
    let first = directories
        .first()
        .ok_or_else(|| CodeSignError::InternalError("no validated architecture".into()))?;

    if let Some(explicit) = first.designated.as_ref().and_then(|r| r.first()) {
        return Ok(explicit.clone());
    }

    match &first.cms {
        Some(cms) if !first.flags.contains(CodeSignatureFlags::ADHOC) => {
            certificate_designated_requirement(
                &first.identifier,
                first.team_id.as_deref(),
                &cms.certificates,
            )
        }
        _ => adhoc_designated_requirement(
            &directories.iter().map(|d| d.cdhash.clone()).collect::<Vec<_>>(),
        ),
    }
}

/// Compute the seal of signed Mach-O data without validating it.
///
/// Used when sealing freshly signed nested code. The cdhash is that of the
/// strongest code directory of the first architecture.
pub fn nested_seal_for_macho(data: &[u8]) -> Result<NestedSeal, CodeSignError> {
    let mut cdhashes = vec![];
    let mut explicit = None;

    for slice in parse_slices(data)? {
        let sig = slice
            .macho
            .code_signature()?
            .ok_or_else(|| CodeSignError::Unsigned(PathBuf::new()))?;

        let mut set = CodeDirectorySet::default();
        for entry in sig.blobs.iter().filter(|b| b.slot.is_code_directory()) {
            if let BlobData::CodeDirectory(cd) = BlobData::from_blob_bytes(entry.data)? {
                set.insert_with_data(*cd, entry.data.to_vec())?;
            }
        }

        let (best, data) = match (set.best(), set.best_data()) {
            (Some(best), Some(data)) => (best, data),
            _ => return Err(CodeSignError::SignatureInvalid("no usable code directory".into())),
        };
        cdhashes.push(cdhash(data, best.hash_type)?);

        if explicit.is_none() {
            if let Some(reqs) = sig.code_requirements()? {
                if let Some(blob) = reqs.requirements.get(&RequirementType::Designated) {
                    explicit = blob.parse_expressions()?.first().map(|e| e.to_owned());
                }
            }
        }
    }

    let cdhash = cdhashes
        .first()
        .cloned()
        .ok_or_else(|| CodeSignError::InvalidBinary("no Mach-O slices".into()))?;

    let requirement = match explicit {
        Some(requirement) => requirement,
        None => adhoc_designated_requirement(&cdhashes)?,
    };

    Ok(NestedSeal {
        cdhash,
        requirement: requirement.to_string(),
    })
}
