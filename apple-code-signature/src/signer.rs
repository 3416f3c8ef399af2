// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! High level signing primitives.

[Signer] signs Mach-O binaries (thin or universal) and bundles.

Mach-O signing happens in two passes over the architectures of a binary.
The first pass resolves signing parameters and estimates the size of each
signature. Space is then reserved in the binary via an [ArchEditor]. The
second pass builds code directories against the rewritten binary and places
the signatures. Nothing is written to disk until the editor commits.

Bundles are signed inside out: nested code is signed as it is encountered
while sealing resources, then the resource seal is written, then the main
executable is signed over the seal.
*/

use {
    crate::{
        code_directory::{
            CodeDirectoryBuilder, CodeSignatureFlags, ExecutableSegmentFlags,
        },
        code_requirement::{certificate_designated_requirement, merge_internal_requirements, CodeRequirements},
        code_resources::{NestedSeal, ResourceSealer, CODE_RESOURCES_PATH},
        cms::resolve_team_id,
        digest::DigestType,
        editor::{write_atomic, ArchEditor, BlobEditor, MachOEditor},
        embedded_signature::{
            BlobData, CodeSigningSlot, EntitlementsBlob, EntitlementsDerBlob,
        },
        embedded_signature_builder::EmbeddedSignatureBuilder,
        entitlements::plist_to_executable_segment_flags,
        error::CodeSignError,
        macho::{
            find_macho_targeting, parse_slices, semver_to_macho_target_version, MachOSignable,
            MachOSlice,
        },
        macho_allocate::SIGNATURE_ALIGNMENT,
        pool::LimitedAsync,
        resource_rules::{RuleSet, ScanOptions},
        signing_settings::{SettingsScope, SigningSettings},
        static_code::{nested_seal_for_macho, BundleLayout},
    },
    apple_bundles::DirectoryBundle,
    log::{debug, info, warn},
    std::path::Path,
};

/// Round up to a multiple of 1 KiB, then add 1 KiB of slack.
fn pad_signature_size(size: usize) -> usize {
    (size + 1023) / 1024 * 1024 + 1024
}

/// Signing parameters of one architecture, resolved before layout.
struct SlicePlan {
    index: usize,
    cputype: u32,
    settings: SigningSettings,
    identifier: String,
    team_id: Option<String>,
    flags: CodeSignatureFlags,
    runtime: Option<u32>,
    exec_seg_flags: ExecutableSegmentFlags,
}

impl SlicePlan {
    fn new(
        settings: &SigningSettings,
        slice: &MachOSlice,
        recommended_identifier: &str,
    ) -> Result<Self, CodeSignError> {
        slice.macho.check_signing_capability()?;

        let settings = settings.as_nested_macho_settings(slice.index, slice.cputype);
        let identity = settings.signing_identity();

        let identifier = resolve_identifier(&settings, recommended_identifier, slice)?;

        let team_id = resolve_team_id(
            settings.team_id(SettingsScope::Main),
            identity.and_then(|identity| identity.team_id()).as_deref(),
        )?;

        let mut flags = settings
            .code_signature_flags(SettingsScope::Main)
            .unwrap_or_else(CodeSignatureFlags::empty);

        if identity.is_none() {
            info!("creating ad-hoc signature");
            flags |= CodeSignatureFlags::ADHOC;
        } else if flags.contains(CodeSignatureFlags::ADHOC) {
            info!("removing ad-hoc code signature flag");
            flags -= CodeSignatureFlags::ADHOC;
        }

        if flags.contains(CodeSignatureFlags::LINKER_SIGNED) {
            info!("removing linker signed flag from code signature (we're not a linker)");
            flags -= CodeSignatureFlags::LINKER_SIGNED;
        }

        let runtime = match settings.runtime_version(SettingsScope::Main) {
            Some(version) => {
                info!("using hardened runtime version {}", version);
                Some(semver_to_macho_target_version(version))
            }
            None if flags.contains(CodeSignatureFlags::RUNTIME) => {
                match find_macho_targeting(slice.data, &slice.macho)? {
                    Some(target) => {
                        info!(
                            "using hardened runtime version {} derived from SDK version",
                            target.sdk_version
                        );
                        Some(semver_to_macho_target_version(&target.sdk_version))
                    }
                    None => {
                        warn!("hardened runtime version required but unable to derive suitable version; signature will likely fail Apple checks");
                        None
                    }
                }
            }
            None => None,
        };

        let mut exec_seg_flags = settings
            .executable_segment_flags(SettingsScope::Main)
            .unwrap_or_else(ExecutableSegmentFlags::empty);

        if slice.macho.is_main_executable() {
            exec_seg_flags |= ExecutableSegmentFlags::MAIN_BINARY;
        }

        if let Some(entitlements) = settings.entitlements_plist(SettingsScope::Main) {
            let implied = plist_to_executable_segment_flags(entitlements);
            if !implied.is_empty() {
                info!("entitlements imply executable segment flags: {:?}", implied);
                exec_seg_flags |= implied;
            }
        }

        Ok(Self {
            index: slice.index,
            cputype: slice.cputype,
            identifier,
            team_id,
            flags,
            runtime,
            exec_seg_flags,
            settings,
        })
    }

    /// Blobs registered ahead of the code directories.
    fn special_blobs(&self) -> Result<Vec<(CodeSigningSlot, BlobData<'static>)>, CodeSignError> {
        let mut res = vec![];

        let explicit = self
            .settings
            .requirements(SettingsScope::Main)
            .map(|source| source.to_requirement_set())
            .transpose()?;

        let derived = match self.settings.signing_identity() {
            Some(identity) => Some(CodeRequirements::from(vec![
                certificate_designated_requirement(
                    &self.identifier,
                    self.team_id.as_deref(),
                    identity.certificates(),
                )?,
            ])),
            None => None,
        };

        let requirements = merge_internal_requirements(explicit.as_ref(), None, derived.as_ref())?;
        if !requirements.is_empty() {
            debug!("adding internal requirements");
            res.push((
                CodeSigningSlot::RequirementSet,
                BlobData::RequirementSet(Box::new(requirements)),
            ));
        }

        if let Some(xml) = self.settings.entitlements_xml(SettingsScope::Main)? {
            debug!("adding entitlements XML");
            res.push((
                CodeSigningSlot::Entitlements,
                BlobData::Entitlements(Box::new(EntitlementsBlob::from_string(&xml))),
            ));
        }

        if let Some(value) = self.settings.entitlements_plist(SettingsScope::Main) {
            debug!("adding entitlements DER");
            res.push((
                CodeSigningSlot::EntitlementsDer,
                BlobData::EntitlementsDer(Box::new(EntitlementsDerBlob::from_plist(value)?)),
            ));
        }

        Ok(res)
    }

    fn code_directory_builder(&self, slice: &MachOSlice) -> Result<CodeDirectoryBuilder, CodeSignError> {
        let (base, limit) = slice.macho.executable_segment_range()?;

        let mut builder = CodeDirectoryBuilder::new(&self.identifier)
            .team_id(self.team_id.clone())
            .flags(self.flags)
            .page_size(
                self.settings
                    .page_size()
                    .unwrap_or(CodeDirectoryBuilder::DEFAULT_PAGE_SIZE),
            )?
            .executable_segment(base, limit, self.exec_seg_flags)
            .runtime(self.runtime);

        // These components live outside the signature; only their digests do.
        if let Some(data) = self.settings.info_plist_data(SettingsScope::Main) {
            builder.add_special_component(CodeSigningSlot::Info, data.to_vec())?;
        }
        if let Some(data) = self.settings.code_resources_data(SettingsScope::Main) {
            builder.add_special_component(CodeSigningSlot::ResourceDir, data.to_vec())?;
        }

        Ok(builder)
    }

    /// Upper bound of the signature size of this architecture.
    fn estimate_size(&self, slice: &MachOSlice) -> Result<u32, CodeSignError> {
        let mut builder = self.code_directory_builder(slice)?;

        // Signature slot.
        let mut blob_count = 1;
        let mut size = 0;

        for (slot, blob) in self.special_blobs()? {
            let data = blob.to_blob_bytes()?;
            size += data.len();
            builder.add_special_component(slot, data)?;
            blob_count += 1;
        }

        let digests = self.settings.digest_types();

        if self.settings.top_directory() {
            builder.add_special_component(CodeSigningSlot::TOP_DIRECTORY, vec![])?;
            // Header plus one id per slot, bounded by every possible slot.
            size += 8 + 4 * (CodeSigningSlot::MAX_SPECIAL as usize + digests.len() + 1);
            blob_count += 1;
        }

        // Allocation may grow the code limit up to the signature alignment.
        let code_limit = slice.macho.code_limit_binary_offset()? + SIGNATURE_ALIGNMENT;

        for digest in &digests {
            size += builder.estimate_size(*digest, code_limit)?;
            blob_count += 1;
        }

        size += 8 + self
            .settings
            .signing_identity()
            .map(|identity| identity.estimate_size())
            .unwrap_or(0);

        size += 12 + 8 * blob_count;

        u32::try_from(pad_signature_size(size))
            .map_err(|_| CodeSignError::ArithmeticOverflow("signature size estimate"))
    }

    /// Produce the signature SuperBlob against the final binary layout.
    fn create_superblob(&self, slice: &MachOSlice) -> Result<Vec<u8>, CodeSignError> {
        let mut builder =
            EmbeddedSignatureBuilder::default().with_top_directory(self.settings.top_directory());

        for (slot, blob) in self.special_blobs()? {
            builder.add_blob(slot, blob)?;
        }

        let code = slice.code_data()?;
        builder.add_code_directories(
            self.code_directory_builder(slice)?,
            code,
            &self.settings.digest_types(),
        )?;

        match self.settings.signing_identity() {
            Some(identity) => {
                builder.create_cms_signature(identity.as_ref(), self.settings.signing_time())?
            }
            None => builder.add_adhoc_signature()?,
        }

        builder.create_superblob()
    }
}

/// Resolve the identifier of one architecture.
///
/// An explicit identifier (including one carried over from an existing
/// signature) wins. Otherwise the recommended identifier is used, prefixed
/// when it has no dot. Ad-hoc signing additionally appends a suffix derived
/// from the binary's identification data when there is still no dot.
fn resolve_identifier(
    settings: &SigningSettings,
    recommended: &str,
    slice: &MachOSlice,
) -> Result<String, CodeSignError> {
    if let Some(identifier) = settings.binary_identifier(SettingsScope::Main) {
        return Ok(identifier.to_string());
    }

    let mut identifier = recommended.to_string();

    if identifier.is_empty() {
        return Err(CodeSignError::NoIdentifier);
    }

    if !identifier.contains('.') {
        if let Some(prefix) = settings.identifier_prefix() {
            identifier = format!("{}.{}", prefix.trim_end_matches('.'), identifier);
        }
    }

    if !identifier.contains('.') && settings.signing_identity().is_none() {
        let digest = DigestType::Sha1.digest_data(&slice.identification()?)?;
        identifier = format!("{}-{}", identifier, hex::encode(digest));
    }

    info!("using binary identifier {}", identifier);

    Ok(identifier)
}

/// Drive an editing session over every architecture.
fn run_editor(
    editor: &mut dyn ArchEditor,
    slices: &[MachOSlice],
    plans: &[SlicePlan],
    dry_run: bool,
) -> Result<(), CodeSignError> {
    for (slice, plan) in slices.iter().zip(plans) {
        let size = plan.estimate_size(slice)?;
        debug!(
            "reserving {} bytes for signature of architecture {} (CPU type {})",
            size, plan.index, plan.cputype
        );
        editor.set_size(plan.index, size)?;
    }

    editor.allocate()?;

    for plan in plans {
        info!("signing Mach-O binary at index {}", plan.index);

        let blob = {
            let slice = editor.reset(plan.index)?;
            plan.create_superblob(&slice)?
        };

        info!("total signature size: {} bytes", blob.len());
        editor.write(plan.index, &blob)?;
    }

    if dry_run {
        warn!("dry run; not writing results");
        Ok(())
    } else {
        editor.commit()
    }
}

fn is_same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Copy a directory tree, preserving symlinks.
fn copy_tree(source: &Path, dest: &Path) -> Result<(), CodeSignError> {
    info!("copying {} to {}", source.display(), dest.display());

    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(source).map_err(|_| {
            CodeSignError::InternalError(format!(
                "{} is outside {}",
                entry.path().display(),
                source.display()
            ))
        })?;
        let dest_path = dest.join(rel);

        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&dest_path)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            if dest_path.symlink_metadata().is_ok() {
                std::fs::remove_file(&dest_path)?;
            }

            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &dest_path)?;
            #[cfg(not(unix))]
            {
                let _ = target;
                return Err(CodeSignError::Unsupported("copying symlinks on this platform"));
            }
        } else {
            std::fs::copy(entry.path(), &dest_path)?;
        }
    }

    Ok(())
}

/// An entity for performing signing that is able to handle all supported target types.
#[derive(Clone, Debug)]
pub struct Signer {
    settings: SigningSettings,
}

impl Signer {
    /// Construct a new instance bound to a [SigningSettings].
    pub fn new(settings: SigningSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SigningSettings {
        &self.settings
    }

    /// Signs `input_path` and writes the signed output to `output_path`.
    ///
    /// Directories are signed as bundles, files as Mach-O binaries. With
    /// detached signing, `output_path` receives the detached signature and
    /// the binary is left untouched.
    pub fn sign_path(
        &self,
        input_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> Result<(), CodeSignError> {
        let input_path = input_path.as_ref();
        let output_path = output_path.as_ref();

        if input_path.is_dir() {
            self.sign_bundle(input_path, output_path)?;
        } else {
            self.sign_macho(input_path, output_path)?;
        }

        Ok(())
    }

    /// Sign a filesystem path in place.
    pub fn sign_path_in_place(&self, path: impl AsRef<Path>) -> Result<(), CodeSignError> {
        let path = path.as_ref();

        self.sign_path(path, path)
    }

    /// Sign a Mach-O binary.
    ///
    /// Returns the signed binary, or the detached signature when signing
    /// detached.
    pub fn sign_macho(
        &self,
        input_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> Result<Vec<u8>, CodeSignError> {
        let input_path = input_path.as_ref();
        let output_path = output_path.as_ref();

        let recommended = input_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or(CodeSignError::NoIdentifier)?;

        info!("signing {} as a Mach-O binary", input_path.display());
        sign_macho_with(&self.settings, input_path, output_path, &recommended)
    }

    /// Sign a bundle.
    ///
    /// When `output_path` differs from `input_path`, the bundle is copied
    /// there first and the copy is signed.
    pub fn sign_bundle(
        &self,
        input_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> Result<NestedSeal, CodeSignError> {
        let input_path = input_path.as_ref();
        let output_path = output_path.as_ref();

        if self.settings.detached() {
            return Err(CodeSignError::Unsupported("detached signing of bundles"));
        }

        let root = if self.settings.dry_run() || is_same_path(input_path, output_path) {
            input_path
        } else {
            copy_tree(input_path, output_path)?;
            output_path
        };

        info!("signing bundle at {}", root.display());
        sign_bundle_at(&self.settings, root)
    }
}

fn sign_macho_with(
    settings: &SigningSettings,
    input_path: &Path,
    output_path: &Path,
    recommended_identifier: &str,
) -> Result<Vec<u8>, CodeSignError> {
    let data = std::fs::read(input_path)?;

    let mut settings = settings.clone();
    settings.import_settings_from_macho(&data)?;

    let slices = parse_slices(&data)?;

    let plans = slices
        .iter()
        .map(|slice| SlicePlan::new(&settings, slice, recommended_identifier))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(first) = plans.first() {
        for plan in &plans[1..] {
            if plan.team_id != first.team_id {
                return Err(CodeSignError::TeamIdentifierMismatch(
                    first.team_id.clone().unwrap_or_default(),
                    plan.team_id.clone().unwrap_or_default(),
                ));
            }
        }
    }

    if settings.detached() {
        if is_same_path(input_path, output_path) {
            return Err(CodeSignError::Unsupported(
                "detached signature would overwrite the binary",
            ));
        }

        let mut editor = BlobEditor::new(data.clone(), Some(output_path.to_path_buf()))?;
        run_editor(&mut editor, &slices, &plans, settings.dry_run())?;

        Ok(editor.signature().map(|s| s.to_vec()).unwrap_or_default())
    } else {
        let mut editor = MachOEditor::from_data(input_path, output_path, data.clone())?;
        run_editor(&mut editor, &slices, &plans, settings.dry_run())?;

        Ok(editor.data().to_vec())
    }
}

/// Sign the bundle at `root` in place, returning its seal.
fn sign_bundle_at(settings: &SigningSettings, root: &Path) -> Result<NestedSeal, CodeSignError> {
    let bundle = DirectoryBundle::new_from_path(root).map_err(CodeSignError::DirectoryBundle)?;

    let resource_root = if bundle.shallow() {
        root.to_path_buf()
    } else {
        root.join("Contents")
    };

    let main_exe = bundle
        .main_executable()
        .map_err(CodeSignError::DirectoryBundle)?
        .ok_or_else(|| CodeSignError::BundleNoMainExecutable(root.to_path_buf()))?;

    let (main_exe_path, main_exe_rel) = if bundle.shallow() {
        (resource_root.join(&main_exe), main_exe.clone())
    } else {
        (
            resource_root.join("MacOS").join(&main_exe),
            format!("MacOS/{}", main_exe),
        )
    };

    if !main_exe_path.is_file() {
        return Err(CodeSignError::BundleNoMainExecutable(main_exe_path));
    }

    let resources_dir = resource_root.join("Resources").is_dir();

    let mut rules2 = match settings.resource_rules() {
        Some(dict) => RuleSet::compile(dict)?,
        None => RuleSet::default_v2(resources_dir)?,
    };
    rules2.add_signer_exclusions(Some(&main_exe_rel))?;

    let mut sealer = ResourceSealer::new(rules2)
        .with_pool(LimitedAsync::for_path(&resource_root, settings.single_threaded()))
        .with_scan_options(ScanOptions::default());

    if settings.seal_v1() {
        let mut rules = RuleSet::default_v1(resources_dir)?;
        rules.add_signer_exclusions(Some(&main_exe_rel))?;
        sealer = sealer.with_v1_rules(rules);
    }

    let bundle_prefix = if bundle.shallow() { "" } else { "Contents/" };

    let resources = sealer.seal(&resource_root, |entry| {
        let rel = format!("{}{}", bundle_prefix, entry.relative_path);
        info!("entering nested bundle {}", entry.path.display());

        let seal = sign_bundle_at(&settings.as_nested_bundle_settings(&rel), &entry.path)?;

        info!("leaving nested bundle {}", entry.path.display());
        Ok(seal)
    })?;

    let resources_data = resources.to_xml()?;
    let resources_path = resource_root.join(CODE_RESOURCES_PATH);

    let main_exe_bundle_rel = format!("{}{}", bundle_prefix, main_exe_rel);
    let mut exe_settings = settings.as_bundle_macho_settings(&main_exe_bundle_rel);

    exe_settings.set_info_plist_data(
        SettingsScope::Main,
        std::fs::read(bundle.info_plist_path())?,
    );
    exe_settings.set_code_resources_data(SettingsScope::Main, resources_data.clone());

    let recommended = bundle
        .identifier()
        .map_err(CodeSignError::DirectoryBundle)?
        .unwrap_or_else(|| main_exe.clone());

    info!("signing main executable {}", main_exe_rel);
    let signed = sign_macho_with(&exe_settings, &main_exe_path, &main_exe_path, &recommended)?;

    // The seal lands only once the executable binding it has been written.
    if settings.dry_run() {
        info!("dry run; not writing {}", resources_path.display());
    } else {
        info!("writing sealed resources to {}", resources_path.display());
        if let Some(parent) = resources_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&resources_path, &resources_data, None)?;
    }

    nested_seal_for_macho(&signed)
}

/// Remove the embedded signature of a Mach-O binary or bundle.
///
/// For bundles, the main executable's signature and the resource seal are
/// removed.
pub fn remove_signature(path: impl AsRef<Path>) -> Result<(), CodeSignError> {
    let path = path.as_ref();

    if path.is_dir() {
        let layout = BundleLayout::resolve(path)?;
        let exe_path = layout.main_executable_path();
        let resource_root = layout.resource_root;

        remove_macho_signature(&exe_path)?;

        let signature_dir = resource_root.join("_CodeSignature");
        if signature_dir.is_dir() {
            info!("removing {}", signature_dir.display());
            std::fs::remove_dir_all(signature_dir)?;
        }

        Ok(())
    } else {
        remove_macho_signature(path)
    }
}

fn remove_macho_signature(path: &Path) -> Result<(), CodeSignError> {
    info!("removing signature from {}", path.display());

    let mut editor = MachOEditor::new(path, path)?;

    let indices = editor
        .architectures()
        .iter()
        .map(|arch| arch.index)
        .collect::<Vec<_>>();
    for index in indices {
        editor.set_size(index, 0)?;
    }

    editor.allocate()?;
    editor.commit()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            cms::CmsSigningIdentity,
            code_resources::{CodeResources, ResourceSeal},
            embedded_signature::EmbeddedSignature,
            testutil::{fat_binary, self_signed_certificate, MachOBuilder},
        },
        std::{path::PathBuf, sync::Arc},
    };

    fn write_binary(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf, CodeSignError> {
        let path = dir.join(name);
        std::fs::write(&path, data)?;
        Ok(path)
    }

    #[test]
    fn adhoc_identifier_suffix() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let uuid = [7u8; 16];
        let path = write_binary(
            temp.path(),
            "tool",
            &MachOBuilder {
                uuid: Some(uuid),
                ..Default::default()
            }
            .build(),
        )?;

        Signer::new(SigningSettings::default()).sign_path_in_place(&path)?;

        let data = std::fs::read(&path)?;
        let slices = parse_slices(&data)?;
        let sig = slices[0].macho.code_signature()?.unwrap();
        let cd = sig.code_directory()?.unwrap();

        let mut identification = b"UUID".to_vec();
        identification.extend_from_slice(&uuid);
        let expected = format!(
            "tool-{}",
            hex::encode(DigestType::Sha1.digest_data(&identification)?)
        );

        assert_eq!(cd.ident, expected);
        assert!(cd.flags.contains(CodeSignatureFlags::ADHOC));
        assert!(cd.team_name.is_none());
        assert_eq!(cd.hash_type, DigestType::Sha256);
        assert!(cd.special_hashes.is_empty());
        assert!(sig.code_requirements()?.is_none());
        assert_eq!(sig.signature_data()?, Some(&[][..]));

        Ok(())
    }

    #[test]
    fn identifier_prefix_and_explicit() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let path = write_binary(temp.path(), "tool", &MachOBuilder::default().build())?;

        let mut settings = SigningSettings::default();
        settings.set_identifier_prefix("com.example.");
        Signer::new(settings).sign_path_in_place(&path)?;

        let data = std::fs::read(&path)?;
        let slices = parse_slices(&data)?;
        let cd = slices[0]
            .macho
            .code_signature()?
            .unwrap()
            .code_directory()?
            .unwrap()
            .to_owned();
        assert_eq!(cd.ident, "com.example.tool");

        // Re-signing inherits the identifier.
        Signer::new(SigningSettings::default()).sign_path_in_place(&path)?;
        let data = std::fs::read(&path)?;
        let slices = parse_slices(&data)?;
        let cd = slices[0]
            .macho
            .code_signature()?
            .unwrap()
            .code_directory()?
            .unwrap()
            .to_owned();
        assert_eq!(cd.ident, "com.example.tool");

        // An explicit identifier wins over the inherited one.
        let mut settings = SigningSettings::default();
        settings.set_binary_identifier(SettingsScope::Main, "org.other");
        Signer::new(settings).sign_path_in_place(&path)?;
        let data = std::fs::read(&path)?;
        let slices = parse_slices(&data)?;
        let cd = slices[0]
            .macho
            .code_signature()?
            .unwrap()
            .code_directory()?
            .unwrap()
            .to_owned();
        assert_eq!(cd.ident, "org.other");

        Ok(())
    }

    #[test]
    fn certificate_signing() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let path = write_binary(temp.path(), "tool", &MachOBuilder::default().build())?;

        let (cert, key) = self_signed_certificate("TEAM123456");
        let mut settings = SigningSettings::default();
        settings.set_signing_identity(Arc::new(CmsSigningIdentity::new(key, cert)));
        settings.set_binary_identifier(SettingsScope::Main, "com.example.tool");
        settings.set_digest_types([DigestType::Sha1, DigestType::Sha256]);

        Signer::new(settings).sign_path_in_place(&path)?;

        let data = std::fs::read(&path)?;
        let slices = parse_slices(&data)?;
        let sig = slices[0].macho.code_signature()?.unwrap();

        let cds = sig.all_code_directories()?;
        assert_eq!(cds.len(), 2);
        for (_, cd) in &cds {
            assert_eq!(cd.team_name.as_deref(), Some("TEAM123456"));
            assert!(!cd.flags.contains(CodeSignatureFlags::ADHOC));
            assert!(cd
                .special_hashes
                .contains_key(&CodeSigningSlot::RequirementSet));
        }

        assert!(sig.code_requirements()?.is_some());
        assert!(!sig.signature_data()?.unwrap().is_empty());

        Ok(())
    }

    #[test]
    fn team_mismatch_rejected() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let data = MachOBuilder::default().build();
        let path = write_binary(temp.path(), "tool", &data)?;

        let (cert, key) = self_signed_certificate("TEAM123456");
        let mut settings = SigningSettings::default();
        settings.set_signing_identity(Arc::new(CmsSigningIdentity::new(key, cert)));
        settings.set_team_id(SettingsScope::Main, "OTHERTEAM1");

        assert!(matches!(
            Signer::new(settings).sign_path_in_place(&path),
            Err(CodeSignError::BadTeamIdentifier { .. })
        ));

        let mut settings = SigningSettings::default();
        settings.set_team_id(SettingsScope::Main, "bad team");
        assert!(matches!(
            Signer::new(settings).sign_path_in_place(&path),
            Err(CodeSignError::InvalidTeamIdentifier(_))
        ));

        // Nothing was written.
        assert_eq!(std::fs::read(&path)?, data);

        Ok(())
    }

    #[test]
    fn fat_binary_team_mismatch() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let data = fat_binary(&[
            &MachOBuilder::default().build(),
            &MachOBuilder::arm64().build(),
        ]);
        let path = write_binary(temp.path(), "fat", &data)?;

        let mut settings = SigningSettings::default();
        settings.set_team_id(SettingsScope::MultiArchIndex(1), "TEAM2");

        assert!(matches!(
            Signer::new(settings).sign_path_in_place(&path),
            Err(CodeSignError::TeamIdentifierMismatch(_, _))
        ));

        Ok(())
    }

    #[test]
    fn fat_binary_signing() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let data = fat_binary(&[
            &MachOBuilder::default().build(),
            &MachOBuilder::arm64().build(),
        ]);
        let path = write_binary(temp.path(), "fat", &data)?;

        let mut settings = SigningSettings::default();
        settings.set_team_id(SettingsScope::Main, "TEAM1");
        Signer::new(settings).sign_path_in_place(&path)?;

        let data = std::fs::read(&path)?;
        let slices = parse_slices(&data)?;
        assert_eq!(slices.len(), 2);

        for slice in &slices {
            let command = slice.macho.code_signature_load_command().unwrap();
            let cd = slice.macho.code_signature()?.unwrap().code_directory()?.unwrap().to_owned();

            assert_eq!(cd.code_limit as u32, command.dataoff);
            assert_eq!(cd.team_name.as_deref(), Some("TEAM1"));
            assert!(cd
                .exec_seg_flags
                .unwrap()
                .contains(ExecutableSegmentFlags::MAIN_BINARY));
        }

        Ok(())
    }

    #[test]
    fn dry_run_writes_nothing() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let data = MachOBuilder::default().build();
        let path = write_binary(temp.path(), "tool", &data)?;

        let mut settings = SigningSettings::default();
        settings.set_dry_run(true);
        let signed = Signer::new(settings).sign_macho(&path, &path)?;

        assert_eq!(std::fs::read(&path)?, data);
        assert!(parse_slices(&signed)?[0].macho.code_signature()?.is_some());

        Ok(())
    }

    #[test]
    fn detached_signing() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let data = MachOBuilder::default().build();
        let path = write_binary(temp.path(), "tool", &data)?;
        let sig_path = temp.path().join("tool.sig");

        let mut settings = SigningSettings::default();
        settings.set_detached(true);
        Signer::new(settings.clone()).sign_path(&path, &sig_path)?;

        assert_eq!(std::fs::read(&path)?, data);

        let sig_data = std::fs::read(&sig_path)?;
        let detached = crate::embedded_signature::DetachedSignature::from_bytes(&sig_data)?;
        let sig = detached
            .for_cpu_type(goblin::mach::cputype::CPU_TYPE_X86_64)
            .unwrap();
        let cd = sig.code_directory()?.unwrap();
        assert_eq!(cd.code_limit as usize, data.len());

        assert!(matches!(
            Signer::new(settings).sign_path(&path, &path),
            Err(CodeSignError::Unsupported(_))
        ));

        Ok(())
    }

    #[test]
    fn signature_removal() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let data = MachOBuilder::default().build();
        let path = write_binary(temp.path(), "tool", &data)?;

        Signer::new(SigningSettings::default()).sign_path_in_place(&path)?;
        remove_signature(&path)?;

        let stripped = std::fs::read(&path)?;
        let slices = parse_slices(&stripped)?;
        assert!(slices[0].macho.code_signature_load_command().is_none());
        assert!(slices[0].macho.code_signature()?.is_none());

        // Removing from an unsigned binary is a no-op.
        remove_signature(&path)?;

        Ok(())
    }

    #[test]
    fn top_directory_and_entitlements() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let path = write_binary(temp.path(), "tool", &MachOBuilder::default().build())?;

        let mut settings = SigningSettings::default();
        settings.set_top_directory(true);
        settings.set_entitlements_xml(
            SettingsScope::Main,
            indoc::indoc! {r#"
                <?xml version="1.0" encoding="UTF-8"?>
                <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
                <plist version="1.0">
                <dict>
                    <key>get-task-allow</key>
                    <true/>
                </dict>
                </plist>
            "#},
        )?;
        Signer::new(settings).sign_path_in_place(&path)?;

        let data = std::fs::read(&path)?;
        let slices = parse_slices(&data)?;
        let sig = slices[0].macho.code_signature()?.unwrap();

        assert_eq!(sig.slot_ids(), vec![0, 4, 5, 7, 0x10000]);
        assert_eq!(sig.top_directory()?.unwrap().slots, sig.slot_ids());

        let cd = sig.code_directory()?.unwrap();
        assert!(cd
            .exec_seg_flags
            .unwrap()
            .contains(ExecutableSegmentFlags::MAIN_BINARY | ExecutableSegmentFlags::ALLOW_UNSIGNED));

        Ok(())
    }

    fn write_info_plist(path: &Path, identifier: &str, executable: &str) -> Result<(), CodeSignError> {
        let mut dict = plist::Dictionary::new();
        dict.insert("CFBundleIdentifier".into(), identifier.into());
        dict.insert("CFBundleExecutable".into(), executable.into());
        dict.insert("CFBundlePackageType".into(), "APPL".into());
        plist::Value::Dictionary(dict).to_file_xml(path)?;

        Ok(())
    }

    fn create_app(root: &Path, identifier: &str) -> Result<(), CodeSignError> {
        let contents = root.join("Contents");
        std::fs::create_dir_all(contents.join("MacOS"))?;
        std::fs::create_dir_all(contents.join("Resources"))?;
        write_info_plist(&contents.join("Info.plist"), identifier, "app")?;
        std::fs::write(contents.join("MacOS").join("app"), MachOBuilder::default().build())?;
        std::fs::write(contents.join("Resources").join("data.txt"), b"hello")?;

        Ok(())
    }

    #[test]
    fn bundle_signing() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let source = temp.path().join("Source.app");
        create_app(&source, "com.example.app")?;
        create_app(
            &source.join("Contents").join("Helpers").join("Helper.app"),
            "com.example.helper",
        )?;

        let dest = temp.path().join("Signed.app");
        Signer::new(SigningSettings::default()).sign_path(&source, &dest)?;

        // The source is untouched.
        assert!(!source.join("Contents/_CodeSignature").exists());

        let resources = CodeResources::from_xml(&std::fs::read(
            dest.join("Contents/_CodeSignature/CodeResources"),
        )?)?;

        assert!(matches!(
            resources.files2.get("Resources/data.txt"),
            Some(ResourceSeal::File {
                hash: Some(_),
                hash2: Some(_),
                optional: false
            })
        ));
        assert!(resources.files.contains_key("Resources/data.txt"));
        assert!(!resources.files2.contains_key("MacOS/app"));
        assert!(!resources.files2.contains_key("Info.plist"));

        let helper_data = std::fs::read(dest.join("Contents/Helpers/Helper.app/Contents/MacOS/app"))?;
        let helper_seal = nested_seal_for_macho(&helper_data)?;

        match resources.files2.get("Helpers/Helper.app") {
            Some(ResourceSeal::Nested {
                cdhash,
                requirement,
                ..
            }) => {
                assert_eq!(cdhash, &helper_seal.cdhash);
                assert_eq!(requirement, &helper_seal.requirement);
            }
            other => panic!("unexpected seal {:?}", other),
        }

        let main = std::fs::read(dest.join("Contents/MacOS/app"))?;
        let slices = parse_slices(&main)?;
        let sig: EmbeddedSignature = slices[0].macho.code_signature()?.unwrap();
        let cd = sig.code_directory()?.unwrap();
        assert_eq!(cd.ident, "com.example.app");
        assert!(cd.special_hashes.contains_key(&CodeSigningSlot::Info));
        assert!(cd.special_hashes.contains_key(&CodeSigningSlot::ResourceDir));

        Ok(())
    }

    #[test]
    fn failed_executable_leaves_no_seal() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let root = temp.path().join("Broken.app");
        create_app(&root, "com.example.broken")?;
        std::fs::write(root.join("Contents/MacOS/app"), b"not a mach-o binary")?;

        assert!(Signer::new(SigningSettings::default())
            .sign_path_in_place(&root)
            .is_err());
        assert!(!root.join("Contents/_CodeSignature/CodeResources").exists());

        let root = temp.path().join("DryRun.app");
        create_app(&root, "com.example.dryrun")?;
        let mut settings = SigningSettings::default();
        settings.set_dry_run(true);
        Signer::new(settings).sign_path_in_place(&root)?;
        assert!(!root.join("Contents/_CodeSignature").exists());

        Ok(())
    }

    #[test]
    fn bundle_without_executable() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let root = temp.path().join("Empty.app");
        std::fs::create_dir_all(root.join("Contents"))?;
        write_info_plist(&root.join("Contents/Info.plist"), "com.example.empty", "missing")?;

        assert!(matches!(
            Signer::new(SigningSettings::default()).sign_path_in_place(&root),
            Err(CodeSignError::BundleNoMainExecutable(_))
        ));

        Ok(())
    }
}
