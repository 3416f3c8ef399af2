// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing followed by static validation of the result.

mod common;

use {
    apple_code_signature::{
        cdhash, parse_requirement_expression, parse_slices, CmsSigningIdentity,
        CodeSignError, CodeSignatureFlags, DigestType, ErrorKind, MachOSignable, SettingsScope,
        Signer, SigningSettings, StaticCode, ValidationFlags, ValidityTrustEvaluator,
    },
    std::{path::Path, sync::Arc},
};

fn sign_in_place(path: &Path, settings: SigningSettings) -> Result<(), CodeSignError> {
    Signer::new(settings).sign_path_in_place(path)
}

#[test]
fn adhoc_thin_executable() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let path = common::write_file(temp.path(), "hello", &common::x86_64());

    sign_in_place(&path, SigningSettings::default())?;

    let data = std::fs::read(&path)?;
    let slices = parse_slices(&data)?;
    let signature = slices[0].macho.code_signature()?.unwrap();
    let cd = signature.code_directory()?.unwrap();
    assert!(cd.special_hashes.is_empty());
    assert!(cd.flags.contains(CodeSignatureFlags::ADHOC));

    let flags = ValidationFlags::default();
    let mut code = StaticCode::open(&path)?;
    let report = code.validate(&flags, None)?;
    assert_eq!(report.team_id, None);
    assert!(report.flags.contains(CodeSignatureFlags::ADHOC));
    assert!(report.resources.is_none());
    assert_eq!(report.cd_hashes.len(), 1);

    let requirement = code.designated_requirement(&flags)?;
    assert_eq!(
        requirement.to_string(),
        format!("cdhash H\"{}\"", hex::encode(&report.cd_hashes[0].1))
    );

    // The derived requirement is satisfied by the code it came from.
    code.validate(&flags, Some(&requirement))?;

    Ok(())
}

#[test]
fn signing_is_deterministic() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let a = common::write_file(temp.path(), "a/tool", &common::x86_64());
    let b = common::write_file(temp.path(), "b/tool", &common::x86_64());

    sign_in_place(&a, SigningSettings::default())?;
    sign_in_place(&b, SigningSettings::default())?;

    assert_eq!(std::fs::read(&a)?, std::fs::read(&b)?);

    let flags = ValidationFlags::default();
    assert_eq!(
        StaticCode::open(&a)?.cd_hashes(&flags)?,
        StaticCode::open(&b)?.cd_hashes(&flags)?
    );

    Ok(())
}

#[test]
fn page_tampering_detected() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let path = common::write_file(temp.path(), "tool", &common::x86_64());
    sign_in_place(&path, SigningSettings::default())?;

    let original = std::fs::read(&path)?;
    let limit = parse_slices(&original)?[0].macho.code_limit_binary_offset()? as usize;

    for offset in [512, 1024, 2047, limit - 1] {
        let mut data = original.clone();
        data[offset] ^= 0x01;
        std::fs::write(&path, &data)?;

        let err = StaticCode::open(&path)?
            .validate(&ValidationFlags::default(), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid, "offset {}", offset);
    }

    // Skipping the executable check skips page hashing.
    let flags = ValidationFlags {
        check_executable: false,
        ..Default::default()
    };
    let mut data = original;
    data[1024] ^= 0x01;
    std::fs::write(&path, &data)?;
    StaticCode::open(&path)?.validate(&flags, None)?;

    Ok(())
}

#[test]
fn hash_agility() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let path = common::write_file(temp.path(), "tool", &common::x86_64());

    let mut settings = SigningSettings::default();
    settings.set_digest_types([DigestType::Sha256, DigestType::Sha1]);
    sign_in_place(&path, settings)?;

    let report = StaticCode::open(&path)?.validate(&ValidationFlags::default(), None)?;
    let types = report
        .cd_hashes
        .iter()
        .map(|(digest, _)| *digest)
        .collect::<Vec<_>>();
    assert_eq!(types, vec![DigestType::Sha1, DigestType::Sha256]);
    assert_eq!(report.digest_type, DigestType::Sha256);

    // Every cdhash verifies against its own code directory.
    let data = std::fs::read(&path)?;
    let slices = parse_slices(&data)?;
    let signature = slices[0].macho.code_signature()?.unwrap();
    for (slot, cd) in signature.all_code_directories()? {
        let raw = signature.find_slot(slot).unwrap().data;
        let expected = report
            .cd_hashes
            .iter()
            .find(|(digest, _)| *digest == cd.hash_type)
            .map(|(_, hash)| hash.clone())
            .unwrap();

        assert_eq!(cdhash(raw, cd.hash_type)?, expected);
        assert_eq!(expected.len(), 20);
    }

    Ok(())
}

#[test]
fn universal_binary() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let data = common::fat_binary(&[common::x86_64(), common::arm64()]);
    let path = common::write_file(temp.path(), "universal", &data);

    let mut settings = SigningSettings::default();
    settings.set_binary_identifier(SettingsScope::Main, "com.example.universal");
    sign_in_place(&path, settings)?;

    let data = std::fs::read(&path)?;
    let slices = parse_slices(&data)?;
    assert_eq!(slices.len(), 2);

    for slice in &slices {
        let signature = slice.macho.code_signature()?.unwrap();
        let cd = signature.code_directory()?.unwrap();
        let command = slice.macho.code_signature_load_command().unwrap();

        assert_eq!(cd.ident, "com.example.universal");
        assert_eq!(cd.code_limit, command.dataoff);
        assert_eq!(command.dataoff % 16, 0);
        assert_eq!(slice.offset % (1 << 14), 0);
    }

    let flags = ValidationFlags {
        all_architectures: true,
        ..Default::default()
    };
    let report = StaticCode::open(&path)?.validate(&flags, None)?;
    assert_eq!(report.architectures.len(), 2);
    assert_eq!(report.identifier, "com.example.universal");

    // A modified second slice fails only when every slice is checked.
    let offset = slices[1].offset + 1024;
    let mut data = data.clone();
    data[offset] ^= 0xff;
    std::fs::write(&path, &data)?;

    StaticCode::open(&path)?.validate(&ValidationFlags::default(), None)?;
    assert_eq!(
        StaticCode::open(&path)?
            .validate(&flags, None)
            .unwrap_err()
            .kind(),
        ErrorKind::SignatureInvalid
    );

    Ok(())
}

#[test]
fn reset_reproduces_result() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let app = common::app_bundle(temp.path(), "Reset.app", "com.example.reset");
    Signer::new(SigningSettings::default()).sign_path_in_place(&app)?;

    let flags = ValidationFlags::default();
    let mut code = StaticCode::open(&app)?;

    let first = code.validate(&flags, None)?;
    code.reset();
    let second = code.validate(&flags, None)?;

    assert_eq!(first, second);
    assert_eq!(first.identifier, "com.example.reset");

    Ok(())
}

#[test]
fn detached_signature() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let path = common::write_file(temp.path(), "tool", &common::x86_64());
    let signature_path = temp.path().join("tool.sig");

    let mut settings = SigningSettings::default();
    settings.set_detached(true);
    Signer::new(settings).sign_path(&path, &signature_path)?;

    let flags = ValidationFlags::default();

    // The binary itself remains unsigned.
    assert_eq!(
        StaticCode::open(&path)?
            .validate(&flags, None)
            .unwrap_err()
            .kind(),
        ErrorKind::Unsigned
    );

    let signature = std::fs::read(&signature_path)?;
    let report = StaticCode::open(&path)?
        .with_detached_signature(signature.clone())
        .validate(&flags, None)?;
    assert!(report.flags.contains(CodeSignatureFlags::ADHOC));

    // Attaching a signature forgets the earlier outcome.
    let mut code = StaticCode::open(&path)?;
    assert!(code.validate(&flags, None).is_err());
    code.attach_detached_signature(signature);
    code.validate(&flags, None)?;

    Ok(())
}

#[test]
fn certificate_signed_executable() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let path = common::write_file(temp.path(), "tool", &common::x86_64());

    let (cert, key) = common::self_signed_certificate("TEAM987654");
    let mut settings = SigningSettings::default();
    settings.set_signing_identity(Arc::new(CmsSigningIdentity::new(key, cert.clone())));
    settings.set_binary_identifier(SettingsScope::Main, "com.example.signed");
    sign_in_place(&path, settings)?;

    let flags = ValidationFlags::default();
    let report = StaticCode::open(&path)?
        .with_trust_evaluator(Arc::new(ValidityTrustEvaluator::default().with_anchor(cert)))
        .validate(&flags, None)?;

    assert_eq!(report.identifier, "com.example.signed");
    assert_eq!(report.team_id.as_deref(), Some("TEAM987654"));
    assert!(!report.flags.contains(CodeSignatureFlags::ADHOC));
    assert!(report.signing_time.is_some());
    assert_eq!(report.architectures[0].certificates.len(), 1);

    let matching = parse_requirement_expression(r#"identifier "com.example.signed""#)?;
    StaticCode::open(&path)?.validate(&flags, Some(&matching))?;

    let other = parse_requirement_expression(r#"identifier "com.example.other""#)?;
    assert_eq!(
        StaticCode::open(&path)?
            .validate(&flags, Some(&other))
            .unwrap_err()
            .kind(),
        ErrorKind::RequirementFailed
    );

    Ok(())
}

#[test]
fn bundle_resource_tampering() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let source = common::app_bundle(temp.path(), "Source.app", "com.example.tamper");
    let flags = ValidationFlags::default();

    let sign_copy = |name: &str| -> Result<std::path::PathBuf, CodeSignError> {
        let dest = temp.path().join(name);
        Signer::new(SigningSettings::default()).sign_path(&source, &dest)?;
        Ok(dest)
    };

    let app = sign_copy("Altered.app")?;
    std::fs::write(app.join("Contents/Resources/greeting.txt"), b"goodbye\n")?;
    let err = StaticCode::open(&app)?.validate(&flags, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceAltered);

    let app = sign_copy("Missing.app")?;
    std::fs::remove_file(app.join("Contents/Resources/greeting.txt"))?;
    let err = StaticCode::open(&app)?.validate(&flags, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceMissing);

    let app = sign_copy("Added.app")?;
    std::fs::write(app.join("Contents/Resources/extra.txt"), b"extra\n")?;
    let err = StaticCode::open(&app)?.validate(&flags, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceAdded);
    assert_eq!(err.resource_problems().len(), 1);

    // Every problem is reported, not only the first.
    let app = sign_copy("Many.app")?;
    std::fs::write(app.join("Contents/Resources/greeting.txt"), b"goodbye\n")?;
    std::fs::write(app.join("Contents/Resources/extra.txt"), b"extra\n")?;
    let err = StaticCode::open(&app)?.validate(&flags, None).unwrap_err();
    assert_eq!(err.resource_problems().len(), 2);

    Ok(())
}

#[cfg(unix)]
#[test]
fn file_replaced_by_symlink() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let source = common::app_bundle(temp.path(), "Source.app", "com.example.symlink");
    let app = temp.path().join("Signed.app");
    Signer::new(SigningSettings::default()).sign_path(&source, &app)?;

    let resources = app.join("Contents/Resources");
    std::fs::rename(resources.join("greeting.txt"), temp.path().join("greeting.txt"))?;
    std::os::unix::fs::symlink(temp.path().join("greeting.txt"), resources.join("greeting.txt"))?;

    let err = StaticCode::open(&app)?
        .validate(&ValidationFlags::default(), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceAltered);

    Ok(())
}
