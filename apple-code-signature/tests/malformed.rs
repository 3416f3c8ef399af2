// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hostile binaries and bundles must fail with errors, never panics.

mod common;

use {
    apple_code_signature::{
        macho_allocate::{allocate_data, deallocate_data},
        parse_slices, CodeResources, CodeSignError, ErrorKind, MachOSignable, Signer,
        SigningSettings, StaticCode, ValidationFlags,
    },
    scroll::Pread,
};

// Offsets into the binaries built by `common::macho()`.
const TEXT_FILESIZE: usize = 32 + 48;
const SECTION_FILEOFF: usize = 32 + 72 + 48;
const LINKEDIT_FILEOFF: usize = 184 + 40;
const LINKEDIT_FILESIZE: usize = 184 + 48;
const COMMANDS_END: usize = 256;

fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[test]
fn section_offset_past_end_of_file() {
    // Empty __TEXT, a section claiming data at 1 MiB and a __LINKEDIT
    // covering the whole 256 byte file.
    let mut data = common::x86_64();
    data.truncate(COMMANDS_END);
    put_u64(&mut data, TEXT_FILESIZE, 0);
    put_u32(&mut data, SECTION_FILEOFF, 0x10_0000);
    put_u64(&mut data, LINKEDIT_FILEOFF, 0);
    put_u64(&mut data, LINKEDIT_FILESIZE, COMMANDS_END as u64);

    let err = allocate_data(&data, |_, _| 1000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedBinary);
}

#[test]
fn signature_overlapping_load_commands() -> Result<(), CodeSignError> {
    let mut data = allocate_data(&common::x86_64(), |_, _| 1000)?;

    // LC_CODE_SIGNATURE is appended after __LINKEDIT; point its data back
    // into the load commands and shrink the file to match.
    let len = COMMANDS_END + 16;
    data.truncate(len);
    put_u64(&mut data, TEXT_FILESIZE, 0);
    put_u64(&mut data, LINKEDIT_FILEOFF, 0);
    put_u64(&mut data, LINKEDIT_FILESIZE, len as u64);
    put_u32(&mut data, COMMANDS_END + 8, 96);
    put_u32(&mut data, COMMANDS_END + 12, (len - 96) as u32);

    for res in [deallocate_data(&data), allocate_data(&data, |_, _| 1000)] {
        assert_eq!(res.unwrap_err().kind(), ErrorKind::MalformedBinary);
    }

    Ok(())
}

#[test]
fn huge_code_limit_rejected() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let path = common::write_file(temp.path(), "tool", &common::x86_64());
    Signer::new(SigningSettings::default()).sign_path_in_place(&path)?;

    let mut data = std::fs::read(&path)?;
    let dataoff = parse_slices(&data)?[0]
        .macho
        .code_signature_load_command()
        .unwrap()
        .dataoff as usize;

    // Find the code directory (slot 0) in the SuperBlob index.
    let count = data.pread_with::<u32>(dataoff + 8, scroll::BE)? as usize;
    let cd_offset = (0..count)
        .map(|i| dataoff + 12 + i * 8)
        .find(|entry| data.pread_with::<u32>(*entry, scroll::BE).unwrap() == 0)
        .map(|entry| data.pread_with::<u32>(entry + 4, scroll::BE).unwrap() as usize)
        .unwrap();
    let cd = dataoff + cd_offset;
    assert!(data.pread_with::<u32>(cd + 8, scroll::BE)? >= 0x20300);

    // codeLimit64
    data[cd + 56..cd + 64].copy_from_slice(&u64::MAX.to_be_bytes());
    std::fs::write(&path, &data)?;

    let err = StaticCode::open(&path)?
        .validate(&ValidationFlags::default(), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SignatureInvalid);

    Ok(())
}

#[test]
fn truncated_signed_binary() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let path = common::write_file(temp.path(), "tool", &common::x86_64());
    Signer::new(SigningSettings::default()).sign_path_in_place(&path)?;

    let original = std::fs::read(&path)?;

    for len in [16, 200, 1000, original.len() - 8] {
        std::fs::write(&path, &original[..len])?;

        let res = StaticCode::open(&path).and_then(|mut code| {
            code.validate(&ValidationFlags::default(), None)
        });
        assert!(res.is_err(), "length {}", len);
    }

    Ok(())
}

#[test]
fn unmatched_resource_added() -> Result<(), CodeSignError> {
    let temp = tempfile::TempDir::new()?;
    let source = common::app_bundle(temp.path(), "Source.app", "com.example.unmatched");
    let app = temp.path().join("Signed.app");

    let mut settings = SigningSettings::default();
    settings.set_resource_rules_xml(
        indoc::indoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
            <plist version="1.0">
            <dict>
                <key>rules2</key>
                <dict>
                    <key>^Resources/</key>
                    <true/>
                </dict>
            </dict>
            </plist>
        "#}
        .as_bytes(),
    )?;
    Signer::new(settings).sign_path(&source, &app)?;

    // Files no rule matches are still sealed.
    let resources = CodeResources::from_xml(&std::fs::read(
        app.join("Contents/_CodeSignature/CodeResources"),
    )?)?;
    assert!(resources.files2.contains_key("Info.plist"));
    assert!(resources.files2.contains_key("Resources/greeting.txt"));

    let flags = ValidationFlags::default();
    StaticCode::open(&app)?.validate(&flags, None)?;

    std::fs::write(app.join("Contents/extra.txt"), b"extra\n")?;
    let err = StaticCode::open(&app)?.validate(&flags, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceAdded);
    assert_eq!(err.resource_problems()[0].path, "extra.txt");

    Ok(())
}
