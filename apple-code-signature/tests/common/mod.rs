// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(dead_code)]

use {
    goblin::mach::{
        cputype::{CPU_SUBTYPE_ARM64_ALL, CPU_SUBTYPE_X86_64_ALL, CPU_TYPE_ARM64, CPU_TYPE_X86_64},
        fat::{FatArch, FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER},
        header::{Header64, MH_EXECUTE, MH_MAGIC_64, SIZEOF_HEADER_64},
        load_command::{
            Section64, SegmentCommand64, LC_SEGMENT_64, SIZEOF_SECTION_64,
            SIZEOF_SEGMENT_COMMAND_64,
        },
    },
    scroll::Pwrite,
    std::path::{Path, PathBuf},
    x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, KeyAlgorithm},
};

const TEXT_SIZE: u64 = 2048;
const LINKEDIT_SIZE: u64 = 256;
const SECTION_OFFSET: u32 = 1024;

fn name16(s: &str) -> [u8; 16] {
    let mut res = [0u8; 16];
    res[0..s.len()].copy_from_slice(s.as_bytes());
    res
}

/// A minimal 64-bit executable: `__TEXT` over 0..2048 with one section at
/// 1024, followed by `__LINKEDIT`.
pub fn macho(cputype: u32, cpusubtype: u32, fill: u8) -> Vec<u8> {
    let mut data = vec![0u8; (TEXT_SIZE + LINKEDIT_SIZE) as usize];
    let text_cmdsize = SIZEOF_SEGMENT_COMMAND_64 + SIZEOF_SECTION_64;

    let header = Header64 {
        magic: MH_MAGIC_64,
        cputype,
        cpusubtype,
        filetype: MH_EXECUTE,
        ncmds: 2,
        sizeofcmds: (text_cmdsize + SIZEOF_SEGMENT_COMMAND_64) as u32,
        flags: 0,
        reserved: 0,
    };
    data.pwrite_with(header, 0, scroll::LE).unwrap();
    let mut offset = SIZEOF_HEADER_64;

    let text = SegmentCommand64 {
        cmd: LC_SEGMENT_64,
        cmdsize: text_cmdsize as u32,
        segname: name16("__TEXT"),
        vmaddr: 0x1_0000_0000,
        vmsize: 0x4000,
        fileoff: 0,
        filesize: TEXT_SIZE,
        maxprot: 5,
        initprot: 5,
        nsects: 1,
        flags: 0,
    };
    data.pwrite_with(text, offset, scroll::LE).unwrap();
    offset += SIZEOF_SEGMENT_COMMAND_64;

    let section = Section64 {
        sectname: name16("__text"),
        segname: name16("__TEXT"),
        addr: 0x1_0000_0000 + SECTION_OFFSET as u64,
        size: 64,
        offset: SECTION_OFFSET,
        align: 4,
        reloff: 0,
        nreloc: 0,
        flags: 0x8000_0400,
        reserved1: 0,
        reserved2: 0,
        reserved3: 0,
    };
    data.pwrite_with(section, offset, scroll::LE).unwrap();
    offset += SIZEOF_SECTION_64;

    let linkedit = SegmentCommand64 {
        cmd: LC_SEGMENT_64,
        cmdsize: SIZEOF_SEGMENT_COMMAND_64 as u32,
        segname: name16("__LINKEDIT"),
        vmaddr: 0x1_0000_4000,
        vmsize: 0x4000,
        fileoff: TEXT_SIZE,
        filesize: LINKEDIT_SIZE,
        maxprot: 1,
        initprot: 1,
        nsects: 0,
        flags: 0,
    };
    data.pwrite_with(linkedit, offset, scroll::LE).unwrap();

    let start = SECTION_OFFSET as usize;
    for (i, b) in data[start..start + 64].iter_mut().enumerate() {
        *b = fill.wrapping_add(i as u8);
    }

    data
}

pub fn x86_64() -> Vec<u8> {
    macho(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL, 0x42)
}

pub fn arm64() -> Vec<u8> {
    macho(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, 0x17)
}

/// A universal binary with 16 KiB aligned slices.
pub fn fat_binary(slices: &[Vec<u8>]) -> Vec<u8> {
    let align = 1usize << 14;
    let mut data = vec![0u8; SIZEOF_FAT_HEADER + SIZEOF_FAT_ARCH * slices.len()];

    data.pwrite_with(FAT_MAGIC, 0, scroll::BE).unwrap();
    data.pwrite_with(slices.len() as u32, 4, scroll::BE).unwrap();

    for (i, slice) in slices.iter().enumerate() {
        let offset = (data.len() + align - 1) / align * align;
        data.resize(offset, 0);

        let header = goblin::mach::MachO::parse(slice, 0).unwrap().header;
        let arch = FatArch {
            cputype: header.cputype,
            cpusubtype: header.cpusubtype,
            offset: offset as u32,
            size: slice.len() as u32,
            align: 14,
        };
        data.pwrite_with(arch, SIZEOF_FAT_HEADER + i * SIZEOF_FAT_ARCH, scroll::BE)
            .unwrap();

        data.extend_from_slice(slice);
    }

    data
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, data).unwrap();
    path
}

/// Lay out an unsigned `.app` bundle with one resource.
pub fn app_bundle(root: &Path, name: &str, identifier: &str) -> PathBuf {
    let app = root.join(name);
    let contents = app.join("Contents");

    write_file(
        &contents,
        "Info.plist",
        indoc::formatdoc! {r#"
                <?xml version="1.0" encoding="UTF-8"?>
                <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
                <plist version="1.0">
                <dict>
                    <key>CFBundleExecutable</key>
                    <string>app</string>
                    <key>CFBundleIdentifier</key>
                    <string>{}</string>
                    <key>CFBundlePackageType</key>
                    <string>APPL</string>
                </dict>
                </plist>
            "#,
            identifier
        }
        .as_bytes(),
    );
    write_file(&contents, "MacOS/app", &x86_64());
    write_file(&contents, "Resources/greeting.txt", b"hello, world\n");

    app
}

/// A self-signed ECDSA certificate carrying the team id as `OU`.
pub fn self_signed_certificate(
    team_id: &str,
) -> (CapturedX509Certificate, InMemorySigningKeyPair) {
    let mut builder = x509_certificate::X509CertificateBuilder::new(KeyAlgorithm::Ecdsa(
        x509_certificate::EcdsaCurve::Secp256r1,
    ));
    builder
        .subject()
        .append_common_name_utf8_string(&format!("Integration Signer ({})", team_id))
        .unwrap();
    builder
        .subject()
        .append_organizational_unit_utf8_string(team_id)
        .unwrap();
    builder.validity_duration(chrono::Duration::hours(1));

    let (cert, key, _) = builder.create_with_random_keypair().unwrap();

    (cert, key)
}
