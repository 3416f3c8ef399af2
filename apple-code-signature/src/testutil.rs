// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    goblin::mach::{
        cputype::{CPU_SUBTYPE_ARM64_ALL, CPU_SUBTYPE_X86_64_ALL, CPU_TYPE_ARM64, CPU_TYPE_X86_64},
        fat::{FatArch, FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER},
        header::{Header64, MH_EXECUTE, MH_MAGIC_64, SIZEOF_HEADER_64},
        load_command::{
            Section64, SegmentCommand64, UuidCommand, LC_SEGMENT_64, LC_UUID, SIZEOF_SECTION_64,
            SIZEOF_SEGMENT_COMMAND_64, SIZEOF_UUID_COMMAND,
        },
    },
    scroll::Pwrite,
    x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, KeyAlgorithm},
};

fn name16(s: &str) -> [u8; 16] {
    let mut res = [0u8; 16];
    res[0..s.len()].copy_from_slice(s.as_bytes());
    res
}

/// Synthesizes a minimal 64-bit little-endian Mach-O.
///
/// Layout: header, optional `LC_UUID`, a `__TEXT` segment spanning file
/// offsets 0..2048 with one `__text` section, then a `__LINKEDIT` segment
/// running to the end of the file.
#[derive(Clone, Debug)]
pub struct MachOBuilder {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub uuid: Option<[u8; 16]>,
    pub section_offset: u32,
    pub linkedit_size: u64,
    pub fill: u8,
}

impl Default for MachOBuilder {
    fn default() -> Self {
        Self {
            cputype: CPU_TYPE_X86_64,
            cpusubtype: CPU_SUBTYPE_X86_64_ALL,
            filetype: MH_EXECUTE,
            uuid: None,
            section_offset: 1024,
            linkedit_size: 256,
            fill: 0x42,
        }
    }
}

impl MachOBuilder {
    pub const TEXT_SIZE: u64 = 2048;

    pub fn arm64() -> Self {
        Self {
            cputype: CPU_TYPE_ARM64,
            cpusubtype: CPU_SUBTYPE_ARM64_ALL,
            fill: 0x17,
            ..Default::default()
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let total = Self::TEXT_SIZE + self.linkedit_size;
        let mut data = vec![0u8; total as usize];

        let text_cmdsize = SIZEOF_SEGMENT_COMMAND_64 + SIZEOF_SECTION_64;
        let uuid_cmdsize = if self.uuid.is_some() {
            SIZEOF_UUID_COMMAND
        } else {
            0
        };
        let sizeofcmds = uuid_cmdsize + text_cmdsize + SIZEOF_SEGMENT_COMMAND_64;

        let header = Header64 {
            magic: MH_MAGIC_64,
            cputype: self.cputype,
            cpusubtype: self.cpusubtype,
            filetype: self.filetype,
            ncmds: if self.uuid.is_some() { 3 } else { 2 },
            sizeofcmds: sizeofcmds as u32,
            flags: 0,
            reserved: 0,
        };
        data.pwrite_with(header, 0, scroll::LE).unwrap();

        let mut offset = SIZEOF_HEADER_64;

        if let Some(uuid) = self.uuid {
            let command = UuidCommand {
                cmd: LC_UUID,
                cmdsize: SIZEOF_UUID_COMMAND as u32,
                uuid,
            };
            data.pwrite_with(command, offset, scroll::LE).unwrap();
            offset += SIZEOF_UUID_COMMAND;
        }

        let text = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: text_cmdsize as u32,
            segname: name16("__TEXT"),
            vmaddr: 0x1_0000_0000,
            vmsize: 0x4000,
            fileoff: 0,
            filesize: Self::TEXT_SIZE,
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
            addr: 0x1_0000_0000 + self.section_offset as u64,
            size: 64,
            offset: self.section_offset,
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
            fileoff: Self::TEXT_SIZE,
            filesize: self.linkedit_size,
            maxprot: 1,
            initprot: 1,
            nsects: 0,
            flags: 0,
        };
        data.pwrite_with(linkedit, offset, scroll::LE).unwrap();

        let code_start = self.section_offset as usize;
        for (i, b) in data[code_start..code_start + 64].iter_mut().enumerate() {
            *b = self.fill.wrapping_add(i as u8);
        }
        for (i, b) in data[Self::TEXT_SIZE as usize..].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        data
    }
}

/// Assemble a universal binary with 16 KiB aligned slices.
pub fn fat_binary(slices: &[&[u8]]) -> Vec<u8> {
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

/// A self-signed ECDSA code signing certificate with the team id as `OU`.
pub fn self_signed_certificate(team_id: &str) -> (CapturedX509Certificate, InMemorySigningKeyPair) {
    let mut builder =
        x509_certificate::X509CertificateBuilder::new(KeyAlgorithm::Ecdsa(
            x509_certificate::EcdsaCurve::Secp256r1,
        ));
    builder
        .subject()
        .append_common_name_utf8_string(&format!("Test Signer ({})", team_id))
        .unwrap();
    builder
        .subject()
        .append_organizational_unit_utf8_string(team_id)
        .unwrap();
    builder
        .subject()
        .append_country_utf8_string("US")
        .unwrap();
    builder.validity_duration(chrono::Duration::hours(1));

    let (cert, key, _) = builder.create_with_random_keypair().unwrap();

    (cert, key)
}
