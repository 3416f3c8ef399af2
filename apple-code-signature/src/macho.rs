// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mach-O primitives related to code signing

Code signing data is embedded within the named `__LINKEDIT` segment of
the Mach-O binary. An `LC_CODE_SIGNATURE` load command in the Mach-O header
will point you at this data. See `find_signature_data()` for this logic.

Within the `__LINKEDIT` segment is a superblob defining embedded signature
data.

Universal (fat) binaries are a header followed by independent Mach-O
slices. [parse_slices()] resolves every slice along with its CPU type.
*/

use {
    crate::{digest::DigestType, embedded_signature::EmbeddedSignature, error::CodeSignError},
    goblin::mach::{
        constants::{SEG_LINKEDIT, SEG_PAGEZERO, SEG_TEXT},
        fat::FatArch,
        header::{MH_EXECUTE, SIZEOF_HEADER_32, SIZEOF_HEADER_64},
        load_command::{
            CommandVariant, LinkeditDataCommand, LC_BUILD_VERSION, SIZEOF_LINKEDIT_DATA_COMMAND,
        },
        parse_magic_and_ctx, Mach, MachO,
    },
    scroll::Pread,
};

/// Code signing queries over a parsed Mach-O binary.
pub trait MachOSignable {
    /// Obtain the code signature in the entity.
    ///
    /// Returns `Ok(None)` if no signature exists, `Ok(Some)` if it does, or
    /// `Err` if there is a parse error.
    fn code_signature(&self) -> Result<Option<EmbeddedSignature>, CodeSignError>;

    /// Resolve the load command for the code signature.
    fn code_signature_load_command(&self) -> Option<LinkeditDataCommand>;

    /// The file offset and size of the `__TEXT` segment.
    fn executable_segment_range(&self) -> Result<(u64, u64), CodeSignError>;

    /// The byte offset within the binary at which point "code" stops.
    ///
    /// If a signature is present, this is the offset of the start of the
    /// signature. Else it represents the end of `__LINKEDIT`.
    fn code_limit_binary_offset(&self) -> Result<u64, CodeSignError>;

    /// Whether this is a main executable (`MH_EXECUTE`).
    fn is_main_executable(&self) -> bool;

    /// Determines whether signature space can be managed for this binary.
    ///
    /// 1. `__LINKEDIT` must be the final segment, as signature data is
    ///    appended to it.
    /// 2. If there is an existing signature, there must be no data in the
    ///    binary after it.
    /// 3. If there isn't an existing signature, there must be room between
    ///    the last load command and the first section to write a new load
    ///    command for the signature.
    fn check_signing_capability(&self) -> Result<(), CodeSignError>;
}

fn linkedit_segment<'a, 'b>(
    macho: &'b MachO<'a>,
) -> Result<&'b goblin::mach::segment::Segment<'a>, CodeSignError> {
    macho
        .segments
        .iter()
        .find(|segment| matches!(segment.name(), Ok(SEG_LINKEDIT)))
        .ok_or_else(|| CodeSignError::InvalidBinary("no __LINKEDIT segment".into()))
}

impl<'a> MachOSignable for MachO<'a> {
    fn code_signature(&self) -> Result<Option<EmbeddedSignature>, CodeSignError> {
        if let Some(signature) = find_signature_data(self)? {
            Ok(Some(EmbeddedSignature::from_bytes(
                signature.signature_data,
            )?))
        } else {
            Ok(None)
        }
    }

    fn code_signature_load_command(&self) -> Option<LinkeditDataCommand> {
        self.load_commands.iter().find_map(|lc| {
            if let CommandVariant::CodeSignature(command) = lc.command {
                Some(command)
            } else {
                None
            }
        })
    }

    fn executable_segment_range(&self) -> Result<(u64, u64), CodeSignError> {
        let segment = self
            .segments
            .iter()
            .find(|segment| matches!(segment.name(), Ok(SEG_TEXT)))
            .ok_or_else(|| CodeSignError::InvalidBinary("no __TEXT segment".into()))?;

        Ok((segment.fileoff, segment.filesize))
    }

    fn code_limit_binary_offset(&self) -> Result<u64, CodeSignError> {
        let last_segment = self
            .segments
            .iter()
            .last()
            .ok_or_else(|| CodeSignError::InvalidBinary("no segments".into()))?;
        if !matches!(last_segment.name(), Ok(SEG_LINKEDIT)) {
            return Err(CodeSignError::LinkeditNotLast);
        }

        if let Some(command) = self.code_signature_load_command() {
            Ok(command.dataoff as u64)
        } else {
            last_segment
                .fileoff
                .checked_add(last_segment.filesize)
                .ok_or(CodeSignError::ArithmeticOverflow("__LINKEDIT end"))
        }
    }

    fn is_main_executable(&self) -> bool {
        self.header.filetype == MH_EXECUTE
    }

    fn check_signing_capability(&self) -> Result<(), CodeSignError> {
        let last_segment = self
            .segments
            .iter()
            .filter(|segment| !matches!(segment.name(), Ok(SEG_PAGEZERO)))
            .max_by_key(|segment| segment.fileoff)
            .ok_or_else(|| CodeSignError::InvalidBinary("no segments".into()))?;

        if !matches!(last_segment.name(), Ok(SEG_LINKEDIT)) {
            return Err(CodeSignError::LinkeditNotLast);
        }

        let linkedit_end = last_segment
            .fileoff
            .checked_add(last_segment.filesize)
            .ok_or(CodeSignError::ArithmeticOverflow("__LINKEDIT end"))?;

        if let Some(command) = self.code_signature_load_command() {
            let signature_end = command.dataoff as u64 + command.datasize as u64;

            if signature_end == linkedit_end {
                Ok(())
            } else {
                Err(CodeSignError::DataAfterSignature)
            }
        } else {
            let last_load_command = self
                .load_commands
                .iter()
                .last()
                .ok_or_else(|| CodeSignError::InvalidBinary("no load commands".into()))?;

            let first_section_offset = self
                .segments
                .iter()
                .map(|segment| segment.sections())
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .map(|(section, _)| section.offset as usize)
                .filter(|offset| *offset != 0)
                .min()
                .ok_or_else(|| CodeSignError::InvalidBinary("no sections".into()))?;

            let load_commands_end_offset =
                last_load_command.offset + last_load_command.command.cmdsize();

            if first_section_offset.saturating_sub(load_commands_end_offset)
                >= SIZEOF_LINKEDIT_DATA_COMMAND
            {
                Ok(())
            } else {
                Err(CodeSignError::LoadCommandNoRoom)
            }
        }
    }
}

/// Describes signature data embedded within a Mach-O binary.
pub struct MachOSignatureData<'a> {
    /// Which segment offset is the `__LINKEDIT` segment.
    pub linkedit_segment_index: usize,

    /// Start offset of `__LINKEDIT` segment within the binary.
    pub linkedit_segment_start_offset: usize,

    /// Start offset of signature data within the binary.
    pub signature_start_offset: usize,

    /// End offset of signature data within the binary.
    pub signature_end_offset: usize,

    /// The signature data within the `__LINKEDIT` segment.
    pub signature_data: &'a [u8],
}

/// Attempt to extract a reference to raw signature data in a Mach-O binary.
///
/// The signature range advertised by the load command must lie entirely
/// within `__LINKEDIT`.
pub fn find_signature_data<'a>(
    obj: &'a MachO,
) -> Result<Option<MachOSignatureData<'a>>, CodeSignError> {
    let command = match obj.code_signature_load_command() {
        Some(command) => command,
        None => return Ok(None),
    };

    let (linkedit_segment_index, linkedit) = obj
        .segments
        .iter()
        .enumerate()
        .find(|(_, segment)| matches!(segment.name(), Ok(SEG_LINKEDIT)))
        .ok_or_else(|| CodeSignError::InvalidBinary("no __LINKEDIT segment".into()))?;

    let signature_start_offset = command.dataoff as usize;
    let signature_end_offset = signature_start_offset
        .checked_add(command.datasize as usize)
        .ok_or(CodeSignError::ArithmeticOverflow("signature end"))?;

    let start = signature_start_offset
        .checked_sub(linkedit.fileoff as usize)
        .ok_or_else(|| {
            CodeSignError::InvalidBinary("signature data starts before __LINKEDIT".into())
        })?;
    let end = start + command.datasize as usize;

    let signature_data = linkedit.data.get(start..end).ok_or_else(|| {
        CodeSignError::InvalidBinary("signature data extends past __LINKEDIT".into())
    })?;

    Ok(Some(MachOSignatureData {
        linkedit_segment_index,
        linkedit_segment_start_offset: linkedit.fileoff as usize,
        signature_start_offset,
        signature_end_offset,
        signature_data,
    }))
}

/// A single architecture within a (possibly universal) Mach-O file.
pub struct MachOSlice<'a> {
    /// Index of this slice within the file. 0 for thin binaries.
    pub index: usize,

    /// Offset of the slice within the file.
    pub offset: usize,

    /// Raw data of this slice.
    pub data: &'a [u8],

    /// The parsed binary.
    pub macho: MachO<'a>,

    pub cputype: u32,
    pub cpusubtype: u32,
}

impl<'a> std::fmt::Debug for MachOSlice<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachOSlice")
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("size", &self.data.len())
            .field("cputype", &self.cputype)
            .field("cpusubtype", &self.cpusubtype)
            .finish()
    }
}

impl<'a> MachOSlice<'a> {
    /// The executable content covered by page hashes.
    pub fn code_data(&self) -> Result<&'a [u8], CodeSignError> {
        let limit = self.macho.code_limit_binary_offset()? as usize;

        self.data.get(..limit).ok_or_else(|| {
            CodeSignError::InvalidBinary("code limit exceeds binary size".into())
        })
    }

    /// Stable data identifying this binary, used to derive ad-hoc identifiers.
    ///
    /// This is `"UUID"` followed by the `LC_UUID` value if present. Otherwise
    /// it is the SHA-1 of the Mach-O header and load commands.
    pub fn identification(&self) -> Result<Vec<u8>, CodeSignError> {
        let uuid = self.macho.load_commands.iter().find_map(|lc| {
            if let CommandVariant::Uuid(command) = lc.command {
                Some(command.uuid)
            } else {
                None
            }
        });

        if let Some(uuid) = uuid {
            let mut res = b"UUID".to_vec();
            res.extend_from_slice(&uuid);
            return Ok(res);
        }

        let header_size = if self.macho.is_64 {
            SIZEOF_HEADER_64
        } else {
            SIZEOF_HEADER_32
        };
        let end = header_size + self.macho.header.sizeofcmds as usize;

        let commands = self.data.get(..end).ok_or_else(|| {
            CodeSignError::InvalidBinary("load commands extend past end of binary".into())
        })?;

        DigestType::Sha1.digest_data(commands)
    }
}

fn slice_range(data: &[u8], arch: &FatArch) -> Result<(usize, usize), CodeSignError> {
    let start = arch.offset as usize;
    let end = start
        .checked_add(arch.size as usize)
        .ok_or(CodeSignError::ArithmeticOverflow("fat slice end"))?;

    if end > data.len() {
        return Err(CodeSignError::InvalidBinary(
            "fat slice extends past end of file".into(),
        ));
    }

    Ok((start, end))
}

/// Parse every Mach-O slice in a thin or universal binary.
pub fn parse_slices(data: &[u8]) -> Result<Vec<MachOSlice>, CodeSignError> {
    match Mach::parse(data)? {
        Mach::Binary(macho) => {
            let (cputype, cpusubtype) = (macho.header.cputype, macho.header.cpusubtype);

            Ok(vec![MachOSlice {
                index: 0,
                offset: 0,
                data,
                macho,
                cputype,
                cpusubtype,
            }])
        }
        Mach::Fat(multiarch) => multiarch
            .iter_arches()
            .enumerate()
            .map(|(index, arch)| {
                let arch = arch?;
                let (start, end) = slice_range(data, &arch)?;
                let slice = &data[start..end];

                Ok(MachOSlice {
                    index,
                    offset: start,
                    data: slice,
                    macho: MachO::parse(slice, 0)?,
                    cputype: arch.cputype,
                    cpusubtype: arch.cpusubtype,
                })
            })
            .collect(),
    }
}

/// Content of an `LC_BUILD_VERSION` load command.
#[derive(Clone, Debug, Pread)]
pub struct BuildVersionCommand {
    /// LC_BUILD_VERSION
    pub cmd: u32,
    /// Size of load command data.
    ///
    /// sizeof(self) + self.ntools * sizeof(BuildToolsVersion)
    pub cmdsize: u32,
    /// Platform identifier.
    pub platform: u32,
    /// Minimum operating system version.
    ///
    /// X.Y.Z encoded in nibbles as xxxx.yy.zz.
    pub minos: u32,
    /// SDK version.
    ///
    /// X.Y.Z encoded in nibbles as xxxx.yy.zz.
    pub sdk: u32,
    /// Number of tools entries following this structure.
    pub ntools: u32,
}

/// Represents `PLATFORM_` mach-o constants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    MacOs,
    IOs,
    TvOs,
    WatchOs,
    BridgeOs,
    MacCatalyst,
    IosSimulator,
    TvOsSimulator,
    WatchOsSimulator,
    DriverKit,
    Unknown(u32),
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MacOs => f.write_str("macOS"),
            Self::IOs => f.write_str("iOS"),
            Self::TvOs => f.write_str("tvOS"),
            Self::WatchOs => f.write_str("watchOS"),
            Self::BridgeOs => f.write_str("bridgeOS"),
            Self::MacCatalyst => f.write_str("macCatalyst"),
            Self::IosSimulator => f.write_str("iOSSimulator"),
            Self::TvOsSimulator => f.write_str("tvOSSimulator"),
            Self::WatchOsSimulator => f.write_str("watchOSSimulator"),
            Self::DriverKit => f.write_str("driverKit"),
            Self::Unknown(v) => f.write_fmt(format_args!("Unknown ({})", v)),
        }
    }
}

impl From<u32> for Platform {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::MacOs,
            2 => Self::IOs,
            3 => Self::TvOs,
            4 => Self::WatchOs,
            5 => Self::BridgeOs,
            6 => Self::MacCatalyst,
            7 => Self::IosSimulator,
            8 => Self::TvOsSimulator,
            9 => Self::WatchOsSimulator,
            10 => Self::DriverKit,
            _ => Self::Unknown(v),
        }
    }
}

/// Targeting settings for a Mach-O binary.
#[derive(Clone, Debug)]
pub struct MachoTarget {
    /// The OS/platform being targeted.
    pub platform: Platform,
    /// Minimum required OS version.
    pub minimum_os_version: semver::Version,
    /// SDK version targeting.
    pub sdk_version: semver::Version,
}

/// Parses and integer with nibbles xxxx.yy.zz into a [semver::Version].
pub fn parse_version_nibbles(v: u32) -> semver::Version {
    let major = v >> 16;
    let minor = v << 16 >> 24;
    let patch = v & 0xff;

    semver::Version::new(major as _, minor as _, patch as _)
}

/// Convert a [semver::Version] to a u32 with nibble encoding used by Mach-O.
pub fn semver_to_macho_target_version(version: &semver::Version) -> u32 {
    let major = version.major as u32;
    let minor = version.minor as u32;
    let patch = version.patch as u32;

    (major << 16) | ((minor & 0xff) << 8) | (patch & 0xff)
}

/// Attempt to resolve the mach-o targeting settings for a mach-o binary.
///
/// `LC_BUILD_VERSION` is preferred over the legacy `LC_VERSION_MIN_*`
/// commands.
pub fn find_macho_targeting(
    macho_data: &[u8],
    macho: &MachO,
) -> Result<Option<MachoTarget>, CodeSignError> {
    let ctx = parse_magic_and_ctx(macho_data, 0)?
        .1
        .ok_or_else(|| CodeSignError::InvalidBinary("unknown Mach-O magic".into()))?;

    for lc in &macho.load_commands {
        if lc.command.cmd() == LC_BUILD_VERSION {
            let build_version = macho_data.pread_with::<BuildVersionCommand>(lc.offset, ctx.le)?;

            return Ok(Some(MachoTarget {
                platform: build_version.platform.into(),
                minimum_os_version: parse_version_nibbles(build_version.minos),
                sdk_version: parse_version_nibbles(build_version.sdk),
            }));
        }
    }

    for lc in &macho.load_commands {
        let command = match lc.command {
            CommandVariant::VersionMinMacosx(c) => Some((c, Platform::MacOs)),
            CommandVariant::VersionMinIphoneos(c) => Some((c, Platform::IOs)),
            CommandVariant::VersionMinTvos(c) => Some((c, Platform::TvOs)),
            CommandVariant::VersionMinWatchos(c) => Some((c, Platform::WatchOs)),
            _ => None,
        };

        if let Some((command, platform)) = command {
            return Ok(Some(MachoTarget {
                platform,
                minimum_os_version: parse_version_nibbles(command.version),
                sdk_version: parse_version_nibbles(command.sdk),
            }));
        }
    }

    Ok(None)
}
