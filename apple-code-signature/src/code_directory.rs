// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and related types.

use {
    crate::{
        digest::{Digest, DigestType, MultiDigest, CDHASH_LEN},
        embedded_signature::{
            read_and_validate_blob_header, read_blob_header, Blob, CodeSigningMagic,
            CodeSigningSlot,
        },
        error::CodeSignError,
    },
    log::debug,
    scroll::{IOwrite, Pread},
    std::{borrow::Cow, collections::BTreeMap, io::Write, str::FromStr},
};

bitflags::bitflags! {
    /// Code signature flags.
    ///
    /// These flags are embedded in the Code Directory and govern use of the embedded
    /// signature.
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit for the code when it starts running.
        const FORCE_HARD = 0x0100;
        /// Implicitly set the "kill" status bit for the code when it starts running.
        const FORCE_KILL = 0x0200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply runtime hardening policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        const LINKER_SIGNED = 0x20000;
    }
}

impl FromStr for CodeSignatureFlags {
    type Err = CodeSignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::HOST),
            "hard" => Ok(Self::FORCE_HARD),
            "kill" => Ok(Self::FORCE_KILL),
            "expires" => Ok(Self::FORCE_EXPIRATION),
            "library" => Ok(Self::LIBRARY_VALIDATION),
            "runtime" => Ok(Self::RUNTIME),
            "linker-signed" => Ok(Self::LINKER_SIGNED),
            _ => Err(CodeSignError::CodeSignatureUnknownFlag(s.to_string())),
        }
    }
}

impl CodeSignatureFlags {
    /// Attempt to convert a series of strings into a [CodeSignatureFlags].
    pub fn from_strs(s: &[&str]) -> Result<CodeSignatureFlags, CodeSignError> {
        s.iter()
            .try_fold(CodeSignatureFlags::empty(), |acc, s| Ok(acc | Self::from_str(s)?))
    }
}

bitflags::bitflags! {
    /// Flags that influence behavior of executable segment.
    pub struct ExecutableSegmentFlags: u64 {
        /// Executable segment belongs to main binary.
        const MAIN_BINARY = 0x0001;
        /// Allow unsigned pages (for debugging).
        const ALLOW_UNSIGNED = 0x0010;
        /// Main binary is debugger.
        const DEBUGGER = 0x0020;
        /// JIT enabled.
        const JIT = 0x0040;
        /// Skip library validation (obsolete).
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        /// Can bless code directory hash for execution.
        const CAN_LOAD_CD_HASH = 0x0100;
        /// Can execute blessed code directory hash.
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

impl FromStr for ExecutableSegmentFlags {
    type Err = CodeSignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main-binary" => Ok(Self::MAIN_BINARY),
            "allow-unsigned" => Ok(Self::ALLOW_UNSIGNED),
            "debugger" => Ok(Self::DEBUGGER),
            "jit" => Ok(Self::JIT),
            "skip-library-validation" => Ok(Self::SKIP_LIBRARY_VALIDATION),
            "can-load-cd-hash" => Ok(Self::CAN_LOAD_CD_HASH),
            "can-exec-cd-hash" => Ok(Self::CAN_EXEC_CD_HASH),
            _ => Err(CodeSignError::ExecutableSegmentUnknownFlag(s.to_string())),
        }
    }
}

/// Version of Code Directory data structure.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecutableSegment = 0x20400,
    SupportsRuntime = 0x20500,
    SupportsLinkage = 0x20600,
}

/// Read a NUL terminated string at an offset.
fn read_cstr<'d>(
    data: &'d [u8],
    offset: usize,
    what: &'static str,
) -> Result<&'d str, CodeSignError> {
    let tail = data
        .get(offset..)
        .ok_or(CodeSignError::CodeDirectoryMalformed(what))?;
    let end = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or(CodeSignError::CodeDirectoryMalformed(what))?;

    std::str::from_utf8(&tail[0..end]).map_err(|_| CodeSignError::CodeDirectoryMalformed(what))
}

fn to_u32(v: u64, what: &'static str) -> Result<u32, CodeSignError> {
    u32::try_from(v).map_err(|_| CodeSignError::ArithmeticOverflow(what))
}

/// Represents a code directory blob entry.
///
/// This struct is versioned and has been extended over time. It represents
/// a superset of all fields in all versions. The parser sets `Option<T>`
/// fields to `None` when the version is lower than the version that field
/// was introduced in.
#[derive(Debug)]
pub struct CodeDirectoryBlob<'a> {
    /// Compatibility version.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: CodeSignatureFlags,
    /// Limit to main image signature range.
    pub code_limit: u32,
    /// Size of each hash in bytes.
    pub hash_size: u8,
    /// Type of hash.
    pub hash_type: DigestType,
    /// Platform identifier. 0 if not platform binary.
    pub platform: u8,
    /// Page size in bytes. 0 means unpaged.
    pub page_size: u32,
    pub spare2: u32,
    // Version 0x20100
    pub scatter_offset: Option<u32>,
    // Version 0x20300
    pub spare3: Option<u32>,
    /// Limit to main image signature range, 64 bits.
    pub code_limit_64: Option<u64>,
    // Version 0x20400
    pub exec_seg_base: Option<u64>,
    pub exec_seg_limit: Option<u64>,
    pub exec_seg_flags: Option<ExecutableSegmentFlags>,
    // Version 0x20500
    pub runtime: Option<u32>,
    pub pre_encrypt_offset: Option<u32>,
    // Version 0x20600
    pub linkage_hash_type: Option<u8>,
    pub linkage_truncated: Option<u8>,
    pub spare4: Option<u16>,
    pub linkage_offset: Option<u32>,
    pub linkage_size: Option<u32>,

    // End of blob header data / start of derived data.
    pub ident: Cow<'a, str>,
    pub team_name: Option<Cow<'a, str>>,
    pub code_hashes: Vec<Digest<'a>>,
    pub special_hashes: BTreeMap<CodeSigningSlot, Digest<'a>>,
}

impl<'a> Blob<'a> for CodeDirectoryBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::CodeDirectory)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        read_and_validate_blob_header(data, Self::magic(), "code directory blob")?;
        // The parsed view never extends past the self-described length.
        let (_, length, _) = read_blob_header(data)?;
        let data = &data[0..length];

        let offset = &mut 8;

        let version = data.gread_with::<u32>(offset, scroll::BE)?;
        let flags = CodeSignatureFlags::from_bits_truncate(data.gread_with(offset, scroll::BE)?);
        let hash_offset = data.gread_with::<u32>(offset, scroll::BE)? as usize;
        let ident_offset = data.gread_with::<u32>(offset, scroll::BE)? as usize;
        let n_special_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_code_slots = data.gread_with::<u32>(offset, scroll::BE)? as usize;
        let code_limit = data.gread_with(offset, scroll::BE)?;
        let hash_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let hash_type = DigestType::from(data.gread_with::<u8>(offset, scroll::BE)?);
        let platform = data.gread_with(offset, scroll::BE)?;
        let page_size_shift = data.gread_with::<u8>(offset, scroll::BE)?;
        let spare2 = data.gread_with(offset, scroll::BE)?;

        if let Ok(expected) = hash_type.hash_len() {
            if expected != hash_size as usize {
                return Err(CodeSignError::CodeDirectoryMalformed(
                    "hash size inconsistent with hash type",
                ));
            }
        }
        if hash_size == 0 {
            return Err(CodeSignError::CodeDirectoryMalformed("zero hash size"));
        }

        let page_size = match page_size_shift {
            0 => 0,
            shift if shift < 32 => 1u32 << shift,
            _ => return Err(CodeSignError::CodeDirectoryMalformed("page size")),
        };

        let at_least = |v: CodeDirectoryVersion| version >= v as u32;

        let scatter_offset = if at_least(CodeDirectoryVersion::SupportsScatter) {
            Some(data.gread_with::<u32>(offset, scroll::BE)?).filter(|v| *v != 0)
        } else {
            None
        };
        let team_offset = if at_least(CodeDirectoryVersion::SupportsTeamId) {
            Some(data.gread_with::<u32>(offset, scroll::BE)?).filter(|v| *v != 0)
        } else {
            None
        };

        let (spare3, code_limit_64) = if at_least(CodeDirectoryVersion::SupportsCodeLimit64) {
            (
                Some(data.gread_with(offset, scroll::BE)?),
                Some(data.gread_with::<u64>(offset, scroll::BE)?).filter(|v| *v != 0),
            )
        } else {
            (None, None)
        };

        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if at_least(CodeDirectoryVersion::SupportsExecutableSegment) {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(ExecutableSegmentFlags::from_bits_truncate(
                        data.gread_with::<u64>(offset, scroll::BE)?,
                    )),
                )
            } else {
                (None, None, None)
            };

        let (runtime, pre_encrypt_offset) = if at_least(CodeDirectoryVersion::SupportsRuntime) {
            (
                Some(data.gread_with(offset, scroll::BE)?),
                Some(data.gread_with(offset, scroll::BE)?),
            )
        } else {
            (None, None)
        };

        let (linkage_hash_type, linkage_truncated, spare4, linkage_offset, linkage_size) =
            if at_least(CodeDirectoryVersion::SupportsLinkage) {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                )
            } else {
                (None, None, None, None, None)
            };

        let header_end = *offset;

        if ident_offset < header_end {
            return Err(CodeSignError::CodeDirectoryMalformed("identifier offset"));
        }
        let ident = Cow::from(read_cstr(data, ident_offset, "identifier")?);

        let team_name = match team_offset {
            Some(team_offset) if (team_offset as usize) >= header_end => {
                Some(Cow::from(read_cstr(data, team_offset as usize, "team")?))
            }
            Some(_) => return Err(CodeSignError::CodeDirectoryMalformed("team offset")),
            None => None,
        };

        let hash_size_usize = hash_size as usize;
        let specials_len = (n_special_slots as usize)
            .checked_mul(hash_size_usize)
            .ok_or(CodeSignError::CodeDirectoryMalformed("special slot count"))?;
        let specials_start = hash_offset
            .checked_sub(specials_len)
            .filter(|v| *v >= header_end)
            .ok_or(CodeSignError::CodeDirectoryMalformed("special slot count"))?;
        let code_end = n_code_slots
            .checked_mul(hash_size_usize)
            .and_then(|v| v.checked_add(hash_offset))
            .filter(|v| *v <= data.len())
            .ok_or(CodeSignError::CodeDirectoryMalformed("code slot count"))?;

        let code_hashes = data[hash_offset..code_end]
            .chunks_exact(hash_size_usize)
            .map(|h| Digest { data: h.into() })
            .collect::<Vec<_>>();

        // Specials are stored in descending slot order ending just before
        // the hash offset.
        let special_hashes = data[specials_start..hash_offset]
            .chunks_exact(hash_size_usize)
            .enumerate()
            .map(|(i, h)| {
                (
                    CodeSigningSlot::from(n_special_slots - i as u32),
                    Digest { data: h.into() },
                )
            })
            .collect::<BTreeMap<_, _>>();

        Ok(Self {
            version,
            flags,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size,
            spare2,
            scatter_offset,
            spare3,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime,
            pre_encrypt_offset,
            linkage_hash_type,
            linkage_truncated,
            spare4,
            linkage_offset,
            linkage_size,
            ident,
            team_name,
            code_hashes,
            special_hashes,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        if self.scatter_offset.is_some() {
            return Err(CodeSignError::Unsupported("scatter vectors"));
        }

        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

        // Offsets are unknown until variable length data is laid out, so
        // placeholders are written and patched afterwards.
        cursor.iowrite_with(self.version, scroll::BE)?;
        cursor.iowrite_with(self.flags.bits(), scroll::BE)?;
        let hash_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;
        let ident_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;

        // Special hashes are addressed by slot number counting back from the
        // hash offset. Missing slots below the highest populated one are
        // written as zeros.
        let highest_slot = self.highest_special_slot();

        cursor.iowrite_with(highest_slot, scroll::BE)?;
        cursor.iowrite_with(to_u32(self.code_hashes.len() as u64, "code slot count")?, scroll::BE)?;
        cursor.iowrite_with(self.code_limit, scroll::BE)?;
        cursor.iowrite_with(self.hash_size, scroll::BE)?;
        cursor.iowrite_with(u8::from(self.hash_type), scroll::BE)?;
        cursor.iowrite_with(self.platform, scroll::BE)?;
        let page_shift = if self.page_size == 0 {
            0u8
        } else {
            self.page_size.trailing_zeros() as u8
        };
        cursor.iowrite_with(page_shift, scroll::BE)?;
        cursor.iowrite_with(self.spare2, scroll::BE)?;

        let mut team_offset_cursor_position = None;
        let at_least = |v: CodeDirectoryVersion| self.version >= v as u32;

        if at_least(CodeDirectoryVersion::SupportsScatter) {
            cursor.iowrite_with(0u32, scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsTeamId) {
            team_offset_cursor_position = Some(cursor.position());
            cursor.iowrite_with(0u32, scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsCodeLimit64) {
            cursor.iowrite_with(self.spare3.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsExecutableSegment) {
            cursor.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(
                self.exec_seg_flags
                    .unwrap_or_else(ExecutableSegmentFlags::empty)
                    .bits(),
                scroll::BE,
            )?;
        }
        if at_least(CodeDirectoryVersion::SupportsRuntime) {
            cursor.iowrite_with(self.runtime.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.pre_encrypt_offset.unwrap_or(0), scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsLinkage) {
            cursor.iowrite_with(self.linkage_hash_type.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_truncated.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.spare4.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_offset.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_size.unwrap_or(0), scroll::BE)?;
        }

        let identity_offset = cursor.position();
        cursor.write_all(self.ident.as_bytes())?;
        cursor.write_all(b"\0")?;

        let team_offset = cursor.position();
        let write_team = team_offset_cursor_position.is_some() && self.team_name.is_some();
        if let (true, Some(team_name)) = (write_team, &self.team_name) {
            cursor.write_all(team_name.as_bytes())?;
            cursor.write_all(b"\0")?;
        }

        for slot_index in (1..highest_slot + 1).rev() {
            match self.special_hashes.get(&CodeSigningSlot::from(slot_index)) {
                Some(hash) if hash.data.len() == self.hash_size as usize => {
                    cursor.write_all(&hash.data)?;
                }
                Some(_) => {
                    return Err(CodeSignError::CodeDirectoryMalformed(
                        "special slot digest has wrong length",
                    ))
                }
                None => {
                    cursor.write_all(&vec![0u8; self.hash_size as usize])?;
                }
            }
        }

        let code_hashes_start_offset = cursor.position();

        for hash in &self.code_hashes {
            cursor.write_all(&hash.data)?;
        }

        // Recorded offsets are relative to the blob start, which includes
        // the 8 byte header not present in this buffer.
        cursor.set_position(hash_offset_cursor_position);
        cursor.iowrite_with(to_u32(code_hashes_start_offset + 8, "hash offset")?, scroll::BE)?;

        cursor.set_position(ident_offset_cursor_position);
        cursor.iowrite_with(to_u32(identity_offset + 8, "identifier offset")?, scroll::BE)?;

        if let (true, Some(offset)) = (write_team, team_offset_cursor_position) {
            cursor.set_position(offset);
            cursor.iowrite_with(to_u32(team_offset + 8, "team offset")?, scroll::BE)?;
        }

        Ok(cursor.into_inner())
    }
}

impl<'a> CodeDirectoryBlob<'a> {
    /// Highest special slot number with a recorded digest.
    pub fn highest_special_slot(&self) -> u32 {
        self.special_hashes
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0)
    }

    /// The effective code limit, preferring the 64-bit field when set.
    pub fn effective_code_limit(&self) -> u64 {
        self.code_limit_64.unwrap_or(self.code_limit as u64)
    }

    /// Special slots whose digest is not all zeros.
    pub fn populated_special_slots(&self) -> Vec<CodeSigningSlot> {
        self.special_hashes
            .iter()
            .filter(|(_, digest)| !digest.is_null())
            .map(|(slot, _)| *slot)
            .collect()
    }

    /// Compute the cdhash of this code directory as we would serialize it.
    pub fn cdhash(&self) -> Result<Vec<u8>, CodeSignError> {
        cdhash(&self.to_blob_bytes()?, self.hash_type)
    }

    /// Adjust the version of the data structure according to what fields are set.
    ///
    /// Returns the old version.
    pub fn adjust_version(&mut self) -> u32 {
        let old_version = self.version;

        let mut minimum_version = CodeDirectoryVersion::Initial;

        if self.scatter_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsScatter;
        }
        if self.team_name.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsTeamId;
        }
        if self.spare3.is_some() || self.code_limit_64.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsCodeLimit64;
        }
        if self.exec_seg_base.is_some()
            || self.exec_seg_limit.is_some()
            || self.exec_seg_flags.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsExecutableSegment;
        }
        if self.runtime.is_some() || self.pre_encrypt_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsRuntime;
        }
        if self.linkage_hash_type.is_some()
            || self.linkage_truncated.is_some()
            || self.spare4.is_some()
            || self.linkage_offset.is_some()
            || self.linkage_size.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsLinkage;
        }

        self.version = minimum_version as u32;

        old_version
    }

    /// Clears optional fields that are newer than the current version.
    pub fn clear_newer_fields(&mut self) {
        let below = |v: CodeDirectoryVersion| self.version < v as u32;

        if below(CodeDirectoryVersion::SupportsScatter) {
            self.scatter_offset = None;
        }
        if below(CodeDirectoryVersion::SupportsTeamId) {
            self.team_name = None;
        }
        if below(CodeDirectoryVersion::SupportsCodeLimit64) {
            self.spare3 = None;
            self.code_limit_64 = None;
        }
        if below(CodeDirectoryVersion::SupportsExecutableSegment) {
            self.exec_seg_base = None;
            self.exec_seg_limit = None;
            self.exec_seg_flags = None;
        }
        if below(CodeDirectoryVersion::SupportsRuntime) {
            self.runtime = None;
            self.pre_encrypt_offset = None;
        }
        if below(CodeDirectoryVersion::SupportsLinkage) {
            self.linkage_hash_type = None;
            self.linkage_truncated = None;
            self.spare4 = None;
            self.linkage_offset = None;
            self.linkage_size = None;
        }
    }

    pub fn to_owned(&self) -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            version: self.version,
            flags: self.flags,
            code_limit: self.code_limit,
            hash_size: self.hash_size,
            hash_type: self.hash_type,
            platform: self.platform,
            page_size: self.page_size,
            spare2: self.spare2,
            scatter_offset: self.scatter_offset,
            spare3: self.spare3,
            code_limit_64: self.code_limit_64,
            exec_seg_base: self.exec_seg_base,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
            runtime: self.runtime,
            pre_encrypt_offset: self.pre_encrypt_offset,
            linkage_hash_type: self.linkage_hash_type,
            linkage_truncated: self.linkage_truncated,
            spare4: self.spare4,
            linkage_offset: self.linkage_offset,
            linkage_size: self.linkage_size,
            ident: Cow::Owned(self.ident.clone().into_owned()),
            team_name: self
                .team_name
                .as_ref()
                .map(|x| Cow::Owned(x.clone().into_owned())),
            code_hashes: self.code_hashes.iter().map(|h| h.to_owned()).collect(),
            special_hashes: self
                .special_hashes
                .iter()
                .map(|(k, v)| (*k, v.to_owned()))
                .collect(),
        }
    }
}

/// Compute a cdhash from serialized code directory bytes.
pub fn cdhash(code_directory: &[u8], hash_type: DigestType) -> Result<Vec<u8>, CodeSignError> {
    let mut digest = hash_type.digest_data(code_directory)?;
    digest.truncate(CDHASH_LEN);

    Ok(digest)
}

/// Accumulates the content covered by code directories.
///
/// One builder produces one [CodeDirectoryBlob] per requested digest type.
/// Code pages and special slot components are each read once, with every
/// requested algorithm digesting them simultaneously.
#[derive(Clone, Debug)]
pub struct CodeDirectoryBuilder {
    identifier: String,
    team_id: Option<String>,
    flags: CodeSignatureFlags,
    platform: u8,
    page_size: u32,
    executable_segment: Option<(u64, u64, ExecutableSegmentFlags)>,
    runtime: Option<u32>,
    special_components: BTreeMap<CodeSigningSlot, Vec<u8>>,
}

impl CodeDirectoryBuilder {
    /// Default page size for code hashing.
    pub const DEFAULT_PAGE_SIZE: u32 = 4096;

    pub fn new(identifier: impl ToString) -> Self {
        Self {
            identifier: identifier.to_string(),
            team_id: None,
            flags: CodeSignatureFlags::empty(),
            platform: 0,
            page_size: Self::DEFAULT_PAGE_SIZE,
            executable_segment: None,
            runtime: None,
            special_components: BTreeMap::new(),
        }
    }

    pub fn team_id(mut self, team_id: Option<String>) -> Self {
        self.team_id = team_id;
        self
    }

    pub fn flags(mut self, flags: CodeSignatureFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn platform(mut self, platform: u8) -> Self {
        self.platform = platform;
        self
    }

    /// Set the page size. Must be 0 (unpaged) or a power of two.
    pub fn page_size(mut self, page_size: u32) -> Result<Self, CodeSignError> {
        if page_size != 0 && !page_size.is_power_of_two() {
            return Err(CodeSignError::CodeDirectoryMalformed(
                "page size must be a power of two",
            ));
        }

        self.page_size = page_size;
        Ok(self)
    }

    pub fn executable_segment(mut self, base: u64, limit: u64, flags: ExecutableSegmentFlags) -> Self {
        self.executable_segment = Some((base, limit, flags));
        self
    }

    pub fn runtime(mut self, runtime: Option<u32>) -> Self {
        self.runtime = runtime;
        self
    }

    /// Register the content of a special slot component.
    ///
    /// The content is the exact bytes to digest: a serialized blob for blob
    /// backed slots or raw file content for `Info.plist` and the resource
    /// seal.
    pub fn add_special_component(
        &mut self,
        slot: CodeSigningSlot,
        content: Vec<u8>,
    ) -> Result<(), CodeSignError> {
        if !slot.is_code_directory_special_slot() {
            return Err(CodeSignError::InternalError(format!(
                "slot {:?} cannot be recorded in a code directory",
                slot
            )));
        }

        self.special_components.insert(slot, content);
        Ok(())
    }

    pub fn special_slots(&self) -> impl Iterator<Item = &CodeSigningSlot> {
        self.special_components.keys()
    }

    /// Number of special slots that will be serialized.
    pub fn special_slot_count(&self) -> u32 {
        self.special_components
            .keys()
            .map(|s| u32::from(*s))
            .max()
            .unwrap_or(0)
    }

    /// Estimate the serialized size of one code directory.
    pub fn estimate_size(&self, digest: DigestType, code_limit: u64) -> Result<usize, CodeSignError> {
        let code_slots = crate::digest::code_slot_count(code_limit, self.page_size)?;
        let code_slots = usize::try_from(code_slots)
            .map_err(|_| CodeSignError::ArithmeticOverflow("code slot count"))?;

        // The largest fixed header (linkage version) is 0x60 bytes.
        Ok(0x60
            + self.identifier.len()
            + 1
            + self.team_id.as_ref().map(|t| t.len() + 1).unwrap_or(0)
            + (self.special_slot_count() as usize + code_slots) * digest.hash_len()?)
    }

    /// Build code directories over `code` for each digest type.
    ///
    /// `code` is the content covered by code slots, i.e. everything before
    /// the signature.
    pub fn build(
        &self,
        code: &[u8],
        digests: &[DigestType],
    ) -> Result<Vec<CodeDirectoryBlob<'static>>, CodeSignError> {
        let mut code_hashes: Vec<Vec<Digest<'static>>> = vec![vec![]; digests.len()];

        let mut hash_pages = |page: &[u8]| -> Result<(), CodeSignError> {
            let mut hasher = MultiDigest::new(digests)?;
            hasher.update(page);
            let set = hasher.finish();

            for (i, digest) in digests.iter().enumerate() {
                let value = set
                    .get(*digest)
                    .ok_or_else(|| CodeSignError::InternalError("missing digest".into()))?;
                code_hashes[i].push(Digest::from(value.to_vec()));
            }

            Ok(())
        };

        if self.page_size == 0 {
            if !code.is_empty() {
                hash_pages(code)?;
            }
        } else {
            for page in code.chunks(self.page_size as usize) {
                hash_pages(page)?;
            }
        }

        let mut special_hashes: Vec<BTreeMap<CodeSigningSlot, Digest<'static>>> =
            vec![BTreeMap::new(); digests.len()];
        for (slot, content) in &self.special_components {
            let mut hasher = MultiDigest::new(digests)?;
            hasher.update(content);
            let set = hasher.finish();

            for (i, digest) in digests.iter().enumerate() {
                if let Some(value) = set.get(*digest) {
                    special_hashes[i].insert(*slot, Digest::from(value.to_vec()));
                }
            }
        }

        let code_limit = code.len() as u64;

        digests
            .iter()
            .zip(code_hashes.into_iter().zip(special_hashes.into_iter()))
            .map(|(digest, (code_hashes, special_hashes))| {
                debug!(
                    "building code directory using digest {} over {} bytes",
                    digest, code_limit
                );

                let (exec_seg_base, exec_seg_limit, exec_seg_flags) = match self.executable_segment
                {
                    Some((base, limit, flags)) => (Some(base), Some(limit), Some(flags)),
                    None => (None, None, None),
                };

                let (code_limit_32, code_limit_64) = match u32::try_from(code_limit) {
                    Ok(v) => (v, None),
                    Err(_) => (u32::MAX, Some(code_limit)),
                };

                let mut cd = CodeDirectoryBlob {
                    version: 0,
                    flags: self.flags,
                    code_limit: code_limit_32,
                    hash_size: digest.hash_len()? as u8,
                    hash_type: *digest,
                    platform: self.platform,
                    page_size: self.page_size,
                    spare2: 0,
                    scatter_offset: None,
                    spare3: None,
                    code_limit_64,
                    exec_seg_base,
                    exec_seg_limit,
                    exec_seg_flags,
                    runtime: self.runtime,
                    pre_encrypt_offset: self.runtime.map(|_| 0),
                    linkage_hash_type: None,
                    linkage_truncated: None,
                    spare4: None,
                    linkage_offset: None,
                    linkage_size: None,
                    ident: Cow::Owned(self.identifier.clone()),
                    team_name: self.team_id.clone().map(Cow::Owned),
                    code_hashes,
                    special_hashes,
                };

                cd.adjust_version();
                cd.clear_newer_fields();

                Ok(cd)
            })
            .collect()
    }
}

/// The set of code directories of one signed object, keyed by digest type.
///
/// Entries keep their serialized form so that cdhashes are always computed
/// over the exact bytes that are (or will be) in the signature.
#[derive(Debug, Default)]
pub struct CodeDirectorySet<'a> {
    entries: Vec<(CodeDirectoryBlob<'a>, Vec<u8>)>,
}

impl<'a> CodeDirectorySet<'a> {
    /// Insert a code directory, serializing it.
    pub fn insert(&mut self, cd: CodeDirectoryBlob<'a>) -> Result<(), CodeSignError> {
        let data = cd.to_blob_bytes()?;
        self.insert_with_data(cd, data)
    }

    /// Insert a code directory along with its exact serialized bytes.
    pub fn insert_with_data(
        &mut self,
        cd: CodeDirectoryBlob<'a>,
        data: Vec<u8>,
    ) -> Result<(), CodeSignError> {
        if self.entries.iter().any(|(e, _)| e.hash_type == cd.hash_type) {
            return Err(CodeSignError::DuplicateCodeDirectory(cd.hash_type));
        }

        if self.entries.len() > CodeSigningSlot::ALTERNATES.len() {
            return Err(CodeSignError::CodeDirectoryMalformed(
                "too many code directories",
            ));
        }

        self.entries.push((cd, data));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn primary_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .position(|(cd, _)| cd.hash_type == DigestType::Sha1)
            .or_else(|| (!self.entries.is_empty()).then(|| 0))
    }

    /// The code directory occupying the primary slot.
    pub fn primary(&self) -> Option<&CodeDirectoryBlob<'a>> {
        self.primary_index().map(|i| &self.entries[i].0)
    }

    pub fn primary_data(&self) -> Option<&[u8]> {
        self.primary_index().map(|i| self.entries[i].1.as_slice())
    }

    /// Assign every code directory to its superblob slot.
    ///
    /// The primary goes to [CodeSigningSlot::CodeDirectory] and the rest to
    /// alternate slots in insertion order.
    pub fn slots(&self) -> Vec<(CodeSigningSlot, &CodeDirectoryBlob<'a>, &[u8])> {
        let primary = self.primary_index();
        let mut alternates = CodeSigningSlot::ALTERNATES.iter();

        let mut res = vec![];
        if let Some(i) = primary {
            res.push((
                CodeSigningSlot::CodeDirectory,
                &self.entries[i].0,
                self.entries[i].1.as_slice(),
            ));
        }

        for (i, (cd, data)) in self.entries.iter().enumerate() {
            if Some(i) == primary {
                continue;
            }
            if let Some(slot) = alternates.next() {
                res.push((*slot, cd, data.as_slice()));
            }
        }

        res
    }

    /// The strongest supported code directory.
    pub fn best(&self) -> Option<&CodeDirectoryBlob<'a>> {
        self.entries
            .iter()
            .filter(|(cd, _)| cd.hash_type.strength() > 0)
            .max_by_key(|(cd, _)| cd.hash_type.strength())
            .map(|(cd, _)| cd)
    }

    pub fn best_data(&self) -> Option<&[u8]> {
        self.entries
            .iter()
            .filter(|(cd, _)| cd.hash_type.strength() > 0)
            .max_by_key(|(cd, _)| cd.hash_type.strength())
            .map(|(_, data)| data.as_slice())
    }

    /// One cdhash per supported code directory, sorted by digest type id.
    pub fn cd_hashes(&self) -> Result<Vec<(DigestType, Vec<u8>)>, CodeSignError> {
        let mut res = self
            .entries
            .iter()
            .filter(|(cd, _)| cd.hash_type.strength() > 0)
            .map(|(cd, data)| Ok((cd.hash_type, cdhash(data, cd.hash_type)?)))
            .collect::<Result<Vec<_>, CodeSignError>>()?;

        res.sort_by_key(|(digest, _)| u8::from(*digest));

        Ok(res)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodeDirectoryBlob<'a>> {
        self.entries.iter().map(|(cd, _)| cd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CodeDirectoryBuilder {
        CodeDirectoryBuilder::new("com.example.tool")
            .flags(CodeSignatureFlags::ADHOC)
            .page_size(4096)
            .unwrap()
    }

    #[test]
    fn code_signature_flags_from_str() -> Result<(), CodeSignError> {
        assert_eq!(
            CodeSignatureFlags::from_strs(&["host", "runtime"])?,
            CodeSignatureFlags::HOST | CodeSignatureFlags::RUNTIME
        );
        assert!(CodeSignatureFlags::from_str("bogus").is_err());
        assert_eq!(
            ExecutableSegmentFlags::from_str("main-binary")?,
            ExecutableSegmentFlags::MAIN_BINARY
        );

        Ok(())
    }

    #[test]
    fn build_and_parse() -> Result<(), CodeSignError> {
        let code = vec![0x41u8; 4096 * 2 + 10];
        let mut builder = builder().team_id(Some("ABCDE12345".into()));
        builder.add_special_component(CodeSigningSlot::RequirementSet, b"reqs".to_vec())?;

        let cds = builder.build(&code, &[DigestType::Sha1, DigestType::Sha256])?;
        assert_eq!(cds.len(), 2);

        let cd = &cds[1];
        assert_eq!(cd.version, CodeDirectoryVersion::SupportsTeamId as u32);
        assert_eq!(cd.code_hashes.len(), 3);
        assert_eq!(cd.code_limit, code.len() as u32);
        assert_eq!(
            cd.code_hashes[0].to_vec(),
            DigestType::Sha256.digest_data(&code[0..4096])?
        );

        let data = cd.to_blob_bytes()?;
        let parsed = CodeDirectoryBlob::from_blob_bytes(&data)?;
        assert_eq!(parsed.ident, "com.example.tool");
        assert_eq!(parsed.team_name.as_deref(), Some("ABCDE12345"));
        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.hash_type, DigestType::Sha256);
        assert_eq!(parsed.code_hashes.len(), 3);
        // Slot 1 is zero filled below the populated slot 2.
        assert_eq!(parsed.special_hashes.len(), 2);
        assert!(parsed.special_hashes[&CodeSigningSlot::Info].is_null());
        assert_eq!(
            parsed.special_hashes[&CodeSigningSlot::RequirementSet].to_vec(),
            DigestType::Sha256.digest_data(b"reqs")?
        );
        assert_eq!(
            parsed.populated_special_slots(),
            vec![CodeSigningSlot::RequirementSet]
        );
        assert_eq!(parsed.to_blob_bytes()?, data);
        assert_eq!(cd.cdhash()?.len(), 20);

        Ok(())
    }

    #[test]
    fn no_specials() -> Result<(), CodeSignError> {
        let cds = builder().build(b"hello", &[DigestType::Sha256])?;
        let data = cds[0].to_blob_bytes()?;

        // n_special_slots
        assert_eq!(data.pread_with::<u32>(0x18, scroll::BE)?, 0);
        assert_eq!(cds[0].version, CodeDirectoryVersion::Initial as u32);

        Ok(())
    }

    #[test]
    fn unpaged() -> Result<(), CodeSignError> {
        let cds = builder().page_size(0)?.build(&[1u8; 10000], &[DigestType::Sha1])?;
        assert_eq!(cds[0].code_hashes.len(), 1);

        let data = cds[0].to_blob_bytes()?;
        assert_eq!(CodeDirectoryBlob::from_blob_bytes(&data)?.page_size, 0);

        assert!(builder().page_size(3000).is_err());

        Ok(())
    }

    #[test]
    fn malformed() -> Result<(), CodeSignError> {
        let cds = builder().build(b"hello", &[DigestType::Sha256])?;
        let data = cds[0].to_blob_bytes()?;

        // Hash size inconsistent with hash type.
        let mut bad = data.clone();
        bad[0x24] = 20;
        assert!(matches!(
            CodeDirectoryBlob::from_blob_bytes(&bad),
            Err(CodeSignError::CodeDirectoryMalformed(_))
        ));

        // Code slot count overruns the blob.
        let mut bad = data.clone();
        bad[0x1c..0x20].copy_from_slice(&100u32.to_be_bytes());
        assert!(matches!(
            CodeDirectoryBlob::from_blob_bytes(&bad),
            Err(CodeSignError::CodeDirectoryMalformed(_))
        ));

        // Length field larger than the data.
        let mut bad = data;
        bad[4..8].copy_from_slice(&10000u32.to_be_bytes());
        assert!(CodeDirectoryBlob::from_blob_bytes(&bad).is_err());

        Ok(())
    }

    #[test]
    fn directory_set() -> Result<(), CodeSignError> {
        let cds = builder().build(
            b"content",
            &[DigestType::Sha256, DigestType::Sha1, DigestType::Sha384],
        )?;

        let mut set = CodeDirectorySet::default();
        for cd in cds {
            set.insert(cd)?;
        }

        assert_eq!(set.primary().map(|cd| cd.hash_type), Some(DigestType::Sha1));
        assert_eq!(set.best().map(|cd| cd.hash_type), Some(DigestType::Sha384));

        let slots = set.slots();
        assert_eq!(slots[0].0, CodeSigningSlot::CodeDirectory);
        assert_eq!(slots[0].1.hash_type, DigestType::Sha1);
        assert_eq!(slots[1].0, CodeSigningSlot::AlternateCodeDirectory0);
        assert_eq!(slots[1].1.hash_type, DigestType::Sha256);
        assert_eq!(slots[2].0, CodeSigningSlot::AlternateCodeDirectory1);

        let hashes = set.cd_hashes()?;
        assert_eq!(
            hashes.iter().map(|(d, _)| *d).collect::<Vec<_>>(),
            vec![DigestType::Sha1, DigestType::Sha256, DigestType::Sha384]
        );
        assert!(hashes.iter().all(|(_, h)| h.len() == 20));

        let dup = builder().build(b"content", &[DigestType::Sha256])?;
        assert!(matches!(
            set.insert(dup.into_iter().next().unwrap()),
            Err(CodeSignError::DuplicateCodeDirectory(DigestType::Sha256))
        ));

        Ok(())
    }

    #[test]
    fn primary_without_sha1() -> Result<(), CodeSignError> {
        let mut set = CodeDirectorySet::default();
        for cd in builder().build(b"x", &[DigestType::Sha384, DigestType::Sha256])? {
            set.insert(cd)?;
        }

        assert_eq!(set.primary().map(|cd| cd.hash_type), Some(DigestType::Sha384));

        Ok(())
    }
}
