// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded signature data structures (superblobs, magic values, etc).
//!
//! The high-level format of signature data is:
//!
//! * A `SuperBlob` header describes the total length of data and the number of
//!   *blob* sections that follow.
//! * An array of `BlobIndex` describing the slot and offset of all *blob*
//!   sections that follow.
//! * N *blob* sections. Every blob begins with a big-endian u32 magic and a
//!   u32 length which includes the 8 byte header.
//!
//! All of this data comes from untrusted binaries. Every self-described
//! length and offset is checked against the data actually available before
//! anything is sliced.

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        code_requirement::{CodeRequirements, RequirementType},
        digest::DigestType,
        error::CodeSignError,
    },
    cryptographic_message_syntax::SignedData,
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        cmp::Ordering,
        collections::BTreeMap,
        io::Write,
    },
};

/// Defines header magic for various payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningMagic {
    /// Code requirement blob.
    Requirement,
    /// Code requirements blob.
    RequirementSet,
    /// CodeDirectory blob.
    CodeDirectory,
    /// Embedded signature.
    ///
    /// This is the magic of the SuperBlob.
    EmbeddedSignature,
    /// Entitlements blob.
    Entitlements,
    /// DER encoded entitlements blob.
    EntitlementsDer,
    /// Multi-arch collection of embedded signatures.
    DetachedSignature,
    /// Generic blob wrapper.
    ///
    /// The CMS signature and the top directory index are stored in this type.
    BlobWrapper,
    /// Unknown magic.
    Unknown(u32),
}

impl From<u32> for CodeSigningMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade7171 => Self::Entitlements,
            0xfade7172 => Self::EntitlementsDer,
            0xfade0cc1 => Self::DetachedSignature,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Requirement => 0xfade0c00,
            CodeSigningMagic::RequirementSet => 0xfade0c01,
            CodeSigningMagic::CodeDirectory => 0xfade0c02,
            CodeSigningMagic::EmbeddedSignature => 0xfade0cc0,
            CodeSigningMagic::Entitlements => 0xfade7171,
            CodeSigningMagic::EntitlementsDer => 0xfade7172,
            CodeSigningMagic::DetachedSignature => 0xfade0cc1,
            CodeSigningMagic::BlobWrapper => 0xfade0b01,
            CodeSigningMagic::Unknown(v) => v,
        }
    }
}

/// A well-known slot within code signing data.
///
/// The application specific slot and the top directory index share the
/// numeric id 4. See [CodeSigningSlot::TOP_DIRECTORY].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeSigningSlot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    Application,
    Entitlements,
    RepSpecific,
    EntitlementsDer,
    AlternateCodeDirectory0,
    AlternateCodeDirectory1,
    AlternateCodeDirectory2,
    AlternateCodeDirectory3,
    AlternateCodeDirectory4,
    Signature,
    Identification,
    Ticket,
    Unknown(u32),
}

impl std::fmt::Debug for CodeSigningSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CodeDirectory => "CodeDirectory",
            Self::Info => "Info",
            Self::RequirementSet => "RequirementSet",
            Self::ResourceDir => "Resources",
            Self::Application => "Application / Top Directory",
            Self::Entitlements => "Entitlements",
            Self::RepSpecific => "Rep Specific",
            Self::EntitlementsDer => "DER Entitlements",
            Self::AlternateCodeDirectory0
            | Self::AlternateCodeDirectory1
            | Self::AlternateCodeDirectory2
            | Self::AlternateCodeDirectory3
            | Self::AlternateCodeDirectory4 => "CodeDirectory Alternate",
            Self::Signature => "CMS Signature",
            Self::Identification => "Identification",
            Self::Ticket => "Ticket",
            Self::Unknown(_) => "Unknown",
        };

        f.write_fmt(format_args!("{} ({})", name, u32::from(*self)))
    }
}

impl From<u32> for CodeSigningSlot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::Application,
            5 => Self::Entitlements,
            6 => Self::RepSpecific,
            7 => Self::EntitlementsDer,
            0x1000 => Self::AlternateCodeDirectory0,
            0x1001 => Self::AlternateCodeDirectory1,
            0x1002 => Self::AlternateCodeDirectory2,
            0x1003 => Self::AlternateCodeDirectory3,
            0x1004 => Self::AlternateCodeDirectory4,
            0x10000 => Self::Signature,
            0x10001 => Self::Identification,
            0x10002 => Self::Ticket,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(v: CodeSigningSlot) -> Self {
        match v {
            CodeSigningSlot::CodeDirectory => 0,
            CodeSigningSlot::Info => 1,
            CodeSigningSlot::RequirementSet => 2,
            CodeSigningSlot::ResourceDir => 3,
            CodeSigningSlot::Application => 4,
            CodeSigningSlot::Entitlements => 5,
            CodeSigningSlot::RepSpecific => 6,
            CodeSigningSlot::EntitlementsDer => 7,
            CodeSigningSlot::AlternateCodeDirectory0 => 0x1000,
            CodeSigningSlot::AlternateCodeDirectory1 => 0x1001,
            CodeSigningSlot::AlternateCodeDirectory2 => 0x1002,
            CodeSigningSlot::AlternateCodeDirectory3 => 0x1003,
            CodeSigningSlot::AlternateCodeDirectory4 => 0x1004,
            CodeSigningSlot::Signature => 0x10000,
            CodeSigningSlot::Identification => 0x10001,
            CodeSigningSlot::Ticket => 0x10002,
            CodeSigningSlot::Unknown(v) => v,
        }
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl CodeSigningSlot {
    /// The top directory index slot.
    ///
    /// It is numerically identical to [CodeSigningSlot::Application].
    pub const TOP_DIRECTORY: CodeSigningSlot = CodeSigningSlot::Application;

    /// The highest special slot we know how to populate.
    pub const MAX_SPECIAL: u32 = 7;

    /// Alternate code directory slots, in order.
    pub const ALTERNATES: [CodeSigningSlot; 5] = [
        CodeSigningSlot::AlternateCodeDirectory0,
        CodeSigningSlot::AlternateCodeDirectory1,
        CodeSigningSlot::AlternateCodeDirectory2,
        CodeSigningSlot::AlternateCodeDirectory3,
        CodeSigningSlot::AlternateCodeDirectory4,
    ];

    /// Whether this slot has external data (as opposed to provided via a blob).
    pub fn has_external_content(&self) -> bool {
        matches!(self, Self::Info | Self::ResourceDir)
    }

    /// Whether this slot is digested into a code directory special slot.
    pub fn is_code_directory_special_slot(&self) -> bool {
        (1..=Self::MAX_SPECIAL).contains(&u32::from(*self))
    }

    pub fn is_alternate_code_directory(&self) -> bool {
        (0x1000..=0x1004).contains(&u32::from(*self))
    }

    pub fn is_code_directory(&self) -> bool {
        matches!(self, Self::CodeDirectory) || self.is_alternate_code_directory()
    }
}

#[repr(C)]
#[derive(Clone, Pread)]
struct BlobIndex {
    /// Corresponds to a [CodeSigningSlot] variant.
    typ: u32,
    offset: u32,
}

/// Read the header from a Blob.
///
/// Blobs begin with a u32 magic and u32 length, inclusive. The returned
/// payload is bounded by the advertised length, which must fit in `data`.
pub(crate) fn read_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8]), CodeSignError> {
    let magic = data.pread_with(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)? as usize;

    if length < 8 || length > data.len() {
        return Err(CodeSignError::SuperblobMalformed);
    }

    Ok((magic, length, &data[8..length]))
}

pub(crate) fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: u32,
    what: &'static str,
) -> Result<&'a [u8], CodeSignError> {
    let (magic, _, data) = read_blob_header(data)?;

    if magic != expected_magic {
        Err(CodeSignError::BadMagic(what))
    } else {
        Ok(data)
    }
}

fn length_u32(len: usize, what: &'static str) -> Result<u32, CodeSignError> {
    u32::try_from(len).map_err(|_| CodeSignError::ArithmeticOverflow(what))
}

/// Create the binary content for a SuperBlob.
pub fn create_superblob<'a>(
    magic: CodeSigningMagic,
    blobs: impl Iterator<Item = &'a (CodeSigningSlot, Vec<u8>)>,
) -> Result<Vec<u8>, CodeSignError> {
    let blobs = blobs.collect::<Vec<_>>();

    // magic + total length + blob count + 8 bytes per index.
    let header_length = 12 + 8 * blobs.len();
    let total_length = blobs
        .iter()
        .try_fold(header_length, |acc, (_, blob)| acc.checked_add(blob.len()))
        .ok_or(CodeSignError::ArithmeticOverflow("superblob length"))?;
    let total_length = length_u32(total_length, "superblob length")?;

    let mut cursor = std::io::Cursor::new(Vec::<u8>::with_capacity(total_length as usize));
    cursor.iowrite_with(u32::from(magic), scroll::BE)?;
    cursor.iowrite_with(total_length, scroll::BE)?;
    cursor.iowrite_with(blobs.len() as u32, scroll::BE)?;

    let mut offset = header_length as u32;
    for (slot, blob) in &blobs {
        cursor.iowrite_with(u32::from(*slot), scroll::BE)?;
        cursor.iowrite_with(offset, scroll::BE)?;
        offset += blob.len() as u32;
    }

    for (_, blob) in blobs {
        cursor.write_all(blob)?;
    }

    Ok(cursor.into_inner())
}

/// Represents a single blob as defined by a SuperBlob index entry.
///
/// The blob data is unparsed in this type. The blob payloads can be
/// turned into [ParsedBlob] via `.try_into()`.
#[derive(Clone)]
pub struct BlobEntry<'a> {
    /// Our blob index within the `SuperBlob`.
    pub index: usize,

    /// The slot type.
    pub slot: CodeSigningSlot,

    /// Our start offset within the `SuperBlob`.
    pub offset: usize,

    /// The magic value appearing at the beginning of the blob.
    pub magic: CodeSigningMagic,

    /// The length of the blob, including its header.
    pub length: usize,

    /// The raw data in this blob, including magic and length.
    pub data: &'a [u8],
}

impl<'a> std::fmt::Debug for BlobEntry<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlobEntry")
            .field("index", &self.index)
            .field("slot", &self.slot)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("magic", &self.magic)
            .finish()
    }
}

impl<'a> BlobEntry<'a> {
    /// Attempt to convert to a [ParsedBlob].
    pub fn into_parsed_blob(self) -> Result<ParsedBlob<'a>, CodeSignError> {
        self.try_into()
    }

    /// Obtain the payload of this blob.
    ///
    /// This is the data in the blob without the blob header.
    pub fn payload(&self) -> Result<&'a [u8], CodeSignError> {
        Ok(read_blob_header(self.data)?.2)
    }

    /// Compute the content digest of this blob using the specified hash type.
    pub fn digest_with(&self, hash: DigestType) -> Result<Vec<u8>, CodeSignError> {
        hash.digest_data(self.data)
    }
}

/// Provides common features for a parsed blob type.
pub trait Blob<'a>
where
    Self: Sized,
{
    /// The header magic that identifies this format.
    fn magic() -> u32;

    /// Attempt to construct an instance by parsing a bytes slice.
    ///
    /// The slice begins with the 8 byte blob header denoting the magic
    /// and length.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError>;

    /// Serialize the payload of this blob to bytes.
    ///
    /// Does not include the magic or length header fields common to blobs.
    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError>;

    /// Serialize this blob to bytes.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, CodeSignError> {
        let payload = self.serialize_payload()?;
        let length = length_u32(payload.len() + 8, "blob length")?;

        let mut res = Vec::with_capacity(payload.len() + 8);
        res.iowrite_with(Self::magic(), scroll::BE)?;
        res.iowrite_with(length, scroll::BE)?;
        res.extend(payload);

        Ok(res)
    }

    /// Obtain the digest of the serialized blob using the specified hasher.
    fn digest_with(&self, hash_type: DigestType) -> Result<Vec<u8>, CodeSignError> {
        hash_type.digest_data(&self.to_blob_bytes()?)
    }
}

/// Represents a Requirement blob.
pub struct RequirementBlob<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for RequirementBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Requirement)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "requirement blob")?;

        Ok(Self { data: data.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for RequirementBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("RequirementBlob({})", hex::encode(&self.data)))
    }
}

impl<'a> RequirementBlob<'a> {
    pub fn to_owned(&self) -> RequirementBlob<'static> {
        RequirementBlob {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }

    /// Parse the binary data in this blob into Code Requirement expressions.
    pub fn parse_expressions(&self) -> Result<CodeRequirements, CodeSignError> {
        Ok(CodeRequirements::parse_binary(&self.data)?.0)
    }
}

/// Represents a Requirement set blob.
///
/// A Requirement set blob contains nested Requirement blobs, keyed by
/// [RequirementType]. Entries serialize in ascending type order.
#[derive(Debug, Default)]
pub struct RequirementSetBlob<'a> {
    pub requirements: BTreeMap<RequirementType, RequirementBlob<'a>>,
}

impl<'a> Blob<'a> for RequirementSetBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::RequirementSet)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        read_and_validate_blob_header(data, Self::magic(), "requirement set blob")?;
        let (_, length, _) = read_blob_header(data)?;
        let data = &data[0..length];

        // A u32 count then an array of (type, offset) pairs.
        let offset = &mut 8;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        let mut requirements = BTreeMap::new();

        for _ in 0..count {
            let flavor = data.gread_with::<u32>(offset, scroll::BE)?;
            let blob_offset = data.gread_with::<u32>(offset, scroll::BE)? as usize;

            let requirement_data = data
                .get(blob_offset..)
                .ok_or(CodeSignError::SuperblobMalformed)?;

            requirements.insert(
                RequirementType::from(flavor),
                RequirementBlob::from_blob_bytes(requirement_data)?,
            );
        }

        Ok(Self { requirements })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        let mut res = Vec::new();

        // The index contains blob relative offsets.
        let data_start_offset = 8 + 4 + (8 * self.requirements.len() as u32);
        let mut written_requirements_data = 0;

        res.iowrite_with(self.requirements.len() as u32, scroll::BE)?;

        let blobs = self
            .requirements
            .iter()
            .map(|(typ, requirement)| Ok((*typ, requirement.to_blob_bytes()?)))
            .collect::<Result<Vec<_>, CodeSignError>>()?;

        for (typ, blob) in &blobs {
            res.iowrite_with(u32::from(*typ), scroll::BE)?;
            res.iowrite_with(data_start_offset + written_requirements_data, scroll::BE)?;
            written_requirements_data += length_u32(blob.len(), "requirement set")?;
        }

        for (_, blob) in blobs {
            res.write_all(&blob)?;
        }

        Ok(res)
    }
}

impl<'a> RequirementSetBlob<'a> {
    pub fn to_owned(&self) -> RequirementSetBlob<'static> {
        RequirementSetBlob {
            requirements: self
                .requirements
                .iter()
                .map(|(flavor, blob)| (*flavor, blob.to_owned()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    /// Set the requirements for a given [RequirementType].
    pub fn set_requirements(&mut self, slot: RequirementType, blob: RequirementBlob<'a>) {
        self.requirements.insert(slot, blob);
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

/// Represents an Entitlements blob.
///
/// An entitlements blob contains an XML plist with a dict.
#[derive(Debug)]
pub struct EntitlementsBlob<'a> {
    plist: Cow<'a, str>,
}

impl<'a> Blob<'a> for EntitlementsBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Entitlements)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "entitlements blob")?;
        let s = std::str::from_utf8(data).map_err(CodeSignError::EntitlementsBadUtf8)?;

        Ok(Self { plist: s.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        Ok(self.plist.as_bytes().to_vec())
    }
}

impl<'a> EntitlementsBlob<'a> {
    /// Construct an instance using any string as the payload.
    pub fn from_string(s: &(impl ToString + ?Sized)) -> Self {
        Self {
            plist: s.to_string().into(),
        }
    }

    /// Obtain the plist representation as a string.
    pub fn as_str(&self) -> &str {
        &self.plist
    }
}

#[derive(Debug)]
pub struct EntitlementsDerBlob<'a> {
    der: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for EntitlementsDerBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::EntitlementsDer)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let der = read_and_validate_blob_header(data, Self::magic(), "DER entitlements blob")?;

        Ok(Self { der: der.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        Ok(self.der.to_vec())
    }
}

impl<'a> EntitlementsDerBlob<'a> {
    /// Construct an instance from a [plist::Value].
    ///
    /// DER encoding is performed immediately, so plists holding values that
    /// have no DER representation are rejected here.
    pub fn from_plist(v: &plist::Value) -> Result<Self, CodeSignError> {
        let der = crate::entitlements::der_encode_entitlements_plist(v)?;

        Ok(Self { der: der.into() })
    }
}

/// Represents a generic blob wrapper.
pub struct BlobWrapperBlob<'a> {
    data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for BlobWrapperBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::BlobWrapper)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        Ok(Self {
            data: read_and_validate_blob_header(data, Self::magic(), "blob wrapper blob")?.into(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for BlobWrapperBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", hex::encode(&self.data)))
    }
}

impl<'a> BlobWrapperBlob<'a> {
    /// Construct an instance where the payload (post blob header) is given data.
    pub fn from_data_borrowed(data: &'a [u8]) -> BlobWrapperBlob<'a> {
        Self { data: data.into() }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }
}

impl BlobWrapperBlob<'static> {
    /// Construct an instance with payload data.
    pub fn from_data_owned(data: Vec<u8>) -> BlobWrapperBlob<'static> {
        Self { data: data.into() }
    }
}

/// The top directory index.
///
/// Records the ordered list of slot ids present in a signature so later
/// removal or addition of components can be detected. Serialized as a
/// [BlobWrapperBlob] whose payload is an array of big-endian u32.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TopDirectoryBlob {
    pub slots: Vec<u32>,
}

impl<'a> Blob<'a> for TopDirectoryBlob {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::BlobWrapper)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let payload = read_and_validate_blob_header(data, Self::magic(), "top directory blob")?;

        if payload.len() % 4 != 0 {
            return Err(CodeSignError::SignatureInvalid(
                "top directory length not a multiple of 4".into(),
            ));
        }

        let slots = payload
            .chunks_exact(4)
            .map(|chunk| chunk.pread_with::<u32>(0, scroll::BE))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { slots })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        let mut res = Vec::with_capacity(self.slots.len() * 4);
        for slot in &self.slots {
            res.iowrite_with(*slot, scroll::BE)?;
        }

        Ok(res)
    }
}

/// Represents an unknown blob type.
pub struct OtherBlob<'a> {
    pub magic: u32,
    pub data: &'a [u8],
}

impl<'a> Blob<'a> for OtherBlob<'a> {
    fn magic() -> u32 {
        // Placeholder. Serialization uses the instance magic.
        u32::MAX
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let (magic, _, data) = read_blob_header(data)?;

        Ok(Self { magic, data })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        Ok(self.data.to_vec())
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>, CodeSignError> {
        let mut res = Vec::with_capacity(self.data.len() + 8);
        res.iowrite_with(self.magic, scroll::BE)?;
        res.iowrite_with(length_u32(self.data.len() + 8, "blob length")?, scroll::BE)?;
        res.write_all(self.data)?;

        Ok(res)
    }
}

impl<'a> std::fmt::Debug for OtherBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", hex::encode(self.data)))
    }
}

/// Represents a single, parsed Blob entry/slot.
#[derive(Debug)]
pub enum BlobData<'a> {
    Requirement(Box<RequirementBlob<'a>>),
    RequirementSet(Box<RequirementSetBlob<'a>>),
    CodeDirectory(Box<CodeDirectoryBlob<'a>>),
    Entitlements(Box<EntitlementsBlob<'a>>),
    EntitlementsDer(Box<EntitlementsDerBlob<'a>>),
    BlobWrapper(Box<BlobWrapperBlob<'a>>),
    Other(Box<OtherBlob<'a>>),
}

impl<'a> BlobData<'a> {
    /// Parse blob data by reading its magic and feeding into magic-specific parser.
    pub fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let (magic, length, _) = read_blob_header(data)?;
        let data = &data[0..length];

        Ok(match CodeSigningMagic::from(magic) {
            CodeSigningMagic::Requirement => {
                Self::Requirement(Box::new(RequirementBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::RequirementSet => {
                Self::RequirementSet(Box::new(RequirementSetBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::CodeDirectory => {
                Self::CodeDirectory(Box::new(CodeDirectoryBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::Entitlements => {
                Self::Entitlements(Box::new(EntitlementsBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::EntitlementsDer => {
                Self::EntitlementsDer(Box::new(EntitlementsDerBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::BlobWrapper => {
                Self::BlobWrapper(Box::new(BlobWrapperBlob::from_blob_bytes(data)?))
            }
            _ => Self::Other(Box::new(OtherBlob::from_blob_bytes(data)?)),
        })
    }

    /// Serialize this blob, including its header.
    pub fn to_blob_bytes(&self) -> Result<Vec<u8>, CodeSignError> {
        match self {
            Self::Requirement(b) => b.to_blob_bytes(),
            Self::RequirementSet(b) => b.to_blob_bytes(),
            Self::CodeDirectory(b) => b.to_blob_bytes(),
            Self::Entitlements(b) => b.to_blob_bytes(),
            Self::EntitlementsDer(b) => b.to_blob_bytes(),
            Self::BlobWrapper(b) => b.to_blob_bytes(),
            Self::Other(b) => b.to_blob_bytes(),
        }
    }
}

/// Represents the parsed content of a blob entry.
#[derive(Debug)]
pub struct ParsedBlob<'a> {
    /// The blob record this blob came from.
    pub blob_entry: BlobEntry<'a>,

    /// The parsed blob data.
    pub blob: BlobData<'a>,
}

impl<'a> TryFrom<BlobEntry<'a>> for ParsedBlob<'a> {
    type Error = CodeSignError;

    fn try_from(blob_entry: BlobEntry<'a>) -> Result<Self, Self::Error> {
        let blob = BlobData::from_blob_bytes(blob_entry.data)?;

        Ok(Self { blob_entry, blob })
    }
}

/// Parse the index of a SuperBlob with the given magic.
///
/// Each entry's slice is bounded by the entry's own advertised length, which
/// must lie entirely within the SuperBlob.
fn parse_superblob<'a>(
    data: &'a [u8],
    expected: CodeSigningMagic,
    what: &'static str,
) -> Result<(u32, Vec<BlobEntry<'a>>), CodeSignError> {
    let offset = &mut 0;

    let magic = CodeSigningMagic::from(data.gread_with::<u32>(offset, scroll::BE)?);
    if magic != expected {
        return Err(CodeSignError::BadMagic(what));
    }

    let length = data.gread_with::<u32>(offset, scroll::BE)?;
    let count = data.gread_with::<u32>(offset, scroll::BE)?;

    if length as usize > data.len() {
        return Err(CodeSignError::SuperblobMalformed);
    }
    let data = &data[0..length as usize];

    let index_end = (count as usize)
        .checked_mul(8)
        .and_then(|v| v.checked_add(12))
        .ok_or(CodeSignError::SuperblobMalformed)?;
    if index_end > data.len() {
        return Err(CodeSignError::SuperblobMalformed);
    }

    let mut blobs = Vec::with_capacity(count as usize);

    for i in 0..count as usize {
        let index = data.gread_with::<BlobIndex>(offset, scroll::BE)?;
        let start = index.offset as usize;

        if start < index_end || start >= data.len() {
            return Err(CodeSignError::SuperblobMalformed);
        }

        let (magic, blob_length, _) = read_blob_header(&data[start..])?;

        blobs.push(BlobEntry {
            index: i,
            slot: index.typ.into(),
            offset: start,
            magic: magic.into(),
            length: blob_length,
            data: &data[start..start + blob_length],
        });
    }

    Ok((length, blobs))
}

/// Represents Apple's embedded code signature data structures.
///
/// This type represents a lightly parsed `SuperBlob` with
/// [CodeSigningMagic::EmbeddedSignature].
pub struct EmbeddedSignature<'a> {
    /// Length of this super blob.
    pub length: u32,

    /// Raw data backing this super blob.
    pub data: &'a [u8],

    /// All the blobs within this super blob.
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> std::fmt::Debug for EmbeddedSignature<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SuperBlob")
            .field("length", &self.length)
            .field("blobs", &self.blobs)
            .finish()
    }
}

impl<'a> EmbeddedSignature<'a> {
    /// Attempt to parse an embedded signature super blob from data.
    ///
    /// Trailing data after the advertised SuperBlob length (e.g. zero padding
    /// in the reserved signature region) is ignored.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let (length, blobs) = parse_superblob(
            data,
            CodeSigningMagic::EmbeddedSignature,
            "embedded signature super blob",
        )?;

        Ok(Self {
            length,
            data: &data[0..length as usize],
            blobs,
        })
    }

    /// Find the first occurrence of the specified slot.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|e| e.slot == slot)
    }

    pub fn find_slot_parsed(
        &self,
        slot: CodeSigningSlot,
    ) -> Result<Option<ParsedBlob<'a>>, CodeSignError> {
        if let Some(entry) = self.find_slot(slot) {
            Ok(Some(entry.clone().into_parsed_blob()?))
        } else {
            Ok(None)
        }
    }

    /// Slot ids in the order they appear in the SuperBlob index.
    pub fn slot_ids(&self) -> Vec<u32> {
        self.blobs.iter().map(|b| u32::from(b.slot)).collect()
    }

    /// Attempt to resolve the primary `CodeDirectoryBlob`.
    ///
    /// Returns `Ok(None)` if there is no code directory slot.
    pub fn code_directory(&self) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, CodeSignError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::CodeDirectory)? {
            if let BlobData::CodeDirectory(cd) = parsed.blob {
                Ok(Some(cd))
            } else {
                Err(CodeSignError::BadMagic("code directory blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Resolve every code directory, primary first then alternates.
    pub fn all_code_directories(
        &self,
    ) -> Result<Vec<(CodeSigningSlot, Box<CodeDirectoryBlob<'a>>)>, CodeSignError> {
        let mut res = vec![];

        for entry in self.blobs.iter().filter(|b| b.slot.is_code_directory()) {
            match entry.clone().into_parsed_blob()?.blob {
                BlobData::CodeDirectory(cd) => res.push((entry.slot, cd)),
                _ => return Err(CodeSignError::BadMagic("code directory blob")),
            }
        }

        res.sort_by_key(|(slot, _)| *slot);

        Ok(res)
    }

    /// Attempt to resolve a parsed [EntitlementsBlob] for this signature data.
    pub fn entitlements(&self) -> Result<Option<Box<EntitlementsBlob<'a>>>, CodeSignError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::Entitlements)? {
            if let BlobData::Entitlements(entitlements) = parsed.blob {
                Ok(Some(entitlements))
            } else {
                Err(CodeSignError::BadMagic("entitlements blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Attempt to resolve a parsed [RequirementSetBlob] for this signature data.
    pub fn code_requirements(&self) -> Result<Option<Box<RequirementSetBlob<'a>>>, CodeSignError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::RequirementSet)? {
            if let BlobData::RequirementSet(reqs) = parsed.blob {
                Ok(Some(reqs))
            } else {
                Err(CodeSignError::BadMagic("requirements blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Resolve the top directory index, if present.
    pub fn top_directory(&self) -> Result<Option<TopDirectoryBlob>, CodeSignError> {
        match self.find_slot(CodeSigningSlot::TOP_DIRECTORY) {
            Some(entry) => Ok(Some(TopDirectoryBlob::from_blob_bytes(entry.data)?)),
            None => Ok(None),
        }
    }

    /// Attempt to resolve raw CMS signature data.
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>, CodeSignError> {
        if let Some(entry) = self.find_slot(CodeSigningSlot::Signature) {
            Ok(Some(read_and_validate_blob_header(
                entry.data,
                u32::from(CodeSigningMagic::BlobWrapper),
                "signature blob",
            )?))
        } else {
            Ok(None)
        }
    }

    /// Obtain the parsed CMS [SignedData].
    ///
    /// An empty signature blob (as emitted for ad-hoc signatures) yields
    /// `None`.
    pub fn signed_data(&self) -> Result<Option<SignedData>, CodeSignError> {
        match self.signature_data()? {
            Some(data) if !data.is_empty() => Ok(Some(SignedData::parse_ber(data)?)),
            _ => Ok(None),
        }
    }
}

/// A parsed multi-architecture detached signature.
///
/// Holds one global sub-blob at slot 0 and one EmbeddedSignature SuperBlob
/// per architecture, keyed by Mach-O CPU type.
pub struct DetachedSignature<'a> {
    pub global: Option<&'a [u8]>,
    pub architectures: Vec<(u32, EmbeddedSignature<'a>)>,
}

impl<'a> DetachedSignature<'a> {
    /// Slot under which the global sub-blob is stored.
    pub const GLOBAL_SLOT: u32 = 0;

    pub fn from_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let (_, blobs) = parse_superblob(
            data,
            CodeSigningMagic::DetachedSignature,
            "detached signature super blob",
        )?;

        let mut global = None;
        let mut architectures = vec![];

        for entry in blobs {
            let slot = u32::from(entry.slot);
            if slot == Self::GLOBAL_SLOT {
                global = Some(entry.data);
            } else {
                architectures.push((slot, EmbeddedSignature::from_bytes(entry.data)?));
            }
        }

        Ok(Self {
            global,
            architectures,
        })
    }

    /// Assemble a detached signature.
    pub fn create(global: Vec<u8>, architectures: Vec<(u32, Vec<u8>)>) -> Result<Vec<u8>, CodeSignError> {
        let mut blobs = vec![(CodeSigningSlot::from(Self::GLOBAL_SLOT), global)];
        blobs.extend(
            architectures
                .into_iter()
                .map(|(cputype, data)| (CodeSigningSlot::from(cputype), data)),
        );

        create_superblob(CodeSigningMagic::DetachedSignature, blobs.iter())
    }

    /// Find the signature for a CPU type.
    pub fn for_cpu_type(&self, cputype: u32) -> Option<&EmbeddedSignature<'a>> {
        self.architectures
            .iter()
            .find(|(t, _)| *t == cputype)
            .map(|(_, sig)| sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblob_layout() -> Result<(), CodeSignError> {
        let blobs = vec![
            (
                CodeSigningSlot::Entitlements,
                EntitlementsBlob::from_string("<plist/>").to_blob_bytes()?,
            ),
            (
                CodeSigningSlot::Signature,
                BlobWrapperBlob::from_data_owned(vec![]).to_blob_bytes()?,
            ),
        ];

        let data = create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter())?;
        assert_eq!(
            hex::encode(&data[0..12]),
            format!("fade0cc0{:08x}00000002", data.len())
        );

        let sig = EmbeddedSignature::from_bytes(&data)?;
        assert_eq!(sig.slot_ids(), vec![5, 0x10000]);
        assert_eq!(sig.entitlements()?.unwrap().as_str(), "<plist/>");
        assert_eq!(sig.signature_data()?, Some(&[][..]));
        assert!(sig.signed_data()?.is_none());
        assert!(sig.code_directory()?.is_none());

        Ok(())
    }

    #[test]
    fn trailing_padding_ignored() -> Result<(), CodeSignError> {
        let blobs = vec![(
            CodeSigningSlot::Signature,
            BlobWrapperBlob::from_data_owned(vec![1, 2, 3]).to_blob_bytes()?,
        )];
        let mut data = create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter())?;
        let length = data.len();
        data.resize(length + 100, 0);

        let sig = EmbeddedSignature::from_bytes(&data)?;
        assert_eq!(sig.data.len(), length);
        assert_eq!(sig.signature_data()?, Some(&[1u8, 2, 3][..]));

        Ok(())
    }

    #[test]
    fn rejects_bad_lengths() {
        // Claims to be longer than the data.
        let data = hex::decode("fade0cc00000100000000000").unwrap();
        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(CodeSignError::SuperblobMalformed)
        ));

        // One index entry pointing beyond the end.
        let data = hex::decode("fade0cc0000000140000000100000005000000ff").unwrap();
        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(CodeSignError::SuperblobMalformed)
        ));

        // Index entry whose blob claims a huge length.
        let data =
            hex::decode("fade0cc00000001c000000010000000500000014fade7171ffffff00").unwrap();
        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(CodeSignError::SuperblobMalformed)
        ));

        // Wrong magic.
        let data = hex::decode("fade0cc10000000c00000000").unwrap();
        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(CodeSignError::BadMagic(_))
        ));
    }

    #[test]
    fn top_directory() -> Result<(), CodeSignError> {
        let blob = TopDirectoryBlob {
            slots: vec![0, 2, 4, 0x1000, 0x10000],
        };
        let data = blob.to_blob_bytes()?;

        assert_eq!(
            hex::encode(&data),
            "fade0b010000001c0000000000000002000000040000100000010000"
        );
        assert_eq!(TopDirectoryBlob::from_blob_bytes(&data)?, blob);
        assert_eq!(CodeSigningSlot::TOP_DIRECTORY, CodeSigningSlot::from(4));

        Ok(())
    }

    #[test]
    fn detached() -> Result<(), CodeSignError> {
        let empty = create_superblob(CodeSigningMagic::EmbeddedSignature, [].iter())?;
        let data = DetachedSignature::create(
            empty.clone(),
            vec![(7, empty.clone()), (0x0100000c, empty)],
        )?;

        assert_eq!(&data[0..4], &[0xfa, 0xde, 0x0c, 0xc1]);

        let detached = DetachedSignature::from_bytes(&data)?;
        assert!(detached.global.is_some());
        assert_eq!(detached.architectures.len(), 2);
        assert!(detached.for_cpu_type(0x0100000c).is_some());
        assert!(detached.for_cpu_type(0x01000007).is_none());

        Ok(())
    }

    #[test]
    fn slot_classification() {
        assert!(CodeSigningSlot::Info.has_external_content());
        assert!(CodeSigningSlot::EntitlementsDer.is_code_directory_special_slot());
        assert!(!CodeSigningSlot::Signature.is_code_directory_special_slot());
        assert!(CodeSigningSlot::AlternateCodeDirectory2.is_code_directory());
        assert!(CodeSigningSlot::CodeDirectory < CodeSigningSlot::AlternateCodeDirectory0);
    }
}
