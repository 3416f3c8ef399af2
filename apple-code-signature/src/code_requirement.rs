// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code requirement language primitives.

Code signatures contain a binary encoded expression tree denoting requirements.
There is a human friendly DSL for these expressions; see
[crate::requirement_text] for its parser. This module defines the expression
tree, its binary encoding, and the evaluation of expressions against the facts
of a signed code object.

# Binary Encoding

Requirement expressions consist of opcodes. An opcode is defined by a u32 where
the high byte contains flags and the lower 3 bytes denote the opcode value.

Some opcodes have payloads and the payload varies by opcode. A common pattern
is to length encode arbitrary data via a u32 denoting the length and N bytes
to follow.

String data is not guaranteed to be terminated by a NULL. However, variable
length data is padded will NULL bytes so the next opcode is always aligned
on 4 byte boundaries.
*/

use {
    crate::{
        embedded_signature::{
            read_and_validate_blob_header, CodeSigningMagic, RequirementBlob, RequirementSetBlob,
        },
        error::CodeSignError,
    },
    bcder::Oid,
    bytes::Bytes,
    chrono::TimeZone,
    log::debug,
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        cmp::Ordering,
        fmt::{Debug, Display},
        io::Write,
        ops::{Deref, DerefMut},
    },
    x509_certificate::{rfc4519, CapturedX509Certificate, X509Certificate},
};

const OPCODE_FLAG_MASK: u32 = 0xff000000;
const OPCODE_VALUE_MASK: u32 = 0x00ffffff;

/// Maximum nesting of sub-expressions accepted by the binary parser.
const MAX_EXPRESSION_DEPTH: usize = 256;

/// OID of the X.509 certificate policies extension.
const OID_CERTIFICATE_POLICIES: &[u8] = &[85, 29, 32];

fn malformed(what: &'static str) -> CodeSignError {
    CodeSignError::RequirementMalformed(what)
}

fn read_data(data: &[u8]) -> Result<(&[u8], &[u8]), CodeSignError> {
    let length = data.pread_with::<u32>(0, scroll::BE)? as usize;

    let end = length
        .checked_add(4)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| malformed("data length exceeds input"))?;
    let value = &data[4..end];

    // Next element is aligned on next 4 byte boundary.
    let padded = match end % 4 {
        0 => end,
        extra => end + 4 - extra,
    };

    let remaining = data
        .get(padded..)
        .ok_or_else(|| malformed("missing data padding"))?;

    Ok((value, remaining))
}

fn read_str<'a>(data: &'a [u8], what: &'static str) -> Result<(&'a str, &'a [u8]), CodeSignError> {
    let (value, data) = read_data(data)?;
    let s = std::str::from_utf8(value).map_err(|_| malformed(what))?;

    Ok((s, data))
}

fn read_i32(data: &[u8]) -> Result<(i32, &[u8]), CodeSignError> {
    let value = data.pread_with::<i32>(0, scroll::BE)?;

    Ok((value, &data[4..]))
}

fn read_timestamp(data: &[u8]) -> Result<(chrono::DateTime<chrono::Utc>, &[u8]), CodeSignError> {
    let value = data.pread_with::<i64>(0, scroll::BE)?;
    let value = chrono::Utc
        .timestamp_opt(value, 0)
        .single()
        .ok_or_else(|| malformed("timestamp out of range"))?;

    Ok((value, &data[8..]))
}

fn write_data(dest: &mut impl Write, data: &[u8]) -> Result<(), CodeSignError> {
    let length = u32::try_from(data.len())
        .map_err(|_| CodeSignError::ArithmeticOverflow("requirement data length"))?;
    dest.iowrite_with(length, scroll::BE)?;
    dest.write_all(data)?;

    match data.len() % 4 {
        0 => {}
        pad => {
            for _ in 0..4 - pad {
                dest.iowrite(0u8)?;
            }
        }
    }

    Ok(())
}

/// Format a certificate slot's value to human form.
fn format_certificate_slot(slot: i32) -> String {
    match slot {
        -1 => "root".to_string(),
        0 => "leaf".to_string(),
        _ => format!("{}", slot),
    }
}

/// Format a DER encoded OID in dotted form.
fn format_oid(oid: &[u8]) -> String {
    format!("{}", Oid(oid))
}

/// Format a string in quoted form, escaping quotes and backslashes.
pub(crate) fn quote(s: &str) -> String {
    let mut res = String::with_capacity(s.len() + 2);
    res.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            res.push('\\');
        }
        res.push(c);
    }
    res.push('"');

    res
}

/// Denotes type of code requirements.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RequirementType {
    /// What hosts may run on us.
    Host,
    /// What guests we may run.
    Guest,
    /// Designated requirement.
    Designated,
    /// What libraries we may link against.
    Library,
    /// What plug-ins we may load.
    Plugin,
    /// Unknown requirement type.
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Guest,
            3 => Self::Designated,
            4 => Self::Library,
            5 => Self::Plugin,
            _ => Self::Unknown(v),
        }
    }
}

impl From<RequirementType> for u32 {
    fn from(t: RequirementType) -> Self {
        match t {
            RequirementType::Host => 1,
            RequirementType::Guest => 2,
            RequirementType::Designated => 3,
            RequirementType::Library => 4,
            RequirementType::Plugin => 5,
            RequirementType::Unknown(v) => v,
        }
    }
}

impl PartialOrd for RequirementType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequirementType {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl Display for RequirementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => f.write_str("host(1)"),
            Self::Guest => f.write_str("guest(2)"),
            Self::Designated => f.write_str("designated(3)"),
            Self::Library => f.write_str("library(4)"),
            Self::Plugin => f.write_str("plugin(5)"),
            Self::Unknown(v) => f.write_fmt(format_args!("unknown({})", v)),
        }
    }
}

/// A value in a code requirement expression.
///
/// The value can be various primitive types. This type exists to make it
/// easier to work with and format values in code requirement expressions.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementValue<'a> {
    String(Cow<'a, str>),
    Bytes(Cow<'a, [u8]>),
}

impl<'a> From<&'a [u8]> for CodeRequirementValue<'a> {
    fn from(value: &'a [u8]) -> Self {
        let is_ascii_printable = |c: &u8| -> bool {
            c.is_ascii_alphanumeric() || c.is_ascii_whitespace() || c.is_ascii_punctuation()
        };

        match std::str::from_utf8(value) {
            Ok(s) if value.iter().all(is_ascii_printable) => Self::String(s.into()),
            _ => Self::Bytes(value.into()),
        }
    }
}

impl<'a> From<&'a str> for CodeRequirementValue<'a> {
    fn from(s: &'a str) -> Self {
        Self::String(s.into())
    }
}

impl<'a> From<Cow<'a, str>> for CodeRequirementValue<'a> {
    fn from(v: Cow<'a, str>) -> Self {
        Self::String(v)
    }
}

impl From<String> for CodeRequirementValue<'static> {
    fn from(v: String) -> Self {
        Self::String(Cow::Owned(v))
    }
}

impl<'a> Display for CodeRequirementValue<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Bytes(data) => f.write_fmt(format_args!("{}", hex::encode(data))),
        }
    }
}

impl<'a> CodeRequirementValue<'a> {
    /// Write the encoded version of this value somewhere.
    ///
    /// Binary encoding is u32 of length, then raw bytes, then NULL padding to next u32.
    fn write_encoded(&self, dest: &mut impl Write) -> Result<(), CodeSignError> {
        match self {
            Self::Bytes(data) => write_data(dest, data),
            Self::String(s) => write_data(dest, s.as_bytes()),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(data) => data,
            Self::String(s) => s.as_bytes(),
        }
    }

    /// Render in requirement language syntax.
    fn to_source(&self) -> String {
        match self {
            Self::String(s) => quote(s),
            Self::Bytes(data) => format!("H\"{}\"", hex::encode(data)),
        }
    }

    pub fn to_owned(&self) -> CodeRequirementValue<'static> {
        match self {
            Self::String(s) => CodeRequirementValue::String(Cow::Owned(s.to_string())),
            Self::Bytes(data) => CodeRequirementValue::Bytes(Cow::Owned(data.to_vec())),
        }
    }
}

/// An opcode representing a code requirement expression.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
enum RequirementOpCode {
    False = 0,
    True = 1,
    Identifier = 2,
    AnchorApple = 3,
    AnchorCertificateHash = 4,
    InfoKeyValueLegacy = 5,
    And = 6,
    Or = 7,
    CodeDirectoryHash = 8,
    Not = 9,
    InfoPlistExpression = 10,
    CertificateField = 11,
    CertificateTrusted = 12,
    AnchorTrusted = 13,
    CertificateGeneric = 14,
    AnchorAppleGeneric = 15,
    EntitlementsField = 16,
    CertificatePolicy = 17,
    NamedAnchor = 18,
    NamedCode = 19,
    Platform = 20,
    Notarized = 21,
    CertificateFieldDate = 22,
    LegacyDeveloperId = 23,
}

impl TryFrom<u32> for RequirementOpCode {
    type Error = CodeSignError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::False),
            1 => Ok(Self::True),
            2 => Ok(Self::Identifier),
            3 => Ok(Self::AnchorApple),
            4 => Ok(Self::AnchorCertificateHash),
            5 => Ok(Self::InfoKeyValueLegacy),
            6 => Ok(Self::And),
            7 => Ok(Self::Or),
            8 => Ok(Self::CodeDirectoryHash),
            9 => Ok(Self::Not),
            10 => Ok(Self::InfoPlistExpression),
            11 => Ok(Self::CertificateField),
            12 => Ok(Self::CertificateTrusted),
            13 => Ok(Self::AnchorTrusted),
            14 => Ok(Self::CertificateGeneric),
            15 => Ok(Self::AnchorAppleGeneric),
            16 => Ok(Self::EntitlementsField),
            17 => Ok(Self::CertificatePolicy),
            18 => Ok(Self::NamedAnchor),
            19 => Ok(Self::NamedCode),
            20 => Ok(Self::Platform),
            21 => Ok(Self::Notarized),
            22 => Ok(Self::CertificateFieldDate),
            23 => Ok(Self::LegacyDeveloperId),
            _ => Err(CodeSignError::RequirementUnknownOpcode(v)),
        }
    }
}

impl RequirementOpCode {
    /// Parse the payload of an opcode.
    ///
    /// On successful parse, returns an [CodeRequirementExpression] and remaining data in
    /// the input slice.
    fn parse_payload<'a>(
        &self,
        data: &'a [u8],
        depth: usize,
    ) -> Result<(CodeRequirementExpression<'a>, &'a [u8]), CodeSignError> {
        type E<'a> = CodeRequirementExpression<'a>;

        match self {
            Self::False => Ok((E::False, data)),
            Self::True => Ok((E::True, data)),
            Self::Identifier => {
                let (s, data) = read_str(data, "identifier value not a UTF-8 string")?;

                Ok((E::Identifier(Cow::from(s)), data))
            }
            Self::AnchorApple => Ok((E::AnchorApple, data)),
            Self::AnchorCertificateHash => {
                let (slot, data) = read_i32(data)?;
                let (digest, data) = read_data(data)?;

                Ok((E::AnchorCertificateHash(slot, digest.into()), data))
            }
            Self::InfoKeyValueLegacy => {
                let (key, data) = read_str(data, "info key not a UTF-8 string")?;
                let (value, data) = read_str(data, "info value not a UTF-8 string")?;

                Ok((E::InfoKeyValueLegacy(key.into(), value.into()), data))
            }
            Self::And => {
                let (a, data) = CodeRequirementExpression::parse(data, depth + 1)?;
                let (b, data) = CodeRequirementExpression::parse(data, depth + 1)?;

                Ok((E::And(Box::new(a), Box::new(b)), data))
            }
            Self::Or => {
                let (a, data) = CodeRequirementExpression::parse(data, depth + 1)?;
                let (b, data) = CodeRequirementExpression::parse(data, depth + 1)?;

                Ok((E::Or(Box::new(a), Box::new(b)), data))
            }
            Self::CodeDirectoryHash => {
                let (value, data) = read_data(data)?;

                Ok((E::CodeDirectoryHash(value.into()), data))
            }
            Self::Not => {
                let (expr, data) = CodeRequirementExpression::parse(data, depth + 1)?;

                Ok((E::Not(Box::new(expr)), data))
            }
            Self::InfoPlistExpression => {
                let (key, data) = read_str(data, "key is not valid UTF-8")?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((E::InfoPlistKeyField(key.into(), expr), data))
            }
            Self::CertificateField => {
                let (slot, data) = read_i32(data)?;
                let (field, data) = read_str(data, "certificate field is not valid UTF-8")?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((E::CertificateField(slot, field.into(), expr), data))
            }
            Self::CertificateTrusted => {
                let (slot, data) = read_i32(data)?;

                Ok((E::CertificateTrusted(slot), data))
            }
            Self::AnchorTrusted => Ok((E::AnchorTrusted, data)),
            Self::CertificateGeneric => {
                let (slot, data) = read_i32(data)?;
                let (oid, data) = read_data(data)?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((E::CertificateGeneric(slot, oid.into(), expr), data))
            }
            Self::AnchorAppleGeneric => Ok((E::AnchorAppleGeneric, data)),
            Self::EntitlementsField => {
                let (key, data) = read_str(data, "entitlement key is not UTF-8")?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((E::EntitlementsKey(key.into(), expr), data))
            }
            Self::CertificatePolicy => {
                let (slot, data) = read_i32(data)?;
                let (oid, data) = read_data(data)?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((E::CertificatePolicy(slot, oid.into(), expr), data))
            }
            Self::NamedAnchor => {
                let (name, data) = read_str(data, "named anchor isn't UTF-8")?;

                Ok((E::NamedAnchor(name.into()), data))
            }
            Self::NamedCode => {
                let (name, data) = read_str(data, "named code isn't UTF-8")?;

                Ok((E::NamedCode(name.into()), data))
            }
            Self::Platform => {
                let value = data.pread_with::<u32>(0, scroll::BE)?;

                Ok((E::Platform(value), &data[4..]))
            }
            Self::Notarized => Ok((E::Notarized, data)),
            Self::CertificateFieldDate => {
                let (slot, data) = read_i32(data)?;
                let (oid, data) = read_data(data)?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((E::CertificateFieldDate(slot, oid.into(), expr), data))
            }
            Self::LegacyDeveloperId => Ok((E::LegacyDeveloperId, data)),
        }
    }
}

/// Defines a code requirement expression.
///
/// OIDs are stored in their DER content encoding.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementExpression<'a> {
    /// `never`
    False,

    /// `always`
    True,

    /// Signing identifier.
    ///
    /// `identifier "<string>"`
    ///
    /// 4 bytes length followed by string.
    Identifier(Cow<'a, str>),

    /// The certificate chain must lead to an Apple root.
    ///
    /// `anchor apple`
    AnchorApple,

    /// The certificate in a slot must have the specified SHA-1 hash.
    ///
    /// `certificate <slot> = H"<hash>"`
    ///
    /// 4 bytes slot number, 4 bytes hash length, hash value.
    AnchorCertificateHash(i32, Cow<'a, [u8]>),

    /// Info.plist key value (legacy).
    ///
    /// `info[<key>] = <value>`
    InfoKeyValueLegacy(Cow<'a, str>, Cow<'a, str>),

    /// `expr0 and expr1`
    And(
        Box<CodeRequirementExpression<'a>>,
        Box<CodeRequirementExpression<'a>>,
    ),

    /// `expr0 or expr1`
    Or(
        Box<CodeRequirementExpression<'a>>,
        Box<CodeRequirementExpression<'a>>,
    ),

    /// Code directory hash.
    ///
    /// `cdhash H"<hash>"`
    CodeDirectoryHash(Cow<'a, [u8]>),

    /// `!expr`
    Not(Box<CodeRequirementExpression<'a>>),

    /// Info plist key field.
    ///
    /// `info [key] match expression`
    InfoPlistKeyField(Cow<'a, str>, CodeRequirementMatchExpression<'a>),

    /// Certificate field matches.
    ///
    /// `certificate <slot>[<field>] match expression`
    CertificateField(i32, Cow<'a, str>, CodeRequirementMatchExpression<'a>),

    /// Certificate in position is trusted for code signing.
    ///
    /// `certificate <position> trusted`
    CertificateTrusted(i32),

    /// The certificate chain must lead to a trusted root.
    ///
    /// `anchor trusted`
    AnchorTrusted,

    /// Certificate extension matches by OID.
    ///
    /// `certificate <slot>[field.<oid>] match expression`
    CertificateGeneric(i32, Cow<'a, [u8]>, CodeRequirementMatchExpression<'a>),

    /// For code signed by Apple, including from code signing certificates issued by Apple.
    ///
    /// `anchor apple generic`
    AnchorAppleGeneric,

    /// Value associated with specified key in signature's embedded entitlements dictionary.
    ///
    /// `entitlement [<key>] match expression`
    EntitlementsKey(Cow<'a, str>, CodeRequirementMatchExpression<'a>),

    /// Certificate policy OID associated with certificate in a given slot.
    ///
    /// `certificate <slot>[policy.<oid>] match expression`
    CertificatePolicy(i32, Cow<'a, [u8]>, CodeRequirementMatchExpression<'a>),

    /// A named Apple anchor.
    ///
    /// `anchor apple <name>`
    NamedAnchor(Cow<'a, str>),

    /// Named code.
    ///
    /// `(<name>)`
    NamedCode(Cow<'a, str>),

    /// `platform = <value>`
    Platform(u32),

    /// `notarized`
    Notarized,

    /// Certificate field date.
    ///
    /// `certificate <slot>[timestamp.<oid>] match expression`
    CertificateFieldDate(i32, Cow<'a, [u8]>, CodeRequirementMatchExpression<'a>),

    /// Legacy developer ID used.
    LegacyDeveloperId,
}

impl<'a> Display for CodeRequirementExpression<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::False => f.write_str("never"),
            Self::True => f.write_str("always"),
            Self::Identifier(value) => f.write_fmt(format_args!("identifier {}", quote(value))),
            Self::AnchorApple => f.write_str("anchor apple"),
            Self::AnchorCertificateHash(slot, digest) => f.write_fmt(format_args!(
                "certificate {} = H\"{}\"",
                format_certificate_slot(*slot),
                hex::encode(digest)
            )),
            Self::InfoKeyValueLegacy(key, value) => {
                f.write_fmt(format_args!("info [{}] = {}", key, quote(value)))
            }
            Self::And(a, b) => f.write_fmt(format_args!("({}) and ({})", a, b)),
            Self::Or(a, b) => f.write_fmt(format_args!("({}) or ({})", a, b)),
            Self::CodeDirectoryHash(digest) => {
                f.write_fmt(format_args!("cdhash H\"{}\"", hex::encode(digest)))
            }
            Self::Not(expr) => f.write_fmt(format_args!("!({})", expr)),
            Self::InfoPlistKeyField(key, expr) => {
                f.write_fmt(format_args!("info [{}] {}", key, expr))
            }
            Self::CertificateField(slot, field, expr) => f.write_fmt(format_args!(
                "certificate {}[{}] {}",
                format_certificate_slot(*slot),
                field,
                expr
            )),
            Self::CertificateTrusted(slot) => f.write_fmt(format_args!(
                "certificate {} trusted",
                format_certificate_slot(*slot)
            )),
            Self::AnchorTrusted => f.write_str("anchor trusted"),
            Self::CertificateGeneric(slot, oid, expr) => f.write_fmt(format_args!(
                "certificate {}[field.{}] {}",
                format_certificate_slot(*slot),
                format_oid(oid),
                expr
            )),
            Self::AnchorAppleGeneric => f.write_str("anchor apple generic"),
            Self::EntitlementsKey(key, expr) => {
                f.write_fmt(format_args!("entitlement [{}] {}", key, expr))
            }
            Self::CertificatePolicy(slot, oid, expr) => f.write_fmt(format_args!(
                "certificate {}[policy.{}] {}",
                format_certificate_slot(*slot),
                format_oid(oid),
                expr
            )),
            Self::NamedAnchor(name) => f.write_fmt(format_args!("anchor apple {}", name)),
            Self::NamedCode(name) => f.write_fmt(format_args!("({})", name)),
            Self::Platform(platform) => f.write_fmt(format_args!("platform = {}", platform)),
            Self::Notarized => f.write_str("notarized"),
            Self::CertificateFieldDate(slot, oid, expr) => f.write_fmt(format_args!(
                "certificate {}[timestamp.{}] {}",
                format_certificate_slot(*slot),
                format_oid(oid),
                expr
            )),
            Self::LegacyDeveloperId => f.write_str("legacy"),
        }
    }
}

impl<'a> From<&CodeRequirementExpression<'a>> for RequirementOpCode {
    fn from(e: &CodeRequirementExpression) -> Self {
        type E<'b> = CodeRequirementExpression<'b>;

        match e {
            E::False => Self::False,
            E::True => Self::True,
            E::Identifier(_) => Self::Identifier,
            E::AnchorApple => Self::AnchorApple,
            E::AnchorCertificateHash(_, _) => Self::AnchorCertificateHash,
            E::InfoKeyValueLegacy(_, _) => Self::InfoKeyValueLegacy,
            E::And(_, _) => Self::And,
            E::Or(_, _) => Self::Or,
            E::CodeDirectoryHash(_) => Self::CodeDirectoryHash,
            E::Not(_) => Self::Not,
            E::InfoPlistKeyField(_, _) => Self::InfoPlistExpression,
            E::CertificateField(_, _, _) => Self::CertificateField,
            E::CertificateTrusted(_) => Self::CertificateTrusted,
            E::AnchorTrusted => Self::AnchorTrusted,
            E::CertificateGeneric(_, _, _) => Self::CertificateGeneric,
            E::AnchorAppleGeneric => Self::AnchorAppleGeneric,
            E::EntitlementsKey(_, _) => Self::EntitlementsField,
            E::CertificatePolicy(_, _, _) => Self::CertificatePolicy,
            E::NamedAnchor(_) => Self::NamedAnchor,
            E::NamedCode(_) => Self::NamedCode,
            E::Platform(_) => Self::Platform,
            E::Notarized => Self::Notarized,
            E::CertificateFieldDate(_, _, _) => Self::CertificateFieldDate,
            E::LegacyDeveloperId => Self::LegacyDeveloperId,
        }
    }
}

impl<'a> CodeRequirementExpression<'a> {
    /// Construct an expression element by reading from a slice.
    ///
    /// Returns the newly constructed element and remaining data in the slice.
    pub fn from_bytes(data: &'a [u8]) -> Result<(Self, &'a [u8]), CodeSignError> {
        Self::parse(data, 0)
    }

    fn parse(data: &'a [u8], depth: usize) -> Result<(Self, &'a [u8]), CodeSignError> {
        if depth > MAX_EXPRESSION_DEPTH {
            return Err(malformed("expression nesting too deep"));
        }

        let opcode_raw = data.pread_with::<u32>(0, scroll::BE)?;

        let _flags = opcode_raw & OPCODE_FLAG_MASK;
        let opcode = RequirementOpCode::try_from(opcode_raw & OPCODE_VALUE_MASK)?;

        opcode.parse_payload(&data[4..], depth)
    }

    /// Write binary representation of this expression to a destination.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), CodeSignError> {
        dest.iowrite_with(RequirementOpCode::from(self) as u32, scroll::BE)?;

        match self {
            Self::False
            | Self::True
            | Self::AnchorApple
            | Self::AnchorTrusted
            | Self::AnchorAppleGeneric
            | Self::Notarized
            | Self::LegacyDeveloperId => {}
            Self::Identifier(s) => {
                write_data(dest, s.as_bytes())?;
            }
            Self::AnchorCertificateHash(slot, hash) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, hash)?;
            }
            Self::InfoKeyValueLegacy(key, value) => {
                write_data(dest, key.as_bytes())?;
                write_data(dest, value.as_bytes())?;
            }
            Self::And(a, b) | Self::Or(a, b) => {
                a.write_to(dest)?;
                b.write_to(dest)?;
            }
            Self::CodeDirectoryHash(hash) => {
                write_data(dest, hash)?;
            }
            Self::Not(expr) => {
                expr.write_to(dest)?;
            }
            Self::InfoPlistKeyField(key, m) | Self::EntitlementsKey(key, m) => {
                write_data(dest, key.as_bytes())?;
                m.write_to(dest)?;
            }
            Self::CertificateField(slot, field, m) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, field.as_bytes())?;
                m.write_to(dest)?;
            }
            Self::CertificateTrusted(slot) => {
                dest.iowrite_with(*slot, scroll::BE)?;
            }
            Self::CertificateGeneric(slot, oid, m)
            | Self::CertificatePolicy(slot, oid, m)
            | Self::CertificateFieldDate(slot, oid, m) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, oid)?;
                m.write_to(dest)?;
            }
            Self::NamedAnchor(value) | Self::NamedCode(value) => {
                write_data(dest, value.as_bytes())?;
            }
            Self::Platform(value) => {
                dest.iowrite_with(*value, scroll::BE)?;
            }
        }

        Ok(())
    }

    /// Produce the binary serialization of this expression.
    ///
    /// The blob header/magic is not included.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodeSignError> {
        let mut res = vec![];

        self.write_to(&mut res)?;

        Ok(res)
    }

    pub fn to_owned(&self) -> CodeRequirementExpression<'static> {
        type E = CodeRequirementExpression<'static>;

        let s = |v: &Cow<'a, str>| -> Cow<'static, str> { Cow::Owned(v.to_string()) };
        let b = |v: &Cow<'a, [u8]>| -> Cow<'static, [u8]> { Cow::Owned(v.to_vec()) };

        match self {
            Self::False => E::False,
            Self::True => E::True,
            Self::Identifier(v) => E::Identifier(s(v)),
            Self::AnchorApple => E::AnchorApple,
            Self::AnchorCertificateHash(slot, v) => E::AnchorCertificateHash(*slot, b(v)),
            Self::InfoKeyValueLegacy(k, v) => E::InfoKeyValueLegacy(s(k), s(v)),
            Self::And(x, y) => E::And(Box::new((**x).to_owned()), Box::new((**y).to_owned())),
            Self::Or(x, y) => E::Or(Box::new((**x).to_owned()), Box::new((**y).to_owned())),
            Self::CodeDirectoryHash(v) => E::CodeDirectoryHash(b(v)),
            Self::Not(x) => E::Not(Box::new((**x).to_owned())),
            Self::InfoPlistKeyField(k, m) => E::InfoPlistKeyField(s(k), m.to_owned()),
            Self::CertificateField(slot, k, m) => E::CertificateField(*slot, s(k), m.to_owned()),
            Self::CertificateTrusted(slot) => E::CertificateTrusted(*slot),
            Self::AnchorTrusted => E::AnchorTrusted,
            Self::CertificateGeneric(slot, o, m) => {
                E::CertificateGeneric(*slot, b(o), m.to_owned())
            }
            Self::AnchorAppleGeneric => E::AnchorAppleGeneric,
            Self::EntitlementsKey(k, m) => E::EntitlementsKey(s(k), m.to_owned()),
            Self::CertificatePolicy(slot, o, m) => E::CertificatePolicy(*slot, b(o), m.to_owned()),
            Self::NamedAnchor(v) => E::NamedAnchor(s(v)),
            Self::NamedCode(v) => E::NamedCode(s(v)),
            Self::Platform(v) => E::Platform(*v),
            Self::Notarized => E::Notarized,
            Self::CertificateFieldDate(slot, o, m) => {
                E::CertificateFieldDate(*slot, b(o), m.to_owned())
            }
            Self::LegacyDeveloperId => E::LegacyDeveloperId,
        }
    }

    /// Evaluate this expression against the facts of a code object.
    pub fn evaluate(&self, context: &RequirementContext) -> bool {
        match self {
            Self::False => false,
            Self::True => true,
            Self::Identifier(v) => context.identifier.as_deref() == Some(v.as_ref()),
            Self::AnchorApple | Self::AnchorAppleGeneric => context.anchor_apple,
            Self::AnchorTrusted => context.anchor_trusted,
            Self::CertificateTrusted(slot) => {
                context.anchor_trusted && context.certificate(*slot).is_some()
            }
            Self::AnchorCertificateHash(slot, digest) => context
                .certificate(*slot)
                .map(|cert| certificate_hash_matches(cert, digest))
                .unwrap_or(false),
            Self::InfoKeyValueLegacy(key, value) => context
                .info_plist
                .as_ref()
                .and_then(|d| d.get(key))
                .and_then(|v| v.as_string())
                .map(|v| v == value)
                .unwrap_or(false),
            Self::And(a, b) => a.evaluate(context) && b.evaluate(context),
            Self::Or(a, b) => a.evaluate(context) || b.evaluate(context),
            Self::Not(a) => !a.evaluate(context),
            Self::CodeDirectoryHash(digest) => context
                .cdhashes
                .iter()
                .any(|h| h.as_slice() == digest.as_ref()),
            Self::InfoPlistKeyField(key, m) => {
                m.matches_plist(context.info_plist.as_ref().and_then(|d| d.get(key)))
            }
            Self::EntitlementsKey(key, m) => {
                m.matches_plist(context.entitlements.as_ref().and_then(|d| d.get(key)))
            }
            Self::CertificateField(slot, field, m) => match context.certificate(*slot) {
                Some(cert) => m.matches_optional_str(certificate_field(cert, field).as_deref()),
                None => false,
            },
            Self::CertificateGeneric(slot, oid, m) => match context.certificate(*slot) {
                Some(cert) => {
                    let c = tbs_certificate(cert);
                    let value = c
                        .iter_extensions()
                        .find(|e| e.id.as_ref() == oid.as_ref())
                        .map(|e| e.value.to_bytes().to_vec());

                    m.matches_optional_bytes(value.as_deref())
                }
                None => false,
            },
            Self::CertificatePolicy(slot, oid, m) => match context.certificate(*slot) {
                Some(cert) => {
                    let present = certificate_has_policy(cert, oid);
                    match m {
                        CodeRequirementMatchExpression::Exists => present,
                        CodeRequirementMatchExpression::Absent => !present,
                        _ => false,
                    }
                }
                None => false,
            },
            Self::Platform(platform) => context.platform == Some(*platform),
            Self::NamedAnchor(_)
            | Self::NamedCode(_)
            | Self::Notarized
            | Self::CertificateFieldDate(..)
            | Self::LegacyDeveloperId => {
                debug!("requirement clause `{}` cannot be proven; treating as false", self);
                false
            }
        }
    }
}

/// A code requirement match expression type.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
enum MatchType {
    Exists = 0,
    Equal = 1,
    Contains = 2,
    BeginsWith = 3,
    EndsWith = 4,
    LessThan = 5,
    GreaterThan = 6,
    LessThanEqual = 7,
    GreaterThanEqual = 8,
    On = 9,
    Before = 10,
    After = 11,
    OnOrBefore = 12,
    OnOrAfter = 13,
    Absent = 14,
}

impl TryFrom<u32> for MatchType {
    type Error = CodeSignError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Exists),
            1 => Ok(Self::Equal),
            2 => Ok(Self::Contains),
            3 => Ok(Self::BeginsWith),
            4 => Ok(Self::EndsWith),
            5 => Ok(Self::LessThan),
            6 => Ok(Self::GreaterThan),
            7 => Ok(Self::LessThanEqual),
            8 => Ok(Self::GreaterThanEqual),
            9 => Ok(Self::On),
            10 => Ok(Self::Before),
            11 => Ok(Self::After),
            12 => Ok(Self::OnOrBefore),
            13 => Ok(Self::OnOrAfter),
            14 => Ok(Self::Absent),
            _ => Err(CodeSignError::RequirementUnknownMatchExpression(v)),
        }
    }
}

impl MatchType {
    /// Parse the payload of a match expression.
    fn parse_payload<'a>(
        &self,
        data: &'a [u8],
    ) -> Result<(CodeRequirementMatchExpression<'a>, &'a [u8]), CodeSignError> {
        type M<'a> = CodeRequirementMatchExpression<'a>;

        let value = |data: &'a [u8]| -> Result<(CodeRequirementValue<'a>, &'a [u8]), CodeSignError> {
            let (value, data) = read_data(data)?;
            Ok((value.into(), data))
        };

        Ok(match self {
            Self::Exists => (M::Exists, data),
            Self::Absent => (M::Absent, data),
            Self::Equal => {
                let (v, data) = value(data)?;
                (M::Equal(v), data)
            }
            Self::Contains => {
                let (v, data) = value(data)?;
                (M::Contains(v), data)
            }
            Self::BeginsWith => {
                let (v, data) = value(data)?;
                (M::BeginsWith(v), data)
            }
            Self::EndsWith => {
                let (v, data) = value(data)?;
                (M::EndsWith(v), data)
            }
            Self::LessThan => {
                let (v, data) = value(data)?;
                (M::LessThan(v), data)
            }
            Self::GreaterThan => {
                let (v, data) = value(data)?;
                (M::GreaterThan(v), data)
            }
            Self::LessThanEqual => {
                let (v, data) = value(data)?;
                (M::LessThanEqual(v), data)
            }
            Self::GreaterThanEqual => {
                let (v, data) = value(data)?;
                (M::GreaterThanEqual(v), data)
            }
            Self::On => {
                let (v, data) = read_timestamp(data)?;
                (M::On(v), data)
            }
            Self::Before => {
                let (v, data) = read_timestamp(data)?;
                (M::Before(v), data)
            }
            Self::After => {
                let (v, data) = read_timestamp(data)?;
                (M::After(v), data)
            }
            Self::OnOrBefore => {
                let (v, data) = read_timestamp(data)?;
                (M::OnOrBefore(v), data)
            }
            Self::OnOrAfter => {
                let (v, data) = read_timestamp(data)?;
                (M::OnOrAfter(v), data)
            }
        })
    }
}

/// An instance of a match expression in a [CodeRequirementExpression].
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementMatchExpression<'a> {
    /// `exists`
    Exists,

    /// `= <value>`
    Equal(CodeRequirementValue<'a>),

    /// `~ <value>`
    Contains(CodeRequirementValue<'a>),

    /// `= <value>*`
    BeginsWith(CodeRequirementValue<'a>),

    /// `= *<value>`
    EndsWith(CodeRequirementValue<'a>),

    /// `< <value>`
    LessThan(CodeRequirementValue<'a>),

    /// `> <value>`
    GreaterThan(CodeRequirementValue<'a>),

    /// `<= <value>`
    LessThanEqual(CodeRequirementValue<'a>),

    /// `>= <value>`
    GreaterThanEqual(CodeRequirementValue<'a>),

    /// `= timestamp "<timestamp>"`
    On(chrono::DateTime<chrono::Utc>),

    /// `< timestamp "<timestamp>"`
    Before(chrono::DateTime<chrono::Utc>),

    /// `> timestamp "<timestamp>"`
    After(chrono::DateTime<chrono::Utc>),

    /// `<= timestamp "<timestamp>"`
    OnOrBefore(chrono::DateTime<chrono::Utc>),

    /// `>= timestamp "<timestamp>"`
    OnOrAfter(chrono::DateTime<chrono::Utc>),

    /// `absent`
    Absent,
}

impl<'a> Display for CodeRequirementMatchExpression<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ts = |v: &chrono::DateTime<chrono::Utc>| format!("timestamp \"{}\"", v.to_rfc3339());

        match self {
            Self::Exists => f.write_str("exists"),
            Self::Equal(value) => f.write_fmt(format_args!("= {}", value.to_source())),
            Self::Contains(value) => f.write_fmt(format_args!("~ {}", value.to_source())),
            Self::BeginsWith(value) => f.write_fmt(format_args!("= {}", quote(&format!("{}*", value)))),
            Self::EndsWith(value) => f.write_fmt(format_args!("= {}", quote(&format!("*{}", value)))),
            Self::LessThan(value) => f.write_fmt(format_args!("< {}", value.to_source())),
            Self::GreaterThan(value) => f.write_fmt(format_args!("> {}", value.to_source())),
            Self::LessThanEqual(value) => f.write_fmt(format_args!("<= {}", value.to_source())),
            Self::GreaterThanEqual(value) => f.write_fmt(format_args!(">= {}", value.to_source())),
            Self::On(value) => f.write_fmt(format_args!("= {}", ts(value))),
            Self::Before(value) => f.write_fmt(format_args!("< {}", ts(value))),
            Self::After(value) => f.write_fmt(format_args!("> {}", ts(value))),
            Self::OnOrBefore(value) => f.write_fmt(format_args!("<= {}", ts(value))),
            Self::OnOrAfter(value) => f.write_fmt(format_args!(">= {}", ts(value))),
            Self::Absent => f.write_str("absent"),
        }
    }
}

impl<'a> From<&CodeRequirementMatchExpression<'a>> for MatchType {
    fn from(m: &CodeRequirementMatchExpression<'a>) -> Self {
        type M<'b> = CodeRequirementMatchExpression<'b>;

        match m {
            M::Exists => Self::Exists,
            M::Equal(_) => Self::Equal,
            M::Contains(_) => Self::Contains,
            M::BeginsWith(_) => Self::BeginsWith,
            M::EndsWith(_) => Self::EndsWith,
            M::LessThan(_) => Self::LessThan,
            M::GreaterThan(_) => Self::GreaterThan,
            M::LessThanEqual(_) => Self::LessThanEqual,
            M::GreaterThanEqual(_) => Self::GreaterThanEqual,
            M::On(_) => Self::On,
            M::Before(_) => Self::Before,
            M::After(_) => Self::After,
            M::OnOrBefore(_) => Self::OnOrBefore,
            M::OnOrAfter(_) => Self::OnOrAfter,
            M::Absent => Self::Absent,
        }
    }
}

/// Compare strings the way humans order version numbers.
///
/// Runs of ASCII digits compare by numeric value; everything else compares
/// lexically.
fn compare_numerically(a: &str, b: &str) -> Ordering {
    fn chunks(s: &str) -> Vec<(bool, &str)> {
        let mut res = vec![];
        let mut start = 0;
        let bytes = s.as_bytes();

        for i in 1..=bytes.len() {
            if i == bytes.len() || bytes[i].is_ascii_digit() != bytes[start].is_ascii_digit() {
                res.push((bytes[start].is_ascii_digit(), &s[start..i]));
                start = i;
            }
        }

        res
    }

    if a.is_empty() || b.is_empty() {
        return a.cmp(b);
    }

    for (x, y) in chunks(a).into_iter().zip(chunks(b).into_iter()) {
        let ordering = match (x, y) {
            ((true, x), (true, y)) => {
                let x = x.trim_start_matches('0');
                let y = y.trim_start_matches('0');
                x.len().cmp(&y.len()).then_with(|| x.cmp(y))
            }
            ((_, x), (_, y)) => x.cmp(y),
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    chunks(a).len().cmp(&chunks(b).len())
}

impl<'a> CodeRequirementMatchExpression<'a> {
    /// Parse a match expression from bytes.
    ///
    /// The slice should begin with the match type u32.
    pub fn from_bytes(data: &'a [u8]) -> Result<(Self, &'a [u8]), CodeSignError> {
        let typ = data.pread_with::<u32>(0, scroll::BE)?;

        let typ = MatchType::try_from(typ)?;

        typ.parse_payload(&data[4..])
    }

    /// Write binary representation of this match expression to a destination.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), CodeSignError> {
        dest.iowrite_with(MatchType::from(self) as u32, scroll::BE)?;

        match self {
            Self::Exists | Self::Absent => {}
            Self::Equal(value)
            | Self::Contains(value)
            | Self::BeginsWith(value)
            | Self::EndsWith(value)
            | Self::LessThan(value)
            | Self::GreaterThan(value)
            | Self::LessThanEqual(value)
            | Self::GreaterThanEqual(value) => value.write_encoded(dest)?,
            Self::On(value)
            | Self::Before(value)
            | Self::After(value)
            | Self::OnOrBefore(value)
            | Self::OnOrAfter(value) => dest.iowrite_with(value.timestamp(), scroll::BE)?,
        }

        Ok(())
    }

    pub fn to_owned(&self) -> CodeRequirementMatchExpression<'static> {
        type M = CodeRequirementMatchExpression<'static>;

        match self {
            Self::Exists => M::Exists,
            Self::Equal(v) => M::Equal(v.to_owned()),
            Self::Contains(v) => M::Contains(v.to_owned()),
            Self::BeginsWith(v) => M::BeginsWith(v.to_owned()),
            Self::EndsWith(v) => M::EndsWith(v.to_owned()),
            Self::LessThan(v) => M::LessThan(v.to_owned()),
            Self::GreaterThan(v) => M::GreaterThan(v.to_owned()),
            Self::LessThanEqual(v) => M::LessThanEqual(v.to_owned()),
            Self::GreaterThanEqual(v) => M::GreaterThanEqual(v.to_owned()),
            Self::On(v) => M::On(*v),
            Self::Before(v) => M::Before(*v),
            Self::After(v) => M::After(*v),
            Self::OnOrBefore(v) => M::OnOrBefore(*v),
            Self::OnOrAfter(v) => M::OnOrAfter(*v),
            Self::Absent => M::Absent,
        }
    }

    /// Evaluate against raw bytes, if present.
    fn matches_optional_bytes(&self, value: Option<&[u8]>) -> bool {
        match (self, value) {
            (Self::Exists, v) => v.is_some(),
            (Self::Absent, v) => v.is_none(),
            (_, None) => false,
            (_, Some(v)) => match std::str::from_utf8(v) {
                Ok(s) => self.matches_str(s),
                Err(_) => match self {
                    Self::Equal(expected) => expected.as_bytes() == v,
                    _ => false,
                },
            },
        }
    }

    fn matches_optional_str(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (Self::Exists, v) => v.is_some(),
            (Self::Absent, v) => v.is_none(),
            (_, None) => false,
            (_, Some(v)) => self.matches_str(v),
        }
    }

    fn matches_str(&self, s: &str) -> bool {
        let expected = |v: &CodeRequirementValue| match v {
            CodeRequirementValue::String(e) => e.to_string(),
            CodeRequirementValue::Bytes(e) => String::from_utf8_lossy(e).to_string(),
        };

        match self {
            Self::Exists => true,
            Self::Absent => false,
            Self::Equal(v) => s == expected(v),
            Self::Contains(v) => s.contains(&expected(v)),
            Self::BeginsWith(v) => s.starts_with(&expected(v)),
            Self::EndsWith(v) => s.ends_with(&expected(v)),
            Self::LessThan(v) => compare_numerically(s, &expected(v)) == Ordering::Less,
            Self::GreaterThan(v) => compare_numerically(s, &expected(v)) == Ordering::Greater,
            Self::LessThanEqual(v) => compare_numerically(s, &expected(v)) != Ordering::Greater,
            Self::GreaterThanEqual(v) => compare_numerically(s, &expected(v)) != Ordering::Less,
            Self::On(_) | Self::Before(_) | Self::After(_) | Self::OnOrBefore(_) | Self::OnOrAfter(_) => {
                match chrono::DateTime::parse_from_rfc3339(s) {
                    Ok(t) => self.matches_time(t.with_timezone(&chrono::Utc)),
                    Err(_) => false,
                }
            }
        }
    }

    fn matches_time(&self, t: chrono::DateTime<chrono::Utc>) -> bool {
        match self {
            Self::On(v) => t == *v,
            Self::Before(v) => t < *v,
            Self::After(v) => t > *v,
            Self::OnOrBefore(v) => t <= *v,
            Self::OnOrAfter(v) => t >= *v,
            _ => false,
        }
    }

    /// Evaluate against a plist value, if present.
    ///
    /// Arrays match when any element matches.
    pub fn matches_plist(&self, value: Option<&plist::Value>) -> bool {
        let value = match (self, value) {
            (Self::Exists, v) => return v.is_some(),
            (Self::Absent, v) => return v.is_none(),
            (_, None) => return false,
            (_, Some(v)) => v,
        };

        match value {
            plist::Value::Array(values) => values.iter().any(|v| self.matches_plist(Some(v))),
            plist::Value::String(s) => self.matches_str(s),
            plist::Value::Boolean(v) => self.matches_str(if *v { "true" } else { "false" }),
            plist::Value::Integer(v) => self.matches_str(&v.to_string()),
            plist::Value::Real(v) => self.matches_str(&v.to_string()),
            plist::Value::Data(v) => self.matches_optional_bytes(Some(v)),
            plist::Value::Date(v) => {
                let t: std::time::SystemTime = v.clone().into();
                self.matches_time(chrono::DateTime::<chrono::Utc>::from(t))
            }
            _ => false,
        }
    }
}

/// Facts about a code object against which requirements are evaluated.
#[derive(Clone, Debug, Default)]
pub struct RequirementContext {
    pub identifier: Option<String>,
    /// Truncated cdhashes of every code directory and architecture.
    pub cdhashes: Vec<Vec<u8>>,
    pub info_plist: Option<plist::Dictionary>,
    pub entitlements: Option<plist::Dictionary>,
    /// Signing certificate chain, leaf first.
    pub certificates: Vec<CapturedX509Certificate>,
    /// Whether trust evaluation anchored the chain at an Apple root.
    pub anchor_apple: bool,
    /// Whether trust evaluation anchored the chain at any trusted root.
    pub anchor_trusted: bool,
    pub platform: Option<u32>,
}

impl RequirementContext {
    /// Resolve a certificate slot.
    ///
    /// 0 is the leaf and -1 the root. Other negative values count back from
    /// the root.
    pub fn certificate(&self, slot: i32) -> Option<&CapturedX509Certificate> {
        let len = self.certificates.len() as i64;
        let index = if slot < 0 { len + slot as i64 } else { slot as i64 };

        if index < 0 {
            None
        } else {
            self.certificates.get(index as usize)
        }
    }
}

fn tbs_certificate(cert: &CapturedX509Certificate) -> &x509_certificate::rfc5280::Certificate {
    let x509: &X509Certificate = cert.as_ref();
    x509.as_ref()
}

fn certificate_hash_matches(cert: &CapturedX509Certificate, expected: &[u8]) -> bool {
    let der = cert.constructed_data();

    let digest = match expected.len() {
        20 => ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, der),
        32 => ring::digest::digest(&ring::digest::SHA256, der),
        _ => return false,
    };

    digest.as_ref() == expected
}

fn certificate_field(cert: &CapturedX509Certificate, field: &str) -> Option<String> {
    let oid = match field {
        "subject.CN" => rfc4519::OID_COMMON_NAME,
        "subject.OU" => rfc4519::OID_ORGANIZATIONAL_UNIT_NAME,
        "subject.O" => rfc4519::OID_ORGANIZATION_NAME,
        "subject.C" => rfc4519::OID_COUNTRY_NAME,
        "subject.L" => rfc4519::OID_LOCALITY_NAME,
        "subject.ST" => rfc4519::OID_STATE_PROVINCE_NAME,
        _ => {
            debug!("unsupported certificate field in requirement: {}", field);
            return None;
        }
    };

    cert.subject_name()
        .find_first_attribute_string(Oid(Bytes::copy_from_slice(oid.as_ref())))
        .unwrap_or(None)
}

fn certificate_has_policy(cert: &CapturedX509Certificate, oid: &[u8]) -> bool {
    let c = tbs_certificate(cert);

    // Policy OIDs appear as DER OBJECT IDENTIFIERs within the extension.
    let mut needle = vec![0x06, oid.len() as u8];
    needle.extend_from_slice(oid);

    c.iter_extensions()
        .filter(|e| e.id.as_ref() == OID_CERTIFICATE_POLICIES)
        .any(|e| {
            e.value
                .to_bytes()
                .windows(needle.len())
                .any(|w| w == needle.as_slice())
        })
}

/// Represents a series of [CodeRequirementExpression].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodeRequirements<'a>(Vec<CodeRequirementExpression<'a>>);

impl<'a> Deref for CodeRequirements<'a> {
    type Target = Vec<CodeRequirementExpression<'a>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a> DerefMut for CodeRequirements<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'a> Display for CodeRequirements<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, expr) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            f.write_fmt(format_args!("{}", expr))?;
        }

        Ok(())
    }
}

impl<'a> From<Vec<CodeRequirementExpression<'a>>> for CodeRequirements<'a> {
    fn from(v: Vec<CodeRequirementExpression<'a>>) -> Self {
        Self(v)
    }
}

impl<'a> CodeRequirements<'a> {
    /// Parse the binary serialization of code requirements.
    ///
    /// This parses the data that follows the requirement blob header/magic that
    /// usually accompanies the binary representation of code requirements.
    pub fn parse_binary(data: &'a [u8]) -> Result<(Self, &'a [u8]), CodeSignError> {
        let count = data.pread_with::<u32>(0, scroll::BE)?;
        let mut data = &data[4..];

        // Every expression needs at least 4 bytes.
        if count as usize > data.len() / 4 {
            return Err(malformed("expression count exceeds data"));
        }

        let mut elements = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let res = CodeRequirementExpression::from_bytes(data)?;

            elements.push(res.0);
            data = res.1;
        }

        Ok((Self(elements), data))
    }

    /// Parse a code requirement blob, which begins with header magic.
    ///
    /// This can be used to parse the output generated by `csreq -b`.
    pub fn parse_blob(data: &'a [u8]) -> Result<(Self, &'a [u8]), CodeSignError> {
        let data = read_and_validate_blob_header(
            data,
            u32::from(CodeSigningMagic::Requirement),
            "code requirement blob",
        )
        .map_err(|_| malformed("blob header"))?;

        Self::parse_binary(data)
    }

    /// Write binary representation of these expressions to a destination.
    ///
    /// The blob header/magic is not written.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), CodeSignError> {
        dest.iowrite_with(self.0.len() as u32, scroll::BE)?;
        for e in &self.0 {
            e.write_to(dest)?;
        }

        Ok(())
    }

    /// Obtain the blob representation of these expressions.
    ///
    /// The generated data should be equivalent to what `csreq -b` would produce.
    pub fn to_blob_data(&self) -> Result<Vec<u8>, CodeSignError> {
        let mut payload = vec![];
        self.write_to(&mut payload)?;

        let length = u32::try_from(payload.len() + 8)
            .map_err(|_| CodeSignError::ArithmeticOverflow("requirement blob length"))?;

        let mut dest = Vec::with_capacity(payload.len() + 8);
        dest.iowrite_with(u32::from(CodeSigningMagic::Requirement), scroll::BE)?;
        dest.iowrite_with(length, scroll::BE)?;
        dest.write_all(&payload)?;

        Ok(dest)
    }

    /// Have this instance occupy a slot in a [RequirementSetBlob] instance.
    pub fn add_to_requirement_set(
        &self,
        requirements_set: &mut RequirementSetBlob,
        slot: RequirementType,
    ) -> Result<(), CodeSignError> {
        let blob = RequirementBlob::try_from(self)?;

        requirements_set.set_requirements(slot, blob);

        Ok(())
    }

    /// Whether every expression is satisfied.
    pub fn evaluate(&self, context: &RequirementContext) -> bool {
        !self.0.is_empty() && self.0.iter().all(|e| e.evaluate(context))
    }

    pub fn to_owned(&self) -> CodeRequirements<'static> {
        CodeRequirements(self.0.iter().map(|e| e.to_owned()).collect())
    }
}

impl<'a> TryFrom<&CodeRequirements<'a>> for RequirementBlob<'static> {
    type Error = CodeSignError;

    fn try_from(requirements: &CodeRequirements<'a>) -> Result<Self, Self::Error> {
        let mut data = Vec::<u8>::new();
        requirements.write_to(&mut data)?;

        Ok(Self {
            data: Cow::Owned(data),
        })
    }
}

/// The designated requirement of ad-hoc signed code.
///
/// One `cdhash` clause per architecture, joined by `or`.
pub fn adhoc_designated_requirement(
    cdhashes: &[Vec<u8>],
) -> Result<CodeRequirementExpression<'static>, CodeSignError> {
    let mut clauses = cdhashes
        .iter()
        .map(|h| CodeRequirementExpression::CodeDirectoryHash(Cow::Owned(h.clone())));

    let first = clauses
        .next()
        .ok_or_else(|| CodeSignError::InternalError("no cdhash for designated requirement".into()))?;

    Ok(clauses.fold(first, |acc, e| {
        CodeRequirementExpression::Or(Box::new(acc), Box::new(e))
    }))
}

/// Derive the designated requirement of certificate signed code.
///
/// With a team identifier, the requirement pins the identifier, an Apple
/// anchor and the team. Otherwise it pins the identifier and the exact root
/// certificate of the chain.
pub fn certificate_designated_requirement(
    identifier: &str,
    team_id: Option<&str>,
    chain: &[CapturedX509Certificate],
) -> Result<CodeRequirementExpression<'static>, CodeSignError> {
    let ident = CodeRequirementExpression::Identifier(Cow::Owned(identifier.to_string()));

    let anchor = match team_id {
        Some(team) => CodeRequirementExpression::And(
            Box::new(CodeRequirementExpression::AnchorAppleGeneric),
            Box::new(CodeRequirementExpression::CertificateField(
                0,
                "subject.OU".into(),
                CodeRequirementMatchExpression::Equal(team.to_string().into()),
            )),
        ),
        None => {
            let root = chain.last().ok_or_else(|| {
                CodeSignError::InternalError("empty certificate chain".into())
            })?;
            let digest = ring::digest::digest(
                &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
                root.constructed_data(),
            );

            CodeRequirementExpression::AnchorCertificateHash(-1, Cow::Owned(digest.as_ref().to_vec()))
        }
    };

    Ok(CodeRequirementExpression::And(Box::new(ident), Box::new(anchor)))
}

/// Merge internal requirement sources into one set.
///
/// Explicit entries win over defaults. The derived designated requirement
/// only applies when neither source provides one.
pub fn merge_internal_requirements(
    explicit: Option<&RequirementSetBlob>,
    defaults: Option<&RequirementSetBlob>,
    derived_designated: Option<&CodeRequirements>,
) -> Result<RequirementSetBlob<'static>, CodeSignError> {
    let mut merged = RequirementSetBlob::default();

    for source in [defaults, explicit].into_iter().flatten() {
        for (typ, blob) in &source.requirements {
            merged.set_requirements(*typ, blob.to_owned());
        }
    }

    if let Some(designated) = derived_designated {
        if !merged.requirements.contains_key(&RequirementType::Designated) {
            designated.add_to_requirement_set(&mut merged, RequirementType::Designated)?;
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod test {
    use super::*;

    fn verify_roundtrip(reqs: &CodeRequirements, source: &[u8]) {
        let mut dest = Vec::<u8>::new();
        reqs.write_to(&mut dest).unwrap();
        assert_eq!(dest.as_slice(), source);
    }

    fn parse_one(source: &[u8]) -> CodeRequirementExpression {
        let (els, data) = CodeRequirements::parse_binary(source).unwrap();
        assert!(data.is_empty());
        verify_roundtrip(&els, source);
        assert_eq!(els.len(), 1);

        els[0].clone()
    }

    #[test]
    fn parse_false() {
        let source = hex::decode("0000000100000000").unwrap();
        assert_eq!(parse_one(&source), CodeRequirementExpression::False);
    }

    #[test]
    fn parse_identifier() {
        let source = hex::decode("000000010000000200000007666f6f2e62617200").unwrap();

        assert_eq!(
            parse_one(&source),
            CodeRequirementExpression::Identifier("foo.bar".into())
        );
    }

    #[test]
    fn parse_anchor_certificate_hash() {
        let source =
            hex::decode("0000000100000004ffffffff00000014deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
                .unwrap();

        assert_eq!(
            parse_one(&source),
            CodeRequirementExpression::AnchorCertificateHash(
                -1,
                hex::decode("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
                    .unwrap()
                    .into()
            )
        );
    }

    #[test]
    fn parse_and_or_not() {
        let source = hex::decode("00000001000000060000000100000000").unwrap();
        assert_eq!(
            parse_one(&source),
            CodeRequirementExpression::And(
                Box::new(CodeRequirementExpression::True),
                Box::new(CodeRequirementExpression::False)
            )
        );

        let source = hex::decode("00000001000000070000000100000000").unwrap();
        assert_eq!(
            parse_one(&source),
            CodeRequirementExpression::Or(
                Box::new(CodeRequirementExpression::True),
                Box::new(CodeRequirementExpression::False)
            )
        );

        let source = hex::decode("000000010000000900000001").unwrap();
        assert_eq!(
            parse_one(&source),
            CodeRequirementExpression::Not(Box::new(CodeRequirementExpression::True))
        );
    }

    #[test]
    fn owned_copy_of_nested_expressions() {
        let source = hex::decode("00000001000000060000000700000009000000010000000000000001").unwrap();
        let (els, _) = CodeRequirements::parse_binary(&source).unwrap();
        let owned: CodeRequirementExpression<'static> = els[0].to_owned();

        assert_eq!(
            owned,
            CodeRequirementExpression::And(
                Box::new(CodeRequirementExpression::Or(
                    Box::new(CodeRequirementExpression::Not(Box::new(
                        CodeRequirementExpression::True
                    ))),
                    Box::new(CodeRequirementExpression::False),
                )),
                Box::new(CodeRequirementExpression::True),
            )
        );
    }

    #[test]
    fn certificate_subject_fields() {
        let (cert, _) = crate::testutil::self_signed_certificate("TEAM424242");

        assert_eq!(
            certificate_field(&cert, "subject.OU").as_deref(),
            Some("TEAM424242")
        );
        assert_eq!(certificate_field(&cert, "subject.C").as_deref(), Some("US"));
        assert_eq!(certificate_field(&cert, "subject.L"), None);
        assert_eq!(certificate_field(&cert, "subject.bogus"), None);
    }

    #[test]
    fn parse_code_directory_hash() {
        let source =
            hex::decode("000000010000000800000014deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
                .unwrap();

        assert_eq!(
            parse_one(&source),
            CodeRequirementExpression::CodeDirectoryHash(
                hex::decode("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
                    .unwrap()
                    .into()
            )
        );
    }

    #[test]
    fn parse_certificate_field() {
        let source =
            hex::decode("000000010000000bffffffff0000000a7375626a6563742e434e000000000000")
                .unwrap();

        assert_eq!(
            parse_one(&source),
            CodeRequirementExpression::CertificateField(
                -1,
                "subject.CN".into(),
                CodeRequirementMatchExpression::Exists
            )
        );
    }

    #[test]
    fn parse_certificate_generic() {
        let source = hex::decode("000000010000000effffffff000000035504030000000000").unwrap();

        let expr = parse_one(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::CertificateGeneric(
                -1,
                Cow::Borrowed(&[0x55, 4, 3]),
                CodeRequirementMatchExpression::Exists
            )
        );
        assert_eq!(format!("{}", expr), "certificate root[field.2.5.4.3] exists");
    }

    #[test]
    fn parse_match_expressions() {
        let source =
            hex::decode("000000010000000a000000036b657900000000010000000576616c7565000000")
                .unwrap();
        assert_eq!(
            parse_one(&source),
            CodeRequirementExpression::InfoPlistKeyField(
                "key".into(),
                CodeRequirementMatchExpression::Equal(b"value".as_ref().into())
            )
        );

        let source = hex::decode("000000010000000a000000036b6579000000000e").unwrap();
        assert_eq!(
            parse_one(&source),
            CodeRequirementExpression::InfoPlistKeyField(
                "key".into(),
                CodeRequirementMatchExpression::Absent
            )
        );

        let source =
            hex::decode("000000010000000a000000036b6579000000000900000000605fca30").unwrap();
        assert_eq!(
            parse_one(&source),
            CodeRequirementExpression::InfoPlistKeyField(
                "key".into(),
                CodeRequirementMatchExpression::On(chrono::Utc.timestamp(1616890416, 0)),
            )
        );
    }

    #[test]
    fn parse_blob() {
        let source = hex::decode("fade0c00000000100000000100000000").unwrap();

        let (els, data) = CodeRequirements::parse_blob(&source).unwrap();

        assert_eq!(
            els,
            CodeRequirements(vec![CodeRequirementExpression::False])
        );
        assert!(data.is_empty());

        let dest = els.to_blob_data().unwrap();
        assert_eq!(source, dest);
    }

    #[test]
    fn truncated_input() {
        // Identifier claims 7 bytes but only 3 follow.
        let source = hex::decode("0000000100000002000000076162").unwrap();
        assert!(matches!(
            CodeRequirements::parse_binary(&source),
            Err(CodeSignError::RequirementMalformed(_))
        ));

        // Huge expression count.
        let source = hex::decode("ffffffff00000001").unwrap();
        assert!(CodeRequirements::parse_binary(&source).is_err());

        // Unknown opcode.
        let source = hex::decode("00000001000000ff").unwrap();
        assert!(matches!(
            CodeRequirements::parse_binary(&source),
            Err(CodeSignError::RequirementUnknownOpcode(0xff))
        ));

        // Deeply nested not expressions.
        let mut source = hex::decode("00000001").unwrap();
        for _ in 0..1000 {
            source.extend_from_slice(&[0, 0, 0, 9]);
        }
        source.extend_from_slice(&[0, 0, 0, 1]);
        assert!(CodeRequirements::parse_binary(&source).is_err());
    }

    #[test]
    fn requirement_type_order() {
        let mut types = vec![
            RequirementType::Unknown(7),
            RequirementType::Designated,
            RequirementType::Host,
        ];
        types.sort();

        assert_eq!(
            types,
            vec![
                RequirementType::Host,
                RequirementType::Designated,
                RequirementType::Unknown(7)
            ]
        );
    }

    #[test]
    fn evaluate_identity() {
        let mut info = plist::Dictionary::new();
        info.insert("CFBundleShortVersionString".into(), "10.2".into());
        info.insert(
            "Tags".into(),
            plist::Value::Array(vec!["alpha".into(), "beta".into()]),
        );

        let context = RequirementContext {
            identifier: Some("com.example.app".into()),
            cdhashes: vec![vec![0xaa; 20]],
            info_plist: Some(info),
            ..Default::default()
        };

        let ident = CodeRequirementExpression::Identifier("com.example.app".into());
        assert!(ident.evaluate(&context));

        let version = CodeRequirementExpression::InfoPlistKeyField(
            "CFBundleShortVersionString".into(),
            CodeRequirementMatchExpression::GreaterThan("9.5".into()),
        );
        assert!(version.evaluate(&context));

        let tags = CodeRequirementExpression::InfoPlistKeyField(
            "Tags".into(),
            CodeRequirementMatchExpression::BeginsWith("be".into()),
        );
        assert!(tags.evaluate(&context));

        let missing = CodeRequirementExpression::InfoPlistKeyField(
            "Missing".into(),
            CodeRequirementMatchExpression::Absent,
        );
        assert!(missing.evaluate(&context));

        let wrong_hash = CodeRequirementExpression::CodeDirectoryHash(vec![0xbb; 20].into());
        assert!(!wrong_hash.evaluate(&context));
        assert!(CodeRequirementExpression::Or(Box::new(wrong_hash), Box::new(ident)).evaluate(&context));

        assert!(!CodeRequirementExpression::AnchorAppleGeneric.evaluate(&context));
        assert!(!CodeRequirementExpression::Notarized.evaluate(&context));
    }

    #[test]
    fn adhoc_requirement() -> Result<(), CodeSignError> {
        let single = adhoc_designated_requirement(&[vec![0x11; 20]])?;
        assert_eq!(
            format!("{}", single),
            format!("cdhash H\"{}\"", "11".repeat(20))
        );

        let multi = adhoc_designated_requirement(&[vec![0x11; 20], vec![0x22; 20]])?;
        let context = RequirementContext {
            cdhashes: vec![vec![0x22; 20]],
            ..Default::default()
        };
        assert!(multi.evaluate(&context));
        assert!(adhoc_designated_requirement(&[]).is_err());

        Ok(())
    }

    #[test]
    fn merge_priority() -> Result<(), CodeSignError> {
        let explicit_dr = CodeRequirements::from(vec![CodeRequirementExpression::True]);
        let default_host = CodeRequirements::from(vec![CodeRequirementExpression::False]);
        let derived = CodeRequirements::from(vec![CodeRequirementExpression::CodeDirectoryHash(
            vec![0; 20].into(),
        )]);

        let mut explicit = RequirementSetBlob::default();
        explicit_dr.add_to_requirement_set(&mut explicit, RequirementType::Designated)?;
        let mut defaults = RequirementSetBlob::default();
        default_host.add_to_requirement_set(&mut defaults, RequirementType::Host)?;

        let merged = merge_internal_requirements(Some(&explicit), Some(&defaults), Some(&derived))?;
        assert_eq!(merged.requirements.len(), 2);
        assert_eq!(
            merged.requirements[&RequirementType::Designated].parse_expressions()?,
            explicit_dr
        );

        let merged = merge_internal_requirements(None, Some(&defaults), Some(&derived))?;
        assert_eq!(
            merged.requirements[&RequirementType::Designated].parse_expressions()?,
            derived
        );

        Ok(())
    }
}
