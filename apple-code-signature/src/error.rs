// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::validation::{ProblemKind, ResourceProblem},
    cryptographic_message_syntax::CmsError,
    std::{path::PathBuf, sync::Arc},
    thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// Coarse classification of a [CodeSignError].
///
/// Callers wanting to react to a failure should match on this rather than on
/// individual error variants, as several variants share a kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Unsigned,
    SignatureInvalid,
    ResourceRulesInvalid,
    ResourceAltered,
    ResourceMissing,
    ResourceAdded,
    BadNestedCode,
    BadDictionaryFormat,
    UnsupportedDigestAlgorithm,
    SignatureTooLarge,
    InvalidTeamIdentifier,
    BadTeamIdentifier,
    WeakResourceRules,
    WeakResourceEnvelope,
    RequirementFailed,
    Revoked,
    Cancelled,
    MalformedBinary,
    Unsupported,
    Io,
    InternalError,
}

/// Unified error type for code signature generation and validation.
#[derive(Debug, Error)]
pub enum CodeSignError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("error walking directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("error interfacing with directory-based bundle: {0}")]
    DirectoryBundle(anyhow::Error),

    #[error("code object is not signed at all: {0}")]
    Unsigned(PathBuf),

    #[error("invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("code page {page} does not match its recorded digest")]
    PageHashMismatch { page: usize },

    #[error("special slot {0} digest does not match its component")]
    SpecialSlotMismatch(u32),

    #[error("invalid resource rules: {0}")]
    ResourceRulesInvalid(String),

    #[error("bad regular expression in resource rules: {0}; {1}")]
    ResourceRuleBadRegex(String, regex::Error),

    #[error("{} problem(s) in resource envelope; first: {} {}", .problems.len(), .kind, first_path(.problems))]
    ResourceEnvelope {
        kind: ProblemKind,
        problems: Vec<ResourceProblem>,
    },

    #[error("nested code is modified or invalid: {path}: {reason}")]
    BadNestedCode { path: String, reason: String },

    #[error("malformed dictionary: {0}")]
    BadDictionaryFormat(String),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(u8),

    #[error("signature data too large: need {needed} bytes but only {available} reserved")]
    SignatureTooLarge { needed: usize, available: usize },

    #[error("invalid team identifier: {0}")]
    InvalidTeamIdentifier(String),

    #[error("team identifier {explicit} does not match signing certificate team {certificate}")]
    BadTeamIdentifier { explicit: String, certificate: String },

    #[error("team identifier differs between architectures: {0} vs {1}")]
    TeamIdentifierMismatch(String, String),

    #[error("resource rules are weak: {0}")]
    WeakResourceRules(String),

    #[error("resource envelope is obsolete (version 1 only)")]
    WeakResourceEnvelope,

    #[error("code failed to satisfy requirement: {0}")]
    RequirementFailed(String),

    #[error("unknown code requirement opcode: {0}")]
    RequirementUnknownOpcode(u32),

    #[error("unknown code requirement match expression: {0}")]
    RequirementUnknownMatchExpression(u32),

    #[error("code requirement data malformed: {0}")]
    RequirementMalformed(&'static str),

    #[error("unable to parse requirement text at offset {offset}: {message}")]
    RequirementSyntax { offset: usize, message: String },

    #[error("certificate has been revoked: {0}")]
    Revoked(String),

    #[error("certificate expired or not yet valid: {0}")]
    CertificateExpired(String),

    #[error("trust evaluation failed: {0}")]
    TrustFailure(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid Mach-O binary: {0}")]
    InvalidBinary(String),

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("SuperBlob data is malformed")]
    SuperblobMalformed,

    #[error("malformed code directory: {0}")]
    CodeDirectoryMalformed(&'static str),

    #[error("duplicate code directory for digest {0:?}")]
    DuplicateCodeDirectory(crate::DigestType),

    #[error("__LINKEDIT isn't final Mach-O segment")]
    LinkeditNotLast,

    #[error("__LINKEDIT segment does not end at the end of the slice")]
    DataAfterSignature,

    #[error("insufficient room to write code signature load command")]
    LoadCommandNoRoom,

    #[error("integer overflow computing {0}")]
    ArithmeticOverflow(&'static str),

    #[error("cannot both remove and add signatures in one universal binary")]
    MixedSignatureRemoval,

    #[error("no identifier string could be resolved")]
    NoIdentifier,

    #[error("bundle Info.plist does not define CFBundleExecutable: {0}")]
    BundleNoMainExecutable(PathBuf),

    #[error("unable to parse settings scope: {0}")]
    ParseSettingsScope(String),

    #[error("unknown code signature flag: {0}")]
    CodeSignatureUnknownFlag(String),

    #[error("unknown executable segment flag: {0}")]
    ExecutableSegmentUnknownFlag(String),

    #[error("entitlements data not valid UTF-8: {0}")]
    EntitlementsBadUtf8(std::str::Utf8Error),

    #[error("error encoding entitlements to DER: {0}")]
    EntitlementsDerEncode(String),

    #[error("error parsing version string: {0}")]
    VersionParse(#[from] semver::Error),

    #[error("PEM error: {0}")]
    Pem(#[from] pem::PemError),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("unsupported file type in resource tree: {0}")]
    UnsupportedResourceType(String),

    #[error("unable to read resource {path}: {source}")]
    UnreadableResource {
        path: String,
        source: std::io::Error,
    },

    #[error("internal error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Replayed(Arc<CodeSignError>),
}

fn first_path(problems: &[ResourceProblem]) -> &str {
    problems.first().map(|p| p.path.as_str()).unwrap_or("")
}

impl CodeSignError {
    /// Resolve the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Walk(_) => ErrorKind::Io,
            Self::Unsigned(_) => ErrorKind::Unsigned,
            Self::SignatureInvalid(_)
            | Self::PageHashMismatch { .. }
            | Self::SpecialSlotMismatch(_)
            | Self::SuperblobMalformed
            | Self::BadMagic(_)
            | Self::CodeDirectoryMalformed(_)
            | Self::DuplicateCodeDirectory(_)
            | Self::Cms(_)
            | Self::X509(_)
            | Self::CertificateExpired(_)
            | Self::TrustFailure(_)
            | Self::RequirementUnknownOpcode(_)
            | Self::RequirementUnknownMatchExpression(_)
            | Self::RequirementMalformed(_) => ErrorKind::SignatureInvalid,
            Self::ResourceRulesInvalid(_) | Self::ResourceRuleBadRegex(..) => {
                ErrorKind::ResourceRulesInvalid
            }
            Self::ResourceEnvelope { kind, .. } => kind.error_kind(),
            Self::BadNestedCode { .. } => ErrorKind::BadNestedCode,
            Self::BadDictionaryFormat(_) | Self::Plist(_) => ErrorKind::BadDictionaryFormat,
            Self::UnsupportedDigestAlgorithm(_) => ErrorKind::UnsupportedDigestAlgorithm,
            Self::SignatureTooLarge { .. } => ErrorKind::SignatureTooLarge,
            Self::InvalidTeamIdentifier(_) => ErrorKind::InvalidTeamIdentifier,
            Self::BadTeamIdentifier { .. } | Self::TeamIdentifierMismatch(..) => {
                ErrorKind::BadTeamIdentifier
            }
            Self::WeakResourceRules(_) => ErrorKind::WeakResourceRules,
            Self::WeakResourceEnvelope => ErrorKind::WeakResourceEnvelope,
            Self::RequirementFailed(_) | Self::RequirementSyntax { .. } => {
                ErrorKind::RequirementFailed
            }
            Self::Revoked(_) => ErrorKind::Revoked,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Goblin(_)
            | Self::Scroll(_)
            | Self::InvalidBinary(_)
            | Self::LinkeditNotLast
            | Self::DataAfterSignature
            | Self::LoadCommandNoRoom
            | Self::ArithmeticOverflow(_)
            | Self::BundleNoMainExecutable(_)
            | Self::DirectoryBundle(_) => ErrorKind::MalformedBinary,
            Self::Unsupported(_) | Self::UnsupportedResourceType(_) => ErrorKind::Unsupported,
            Self::UnreadableResource { .. } => ErrorKind::Io,
            Self::Replayed(inner) => inner.kind(),
            Self::MixedSignatureRemoval
            | Self::NoIdentifier
            | Self::ParseSettingsScope(_)
            | Self::CodeSignatureUnknownFlag(_)
            | Self::ExecutableSegmentUnknownFlag(_)
            | Self::EntitlementsBadUtf8(_)
            | Self::EntitlementsDerEncode(_)
            | Self::VersionParse(_)
            | Self::Pem(_)
            | Self::InternalError(_) => ErrorKind::InternalError,
        }
    }

    /// Resource problems carried by this error, if any.
    pub fn resource_problems(&self) -> &[ResourceProblem] {
        match self {
            Self::ResourceEnvelope { problems, .. } => problems,
            Self::Replayed(inner) => inner.resource_problems(),
            _ => &[],
        }
    }
}
