// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Apple code signatures: creating them and statically validating them.
//!
//! This crate implements the code signature machinery of Apple operating
//! systems without depending on one. Mach-O binaries (thin or universal) and
//! directory bundles can be signed, ad-hoc or with an X.509 signing identity,
//! and existing signatures can be validated.
//!
//! # Features and Capabilities
//!
//! This crate can:
//!
//! * Parse embedded and detached code signature data into Rust structs. (See
//!   [EmbeddedSignature], [DetachedSignature], [BlobData] and
//!   [CodeDirectoryBlob].)
//! * Build code directories for several digest algorithms at once, with the
//!   cdhashes of every one attested in the CMS signature. (See
//!   [CodeDirectoryBuilder] and [EmbeddedSignatureBuilder].)
//! * Parse, evaluate and render code requirements, in binary form and in the
//!   textual requirement language. (See [CodeRequirementExpression] and
//!   [parse_requirements].)
//! * Apply resource rules to bundle contents and produce or check the
//!   `CodeResources` seal. (See [RuleSet] and [CodeResources].)
//! * Reserve space for signatures in Mach-O binaries, including universal
//!   binaries. (See [macho_allocate].)
//! * Sign binaries and bundles, recursing into nested code. (See [Signer].)
//! * Statically validate signed code: code directories, the CMS envelope,
//!   page digests, resources and requirements. (See [StaticCode].)
//!
//! Validation performed by this crate is static. It will differ from what
//! Apple's operating systems do at execution time. Trust in certificate
//! chains is delegated to a [TrustEvaluator].
//!
//! # Getting Started
//!
//! The [Signer] type is your gateway to how code signing is performed. It is
//! configured through [SigningSettings].
//!
//! The [StaticCode] type validates signed code on disk. What it checks is
//! controlled by [ValidationFlags].
//!
//! The [MachOSignable] trait extends the [goblin::mach::MachO] type with code
//! signing functionality.

mod cms;
pub use cms::*;
mod code_directory;
pub use code_directory::*;
pub mod code_requirement;
pub use code_requirement::*;
mod code_resources;
pub use code_resources::*;
mod digest;
pub use digest::*;
pub mod editor;
pub mod embedded_signature;
pub use embedded_signature::*;
mod embedded_signature_builder;
pub use embedded_signature_builder::*;
pub mod entitlements;
mod error;
pub use error::*;
mod macho;
pub use macho::*;
pub mod macho_allocate;
mod pool;
pub use pool::*;
pub mod reader;
pub mod requirement_text;
pub use requirement_text::*;
mod resource_rules;
pub use resource_rules::*;
mod signer;
pub use signer::*;
mod signing_settings;
pub use signing_settings::*;
mod static_code;
pub use static_code::*;
mod validation;
pub use validation::*;

#[cfg(test)]
mod testutil;
