// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provides primitives for constructing embeddable signature data structures.

use {
    crate::{
        cms::{create_cdhashes_plist, SigningIdentity, SigningTime},
        code_directory::{CodeDirectoryBuilder, CodeDirectorySet},
        digest::DigestType,
        embedded_signature::{
            create_superblob, Blob, BlobData, BlobWrapperBlob, CodeSigningMagic, CodeSigningSlot,
            TopDirectoryBlob,
        },
        error::CodeSignError,
    },
    log::{debug, info},
    std::collections::BTreeMap,
};

#[derive(Clone, Copy, Debug, PartialEq)]
enum BlobsState {
    Empty,
    SpecialAdded,
    CodeDirectoryAdded,
    SignatureAdded,
}

impl Default for BlobsState {
    fn default() -> Self {
        Self::Empty
    }
}

fn out_of_order(message: &str) -> CodeSignError {
    CodeSignError::InternalError(format!("signature builder: {}", message))
}

/// An entity for producing embedded signature SuperBlobs.
///
/// Special blobs are registered first, then code directories are built
/// (picking up digests of every registered blob), then the signature is
/// added. Out of order calls are rejected.
#[derive(Debug, Default)]
pub struct EmbeddedSignatureBuilder {
    state: BlobsState,
    blobs: BTreeMap<CodeSigningSlot, BlobData<'static>>,
    code_directories: CodeDirectorySet<'static>,
    top_directory: bool,
}

impl EmbeddedSignatureBuilder {
    /// Emit a top directory index listing every slot of the signature.
    #[must_use]
    pub fn with_top_directory(mut self, enabled: bool) -> Self {
        self.top_directory = enabled;
        self
    }

    /// The code directories registered with this instance.
    pub fn code_directories(&self) -> &CodeDirectorySet<'static> {
        &self.code_directories
    }

    /// Register a blob into a slot.
    ///
    /// There can only be a single blob per slot. Last write wins.
    ///
    /// Code directories and signatures cannot be added using this method.
    /// Blobs cannot be registered after a code directory, as this would
    /// invalidate its special slot digests.
    pub fn add_blob(
        &mut self,
        slot: CodeSigningSlot,
        blob: BlobData<'static>,
    ) -> Result<(), CodeSignError> {
        if !matches!(self.state, BlobsState::Empty | BlobsState::SpecialAdded) {
            return Err(out_of_order(
                "cannot add blobs after code directory or signature is registered",
            ));
        }

        if slot.is_code_directory() || slot == CodeSigningSlot::Signature {
            return Err(out_of_order(
                "cannot register code directory or signature blob via add_blob()",
            ));
        }

        if slot == CodeSigningSlot::TOP_DIRECTORY && self.top_directory {
            return Err(out_of_order("top directory slot is reserved"));
        }

        debug!("registering {:?} blob", slot);
        self.blobs.insert(slot, blob);
        self.state = BlobsState::SpecialAdded;

        Ok(())
    }

    /// Slot ids the finished SuperBlob will contain, in order.
    fn planned_slots(&self, code_directory_count: usize) -> Vec<u32> {
        let mut slots = vec![u32::from(CodeSigningSlot::CodeDirectory)];

        let mut specials = self.blobs.keys().map(|s| u32::from(*s)).collect::<Vec<_>>();
        if self.top_directory {
            specials.push(u32::from(CodeSigningSlot::TOP_DIRECTORY));
        }
        specials.sort_unstable();
        specials.dedup();
        slots.extend(specials);

        slots.extend(
            CodeSigningSlot::ALTERNATES
                .iter()
                .take(code_directory_count.saturating_sub(1))
                .map(|s| u32::from(*s)),
        );
        slots.push(u32::from(CodeSigningSlot::Signature));

        slots
    }

    /// Build and register code directories, one per digest type.
    ///
    /// Digests of every registered blob are added to the builder's special
    /// slots first, so callers need not keep them in sync.
    pub fn add_code_directories(
        &mut self,
        mut builder: CodeDirectoryBuilder,
        code: &[u8],
        digests: &[DigestType],
    ) -> Result<&CodeDirectorySet<'static>, CodeSignError> {
        if !matches!(self.state, BlobsState::Empty | BlobsState::SpecialAdded) {
            return Err(out_of_order("code directories already registered"));
        }

        if digests.is_empty() {
            return Err(out_of_order("no digest types requested"));
        }

        if self.top_directory {
            let top = TopDirectoryBlob {
                slots: self.planned_slots(digests.len()),
            };
            debug!("top directory index: {:x?}", top.slots);

            self.blobs.insert(
                CodeSigningSlot::TOP_DIRECTORY,
                BlobData::BlobWrapper(Box::new(BlobWrapperBlob::from_data_owned(
                    top.serialize_payload()?,
                ))),
            );
        }

        for (slot, blob) in &self.blobs {
            if slot.is_code_directory_special_slot() {
                builder.add_special_component(*slot, blob.to_blob_bytes()?)?;
            }
        }

        for cd in builder.build(code, digests)? {
            if !self.code_directories.is_empty() {
                info!("adding alternative code directory using digest {}", cd.hash_type);
            }
            self.code_directories.insert(cd)?;
        }

        self.state = BlobsState::CodeDirectoryAdded;

        Ok(&self.code_directories)
    }

    /// Add CMS signature data to this builder.
    pub fn add_cms_signature(&mut self, der_data: Vec<u8>) -> Result<(), CodeSignError> {
        if self.state != BlobsState::CodeDirectoryAdded {
            return Err(out_of_order("signature requires code directories"));
        }

        self.blobs.insert(
            CodeSigningSlot::Signature,
            BlobData::BlobWrapper(Box::new(BlobWrapperBlob::from_data_owned(der_data))),
        );

        self.state = BlobsState::SignatureAdded;

        Ok(())
    }

    /// Sign the primary code directory with an identity.
    ///
    /// The cdhash of every code directory is attested in the hash agility
    /// attribute.
    pub fn create_cms_signature(
        &mut self,
        identity: &dyn SigningIdentity,
        time: &SigningTime,
    ) -> Result<(), CodeSignError> {
        let primary = self
            .code_directories
            .primary_data()
            .ok_or_else(|| out_of_order("signature requires code directories"))?;

        let cdhashes = self
            .code_directories
            .slots()
            .into_iter()
            .map(|(_, cd, data)| crate::code_directory::cdhash(data, cd.hash_type))
            .collect::<Result<Vec<_>, _>>()?;

        let plist = create_cdhashes_plist(&cdhashes)?;
        let signature = identity.sign(primary, &plist, time)?;

        info!("CMS signature is {} bytes", signature.len());
        self.add_cms_signature(signature)
    }

    /// Register the empty signature of ad-hoc signed code.
    pub fn add_adhoc_signature(&mut self) -> Result<(), CodeSignError> {
        self.add_cms_signature(vec![])
    }

    /// Create the embedded signature "superblob" data.
    pub fn create_superblob(&self) -> Result<Vec<u8>, CodeSignError> {
        if self.state != BlobsState::SignatureAdded {
            return Err(out_of_order(
                "code directory and signature required in order to materialize superblob",
            ));
        }

        let mut blobs = self
            .code_directories
            .slots()
            .into_iter()
            .map(|(slot, _, data)| (slot, data.to_vec()))
            .collect::<Vec<_>>();

        for (slot, blob) in &self.blobs {
            blobs.push((*slot, blob.to_blob_bytes()?));
        }

        blobs.sort_by_key(|(slot, _)| *slot);

        create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter())
    }
}
