// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describing signature data found in files.

use {
    crate::{
        cms::{certificate_subject, certificate_team_id},
        code_directory::cdhash,
        code_resources::{CodeResources, CODE_RESOURCES_PATH},
        digest::DigestType,
        embedded_signature::{BlobEntry, DetachedSignature, EmbeddedSignature},
        error::CodeSignError,
        macho::{parse_slices, MachOSignable},
        static_code::BundleLayout,
    },
    cryptographic_message_syntax::{SignedData, SignerInfo},
    serde::Serialize,
    std::path::{Path, PathBuf},
    x509_certificate::CapturedX509Certificate,
};

#[derive(Clone, Debug, Serialize)]
pub struct BlobDescription {
    pub slot: String,
    pub magic: String,
    pub length: u32,
    pub sha256: String,
}

impl<'a> TryFrom<&BlobEntry<'a>> for BlobDescription {
    type Error = CodeSignError;

    fn try_from(entry: &BlobEntry<'a>) -> Result<Self, Self::Error> {
        Ok(Self {
            slot: format!("{:?}", entry.slot),
            magic: format!("{:x}", u32::from(entry.magic)),
            length: entry.length as _,
            sha256: hex::encode(entry.digest_with(DigestType::Sha256)?),
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

impl From<&CapturedX509Certificate> for CertificateInfo {
    fn from(cert: &CapturedX509Certificate) -> Self {
        Self {
            subject: certificate_subject(cert),
            issuer: cert
                .issuer_name()
                .user_friendly_str()
                .unwrap_or_else(|_| "<unknown issuer>".to_string()),
            key_algorithm: cert.key_algorithm().map(|x| x.to_string()),
            signature_algorithm: cert.signature_algorithm().map(|x| x.to_string()),
            team_id: certificate_team_id(cert),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CmsSigner {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub digest_algorithm: String,
    pub signature_algorithm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_time: Option<chrono::DateTime<chrono::Utc>>,
    pub signature_verifies: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_stamp_token: Option<CmsSignature>,
}

impl CmsSigner {
    pub fn from_signer_info_and_signed_data(
        signer_info: &SignerInfo,
        signed_data: &SignedData,
    ) -> Result<Self, CodeSignError> {
        let mut message_digest = None;
        let mut signing_time = None;

        if let Some(sa) = signer_info.signed_attributes() {
            message_digest = Some(hex::encode(sa.message_digest()));
            if let Some(t) = sa.signing_time() {
                signing_time = Some(*t);
            }
        }

        let time_stamp_token = match signer_info.time_stamp_token_signed_data()? {
            Some(token) => Some(CmsSignature::try_from(token)?),
            None => None,
        };

        Ok(Self {
            issuer: signer_info
                .certificate_issuer_and_serial()
                .and_then(|(name, _)| name.user_friendly_str().ok()),
            digest_algorithm: signer_info.digest_algorithm().to_string(),
            signature_algorithm: signer_info.signature_algorithm().to_string(),
            message_digest,
            signing_time,
            signature_verifies: signer_info
                .verify_signature_with_signed_data(signed_data)
                .is_ok(),
            time_stamp_token,
        })
    }
}

/// High-level representation of a CMS signature.
#[derive(Clone, Debug, Serialize)]
pub struct CmsSignature {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<CertificateInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub signers: Vec<CmsSigner>,
}

impl TryFrom<SignedData> for CmsSignature {
    type Error = CodeSignError;

    fn try_from(signed_data: SignedData) -> Result<Self, Self::Error> {
        let certificates = signed_data
            .certificates()
            .map(CertificateInfo::from)
            .collect::<Vec<_>>();

        let signers = signed_data
            .signers()
            .map(|x| CmsSigner::from_signer_info_and_signed_data(x, &signed_data))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            certificates,
            signers,
        })
    }
}

/// One code directory of a signature.
#[derive(Clone, Debug, Serialize)]
pub struct CodeDirectoryDescription {
    pub slot: String,
    pub version: String,
    pub digest_type: String,
    pub cdhash: String,
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub flags: String,
    pub code_limit: u64,
    pub page_size: u32,
    pub code_slots: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable_segment_flags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub slot_digests: Vec<String>,
}

/// High level representation of a code signature.
#[derive(Clone, Debug, Serialize)]
pub struct CodeSignature {
    /// Length of the code signature data.
    pub superblob_length: u32,
    pub blobs: Vec<BlobDescription>,
    pub code_directories: Vec<CodeDirectoryDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_directory: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements_plist: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub code_requirements: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cms: Option<CmsSignature>,
}

impl<'a> TryFrom<&EmbeddedSignature<'a>> for CodeSignature {
    type Error = CodeSignError;

    fn try_from(sig: &EmbeddedSignature<'a>) -> Result<Self, Self::Error> {
        let mut code_directories = vec![];

        for (slot, cd) in sig.all_code_directories()? {
            let data = sig
                .find_slot(slot)
                .map(|entry| entry.data)
                .unwrap_or_default();

            let cdhash = if cd.hash_type.strength() > 0 {
                hex::encode(cdhash(data, cd.hash_type)?)
            } else {
                "unsupported".to_string()
            };

            code_directories.push(CodeDirectoryDescription {
                slot: format!("{:?}", slot),
                version: format!("0x{:X}", cd.version),
                digest_type: cd.hash_type.to_string(),
                cdhash,
                identifier: cd.ident.to_string(),
                team_id: cd.team_name.as_ref().map(|x| x.to_string()),
                flags: format!("{:?}", cd.flags),
                code_limit: cd.effective_code_limit(),
                page_size: cd.page_size,
                code_slots: cd.code_hashes.len(),
                executable_segment_flags: cd.exec_seg_flags.map(|x| format!("{:?}", x)),
                runtime: cd.runtime.map(|x| {
                    format!("{}.{}.{}", x >> 16, (x >> 8) & 0xff, x & 0xff)
                }),
                slot_digests: cd
                    .special_hashes
                    .iter()
                    .map(|(slot, digest)| format!("{:?}: {}", slot, digest.as_hex()))
                    .collect::<Vec<_>>(),
            });
        }

        let entitlements_plist = sig.entitlements()?.map(|blob| blob.as_str().to_string());

        let mut code_requirements = vec![];
        if let Some(reqs) = sig.code_requirements()? {
            for (req, blob) in &reqs.requirements {
                code_requirements.push(format!("{}: {}", req, blob.parse_expressions()?));
            }
        }

        let cms = match sig.signed_data()? {
            Some(signed_data) => Some(signed_data.try_into()?),
            None => None,
        };

        Ok(Self {
            superblob_length: sig.length,
            blobs: sig
                .blobs
                .iter()
                .map(BlobDescription::try_from)
                .collect::<Result<Vec<_>, _>>()?,
            code_directories,
            top_directory: sig
                .top_directory()?
                .map(|top| top.slots.iter().map(|s| format!("0x{:x}", s)).collect()),
            entitlements_plist,
            code_requirements,
            cms,
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MachOEntity {
    pub cputype: u32,
    pub signature: Option<CodeSignature>,
}

/// Summary of a bundle's resource seal.
#[derive(Clone, Debug, Serialize)]
pub struct CodeResourcesEntity {
    pub has_rules2: bool,
    pub files: usize,
    pub files2: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureEntity {
    MachO(MachOEntity),
    CodeResources(CodeResourcesEntity),
    Other,
}

#[derive(Clone, Debug, Serialize)]
pub struct FileEntity {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    pub entity: SignatureEntity,
}

/// Entity for reading Apple code signature data.
pub enum SignatureReader {
    MachO(PathBuf, Vec<u8>),
    Detached(PathBuf, Vec<u8>),
    Bundle(PathBuf, BundleLayout),
}

impl SignatureReader {
    /// Construct a signature reader from a path.
    ///
    /// Directories are read as bundles. Files holding a detached signature
    /// are recognized by their magic.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CodeSignError> {
        let path = path.as_ref();

        if path.is_dir() {
            return Ok(Self::Bundle(path.to_path_buf(), BundleLayout::resolve(path)?));
        }

        let data = std::fs::read(path)?;

        if DetachedSignature::from_bytes(&data).is_ok() {
            Ok(Self::Detached(path.to_path_buf(), data))
        } else {
            parse_slices(&data)?;
            Ok(Self::MachO(path.to_path_buf(), data))
        }
    }

    /// Obtain entities that are possibly relevant to code signing.
    pub fn entities(&self) -> Result<Vec<FileEntity>, CodeSignError> {
        match self {
            Self::MachO(path, data) => Self::resolve_macho_entities(path, data),
            Self::Detached(path, data) => {
                let detached = DetachedSignature::from_bytes(data)?;

                detached
                    .architectures
                    .iter()
                    .map(|(cputype, sig)| -> Result<FileEntity, CodeSignError> {
                        Ok(FileEntity {
                            path: path.clone(),
                            sub_path: Some(format!("cputype:{}", cputype)),
                            entity: SignatureEntity::MachO(MachOEntity {
                                cputype: *cputype,
                                signature: Some(sig.try_into()?),
                            }),
                        })
                    })
                    .collect()
            }
            Self::Bundle(root, layout) => {
                let main_exe = layout.main_executable_path();
                let mut entities =
                    Self::resolve_macho_entities(&main_exe, &std::fs::read(&main_exe)?)?;

                let seal_path = layout.resource_root.join(CODE_RESOURCES_PATH);
                let entity = if seal_path.is_file() {
                    let resources = CodeResources::from_xml(&std::fs::read(&seal_path)?)?;

                    SignatureEntity::CodeResources(CodeResourcesEntity {
                        has_rules2: resources.has_v2(),
                        files: resources.files.len(),
                        files2: resources.files2.len(),
                    })
                } else {
                    SignatureEntity::Other
                };

                entities.push(FileEntity {
                    path: root.clone(),
                    sub_path: Some(CODE_RESOURCES_PATH.to_string()),
                    entity,
                });

                Ok(entities)
            }
        }
    }

    fn resolve_macho_entities(path: &Path, data: &[u8]) -> Result<Vec<FileEntity>, CodeSignError> {
        let slices = parse_slices(data)?;
        let multiple = slices.len() > 1;

        slices
            .iter()
            .map(|slice| -> Result<FileEntity, CodeSignError> {
                let signature = match slice.macho.code_signature()? {
                    Some(sig) => Some(CodeSignature::try_from(&sig)?),
                    None => None,
                };

                Ok(FileEntity {
                    path: path.to_path_buf(),
                    sub_path: multiple.then(|| format!("macho-index:{}", slice.index)),
                    entity: SignatureEntity::MachO(MachOEntity {
                        cputype: slice.cputype,
                        signature,
                    }),
                })
            })
            .collect()
    }
}
