// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Cryptographic envelope of code signatures.

The signature slot of an embedded signature holds a CMS `SignedData` whose
message is the serialized primary code directory. The signer also attests
to the cdhash of every code directory via a signed attribute holding an XML
plist (the "hash agility" attribute), so a verifier can detect removal or
substitution of alternate code directories.

The signature engine only talks to the cryptography through the
[SigningIdentity] and [TrustEvaluator] traits. [CmsSigningIdentity] and
[ValidityTrustEvaluator] are the default implementations.
*/

use {
    crate::error::CodeSignError,
    bcder::{decode::Constructed, Oid},
    bytes::Bytes,
    chrono::{DateTime, Utc},
    cryptographic_message_syntax::{
        asn1::rfc3161::TstInfo, SignedData, SignedDataBuilder, SignerBuilder, SignerInfo,
    },
    log::{debug, warn},
    plist::{Dictionary, Value},
    x509_certificate::{
        asn1time::Time, rfc4519::OID_ORGANIZATIONAL_UNIT_NAME, CapturedX509Certificate,
        DigestAlgorithm, InMemorySigningKeyPair, X509Certificate,
    },
};

/// OID of the signed attribute holding the cdhashes plist.
///
/// 1.2.840.113635.100.9.1
pub const CDHASH_PLIST_OID: bcder::ConstOid = Oid(&[42, 134, 72, 134, 247, 99, 100, 9, 1]);

/// Fixed allowance for the CMS structure itself.
const CMS_OVERHEAD: usize = 4096;

/// Allowance for a time-stamp token.
const TIME_STAMP_OVERHEAD: usize = 8192;

/// Maximum length of a team identifier.
const MAX_TEAM_ID_LEN: usize = 64;

/// The signing time to record in a signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigningTime {
    /// Record the current time.
    Now,
    /// Record no signing time.
    None,
    /// Record an explicit time.
    At(DateTime<Utc>),
}

impl Default for SigningTime {
    fn default() -> Self {
        Self::Now
    }
}

/// An entity capable of producing the cryptographic signature of code.
pub trait SigningIdentity {
    /// Produce the content of the signature slot.
    ///
    /// `code_directory` is the serialized primary code directory and
    /// `cdhashes_plist` the hash agility attribute value.
    fn sign(
        &self,
        code_directory: &[u8],
        cdhashes_plist: &[u8],
        time: &SigningTime,
    ) -> Result<Vec<u8>, CodeSignError>;

    /// Upper bound of the size of signatures produced by [Self::sign].
    fn estimate_size(&self) -> usize;

    /// The certificate chain, leaf first.
    fn certificates(&self) -> &[CapturedX509Certificate];

    /// The team identifier embedded in the signing certificate.
    fn team_id(&self) -> Option<String> {
        self.certificates().first().and_then(certificate_team_id)
    }
}

/// A [SigningIdentity] backed by an in-memory private key.
pub struct CmsSigningIdentity {
    key: InMemorySigningKeyPair,
    chain: Vec<CapturedX509Certificate>,
    time_stamp_url: Option<String>,
}

impl std::fmt::Debug for CmsSigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmsSigningIdentity")
            .field(
                "subject",
                &self
                    .chain
                    .first()
                    .map(certificate_subject),
            )
            .field("chain_length", &self.chain.len())
            .field("time_stamp_url", &self.time_stamp_url)
            .finish()
    }
}

impl CmsSigningIdentity {
    pub fn new(key: InMemorySigningKeyPair, certificate: CapturedX509Certificate) -> Self {
        Self {
            key,
            chain: vec![certificate],
            time_stamp_url: None,
        }
    }

    /// Add issuing certificates. They are embedded in signatures.
    #[must_use]
    pub fn with_chain(mut self, certificates: impl IntoIterator<Item = CapturedX509Certificate>) -> Self {
        self.chain.extend(certificates);
        self
    }

    /// Request a time-stamp token from an RFC 3161 server when signing.
    #[must_use]
    pub fn with_time_stamp_url(mut self, url: impl ToString) -> Self {
        self.time_stamp_url = Some(url.to_string());
        self
    }

    /// Construct an instance from PEM encoded data.
    ///
    /// The data must contain one `PRIVATE KEY` (PKCS#8) and at least one
    /// `CERTIFICATE`. The first certificate is the signing certificate.
    pub fn from_pem_data(data: &[u8]) -> Result<Self, CodeSignError> {
        let mut key = None;
        let mut certificates = vec![];

        for pem in pem::parse_many(data)? {
            match pem.tag.as_str() {
                "CERTIFICATE" => {
                    certificates.push(CapturedX509Certificate::from_der(pem.contents)?);
                }
                "PRIVATE KEY" => {
                    if key.is_some() {
                        return Err(CodeSignError::TrustFailure(
                            "multiple private keys in PEM data".into(),
                        ));
                    }
                    key = Some(InMemorySigningKeyPair::from_pkcs8_der(&pem.contents)?);
                }
                tag => warn!("ignoring unhandled PEM section {}", tag),
            }
        }

        let key = key
            .ok_or_else(|| CodeSignError::TrustFailure("no private key in PEM data".into()))?;

        let mut certificates = certificates.into_iter();
        let leaf = certificates
            .next()
            .ok_or_else(|| CodeSignError::TrustFailure("no certificate in PEM data".into()))?;

        Ok(Self::new(key, leaf).with_chain(certificates))
    }
}

impl SigningIdentity for CmsSigningIdentity {
    fn sign(
        &self,
        code_directory: &[u8],
        cdhashes_plist: &[u8],
        time: &SigningTime,
    ) -> Result<Vec<u8>, CodeSignError> {
        // The CMS builder always records the current time.
        if !matches!(time, SigningTime::Now) {
            return Err(CodeSignError::Unsupported(
                "CMS signatures only support the current signing time",
            ));
        }

        let leaf = self
            .chain
            .first()
            .ok_or_else(|| CodeSignError::InternalError("empty certificate chain".into()))?;

        let signer = SignerBuilder::new(&self.key, leaf.clone())
            .message_id_content(code_directory.to_vec())
            .signed_attribute_octet_string(
                Oid(Bytes::copy_from_slice(CDHASH_PLIST_OID.as_ref())),
                cdhashes_plist,
            );
        let signer = if let Some(url) = &self.time_stamp_url {
            debug!("requesting time-stamp token from {}", url);
            signer
                .time_stamp_url(url.as_str())
                .map_err(|e| CodeSignError::TrustFailure(format!("bad time-stamp URL: {}", e)))?
        } else {
            signer
        };

        let mut builder = SignedDataBuilder::default().signer(signer);
        for cert in &self.chain {
            builder = builder.certificate(cert.clone());
        }

        Ok(builder.build_der()?)
    }

    fn estimate_size(&self) -> usize {
        let certificates = self
            .chain
            .iter()
            .map(|c| c.constructed_data().len())
            .sum::<usize>();

        let time_stamp = if self.time_stamp_url.is_some() {
            TIME_STAMP_OVERHEAD
        } else {
            0
        };

        certificates + CMS_OVERHEAD + time_stamp
    }

    fn certificates(&self) -> &[CapturedX509Certificate] {
        &self.chain
    }
}

/// Serialize the hash agility attribute value.
///
/// Each cdhash is truncated to 20 bytes. Order follows the code directory
/// slots: primary first, then alternates.
pub fn create_cdhashes_plist(cdhashes: &[Vec<u8>]) -> Result<Vec<u8>, CodeSignError> {
    let mut dict = Dictionary::new();
    dict.insert(
        "cdhashes".to_string(),
        Value::Array(
            cdhashes
                .iter()
                .map(|h| Value::Data(h[..h.len().min(crate::digest::CDHASH_LEN)].to_vec()))
                .collect(),
        ),
    );

    let mut buffer = vec![];
    Value::from(dict).to_writer_xml(&mut buffer)?;
    buffer.push(b'\n');

    Ok(buffer)
}

/// Parse the hash agility attribute value.
pub fn parse_cdhashes_plist(data: &[u8]) -> Result<Vec<Vec<u8>>, CodeSignError> {
    let value = Value::from_reader_xml(std::io::Cursor::new(data))?;

    let array = value
        .as_dictionary()
        .and_then(|d| d.get("cdhashes"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| CodeSignError::BadDictionaryFormat("cdhashes plist lacks array".into()))?;

    array
        .iter()
        .map(|v| {
            v.as_data().map(|d| d.to_vec()).ok_or_else(|| {
                CodeSignError::BadDictionaryFormat("cdhashes entry is not data".into())
            })
        })
        .collect()
}

/// Strip the header of a DER `OCTET STRING`.
fn octet_string_content(data: &[u8]) -> Result<&[u8], CodeSignError> {
    let bad = || CodeSignError::SignatureInvalid("malformed cdhashes attribute".into());

    if data.first() != Some(&0x04) {
        return Err(bad());
    }

    let first = *data.get(1).ok_or_else(bad)?;
    let (length, header) = if first & 0x80 == 0 {
        (first as usize, 2)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 {
            return Err(bad());
        }

        let bytes = data.get(2..2 + count).ok_or_else(bad)?;
        (
            bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize),
            2 + count,
        )
    };

    data.get(header..header + length).ok_or_else(bad)
}

/// Facts extracted from a verified CMS signature.
#[derive(Clone, Debug, Default)]
pub struct CmsInfo {
    /// Certificate chain ordered leaf first.
    pub certificates: Vec<CapturedX509Certificate>,
    /// Signing time claimed by the signer.
    pub signing_time: Option<DateTime<Utc>>,
    /// Signing time vouched for by a time-stamp authority.
    pub timestamp: Option<DateTime<Utc>>,
    /// cdhashes from the hash agility attribute, if present.
    pub cdhashes: Option<Vec<Vec<u8>>>,
}

impl CmsInfo {
    pub fn is_timestamped(&self) -> bool {
        self.timestamp.is_some()
    }
}

fn order_chain(
    signer: &SignerInfo,
    certificates: Vec<CapturedX509Certificate>,
) -> Result<Vec<CapturedX509Certificate>, CodeSignError> {
    let (issuer, serial) = signer
        .certificate_issuer_and_serial()
        .ok_or_else(|| CodeSignError::SignatureInvalid("signer lacks issuer and serial".into()))?;

    let mut remaining = certificates;
    let leaf_index = remaining
        .iter()
        .position(|c| c.issuer_name() == issuer && c.serial_number_asn1() == serial)
        .ok_or_else(|| {
            CodeSignError::SignatureInvalid("signing certificate not in signature".into())
        })?;

    let mut chain = vec![remaining.remove(leaf_index)];

    loop {
        let current = &chain[chain.len() - 1];
        if current.subject_is_issuer() {
            break;
        }

        match remaining
            .iter()
            .position(|c| c.subject_name() == current.issuer_name())
        {
            Some(index) => chain.push(remaining.remove(index)),
            None => break,
        }
    }

    Ok(chain)
}

/// Verify CMS signature data over a serialized code directory.
///
/// This checks the signature and the message digest, orders the embedded
/// certificates leaf first and extracts the signing time and the hash agility
/// attribute. Trust in the certificates is not evaluated.
pub fn verify_cms(data: &[u8], code_directory: &[u8]) -> Result<CmsInfo, CodeSignError> {
    let signed_data = SignedData::parse_ber(data)?;

    let mut signers = signed_data.signers();
    let signer = signers
        .next()
        .ok_or_else(|| CodeSignError::SignatureInvalid("CMS has no signers".into()))?;
    if signers.next().is_some() {
        return Err(CodeSignError::SignatureInvalid("CMS has multiple signers".into()));
    }

    signer.verify_signature_with_signed_data(&signed_data)?;
    signer.verify_message_digest_with_content(code_directory)?;

    let certificates = order_chain(signer, signed_data.certificates().cloned().collect())?;

    let mut info = CmsInfo {
        certificates,
        ..Default::default()
    };

    if let Some(attributes) = signer.signed_attributes() {
        info.signing_time = attributes.signing_time().cloned();

        for attribute in attributes.attributes().iter() {
            if attribute.typ.as_ref() != CDHASH_PLIST_OID.as_ref() {
                continue;
            }

            let value = attribute.values.first().ok_or_else(|| {
                CodeSignError::SignatureInvalid("empty cdhashes attribute".into())
            })?;

            info.cdhashes = Some(parse_cdhashes_plist(octet_string_content(
                value.as_slice(),
            )?)?);
        }
    }

    if let Some(token) = signer.time_stamp_token_signed_data()? {
        signer.verify_time_stamp_token()?;

        let tst_info = token.signed_content().ok_or_else(|| {
            CodeSignError::SignatureInvalid("time-stamp token has no content".into())
        })?;
        let time = time_stamp_generation_time(tst_info, signer.signature())?;
        debug!("signature carries time-stamp token ({})", time);

        info.timestamp = Some(time);
    }

    Ok(info)
}

/// Obtain the generation time from DER encoded `TSTInfo`.
///
/// The message imprint must digest `signature`, the signature value the
/// time-stamp token vouches for.
fn time_stamp_generation_time(
    tst_info: &[u8],
    signature: &[u8],
) -> Result<DateTime<Utc>, CodeSignError> {
    let tst_info = Constructed::decode(
        Bytes::copy_from_slice(tst_info),
        bcder::Mode::Der,
        |cons| TstInfo::take_from(cons),
    )
    .map_err(|e| CodeSignError::SignatureInvalid(format!("malformed time-stamp token: {}", e)))?;

    let algorithm = DigestAlgorithm::try_from(&tst_info.message_imprint.hash_algorithm)
        .map_err(|e| CodeSignError::SignatureInvalid(format!("time-stamp digest: {}", e)))?;
    let mut digester = algorithm.digester();
    digester.update(signature);

    if digester.finish().as_ref() != tst_info.message_imprint.hashed_message.to_bytes().as_ref() {
        return Err(CodeSignError::SignatureInvalid(
            "time-stamp token does not cover the signature".into(),
        ));
    }

    Ok(tst_info.gen_time.into())
}

/// Policy inputs to trust evaluation.
#[derive(Clone, Debug, Default)]
pub struct TrustPolicy {
    /// Time at which validity is evaluated. Defaults to now.
    pub signing_time: Option<DateTime<Utc>>,
    /// Whether `signing_time` is vouched for by a time-stamp authority.
    pub timestamped: bool,
    /// Forbid network access, e.g. for revocation checks.
    pub no_network: bool,
    /// Tolerate expired certificates.
    pub allow_expired: bool,
}

/// Outcome of trust evaluation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TrustResult {
    /// The chain is anchored at an Apple root.
    pub anchor_apple: bool,
    /// The chain is anchored at a trusted root.
    pub anchor_trusted: bool,
}

/// Evaluates trust in a certificate chain.
pub trait TrustEvaluator {
    /// `chain` is ordered leaf first.
    fn evaluate(
        &self,
        chain: &[CapturedX509Certificate],
        policy: &TrustPolicy,
    ) -> Result<TrustResult, CodeSignError>;
}

/// A [TrustEvaluator] checking chain signatures and validity windows.
///
/// A chain is trusted when its root is one of the configured anchors.
/// Revocation is checked against a local list only.
#[derive(Clone, Debug, Default)]
pub struct ValidityTrustEvaluator {
    anchors: Vec<CapturedX509Certificate>,
    apple_anchors: Vec<CapturedX509Certificate>,
    revoked: Vec<CapturedX509Certificate>,
}

impl ValidityTrustEvaluator {
    #[must_use]
    pub fn with_anchor(mut self, cert: CapturedX509Certificate) -> Self {
        self.anchors.push(cert);
        self
    }

    /// Register a root that satisfies `anchor apple` requirements.
    #[must_use]
    pub fn with_apple_anchor(mut self, cert: CapturedX509Certificate) -> Self {
        self.apple_anchors.push(cert);
        self
    }

    #[must_use]
    pub fn with_revoked(mut self, cert: CapturedX509Certificate) -> Self {
        self.revoked.push(cert);
        self
    }
}

fn time_to_datetime(t: &Time) -> DateTime<Utc> {
    match t {
        Time::UtcTime(t) => **t,
        Time::GeneralTime(t) => t.clone().into(),
    }
}

/// A human readable rendering of a certificate's subject.
pub fn certificate_subject(cert: &CapturedX509Certificate) -> String {
    cert.subject_name()
        .user_friendly_str()
        .unwrap_or_else(|_| "<unknown subject>".to_string())
}

/// The validity window of a certificate.
pub fn certificate_validity(cert: &CapturedX509Certificate) -> (DateTime<Utc>, DateTime<Utc>) {
    let x509: &X509Certificate = cert.as_ref();
    let validity = &x509.as_ref().tbs_certificate.validity;

    (
        time_to_datetime(&validity.not_before),
        time_to_datetime(&validity.not_after),
    )
}

impl TrustEvaluator for ValidityTrustEvaluator {
    fn evaluate(
        &self,
        chain: &[CapturedX509Certificate],
        policy: &TrustPolicy,
    ) -> Result<TrustResult, CodeSignError> {
        let reference = policy.signing_time.unwrap_or_else(Utc::now);
        let now = Utc::now();

        for cert in chain {
            if self
                .revoked
                .iter()
                .any(|r| r.constructed_data() == cert.constructed_data())
            {
                return Err(CodeSignError::Revoked(certificate_subject(cert)));
            }

            let (not_before, not_after) = certificate_validity(cert);
            let name = || certificate_subject(cert);

            // A time-stamped signing time anchors validity in the past.
            let at = if policy.timestamped { reference } else { now };

            if at < not_before {
                return Err(CodeSignError::TrustFailure(format!(
                    "certificate {} not yet valid",
                    name()
                )));
            }

            if at > not_after {
                if policy.allow_expired {
                    warn!("tolerating expired certificate {}", name());
                } else {
                    return Err(CodeSignError::CertificateExpired(name()));
                }
            }
        }

        for pair in chain.windows(2) {
            pair[0]
                .verify_signed_by_certificate(&pair[1])
                .map_err(|e| CodeSignError::TrustFailure(format!("broken chain: {}", e)))?;
        }

        if policy.no_network {
            debug!("network disabled; skipping online revocation checks");
        }

        let root = match chain.last() {
            Some(root) => root,
            None => return Ok(TrustResult::default()),
        };

        let is_anchor = |anchors: &[CapturedX509Certificate]| {
            anchors
                .iter()
                .any(|a| a.constructed_data() == root.constructed_data())
        };

        let anchor_apple = is_anchor(&self.apple_anchors);

        Ok(TrustResult {
            anchor_apple,
            anchor_trusted: anchor_apple || is_anchor(&self.anchors),
        })
    }
}

/// Ensure a team identifier is well formed.
///
/// Team identifiers are 1 to 64 printable ASCII characters, excluding
/// whitespace and `/`.
pub fn validate_team_id(team_id: &str) -> Result<(), CodeSignError> {
    let valid = !team_id.is_empty()
        && team_id.len() <= MAX_TEAM_ID_LEN
        && team_id.bytes().all(|b| b.is_ascii_graphic() && b != b'/');

    if valid {
        Ok(())
    } else {
        Err(CodeSignError::InvalidTeamIdentifier(team_id.to_string()))
    }
}

/// The team identifier of a certificate: its subject `OU`.
pub fn certificate_team_id(cert: &CapturedX509Certificate) -> Option<String> {
    cert.subject_name()
        .find_first_attribute_string(Oid(OID_ORGANIZATIONAL_UNIT_NAME.as_ref().into()))
        .unwrap_or(None)
}

/// Reconcile an explicit team identifier with the signing certificate's.
pub fn resolve_team_id(
    explicit: Option<&str>,
    certificate: Option<&str>,
) -> Result<Option<String>, CodeSignError> {
    let resolved = match (explicit, certificate) {
        (Some(explicit), Some(certificate)) if explicit != certificate => {
            return Err(CodeSignError::BadTeamIdentifier {
                explicit: explicit.to_string(),
                certificate: certificate.to_string(),
            });
        }
        (Some(v), _) | (None, Some(v)) => Some(v.to_string()),
        (None, None) => None,
    };

    if let Some(team_id) = &resolved {
        validate_team_id(team_id)?;
    }

    Ok(resolved)
}
