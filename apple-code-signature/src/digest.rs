// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Digest primitives.

Code signatures record cryptographic digests of many things: pages of
executable code, auxiliary components like `Info.plist`, every sealed
resource file, and the code directories themselves.

Signatures may use several digest algorithms at once ("hash agility").
Anything that digests a file for more than one algorithm does so in a single
pass over the data via [MultiDigest].
*/

use {
    crate::error::CodeSignError,
    std::{
        borrow::Cow,
        fmt::{Display, Formatter},
        io::Read,
        path::Path,
    },
};

/// Read buffer size used when streaming files through digesters.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Length of a cdhash, regardless of digest algorithm.
pub const CDHASH_LEN: usize = 20;

/// A digest algorithm used by code signatures.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DigestType {
    None,
    Sha1,
    Sha256,
    Sha256Truncated,
    Sha384,
    Sha512,
    Unknown(u8),
}

impl Default for DigestType {
    fn default() -> Self {
        Self::Sha256
    }
}

impl From<u8> for DigestType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Sha1,
            2 => Self::Sha256,
            3 => Self::Sha256Truncated,
            4 => Self::Sha384,
            5 => Self::Sha512,
            _ => Self::Unknown(v),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(v: DigestType) -> u8 {
        match v {
            DigestType::None => 0,
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha256Truncated => 3,
            DigestType::Sha384 => 4,
            DigestType::Sha512 => 5,
            DigestType::Unknown(v) => v,
        }
    }
}

impl Display for DigestType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestType::None => f.write_str("none"),
            DigestType::Sha1 => f.write_str("sha1"),
            DigestType::Sha256 => f.write_str("sha256"),
            DigestType::Sha256Truncated => f.write_str("sha256-truncated"),
            DigestType::Sha384 => f.write_str("sha384"),
            DigestType::Sha512 => f.write_str("sha512"),
            DigestType::Unknown(v) => f.write_fmt(format_args!("unknown: {}", v)),
        }
    }
}

impl TryFrom<&str> for DigestType {
    type Error = CodeSignError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha256-truncated" => Ok(Self::Sha256Truncated),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(CodeSignError::UnsupportedDigestAlgorithm(0)),
        }
    }
}

impl DigestType {
    /// Obtain the size of hashes for this hash type.
    pub fn hash_len(&self) -> Result<usize, CodeSignError> {
        match self {
            Self::Sha1 | Self::Sha256Truncated => Ok(20),
            Self::Sha256 => Ok(32),
            Self::Sha384 => Ok(48),
            Self::Sha512 => Ok(64),
            Self::None | Self::Unknown(_) => {
                Err(CodeSignError::UnsupportedDigestAlgorithm((*self).into()))
            }
        }
    }

    /// Obtain a hasher for this digest type.
    pub fn as_hasher(&self) -> Result<ring::digest::Context, CodeSignError> {
        match self {
            Self::Sha1 => Ok(ring::digest::Context::new(
                &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            )),
            Self::Sha256 | Self::Sha256Truncated => {
                Ok(ring::digest::Context::new(&ring::digest::SHA256))
            }
            Self::Sha384 => Ok(ring::digest::Context::new(&ring::digest::SHA384)),
            Self::Sha512 => Ok(ring::digest::Context::new(&ring::digest::SHA512)),
            Self::None | Self::Unknown(_) => {
                Err(CodeSignError::UnsupportedDigestAlgorithm((*self).into()))
            }
        }
    }

    /// Digest data given the configured hasher.
    pub fn digest_data(&self, data: &[u8]) -> Result<Vec<u8>, CodeSignError> {
        let mut hasher = self.as_hasher()?;
        hasher.update(data);

        Ok(self.finish(hasher))
    }

    fn finish(&self, hasher: ring::digest::Context) -> Vec<u8> {
        let mut hash = hasher.finish().as_ref().to_vec();

        if matches!(self, Self::Sha256Truncated) {
            hash.truncate(20);
        }

        hash
    }

    /// Rank used to select the strongest of several code directories.
    ///
    /// Higher is better. Unsupported algorithms rank lowest.
    pub fn strength(&self) -> u8 {
        match self {
            Self::Sha384 => 5,
            Self::Sha512 => 4,
            Self::Sha256 => 3,
            Self::Sha256Truncated => 2,
            Self::Sha1 => 1,
            Self::None | Self::Unknown(_) => 0,
        }
    }
}

/// A digest value.
#[derive(Clone, Eq, PartialEq)]
pub struct Digest<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Digest<'a> {
    /// Whether this is the null hash (all 0s).
    pub fn is_null(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn to_owned(&self) -> Digest<'static> {
        Digest {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }

    pub fn as_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

impl<'a> std::fmt::Debug for Digest<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.data))
    }
}

impl<'a> From<Vec<u8>> for Digest<'a> {
    fn from(v: Vec<u8>) -> Self {
        Self { data: v.into() }
    }
}

/// Digests content with several algorithms simultaneously.
pub struct MultiDigest {
    hashers: Vec<(DigestType, ring::digest::Context)>,
}

impl MultiDigest {
    /// Construct an instance for the given algorithms.
    ///
    /// Duplicate algorithms are only digested once.
    pub fn new(digests: &[DigestType]) -> Result<Self, CodeSignError> {
        let mut hashers: Vec<(DigestType, ring::digest::Context)> = vec![];

        for digest in digests {
            if !hashers.iter().any(|(existing, _)| existing == digest) {
                hashers.push((*digest, digest.as_hasher()?));
            }
        }

        Ok(Self { hashers })
    }

    pub fn update(&mut self, data: &[u8]) {
        for (_, hasher) in self.hashers.iter_mut() {
            hasher.update(data);
        }
    }

    /// Feed the entire content of a reader.
    pub fn update_reader(&mut self, reader: &mut impl Read) -> Result<u64, CodeSignError> {
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let count = reader.read(&mut buffer)?;
            if count == 0 {
                break;
            }

            self.update(&buffer[0..count]);
            total += count as u64;
        }

        Ok(total)
    }

    /// Finalize, yielding digests in the order algorithms were requested.
    pub fn finish(self) -> DigestSet {
        DigestSet(
            self.hashers
                .into_iter()
                .map(|(digest, hasher)| (digest, digest.finish(hasher)))
                .collect(),
        )
    }
}

/// Digests of one piece of content under several algorithms.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DigestSet(pub Vec<(DigestType, Vec<u8>)>);

impl DigestSet {
    pub fn get(&self, digest: DigestType) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(d, _)| *d == digest)
            .map(|(_, v)| v.as_slice())
    }
}

/// Digest a file with several algorithms in a single pass.
pub fn hash_file(
    path: impl AsRef<Path>,
    digests: &[DigestType],
) -> Result<DigestSet, CodeSignError> {
    let mut fh = std::fs::File::open(path.as_ref())?;
    let mut hasher = MultiDigest::new(digests)?;
    hasher.update_reader(&mut fh)?;

    Ok(hasher.finish())
}

/// Compute paged hashes.
///
/// The data is chunked into segments of `page_size` and each chunk is
/// digested. A `page_size` of `0` means the data is unpaged and results in a
/// single digest covering all of it.
pub fn paged_digests(
    data: &[u8],
    hash: DigestType,
    page_size: usize,
) -> Result<Vec<Vec<u8>>, CodeSignError> {
    if page_size == 0 {
        return Ok(vec![hash.digest_data(data)?]);
    }

    data.chunks(page_size)
        .map(|chunk| hash.digest_data(chunk))
        .collect::<Result<Vec<_>, CodeSignError>>()
}

/// Number of code slots needed to cover `code_limit` bytes.
pub fn code_slot_count(code_limit: u64, page_size: u32) -> Result<u64, CodeSignError> {
    if page_size == 0 {
        Ok(u64::from(code_limit > 0))
    } else {
        let page_size = page_size as u64;
        code_limit
            .checked_add(page_size - 1)
            .map(|v| v / page_size)
            .ok_or(CodeSignError::ArithmeticOverflow("code slot count"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_lengths() -> Result<(), CodeSignError> {
        for digest in [
            DigestType::Sha1,
            DigestType::Sha256,
            DigestType::Sha256Truncated,
            DigestType::Sha384,
            DigestType::Sha512,
        ] {
            assert_eq!(digest.hash_len()?, digest.digest_data(b"")?.len());
        }

        assert!(DigestType::None.hash_len().is_err());
        assert!(DigestType::Unknown(42).as_hasher().is_err());

        Ok(())
    }

    #[test]
    fn multi_digest_matches_individual() -> Result<(), CodeSignError> {
        let data = b"hello, world".repeat(10000);

        let mut multi = MultiDigest::new(&[DigestType::Sha1, DigestType::Sha256, DigestType::Sha1])?;
        multi.update_reader(&mut std::io::Cursor::new(&data))?;
        let set = multi.finish();

        assert_eq!(set.0.len(), 2);
        assert_eq!(
            set.get(DigestType::Sha1).unwrap(),
            DigestType::Sha1.digest_data(&data)?.as_slice()
        );
        assert_eq!(
            set.get(DigestType::Sha256).unwrap(),
            DigestType::Sha256.digest_data(&data)?.as_slice()
        );
        assert!(set.get(DigestType::Sha384).is_none());

        Ok(())
    }

    #[test]
    fn known_sha256() -> Result<(), CodeSignError> {
        assert_eq!(
            hex::encode(DigestType::Sha256.digest_data(b"")?),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hex::encode(DigestType::Sha256Truncated.digest_data(b"")?),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4"
        );

        Ok(())
    }

    #[test]
    fn paging() -> Result<(), CodeSignError> {
        let data = vec![0x42u8; 4096 * 2 + 1];

        assert_eq!(paged_digests(&data, DigestType::Sha1, 4096)?.len(), 3);
        assert_eq!(paged_digests(&data, DigestType::Sha1, 0)?.len(), 1);
        assert_eq!(code_slot_count(4096 * 2 + 1, 4096)?, 3);
        assert_eq!(code_slot_count(4096, 4096)?, 1);
        assert_eq!(code_slot_count(0, 4096)?, 0);
        assert_eq!(code_slot_count(10, 0)?, 1);
        assert_eq!(code_slot_count(u64::MAX, 0)?, 1);
        assert!(matches!(
            code_slot_count(u64::MAX, 4096),
            Err(CodeSignError::ArithmeticOverflow(_))
        ));

        Ok(())
    }

    #[test]
    fn strength_order() {
        let mut digests = vec![
            DigestType::Sha1,
            DigestType::Sha384,
            DigestType::Sha256Truncated,
            DigestType::Sha256,
        ];
        digests.sort_by_key(|d| std::cmp::Reverse(d.strength()));

        assert_eq!(
            digests,
            vec![
                DigestType::Sha384,
                DigestType::Sha256,
                DigestType::Sha256Truncated,
                DigestType::Sha1
            ]
        );
    }
}
