use super::error::MetainfoError;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fmt;

/// Identifies a torrent: the digest of the original bytes of its info
/// dictionary.
///
/// `V1` is the SHA1 digest every peer exchanges in the handshake. `V2` is
/// the SHA256 form carried by `urn:btmh` magnet links.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoHash {
    V1([u8; 20]),
    V2([u8; 32]),
}

impl InfoHash {
    /// Hashes raw info dictionary bytes into a v1 info hash.
    pub fn v1_of(raw_info: &[u8]) -> Self {
        InfoHash::V1(Sha1::digest(raw_info).into())
    }

    pub fn from_v1_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| MetainfoError::InvalidInfoHashLength)?;
        Ok(InfoHash::V1(arr))
    }

    pub fn from_v2_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MetainfoError::InvalidInfoHashLength)?;
        Ok(InfoHash::V2(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, MetainfoError> {
        let bytes = hex::decode(s).map_err(|_| MetainfoError::InvalidInfoHashLength)?;
        match bytes.len() {
            20 => Self::from_v1_bytes(&bytes),
            32 => Self::from_v2_bytes(&bytes),
            _ => Err(MetainfoError::InvalidInfoHashLength),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            InfoHash::V1(arr) => arr,
            InfoHash::V2(arr) => arr,
        }
    }

    /// The 20 bytes placed in handshakes and tracker requests.
    ///
    /// A v2 hash is truncated to its first 20 bytes, as BEP-52 prescribes
    /// for the wire.
    pub fn wire_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.as_bytes()[..20]);
        out
    }

    /// Checks that `raw_info` hashes to this value.
    pub fn verify(&self, raw_info: &[u8]) -> bool {
        match self {
            InfoHash::V1(expected) => Sha1::digest(raw_info).as_slice() == expected,
            InfoHash::V2(expected) => Sha256::digest(raw_info).as_slice() == expected,
        }
    }

    pub fn is_v1(&self) -> bool {
        matches!(self, InfoHash::V1(_))
    }

    pub fn is_v2(&self) -> bool {
        matches!(self, InfoHash::V2(_))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
