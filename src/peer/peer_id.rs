use std::fmt;

use rand::Rng;

use crate::constants::CLIENT_PREFIX;

/// A 20-byte peer identifier.
///
/// Generated ids follow the Azureus-style format `-SB0001-<12 random
/// bytes>`, where `SB` identifies swarmbit and `0001` is the version.
///
/// # Examples
///
/// ```
/// use swarmbit::peer::PeerId;
///
/// let peer_id = PeerId::generate();
/// assert_eq!(peer_id.as_bytes().len(), 20);
/// assert_eq!(peer_id.client_id(), Some("SB0001"));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates a new random peer ID with the swarmbit client prefix.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rng())
    }

    /// Same as [`generate`](Self::generate) but drawing from `rng`.
    pub fn generate_with<R: Rng>(rng: &mut R) -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX.as_bytes());
        rng.fill(&mut id[8..]);
        Self(id)
    }

    /// Returns `None` if the slice is not exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The 6-character client tag of an Azureus-style id, e.g. `UT3500`.
    pub fn client_id(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({})", client),
            None => write!(f, "PeerId({})", hex::encode(&self.0[..8])),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            if byte.is_ascii_alphanumeric() || *byte == b'-' {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "%{:02x}", byte)?;
            }
        }
        Ok(())
    }
}
