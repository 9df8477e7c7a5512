//! MeshId: identifier shared by peers and channels.
//!
//! Peers and channels live in one id space: any peer's id is also a valid
//! single-recipient destination. Displays as a 16-character hex string.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshIdError {
    #[error("Invalid mesh ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Mesh ID must not be zero")]
    Zero,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Identifier for a peer or a channel.
///
/// # Examples
/// ```
/// use mesh_core::MeshId;
///
/// let lobby = MeshId::for_name("lobby");
/// assert_eq!(lobby, MeshId::for_name("lobby"));
///
/// let parsed: MeshId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(u64);

/// Channel ids and peer ids are the same type.
pub type ChannelId = MeshId;
pub type PeerId = MeshId;

impl MeshId {
    /// Generate a new random id. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// Derive a stable channel id from a channel name.
    ///
    /// Every participant naming a channel the same way agrees on its id.
    pub fn for_name(name: &str) -> Self {
        match fnv1a_hash(name) {
            0 => Self(1),
            hash => Self(hash),
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for MeshId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for MeshId {
    type Err = MeshIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MeshIdError::InvalidFormat);
        }
        match u64::from_str_radix(&s.to_ascii_lowercase(), 16)? {
            0 => Err(MeshIdError::Zero),
            id => Ok(Self(id)),
        }
    }
}

impl From<u64> for MeshId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<MeshId> for u64 {
    fn from(id: MeshId) -> u64 {
        id.0
    }
}

// Serialize as hex string so ids read the same in logs and on the wire
impl serde::Serialize for MeshId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for MeshId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// FNV-1a hash. Stable across Rust versions (unlike DefaultHasher).
fn fnv1a_hash(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_zero_padded() {
        assert_eq!(MeshId(0xff).to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let id: MeshId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_parse_rejects_zero() {
        assert!(matches!(
            "0000000000000000".parse::<MeshId>(),
            Err(MeshIdError::Zero)
        ));
    }

    #[test]
    fn test_reject_wrong_length_or_digits() {
        assert!("a1b2c3d4e5f6789".parse::<MeshId>().is_err());
        assert!("a1b2c3d4e5f678901".parse::<MeshId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<MeshId>().is_err());
        assert!("".parse::<MeshId>().is_err());
    }

    #[test]
    fn test_for_name_is_stable_and_distinct() {
        assert_eq!(MeshId::for_name("lobby"), MeshId::for_name("lobby"));
        assert_ne!(MeshId::for_name("lobby"), MeshId::for_name("game"));
        // FNV-1a of the empty string is the offset basis
        assert_eq!(MeshId::for_name("").as_u64(), 0xcbf29ce484222325);
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(MeshId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = MeshId(0xa1b2c3d4e5f67890);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"a1b2c3d4e5f67890\"");
        let parsed: MeshId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
