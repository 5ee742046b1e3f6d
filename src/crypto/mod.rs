use std::fmt;

use anyhow::{Result, anyhow};
use sha1::{Digest, Sha1};

use crate::bencoding::Value;

pub const INFO_HASH_LEN: usize = 20;

/// SHA-1 of the bencoded info dictionary, identifying a transfer across sessions.
#[derive(PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; INFO_HASH_LEN]);

impl InfoHash {
    pub fn from_hex(hex: &str) -> Result<Self> {
        let bytes = hex::decode(hex)?;
        Self::try_from(bytes.as_slice())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl TryFrom<&[u8]> for InfoHash {
    type Error = anyhow::Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let len = bytes.len();
        let bytes: [u8; INFO_HASH_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow!("info hash must be {} bytes, got {}", INFO_HASH_LEN, len))?;
        Ok(Self(bytes))
    }
}

impl From<&Value> for InfoHash {
    fn from(info: &Value) -> Self {
        let digest = Sha1::digest(info.to_bytes());
        let mut bytes = [0; INFO_HASH_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
