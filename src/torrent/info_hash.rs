use serde::Serialize;

/// Digest identifying one content set, i.e the sha1 of the bencoded info
/// dictionary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct InfoHash([u8; Self::INFO_HASH_SIZE]);

impl InfoHash {
    pub const INFO_HASH_SIZE: usize = sha1_smol::DIGEST_LENGTH;

    pub fn new(bytes: [u8; Self::INFO_HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8; InfoHash::INFO_HASH_SIZE]> for InfoHash {
    fn as_ref(&self) -> &[u8; Self::INFO_HASH_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
