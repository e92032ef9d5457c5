pub mod download_info;

pub use download_info::{DownloadInfo, FileEntry};

use serde::Deserialize;
use std::path::Path;
use tokio::fs;

/// Sha1 digest of one piece's bytes, taken from the descriptor's
/// concatenated digest string.
pub type PieceHash = [u8; sha1_smol::DIGEST_LENGTH];

/// The decoded descriptor document. Only the info dictionary matters to the
/// acquisition engine; announce fields are carried for external discovery
/// collaborators.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    #[serde(default)]
    pub announce: Option<String>,

    #[serde(rename = "info")]
    pub file_info: DownloadInfo,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,

    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<u64>, // seconds since unix epoch
    //
    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    pub encoding: Option<String>,
}

impl Metainfo {
    pub async fn from_bencode_file(file: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file_contents = fs::read(file).await?;
        Self::from_bencode_bytes(&file_contents)
    }

    pub fn from_bencode_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let metainfo: Metainfo = serde_bencode::from_bytes(bytes).map_err(anyhow::Error::msg)?;
        Ok(metainfo)
    }
}
