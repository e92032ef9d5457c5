use super::PieceHash;
use crate::torrent::InfoHash;
use serde::{Deserialize, Serialize};
use sha1_smol::Sha1;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,

    #[serde(default)]
    pub md5sum: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DownloadInfo {
    MultiFile {
        #[serde(rename = "name")]
        dirname: String,

        files: Vec<FileEntry>,

        #[serde(rename = "piece length")]
        piece_length: u64,

        #[serde(with = "piece_hashes_parser")]
        pieces: Vec<PieceHash>,

        #[serde(default)]
        private: Option<i64>,
    },

    SingleFile {
        #[serde(rename = "name")]
        filename: String,
        length: u64,

        #[serde(default)]
        md5sum: Option<String>,

        #[serde(rename = "piece length")]
        piece_length: u64,

        #[serde(with = "piece_hashes_parser")]
        pieces: Vec<PieceHash>,

        #[serde(default)]
        private: Option<i64>,
    },
}

impl DownloadInfo {
    pub fn info_hash(&self) -> anyhow::Result<InfoHash> {
        let encoded = serde_bencode::to_bytes(self).map_err(anyhow::Error::msg)?;
        Ok(InfoHash::new(Sha1::from(encoded).digest().bytes()))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::SingleFile { filename, .. } => filename,
            Self::MultiFile { dirname, .. } => dirname,
        }
    }

    pub fn total_length(&self) -> u64 {
        match self {
            Self::SingleFile { length, .. } => *length,
            Self::MultiFile { files, .. } => files.iter().map(|file| file.length).sum(),
        }
    }

    pub fn piece_length(&self) -> u64 {
        match self {
            Self::SingleFile { piece_length, .. } | Self::MultiFile { piece_length, .. } => {
                *piece_length
            }
        }
    }

    pub fn piece_hashes(&self) -> &[PieceHash] {
        match self {
            Self::SingleFile { pieces, .. } | Self::MultiFile { pieces, .. } => pieces,
        }
    }

    /// Backing files in descriptor order as `(relative path, length)`.
    /// Multi-file sets nest under the aggregate name, matching the storage
    /// layout the descriptor describes.
    pub fn file_entries(&self) -> Vec<(PathBuf, u64)> {
        match self {
            Self::SingleFile {
                filename, length, ..
            } => vec![(PathBuf::from(filename), *length)],
            Self::MultiFile { dirname, files, .. } => files
                .iter()
                .map(|file| {
                    let mut path = PathBuf::from(dirname);
                    path.extend(&file.path);
                    (path, file.length)
                })
                .collect(),
        }
    }
}

mod piece_hashes_parser {
    use crate::metainfo::PieceHash;
    use serde::de::{self, Visitor};
    use static_str_ops::static_format;
    const HASH_SIZE: usize = std::mem::size_of::<PieceHash>();

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<PieceHash>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_bytes(PieceHashVisitor)
    }

    pub fn serialize<S>(
        piece_hashes: impl AsRef<[PieceHash]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_bytes::serialize(&piece_hashes.as_ref().concat(), serializer)
    }

    struct PieceHashVisitor;
    impl<'de> Visitor<'de> for PieceHashVisitor {
        type Value = Vec<PieceHash>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str(static_format!(
                "a byte sequence whose length is a multiple of {}",
                HASH_SIZE
            ))
        }

        fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let n_bytes = bytes.len();

            if n_bytes % HASH_SIZE != 0 {
                return Err(E::custom(static_format!(
                    "piece hashes should be a multiple of length {}",
                    HASH_SIZE
                )));
            }

            let piece_hash_slices = bytes
                .chunks_exact(HASH_SIZE)
                .map(|chunk| {
                    chunk.try_into().expect(static_format!(
                        "chunks_exact returns only chunks which are length {}",
                        HASH_SIZE
                    ))
                })
                .collect();

            Ok(piece_hash_slices)
        }
    }
}
