use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Extended-channel code 0 is the capability handshake itself; every other
/// code is whatever the two sides negotiated through it.
pub const EXTENDED_HANDSHAKE_CODE: u8 = 0;

/// Block size used by the metadata-exchange sub-protocol.
pub const METADATA_BLOCK_SIZE: u64 = 1 << 14;

/// The bencoded capability dictionary exchanged as extended message 0:
/// `m` maps sub-protocol names to the codes the sender will accept them
/// under.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtendedHandshake {
    #[serde(default)]
    pub m: BTreeMap<String, u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u64>,
}

impl ExtendedHandshake {
    pub fn to_bencode(&self) -> anyhow::Result<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(anyhow::Error::msg)
    }

    pub fn from_bencode(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_bencode::from_bytes(bytes).map_err(anyhow::Error::msg)
    }

    /// The code the remote wants `key` messages sent under, if it supports
    /// that sub-protocol at all.
    pub fn code_for(&self, key: &str) -> Option<u8> {
        self.m.get(key).copied()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataDict {
    msg_type: u8,
    piece: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<u64>,
}

const METADATA_REQUEST: u8 = 0;
const METADATA_DATA: u8 = 1;
const METADATA_REJECT: u8 = 2;

/// Metadata-exchange payloads as tagged variants. A `Data` message is the
/// bencoded dictionary immediately followed by the raw block bytes; the
/// dictionary's `total_size` pins down where the block starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u64, block: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let (dict, block) = match self {
            Self::Request { piece } => (
                MetadataDict {
                    msg_type: METADATA_REQUEST,
                    piece: *piece,
                    total_size: None,
                },
                None,
            ),
            Self::Data {
                piece,
                total_size,
                block,
            } => (
                MetadataDict {
                    msg_type: METADATA_DATA,
                    piece: *piece,
                    total_size: Some(*total_size),
                },
                Some(block),
            ),
            Self::Reject { piece } => (
                MetadataDict {
                    msg_type: METADATA_REJECT,
                    piece: *piece,
                    total_size: None,
                },
                None,
            ),
        };

        let mut bytes = serde_bencode::to_bytes(&dict).map_err(anyhow::Error::msg)?;
        if let Some(block) = block {
            bytes.extend_from_slice(block);
        }
        Ok(bytes)
    }

    pub fn from_bytes(payload: &[u8]) -> anyhow::Result<Self> {
        let dict: MetadataDict =
            serde_bencode::from_bytes(payload).map_err(anyhow::Error::msg)?;

        match dict.msg_type {
            METADATA_REQUEST => Ok(Self::Request { piece: dict.piece }),
            METADATA_REJECT => Ok(Self::Reject { piece: dict.piece }),
            METADATA_DATA => {
                let total_size = dict
                    .total_size
                    .ok_or_else(|| anyhow::anyhow!("metadata data without total_size"))?;
                let block_len = std::cmp::min(
                    METADATA_BLOCK_SIZE,
                    total_size.saturating_sub(dict.piece as u64 * METADATA_BLOCK_SIZE),
                ) as usize;
                if block_len == 0 || payload.len() < block_len {
                    anyhow::bail!(
                        "metadata block truncated: payload {} bytes, block {}",
                        payload.len(),
                        block_len
                    );
                }
                Ok(Self::Data {
                    piece: dict.piece,
                    total_size,
                    block: payload[payload.len() - block_len..].to_vec(),
                })
            }
            unknown => anyhow::bail!("unknown metadata message type: {}", unknown),
        }
    }
}
