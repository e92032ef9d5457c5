use super::{Extension, ExtensionCtx};
use crate::metainfo::DownloadInfo;
use crate::peer_protocol::extended::{
    ExtendedHandshake, MetadataMessage, METADATA_BLOCK_SIZE,
};
use crate::peers::PeerAddr;
use crate::prelude::*;
use crate::torrent::{Bitfield, InfoHash};
use sha1_smol::Sha1;
use std::collections::HashMap;

pub const METADATA_EXTENSION_KEY: &str = "ut_metadata";

#[derive(Debug)]
struct Assembly {
    buf: Vec<u8>,
    blocks: Bitfield,
    total_size: u64,
}

impl Assembly {
    fn new(total_size: u64) -> Self {
        let block_count = (total_size as usize).div_ceil(METADATA_BLOCK_SIZE as usize);
        Self {
            buf: vec![0; total_size as usize],
            blocks: Bitfield::new(block_count),
            total_size,
        }
    }
}

/// Descriptor exchange over the extended channel: serves the encoded info
/// dictionary block by block to peers that ask, and when this side only
/// knows the content identifier, fetches and validates the dictionary from
/// peers that advertise it.
pub struct MetadataExtension {
    info_hash: InfoHash,
    /// complete bencoded info dictionary, present when we can serve.
    blob: Option<Vec<u8>>,
    assembly: Option<Assembly>,
    completed: Option<DownloadInfo>,
    /// blocks requested per peer, so a disconnect can be forgotten.
    requested: HashMap<PeerAddr, Vec<u32>>,
}

impl MetadataExtension {
    /// A session that already holds the descriptor: serve it.
    pub fn serving(info_hash: InfoHash, encoded_info: Vec<u8>) -> Self {
        Self {
            info_hash,
            blob: Some(encoded_info),
            assembly: None,
            completed: None,
            requested: HashMap::new(),
        }
    }

    /// A session that only knows the content identifier: fetch the
    /// descriptor from whoever has it.
    pub fn fetching(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            blob: None,
            assembly: None,
            completed: None,
            requested: HashMap::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.blob.is_some()
    }

    /// The decoded descriptor, once fetched and validated.
    pub fn take_completed(&mut self) -> Option<DownloadInfo> {
        self.completed.take()
    }

    fn request_missing_blocks(
        &mut self,
        ctx: &mut ExtensionCtx<'_>,
        addr: PeerAddr,
    ) -> anyhow::Result<()> {
        let Some(assembly) = &self.assembly else {
            return Ok(());
        };
        let outstanding = self.requested.entry(addr).or_default();
        for block in assembly.blocks.unset_indices() {
            let block = block as u32;
            if outstanding.contains(&block) {
                continue;
            }
            debug!("requesting metadata block {} from {}", block, addr);
            outstanding.push(block);
            ctx.send(
                addr,
                METADATA_EXTENSION_KEY,
                MetadataMessage::Request { piece: block }.to_bytes()?,
            );
        }
        Ok(())
    }

    fn accept_block(&mut self, piece: u32, total_size: u64, block: &[u8]) -> anyhow::Result<()> {
        let assembly = self
            .assembly
            .get_or_insert_with(|| Assembly::new(total_size));
        if assembly.blocks.is_set(piece as usize) {
            debug!("metadata block {} already present, ignoring", piece);
            return Ok(());
        }

        let begin = piece as u64 * METADATA_BLOCK_SIZE;
        let end = std::cmp::min(begin + block.len() as u64, assembly.total_size);
        assembly.buf[begin as usize..end as usize]
            .copy_from_slice(&block[..(end - begin) as usize]);
        assembly.blocks.set(piece as usize);

        if !assembly.blocks.all_set() {
            return Ok(());
        }

        let digest = InfoHash::new(Sha1::from(&assembly.buf).digest().bytes());
        if digest != self.info_hash {
            warn!("assembled descriptor hashes to {}, expected {}", digest, self.info_hash);
            self.assembly = None;
            return Ok(());
        }

        let info: DownloadInfo =
            serde_bencode::from_bytes(&assembly.buf).map_err(anyhow::Error::msg)?;
        info!("descriptor fetched and validated ({} bytes)", assembly.total_size);
        self.blob = Some(std::mem::take(&mut assembly.buf));
        self.assembly = None;
        self.completed = Some(info);
        Ok(())
    }

    fn serve_block(
        &self,
        ctx: &mut ExtensionCtx<'_>,
        addr: PeerAddr,
        piece: u32,
    ) -> anyhow::Result<()> {
        let reply = match &self.blob {
            Some(blob) => {
                let begin = piece as u64 * METADATA_BLOCK_SIZE;
                let end = std::cmp::min(begin + METADATA_BLOCK_SIZE, blob.len() as u64);
                if begin >= end {
                    MetadataMessage::Reject { piece }
                } else {
                    MetadataMessage::Data {
                        piece,
                        total_size: blob.len() as u64,
                        block: blob[begin as usize..end as usize].to_vec(),
                    }
                }
            }
            None => MetadataMessage::Reject { piece },
        };
        ctx.send(addr, METADATA_EXTENSION_KEY, reply.to_bytes()?);
        Ok(())
    }

    fn forget_request(&mut self, addr: PeerAddr, piece: u32) {
        if let Some(outstanding) = self.requested.get_mut(&addr) {
            outstanding.retain(|block| *block != piece);
        }
    }
}

impl Extension for MetadataExtension {
    fn key(&self) -> &'static str {
        METADATA_EXTENSION_KEY
    }

    fn on_peer_capabilities(
        &mut self,
        ctx: &mut ExtensionCtx<'_>,
        addr: PeerAddr,
        remote: &ExtendedHandshake,
    ) -> anyhow::Result<()> {
        if self.is_complete() || remote.code_for(METADATA_EXTENSION_KEY).is_none() {
            return Ok(());
        }
        let Some(total_size) = remote.metadata_size else {
            return Ok(());
        };
        if self.assembly.is_none() {
            self.assembly = Some(Assembly::new(total_size));
        }
        self.request_missing_blocks(ctx, addr)
    }

    fn handle_message(
        &mut self,
        ctx: &mut ExtensionCtx<'_>,
        addr: PeerAddr,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        match MetadataMessage::from_bytes(payload)? {
            MetadataMessage::Request { piece } => self.serve_block(ctx, addr, piece),
            MetadataMessage::Data {
                piece,
                total_size,
                block,
            } => {
                self.forget_request(addr, piece);
                if self.is_complete() {
                    debug!("descriptor already complete, ignoring data");
                    return Ok(());
                }
                self.accept_block(piece, total_size, &block)
            }
            MetadataMessage::Reject { piece } => {
                debug!("{} rejected metadata block {}", addr, piece);
                self.forget_request(addr, piece);
                Ok(())
            }
        }
    }

    fn on_peer_disconnected(&mut self, addr: PeerAddr) {
        self.requested.remove(&addr);
    }
}
