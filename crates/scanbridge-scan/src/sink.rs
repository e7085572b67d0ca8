//! Where transferred image blocks go

use anyhow::{Context, Result};
use scanbridge_core::{ImageBlockMetadata, ImageBlockStore};
use std::sync::Mutex;
use tracing::debug;

/// One block as received from the device
#[derive(Debug, Clone, PartialEq)]
pub struct TransferredBlock {
    pub number: u64,
    pub image: Vec<u8>,
    pub metadata: ImageBlockMetadata,
    pub thumbnail: Option<Vec<u8>>,
}

/// Receives blocks before they are released on the device. Delivery runs on
/// scan workers, so implementations must be shareable.
pub trait ImageSink: Send + Sync {
    fn deliver(&self, block: TransferredBlock) -> Result<()>;
}

/// Keeps blocks in memory, in delivery order
#[derive(Debug, Default)]
pub struct MemorySink {
    blocks: Mutex<Vec<TransferredBlock>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> Vec<TransferredBlock> {
        self.blocks
            .lock()
            .map(|blocks| blocks.clone())
            .unwrap_or_default()
    }

    /// Block numbers in delivery order
    pub fn numbers(&self) -> Vec<u64> {
        self.blocks()
            .iter()
            .map(|b| b.number)
            .collect()
    }
}

impl ImageSink for MemorySink {
    fn deliver(&self, block: TransferredBlock) -> Result<()> {
        self.blocks
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink lock poisoned"))?
            .push(block);
        Ok(())
    }
}

/// Writes blocks to a directory with the same layout the device uses
#[derive(Debug, Clone)]
pub struct StoreSink {
    store: ImageBlockStore,
}

impl StoreSink {
    pub fn new(store: ImageBlockStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ImageBlockStore {
        &self.store
    }
}

impl ImageSink for StoreSink {
    fn deliver(&self, block: TransferredBlock) -> Result<()> {
        self.store
            .write_block(
                block.number,
                &block.image,
                block.thumbnail.as_deref(),
                &block.metadata,
            )
            .with_context(|| format!("Failed to save image block {}", block.number))?;
        debug!(block = block.number, dir = %self.store.dir().display(), "Saved image block");
        Ok(())
    }
}
