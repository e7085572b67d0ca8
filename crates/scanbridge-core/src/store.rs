//! File-backed image-block store
//!
//! Each block is kept as `img000001.pdf` (image bytes), an optional
//! `img000001_thumbnail.pdf`, and `img000001.meta` (JSON metadata). The meta
//! file is written last, so its presence means the block is complete. An
//! `imageBlocksDrained.meta` marker records that capture has finished.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

use crate::error::{ApiError, ApiStatus};
use crate::metadata::ImageBlockMetadata;

const DRAINED_MARKER: &str = "imageBlocksDrained.meta";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Image block {0} is not in the store")]
    Missing(u64),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Missing(_) => {
                ApiError::protocol(ApiStatus::InvalidImageBlockNumber, err.to_string())
            }
            other => ApiError::undefined(other.to_string()),
        }
    }
}

/// Directory of image blocks
#[derive(Debug, Clone)]
pub struct ImageBlockStore {
    dir: PathBuf,
}

impl ImageBlockStore {
    /// Open (and create if needed) a store directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn image_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("img{:06}.pdf", number))
    }

    fn thumbnail_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("img{:06}_thumbnail.pdf", number))
    }

    fn meta_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("img{:06}.meta", number))
    }

    /// Write a block. The meta file goes last and marks the block complete.
    pub fn write_block(
        &self,
        number: u64,
        image: &[u8],
        thumbnail: Option<&[u8]>,
        metadata: &ImageBlockMetadata,
    ) -> Result<(), StoreError> {
        fs::write(self.image_path(number), image)?;
        if let Some(thumbnail) = thumbnail {
            fs::write(self.thumbnail_path(number), thumbnail)?;
        }
        let meta = serde_json::to_vec_pretty(metadata)?;
        fs::write(self.meta_path(number), meta)?;
        trace!(block = number, bytes = image.len(), "Stored image block");
        Ok(())
    }

    pub fn is_complete(&self, number: u64) -> bool {
        self.meta_path(number).exists()
    }

    pub fn read_metadata(&self, number: u64) -> Result<ImageBlockMetadata, StoreError> {
        let content = read_block_file(&self.meta_path(number), number)?;
        Ok(serde_json::from_slice(&content)?)
    }

    pub fn read_image(&self, number: u64) -> Result<Vec<u8>, StoreError> {
        if !self.is_complete(number) {
            return Err(StoreError::Missing(number));
        }
        read_block_file(&self.image_path(number), number)
    }

    pub fn read_thumbnail(&self, number: u64) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.thumbnail_path(number)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a block's files; missing files are fine
    pub fn remove_block(&self, number: u64) -> Result<(), StoreError> {
        // Meta first, so a half-removed block never looks complete
        for path in [
            self.meta_path(number),
            self.image_path(number),
            self.thumbnail_path(number),
        ] {
            remove_if_present(&path)?;
        }
        debug!(block = number, "Removed image block");
        Ok(())
    }

    pub fn mark_drained(&self) -> Result<(), StoreError> {
        fs::write(self.dir.join(DRAINED_MARKER), b"{}")?;
        Ok(())
    }

    pub fn is_drained(&self) -> bool {
        self.dir.join(DRAINED_MARKER).exists()
    }

    /// Remove every block and the drained marker
    pub fn clear(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_block = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("img") || n == DRAINED_MARKER)
                .unwrap_or(false);
            if is_block && path.is_file() {
                remove_if_present(&path)?;
            }
        }
        Ok(())
    }
}

fn read_block_file(path: &Path, number: u64) -> Result<Vec<u8>, StoreError> {
    match fs::read(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::Missing(number)),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ImageAddress, ImageInfo, ImageSource, MetadataStatus, MoreParts};
    use tempfile::TempDir;

    fn metadata(number: u64) -> ImageBlockMetadata {
        ImageBlockMetadata {
            status: MetadataStatus { success: true },
            address: ImageAddress {
                image_number: number,
                image_part: 1,
                more_parts: MoreParts::LastPartInFile,
                sheet_number: number,
                source: ImageSource::Flatbed,
                stream_name: "stream0".to_string(),
                source_name: "source0".to_string(),
                pixel_format_name: "pixelFormat0".to_string(),
            },
            image: ImageInfo {
                compression: "none".to_string(),
                pixel_format: "bw1".to_string(),
                pixel_height: 2200,
                pixel_width: 1700,
                pixel_offset_x: 0,
                pixel_offset_y: 0,
                resolution: 200,
                size: 5,
            },
        }
    }

    #[test]
    fn test_write_read_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = ImageBlockStore::open(temp_dir.path().join("blocks")).unwrap();

        store
            .write_block(1, b"%PDF-", Some(b"thumb"), &metadata(1))
            .unwrap();
        assert!(store.is_complete(1));
        assert!(temp_dir.path().join("blocks/img000001.pdf").exists());
        assert_eq!(store.read_image(1).unwrap(), b"%PDF-");
        assert_eq!(store.read_metadata(1).unwrap(), metadata(1));
        assert_eq!(store.read_thumbnail(1).unwrap().as_deref(), Some(&b"thumb"[..]));

        store.remove_block(1).unwrap();
        assert!(!store.is_complete(1));
        assert!(matches!(store.read_image(1), Err(StoreError::Missing(1))));
        // Removing twice is harmless
        store.remove_block(1).unwrap();
    }

    #[test]
    fn test_incomplete_block_is_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = ImageBlockStore::open(temp_dir.path()).unwrap();

        std::fs::write(temp_dir.path().join("img000002.pdf"), b"partial").unwrap();
        assert!(matches!(store.read_image(2), Err(StoreError::Missing(2))));

        let api: ApiError = store.read_metadata(2).unwrap_err().into();
        assert_eq!(api.status, ApiStatus::InvalidImageBlockNumber);
    }

    #[test]
    fn test_drained_marker_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = ImageBlockStore::open(temp_dir.path()).unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"keep").unwrap();

        store.write_block(1, b"a", None, &metadata(1)).unwrap();
        store.mark_drained().unwrap();
        assert!(store.is_drained());

        store.clear().unwrap();
        assert!(!store.is_drained());
        assert!(!store.is_complete(1));
        assert!(temp_dir.path().join("notes.txt").exists());
    }
}
