//! Backing stores for the simulated disk.
//!
//! The disk image is a flat file of 512-byte sectors. Its capacity is the
//! file length divided by the sector size; a trailing partial sector is not
//! addressable.
//!
//! Two implementations are provided:
//!
//! - [`FileStore`]: seek + read/write on an open file
//! - [`MmapStore`]: the whole image mapped with `memmap2`; read-only images
//!   are mapped copy-on-write so nothing reaches the file

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::config::{BackendKind, DiskConfig};
use crate::error::{Result, StorageError};
use crate::request::SECTOR_SIZE;

/// Byte-addressed storage behind the disk model.
pub trait BackingStore: Send + fmt::Debug {
    /// Size of the store in bytes.
    fn len_bytes(&self) -> u64;

    /// Fills `buf` from `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the range is out of bounds or the read fails.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the store is read-only, the range is out of
    /// bounds, or the write fails.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Pushes buffered writes to the underlying file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SyncFailed`] if the flush fails.
    fn sync(&mut self) -> Result<()>;

    /// Addressable sectors, saturating at `u32::MAX`.
    fn nsectors(&self) -> u32 {
        u32::try_from(self.len_bytes() / SECTOR_SIZE as u64).unwrap_or(u32::MAX)
    }
}

/// Opens the store described by `config`, or `None` if no image is configured.
///
/// # Errors
///
/// Returns [`StorageError`] if the image cannot be opened or mapped.
pub fn open_store(config: &DiskConfig) -> Result<Option<Box<dyn BackingStore>>> {
    let Some(path) = config.backing_path.as_deref() else {
        return Ok(None);
    };

    let store: Box<dyn BackingStore> = match config.backend {
        BackendKind::File => Box::new(FileStore::open(path, config.read_only)?),
        BackendKind::Mmap => Box::new(MmapStore::open(path, config.read_only)?),
    };
    tracing::info!(
        path = %path.display(),
        backend = ?config.backend,
        nsectors = store.nsectors(),
        read_only = config.read_only,
        "opened backing store"
    );
    Ok(Some(store))
}

/// Creates a zero-filled image of `nsectors` sectors, replacing any file at
/// `path`.
///
/// # Errors
///
/// Returns [`StorageError::Create`] if the file cannot be created or sized.
pub fn create_image<P: AsRef<Path>>(path: P, nsectors: u32) -> Result<()> {
    let path = path.as_ref();
    let create_err = |source| StorageError::Create {
        path: path.display().to_string(),
        source,
    };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(create_err)?;
    file.set_len(u64::from(nsectors) * SECTOR_SIZE as u64)
        .map_err(create_err)?;
    Ok(())
}

fn check_range(offset: u64, length: usize, size: u64) -> Result<()> {
    let length = length as u64;
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(StorageError::OutOfRange {
            offset,
            length,
            size,
        }
        .into()),
    }
}

fn open_file(path: &Path, read_only: bool) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(path)
        .map_err(|source| {
            StorageError::Open {
                path: path.display().to_string(),
                source,
            }
            .into()
        })
}

/// Image accessed through seek + read/write.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
}

impl FileStore {
    /// Opens an existing image.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be opened or its
    /// length read.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = open_file(path, read_only)?;
        let size = file
            .metadata()
            .map_err(|source| StorageError::Open {
                path: path.display().to_string(),
                source,
            })?
            .len();

        Ok(Self {
            file,
            path: path.display().to_string(),
            size,
            read_only,
        })
    }
}

impl BackingStore for FileStore {
    fn len_bytes(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.size)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|source| StorageError::ReadFailed {
                path: self.path.clone(),
                offset,
                source,
            })?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly {
                path: self.path.clone(),
            }
            .into());
        }
        check_range(offset, data.len(), self.size)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .map_err(|source| StorageError::WriteFailed {
                path: self.path.clone(),
                offset,
                source,
            })?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file
            .sync_data()
            .map_err(|source| StorageError::SyncFailed {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }
}

/// Image mapped into memory.
pub struct MmapStore {
    mmap: MmapMut,
    path: String,
    read_only: bool,
}

impl fmt::Debug for MmapStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapStore")
            .field("path", &self.path)
            .field("len", &self.mmap.len())
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl MmapStore {
    /// Maps an existing image.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the file cannot be opened or mapped.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let file = open_file(path, read_only)?;

        // SAFETY: The image is owned by this simulation for its lifetime; no
        // other process is expected to truncate it while mapped.
        let mapped = unsafe {
            if read_only {
                MmapOptions::new().map_copy(&file)
            } else {
                MmapOptions::new().map_mut(&file)
            }
        };
        let mmap = mapped.map_err(|source| StorageError::MemoryMap {
            path: path_str.clone(),
            source,
        })?;

        Ok(Self {
            mmap,
            path: path_str,
            read_only,
        })
    }
}

impl BackingStore for MmapStore {
    fn len_bytes(&self) -> u64 {
        self.mmap.len() as u64
    }

    #[allow(clippy::cast_possible_truncation)] // check_range bounds offset by the map length
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.mmap[start..start + buf.len()]);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)] // check_range bounds offset by the map length
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly {
                path: self.path.clone(),
            }
            .into());
        }
        check_range(offset, data.len(), self.len_bytes())?;
        let start = offset as usize;
        self.mmap[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.mmap.flush().map_err(|source| StorageError::SyncFailed {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimBlkError;
    use tempfile::tempdir;

    fn stores(path: &Path, read_only: bool) -> Vec<Box<dyn BackingStore>> {
        vec![
            Box::new(FileStore::open(path, read_only).unwrap()),
            Box::new(MmapStore::open(path, read_only).unwrap()),
        ]
    }

    #[test]
    fn test_create_image_geometry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        create_image(&path, 64).unwrap();

        for store in stores(&path, false) {
            assert_eq!(store.len_bytes(), 64 * 512);
            assert_eq!(store.nsectors(), 64);
        }
    }

    #[test]
    fn test_partial_trailing_sector_not_addressable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("odd.img");
        std::fs::write(&path, vec![0u8; 512 * 3 + 100]).unwrap();

        let store = FileStore::open(&path, true).unwrap();
        assert_eq!(store.nsectors(), 3);
    }

    #[test]
    fn test_write_then_read_each_backend() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        create_image(&path, 8).unwrap();

        for mut store in stores(&path, false) {
            let data = vec![0x5Au8; 1024];
            store.write_at(512, &data).unwrap();
            store.sync().unwrap();

            let mut back = vec![0u8; 1024];
            store.read_at(512, &mut back).unwrap();
            assert_eq!(back, data);
        }

        // The mmap store flushed to the same file the file store reads.
        let mut file = FileStore::open(&path, true).unwrap();
        let mut back = vec![0u8; 512];
        file.read_at(1024, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_out_of_range_access() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        create_image(&path, 2).unwrap();

        for mut store in stores(&path, false) {
            let mut buf = vec![0u8; 512];
            assert!(matches!(
                store.read_at(1024, &mut buf),
                Err(SimBlkError::Storage(StorageError::OutOfRange { .. }))
            ));
            assert!(matches!(
                store.write_at(u64::MAX, &buf),
                Err(SimBlkError::Storage(StorageError::OutOfRange { .. }))
            ));
        }
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.img");
        create_image(&path, 2).unwrap();

        for mut store in stores(&path, true) {
            assert!(matches!(
                store.write_at(0, &[1u8; 512]),
                Err(SimBlkError::Storage(StorageError::ReadOnly { .. }))
            ));
        }
    }

    #[test]
    fn test_open_store_without_image() {
        let config = DiskConfig::default();
        assert!(open_store(&config).unwrap().is_none());
    }

    #[test]
    fn test_open_missing_image_fails() {
        let dir = tempdir().unwrap();
        let config = DiskConfig::with_backing(dir.path().join("missing.img"));
        assert!(matches!(
            open_store(&config),
            Err(SimBlkError::Storage(StorageError::Open { .. }))
        ));
    }
}
