//! Content-addressed file archive
//!
//! Blobs live at `<root>/<h[0..2]>/<h[2..4]>/<h>` where `h` is the hex
//! SHA-256 digest of the content. Writes go to a temporary file in the
//! target directory first and are renamed into place, so concurrent writers
//! of the same blob never expose a partial file.

use crate::storage::traits::{Archive, StorageError, StorageResult};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Archive backed by a local directory tree
#[derive(Debug, Clone)]
pub struct FileArchive {
    root: PathBuf,
}

impl FileArchive {
    /// Creates an archive rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, checksum: &str) -> StorageResult<PathBuf> {
        if checksum.len() < 4 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::Missing(checksum.to_string()));
        }
        Ok(self
            .root
            .join(&checksum[0..2])
            .join(&checksum[2..4])
            .join(checksum))
    }

    /// Moves a finished temporary file into its content-addressed location
    fn persist(&self, tmp: NamedTempFile, checksum: &str) -> StorageResult<()> {
        let target = self.blob_path(checksum)?;
        if target.exists() {
            return Ok(());
        }
        tmp.persist(&target).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }

    fn staging_file(&self) -> StorageResult<NamedTempFile> {
        Ok(NamedTempFile::new_in(&self.root)?)
    }
}

impl Archive for FileArchive {
    fn store(&self, data: &[u8], checksum: Option<&str>) -> StorageResult<String> {
        if let Some(checksum) = checksum {
            if self.exists(checksum) {
                return Ok(checksum.to_string());
            }
        }

        let checksum = hex::encode(Sha256::digest(data));
        let target = self.blob_path(&checksum)?;
        if target.exists() {
            return Ok(checksum);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = self.staging_file()?;
        tmp.write_all(data)?;
        tmp.flush()?;
        self.persist(tmp, &checksum)?;

        tracing::debug!("Archived {} bytes as {}", data.len(), checksum);
        Ok(checksum)
    }

    fn store_file(&self, path: &Path, checksum: Option<&str>) -> StorageResult<String> {
        if let Some(checksum) = checksum {
            if self.exists(checksum) {
                return Ok(checksum.to_string());
            }
        }

        // Hash and copy in one pass
        let mut reader = BufReader::new(File::open(path)?);
        let mut tmp = self.staging_file()?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            tmp.write_all(&buffer[..read])?;
        }
        tmp.flush()?;

        let checksum = hex::encode(hasher.finalize());
        let target = self.blob_path(&checksum)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        self.persist(tmp, &checksum)?;
        Ok(checksum)
    }

    fn exists(&self, checksum: &str) -> bool {
        self.blob_path(checksum)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    fn open(&self, checksum: &str) -> StorageResult<Box<dyn Read + Send>> {
        let path = self.local_path(checksum)?;
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn local_path(&self, checksum: &str) -> StorageResult<PathBuf> {
        let path = self.blob_path(checksum)?;
        if !path.is_file() {
            return Err(StorageError::Missing(checksum.to_string()));
        }
        Ok(path)
    }

    fn delete(&self, checksum: &str) -> StorageResult<()> {
        let path = self.blob_path(checksum)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
