use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use bk_core::Error;

static NEXT_WRITE: AtomicU64 = AtomicU64::new(0);

/// Content-addressed cache of verified artifacts.
///
/// Blobs are named by their SHA-256, and a blob only appears under that name
/// after its digest has been checked, so a cache hit never needs verifying.
#[derive(Clone)]
pub struct BlobCache {
    blobs_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl BlobCache {
    pub fn new(cache_root: &Path) -> io::Result<Self> {
        let blobs_dir = cache_root.join("blobs");
        let tmp_dir = cache_root.join("tmp");

        fs::create_dir_all(&blobs_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self { blobs_dir, tmp_dir })
    }

    pub fn blob_path(&self, sha256: &str) -> PathBuf {
        self.blobs_dir.join(sha256.to_ascii_lowercase())
    }

    pub fn has_blob(&self, sha256: &str) -> bool {
        self.blob_path(sha256).is_file()
    }

    /// Begin writing a blob expected to hash to `sha256`.
    pub fn start_write(&self, sha256: &str) -> io::Result<BlobWriter> {
        let expected = sha256.to_ascii_lowercase();
        let final_path = self.blob_path(&expected);
        // Unique temp name so concurrent fetches of one blob never share a file
        let pid = std::process::id();
        let seq = NEXT_WRITE.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self.tmp_dir.join(format!("{expected}.{pid}.{seq}.part"));

        let file = fs::File::create(&tmp_path)?;

        Ok(BlobWriter {
            file,
            hasher: Sha256::new(),
            expected,
            tmp_path,
            final_path,
            committed: false,
        })
    }
}

/// Streams bytes into a temp file while hashing them.
pub struct BlobWriter {
    file: fs::File,
    hasher: Sha256,
    expected: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl BlobWriter {
    /// Check the digest and move the blob into place.
    ///
    /// On mismatch the temp file is discarded and nothing enters the cache.
    pub fn commit(mut self, file_name: Option<&str>) -> Result<PathBuf, Error> {
        self.file
            .flush()
            .map_err(|e| Error::fs(&self.tmp_path, format!("failed to flush blob: {e}")))?;

        let actual = format!("{:x}", std::mem::take(&mut self.hasher).finalize());
        if actual != self.expected {
            // Drop removes the temp file
            return Err(Error::ChecksumMismatch {
                expected: self.expected.clone(),
                actual,
                file_name: file_name.map(str::to_string),
            });
        }

        // Another fetch of the same checksum may have won the race; its bytes are identical.
        if self.final_path.exists() {
            let _ = fs::remove_file(&self.tmp_path);
            self.committed = true;
            return Ok(self.final_path.clone());
        }

        match fs::rename(&self.tmp_path, &self.final_path) {
            Ok(()) => {}
            Err(_) if self.final_path.exists() => {
                let _ = fs::remove_file(&self.tmp_path);
            }
            Err(e) => {
                return Err(Error::fs(&self.final_path, format!("failed to store blob: {e}")));
            }
        }

        self.committed = true;
        Ok(self.final_path.clone())
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.committed && self.tmp_path.exists() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
