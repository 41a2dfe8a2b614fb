//! Content-addressed store of whole JAR (class bundle) files, keyed by a
//! 128-bit checksum. An entry, once fully written, is
//! immutable and its content's checksum must match the key; partial
//! transfers use a temporary name and are renamed atomically only after the
//! checksum is verified, so a crash mid-transfer never leaves a file that
//! `lookup_path` can find.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// 128 bits: the first 16 bytes of a SHA-256 digest, matching the checksum
/// width `ClassImage`/`JarEntry` carry on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(pub [u8; 16]);

impl Checksum {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        Self(out)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// `jarCache/<first 2 hex chars>/<remaining 30 hex chars>.jar` per
    ///
    pub fn relative_path(self) -> PathBuf {
        let hex = self.to_hex();
        let (prefix, rest) = hex.split_at(2);
        Path::new(&prefix).join(format!("{rest}.jar"))
    }
}

/// Filesystem-backed JAR cache. Concurrent puts for the same checksum
/// serialize on a per-checksum lock (approximated here with one global lock
/// guarding the directory, since JAR puts are rare background transfers,
/// not a hot path).
pub struct JarCache {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JarCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn lookup_path(&self, checksum: Checksum) -> Option<PathBuf> {
        let path = self.root.join(checksum.relative_path());
        if path.is_file() {
            Some(path)
        } else {
            None
        }
    }

    /// Stream `content` into the cache under `checksum`. Verifies the
    /// content's actual checksum matches before the atomic rename; on
    /// mismatch or any I/O failure the partial file is removed and no file
    /// is left in the cache directory.
    pub fn put(&self, checksum: Checksum, content: &[u8]) -> Result<PathBuf> {
        let _guard = self.write_lock.lock();
        let actual = Checksum::of(content);
        if actual.0 != checksum.0 {
            return Err(Error::JarCache(format!(
                "checksum mismatch: declared {} actual {}",
                checksum.to_hex(),
                actual.to_hex()
            )));
        }
        let final_path = self.root.join(checksum.relative_path());
        let dir = final_path.parent().expect("relative_path always has a parent");
        fs::create_dir_all(dir).map_err(|e| self.wrap_io(e, dir))?;
        let temp_path = final_path.with_extension("jar.part");
        let write_result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
            fs::rename(&temp_path, &final_path)?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(self.wrap_io(e, &final_path));
        }
        Ok(final_path)
    }

    fn wrap_io(&self, err: std::io::Error, path: &Path) -> Error {
        Error::JarCache(format!(
            "cache directory {} (entry {}): {err}",
            self.root.display(),
            path.display()
        ))
    }

    /// Discard any leftover `.jar.part` temp files (partial transfers
    /// interrupted by a restart are ignored by `lookup_path` already; this
    /// is purely disk hygiene).
    pub fn discard_partial_transfers(&self) -> std::io::Result<()> {
        if !self.root.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for inner in fs::read_dir(entry.path())? {
                    let inner = inner?;
                    if inner.path().extension().and_then(|e| e.to_str()) == Some("part") {
                        let _ = fs::remove_file(inner.path());
                    }
                }
            }
        }
        Ok(())
    }
}
