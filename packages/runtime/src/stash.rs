//! Root-side build-artifact stash.
//!
//! Expensive artifacts (compiled object code, analysis results) are
//! stashed under a caller-chosen key together with a determinant hash of
//! the inputs that produced them. A restore only hits when the
//! determinant matches; anything else means the inputs changed and the
//! artifact is stale.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use bytes::Bytes;

use crate::error::Result;

/// Determinant-keyed blob store owned by the root task.
pub trait Stash: Send {
    /// Store `data` under `key`, replacing any previous entry.
    fn stash(&mut self, key: &str, determinant: u64, data: Bytes) -> Result<()>;

    /// The blob stashed under `key`, if its determinant matches.
    fn restore(&self, key: &str, determinant: u64) -> Result<Option<Bytes>>;

    /// Drop every entry.
    fn clear(&mut self) -> Result<()>;
}

/// In-process stash for single-run deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStash {
    blobs: HashMap<String, (u64, Bytes)>,
}

impl MemoryStash {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stash for MemoryStash {
    fn stash(&mut self, key: &str, determinant: u64, data: Bytes) -> Result<()> {
        self.blobs.insert(key.to_string(), (determinant, data));
        Ok(())
    }

    fn restore(&self, key: &str, determinant: u64) -> Result<Option<Bytes>> {
        Ok(self
            .blobs
            .get(key)
            .filter(|(stored, _)| *stored == determinant)
            .map(|(_, data)| data.clone()))
    }

    fn clear(&mut self) -> Result<()> {
        self.blobs.clear();
        Ok(())
    }
}

/// Directory-backed stash surviving restarts.
///
/// Each key maps to one file; the determinant occupies the first eight
/// bytes, little-endian, followed by the blob.
#[derive(Debug)]
pub struct FileStash {
    directory: PathBuf,
}

impl FileStash {
    /// Open a stash rooted at `directory`, creating it if needed.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    /// Keys are caller paths; flatten them into single file names.
    fn path_of(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len());
        for c in key.chars() {
            name.push(if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            });
        }
        self.directory.join(name)
    }
}

impl Stash for FileStash {
    fn stash(&mut self, key: &str, determinant: u64, data: Bytes) -> Result<()> {
        let mut contents = Vec::with_capacity(8 + data.len());
        contents.extend_from_slice(&determinant.to_le_bytes());
        contents.extend_from_slice(&data);
        fs::write(self.path_of(key), contents)?;
        Ok(())
    }

    fn restore(&self, key: &str, determinant: u64) -> Result<Option<Bytes>> {
        let contents = match fs::read(self.path_of(key)) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if contents.len() < 8 {
            return Ok(None);
        }
        let mut stored = [0u8; 8];
        stored.copy_from_slice(&contents[..8]);
        if u64::from_le_bytes(stored) != determinant {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&contents[8..])))
    }

    fn clear(&mut self) -> Result<()> {
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stash_requires_a_matching_determinant() {
        let mut stash = MemoryStash::new();
        stash.stash("a/b.o", 7, Bytes::from_static(b"blob")).unwrap();

        assert_eq!(
            stash.restore("a/b.o", 7).unwrap(),
            Some(Bytes::from_static(b"blob"))
        );
        assert_eq!(stash.restore("a/b.o", 8).unwrap(), None);
        assert_eq!(stash.restore("missing", 7).unwrap(), None);

        stash.clear().unwrap();
        assert_eq!(stash.restore("a/b.o", 7).unwrap(), None);
    }

    #[test]
    fn file_stash_round_trips_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        let mut stash = FileStash::new(dir.path()).unwrap();
        stash
            .stash("pkg/obj.o", 42, Bytes::from_static(b"compiled"))
            .unwrap();
        drop(stash);

        // a second instance over the same directory sees the entry
        let stash = FileStash::new(dir.path()).unwrap();
        assert_eq!(
            stash.restore("pkg/obj.o", 42).unwrap(),
            Some(Bytes::from_static(b"compiled"))
        );
        assert_eq!(stash.restore("pkg/obj.o", 41).unwrap(), None);
    }

    #[test]
    fn file_stash_clear_empties_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut stash = FileStash::new(dir.path()).unwrap();
        stash.stash("one", 1, Bytes::from_static(b"1")).unwrap();
        stash.stash("two", 2, Bytes::from_static(b"2")).unwrap();

        stash.clear().unwrap();
        assert_eq!(stash.restore("one", 1).unwrap(), None);
        assert_eq!(stash.restore("two", 2).unwrap(), None);
    }

    #[test]
    fn keys_with_separators_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let mut stash = FileStash::new(dir.path()).unwrap();
        stash.stash("a/b", 1, Bytes::from_static(b"slash")).unwrap();
        stash.stash("a.b", 1, Bytes::from_static(b"dot")).unwrap();

        assert_eq!(
            stash.restore("a/b", 1).unwrap(),
            Some(Bytes::from_static(b"slash"))
        );
        assert_eq!(
            stash.restore("a.b", 1).unwrap(),
            Some(Bytes::from_static(b"dot"))
        );
    }
}
