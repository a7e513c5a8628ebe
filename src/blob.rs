use std::{
    fs,
    io::{self, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use sha2::{Digest as _, Sha256};
use tempfile::NamedTempFile;

use crate::message::BlobRef;

const SCRATCH_DIR: &str = "tmp";

/// Storage for request and response bodies.
///
/// Blobs are written once through a [`SpillBuffer`], persisted under their content key,
/// read back by key and deleted by key. Callers are responsible for deciding when a key
/// is no longer referenced.
pub trait BlobStore: std::fmt::Debug + Send + Sync {
    /// Opens an empty spill buffer for streamed appends.
    fn open_for_write(&self) -> io::Result<SpillBuffer>;

    /// Moves a completed spill buffer into the store. Persisting content that already
    /// exists is a no-op that returns the existing key.
    fn persist(&self, spill: SpillBuffer, content_type: Option<String>) -> io::Result<BlobRef>;

    fn open_for_read(&self, key: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Deleting a missing blob succeeds.
    fn delete(&self, key: &str) -> io::Result<()>;
}

/// Disk-backed append-only buffer that hashes its content as it is written.
///
/// Dropping a spill buffer without persisting it removes the temporary file.
#[derive(Debug)]
pub struct SpillBuffer {
    file: NamedTempFile,
    hasher: Sha256,
    len: u64,
}

impl SpillBuffer {
    pub fn new_in(dir: &Path) -> io::Result<Self> {
        Ok(Self {
            file: NamedTempFile::new_in(dir)?,
            hasher: Sha256::new(),
            len: 0,
        })
    }

    pub fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk)?;
        self.hasher.update(chunk);
        self.len = self.len.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn finish(mut self) -> io::Result<(String, u64, NamedTempFile)> {
        self.file.flush()?;
        let key = format!("{:x}", self.hasher.finalize());
        Ok((key, self.len, self.file))
    }
}

/// Content-addressed blobs on the local filesystem, laid out as `<root>/ab/cdef...`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(SCRATCH_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> io::Result<PathBuf> {
        validate_key(key)?;
        let (shard, rest) = key.split_at(2);
        Ok(self.root.join(shard).join(rest))
    }
}

impl BlobStore for FsBlobStore {
    fn open_for_write(&self) -> io::Result<SpillBuffer> {
        SpillBuffer::new_in(&self.root.join(SCRATCH_DIR))
    }

    fn persist(&self, spill: SpillBuffer, content_type: Option<String>) -> io::Result<BlobRef> {
        let (key, size_bytes, file) = spill.finish()?;
        let path = self.blob_path(&key)?;
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            file.persist(&path).map_err(|err| err.error)?;
        }
        Ok(BlobRef {
            key,
            content_type,
            size_bytes,
        })
    }

    fn open_for_read(&self, key: &str) -> io::Result<Box<dyn Read + Send>> {
        let file = fs::File::open(self.blob_path(key)?)?;
        Ok(Box::new(file))
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.blob_path(key)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn validate_key(key: &str) -> io::Result<()> {
    let well_formed =
        key.len() == 64 && key.bytes().all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'));
    if well_formed {
        Ok(())
    } else {
        Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid blob key `{key}`"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::{BlobStore, FsBlobStore};

    fn read_all(store: &FsBlobStore, key: &str) -> Vec<u8> {
        let mut out = Vec::new();
        store
            .open_for_read(key)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn persisted_blob_is_keyed_by_sha256_of_content() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(temp_dir.path()).unwrap();

        let mut spill = store.open_for_write().unwrap();
        spill.append(b"hello ").unwrap();
        spill.append(b"world").unwrap();
        assert_eq!(spill.len(), 11);

        let blob = store
            .persist(spill, Some("text/plain".to_owned()))
            .unwrap();
        assert_eq!(
            blob.key,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(blob.size_bytes, 11);
        assert_eq!(blob.content_type.as_deref(), Some("text/plain"));
        assert_eq!(read_all(&store, &blob.key), b"hello world");
        assert!(temp_dir.path().join("b9").join(&blob.key[2..]).exists());
    }

    #[test]
    fn identical_content_shares_one_blob() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(temp_dir.path()).unwrap();

        let mut first = store.open_for_write().unwrap();
        first.append(b"same").unwrap();
        let mut second = store.open_for_write().unwrap();
        second.append(b"same").unwrap();

        let first = store.persist(first, None).unwrap();
        let second = store.persist(second, Some("text/plain".to_owned())).unwrap();
        assert_eq!(first.key, second.key);
        assert_eq!(read_all(&store, &first.key), b"same");
    }

    #[test]
    fn dropped_spill_buffer_leaves_no_scratch_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(temp_dir.path()).unwrap();

        let mut spill = store.open_for_write().unwrap();
        spill.append(b"abandoned").unwrap();
        drop(spill);

        let scratch_entries = std::fs::read_dir(temp_dir.path().join("tmp"))
            .unwrap()
            .count();
        assert_eq!(scratch_entries, 0);
    }

    #[test]
    fn delete_is_idempotent_and_rejects_malformed_keys() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(temp_dir.path()).unwrap();

        let mut spill = store.open_for_write().unwrap();
        spill.append(b"gone soon").unwrap();
        let blob = store.persist(spill, None).unwrap();

        store.delete(&blob.key).unwrap();
        store.delete(&blob.key).unwrap();
        assert!(store.open_for_read(&blob.key).is_err());

        assert!(store.delete("../../etc/passwd").is_err());
    }
}
