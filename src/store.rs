//! File storage for transferred payloads
//!
//! The router hands every file transfer to a `FileStore` before forwarding
//! it. Stores never look inside the bytes.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::debug;

/// Persists file payloads on behalf of a sender
pub trait FileStore: Send + Sync {
    /// Store `bytes` as `file_name` owned by `owner` and return where it went.
    ///
    /// The same owner and file name always map to the same location.
    fn store(&self, owner: &str, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf>;
}

/// Directory name for `owner`.
///
/// Owner names are identities, so they are never shortened: anything that
/// is not exactly one plain path component is refused. "mallory/bob" must
/// not land in bob's directory.
fn owner_component(owner: &str) -> io::Result<&str> {
    let mut components = Path::new(owner).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == owner && !owner.trim().is_empty() => {
            Ok(owner)
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Owner name is not a plain path component: {:?}", owner),
        )),
    }
}

/// Reduce a client supplied file name to its final path component
fn file_component(name: &str) -> io::Result<&str> {
    let component = Path::new(name)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .last();

    match component {
        Some(part) if !part.trim().is_empty() => Ok(part),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid file name: {:?}", name),
        )),
    }
}

/// Writes payloads to `<root>/<owner>/<file name>`
#[derive(Debug, Clone)]
pub struct DiskFileStore {
    root: PathBuf,
}

impl DiskFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location a payload would be written to
    pub fn path_for(&self, owner: &str, file_name: &str) -> io::Result<PathBuf> {
        Ok(self
            .root
            .join(owner_component(owner)?)
            .join(file_component(file_name)?))
    }
}

impl FileStore for DiskFileStore {
    fn store(&self, owner: &str, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.path_for(owner, file_name)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, bytes)?;
        debug!("Stored {} bytes at {}", bytes.len(), path.display());
        Ok(path)
    }
}

/// Keeps payloads in memory, keyed by their would-be path
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored payload for `owner` and `file_name`, if any
    pub fn get(&self, owner: &str, file_name: &str) -> Option<Vec<u8>> {
        let path = Self::key(owner, file_name).ok()?;
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        files.get(&path).cloned()
    }

    pub fn len(&self) -> usize {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(owner: &str, file_name: &str) -> io::Result<PathBuf> {
        Ok(Path::new(owner_component(owner)?).join(file_component(file_name)?))
    }
}

impl FileStore for MemoryFileStore {
    fn store(&self, owner: &str, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = Self::key(owner, file_name)?;
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        files.insert(path.clone(), bytes.to_vec());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_component() {
        assert_eq!(file_component("report.pdf").unwrap(), "report.pdf");
        assert_eq!(file_component("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(file_component("/abs/path/img.png").unwrap(), "img.png");
        assert!(file_component("").is_err());
        assert!(file_component("..").is_err());
        assert!(file_component("   ").is_err());
    }

    #[test]
    fn test_owner_component_is_never_shortened() {
        assert_eq!(owner_component("bob").unwrap(), "bob");
        assert_eq!(owner_component("bob smith").unwrap(), "bob smith");
        for owner in ["mallory/bob", "../bob", "/bob", "bob/", "./bob", "..", ".", "", " "] {
            assert!(owner_component(owner).is_err(), "{:?}", owner);
        }
    }

    #[test]
    fn test_distinct_owners_get_distinct_paths() {
        let store = DiskFileStore::new("/r");
        let bob = store.path_for("bob", "notes.txt").unwrap();
        assert_eq!(bob, PathBuf::from("/r/bob/notes.txt"));
        assert!(store.path_for("mallory/bob", "notes.txt").is_err());

        let dir = tempfile::tempdir().unwrap();
        let store = DiskFileStore::new(dir.path());
        store.store("bob", "notes.txt", b"from bob").unwrap();
        assert!(store.store("mallory/bob", "notes.txt", b"forged").is_err());
        let kept = fs::read(dir.path().join("bob").join("notes.txt")).unwrap();
        assert_eq!(kept, b"from bob");

        let memory = MemoryFileStore::new();
        assert!(memory.store("mallory/bob", "notes.txt", b"forged").is_err());
        assert!(memory.is_empty());
    }

    #[test]
    fn test_disk_store_writes_under_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskFileStore::new(dir.path());

        let payload = [0u8, 159, 146, 150, 255];
        let path = store.store("alice", "bin.dat", &payload).unwrap();

        assert_eq!(path, dir.path().join("alice").join("bin.dat"));
        assert_eq!(fs::read(&path).unwrap(), payload);
    }

    #[test]
    fn test_disk_store_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskFileStore::new(dir.path());

        let first = store.store("bob", "notes.txt", b"one").unwrap();
        let second = store.store("bob", "notes.txt", b"two").unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(&second).unwrap(), b"two");
    }

    #[test]
    fn test_disk_store_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskFileStore::new(dir.path());
        assert!(store.store("alice", "", b"x").is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryFileStore::new();
        assert!(store.is_empty());

        store.store("alice", "a.txt", b"abc").unwrap();
        assert_eq!(store.get("alice", "a.txt").unwrap(), b"abc");
        assert_eq!(store.len(), 1);
        assert!(store.get("bob", "a.txt").is_none());
    }
}
