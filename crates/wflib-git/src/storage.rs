//! On-disk bare git repository
//!
//! Layout is the one stock git uses, so `git` itself can read what we write:
//!   <root>/
//!     HEAD            "ref: refs/heads/master"
//!     config          core.bare = true
//!     objects/xx/yyyy zlib-compressed loose objects
//!     refs/heads/...  loose refs, one oid per file
//!     packed-refs     read, and rewritten on delete
//!     info/refs       ref listing for dumb clients (see `update_server_info`)
//!
//! Ref files are only ever replaced through a `<ref>.lock` file that is created
//! exclusively and renamed into place, so concurrent pushes to the same ref
//! serialize at the filesystem.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::object::{GitObject, ObjectId, ObjectType};
use crate::refs::{validate_ref_name, NamedRef, Ref, DEFAULT_BRANCH, HEAD};
use crate::{Error, Result};

const CONFIG: &str = "[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n";
const DESCRIPTION: &str =
    "Unnamed repository; edit this file 'description' to name the repository.\n";
const PACKED_REFS: &str = "packed-refs";

/// Handle to a bare repository directory
#[derive(Debug, Clone)]
pub struct GitStorage {
    root: PathBuf,
}

impl GitStorage {
    /// Create an empty bare repository at `path`.
    ///
    /// `path` must be absent or an empty directory; nothing already on disk is
    /// ever adopted into the new repository.
    pub fn init_bare(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if root.exists() && fs::read_dir(&root)?.next().is_some() {
            return Err(Error::StorageError(format!(
                "refusing to initialize over non-empty directory {}",
                root.display()
            )));
        }

        for dir in ["objects/info", "objects/pack", "refs/heads", "refs/tags", "info"] {
            fs::create_dir_all(root.join(dir))?;
        }
        fs::write(root.join("config"), CONFIG)?;
        fs::write(root.join("description"), DESCRIPTION)?;
        // HEAD goes last: `is_bare_repository` keys off it
        fs::write(
            root.join(HEAD),
            Ref::Symbolic(DEFAULT_BRANCH.into()).to_file_contents(),
        )?;

        debug!(path = %root.display(), "initialized bare repository");
        Ok(Self { root })
    }

    /// Open an existing bare repository
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if !Self::is_bare_repository(&root) {
            return Err(Error::NotARepository(root.display().to_string()));
        }
        Ok(Self { root })
    }

    /// Cheap structural check: HEAD file plus objects/ and refs/ directories
    pub fn is_bare_repository(path: &Path) -> bool {
        path.join(HEAD).is_file() && path.join("objects").is_dir() && path.join("refs").is_dir()
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    // === Object operations ===

    fn object_dir(&self, hex: &str) -> PathBuf {
        self.root.join("objects").join(&hex[..2])
    }

    fn object_path(&self, oid: &ObjectId) -> PathBuf {
        let hex = oid.to_hex();
        self.object_dir(&hex).join(&hex[2..])
    }

    pub fn has_object(&self, oid: &ObjectId) -> Result<bool> {
        Ok(self.object_path(oid).is_file())
    }

    pub fn read_object(&self, oid: &ObjectId) -> Result<GitObject> {
        let compressed = match fs::read(self.object_path(oid)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::ObjectNotFound(oid.to_hex()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut data = Vec::new();
        ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut data)?;
        let obj = GitObject::from_loose_format(&data)?;

        if obj.id() != *oid {
            return Err(Error::InvalidObjectFormat(format!("corrupt object {}", oid)));
        }
        Ok(obj)
    }

    /// Write an object, returning its ID. Already-present objects are left alone.
    pub fn write_object(&self, obj: &GitObject) -> Result<ObjectId> {
        let oid = obj.id();
        let path = self.object_path(&oid);
        if path.is_file() {
            return Ok(oid);
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&obj.to_loose_format())?;
        let compressed = encoder.finish()?;

        let dir = self.object_dir(&oid.to_hex());
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&compressed)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(oid)
    }

    pub fn write_raw_object(&self, obj_type: ObjectType, content: &[u8]) -> Result<ObjectId> {
        self.write_object(&GitObject::new(obj_type, content.to_vec()))
    }

    pub fn write_blob(&self, content: &[u8]) -> Result<ObjectId> {
        self.write_raw_object(ObjectType::Blob, content)
    }

    pub fn write_tree(&self, content: &[u8]) -> Result<ObjectId> {
        self.write_raw_object(ObjectType::Tree, content)
    }

    pub fn write_commit(&self, content: &[u8]) -> Result<ObjectId> {
        self.write_raw_object(ObjectType::Commit, content)
    }

    // === Ref operations ===

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn read_loose_ref(&self, name: &str) -> Result<Option<Ref>> {
        let path = self.ref_path(name);
        if !path.is_file() {
            return Ok(None);
        }
        match fs::read_to_string(&path) {
            Ok(contents) => Ref::parse(&contents).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_packed_refs(&self) -> Result<Vec<(String, ObjectId)>> {
        let contents = match fs::read_to_string(self.root.join(PACKED_REFS)) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut refs = Vec::new();
        for line in contents.lines() {
            // '#' is the header, '^' a peeled tag target
            if line.starts_with('#') || line.starts_with('^') {
                continue;
            }
            if let Some((hex, name)) = line.split_once(' ') {
                match ObjectId::from_hex(hex) {
                    Some(oid) => refs.push((name.trim().to_string(), oid)),
                    None => warn!(line, "skipping malformed packed-refs line"),
                }
            }
        }
        Ok(refs)
    }

    /// Read a ref without following symbolic links; `None` if it does not exist
    pub fn try_read_ref(&self, name: &str) -> Result<Option<Ref>> {
        if let Some(reference) = self.read_loose_ref(name)? {
            return Ok(Some(reference));
        }
        Ok(self
            .read_packed_refs()?
            .into_iter()
            .find(|(packed, _)| packed == name)
            .map(|(_, oid)| Ref::Direct(oid)))
    }

    pub fn read_ref(&self, name: &str) -> Result<Ref> {
        self.try_read_ref(name)?
            .ok_or_else(|| Error::RefNotFound(name.into()))
    }

    /// Unconditionally point `name` at `target`
    pub fn write_ref(&self, name: &str, target: &Ref) -> Result<()> {
        validate_ref_name(name)?;
        RefLock::acquire(self.ref_path(name), name)?.commit(&target.to_file_contents())
    }

    /// Remove a ref, returning whether it existed
    pub fn delete_ref(&self, name: &str) -> Result<bool> {
        validate_ref_name(name)?;
        let _lock = RefLock::acquire(self.ref_path(name), name)?;
        self.remove_ref_locked(name)
    }

    fn remove_ref_locked(&self, name: &str) -> Result<bool> {
        let loose = match fs::remove_file(self.ref_path(name)) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        let packed = self.remove_packed_ref(name)?;
        Ok(loose || packed)
    }

    fn remove_packed_ref(&self, name: &str) -> Result<bool> {
        let path = self.root.join(PACKED_REFS);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let lock = RefLock::acquire(path, PACKED_REFS)?;
        let mut kept = String::new();
        let mut removed = false;
        let mut skipping_peel = false;
        for line in contents.lines() {
            if line.starts_with('^') && skipping_peel {
                continue;
            }
            skipping_peel = false;
            if line.split_once(' ').map(|(_, n)| n.trim()) == Some(name) {
                removed = true;
                skipping_peel = true;
                continue;
            }
            kept.push_str(line);
            kept.push('\n');
        }

        if removed {
            lock.commit(&kept)?;
        }
        Ok(removed)
    }

    /// Follow symbolic refs down to an object id
    pub fn resolve_ref(&self, name: &str) -> Result<ObjectId> {
        const MAX_DEPTH: usize = 5;
        let mut current = name.to_string();

        for _ in 0..MAX_DEPTH {
            match self.read_ref(&current)? {
                Ref::Direct(oid) => return Ok(oid),
                Ref::Symbolic(target) => current = target,
            }
        }
        Err(Error::RefNotFound(format!("symbolic ref loop or too deep: {}", name)))
    }

    /// All refs under refs/, sorted by name. Loose refs shadow packed ones.
    pub fn list_refs(&self) -> Result<Vec<NamedRef>> {
        let mut refs: BTreeMap<String, Ref> = self
            .read_packed_refs()?
            .into_iter()
            .map(|(name, oid)| (name, Ref::Direct(oid)))
            .collect();

        for entry in WalkDir::new(self.root.join("refs")) {
            let entry = entry.map_err(|e| Error::StorageError(format!("walk refs: {}", e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if name.ends_with(".lock") {
                continue;
            }
            match fs::read_to_string(entry.path()).map_err(Error::from).and_then(|c| Ref::parse(&c)) {
                Ok(reference) => {
                    refs.insert(name, reference);
                }
                Err(e) => warn!(%name, error = %e, "skipping unreadable ref"),
            }
        }

        Ok(refs
            .into_iter()
            .map(|(name, reference)| NamedRef::new(name, reference))
            .collect())
    }

    /// Update a ref only if it currently holds `expected` (`None` = absent).
    /// `new_value` of `None` deletes it. Returns false when the check fails.
    pub fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<&ObjectId>,
        new_value: Option<&ObjectId>,
    ) -> Result<bool> {
        validate_ref_name(name)?;
        let lock = RefLock::acquire(self.ref_path(name), name)?;

        let current = match self.try_read_ref(name)? {
            Some(Ref::Direct(oid)) => Some(oid),
            Some(Ref::Symbolic(target)) => {
                return Err(Error::StorageError(format!(
                    "{} is a symbolic ref to {}",
                    name, target
                )))
            }
            None => None,
        };

        if current.as_ref() != expected {
            return Ok(false);
        }

        match new_value {
            Some(oid) => lock.commit(&Ref::Direct(*oid).to_file_contents())?,
            None => {
                self.remove_ref_locked(name)?;
            }
        }
        Ok(true)
    }

    /// Rewrite info/refs, the listing dumb-HTTP clients read
    pub fn update_server_info(&self) -> Result<()> {
        let mut listing = String::new();
        for named in self.list_refs()? {
            if let Ref::Direct(oid) = named.reference {
                listing.push_str(&format!("{}\t{}\n", oid, named.name));
            }
        }

        let info_dir = self.root.join("info");
        fs::create_dir_all(&info_dir)?;
        let mut tmp = NamedTempFile::new_in(&info_dir)?;
        tmp.write_all(listing.as_bytes())?;
        tmp.persist(info_dir.join("refs")).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Exclusive `<path>.lock` file, renamed over `<path>` on commit and removed
/// on drop otherwise
struct RefLock {
    name: String,
    lock_path: PathBuf,
    target: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl RefLock {
    fn acquire(target: PathBuf, name: &str) -> Result<Self> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lock_path = target.clone().into_os_string();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);

        let file = match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::RefLocked(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            name: name.to_string(),
            lock_path,
            target,
            file: Some(file),
            committed: false,
        })
    }

    fn commit(mut self, contents: &str) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::StorageError(format!("lock for {} already used", self.name)))?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.lock_path, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for RefLock {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
