//! Git object types and serialization
//!
//! Objects are content-addressed by the SHA-1 of `"{type} {size}\0{content}"`.
//! Only what the server needs is modelled: hashing, the loose encoding, and
//! enough commit/tree/tag parsing to walk reachability.

use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Blob => "blob",
            ObjectType::Tree => "tree",
            ObjectType::Commit => "commit",
            ObjectType::Tag => "tag",
        }
    }
}

impl FromStr for ObjectType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(ObjectType::Blob),
            "tree" => Ok(ObjectType::Tree),
            "commit" => Ok(ObjectType::Commit),
            "tag" => Ok(ObjectType::Tag),
            other => Err(Error::InvalidObjectType(other.to_string())),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 20-byte SHA-1 object ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// The all-zero id git uses for "no object" in ref update commands
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(ObjectId(arr))
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 40 {
            return None;
        }
        let bytes = hex::decode(hex).ok()?;
        Self::from_bytes(&bytes)
    }

    /// Parse a hex id where the zero id means "absent"
    pub fn from_hex_nonzero(hex: &str) -> Option<Option<Self>> {
        let oid = Self::from_hex(hex)?;
        Some(if oid.is_zero() { None } else { Some(oid) })
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn hash_object(obj_type: ObjectType, content: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("{} {}\0", obj_type, content.len()).as_bytes());
        hasher.update(content);
        let mut id = [0u8; 20];
        id.copy_from_slice(&hasher.finalize());
        ObjectId(id)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s).ok_or_else(|| Error::InvalidObjectFormat(format!("bad object id: {}", s)))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitObject {
    pub obj_type: ObjectType,
    pub content: Vec<u8>,
}

impl GitObject {
    pub fn new(obj_type: ObjectType, content: Vec<u8>) -> Self {
        Self { obj_type, content }
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::hash_object(self.obj_type, &self.content)
    }

    /// Header + content, the form that gets zlib-compressed on disk
    pub fn to_loose_format(&self) -> Vec<u8> {
        let mut data = format!("{} {}\0", self.obj_type, self.content.len()).into_bytes();
        data.extend_from_slice(&self.content);
        data
    }

    pub fn from_loose_format(data: &[u8]) -> Result<Self> {
        let null_pos = data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::InvalidObjectFormat("missing null byte".into()))?;

        let header = std::str::from_utf8(&data[..null_pos])
            .map_err(|_| Error::InvalidObjectFormat("invalid header".into()))?;
        let (type_str, size_str) = header
            .split_once(' ')
            .ok_or_else(|| Error::InvalidObjectFormat(format!("malformed header: {}", header)))?;

        let obj_type: ObjectType = type_str.parse()?;
        let size: usize = size_str
            .parse()
            .map_err(|_| Error::InvalidObjectFormat("invalid size".into()))?;

        let content = data[null_pos + 1..].to_vec();
        if content.len() != size {
            return Err(Error::InvalidObjectFormat(format!(
                "size mismatch: expected {}, got {}",
                size,
                content.len()
            )));
        }

        Ok(Self { obj_type, content })
    }

    /// Objects this one points at directly (tree and parents of a commit,
    /// entries of a tree, the target of a tag)
    pub fn references(&self) -> Result<Vec<ObjectId>> {
        match self.obj_type {
            ObjectType::Blob => Ok(Vec::new()),
            ObjectType::Tree => Ok(parse_tree(&self.content)?
                .into_iter()
                // gitlinks (submodules) point outside this repository
                .filter(|e| e.mode != MODE_GITLINK)
                .map(|e| e.oid)
                .collect()),
            ObjectType::Commit => Ok(header_ids(&self.content, &["tree", "parent"])),
            ObjectType::Tag => Ok(header_ids(&self.content, &["object"])),
        }
    }
}

/// Collect ids from `key <hex>` header lines, stopping at the blank line
fn header_ids(content: &[u8], keys: &[&str]) -> Vec<ObjectId> {
    let text = String::from_utf8_lossy(content);
    let mut ids = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(' ') {
            if keys.contains(&key) {
                if let Some(oid) = ObjectId::from_hex(value.trim()) {
                    ids.push(oid);
                }
            }
        }
    }
    ids
}

pub const MODE_TREE: u32 = 0o40000;
pub const MODE_BLOB: u32 = 0o100644;
pub const MODE_GITLINK: u32 = 0o160000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: String,
    pub oid: ObjectId,
}

impl TreeEntry {
    pub fn new(mode: u32, name: impl Into<String>, oid: ObjectId) -> Self {
        Self { mode, name: name.into(), oid }
    }

    pub fn is_tree(&self) -> bool {
        self.mode == MODE_TREE
    }
}

pub fn parse_tree(content: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut rest = content;

    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::InvalidObjectFormat("tree: missing space".into()))?;
        let mode = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|m| u32::from_str_radix(m, 8).ok())
            .ok_or_else(|| Error::InvalidObjectFormat("tree: invalid mode".into()))?;
        rest = &rest[space + 1..];

        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::InvalidObjectFormat("tree: missing null".into()))?;
        let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
        rest = &rest[nul + 1..];

        if rest.len() < 20 {
            return Err(Error::InvalidObjectFormat("tree: truncated sha".into()));
        }
        let oid = ObjectId::from_bytes(&rest[..20])
            .ok_or_else(|| Error::InvalidObjectFormat("tree: invalid sha".into()))?;
        rest = &rest[20..];

        entries.push(TreeEntry { mode, name, oid });
    }

    Ok(entries)
}

pub fn serialize_tree(entries: &[TreeEntry]) -> Vec<u8> {
    let mut content = Vec::new();
    for entry in entries {
        content.extend_from_slice(format!("{:o} {}\0", entry.mode, entry.name).as_bytes());
        content.extend_from_slice(entry.oid.as_bytes());
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_blob_hash() {
        let oid = ObjectId::hash_object(ObjectType::Blob, &[]);
        assert_eq!(oid.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn test_empty_tree_hash() {
        let oid = ObjectId::hash_object(ObjectType::Tree, &[]);
        assert_eq!(oid.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn test_zero_id_is_absent() {
        let zero = "0".repeat(40);
        assert_eq!(ObjectId::from_hex_nonzero(&zero), Some(None));
        assert_eq!(ObjectId::from_hex_nonzero("xyz"), None);
    }

    #[test]
    fn test_loose_format_rejects_size_mismatch() {
        let err = GitObject::from_loose_format(b"blob 5\0abc").unwrap_err();
        assert!(matches!(err, Error::InvalidObjectFormat(_)));
    }

    #[test]
    fn test_commit_references() {
        let tree = ObjectId::hash_object(ObjectType::Tree, &[]);
        let parent = ObjectId::hash_object(ObjectType::Blob, b"not really a commit");
        let body = format!(
            "tree {}\nparent {}\nauthor A <a@b> 1 +0000\ncommitter A <a@b> 1 +0000\n\ntree {}\n",
            tree, parent, parent
        );
        let refs = GitObject::new(ObjectType::Commit, body.into_bytes()).references().unwrap();
        // the message line after the blank line is not a header
        assert_eq!(refs, vec![tree, parent]);
    }

    #[test]
    fn test_tree_references_skip_gitlinks() {
        let blob = ObjectId::hash_object(ObjectType::Blob, b"vars/hello.groovy");
        let submodule = ObjectId::hash_object(ObjectType::Commit, b"elsewhere");
        let content = serialize_tree(&[
            TreeEntry::new(MODE_BLOB, "hello.groovy", blob),
            TreeEntry::new(MODE_GITLINK, "external", submodule),
        ]);
        let tree = GitObject::new(ObjectType::Tree, content);
        assert_eq!(tree.references().unwrap(), vec![blob]);
        assert_eq!(parse_tree(&tree.content).unwrap().len(), 2);
    }
}
