//! Git references (branches, tags, HEAD)

use crate::object::ObjectId;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    /// Points straight at an object
    Direct(ObjectId),
    /// Points at another ref (HEAD -> refs/heads/master)
    Symbolic(String),
}

impl Ref {
    /// On-disk form of a loose ref file
    pub fn to_file_contents(&self) -> String {
        match self {
            Ref::Direct(oid) => format!("{}\n", oid),
            Ref::Symbolic(target) => format!("ref: {}\n", target),
        }
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let contents = contents.trim();
        if let Some(target) = contents.strip_prefix("ref: ") {
            return Ok(Ref::Symbolic(target.trim().to_string()));
        }
        ObjectId::from_hex(contents)
            .map(Ref::Direct)
            .ok_or_else(|| Error::InvalidObjectFormat(format!("invalid ref contents: {}", contents)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRef {
    pub name: String,
    pub reference: Ref,
}

impl NamedRef {
    pub fn new(name: impl Into<String>, reference: Ref) -> Self {
        Self { name: name.into(), reference }
    }
}

pub const HEAD: &str = "HEAD";
pub const REFS_PREFIX: &str = "refs/";
pub const REFS_HEADS: &str = "refs/heads/";
pub const REFS_TAGS: &str = "refs/tags/";

/// Branch HEAD points at in a freshly created repository
pub const DEFAULT_BRANCH: &str = "refs/heads/master";

/// Validate a ref name according to git's check-ref-format rules
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRefName("empty ref name".into()));
    }
    if name == "@" {
        return Err(Error::InvalidRefName("cannot be @".into()));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidRefName("cannot start or end with /".into()));
    }
    if name.ends_with('.') {
        return Err(Error::InvalidRefName("cannot end with .".into()));
    }
    for pattern in ["//", "..", "@{"] {
        if name.contains(pattern) {
            return Err(Error::InvalidRefName(format!("cannot contain {}", pattern)));
        }
    }
    for component in name.split('/') {
        if component.starts_with('.') {
            return Err(Error::InvalidRefName("component cannot start with .".into()));
        }
        if component.ends_with(".lock") {
            return Err(Error::InvalidRefName("component cannot end with .lock".into()));
        }
    }
    if let Some(c) = name
        .chars()
        .find(|&c| c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return Err(Error::InvalidRefName(format!("invalid character: {:?}", c)));
    }
    Ok(())
}

/// Refs a client may create, update or delete through receive-pack
pub fn validate_pushable_ref(name: &str) -> Result<()> {
    validate_ref_name(name)?;
    if !name.starts_with(REFS_PREFIX) {
        return Err(Error::InvalidRefName(format!("{} is outside refs/", name)));
    }
    Ok(())
}

pub fn branch_ref(name: &str) -> String {
    format!("{}{}", REFS_HEADS, name)
}

pub fn branch_name(full_ref: &str) -> Option<&str> {
    full_ref.strip_prefix(REFS_HEADS)
}
