//! Packfile generation and parsing
//!
//! Format: `PACK`, version 2, object count, entries, trailing SHA-1.
//! Generated packs hold whole objects only. Parsed packs may contain
//! OFS_DELTA and REF_DELTA entries; those are resolved against earlier
//! entries, later entries, or objects already in the repository (thin packs).

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use tracing::debug;

use crate::object::{GitObject, ObjectId, ObjectType};
use crate::storage::GitStorage;
use crate::{Error, Result};

const PACK_COMMIT: u8 = 1;
const PACK_TREE: u8 = 2;
const PACK_BLOB: u8 = 3;
const PACK_TAG: u8 = 4;
const PACK_OFS_DELTA: u8 = 6;
const PACK_REF_DELTA: u8 = 7;

fn type_code(t: ObjectType) -> u8 {
    match t {
        ObjectType::Commit => PACK_COMMIT,
        ObjectType::Tree => PACK_TREE,
        ObjectType::Blob => PACK_BLOB,
        ObjectType::Tag => PACK_TAG,
    }
}

fn object_type(code: u8) -> Option<ObjectType> {
    match code {
        PACK_COMMIT => Some(ObjectType::Commit),
        PACK_TREE => Some(ObjectType::Tree),
        PACK_BLOB => Some(ObjectType::Blob),
        PACK_TAG => Some(ObjectType::Tag),
        _ => None,
    }
}

/// Build a packfile holding exactly `oids`
pub fn generate_packfile(storage: &GitStorage, oids: &[ObjectId]) -> Result<Vec<u8>> {
    let mut pack = Vec::new();
    pack.extend_from_slice(b"PACK");
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&(oids.len() as u32).to_be_bytes());

    for oid in oids {
        write_pack_object(&mut pack, &storage.read_object(oid)?)?;
    }

    let checksum = Sha1::digest(&pack);
    pack.extend_from_slice(&checksum);
    Ok(pack)
}

fn write_entry_header(pack: &mut Vec<u8>, code: u8, mut size: usize) {
    // type in bits 4-6 of the first byte, size as a little-endian varint
    // with 4 bits in the first byte and 7 in each following one
    let mut byte = (code << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size > 0 {
        pack.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    pack.push(byte);
}

fn write_pack_object(pack: &mut Vec<u8>, obj: &GitObject) -> Result<()> {
    write_entry_header(pack, type_code(obj.obj_type), obj.content.len());

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&obj.content)?;
    pack.extend_from_slice(&encoder.finish()?);
    Ok(())
}

enum EntryData {
    Whole(ObjectType, Vec<u8>),
    OfsDelta { base_offset: usize, delta: Vec<u8> },
    RefDelta { base: ObjectId, delta: Vec<u8> },
}

struct PackEntry {
    offset: usize,
    data: EntryData,
}

/// Parse a packfile and store every object in it, returning their IDs in
/// pack order
pub fn parse_packfile(storage: &GitStorage, data: &[u8]) -> Result<Vec<ObjectId>> {
    if data.len() < 32 {
        return Err(Error::PackError("packfile too small".into()));
    }
    if &data[0..4] != b"PACK" {
        return Err(Error::PackError("invalid packfile magic".into()));
    }
    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != 2 && version != 3 {
        return Err(Error::PackError(format!("unsupported pack version: {}", version)));
    }
    let object_count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;

    let checksum_start = data.len() - 20;
    if Sha1::digest(&data[..checksum_start])[..] != data[checksum_start..] {
        return Err(Error::PackError("checksum mismatch".into()));
    }

    let body = &data[..checksum_start];
    let mut entries = Vec::with_capacity(object_count);
    let mut pos = 12;
    for _ in 0..object_count {
        let (entry, next) = parse_entry(body, pos)?;
        entries.push(entry);
        pos = next;
    }
    if pos != checksum_start {
        return Err(Error::PackError("trailing bytes after last object".into()));
    }

    resolve_entries(storage, entries)
}

/// Decode the entry header at `offset` and inflate its payload
fn parse_entry(body: &[u8], offset: usize) -> Result<(PackEntry, usize)> {
    let truncated = || Error::PackError(format!("truncated entry at offset {}", offset));
    let mut pos = offset;

    let first = *body.get(pos).ok_or_else(truncated)?;
    pos += 1;
    let code = (first >> 4) & 0x07;
    let mut size = (first & 0x0f) as usize;
    let mut shift = 4;
    let mut byte = first;
    while byte & 0x80 != 0 {
        byte = *body.get(pos).ok_or_else(truncated)?;
        pos += 1;
        if shift >= usize::BITS {
            return Err(Error::PackError(format!("object size overflows at offset {}", offset)));
        }
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
    }

    let data = match code {
        PACK_OFS_DELTA => {
            // big-endian varint with an implicit +1 per continuation byte
            let mut byte = *body.get(pos).ok_or_else(truncated)?;
            pos += 1;
            let mut distance = (byte & 0x7f) as usize;
            while byte & 0x80 != 0 {
                byte = *body.get(pos).ok_or_else(truncated)?;
                pos += 1;
                distance = distance
                    .checked_add(1)
                    .and_then(|d| d.checked_mul(0x80))
                    .ok_or_else(|| Error::PackError(format!("bad delta offset at {}", offset)))?
                    | (byte & 0x7f) as usize;
            }
            let base_offset = offset
                .checked_sub(distance)
                .filter(|_| distance > 0)
                .ok_or_else(|| Error::PackError(format!("bad delta offset at {}", offset)))?;
            let (delta, used) = inflate(&body[pos..], size)?;
            pos += used;
            EntryData::OfsDelta { base_offset, delta }
        }
        PACK_REF_DELTA => {
            let base = body
                .get(pos..pos + 20)
                .and_then(ObjectId::from_bytes)
                .ok_or_else(truncated)?;
            pos += 20;
            let (delta, used) = inflate(&body[pos..], size)?;
            pos += used;
            EntryData::RefDelta { base, delta }
        }
        _ => {
            let obj_type = object_type(code)
                .ok_or_else(|| Error::PackError(format!("unsupported object type: {}", code)))?;
            let (content, used) = inflate(&body[pos..], size)?;
            pos += used;
            EntryData::Whole(obj_type, content)
        }
    };

    Ok((PackEntry { offset, data }, pos))
}

/// Inflate one zlib stream, returning the bytes and how much input it used
///
/// `expected` comes from the entry header and is untrusted: it caps the read
/// but only hints the allocation.
fn inflate(input: &[u8], expected: usize) -> Result<(Vec<u8>, usize)> {
    let mut decoder = ZlibDecoder::new(input);
    let mut out = Vec::with_capacity(expected.min(input.len().saturating_mul(4)));
    (&mut decoder)
        .take((expected as u64).saturating_add(1))
        .read_to_end(&mut out)?;
    if out.len() != expected {
        return Err(Error::PackError(format!(
            "inflated size mismatch: expected {}, got {}",
            expected,
            out.len()
        )));
    }
    Ok((out, decoder.total_in() as usize))
}

fn resolve_entries(storage: &GitStorage, entries: Vec<PackEntry>) -> Result<Vec<ObjectId>> {
    let mut by_offset: HashMap<usize, (ObjectType, ObjectId)> = HashMap::new();
    let mut ids = Vec::with_capacity(entries.len());
    let mut pending = Vec::new();

    for entry in entries {
        match entry.data {
            EntryData::Whole(obj_type, content) => {
                let oid = storage.write_object(&GitObject::new(obj_type, content))?;
                by_offset.insert(entry.offset, (obj_type, oid));
                ids.push(oid);
            }
            _ => pending.push(entry),
        }
    }

    // Deltas may chain, and a REF_DELTA may name a base that appears later in
    // the pack, so keep sweeping until a pass makes no progress.
    let mut stored: HashSet<ObjectId> = ids.iter().copied().collect();
    while !pending.is_empty() {
        let before = pending.len();
        let mut still_pending = Vec::new();

        for entry in pending {
            let base = match &entry.data {
                EntryData::OfsDelta { base_offset, .. } => by_offset.get(base_offset).map(|(_, oid)| *oid),
                EntryData::RefDelta { base, .. } => {
                    (stored.contains(base) || storage.has_object(base)?).then_some(*base)
                }
                EntryData::Whole(..) => None,
            };
            let Some(base_oid) = base else {
                still_pending.push(entry);
                continue;
            };

            let delta = match &entry.data {
                EntryData::OfsDelta { delta, .. } | EntryData::RefDelta { delta, .. } => delta,
                EntryData::Whole(..) => continue,
            };
            let base_obj = storage.read_object(&base_oid)?;
            let content = apply_delta(&base_obj.content, delta)?;
            let oid = storage.write_object(&GitObject::new(base_obj.obj_type, content))?;

            by_offset.insert(entry.offset, (base_obj.obj_type, oid));
            stored.insert(oid);
            ids.push(oid);
        }

        if still_pending.len() == before {
            return Err(Error::PackError(format!(
                "{} delta(s) with missing base objects",
                still_pending.len()
            )));
        }
        pending = still_pending;
    }

    debug!(objects = ids.len(), "unpacked packfile");
    Ok(ids)
}

fn read_delta_size(delta: &[u8], pos: &mut usize) -> Result<usize> {
    let mut size = 0usize;
    let mut shift = 0;
    loop {
        let byte = *delta
            .get(*pos)
            .ok_or_else(|| Error::PackError("truncated delta header".into()))?;
        *pos += 1;
        if shift >= usize::BITS {
            return Err(Error::PackError("delta size overflows".into()));
        }
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
    }
}

/// Apply a git delta (copy/insert instruction stream) to `base`
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let bad = |msg: &str| Error::PackError(format!("bad delta: {}", msg));
    let mut pos = 0;

    let source_size = read_delta_size(delta, &mut pos)?;
    if source_size != base.len() {
        return Err(bad("base size mismatch"));
    }
    let target_size = read_delta_size(delta, &mut pos)?;
    let mut out = Vec::with_capacity(target_size.min(base.len().saturating_add(delta.len())));

    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            // copy from base: bits 0-3 select offset bytes, bits 4-6 size bytes
            let mut offset = 0usize;
            let mut size = 0usize;
            for i in 0..4 {
                if cmd & (1 << i) != 0 {
                    offset |= (*delta.get(pos).ok_or_else(|| bad("truncated copy"))? as usize) << (8 * i);
                    pos += 1;
                }
            }
            for i in 0..3 {
                if cmd & (0x10 << i) != 0 {
                    size |= (*delta.get(pos).ok_or_else(|| bad("truncated copy"))? as usize) << (8 * i);
                    pos += 1;
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let chunk = offset
                .checked_add(size)
                .and_then(|end| base.get(offset..end))
                .ok_or_else(|| bad("copy out of range"))?;
            if out.len() + chunk.len() > target_size {
                return Err(bad("result exceeds declared size"));
            }
            out.extend_from_slice(chunk);
        } else if cmd != 0 {
            let len = cmd as usize;
            let chunk = delta.get(pos..pos + len).ok_or_else(|| bad("truncated insert"))?;
            if out.len() + chunk.len() > target_size {
                return Err(bad("result exceeds declared size"));
            }
            out.extend_from_slice(chunk);
            pos += len;
        } else {
            return Err(bad("reserved opcode 0"));
        }
    }

    if out.len() != target_size {
        return Err(bad("result size mismatch"));
    }
    Ok(out)
}

/// Collects what a fetching client wants minus what it has, then packs it
pub struct PackBuilder<'a> {
    storage: &'a GitStorage,
    want: Vec<ObjectId>,
    have: HashSet<ObjectId>,
}

impl<'a> PackBuilder<'a> {
    pub fn new(storage: &'a GitStorage) -> Self {
        Self {
            storage,
            want: Vec::new(),
            have: HashSet::new(),
        }
    }

    pub fn want(&mut self, oid: ObjectId) {
        self.want.push(oid);
    }

    pub fn have(&mut self, oid: ObjectId) {
        self.have.insert(oid);
    }

    /// Objects reachable from the wants, not walking past anything the client has
    pub fn collect(&self) -> Result<Vec<ObjectId>> {
        let mut needed = Vec::new();
        let mut seen: HashSet<ObjectId> = HashSet::new();
        let mut stack: Vec<ObjectId> = self.want.clone();

        while let Some(oid) = stack.pop() {
            if self.have.contains(&oid) || !seen.insert(oid) {
                continue;
            }
            if !self.storage.has_object(&oid)? {
                continue;
            }
            let obj = self.storage.read_object(&oid)?;
            stack.extend(obj.references()?);
            needed.push(oid);
        }
        Ok(needed)
    }

    pub fn build(self) -> Result<Vec<u8>> {
        let oids = self.collect()?;
        generate_packfile(self.storage, &oids)
    }
}
