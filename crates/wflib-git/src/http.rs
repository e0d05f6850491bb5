//! Smart HTTP bodies
//!
//! - GET  /info/refs?service=git-upload-pack | git-receive-pack
//! - POST /git-upload-pack
//!
//! POST /git-receive-pack is a [`crate::ReceivePack`] session. Routing,
//! authentication and status codes belong to the caller.

use flate2::read::GzDecoder;
use std::borrow::Cow;
use std::io::Read;
use std::str::FromStr;
use tracing::debug;

use crate::object::ObjectId;
use crate::pack::PackBuilder;
use crate::protocol::*;
use crate::refs::{Ref, HEAD};
use crate::storage::GitStorage;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    pub fn advertisement_content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-advertisement",
            Service::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    pub fn result_content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-result",
            Service::ReceivePack => "application/x-git-receive-pack-result",
        }
    }

    fn capabilities(&self) -> String {
        match self {
            Service::UploadPack => format_capabilities(UPLOAD_PACK_CAPABILITIES),
            Service::ReceivePack => format_capabilities(RECEIVE_PACK_CAPABILITIES),
        }
    }
}

impl FromStr for Service {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "git-upload-pack" => Ok(Service::UploadPack),
            "git-receive-pack" => Ok(Service::ReceivePack),
            other => Err(Error::ProtocolError(format!("unsupported service: {}", other))),
        }
    }
}

/// Body for GET /info/refs?service=...
///
/// `None` means the repository does not exist yet; it is advertised as empty.
pub fn advertise_refs(storage: Option<&GitStorage>, service: Service) -> Result<Vec<u8>> {
    let mut writer = PktLineWriter::new();
    writer.write_str(&format!("# service={}", service.as_str()));
    writer.flush();

    let mut caps = service.capabilities();
    let mut lines: Vec<(ObjectId, String)> = Vec::new();

    if let Some(storage) = storage {
        if service == Service::UploadPack {
            if let (Ok(oid), Ok(Ref::Symbolic(target))) =
                (storage.resolve_ref(HEAD), storage.read_ref(HEAD))
            {
                caps.push_str(&format!(" symref={}:{}", HEAD, target));
                lines.push((oid, HEAD.to_string()));
            }
        }
        for named in storage.list_refs()? {
            match named.reference {
                Ref::Direct(oid) => lines.push((oid, named.name)),
                Ref::Symbolic(_) => {
                    if let Ok(oid) = storage.resolve_ref(&named.name) {
                        lines.push((oid, named.name));
                    }
                }
            }
        }
    }

    if lines.is_empty() {
        writer.write_str(&format!("{} capabilities^{{}}\0{}", ObjectId::ZERO, caps));
    } else {
        for (i, (oid, name)) in lines.iter().enumerate() {
            if i == 0 {
                writer.write_str(&format!("{} {}\0{}", oid, name, caps));
            } else {
                writer.write_str(&format!("{} {}", oid, name));
            }
        }
    }
    writer.flush();
    Ok(writer.into_bytes())
}

/// Largest request body accepted after undoing `Content-Encoding`
pub const MAX_DECODED_REQUEST: u64 = 1 << 30;

/// Undo a request's `Content-Encoding`.
///
/// Stock git gzips upload-pack requests larger than 1 KiB, which happens as
/// soon as a fetch sends a few dozen wants or haves.
pub fn decode_request_body<'a>(content_encoding: Option<&str>, body: &'a [u8]) -> Result<Cow<'a, [u8]>> {
    match content_encoding.map(str::trim) {
        None | Some("") => Ok(Cow::Borrowed(body)),
        Some(enc) if enc.eq_ignore_ascii_case("identity") => Ok(Cow::Borrowed(body)),
        Some(enc) if enc.eq_ignore_ascii_case("gzip") || enc.eq_ignore_ascii_case("x-gzip") => {
            let mut out = Vec::new();
            GzDecoder::new(body)
                .take(MAX_DECODED_REQUEST + 1)
                .read_to_end(&mut out)
                .map_err(|e| Error::ProtocolError(format!("bad gzip request body: {}", e)))?;
            if out.len() as u64 > MAX_DECODED_REQUEST {
                return Err(Error::ProtocolError("request body too large".into()));
            }
            debug!(compressed = body.len(), decoded = out.len(), "inflated gzip request");
            Ok(Cow::Owned(out))
        }
        Some(other) => Err(Error::ProtocolError(format!("unsupported content encoding: {}", other))),
    }
}

#[derive(Debug, Default)]
struct UploadRequest {
    wants: Vec<ObjectId>,
    haves: Vec<ObjectId>,
    capabilities: Vec<String>,
    done: bool,
}

impl UploadRequest {
    fn parse(body: &[u8]) -> Result<Self> {
        let mut request = UploadRequest::default();
        let mut reader = PktLineReader::new(body);

        loop {
            let pkt = match reader.read()? {
                None => break,
                Some(PktLine::Data(data)) => data,
                Some(_) => continue,
            };
            let line = std::str::from_utf8(pkt)
                .map_err(|_| Error::ProtocolError("invalid utf8".into()))?
                .trim_end_matches('\n');

            if let Some(rest) = line.strip_prefix("want ") {
                let (hex, caps) = match rest.split_once(|c: char| c == ' ' || c == '\0') {
                    Some((hex, caps)) => (hex, Some(caps)),
                    None => (rest, None),
                };
                if request.wants.is_empty() {
                    if let Some(caps) = caps {
                        request.capabilities = parse_capabilities(caps);
                    }
                }
                request.wants.push(parse_oid(hex)?);
            } else if let Some(hex) = line.strip_prefix("have ") {
                request.haves.push(parse_oid(hex)?);
            } else if line == "done" {
                request.done = true;
                break;
            }
            // shallow/deepen/filter lines are not negotiated
        }
        Ok(request)
    }
}

fn parse_oid(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex.trim()).ok_or_else(|| Error::ProtocolError(format!("invalid object id: {}", hex)))
}

/// Body for POST /git-upload-pack, single-ack negotiation.
///
/// Without `done` the reply is the acknowledgement only, and the client comes
/// back with a longer request. With `done` the pack follows.
pub fn upload_pack(storage: &GitStorage, body: &[u8]) -> Result<Vec<u8>> {
    let request = UploadRequest::parse(body)?;
    let mut writer = PktLineWriter::new();

    if request.wants.is_empty() {
        return Ok(writer.into_bytes());
    }
    for want in &request.wants {
        if !storage.has_object(want)? {
            return Err(Error::ProtocolError(format!("not our ref {}", want)));
        }
    }

    let mut common = Vec::new();
    for have in &request.haves {
        if storage.has_object(have)? {
            common.push(*have);
        }
    }
    match common.first() {
        Some(first) => writer.write_str(&format!("ACK {}", first)),
        None => writer.write_str("NAK"),
    }
    if !request.done {
        return Ok(writer.into_bytes());
    }

    let mut builder = PackBuilder::new(storage);
    for want in &request.wants {
        builder.want(*want);
    }
    for have in common {
        builder.have(have);
    }
    let pack = builder.build()?;
    debug!(wants = request.wants.len(), pack_bytes = pack.len(), "upload-pack response");

    match sideband_limit(&request.capabilities) {
        Some(max_data) => {
            writer.write_sideband(sideband::DATA, &pack, max_data);
            writer.flush();
            Ok(writer.into_bytes())
        }
        None => {
            let mut out = writer.into_bytes();
            out.extend_from_slice(&pack);
            Ok(out)
        }
    }
}
