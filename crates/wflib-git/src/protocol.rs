//! pkt-line framing
//!
//! Every git protocol message is a 4 hex digit length (which counts itself)
//! followed by the payload. `0000` is a flush packet.

use crate::{Error, Result};

pub const FLUSH_PKT: &[u8] = b"0000";

/// Largest pkt-line git will send: 65516 payload bytes + 4 length bytes
pub const MAX_PKT_LINE: usize = 65520;

/// Largest side-band-64k payload (one byte goes to the band number)
pub const MAX_SIDEBAND_DATA: usize = MAX_PKT_LINE - 4 - 1;

/// Payload limit under legacy `side-band`, whose packets stop at 1000 bytes
pub const MAX_SIDEBAND_SMALL_DATA: usize = 1000 - 4 - 1;

pub fn pkt_line(data: &[u8]) -> Vec<u8> {
    let mut pkt = format!("{:04x}", data.len() + 4).into_bytes();
    pkt.extend_from_slice(data);
    pkt
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine<'a> {
    Flush,
    Delimiter,
    ResponseEnd,
    Data(&'a [u8]),
}

/// Reads pkt-lines off the front of a request body
pub struct PktLineReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PktLineReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Next pkt-line, or `None` once the buffer is exhausted
    pub fn read(&mut self) -> Result<Option<PktLine<'a>>> {
        let Some(header) = self.data.get(self.pos..self.pos + 4) else {
            return Ok(None);
        };
        let len = std::str::from_utf8(header)
            .ok()
            .and_then(|h| usize::from_str_radix(h, 16).ok())
            .ok_or_else(|| Error::ProtocolError("invalid pkt-line length".into()))?;

        let special = match len {
            0 => Some(PktLine::Flush),
            1 => Some(PktLine::Delimiter),
            2 => Some(PktLine::ResponseEnd),
            3 => return Err(Error::ProtocolError("pkt-line length too small".into())),
            _ => None,
        };
        if let Some(pkt) = special {
            self.pos += 4;
            return Ok(Some(pkt));
        }

        if len > MAX_PKT_LINE {
            return Err(Error::ProtocolError("pkt-line too large".into()));
        }
        let payload = self
            .data
            .get(self.pos + 4..self.pos + len)
            .ok_or_else(|| Error::ProtocolError("pkt-line truncated".into()))?;
        self.pos += len;
        Ok(Some(PktLine::Data(payload)))
    }

    /// Data lines up to the next flush, as trimmed text
    pub fn read_text_until_flush(&mut self) -> Result<Vec<&'a str>> {
        let mut lines = Vec::new();
        loop {
            match self.read()? {
                None | Some(PktLine::Flush) | Some(PktLine::ResponseEnd) => break,
                Some(PktLine::Delimiter) => continue,
                Some(PktLine::Data(data)) => {
                    let line = std::str::from_utf8(data)
                        .map_err(|_| Error::ProtocolError("invalid utf8".into()))?;
                    lines.push(line.trim_end_matches('\n'));
                }
            }
        }
        Ok(lines)
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// Accumulates a pkt-line response body
#[derive(Default)]
pub struct PktLineWriter {
    buffer: Vec<u8>,
}

impl PktLineWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(&pkt_line(data));
    }

    /// Text line, newline-terminated as git expects
    pub fn write_str(&mut self, s: &str) {
        self.write(format!("{}\n", s).as_bytes());
    }

    /// Split `data` over as many side-band packets on `band` as needed,
    /// at most `max_data` payload bytes each
    pub fn write_sideband(&mut self, band: u8, data: &[u8], max_data: usize) {
        for chunk in data.chunks(max_data) {
            let mut payload = Vec::with_capacity(chunk.len() + 1);
            payload.push(band);
            payload.extend_from_slice(chunk);
            self.write(&payload);
        }
    }

    pub fn flush(&mut self) {
        self.buffer.extend_from_slice(FLUSH_PKT);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

pub const UPLOAD_PACK_CAPABILITIES: &[&str] = &[
    "side-band-64k",
    "ofs-delta",
    "no-progress",
    "allow-tip-sha1-in-want",
    "allow-reachable-sha1-in-want",
];

pub const RECEIVE_PACK_CAPABILITIES: &[&str] =
    &["report-status", "delete-refs", "side-band-64k", "ofs-delta", "quiet"];

pub fn format_capabilities(caps: &[&str]) -> String {
    caps.join(" ")
}

/// Capabilities a client sent after the NUL of its first command/want line
pub fn parse_capabilities(caps: &str) -> Vec<String> {
    caps.split_whitespace().map(str::to_string).collect()
}

/// Payload limit for the side-band flavour in `capabilities`, or `None` when
/// the client did not ask for side-band
pub fn sideband_limit(capabilities: &[String]) -> Option<usize> {
    if capabilities.iter().any(|c| c == "side-band-64k") {
        Some(MAX_SIDEBAND_DATA)
    } else if capabilities.iter().any(|c| c == "side-band") {
        Some(MAX_SIDEBAND_SMALL_DATA)
    } else {
        None
    }
}

/// Side-band channels
pub mod sideband {
    pub const DATA: u8 = 1;
    pub const PROGRESS: u8 = 2;
    pub const ERROR: u8 = 3;
}
