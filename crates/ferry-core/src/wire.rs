//! ferry wire format: line parsing, addresses, chunk headers, and framing.
//!
//! A connection carries two kinds of frames back to back:
//!
//!   - control messages: UTF-8 text, lines separated by `\r\n`, terminated
//!     by a single NUL byte
//!   - chunk frames: a 63-byte fixed-width text header followed by exactly
//!     `payload_len` raw bytes
//!
//! The header layout is `"%12s\r\n%10d\t%5d\t%10d\t%10d\t%8s\r\n"`. Every
//! width is part of the protocol; values that do not fit are rejected, never
//! truncated.

use bytes::{Buf, Bytes, BytesMut};

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Server-assigned file identifier. Monotonic, starts at 1.
pub type FileId = u32;

/// Connection identifier, unique for the lifetime of a node.
pub type SocketId = u32;

// ── Constants ────────────────────────────────────────────────────────────────

/// Verb that opens every chunk frame.
pub const CHUNK_VERB: &str = "fileTransfer";

/// Total chunk header size in bytes.
pub const HEADER_SIZE: usize = 63;

const VERB_WIDTH: usize = 12;
const FILE_ID_WIDTH: usize = 10;
const PAYLOAD_WIDTH: usize = 5;
const COUNT_WIDTH: usize = 10;
const CHECKSUM_WIDTH: usize = 8;

/// Bytes every chunk frame starts with: the right-aligned verb and its line break.
const CHUNK_PREFIX: &[u8] = b"fileTransfer\r\n";

/// Default number of payload bytes carried by one chunk.
pub const DEFAULT_CHUNK_CAPACITY: usize = 449;

/// Largest payload length the 5-character field can express.
pub const MAX_PAYLOAD_FIELD: usize = 99_999;

/// Most chunks one file may be split into. Bounds what a receiver allocates
/// and walks for a single header; at the default capacity this is about 4 GiB.
pub const MAX_TOTAL_CHUNKS: u32 = 10_000_000;

/// Width of the protocol's filename field.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Terminates every control message on the wire.
pub const MESSAGE_TERMINATOR: u8 = 0;

/// Largest control message a peer may buffer before the connection is dropped.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Checksum written by senders that do not compute one. Skips verification.
pub const CHECKSUM_PLACEHOLDER: &str = "hash";

/// Sentinel for "no such value" in protocol responses.
pub const NULL_FIELD: &str = "NULL";

// ── Lines and addresses ──────────────────────────────────────────────────────

/// Split a control message into trimmed lines.
///
/// Interior empty lines are kept as `""`; a trailing newline does not add a
/// final empty line, and empty input yields no lines at all.
pub fn parse_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| trim_protocol_whitespace(line).to_string())
        .collect()
}

fn trim_protocol_whitespace(s: &str) -> &str {
    s.trim_matches(|c| matches!(c, ' ' | '\r' | '\n' | '\t'))
}

/// Parse `host:port`. Anything else, including the `NULL` sentinel, is
/// a malformed address and must be treated as "no address" by the caller.
pub fn parse_address(text: &str) -> Result<(String, u16), WireError> {
    let text = trim_protocol_whitespace(text);
    let malformed = || WireError::MalformedAddress(text.to_string());

    let (host, port) = text.rsplit_once(':').ok_or_else(malformed)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || host == NULL_FIELD {
        return Err(malformed());
    }
    let port = port.parse::<u16>().map_err(|_| malformed())?;
    Ok((host.to_string(), port))
}

/// Format an address the way `parse_address` reads it back.
pub fn format_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

// ── Filenames ────────────────────────────────────────────────────────────────

/// Fit a filename into a field of `width` bytes.
///
/// Long names keep their final extension and lose the end of the stem, so
/// the result is exactly `width` bytes for ASCII input. Names without an
/// extension are cut plainly. This is lossy: two long names sharing a prefix
/// and extension truncate to the same string.
pub fn truncate_filename(name: &str, width: usize) -> String {
    if name.len() <= width {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() + 1 < width => {
            let keep = width - 1 - ext.len();
            format!("{}.{}", prefix_within(stem, keep), ext)
        }
        _ => prefix_within(name, width).to_string(),
    }
}

fn prefix_within(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── Chunk Header ─────────────────────────────────────────────────────────────

/// Header preceding every chunk payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub file_id: FileId,
    /// True byte count of the payload that follows.
    pub payload_len: u32,
    pub total_chunks: u32,
    /// 1-based position of this chunk.
    pub index: u32,
    /// Eight hex characters of the payload digest, or `CHECKSUM_PLACEHOLDER`.
    pub checksum: String,
}

impl ChunkHeader {
    /// Build the header for one payload, computing its checksum.
    pub fn for_payload(file_id: FileId, total_chunks: u32, index: u32, payload: &[u8]) -> Self {
        Self {
            file_id,
            payload_len: payload.len() as u32,
            total_chunks,
            index,
            checksum: chunk_checksum(payload),
        }
    }

    /// Check the structural invariants against the receiver's chunk capacity.
    pub fn validate(&self, capacity: usize) -> Result<(), WireError> {
        self.check_position()?;
        if self.payload_len as usize > capacity {
            return Err(WireError::PayloadTooLarge {
                len: self.payload_len as usize,
                capacity,
            });
        }
        Ok(())
    }

    /// The index lies in `1..=total_chunks` and the total is one a receiver
    /// will track.
    pub fn check_position(&self) -> Result<(), WireError> {
        if self.total_chunks > MAX_TOTAL_CHUNKS {
            return Err(WireError::TooManyChunks {
                total: self.total_chunks,
                max: MAX_TOTAL_CHUNKS,
            });
        }
        if self.index == 0 || self.index > self.total_chunks {
            return Err(WireError::ChunkIndexOutOfRange {
                index: self.index,
                total: self.total_chunks,
            });
        }
        Ok(())
    }

    /// Does `payload` match the checksum carried in this header?
    pub fn verify(&self, payload: &[u8]) -> bool {
        self.checksum == CHECKSUM_PLACEHOLDER || self.checksum == chunk_checksum(payload)
    }
}

/// Short payload digest: the first four bytes of BLAKE3, hex encoded.
pub fn chunk_checksum(payload: &[u8]) -> String {
    hex::encode(&blake3::hash(payload).as_bytes()[..4])
}

fn check_width(field: &'static str, value: u64, width: usize) -> Result<(), WireError> {
    let rendered = value.to_string();
    if rendered.len() > width {
        return Err(WireError::FieldOverflow {
            field,
            value: rendered,
            width,
        });
    }
    Ok(())
}

/// Render a header into its fixed 63-byte form.
pub fn format_chunk_header(header: &ChunkHeader) -> Result<[u8; HEADER_SIZE], WireError> {
    check_width("file id", header.file_id as u64, FILE_ID_WIDTH)?;
    check_width("payload length", header.payload_len as u64, PAYLOAD_WIDTH)?;
    check_width("total chunks", header.total_chunks as u64, COUNT_WIDTH)?;
    check_width("chunk index", header.index as u64, COUNT_WIDTH)?;
    if header.index == 0 || header.index > header.total_chunks {
        return Err(WireError::ChunkIndexOutOfRange {
            index: header.index,
            total: header.total_chunks,
        });
    }

    let checksum = header.checksum.as_str();
    if checksum.is_empty()
        || !checksum.is_ascii()
        || checksum.contains(char::is_whitespace)
        || checksum.len() > CHECKSUM_WIDTH
    {
        return Err(WireError::FieldOverflow {
            field: "checksum",
            value: checksum.to_string(),
            width: CHECKSUM_WIDTH,
        });
    }

    let text = format!(
        "{:>vw$}\r\n{:>fw$}\t{:>pw$}\t{:>cw$}\t{:>cw$}\t{:>sw$}\r\n",
        CHUNK_VERB,
        header.file_id,
        header.payload_len,
        header.total_chunks,
        header.index,
        checksum,
        vw = VERB_WIDTH,
        fw = FILE_ID_WIDTH,
        pw = PAYLOAD_WIDTH,
        cw = COUNT_WIDTH,
        sw = CHECKSUM_WIDTH,
    );

    let mut out = [0u8; HEADER_SIZE];
    out.copy_from_slice(text.as_bytes());
    Ok(out)
}

/// Parse the first `HEADER_SIZE` bytes of `bytes` as a chunk header.
pub fn parse_chunk_header(bytes: &[u8]) -> Result<ChunkHeader, WireError> {
    if bytes.len() < HEADER_SIZE {
        return Err(WireError::TruncatedHeader(bytes.len()));
    }
    let raw = &bytes[..HEADER_SIZE];
    if !raw.is_ascii() {
        return Err(header_error("header is not ASCII"));
    }
    if &raw[12..14] != b"\r\n"
        || raw[24] != b'\t'
        || raw[30] != b'\t'
        || raw[41] != b'\t'
        || raw[52] != b'\t'
        || &raw[61..63] != b"\r\n"
    {
        return Err(header_error("field separators out of place"));
    }

    // ASCII checked above, so every byte offset is a char boundary.
    let text = std::str::from_utf8(raw).map_err(|_| header_error("header is not ASCII"))?;
    if text[0..12].trim() != CHUNK_VERB {
        return Err(header_error("unexpected verb"));
    }

    let header = ChunkHeader {
        file_id: numeric_field(&text[14..24], "file id")?,
        payload_len: numeric_field(&text[25..30], "payload length")?,
        total_chunks: numeric_field(&text[31..41], "total chunks")?,
        index: numeric_field(&text[42..52], "chunk index")?,
        checksum: text[53..61].trim().to_string(),
    };
    if header.checksum.is_empty() {
        return Err(header_error("missing checksum"));
    }
    header.check_position()?;
    Ok(header)
}

fn numeric_field(field: &str, name: &str) -> Result<u32, WireError> {
    field
        .trim()
        .parse::<u32>()
        .map_err(|_| header_error(&format!("{name} is not a number: {:?}", field.trim())))
}

fn header_error(reason: &str) -> WireError {
    WireError::Malformed {
        verb: CHUNK_VERB,
        reason: reason.to_string(),
    }
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// One complete unit read off a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Chunk { header: ChunkHeader, payload: Bytes },
}

/// Encode a control message: its bytes followed by the terminator.
/// Embedded NUL bytes cannot be represented and are dropped.
pub fn encode_message(text: &str) -> Vec<u8> {
    let mut out: Vec<u8> = text
        .bytes()
        .filter(|b| *b != MESSAGE_TERMINATOR)
        .collect();
    out.push(MESSAGE_TERMINATOR);
    out
}

/// Encode a chunk frame: header immediately followed by the payload.
pub fn encode_chunk(header: &ChunkHeader, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if header.payload_len as usize != payload.len() {
        return Err(WireError::Malformed {
            verb: CHUNK_VERB,
            reason: format!(
                "header declares {} bytes, payload has {}",
                header.payload_len,
                payload.len()
            ),
        });
    }
    let head = format_chunk_header(header)?;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&head);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Incremental decoder for one connection's byte stream.
///
/// Feed it whatever the socket returned and call `decode` until it yields
/// `None`. Chunk frames are read by exact length, so the sender never has to
/// pace its writes.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameDecoder {
    /// `max_payload` is the largest chunk payload this side accepts.
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(HEADER_SIZE + max_payload),
            max_payload,
        }
    }

    /// Buffer for the reader to fill directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// An error means the stream can no longer be resynchronised and the
    /// connection should be dropped.
    pub fn decode(&mut self) -> Result<Option<Frame>, WireError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let seen = self.buf.len().min(CHUNK_PREFIX.len());
        if self.buf[..seen] == CHUNK_PREFIX[..seen] {
            if self.buf.len() < HEADER_SIZE {
                return Ok(None);
            }
            let header = parse_chunk_header(&self.buf[..HEADER_SIZE])?;
            header.validate(self.max_payload)?;
            let payload_len = header.payload_len as usize;
            if self.buf.len() < HEADER_SIZE + payload_len {
                return Ok(None);
            }
            self.buf.advance(HEADER_SIZE);
            let payload = self.buf.split_to(payload_len).freeze();
            return Ok(Some(Frame::Chunk { header, payload }));
        }

        match self.buf.iter().position(|b| *b == MESSAGE_TERMINATOR) {
            Some(end) => {
                let raw = self.buf.split_to(end);
                self.buf.advance(1);
                Ok(Some(Frame::Text(String::from_utf8_lossy(&raw).into_owned())))
            }
            None if self.buf.len() > MAX_MESSAGE_LEN => {
                Err(WireError::MessageTooLarge(self.buf.len()))
            }
            None => Ok(None),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed address: {0:?}")]
    MalformedAddress(String),

    #[error("malformed {verb} message: {reason}")]
    Malformed { verb: &'static str, reason: String },

    #[error("{field} {value:?} does not fit in {width} characters")]
    FieldOverflow {
        field: &'static str,
        value: String,
        width: usize,
    },

    #[error("chunk index {index} outside 1..={total}")]
    ChunkIndexOutOfRange { index: u32, total: u32 },

    #[error("chunk total {total} exceeds the limit of {max}")]
    TooManyChunks { total: u32, max: u32 },

    #[error("payload length {len} exceeds chunk capacity {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("chunk header needs 63 bytes, got {0}")]
    TruncatedHeader(usize),

    #[error("control message exceeds 64 KiB ({0} bytes buffered)")]
    MessageTooLarge(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────
