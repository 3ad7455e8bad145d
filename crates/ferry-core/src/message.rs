//! Control-plane messages exchanged between peers and the directory.
//!
//! Every message is a block of `\r\n`-separated lines whose first line is
//! the verb. Anything whose verb is not recognised parses as `Other` and is
//! passed through untouched.

use crate::wire::{
    format_address, parse_address, parse_lines, FileId, SocketId, WireError, MAX_MESSAGE_LEN,
    NULL_FIELD,
};

/// Verbs understood by peers and the directory.
pub mod verb {
    pub const LIST: &str = "list";
    pub const ADD_FILES: &str = "addFiles";
    pub const GET_FILE: &str = "getFile";
    pub const GET_FILE_FOR_TRANSFER: &str = "getFileForTransfer";
    pub const FILE_ADDRESS: &str = "fileAddress";
    pub const INITIATE_FILE_TRANSFER: &str = "initiateFileTransfer";
    pub const FILE_REQUEST: &str = "fileRequest";
}

pub const LINE_BREAK: &str = "\r\n";

/// Sent to a connection refused because the table is full.
pub const BUSY_MESSAGE: &str = "Server is too busy, please try again later\r\n";

/// `list` response when the registry is empty.
pub const NO_FILES_MESSAGE: &str = "\r\nThere are currently no files stored on the server.\r\n";

/// Heading of a non-empty `list` response.
pub const LISTING_HEADING: &str = "\r\nFile Listing:\r\n";

/// Largest `addFiles` text a peer sends in one message. Half the receive
/// cap, so a batch never comes near the point where the directory hangs up.
pub const ADD_FILES_BUDGET: usize = MAX_MESSAGE_LEN / 2;

/// A file a peer offers to share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub name: String,
    pub size: u64,
    /// Path on the owner's machine. Only the owner ever opens it.
    pub path: String,
}

/// Where a requested file can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub file_id: FileId,
    pub host: String,
    pub port: u16,
    pub name: Option<String>,
    pub size: Option<u64>,
}

/// Instruction to the owner to stream a file to one of its sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOrder {
    pub file_id: FileId,
    pub socket_id: SocketId,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    List,
    AddFiles {
        host: String,
        port: u16,
        files: Vec<FileOffer>,
    },
    GetFile {
        file_id: FileId,
    },
    GetFileForTransfer {
        file_id: FileId,
        socket_id: SocketId,
    },
    /// `None` is the directory's "no such file" answer.
    FileAddress(Option<FileLocation>),
    /// `None` is the directory's refusal to resolve a path.
    InitiateFileTransfer(Option<TransferOrder>),
    FileRequest {
        file_id: FileId,
    },
    Other(String),
}

impl Message {
    /// Parse a complete control message.
    ///
    /// A recognised verb with missing or invalid fields is an error. Bad
    /// file lines inside `addFiles` are skipped rather than failing the whole
    /// message.
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let lines = parse_lines(text);
        let Some(first) = lines.first() else {
            return Ok(Message::Other(text.to_string()));
        };
        let rest = &lines[1..];

        match first.as_str() {
            verb::LIST => Ok(Message::List),
            verb::ADD_FILES => parse_add_files(rest),
            verb::GET_FILE => Ok(Message::GetFile {
                file_id: numeric(verb::GET_FILE, rest.first(), "file id")?,
            }),
            verb::GET_FILE_FOR_TRANSFER => Ok(Message::GetFileForTransfer {
                file_id: tagged(verb::GET_FILE_FOR_TRANSFER, rest.first(), "file")?,
                socket_id: tagged(verb::GET_FILE_FOR_TRANSFER, rest.get(1), "socket")?,
            }),
            verb::FILE_ADDRESS => parse_file_address(rest),
            verb::INITIATE_FILE_TRANSFER => parse_transfer_order(rest),
            verb::FILE_REQUEST => Ok(Message::FileRequest {
                file_id: numeric(verb::FILE_REQUEST, rest.first(), "file id")?,
            }),
            _ => Ok(Message::Other(text.to_string())),
        }
    }

    /// Verb this message is sent under, if it has one.
    pub fn verb(&self) -> Option<&'static str> {
        match self {
            Message::List => Some(verb::LIST),
            Message::AddFiles { .. } => Some(verb::ADD_FILES),
            Message::GetFile { .. } => Some(verb::GET_FILE),
            Message::GetFileForTransfer { .. } => Some(verb::GET_FILE_FOR_TRANSFER),
            Message::FileAddress(_) => Some(verb::FILE_ADDRESS),
            Message::InitiateFileTransfer(_) => Some(verb::INITIATE_FILE_TRANSFER),
            Message::FileRequest { .. } => Some(verb::FILE_REQUEST),
            Message::Other(_) => None,
        }
    }

    /// Render the message text, without the wire terminator.
    pub fn encode(&self) -> String {
        match self {
            Message::List => verb::LIST.to_string(),
            Message::AddFiles { host, port, files } => {
                let mut out = format!("{}{LINE_BREAK}{}", verb::ADD_FILES, format_address(host, *port));
                for file in files {
                    out.push_str(LINE_BREAK);
                    out.push_str(&offer_line(file));
                }
                out
            }
            Message::GetFile { file_id } => format!("{}{LINE_BREAK}{file_id}", verb::GET_FILE),
            Message::GetFileForTransfer { file_id, socket_id } => format!(
                "{}{LINE_BREAK}file:{file_id}{LINE_BREAK}socket:{socket_id}",
                verb::GET_FILE_FOR_TRANSFER
            ),
            Message::FileAddress(None) => {
                format!("{}{LINE_BREAK}{NULL_FIELD}{LINE_BREAK}{NULL_FIELD}", verb::FILE_ADDRESS)
            }
            Message::FileAddress(Some(loc)) => {
                let mut out = format!(
                    "{}{LINE_BREAK}{}{LINE_BREAK}{}",
                    verb::FILE_ADDRESS,
                    loc.file_id,
                    format_address(&loc.host, loc.port)
                );
                if let Some(name) = &loc.name {
                    out.push_str(&format!("{LINE_BREAK}{name}{LINE_BREAK}{}", loc.size.unwrap_or(0)));
                }
                out
            }
            Message::InitiateFileTransfer(None) => format!(
                "{}{LINE_BREAK}{NULL_FIELD}{LINE_BREAK}{NULL_FIELD}{LINE_BREAK}{NULL_FIELD}",
                verb::INITIATE_FILE_TRANSFER
            ),
            Message::InitiateFileTransfer(Some(order)) => format!(
                "{}{LINE_BREAK}file:{}{LINE_BREAK}socket:{}{LINE_BREAK}{}",
                verb::INITIATE_FILE_TRANSFER,
                order.file_id,
                order.socket_id,
                order.path
            ),
            Message::FileRequest { file_id } => {
                format!("{}{LINE_BREAK}{file_id}", verb::FILE_REQUEST)
            }
            Message::Other(text) => text.clone(),
        }
    }
}

/// Split `files` into `addFiles` messages whose text stays within `budget`
/// bytes, keeping their order. An offer too long to share a message with
/// others goes out alone.
pub fn add_files_batches(host: &str, port: u16, files: Vec<FileOffer>, budget: usize) -> Vec<Message> {
    let head = verb::ADD_FILES.len() + LINE_BREAK.len() + format_address(host, port).len();
    let batch = |files: Vec<FileOffer>| Message::AddFiles {
        host: host.to_string(),
        port,
        files,
    };

    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut used = head;
    for file in files {
        let line = LINE_BREAK.len() + offer_line(&file).len();
        if !current.is_empty() && used + line > budget {
            batches.push(batch(std::mem::take(&mut current)));
            used = head;
        }
        used += line;
        current.push(file);
    }
    if !current.is_empty() {
        batches.push(batch(current));
    }
    batches
}

fn offer_line(file: &FileOffer) -> String {
    format!("{}\t{}\t{}", file.name, file.size, file.path)
}

/// `<N> files successfully added to file listing.`
pub fn files_added_message(count: usize) -> String {
    format!("{count} files successfully added to file listing.")
}

// ── Field helpers ────────────────────────────────────────────────────────────

fn malformed(verb: &'static str, reason: impl Into<String>) -> WireError {
    WireError::Malformed {
        verb,
        reason: reason.into(),
    }
}

fn numeric<T: std::str::FromStr>(
    verb: &'static str,
    line: Option<&String>,
    what: &str,
) -> Result<T, WireError> {
    let line = line.ok_or_else(|| malformed(verb, format!("missing {what}")))?;
    line.parse()
        .map_err(|_| malformed(verb, format!("{what} is not a number: {line:?}")))
}

/// Parse a `tag:value` line such as `socket:7`.
fn tagged<T: std::str::FromStr>(
    verb: &'static str,
    line: Option<&String>,
    tag: &str,
) -> Result<T, WireError> {
    let line = line.ok_or_else(|| malformed(verb, format!("missing {tag} field")))?;
    match line.split_once(':') {
        Some((t, value)) if t.trim() == tag => value
            .trim()
            .parse()
            .map_err(|_| malformed(verb, format!("{tag} is not a number: {value:?}"))),
        _ => Err(malformed(verb, format!("expected {tag}:<n>, got {line:?}"))),
    }
}

fn is_null(line: Option<&String>) -> bool {
    match line {
        Some(line) => {
            line == NULL_FIELD
                || line
                    .split_once(':')
                    .is_some_and(|(_, value)| value.trim() == NULL_FIELD)
        }
        None => false,
    }
}

fn parse_add_files(rest: &[String]) -> Result<Message, WireError> {
    let owner = rest
        .first()
        .ok_or_else(|| malformed(verb::ADD_FILES, "missing owner address"))?;
    let (host, port) = parse_address(owner)?;

    let files = rest[1..]
        .iter()
        .filter_map(|line| parse_offer(line))
        .collect();
    Ok(Message::AddFiles { host, port, files })
}

fn parse_offer(line: &str) -> Option<FileOffer> {
    let mut fields = line.splitn(3, '\t');
    let name = fields.next()?.trim();
    let size = fields.next()?.trim().parse().ok()?;
    let path = fields.next()?.trim();
    if name.is_empty() || path.is_empty() {
        return None;
    }
    Some(FileOffer {
        name: name.to_string(),
        size,
        path: path.to_string(),
    })
}

fn parse_file_address(rest: &[String]) -> Result<Message, WireError> {
    if is_null(rest.first()) || is_null(rest.get(1)) {
        return Ok(Message::FileAddress(None));
    }
    let file_id = numeric(verb::FILE_ADDRESS, rest.first(), "file id")?;
    let addr = rest
        .get(1)
        .ok_or_else(|| malformed(verb::FILE_ADDRESS, "missing owner address"))?;
    let (host, port) = parse_address(addr)?;
    let name = rest.get(2).filter(|n| !n.is_empty()).cloned();
    let size = rest.get(3).and_then(|s| s.parse().ok());
    Ok(Message::FileAddress(Some(FileLocation {
        file_id,
        host,
        port,
        name,
        size,
    })))
}

fn parse_transfer_order(rest: &[String]) -> Result<Message, WireError> {
    if is_null(rest.first()) || is_null(rest.get(1)) || is_null(rest.get(2)) {
        return Ok(Message::InitiateFileTransfer(None));
    }
    let file_id = tagged(verb::INITIATE_FILE_TRANSFER, rest.first(), "file")?;
    let socket_id = tagged(verb::INITIATE_FILE_TRANSFER, rest.get(1), "socket")?;
    let path = rest
        .get(2)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| malformed(verb::INITIATE_FILE_TRANSFER, "missing path"))?;
    Ok(Message::InitiateFileTransfer(Some(TransferOrder {
        file_id,
        socket_id,
        path: path.clone(),
    })))
}
