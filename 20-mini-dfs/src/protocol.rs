//! Wire protocol shared by every connection.
//!
//! Each connection opens with one JSON line carrying the sender's
//! [`NodeIdentity`]. After that both sides exchange bare text lines: verb
//! lines towards a node, single status or data lines back. Payload newlines
//! travel escaped as `\n` so a reply always fits on one line.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DfsError, DfsResult};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub const HEARTBEAT: &str = "heartbeat";
pub const HEARTBEAT_ACK: &str = "Heartbeat was received.";

/// Verbs the coordinator sends to a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Write,
    Append,
    Head,
    Tail,
    Remove,
    Info,
    Shutdown,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Write => "write",
            Verb::Append => "append",
            Verb::Head => "head",
            Verb::Tail => "tail",
            Verb::Remove => "remove",
            Verb::Info => "sysinfo",
            Verb::Shutdown => "shutdown",
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        let verb = match word {
            "create" => Verb::Create,
            "write" => Verb::Write,
            "append" => Verb::Append,
            "head" => Verb::Head,
            "tail" => Verb::Tail,
            "remove" => Verb::Remove,
            "sysinfo" | "info" => Verb::Info,
            "shutdown" => Verb::Shutdown,
            _ => return None,
        };
        Some(verb)
    }

    /// Whether the dispatcher waits for a reply. Data-carrying verbs are
    /// fire-and-forget.
    pub fn awaits_reply(self) -> bool {
        !matches!(self, Verb::Create | Verb::Write | Verb::Append)
    }

    /// Whether the storage node hangs up after answering this verb.
    pub fn closes_connection(self) -> bool {
        self.awaits_reply()
    }

    fn takes_path(self) -> bool {
        !matches!(self, Verb::Info | Verb::Shutdown)
    }

    fn takes_data(self) -> bool {
        matches!(self, Verb::Write | Verb::Append)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One verb line sent from the coordinator to a storage node:
/// `<verb> [path] [data]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRequest {
    pub verb: Verb,
    pub path: Option<String>,
    pub data: Option<String>,
}

impl StorageRequest {
    pub fn new(verb: Verb, path: Option<String>, data: Option<String>) -> Self {
        Self { verb, path, data }
    }

    pub fn encode(&self) -> String {
        let mut line = self.verb.as_str().to_string();
        for part in [&self.path, &self.data].into_iter().flatten() {
            line.push(' ');
            line.push_str(part);
        }
        line
    }

    pub fn parse(line: &str) -> DfsResult<Self> {
        let line = line.trim_end_matches(LINE_ENDINGS);
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        let verb = Verb::from_word(word).ok_or_else(|| DfsError::UnknownCommand(line.to_string()))?;

        if !verb.takes_path() {
            return Ok(Self::new(verb, None, None));
        }

        let rest = rest.trim_start();
        if verb.takes_data() {
            let Some((path, data)) = rest.split_once(' ') else {
                return Err(DfsError::Usage("<write|append> <path> <data>"));
            };
            return Ok(Self::new(verb, Some(path.to_string()), Some(data.to_string())));
        }

        let path = rest.trim();
        if path.is_empty() {
            return Err(DfsError::Usage("<create|head|tail|remove> <path>"));
        }
        Ok(Self::new(verb, Some(path.to_string()), None))
    }
}

pub fn heartbeat_line(id: u64) -> String {
    format!("{HEARTBEAT} {id}")
}

/// Turns literal `\n` sequences typed by a user into real newlines.
pub fn decode_payload(data: &str) -> String {
    data.replace("\\n", "\n")
}

/// Inverse of [`decode_payload`], applied to data replies.
pub fn encode_payload(data: &str) -> String {
    data.replace("\r\n", "\\n").replace('\n', "\\n")
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    while let Some(line) = read_line(reader).await? {
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line).map(Some).map_err(to_io_error);
    }
    Ok(None)
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// Reads the next line without its terminator. An empty line is a valid
/// reply (an empty file read), so only EOF yields `None`.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Bounds an I/O future, turning an expired deadline into `TimedOut`.
pub async fn within<T, F>(limit: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no response within {limit:?}"),
        )),
    }
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
