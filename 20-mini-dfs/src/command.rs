//! Parsing of the line commands a client sends to the coordinator.

use crate::error::{DfsError, DfsResult};

pub const HELP: &[&str] = &[
    "The available commands are:",
    "list [prefix]\tlist directories and their files",
    "save\tsave the current namespace to disk",
    "mkdirs <path>\tmake a directory and every missing parent",
    "mkdir <path>\tmake a single new directory",
    "rmdir <path>\trecursively remove a directory and its files",
    "create <path>\tcreate a new file",
    "write <path> <data>\twrite into a file (overwrites)",
    "append <path> <data>\tappend to a file",
    "head <path>\tread the start of a file",
    "tail <path>\tread the end of a file",
    "sysinfo\tshow cluster resources",
    "format\tclear the namespace and the journal",
    "help\tprint this reference",
    "logout\tdisconnect this client",
    "shutdown\tsave and stop the whole cluster",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    List { prefix: String },
    Save,
    Mkdirs { path: String },
    Mkdir { path: String },
    Rmdir { path: String },
    Create { path: String },
    Write { path: String, data: String },
    Append { path: String, data: String },
    Head { path: String },
    Tail { path: String },
    Sysinfo,
    Format,
    Help,
    Logout,
    Shutdown,
}

impl ClientCommand {
    /// Parses one input line. The verb is case-insensitive; paths and data
    /// are kept verbatim, and everything after the path is the payload.
    pub fn parse(line: &str) -> DfsResult<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(DfsError::Usage("type 'help' for the list of commands"));
        }

        let (verb, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim_start()),
            None => (trimmed, ""),
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "list" | "ls" => ClientCommand::List {
                prefix: rest.trim().to_string(),
            },
            "save" => ClientCommand::Save,
            "mkdirs" => ClientCommand::Mkdirs {
                path: single_arg(rest, "mkdirs <path>")?,
            },
            "mkdir" => ClientCommand::Mkdir {
                path: single_arg(rest, "mkdir <path>")?,
            },
            "rmdir" => ClientCommand::Rmdir {
                path: single_arg(rest, "rmdir <path>")?,
            },
            "create" => ClientCommand::Create {
                path: single_arg(rest, "create <path>")?,
            },
            "write" => {
                let (path, data) = path_and_data(rest, "write <path> <data>")?;
                ClientCommand::Write { path, data }
            }
            "append" => {
                let (path, data) = path_and_data(rest, "append <path> <data>")?;
                ClientCommand::Append { path, data }
            }
            "head" => ClientCommand::Head {
                path: single_arg(rest, "head <path>")?,
            },
            "tail" => ClientCommand::Tail {
                path: single_arg(rest, "tail <path>")?,
            },
            "sysinfo" => ClientCommand::Sysinfo,
            "format" => ClientCommand::Format,
            "help" | "?" => ClientCommand::Help,
            "logout" | "exit" | "quit" => ClientCommand::Logout,
            "shutdown" => ClientCommand::Shutdown,
            _ => return Err(DfsError::UnknownCommand(verb.to_string())),
        };
        Ok(command)
    }

    /// `logout` and `shutdown` end the client session.
    pub fn ends_session(&self) -> bool {
        matches!(self, ClientCommand::Logout | ClientCommand::Shutdown)
    }
}

fn single_arg(rest: &str, usage: &'static str) -> DfsResult<String> {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(arg), None) => Ok(arg.to_string()),
        _ => Err(DfsError::Usage(usage)),
    }
}

fn path_and_data(rest: &str, usage: &'static str) -> DfsResult<(String, String)> {
    let (path, data) = rest.split_once(char::is_whitespace).ok_or(DfsError::Usage(usage))?;
    if path.is_empty() || data.is_empty() {
        return Err(DfsError::Usage(usage));
    }
    Ok((path.to_string(), data.to_string()))
}
