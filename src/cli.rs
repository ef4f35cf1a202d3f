use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "roomsync")]
#[command(version)]
#[command(about = "Terminal client for a realtime chat room with streamed AI replies")]
pub struct Args {
    /// Room to join
    pub room: String,

    /// User id to sign in as
    #[arg(long, short)]
    pub user: String,

    /// Auth token presented during the handshake
    #[arg(long, short)]
    pub token: String,

    /// Display name (defaults to the user id)
    #[arg(long)]
    pub name: Option<String>,

    /// WebSocket endpoint of the chat server
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    pub server: String,

    /// REST API root used for room metadata
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub api: String,

    /// TOML file with timeouts, backoff and paging settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Messages per history page (overrides the config file)
    #[arg(long)]
    pub page_size: Option<usize>,
}

impl Args {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.user.clone())
    }
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Older,
    React { message_id: String, emoji: String },
    Unreact { message_id: String, emoji: String },
    Continue,
    Help,
    Quit,
}

pub const HELP: &str = "\
/older                  load older messages
/react <id> <emoji>     add a reaction
/unreact <id> <emoji>   remove a reaction
/continue               keep this session after a duplicate-login warning
/quit                   leave the room and exit
anything else           send as a message";

/// Parse a prompt line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Send(line.to_string())));
    }
    let mut parts = line.split_whitespace();
    let head = parts.next().unwrap_or_default();
    let rest: Vec<&str> = parts.collect();
    let cmd = match (head, rest.as_slice()) {
        ("/older", []) => Command::Older,
        ("/continue", []) => Command::Continue,
        ("/help", []) => Command::Help,
        ("/quit" | "/exit", []) => Command::Quit,
        ("/react", [id, emoji]) => Command::React { message_id: id.to_string(), emoji: emoji.to_string() },
        ("/unreact", [id, emoji]) => Command::Unreact { message_id: id.to_string(), emoji: emoji.to_string() },
        ("/react" | "/unreact", _) => return Err(format!("usage: {head} <message-id> <emoji>")),
        _ => return Err(format!("unknown command: {head} (try /help)")),
    };
    Ok(Some(cmd))
}
