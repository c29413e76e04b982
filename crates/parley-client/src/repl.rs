//! Interactive command parsing.
//!
//! Every line typed into `parley run` is one command. Session arguments
//! accept either the full session name or, for private chats, the other
//! peer's id.

use std::path::PathBuf;
use std::str::FromStr;

use parley_core::{PeerAddress, PeerId, SessionName};

use crate::config::parse_address;
use crate::error::ClientError;

pub const HELP: &str = "\
commands:
  /chat <id>                    open a private chat
  /group <id> <id>...           open a group chat led by you
  /text <session> <words>       send a text message
  /image <session> <path>       send an image
  /file <session> <path>        send a file
  /history <session>            show the messages of a session
  /sessions                     list sessions
  /delete <session>             delete a session
  /call <session>               call the peer of a private chat
  /accept <session>             accept an incoming call
  /reject <session>             reject an incoming call
  /hangup                       end the current call
  /peer <id> <host:port>        remember a peer address
  /help                         show this help
  /quit                         log out and exit
<session> is a session name or, for private chats, the other peer's id.";

/// Refers to a session by name or by the other peer of a private chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRef {
    Name(SessionName),
    Peer(PeerId),
}

impl SessionRef {
    /// Resolves to a session name from our point of view.
    pub fn resolve(&self, me: PeerId) -> Result<SessionName, ClientError> {
        match self {
            Self::Name(name) => Ok(name.clone()),
            Self::Peer(peer) => SessionName::private(me, *peer)
                .map_err(|e| ClientError::Input(e.to_string())),
        }
    }
}

impl FromStr for SessionRef {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(peer) = s.parse::<PeerId>() {
            return Ok(Self::Peer(peer));
        }
        s.parse::<SessionName>()
            .map(Self::Name)
            .map_err(|_| ClientError::Input(format!("{s:?} is neither a session name nor a peer id")))
    }
}

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Chat(PeerId),
    Group(Vec<PeerId>),
    Text { session: SessionRef, text: String },
    Image { session: SessionRef, path: PathBuf },
    File { session: SessionRef, path: PathBuf },
    History(SessionRef),
    Sessions,
    Delete(SessionRef),
    Call(SessionRef),
    Accept(SessionRef),
    Reject(SessionRef),
    HangUp,
    Peer { id: PeerId, address: PeerAddress },
    Help,
    Quit,
}

impl ReplCommand {
    /// Parses a line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, ClientError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Err(ClientError::Input(
                "commands start with '/', try /help".to_string(),
            ));
        };
        let (word, args) = match rest.split_once(char::is_whitespace) {
            Some((word, args)) => (word, args.trim()),
            None => (rest, ""),
        };

        let command = match word {
            "chat" => Self::Chat(peer(one(word, args)?)?),
            "group" => {
                let peers = args
                    .split_whitespace()
                    .map(peer)
                    .collect::<Result<Vec<_>, _>>()?;
                if peers.len() < 2 {
                    return Err(usage("/group <id> <id>..."));
                }
                Self::Group(peers)
            }
            "text" => {
                let (session, text) = session_and_rest(word, args)?;
                Self::Text {
                    session,
                    text: text.to_string(),
                }
            }
            "image" => {
                let (session, path) = session_and_rest(word, args)?;
                Self::Image {
                    session,
                    path: PathBuf::from(path),
                }
            }
            "file" => {
                let (session, path) = session_and_rest(word, args)?;
                Self::File {
                    session,
                    path: PathBuf::from(path),
                }
            }
            "history" => Self::History(one(word, args)?.parse()?),
            "sessions" => Self::Sessions,
            "delete" => Self::Delete(one(word, args)?.parse()?),
            "call" => Self::Call(one(word, args)?.parse()?),
            "accept" => Self::Accept(one(word, args)?.parse()?),
            "reject" => Self::Reject(one(word, args)?.parse()?),
            "hangup" => Self::HangUp,
            "peer" => {
                let mut parts = args.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(id), Some(address), None) => Self::Peer {
                        id: peer(id)?,
                        address: parse_address(address)?,
                    },
                    _ => return Err(usage("/peer <id> <host:port>")),
                }
            }
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => {
                return Err(ClientError::Input(format!(
                    "unknown command /{other}, try /help"
                )));
            }
        };
        Ok(Some(command))
    }
}

fn usage(text: &str) -> ClientError {
    ClientError::Input(format!("usage: {text}"))
}

fn peer(text: &str) -> Result<PeerId, ClientError> {
    text.parse()
        .map_err(|e: parley_core::IdError| ClientError::Input(e.to_string()))
}

fn one<'a>(word: &str, args: &'a str) -> Result<&'a str, ClientError> {
    let mut parts = args.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(arg), None) => Ok(arg),
        _ => Err(usage(&format!("/{word} <{}>", argument_name(word)))),
    }
}

fn argument_name(word: &str) -> &'static str {
    match word {
        "chat" => "id",
        _ => "session",
    }
}

fn session_and_rest<'a>(word: &str, args: &'a str) -> Result<(SessionRef, &'a str), ClientError> {
    let what = if word == "text" { "words" } else { "path" };
    match args.split_once(char::is_whitespace) {
        Some((session, rest)) if !rest.trim().is_empty() => Ok((session.parse()?, rest.trim())),
        _ => Err(usage(&format!("/{word} <session> <{what}>"))),
    }
}
