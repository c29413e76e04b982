//! Directory (presence) service grammar.
//!
//! One command per round trip, plain text, no framing:
//!
//! | Command                         | Reply                         |
//! |---------------------------------|-------------------------------|
//! | `<id>_<credential>[_<port>]`    | `ok` or `invalid_command`     |
//! | `q<id>`                         | `<host>_<port>` / `not_found` |
//! | `logout<id>`                    | `logged_out`                  |
//!
//! Older directory servers answer `lol`, `n` and `loo` instead of `ok`,
//! `not_found` and `logged_out`, and may reply to a query with a bare host;
//! [`DirectoryReply`] accepts both spellings.

use std::fmt;
use std::str::FromStr;

use parley_core::PeerId;

use crate::error::ProtocolError;

/// Port peers listen on when none is given.
pub const DEFAULT_LISTEN_PORT: u16 = 2333;

/// Shared credential accepted by the development directory server.
pub const DEFAULT_CREDENTIAL: &str = "net2019";

/// Ports commonly taken by other services; never accepted as listen ports.
pub const RESERVED_PORTS: [u16; 8] = [3306, 5432, 6379, 8080, 8888, 9200, 27017, 22122];

/// Largest command or reply the directory reads in one go.
pub const MAX_DIRECTORY_MESSAGE: usize = 1024;

const QUERY_PREFIX: &str = "q";
const LOGOUT_PREFIX: &str = "logout";

/// Returns true for ports a peer may register: above 1024 and not reserved.
pub fn is_valid_listen_port(port: u16) -> bool {
    port > 1024 && !RESERVED_PORTS.contains(&port)
}

/// A request sent to the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryCommand {
    Register {
        id: PeerId,
        credential: String,
        port: Option<u16>,
    },
    Query(PeerId),
    Logout(PeerId),
}

impl fmt::Display for DirectoryCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register {
                id,
                credential,
                port: Some(port),
            } => write!(f, "{id}_{credential}_{port}"),
            Self::Register {
                id,
                credential,
                port: None,
            } => write!(f, "{id}_{credential}"),
            Self::Query(id) => write!(f, "{QUERY_PREFIX}{id}"),
            Self::Logout(id) => write!(f, "{LOGOUT_PREFIX}{id}"),
        }
    }
}

impl FromStr for DirectoryCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidCommand(s.to_string());
        let s = s.trim_end_matches(['\r', '\n']);

        if let Some(id) = s.strip_prefix(LOGOUT_PREFIX) {
            return id.parse().map(Self::Logout).map_err(|_| invalid());
        }
        if let Some(id) = s.strip_prefix(QUERY_PREFIX) {
            return id.parse().map(Self::Query).map_err(|_| invalid());
        }

        let (id, rest) = s.split_once('_').ok_or_else(invalid)?;
        let id: PeerId = id.parse().map_err(|_| invalid())?;
        let (credential, port) = match rest.rsplit_once('_') {
            Some((credential, port))
                if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
            {
                (credential, Some(port.parse::<u16>().map_err(|_| invalid())?))
            }
            _ => (rest, None),
        };
        if credential.is_empty() {
            return Err(invalid());
        }
        Ok(Self::Register {
            id,
            credential: credential.to_string(),
            port,
        })
    }
}

/// A directory answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryReply {
    Ok,
    Found { host: String, port: u16 },
    NotFound,
    LoggedOut,
    InvalidCommand,
}

impl fmt::Display for DirectoryReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Found { host, port } => write!(f, "{host}_{port}"),
            Self::NotFound => f.write_str("not_found"),
            Self::LoggedOut => f.write_str("logged_out"),
            Self::InvalidCommand => f.write_str("invalid_command"),
        }
    }
}

impl FromStr for DirectoryReply {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" => Err(ProtocolError::InvalidReply(String::new())),
            "ok" | "lol" => Ok(Self::Ok),
            "not_found" | "n" => Ok(Self::NotFound),
            "logged_out" | "loo" => Ok(Self::LoggedOut),
            "invalid_command" | "Invalid Command!" => Ok(Self::InvalidCommand),
            _ => match s.rsplit_once('_') {
                Some((host, port)) if !host.is_empty() => {
                    let port = port
                        .parse()
                        .map_err(|_| ProtocolError::InvalidReply(s.to_string()))?;
                    Ok(Self::Found {
                        host: host.to_string(),
                        port,
                    })
                }
                Some(_) => Err(ProtocolError::InvalidReply(s.to_string())),
                None if s.contains(char::is_whitespace) => {
                    Err(ProtocolError::InvalidReply(s.to_string()))
                }
                None => Ok(Self::Found {
                    host: s.to_string(),
                    port: DEFAULT_LISTEN_PORT,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn command_text() {
        let register = DirectoryCommand::Register {
            id: id("2017011527"),
            credential: DEFAULT_CREDENTIAL.into(),
            port: Some(9001),
        };
        insta::assert_snapshot!(register, @"2017011527_net2019_9001");
        insta::assert_snapshot!(DirectoryCommand::Query(id("2017011527")), @"q2017011527");
        insta::assert_snapshot!(DirectoryCommand::Logout(id("2017011527")), @"logout2017011527");
    }

    #[test]
    fn parse_commands() {
        assert_eq!(
            "2017011527_net2019_9001".parse::<DirectoryCommand>().unwrap(),
            DirectoryCommand::Register {
                id: id("2017011527"),
                credential: "net2019".into(),
                port: Some(9001),
            }
        );
        assert_eq!(
            "2017011527_net2019".parse::<DirectoryCommand>().unwrap(),
            DirectoryCommand::Register {
                id: id("2017011527"),
                credential: "net2019".into(),
                port: None,
            }
        );
        assert_eq!(
            "q2017011527".parse::<DirectoryCommand>().unwrap(),
            DirectoryCommand::Query(id("2017011527"))
        );
        assert_eq!(
            "logout2017011527\n".parse::<DirectoryCommand>().unwrap(),
            DirectoryCommand::Logout(id("2017011527"))
        );
    }

    #[test]
    fn reject_bad_commands() {
        for bad in [
            "",
            "hello",
            "q123",
            "logout",
            "2017011527",
            "2017011527_",
            "2017011527_net2019_99999",
            "abc_net2019_9001",
        ] {
            assert!(
                matches!(
                    bad.parse::<DirectoryCommand>(),
                    Err(ProtocolError::InvalidCommand(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn parse_replies() {
        assert_eq!("ok".parse::<DirectoryReply>().unwrap(), DirectoryReply::Ok);
        assert_eq!(
            "10.0.0.5_9001".parse::<DirectoryReply>().unwrap(),
            DirectoryReply::Found {
                host: "10.0.0.5".into(),
                port: 9001
            }
        );
        assert_eq!(
            "not_found".parse::<DirectoryReply>().unwrap(),
            DirectoryReply::NotFound
        );
        assert_eq!(
            "logged_out".parse::<DirectoryReply>().unwrap(),
            DirectoryReply::LoggedOut
        );
        assert_eq!(
            "invalid_command".parse::<DirectoryReply>().unwrap(),
            DirectoryReply::InvalidCommand
        );
    }

    #[test]
    fn legacy_replies() {
        assert_eq!("lol".parse::<DirectoryReply>().unwrap(), DirectoryReply::Ok);
        assert_eq!("n".parse::<DirectoryReply>().unwrap(), DirectoryReply::NotFound);
        assert_eq!("loo".parse::<DirectoryReply>().unwrap(), DirectoryReply::LoggedOut);
        assert_eq!(
            "Invalid Command!".parse::<DirectoryReply>().unwrap(),
            DirectoryReply::InvalidCommand
        );
        assert_eq!(
            "166.111.140.57".parse::<DirectoryReply>().unwrap(),
            DirectoryReply::Found {
                host: "166.111.140.57".into(),
                port: DEFAULT_LISTEN_PORT
            }
        );
    }

    #[test]
    fn reply_roundtrip_text() {
        for reply in [
            DirectoryReply::Ok,
            DirectoryReply::NotFound,
            DirectoryReply::LoggedOut,
            DirectoryReply::InvalidCommand,
            DirectoryReply::Found {
                host: "127.0.0.1".into(),
                port: 2333,
            },
        ] {
            assert_eq!(reply.to_string().parse::<DirectoryReply>().unwrap(), reply);
        }
        assert!("".parse::<DirectoryReply>().is_err());
        assert!("host_notaport".parse::<DirectoryReply>().is_err());
    }

    #[test]
    fn listen_port_validation() {
        assert!(is_valid_listen_port(2333));
        assert!(is_valid_listen_port(65535));
        assert!(!is_valid_listen_port(1024));
        assert!(!is_valid_listen_port(80));
        assert!(!is_valid_listen_port(8080));
        assert!(!is_valid_listen_port(27017));
    }
}
