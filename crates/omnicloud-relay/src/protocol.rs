//! Line protocol parsing and formatting.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, RelayResult};

/// Longest accepted line; anything larger is a protocol violation.
const MAX_LINE: usize = 512;

/// Every message either side may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCommand {
    /// `RELAY-REGISTER <adv_addr>`: register as an available seeder.
    Register {
        /// Advertised address the seeder is reachable under.
        adv_addr: String,
    },
    /// `RELAY-CONNECT <target_adv_addr>`: request a session to a peer.
    Connect {
        /// The target's advertised address.
        target: String,
    },
    /// `RELAY-SESSION <session_id>`: bind a data connection to a session.
    Session {
        /// Session identifier from the matching `SESSION-REQUEST`.
        session_id: String,
    },
    /// `SESSION-REQUEST <session_id>`: instruct a seeder to dial in.
    SessionRequest {
        /// Session identifier the seeder must echo.
        session_id: String,
    },
    /// `OK` or `OK <session_id>`: acknowledgement.
    Ok {
        /// Optional session identifier payload.
        session_id: Option<String>,
    },
    /// `ERROR <reason>`: rejection.
    Error {
        /// Human-readable reason.
        reason: String,
    },
    /// `PING` keepalive.
    Ping,
    /// `PONG` keepalive reply.
    Pong,
}

impl RelayCommand {
    /// Parse one line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Protocol`] for unknown commands or missing
    /// arguments; unknown tags are never passed through silently.
    pub fn parse(line: &str) -> RelayResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, Some(rest)),
            None => (line, None),
        };
        match (command, rest) {
            ("RELAY-REGISTER", Some(adv_addr)) if !adv_addr.is_empty() => Ok(Self::Register {
                adv_addr: adv_addr.to_string(),
            }),
            ("RELAY-CONNECT", Some(target)) if !target.is_empty() => Ok(Self::Connect {
                target: target.to_string(),
            }),
            ("RELAY-SESSION", Some(session_id)) if !session_id.is_empty() => Ok(Self::Session {
                session_id: session_id.to_string(),
            }),
            ("SESSION-REQUEST", Some(session_id)) if !session_id.is_empty() => {
                Ok(Self::SessionRequest {
                    session_id: session_id.to_string(),
                })
            }
            ("OK", session_id) => Ok(Self::Ok {
                session_id: session_id.map(str::to_string),
            }),
            ("ERROR", Some(reason)) => Ok(Self::Error {
                reason: reason.to_string(),
            }),
            ("PING", None) => Ok(Self::Ping),
            ("PONG", None) => Ok(Self::Pong),
            _ => Err(RelayError::Protocol {
                line: line.chars().take(64).collect(),
            }),
        }
    }

    /// Render the command as one LF-terminated line.
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Self::Register { adv_addr } => format!("RELAY-REGISTER {adv_addr}\n"),
            Self::Connect { target } => format!("RELAY-CONNECT {target}\n"),
            Self::Session { session_id } => format!("RELAY-SESSION {session_id}\n"),
            Self::SessionRequest { session_id } => format!("SESSION-REQUEST {session_id}\n"),
            Self::Ok { session_id: None } => "OK\n".to_string(),
            Self::Ok {
                session_id: Some(id),
            } => format!("OK {id}\n"),
            Self::Error { reason } => format!("ERROR {reason}\n"),
            Self::Ping => "PING\n".to_string(),
            Self::Pong => "PONG\n".to_string(),
        }
    }
}

/// Read one LF-terminated line byte-by-byte so no bytes beyond the line are
/// consumed; the same socket may carry raw peer traffic immediately after.
pub(crate) async fn read_line<R: AsyncRead + Unpin>(stream: &mut R) -> RelayResult<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let read = stream
            .read(&mut byte)
            .await
            .map_err(RelayError::io("relay.read_line"))?;
        if read == 0 {
            return Err(RelayError::Io {
                operation: "relay.read_line",
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-line",
                ),
            });
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE {
            return Err(RelayError::Protocol {
                line: String::from_utf8_lossy(&line[..64]).to_string(),
            });
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).map_err(|err| RelayError::Protocol {
        line: format!("non-utf8 line: {err}"),
    })
}

/// Write one command to a raw stream.
pub(crate) async fn write_command<W: AsyncWrite + Unpin>(
    stream: &mut W,
    command: &RelayCommand,
) -> RelayResult<()> {
    stream
        .write_all(command.to_line().as_bytes())
        .await
        .map_err(RelayError::io("relay.write_command"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_round_trip_through_lines() {
        let cases = [
            RelayCommand::Register {
                adv_addr: "198.51.100.7:6881".to_string(),
            },
            RelayCommand::Connect {
                target: "198.51.100.7:6881".to_string(),
            },
            RelayCommand::Session {
                session_id: "abc123".to_string(),
            },
            RelayCommand::SessionRequest {
                session_id: "abc123".to_string(),
            },
            RelayCommand::Ok { session_id: None },
            RelayCommand::Ok {
                session_id: Some("abc123".to_string()),
            },
            RelayCommand::Error {
                reason: "peer not registered".to_string(),
            },
            RelayCommand::Ping,
            RelayCommand::Pong,
        ];
        for case in cases {
            let line = case.to_line();
            assert!(line.ends_with('\n'));
            let parsed = RelayCommand::parse(&line).expect("parse");
            assert_eq!(parsed, case);
        }
    }

    #[test]
    fn unknown_commands_are_protocol_errors() {
        assert!(RelayCommand::parse("RELAY-FROBNICATE x").is_err());
        assert!(RelayCommand::parse("").is_err());
        assert!(RelayCommand::parse("RELAY-REGISTER").is_err());
        assert!(RelayCommand::parse("PING extra").is_err());
    }

    #[test]
    fn error_reason_may_contain_spaces() {
        let parsed = RelayCommand::parse("ERROR relay at capacity").expect("parse");
        assert_eq!(
            parsed,
            RelayCommand::Error {
                reason: "relay at capacity".to_string()
            }
        );
    }
}
