//! Minimal async Tor control-port client.
//!
//! Covers exactly the slice of the control protocol the node needs:
//! authentication (null, cookie, password), `GETINFO status/bootstrap-phase`,
//! `SETEVENTS HS_DESC`, `ADD_ONION`, and `DEL_ONION`.
//!
//! A background reader task owns the read half of the connection. Reply
//! blocks (terminated by a `250 `/`5xx ` line) are handed back to the
//! command issuer; asynchronous `650` events are pushed into a separate
//! channel consumed by the orchestrator's event pump. Commands are
//! serialized under one lock, so replies always match the command that is
//! currently in flight.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control io: {0}")]
    Io(#[from] std::io::Error),
    #[error("control authentication failed: {0}")]
    Auth(String),
    #[error("control protocol error: {0}")]
    Proto(String),
    #[error("control connection closed")]
    Closed,
}

/// How to authenticate against the control port.
#[derive(Debug, Clone)]
pub enum ControlAuth {
    Null,
    Password(String),
    CookieFile(std::path::PathBuf),
}

/// One complete reply block.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == 250
    }

    /// Value of a `key=value` line within this reply, if present.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        let prefix = format!("{key}=");
        self.lines.iter().find_map(|l| l.strip_prefix(&prefix))
    }
}

/// An asynchronous `650` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    HsDescUploaded { service_id: String },
    HsDescFailed { service_id: String },
    Other(String),
}

/// Parsed `status/bootstrap-phase` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPhase {
    pub progress: u8,
    pub tag: String,
    pub summary: String,
}

struct CommandLane {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<Reply>,
}

/// Client handle. Cheap to share behind an `Arc`.
pub struct ControlClient {
    lane: Mutex<CommandLane>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ControlEvent>>>,
}

impl ControlClient {
    /// Connect and spawn the reader task. Does not authenticate.
    pub async fn connect(addr: &str) -> Result<Self, ControlError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();

        let (reply_tx, replies) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(read_half, reply_tx, event_tx));

        Ok(Self {
            lane: Mutex::new(CommandLane { writer, replies }),
            events: Mutex::new(Some(event_rx)),
        })
    }

    /// Take the event stream. Yields `None` on the second call.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ControlEvent>> {
        self.events.lock().await.take()
    }

    /// Send one command and await its reply block.
    pub async fn request(&self, command: &str) -> Result<Reply, ControlError> {
        let mut lane = self.lane.lock().await;
        lane.writer.write_all(command.as_bytes()).await?;
        lane.writer.write_all(b"\r\n").await?;
        lane.writer.flush().await?;
        lane.replies.recv().await.ok_or(ControlError::Closed)
    }

    /// Authenticate with the configured method.
    pub async fn authenticate(&self, auth: &ControlAuth) -> Result<(), ControlError> {
        let command = match auth {
            ControlAuth::Null => "AUTHENTICATE".to_owned(),
            ControlAuth::Password(pw) => format!("AUTHENTICATE \"{}\"", pw.replace('"', "\\\"")),
            ControlAuth::CookieFile(path) => {
                let cookie = read_cookie(path)?;
                format!("AUTHENTICATE {}", hex::encode(cookie.as_slice()))
            }
        };
        let reply = self.request(&command).await?;
        if !reply.is_ok() {
            return Err(ControlError::Auth(reply.lines.join("; ")));
        }
        Ok(())
    }

    /// Subscribe to hidden-service descriptor events.
    pub async fn watch_hs_desc(&self) -> Result<(), ControlError> {
        let reply = self.request("SETEVENTS HS_DESC").await?;
        if !reply.is_ok() {
            return Err(ControlError::Proto(reply.lines.join("; ")));
        }
        Ok(())
    }

    /// Current bootstrap phase.
    pub async fn bootstrap_phase(&self) -> Result<BootstrapPhase, ControlError> {
        let reply = self.request("GETINFO status/bootstrap-phase").await?;
        if !reply.is_ok() {
            return Err(ControlError::Proto(reply.lines.join("; ")));
        }
        let line = reply
            .value_of("status/bootstrap-phase")
            .ok_or_else(|| ControlError::Proto("missing bootstrap-phase".into()))?;
        parse_bootstrap_phase(line)
            .ok_or_else(|| ControlError::Proto(format!("unparseable bootstrap phase: {line}")))
    }

    /// Publish an onion service forwarding `virtual_port` to the loopback
    /// `local_port`.
    ///
    /// * `key_spec` — `"NEW:ED25519-V3"` or `"ED25519-V3:<blob>"`.
    /// * `discard_pk` — ask the daemon not to return the private key
    ///   (ephemeral invite services).
    pub async fn add_onion(
        &self,
        key_spec: &str,
        virtual_port: u16,
        local_port: u16,
        discard_pk: bool,
    ) -> Result<AddOnionReply, ControlError> {
        let mut command =
            format!("ADD_ONION {key_spec} Port={virtual_port},127.0.0.1:{local_port}");
        if discard_pk {
            command.push_str(" Flags=DiscardPK");
        }
        let reply = self.request(&command).await?;
        if !reply.is_ok() {
            return Err(ControlError::Proto(reply.lines.join("; ")));
        }
        let service_id = reply
            .value_of("ServiceID")
            .ok_or_else(|| ControlError::Proto("ADD_ONION reply without ServiceID".into()))?
            .to_owned();
        let private_key = reply
            .value_of("PrivateKey")
            .and_then(|v| v.strip_prefix("ED25519-V3:"))
            .map(|v| Zeroizing::new(v.to_owned()));
        Ok(AddOnionReply { service_id, private_key })
    }

    /// Remove a previously published onion service.
    pub async fn del_onion(&self, service_id: &str) -> Result<(), ControlError> {
        let reply = self.request(&format!("DEL_ONION {service_id}")).await?;
        if !reply.is_ok() {
            return Err(ControlError::Proto(reply.lines.join("; ")));
        }
        Ok(())
    }
}

/// `ADD_ONION` outcome.
pub struct AddOnionReply {
    pub service_id: String,
    /// Key blob (without the `ED25519-V3:` prefix); absent for persisted
    /// keys and when `DiscardPK` was requested.
    pub private_key: Option<Zeroizing<String>>,
}

fn read_cookie(path: &Path) -> Result<Zeroizing<Vec<u8>>, ControlError> {
    let bytes = std::fs::read(path)?;
    Ok(Zeroizing::new(bytes))
}

async fn read_loop(
    read_half: OwnedReadHalf,
    reply_tx: mpsc::UnboundedSender<Reply>,
    event_tx: mpsc::UnboundedSender<ControlEvent>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut block: Vec<String> = Vec::new();
    let mut block_status: u16 = 0;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.len() < 4 {
            continue;
        }
        let (code_str, rest) = trimmed.split_at(3);
        let Ok(code) = code_str.parse::<u16>() else { continue };
        let sep = rest.as_bytes()[0];
        let text = &rest[1..];

        if code == 650 {
            let _ = event_tx.send(parse_event(text));
            continue;
        }

        block_status = code;
        block.push(text.to_owned());
        if sep == b' ' {
            let reply = Reply { status: block_status, lines: std::mem::take(&mut block) };
            if reply_tx.send(reply).is_err() {
                break;
            }
        }
    }
    tracing::debug!("control reader loop ended");
}

fn parse_event(text: &str) -> ControlEvent {
    let mut parts = text.split_whitespace();
    if parts.next() == Some("HS_DESC") {
        let action = parts.next().unwrap_or_default();
        let service_id = parts.next().unwrap_or_default().to_owned();
        match action {
            "UPLOADED" => return ControlEvent::HsDescUploaded { service_id },
            "FAILED" => return ControlEvent::HsDescFailed { service_id },
            _ => {}
        }
    }
    ControlEvent::Other(text.to_owned())
}

/// Parse a `NOTICE BOOTSTRAP PROGRESS=nn TAG=tt SUMMARY="ss"` line.
fn parse_bootstrap_phase(line: &str) -> Option<BootstrapPhase> {
    let mut progress = None;
    let mut tag = None;
    for part in line.split_whitespace() {
        if let Some(v) = part.strip_prefix("PROGRESS=") {
            progress = v.parse::<u8>().ok();
        } else if let Some(v) = part.strip_prefix("TAG=") {
            tag = Some(v.trim_matches('"').to_owned());
        }
    }
    // SUMMARY is quoted and may contain spaces; take it from the raw line.
    let summary = line
        .find("SUMMARY=\"")
        .and_then(|idx| line[idx + "SUMMARY=\"".len()..].split('"').next())
        .unwrap_or_default()
        .to_owned();
    Some(BootstrapPhase { progress: progress?, tag: tag?, summary })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_phase_parses_done() {
        let line = r#"NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done""#;
        let phase = parse_bootstrap_phase(line).unwrap();
        assert_eq!(phase.progress, 100);
        assert_eq!(phase.tag, "done");
        assert_eq!(phase.summary, "Done");
    }

    #[test]
    fn bootstrap_phase_parses_partial_with_spaces() {
        let line = r#"NOTICE BOOTSTRAP PROGRESS=14 TAG=handshake SUMMARY="Handshaking with a relay""#;
        let phase = parse_bootstrap_phase(line).unwrap();
        assert_eq!(phase.progress, 14);
        assert_eq!(phase.tag, "handshake");
        assert_eq!(phase.summary, "Handshaking with a relay");
    }

    #[test]
    fn bootstrap_phase_rejects_garbage() {
        assert_eq!(parse_bootstrap_phase("WARN something else"), None);
    }

    #[test]
    fn hs_desc_events_parse() {
        assert_eq!(
            parse_event("HS_DESC UPLOADED abcdef123 UNKNOWN $hsdir"),
            ControlEvent::HsDescUploaded { service_id: "abcdef123".into() }
        );
        assert_eq!(
            parse_event("HS_DESC FAILED abcdef123 UNKNOWN $hsdir REASON=UPLOAD_REJECTED"),
            ControlEvent::HsDescFailed { service_id: "abcdef123".into() }
        );
        assert!(matches!(
            parse_event("HS_DESC REQUESTED abcdef123"),
            ControlEvent::Other(_)
        ));
        assert!(matches!(parse_event("CIRC 1 BUILT"), ControlEvent::Other(_)));
    }

    #[test]
    fn reply_value_lookup() {
        let reply = Reply {
            status: 250,
            lines: vec![
                "ServiceID=abc123".into(),
                "PrivateKey=ED25519-V3:deadbeef".into(),
                "OK".into(),
            ],
        };
        assert!(reply.is_ok());
        assert_eq!(reply.value_of("ServiceID"), Some("abc123"));
        assert_eq!(reply.value_of("PrivateKey"), Some("ED25519-V3:deadbeef"));
        assert_eq!(reply.value_of("Missing"), None);
    }
}
