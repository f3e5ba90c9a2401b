//! The line-delimited JSON event stream written to stdout.
//!
//! Every event is tagged with `type` and carries exactly the fields
//! defined for that row. `data` fields on `incoming`/`outgoing` are the
//! verbatim stanza XML — never re-indented or re-serialized.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ErrorCode;
use crate::model::SocketId;

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    Startup {
        pid: u32,
        ts: chrono::DateTime<chrono::Utc>,
        version: String,
    },
    Security {
        ts: chrono::DateTime<chrono::Utc>,
        message: String,
    },
    OpenValorant {
        ts: chrono::DateTime<chrono::Utc>,
        host: String,
        port: u16,
        #[serde(rename = "socketID")]
        socket_id: SocketId,
    },
    OpenRiot {
        ts: chrono::DateTime<chrono::Utc>,
        #[serde(rename = "socketID")]
        socket_id: SocketId,
    },
    CloseValorant {
        ts: chrono::DateTime<chrono::Utc>,
        #[serde(rename = "socketID")]
        socket_id: SocketId,
    },
    CloseRiot {
        ts: chrono::DateTime<chrono::Utc>,
        #[serde(rename = "socketID")]
        socket_id: SocketId,
    },
    Incoming {
        time: chrono::DateTime<chrono::Utc>,
        data: String,
    },
    Outgoing {
        time: chrono::DateTime<chrono::Utc>,
        data: String,
    },
    RoomJoined {
        ts: chrono::DateTime<chrono::Utc>,
        room: String,
    },
    Info {
        ts: chrono::DateTime<chrono::Utc>,
        message: String,
    },
    Debug {
        ts: chrono::DateTime<chrono::Utc>,
        message: String,
    },
    Error {
        ts: chrono::DateTime<chrono::Utc>,
        code: ErrorCode,
        reason: String,
    },
    Heartbeat {
        ts: chrono::DateTime<chrono::Utc>,
    },
    Shutdown {
        ts: chrono::DateTime<chrono::Utc>,
        reason: String,
    },
}

impl Event {
    pub fn startup(pid: u32, version: impl Into<String>) -> Self {
        Event::Startup { pid, ts: now(), version: version.into() }
    }

    pub fn security(message: impl Into<String>) -> Self {
        Event::Security { ts: now(), message: message.into() }
    }

    pub fn open_valorant(host: impl Into<String>, port: u16, socket_id: SocketId) -> Self {
        Event::OpenValorant { ts: now(), host: host.into(), port, socket_id }
    }

    pub fn open_riot(socket_id: SocketId) -> Self {
        Event::OpenRiot { ts: now(), socket_id }
    }

    pub fn close_valorant(socket_id: SocketId) -> Self {
        Event::CloseValorant { ts: now(), socket_id }
    }

    pub fn close_riot(socket_id: SocketId) -> Self {
        Event::CloseRiot { ts: now(), socket_id }
    }

    pub fn incoming(data: impl Into<String>) -> Self {
        Event::Incoming { time: now(), data: data.into() }
    }

    pub fn outgoing(data: impl Into<String>) -> Self {
        Event::Outgoing { time: now(), data: data.into() }
    }

    pub fn room_joined(room: impl Into<String>) -> Self {
        Event::RoomJoined { ts: now(), room: room.into() }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Event::Info { ts: now(), message: message.into() }
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Event::Debug { ts: now(), message: message.into() }
    }

    pub fn error(code: ErrorCode, reason: impl Into<String>) -> Self {
        Event::Error { ts: now(), code, reason: reason.into() }
    }

    pub fn heartbeat() -> Self {
        Event::Heartbeat { ts: now() }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Event::Shutdown { ts: now(), reason: reason.into() }
    }

    pub fn from_error_kind(kind: &crate::error::ErrorKind) -> Self {
        Event::error(kind.code(), kind.reason())
    }
}

/// Channel-backed stdout writer. Every subsystem sends its events here
/// instead of printing directly, so stdout is never written from more than
/// one place and per-sender ordering is preserved.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: Event) {
        // A closed receiver means the writer task is shutting down; the
        // event is simply dropped, matching the supervisor's own teardown.
        let _ = self.tx.send(event);
    }
}

/// Drains the event channel to stdout as newline-delimited JSON. Intended
/// to run as its own task for the lifetime of the process.
pub async fn run_writer(mut rx: mpsc::UnboundedReceiver<Event>) {
    use tokio::io::AsyncWriteExt;
    let mut stdout = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => {
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
            Err(e) => {
                tracing::error!("failed to serialize event: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_event_serializes_verbatim_data() {
        let event = Event::incoming("<message><body>hi</body></message>");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"incoming\""));
        assert!(json.contains("<message><body>hi</body></message>"));
    }

    #[test]
    fn test_open_valorant_field_names() {
        let event = Event::open_valorant("127.0.0.1", 5223, 7);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"socketID\":7"));
        assert!(json.contains("\"port\":5223"));
    }

    #[test]
    fn test_error_event_code_and_reason() {
        let kind = crate::error::ErrorKind::FatalStartup {
            code: 409,
            reason: "already running".to_string(),
        };
        let event = Event::from_error_kind(&kind);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"code\":409"));
    }

    #[test]
    fn test_error_event_other_code_serializes_as_string() {
        let event = Event::error(ErrorCode::Other, "connection reset");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"code\":\"other\""));
    }

    #[tokio::test]
    async fn test_sink_preserves_order() {
        let (sink, mut rx) = EventSink::new();
        sink.emit(Event::info("first"));
        sink.emit(Event::info("second"));
        drop(sink);
        let mut seen = vec![];
        while let Some(ev) = rx.recv().await {
            if let Event::Info { message, .. } = ev {
                seen.push(message);
            }
        }
        assert_eq!(seen, vec!["first".to_string(), "second".to_string()]);
    }
}
