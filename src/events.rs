//! Connection Events
//!
//! Worker tasks (bridge sessions, tunnel output readers, stop tasks) publish
//! what they observe on a broadcast channel. Whoever owns presentation
//! subscribes and renders; nothing in the core assumes a particular thread.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::ConnectionStatus;

/// Default capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Severity attached to user-facing log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Direction of forwarded bridge traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    SerialToTcp,
    TcpToSerial,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::SerialToTcp => write!(f, "SERIAL → TCP"),
            Direction::TcpToSerial => write!(f, "TCP → SERIAL"),
        }
    }
}

/// Something a presentation layer may want to show
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// Free-form message, optionally tied to a connection
    Log {
        remote_port: Option<u16>,
        level: LogLevel,
        message: String,
    },
    /// One line of data forwarded through a serial bridge
    Traffic {
        local_port: u16,
        direction: Direction,
        line: String,
    },
    /// One line printed by a tunnel client process
    TunnelOutput { remote_port: u16, line: String },
    StatusChanged {
        remote_port: u16,
        status: ConnectionStatus,
    },
    /// The tunnel server reported the remote port as taken
    Conflict { remote_port: u16 },
    Removed { remote_port: u16 },
}

impl std::fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::Log {
                remote_port: Some(port),
                level,
                message,
            } => write!(f, "[{:?}] [{}] {}", level, port, message),
            ConnectionEvent::Log { level, message, .. } => write!(f, "[{:?}] {}", level, message),
            ConnectionEvent::Traffic {
                direction, line, ..
            } => write!(f, "[{}] {}", direction, line),
            ConnectionEvent::TunnelOutput { remote_port, line } => {
                write!(f, "[{}] {}", remote_port, line)
            }
            ConnectionEvent::StatusChanged {
                remote_port,
                status,
            } => write!(f, "[{}] status: {}", remote_port, status),
            ConnectionEvent::Conflict { remote_port } => write!(
                f,
                "[Warn] Public port {} is already in use. This mapping will be removed.",
                remote_port
            ),
            ConnectionEvent::Removed { remote_port } => write!(f, "[{}] removed", remote_port),
        }
    }
}

/// Cloneable publishing handle for [`ConnectionEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ConnectionEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event dropped, no subscribers");
        }
    }

    pub fn info(&self, remote_port: Option<u16>, message: impl Into<String>) {
        self.log(remote_port, LogLevel::Info, message);
    }

    pub fn warn(&self, remote_port: Option<u16>, message: impl Into<String>) {
        self.log(remote_port, LogLevel::Warn, message);
    }

    pub fn error(&self, remote_port: Option<u16>, message: impl Into<String>) {
        self.log(remote_port, LogLevel::Error, message);
    }

    fn log(&self, remote_port: Option<u16>, level: LogLevel, message: impl Into<String>) {
        self.publish(ConnectionEvent::Log {
            remote_port,
            level,
            message: message.into(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.info(None, "nobody listening");
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.info(Some(3000), "first");
        bus.publish(ConnectionEvent::Conflict { remote_port: 3000 });

        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::Log {
                remote_port: Some(3000),
                level: LogLevel::Info,
                message: "first".to_string(),
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::Conflict { remote_port: 3000 }
        );
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ConnectionEvent::TunnelOutput {
            remote_port: 22,
            line: "login to server success".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"tunnel_output\""));
        assert!(json.contains("\"remote_port\":22"));
    }
}
