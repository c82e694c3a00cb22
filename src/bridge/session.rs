//! Bridge Session
//!
//! One accepted TCP client on a serial bridge. The session owns two handles
//! to the serial device and runs the serial→TCP and TCP→serial loops on
//! their own threads until either ends, then the other is cancelled.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::device::SerialDevice;
use crate::events::{ConnectionEvent, Direction, EventBus};

/// Byte counters and identity of a session
#[derive(Debug)]
pub struct SessionInfo {
    pub session_id: String,
    pub peer_addr: SocketAddr,
    pub local_port: u16,
    pub start_time: Instant,
    bytes_to_serial: AtomicU64,
    bytes_to_tcp: AtomicU64,
}

/// Statistics for a completed session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub peer_addr: SocketAddr,
    pub duration_ms: u64,
    pub bytes_to_serial: u64,
    pub bytes_to_tcp: u64,
}

impl SessionInfo {
    fn new(peer_addr: SocketAddr, local_port: u16) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        Self {
            session_id: format!("session_{}_{}", timestamp, peer_addr.port()),
            peer_addr,
            local_port,
            start_time: Instant::now(),
            bytes_to_serial: AtomicU64::new(0),
            bytes_to_tcp: AtomicU64::new(0),
        }
    }

    pub fn bytes_to_serial(&self) -> u64 {
        self.bytes_to_serial.load(Ordering::Relaxed)
    }

    pub fn bytes_to_tcp(&self) -> u64 {
        self.bytes_to_tcp.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn to_stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id.clone(),
            peer_addr: self.peer_addr,
            duration_ms: self.duration().as_millis() as u64,
            bytes_to_serial: self.bytes_to_serial(),
            bytes_to_tcp: self.bytes_to_tcp(),
        }
    }

    fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            peer_addr = %self.peer_addr,
            local_port = self.local_port,
            duration_ms = self.duration().as_millis() as u64,
            bytes_to_serial = self.bytes_to_serial(),
            bytes_to_tcp = self.bytes_to_tcp(),
            "Bridge session completed"
        );
    }
}

/// Shared state both forwarding loops observe
struct SessionContext {
    info: SessionInfo,
    events: EventBus,
    cancel: AtomicBool,
    bridge_shutdown: Arc<AtomicBool>,
}

impl SessionContext {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.bridge_shutdown.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn report(&self, direction: Direction, data: &[u8]) {
        report_lines(&self.events, self.info.local_port, direction, data);
    }
}

/// Tunables a session needs from the bridge
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub socket_timeout: Duration,
    pub write_timeout: Duration,
    pub buffer_size: usize,
}

/// A single client session over a serial bridge
pub struct BridgeSession {
    stream: TcpStream,
    serial_reader: Box<dyn SerialDevice>,
    serial_writer: Box<dyn SerialDevice>,
    options: SessionOptions,
    context: SessionContext,
}

impl BridgeSession {
    /// Build a session for an accepted client.
    ///
    /// `stream` may come from a non-blocking listener; it is switched to
    /// blocking mode with the socket timeout as read bound.
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        local_port: u16,
        device: &dyn SerialDevice,
        events: EventBus,
        bridge_shutdown: Arc<AtomicBool>,
        options: SessionOptions,
    ) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(options.socket_timeout))?;
        stream.set_write_timeout(Some(options.write_timeout))?;
        stream.set_nodelay(true)?;

        let serial_reader = device.try_clone_device()?;
        let mut serial_writer = device.try_clone_device()?;
        serial_writer.set_timeout(options.write_timeout)?;

        let info = SessionInfo::new(peer_addr, local_port);
        debug!("Creating bridge session {} for {}", info.session_id, peer_addr);

        Ok(Self {
            stream,
            serial_reader,
            serial_writer,
            options,
            context: SessionContext {
                info,
                events,
                cancel: AtomicBool::new(false),
                bridge_shutdown,
            },
        })
    }

    pub fn session_id(&self) -> &str {
        &self.context.info.session_id
    }

    /// Forward in both directions until one side ends. Blocks the caller.
    pub fn run(self) -> SessionStats {
        let BridgeSession {
            stream,
            mut serial_reader,
            mut serial_writer,
            options,
            context,
        } = self;
        let peer = context.info.peer_addr;

        info!("New client connected: {}", peer);
        context.events.info(None, format!("New client connected: {}", peer));

        let mut tcp_writer = match stream.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                error!("Failed to clone client socket for {}: {}", peer, e);
                return context.info.to_stats();
            }
        };
        let mut tcp_reader = stream;

        std::thread::scope(|scope| {
            let ctx = &context;
            let buffer_size = options.buffer_size;
            scope.spawn(move || {
                serial_to_tcp(serial_reader.as_mut(), &mut tcp_writer, ctx, buffer_size)
            });
            scope.spawn(move || {
                tcp_to_serial(&mut tcp_reader, serial_writer.as_mut(), ctx, buffer_size);
                let _ = tcp_reader.shutdown(Shutdown::Both);
            });
        });

        context.info.log_stats();
        context
            .events
            .info(None, format!("Session ended for client {}", peer));
        context.info.to_stats()
    }
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn serial_to_tcp(
    serial: &mut dyn SerialDevice,
    tcp: &mut TcpStream,
    ctx: &SessionContext,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    let peer = ctx.info.peer_addr;

    while !ctx.cancelled() {
        match serial.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if let Err(e) = tcp.write_all(&buf[..n]) {
                    warn!("Client {} disconnected (serial→TCP): {}", peer, e);
                    ctx.events.warn(
                        None,
                        format!("Client {} disconnected (serial→TCP): {}", peer, e),
                    );
                    break;
                }
                ctx.info.bytes_to_tcp.fetch_add(n as u64, Ordering::Relaxed);
                ctx.report(Direction::SerialToTcp, &buf[..n]);
            }
            Err(ref e) if is_idle(e) => continue,
            Err(e) => {
                error!("Serial read failed: {}", e);
                ctx.events.error(None, format!("Serial read exception: {}", e));
                break;
            }
        }
    }

    ctx.cancel();
}

fn tcp_to_serial(
    tcp: &mut TcpStream,
    serial: &mut dyn SerialDevice,
    ctx: &SessionContext,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    let peer = ctx.info.peer_addr;

    while !ctx.cancelled() {
        match tcp.read(&mut buf) {
            Ok(0) => {
                info!("Client {} closed connection", peer);
                ctx.events
                    .info(None, format!("Client {} closed connection normally", peer));
                break;
            }
            Ok(n) => {
                if let Err(e) = serial.write_all(&buf[..n]).and_then(|_| serial.flush()) {
                    error!("Serial write failed: {}", e);
                    ctx.events.error(None, format!("Serial write failed: {}", e));
                    break;
                }
                ctx.info
                    .bytes_to_serial
                    .fetch_add(n as u64, Ordering::Relaxed);
                ctx.report(Direction::TcpToSerial, &buf[..n]);
            }
            Err(ref e) if is_idle(e) => continue,
            Err(e) => {
                warn!("Client {} disconnected: {}", peer, e);
                ctx.events
                    .warn(None, format!("Client {} disconnected: {}", peer, e));
                break;
            }
        }
    }

    ctx.cancel();
}

/// Publish each line of a forwarded chunk. Undecodable bytes are replaced.
pub fn report_lines(events: &EventBus, local_port: u16, direction: Direction, data: &[u8]) {
    let text = String::from_utf8_lossy(data);
    for line in text.split(&['\r', '\n'][..]) {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        debug!(local_port, %direction, "{}", line);
        events.publish(ConnectionEvent::Traffic {
            local_port,
            direction,
            line: line.to_string(),
        });
    }
}
