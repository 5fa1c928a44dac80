//! Detection channel: a persistent WebSocket connection to the detector.
//!
//! The socket is owned exclusively by a worker thread spawned at connect
//! time; callers talk to it over a bounded command channel, so there is
//! exactly one socket writer by construction. The worker doubles as the
//! keep-alive loop: whenever no command arrives within the keep-alive
//! interval it sends a liveness ping.
//!
//! Resilience policy:
//! - `connect` retries a bounded number of times with a fixed delay, then
//!   surfaces `ConnectError::MaxRetriesExceeded` and leaves state `Failed`.
//! - A request timeout skips the cycle and retries on the next tick; the
//!   connection is kept. Hard socket errors drop the connection and the
//!   worker reconnects on its own schedule, never blocking the caller.

pub mod wire;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::config::DetectorSettings;
use crate::detect::DetectionResult;
use crate::error::{ChannelError, ConnectError, TimeoutPhase};
use crate::frame::Frame;

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

/// Shared read handle for the connection state.
///
/// The channel worker is the single authoritative writer; everyone else
/// (scheduler, compositor, status overlay) reads.
#[derive(Debug)]
pub struct ConnectionStatus {
    state: AtomicU8,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
        }
    }

    pub fn get(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    fn set(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

enum Command {
    Detect {
        request_json: String,
        frame_id: String,
        reply: Sender<Result<DetectionResult, ChannelError>>,
    },
    Shutdown,
}

/// Client side of the detector service.
pub struct DetectionChannel {
    settings: DetectorSettings,
    status: Arc<ConnectionStatus>,
    shutdown: Arc<AtomicBool>,
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl DetectionChannel {
    pub fn new(settings: DetectorSettings) -> Self {
        Self {
            settings,
            status: Arc::new(ConnectionStatus::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            commands: None,
            worker: None,
        }
    }

    /// Shared connection-state handle for read-only observers.
    pub fn status(&self) -> Arc<ConnectionStatus> {
        Arc::clone(&self.status)
    }

    /// Establish the connection and start the socket worker.
    ///
    /// Retries up to the configured budget with a fixed inter-attempt
    /// delay; on exhaustion the state is left `Failed` and the error is
    /// surfaced. The worker is spawned either way, so later traffic and
    /// keep-alive ticks keep attempting reconnects on their own schedule.
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (socket, outcome) = match establish(&self.settings, &self.status, &self.shutdown) {
            Ok(socket) => (Some(socket), Ok(())),
            Err(e) => (None, Err(e)),
        };

        let (tx, rx) = bounded::<Command>(1);
        let worker = Worker {
            settings: self.settings.clone(),
            status: Arc::clone(&self.status),
            shutdown: Arc::clone(&self.shutdown),
            socket,
        };
        let join = std::thread::Builder::new()
            .name("detection-channel".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|e| ConnectError::Handshake {
                endpoint: self.settings.url.clone(),
                reason: format!("failed to spawn channel worker: {e}"),
            })?;

        self.commands = Some(tx);
        self.worker = Some(join);
        outcome
    }

    /// Send one frame for detection and wait for its result.
    ///
    /// Enforces two independent timeouts: a short one for the send and a
    /// longer one for the response. Either produces `ChannelError::Timeout`;
    /// the caller's next cycle is never blocked by recovery, which happens
    /// on the worker thread.
    pub fn send_and_await(&self, frame: &Frame) -> Result<DetectionResult, ChannelError> {
        let commands = self.commands.as_ref().ok_or(ChannelError::NotConnected)?;
        let request = wire::DetectionRequest::from_frame(frame, self.settings.jpeg_quality)?;
        let request_json = request.to_json()?;

        let (reply_tx, reply_rx) = bounded(1);
        commands
            .try_send(Command::Detect {
                request_json,
                frame_id: request.frame_id,
                reply: reply_tx,
            })
            .map_err(|e| match e {
                // Worker busy (usually mid-reconnect): skip this cycle.
                TrySendError::Full(_) => ChannelError::NotConnected,
                TrySendError::Disconnected(_) => ChannelError::Closed,
            })?;

        // The worker enforces the per-phase timeouts on the socket; this
        // outer deadline only covers a wedged worker.
        let deadline = self.settings.send_timeout + self.settings.response_timeout;
        match reply_rx.recv_timeout(deadline + Duration::from_millis(250)) {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                phase: TimeoutPhase::Response,
            }),
        }
    }

    /// Stop the worker and drop the connection. Idempotent.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Shutdown);
        }
        if let Some(join) = self.worker.take() {
            if join.join().is_err() {
                log::error!("detection channel worker panicked");
            }
        }
        self.status.set(ConnectionState::Disconnected);
    }
}

impl Drop for DetectionChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Dial the endpoint with the bounded retry budget.
///
/// The inter-attempt delay is sliced so a shutdown request interrupts it
/// promptly instead of waiting out the full delay.
fn establish(
    settings: &DetectorSettings,
    status: &ConnectionStatus,
    cancel: &AtomicBool,
) -> Result<Socket, ConnectError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        status.set(ConnectionState::Connecting);
        match dial(settings) {
            Ok(socket) => {
                status.set(ConnectionState::Connected);
                log::info!(
                    "connected to detector at {} (attempt {})",
                    settings.url,
                    attempts
                );
                return Ok(socket);
            }
            Err(e @ ConnectError::BadEndpoint { .. }) => {
                // Retrying cannot fix a malformed endpoint.
                status.set(ConnectionState::Failed);
                return Err(e);
            }
            Err(e) => {
                log::warn!(
                    "detector connection attempt {}/{} failed: {}",
                    attempts,
                    settings.max_connect_retries,
                    e
                );
                if attempts >= settings.max_connect_retries {
                    status.set(ConnectionState::Failed);
                    return Err(ConnectError::MaxRetriesExceeded { attempts });
                }
                let deadline = Instant::now() + settings.retry_delay;
                loop {
                    if cancel.load(Ordering::SeqCst) {
                        status.set(ConnectionState::Disconnected);
                        return Err(ConnectError::MaxRetriesExceeded { attempts });
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    std::thread::sleep(remaining.min(Duration::from_millis(50)));
                }
            }
        }
    }
}

/// One handshake attempt.
fn dial(settings: &DetectorSettings) -> Result<Socket, ConnectError> {
    let (socket, _response) =
        tungstenite::connect(settings.url.as_str()).map_err(|e| match e {
            tungstenite::Error::Url(e) => ConnectError::BadEndpoint {
                endpoint: settings.url.clone(),
                reason: e.to_string(),
            },
            other => ConnectError::Handshake {
                endpoint: settings.url.clone(),
                reason: other.to_string(),
            },
        })?;
    configure_timeouts(&socket, settings).map_err(|reason| ConnectError::Handshake {
        endpoint: settings.url.clone(),
        reason,
    })?;
    Ok(socket)
}

/// Put the underlying TCP stream into timed mode so neither direction can
/// hang. The two budgets are independent: sends get the short one (the
/// connection is already warm), reads the long one (remote inference
/// dominates latency).
fn configure_timeouts(socket: &Socket, settings: &DetectorSettings) -> Result<(), String> {
    match socket.get_ref() {
        MaybeTlsStream::Plain(stream) => {
            stream
                .set_read_timeout(Some(settings.response_timeout))
                .map_err(|e| e.to_string())?;
            stream
                .set_write_timeout(Some(settings.send_timeout))
                .map_err(|e| e.to_string())?;
        }
        _ => {}
    }
    Ok(())
}

/// The socket-owning worker. Runs on its own thread until shutdown.
struct Worker {
    settings: DetectorSettings,
    status: Arc<ConnectionStatus>,
    shutdown: Arc<AtomicBool>,
    socket: Option<Socket>,
}

impl Worker {
    fn run(mut self, commands: Receiver<Command>) {
        loop {
            match commands.recv_timeout(self.settings.keepalive_interval) {
                Ok(Command::Detect {
                    request_json,
                    frame_id,
                    reply,
                }) => {
                    let result = self.exchange(&request_json, &frame_id);
                    // Receiver may have timed out and moved on; that is fine.
                    let _ = reply.send(result);
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => self.keepalive(),
            }
        }
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None);
        }
        self.status.set(ConnectionState::Disconnected);
        log::debug!("detection channel worker exited");
    }

    /// One request/response exchange, with reconnect-on-hard-failure.
    fn exchange(
        &mut self,
        request_json: &str,
        frame_id: &str,
    ) -> Result<DetectionResult, ChannelError> {
        if self.socket.is_none() {
            // Previous cycle lost the connection; recover here, on the
            // worker's schedule, before admitting new traffic.
            self.reconnect();
        }
        let Some(socket) = self.socket.as_mut() else {
            return Err(ChannelError::NotConnected);
        };

        if let Err(e) = socket.send(Message::Text(request_json.to_string())) {
            log::warn!("detection send failed: {e}");
            self.drop_socket();
            return Err(send_error(e));
        }

        let deadline = Instant::now() + self.settings.response_timeout;
        loop {
            if Instant::now() >= deadline {
                // Skip-then-retry: the connection stays up, the scheduler
                // simply misses this cycle and tries again on its next tick.
                return Err(ChannelError::Timeout {
                    phase: TimeoutPhase::Response,
                });
            }
            let Some(socket) = self.socket.as_mut() else {
                return Err(ChannelError::NotConnected);
            };
            let message = match socket.read() {
                Ok(message) => message,
                Err(tungstenite::Error::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(ChannelError::Timeout {
                        phase: TimeoutPhase::Response,
                    });
                }
                Err(e) => {
                    log::warn!("detection read failed: {e}");
                    self.drop_socket();
                    return Err(ChannelError::Closed);
                }
            };
            match message {
                Message::Text(payload) => match wire::parse_incoming(&payload) {
                    Ok(wire::Incoming::DetectionResponse(body)) => {
                        let result = body.into_result()?;
                        if !result.frame_id.is_empty() && result.frame_id != frame_id {
                            // Late answer to an earlier, timed-out request.
                            log::debug!(
                                "discarding stale response for {} (awaiting {})",
                                result.frame_id,
                                frame_id
                            );
                            continue;
                        }
                        return Ok(result);
                    }
                    Ok(wire::Incoming::Pong { .. }) => continue,
                    Ok(wire::Incoming::Ping { .. }) => {
                        self.answer_ping();
                        continue;
                    }
                    Err(e) => return Err(ChannelError::Decode(e)),
                },
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => {
                    self.drop_socket();
                    return Err(ChannelError::Closed);
                }
                _ => continue,
            }
        }
    }

    /// Idle-time liveness ping. A failed ping drops the socket so the next
    /// exchange reconnects.
    fn keepalive(&mut self) {
        if self.socket.is_none() {
            self.reconnect();
            return;
        }
        let ping = match wire::Ping::now().to_json() {
            Ok(json) => json,
            Err(e) => {
                log::error!("failed to serialize ping: {e}");
                return;
            }
        };
        if let Some(socket) = self.socket.as_mut() {
            if let Err(e) = socket.send(Message::Text(ping)) {
                log::warn!("keepalive ping failed: {e}");
                self.drop_socket();
            }
        }
    }

    fn answer_ping(&mut self) {
        let Ok(pong) = wire::Pong::now().to_json() else {
            return;
        };
        if let Some(socket) = self.socket.as_mut() {
            if let Err(e) = socket.send(Message::Text(pong)) {
                log::warn!("pong failed: {e}");
                self.drop_socket();
            }
        }
    }

    fn drop_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None);
        }
        self.status.set(ConnectionState::Disconnected);
    }

    /// Bounded reconnect on the worker thread. Never blocks the caller's
    /// loop; while this runs the scheduler just sees timeouts.
    fn reconnect(&mut self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match establish(&self.settings, &self.status, &self.shutdown) {
            Ok(socket) => {
                self.socket = Some(socket);
                log::info!("detector connection re-established");
            }
            Err(e) => {
                log::warn!("reconnect failed: {e}");
            }
        }
    }
}

fn send_error(e: tungstenite::Error) -> ChannelError {
    match e {
        tungstenite::Error::Io(ref io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            ChannelError::Timeout {
                phase: TimeoutPhase::Send,
            }
        }
        _ => ChannelError::Closed,
    }
}
