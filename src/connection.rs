//! Per-device connection driver: TCP transport, session-key handshake,
//! heartbeat timers and the decode pipeline feeding the application stream.
//!
//! One background task owns the whole connection state (sequence counter,
//! session key, reassembly buffer, heartbeat counters), so key rotation and
//! sequence increments never race with queued outbound frames.

use crate::error::{Result, TuyaError};
use crate::heartbeat::{
    HEARTBEAT_PAYLOAD, HeartbeatAction, HeartbeatSupervisor, HeartbeatThresholds,
};
use crate::protocol::{self, CommandType, Frame, FrameBuffer, FrameEvent, Version};
use crate::session::SessionNegotiator;
use futures_core::Stream;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;

const DEFAULT_PORT: u16 = 6668;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_MIN: Duration = Duration::from_secs(30);
const RECONNECT_MAX: Duration = Duration::from_secs(600);
const READ_CHUNK: usize = 4096;

/// Static parameters for one device connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub local_key: Vec<u8>,
    pub version: Version,
    pub thresholds: HeartbeatThresholds,
    /// Reconnect with backoff after failures instead of giving up.
    pub persist: bool,
}

impl ConnectionConfig {
    pub fn new<I, H, K>(id: I, host: H, local_key: K, version: Version) -> Self
    where
        I: Into<String>,
        H: Into<String>,
        K: Into<Vec<u8>>,
    {
        Self {
            id: id.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            local_key: local_key.into(),
            version,
            thresholds: HeartbeatThresholds::default(),
            persist: true,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_thresholds(mut self, thresholds: HeartbeatThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

/// Mutable per-connection protocol state. Owned by the driver task; exactly
/// one logical writer at a time.
struct ConnectionContext {
    version: Version,
    local_key: Vec<u8>,
    session_key: Option<Vec<u8>>,
    seqno: u32,
}

impl ConnectionContext {
    fn new(version: Version, local_key: &[u8]) -> Self {
        Self {
            version,
            local_key: local_key.to_vec(),
            session_key: None,
            seqno: 1,
        }
    }

    /// Active cipher key: the negotiated session key once installed, the
    /// device's long-term local key before that.
    fn cipher_key(&self) -> &[u8] {
        self.session_key.as_deref().unwrap_or(&self.local_key)
    }

    fn next_seqno(&mut self) -> u32 {
        let s = self.seqno;
        self.seqno += 1;
        s
    }

    /// Replace the active key in place. No dual-key window: frames encoded
    /// with the old key are undecodable from this point on, which matches
    /// device behavior over in-order TCP.
    fn install_session_key(&mut self, key: Vec<u8>) {
        self.session_key = Some(key);
    }
}

/// Events delivered to subscribers of [`DeviceConnection::events`].
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    /// A verified, decrypted, non-heartbeat frame.
    Frame(Frame),
    /// The device answered a DP query with "data unvalid": retry with a
    /// different command.
    DpQueryUnsupported { seqno: u32 },
    /// Transport lost; the driver will reconnect if persist is set.
    Disconnected(Option<TuyaError>),
    /// Heartbeat supervision gave up on the connection.
    ConnectionDead,
}

enum DriverCommand {
    Submit {
        cmd: CommandType,
        data: Option<Value>,
        resp: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

struct SharedState {
    connected: bool,
    stopped: bool,
}

/// Handle to a device connection running on a background task.
#[derive(Clone)]
pub struct DeviceConnection {
    config: Arc<ConnectionConfig>,
    tx: mpsc::Sender<DriverCommand>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    shared: Arc<RwLock<SharedState>>,
    cancel: CancellationToken,
}

impl DeviceConnection {
    /// Spawn the connection driver. The connection is established lazily in
    /// the background; submit and subscribe immediately.
    pub fn new(config: ConnectionConfig) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let (events_tx, _) = broadcast::channel(16);
        let shared = Arc::new(RwLock::new(SharedState {
            connected: false,
            stopped: false,
        }));
        let cancel = CancellationToken::new();

        let conn = Self {
            config: Arc::new(config),
            tx,
            events_tx,
            shared,
            cancel,
        };
        let driver = conn.clone();
        tokio::spawn(async move { driver.run(rx).await });
        conn
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn version(&self) -> Version {
        self.config.version
    }

    pub fn is_connected(&self) -> bool {
        self.shared.read().connected
    }

    /// Enqueue an encode+send of one command.
    pub async fn submit_command(&self, cmd: CommandType, data: Option<Value>) -> Result<()> {
        let (resp, resp_rx) = oneshot::channel();
        self.tx
            .send(DriverCommand::Submit { cmd, data, resp })
            .await
            .map_err(|_| TuyaError::Offline)?;
        resp_rx.await.map_err(|_| TuyaError::Offline)?
    }

    /// Query the device's current datapoint state.
    pub async fn status(&self) -> Result<()> {
        self.submit_command(CommandType::DpQuery, None).await
    }

    /// Set one or more datapoints.
    pub async fn set_dps(&self, dps: Value) -> Result<()> {
        self.submit_command(CommandType::Control, Some(dps)).await
    }

    pub async fn set_value(&self, index: u32, value: Value) -> Result<()> {
        self.set_dps(serde_json::json!({ index.to_string(): value }))
            .await
    }

    /// Stream of connection events. Heartbeat frames never appear here.
    pub fn events(&self) -> impl Stream<Item = ConnectionEvent> + Send + 'static {
        let mut rx = self.events_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(ev) => yield ev,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Wait for the next connection event.
    pub async fn recv(&self) -> Result<ConnectionEvent> {
        let mut rx = self.events_tx.subscribe();
        loop {
            match rx.recv().await {
                Ok(ev) => return Ok(ev),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(TuyaError::Offline),
            }
        }
    }

    /// Drop the current transport; reconnects if persist is set.
    pub async fn close(&self) {
        let _ = self.tx.send(DriverCommand::Disconnect).await;
    }

    /// Stop the driver permanently.
    pub async fn stop(&self) {
        self.shared.write().stopped = true;
        self.cancel.cancel();
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    // -- driver ------------------------------------------------------------

    async fn run(self, mut rx: mpsc::Receiver<DriverCommand>) {
        let mut failures = 0u32;
        loop {
            if self.cancel.is_cancelled() || self.shared.read().stopped {
                break;
            }

            if failures > 0 {
                let backoff = backoff_duration(failures - 1);
                warn!(
                    "device {}: retrying in {}s (failure {})",
                    self.config.id,
                    backoff.as_secs(),
                    failures
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = sleep(backoff) => {}
                }
            }

            match self.connect_and_drive(&mut rx).await {
                Ok(()) => break, // stopped or all handles dropped
                Err(e) => {
                    self.shared.write().connected = false;
                    if e.is_fatal() {
                        self.emit(ConnectionEvent::ConnectionDead);
                    }
                    self.emit(ConnectionEvent::Disconnected(Some(e)));
                    if !self.config.persist {
                        break;
                    }
                    failures += 1;
                }
            }
        }
        self.drain(&mut rx);
        debug!("driver for {} exited", self.config.id);
    }

    async fn connect_and_drive(&self, rx: &mut mpsc::Receiver<DriverCommand>) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("connecting to {} at {}", self.config.id, addr);
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(TuyaError::from)?;

        let mut ctx = ConnectionContext::new(self.config.version, &self.config.local_key);
        let mut fb = FrameBuffer::new(self.config.version);

        if self.config.version.negotiates_session_key() {
            negotiate(&mut stream, &mut ctx, &mut fb).await?;
            info!("session key negotiated for {}", self.config.id);
        }

        self.shared.write().connected = true;
        self.emit(ConnectionEvent::Connected);

        let result = self.drive(stream, &mut ctx, &mut fb, rx).await;
        self.shared.write().connected = false;
        if result.is_ok() {
            self.emit(ConnectionEvent::Disconnected(None));
        }
        result
    }

    async fn drive(
        &self,
        stream: TcpStream,
        ctx: &mut ConnectionContext,
        fb: &mut FrameBuffer,
        rx: &mut mpsc::Receiver<DriverCommand>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let mut supervisor = HeartbeatSupervisor::new(self.config.thresholds);
        let thresholds = supervisor.thresholds();
        let mut last_received = Instant::now();
        let mut last_sent = Instant::now();
        let mut idle_check = interval_at(Instant::now() + thresholds.writer_idle, thresholds.writer_idle);
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),

                cmd = rx.recv() => match cmd {
                    None => {
                        debug!("all handles for {} dropped", self.config.id);
                        self.shared.write().stopped = true;
                        return Ok(());
                    }
                    Some(DriverCommand::Disconnect) => {
                        return Err(TuyaError::Io("explicit disconnect".into()));
                    }
                    Some(DriverCommand::Submit { cmd, data, resp }) => {
                        let outcome = self.send_command(&mut writer, ctx, cmd, data).await;
                        if outcome.is_ok() {
                            last_sent = Instant::now();
                        }
                        let failed = outcome.is_err();
                        let _ = resp.send(outcome.clone());
                        if failed {
                            return outcome;
                        }
                    }
                },

                res = reader.read(&mut chunk) => {
                    let n = res.map_err(TuyaError::from)?;
                    if n == 0 {
                        return Err(TuyaError::Io("connection closed by device".into()));
                    }
                    last_received = Instant::now();
                    fb.extend(&chunk[..n]);
                    while let Some(event) = fb.next_event(ctx.cipher_key()) {
                        self.dispatch(event, &mut supervisor);
                    }
                },

                _ = idle_check.tick() => {
                    if last_received.elapsed() >= thresholds.reader_idle {
                        supervisor.on_reader_idle();
                        return Err(TuyaError::ConnectionDead);
                    }
                    if last_sent.elapsed() >= thresholds.writer_idle {
                        match supervisor.on_writer_idle() {
                            HeartbeatAction::ConnectionDead => {
                                return Err(TuyaError::ConnectionDead);
                            }
                            HeartbeatAction::SendHeartbeat => {
                                debug!("heartbeat probe to {}", self.config.id);
                                self.write_frame(
                                    &mut writer,
                                    ctx,
                                    CommandType::HeartBeat,
                                    HEARTBEAT_PAYLOAD,
                                )
                                .await?;
                                last_sent = Instant::now();
                            }
                        }
                    }
                },
            }
        }
    }

    fn dispatch(&self, event: FrameEvent, supervisor: &mut HeartbeatSupervisor) {
        match event {
            FrameEvent::Frame(frame) if frame.is_heartbeat() => {
                supervisor.on_heartbeat_reply();
            }
            FrameEvent::Frame(frame) => {
                debug!(
                    "frame from {}: cmd=0x{:02x}, {} payload bytes",
                    self.config.id,
                    frame.cmd,
                    frame.payload.len()
                );
                self.emit(ConnectionEvent::Frame(frame));
            }
            FrameEvent::DpQueryUnsupported { seqno } => {
                self.emit(ConnectionEvent::DpQueryUnsupported { seqno });
            }
            FrameEvent::Corrupt(reason) => {
                // Dropped frame; repeated occurrences are a health signal for
                // the caller, not a teardown condition here.
                warn!("dropped corrupt frame from {}: {}", self.config.id, reason);
            }
        }
    }

    async fn send_command<W: AsyncWriteExt + Unpin>(
        &self,
        writer: &mut W,
        ctx: &mut ConnectionContext,
        cmd: CommandType,
        data: Option<Value>,
    ) -> Result<()> {
        let (cmd, payload) = command_payload(&self.config.id, ctx.version, cmd, data)?;
        self.write_frame(writer, ctx, cmd, &payload).await
    }

    async fn write_frame<W: AsyncWriteExt + Unpin>(
        &self,
        writer: &mut W,
        ctx: &mut ConnectionContext,
        cmd: CommandType,
        payload: &[u8],
    ) -> Result<()> {
        let seqno = ctx.next_seqno();
        let encoded = protocol::encode(cmd, payload, ctx.version, ctx.cipher_key(), seqno)?;
        timeout(CONNECT_TIMEOUT, writer.write_all(&encoded))
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(TuyaError::from)
    }

    fn drain(&self, rx: &mut mpsc::Receiver<DriverCommand>) {
        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            if let DriverCommand::Submit { resp, .. } = cmd {
                let _ = resp.send(Err(TuyaError::Offline));
            }
        }
    }
}

/// Run the three-message key exchange on a fresh stream. On success the new
/// session key is installed before any other frame is encoded, so no frame
/// ever goes out under a stale key.
async fn negotiate(
    stream: &mut TcpStream,
    ctx: &mut ConnectionContext,
    fb: &mut FrameBuffer,
) -> Result<()> {
    let mut negotiator = SessionNegotiator::new(ctx.version, &ctx.local_key);
    let start = negotiator.begin()?;

    let seqno = ctx.next_seqno();
    let encoded = protocol::encode(
        start.cmd,
        &start.payload,
        ctx.version,
        ctx.cipher_key(),
        seqno,
    )?;
    stream.write_all(&encoded).await.map_err(TuyaError::from)?;

    let response = read_frame(stream, fb, ctx.cipher_key()).await.map_err(|e| {
        if matches!(e, TuyaError::Io(_)) {
            // A device that drops the link right after the start message
            // almost always means a wrong local key or version.
            TuyaError::NegotiationFailed("device closed during handshake".into())
        } else {
            e
        }
    })?;

    let outcome = negotiator.on_response(&response)?;
    let seqno = ctx.next_seqno();
    let encoded = protocol::encode(
        outcome.finish.cmd,
        &outcome.finish.payload,
        ctx.version,
        ctx.cipher_key(),
        seqno,
    )?;
    stream.write_all(&encoded).await.map_err(TuyaError::from)?;

    ctx.install_session_key(outcome.session_key);
    Ok(())
}

/// Read until one verified frame is available, dropping corrupt regions.
async fn read_frame(stream: &mut TcpStream, fb: &mut FrameBuffer, key: &[u8]) -> Result<Frame> {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        while let Some(event) = fb.next_event(key) {
            match event {
                FrameEvent::Frame(frame) => return Ok(frame),
                FrameEvent::DpQueryUnsupported { .. } => continue,
                FrameEvent::Corrupt(reason) => {
                    warn!("dropped corrupt frame during handshake: {}", reason);
                }
            }
        }
        let n = timeout(CONNECT_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(TuyaError::from)?;
        if n == 0 {
            return Err(TuyaError::Io("connection closed".into()));
        }
        fb.extend(&chunk[..n]);
    }
}

/// Build the JSON body for an application command, applying the version
/// specific command mapping (v3.4+ replaces Control/DpQuery with their
/// "new" forms and nests datapoints under a protocol-5 envelope).
fn command_payload(
    id: &str,
    version: Version,
    cmd: CommandType,
    data: Option<Value>,
) -> Result<(CommandType, Vec<u8>)> {
    if cmd == CommandType::HeartBeat {
        return Ok((cmd, HEARTBEAT_PAYLOAD.to_vec()));
    }

    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mapped = if version.val() >= 3.4 {
        match cmd {
            CommandType::Control => CommandType::ControlNew,
            CommandType::DpQuery => CommandType::DpQueryNew,
            other => other,
        }
    } else {
        cmd
    };

    let body = if version.val() >= 3.4 && mapped == CommandType::ControlNew {
        serde_json::json!({
            "protocol": 5,
            "t": t,
            "data": { "dps": data.unwrap_or(Value::Null) },
        })
    } else if version.val() >= 3.4 && mapped == CommandType::DpQueryNew {
        data.unwrap_or_else(|| serde_json::json!({}))
    } else {
        let mut obj = serde_json::json!({
            "gwId": id,
            "devId": id,
            "uid": id,
            "t": t.to_string(),
        });
        if let Some(d) = data {
            obj["dps"] = d;
        }
        obj
    };

    Ok((mapped, serde_json::to_vec(&body)?))
}

fn backoff_duration(failure_count: u32) -> Duration {
    let secs = (2u64.pow(failure_count.min(6)) * RECONNECT_MIN.as_secs())
        .min(RECONNECT_MAX.as_secs());
    Duration::from_secs(secs)
}
