//! Tuya device session over a single TCP connection.
//! Handles sequence numbers, payload generation, device-type fallback, heartbeats
//! and the request/response exchange.

use crate::config::DeviceConfig;
use crate::crypto::{DecodedPayload, TuyaCipher};
use crate::dispatcher::{MessageDispatcher, PendingResponse};
use crate::error::{Result, TuyaError};
use crate::protocol::{Command, CommandType, DeviceType, TuyaMessage, Version, pack_message};
use futures_core::stream::Stream;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PORT: u16 = 6668;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const SLEEP_HEARTBEAT_DEFAULT: Duration = Duration::from_secs(20);

const READ_BUFFER_SIZE: usize = 1024;
const CHAN_BROADCAST_CAPACITY: usize = 32;

/// Index ranges probed by [`Device::detect_available_dps`]. Requests are split
/// because devices reject query payloads above 255 bytes.
const DETECT_RANGES: [(u32, u32); 4] = [(2, 11), (11, 21), (21, 31), (100, 111)];

const KEY_DPS: &str = "dps";
const KEY_T: &str = "t";
const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";

/// Callback invoked with every decoded status document (`{"dps": {...}}`).
///
/// Runs on the connection's reader task and must not block.
pub type StatusListener = Arc<dyn Fn(&Value) + Send + Sync>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

struct DeviceState {
    dev_type: DeviceType,
    connection: ConnectionState,
    dps_to_request: Map<String, Value>,
    dps_cache: Map<String, Value>,
}

/// Session state shared with the receive path.
struct Shared {
    id: String,
    version: Version,
    cipher: TuyaCipher,
    state: RwLock<DeviceState>,
    listener: Option<StatusListener>,
    status_tx: broadcast::Sender<Value>,
}

impl Shared {
    fn dev_type(&self) -> DeviceType {
        self.state.read().dev_type
    }

    /// Decode a payload for a frame sent as `dev_type`, switching the session to
    /// type-D on a shape mismatch.
    fn decode(&self, payload: &[u8], dev_type: DeviceType) -> Result<DecodedPayload> {
        let decoded = self.cipher.decode_payload(self.version, dev_type, payload)?;
        if decoded == DecodedPayload::DeviceTypeMismatch && dev_type == DeviceType::TypeA {
            let mut state = self.state.write();
            if state.dev_type == DeviceType::TypeA {
                info!(
                    "Device {}: payload shape rejected, switching to {}",
                    self.id,
                    DeviceType::TypeD
                );
                state.dev_type = DeviceType::TypeD;
            }
        }
        Ok(decoded)
    }

    fn handle_push(&self, msg: TuyaMessage) {
        match self.decode(&msg.payload, self.dev_type()) {
            Ok(DecodedPayload::Json(status)) => self.publish_status(&status),
            Ok(DecodedPayload::DeviceTypeMismatch) => {
                debug!("Ignoring rejected status push from {}", self.id)
            }
            Err(e) => warn!("Failed to decode status push from {}: {}", self.id, e),
        }
    }

    /// Merge a status document into the cache and notify subscribers.
    fn publish_status(&self, status: &Value) {
        let Some(dps) = status.get(KEY_DPS).and_then(Value::as_object) else {
            return;
        };
        {
            let mut state = self.state.write();
            for (k, v) in dps {
                state.dps_cache.insert(k.clone(), v.clone());
            }
        }
        if let Some(listener) = &self.listener {
            listener(status);
        }
        let _ = self.status_tx.send(status.clone());
    }
}

struct DeviceInner {
    shared: Arc<Shared>,
    dispatcher: Arc<MessageDispatcher>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    seqno: AtomicU32,
    exchange_timeout: Duration,
    cancel_token: CancellationToken,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.dispatcher.abort();
    }
}

/// Builder for a [`Device`] session.
pub struct DeviceBuilder {
    id: String,
    address: String,
    local_key: Vec<u8>,
    version: Version,
    port: u16,
    connection_timeout: Duration,
    exchange_timeout: Duration,
    dps: Vec<String>,
    listener: Option<StatusListener>,
    initial_status: bool,
}

impl DeviceBuilder {
    pub fn new<I, K>(id: I, local_key: K) -> Self
    where
        I: Into<String>,
        K: Into<Vec<u8>>,
    {
        Self {
            id: id.into(),
            address: String::new(),
            local_key: local_key.into(),
            version: Version::V3_3,
            port: DEFAULT_PORT,
            connection_timeout: DEFAULT_TIMEOUT,
            exchange_timeout: DEFAULT_TIMEOUT,
            dps: Vec::new(),
            listener: None,
            initial_status: false,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.id.clone(), config.local_key.clone())
            .address(config.address.clone())
            .version(config.version)
            .port(config.port)
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .exchange_timeout(Duration::from_secs(config.exchange_timeout_secs))
            .dps_to_request(config.dps.iter())
    }

    pub fn address<A: Into<String>>(mut self, address: A) -> Self {
        self.address = address.into();
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Datapoints to include in type-D status queries.
    pub fn dps_to_request<I, D>(mut self, indices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: ToString,
    {
        self.dps.extend(indices.into_iter().map(|d| d.to_string()));
        self
    }

    pub fn listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Query the device status right after connecting.
    pub fn initial_status(mut self, enabled: bool) -> Self {
        self.initial_status = enabled;
        self
    }

    /// Open the TCP connection and start the session.
    pub async fn connect(self) -> Result<Device> {
        let shared = self.build_shared()?;
        let addr = format!("{}:{}", self.address, self.port);

        shared.state.write().connection = ConnectionState::Connecting;
        info!("Connecting to device {} at {}", self.id, addr);
        let stream = timeout(self.connection_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TuyaError::ConnectionFailed(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| TuyaError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let device = Device::start(shared, stream, self.exchange_timeout);
        if self.initial_status {
            debug!("Retrieving initial state");
            if let Err(e) = device.status().await {
                device.close().await;
                return Err(e);
            }
        }
        Ok(device)
    }

    /// Start a session over an already connected stream.
    pub fn with_stream<S>(self, stream: S) -> Result<Device>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = self.build_shared()?;
        Ok(Device::start(shared, stream, self.exchange_timeout))
    }

    fn build_shared(&self) -> Result<Arc<Shared>> {
        let cipher = TuyaCipher::new(&self.local_key)?;
        let dps_to_request = self
            .dps
            .iter()
            .map(|d| (d.clone(), Value::Null))
            .collect();
        let (status_tx, _) = broadcast::channel(CHAN_BROADCAST_CAPACITY);

        Ok(Arc::new(Shared {
            id: self.id.clone(),
            version: self.version,
            cipher,
            state: RwLock::new(DeviceState {
                dev_type: DeviceType::TypeA,
                connection: ConnectionState::Disconnected,
                dps_to_request,
                dps_cache: Map::new(),
            }),
            listener: self.listener.clone(),
            status_tx,
        }))
    }
}

/// Connect to a device with default port and timeouts and fetch its status once.
///
/// Type-D devices only report requested datapoints; use
/// [`DeviceBuilder::dps_to_request`] with [`DeviceBuilder::initial_status`] to
/// have them included in the first query.
pub async fn connect<F>(
    address: &str,
    device_id: &str,
    local_key: &str,
    version: Version,
    listener: F,
) -> Result<Device>
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    DeviceBuilder::new(device_id, local_key)
        .address(address)
        .version(version)
        .listener(listener)
        .initial_status(true)
        .connect()
        .await
}

/// A connected Tuya device session. Cheap to clone.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn builder<I, K>(id: I, local_key: K) -> DeviceBuilder
    where
        I: Into<String>,
        K: Into<Vec<u8>>,
    {
        DeviceBuilder::new(id, local_key)
    }

    fn start<S>(shared: Arc<Shared>, stream: S, exchange_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let handler_shared = shared.clone();
        let dispatcher = Arc::new(MessageDispatcher::new(move |msg| {
            handler_shared.handle_push(msg)
        }));

        let inner = Arc::new(DeviceInner {
            shared,
            dispatcher,
            writer: tokio::sync::Mutex::new(Some(Box::new(write_half))),
            seqno: AtomicU32::new(0),
            exchange_timeout,
            cancel_token: CancellationToken::new(),
        });

        debug!("Connected to device {}", inner.shared.id);
        inner.shared.state.write().connection = ConnectionState::Connected;

        Self::spawn_reader(Arc::downgrade(&inner), read_half);
        Self::spawn_heartbeat(Arc::downgrade(&inner));
        Self { inner }
    }

    fn spawn_reader<R>(weak: Weak<DeviceInner>, mut read_half: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let dispatcher = inner.dispatcher.clone();
        let token = inner.cancel_token.clone();
        let id = inner.shared.id.clone();
        drop(inner);

        tokio::spawn(async move {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    res = read_half.read(&mut buf) => match res {
                        Ok(0) => {
                            info!("Connection to device {} closed by peer", id);
                            break;
                        }
                        Ok(n) => {
                            debug!("Received data: {}", hex::encode(&buf[..n]));
                            dispatcher.add_data(&buf[..n]);
                        }
                        Err(e) => {
                            warn!("Read error from device {}: {}", id, e);
                            break;
                        }
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                Device { inner }.close().await;
            }
            debug!("Reader task for {} stopped", id);
        });
    }

    fn spawn_heartbeat(weak: Weak<DeviceInner>) {
        let Some(token) = weak.upgrade().map(|inner| inner.cancel_token.clone()) else {
            return;
        };

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SLEEP_HEARTBEAT_DEFAULT);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let device = Device { inner };
                        if let Err(e) = device.heartbeat().await {
                            warn!("Heartbeat failed for {}: {}", device.id(), e);
                            if e == TuyaError::TransportClosed {
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.inner.shared.id
    }

    pub fn version(&self) -> Version {
        self.inner.shared.version
    }

    pub fn dev_type(&self) -> DeviceType {
        self.inner.shared.dev_type()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.shared.state.read().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Datapoint indices sent (with null values) in type-D status queries.
    pub fn dps_to_request(&self) -> Vec<String> {
        self.inner.shared.state.read().dps_to_request.keys().cloned().collect()
    }

    /// Last known value of every datapoint reported so far.
    pub fn cached_dps(&self) -> Map<String, Value> {
        self.inner.shared.state.read().dps_cache.clone()
    }

    /// Number of exchanges currently waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.dispatcher.pending_count()
    }

    /// Stream of every status document, ending when the session closes.
    pub fn stream(&self) -> impl Stream<Item = Value> + Send + 'static {
        let mut rx = self.inner.shared.status_tx.subscribe();
        let token = self.inner.cancel_token.clone();
        async_stream::stream! {
            loop {
                let item = tokio::select! {
                    _ = token.cancelled() => None,
                    res = rx.recv() => Some(res),
                };
                match item {
                    Some(Ok(status)) => yield status,
                    Some(Err(broadcast::error::RecvError::Lagged(n))) => {
                        warn!("Status stream lagged, {} update(s) dropped", n);
                    }
                    Some(Err(broadcast::error::RecvError::Closed)) => break,
                    None => {
                        // Hand out what was queued before the close
                        loop {
                            match rx.try_recv() {
                                Ok(status) => yield status,
                                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                                Err(_) => break,
                            }
                        }
                        break;
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Device Control API
    // -------------------------------------------------------------------------

    /// Queries the current status of the device.
    pub async fn status(&self) -> Result<Option<Value>> {
        self.exchange(Command::Status, None).await
    }

    /// Sets the value (bool, number or string) of a single datapoint.
    pub async fn set_dps<V, D>(&self, value: V, dps_index: D) -> Result<Option<Value>>
    where
        V: Into<Value>,
        D: ToString,
    {
        let mut dps = Map::new();
        dps.insert(dps_index.to_string(), value.into());
        self.exchange(Command::Set, Some(Value::Object(dps))).await
    }

    /// Adds datapoints to be included in status queries.
    pub fn add_dps_to_request<I, D>(&self, indices: I)
    where
        I: IntoIterator<Item = D>,
        D: ToString,
    {
        let mut state = self.inner.shared.state.write();
        for index in indices {
            state.dps_to_request.insert(index.to_string(), Value::Null);
        }
    }

    /// Returns the datapoints supported by the device.
    ///
    /// Type-A devices report everything in one answer. Type-D devices only
    /// report what is requested, so every index range is probed.
    pub async fn detect_available_dps(&self) -> Result<Map<String, Value>> {
        let saved = self.inner.shared.state.read().dps_to_request.clone();
        let result = self.probe_dps().await;
        self.inner.shared.state.write().dps_to_request = saved;
        result
    }

    async fn probe_dps(&self) -> Result<Map<String, Value>> {
        let mut detected = Map::new();

        for (start, end) in DETECT_RANGES {
            // dps 1 must always be sent, otherwise the query fails when no
            // dps of the range exists
            {
                let mut state = self.inner.shared.state.write();
                state.dps_to_request.clear();
                state.dps_to_request.insert("1".to_string(), Value::Null);
            }
            self.add_dps_to_request(start..end);

            let data = match self.status().await {
                Ok(Some(data)) => data,
                Ok(None) if !self.is_connected() => return Err(TuyaError::TransportClosed),
                Ok(None) => Value::Null,
                Err(e) => {
                    warn!("Failed to get status: {}", e);
                    return Err(e);
                }
            };
            if let Some(dps) = data.get(KEY_DPS).and_then(Value::as_object) {
                detected.extend(dps.clone());
            }

            if self.dev_type() == DeviceType::TypeA {
                return Ok(detected);
            }
        }
        Ok(detected)
    }

    /// Sends a heartbeat. No response is awaited.
    pub async fn heartbeat(&self) -> Result<()> {
        let (cmd, payload) = self.generate_payload(Command::HeartBeat, None, self.dev_type())?;
        self.write_frame(cmd, payload, false).await.map(|_| ())
    }

    /// Send a command and wait for the correlated response.
    ///
    /// Returns `Ok(None)` when the session closed while waiting. If the device
    /// rejects the payload shape the request is re-sent once as type-D.
    pub async fn exchange(&self, command: Command, data: Option<Value>) -> Result<Option<Value>> {
        let mut resent = false;
        loop {
            let dev_type = self.dev_type();
            debug!("Sending command {:?} (device type: {})", command, dev_type);

            let (cmd, payload) = self.generate_payload(command, data.clone(), dev_type)?;
            let Some(pending) = self.write_frame(cmd, payload, true).await? else {
                return Ok(None);
            };
            let seqno = pending.seqno();

            let Some(msg) = pending.wait(self.inner.exchange_timeout).await? else {
                debug!("Wait was aborted for {}", seqno);
                return Ok(None);
            };

            // Decode with the type the request went out as; a concurrent
            // exchange may already have switched the session.
            let decoded = self.inner.shared.decode(&msg.payload, dev_type)?;
            let mismatch = decoded == DecodedPayload::DeviceTypeMismatch;

            if (mismatch || dev_type != self.dev_type()) && !resent {
                debug!(
                    "Re-send {:?} due to device type change ({} -> {})",
                    command,
                    dev_type,
                    self.dev_type()
                );
                resent = true;
                continue;
            }

            return match decoded {
                DecodedPayload::Json(value) => {
                    self.inner.shared.publish_status(&value);
                    Ok(Some(value))
                }
                DecodedPayload::DeviceTypeMismatch => Ok(None),
            };
        }
    }

    /// Closes the connection and wakes every pending exchange. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.inner.shared.state.write();
            if state.connection == ConnectionState::Closed {
                return;
            }
            state.connection = ConnectionState::Closed;
        }
        info!("Closing connection to device {}", self.id());

        self.inner.cancel_token.cancel();
        let writer = self.inner.writer.lock().await.take();
        self.inner.dispatcher.abort();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    // -------------------------------------------------------------------------
    // Internal Communication Helpers
    // -------------------------------------------------------------------------

    fn get_timestamp(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Build the wire command and (encrypted) payload for a request.
    fn generate_payload(
        &self,
        command: Command,
        data: Option<Value>,
        dev_type: DeviceType,
    ) -> Result<(u32, Vec<u8>)> {
        let cmd = command.command_type(dev_type);
        let id = self.id();

        let mut json = Map::new();
        match (command, dev_type) {
            (Command::HeartBeat, _) => {}
            (Command::Status, DeviceType::TypeA) => {
                json.insert(KEY_GW_ID.into(), id.into());
                json.insert(KEY_DEV_ID.into(), id.into());
            }
            _ => {
                json.insert(KEY_DEV_ID.into(), id.into());
                json.insert(KEY_UID.into(), id.into());
                json.insert(KEY_T.into(), self.get_timestamp().to_string().into());
            }
        }

        if let Some(d) = data {
            json.insert(KEY_DPS.into(), d);
        }
        if cmd == CommandType::ControlNew {
            let requested = self.inner.shared.state.read().dps_to_request.clone();
            json.insert(KEY_DPS.into(), Value::Object(requested));
        }

        let plaintext = serde_json::to_vec(&Value::Object(json))?;
        debug!("payload={}", String::from_utf8_lossy(&plaintext));

        let payload =
            self.inner
                .shared
                .cipher
                .encode_payload(self.version(), cmd as u32, &plaintext);
        Ok((cmd as u32, payload))
    }

    /// Write one frame. Sequence allocation, waiter registration and the write
    /// share the writer lock so frames never interleave.
    async fn write_frame(
        &self,
        cmd: u32,
        payload: Vec<u8>,
        expect_response: bool,
    ) -> Result<Option<PendingResponse>> {
        let mut writer = self.inner.writer.lock().await;
        let stream = writer.as_mut().ok_or(TuyaError::TransportClosed)?;

        let seqno = self.inner.seqno.fetch_add(1, Ordering::SeqCst);
        let pending = if expect_response {
            Some(self.inner.dispatcher.register(seqno)?)
        } else {
            None
        };

        let packed = pack_message(&TuyaMessage::new(seqno, cmd, payload))?;
        debug!(
            "Sending frame: cmd=0x{:02X}, seqno={}, data={}",
            cmd,
            seqno,
            hex::encode(&packed)
        );

        timeout(self.inner.exchange_timeout, async {
            stream.write_all(&packed).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| TuyaError::Io("Write timeout".to_string()))??;

        Ok(pending)
    }
}
