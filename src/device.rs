//! Individual Tuya device communication and state management.
//! Handles TCP connection, handshakes, heartbeats, and command/response flows.

use crate::crypto::TuyaCipher;
use crate::dispatcher::{HEARTBEAT_SEQNO, RESET_SEQNO, WaiterTable};
use crate::error::{
    ERR_DEVTYPE, ERR_JSON, ERR_OFFLINE, ERR_SUCCESS, Result, TuyaError, get_error_message,
};
use crate::handshake;
use crate::payload::{self, DeviceType, EnvelopeParams};
use crate::protocol::{
    CommandType, PREFIX_55AA, PREFIX_6699, TuyaHeader, TuyaMessage, Version, pack_message,
    parse_header, unpack_message,
};
use crate::scanner::Scanner;
use futures_core::stream::Stream;
use log::{debug, error, info, warn};
use rand::RngCore;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

// Standardized Sleep Durations
const SLEEP_HEARTBEAT_CHECK: Duration = Duration::from_secs(5);
const SLEEP_RECONNECT_MIN: Duration = Duration::from_secs(30);
const SLEEP_RECONNECT_MAX: Duration = Duration::from_secs(600); // 10 minutes
/// Deadline for a single exchange (§4.6).
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
/// Heartbeat cadence: a heartbeat is sent once this long has passed since
/// the last frame was sent on the connection (§4.6 / §6).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// A device that hasn't sent anything back in this long is considered
/// non-responsive; the transport is torn down and reconnection takes over.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

const DEV_TYPE_DEVICE22: &str = "device22";
const DEV_TYPE_DEFAULT: &str = "default";

const PAYLOAD_RAW: &str = "payload_raw";
const ERR_CODE: &str = "Err";
const ERR_MSG: &str = "Error";
const ERR_PAYLOAD_OBJ: &str = "Payload";

const ADDR_AUTO: &str = "Auto";
const DATA_UNVALID: &str = "data unvalid";

/// DP ranges swept by `detect_available_dps`, in order, plus DP 1 up front.
const DP_PROBE_RANGES: &[(u32, u32)] = &[(2, 10), (11, 20), (21, 30), (100, 110)];

/// Capability implemented by hosts that want to observe a device outside of
/// the request/response flow: unsolicited status pushes and the single
/// "the transport is gone" notification.
pub trait DeviceListener: Send + Sync {
    /// Called with the full DP-cache snapshot whenever a STATUS frame
    /// arrives unsolicited, and after every successful `status()` call.
    fn status_updated(&self, dps: &Value);
    /// Called exactly once when the transport closes.
    fn disconnected(&self);
}

/// Represents a sub-device (Zigbee/Bluetooth/etc.) connected via a Tuya gateway.
///
/// Sub-devices share the parent gateway's TCP connection but are identified
/// by a unique Node ID (CID).
#[derive(Clone)]
pub struct SubDevice {
    parent: Device,
    cid: String,
}

impl SubDevice {
    /// Create a new SubDevice handle.
    pub(crate) fn new(parent: Device, cid: &str) -> Self {
        Self {
            parent,
            cid: cid.to_string(),
        }
    }

    /// Returns the Node ID (CID) of this sub-device.
    pub fn id(&self) -> &str {
        &self.cid
    }

    /// Queries the current status of this sub-device.
    pub async fn status(&self) -> Result<Value> {
        let reply = self
            .parent
            .exchange(CommandType::DpQuery, None, Some(&self.cid), None)
            .await?;
        self.parent.extract_dps(reply)
    }

    /// Sets DP values on this sub-device.
    pub async fn set_dps(&self, dps: Value) -> Result<()> {
        self.parent
            .exchange(CommandType::Control, Some(dps), Some(&self.cid), None)
            .await?;
        Ok(())
    }

    /// Sets a single Data Point (DP) value on this sub-device.
    pub async fn set_value(&self, index: u32, value: Value) -> Result<()> {
        self.set_dps(serde_json::json!({ index.to_string(): value }))
            .await
    }
}

/// How an outbound request's reply should be correlated.
#[derive(Clone, Copy, PartialEq, Eq)]
enum WaitKey {
    /// Wait on the real seqno assigned to this message.
    Seqno,
    /// Wait on the reserved heartbeat virtual seqno.
    Heartbeat,
    /// Wait on the reserved reset virtual seqno.
    Reset,
    /// Don't wait at all; resolve as soon as the bytes are written.
    FireAndForget,
}

/// Internal commands for the background connection task.
enum DeviceCommand {
    Request {
        command: CommandType,
        data: Option<Value>,
        cid: Option<String>,
        req_type: Option<String>,
        wait_key: WaitKey,
        resp_tx: oneshot::Sender<Result<Option<TuyaMessage>>>,
    },
    Disconnect,
}

impl DeviceCommand {
    fn fail(self, err: TuyaError) {
        if let DeviceCommand::Request { resp_tx, .. } = self {
            let _ = resp_tx.send(Err(err));
        }
    }
}

/// Internal state of a Tuya device that needs to be shared and mutable.
struct DeviceState {
    config_address: String,
    real_ip: String,
    version: Version,
    dev_type: String,
    connected: bool,
    last_received: Instant,
    last_sent: Instant,
    stopped: bool,
    persist: bool,
    session_key: Option<Vec<u8>>,
    failure_count: u32,
}

/// Represents a Tuya device and handles communication.
#[derive(Clone)]
pub struct Device {
    id: String,
    local_key: Vec<u8>,
    port: u16,
    connection_timeout: Duration,

    // Shared mutable state
    state: Arc<RwLock<DeviceState>>,

    // Channel to send messages to the background task
    tx: Option<mpsc::Sender<DeviceCommand>>,

    // Broadcaster for received messages (raw stream, used by `stream()`/`receive()`)
    broadcast_tx: tokio::sync::broadcast::Sender<TuyaMessage>,
    // Shared scanner to avoid repeated socket creation
    scanner: Arc<Scanner>,

    // Seqno-correlated response waiters, shared between the writer and reader halves.
    waiters: Arc<WaiterTable>,
    // Last-known value of every DP reported by the device.
    dp_cache: Arc<RwLock<Map<String, Value>>>,
    // DP ids the next `type_0d` DP_QUERY should ask for.
    pending_dps: Arc<RwLock<BTreeSet<u32>>>,
    // Optional host-supplied status/disconnect observer.
    listener: Arc<RwLock<Option<Arc<dyn DeviceListener>>>>,

    // Token for stopping the device and its background tasks
    cancel_token: CancellationToken,
}

impl Device {
    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Initialize device with ID, address, local key, and protocol version.
    ///
    /// Address can be "Auto" for automatic discovery on the local network.
    /// Version can be provided as a string (e.g., "3.3") or using the Version enum.
    pub fn new<I, A, K, V>(id: I, address: A, local_key: K, version: V) -> Self
    where
        I: Into<String>,
        A: Into<String>,
        K: Into<Vec<u8>>,
        V: Into<Version>,
    {
        let id_str = id.into();
        let addr_str = address.into();
        let (addr, ip) = match addr_str.as_str() {
            "" | ADDR_AUTO => (ADDR_AUTO.to_string(), "".to_string()),
            _ => (addr_str.clone(), addr_str),
        };
        let key_bytes = local_key.into();
        let ver = version.into();
        let dev_type = if ver.val() == 3.2 {
            DEV_TYPE_DEVICE22.to_string()
        } else {
            DEV_TYPE_DEFAULT.to_string()
        };

        let (broadcast_tx, _) = tokio::sync::broadcast::channel(16);
        let (tx, rx) = mpsc::channel(32);
        let state = DeviceState {
            config_address: addr,
            real_ip: ip,
            version: ver,
            dev_type,
            connected: false,
            last_received: Instant::now(),
            last_sent: Instant::now(),
            stopped: false,
            persist: true,
            session_key: None,
            failure_count: 0,
        };

        let device = Self {
            id: id_str,
            local_key: key_bytes,
            port: 6668,
            connection_timeout: Duration::from_secs(10),
            state: Arc::new(RwLock::new(state)),
            tx: Some(tx),
            broadcast_tx,
            scanner: Arc::new(Scanner::new()),
            waiters: Arc::new(WaiterTable::new()),
            dp_cache: Arc::new(RwLock::new(Map::new())),
            pending_dps: Arc::new(RwLock::new(BTreeSet::new())),
            listener: Arc::new(RwLock::new(None)),
            cancel_token: CancellationToken::new(),
        };

        let d_clone = device.clone();
        tokio::spawn(async move { d_clone.run_connection_task(rx).await });
        device
    }

    /// Register a listener for unsolicited status pushes and disconnection.
    pub fn set_listener(&self, listener: Arc<dyn DeviceListener>) {
        *self.listener.write().unwrap() = Some(listener);
    }

    pub fn get_version(&self) -> Version {
        self.with_state(|s| s.version)
    }

    pub fn get_dev_type(&self) -> String {
        self.with_state(|s| s.dev_type.clone())
    }

    fn dev_type_tag(&self) -> DeviceType {
        if self.get_dev_type() == DEV_TYPE_DEVICE22 {
            DeviceType::TypeD
        } else {
            DeviceType::TypeA
        }
    }

    pub fn get_address(&self) -> String {
        self.with_state(|s| s.config_address.clone())
    }

    pub fn version(&self) -> Version {
        self.get_version()
    }

    pub fn address(&self) -> String {
        self.get_address()
    }

    /// Sets whether the device should automatically reconnect on failure.
    pub fn set_persist(&self, persist: bool) {
        self.with_state_mut(|s| s.persist = persist);
    }

    /// Checks if the device is currently connected.
    pub fn is_connected(&self) -> bool {
        self.with_state(|s| s.connected)
    }

    /// Sets the protocol version and handles version-specific initialization.
    pub fn set_version<V: Into<Version>>(&self, version: V) {
        let ver = version.into();
        let dev_type = if ver.val() == 3.2 {
            DEV_TYPE_DEVICE22.to_string()
        } else {
            DEV_TYPE_DEFAULT.to_string()
        };

        self.with_state_mut(|s| {
            s.version = ver;
            s.dev_type = dev_type;
        });
    }

    /// Forces the device type, bypassing auto-detection (e.g. after `reset`).
    pub fn set_dev_type<S: Into<String>>(&self, dev_type: S) {
        let dt = dev_type.into();
        self.with_state_mut(|s| s.dev_type = dt);
    }

    // -------------------------------------------------------------------------
    // Internal State Helpers
    // -------------------------------------------------------------------------

    fn with_state<R>(&self, f: impl FnOnce(&DeviceState) -> R) -> R {
        f(&self.state.read().expect("Device state lock poisoned"))
    }

    fn with_state_mut<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.state.write().expect("Device state lock poisoned"))
    }

    fn broadcast_error(&self, code: u32, payload: Option<Value>) {
        let _ = self.broadcast_tx.send(self.error_helper(code, payload));
        if code != ERR_SUCCESS {
            if let Ok(listener) = self.listener.read()
                && let Some(l) = listener.as_ref()
            {
                l.disconnected();
            }
        }
    }

    fn update_last_received(&self) {
        if let Ok(mut state) = self.state.write() {
            state.last_received = Instant::now();
        }
    }

    fn update_last_sent(&self) {
        if let Ok(mut state) = self.state.write() {
            state.last_sent = Instant::now();
        }
    }

    fn reset_failure_count(&self) {
        if let Ok(mut state) = self.state.write() {
            if state.failure_count > 0 {
                debug!("Resetting failure count for device {}", self.id);
                state.failure_count = 0;
            }
        }
    }

    async fn send_to_task(&self, cmd: DeviceCommand) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send(cmd).await {
                error!("Failed to queue command for device {}: {}", self.id, e);
            }
        } else {
            error!(
                "Cannot send command for device {}: task not running",
                self.id
            );
        }
    }

    /// Merge any `dps`/`data.dps` object found in `payload` into the DP cache
    /// and return a snapshot of the full cache.
    fn merge_dps_from_payload(&self, payload: &[u8]) -> Option<Value> {
        if payload.is_empty() {
            return None;
        }
        let parsed: Value = serde_json::from_slice(payload).ok()?;
        let dps = parsed
            .get("dps")
            .or_else(|| parsed.get("data").and_then(|d| d.get("dps")))?
            .as_object()?
            .clone();
        if dps.is_empty() {
            return None;
        }
        let mut cache = self.dp_cache.write().unwrap();
        for (k, v) in dps {
            cache.insert(k, v);
        }
        Some(Value::Object(cache.clone()))
    }

    fn extract_dps(&self, reply: Option<TuyaMessage>) -> Result<Value> {
        if let Some(msg) = &reply {
            self.merge_dps_from_payload(&msg.payload);
        }
        Ok(Value::Object(self.dp_cache.read().unwrap().clone()))
    }
}

// -------------------------------------------------------------------------
// Device Control API
// -------------------------------------------------------------------------
impl Device {
    /// Queries the current status of the device and returns the merged DP
    /// cache. A `"data unvalid"` reply (handled transparently by the
    /// decode path) yields an empty dict and flips the device to `type_0d`
    /// for subsequent calls.
    pub async fn status(&self) -> Result<Value> {
        let reply = self.exchange(CommandType::DpQuery, None, None, None).await?;
        let dps = self.extract_dps(reply)?;
        if let Ok(listener) = self.listener.read()
            && let Some(l) = listener.as_ref()
        {
            l.status_updated(&dps);
        }
        Ok(dps)
    }

    /// Sets multiple Data Points (DPs) on the device and waits for the ACK.
    pub async fn set_dps(&self, dps: Value) -> Result<()> {
        self.exchange(CommandType::Control, Some(dps), None, None)
            .await?;
        Ok(())
    }

    /// Sets a single Data Point (DP) value on the device.
    pub async fn set_value(&self, index: u32, value: Value) -> Result<()> {
        self.set_dps(serde_json::json!({ index.to_string(): value }))
            .await
    }

    /// Requests a refresh of specific DPs (or all, if `None`) without
    /// waiting for a correlated reply; v3.1 devices silently ignore this.
    pub async fn update_dps(&self, dp_ids: Option<Vec<u32>>) -> Result<()> {
        if self.get_version().val() <= 3.1 {
            return Ok(());
        }
        let data = dp_ids.map(|ids| serde_json::json!(ids));
        self.send_command(CommandType::UpdateDps, data, None, None, WaitKey::FireAndForget)
            .await?;
        Ok(())
    }

    /// Clears any sticky `type_0d` classification, switches the device back
    /// to the default template, and sends a bulk DP refresh, waiting on the
    /// reserved reset virtual seqno for the ACK (the follow-up frame does
    /// not reliably echo the outgoing seqno).
    pub async fn reset(&self, dp_ids: Option<Vec<u32>>) -> Result<bool> {
        if self.get_version().val() < 3.3 {
            return Ok(false);
        }
        self.set_dev_type(DEV_TYPE_DEFAULT);
        let data = dp_ids.map(|ids| serde_json::json!({"dpId": ids}));
        let reply = self
            .send_command(CommandType::UpdateDps, data, None, None, WaitKey::Reset)
            .await?;
        Ok(reply.is_some())
    }

    /// Sends an explicit heartbeat and waits for the device's ACK.
    pub async fn heartbeat(&self) -> Result<()> {
        self.send_command(
            CommandType::HeartBeat,
            None,
            None,
            None,
            WaitKey::Heartbeat,
        )
        .await?;
        Ok(())
    }

    /// Wakes the device with heartbeats, then sweeps the known DP ranges
    /// (`[2,10]`, `[11,20]`, `[21,30]`, `[100,110]`, plus DP 1) to discover
    /// which DPs it exposes, merging everything found into the DP cache.
    /// `type_0a` devices stop at the first non-empty range; `type_0d`
    /// devices are swept exhaustively since they never reply incrementally.
    pub async fn detect_available_dps(&self, retries: u32) -> Result<Value> {
        let mut awake = false;
        for attempt in 0..retries.max(1) {
            if self.heartbeat().await.is_ok() {
                awake = true;
                break;
            }
            debug!("detect_available_dps: heartbeat attempt {attempt} failed, retrying");
            sleep(Duration::from_secs(1)).await;
        }
        if !awake {
            warn!("detect_available_dps: device never responded to heartbeats");
        }

        self.pending_dps.write().unwrap().insert(1);
        let mut found_any = false;

        for &(lo, hi) in DP_PROBE_RANGES {
            {
                let mut pending = self.pending_dps.write().unwrap();
                pending.clear();
                pending.extend(lo..=hi);
            }
            let dps = self.status().await.unwrap_or(Value::Object(Map::new()));
            let has_entries = dps.as_object().map(|m| !m.is_empty()).unwrap_or(false);
            found_any |= has_entries;

            if has_entries && !self.dev_type_tag().is_type_d() {
                break;
            }
        }
        self.pending_dps.write().unwrap().clear();
        let _ = found_any;

        Ok(Value::Object(self.dp_cache.read().unwrap().clone()))
    }
}

// -------------------------------------------------------------------------
// Sub-Device Control API
// -------------------------------------------------------------------------
impl Device {
    /// Creates a SubDevice instance for the given Node ID (CID).
    pub fn sub_device(&self, cid: &str) -> SubDevice {
        SubDevice::new(self.clone(), cid)
    }

    /// Discovers all sub-devices connected to this gateway.
    ///
    /// NOTE: For version 3.5 gateways, they may only send an empty ACK (0x40 with length 0)
    /// and occasionally fail to follow up with the actual report.
    pub async fn sub_discover(&self) -> Result<Option<TuyaMessage>> {
        let data = serde_json::json!({ "cids": [] });
        self.exchange(
            CommandType::LanExtStream,
            Some(data),
            None,
            Some("subdev_online_stat_query"),
        )
        .await
    }
}

// -------------------------------------------------------------------------
// Connection & Streaming
// -------------------------------------------------------------------------
impl Device {
    /// Returns a Stream of every message received from the device (solicited
    /// and unsolicited alike). Prefer [`set_listener`](Self::set_listener)
    /// for status/disconnect handling; this is the lower-level escape hatch.
    pub fn stream(&self) -> impl Stream<Item = Result<TuyaMessage>> + Send + 'static {
        let mut rx = self.broadcast_tx.subscribe();
        async_stream::stream! {
            while let Ok(msg) = rx.recv().await {
                yield Ok(msg);
            }
        }
    }

    /// Receives a single message from the device.
    pub async fn receive(&self) -> Result<TuyaMessage> {
        let mut rx = self.broadcast_tx.subscribe();
        rx.recv().await.map_err(|e| TuyaError::Io(e.to_string()))
    }

    /// Closes the connection to the device and resets the stored IP address for discovery.
    pub async fn close(&self) {
        info!("Closing connection to device {}", self.id);

        self.with_state_mut(|state| {
            state.connected = false;
        });

        // Signal the background task to disconnect immediately
        if let Some(tx) = &self.tx {
            let _ = tx.send(DeviceCommand::Disconnect).await;
        }
    }

    /// Stops the device and its background tasks permanently.
    pub async fn stop(&self) {
        info!("Stopping device {}", self.id);
        self.with_state_mut(|state| {
            state.stopped = true;
        });
        self.cancel_token.cancel();
        self.close().await;
    }
}

// -------------------------------------------------------------------------
// Internal Communication & Background Task Helpers
// -------------------------------------------------------------------------
impl Device {
    fn get_timestamp(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Run `command` through the background connection task and wait for its
    /// correlated reply, bounded by [`EXCHANGE_TIMEOUT`]. Empty-ACK commands
    /// (HEART_BEAT, CONTROL, CONTROL_NEW) normally resolve with a message
    /// whose payload is empty; callers that only care about success should
    /// just check `Ok(_)`.
    async fn exchange(
        &self,
        command: CommandType,
        data: Option<Value>,
        cid: Option<&str>,
        req_type: Option<&str>,
    ) -> Result<Option<TuyaMessage>> {
        self.send_command(command, data, cid, req_type, WaitKey::Seqno)
            .await
    }

    async fn send_command(
        &self,
        command: CommandType,
        data: Option<Value>,
        cid: Option<&str>,
        req_type: Option<&str>,
        wait_key: WaitKey,
    ) -> Result<Option<TuyaMessage>> {
        debug!("request: cmd={:?}, data={:?}", command, data);
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send_to_task(DeviceCommand::Request {
            command,
            data,
            cid: cid.map(String::from),
            req_type: req_type.map(String::from),
            wait_key,
            resp_tx,
        })
        .await;

        match timeout(EXCHANGE_TIMEOUT, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TuyaError::Io("device task dropped response".into())),
            Err(_) => Err(TuyaError::Timeout),
        }
    }

    async fn run_connection_task(mut self, mut rx: mpsc::Receiver<DeviceCommand>) {
        // Drop the internal sender to allow rx to close when all external handles are dropped.
        self.tx = None;

        // Add initial random jitter to heartbeat interval to avoid thundering herd (0-5 seconds)
        let jitter = {
            let mut rng = rand::rng();
            Duration::from_millis((rng.next_u32() % 5000) as u64)
        };
        let mut heartbeat_interval =
            tokio::time::interval_at(tokio::time::Instant::now() + jitter, SLEEP_HEARTBEAT_CHECK);
        heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        debug!("Starting background connection task for device {}", self.id);

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Background task for {} received stop signal", self.id);
                    break;
                }
                res = async {
                    if self.is_stopped() {
                        return Some(());
                    }

                    // Reset seqno for each new connection attempt
                    let mut seqno = 1u32;

                    // 1. Attempt to connect and handshake
                    let stream = match self
                        .try_connect_with_backoff(&mut rx, &mut seqno)
                        .await
                    {
                        Some(s) => s,
                        None => return Some(()), // rx closed or stopped
                    };

                    // 2. Main loop for the active connection
                    let result = self
                        .maintain_connection(stream, &mut rx, &mut seqno, &mut heartbeat_interval)
                        .await;

                    // Every pending exchange at the moment of loss gets a transport error.
                    self.waiters.fail_all();

                    // Cleanup on connection loss
                    self.handle_disconnect(result.as_ref().err().cloned());

                    // Drain any pending commands immediately upon connection loss
                    if let Err(e) = result {
                        self.with_state_mut(|s| s.failure_count += 1);
                        self.drain_rx(&mut rx, e.code(), false);
                    } else {
                        // If maintain_connection returned Ok(()), it means it stopped normally (e.g. rx closed)
                        return Some(());
                    }

                    // If maintain_connection returned because rx was closed, exit the outer loop too
                    if self.is_stopped() {
                        return Some(());
                    }

                    None
                } => {
                    if res.is_some() {
                        break;
                    }
                }
            }
        }

        // Ensure all associated tasks (like the Reader task) are stopped
        self.cancel_token.cancel();
        debug!("Background connection task for {} exited", self.id);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn is_stopped(&self) -> bool {
        self.with_state(|s| s.stopped)
    }

    fn handle_disconnect(&self, err: Option<TuyaError>) {
        self.with_state_mut(|s| {
            s.connected = false;
            s.session_key = None;
        });

        if let Some(e) = err {
            if matches!(e, TuyaError::KeyOrVersionError) {
                warn!(
                    "Device {} possibly has key or version mismatch (Error 914)",
                    self.id
                );
            } else {
                debug!("Connection lost for device {} due to error: {}", self.id, e);
            }
            self.broadcast_error(e.code(), None);
        } else {
            debug!("Connection closed normally for device {}", self.id);
            self.broadcast_error(ERR_OFFLINE, None);
        }
    }

    fn drain_rx(&self, rx: &mut mpsc::Receiver<DeviceCommand>, code: u32, close: bool) {
        if close {
            rx.close();
        }
        while let Ok(cmd) = rx.try_recv() {
            cmd.fail(TuyaError::from_code(code));
        }
    }

    async fn try_connect_with_backoff(
        &self,
        rx: &mut mpsc::Receiver<DeviceCommand>,
        seqno: &mut u32,
    ) -> Option<TcpStream> {
        loop {
            if self.is_stopped() {
                self.drain_rx(rx, ERR_OFFLINE, true);
                return None;
            }

            // If we have failures, wait before the next attempt
            let backoff = self.with_state(|s| {
                if s.failure_count > 0 {
                    Some((
                        self.get_backoff_duration(s.failure_count - 1),
                        s.failure_count,
                    ))
                } else {
                    None
                }
            });

            if let Some((b, count)) = backoff {
                warn!(
                    "Waiting {}s before next connection attempt for {} (fail count: {})",
                    b.as_secs(),
                    self.id,
                    count
                );
                self.wait_for_backoff(rx, b).await?;
            }

            let result = timeout(
                self.connection_timeout * 2,
                self.connect_and_handshake(seqno),
            )
            .await;
            match result {
                Ok(Ok(s)) => {
                    self.with_state_mut(|s| {
                        s.connected = true;
                        let now = Instant::now();
                        s.last_sent = now;
                        s.last_received = now;
                    });
                    self.broadcast_error(ERR_SUCCESS, None);
                    return Some(s);
                }
                _ => {
                    let e = match result {
                        Ok(Err(e)) => e,
                        _ => TuyaError::Offline,
                    };

                    self.handle_connection_error(&e).await;
                    self.drain_rx(rx, e.code(), false);

                    if !self.with_state(|s| s.persist) {
                        error!(
                            "Connection failed (persist: false) for device {}: {}",
                            self.id, e
                        );
                        self.drain_rx(rx, e.code(), true);
                        return None;
                    }

                    self.with_state_mut(|s| {
                        s.failure_count += 1;
                    });
                }
            }
        }
    }

    async fn wait_for_backoff(
        &self,
        rx: &mut mpsc::Receiver<DeviceCommand>,
        backoff: Duration,
    ) -> Option<()> {
        let sleep_fut = sleep(backoff);
        tokio::pin!(sleep_fut);

        loop {
            tokio::select! {
                _ = &mut sleep_fut => return Some(()),
                _ = self.cancel_token.cancelled() => {
                    self.drain_rx(rx, ERR_OFFLINE, true);
                    return None;
                }
                cmd_opt = rx.recv() => {
                    if let Some(cmd) = cmd_opt {
                        debug!("Rejecting command during backoff for device {}", self.id);
                        cmd.fail(TuyaError::Offline);
                        self.broadcast_error(ERR_OFFLINE, None);
                        // Continue waiting for backoff
                    } else {
                        return None;
                    }
                }
            }
        }
    }

    async fn maintain_connection(
        &self,
        stream: TcpStream,
        rx: &mut mpsc::Receiver<DeviceCommand>,
        seqno: &mut u32,
        heartbeat_interval: &mut tokio::time::Interval,
    ) -> Result<()> {
        let (mut read_half, mut write_half) = stream.into_split();
        let (internal_tx, mut internal_rx) = mpsc::channel::<TuyaError>(1);

        let device_clone = self.clone();
        let connection_cancel_token = CancellationToken::new();
        let reader_cancel_token = connection_cancel_token.clone();
        let parent_cancel_token = self.cancel_token.clone();

        // Reader Task
        tokio::spawn(async move {
            let mut packets_received = 0;
            loop {
                tokio::select! {
                    _ = parent_cancel_token.cancelled() => break,
                    _ = reader_cancel_token.cancelled() => break,
                    res = read_half.read_u8() => {
                        match res {
                            Ok(byte) => {
                                if let Err(e) = device_clone.process_socket_data(&mut read_half, byte).await {
                                    let _ = internal_tx.send(e).await;
                                    break;
                                }
                                packets_received += 1;
                            }
                            Err(e) => {
                                let err = if e.kind() == std::io::ErrorKind::UnexpectedEof {
                                    if packets_received > 0 {
                                        // Communication was working, now it's just a connection loss
                                        TuyaError::Io("Connection reset by peer".to_string())
                                    } else {
                                        // Dropped right at the start, likely wrong key/version
                                        TuyaError::KeyOrVersionError
                                    }
                                } else {
                                    TuyaError::Io(e.to_string())
                                };
                                let _ = internal_tx.send(err).await;
                                break;
                            }
                        }
                    }
                }
            }
            debug!("Reader task for {} stopped", device_clone.id);
        });

        let result = async {
            loop {
                tokio::select! {
                    _ = self.cancel_token.cancelled() => {
                        return Ok(());
                    }
                    cmd_opt = rx.recv() => {
                        match cmd_opt {
                            Some(cmd) => {
                                if let Err(e) = self.process_command(&mut write_half, seqno, cmd).await {
                                    error!("Command processing failed for {}: {}", self.id, e);
                                    return Err(e);
                                }
                            }
                            None => {
                                debug!("All handles for device {} dropped, stopping task", self.id);
                                if let Ok(mut state) = self.state.write() {
                                    state.stopped = true;
                                }
                                return Ok(());
                            }
                        }
                    }
                    _ = heartbeat_interval.tick() => {
                        if let Err(e) = self.process_auto_heartbeat(&mut write_half, seqno).await {
                            error!("Heartbeat failed for {}: {}", self.id, e);
                            return Err(e);
                        }
                    }
                    err_opt = internal_rx.recv() => {
                        if let Some(e) = err_opt {
                            return Err(e);
                        }
                    }
                }
            }
        }.await;

        connection_cancel_token.cancel();
        result
    }

    async fn process_command<W: AsyncWriteExt + Unpin>(
        &self,
        stream: &mut W,
        seqno: &mut u32,
        cmd: DeviceCommand,
    ) -> Result<()> {
        let (command, data, cid, req_type, wait_key, resp_tx) = match cmd {
            DeviceCommand::Request {
                command,
                data,
                cid,
                req_type,
                wait_key,
                resp_tx,
            } => (command, data, cid, req_type, wait_key, resp_tx),
            DeviceCommand::Disconnect => {
                debug!("Disconnect command received for device {}", self.id);
                return Err(TuyaError::Io("Explicit disconnect".to_string()));
            }
        };

        let (cmd_id, payload) = self.generate_payload(command, data, cid.as_deref(), req_type.as_deref());

        let assigned_seqno = *seqno;
        let wait_seqno: i64 = match wait_key {
            WaitKey::Seqno => assigned_seqno as i64,
            WaitKey::Heartbeat => HEARTBEAT_SEQNO,
            WaitKey::Reset => RESET_SEQNO,
            WaitKey::FireAndForget => {
                let send_result = self.send_json_msg(stream, seqno, cmd_id, &payload).await;
                let _ = resp_tx.send(send_result.map(|_| None));
                return Ok(());
            }
        };

        let reply_rx = match self.waiters.register(wait_seqno) {
            Ok(rx) => rx,
            Err(e) => {
                let _ = resp_tx.send(Err(e));
                return Ok(());
            }
        };

        if let Err(e) = self.send_json_msg(stream, seqno, cmd_id, &payload).await {
            self.waiters.remove(wait_seqno);
            let _ = resp_tx.send(Err(e));
            return Err(TuyaError::Io("write failed".into()));
        }

        // Resolve the caller's oneshot off the write path so the command
        // loop keeps dequeuing further requests while this reply is awaited.
        // A dedicated deadline here (rather than relying solely on the
        // caller's own timeout around `send_command`) guarantees the waiter
        // table entry is reclaimed even if the device simply never answers.
        let waiters = self.waiters.clone();
        tokio::spawn(async move {
            match timeout(EXCHANGE_TIMEOUT, reply_rx).await {
                Ok(Ok(msg)) => {
                    let _ = resp_tx.send(Ok(Some(msg)));
                }
                Ok(Err(_)) => {
                    // Sender dropped: table was cleared by `fail_all` on disconnect.
                    let _ = resp_tx.send(Err(TuyaError::Offline));
                }
                Err(_) => {
                    waiters.remove(wait_seqno);
                    let _ = resp_tx.send(Err(TuyaError::Timeout));
                }
            }
        });

        Ok(())
    }

    async fn send_json_msg<W: AsyncWriteExt + Unpin>(
        &self,
        stream: &mut W,
        seqno: &mut u32,
        cmd: u32,
        payload: &Value,
    ) -> Result<()> {
        let payload_bytes = serde_json::to_vec(payload).unwrap_or_default();
        let msg = self.build_message(seqno, cmd, payload_bytes);
        self.send_raw_to_stream(stream, msg).await
    }

    async fn handle_connection_error(&self, e: &TuyaError) {
        if let Ok(mut state) = self.state.write() {
            state.connected = false;
        }
        self.broadcast_error(e.code(), Some(serde_json::json!(format!("{}", e))));
    }

    async fn process_socket_data<R: AsyncReadExt + Unpin>(
        &self,
        stream: &mut R,
        first_byte: u8,
    ) -> Result<()> {
        if let Some(msg) = self.read_and_parse_from_stream(stream, first_byte).await? {
            self.update_last_received();
            self.reset_failure_count();
            debug!(
                "Received message: cmd=0x{:02X}, payload_len={}",
                msg.cmd,
                msg.payload.len()
            );

            if !msg.payload.is_empty() && serde_json::from_slice::<Value>(&msg.payload).is_err() {
                debug!("Non-JSON payload detected, broadcasting as ERR_JSON");
                let payload_hex = hex::encode(&msg.payload);
                self.broadcast_error(
                    ERR_JSON,
                    Some(serde_json::json!({
                        PAYLOAD_RAW: payload_hex,
                        "cmd": msg.cmd
                    })),
                );
                return Ok(());
            }

            let dps_snapshot = self.merge_dps_from_payload(&msg.payload);
            self.route_incoming(msg, dps_snapshot);
        }
        Ok(())
    }

    /// Hand an incoming decoded message to whichever waiter is registered
    /// for it, falling back to virtual seqnos by command, and finally to
    /// an unsolicited delivery (§4.5 step 5).
    fn route_incoming(&self, msg: TuyaMessage, dps_snapshot: Option<Value>) {
        let leftover = self.waiters.route(msg.seqno as i64, msg);

        let leftover = leftover.and_then(|msg| {
            if msg.cmd == CommandType::HeartBeat as u32 {
                self.waiters.route(HEARTBEAT_SEQNO, msg)
            } else {
                Some(msg)
            }
        });

        let leftover = leftover.and_then(|msg| {
            if msg.cmd == CommandType::UpdateDps as u32 || msg.cmd == CommandType::Status as u32 {
                if self.waiters.is_waiting(RESET_SEQNO) {
                    self.waiters.route(RESET_SEQNO, msg)
                } else {
                    Some(msg)
                }
            } else {
                Some(msg)
            }
        });

        if let Some(msg) = leftover {
            // Truly unsolicited: deliver to the listener and the raw stream.
            if let Some(dps) = dps_snapshot
                && let Ok(listener) = self.listener.read()
                && let Some(l) = listener.as_ref()
            {
                l.status_updated(&dps);
            }
            if !msg.payload.is_empty() {
                let _ = self.broadcast_tx.send(msg);
            } else {
                debug!("Received empty unsolicited payload, not broadcasting");
            }
        }
    }

    async fn process_auto_heartbeat<W: AsyncWriteExt + Unpin>(
        &self,
        stream: &mut W,
        seqno: &mut u32,
    ) -> Result<()> {
        let (last_sent, last_received) = self.with_state(|s| (s.last_sent, s.last_received));

        if last_received.elapsed() >= HEARTBEAT_TIMEOUT {
            warn!(
                "Device {} unresponsive for {:?}, closing transport",
                self.id,
                last_received.elapsed()
            );
            return Err(TuyaError::Timeout);
        }

        if last_sent.elapsed() >= HEARTBEAT_INTERVAL {
            debug!("Auto-heartbeat for device {}", self.id);
            let payload = serde_json::json!({ "gwId": self.id, "devId": self.id });
            self.send_json_msg(stream, seqno, CommandType::HeartBeat as u32, &payload)
                .await?;
        }
        Ok(())
    }

    async fn connect_and_handshake(&self, seqno: &mut u32) -> Result<TcpStream> {
        let addr = self.resolve_address().await?;

        info!("Connecting to device {} at {}:{}", self.id, addr, self.port);
        let mut stream = timeout(
            self.connection_timeout,
            TcpStream::connect(format!("{}:{}", addr, self.port)),
        )
        .await
        .map_err(|_| TuyaError::Timeout)?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed,
            _ => TuyaError::Io(e.to_string()),
        })?;

        if self.version().val() >= 3.4 && !self.negotiate_session_key(&mut stream, seqno).await? {
            return Err(TuyaError::KeyOrVersionError);
        }

        Ok(stream)
    }

    async fn resolve_address(&self) -> Result<String> {
        let config_addr = self.with_state(|s| s.config_address.clone());
        if config_addr != ADDR_AUTO && config_addr != "0.0.0.0" && !config_addr.is_empty() {
            return Ok(config_addr);
        }

        debug!(
            "Config address is {}, discovering device {}",
            config_addr, self.id
        );
        if let Ok(Some(result)) = self.scanner.discover_device_internal(&self.id, false).await {
            let found_addr = result.ip;
            if let Some(version) = result.version
                && self.get_version() == Version::Auto
            {
                info!("Auto-detected version {} for device {}", version, self.id);
                self.set_version(version);
            }
            info!("Discovered device {} at {}", self.id, found_addr);
            self.with_state_mut(|s| {
                s.real_ip = found_addr.clone();
            });
            Ok(found_addr)
        } else {
            Err(TuyaError::Offline)
        }
    }

    async fn send_raw_to_stream<W: AsyncWriteExt + Unpin>(
        &self,
        stream: &mut W,
        msg: TuyaMessage,
    ) -> Result<()> {
        let packed = self.pack_msg(msg)?;
        timeout(self.connection_timeout, stream.write_all(&packed))
            .await
            .map_err(|_| {
                TuyaError::Io(
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "Write timeout").to_string(),
                )
            })?
            .map_err(TuyaError::from)?;

        self.update_last_sent();
        Ok(())
    }

    async fn read_and_parse_from_stream<R: AsyncReadExt + Unpin>(
        &self,
        stream: &mut R,
        first_byte: u8,
    ) -> Result<Option<TuyaMessage>> {
        let prefix = match self.scan_for_prefix(stream, first_byte).await? {
            Some(p) => p,
            None => return Ok(None),
        };

        // Read remaining 12 bytes of header (16 bytes total)
        let mut header_buf = [0u8; 16];
        header_buf[0..4].copy_from_slice(&prefix);
        timeout(
            self.connection_timeout,
            stream.read_exact(&mut header_buf[4..]),
        )
        .await
        .map_err(|_| {
            TuyaError::Io(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "Read header timeout")
                    .to_string(),
            )
        })?
        .map_err(TuyaError::from)?;

        // Parse and read body
        let dev_type_before = self.get_dev_type();
        match self.parse_and_read_body(stream, header_buf).await {
            Ok(Some(msg)) => {
                if dev_type_before != DEV_TYPE_DEVICE22 && self.get_dev_type() == DEV_TYPE_DEVICE22
                {
                    debug!("Device22 transition detected, reporting with original payload");
                    let original_payload = if msg.payload.is_empty() {
                        Value::Null
                    } else {
                        serde_json::from_slice(&msg.payload).unwrap_or_else(
                            |_| serde_json::json!({ PAYLOAD_RAW: hex::encode(&msg.payload) }),
                        )
                    };
                    return Ok(Some(self.error_helper(ERR_DEVTYPE, Some(original_payload))));
                }
                Ok(Some(msg))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                if matches!(e, TuyaError::Io(_)) {
                    return Err(e);
                }
                warn!("Error parsing message from {}: {}", self.id, e);
                Ok(None)
            }
        }
    }

    async fn scan_for_prefix<R: AsyncReadExt + Unpin>(
        &self,
        stream: &mut R,
        first_byte: u8,
    ) -> Result<Option<[u8; 4]>> {
        let mut buf = [0u8; 4];
        buf[0] = first_byte;

        macro_rules! read_byte {
            () => {
                timeout(self.connection_timeout, stream.read_u8())
                    .await
                    .map_err(|_| TuyaError::Timeout)?
                    .map_err(TuyaError::from)?
            };
        }

        for b in &mut buf[1..] {
            *b = read_byte!();
        }

        for _ in 0..1024 {
            let val = u32::from_be_bytes(buf);
            if val == PREFIX_55AA || val == PREFIX_6699 {
                return Ok(Some(buf));
            }
            buf.rotate_left(1);
            buf[3] = read_byte!();
        }
        Ok(None)
    }

    /// Generates a payload for a command, delegating the template/override
    /// logic to [`crate::payload`].
    fn generate_payload(
        &self,
        command: CommandType,
        data: Option<Value>,
        cid: Option<&str>,
        req_type: Option<&str>,
    ) -> (u32, Value) {
        let params = EnvelopeParams {
            device_id: &self.id,
            cid,
            version: self.get_version().val(),
            dev_type: self.dev_type_tag(),
            timestamp: self.get_timestamp(),
            req_type,
        };
        let pending = self.pending_dps.read().unwrap();
        let pending_ref: &BTreeSet<u32> = &pending;
        payload::build_envelope(command, data, Some(pending_ref), &params)
    }

    fn build_message<P: Into<Vec<u8>>>(
        &self,
        seqno: &mut u32,
        cmd: u32,
        payload: P,
    ) -> TuyaMessage {
        let payload = payload.into();
        let version_val = self.get_version().val();
        let current_seq = *seqno;
        *seqno += 1;
        debug!(
            "Building message: cmd=0x{:02X}, seqno={}, payload_len={}",
            cmd,
            current_seq,
            payload.len()
        );

        TuyaMessage {
            seqno: current_seq,
            cmd,
            payload,
            prefix: if version_val >= 3.5 {
                PREFIX_6699
            } else {
                PREFIX_55AA
            },
            ..Default::default()
        }
    }

    fn get_backoff_duration(&self, failure_count: u32) -> Duration {
        let min_secs = SLEEP_RECONNECT_MIN.as_secs();
        let max_secs = SLEEP_RECONNECT_MAX.as_secs();
        let secs = (2u64.pow(failure_count.min(6)) * min_secs).min(max_secs);
        Duration::from_secs(secs)
    }

    fn error_helper(&self, code: u32, payload: Option<Value>) -> TuyaMessage {
        let err_msg = get_error_message(code);
        let mut response = serde_json::json!({
            ERR_MSG: err_msg,
            ERR_CODE: code.to_string(),
        });

        if let Some(p) = payload {
            match p {
                Value::String(s) => {
                    response["payload_str"] = Value::String(s);
                }
                Value::Object(mut obj) => {
                    if let Some(raw) = obj
                        .remove("raw")
                        .or_else(|| obj.remove("raw_payload"))
                        .or_else(|| obj.remove(PAYLOAD_RAW))
                    {
                        response[PAYLOAD_RAW] = raw;
                    }
                    if let Some(obj_map) = response.as_object_mut() {
                        for (k, v) in obj {
                            obj_map.insert(k, v);
                        }
                    }
                }
                _ => {
                    response[ERR_PAYLOAD_OBJ] = p;
                }
            }
        }

        TuyaMessage {
            seqno: 0,
            cmd: 0,
            retcode: None,
            payload: serde_json::to_vec(&response).unwrap_or_default(),
            prefix: PREFIX_55AA,
            iv: None,
            integrity_ok: true,
        }
    }

    /// Runs the three-message handshake (§4.4) directly against the raw
    /// socket: `connected_unkeyed` admits no other operation, so nothing
    /// else can be racing these reads.
    async fn negotiate_session_key(&self, stream: &mut TcpStream, seqno: &mut u32) -> Result<bool> {
        debug!("Starting session key negotiation");

        let mut local_nonce = vec![0u8; 16];
        rand::rng().fill_bytes(&mut local_nonce);

        self.send_raw_to_stream(
            stream,
            self.build_message(
                seqno,
                CommandType::SessKeyNegStart as u32,
                local_nonce.clone(),
            ),
        )
        .await?;

        let first_byte = timeout(self.connection_timeout, stream.read_u8())
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    TuyaError::KeyOrVersionError
                } else {
                    TuyaError::from(e)
                }
            })?;
        let resp = self
            .read_and_parse_from_stream(stream, first_byte)
            .await?
            .ok_or(TuyaError::HandshakeFailed)?;

        if resp.cmd != CommandType::SessKeyNegResp as u32 {
            return Err(TuyaError::KeyOrVersionError);
        }

        let remote_nonce = handshake::parse_neg_resp(&resp.payload)?.to_vec();
        if resp.payload.len() >= 48
            && handshake::verify_hmac_sha256(&self.local_key, &local_nonce, &resp.payload[16..48])
                .is_err()
        {
            warn!("Session-key handshake HMAC mismatch for device {} (continuing)", self.id);
        }

        let rkey_hmac = handshake::hmac_sha256(&self.local_key, &remote_nonce)?.to_vec();
        self.send_raw_to_stream(
            stream,
            self.build_message(seqno, CommandType::SessKeyNegFinish as u32, rkey_hmac),
        )
        .await?;

        let session_key = if self.version().val() >= 3.5 {
            handshake::derive_session_key_v35(&self.local_key, &local_nonce, &remote_nonce)?
        } else {
            handshake::derive_session_key_v34(&self.local_key, &local_nonce, &remote_nonce)?
        };

        self.with_state_mut(|s| s.session_key = Some(session_key));
        Ok(true)
    }

    fn pack_msg(&self, mut msg: TuyaMessage) -> Result<Vec<u8>> {
        let version_val = self.get_version().val();
        let dev_type = self.dev_type_tag();
        let key = self.get_cipher_key();
        let version_bytes = self.get_version().as_bytes();

        let cipher = TuyaCipher::new(&key)?;
        msg.payload = payload::encrypt_for_version(
            &cipher,
            version_val,
            dev_type,
            msg.cmd,
            version_bytes,
            &key,
            msg.payload,
        )?;

        let hmac_key = if version_val >= 3.4 {
            Some(key.as_slice())
        } else {
            None
        };
        pack_message(&msg, hmac_key)
    }

    fn get_cipher_key(&self) -> Vec<u8> {
        self.state
            .read()
            .map(|s| {
                s.session_key
                    .clone()
                    .unwrap_or_else(|| self.local_key.clone())
            })
            .unwrap_or_else(|_| self.local_key.clone())
    }

    async fn parse_and_read_body<R: AsyncReadExt + Unpin>(
        &self,
        stream: &mut R,
        header_buf: [u8; 16],
    ) -> Result<Option<TuyaMessage>> {
        let (packet, header) = self.read_full_packet(stream, header_buf).await?;
        debug!("Received packet (hex): {:?}", hex::encode(&packet));

        let mut decoded = self.unpack_and_check_dev22(&packet, header).await?;

        if !decoded.payload.is_empty() {
            debug!("Raw payload (hex): {:?}", hex::encode(&decoded.payload));
            decoded.payload = self
                .decrypt_and_clean_payload(decoded.payload, decoded.prefix)
                .await?;
        }

        Ok(Some(decoded))
    }

    async fn read_full_packet<R: AsyncReadExt + Unpin>(
        &self,
        stream: &mut R,
        header_buf: [u8; 16],
    ) -> Result<(Vec<u8>, TuyaHeader)> {
        let prefix =
            u32::from_be_bytes([header_buf[0], header_buf[1], header_buf[2], header_buf[3]]);
        let mut full_header = header_buf.to_vec();

        if prefix == PREFIX_6699 {
            let mut extra = [0u8; 2];
            timeout(self.connection_timeout, stream.read_exact(&mut extra))
                .await
                .map_err(|_| {
                    TuyaError::Io(
                        std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "Read extra header timeout",
                        )
                        .to_string(),
                    )
                })?
                .map_err(TuyaError::from)?;
            full_header.extend_from_slice(&extra);
        }

        let header = parse_header(&full_header)?;
        let mut body = vec![0u8; header.total_length as usize - full_header.len()];
        timeout(self.connection_timeout, stream.read_exact(&mut body))
            .await
            .map_err(|_| {
                TuyaError::Io(
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "Read body timeout")
                        .to_string(),
                )
            })?
            .map_err(TuyaError::from)?;

        let mut packet = full_header;
        packet.extend_from_slice(&body);
        Ok((packet, header))
    }

    async fn unpack_and_check_dev22(
        &self,
        packet: &[u8],
        header: TuyaHeader,
    ) -> Result<TuyaMessage> {
        let version = self.get_version().val();
        let key = self.get_cipher_key();
        let hmac_key = (version >= 3.4).then_some(key.as_slice());

        unpack_message(packet, hmac_key, Some(header.clone()), Some(false)).or_else(|e| {
            if version == 3.3 && self.get_dev_type() != DEV_TYPE_DEVICE22 {
                if let Ok(d) = unpack_message(packet, None, Some(header), Some(false)) {
                    info!("Device22 detected via CRC32 fallback. Switching mode.");
                    self.set_dev_type(DEV_TYPE_DEVICE22);
                    return Ok(d);
                }
            }
            Err(e)
        })
    }

    async fn decrypt_and_clean_payload(&self, mut payload: Vec<u8>, prefix: u32) -> Result<Vec<u8>> {
        let version = self.get_version();
        let version_val = version.val();
        let dev_type = self.dev_type_tag();
        let key = self.get_cipher_key();
        let cipher = TuyaCipher::new(&key)?;
        let version_bytes = version.as_bytes();

        if version_val >= 3.4 {
            if prefix == PREFIX_55AA {
                payload = cipher.decrypt(&payload, false, None, None, None)?;
            }
            if payload::has_version_header(&payload, version_bytes, dev_type) {
                payload = payload::strip_version_header(payload);
            }
        } else if version_val >= 3.2 {
            if payload.len() >= 15 && &payload[..3] == version_bytes {
                payload = payload::strip_version_header(payload);
            }
            if !payload.is_empty() {
                payload = self
                    .try_decrypt_32_payload(payload, &cipher, version_val, dev_type, version_bytes)
                    .await?;
            }
            if (version_val == 3.3 || version_val == 3.4)
                && !dev_type.is_type_d()
                && String::from_utf8_lossy(&payload).contains(DATA_UNVALID)
            {
                warn!(
                    "Device22 detected via '{}' payload. Switching mode.",
                    DATA_UNVALID
                );
                self.set_dev_type(DEV_TYPE_DEVICE22);
            }
        } else {
            // v3.1: only CONTROL replies carry the version tag + MD5
            // signature; anything else comes back as plain JSON.
            payload = payload::decrypt_v31_payload(&cipher, version_bytes, payload)?;
        }
        Ok(payload)
    }

    async fn try_decrypt_32_payload(
        &self,
        payload: Vec<u8>,
        cipher: &TuyaCipher,
        version_val: f32,
        dev_type: DeviceType,
        version_bytes: &[u8],
    ) -> Result<Vec<u8>> {
        match cipher.decrypt(&payload, false, None, None, None) {
            Ok(mut decrypted) => {
                if payload::has_version_header(&decrypted, version_bytes, dev_type) {
                    decrypted.drain(..15);
                }
                Ok(decrypted)
            }
            Err(e) => {
                let s = String::from_utf8_lossy(&payload);
                if ((version_val == 3.3 || version_val == 3.4) && s.contains(DATA_UNVALID))
                    || payload.first() == Some(&b'{')
                {
                    Ok(payload)
                } else {
                    Err(e)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_device() -> Device {
        Device::new("test-device", "192.0.2.1", "0123456789abcdef", "3.3")
    }

    #[tokio::test]
    async fn backoff_grows_and_caps_at_max() {
        let device = new_device();
        assert_eq!(device.get_backoff_duration(0), SLEEP_RECONNECT_MIN);
        assert!(device.get_backoff_duration(1) > SLEEP_RECONNECT_MIN);
        assert_eq!(device.get_backoff_duration(20), SLEEP_RECONNECT_MAX);
        device.stop().await;
    }

    #[tokio::test]
    async fn dev_type_tag_follows_version32_default() {
        let device = Device::new("d22", "192.0.2.2", "0123456789abcdef", "3.2");
        assert_eq!(device.get_dev_type(), DEV_TYPE_DEVICE22);
        assert!(device.dev_type_tag().is_type_d());
        device.stop().await;
    }

    #[tokio::test]
    async fn dev_type_tag_is_type_a_by_default_for_v33() {
        let device = new_device();
        assert_eq!(device.get_dev_type(), DEV_TYPE_DEFAULT);
        assert!(!device.dev_type_tag().is_type_d());
        device.stop().await;
    }

    #[tokio::test]
    async fn merge_dps_from_payload_updates_cache_and_returns_snapshot() {
        let device = new_device();
        let payload = br#"{"dps":{"1":true,"2":100}}"#;
        let snapshot = device.merge_dps_from_payload(payload).unwrap();
        assert_eq!(snapshot["1"], true);
        assert_eq!(snapshot["2"], 100);

        // A later partial update merges rather than replacing.
        let payload2 = br#"{"dps":{"2":200}}"#;
        let snapshot2 = device.merge_dps_from_payload(payload2).unwrap();
        assert_eq!(snapshot2["1"], true);
        assert_eq!(snapshot2["2"], 200);
        device.stop().await;
    }

    #[tokio::test]
    async fn merge_dps_from_payload_reads_nested_data_dps() {
        let device = new_device();
        let payload = br#"{"data":{"dps":{"9":"on"}}}"#;
        let snapshot = device.merge_dps_from_payload(payload).unwrap();
        assert_eq!(snapshot["9"], "on");
        device.stop().await;
    }

    #[tokio::test]
    async fn generate_payload_switches_to_control_new_for_type_d_dp_query() {
        let device = Device::new("d22b", "192.0.2.3", "0123456789abcdef", "3.2");
        device.pending_dps.write().unwrap().insert(5);
        let (cmd, payload) = device.generate_payload(CommandType::DpQuery, None, None, None);
        assert_eq!(cmd, CommandType::ControlNew as u32);
        assert_eq!(payload["dps"]["5"], Value::Null);
        device.stop().await;
    }

    #[tokio::test]
    async fn error_helper_formats_known_code() {
        let device = new_device();
        let msg = device.error_helper(ERR_OFFLINE, None);
        let text = msg.payload_as_string().unwrap();
        assert!(text.contains("Device offline") || text.contains("Unreachable"));
        device.stop().await;
    }

    #[tokio::test]
    async fn process_auto_heartbeat_closes_transport_after_staleness_timeout() {
        let device = new_device();
        device.with_state_mut(|s| {
            s.last_received = Instant::now() - HEARTBEAT_TIMEOUT - Duration::from_secs(1);
        });
        let (mut client, server) = tokio::io::duplex(1024);
        let mut seqno = 1u32;
        let result = device.process_auto_heartbeat(&mut client, &mut seqno).await;
        assert!(matches!(result, Err(TuyaError::Timeout)));
        drop(server);
        device.stop().await;
    }

    #[tokio::test]
    async fn process_auto_heartbeat_sends_heartbeat_frame_once_due() {
        let device = new_device();
        device.with_state_mut(|s| {
            s.last_sent = Instant::now() - HEARTBEAT_INTERVAL - Duration::from_secs(1);
            s.last_received = Instant::now();
        });
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut seqno = 1u32;
        device
            .process_auto_heartbeat(&mut client, &mut seqno)
            .await
            .unwrap();
        drop(client);

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert!(!buf.is_empty());
        assert_eq!(&buf[..4], &PREFIX_55AA.to_be_bytes());
        device.stop().await;
    }

    #[tokio::test]
    async fn process_auto_heartbeat_is_quiet_when_neither_deadline_is_due() {
        let device = new_device();
        device.with_state_mut(|s| {
            let now = Instant::now();
            s.last_sent = now;
            s.last_received = now;
        });
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut seqno = 1u32;
        device
            .process_auto_heartbeat(&mut client, &mut seqno)
            .await
            .unwrap();
        drop(client);

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        device.stop().await;
    }
}
