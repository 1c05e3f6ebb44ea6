//! Stream demultiplexer for the Tuya TCP connection.
//! Reassembles frames from arbitrarily chunked socket reads and routes each one
//! to the request waiting on its sequence number or to the status handler.

use crate::error::{Result, TuyaError};
use crate::protocol::{
    CommandType, PREFIX_55AA, RECV_HEADER_LEN, TuyaMessage, parse_header, unpack_message,
    verify_checksum,
};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::oneshot;
use tokio::time::{Duration, timeout};

/// Callback receiving unsolicited status pushes (command 0x08).
pub type StatusHandler = Box<dyn Fn(TuyaMessage) + Send + Sync>;

const PREFIX_BYTES: [u8; 4] = PREFIX_55AA.to_be_bytes();

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Option<TuyaMessage>>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    waiters: HashMap<u32, Waiter>,
}

/// Handle for a response expected on one sequence number.
///
/// Dropping the handle (including after a timeout) removes its registration.
pub struct PendingResponse {
    seqno: u32,
    id: u64,
    rx: oneshot::Receiver<Option<TuyaMessage>>,
    listeners: Arc<Mutex<Listeners>>,
}

impl PendingResponse {
    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    /// Wait for the matching frame.
    ///
    /// Returns `Ok(None)` when the dispatcher was aborted and
    /// `Err(TuyaError::Timeout)` when nothing arrived within `limit`.
    pub async fn wait(mut self, limit: Duration) -> Result<Option<TuyaMessage>> {
        debug!("Waiting for sequence number {}", self.seqno);
        match timeout(limit, &mut self.rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Ok(None),
            Err(_) => Err(TuyaError::Timeout),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let mut listeners = self.listeners.lock();
        if listeners
            .waiters
            .get(&self.seqno)
            .is_some_and(|w| w.id == self.id)
        {
            listeners.waiters.remove(&self.seqno);
            trace!("Removed listener for sequence number {}", self.seqno);
        }
    }
}

/// Buffer and dispatcher for Tuya messages.
pub struct MessageDispatcher {
    buffer: Mutex<Vec<u8>>,
    listeners: Arc<Mutex<Listeners>>,
    last_seqno: AtomicI64,
    status_handler: StatusHandler,
}

impl MessageDispatcher {
    pub fn new<F>(status_handler: F) -> Self
    where
        F: Fn(TuyaMessage) + Send + Sync + 'static,
    {
        Self {
            buffer: Mutex::new(Vec::new()),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            last_seqno: AtomicI64::new(-1),
            status_handler: Box::new(status_handler),
        }
    }

    /// Register interest in the response carrying `seqno`.
    ///
    /// Must be called before the request is written so a fast reply cannot be missed.
    pub fn register(&self, seqno: u32) -> Result<PendingResponse> {
        let mut listeners = self.listeners.lock();
        if listeners.waiters.contains_key(&seqno) {
            return Err(TuyaError::DuplicateWaiter(seqno));
        }
        let (tx, rx) = oneshot::channel();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.waiters.insert(seqno, Waiter { id, tx });

        Ok(PendingResponse {
            seqno,
            id,
            rx,
            listeners: self.listeners.clone(),
        })
    }

    /// Release every outstanding waiter with "no message". Returns how many were woken.
    pub fn abort(&self) -> usize {
        let waiters: Vec<Waiter> = self.listeners.lock().waiters.drain().map(|(_, w)| w).collect();
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(None);
        }
        if count > 0 {
            debug!("Aborted {} waiting listener(s)", count);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.listeners.lock().waiters.len()
    }

    /// Highest sequence number dispatched so far.
    pub fn last_seqno(&self) -> Option<u32> {
        u32::try_from(self.last_seqno.load(Ordering::SeqCst)).ok()
    }

    /// Add new data to the buffer and dispatch every complete frame.
    /// Returns the number of frames dispatched.
    pub fn add_data(&self, data: &[u8]) -> usize {
        let frames = {
            let mut buffer = self.buffer.lock();
            buffer.extend_from_slice(data);
            Self::extract_frames(&mut buffer)
        };

        let mut dispatched = 0;
        for frame in frames {
            match unpack_message(&frame) {
                Ok(msg) => {
                    if !verify_checksum(&frame).unwrap_or(false) {
                        warn!("CRC mismatch on frame seqno={} (ignored)", msg.seqno);
                    }
                    self.dispatch(msg);
                    dispatched += 1;
                }
                Err(e) => warn!("Dropping malformed frame: {}", e),
            }
        }
        dispatched
    }

    fn extract_frames(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        loop {
            if buffer.len() >= PREFIX_BYTES.len() && !buffer.starts_with(&PREFIX_BYTES) {
                Self::resync(buffer);
                continue;
            }
            if buffer.len() < RECV_HEADER_LEN {
                break;
            }
            match parse_header(buffer) {
                Ok(header) => {
                    if buffer.len() < header.total_length {
                        break;
                    }
                    frames.push(buffer.drain(..header.total_length).collect());
                }
                Err(e) => {
                    warn!("Bad frame header ({}), skipping prefix", e);
                    buffer.drain(..1);
                }
            }
        }
        frames
    }

    /// Discard bytes up to the next frame prefix. Keeps a possible partial prefix.
    fn resync(buffer: &mut Vec<u8>) {
        let skip = buffer
            .windows(PREFIX_BYTES.len())
            .position(|w| w == PREFIX_BYTES)
            .unwrap_or(buffer.len() + 1 - PREFIX_BYTES.len());
        warn!("Discarding {} byte(s) of unframed data", skip);
        buffer.drain(..skip);
    }

    /// Dispatch a message to someone that is listening.
    fn dispatch(&self, msg: TuyaMessage) {
        self.last_seqno
            .fetch_max(msg.seqno as i64, Ordering::SeqCst);

        let waiter = self.listeners.lock().waiters.remove(&msg.seqno);
        if let Some(waiter) = waiter {
            debug!("Dispatching sequence number {}", msg.seqno);
            let _ = waiter.tx.send(Some(msg));
            return;
        }

        match msg.command_type() {
            Some(CommandType::HeartBeat) => debug!("Got heartbeat response"),
            Some(CommandType::Status) => {
                debug!("Got status update");
                (self.status_handler)(msg);
            }
            _ => debug!(
                "Got message type 0x{:02X} for unknown listener {}",
                msg.cmd, msg.seqno
            ),
        }
    }
}
