//! Sequence-number keyed response correlation.
//!
//! Every outbound request either waits on its own seqno or on one of three
//! reserved virtual seqnos (heartbeat, reset, session-key), so that a reply
//! can be routed back to the caller that's waiting for it even when several
//! exchanges are in flight at once. Negative values are used for the
//! virtual seqnos so they can never collide with a real (always
//! non-negative) wire seqno.

use crate::error::{Result, TuyaError};
use crate::protocol::TuyaMessage;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Unsolicited heartbeat replies route here when no explicit heartbeat
/// exchange is waiting on the real seqno.
pub const HEARTBEAT_SEQNO: i64 = -100;
/// `reset()` waits here rather than on the outgoing UPDATE_DPS seqno, since
/// the device's follow-up STATUS/UPDATE_DPS frame does not reliably echo it.
pub const RESET_SEQNO: i64 = -101;
/// Reserved for the handshake's SESS_KEY_NEG_RESP step. The handshake
/// currently reads its response directly off the socket rather than through
/// this table (see `src/handshake.rs`), but the constant is kept so no real
/// waiter can ever be registered under it.
pub const SESSION_KEY_SEQNO: i64 = -102;

/// Table of in-flight exchanges, keyed by (possibly virtual) sequence number.
#[derive(Default)]
pub struct WaiterTable {
    waiters: Mutex<HashMap<i64, oneshot::Sender<TuyaMessage>>>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new waiter for `seqno`. Registering a second waiter for a
    /// seqno that already has one is a programming error.
    pub fn register(&self, seqno: i64) -> Result<oneshot::Receiver<TuyaMessage>> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.contains_key(&seqno) {
            return Err(TuyaError::DecodeError(format!(
                "duplicate waiter for seqno {seqno}"
            )));
        }
        waiters.insert(seqno, tx);
        Ok(rx)
    }

    /// Unregister a waiter without resolving it (timeout, cancellation).
    pub fn remove(&self, seqno: i64) {
        self.waiters.lock().unwrap().remove(&seqno);
    }

    /// Attempt to hand `msg` to whichever waiter is registered for `seqno`.
    /// Returns `Some(msg)` (handing it back) if no waiter claimed it, so the
    /// caller can fall back to routing by command or deliver it unsolicited.
    pub fn route(&self, seqno: i64, msg: TuyaMessage) -> Option<TuyaMessage> {
        let sender = self.waiters.lock().unwrap().remove(&seqno);
        match sender {
            Some(tx) => {
                let _ = tx.send(msg);
                None
            }
            None => Some(msg),
        }
    }

    /// True if a waiter is currently registered for `seqno`.
    pub fn is_waiting(&self, seqno: i64) -> bool {
        self.waiters.lock().unwrap().contains_key(&seqno)
    }

    /// Drop every pending waiter (transport lost); each caller's `await`
    /// resolves with a closed-channel error.
    pub fn fail_all(&self) {
        self.waiters.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TuyaMessage;

    fn msg(seqno: u32) -> TuyaMessage {
        TuyaMessage {
            seqno,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn out_of_order_replies_resolve_to_the_right_caller() {
        let table = WaiterTable::new();
        let rx1 = table.register(1).unwrap();
        let rx2 = table.register(2).unwrap();
        let rx3 = table.register(3).unwrap();

        // Device replies out of order: 3, 1, 2.
        assert!(table.route(3, msg(3)).is_none());
        assert!(table.route(1, msg(1)).is_none());
        assert!(table.route(2, msg(2)).is_none());

        assert_eq!(rx1.await.unwrap().seqno, 1);
        assert_eq!(rx2.await.unwrap().seqno, 2);
        assert_eq!(rx3.await.unwrap().seqno, 3);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = WaiterTable::new();
        let _rx = table.register(5).unwrap();
        assert!(table.register(5).is_err());
    }

    #[test]
    fn unclaimed_message_is_handed_back() {
        let table = WaiterTable::new();
        let handed_back = table.route(42, msg(42));
        assert!(handed_back.is_some());
    }

    #[tokio::test]
    async fn fail_all_drops_every_waiter() {
        let table = WaiterTable::new();
        let rx = table.register(1).unwrap();
        table.fail_all();
        assert!(rx.await.is_err());
    }
}
