use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::message::{CoapMessage, CoapOption, Method};
use crate::runtime::timer::TaskHandle;

/// Lifecycle of an outbound exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    /// On the wire, awaiting ACK or response
    Sent,
    /// Resent `n` times
    Retransmitting(u32),
    /// Empty ACK received, awaiting a separate response
    AckedEmpty,
    ResponseReceived,
    Done,
    MaxRetransmissionsReached,
    Reset,
}

impl TransactionState {
    /// Still waiting for the peer to acknowledge the message
    pub fn awaiting_ack(&self) -> bool {
        matches!(self, TransactionState::Sent | TransactionState::Retransmitting(_))
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TransactionState::Done | TransactionState::MaxRetransmissionsReached | TransactionState::Reset
        )
    }
}

/// Callbacks for one outbound request. All methods default to no-ops.
///
/// Callbacks for one request run in order on a callback worker, never on the
/// receive thread. Each is delivered at most once per exchange.
pub trait ResponseListener: Send + Sync {
    fn empty_ack_received(&self, _request: &CoapMessage, _ack: &CoapMessage) {}

    fn piggybacked_response_received(&self, _request: &CoapMessage, _response: &CoapMessage) {}

    fn separate_response_received(&self, _request: &CoapMessage, _response: &CoapMessage) {}

    fn reset_response_received(&self, _request: &CoapMessage, _reset: &CoapMessage) {}

    fn maximum_retransmissions_reached(&self, _request: &CoapMessage) {}

    /// An equivalent request to the same peer is outstanding; nothing was sent
    fn service_busy(&self, _request: &CoapMessage) {}
}

pub(crate) struct Transaction {
    pub message: CoapMessage,
    pub bytes: Vec<u8>,
    pub peer: SocketAddr,
    pub listener: Option<Arc<dyn ResponseListener>>,
    pub state: TransactionState,
    pub retransmissions: u32,
    pub timeout: Duration,
    /// Responses from any source match by token
    pub multicast: bool,
    pub serial: u64,
    pub retransmit_timer: Option<TaskHandle>,
    pub expiry_timer: Option<TaskHandle>,
}

impl Transaction {
    pub fn new(
        message: CoapMessage,
        bytes: Vec<u8>,
        peer: SocketAddr,
        listener: Option<Arc<dyn ResponseListener>>,
        timeout: Duration,
        multicast: bool,
    ) -> Self {
        Transaction {
            message,
            bytes,
            peer,
            listener,
            state: TransactionState::Created,
            retransmissions: 0,
            timeout,
            multicast,
            serial: 0,
            retransmit_timer: None,
            expiry_timer: None,
        }
    }

    pub fn accepts_from(&self, peer: SocketAddr) -> bool {
        self.multicast || self.peer == peer
    }

    fn cancel_timers(&mut self) {
        if let Some(t) = self.retransmit_timer.take() {
            t.cancel();
        }
        if let Some(t) = self.expiry_timer.take() {
            t.cancel();
        }
    }
}

/// Outstanding outbound messages, indexed by message id and by request token
#[derive(Default)]
pub(crate) struct TransactionTable {
    by_mid: HashMap<u16, Transaction>,
    by_token: HashMap<Vec<u8>, u16>,
    next_serial: u64,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `tx` and return its serial. A stale entry with the same message id is dropped.
    pub fn insert(&mut self, mut tx: Transaction) -> u64 {
        let mid = tx.message.message_id;
        self.remove(mid);
        self.next_serial += 1;
        tx.serial = self.next_serial;
        if tx.message.is_request() && !tx.message.token.is_empty() {
            self.by_token.insert(tx.message.token.clone(), mid);
        }
        self.by_mid.insert(mid, tx);
        self.next_serial
    }

    pub fn get_mut(&mut self, mid: u16) -> Option<&mut Transaction> {
        self.by_mid.get_mut(&mid)
    }

    /// Message id of the request transaction carrying `token`
    pub fn mid_for_token(&self, token: &[u8]) -> Option<u16> {
        self.by_token.get(token).copied()
    }

    pub fn remove(&mut self, mid: u16) -> Option<Transaction> {
        let mut tx = self.by_mid.remove(&mid)?;
        self.unindex(&tx);
        tx.cancel_timers();
        Some(tx)
    }

    /// Remove `mid` only if it still holds the transaction numbered `serial`
    pub fn remove_if_serial(&mut self, mid: u16, serial: u64) -> Option<Transaction> {
        match self.by_mid.get(&mid) {
            Some(tx) if tx.serial == serial => self.remove(mid),
            _ => None,
        }
    }

    /// A unicast request to the same peer with the same method and matching
    /// options is outstanding. Group requests stay open for the exchange
    /// lifetime and never count.
    pub fn has_equivalent(&self, peer: SocketAddr, method: Method, options: &[CoapOption]) -> bool {
        self.by_mid.values().any(|tx| {
            !tx.multicast
                && tx.peer == peer
                && !tx.state.is_finished()
                && tx.message.method() == Some(method)
                && tx.message.options_for_matching() == options
        })
    }

    pub fn len(&self) -> usize {
        self.by_mid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mid.is_empty()
    }

    /// Drop everything, cancelling timers
    pub fn clear(&mut self) -> Vec<Transaction> {
        self.by_token.clear();
        let mut drained: Vec<Transaction> = self.by_mid.drain().map(|(_, tx)| tx).collect();
        for tx in &mut drained {
            tx.cancel_timers();
        }
        drained
    }

    fn unindex(&mut self, tx: &Transaction) {
        if self.by_token.get(&tx.message.token) == Some(&tx.message.message_id) {
            self.by_token.remove(&tx.message.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, OptionKind};

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn get(mid: u16, token: &[u8], path: &str) -> Transaction {
        let mut req = CoapMessage::request(MessageType::Confirmable, Method::Get, mid);
        req.token = token.to_vec();
        req.add_option(CoapOption::string(OptionKind::UriPath, path));
        Transaction::new(req, Vec::new(), peer(), None, Duration::from_secs(2), false)
    }

    #[test]
    fn test_lookup_by_mid_and_token() {
        let mut table = TransactionTable::new();
        table.insert(get(10, &[1], "a"));
        table.insert(get(11, &[2], "b"));
        assert_eq!(table.mid_for_token(&[2]), Some(11));
        assert!(table.get_mut(10).is_some());

        let removed = table.remove(11).unwrap();
        assert_eq!(removed.message.message_id, 11);
        assert_eq!(table.mid_for_token(&[2]), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_serial_guards_stale_removal() {
        let mut table = TransactionTable::new();
        let first = table.insert(get(10, &[1], "a"));
        let second = table.insert(get(10, &[2], "a"));
        assert_ne!(first, second);
        assert!(table.remove_if_serial(10, first).is_none());
        assert_eq!(table.mid_for_token(&[1]), None);
        assert!(table.remove_if_serial(10, second).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_equivalent_request_detection() {
        let mut table = TransactionTable::new();
        table.insert(get(10, &[1], "a"));
        let same = get(12, &[3], "a").message;
        assert!(table.has_equivalent(peer(), Method::Get, &same.options_for_matching()));
        let other = get(13, &[4], "b").message;
        assert!(!table.has_equivalent(peer(), Method::Get, &other.options_for_matching()));
        assert!(!table.has_equivalent(peer(), Method::Put, &same.options_for_matching()));
    }

    #[test]
    fn test_group_request_never_equivalent() {
        let mut table = TransactionTable::new();
        let mut group = get(20, &[5], "a");
        group.multicast = true;
        let options = group.message.options_for_matching();
        table.insert(group);
        assert!(!table.has_equivalent(peer(), Method::Get, &options));
    }

    #[test]
    fn test_state_predicates() {
        assert!(TransactionState::Sent.awaiting_ack());
        assert!(TransactionState::Retransmitting(2).awaiting_ack());
        assert!(!TransactionState::AckedEmpty.awaiting_ack());
        assert!(TransactionState::Reset.is_finished());
        assert!(!TransactionState::AckedEmpty.is_finished());
    }
}
