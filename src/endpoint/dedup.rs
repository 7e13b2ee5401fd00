use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::message::{CoapMessage, CoapOption};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    peer: SocketAddr,
    token: Vec<u8>,
    options: Vec<CoapOption>,
}

impl RequestKey {
    fn of(peer: SocketAddr, request: &CoapMessage) -> Self {
        RequestKey {
            peer,
            token: request.token.clone(),
            options: request.options_for_matching(),
        }
    }
}

struct CachedReply {
    message_id: u16,
    reply: Option<Vec<u8>>,
    stored: Instant,
}

/// Outcome of looking up an inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestLookup {
    New,
    /// Retransmission of a request already answered; holds the encoded reply if one was sent
    Duplicate(Option<Vec<u8>>),
}

/// Recently seen inbound exchanges.
///
/// Requests are keyed by `(peer, token, options for matching)` and only count
/// as duplicates when the message id is also the same. Responses are keyed by
/// `(peer, message id)`. Entries expire after the exchange lifetime.
pub struct ExchangeCache {
    requests: HashMap<RequestKey, CachedReply>,
    responses: HashMap<(SocketAddr, u16), Instant>,
    lifetime: Duration,
    last_purge: Instant,
}

impl ExchangeCache {
    pub fn new(lifetime: Duration) -> Self {
        ExchangeCache {
            requests: HashMap::new(),
            responses: HashMap::new(),
            lifetime,
            last_purge: Instant::now(),
        }
    }

    pub fn lookup_request(&mut self, peer: SocketAddr, request: &CoapMessage, now: Instant) -> RequestLookup {
        self.purge(now);
        match self.requests.get(&RequestKey::of(peer, request)) {
            Some(cached) if cached.message_id == request.message_id => RequestLookup::Duplicate(cached.reply.clone()),
            _ => RequestLookup::New,
        }
    }

    pub fn store_reply(&mut self, peer: SocketAddr, request: &CoapMessage, reply: Option<Vec<u8>>, now: Instant) {
        self.requests.insert(
            RequestKey::of(peer, request),
            CachedReply { message_id: request.message_id, reply, stored: now },
        );
    }

    /// Record an inbound response. Returns true if it was seen before.
    pub fn check_response(&mut self, peer: SocketAddr, message_id: u16, now: Instant) -> bool {
        self.purge(now);
        self.responses.insert((peer, message_id), now).is_some()
    }

    pub fn len(&self) -> usize {
        self.requests.len() + self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.requests.clear();
        self.responses.clear();
    }

    fn purge(&mut self, now: Instant) {
        // At most once per second
        if now.saturating_duration_since(self.last_purge) < Duration::from_secs(1) {
            return;
        }
        self.last_purge = now;
        let lifetime = self.lifetime;
        self.requests.retain(|_, c| now.saturating_duration_since(c.stored) < lifetime);
        self.responses.retain(|_, seen| now.saturating_duration_since(*seen) < lifetime);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, Method, OptionKind};

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn request(mid: u16) -> CoapMessage {
        let mut req = CoapMessage::request(MessageType::Confirmable, Method::Get, mid);
        req.token = vec![1, 2, 3, 4];
        req.add_option(CoapOption::string(OptionKind::UriPath, "temp"));
        req
    }

    #[test]
    fn test_request_retransmission_replays_reply() {
        let mut cache = ExchangeCache::new(Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(cache.lookup_request(peer(), &request(7), now), RequestLookup::New);
        cache.store_reply(peer(), &request(7), Some(vec![0x60, 0x45, 0, 7]), now);

        assert_eq!(
            cache.lookup_request(peer(), &request(7), now),
            RequestLookup::Duplicate(Some(vec![0x60, 0x45, 0, 7]))
        );
    }

    #[test]
    fn test_same_token_new_message_id_is_new() {
        let mut cache = ExchangeCache::new(Duration::from_secs(60));
        let now = Instant::now();
        cache.store_reply(peer(), &request(7), None, now);
        assert_eq!(cache.lookup_request(peer(), &request(8), now), RequestLookup::New);
    }

    #[test]
    fn test_etag_does_not_affect_matching() {
        let mut cache = ExchangeCache::new(Duration::from_secs(60));
        let now = Instant::now();
        cache.store_reply(peer(), &request(7), None, now);
        let mut retransmitted = request(7);
        retransmitted.add_option(CoapOption::opaque(OptionKind::ETag, &[9]));
        assert_eq!(cache.lookup_request(peer(), &retransmitted, now), RequestLookup::Duplicate(None));
    }

    #[test]
    fn test_response_duplicates() {
        let mut cache = ExchangeCache::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(!cache.check_response(peer(), 100, now));
        assert!(cache.check_response(peer(), 100, now));
        assert!(!cache.check_response("127.0.0.1:9999".parse().unwrap(), 100, now));
    }

    #[test]
    fn test_entries_expire() {
        let mut cache = ExchangeCache::new(Duration::from_secs(5));
        let start = Instant::now();
        cache.store_reply(peer(), &request(7), None, start);
        assert!(!cache.check_response(peer(), 1, start));
        assert_eq!(cache.len(), 2);

        let later = start + Duration::from_secs(10);
        assert_eq!(cache.lookup_request(peer(), &request(7), later), RequestLookup::New);
        assert!(!cache.check_response(peer(), 1, later));
        assert_eq!(cache.len(), 1);
    }
}
