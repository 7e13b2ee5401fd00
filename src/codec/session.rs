use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hands out message ids and tokens for one endpoint.
/// Message ids wrap at 0xFFFF; tokens are the 4 big-endian bytes of a second counter.
pub struct MessageIdManager {
    next_id: AtomicU16,
    next_token: AtomicU32,
}

impl MessageIdManager {
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        MessageIdManager::starting_at(nanos as u16, nanos.rotate_left(16))
    }

    pub fn starting_at(message_id: u16, token: u32) -> Self {
        MessageIdManager {
            next_id: AtomicU16::new(message_id),
            next_token: AtomicU32::new(token),
        }
    }

    pub fn next_message_id(&self) -> u16 {
        // fetch_add wraps on overflow
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_token(&self) -> Vec<u8> {
        self.next_token.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec()
    }
}

impl Default for MessageIdManager {
    fn default() -> Self {
        Self::new()
    }
}
