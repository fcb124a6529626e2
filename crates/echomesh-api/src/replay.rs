//! Replay protection: a bounded per-sender window of recently seen nonces.
//!
//! In-memory only; a restart clears it, which the threat model accepts.
//! The check runs before any expensive crypto so a flood of random nonces
//! from an allowlisted sender cannot turn into decryption work, and an
//! unknown sender never reaches this table at all.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Per-sender nonce capacity. Oldest entries fall out first.
pub const MAX_NONCES_PER_SENDER: usize = 10_000;

#[derive(Default)]
struct SenderWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl SenderWindow {
    /// Atomic check-and-insert. Returns `false` on a duplicate.
    fn check_and_insert(&mut self, nonce: &str) -> bool {
        if self.seen.contains(nonce) {
            return false;
        }
        if self.order.len() >= MAX_NONCES_PER_SENDER {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(nonce.to_owned());
        self.order.push_back(nonce.to_owned());
        true
    }
}

/// Concurrent map of per-sender windows, each behind its own lock.
#[derive(Default)]
pub struct ReplayGuard {
    senders: Mutex<HashMap<String, Arc<Mutex<SenderWindow>>>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `(sender, nonce)`. Returns `false` when the pair was already
    /// seen.
    pub fn check_and_insert(&self, sender_fp: &str, nonce: &str) -> bool {
        let window = {
            let mut senders = self.senders.lock().expect("replay outer lock");
            Arc::clone(senders.entry(sender_fp.to_owned()).or_default())
        };
        let mut window = window.lock().expect("replay sender lock");
        window.check_and_insert(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_nonce_is_rejected() {
        let guard = ReplayGuard::new();
        assert!(guard.check_and_insert("A", "n1"));
        assert!(!guard.check_and_insert("A", "n1"));
    }

    #[test]
    fn windows_are_per_sender() {
        let guard = ReplayGuard::new();
        assert!(guard.check_and_insert("A", "n1"));
        assert!(guard.check_and_insert("B", "n1"));
    }

    #[test]
    fn window_is_bounded_lru() {
        let mut window = SenderWindow::default();
        for i in 0..MAX_NONCES_PER_SENDER {
            assert!(window.check_and_insert(&format!("n{i}")));
        }
        // the window is full; a fresh nonce evicts the oldest
        assert!(window.check_and_insert("overflow"));
        assert_eq!(window.order.len(), MAX_NONCES_PER_SENDER);
        assert!(window.check_and_insert("n0"));
        assert!(!window.check_and_insert("overflow"));
    }
}
