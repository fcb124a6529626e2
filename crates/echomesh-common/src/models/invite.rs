//! One-shot invite tokens.

use serde::{Deserialize, Serialize};

/// How long an invite stays redeemable after creation.
pub const INVITE_TTL_MS: i64 = 10 * 60 * 1000;

/// A token-gated, at-most-once contact bootstrap offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub token: String,
    pub created_at: i64,
    pub expires_at: i64,
    /// Set by the conditional consumption update; at most one caller wins.
    pub used_at: Option<i64>,
    /// Free-form hint about who redeemed the invite (never trusted).
    pub consumer_hint: Option<String>,
}

impl Invite {
    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// Live means redeemable: unused and unexpired.
    pub fn is_live(&self, now: i64) -> bool {
        !self.is_used() && !self.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness() {
        let inv = Invite {
            token: "t".repeat(22),
            created_at: 1000,
            expires_at: 1000 + INVITE_TTL_MS,
            used_at: None,
            consumer_hint: None,
        };
        assert!(inv.is_live(1000));
        // expiry boundary is inclusive: expires_at <= now means expired
        assert!(inv.is_live(1000 + INVITE_TTL_MS - 1));
        assert!(!inv.is_live(1000 + INVITE_TTL_MS));

        let used = Invite { used_at: Some(2000), ..inv };
        assert!(!used.is_live(1500));
    }
}
