// SPDX-License-Identifier: Apache-2.0
//! Marshal token registry: opaque, TTL-governed handles external callers
//! hold instead of internal staging identifiers or slot addresses.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::util::unix_time_now;

/// Minimum entropy required of a minted token: 16 random bytes gives 128 bits,
/// comfortably above the 96-bit floor.
const TOKEN_BYTES: usize = 16;

/// One minted token's bookkeeping record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub staging_id: String,
    pub created_at: f64,
    pub ttl_secs: f64,
    pub origin: String,
    pub submitter: String,
    pub agent_id: String,
}

/// A resolved view of a token: its binding plus freshness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenView {
    pub staging_id: String,
    pub elapsed_secs: f64,
    pub remaining_secs: f64,
    pub expired: bool,
    pub origin: String,
    pub submitter: String,
    pub agent_id: String,
}

/// Mints and resolves opaque tokens bound to staging identifiers.
#[derive(Default)]
pub struct MarshalTokenRegistry {
    tokens: BTreeMap<String, TokenRecord>,
}

impl MarshalTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_token() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Drop any token whose age exceeds twice its TTL. Called on every mint.
    pub fn purge_expired(&mut self) {
        let now = unix_time_now();
        self.tokens.retain(|_, record| now - record.created_at <= 2.0 * record.ttl_secs);
    }

    /// Mint a fresh opaque token bound to `staging_id`.
    pub fn mint(&mut self, staging_id: &str, ttl: Duration, origin: &str, submitter: &str, agent_id: &str) -> String {
        self.purge_expired();
        let token = Self::generate_token();
        self.tokens.insert(
            token.clone(),
            TokenRecord {
                staging_id: staging_id.to_string(),
                created_at: unix_time_now(),
                ttl_secs: ttl.as_secs_f64(),
                origin: origin.to_string(),
                submitter: submitter.to_string(),
                agent_id: agent_id.to_string(),
            },
        );
        token
    }

    /// Re-mint a token bound to `staging_id` with the given TTL, used by
    /// restore when a persisted token expired during an outage but the slot
    /// remained locked.
    pub fn remint_with_ttl(&mut self, staging_id: &str, ttl: Duration, origin: &str, submitter: &str, agent_id: &str) -> String {
        self.mint(staging_id, ttl, origin, submitter, agent_id)
    }

    /// Restore a token verbatim from a checkpoint, preserving its original
    /// creation time so remaining TTL continues to count down correctly.
    pub fn restore_token(&mut self, token: &str, record: TokenRecord) {
        self.tokens.insert(token.to_string(), record);
    }

    /// Resolve a token to its binding and freshness. Returns `None` once the
    /// token has aged past `2*ttl` (it has been purged or would be on next mint).
    pub fn resolve(&self, token: &str) -> Option<TokenView> {
        let record = self.tokens.get(token)?;
        let now = unix_time_now();
        let elapsed = now - record.created_at;
        if elapsed > 2.0 * record.ttl_secs {
            return None;
        }
        let remaining = (record.ttl_secs - elapsed).max(0.0);
        Some(TokenView {
            staging_id: record.staging_id.clone(),
            elapsed_secs: elapsed,
            remaining_secs: remaining,
            expired: remaining <= 0.0,
            origin: record.origin.clone(),
            submitter: record.submitter.clone(),
            agent_id: record.agent_id.clone(),
        })
    }

    /// All live (non-purged) tokens, for checkpointing.
    pub fn snapshot(&self) -> BTreeMap<String, TokenRecord> {
        self.tokens.clone()
    }
}
