use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;

use aegis_core::ErrorKind;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stable digest of a request's parameters. Binds a ticket to the exact
/// parameters the user was warned about; `BTreeMap` iteration order makes
/// the digest independent of insertion order.
pub fn parameter_digest(parameters: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in parameters {
        hasher.update(key.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct ConfirmationTicket {
    pub ticket_id: String,
    pub session_id: String,
    pub resource_id: String,
    pub action: String,
    pub parameter_digest: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GateKey {
    session_id: String,
    resource_id: String,
    action: String,
}

/// Per-(session, resource, action) confirmation state machine. At most
/// one pending ticket exists per key; issuing replaces any earlier one,
/// so only the most recent warning is honorable. Consumption happens
/// under the shard lock: two racing confirmations of the same ticket
/// produce exactly one winner.
pub struct ConfirmationGate {
    shards: Vec<Mutex<HashMap<GateKey, ConfirmationTicket>>>,
    ttl: Duration,
}

impl ConfirmationGate {
    pub fn new(shard_count: usize, ttl: Duration) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards, ttl }
    }

    /// Issues a fresh single-use ticket for the key, invalidating any
    /// prior pending ticket for the same key.
    pub fn issue(
        &self,
        session_id: &str,
        resource_id: &str,
        action: &str,
        parameter_digest: &str,
    ) -> ConfirmationTicket {
        let now = Utc::now();
        let key = GateKey {
            session_id: session_id.to_string(),
            resource_id: resource_id.to_string(),
            action: action.to_string(),
        };
        let ticket = ConfirmationTicket {
            ticket_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            resource_id: resource_id.to_string(),
            action: action.to_string(),
            parameter_digest: parameter_digest.to_string(),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        let mut shard = self.shard_for(&key);
        shard.insert(key, ticket.clone());
        ticket
    }

    /// Validates a supplied token against the key's pending ticket and
    /// consumes it. Failure modes:
    /// - no pending ticket, stale token, TTL passed, or already consumed
    ///   by a racing caller -> `ConfirmationExpired`
    /// - parameters changed since the warning -> `ConfirmationMismatch`
    ///   (the pending ticket is dropped; the caller must be re-warned)
    pub fn confirm(
        &self,
        session_id: &str,
        resource_id: &str,
        action: &str,
        token: &str,
        parameter_digest: &str,
    ) -> Result<ConfirmationTicket, ErrorKind> {
        let now = Utc::now();
        let key = GateKey {
            session_id: session_id.to_string(),
            resource_id: resource_id.to_string(),
            action: action.to_string(),
        };
        let mut shard = self.shard_for(&key);
        let Some(ticket) = shard.get(&key) else {
            return Err(ErrorKind::ConfirmationExpired);
        };
        if ticket.ticket_id != token {
            return Err(ErrorKind::ConfirmationExpired);
        }
        if now > ticket.expires_at {
            shard.remove(&key);
            return Err(ErrorKind::ConfirmationExpired);
        }
        if ticket.parameter_digest != parameter_digest {
            shard.remove(&key);
            return Err(ErrorKind::ConfirmationMismatch);
        }
        // Consumption removes the entry while the shard lock is held,
        // which is what makes the ticket single-use under concurrency.
        shard.remove(&key).ok_or(ErrorKind::ConfirmationExpired)
    }

    /// Advisory TTL sweep; `confirm` re-checks expiry independently.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = shard.len();
            shard.retain(|_, ticket| now <= ticket.expires_at);
            removed += before - shard.len();
        }
        removed
    }

    fn shard_for(&self, key: &GateKey) -> std::sync::MutexGuard<'_, HashMap<GateKey, ConfirmationTicket>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn digest_of(pairs: &[(&str, &str)]) -> String {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        parameter_digest(&map)
    }

    fn gate() -> ConfirmationGate {
        ConfirmationGate::new(4, Duration::minutes(5))
    }

    #[test]
    fn digest_is_stable_across_insertion_order() {
        let mut forward = BTreeMap::new();
        forward.insert("a".to_string(), "1".to_string());
        forward.insert("b".to_string(), "2".to_string());
        let mut reverse = BTreeMap::new();
        reverse.insert("b".to_string(), "2".to_string());
        reverse.insert("a".to_string(), "1".to_string());
        assert_eq!(parameter_digest(&forward), parameter_digest(&reverse));
    }

    #[test]
    fn digest_separates_key_value_boundaries() {
        assert_ne!(digest_of(&[("ab", "c")]), digest_of(&[("a", "bc")]));
    }

    #[test]
    fn ticket_confirms_once_then_expires() {
        let gate = gate();
        let digest = digest_of(&[]);
        let ticket = gate.issue("s1", "srv1", "restart", &digest);
        assert!(
            gate.confirm("s1", "srv1", "restart", &ticket.ticket_id, &digest)
                .is_ok()
        );
        let err = gate
            .confirm("s1", "srv1", "restart", &ticket.ticket_id, &digest)
            .unwrap_err();
        assert_eq!(err, ErrorKind::ConfirmationExpired);
    }

    #[test]
    fn reissue_invalidates_the_prior_ticket() {
        let gate = gate();
        let digest = digest_of(&[]);
        let stale = gate.issue("s1", "srv1", "restart", &digest);
        let fresh = gate.issue("s1", "srv1", "restart", &digest);
        let err = gate
            .confirm("s1", "srv1", "restart", &stale.ticket_id, &digest)
            .unwrap_err();
        assert_eq!(err, ErrorKind::ConfirmationExpired);
        assert!(
            gate.confirm("s1", "srv1", "restart", &fresh.ticket_id, &digest)
                .is_ok()
        );
    }

    #[test]
    fn changed_parameters_mismatch_and_drop_the_ticket() {
        let gate = gate();
        let warned = digest_of(&[("command", "ban playerX")]);
        let changed = digest_of(&[("command", "ban playerY")]);
        let ticket = gate.issue("s1", "srv1", "send_command", &warned);
        let err = gate
            .confirm("s1", "srv1", "send_command", &ticket.ticket_id, &changed)
            .unwrap_err();
        assert_eq!(err, ErrorKind::ConfirmationMismatch);
        // The original token is gone too; the caller must be re-warned.
        let err = gate
            .confirm("s1", "srv1", "send_command", &ticket.ticket_id, &warned)
            .unwrap_err();
        assert_eq!(err, ErrorKind::ConfirmationExpired);
    }

    #[test]
    fn ttl_expiry_rejects_the_ticket() {
        let gate = ConfirmationGate::new(2, Duration::zero());
        let digest = digest_of(&[]);
        let ticket = gate.issue("s1", "srv1", "stop", &digest);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let err = gate
            .confirm("s1", "srv1", "stop", &ticket.ticket_id, &digest)
            .unwrap_err();
        assert_eq!(err, ErrorKind::ConfirmationExpired);
    }

    #[test]
    fn tickets_for_different_keys_do_not_interfere() {
        let gate = gate();
        let digest = digest_of(&[]);
        let restart = gate.issue("s1", "srv1", "restart", &digest);
        let stop = gate.issue("s1", "srv1", "stop", &digest);
        assert!(
            gate.confirm("s1", "srv1", "restart", &restart.ticket_id, &digest)
                .is_ok()
        );
        assert!(
            gate.confirm("s1", "srv1", "stop", &stop.ticket_id, &digest)
                .is_ok()
        );
    }

    #[test]
    fn concurrent_confirmations_have_exactly_one_winner() {
        let gate = Arc::new(gate());
        let digest = digest_of(&[]);
        let ticket = gate.issue("s1", "srv1", "restart", &digest);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let token = ticket.ticket_id.clone();
                let digest = digest.clone();
                std::thread::spawn(move || {
                    gate.confirm("s1", "srv1", "restart", &token, &digest).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join())
            .filter(|result| matches!(result, Ok(true)))
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn sweep_drops_expired_tickets() {
        let gate = ConfirmationGate::new(2, Duration::zero());
        let digest = digest_of(&[]);
        let _ = gate.issue("s1", "srv1", "stop", &digest);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(gate.sweep_expired(), 1);
    }
}
