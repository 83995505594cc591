//! Pairing registry.
//!
//! Issues short-lived code+PIN challenges to agents and promotes a
//! successful redemption into a durable pairing. Challenges live only in
//! this process: a gateway restart drops them and agents get fresh ones
//! when they reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use uniscan_core::GatewayConfig;
use uniscan_core::db::{DatabaseError, duration_millis, unix_millis};
use uniscan_proto::messages::PairingView;
use uniscan_proto::{ErrorCode, WireError};
use uniscan_store::{DeliveryStore, Pairing};

use crate::registry::ConnectionRegistry;

const CODE_RETRIES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("pairing code not found or expired")]
    NotFound,

    #[error("pin required")]
    PinRequired,

    #[error("pin mismatch ({remaining} attempts left)")]
    PinMismatch { remaining: u32 },

    #[error("no free pairing code available")]
    CodeSpaceExhausted,

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

impl PairingError {
    pub fn to_wire(&self) -> WireError {
        let code = match self {
            Self::NotFound => ErrorCode::NotFound,
            Self::PinRequired => ErrorCode::PinRequired,
            Self::PinMismatch { .. } => ErrorCode::PinMismatch,
            Self::CodeSpaceExhausted | Self::Database(_) => ErrorCode::Internal,
        };
        WireError::new(code, self.to_string())
    }
}

/// A challenge as handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedChallenge {
    pub code: String,
    pub pin: String,
    pub pc_id: String,
    /// Unix milliseconds.
    pub expires_at: i64,
}

#[derive(Debug)]
struct Challenge {
    issued: IssuedChallenge,
    deadline: Instant,
    fail_count: u32,
}

impl Challenge {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[derive(Default)]
struct Challenges {
    by_code: HashMap<String, Challenge>,
    code_by_pc: HashMap<String, String>,
}

impl Challenges {
    fn remove_code(&mut self, code: &str) -> Option<Challenge> {
        let challenge = self.by_code.remove(code)?;
        if self.code_by_pc.get(&challenge.issued.pc_id).map(String::as_str) == Some(code) {
            self.code_by_pc.remove(&challenge.issued.pc_id);
        }
        Some(challenge)
    }

    fn remove_pc(&mut self, pc_id: &str) -> bool {
        match self.code_by_pc.remove(pc_id) {
            Some(code) => self.by_code.remove(&code).is_some(),
            None => false,
        }
    }
}

/// Splits `"123456-1234"` into code and PIN when no separate PIN was given.
fn split_code_pin<'a>(code: &'a str, pin: Option<&'a str>) -> (&'a str, Option<&'a str>) {
    let code = code.trim();
    let pin = pin.map(str::trim).filter(|p| !p.is_empty());
    if pin.is_none() {
        if let Some((c, p)) = code.split_once('-') {
            return (c.trim(), Some(p.trim()).filter(|p| !p.is_empty()));
        }
    }
    (code, pin)
}

/// Challenge table plus the durable pairing operations built on it.
#[derive(Clone)]
pub struct PairingRegistry {
    challenges: Arc<Mutex<Challenges>>,
    store: DeliveryStore,
    ttl: Duration,
    max_failures: u32,
}

impl PairingRegistry {
    pub fn new(store: DeliveryStore, config: &GatewayConfig) -> Self {
        Self {
            challenges: Arc::new(Mutex::new(Challenges::default())),
            store,
            ttl: config.pairing_ttl(),
            max_failures: config.max_pin_failures.max(1),
        }
    }

    /// Issue a fresh challenge for an agent, discarding any previous one.
    pub async fn issue_challenge(&self, pc_id: &str) -> Result<IssuedChallenge, PairingError> {
        let mut table = self.challenges.lock().await;
        table.remove_pc(pc_id);

        let mut rng = rand::thread_rng();
        let code = (0..CODE_RETRIES)
            .map(|_| rng.gen_range(100_000..=999_999).to_string())
            .find(|c| table.by_code.get(c).is_none_or(Challenge::is_expired))
            .ok_or(PairingError::CodeSpaceExhausted)?;
        let pin = format!("{:04}", rng.gen_range(0..10_000));

        // An expired challenge holding this code may still be indexed.
        table.remove_code(&code);

        let issued = IssuedChallenge {
            code: code.clone(),
            pin,
            pc_id: pc_id.to_string(),
            expires_at: unix_millis() + duration_millis(self.ttl),
        };
        table.code_by_pc.insert(pc_id.to_string(), code.clone());
        table.by_code.insert(
            code,
            Challenge {
                issued: issued.clone(),
                deadline: Instant::now() + self.ttl,
                fail_count: 0,
            },
        );

        debug!(pc_id, expires_at = issued.expires_at, "Pairing challenge issued");
        Ok(issued)
    }

    /// Redeem a challenge for a scanner. Consumes the challenge on success
    /// and after too many wrong PINs.
    pub async fn redeem_challenge(
        &self,
        eqid: &str,
        code: &str,
        pin: Option<&str>,
    ) -> Result<Pairing, PairingError> {
        let (code, pin) = split_code_pin(code, pin);

        let pc_id = {
            let mut table = self.challenges.lock().await;
            let Some(challenge) = table.by_code.get_mut(code) else {
                return Err(PairingError::NotFound);
            };
            if challenge.is_expired() {
                table.remove_code(code);
                return Err(PairingError::NotFound);
            }
            let Some(pin) = pin else {
                return Err(PairingError::PinRequired);
            };
            if pin != challenge.issued.pin {
                challenge.fail_count += 1;
                let remaining = self.max_failures.saturating_sub(challenge.fail_count);
                let pc_id = challenge.issued.pc_id.clone();
                if remaining == 0 {
                    table.remove_code(code);
                    warn!(pc_id = %pc_id, eqid, "Pairing challenge locked out after repeated PIN failures");
                }
                return Err(PairingError::PinMismatch { remaining });
            }
            table
                .remove_code(code)
                .map(|c| c.issued.pc_id)
                .ok_or(PairingError::NotFound)?
        };

        let pairing = self.store.upsert_pairing(eqid, &pc_id, true).await?;
        info!(eqid, pc_id = %pc_id, "Scanner paired with agent");
        Ok(pairing)
    }

    /// Drop an agent's live challenge (socket closed).
    pub async fn invalidate(&self, pc_id: &str) -> bool {
        self.challenges.lock().await.remove_pc(pc_id)
    }

    /// Enable or disable a pairing without a challenge.
    pub async fn set_enabled(
        &self,
        eqid: &str,
        pc_id: &str,
        enabled: bool,
    ) -> Result<Pairing, PairingError> {
        let pairing = self.store.upsert_pairing(eqid, pc_id, enabled).await?;
        info!(eqid, pc_id, enabled, "Pairing updated");
        Ok(pairing)
    }

    /// Durable pairings of a scanner joined with live agent presence.
    pub async fn list(
        &self,
        eqid: &str,
        connections: &ConnectionRegistry,
    ) -> Result<Vec<PairingView>, PairingError> {
        let pairings = self.store.list_pairings(eqid).await?;
        let mut views = Vec::with_capacity(pairings.len());
        for p in pairings {
            views.push(PairingView {
                online: connections.is_agent_online(&p.pc_id).await,
                pc_id: p.pc_id,
                enabled: p.enabled,
            });
        }
        Ok(views)
    }

    pub async fn live_count(&self) -> usize {
        self.challenges
            .lock()
            .await
            .by_code
            .values()
            .filter(|c| !c.is_expired())
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn registry_with(config: GatewayConfig) -> PairingRegistry {
        let store = DeliveryStore::open_in_memory().await.unwrap();
        PairingRegistry::new(store, &config)
    }

    async fn registry() -> PairingRegistry {
        registry_with(GatewayConfig::default()).await
    }

    #[tokio::test]
    async fn issued_code_and_pin_have_fixed_widths() {
        let reg = registry().await;
        let c = reg.issue_challenge("pc1").await.unwrap();
        assert_eq!(c.code.len(), 6);
        assert!(c.code.chars().all(|ch| ch.is_ascii_digit()));
        assert!(!c.code.starts_with('0'));
        assert_eq!(c.pin.len(), 4);
        assert!(c.expires_at > unix_millis());
    }

    #[tokio::test]
    async fn redemption_is_one_time() {
        let reg = registry().await;
        let c = reg.issue_challenge("pc1").await.unwrap();

        let pairing = reg.redeem_challenge("ABC123", &c.code, Some(&c.pin)).await.unwrap();
        assert_eq!(pairing.pc_id, "pc1");
        assert!(pairing.enabled);

        let again = reg.redeem_challenge("ABC123", &c.code, Some(&c.pin)).await;
        assert!(matches!(again, Err(PairingError::NotFound)));
    }

    #[tokio::test]
    async fn new_challenge_invalidates_previous() {
        let reg = registry().await;
        let first = reg.issue_challenge("pc1").await.unwrap();
        let second = reg.issue_challenge("pc1").await.unwrap();

        if first.code != second.code {
            let r = reg.redeem_challenge("E1", &first.code, Some(&first.pin)).await;
            assert!(matches!(r, Err(PairingError::NotFound)));
        }
        reg.redeem_challenge("E1", &second.code, Some(&second.pin))
            .await
            .unwrap();
        assert_eq!(reg.live_count().await, 0);
    }

    #[tokio::test]
    async fn missing_pin_is_rejected_without_counting() {
        let reg = registry().await;
        let c = reg.issue_challenge("pc1").await.unwrap();
        let r = reg.redeem_challenge("E1", &c.code, None).await;
        assert!(matches!(r, Err(PairingError::PinRequired)));
        reg.redeem_challenge("E1", &c.code, Some(&c.pin)).await.unwrap();
    }

    #[tokio::test]
    async fn combined_code_pin_is_accepted() {
        let reg = registry().await;
        let c = reg.issue_challenge("pc1").await.unwrap();
        let combined = format!("{}-{}", c.code, c.pin);
        reg.redeem_challenge("E1", &combined, None).await.unwrap();
    }

    #[tokio::test]
    async fn repeated_pin_failures_lock_out() {
        let reg = registry().await;
        let c = reg.issue_challenge("pc1").await.unwrap();
        let wrong = if c.pin == "0000" { "1111" } else { "0000" };

        for expected_remaining in (0..5).rev() {
            match reg.redeem_challenge("E1", &c.code, Some(wrong)).await {
                Err(PairingError::PinMismatch { remaining }) => {
                    assert_eq!(remaining, expected_remaining);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        let r = reg.redeem_challenge("E1", &c.code, Some(&c.pin)).await;
        assert!(matches!(r, Err(PairingError::NotFound)));
    }

    #[tokio::test]
    async fn expired_challenge_is_not_found() {
        let reg = registry_with(GatewayConfig {
            pairing_ttl_secs: 0,
            ..GatewayConfig::default()
        })
        .await;
        let c = reg.issue_challenge("pc1").await.unwrap();
        let r = reg.redeem_challenge("E1", &c.code, Some(&c.pin)).await;
        assert!(matches!(r, Err(PairingError::NotFound)));
    }

    #[tokio::test]
    async fn invalidate_drops_live_challenge() {
        let reg = registry().await;
        let c = reg.issue_challenge("pc1").await.unwrap();
        assert!(reg.invalidate("pc1").await);
        assert!(!reg.invalidate("pc1").await);
        let r = reg.redeem_challenge("E1", &c.code, Some(&c.pin)).await;
        assert!(matches!(r, Err(PairingError::NotFound)));
    }

    #[tokio::test]
    async fn set_enabled_and_list_reflect_presence() {
        let reg = registry().await;
        let connections = ConnectionRegistry::new();
        reg.set_enabled("E1", "pc1", true).await.unwrap();
        reg.set_enabled("E1", "pc2", false).await.unwrap();

        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        connections
            .register_agent("pc1", crate::registry::ClientHandle::new(1, tx))
            .await;

        let list = reg.list("E1", &connections).await.unwrap();
        assert_eq!(list.len(), 2);
        let pc1 = list.iter().find(|v| v.pc_id == "pc1").unwrap();
        assert!(pc1.enabled && pc1.online);
        let pc2 = list.iter().find(|v| v.pc_id == "pc2").unwrap();
        assert!(!pc2.enabled && !pc2.online);
    }

    #[test]
    fn split_code_pin_prefers_explicit_pin() {
        assert_eq!(split_code_pin("123456-1234", None), ("123456", Some("1234")));
        assert_eq!(split_code_pin("123456", Some("9")), ("123456", Some("9")));
        assert_eq!(split_code_pin(" 123456 ", Some("  ")), ("123456", None));
    }
}
