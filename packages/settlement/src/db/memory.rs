//! In-process store with the same conditional-update semantics as `PgStore`.
//!
//! Every operation runs under one `tokio::sync::Mutex`, which gives the
//! row-count-checked claims the same atomicity Postgres provides.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::*;
use super::Store;
use crate::error::{Result, SettlementError};
use crate::types::{BridgeStatus, RedemptionStatus, UserStatus};

#[derive(Default)]
struct State {
    bridges: HashMap<Uuid, Bridge>,
    redemptions: HashMap<Uuid, Redemption>,
    positions: HashMap<Uuid, Position>,
    activities: Vec<Activity>,
    nonces: HashMap<(Uuid, String), DateTime<Utc>>,
}

impl State {
    fn reserved_shares(&self, position_id: Uuid) -> u128 {
        self.redemptions
            .values()
            .filter(|r| {
                r.position_id == position_id
                    && RedemptionStatus::RESERVING_SHARES.contains(&r.status)
            })
            .map(|r| r.shares)
            .sum()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a position directly, for tests and local dry runs.
    pub async fn seed_position(&self, wallet_address: &str, vault_id: &str, shares: u128) -> Position {
        let now = Utc::now();
        let position = Position {
            id: Uuid::new_v4(),
            wallet_address: wallet_address.to_string(),
            vault_id: vault_id.to_string(),
            shares,
            created_at: now,
            updated_at: now,
        };
        let mut state = self.state.lock().await;
        state.positions.insert(position.id, position.clone());
        position
    }
}

fn set_once<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if slot.is_none() {
        if let Some(v) = value {
            *slot = Some(v.clone());
        }
    }
}

fn set<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if let Some(v) = value {
        *slot = Some(v.clone());
    }
}

fn apply_bridge_patch(bridge: &mut Bridge, patch: &BridgePatch, now: DateTime<Utc>) {
    bridge.updated_at = now;
    if let Some(status) = patch.status {
        bridge.status = status;
    }
    if let Some(error) = &patch.error {
        bridge.error = Some(error.clone());
    } else if patch.clear_error {
        bridge.error = None;
    }
    if patch.bump_retry {
        bridge.retry_count += 1;
    }
    if let Some(route) = &patch.route {
        bridge.request_id = Some(route.request_id.clone());
        bridge.agent_vault_address = Some(route.agent_vault_address.clone());
        bridge.agent_underlying_address = Some(route.agent_underlying_address.clone());
        bridge.payment_reference = route.payment_reference.clone();
        bridge.reserved_base_drops = Some(route.reserved_base_drops);
        bridge.reserved_fee_drops = Some(route.reserved_fee_drops);
        bridge.fee_bps = Some(route.fee_bps);
    }
    set_once(&mut bridge.xrpl_tx_hash, &patch.xrpl_tx_hash);
    set_once(&mut bridge.mint_tx_hash, &patch.mint_tx_hash);
    set_once(&mut bridge.deposit_tx_hash, &patch.deposit_tx_hash);
    if patch.discard_proof {
        bridge.attestation_round = None;
        bridge.attestation_request = None;
        bridge.proof = None;
    }
    set(&mut bridge.attestation_round, &patch.attestation_round);
    set(&mut bridge.attestation_request, &patch.attestation_request);
    set_once(&mut bridge.proof, &patch.proof);
    set(&mut bridge.shares_minted, &patch.shares_minted);
    set_once(&mut bridge.position_id, &patch.position_id);
    set_once(&mut bridge.reserved_at, &patch.reserved_at);
    set_once(&mut bridge.xrpl_confirmed_at, &patch.xrpl_confirmed_at);
    set_once(&mut bridge.completed_at, &patch.completed_at);
    set_once(&mut bridge.cancelled_at, &patch.cancelled_at);
}

fn apply_redemption_patch(redemption: &mut Redemption, patch: &RedemptionPatch, now: DateTime<Utc>) {
    redemption.updated_at = now;
    if let Some(status) = patch.status {
        redemption.status = status;
    }
    if let Some(user_status) = patch.user_status {
        redemption.user_status = user_status;
    }
    if let Some(backend_status) = patch.backend_status {
        redemption.backend_status = Some(backend_status);
    }
    if patch.clear_errors {
        redemption.last_error = None;
        redemption.backend_error = None;
    }
    set(&mut redemption.last_error, &patch.last_error);
    set(&mut redemption.backend_error, &patch.backend_error);
    if patch.bump_retry {
        redemption.retry_count += 1;
    }
    set(&mut redemption.fxrp_received_drops, &patch.fxrp_received_drops);
    set_once(&mut redemption.vault_redeem_tx_hash, &patch.vault_redeem_tx_hash);
    if let Some(ticket) = &patch.ticket {
        redemption.redemption_request_id = Some(ticket.request_id);
        redemption.redemption_tx_hash = Some(ticket.tx_hash.clone());
        redemption.lots = Some(ticket.lots);
        redemption.xrp_sent_drops = Some(ticket.xrp_expected_drops);
        redemption.payment_reference = Some(ticket.payment_reference.clone());
        redemption.agent_vault_address = Some(ticket.agent_vault_address.clone());
        redemption.payment_deadline = ticket.payment_deadline;
    }
    set(&mut redemption.xrpl_payout_tx_hash, &patch.xrpl_payout_tx_hash);
    set(&mut redemption.xrp_sent_drops, &patch.xrp_sent_drops);
    if patch.discard_proof {
        redemption.attestation_round = None;
        redemption.attestation_request = None;
        redemption.proof = None;
    }
    set(&mut redemption.attestation_round, &patch.attestation_round);
    set(&mut redemption.attestation_request, &patch.attestation_request);
    set_once(&mut redemption.proof, &patch.proof);
    set_once(&mut redemption.confirm_tx_hash, &patch.confirm_tx_hash);
    set_once(&mut redemption.shares_redeemed_at, &patch.shares_redeemed_at);
    set_once(&mut redemption.redemption_requested_at, &patch.redemption_requested_at);
    set_once(&mut redemption.xrpl_payout_at, &patch.xrpl_payout_at);
    set_once(&mut redemption.completed_at, &patch.completed_at);
    set_once(&mut redemption.failed_at, &patch.failed_at);
}

fn bridge_matches(bridge: &Bridge, expected: &[BridgeStatus], patch: &BridgePatch) -> bool {
    expected.contains(&bridge.status)
        && (patch.route.is_none() || bridge.agent_vault_address.is_none())
}

fn redemption_matches(
    redemption: &Redemption,
    expected: &[RedemptionStatus],
    patch: &RedemptionPatch,
) -> bool {
    expected.contains(&redemption.status)
        && (patch.ticket.is_none() || redemption.redemption_request_id.is_none())
}

fn sorted_by_update<T>(mut items: Vec<T>, key: impl Fn(&T) -> DateTime<Utc>, limit: i64) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items.truncate(limit.max(0) as usize);
    items
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_bridge(&self, new: &NewBridge) -> Result<Bridge> {
        let now = Utc::now();
        let bridge = Bridge {
            id: new.id,
            request_id: None,
            wallet_address: new.wallet_address.clone(),
            vault_id: new.vault_id.clone(),
            position_id: new.position_id,
            settlement: new.settlement,
            requested_drops: new.requested_drops,
            rounded_drops: new.rounded_drops,
            lots: new.lots,
            expected_fxrp_drops: new.expected_fxrp_drops,
            reserved_base_drops: None,
            reserved_fee_drops: None,
            fee_bps: None,
            agent_vault_address: None,
            agent_underlying_address: None,
            payment_reference: None,
            xrpl_tx_hash: None,
            mint_tx_hash: None,
            deposit_tx_hash: None,
            attestation_round: None,
            attestation_request: None,
            proof: None,
            shares_minted: None,
            status: BridgeStatus::Pending,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            reserved_at: None,
            xrpl_confirmed_at: None,
            completed_at: None,
            cancelled_at: None,
            expires_at: new.expires_at,
        };

        let mut state = self.state.lock().await;
        if state.bridges.contains_key(&new.id) {
            return Err(SettlementError::Storage(format!("bridge {} already exists", new.id)));
        }
        state.bridges.insert(bridge.id, bridge.clone());
        Ok(bridge)
    }

    async fn get_bridge(&self, id: Uuid) -> Result<Option<Bridge>> {
        Ok(self.state.lock().await.bridges.get(&id).cloned())
    }

    async fn update_bridge_if(
        &self,
        id: Uuid,
        expected: &[BridgeStatus],
        patch: &BridgePatch,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if let Some(hash) = &patch.xrpl_tx_hash {
            let taken = state
                .bridges
                .values()
                .any(|b| b.id != id && b.xrpl_tx_hash.as_deref() == Some(hash.as_str()));
            if taken {
                return Err(SettlementError::Storage(format!(
                    "ledger transaction {} already settles another bridge",
                    hash
                )));
            }
        }
        match state.bridges.get_mut(&id) {
            Some(bridge) if bridge_matches(bridge, expected, patch) => {
                apply_bridge_patch(bridge, patch, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_bridge(
        &self,
        id: Uuid,
        expected: &[BridgeStatus],
        patch: &BridgePatch,
        credit: &PositionCredit,
    ) -> Result<Option<Position>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        match state.bridges.get(&id) {
            Some(bridge) if bridge_matches(bridge, expected, patch) => {}
            _ => return Ok(None),
        }

        let existing = match credit.position_id {
            Some(position_id) => {
                let position = state.positions.get(&position_id).filter(|p| {
                    p.wallet_address == credit.wallet_address && p.vault_id == credit.vault_id
                });
                match position {
                    Some(p) => Some(p.id),
                    None => {
                        return Err(SettlementError::validation(format!(
                            "position {} does not belong to {} in vault {}",
                            position_id, credit.wallet_address, credit.vault_id
                        )))
                    }
                }
            }
            None => state
                .positions
                .values()
                .find(|p| p.wallet_address == credit.wallet_address && p.vault_id == credit.vault_id)
                .map(|p| p.id),
        };

        let position = match existing {
            Some(position_id) => {
                let position = state
                    .positions
                    .get_mut(&position_id)
                    .ok_or_else(|| SettlementError::not_found("position", position_id))?;
                position.shares = position.shares.saturating_add(credit.shares);
                position.updated_at = now;
                position.clone()
            }
            None => {
                let position = Position {
                    id: Uuid::new_v4(),
                    wallet_address: credit.wallet_address.clone(),
                    vault_id: credit.vault_id.clone(),
                    shares: credit.shares,
                    created_at: now,
                    updated_at: now,
                };
                state.positions.insert(position.id, position.clone());
                position
            }
        };

        if let Some(bridge) = state.bridges.get_mut(&id) {
            apply_bridge_patch(bridge, patch, now);
            bridge.position_id = Some(position.id);
        }
        Ok(Some(position))
    }

    async fn list_bridges(
        &self,
        statuses: &[BridgeStatus],
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Bridge>> {
        let state = self.state.lock().await;
        let items = state
            .bridges
            .values()
            .filter(|b| statuses.contains(&b.status))
            .filter(|b| updated_before.map_or(true, |cutoff| b.updated_at < cutoff))
            .cloned()
            .collect();
        Ok(sorted_by_update(items, |b: &Bridge| b.updated_at, limit))
    }

    async fn list_expired_bridges(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Bridge>> {
        let state = self.state.lock().await;
        let items = state
            .bridges
            .values()
            .filter(|b| b.is_expired_at(now))
            .cloned()
            .collect();
        Ok(sorted_by_update(items, |b: &Bridge| b.expires_at, limit))
    }

    async fn insert_redemption(&self, new: &NewRedemption) -> Result<Redemption> {
        let mut state = self.state.lock().await;

        let position = state
            .positions
            .get(&new.position_id)
            .cloned()
            .ok_or_else(|| SettlementError::not_found("position", new.position_id))?;
        if position.wallet_address != new.wallet_address {
            return Err(SettlementError::validation(
                "position does not belong to this wallet",
            ));
        }
        let available = position
            .shares
            .saturating_sub(state.reserved_shares(position.id));
        if available < new.shares {
            return Err(SettlementError::validation(format!(
                "insufficient shares: requested {}, available {}",
                new.shares, available
            )));
        }

        let now = Utc::now();
        let redemption = Redemption {
            id: new.id,
            position_id: new.position_id,
            wallet_address: new.wallet_address.clone(),
            vault_id: position.vault_id.clone(),
            shares: new.shares,
            fxrp_received_drops: None,
            lots: None,
            xrp_sent_drops: None,
            vault_redeem_tx_hash: None,
            redemption_request_id: None,
            redemption_tx_hash: None,
            payment_reference: None,
            agent_vault_address: None,
            payment_deadline: None,
            xrpl_payout_tx_hash: None,
            attestation_round: None,
            attestation_request: None,
            proof: None,
            confirm_tx_hash: None,
            status: RedemptionStatus::Pending,
            user_status: UserStatus::Processing,
            backend_status: None,
            last_error: None,
            backend_error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            shares_redeemed_at: None,
            redemption_requested_at: None,
            xrpl_payout_at: None,
            completed_at: None,
            failed_at: None,
        };
        state.redemptions.insert(redemption.id, redemption.clone());
        Ok(redemption)
    }

    async fn get_redemption(&self, id: Uuid) -> Result<Option<Redemption>> {
        Ok(self.state.lock().await.redemptions.get(&id).cloned())
    }

    async fn update_redemption_if(
        &self,
        id: Uuid,
        expected: &[RedemptionStatus],
        patch: &RedemptionPatch,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.redemptions.get_mut(&id) {
            Some(redemption) if redemption_matches(redemption, expected, patch) => {
                apply_redemption_patch(redemption, patch, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_shares_redeemed(
        &self,
        id: Uuid,
        patch: &RedemptionPatch,
        position_id: Uuid,
        shares: u128,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;

        match state.redemptions.get(&id) {
            Some(r) if redemption_matches(r, &[RedemptionStatus::RedeemingShares], patch) => {}
            _ => return Ok(false),
        }
        let now = Utc::now();
        match state.positions.get_mut(&position_id) {
            Some(position) if position.shares >= shares => {
                position.shares -= shares;
                position.updated_at = now;
            }
            _ => {
                return Err(SettlementError::Storage(format!(
                    "position {} cannot cover {} shares",
                    position_id, shares
                )))
            }
        }
        if let Some(redemption) = state.redemptions.get_mut(&id) {
            apply_redemption_patch(redemption, patch, now);
        }
        Ok(true)
    }

    async fn list_redemptions(
        &self,
        statuses: &[RedemptionStatus],
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Redemption>> {
        let state = self.state.lock().await;
        let items = state
            .redemptions
            .values()
            .filter(|r| statuses.contains(&r.status))
            .filter(|r| updated_before.map_or(true, |cutoff| r.updated_at < cutoff))
            .cloned()
            .collect();
        Ok(sorted_by_update(items, |r: &Redemption| r.updated_at, limit))
    }

    async fn list_redemptions_needing_attention(&self, limit: i64) -> Result<Vec<Redemption>> {
        let state = self.state.lock().await;
        let items = state
            .redemptions
            .values()
            .filter(|r| r.backend_status.map_or(false, |s| s.needs_attention()))
            .cloned()
            .collect();
        Ok(sorted_by_update(items, |r: &Redemption| r.updated_at, limit))
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>> {
        Ok(self.state.lock().await.positions.get(&id).cloned())
    }

    async fn find_position(
        &self,
        wallet_address: &str,
        vault_id: &str,
    ) -> Result<Option<Position>> {
        let state = self.state.lock().await;
        Ok(state
            .positions
            .values()
            .find(|p| p.wallet_address == wallet_address && p.vault_id == vault_id)
            .cloned())
    }

    async fn reserved_shares(&self, position_id: Uuid) -> Result<u128> {
        Ok(self.state.lock().await.reserved_shares(position_id))
    }

    async fn insert_activity(&self, activity: &NewActivity) -> Result<()> {
        let mut state = self.state.lock().await;
        let duplicate = state
            .activities
            .iter()
            .any(|a| a.kind == activity.kind && a.reference_id == activity.reference_id);
        if duplicate {
            return Ok(());
        }
        let id = state.activities.len() as i64 + 1;
        state.activities.push(Activity {
            id,
            wallet_address: activity.wallet_address.clone(),
            vault_id: activity.vault_id.clone(),
            kind: activity.kind,
            amount_drops: activity.amount_drops,
            shares: activity.shares,
            reference_id: activity.reference_id,
            tx_hash: activity.tx_hash.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_activities(&self, wallet_address: &str, limit: i64) -> Result<Vec<Activity>> {
        let state = self.state.lock().await;
        Ok(state
            .activities
            .iter()
            .rev()
            .filter(|a| a.wallet_address == wallet_address)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn consume_cancel_nonce(
        &self,
        bridge_id: Uuid,
        message: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = (bridge_id, message.to_string());
        if state.nonces.contains_key(&key) {
            return Ok(false);
        }
        state.nonces.insert(key, expires_at);
        Ok(true)
    }

    async fn purge_cancel_nonces(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.nonces.len();
        state.nonces.retain(|_, expires_at| *expires_at >= now);
        Ok((before - state.nonces.len()) as u64)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let state = self.state.lock().await;
        let mut stats = StoreStats::default();
        for bridge in state.bridges.values() {
            if bridge.status == BridgeStatus::Completed {
                stats.completed_bridges += 1;
            } else if !bridge.status.is_terminal() {
                stats.active_bridges += 1;
            }
        }
        for redemption in state.redemptions.values() {
            if redemption.status == RedemptionStatus::Completed {
                stats.completed_redemptions += 1;
            } else if !redemption.status.is_terminal() {
                stats.active_redemptions += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SettlementKind;
    use chrono::Duration;

    const WALLET: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";

    fn new_bridge() -> NewBridge {
        NewBridge {
            id: Uuid::new_v4(),
            wallet_address: WALLET.to_string(),
            vault_id: "fxrp-yield".to_string(),
            position_id: None,
            settlement: SettlementKind::AttestedMint,
            requested_drops: 12_300_000,
            rounded_drops: 10_000_000,
            lots: 1,
            expected_fxrp_drops: 10_000_000,
            expires_at: Utc::now() + Duration::minutes(30),
        }
    }

    fn route() -> ReservedRoute {
        ReservedRoute {
            request_id: "1".into(),
            agent_vault_address: "0x00000000000000000000000000000000000000aa".into(),
            agent_underlying_address: "rrrrrrrrrrrrrrrrrrrrrhoLvTp".into(),
            payment_reference: Some("0x4642505266410001".into()),
            reserved_base_drops: 10_000_000,
            reserved_fee_drops: 25_000,
            fee_bps: 25,
        }
    }

    #[tokio::test]
    async fn test_conditional_update_is_a_claim() {
        let store = MemoryStore::new();
        let bridge = store.insert_bridge(&new_bridge()).await.unwrap();
        let claim = BridgePatch::status(BridgeStatus::ReservingCollateral);

        assert!(store
            .update_bridge_if(bridge.id, &[BridgeStatus::Pending], &claim)
            .await
            .unwrap());
        assert!(!store
            .update_bridge_if(bridge.id, &[BridgeStatus::Pending], &claim)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_route_is_written_once() {
        let store = MemoryStore::new();
        let bridge = store.insert_bridge(&new_bridge()).await.unwrap();
        let patch = BridgePatch {
            route: Some(route()),
            ..Default::default()
        };
        assert!(store
            .update_bridge_if(bridge.id, &[BridgeStatus::Pending], &patch)
            .await
            .unwrap());

        let mut other = route();
        other.agent_vault_address = "0x00000000000000000000000000000000000000bb".into();
        let patch = BridgePatch {
            route: Some(other),
            ..Default::default()
        };
        assert!(!store
            .update_bridge_if(bridge.id, &[BridgeStatus::Pending], &patch)
            .await
            .unwrap());
        let stored = store.get_bridge(bridge.id).await.unwrap().unwrap();
        assert_eq!(
            stored.agent_vault_address.as_deref(),
            Some("0x00000000000000000000000000000000000000aa")
        );
    }

    #[tokio::test]
    async fn test_phase_timestamps_are_set_once() {
        let store = MemoryStore::new();
        let bridge = store.insert_bridge(&new_bridge()).await.unwrap();
        let first = Utc::now() - Duration::minutes(5);
        let patch = BridgePatch {
            reserved_at: Some(first),
            ..Default::default()
        };
        store
            .update_bridge_if(bridge.id, &[BridgeStatus::Pending], &patch)
            .await
            .unwrap();
        let patch = BridgePatch {
            reserved_at: Some(Utc::now()),
            ..Default::default()
        };
        store
            .update_bridge_if(bridge.id, &[BridgeStatus::Pending], &patch)
            .await
            .unwrap();
        let stored = store.get_bridge(bridge.id).await.unwrap().unwrap();
        assert_eq!(stored.reserved_at, Some(first));
    }

    #[tokio::test]
    async fn test_ledger_hash_settles_one_bridge() {
        let store = MemoryStore::new();
        let a = store.insert_bridge(&new_bridge()).await.unwrap();
        let b = store.insert_bridge(&new_bridge()).await.unwrap();
        let patch = BridgePatch {
            xrpl_tx_hash: Some("A".repeat(64)),
            ..Default::default()
        };
        assert!(store
            .update_bridge_if(a.id, &[BridgeStatus::Pending], &patch)
            .await
            .unwrap());
        assert!(store
            .update_bridge_if(b.id, &[BridgeStatus::Pending], &patch)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_redemption_respects_reserved_shares() {
        let store = MemoryStore::new();
        let position = store.seed_position(WALLET, "fxrp-yield", 100).await;

        let first = NewRedemption {
            id: Uuid::new_v4(),
            position_id: position.id,
            wallet_address: WALLET.to_string(),
            vault_id: "fxrp-yield".to_string(),
            shares: 60,
        };
        store.insert_redemption(&first).await.unwrap();
        assert_eq!(store.reserved_shares(position.id).await.unwrap(), 60);

        let second = NewRedemption {
            id: Uuid::new_v4(),
            shares: 50,
            ..first.clone()
        };
        let err = store.insert_redemption(&second).await.unwrap_err();
        assert!(err.to_string().contains("insufficient shares"));
    }

    #[tokio::test]
    async fn test_redemption_rejects_foreign_position() {
        let store = MemoryStore::new();
        let position = store.seed_position(WALLET, "fxrp-yield", 100).await;
        let err = store
            .insert_redemption(&NewRedemption {
                id: Uuid::new_v4(),
                position_id: position.id,
                wallet_address: "rrrrrrrrrrrrrrrrrrrrrhoLvTp".to_string(),
                vault_id: "fxrp-yield".to_string(),
                shares: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
    }

    #[tokio::test]
    async fn test_complete_bridge_credits_position() {
        let store = MemoryStore::new();
        let bridge = store.insert_bridge(&new_bridge()).await.unwrap();
        let credit = PositionCredit {
            position_id: None,
            wallet_address: WALLET.to_string(),
            vault_id: "fxrp-yield".to_string(),
            shares: 500,
        };
        let patch = BridgePatch::status(BridgeStatus::Completed);
        let position = store
            .complete_bridge(bridge.id, &[BridgeStatus::Pending], &patch, &credit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.shares, 500);

        let again = store
            .complete_bridge(bridge.id, &[BridgeStatus::Pending], &patch, &credit)
            .await
            .unwrap();
        assert!(again.is_none());
        let stored = store.get_position(position.id).await.unwrap().unwrap();
        assert_eq!(stored.shares, 500);
    }

    #[tokio::test]
    async fn test_cancel_nonce_is_single_use_until_purged() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let expires = Utc::now() + Duration::minutes(5);
        assert!(store.consume_cancel_nonce(id, "cancel:x:1", expires).await.unwrap());
        assert!(!store.consume_cancel_nonce(id, "cancel:x:1", expires).await.unwrap());
        assert!(store.consume_cancel_nonce(id, "cancel:x:2", expires).await.unwrap());

        let purged = store
            .purge_cancel_nonces(Utc::now() + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(purged, 2);
    }
}
