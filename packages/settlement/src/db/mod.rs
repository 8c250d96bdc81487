//! Persistence for bridges, redemptions, positions and cancellation nonces.
//!
//! The persisted record is the only shared mutable state. Every status
//! transition goes through `update_*_if`, a conditional update whose
//! affected-row count tells the caller whether it won the claim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result as EyreResult, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{BridgeStatus, RedemptionStatus};

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PgStore;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> EyreResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> EyreResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap round trip used by the readiness probe
    async fn ping(&self) -> Result<()>;

    // ============ Bridges ============

    async fn insert_bridge(&self, new: &NewBridge) -> Result<Bridge>;

    async fn get_bridge(&self, id: Uuid) -> Result<Option<Bridge>>;

    /// Apply `patch` only if the bridge's status is one of `expected`.
    /// Returns whether the row was updated.
    async fn update_bridge_if(
        &self,
        id: Uuid,
        expected: &[BridgeStatus],
        patch: &BridgePatch,
    ) -> Result<bool>;

    /// Conditional update plus position credit in one transaction.
    /// Returns the credited position, or `None` if the claim was lost.
    async fn complete_bridge(
        &self,
        id: Uuid,
        expected: &[BridgeStatus],
        patch: &BridgePatch,
        credit: &PositionCredit,
    ) -> Result<Option<Position>>;

    /// Bridges in `statuses`, oldest update first, optionally only those
    /// not touched since `updated_before`.
    async fn list_bridges(
        &self,
        statuses: &[BridgeStatus],
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Bridge>>;

    /// Expirable bridges whose `expires_at` is before `now`.
    async fn list_expired_bridges(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Bridge>>;

    // ============ Redemptions ============

    /// Insert a redemption after checking, under a row lock, that the
    /// position belongs to the wallet and has enough unreserved shares.
    async fn insert_redemption(&self, new: &NewRedemption) -> Result<Redemption>;

    async fn get_redemption(&self, id: Uuid) -> Result<Option<Redemption>>;

    async fn update_redemption_if(
        &self,
        id: Uuid,
        expected: &[RedemptionStatus],
        patch: &RedemptionPatch,
    ) -> Result<bool>;

    /// `redeeming_shares → redeemed_fxrp` together with the position debit.
    async fn record_shares_redeemed(
        &self,
        id: Uuid,
        patch: &RedemptionPatch,
        position_id: Uuid,
        shares: u128,
    ) -> Result<bool>;

    async fn list_redemptions(
        &self,
        statuses: &[RedemptionStatus],
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Redemption>>;

    /// Redemptions whose backend status is failed or payment_overdue.
    async fn list_redemptions_needing_attention(&self, limit: i64) -> Result<Vec<Redemption>>;

    // ============ Positions ============

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>>;

    async fn find_position(&self, wallet_address: &str, vault_id: &str)
        -> Result<Option<Position>>;

    /// Shares held by redemptions that have not yet burned them.
    async fn reserved_shares(&self, position_id: Uuid) -> Result<u128>;

    async fn insert_activity(&self, activity: &NewActivity) -> Result<()>;

    async fn list_activities(&self, wallet_address: &str, limit: i64) -> Result<Vec<Activity>>;

    // ============ Cancellation nonces ============

    /// Record `(bridge_id, message)` as used. Returns false if it was
    /// already consumed.
    async fn consume_cancel_nonce(
        &self,
        bridge_id: Uuid,
        message: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn purge_cancel_nonces(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn stats(&self) -> Result<StoreStats>;
}
