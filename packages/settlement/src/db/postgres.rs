//! PostgreSQL-backed store.
//!
//! Conditional updates are assembled with `QueryBuilder` so a patch only
//! touches the columns it carries. Amount columns are NUMERIC and cross the
//! wire as text (`$n::NUMERIC` on write, `col::TEXT` on read).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, QueryBuilder};
use tracing::{debug, error};
use uuid::Uuid;

use super::models::*;
use super::Store;
use crate::error::{Result, SettlementError};
use crate::types::{
    BackendStatus, BridgeStatus, RedemptionStatus, SettlementKind, UserStatus,
};

const BRIDGE_COLUMNS: &str = "id, request_id, wallet_address, vault_id, position_id, settlement, \
    requested_drops, rounded_drops, lots, expected_fxrp_drops, reserved_base_drops, \
    reserved_fee_drops, fee_bps, agent_vault_address, agent_underlying_address, \
    payment_reference, xrpl_tx_hash, mint_tx_hash, deposit_tx_hash, attestation_round, \
    attestation_request, proof, shares_minted::TEXT AS shares_minted, status, error, \
    retry_count, created_at, updated_at, reserved_at, xrpl_confirmed_at, completed_at, \
    cancelled_at, expires_at";

const REDEMPTION_COLUMNS: &str = "id, position_id, wallet_address, vault_id, \
    shares::TEXT AS shares, fxrp_received_drops, lots, xrp_sent_drops, vault_redeem_tx_hash, \
    redemption_request_id, redemption_tx_hash, payment_reference, agent_vault_address, \
    payment_deadline, xrpl_payout_tx_hash, attestation_round, attestation_request, proof, \
    confirm_tx_hash, status, user_status, backend_status, last_error, backend_error, \
    retry_count, created_at, updated_at, shares_redeemed_at, redemption_requested_at, \
    xrpl_payout_at, completed_at, failed_at";

const POSITION_COLUMNS: &str =
    "id, wallet_address, vault_id, shares::TEXT AS shares, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============ Row types ============

#[derive(FromRow)]
struct BridgeRow {
    id: Uuid,
    request_id: Option<String>,
    wallet_address: String,
    vault_id: String,
    position_id: Option<Uuid>,
    settlement: SettlementKind,
    requested_drops: i64,
    rounded_drops: i64,
    lots: i64,
    expected_fxrp_drops: i64,
    reserved_base_drops: Option<i64>,
    reserved_fee_drops: Option<i64>,
    fee_bps: Option<i32>,
    agent_vault_address: Option<String>,
    agent_underlying_address: Option<String>,
    payment_reference: Option<String>,
    xrpl_tx_hash: Option<String>,
    mint_tx_hash: Option<String>,
    deposit_tx_hash: Option<String>,
    attestation_round: Option<i64>,
    attestation_request: Option<String>,
    proof: Option<String>,
    shares_minted: Option<String>,
    status: BridgeStatus,
    error: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    reserved_at: Option<DateTime<Utc>>,
    xrpl_confirmed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<BridgeRow> for Bridge {
    type Error = SettlementError;

    fn try_from(row: BridgeRow) -> Result<Self> {
        Ok(Bridge {
            id: row.id,
            request_id: row.request_id,
            wallet_address: row.wallet_address,
            vault_id: row.vault_id,
            position_id: row.position_id,
            settlement: row.settlement,
            requested_drops: to_u64(row.requested_drops, "requested_drops")?,
            rounded_drops: to_u64(row.rounded_drops, "rounded_drops")?,
            lots: to_u64(row.lots, "lots")?,
            expected_fxrp_drops: to_u64(row.expected_fxrp_drops, "expected_fxrp_drops")?,
            reserved_base_drops: opt_u64(row.reserved_base_drops, "reserved_base_drops")?,
            reserved_fee_drops: opt_u64(row.reserved_fee_drops, "reserved_fee_drops")?,
            fee_bps: row.fee_bps.map(|v| v.max(0) as u32),
            agent_vault_address: row.agent_vault_address,
            agent_underlying_address: row.agent_underlying_address,
            payment_reference: row.payment_reference,
            xrpl_tx_hash: row.xrpl_tx_hash,
            mint_tx_hash: row.mint_tx_hash,
            deposit_tx_hash: row.deposit_tx_hash,
            attestation_round: opt_u64(row.attestation_round, "attestation_round")?,
            attestation_request: row.attestation_request,
            proof: row.proof,
            shares_minted: row.shares_minted.as_deref().map(parse_shares).transpose()?,
            status: row.status,
            error: row.error,
            retry_count: row.retry_count.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            reserved_at: row.reserved_at,
            xrpl_confirmed_at: row.xrpl_confirmed_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(FromRow)]
struct RedemptionRow {
    id: Uuid,
    position_id: Uuid,
    wallet_address: String,
    vault_id: String,
    shares: String,
    fxrp_received_drops: Option<i64>,
    lots: Option<i64>,
    xrp_sent_drops: Option<i64>,
    vault_redeem_tx_hash: Option<String>,
    redemption_request_id: Option<i64>,
    redemption_tx_hash: Option<String>,
    payment_reference: Option<String>,
    agent_vault_address: Option<String>,
    payment_deadline: Option<DateTime<Utc>>,
    xrpl_payout_tx_hash: Option<String>,
    attestation_round: Option<i64>,
    attestation_request: Option<String>,
    proof: Option<String>,
    confirm_tx_hash: Option<String>,
    status: RedemptionStatus,
    user_status: UserStatus,
    backend_status: Option<BackendStatus>,
    last_error: Option<String>,
    backend_error: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    shares_redeemed_at: Option<DateTime<Utc>>,
    redemption_requested_at: Option<DateTime<Utc>>,
    xrpl_payout_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl TryFrom<RedemptionRow> for Redemption {
    type Error = SettlementError;

    fn try_from(row: RedemptionRow) -> Result<Self> {
        Ok(Redemption {
            id: row.id,
            position_id: row.position_id,
            wallet_address: row.wallet_address,
            vault_id: row.vault_id,
            shares: parse_shares(&row.shares)?,
            fxrp_received_drops: opt_u64(row.fxrp_received_drops, "fxrp_received_drops")?,
            lots: opt_u64(row.lots, "lots")?,
            xrp_sent_drops: opt_u64(row.xrp_sent_drops, "xrp_sent_drops")?,
            vault_redeem_tx_hash: row.vault_redeem_tx_hash,
            redemption_request_id: opt_u64(row.redemption_request_id, "redemption_request_id")?,
            redemption_tx_hash: row.redemption_tx_hash,
            payment_reference: row.payment_reference,
            agent_vault_address: row.agent_vault_address,
            payment_deadline: row.payment_deadline,
            xrpl_payout_tx_hash: row.xrpl_payout_tx_hash,
            attestation_round: opt_u64(row.attestation_round, "attestation_round")?,
            attestation_request: row.attestation_request,
            proof: row.proof,
            confirm_tx_hash: row.confirm_tx_hash,
            status: row.status,
            user_status: row.user_status,
            backend_status: row.backend_status,
            last_error: row.last_error,
            backend_error: row.backend_error,
            retry_count: row.retry_count.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            shares_redeemed_at: row.shares_redeemed_at,
            redemption_requested_at: row.redemption_requested_at,
            xrpl_payout_at: row.xrpl_payout_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
        })
    }
}

#[derive(FromRow)]
struct PositionRow {
    id: Uuid,
    wallet_address: String,
    vault_id: String,
    shares: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PositionRow> for Position {
    type Error = SettlementError;

    fn try_from(row: PositionRow) -> Result<Self> {
        Ok(Position {
            id: row.id,
            wallet_address: row.wallet_address,
            vault_id: row.vault_id,
            shares: parse_shares(&row.shares)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ActivityRow {
    id: i64,
    wallet_address: String,
    vault_id: String,
    kind: String,
    amount_drops: i64,
    shares: String,
    reference_id: Uuid,
    tx_hash: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ActivityRow> for Activity {
    type Error = SettlementError;

    fn try_from(row: ActivityRow) -> Result<Self> {
        let kind = match row.kind.as_str() {
            "deposit" => ActivityKind::Deposit,
            "withdrawal" => ActivityKind::Withdrawal,
            other => {
                return Err(SettlementError::Storage(format!(
                    "unknown activity kind {}",
                    other
                )))
            }
        };
        Ok(Activity {
            id: row.id,
            wallet_address: row.wallet_address,
            vault_id: row.vault_id,
            kind,
            amount_drops: to_u64(row.amount_drops, "amount_drops")?,
            shares: parse_shares(&row.shares)?,
            reference_id: row.reference_id,
            tx_hash: row.tx_hash,
            created_at: row.created_at,
        })
    }
}

// ============ Conversions ============

fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| SettlementError::Storage(format!("negative {} in database", field)))
}

fn opt_u64(value: Option<i64>, field: &str) -> Result<Option<u64>> {
    value.map(|v| to_u64(v, field)).transpose()
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| SettlementError::validation(format!("{} out of range", field)))
}

fn parse_shares(raw: &str) -> Result<u128> {
    raw.parse::<u128>()
        .map_err(|_| SettlementError::Storage(format!("invalid share amount {}", raw)))
}

fn status_list<'a, S: ToString + 'a>(statuses: impl IntoIterator<Item = &'a S>) -> Vec<String> {
    statuses.into_iter().map(|s| s.to_string()).collect()
}

// ============ Update builders ============

fn push_set_once<'a, T>(qb: &mut QueryBuilder<'a, Postgres>, column: &str, value: T)
where
    T: 'a + sqlx::Encode<'a, Postgres> + sqlx::Type<Postgres> + Send,
{
    qb.push(format!(", {col} = COALESCE({col}, ", col = column))
        .push_bind(value)
        .push(")");
}

fn push_set<'a, T>(qb: &mut QueryBuilder<'a, Postgres>, column: &str, value: T)
where
    T: 'a + sqlx::Encode<'a, Postgres> + sqlx::Type<Postgres> + Send,
{
    qb.push(format!(", {} = ", column)).push_bind(value);
}

fn bridge_update(
    id: Uuid,
    expected: &[BridgeStatus],
    patch: &BridgePatch,
) -> Result<QueryBuilder<'static, Postgres>> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE bridges SET updated_at = NOW()");

    if let Some(status) = patch.status {
        push_set(&mut qb, "status", status.as_str());
    }
    if let Some(error) = &patch.error {
        push_set(&mut qb, "error", error.clone());
    } else if patch.clear_error {
        qb.push(", error = NULL");
    }
    if patch.bump_retry {
        qb.push(", retry_count = retry_count + 1");
    }
    if let Some(route) = &patch.route {
        push_set(&mut qb, "request_id", route.request_id.clone());
        push_set(&mut qb, "agent_vault_address", route.agent_vault_address.clone());
        push_set(
            &mut qb,
            "agent_underlying_address",
            route.agent_underlying_address.clone(),
        );
        push_set(&mut qb, "payment_reference", route.payment_reference.clone());
        push_set(
            &mut qb,
            "reserved_base_drops",
            to_i64(route.reserved_base_drops, "reserved_base_drops")?,
        );
        push_set(
            &mut qb,
            "reserved_fee_drops",
            to_i64(route.reserved_fee_drops, "reserved_fee_drops")?,
        );
        push_set(&mut qb, "fee_bps", route.fee_bps as i32);
    }
    if let Some(hash) = &patch.xrpl_tx_hash {
        push_set_once(&mut qb, "xrpl_tx_hash", hash.clone());
    }
    if let Some(hash) = &patch.mint_tx_hash {
        push_set_once(&mut qb, "mint_tx_hash", hash.clone());
    }
    if let Some(hash) = &patch.deposit_tx_hash {
        push_set_once(&mut qb, "deposit_tx_hash", hash.clone());
    }
    if patch.discard_proof {
        qb.push(", attestation_round = NULL, attestation_request = NULL, proof = NULL");
    } else if let Some(round) = patch.attestation_round {
        push_set(&mut qb, "attestation_round", to_i64(round, "attestation_round")?);
    }
    if !patch.discard_proof {
        if let Some(request) = &patch.attestation_request {
            push_set(&mut qb, "attestation_request", request.clone());
        }
        if let Some(proof) = &patch.proof {
            push_set_once(&mut qb, "proof", proof.clone());
        }
    }
    if let Some(shares) = patch.shares_minted {
        qb.push(", shares_minted = ")
            .push_bind(shares.to_string())
            .push("::NUMERIC");
    }
    if let Some(position_id) = patch.position_id {
        push_set_once(&mut qb, "position_id", position_id);
    }
    if let Some(ts) = patch.reserved_at {
        push_set_once(&mut qb, "reserved_at", ts);
    }
    if let Some(ts) = patch.xrpl_confirmed_at {
        push_set_once(&mut qb, "xrpl_confirmed_at", ts);
    }
    if let Some(ts) = patch.completed_at {
        push_set_once(&mut qb, "completed_at", ts);
    }
    if let Some(ts) = patch.cancelled_at {
        push_set_once(&mut qb, "cancelled_at", ts);
    }

    qb.push(" WHERE id = ").push_bind(id);
    qb.push(" AND status = ANY(")
        .push_bind(status_list(expected))
        .push(")");
    if patch.route.is_some() {
        qb.push(" AND agent_vault_address IS NULL");
    }

    Ok(qb)
}

fn redemption_update(
    id: Uuid,
    expected: &[RedemptionStatus],
    patch: &RedemptionPatch,
) -> Result<QueryBuilder<'static, Postgres>> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE redemptions SET updated_at = NOW()");

    if let Some(status) = patch.status {
        push_set(&mut qb, "status", status.as_str());
    }
    if let Some(user_status) = patch.user_status {
        push_set(&mut qb, "user_status", user_status.as_str());
    }
    if let Some(backend_status) = patch.backend_status {
        push_set(&mut qb, "backend_status", backend_status.as_str());
    }
    if patch.clear_errors {
        qb.push(", last_error = NULL, backend_error = NULL");
    }
    if let Some(error) = &patch.last_error {
        push_set(&mut qb, "last_error", error.clone());
    }
    if let Some(error) = &patch.backend_error {
        push_set(&mut qb, "backend_error", error.clone());
    }
    if patch.bump_retry {
        qb.push(", retry_count = retry_count + 1");
    }
    if let Some(drops) = patch.fxrp_received_drops {
        push_set(&mut qb, "fxrp_received_drops", to_i64(drops, "fxrp_received_drops")?);
    }
    if let Some(hash) = &patch.vault_redeem_tx_hash {
        push_set_once(&mut qb, "vault_redeem_tx_hash", hash.clone());
    }
    if let Some(ticket) = &patch.ticket {
        push_set(
            &mut qb,
            "redemption_request_id",
            to_i64(ticket.request_id, "redemption_request_id")?,
        );
        push_set(&mut qb, "redemption_tx_hash", ticket.tx_hash.clone());
        push_set(&mut qb, "lots", to_i64(ticket.lots, "lots")?);
        push_set(
            &mut qb,
            "xrp_sent_drops",
            to_i64(ticket.xrp_expected_drops, "xrp_sent_drops")?,
        );
        push_set(&mut qb, "payment_reference", ticket.payment_reference.clone());
        push_set(
            &mut qb,
            "agent_vault_address",
            ticket.agent_vault_address.clone(),
        );
        push_set(&mut qb, "payment_deadline", ticket.payment_deadline);
    }
    if let Some(hash) = &patch.xrpl_payout_tx_hash {
        push_set(&mut qb, "xrpl_payout_tx_hash", hash.clone());
    }
    if let Some(drops) = patch.xrp_sent_drops {
        push_set(&mut qb, "xrp_sent_drops", to_i64(drops, "xrp_sent_drops")?);
    }
    if patch.discard_proof {
        qb.push(", attestation_round = NULL, attestation_request = NULL, proof = NULL");
    } else if let Some(round) = patch.attestation_round {
        push_set(&mut qb, "attestation_round", to_i64(round, "attestation_round")?);
    }
    if !patch.discard_proof {
        if let Some(request) = &patch.attestation_request {
            push_set(&mut qb, "attestation_request", request.clone());
        }
        if let Some(proof) = &patch.proof {
            push_set_once(&mut qb, "proof", proof.clone());
        }
    }
    if let Some(hash) = &patch.confirm_tx_hash {
        push_set_once(&mut qb, "confirm_tx_hash", hash.clone());
    }
    if let Some(ts) = patch.shares_redeemed_at {
        push_set_once(&mut qb, "shares_redeemed_at", ts);
    }
    if let Some(ts) = patch.redemption_requested_at {
        push_set_once(&mut qb, "redemption_requested_at", ts);
    }
    if let Some(ts) = patch.xrpl_payout_at {
        push_set_once(&mut qb, "xrpl_payout_at", ts);
    }
    if let Some(ts) = patch.completed_at {
        push_set_once(&mut qb, "completed_at", ts);
    }
    if let Some(ts) = patch.failed_at {
        push_set_once(&mut qb, "failed_at", ts);
    }

    qb.push(" WHERE id = ").push_bind(id);
    qb.push(" AND status = ANY(")
        .push_bind(status_list(expected))
        .push(")");
    if patch.ticket.is_some() {
        qb.push(" AND redemption_request_id IS NULL");
    }

    Ok(qb)
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_bridge(&self, new: &NewBridge) -> Result<Bridge> {
        let sql = format!(
            r#"
            INSERT INTO bridges (id, wallet_address, vault_id, position_id, settlement,
                requested_drops, rounded_drops, lots, expected_fxrp_drops, status, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10)
            RETURNING {}
            "#,
            BRIDGE_COLUMNS
        );
        let row = sqlx::query_as::<_, BridgeRow>(&sql)
            .bind(new.id)
            .bind(&new.wallet_address)
            .bind(&new.vault_id)
            .bind(new.position_id)
            .bind(new.settlement.as_str())
            .bind(to_i64(new.requested_drops, "requested_drops")?)
            .bind(to_i64(new.rounded_drops, "rounded_drops")?)
            .bind(to_i64(new.lots, "lots")?)
            .bind(to_i64(new.expected_fxrp_drops, "expected_fxrp_drops")?)
            .bind(new.expires_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!(bridge_id = %new.id, "SQL error inserting bridge: {:?}", e);
                e
            })?;
        row.try_into()
    }

    async fn get_bridge(&self, id: Uuid) -> Result<Option<Bridge>> {
        let sql = format!("SELECT {} FROM bridges WHERE id = $1", BRIDGE_COLUMNS);
        sqlx::query_as::<_, BridgeRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Bridge::try_from)
            .transpose()
    }

    async fn update_bridge_if(
        &self,
        id: Uuid,
        expected: &[BridgeStatus],
        patch: &BridgePatch,
    ) -> Result<bool> {
        let mut qb = bridge_update(id, expected, patch)?;
        let result = qb.build().execute(&self.pool).await?;
        debug!(
            bridge_id = %id,
            rows = result.rows_affected(),
            "Conditional bridge update"
        );
        Ok(result.rows_affected() == 1)
    }

    async fn complete_bridge(
        &self,
        id: Uuid,
        expected: &[BridgeStatus],
        patch: &BridgePatch,
        credit: &PositionCredit,
    ) -> Result<Option<Position>> {
        let mut tx = self.pool.begin().await?;

        let mut qb = bridge_update(id, expected, patch)?;
        let result = qb.build().execute(&mut *tx).await?;
        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }

        let shares = credit.shares.to_string();
        let row = match credit.position_id {
            Some(position_id) => {
                let sql = format!(
                    "UPDATE positions SET shares = shares + $2::NUMERIC, updated_at = NOW() \
                     WHERE id = $1 AND wallet_address = $3 AND vault_id = $4 RETURNING {}",
                    POSITION_COLUMNS
                );
                sqlx::query_as::<_, PositionRow>(&sql)
                    .bind(position_id)
                    .bind(&shares)
                    .bind(&credit.wallet_address)
                    .bind(&credit.vault_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => {
                let sql = format!(
                    "INSERT INTO positions (id, wallet_address, vault_id, shares) \
                     VALUES ($1, $2, $3, $4::NUMERIC) \
                     ON CONFLICT (wallet_address, vault_id) \
                     DO UPDATE SET shares = positions.shares + EXCLUDED.shares, updated_at = NOW() \
                     RETURNING {}",
                    POSITION_COLUMNS
                );
                sqlx::query_as::<_, PositionRow>(&sql)
                    .bind(Uuid::new_v4())
                    .bind(&credit.wallet_address)
                    .bind(&credit.vault_id)
                    .bind(&shares)
                    .fetch_optional(&mut *tx)
                    .await?
            }
        };

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(SettlementError::validation(format!(
                "position {:?} does not belong to {} in vault {}",
                credit.position_id, credit.wallet_address, credit.vault_id
            )));
        };
        let position = Position::try_from(row)?;

        sqlx::query("UPDATE bridges SET position_id = $2 WHERE id = $1")
            .bind(id)
            .bind(position.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(position))
    }

    async fn list_bridges(
        &self,
        statuses: &[BridgeStatus],
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Bridge>> {
        let sql = format!(
            "SELECT {} FROM bridges WHERE status = ANY($1) \
             AND ($2::TIMESTAMPTZ IS NULL OR updated_at < $2) \
             ORDER BY updated_at ASC LIMIT $3",
            BRIDGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, BridgeRow>(&sql)
            .bind(status_list(statuses))
            .bind(updated_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Bridge::try_from).collect()
    }

    async fn list_expired_bridges(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Bridge>> {
        let sql = format!(
            "SELECT {} FROM bridges WHERE status = ANY($1) AND expires_at < $2 \
             ORDER BY expires_at ASC LIMIT $3",
            BRIDGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, BridgeRow>(&sql)
            .bind(status_list(&BridgeStatus::EXPIRABLE))
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Bridge::try_from).collect()
    }

    async fn insert_redemption(&self, new: &NewRedemption) -> Result<Redemption> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM positions WHERE id = $1 FOR UPDATE",
            POSITION_COLUMNS
        );
        let position: Position = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(new.position_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| SettlementError::not_found("position", new.position_id))?
            .try_into()?;

        if position.wallet_address != new.wallet_address {
            return Err(SettlementError::validation(
                "position does not belong to this wallet",
            ));
        }

        let reserved: Option<String> = sqlx::query_scalar(
            "SELECT SUM(shares)::TEXT FROM redemptions WHERE position_id = $1 AND status = ANY($2)",
        )
        .bind(new.position_id)
        .bind(status_list(&RedemptionStatus::RESERVING_SHARES))
        .fetch_one(&mut *tx)
        .await?;
        let reserved = reserved.as_deref().map(parse_shares).transpose()?.unwrap_or(0);

        let available = position.shares.saturating_sub(reserved);
        if available < new.shares {
            return Err(SettlementError::validation(format!(
                "insufficient shares: requested {}, available {}",
                new.shares, available
            )));
        }

        let sql = format!(
            "INSERT INTO redemptions (id, position_id, wallet_address, vault_id, shares, \
             status, user_status) VALUES ($1, $2, $3, $4, $5::NUMERIC, 'pending', 'processing') \
             RETURNING {}",
            REDEMPTION_COLUMNS
        );
        let row = sqlx::query_as::<_, RedemptionRow>(&sql)
            .bind(new.id)
            .bind(new.position_id)
            .bind(&new.wallet_address)
            .bind(&position.vault_id)
            .bind(new.shares.to_string())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn get_redemption(&self, id: Uuid) -> Result<Option<Redemption>> {
        let sql = format!("SELECT {} FROM redemptions WHERE id = $1", REDEMPTION_COLUMNS);
        sqlx::query_as::<_, RedemptionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Redemption::try_from)
            .transpose()
    }

    async fn update_redemption_if(
        &self,
        id: Uuid,
        expected: &[RedemptionStatus],
        patch: &RedemptionPatch,
    ) -> Result<bool> {
        let mut qb = redemption_update(id, expected, patch)?;
        let result = qb.build().execute(&self.pool).await?;
        debug!(
            redemption_id = %id,
            rows = result.rows_affected(),
            "Conditional redemption update"
        );
        Ok(result.rows_affected() == 1)
    }

    async fn record_shares_redeemed(
        &self,
        id: Uuid,
        patch: &RedemptionPatch,
        position_id: Uuid,
        shares: u128,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let mut qb = redemption_update(id, &[RedemptionStatus::RedeemingShares], patch)?;
        let result = qb.build().execute(&mut *tx).await?;
        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        let debited = sqlx::query(
            "UPDATE positions SET shares = shares - $2::NUMERIC, updated_at = NOW() \
             WHERE id = $1 AND shares >= $2::NUMERIC",
        )
        .bind(position_id)
        .bind(shares.to_string())
        .execute(&mut *tx)
        .await?;
        if debited.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(SettlementError::Storage(format!(
                "position {} cannot cover {} shares",
                position_id, shares
            )));
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_redemptions(
        &self,
        statuses: &[RedemptionStatus],
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Redemption>> {
        let sql = format!(
            "SELECT {} FROM redemptions WHERE status = ANY($1) \
             AND ($2::TIMESTAMPTZ IS NULL OR updated_at < $2) \
             ORDER BY updated_at ASC LIMIT $3",
            REDEMPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, RedemptionRow>(&sql)
            .bind(status_list(statuses))
            .bind(updated_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Redemption::try_from).collect()
    }

    async fn list_redemptions_needing_attention(&self, limit: i64) -> Result<Vec<Redemption>> {
        let sql = format!(
            "SELECT {} FROM redemptions WHERE backend_status = ANY($1) \
             ORDER BY updated_at ASC LIMIT $2",
            REDEMPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, RedemptionRow>(&sql)
            .bind(status_list(&[
                BackendStatus::Failed,
                BackendStatus::PaymentOverdue,
            ]))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Redemption::try_from).collect()
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>> {
        let sql = format!("SELECT {} FROM positions WHERE id = $1", POSITION_COLUMNS);
        sqlx::query_as::<_, PositionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Position::try_from)
            .transpose()
    }

    async fn find_position(
        &self,
        wallet_address: &str,
        vault_id: &str,
    ) -> Result<Option<Position>> {
        let sql = format!(
            "SELECT {} FROM positions WHERE wallet_address = $1 AND vault_id = $2",
            POSITION_COLUMNS
        );
        sqlx::query_as::<_, PositionRow>(&sql)
            .bind(wallet_address)
            .bind(vault_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Position::try_from)
            .transpose()
    }

    async fn reserved_shares(&self, position_id: Uuid) -> Result<u128> {
        let reserved: Option<String> = sqlx::query_scalar(
            "SELECT SUM(shares)::TEXT FROM redemptions WHERE position_id = $1 AND status = ANY($2)",
        )
        .bind(position_id)
        .bind(status_list(&RedemptionStatus::RESERVING_SHARES))
        .fetch_one(&self.pool)
        .await?;
        Ok(reserved.as_deref().map(parse_shares).transpose()?.unwrap_or(0))
    }

    async fn insert_activity(&self, activity: &NewActivity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activities (wallet_address, vault_id, kind, amount_drops, shares,
                reference_id, tx_hash)
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7)
            ON CONFLICT (kind, reference_id) DO NOTHING
            "#,
        )
        .bind(&activity.wallet_address)
        .bind(&activity.vault_id)
        .bind(activity.kind.as_str())
        .bind(to_i64(activity.amount_drops, "amount_drops")?)
        .bind(activity.shares.to_string())
        .bind(activity.reference_id)
        .bind(&activity.tx_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_activities(&self, wallet_address: &str, limit: i64) -> Result<Vec<Activity>> {
        let rows = sqlx::query_as::<_, ActivityRow>(
            "SELECT id, wallet_address, vault_id, kind, amount_drops, shares::TEXT AS shares, \
             reference_id, tx_hash, created_at FROM activities WHERE wallet_address = $1 \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(wallet_address)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Activity::try_from).collect()
    }

    async fn consume_cancel_nonce(
        &self,
        bridge_id: Uuid,
        message: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO cancel_nonces (bridge_id, message, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (bridge_id, message) DO NOTHING",
        )
        .bind(bridge_id)
        .bind(message)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_cancel_nonces(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cancel_nonces WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let (active_bridges, completed_bridges): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*) FILTER (WHERE status = ANY($1)), \
             COUNT(*) FILTER (WHERE status = 'completed') FROM bridges",
        )
        .bind(status_list(&BridgeStatus::NON_TERMINAL))
        .fetch_one(&self.pool)
        .await?;
        let (active_redemptions, completed_redemptions): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*) FILTER (WHERE status = ANY($1)), \
             COUNT(*) FILTER (WHERE status = 'completed') FROM redemptions",
        )
        .bind(status_list(&RedemptionStatus::NON_TERMINAL))
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            active_bridges: active_bridges.max(0) as u64,
            active_redemptions: active_redemptions.max(0) as u64,
            completed_bridges: completed_bridges.max(0) as u64,
            completed_redemptions: completed_redemptions.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_of(qb: &QueryBuilder<'_, Postgres>) -> String {
        qb.sql().to_string()
    }

    #[test]
    fn test_bridge_update_sets_timestamps_once() {
        let patch = BridgePatch {
            status: Some(BridgeStatus::XrplConfirmed),
            xrpl_tx_hash: Some("AB".repeat(32)),
            xrpl_confirmed_at: Some(Utc::now()),
            ..Default::default()
        };
        let qb = bridge_update(Uuid::new_v4(), &[BridgeStatus::AwaitingPayment], &patch).unwrap();
        let sql = sql_of(&qb);
        assert!(sql.contains("xrpl_confirmed_at = COALESCE(xrpl_confirmed_at, "));
        assert!(sql.contains("xrpl_tx_hash = COALESCE(xrpl_tx_hash, "));
        assert!(sql.contains("AND status = ANY("));
        assert!(!sql.contains("agent_vault_address IS NULL"));
    }

    #[test]
    fn test_route_only_written_while_null() {
        let patch = BridgePatch {
            status: Some(BridgeStatus::AwaitingPayment),
            route: Some(ReservedRoute {
                request_id: "42".into(),
                agent_vault_address: "0x0000000000000000000000000000000000000001".into(),
                agent_underlying_address: "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh".into(),
                payment_reference: None,
                reserved_base_drops: 10_000_000,
                reserved_fee_drops: 25_000,
                fee_bps: 25,
            }),
            ..Default::default()
        };
        let qb = bridge_update(Uuid::new_v4(), &[BridgeStatus::ReservingCollateral], &patch)
            .unwrap();
        assert!(sql_of(&qb).ends_with("AND agent_vault_address IS NULL"));
    }

    #[test]
    fn test_redemption_ticket_requires_missing_request_id() {
        let patch = RedemptionPatch {
            status: Some(RedemptionStatus::AwaitingProof),
            ticket: Some(RedemptionTicketFields {
                request_id: 7,
                tx_hash: "0xabc".into(),
                lots: 1,
                xrp_expected_drops: 9_950_000,
                payment_reference: "0x46425052".into(),
                agent_vault_address: "0x1111111111111111111111111111111111111111".into(),
                payment_deadline: None,
            }),
            ..Default::default()
        };
        let qb = redemption_update(Uuid::new_v4(), &[RedemptionStatus::RedeemingFxrp], &patch)
            .unwrap();
        assert!(sql_of(&qb).ends_with("AND redemption_request_id IS NULL"));
    }

    #[test]
    fn test_parse_shares() {
        assert_eq!(parse_shares("1000000000000000000").unwrap(), 1_000_000_000_000_000_000);
        assert!(parse_shares("1.5").is_err());
    }

    /// Requires a running Postgres at DATABASE_URL.
    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres database"]
    async fn test_conditional_claim_against_postgres() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = crate::db::create_pool(&url).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let store = PgStore::new(pool);

        let bridge = store
            .insert_bridge(&NewBridge {
                id: Uuid::new_v4(),
                wallet_address: "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh".into(),
                vault_id: "fxrp-yield".into(),
                position_id: None,
                settlement: SettlementKind::AttestedMint,
                requested_drops: 12_300_000,
                rounded_drops: 10_000_000,
                lots: 1,
                expected_fxrp_drops: 10_000_000,
                expires_at: Utc::now() + chrono::Duration::minutes(30),
            })
            .await
            .unwrap();

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
}
