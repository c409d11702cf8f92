//! Per-campaign mutual exclusion.
//!
//! A [`LockManager`] turns "at-least-once trigger delivery" into "at most one
//! active dispatch per campaign". Acquisition never blocks: when another
//! holder owns the campaign the caller gets [`Acquisition::HeldElsewhere`]
//! and drops its consideration.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::SqlitePool;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

use crate::database::models::CampaignId;
use crate::database::store::StoreError;

/// Outcome of a non-blocking lock attempt.
pub enum Acquisition {
    Acquired(LockToken),
    /// Another dispatcher (or another run in this process) holds it.
    HeldElsewhere,
}

/// Hands out at most one [`LockToken`] per campaign at a time, across every
/// process sharing the database.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Takes the campaign's lock if it is free. Never waits.
    async fn try_acquire(&self, campaign_id: CampaignId) -> Result<Acquisition, StoreError>;
}

/// Backend-specific handle behind a [`LockToken`].
#[async_trait]
pub trait HeldLock: Send {
    /// Confirms the lock is still held, extending it where it expires.
    async fn renew(&mut self) -> Result<bool, StoreError>;

    /// Frees the lock. Only ever frees this holder's claim.
    async fn release(self: Box<Self>) -> Result<(), StoreError>;
}

/// Proof of holding a campaign's lock. Dropping it without [`release`]
/// still frees the lock once the holding session ends or the lease runs out.
///
/// [`release`]: LockToken::release
pub struct LockToken {
    campaign_id: CampaignId,
    held: Box<dyn HeldLock>,
    renew_every: Duration,
    last_confirmed: Instant,
}

impl LockToken {
    pub fn new(campaign_id: CampaignId, held: Box<dyn HeldLock>, renew_every: Duration) -> Self {
        Self {
            campaign_id,
            held,
            renew_every,
            last_confirmed: Instant::now(),
        }
    }

    pub fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    /// Confirms (and for leases extends) the claim right now. False once
    /// the lock has been lost.
    pub async fn renew(&mut self) -> Result<bool, StoreError> {
        let held = self.held.renew().await?;
        if held {
            self.last_confirmed = Instant::now();
        }
        Ok(held)
    }

    /// Renews only when the last confirmation is older than the renewal
    /// interval. Cheap enough to call before every send.
    pub async fn keep_alive(&mut self) -> Result<bool, StoreError> {
        if self.last_confirmed.elapsed() < self.renew_every {
            return Ok(true);
        }
        self.renew().await
    }

    pub async fn release(self) -> Result<(), StoreError> {
        self.held.release().await
    }
}

/// Session-scoped `pg_try_advisory_lock`, held on a connection checked out
/// of the pool for the lifetime of the token.
#[derive(Clone)]
pub struct AdvisoryLockManager {
    pool: PgPool,
    check_every: Duration,
}

impl AdvisoryLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            check_every: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl LockManager for AdvisoryLockManager {
    async fn try_acquire(&self, campaign_id: CampaignId) -> Result<Acquisition, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(campaign_id)
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            return Ok(Acquisition::HeldElsewhere);
        }

        let held = AdvisoryLock {
            campaign_id,
            conn: Some(conn),
        };
        Ok(Acquisition::Acquired(LockToken::new(
            campaign_id,
            Box::new(held),
            self.check_every,
        )))
    }
}

struct AdvisoryLock {
    campaign_id: CampaignId,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl HeldLock for AdvisoryLock {
    async fn renew(&mut self) -> Result<bool, StoreError> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(false);
        };
        // The lock lives exactly as long as the session; a dead session means
        // another dispatcher may already own the campaign.
        let alive = sqlx::query("SELECT 1").execute(&mut **conn).await.is_ok();
        Ok(alive)
    }

    async fn release(mut self: Box<Self>) -> Result<(), StoreError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.campaign_id)
            .fetch_one(&mut *conn)
            .await;

        match unlocked {
            Ok(_) => Ok(()),
            Err(e) => {
                // Never hand a connection that may still hold the lock back to the pool.
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                "Advisory lock for campaign {} dropped without release, closing its session",
                self.campaign_id
            );
            drop(conn.detach());
        }
    }
}

/// Lease rows in `campaign_claims`, for SQLite where no session-scoped lock
/// exists. A holder that dies simply stops renewing and the lease expires.
#[derive(Clone)]
pub struct LeaseLockManager {
    pool: SqlitePool,
    holder: String,
    lease: Duration,
}

impl LeaseLockManager {
    pub fn new(pool: SqlitePool, lease: Duration) -> Self {
        Self {
            pool,
            holder: Uuid::new_v4().to_string(),
            lease,
        }
    }

    fn lease_end(&self) -> chrono::DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
        Utc::now() + lease
    }
}

#[async_trait]
impl LockManager for LeaseLockManager {
    async fn try_acquire(&self, campaign_id: CampaignId) -> Result<Acquisition, StoreError> {
        let claim = format!("{}:{}", self.holder, Uuid::new_v4());
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO campaign_claims (campaign_id, claimed_by, claimed_until) VALUES (?, ?, ?)
             ON CONFLICT(campaign_id) DO UPDATE SET
                 claimed_by = excluded.claimed_by,
                 claimed_until = excluded.claimed_until
             WHERE campaign_claims.claimed_until < ?",
        )
        .bind(campaign_id)
        .bind(&claim)
        .bind(self.lease_end())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(Acquisition::HeldElsewhere);
        }

        let held = LeaseLock {
            pool: self.pool.clone(),
            campaign_id,
            claim,
            lease: self.lease,
        };
        Ok(Acquisition::Acquired(LockToken::new(
            campaign_id,
            Box::new(held),
            self.lease / 3,
        )))
    }
}

struct LeaseLock {
    pool: SqlitePool,
    campaign_id: CampaignId,
    claim: String,
    lease: Duration,
}

#[async_trait]
impl HeldLock for LeaseLock {
    async fn renew(&mut self) -> Result<bool, StoreError> {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE campaign_claims SET claimed_until = ?
             WHERE campaign_id = ? AND claimed_by = ? AND claimed_until >= ?",
        )
        .bind(now + lease)
        .bind(self.campaign_id)
        .bind(&self.claim)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM campaign_claims WHERE campaign_id = ? AND claimed_by = ?")
            .bind(self.campaign_id)
            .bind(&self.claim)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
