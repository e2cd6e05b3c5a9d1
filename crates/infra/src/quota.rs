//! Per-owner usage counters.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use podforge_core::OwnerId;
use sqlx::{PgPool, Row};
use tracing::instrument;

use crate::jobs::JobStoreError;

/// Counts completed programs per owner.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn record_completion(&self, owner: OwnerId) -> Result<(), JobStoreError>;

    async fn completed_count(&self, owner: OwnerId) -> Result<u64, JobStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryQuotaLedger {
    counts: RwLock<HashMap<OwnerId, u64>>,
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaLedger for InMemoryQuotaLedger {
    async fn record_completion(&self, owner: OwnerId) -> Result<(), JobStoreError> {
        let mut counts = self
            .counts
            .write()
            .map_err(|e| JobStoreError::storage(format!("lock poisoned: {e}")))?;
        *counts.entry(owner).or_default() += 1;
        Ok(())
    }

    async fn completed_count(&self, owner: OwnerId) -> Result<u64, JobStoreError> {
        let counts = self
            .counts
            .read()
            .map_err(|e| JobStoreError::storage(format!("lock poisoned: {e}")))?;
        Ok(counts.get(&owner).copied().unwrap_or_default())
    }
}

/// Quota counters in the `owner_quotas` table.
#[derive(Debug, Clone)]
pub struct PgQuotaLedger {
    pool: Arc<PgPool>,
}

impl PgQuotaLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl QuotaLedger for PgQuotaLedger {
    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn record_completion(&self, owner: OwnerId) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO owner_quotas (owner_ref, podcasts_created, updated_at)
            VALUES ($1, 1, now())
            ON CONFLICT (owner_ref) DO UPDATE
            SET podcasts_created = owner_quotas.podcasts_created + 1,
                updated_at = now()
            "#,
        )
        .bind(owner.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| JobStoreError::storage(format!("record_completion: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn completed_count(&self, owner: OwnerId) -> Result<u64, JobStoreError> {
        let row = sqlx::query("SELECT podcasts_created FROM owner_quotas WHERE owner_ref = $1")
            .bind(owner.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| JobStoreError::storage(format!("completed_count: {e}")))?;
        let Some(row) = row else {
            return Ok(0);
        };
        let count: i64 = row
            .try_get("podcasts_created")
            .map_err(|e| JobStoreError::storage(format!("completed_count: {e}")))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
