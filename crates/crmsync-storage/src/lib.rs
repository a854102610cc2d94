//! Persistence sink: idempotent upsert of normalized deals keyed by
//! external ID, with a Postgres implementation and an in-memory test double.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use crmsync_core::{NormalizedDeal, DEAL_SCHEMA};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "crmsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The sink contract. `upsert` affects exactly one logical row with
/// last-write-wins semantics; `upsert_page` is the page-granularity
/// transaction the orchestrator commits at.
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn upsert(&self, deal: &NormalizedDeal) -> Result<(), StoreError>;

    async fn upsert_page(&self, deals: &[NormalizedDeal]) -> Result<(), StoreError>;
}

/// `INSERT ... ON CONFLICT (id) DO UPDATE SET` over the schema table, so the
/// column list has a single source of truth. Full-row replace: every non-key
/// column is overwritten on conflict.
fn upsert_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        let columns: Vec<&str> = std::iter::once("id")
            .chain(DEAL_SCHEMA.iter().map(|spec| spec.column))
            .collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .skip(1)
            .map(|col| format!("{col} = EXCLUDED.{col}"))
            .collect();
        format!(
            "INSERT INTO deals ({})\nVALUES ({})\nON CONFLICT (id) DO UPDATE SET\n    {}",
            columns.join(", "),
            placeholders.join(", "),
            updates.join(",\n    ")
        )
    })
}

fn bind_deal<'q>(
    deal: &'q NormalizedDeal,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let mut query = sqlx::query(upsert_sql()).bind(&deal.id);
    for value in deal.values_in_schema_order() {
        query = query.bind(value);
    }
    query
}

#[derive(Clone)]
pub struct PgDealStore {
    pool: PgPool,
}

impl PgDealStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DealStore for PgDealStore {
    async fn upsert(&self, deal: &NormalizedDeal) -> Result<(), StoreError> {
        bind_deal(deal).execute(&self.pool).await?;
        debug!(id = %deal.id, "upserted deal");
        Ok(())
    }

    async fn upsert_page(&self, deals: &[NormalizedDeal]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for deal in deals {
            bind_deal(deal).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(count = deals.len(), "committed page");
        Ok(())
    }
}

/// In-memory store for pipeline and webhook tests. Mirrors the Postgres
/// conflict policy: insert or full-row replace by ID.
#[derive(Default)]
pub struct MemoryDealStore {
    deals: Mutex<BTreeMap<String, NormalizedDeal>>,
}

impl MemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<NormalizedDeal> {
        self.deals.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.deals.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.deals.lock().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.deals.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl DealStore for MemoryDealStore {
    async fn upsert(&self, deal: &NormalizedDeal) -> Result<(), StoreError> {
        self.deals
            .lock()
            .await
            .insert(deal.id.clone(), deal.clone());
        Ok(())
    }

    async fn upsert_page(&self, deals: &[NormalizedDeal]) -> Result<(), StoreError> {
        let mut guard = self.deals.lock().await;
        for deal in deals {
            guard.insert(deal.id.clone(), deal.clone());
        }
        Ok(())
    }
}
