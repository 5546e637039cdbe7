//! Transactional persistence of a category tree keyed by
//! `(retailer_id, url)`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::category::Category;
use crate::error::Result;

pub use memory::MemoryStore;
pub use postgres::PgCategoryStore;

/// Retailer metadata used to annotate blueprints.
#[derive(Debug, Clone, PartialEq)]
pub struct RetailerInfo {
    pub id: i32,
    pub name: String,
}

/// Counters from a persist call. Per-record write failures are counted,
/// never fatal to the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub saved: usize,
    pub updated: usize,
    pub errors: usize,
}

/// Category persistence capability. The production implementation is a
/// pooled Postgres store; tests use the in-memory one.
#[async_trait]
pub trait CategoryStore: Send + Sync {
    /// Upsert a run's categories in a single transaction, parents before
    /// children. Run-local parent ids are resolved to database ids on the
    /// way in.
    async fn persist(&self, categories: &[Category], retailer_id: i32) -> Result<PersistOutcome>;

    async fn get_retailer(&self, retailer_id: i32) -> Result<Option<RetailerInfo>>;

    /// Release the pool. Safe to call more than once.
    async fn disconnect(&self) -> Result<()>;
}

/// Persist order: parents strictly before children.
pub(crate) fn depth_sorted(categories: &[Category]) -> Vec<&Category> {
    let mut sorted: Vec<&Category> = categories.iter().collect();
    sorted.sort_by_key(|c| c.depth);
    sorted
}
