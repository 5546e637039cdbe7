//! In-memory category store for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::category::Category;
use crate::error::Result;

use super::{depth_sorted, CategoryStore, PersistOutcome, RetailerInfo};

/// A stored row, mirroring the relational schema.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCategory {
    pub id: i32,
    pub name: String,
    pub url: String,
    pub parent_id: Option<i32>,
    pub retailer_id: i32,
    pub depth: i32,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<(i32, String), StoredCategory>,
    retailers: HashMap<i32, String>,
    next_id: i32,
}

/// HashMap-backed store with the same upsert semantics as the Postgres
/// implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retailer(self, id: i32, name: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .retailers
            .insert(id, name.to_string());
        self
    }

    /// All rows, ordered by database id.
    pub fn rows(&self) -> Vec<StoredCategory> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<StoredCategory> = inner.rows.values().cloned().collect();
        rows.sort_by_key(|r| r.id);
        rows
    }
}

#[async_trait]
impl CategoryStore for MemoryStore {
    async fn persist(&self, categories: &[Category], retailer_id: i32) -> Result<PersistOutcome> {
        let mut outcome = PersistOutcome::default();
        let mut db_ids: HashMap<u32, i32> = HashMap::new();
        let mut inner = self.inner.lock().unwrap();

        for category in depth_sorted(categories) {
            let parent_id = category
                .parent_local_id
                .and_then(|local| db_ids.get(&local))
                .copied();
            let key = (retailer_id, category.url.clone());

            if let Some(row) = inner.rows.get_mut(&key) {
                row.name = category.name.clone();
                row.depth = category.depth as i32;
                row.parent_id = parent_id;
                outcome.updated += 1;
                db_ids.insert(category.local_id, row.id);
            } else {
                inner.next_id += 1;
                let id = inner.next_id;
                inner.rows.insert(
                    key,
                    StoredCategory {
                        id,
                        name: category.name.clone(),
                        url: category.url.clone(),
                        parent_id,
                        retailer_id,
                        depth: category.depth as i32,
                    },
                );
                outcome.saved += 1;
                db_ids.insert(category.local_id, id);
            }
        }

        Ok(outcome)
    }

    async fn get_retailer(&self, retailer_id: i32) -> Result<Option<RetailerInfo>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .retailers
            .get(&retailer_id)
            .map(|name| RetailerInfo {
                id: retailer_id,
                name: name.clone(),
            }))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tree() -> Vec<Category> {
        vec![
            Category::new(0, "Shoes", "https://x.com/shoes", "/shoes", 0, None, 7),
            Category::new(
                1,
                "Boots",
                "https://x.com/shoes/boots",
                "/shoes/boots",
                1,
                Some(0),
                7,
            ),
            Category::new(
                2,
                "Heels",
                "https://x.com/shoes/heels",
                "/shoes/heels",
                1,
                Some(0),
                7,
            ),
        ]
    }

    #[tokio::test]
    async fn parents_persist_before_children_and_resolve() {
        let store = MemoryStore::new();
        let outcome = store.persist(&tree(), 7).await.unwrap();
        assert_eq!(outcome, PersistOutcome { saved: 3, updated: 0, errors: 0 });

        let rows = store.rows();
        let shoes = rows.iter().find(|r| r.name == "Shoes").unwrap();
        let boots = rows.iter().find(|r| r.name == "Boots").unwrap();
        assert_eq!(boots.parent_id, Some(shoes.id));
    }

    #[tokio::test]
    async fn persist_twice_is_idempotent() {
        let store = MemoryStore::new();
        let input = tree();
        let first = store.persist(&input, 7).await.unwrap();
        let second = store.persist(&input, 7).await.unwrap();

        assert_eq!(first.saved + first.updated, input.len());
        assert_eq!(second.saved, 0);
        assert_eq!(second.updated, input.len());
        assert_eq!(store.rows().len(), input.len());
    }

    #[tokio::test]
    async fn update_refreshes_name_depth_and_parent() {
        let store = MemoryStore::new();
        store.persist(&tree(), 7).await.unwrap();

        let mut renamed = tree();
        renamed[1].name = "Ankle Boots".to_string();
        store.persist(&renamed, 7).await.unwrap();

        let rows = store.rows();
        assert!(rows.iter().any(|r| r.name == "Ankle Boots"));
        assert!(!rows.iter().any(|r| r.name == "Boots"));
    }

    #[tokio::test]
    async fn retailers_are_scoped() {
        let store = MemoryStore::new().with_retailer(7, "Fixture Mart");
        assert_eq!(
            store.get_retailer(7).await.unwrap().unwrap().name,
            "Fixture Mart"
        );
        assert!(store.get_retailer(8).await.unwrap().is_none());

        // Same URL under two retailers is two rows.
        store.persist(&tree(), 7).await.unwrap();
        let mut other = tree();
        for c in &mut other {
            c.retailer_id = 8;
        }
        store.persist(&other, 8).await.unwrap();
        assert_eq!(store.rows().len(), 6);
    }
}
