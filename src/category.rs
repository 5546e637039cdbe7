//! Category data model.

use serde::{Deserialize, Serialize};

/// How a category's link was obtained, kept for debugging and blueprints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryEvidence {
    /// Anchor text as found on the page, before trimming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_text: Option<String>,
    /// Selector that matched the link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Interaction path taken to reveal the link (e.g. "hover#2 > flyout").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction: Option<String>,
    /// "llm" for analyzer strategies, "fallback" for the heuristic probe,
    /// "blueprint" for replays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<String>,
}

/// A node in the retailer's taxonomy. Nodes reference parents by run-local
/// integer id; database ids are resolved only at persistence time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    /// Unique within a run, assigned monotonically.
    pub local_id: u32,
    pub name: String,
    /// Canonical URL; the dedup key together with `retailer_id`.
    pub url: String,
    /// URL as discovered, before normalization.
    pub raw_url: String,
    /// 0 for roots.
    pub depth: u32,
    pub parent_local_id: Option<u32>,
    pub retailer_id: i32,
    #[serde(default)]
    pub evidence: CategoryEvidence,
}

impl Category {
    pub fn new(
        local_id: u32,
        name: impl Into<String>,
        url: impl Into<String>,
        raw_url: impl Into<String>,
        depth: u32,
        parent_local_id: Option<u32>,
        retailer_id: i32,
    ) -> Self {
        Self {
            local_id,
            name: name.into(),
            url: url.into(),
            raw_url: raw_url.into(),
            depth,
            parent_local_id,
            retailer_id,
            evidence: CategoryEvidence::default(),
        }
    }

    pub fn with_evidence(mut self, evidence: CategoryEvidence) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Monotonic run-local id allocator, owned by the discoverer.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn allocated(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_allocation_is_monotonic() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.next(), 0);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.allocated(), 3);
    }

    #[test]
    fn category_serializes_without_empty_evidence_fields() {
        let c = Category::new(0, "Shoes", "https://x.com/shoes", "/shoes", 0, None, 7);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["name"], "Shoes");
        assert!(json["evidence"].get("selector").is_none());
    }
}
