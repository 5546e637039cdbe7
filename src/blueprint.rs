//! Blueprints: archived strategies with validation bounds, replayable at
//! zero model cost.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::discover::DiscoveryOutcome;
use crate::error::{Error, Result};
use crate::extractor::EdgeCase;
use crate::store::RetailerInfo;
use crate::strategy::{InteractionStep, NavigationType, Selectors, Strategy};

pub const BLUEPRINT_VERSION: &str = "1.0";
pub const GENERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintMetadata {
    pub site_url: String,
    pub retailer_id: i32,
    pub retailer_name: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub generator_version: String,
    pub confidence: f64,
}

/// The archived strategy; confidence lives in metadata and the URL
/// pattern in the validation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintStrategy {
    pub navigation_type: NavigationType,
    #[serde(default)]
    pub selectors: Selectors,
    #[serde(default)]
    pub interactions: Vec<InteractionStep>,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub total_categories: usize,
    pub max_depth: u32,
    pub by_depth: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    pub min_categories: usize,
    pub max_categories: usize,
    pub max_depth: u32,
    pub required_fields: Vec<String>,
    pub url_pattern: Option<String>,
}

/// The on-disk document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub version: String,
    pub metadata: BlueprintMetadata,
    pub extraction_strategy: BlueprintStrategy,
    pub extraction_stats: ExtractionStats,
    pub validation_rules: ValidationRules,
    #[serde(default)]
    pub edge_cases: Vec<EdgeCase>,
}

impl Blueprint {
    /// Reconstruct an executable strategy from the archive.
    pub fn strategy(&self) -> Strategy {
        Strategy {
            navigation_type: self.extraction_strategy.navigation_type,
            selectors: self.extraction_strategy.selectors.clone(),
            interactions: self.extraction_strategy.interactions.clone(),
            confidence: self.metadata.confidence,
            notes: self.extraction_strategy.notes.clone(),
            url_pattern: self.validation_rules.url_pattern.clone(),
        }
    }

    /// Staleness check after a replay: totals outside the recorded bounds
    /// or a depth drift beyond one level mean the site moved under us.
    pub fn staleness_of(&self, total: usize, max_depth: u32) -> Option<String> {
        let rules = &self.validation_rules;
        if total < rules.min_categories || total > rules.max_categories {
            return Some(format!(
                "replay produced {total} categories, expected {}..={}",
                rules.min_categories, rules.max_categories
            ));
        }
        if max_depth.abs_diff(rules.max_depth) > 1 {
            return Some(format!(
                "replay reached depth {max_depth}, recorded depth was {}",
                rules.max_depth
            ));
        }
        None
    }
}

/// Builds, saves, loads and selects blueprint files.
pub struct BlueprintEngine {
    dir: PathBuf,
}

impl BlueprintEngine {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Capture a successful discovery into a replayable document.
    pub fn build(
        &self,
        site_url: &str,
        retailer_id: i32,
        retailer: Option<&RetailerInfo>,
        outcome: &DiscoveryOutcome,
    ) -> Blueprint {
        let strategy = &outcome.effective_strategy;
        let total = outcome.categories.len();
        let max_depth = outcome.max_depth();
        let by_depth = outcome
            .by_depth()
            .into_iter()
            .map(|(depth, count)| (depth.to_string(), count))
            .collect();

        Blueprint {
            version: BLUEPRINT_VERSION.to_string(),
            metadata: BlueprintMetadata {
                site_url: site_url.to_string(),
                retailer_id,
                retailer_name: retailer.map(|r| r.name.clone()),
                generated_at: Utc::now(),
                generator_version: GENERATOR_VERSION.to_string(),
                confidence: strategy.confidence,
            },
            extraction_strategy: BlueprintStrategy {
                navigation_type: strategy.navigation_type,
                selectors: strategy.selectors.clone(),
                interactions: strategy.interactions.clone(),
                notes: strategy.notes.clone(),
            },
            extraction_stats: ExtractionStats {
                total_categories: total,
                max_depth,
                by_depth,
            },
            validation_rules: ValidationRules {
                min_categories: (total / 4).max(1),
                max_categories: total * 2,
                max_depth,
                required_fields: vec!["name".to_string(), "url".to_string()],
                url_pattern: strategy.url_pattern.clone(),
            },
            edge_cases: outcome.edge_cases.clone(),
        }
    }

    /// Write under a deterministic per-run filename and return the path.
    pub fn save(&self, blueprint: &Blueprint) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Blueprint(format!("cannot create {}: {e}", self.dir.display())))?;
        let filename = format!(
            "retailer_{}_{}.json",
            blueprint.metadata.retailer_id,
            blueprint.metadata.generated_at.format("%Y%m%d_%H%M%S")
        );
        let path = self.dir.join(filename);
        let json = serde_json::to_string_pretty(blueprint)?;
        fs::write(&path, json)
            .map_err(|e| Error::Blueprint(format!("cannot write {}: {e}", path.display())))?;
        info!(path = %path.display(), "blueprint saved");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Blueprint> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Blueprint(format!("cannot read {}: {e}", path.display())))?;
        let blueprint: Blueprint = serde_json::from_str(&raw)
            .map_err(|e| Error::Blueprint(format!("cannot parse {}: {e}", path.display())))?;
        if blueprint.version != BLUEPRINT_VERSION {
            return Err(Error::Blueprint(format!(
                "unsupported blueprint version {}",
                blueprint.version
            )));
        }
        Ok(blueprint)
    }

    /// Most recent blueprint file for a retailer, by the sortable
    /// timestamp embedded in the filename.
    pub fn latest_for(&self, retailer_id: i32) -> Result<Option<PathBuf>> {
        let prefix = format!("retailer_{retailer_id}_");
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(None),
        };
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort();
        Ok(candidates.pop())
    }
}
