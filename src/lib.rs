//! # catscout
//!
//! Adaptive discovery of e-commerce category taxonomies. Given a homepage
//! and a retailer id, catscout infers the site's navigation pattern with a
//! vision-capable LLM, executes that strategy in a browser, recursively
//! harvests every category and subcategory link, persists the tree, and
//! emits a reusable JSON blueprint that replays the extraction at zero
//! model cost.
//!
//! ## Core Components
//!
//! - **Analyzer**: vision-plus-DOM page analysis producing a `Strategy`
//! - **Extractor**: strategy execution against a live page
//! - **Discoverer**: breadth-first traversal with cycle control
//! - **Blueprint**: archived strategies with staleness detection
//! - **Agent**: run lifecycle, state and cleanup
//!
//! ## Example
//!
//! ```rust,ignore
//! use catscout::{Config, ExtractionAgent, RunRequest};
//!
//! let config = Config::from_env()?;
//! let agent = ExtractionAgent::new(config, driver, store, model);
//! let outcome = agent.run(RunRequest::new("https://shop.example.com", 42)).await;
//! if outcome.success {
//!     println!("{} categories", outcome.state.categories.len());
//! }
//! ```

pub mod agent;
pub mod analyzer;
pub mod blueprint;
pub mod browser;
pub mod category;
pub mod config;
pub mod discover;
pub mod error;
pub mod extractor;
pub mod llm;
pub mod normalize;
pub mod retry;
pub mod store;
pub mod strategy;
pub mod validate;

// Re-exports for convenience
pub use agent::{ExtractionAgent, RunOutcome, RunRequest, RunStage, RunState};
pub use analyzer::{AnalyzerSettings, PageAnalyzer};
pub use blueprint::{Blueprint, BlueprintEngine};
pub use browser::{BrowserDriver, BrowserPage, ElementInfo, WaitStrategy};
pub use category::{Category, CategoryEvidence, IdAllocator};
pub use config::Config;
pub use discover::{Discoverer, DiscoveryOutcome, DiscoverySettings};
pub use error::{Error, Result};
pub use extractor::{CategoryExtractor, EdgeCase, ExtractorSettings, PageContext, PageExtraction};
pub use llm::{ProviderKind, VisionModel, VisionRequest};
pub use store::{CategoryStore, MemoryStore, PersistOutcome, PgCategoryStore, RetailerInfo};
pub use strategy::{InteractionAction, InteractionStep, NavigationType, Selectors, Strategy};
