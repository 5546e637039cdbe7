//! Run orchestration: owns the `RunState`, sequences the phases, and
//! guarantees cleanup on every exit path.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analyzer::{AnalyzerSettings, PageAnalyzer};
use crate::blueprint::BlueprintEngine;
use crate::browser::{BrowserDriver, BrowserPage, WaitStrategy};
use crate::category::Category;
use crate::config::Config;
use crate::discover::{Discoverer, DiscoveryOutcome, DiscoverySettings};
use crate::error::{Error, Result};
use crate::extractor::{CategoryExtractor, ExtractorSettings};
use crate::llm::VisionModel;
use crate::retry::{retry, RetryPolicy};
use crate::store::{CategoryStore, PersistOutcome};
use crate::validate::{validate_category, validate_hierarchy};

/// Lifecycle phases of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Initialized,
    BrowserReady,
    Analyzing,
    Extracting,
    Discovering,
    Persisting,
    Blueprinting,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::BrowserReady => "browser_ready",
            Self::Analyzing => "analyzing",
            Self::Extracting => "extracting",
            Self::Discovering => "discovering",
            Self::Persisting => "persisting",
            Self::Blueprinting => "blueprinting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Mutable record of a run, owned by the agent. Other components return
/// values; they never touch this directly.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub stage: RunStage,
    pub site_url: String,
    pub retailer_id: i32,
    pub provider: String,
    pub categories: Vec<Category>,
    pub by_depth: BTreeMap<u32, usize>,
    pub errors: Vec<String>,
    pub persist: Option<PersistSummary>,
    pub blueprint_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PersistSummary {
    pub saved: usize,
    pub updated: usize,
    pub errors: usize,
}

impl From<PersistOutcome> for PersistSummary {
    fn from(outcome: PersistOutcome) -> Self {
        Self {
            saved: outcome.saved,
            updated: outcome.updated,
            errors: outcome.errors,
        }
    }
}

impl RunState {
    fn new(site_url: &str, retailer_id: i32, provider: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            stage: RunStage::Initialized,
            site_url: site_url.to_string(),
            retailer_id,
            provider,
            categories: Vec::new(),
            by_depth: BTreeMap::new(),
            errors: Vec::new(),
            persist: None,
            blueprint_path: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// What the caller asked for.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub url: String,
    pub retailer_id: i32,
    /// Execute this blueprint instead of analyzing; falls back to the
    /// LLM path on staleness.
    pub blueprint_path: Option<PathBuf>,
    /// Generate strategy and blueprint without persisting categories.
    pub blueprint_only: bool,
    /// Ignore stored blueprints even when one exists.
    pub force_refresh: bool,
    pub max_depth: Option<u32>,
    pub max_categories: Option<usize>,
}

impl RunRequest {
    pub fn new(url: impl Into<String>, retailer_id: i32) -> Self {
        Self {
            url: url.into(),
            retailer_id,
            blueprint_path: None,
            blueprint_only: false,
            force_refresh: false,
            max_depth: None,
            max_categories: None,
        }
    }
}

/// Structured result handed back to the CLI. Errors never unwind past
/// here.
#[derive(Debug)]
pub struct RunOutcome {
    pub success: bool,
    pub state: RunState,
    pub error: Option<Error>,
}

/// Owns the run lifecycle. Depends only on the capability interfaces, so
/// tests drive it with fixtures.
pub struct ExtractionAgent {
    config: Config,
    driver: Arc<dyn BrowserDriver>,
    store: Arc<dyn CategoryStore>,
    model: Arc<dyn VisionModel>,
    cancel: CancellationToken,
}

impl ExtractionAgent {
    pub fn new(
        config: Config,
        driver: Arc<dyn BrowserDriver>,
        store: Arc<dyn CategoryStore>,
        model: Arc<dyn VisionModel>,
    ) -> Self {
        Self {
            config,
            driver,
            store,
            model,
            cancel: CancellationToken::new(),
        }
    }

    /// Token to wire into a signal handler; cancelling it stops the walk
    /// at the next suspension point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run to completion. Cleanup (browser shutdown, store disconnect)
    /// executes on every exit path, including cancellation.
    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        let mut state = RunState::new(
            &request.url,
            request.retailer_id,
            self.config.llm.provider.to_string(),
        );
        info!(run_id = %state.run_id, url = %request.url, "run started");

        let result = self.execute(&request, &mut state).await;

        if let Err(e) = self.driver.close().await {
            warn!(error = %e, "browser shutdown failed");
        }
        if let Err(e) = self.store.disconnect().await {
            warn!(error = %e, "store disconnect failed");
        }
        state.finished_at = Some(Utc::now());

        match result {
            Ok(()) => {
                state.stage = RunStage::Completed;
                info!(run_id = %state.run_id, total = state.categories.len(), "run completed");
                RunOutcome {
                    success: true,
                    state,
                    error: None,
                }
            }
            Err(Error::Cancelled) => {
                state.stage = RunStage::Cancelled;
                warn!(run_id = %state.run_id, "run cancelled");
                RunOutcome {
                    success: false,
                    state,
                    error: Some(Error::Cancelled),
                }
            }
            Err(e) => {
                state.errors.push(e.to_string());
                state.stage = RunStage::Failed;
                warn!(run_id = %state.run_id, error = %e, "run failed");
                RunOutcome {
                    success: false,
                    state,
                    error: Some(e),
                }
            }
        }
    }

    async fn execute(&self, request: &RunRequest, state: &mut RunState) -> Result<()> {
        let page = self.driver.new_page().await?;
        state.stage = RunStage::BrowserReady;

        let result = self.pipeline(page.as_ref(), request, state).await;
        if let Err(e) = page.close().await {
            warn!(error = %e, "page close failed");
        }
        result
    }

    async fn pipeline(
        &self,
        page: &dyn BrowserPage,
        request: &RunRequest,
        state: &mut RunState,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut extraction = self.config.extraction.clone();
        if let Some(depth) = request.max_depth {
            extraction.max_depth = depth;
        }
        if let Some(count) = request.max_categories {
            extraction.max_categories = count;
        }

        let extractor = CategoryExtractor::new(ExtractorSettings {
            max_retries: extraction.max_retries,
            retry_delay_ms: extraction.retry_delay_ms,
            wait_timeout_ms: self.config.browser.wait_timeout_ms.min(5_000),
            ..ExtractorSettings::default()
        });
        let analyzer = PageAnalyzer::new(
            self.model.clone(),
            AnalyzerSettings {
                dom_cap_bytes: extraction.dom_cap_bytes,
                temperature: self.config.llm.temperature,
                wait_timeout_ms: self.config.browser.wait_timeout_ms,
            },
        );
        let discovery_settings = DiscoverySettings::from(&extraction);
        let engine = BlueprintEngine::new(&extraction.blueprint_dir);

        let mut outcome: Option<DiscoveryOutcome> = None;

        // Warm path: replay the requested or most recent blueprint and
        // escalate to the analyzer only on staleness.
        if let Some(path) = self.blueprint_to_replay(request, &engine) {
            state.stage = RunStage::Extracting;
            match BlueprintEngine::load(&path) {
                Ok(blueprint) => {
                    let discoverer = Discoverer::new(&extractor, None, discovery_settings.clone());
                    match discoverer
                        .discover(
                            page,
                            &request.url,
                            request.retailer_id,
                            &blueprint.strategy(),
                            "blueprint",
                            &self.cancel,
                        )
                        .await
                    {
                        Ok(replay) => {
                            match blueprint
                                .staleness_of(replay.categories.len(), replay.max_depth())
                            {
                                None => {
                                    info!(path = %path.display(), "blueprint replay validated");
                                    outcome = Some(replay);
                                }
                                Some(reason) => {
                                    warn!(path = %path.display(), %reason, "blueprint is stale");
                                    state.errors.push(format!("stale blueprint: {reason}"));
                                }
                            }
                        }
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) => {
                            warn!(error = %e, "blueprint replay failed");
                            state.errors.push(format!("blueprint replay failed: {e}"));
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "blueprint unusable, falling back to analysis");
                    state.errors.push(e.to_string());
                }
            }
        }

        // Cold path: analyze, then discover. Also the staleness fallback;
        // the old blueprint file stays on disk until a fresh one lands.
        if outcome.is_none() {
            state.stage = RunStage::Analyzing;
            let goto_policy =
                RetryPolicy::fixed(extraction.max_retries, extraction.retry_delay_ms);
            retry(
                &goto_policy,
                |e| matches!(e, Error::Navigation { .. } | Error::Timeout { .. }),
                || page.goto(&request.url, WaitStrategy::DomContentLoaded),
            )
            .await?;
            let strategy = analyzer.analyze(page, &request.url).await?;

            state.stage = RunStage::Discovering;
            let discoverer = Discoverer::new(&extractor, Some(&analyzer), discovery_settings);
            outcome = Some(
                discoverer
                    .discover(
                        page,
                        &request.url,
                        request.retailer_id,
                        &strategy,
                        "llm",
                        &self.cancel,
                    )
                    .await?,
            );
        }

        let mut outcome = outcome.expect("one of the paths produced an outcome");

        // Per-record validation: offenders are dropped and recorded,
        // never fatal. The hierarchy check on the survivors must hold.
        outcome.categories.retain(|category| match validate_category(category) {
            Ok(()) => true,
            Err(e) => {
                state.errors.push(e.to_string());
                false
            }
        });
        validate_hierarchy(&outcome.categories)?;

        state.categories = outcome.categories.clone();
        state.by_depth = outcome.by_depth();

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if !request.blueprint_only {
            state.stage = RunStage::Persisting;
            let persisted = self
                .store
                .persist(&outcome.categories, request.retailer_id)
                .await?;
            state.persist = Some(persisted.into());
        }

        state.stage = RunStage::Blueprinting;
        let retailer = self
            .store
            .get_retailer(request.retailer_id)
            .await
            .unwrap_or_default();
        let blueprint = engine.build(
            &request.url,
            request.retailer_id,
            retailer.as_ref(),
            &outcome,
        );
        state.blueprint_path = Some(engine.save(&blueprint)?);

        Ok(())
    }

    /// Which blueprint, if any, the warm path should replay.
    fn blueprint_to_replay(
        &self,
        request: &RunRequest,
        engine: &BlueprintEngine,
    ) -> Option<PathBuf> {
        if let Some(path) = &request.blueprint_path {
            return Some(path.clone());
        }
        if request.force_refresh {
            return None;
        }
        engine.latest_for(request.retailer_id).ok().flatten()
    }
}
