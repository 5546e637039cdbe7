//! Breadth-first, level-synchronous discovery of the whole taxonomy.
//!
//! The discoverer owns the frontier, the visited set and the global
//! canonical-URL claims; pages and strategies flow through it, state
//! never leaves it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzer::PageAnalyzer;
use crate::browser::{BrowserPage, WaitStrategy};
use crate::category::{Category, IdAllocator};
use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use crate::extractor::{CategoryExtractor, EdgeCase, PageContext};
use crate::normalize;
use crate::retry::{retry, RetryPolicy};
use crate::strategy::Strategy;

/// Traversal bounds and retry knobs.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub max_depth: u32,
    pub max_categories: usize,
    pub max_reanalyses: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub bot_backoff_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_categories: 10_000,
            max_reanalyses: 3,
            max_retries: 3,
            retry_delay_ms: 1_000,
            bot_backoff_ms: 100,
        }
    }
}

impl From<&ExtractionConfig> for DiscoverySettings {
    fn from(config: &ExtractionConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_categories: config.max_categories,
            max_reanalyses: config.max_reanalyses,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            bot_backoff_ms: config.bot_backoff_ms,
        }
    }
}

/// Everything a finished traversal produced.
#[derive(Debug)]
pub struct DiscoveryOutcome {
    pub categories: Vec<Category>,
    pub edge_cases: Vec<EdgeCase>,
    pub reanalyses_used: u32,
    /// Strategy that actually extracted the root, after any heuristic
    /// switch; this is what blueprints archive.
    pub effective_strategy: Strategy,
    pub extraction_method: String,
}

impl DiscoveryOutcome {
    pub fn by_depth(&self) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for category in &self.categories {
            *counts.entry(category.depth).or_insert(0) += 1;
        }
        counts
    }

    pub fn max_depth(&self) -> u32 {
        self.categories.iter().map(|c| c.depth).max().unwrap_or(0)
    }
}

struct FrontierEntry {
    url: String,
    base_depth: u32,
    parent_local_id: Option<u32>,
    ancestors: Arc<HashSet<String>>,
    strategy: Arc<Strategy>,
    method: String,
}

/// Drives the extractor over an expanding frontier of category URLs.
pub struct Discoverer<'a> {
    extractor: &'a CategoryExtractor,
    analyzer: Option<&'a PageAnalyzer>,
    settings: DiscoverySettings,
}

impl<'a> Discoverer<'a> {
    pub fn new(
        extractor: &'a CategoryExtractor,
        analyzer: Option<&'a PageAnalyzer>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            extractor,
            analyzer,
            settings,
        }
    }

    /// Traverse from `root_url` with `root_strategy`, returning every
    /// category to the deepest configured level.
    pub async fn discover(
        &self,
        page: &dyn BrowserPage,
        root_url: &str,
        retailer_id: i32,
        root_strategy: &Strategy,
        method: &str,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let root = normalize::normalize_url(root_url)
            .ok_or_else(|| Error::navigation(root_url, "root URL is not a valid http(s) URL"))?;

        let mut ids = IdAllocator::new();
        let mut visited: HashSet<String> = HashSet::from([root.clone()]);
        let mut claimed: HashMap<String, u32> = HashMap::new();
        let mut depths: HashMap<u32, u32> = HashMap::new();
        let mut categories: Vec<Category> = Vec::new();
        let mut edge_cases: Vec<EdgeCase> = Vec::new();
        let mut reanalyses_used = 0u32;

        // Root page: navigate, extract, and let the heuristic probe
        // overrule a starving model strategy.
        self.goto_with_retry(page, &root).await?;
        let root_ancestors = Arc::new(HashSet::from([root.clone()]));
        let mut effective_strategy = root_strategy.clone();
        let mut effective_method = method.to_string();

        let mut root_extraction = self
            .extract_with_bot_backoff(
                page,
                &effective_strategy,
                &PageContext {
                    page_url: root.clone(),
                    parent_local_id: None,
                    base_depth: 0,
                    retailer_id,
                    ancestors: &root_ancestors,
                    method: &effective_method,
                },
                &mut ids,
            )
            .await?;

        if effective_method == "llm" && root_extraction.categories.len() < 5 {
            if let Some(analyzer) = self.analyzer {
                if let Some((probe_strategy, probe_count)) = analyzer.probe(page).await? {
                    if probe_count >= 5 * root_extraction.categories.len().max(1) {
                        info!(
                            llm_count = root_extraction.categories.len(),
                            probe_count, "switching to heuristic probe strategy"
                        );
                        effective_strategy = probe_strategy;
                        effective_method = "fallback".to_string();
                        root_extraction = self
                            .extract_with_bot_backoff(
                                page,
                                &effective_strategy,
                                &PageContext {
                                    page_url: root.clone(),
                                    parent_local_id: None,
                                    base_depth: 0,
                                    retailer_id,
                                    ancestors: &root_ancestors,
                                    method: &effective_method,
                                },
                                &mut ids,
                            )
                            .await?;
                    }
                }
            }
        }

        edge_cases.append(&mut root_extraction.edge_cases);

        // Frontier bucketed by page depth: level N+1 never begins before
        // level N is fully processed, even though a single page can emit
        // categories at two depths.
        let mut pending: BTreeMap<u32, Vec<FrontierEntry>> = BTreeMap::new();
        for entry in self.accept_page(
            root_extraction.categories,
            &root_ancestors,
            &Arc::new(effective_strategy.reduce_for_child()),
            &effective_method,
            &root,
            &mut visited,
            &mut claimed,
            &mut depths,
            &mut categories,
        ) {
            pending.entry(entry.base_depth).or_default().push(entry);
        }

        while categories.len() < self.settings.max_categories {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some((&level_depth, _)) = pending.iter().next() else {
                break;
            };
            let frontier = pending.remove(&level_depth).unwrap_or_default();
            debug!(
                level_depth,
                pages = frontier.len(),
                total = categories.len(),
                "processing frontier level"
            );

            for entry in frontier {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                if categories.len() >= self.settings.max_categories {
                    break;
                }

                if let Err(e) = self.goto_with_retry(page, &entry.url).await {
                    warn!(url = %entry.url, error = %e, "child page abandoned");
                    edge_cases.push(EdgeCase::new("navigation_failed", None, e.to_string()));
                    continue;
                }

                let ctx = PageContext {
                    page_url: entry.url.clone(),
                    parent_local_id: entry.parent_local_id,
                    base_depth: entry.base_depth,
                    retailer_id,
                    ancestors: &entry.ancestors,
                    method: &entry.method,
                };
                let mut extraction = match self
                    .extract_with_bot_backoff(page, &entry.strategy, &ctx, &mut ids)
                    .await
                {
                    Ok(extraction) => extraction,
                    Err(e) => {
                        edge_cases.push(EdgeCase::new("page_abandoned", None, e.to_string()));
                        continue;
                    }
                };

                // The inherited strategy starved on this page; spend the
                // re-analysis budget on the subtree root.
                let mut child_strategy = entry.strategy.clone();
                let mut child_method = entry.method.clone();
                if extraction.categories.is_empty()
                    && reanalyses_used < self.settings.max_reanalyses
                {
                    if let Some(analyzer) = self.analyzer {
                        reanalyses_used += 1;
                        info!(url = %entry.url, used = reanalyses_used, "re-analyzing subtree");
                        match analyzer.analyze(page, &entry.url).await {
                            Ok(fresh) => {
                                let ctx = PageContext {
                                    method: "llm",
                                    ..ctx
                                };
                                match self
                                    .extract_with_bot_backoff(page, &fresh, &ctx, &mut ids)
                                    .await
                                {
                                    Ok(second) => {
                                        extraction = second;
                                        child_strategy = Arc::new(fresh.reduce_for_child());
                                        child_method = "llm".to_string();
                                    }
                                    Err(e) => {
                                        edge_cases.push(EdgeCase::new(
                                            "reanalysis_failed",
                                            None,
                                            e.to_string(),
                                        ));
                                    }
                                }
                            }
                            Err(e) => edge_cases.push(EdgeCase::new(
                                "reanalysis_failed",
                                None,
                                e.to_string(),
                            )),
                        }
                    }
                }

                edge_cases.append(&mut extraction.edge_cases);
                for child in self.accept_page(
                    extraction.categories,
                    &entry.ancestors,
                    &child_strategy,
                    &child_method,
                    &root,
                    &mut visited,
                    &mut claimed,
                    &mut depths,
                    &mut categories,
                ) {
                    pending.entry(child.base_depth).or_default().push(child);
                }
            }
        }

        info!(
            total = categories.len(),
            max_depth = categories.iter().map(|c| c.depth).max().unwrap_or(0),
            reanalyses_used,
            "discovery finished"
        );
        Ok(DiscoveryOutcome {
            categories,
            edge_cases,
            reanalyses_used,
            effective_strategy,
            extraction_method: effective_method,
        })
    }

    /// Merge a page's extraction into the run: global first-seen-wins
    /// dedup, authoritative depth recomputation, bounds enforcement, and
    /// frontier expansion.
    #[allow(clippy::too_many_arguments)]
    fn accept_page(
        &self,
        page_categories: Vec<Category>,
        page_ancestors: &Arc<HashSet<String>>,
        child_strategy: &Arc<Strategy>,
        child_method: &str,
        root: &str,
        visited: &mut HashSet<String>,
        claimed: &mut HashMap<String, u32>,
        depths: &mut HashMap<u32, u32>,
        categories: &mut Vec<Category>,
    ) -> Vec<FrontierEntry> {
        let mut remapped: HashMap<u32, u32> = HashMap::new();
        let mut next_level = Vec::new();

        for mut category in page_categories {
            if categories.len() >= self.settings.max_categories {
                break;
            }

            // A link appearing in several menus keeps its first owner.
            if let Some(&owner) = claimed.get(&category.url) {
                remapped.insert(category.local_id, owner);
                continue;
            }

            if let Some(parent) = category.parent_local_id {
                category.parent_local_id = Some(*remapped.get(&parent).unwrap_or(&parent));
            }
            let depth = match category.parent_local_id {
                Some(parent) => match depths.get(&parent) {
                    Some(parent_depth) => parent_depth + 1,
                    None => {
                        // Parent did not survive filtering; orphans are
                        // dropped rather than persisted with a dangling
                        // reference.
                        continue;
                    }
                },
                None => category.depth,
            };
            if depth > self.settings.max_depth {
                continue;
            }
            category.depth = depth;

            claimed.insert(category.url.clone(), category.local_id);
            depths.insert(category.local_id, depth);

            let enqueue = depth + 1 <= self.settings.max_depth
                && normalize::same_site(&category.url, root)
                && !visited.contains(&category.url);
            if enqueue {
                visited.insert(category.url.clone());
                let mut ancestors = (**page_ancestors).clone();
                ancestors.insert(category.url.clone());
                next_level.push(FrontierEntry {
                    url: category.url.clone(),
                    base_depth: depth + 1,
                    parent_local_id: Some(category.local_id),
                    ancestors: Arc::new(ancestors),
                    strategy: child_strategy.clone(),
                    method: child_method.to_string(),
                });
            }

            categories.push(category);
        }

        next_level
    }

    async fn goto_with_retry(&self, page: &dyn BrowserPage, url: &str) -> Result<()> {
        let policy = RetryPolicy::fixed(self.settings.max_retries, self.settings.retry_delay_ms);
        retry(
            &policy,
            |e| matches!(e, Error::Navigation { .. } | Error::Timeout { .. }),
            || page.goto(url, WaitStrategy::DomContentLoaded),
        )
        .await
    }

    /// Extraction with backoff-and-reload on bot challenges. Terminal for
    /// the page on exhaustion; the caller decides whether the page was the
    /// root.
    async fn extract_with_bot_backoff(
        &self,
        page: &dyn BrowserPage,
        strategy: &Strategy,
        ctx: &PageContext<'_>,
        ids: &mut IdAllocator,
    ) -> Result<crate::extractor::PageExtraction> {
        let mut attempt = 0;
        loop {
            match self.extractor.extract(page, strategy, ctx, ids).await {
                Err(Error::BotDetection { url, signal }) if attempt < self.settings.max_retries => {
                    attempt += 1;
                    warn!(%url, %signal, attempt, "bot challenge, backing off before reload");
                    sleep(Duration::from_millis(self.settings.bot_backoff_ms)).await;
                    self.goto_with_retry(page, &ctx.page_url).await?;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::FixtureBrowser;
    use crate::browser::BrowserDriver;
    use crate::extractor::ExtractorSettings;
    use crate::strategy::{NavigationType, Selectors};
    use crate::validate::{validate_category, validate_hierarchy};
    use pretty_assertions::assert_eq;

    fn generic(selector: &str) -> Strategy {
        Strategy {
            navigation_type: NavigationType::GenericLinks,
            selectors: Selectors {
                category_link: Some(selector.to_string()),
                ..Selectors::default()
            },
            interactions: vec![],
            confidence: 0.9,
            notes: vec![],
            url_pattern: None,
        }
    }

    fn settings(max_depth: u32) -> DiscoverySettings {
        DiscoverySettings {
            max_depth,
            retry_delay_ms: 1,
            bot_backoff_ms: 1,
            ..DiscoverySettings::default()
        }
    }

    async fn run_discovery(
        browser: &FixtureBrowser,
        root: &str,
        strategy: &Strategy,
        settings: DiscoverySettings,
    ) -> Result<DiscoveryOutcome> {
        let page = browser.new_page().await.unwrap();
        let extractor = CategoryExtractor::new(ExtractorSettings {
            retry_delay_ms: 1,
            ..ExtractorSettings::default()
        });
        let discoverer = Discoverer::new(&extractor, None, settings);
        discoverer
            .discover(
                page.as_ref(),
                root,
                1,
                strategy,
                "llm",
                &CancellationToken::new(),
            )
            .await
    }

    fn two_level_site() -> FixtureBrowser {
        FixtureBrowser::new()
            .with_page(
                "http://fix.example/",
                r#"<nav>
                    <a href="/c/women">Women</a>
                    <a href="/c/men">Men</a>
                   </nav>"#,
            )
            .with_page(
                "http://fix.example/c/women",
                r#"<nav>
                    <a href="/c/women/dresses">Dresses</a>
                    <a href="/c/women/shoes">Shoes</a>
                   </nav>"#,
            )
            .with_page(
                "http://fix.example/c/men",
                r#"<nav><a href="/c/men/shirts">Shirts</a></nav>"#,
            )
            .with_page("http://fix.example/c/women/dresses", "<nav></nav>")
            .with_page("http://fix.example/c/women/shoes", "<nav></nav>")
            .with_page("http://fix.example/c/men/shirts", "<nav></nav>")
    }

    #[tokio::test]
    async fn walks_levels_and_links_parents() {
        let browser = two_level_site();
        let outcome = run_discovery(&browser, "http://fix.example/", &generic("nav a"), settings(5))
            .await
            .unwrap();

        assert_eq!(outcome.categories.len(), 5);
        assert_eq!(outcome.by_depth(), BTreeMap::from([(0, 2), (1, 3)]));

        let women = outcome
            .categories
            .iter()
            .find(|c| c.name == "Women")
            .unwrap();
        let dresses = outcome
            .categories
            .iter()
            .find(|c| c.name == "Dresses")
            .unwrap();
        assert_eq!(dresses.parent_local_id, Some(women.local_id));

        for category in &outcome.categories {
            validate_category(category).unwrap();
        }
        validate_hierarchy(&outcome.categories).unwrap();
    }

    #[tokio::test]
    async fn cycles_and_self_links_terminate() {
        let browser = FixtureBrowser::new()
            .with_page(
                "http://fix.example/",
                r#"<nav><a href="/a">Alpha</a></nav>"#,
            )
            .with_page(
                "http://fix.example/a",
                r#"<nav><a href="/b">Beta</a><a href="/">Home</a></nav>"#,
            )
            .with_page(
                "http://fix.example/b",
                r#"<nav><a href="/a">Alpha</a><a href="/">Home</a></nav>"#,
            );
        let outcome = run_discovery(&browser, "http://fix.example/", &generic("nav a"), settings(5))
            .await
            .unwrap();

        let urls: Vec<_> = outcome.categories.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["http://fix.example/a", "http://fix.example/b"]);

        // /a and /b each fetched exactly once.
        let gotos: Vec<_> = browser
            .actions()
            .into_iter()
            .filter(|a| a.starts_with("goto"))
            .collect();
        assert_eq!(gotos.len(), 3);
    }

    #[tokio::test]
    async fn max_depth_zero_keeps_only_root_level() {
        let browser = two_level_site();
        let outcome = run_discovery(&browser, "http://fix.example/", &generic("nav a"), settings(0))
            .await
            .unwrap();

        assert_eq!(outcome.by_depth(), BTreeMap::from([(0, 2)]));
        let gotos: Vec<_> = browser
            .actions()
            .into_iter()
            .filter(|a| a.starts_with("goto"))
            .collect();
        assert_eq!(gotos, vec!["goto http://fix.example/"]);
    }

    #[tokio::test]
    async fn max_categories_is_a_hard_stop() {
        let browser = two_level_site();
        let outcome = run_discovery(
            &browser,
            "http://fix.example/",
            &generic("nav a"),
            DiscoverySettings {
                max_categories: 2,
                ..settings(5)
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.categories.len(), 2);
    }

    #[tokio::test]
    async fn offsite_links_are_not_followed() {
        let browser = FixtureBrowser::new().with_page(
            "http://fix.example/",
            r#"<nav>
                <a href="http://fix.example/c/local">Local</a>
                <a href="https://other.example.net/c/away">Away</a>
               </nav>"#,
        )
        .with_page("http://fix.example/c/local", "<nav></nav>");
        let outcome = run_discovery(&browser, "http://fix.example/", &generic("nav a"), settings(5))
            .await
            .unwrap();

        // The offsite link is still a category, but never visited.
        assert_eq!(outcome.categories.len(), 2);
        assert!(!browser
            .actions()
            .iter()
            .any(|a| a.contains("other.example.net")));
    }

    #[tokio::test]
    async fn duplicate_across_menus_keeps_first_owner() {
        let browser = FixtureBrowser::new()
            .with_page(
                "http://fix.example/",
                r#"<nav><a href="/c/a">A</a><a href="/c/b">B</a></nav>"#,
            )
            .with_page(
                "http://fix.example/c/a",
                r#"<nav><a href="/c/shared">Shared</a></nav>"#,
            )
            .with_page(
                "http://fix.example/c/b",
                r#"<nav><a href="/c/shared">Shared Again</a></nav>"#,
            )
            .with_page("http://fix.example/c/shared", "<nav></nav>");
        let outcome = run_discovery(&browser, "http://fix.example/", &generic("nav a"), settings(5))
            .await
            .unwrap();

        let shared: Vec<_> = outcome
            .categories
            .iter()
            .filter(|c| c.url.ends_with("/c/shared"))
            .collect();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].name, "Shared");
        validate_hierarchy(&outcome.categories).unwrap();
    }

    #[tokio::test]
    async fn navigation_failure_on_child_is_skipped_and_recorded() {
        let browser = two_level_site().with_goto_failures("http://fix.example/c/men", 10);
        let outcome = run_discovery(
            &browser,
            "http://fix.example/",
            &generic("nav a"),
            DiscoverySettings {
                max_retries: 2,
                ..settings(5)
            },
        )
        .await
        .unwrap();

        assert!(outcome
            .edge_cases
            .iter()
            .any(|e| e.kind == "navigation_failed"));
        // Men is still a category; its subtree is simply missing.
        assert!(outcome.categories.iter().any(|c| c.name == "Men"));
        assert!(!outcome.categories.iter().any(|c| c.name == "Shirts"));
    }

    #[tokio::test]
    async fn root_navigation_failure_is_terminal() {
        let browser = two_level_site().with_goto_failures("http://fix.example/", 10);
        let err = run_discovery(
            &browser,
            "http://fix.example/",
            &generic("nav a"),
            DiscoverySettings {
                max_retries: 2,
                ..settings(5)
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Navigation { .. }));
    }

    #[tokio::test]
    async fn starving_strategy_is_overruled_by_the_probe() {
        use crate::analyzer::{AnalyzerSettings, PageAnalyzer};
        use crate::llm::testing::ScriptedModel;
        use std::sync::Arc as StdArc;

        let root_doc = r#"<html><body><nav><ul>
            <li><a href="/c/a">A</a></li><li><a href="/c/b">B</a></li>
            <li><a href="/c/c">C</a></li><li><a href="/c/d">D</a></li>
            <li><a href="/c/e">E</a></li><li><a href="/c/f">F</a></li>
            </ul></nav></body></html>"#;
        let mut browser = FixtureBrowser::new().with_page("http://fix.example/", root_doc);
        for leaf in ["a", "b", "c", "d", "e", "f"] {
            browser = browser.with_page(
                &format!("http://fix.example/c/{leaf}"),
                "<html><body></body></html>",
            );
        }

        let page = browser.new_page().await.unwrap();
        let extractor = CategoryExtractor::new(ExtractorSettings {
            retry_delay_ms: 1,
            ..ExtractorSettings::default()
        });
        let analyzer = PageAnalyzer::new(
            StdArc::new(ScriptedModel::new()),
            AnalyzerSettings::default(),
        );
        let discoverer = Discoverer::new(&extractor, Some(&analyzer), settings(5));

        // The model's selector matches nothing on this page.
        let outcome = discoverer
            .discover(
                page.as_ref(),
                "http://fix.example/",
                1,
                &generic(".mega-nav a"),
                "llm",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.categories.len(), 6);
        assert_eq!(outcome.extraction_method, "fallback");
        assert!(outcome
            .categories
            .iter()
            .all(|c| c.evidence.extraction_method.as_deref() == Some("fallback")));
    }

    #[tokio::test]
    async fn cancellation_stops_the_walk() {
        let browser = two_level_site();
        let page = browser.new_page().await.unwrap();
        let extractor = CategoryExtractor::new(ExtractorSettings::default());
        let discoverer = Discoverer::new(&extractor, None, settings(5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = discoverer
            .discover(
                page.as_ref(),
                "http://fix.example/",
                1,
                &generic("nav a"),
                "llm",
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
