//! Page analysis: turn a live page into an extraction `Strategy` using a
//! vision-capable model, with a heuristic probe as a safety net.

mod prompts;

use std::sync::Arc;

use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::browser::BrowserPage;
use crate::error::{Error, Result};
use crate::llm::{VisionModel, VisionRequest};
use crate::strategy::{NavigationType, Selectors, Strategy};

pub use prompts::{analysis_prompt, reprompt_with_missing};

/// Best-effort cookie-banner dismissal targets, tried in order.
const COOKIE_SELECTORS: &[&str] = &[
    "button:has-text('Accept')",
    "button:has-text('Allow Cookies')",
    "[id*=cookie] button",
    "[class*=consent] button",
    "#onetrust-accept-btn-handler",
];

/// Best-effort hidden-nav reveal triggers.
const REVEAL_SELECTORS: &[&str] = &[
    "button:has-text('Shop by Products')",
    "button:has-text('Menu')",
    "[aria-label*='menu' i]",
];

/// Class/id tokens that mark navigation-relevant subtrees for pruning.
const NAV_TOKENS: &[&str] = &["menu", "category", "nav", "drawer", "sidebar"];

/// Selector battery for the heuristic probe.
const PROBE_PATTERNS: &[(&str, &str)] = &[
    ("top nav lists", "nav ul li a"),
    ("header nav", "header nav a"),
    ("sidebar links", "aside a"),
    ("category cards", "[class*=category] a"),
    ("menu drawers", "[class*=menu] a"),
];

/// Tunables for the analyzer, taken from the run configuration.
#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub dom_cap_bytes: usize,
    pub temperature: f64,
    pub wait_timeout_ms: u64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            dom_cap_bytes: 48 * 1024,
            temperature: 0.0,
            wait_timeout_ms: 30_000,
        }
    }
}

/// Produces an extraction `Strategy` for a page.
pub struct PageAnalyzer {
    model: Arc<dyn VisionModel>,
    settings: AnalyzerSettings,
}

impl PageAnalyzer {
    pub fn new(model: Arc<dyn VisionModel>, settings: AnalyzerSettings) -> Self {
        Self { model, settings }
    }

    /// Analyze a page already navigated to `url` and produce a strategy.
    /// Falls back to `generic_links` when the model cannot be coaxed into
    /// a usable plan.
    pub async fn analyze(&self, page: &dyn BrowserPage, url: &str) -> Result<Strategy> {
        self.prepare_entry(page).await;

        let screenshot = page.screenshot().await.ok();
        let raw_dom = page.dom_snapshot(self.settings.dom_cap_bytes * 4).await?;
        let pruned = prune_dom(&raw_dom, self.settings.dom_cap_bytes);

        let prompt = analysis_prompt(url, &pruned);
        match self.request_strategy(&prompt, screenshot.clone()).await {
            Ok(strategy) => {
                let missing = strategy.missing_required();
                if missing.is_empty() {
                    info!(
                        navigation_type = %strategy.navigation_type,
                        confidence = strategy.confidence,
                        "strategy accepted"
                    );
                    return Ok(strategy);
                }
                warn!(?missing, "strategy is missing required selectors, re-prompting");
                let strict = reprompt_with_missing(&prompt, &missing);
                if let Ok(second) = self.request_strategy(&strict, screenshot).await {
                    if second.missing_required().is_empty() {
                        return Ok(second);
                    }
                }
            }
            Err(e) => warn!(error = %e, "analysis call failed"),
        }

        warn!(url, "falling back to generic link scan");
        Ok(Strategy::generic_links())
    }

    /// Dismiss cookie banners and reveal hidden navigation; every step is
    /// best-effort and failures are ignored.
    pub async fn prepare_entry(&self, page: &dyn BrowserPage) {
        for selector in COOKIE_SELECTORS {
            if let Ok(found) = page.query(selector).await {
                if !found.is_empty() && page.click(selector, 0).await.is_ok() {
                    debug!(selector, "dismissed cookie banner");
                    break;
                }
            }
        }
        for selector in REVEAL_SELECTORS {
            if let Ok(found) = page.query(selector).await {
                if !found.is_empty() && page.click(selector, 0).await.is_ok() {
                    debug!(selector, "clicked nav reveal trigger");
                    break;
                }
            }
        }
    }

    /// Count-based probe over common navigation patterns. Returns the
    /// best-scoring pattern as a low-confidence strategy.
    pub async fn probe(&self, page: &dyn BrowserPage) -> Result<Option<(Strategy, usize)>> {
        let mut best: Option<(&str, &str, usize)> = None;
        for (label, selector) in PROBE_PATTERNS {
            let count = page
                .query(selector)
                .await?
                .iter()
                .filter(|e| e.href.is_some())
                .count();
            if count > best.map(|(_, _, n)| n).unwrap_or(0) {
                best = Some((label, selector, count));
            }
        }
        Ok(best.map(|(label, selector, count)| {
            let strategy = Strategy {
                navigation_type: NavigationType::GenericLinks,
                selectors: Selectors {
                    category_link: Some(selector.to_string()),
                    ..Selectors::default()
                },
                interactions: Vec::new(),
                confidence: 0.3,
                notes: vec![format!("heuristic probe: {label} ({count} anchors)")],
                url_pattern: None,
            };
            (strategy, count)
        }))
    }

    async fn request_strategy(&self, prompt: &str, image: Option<Vec<u8>>) -> Result<Strategy> {
        let mut request =
            VisionRequest::new(prompt).with_temperature(self.settings.temperature);
        if let Some(png) = image {
            request = request.with_image(png);
        }
        let value = self.model.analyze(request).await?;
        parse_strategy(value)
    }
}

/// Interpret the model's JSON as a strategy. Tolerates a wrapping
/// `strategy` key; clamps confidence into [0, 1].
pub fn parse_strategy(value: Value) -> Result<Strategy> {
    let body = match value.get("strategy") {
        Some(inner) => inner.clone(),
        None => value,
    };
    let mut strategy: Strategy = serde_json::from_value(body)
        .map_err(|e| Error::Analysis(format!("strategy JSON did not match the schema: {e}")))?;
    strategy.confidence = strategy.confidence.clamp(0.0, 1.0);
    Ok(strategy)
}

/// Reduce a DOM snapshot to its navigation-relevant subtrees: the first
/// `<nav>`, `<header>` and `<aside>`, plus elements whose class/id tokens
/// look navigational, truncated to `max_bytes`.
pub fn prune_dom(html: &str, max_bytes: usize) -> String {
    let doc = Html::parse_document(html);
    let mut parts: Vec<String> = Vec::new();

    for tag in ["nav", "header", "aside"] {
        if let Ok(selector) = Selector::parse(tag) {
            if let Some(el) = doc.select(&selector).next() {
                parts.push(el.html());
            }
        }
    }

    if let Ok(all) = Selector::parse("[class], [id]") {
        for el in doc.select(&all) {
            let tokens = el
                .value()
                .attr("class")
                .into_iter()
                .chain(el.value().attr("id"))
                .flat_map(|v| v.split(|c: char| !c.is_ascii_alphanumeric()))
                .map(str::to_ascii_lowercase)
                .collect::<Vec<_>>();
            if tokens
                .iter()
                .any(|t| NAV_TOKENS.iter().any(|n| t.contains(n)))
            {
                parts.push(el.html());
                if parts.len() > 16 {
                    break;
                }
            }
        }
    }

    let mut joined = parts.join("\n");
    if joined.is_empty() {
        joined = html.to_string();
    }
    if joined.len() > max_bytes {
        let mut cut = max_bytes;
        while cut > 0 && !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        joined.truncate(cut);
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::FixtureBrowser;
    use crate::browser::{BrowserDriver, WaitStrategy};
    use crate::llm::testing::ScriptedModel;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const GRID_DOC: &str = r#"
        <html><body>
        <div class="category-grid">
          <div class="card"><h3>Shoes</h3><a href="/c/shoes">shop</a></div>
          <div class="card"><h3>Bags</h3><a href="/c/bags">shop</a></div>
        </div>
        </body></html>"#;

    fn grid_strategy_json() -> serde_json::Value {
        json!({
            "navigation_type": "grid",
            "selectors": {
                "category_card": ".card",
                "category_name": "h3",
                "category_link": "a"
            },
            "confidence": 0.85,
            "notes": ["card grid on the landing page"]
        })
    }

    #[tokio::test]
    async fn accepts_a_valid_strategy() {
        let browser = FixtureBrowser::new().with_page("http://fix.example/", GRID_DOC);
        let page = browser.new_page().await.unwrap();
        page.goto("http://fix.example/", WaitStrategy::Load)
            .await
            .unwrap();

        let model = Arc::new(
            ScriptedModel::new().with_response("http://fix.example/", grid_strategy_json()),
        );
        let analyzer = PageAnalyzer::new(model, AnalyzerSettings::default());
        let strategy = analyzer.analyze(page.as_ref(), "http://fix.example/").await.unwrap();

        assert_eq!(strategy.navigation_type, NavigationType::Grid);
        assert_eq!(strategy.selectors.category_card.as_deref(), Some(".card"));
        assert_eq!(strategy.confidence, 0.85);
    }

    #[tokio::test]
    async fn reprompts_once_then_falls_back() {
        let browser = FixtureBrowser::new().with_page("http://fix.example/", GRID_DOC);
        let page = browser.new_page().await.unwrap();
        page.goto("http://fix.example/", WaitStrategy::Load)
            .await
            .unwrap();

        // Both responses miss required selectors for hover_menu.
        let bad = json!({"navigation_type": "hover_menu", "selectors": {}});
        let model = Arc::new(
            ScriptedModel::new()
                .with_response("http://fix.example/", bad.clone())
                .with_fallback(bad),
        );
        let analyzer = PageAnalyzer::new(model.clone(), AnalyzerSettings::default());
        let strategy = analyzer.analyze(page.as_ref(), "http://fix.example/").await.unwrap();

        assert_eq!(strategy.navigation_type, NavigationType::GenericLinks);
        assert!(strategy.confidence <= 0.2);
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn contract_failure_falls_back_to_generic_links() {
        let browser = FixtureBrowser::new().with_page("http://fix.example/", GRID_DOC);
        let page = browser.new_page().await.unwrap();
        page.goto("http://fix.example/", WaitStrategy::Load)
            .await
            .unwrap();

        let model = Arc::new(ScriptedModel::new()); // no responses at all
        let analyzer = PageAnalyzer::new(model, AnalyzerSettings::default());
        let strategy = analyzer.analyze(page.as_ref(), "http://fix.example/").await.unwrap();
        assert_eq!(strategy.navigation_type, NavigationType::GenericLinks);
    }

    #[tokio::test]
    async fn probe_counts_anchor_patterns() {
        let doc = r#"<html><body><nav><ul>
            <li><a href="/a">A</a></li><li><a href="/b">B</a></li>
            <li><a href="/c">C</a></li></ul></nav></body></html>"#;
        let browser = FixtureBrowser::new().with_page("http://fix.example/", doc);
        let page = browser.new_page().await.unwrap();
        page.goto("http://fix.example/", WaitStrategy::Load)
            .await
            .unwrap();

        let analyzer = PageAnalyzer::new(
            Arc::new(ScriptedModel::new()),
            AnalyzerSettings::default(),
        );
        let (strategy, count) = analyzer.probe(page.as_ref()).await.unwrap().unwrap();
        assert_eq!(count, 3);
        assert_eq!(strategy.navigation_type, NavigationType::GenericLinks);
    }

    #[test]
    fn prune_keeps_nav_subtrees() {
        let html = r#"<html><body>
            <nav><a href="/c/a">A</a></nav>
            <div class="mega-menu"><a href="/c/b">B</a></div>
            <footer><p>legal text that should not survive</p></footer>
            </body></html>"#;
        let pruned = prune_dom(html, 48 * 1024);
        assert!(pruned.contains("/c/a"));
        assert!(pruned.contains("mega-menu"));
        assert!(!pruned.contains("legal text"));
    }

    #[test]
    fn prune_respects_byte_cap() {
        let big = format!("<nav>{}</nav>", "<a href='/x'>x</a>".repeat(5_000));
        let pruned = prune_dom(&big, 1_000);
        assert!(pruned.len() <= 1_000);
    }

    #[test]
    fn strategy_parsing_tolerates_wrapper_and_clamps() {
        let value = json!({"strategy": {"navigation_type": "grid", "confidence": 3.5}});
        let strategy = parse_strategy(value).unwrap();
        assert_eq!(strategy.navigation_type, NavigationType::Grid);
        assert_eq!(strategy.confidence, 1.0);

        assert!(parse_strategy(json!({"navigation_type": "carousel"})).is_err());
    }
}
