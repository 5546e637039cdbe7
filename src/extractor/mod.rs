//! Strategy execution against a live page: harvest `(name, href)` pairs
//! with parent linkage, filter noise, and surface bot challenges.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, warn};
use url::Url;

use crate::browser::BrowserPage;
use crate::category::{Category, CategoryEvidence, IdAllocator};
use crate::error::{Error, Result};
use crate::normalize;
use crate::retry::{retry, RetryPolicy};
use crate::strategy::{InteractionAction, NavigationType, Strategy};
use crate::validate::looks_like_noise;

/// Challenge-page markers. Any of these present on a page with almost no
/// links means an anti-bot wall, not a shop.
const CHALLENGE_SELECTORS: &[&str] = &[
    "#challenge-form",
    "#cf-challenge-running",
    "#px-captcha",
    "iframe[src*='captcha']",
    "[class*='captcha']",
];

fn challenge_title_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)access denied|just a moment|attention required|verify you are|robot check|pardon our interruption",
        )
        .expect("static regex")
    })
}

/// Affordances that mark a sidebar item as expandable.
const EXPAND_AFFORDANCES: &str = "svg, .icon, .arrow, .chevron, [class*=expand]";

/// A page event worth recording into blueprints: a skipped item, a
/// timeout, a challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeCase {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub note: String,
}

impl EdgeCase {
    pub fn new(kind: &str, selector: Option<&str>, note: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            selector: selector.map(str::to_string),
            note: note.into(),
        }
    }
}

/// Everything the extractor needs to know about the page it is on.
pub struct PageContext<'a> {
    /// Canonical URL of the page being extracted.
    pub page_url: String,
    /// Parent for the page's top-level finds; `None` on a root page.
    pub parent_local_id: Option<u32>,
    /// Depth assigned to top-level finds on this page.
    pub base_depth: u32,
    pub retailer_id: i32,
    /// Canonical URLs of the page itself and its ancestors; links back to
    /// these are dropped.
    pub ancestors: &'a HashSet<String>,
    /// Evidence tag: "llm", "fallback" or "blueprint".
    pub method: &'a str,
}

/// Result of extracting one page.
#[derive(Debug, Default)]
pub struct PageExtraction {
    pub categories: Vec<Category>,
    pub edge_cases: Vec<EdgeCase>,
}

/// A link as harvested from the DOM, before filtering and id assignment.
/// `parent_slot` indexes an earlier entry of the same harvest.
#[derive(Debug)]
struct Harvested {
    name: String,
    href: String,
    selector: String,
    interaction: Option<String>,
    parent_slot: Option<usize>,
}

/// Tunables for strategy execution.
#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub wait_timeout_ms: u64,
    /// Bound on pagination clicks for grid pages.
    pub max_pages: u32,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
            wait_timeout_ms: 5_000,
            max_pages: 10,
        }
    }
}

/// Executes a `Strategy` against a live page.
pub struct CategoryExtractor {
    settings: ExtractorSettings,
}

impl CategoryExtractor {
    pub fn new(settings: ExtractorSettings) -> Self {
        Self { settings }
    }

    /// Run the strategy and return filtered categories plus recorded edge
    /// cases. Raises `BotDetection` before touching the navigation when
    /// the page is a challenge wall.
    pub async fn extract(
        &self,
        page: &dyn BrowserPage,
        strategy: &Strategy,
        ctx: &PageContext<'_>,
        ids: &mut IdAllocator,
    ) -> Result<PageExtraction> {
        if let Some(signal) = self.detect_bot(page).await? {
            return Err(Error::bot_detection(&ctx.page_url, signal));
        }

        let mut edge_cases = Vec::new();
        self.run_interactions(page, strategy, &mut edge_cases).await;

        let harvested = match strategy.navigation_type {
            NavigationType::HoverMenu => {
                self.harvest_hover(page, strategy, false, &mut edge_cases).await?
            }
            NavigationType::MegaMenu => {
                self.harvest_hover(page, strategy, true, &mut edge_cases).await?
            }
            NavigationType::Sidebar | NavigationType::Accordion => {
                self.harvest_sidebar(page, strategy, &mut edge_cases).await?
            }
            NavigationType::Grid => self.harvest_grid(page, strategy, &mut edge_cases).await?,
            NavigationType::Sitemap | NavigationType::GenericLinks => {
                self.harvest_links(page, strategy).await?
            }
        };

        let categories = self.finalize(harvested, ctx, ids)?;
        Ok(PageExtraction {
            categories,
            edge_cases,
        })
    }

    /// Challenge wall check: a matching title, or challenge markers on a
    /// page that is otherwise nearly empty of links.
    async fn detect_bot(&self, page: &dyn BrowserPage) -> Result<Option<String>> {
        let title = page.title().await.unwrap_or_default();
        if challenge_title_pattern().is_match(&title) {
            return Ok(Some(format!("challenge title: {title}")));
        }
        for selector in CHALLENGE_SELECTORS {
            if !page.query(selector).await?.is_empty() {
                let anchors = page.query("a[href]").await?.len();
                if anchors < 10 {
                    return Ok(Some(format!("challenge selector: {selector}")));
                }
            }
        }
        Ok(None)
    }

    fn action_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.settings.max_retries, self.settings.retry_delay_ms)
    }

    fn action_retryable(e: &Error) -> bool {
        matches!(
            e,
            Error::Extraction(_) | Error::Browser(_) | Error::Timeout { .. } | Error::Navigation { .. }
        )
    }

    /// Run the strategy's ordered interaction script. Failed steps are
    /// skipped and recorded; they never abort the page.
    async fn run_interactions(
        &self,
        page: &dyn BrowserPage,
        strategy: &Strategy,
        edge_cases: &mut Vec<EdgeCase>,
    ) {
        for step in &strategy.interactions {
            let target = strategy.resolve_target(&step.target).to_string();
            let policy = self.action_policy();
            let result = retry(&policy, Self::action_retryable, || async {
                match step.action {
                    InteractionAction::Hover => page.hover(&target, 0).await,
                    InteractionAction::Click | InteractionAction::RevealTrigger => {
                        page.click(&target, 0).await
                    }
                    InteractionAction::Scroll => page.scroll_to_bottom().await,
                    InteractionAction::Wait => {
                        if page.wait_for(&target, step.timeout_ms).await? {
                            Ok(())
                        } else {
                            Err(Error::timeout(step.timeout_ms))
                        }
                    }
                }
            })
            .await;

            match result {
                Ok(()) => {
                    if let Some(wait_selector) = &step.wait_for {
                        let resolved = strategy.resolve_target(wait_selector);
                        let appeared = page
                            .wait_for(resolved, step.timeout_ms)
                            .await
                            .unwrap_or(false);
                        if !appeared && !step.optional {
                            edge_cases.push(EdgeCase::new(
                                "wait_timeout",
                                Some(resolved),
                                format!("{:?} step target never appeared", step.action),
                            ));
                        }
                    }
                }
                Err(e) if step.optional => {
                    debug!(%target, error = %e, "optional step skipped");
                }
                Err(e) => {
                    edge_cases.push(EdgeCase::new(
                        "step_failed",
                        Some(&target),
                        e.to_string(),
                    ));
                }
            }
        }
    }

    /// Hover menus and mega menus: iterate top-level items, hover each,
    /// wait for its flyout, collect the item's own link and the flyout's
    /// anchors. With `columns`, anchors matching the heading selector
    /// parent the anchors that follow them in document order.
    async fn harvest_hover(
        &self,
        page: &dyn BrowserPage,
        strategy: &Strategy,
        columns: bool,
        edge_cases: &mut Vec<EdgeCase>,
    ) -> Result<Vec<Harvested>> {
        let items_sel = strategy
            .selectors
            .top_level_items
            .as_deref()
            .ok_or_else(|| Error::Extraction("hover menu without top_level_items".into()))?
            .to_string();
        let link_sel = strategy
            .selectors
            .top_level_link
            .as_deref()
            .unwrap_or("a")
            .to_string();
        let flyout_sel = strategy.selectors.flyout_panel.clone();
        let sub_sel = strategy
            .selectors
            .subcategory_items
            .clone()
            .or_else(|| strategy.selectors.subcategory_link.clone());
        let heading_sel = strategy
            .selectors
            .category_name
            .clone()
            .unwrap_or_else(|| "h3 a, h4 a".to_string());

        let item_count = page.query(&items_sel).await?.len();
        let mut harvested = Vec::new();

        for index in 0..item_count {
            let policy = self.action_policy();
            let hover = retry(&policy, Self::action_retryable, || {
                page.hover(&items_sel, index)
            })
            .await;
            if let Err(e) = hover {
                edge_cases.push(EdgeCase::new(
                    "hover_failed",
                    Some(&items_sel),
                    format!("item {index}: {e}"),
                ));
                continue;
            }

            let mut flyout_open = true;
            if let Some(flyout) = &flyout_sel {
                flyout_open = page
                    .wait_for(flyout, self.settings.wait_timeout_ms)
                    .await
                    .unwrap_or(false);
                if !flyout_open {
                    edge_cases.push(EdgeCase::new(
                        "flyout_timeout",
                        Some(flyout),
                        format!("item {index} flyout never appeared"),
                    ));
                }
            }

            // A racing DOM may drop the item between queries; treat that
            // as no match rather than aborting the page.
            let top_slot = page
                .query_within(&items_sel, index, &link_sel)
                .await
                .unwrap_or_default()
                .into_iter()
                .find(|e| e.href.is_some())
                .map(|link| {
                    harvested.push(Harvested {
                        name: link.text.clone(),
                        href: link.href.clone().unwrap_or_default(),
                        selector: items_sel.clone(),
                        interaction: Some(format!("hover#{index}")),
                        parent_slot: None,
                    });
                    harvested.len() - 1
                });

            if flyout_open {
                let inner = match (&flyout_sel, &sub_sel) {
                    (Some(flyout), Some(sub)) => format!("{flyout} {sub}"),
                    (Some(flyout), None) => format!("{flyout} a"),
                    (None, Some(sub)) => sub.clone(),
                    (None, None) => "a".to_string(),
                };
                let anchors = page
                    .query_within(&items_sel, index, &inner)
                    .await
                    .unwrap_or_default();
                let headings: HashSet<String> = if columns {
                    let scoped = match &flyout_sel {
                        Some(flyout) => format!("{flyout} {heading_sel}"),
                        None => heading_sel.clone(),
                    };
                    page.query_within(&items_sel, index, &scoped)
                        .await
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|h| h.href)
                        .collect()
                } else {
                    HashSet::new()
                };

                let mut column_parent = top_slot;
                for anchor in anchors {
                    let Some(href) = anchor.href.clone() else {
                        continue;
                    };
                    let is_heading = columns && headings.contains(&href);
                    harvested.push(Harvested {
                        name: anchor.text,
                        href,
                        selector: inner.clone(),
                        interaction: Some(format!("hover#{index} > flyout")),
                        parent_slot: if is_heading { top_slot } else { column_parent },
                    });
                    if is_heading {
                        column_parent = Some(harvested.len() - 1);
                    }
                }
            }

            // Dismiss the flyout before the next item.
            let _ = page.move_mouse(0.0, 0.0).await;
        }

        Ok(harvested)
    }

    /// Sidebars and accordions: items with an expand affordance are
    /// clicked open, their children collected, then clicked shut.
    async fn harvest_sidebar(
        &self,
        page: &dyn BrowserPage,
        strategy: &Strategy,
        edge_cases: &mut Vec<EdgeCase>,
    ) -> Result<Vec<Harvested>> {
        let items_sel = strategy
            .selectors
            .top_level_items
            .as_deref()
            .ok_or_else(|| Error::Extraction("sidebar without top_level_items".into()))?
            .to_string();
        let link_sel = strategy
            .selectors
            .top_level_link
            .as_deref()
            .unwrap_or("a")
            .to_string();
        let sub_sel = strategy
            .selectors
            .subcategory_items
            .clone()
            .or_else(|| strategy.selectors.subcategory_link.clone())
            .unwrap_or_else(|| "ul a, .children a, .submenu a".to_string());
        let expand_sel = match &strategy.selectors.expand_toggle {
            Some(toggle) => format!("{EXPAND_AFFORDANCES}, {toggle}"),
            None => EXPAND_AFFORDANCES.to_string(),
        };

        if let Some(show_more) = &strategy.selectors.show_more_button {
            if !page.query(show_more).await?.is_empty() {
                let _ = page.click(show_more, 0).await;
            }
        }

        let item_count = page.query(&items_sel).await?.len();
        let mut harvested = Vec::new();

        for index in 0..item_count {
            let top_slot = page
                .query_within(&items_sel, index, &link_sel)
                .await
                .unwrap_or_default()
                .into_iter()
                .find(|e| e.href.is_some())
                .map(|link| {
                    harvested.push(Harvested {
                        name: link.text.clone(),
                        href: link.href.clone().unwrap_or_default(),
                        selector: items_sel.clone(),
                        interaction: None,
                        parent_slot: None,
                    });
                    harvested.len() - 1
                });

            let expandable = !page
                .query_within(&items_sel, index, &expand_sel)
                .await
                .unwrap_or_default()
                .is_empty();
            if !expandable {
                continue;
            }

            let policy = self.action_policy();
            let opened = retry(&policy, Self::action_retryable, || {
                page.click(&items_sel, index)
            })
            .await;
            if let Err(e) = opened {
                edge_cases.push(EdgeCase::new(
                    "expand_failed",
                    Some(&items_sel),
                    format!("item {index}: {e}"),
                ));
                continue;
            }

            for anchor in page
                .query_within(&items_sel, index, &sub_sel)
                .await
                .unwrap_or_default()
            {
                let Some(href) = anchor.href.clone() else {
                    continue;
                };
                harvested.push(Harvested {
                    name: anchor.text,
                    href,
                    selector: sub_sel.clone(),
                    interaction: Some(format!("expand#{index}")),
                    parent_slot: top_slot,
                });
            }

            // Collapse so later indices stay stable.
            let _ = page.click(&items_sel, index).await;
        }

        Ok(harvested)
    }

    /// Card grids: one category per card, paginating while a next button
    /// keeps producing fresh cards.
    async fn harvest_grid(
        &self,
        page: &dyn BrowserPage,
        strategy: &Strategy,
        edge_cases: &mut Vec<EdgeCase>,
    ) -> Result<Vec<Harvested>> {
        let card_sel = strategy
            .selectors
            .category_card
            .as_deref()
            .ok_or_else(|| Error::Extraction("grid without category_card".into()))?
            .to_string();
        let name_sel = strategy.selectors.category_name.clone();
        let link_sel = strategy
            .selectors
            .category_link
            .as_deref()
            .unwrap_or("a")
            .to_string();

        let mut harvested: Vec<Harvested> = Vec::new();
        let mut seen_hrefs = HashSet::new();

        for page_no in 0..self.settings.max_pages {
            let card_count = page.query(&card_sel).await?.len();
            let mut fresh = 0usize;

            for index in 0..card_count {
                let Some(link) = page
                    .query_within(&card_sel, index, &link_sel)
                    .await
                    .unwrap_or_default()
                    .into_iter()
                    .find(|e| e.href.is_some())
                else {
                    continue;
                };
                let href = link.href.clone().unwrap_or_default();
                if !seen_hrefs.insert(href.clone()) {
                    continue;
                }
                let name = match &name_sel {
                    Some(sel) => page
                        .query_within(&card_sel, index, sel)
                        .await
                        .unwrap_or_default()
                        .first()
                        .map(|n| n.text.clone())
                        .unwrap_or(link.text.clone()),
                    None => link.text.clone(),
                };
                harvested.push(Harvested {
                    name,
                    href,
                    selector: card_sel.clone(),
                    interaction: (page_no > 0).then(|| format!("page#{page_no}")),
                    parent_slot: None,
                });
                fresh += 1;
            }

            let Some(next_sel) = strategy.selectors.pagination_next.as_deref() else {
                break;
            };
            if fresh == 0 || page.query(next_sel).await?.is_empty() {
                break;
            }
            if let Err(e) = page.click(next_sel, 0).await {
                edge_cases.push(EdgeCase::new("pagination_failed", Some(next_sel), e.to_string()));
                break;
            }
        }

        Ok(harvested)
    }

    /// Sitemaps and generic link scans: one query, one category per
    /// anchor.
    async fn harvest_links(
        &self,
        page: &dyn BrowserPage,
        strategy: &Strategy,
    ) -> Result<Vec<Harvested>> {
        let link_sel = strategy
            .selectors
            .category_link
            .as_deref()
            .ok_or_else(|| Error::Extraction("link scan without category_link".into()))?
            .to_string();

        Ok(page
            .query(&link_sel)
            .await?
            .into_iter()
            .filter_map(|anchor| {
                anchor.href.clone().map(|href| Harvested {
                    name: anchor.text,
                    href,
                    selector: link_sel.clone(),
                    interaction: None,
                    parent_slot: None,
                })
            })
            .collect())
    }

    /// Trim, resolve, filter and number the harvest. Children whose
    /// parent was filtered away reattach at the page's base depth.
    fn finalize(
        &self,
        harvested: Vec<Harvested>,
        ctx: &PageContext<'_>,
        ids: &mut IdAllocator,
    ) -> Result<Vec<Category>> {
        let base = Url::parse(&ctx.page_url)
            .map_err(|e| Error::Extraction(format!("unparsable page URL {}: {e}", ctx.page_url)))?;

        let mut slot_results: Vec<Option<(u32, u32)>> = vec![None; harvested.len()];
        let mut seen: HashSet<String> = HashSet::new();
        let mut categories = Vec::new();

        for (slot, entry) in harvested.iter().enumerate() {
            let name = entry.name.split_whitespace().collect::<Vec<_>>().join(" ");
            if name.is_empty() || looks_like_noise(&name) {
                continue;
            }
            let Some(url) = normalize::normalize_link(&entry.href, &base) else {
                continue;
            };
            if ctx.ancestors.contains(&url) || !seen.insert(url.clone()) {
                continue;
            }

            let (parent_local_id, depth) = match entry.parent_slot.and_then(|s| slot_results[s]) {
                Some((parent_id, parent_depth)) => (Some(parent_id), parent_depth + 1),
                None => (ctx.parent_local_id, ctx.base_depth),
            };

            let local_id = ids.next();
            slot_results[slot] = Some((local_id, depth));
            categories.push(
                Category::new(
                    local_id,
                    name,
                    url,
                    entry.href.clone(),
                    depth,
                    parent_local_id,
                    ctx.retailer_id,
                )
                .with_evidence(CategoryEvidence {
                    anchor_text: Some(entry.name.clone()),
                    selector: Some(entry.selector.clone()),
                    interaction: entry.interaction.clone(),
                    extraction_method: Some(ctx.method.to_string()),
                }),
            );
        }

        if categories.is_empty() {
            warn!(url = %ctx.page_url, "page yielded no categories");
        }
        Ok(categories)
    }
}
