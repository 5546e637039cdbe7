//! Offline browser implementation over static HTML fixtures.
//!
//! Parses registered documents with `scraper` and answers the same
//! capability surface as the CDP adapter. Hidden panels are modelled by
//! registering a replacement document against the selector whose click
//! reveals them. Deterministic and network-free.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scraper::{Html, Selector};

use crate::error::{Error, Result};
use crate::normalize;

use super::{BrowserDriver, BrowserPage, ElementInfo, WaitStrategy};

#[derive(Default)]
struct PageState {
    url: String,
    html: String,
    applied_reveals: HashSet<String>,
    actions: Vec<String>,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<String, String>,
    reveals: HashMap<String, String>,
    goto_failures: Mutex<HashMap<String, u32>>,
    state: Mutex<PageState>,
    closed_pages: Mutex<u32>,
}

/// A scripted site: URL-keyed documents plus click-revealed variants.
#[derive(Clone, Default)]
pub struct FixtureBrowser {
    inner: Arc<Inner>,
}

impl FixtureBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document under its canonical URL.
    pub fn with_page(mut self, url: &str, html: &str) -> Self {
        let key = normalize::normalize_url(url).unwrap_or_else(|| url.to_string());
        Arc::get_mut(&mut self.inner)
            .expect("configure the fixture before opening pages")
            .docs
            .insert(key, html.to_string());
        self
    }

    /// Replace the whole document when `selector` is clicked.
    pub fn with_reveal(mut self, selector: &str, html: &str) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("configure the fixture before opening pages")
            .reveals
            .insert(selector.to_string(), html.to_string());
        self
    }

    /// Make the next `count` navigations to `url` fail.
    pub fn with_goto_failures(self, url: &str, count: u32) -> Self {
        let key = normalize::normalize_url(url).unwrap_or_else(|| url.to_string());
        self.inner.goto_failures.lock().unwrap().insert(key, count);
        self
    }

    /// Recorded interactions, for assertions.
    pub fn actions(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().actions.clone()
    }

    /// How many pages have been closed.
    pub fn closed_pages(&self) -> u32 {
        *self.inner.closed_pages.lock().unwrap()
    }
}

#[async_trait]
impl BrowserDriver for FixtureBrowser {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>> {
        Ok(Box::new(FixturePage {
            inner: self.inner.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One fixture page; shares the site state with its driver.
pub struct FixturePage {
    inner: Arc<Inner>,
}

impl FixturePage {
    fn record(&self, action: String) {
        self.inner.state.lock().unwrap().actions.push(action);
    }

    fn current_html(&self) -> String {
        self.inner.state.lock().unwrap().html.clone()
    }

    fn select_infos(html: &str, selector: &str) -> Vec<ElementInfo> {
        let Ok(parsed) = Selector::parse(selector) else {
            // Unsupported selector syntax matches nothing, like a browser
            // would for an unknown pseudo-class.
            return Vec::new();
        };
        let doc = Html::parse_document(html);
        doc.select(&parsed)
            .enumerate()
            .map(|(index, el)| Self::info_of(index, &el))
            .collect()
    }

    fn info_of(index: usize, el: &scraper::ElementRef<'_>) -> ElementInfo {
        let text = el
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let mut attrs = HashMap::new();
        for name in ["href", "class", "id", "aria-label"] {
            if let Some(value) = el.value().attr(name) {
                attrs.insert(name.to_string(), value.to_string());
            }
        }
        let href = attrs.get("href").cloned();
        ElementInfo {
            index,
            text,
            href,
            attrs,
        }
    }
}

#[async_trait]
impl BrowserPage for FixturePage {
    async fn goto(&self, url: &str, _wait: WaitStrategy) -> Result<()> {
        let key = normalize::normalize_url(url).unwrap_or_else(|| url.to_string());

        {
            let mut failures = self.inner.goto_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::navigation(url, "scripted navigation failure"));
                }
            }
        }

        let html = self
            .inner
            .docs
            .get(&key)
            .ok_or_else(|| Error::navigation(url, "no fixture document registered"))?
            .clone();

        let mut state = self.inner.state.lock().unwrap();
        state.url = key.clone();
        state.html = html;
        state.applied_reveals.clear();
        state.actions.push(format!("goto {key}"));
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.inner.state.lock().unwrap().url.clone())
    }

    async fn title(&self) -> Result<String> {
        let html = self.current_html();
        let title = Self::select_infos(&html, "title")
            .first()
            .map(|t| t.text.clone())
            .unwrap_or_default();
        Ok(title)
    }

    async fn query(&self, selector: &str) -> Result<Vec<ElementInfo>> {
        Ok(Self::select_infos(&self.current_html(), selector))
    }

    async fn query_within(
        &self,
        outer: &str,
        index: usize,
        inner: &str,
    ) -> Result<Vec<ElementInfo>> {
        let html = self.current_html();
        let Ok(outer_sel) = Selector::parse(outer) else {
            return Ok(Vec::new());
        };
        let Ok(inner_sel) = Selector::parse(inner) else {
            return Ok(Vec::new());
        };
        let doc = Html::parse_document(&html);
        let Some(element) = doc.select(&outer_sel).nth(index) else {
            return Err(Error::Extraction(format!(
                "selector '{outer}' has no match at index {index}"
            )));
        };
        Ok(element
            .select(&inner_sel)
            .enumerate()
            .map(|(i, el)| Self::info_of(i, &el))
            .collect())
    }

    async fn hover(&self, selector: &str, index: usize) -> Result<()> {
        self.record(format!("hover {selector}#{index}"));
        Ok(())
    }

    async fn click(&self, selector: &str, index: usize) -> Result<()> {
        self.record(format!("click {selector}#{index}"));
        let keyed = format!("{selector}#{index}");
        let reveal = {
            let reveals = &self.inner.reveals;
            reveals
                .get(&keyed)
                .or_else(|| reveals.get(selector))
                .cloned()
        };
        if let Some(html) = reveal {
            let mut state = self.inner.state.lock().unwrap();
            if state.applied_reveals.insert(keyed) {
                state.html = html;
            }
        }
        Ok(())
    }

    async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        self.record(format!("move_mouse {x},{y}"));
        Ok(())
    }

    async fn scroll_to_bottom(&self) -> Result<()> {
        self.record("scroll_to_bottom".to_string());
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(b"\x89PNG-fixture".to_vec())
    }

    async fn dom_snapshot(&self, max_bytes: usize) -> Result<String> {
        let mut html = self.current_html();
        if html.len() > max_bytes {
            let mut cut = max_bytes;
            while cut > 0 && !html.is_char_boundary(cut) {
                cut -= 1;
            }
            html.truncate(cut);
        }
        Ok(html)
    }

    async fn wait_for(&self, selector: &str, _timeout_ms: u64) -> Result<bool> {
        Ok(!Self::select_infos(&self.current_html(), selector).is_empty())
    }

    async fn close(&self) -> Result<()> {
        *self.inner.closed_pages.lock().unwrap() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOC: &str = r#"
        <html><head><title>Fixture Shop</title></head><body>
        <nav><ul>
          <li class="item"><a href="/c/shoes">Shoes</a>
            <div class="flyout"><a href="/c/shoes/boots">Boots</a></div></li>
          <li class="item"><a href="/c/bags">Bags</a></li>
        </ul></nav>
        </body></html>"#;

    fn browser() -> FixtureBrowser {
        FixtureBrowser::new().with_page("http://fix.example/", DOC)
    }

    #[tokio::test]
    async fn goto_and_query() {
        let browser = browser();
        let page = browser.new_page().await.unwrap();
        page.goto("http://fix.example/", WaitStrategy::DomContentLoaded)
            .await
            .unwrap();

        assert_eq!(page.title().await.unwrap(), "Fixture Shop");
        let items = page.query("nav li.item").await.unwrap();
        assert_eq!(items.len(), 2);

        let links = page.query_within("nav li.item", 0, ".flyout a").await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].text, "Boots");
        assert_eq!(links[0].href.as_deref(), Some("/c/shoes/boots"));
    }

    #[tokio::test]
    async fn unknown_url_is_a_navigation_error() {
        let browser = browser();
        let page = browser.new_page().await.unwrap();
        let err = page
            .goto("http://elsewhere.example/", WaitStrategy::Load)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Navigation { .. }));
    }

    #[tokio::test]
    async fn click_reveal_swaps_document() {
        let browser = FixtureBrowser::new()
            .with_page("http://fix.example/", "<button aria-label='menu'>Menu</button>")
            .with_reveal(
                "button[aria-label='menu']",
                "<aside><a href='/c/a'>A</a></aside>",
            );
        let page = browser.new_page().await.unwrap();
        page.goto("http://fix.example/", WaitStrategy::DomContentLoaded)
            .await
            .unwrap();

        assert!(page.query("aside a").await.unwrap().is_empty());
        page.click("button[aria-label='menu']", 0).await.unwrap();
        assert_eq!(page.query("aside a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scripted_goto_failures_then_success() {
        let browser = browser().with_goto_failures("http://fix.example/", 2);
        let page = browser.new_page().await.unwrap();
        assert!(page
            .goto("http://fix.example/", WaitStrategy::Load)
            .await
            .is_err());
        assert!(page
            .goto("http://fix.example/", WaitStrategy::Load)
            .await
            .is_err());
        page.goto("http://fix.example/", WaitStrategy::Load)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unsupported_selector_matches_nothing() {
        let browser = browser();
        let page = browser.new_page().await.unwrap();
        page.goto("http://fix.example/", WaitStrategy::Load)
            .await
            .unwrap();
        assert!(page
            .query("button:has-text('Accept')")
            .await
            .unwrap()
            .is_empty());
    }
}
