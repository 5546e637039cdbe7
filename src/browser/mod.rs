//! Browser capability: a thin async surface over a stealth-configured
//! driver, with a production CDP implementation and an offline fixture
//! implementation for tests.

pub mod chromium;
pub mod fixture;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

/// Wait condition for navigation. Network-idle is deliberately absent:
/// retail sites keep analytics sockets open indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    DomContentLoaded,
    Load,
}

/// A snapshot of one matched element: enough for link harvesting without
/// holding live handles across await points.
#[derive(Debug, Clone, Default)]
pub struct ElementInfo {
    /// Position within the query result, used to re-address the element
    /// for hover/click.
    pub index: usize,
    /// Inner text, whitespace-collapsed.
    pub text: String,
    pub href: Option<String>,
    pub attrs: HashMap<String, String>,
}

impl ElementInfo {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn classes(&self) -> Vec<&str> {
        self.attr("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default()
    }
}

/// One live page. Owned exclusively by the current extractor invocation;
/// element addressing is (selector, index) against the page's current
/// state.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Navigate. Implementations prefer a DOM-content wait and fall back
    /// to a full load wait on the first timeout.
    async fn goto(&self, url: &str, wait: WaitStrategy) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    /// All elements matching `selector`, in document order.
    async fn query(&self, selector: &str) -> Result<Vec<ElementInfo>>;

    /// Elements matching `inner` inside the `index`-th match of `outer`.
    async fn query_within(
        &self,
        outer: &str,
        index: usize,
        inner: &str,
    ) -> Result<Vec<ElementInfo>>;

    async fn hover(&self, selector: &str, index: usize) -> Result<()>;

    async fn click(&self, selector: &str, index: usize) -> Result<()>;

    /// Move the pointer to viewport coordinates; used to dismiss flyouts.
    async fn move_mouse(&self, x: f64, y: f64) -> Result<()>;

    async fn scroll_to_bottom(&self) -> Result<()>;

    /// Viewport PNG.
    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// Serialized DOM, truncated to `max_bytes`.
    async fn dom_snapshot(&self, max_bytes: usize) -> Result<String>;

    /// Wait until `selector` matches; `false` on timeout.
    async fn wait_for(&self, selector: &str, timeout_ms: u64) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

/// Browser process lifecycle. Launched by the orchestrator, closed on
/// every exit path.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>>;

    /// Close pages, the browser process and its message loop, in that
    /// order. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}
