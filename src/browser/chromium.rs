//! Production browser adapter over the Chrome DevTools Protocol.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as CdpBrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::BrowserConfig;
use crate::error::{Error, Result};

use super::{BrowserDriver, BrowserPage, ElementInfo, WaitStrategy};

/// Clears the automation flag before any site script runs.
const STEALTH_INIT_SCRIPT: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });";

const STEALTH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--no-first-run",
    "--disable-infobars",
];

fn browser_error(e: impl std::fmt::Display) -> Error {
    Error::Browser(e.to_string())
}

/// Chromium process plus its CDP message loop.
pub struct ChromiumDriver {
    browser: Mutex<Option<Browser>>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    settings: BrowserConfig,
}

impl ChromiumDriver {
    /// Launch a stealth-configured browser.
    pub async fn launch(settings: &BrowserConfig) -> Result<Self> {
        let mut builder = CdpBrowserConfig::builder()
            .window_size(settings.viewport_width, settings.viewport_height)
            .args(STEALTH_ARGS.to_vec());
        if let Some(locale) = &settings.locale {
            builder = builder.arg(format!("--lang={locale}"));
        }
        if !settings.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(Error::Browser)?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(browser_error)?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler event error");
                }
            }
        });

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            handler_task: Mutex::new(Some(handler_task)),
            settings: settings.clone(),
        })
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| Error::Browser("browser already closed".to_string()))?;
        let page = browser.new_page("about:blank").await.map_err(browser_error)?;

        let init_script = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(STEALTH_INIT_SCRIPT)
            .build()
            .map_err(Error::Browser)?;
        page.execute(init_script).await.map_err(browser_error)?;
        if let Some(agent) = &self.settings.user_agent {
            page.set_user_agent(agent.as_str()).await.map_err(browser_error)?;
        }

        Ok(Box::new(ChromiumPage {
            page,
            settings: self.settings.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        // page → browser → handler loop; tolerate a second call.
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "browser close failed");
            }
            if let Err(e) = browser.wait().await {
                warn!(error = %e, "browser wait failed");
            }
        }
        if let Some(task) = self.handler_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}

/// One live CDP page.
pub struct ChromiumPage {
    page: Page,
    settings: BrowserConfig,
}

impl ChromiumPage {
    async fn element_info(
        &self,
        index: usize,
        element: &chromiumoxide::element::Element,
    ) -> ElementInfo {
        let text = element
            .inner_text()
            .await
            .ok()
            .flatten()
            .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        let mut attrs = std::collections::HashMap::new();
        for name in ["href", "class", "id", "aria-label"] {
            if let Ok(Some(value)) = element.attribute(name).await {
                attrs.insert(name.to_string(), value);
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

    async fn find_nth(
        &self,
        selector: &str,
        index: usize,
    ) -> Result<chromiumoxide::element::Element> {
        let mut elements = self
            .page
            .find_elements(selector)
            .await
            .map_err(browser_error)?;
        if index >= elements.len() {
            return Err(Error::Extraction(format!(
                "selector '{selector}' has {} matches, wanted index {index}",
                elements.len()
            )));
        }
        Ok(elements.swap_remove(index))
    }

    async fn ready_state(&self) -> Option<String> {
        self.page
            .evaluate("document.readyState")
            .await
            .ok()?
            .into_value::<String>()
            .ok()
    }

    async fn wait_ready(&self, wait: WaitStrategy, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.ready_state().await.unwrap_or_default();
            let ready = match wait {
                WaitStrategy::DomContentLoaded => state == "interactive" || state == "complete",
                WaitStrategy::Load => state == "complete",
            };
            if ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(timeout.as_millis() as u64));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn dispatch_mouse_move(&self, x: f64, y: f64) -> Result<()> {
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(x)
            .y(y)
            .build()
            .map_err(Error::Browser)?;
        self.page.execute(params).await.map_err(browser_error)?;
        Ok(())
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn goto(&self, url: &str, wait: WaitStrategy) -> Result<()> {
        let timeout = Duration::from_millis(self.settings.goto_timeout_ms);

        let navigate = tokio::time::timeout(timeout, self.page.goto(url)).await;
        match navigate {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(Error::navigation(url, e.to_string())),
            Err(_) => return Err(Error::navigation(url, "navigation timed out")),
        }

        // Prefer the DOM-content wait; one fallback to a full load wait on
        // timeout. Never wait for network idle.
        match self.wait_ready(wait, timeout).await {
            Ok(()) => Ok(()),
            Err(Error::Timeout { .. }) if wait == WaitStrategy::DomContentLoaded => {
                debug!(url, "DOM-content wait timed out, falling back to load wait");
                self.wait_ready(WaitStrategy::Load, timeout)
                    .await
                    .map_err(|_| Error::navigation(url, "page never finished loading"))
            }
            Err(e) => Err(e),
        }
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self
            .page
            .url()
            .await
            .map_err(browser_error)?
            .unwrap_or_default())
    }

    async fn title(&self) -> Result<String> {
        Ok(self
            .page
            .get_title()
            .await
            .map_err(browser_error)?
            .unwrap_or_default())
    }

    async fn query(&self, selector: &str) -> Result<Vec<ElementInfo>> {
        let elements = match self.page.find_elements(selector).await {
            Ok(elements) => elements,
            Err(e) => {
                debug!(selector, error = %e, "query matched nothing");
                return Ok(Vec::new());
            }
        };
        let mut out = Vec::with_capacity(elements.len());
        for (i, element) in elements.iter().enumerate() {
            out.push(self.element_info(i, element).await);
        }
        Ok(out)
    }

    async fn query_within(
        &self,
        outer: &str,
        index: usize,
        inner: &str,
    ) -> Result<Vec<ElementInfo>> {
        let element = self.find_nth(outer, index).await?;
        let children = match element.find_elements(inner).await {
            Ok(children) => children,
            Err(_) => return Ok(Vec::new()),
        };
        let mut out = Vec::with_capacity(children.len());
        for (i, child) in children.iter().enumerate() {
            out.push(self.element_info(i, child).await);
        }
        Ok(out)
    }

    async fn hover(&self, selector: &str, index: usize) -> Result<()> {
        let element = self.find_nth(selector, index).await?;
        let _ = element.scroll_into_view().await;
        let point = element.clickable_point().await.map_err(browser_error)?;
        self.dispatch_mouse_move(point.x, point.y).await
    }

    async fn click(&self, selector: &str, index: usize) -> Result<()> {
        let element = self.find_nth(selector, index).await?;
        element.click().await.map_err(browser_error)?;
        Ok(())
    }

    async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        self.dispatch_mouse_move(x, y).await
    }

    async fn scroll_to_bottom(&self) -> Result<()> {
        self.page
            .evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await
            .map_err(browser_error)?;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(false)
            .build();
        self.page.screenshot(params).await.map_err(browser_error)
    }

    async fn dom_snapshot(&self, max_bytes: usize) -> Result<String> {
        let mut html = self.page.content().await.map_err(browser_error)?;
        if html.len() > max_bytes {
            let mut cut = max_bytes;
            while cut > 0 && !html.is_char_boundary(cut) {
                cut -= 1;
            }
            html.truncate(cut);
        }
        Ok(html)
    }

    async fn wait_for(&self, selector: &str, timeout_ms: u64) -> Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Ok(elements) = self.page.find_elements(selector).await {
                if !elements.is_empty() {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn close(&self) -> Result<()> {
        self.page.clone().close().await.map_err(browser_error)?;
        Ok(())
    }
}
