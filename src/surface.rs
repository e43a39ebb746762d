use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::debug;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("browser protocol error: {0}")]
    Protocol(String),
}

/// Readiness level to wait for after a navigation or reload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitUntil {
    /// The document finished loading.
    Loaded,
    /// The document loaded and network activity settled.
    FullyIdle,
}

/// One browsing surface (a page). The orchestration core only talks to the
/// browser through this contract; element absence is reported as `false`,
/// never as an error.
#[async_trait]
pub trait Surface: Send + Sync {
    async fn current_url(&self) -> Result<String, SurfaceError>;
    async fn navigate(
        &self,
        url: &str,
        wait: WaitUntil,
        limit: Duration,
    ) -> Result<(), SurfaceError>;
    async fn reload(&self, wait: WaitUntil, limit: Duration) -> Result<(), SurfaceError>;
    /// Serialized DOM snapshot of the active surface.
    async fn content(&self) -> Result<String, SurfaceError>;
    /// Evaluate a JS expression; promises are awaited, the settled value is
    /// returned by value.
    async fn evaluate(&self, js: &str) -> Result<Value, SurfaceError>;
    /// Click the first element matching `selector` within `limit`. Returns
    /// `Ok(false)` when no such element appears.
    async fn try_click(&self, selector: &str, limit: Duration) -> Result<bool, SurfaceError>;
    /// Focus the first element matching `selector`. Returns `Ok(false)` when
    /// it never appears within `limit`.
    async fn focus(&self, selector: &str, limit: Duration) -> Result<bool, SurfaceError>;
    /// Feed text to the focused element.
    async fn type_text(&self, text: &str) -> Result<(), SurfaceError>;
    async fn press_key(&self, key: &str) -> Result<(), SurfaceError>;
    async fn move_mouse(&self, x: f64, y: f64) -> Result<(), SurfaceError>;
    async fn click_at(&self, x: f64, y: f64) -> Result<(), SurfaceError>;
}

/// Window/tab management for the browser that owns the surface.
#[async_trait]
pub trait SurfaceRouter: Send + Sync {
    async fn surface_count(&self) -> Result<usize, SurfaceError>;
    /// Re-bind the active surface to the most recently opened one.
    async fn focus_latest(&self) -> Result<(), SurfaceError>;
    /// Close newest surfaces until at most `max` remain. Returns how many
    /// were closed.
    async fn close_extra(&self, max: usize) -> Result<usize, SurfaceError>;
}

/// Consent banners, upsell prompts and login interstitials that can cover
/// the pages we drive. Best effort, every miss is silent.
const OVERLAY_SELECTORS: &[&str] = &[
    "#acceptButton",
    ".ext-secondary.ext-button",
    "#iLandingViewAction",
    "#iShowSkip",
    "#iLooksGood",
    "#idSIButton9",
    ".ms-Button.ms-Button--primary",
    ".c-glyph.glyph-cancel",
    ".maybe-later",
    "#bnp_btn_accept",
    "#reward_pivot_earn",
];

/// Click through the known overlay/banner buttons, ignoring the ones that
/// are not present.
pub async fn dismiss_overlays(surface: &dyn Surface) {
    for selector in OVERLAY_SELECTORS {
        match surface.try_click(selector, Duration::from_millis(500)).await {
            Ok(true) => {
                debug!(selector, "dismissed overlay");
                sleep(Duration::from_millis(500)).await;
            }
            Ok(false) => {}
            Err(err) => debug!(selector, error = %err, "overlay dismissal failed"),
        }
    }
}

/// Encode a string as a JS string literal (JSON string syntax is valid JS),
/// so selectors containing quotes cannot break an injected script.
pub(crate) fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| String::from("\"\""))
}

/// Reload once when the surface is stuck on a browser network-error page.
pub async fn reload_bad_page(surface: &dyn Surface) -> Result<(), SurfaceError> {
    let html = surface.content().await.unwrap_or_default();
    if html.contains("neterror") {
        debug!("network error page detected, reloading");
        surface
            .reload(WaitUntil::Loaded, Duration::from_secs(60))
            .await?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct SurfaceConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
    pub mobile: bool,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            viewport: (1280, 800),
            mobile: false,
        }
    }
}

/// Chromium-backed implementation of [`Surface`] and [`SurfaceRouter`].
pub struct ChromiumSurface {
    browser: OxideBrowser,
    page: Mutex<Page>,
}

impl ChromiumSurface {
    pub async fn launch(cfg: SurfaceConfig) -> Result<Self, SurfaceError> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique user data dir per run to avoid ProcessSingleton profile lock
        // conflicts when instances are spawned in quick succession.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("farmhand-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder.user_data_dir(profile_dir.clone());
        builder = builder
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder
            .build()
            .map_err(SurfaceError::Protocol)?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg)
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        if let Some(ua) = cfg.user_agent.clone() {
            page.set_user_agent(ua)
                .await
                .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        }
        let _ = page
            .execute(
                SetDeviceMetricsOverrideParams::builder()
                    .width(i64::from(cfg.viewport.0))
                    .height(i64::from(cfg.viewport.1))
                    .device_scale_factor(1.0)
                    .mobile(cfg.mobile)
                    .build()
                    .map_err(SurfaceError::Protocol)?,
            )
            .await;
        Ok(Self {
            browser,
            page: Mutex::new(page),
        })
    }

    pub async fn connect(ws_url: &str) -> Result<Self, SurfaceError> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url)
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        Ok(Self {
            browser,
            page: Mutex::new(page),
        })
    }

    async fn eval_raw(&self, js: &str) -> Result<Value, SurfaceError> {
        let params = EvaluateParams::builder()
            .expression(js)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(SurfaceError::Protocol)?;
        let page = self.page.lock().await;
        let resp = page
            .execute(params)
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        Ok(resp.result.value.clone().unwrap_or(Value::Null))
    }

    /// Center of the first element matching `selector`, if it is rendered.
    async fn element_center(&self, selector: &str) -> Result<Option<(f64, f64)>, SurfaceError> {
        let js = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return null;
                const r = el.getBoundingClientRect();
                if (r.width <= 0 || r.height <= 0) return null;
                return {{ x: r.x + r.width / 2, y: r.y + r.height / 2 }};
            }})()"#,
            sel = js_string(selector)
        );
        let v = self.eval_raw(&js).await?;
        match (v.pointer("/x").and_then(Value::as_f64), v.pointer("/y").and_then(Value::as_f64)) {
            (Some(x), Some(y)) => Ok(Some((x, y))),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Surface for ChromiumSurface {
    async fn current_url(&self) -> Result<String, SurfaceError> {
        let page = self.page.lock().await;
        Ok(page
            .url()
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?
            .unwrap_or_default())
    }

    async fn navigate(
        &self,
        url: &str,
        wait: WaitUntil,
        limit: Duration,
    ) -> Result<(), SurfaceError> {
        {
            let page = self.page.lock().await;
            let nav = async {
                page.goto(url).await?;
                page.wait_for_navigation().await?;
                Ok::<(), chromiumoxide::error::CdpError>(())
            };
            timeout(limit, nav)
                .await
                .map_err(|_| SurfaceError::Timeout(limit))?
                .map_err(|e| SurfaceError::Navigation(e.to_string()))?;
        }
        if wait == WaitUntil::FullyIdle {
            // No first-class networkidle signal over CDP here; a short settle
            // covers late XHR-driven renders.
            sleep(Duration::from_secs(2)).await;
        }
        Ok(())
    }

    async fn reload(&self, wait: WaitUntil, limit: Duration) -> Result<(), SurfaceError> {
        {
            let params = EvaluateParams::builder()
                .expression("location.reload()")
                .build()
                .map_err(SurfaceError::Protocol)?;
            let page = self.page.lock().await;
            let reload = async {
                page.execute(params).await?;
                page.wait_for_navigation().await?;
                Ok::<(), chromiumoxide::error::CdpError>(())
            };
            timeout(limit, reload)
                .await
                .map_err(|_| SurfaceError::Timeout(limit))?
                .map_err(|e| SurfaceError::Navigation(e.to_string()))?;
        }
        if wait == WaitUntil::FullyIdle {
            sleep(Duration::from_secs(2)).await;
        }
        Ok(())
    }

    async fn content(&self) -> Result<String, SurfaceError> {
        let page = self.page.lock().await;
        page.content()
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))
    }

    async fn evaluate(&self, js: &str) -> Result<Value, SurfaceError> {
        self.eval_raw(js).await
    }

    async fn try_click(&self, selector: &str, limit: Duration) -> Result<bool, SurfaceError> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if let Some((x, y)) = self.element_center(selector).await? {
                self.click_at(x, y).await?;
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(Duration::from_millis(200)).await;
        }
    }

    async fn focus(&self, selector: &str, limit: Duration) -> Result<bool, SurfaceError> {
        let js = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.focus();
                return true;
            }})()"#,
            sel = js_string(selector)
        );
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.eval_raw(&js).await?.as_bool().unwrap_or(false) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(Duration::from_millis(200)).await;
        }
    }

    async fn type_text(&self, text: &str) -> Result<(), SurfaceError> {
        let page = self.page.lock().await;
        page.execute(InsertTextParams {
            text: text.to_string(),
        })
        .await
        .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), SurfaceError> {
        let js = format!(
            r#"(() => {{
                const el = document.activeElement || document.body;
                const opts = {{ key: {k}, code: {k}, bubbles: true }};
                el.dispatchEvent(new KeyboardEvent("keydown", opts));
                el.dispatchEvent(new KeyboardEvent("keyup", opts));
                if ({k} === "Enter" && el.form) el.form.submit();
            }})()"#,
            k = js_string(key)
        );
        self.eval_raw(&js).await?;
        Ok(())
    }

    async fn move_mouse(&self, x: f64, y: f64) -> Result<(), SurfaceError> {
        let page = self.page.lock().await;
        page.move_mouse(Point { x, y })
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        Ok(())
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<(), SurfaceError> {
        let page = self.page.lock().await;
        let cmd = DispatchMouseEventParams::builder()
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1);
        page.move_mouse(Point { x, y })
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        page.execute(
            cmd.clone()
                .r#type(DispatchMouseEventType::MousePressed)
                .build()
                .map_err(SurfaceError::Protocol)?,
        )
        .await
        .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        page.execute(
            cmd.r#type(DispatchMouseEventType::MouseReleased)
                .build()
                .map_err(SurfaceError::Protocol)?,
        )
        .await
        .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SurfaceRouter for ChromiumSurface {
    async fn surface_count(&self) -> Result<usize, SurfaceError> {
        let pages = self
            .browser
            .pages()
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        Ok(pages.len())
    }

    async fn focus_latest(&self) -> Result<(), SurfaceError> {
        let mut pages = self
            .browser
            .pages()
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        if let Some(last) = pages.pop() {
            *self.page.lock().await = last;
        }
        Ok(())
    }

    async fn close_extra(&self, max: usize) -> Result<usize, SurfaceError> {
        let mut pages = self
            .browser
            .pages()
            .await
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        let mut closed = 0;
        while pages.len() > max {
            if let Some(page) = pages.pop() {
                let _ = page.close().await;
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, "collapsed extra surfaces");
            self.focus_latest().await?;
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_string_quotes_plain_selectors() {
        assert_eq!(js_string("#sb_form_q"), "\"#sb_form_q\"");
    }

    #[test]
    fn js_string_escapes_embedded_quotes() {
        assert_eq!(js_string(r#"a'b"c"#), r#""a'b\"c""#);
        // The literal stays balanced when dropped into a selector call.
        let script = format!("document.querySelector({})", js_string(r#"[name="q'x"]"#));
        assert_eq!(script, r#"document.querySelector("[name=\"q'x\"]")"#);
    }
}
