use crate::driver::SearchAction;
use crate::simulate::{GestureState, Simulator};
use crate::surface::{self, Surface, SurfaceError, SurfaceRouter, WaitUntil};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct BingConfig {
    pub home_url: String,
    pub search_box: String,
    pub max_attempts: u32,
    /// Keystroke cadence in milliseconds per character.
    pub min_keystroke_ms: u64,
    pub max_keystroke_ms: u64,
    /// Idle gap after each finished search.
    pub min_search_gap_ms: u64,
    pub max_search_gap_ms: u64,
}

impl Default for BingConfig {
    fn default() -> Self {
        Self {
            home_url: "https://bing.com".into(),
            search_box: "#sb_form_q".into(),
            max_attempts: 5,
            min_keystroke_ms: 50,
            max_keystroke_ms: 200,
            min_search_gap_ms: 3000,
            max_search_gap_ms: 8000,
        }
    }
}

struct SearcherState {
    rng: StdRng,
    gestures: GestureState,
    results_url: Option<String>,
}

/// Types a query into the engine's search box the way a person would, reads
/// the results, and occasionally clicks through. One searcher per session.
pub struct BingSearcher<S> {
    surface: Arc<S>,
    sim: Simulator,
    cfg: BingConfig,
    state: Mutex<SearcherState>,
}

impl<S> BingSearcher<S>
where
    S: Surface + SurfaceRouter,
{
    pub fn new(surface: Arc<S>, sim: Simulator, cfg: BingConfig, rng: StdRng) -> Self {
        Self {
            surface,
            sim,
            cfg,
            state: Mutex::new(SearcherState {
                rng,
                gestures: GestureState::default(),
                results_url: None,
            }),
        }
    }

    /// Navigate the active surface to the engine's home page. Run once
    /// before the first search of a session.
    pub async fn warm_up(&self) -> Result<(), SurfaceError> {
        self.surface
            .navigate(&self.cfg.home_url, WaitUntil::Loaded, Duration::from_secs(60))
            .await?;
        surface::dismiss_overlays(self.surface.as_ref()).await;
        Ok(())
    }

    async fn type_query(&self, query: &str, state: &mut SearcherState) -> Result<(), SurfaceError> {
        let surface = self.surface.as_ref();
        surface.focus_latest().await?;
        surface.evaluate("window.scrollTo(0, 0)").await?;
        tokio::time::sleep(Duration::from_millis(state.rng.gen_range(500..=2000))).await;

        if !surface
            .focus(&self.cfg.search_box, Duration::from_secs(10))
            .await?
        {
            return Err(SurfaceError::Navigation(format!(
                "search box {:?} not present",
                self.cfg.search_box
            )));
        }
        let _ = surface
            .try_click(&self.cfg.search_box, Duration::from_secs(2))
            .await?;
        // Clear any leftover query and let the page's listeners notice.
        let clear = format!(
            r#"(() => {{
                const box = document.querySelector({sel});
                if (box) {{
                    box.value = '';
                    box.dispatchEvent(new Event('input', {{ bubbles: true }}));
                }}
            }})()"#,
            sel = surface::js_string(&self.cfg.search_box)
        );
        surface.evaluate(&clear).await?;

        let mut buffer = [0u8; 4];
        for ch in query.chars() {
            surface.type_text(ch.encode_utf8(&mut buffer)).await?;
            let pause = state
                .rng
                .gen_range(self.cfg.min_keystroke_ms..=self.cfg.max_keystroke_ms);
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
        surface.press_key("Enter").await?;
        Ok(())
    }

    async fn read_results(&self, state: &mut SearcherState) -> Result<(), SurfaceError> {
        let surface = self.surface.as_ref();
        tokio::time::sleep(Duration::from_millis(state.rng.gen_range(3000..=5000))).await;
        surface.focus_latest().await?;
        if let Err(err) = surface::reload_bad_page(surface).await {
            debug!(error = %err, "bad page reload failed");
        }
        state.results_url = Some(surface.current_url().await?);
        surface::dismiss_overlays(surface).await;

        let passes = state.rng.gen_range(1..=3);
        for pass in 0..passes {
            if pass > 0 {
                tokio::time::sleep(Duration::from_millis(state.rng.gen_range(2000..=5000))).await;
            }
            self.sim
                .scroll(surface, &mut state.rng, &mut state.gestures)
                .await;
            if state.rng.gen_range(0..100) < self.sim.click_probability() {
                self.sim.click_result(self.surface.as_ref(), &mut state.rng).await;
            }
        }
        Ok(())
    }

    /// Recovery between attempts: collapse stray tabs and return to a known
    /// page before trying the query again.
    async fn reset_after_failure(&self, state: &mut SearcherState) {
        let surface = self.surface.as_ref();
        surface::dismiss_overlays(surface).await;
        if let Err(err) = surface.close_extra(2).await {
            debug!(error = %err, "tab cleanup failed during reset");
        }
        let fallback = state
            .results_url
            .clone()
            .unwrap_or_else(|| self.cfg.home_url.clone());
        if let Err(err) = surface
            .navigate(&fallback, WaitUntil::Loaded, Duration::from_secs(30))
            .await
        {
            debug!(error = %err, url = %fallback, "reset navigation failed");
        }
        tokio::time::sleep(Duration::from_millis(state.rng.gen_range(4000..=7000))).await;
    }
}

#[async_trait]
impl<S> SearchAction for BingSearcher<S>
where
    S: Surface + SurfaceRouter,
{
    async fn search(&self, query: &str) -> Result<(), SurfaceError> {
        let mut state = self.state.lock().await;
        // Every results page is a fresh read: the opening gesture on it
        // scrolls down again.
        state.gestures = GestureState::default();
        let mut last_err = None;
        for attempt in 1..=self.cfg.max_attempts.max(1) {
            let result = async {
                self.type_query(query, &mut state).await?;
                self.read_results(&mut state).await
            }
            .await;
            match result {
                Ok(()) => {
                    let gap = state
                        .rng
                        .gen_range(self.cfg.min_search_gap_ms..=self.cfg.max_search_gap_ms);
                    tokio::time::sleep(Duration::from_millis(gap)).await;
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, query = %query, error = %err, "search attempt failed");
                    last_err = Some(err);
                    self.reset_after_failure(&mut state).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            SurfaceError::Navigation("search failed without an attempt".into())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::SimulatorConfig;
    use rand::SeedableRng;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Surface stub that records every evaluated script and serves fixed
    /// scroll metrics (position 500 on a 3000px page with an 800px viewport).
    #[derive(Default)]
    struct PageStub {
        scripts: StdMutex<Vec<String>>,
        reloads: AtomicU32,
        body: StdMutex<String>,
    }

    impl PageStub {
        /// Destinations of the eased scroll animations, in evaluation order.
        fn scroll_destinations(&self) -> Vec<i64> {
            self.scripts
                .lock()
                .unwrap()
                .iter()
                .filter_map(|s| {
                    let rest = s.split("const distance = ").nth(1)?;
                    rest.split_whitespace().next()?.parse().ok()
                })
                .collect()
        }

        fn clear_scripts(&self) {
            self.scripts.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl Surface for PageStub {
        async fn current_url(&self) -> Result<String, SurfaceError> {
            Ok("https://bing.com/search?q=term".to_string())
        }

        async fn navigate(
            &self,
            _url: &str,
            _wait: WaitUntil,
            _limit: Duration,
        ) -> Result<(), SurfaceError> {
            Ok(())
        }

        async fn reload(&self, _wait: WaitUntil, _limit: Duration) -> Result<(), SurfaceError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn content(&self) -> Result<String, SurfaceError> {
            Ok(self.body.lock().unwrap().clone())
        }

        async fn evaluate(&self, js: &str) -> Result<Value, SurfaceError> {
            self.scripts.lock().unwrap().push(js.to_string());
            if js.starts_with('[') && js.contains("scrollHeight") {
                return Ok(json!([500.0, 3000.0, 800.0]));
            }
            if js.contains("querySelectorAll") {
                return Ok(json!([]));
            }
            Ok(Value::Null)
        }

        async fn try_click(&self, _selector: &str, _limit: Duration) -> Result<bool, SurfaceError> {
            Ok(false)
        }

        async fn focus(&self, _selector: &str, _limit: Duration) -> Result<bool, SurfaceError> {
            Ok(true)
        }

        async fn type_text(&self, _text: &str) -> Result<(), SurfaceError> {
            Ok(())
        }

        async fn press_key(&self, _key: &str) -> Result<(), SurfaceError> {
            Ok(())
        }

        async fn move_mouse(&self, _x: f64, _y: f64) -> Result<(), SurfaceError> {
            Ok(())
        }

        async fn click_at(&self, _x: f64, _y: f64) -> Result<(), SurfaceError> {
            Ok(())
        }
    }

    #[async_trait]
    impl SurfaceRouter for PageStub {
        async fn surface_count(&self) -> Result<usize, SurfaceError> {
            Ok(1)
        }

        async fn focus_latest(&self) -> Result<(), SurfaceError> {
            Ok(())
        }

        async fn close_extra(&self, _max: usize) -> Result<usize, SurfaceError> {
            Ok(0)
        }
    }

    fn searcher(page: Arc<PageStub>) -> BingSearcher<PageStub> {
        BingSearcher::new(
            page,
            Simulator::new(SimulatorConfig::default(), false),
            BingConfig::default(),
            StdRng::seed_from_u64(11),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn each_search_opens_its_results_with_a_downward_scroll() {
        let page = Arc::new(PageStub::default());
        let searcher = searcher(page.clone());

        searcher.search("first term").await.unwrap();
        let first = page.scroll_destinations();
        assert!(!first.is_empty());
        assert!(first[0] > 500, "first search scrolled up to {}", first[0]);

        page.clear_scripts();
        searcher.search("second term").await.unwrap();
        let second = page.scroll_destinations();
        assert!(!second.is_empty());
        assert!(
            second[0] > 500,
            "second search opened with an upward scroll to {}",
            second[0]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn network_error_results_page_gets_reloaded() {
        let page = Arc::new(PageStub::default());
        *page.body.lock().unwrap() = r#"<html class="neterror"><body></body></html>"#.to_string();
        let searcher = searcher(page.clone());

        searcher.search("term").await.unwrap();
        assert!(page.reloads.load(Ordering::SeqCst) >= 1);
    }
}
