use crate::surface::{Surface, SurfaceRouter, WaitUntil};
use rand::rngs::StdRng;
use rand::Rng;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Tuning knobs for the reading/clicking simulation layered over a results
/// page. Probabilities are percentages.
#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    pub click_probability: u32,
    pub hover_only_probability: u32,
    pub result_selector: String,
    pub close_popup_selector: String,
    /// How many times we poll for a usable page after a click opened (or
    /// failed to open) a tab.
    pub tab_poll_limit: u32,
    pub max_open_tabs: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            click_probability: 70,
            hover_only_probability: 30,
            result_selector: "#b_results .b_algo h2".into(),
            close_popup_selector: "#sacs_close".into(),
            tab_poll_limit: 5,
            max_open_tabs: 2,
        }
    }
}

/// Per-session gesture memory. The first scroll of a session always reads
/// downward; later ones may wander back up.
#[derive(Clone, Copy, Debug, Default)]
pub struct GestureState {
    scrolled_once: bool,
}

/// Drives scroll and click gestures that read like a person skimming search
/// results. Every public method absorbs its own failures; a broken gesture is
/// logged and skipped, never surfaced.
pub struct Simulator {
    cfg: SimulatorConfig,
    mobile: bool,
}

#[derive(Clone, Copy, Debug)]
struct ScrollProfile {
    min_step: i64,
    max_step: i64,
    min_segments: u32,
    max_segments: u32,
    min_segment_ms: u64,
    max_segment_ms: u64,
    min_pause_ms: u64,
    max_pause_ms: u64,
}

const DESKTOP_SCROLL: ScrollProfile = ScrollProfile {
    min_step: 50,
    max_step: 150,
    min_segments: 2,
    max_segments: 4,
    min_segment_ms: 500,
    max_segment_ms: 1500,
    min_pause_ms: 500,
    max_pause_ms: 1000,
};

const MOBILE_SCROLL: ScrollProfile = ScrollProfile {
    min_step: 200,
    max_step: 500,
    min_segments: 1,
    max_segments: 1,
    min_segment_ms: 2000,
    max_segment_ms: 4000,
    min_pause_ms: 1000,
    max_pause_ms: 3000,
};

impl Simulator {
    pub fn new(cfg: SimulatorConfig, mobile: bool) -> Self {
        Self { cfg, mobile }
    }

    pub fn click_probability(&self) -> u32 {
        self.cfg.click_probability
    }

    /// Scroll the page in a few eased segments with pauses in between.
    pub async fn scroll(&self, surface: &dyn Surface, rng: &mut StdRng, state: &mut GestureState) {
        if let Err(err) = self.scroll_inner(surface, rng, state).await {
            warn!(error = %err, "scroll gesture failed, skipping");
        }
    }

    async fn scroll_inner(
        &self,
        surface: &dyn Surface,
        rng: &mut StdRng,
        state: &mut GestureState,
    ) -> Result<(), crate::surface::SurfaceError> {
        let metrics = surface
            .evaluate("[window.scrollY, document.body.scrollHeight, window.innerHeight]")
            .await?;
        let (mut position, page_height, viewport) = match metrics.as_array() {
            Some(v) if v.len() == 3 => (
                v[0].as_f64().unwrap_or(0.0) as i64,
                v[1].as_f64().unwrap_or(0.0) as i64,
                v[2].as_f64().unwrap_or(0.0) as i64,
            ),
            _ => return Ok(()),
        };
        let max_scroll = (page_height - viewport).max(0);
        let profile = if self.mobile { MOBILE_SCROLL } else { DESKTOP_SCROLL };
        let segments = rng.gen_range(profile.min_segments..=profile.max_segments);

        for _ in 0..segments {
            let magnitude = rng.gen_range(profile.min_step..=profile.max_step);
            let delta = if !state.scrolled_once {
                // A person always starts by scrolling down into the results.
                state.scrolled_once = true;
                magnitude
            } else if rng.gen_range(0..100) < 70 {
                if rng.gen_bool(0.5) {
                    magnitude
                } else {
                    -magnitude
                }
            } else {
                // Small corrective nudge around the midpoint of the range.
                let mid = (profile.min_step + profile.max_step) / 2;
                if rng.gen_bool(0.5) {
                    mid / 2
                } else {
                    -(mid / 2)
                }
            };
            let destination = (position + delta).clamp(0, max_scroll);
            let duration = rng.gen_range(profile.min_segment_ms..=profile.max_segment_ms);
            self.animate_scroll(surface, destination, duration).await?;
            position = destination;
            let pause = rng.gen_range(profile.min_pause_ms..=profile.max_pause_ms);
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
        Ok(())
    }

    async fn animate_scroll(
        &self,
        surface: &dyn Surface,
        destination: i64,
        duration_ms: u64,
    ) -> Result<(), crate::surface::SurfaceError> {
        // Eased in-page animation; the promise resolves when the frame loop
        // lands on the destination.
        let script = format!(
            r#"new Promise((resolve) => {{
                const start = window.scrollY;
                const distance = {destination} - start;
                const duration = {duration_ms};
                const began = performance.now();
                const ease = (t) => t < 0.5 ? 2 * t * t : 1 - Math.pow(-2 * t + 2, 2) / 2;
                const frame = (now) => {{
                    const t = Math.min((now - began) / duration, 1);
                    window.scrollTo(0, start + distance * ease(t));
                    if (t < 1) requestAnimationFrame(frame); else resolve();
                }};
                requestAnimationFrame(frame);
            }})"#
        );
        surface.evaluate(&script).await?;
        Ok(())
    }

    /// Pick a visible organic result, hover it, then (usually) click through
    /// and read for a while. The occasional pass hovers without clicking.
    pub async fn click_result<S>(&self, surface: &S, rng: &mut StdRng)
    where
        S: Surface + SurfaceRouter,
    {
        if let Err(err) = self.click_inner(surface, rng).await {
            warn!(error = %err, "click gesture failed, skipping");
        }
    }

    async fn click_inner<S>(
        &self,
        surface: &S,
        rng: &mut StdRng,
    ) -> Result<(), crate::surface::SurfaceError>
    where
        S: Surface + SurfaceRouter,
    {
        let results_url = surface.current_url().await?;
        let Some((x, y)) = self.pick_visible_result(surface, rng).await? else {
            debug!("no visible result to interact with");
            return Ok(());
        };

        surface.move_mouse(x, y).await?;
        tokio::time::sleep(Duration::from_millis(rng.gen_range(1000..=2000))).await;
        surface.move_mouse(0.0, 0.0).await?;

        if rng.gen_range(0..100) < self.cfg.hover_only_probability {
            debug!("hover-only pass, not clicking through");
            return Ok(());
        }

        surface.click_at(x, y).await?;
        // Consent popups on the landing page block the dwell; close if present.
        let _ = surface
            .try_click(&self.cfg.close_popup_selector, Duration::from_secs(1))
            .await;
        let dwell = rng.gen_range(10_000..=30_000);
        debug!(dwell_ms = dwell, "dwelling on clicked result");
        tokio::time::sleep(Duration::from_millis(dwell)).await;

        self.return_to_results(surface, &results_url).await
    }

    /// After a click-through the session must end up back on the results
    /// page with at most the allowed number of tabs open.
    async fn return_to_results<S>(
        &self,
        surface: &S,
        results_url: &str,
    ) -> Result<(), crate::surface::SurfaceError>
    where
        S: Surface + SurfaceRouter,
    {
        for _ in 0..self.cfg.tab_poll_limit {
            let closed = surface.close_extra(self.cfg.max_open_tabs).await?;
            if closed > 0 {
                debug!(closed, "collapsed extra tabs");
            }
            surface.focus_latest().await?;
            let url = surface.current_url().await?;
            if url == results_url {
                return Ok(());
            }
            if surface.surface_count().await? <= 1 {
                surface
                    .navigate(results_url, WaitUntil::Loaded, Duration::from_secs(30))
                    .await?;
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(1000)).await;
        }
        surface
            .navigate(results_url, WaitUntil::Loaded, Duration::from_secs(30))
            .await
    }

    async fn pick_visible_result(
        &self,
        surface: &dyn Surface,
        rng: &mut StdRng,
    ) -> Result<Option<(f64, f64)>, crate::surface::SurfaceError> {
        let script = format!(
            r#"(() => {{
                const centers = [];
                for (const el of document.querySelectorAll({sel})) {{
                    const r = el.getBoundingClientRect();
                    if (r.width > 0 && r.height > 0 && r.top >= 0 && r.bottom <= window.innerHeight) {{
                        centers.push([r.left + r.width / 2, r.top + r.height / 2]);
                    }}
                }}
                return centers;
            }})()"#,
            sel = crate::surface::js_string(&self.cfg.result_selector)
        );
        let centers = surface.evaluate(&script).await?;
        let Some(list) = centers.as_array() else {
            return Ok(None);
        };
        if list.is_empty() {
            return Ok(None);
        }
        let pick = &list[rng.gen_range(0..list.len())];
        let point = pick
            .as_array()
            .and_then(|p| match (p.first(), p.get(1)) {
                (Some(Value::Number(x)), Some(Value::Number(y))) => {
                    Some((x.as_f64()?, y.as_f64()?))
                }
                _ => None,
            });
        Ok(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn first_scroll_of_a_session_goes_down() {
        // Exercised indirectly through GestureState: the flag flips exactly
        // once and stays set.
        let mut state = GestureState::default();
        assert!(!state.scrolled_once);
        state.scrolled_once = true;
        assert!(state.scrolled_once);
    }

    #[test]
    fn default_config_matches_interaction_odds() {
        let cfg = SimulatorConfig::default();
        assert_eq!(cfg.click_probability, 70);
        assert_eq!(cfg.hover_only_probability, 30);
        assert_eq!(cfg.max_open_tabs, 2);
    }

    #[test]
    fn hover_only_odds_hold_over_many_draws() {
        let cfg = SimulatorConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        let hover_only = (0..10_000)
            .filter(|_| rng.gen_range(0..100) < cfg.hover_only_probability)
            .count();
        assert!((2500..3500).contains(&hover_only), "got {hover_only}");
    }
}
