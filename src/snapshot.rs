use crate::retry::{self, Backoff, Exhausted, Verdict};
use crate::surface::{dismiss_overlays, Surface, SurfaceError, WaitUntil};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

// ========================= Remote data shapes =========================

/// One per-category progress counter as the dashboard reports it.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    #[serde(default)]
    pub point_progress: u32,
    #[serde(default)]
    pub point_progress_max: u32,
}

impl Counter {
    pub fn new(point_progress: u32, point_progress_max: u32) -> Self {
        Self {
            point_progress,
            point_progress_max,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    #[serde(default)]
    pub pc_search: Vec<Counter>,
    #[serde(default)]
    pub mobile_search: Vec<Counter>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub available_points: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    #[serde(default)]
    pub point_progress: u32,
    #[serde(default)]
    pub point_progress_max: u32,
    #[serde(default)]
    pub promotion_type: String,
    #[serde(default)]
    pub exclusive_locked_feature_status: String,
}

/// One point-in-time read of the remote point-progress data. Created fresh on
/// every successful fetch, never mutated.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    #[serde(default)]
    pub user_status: UserStatus,
    #[serde(default)]
    pub daily_set_promotions: HashMap<String, Vec<Promotion>>,
    #[serde(default)]
    pub more_promotions: Vec<Promotion>,
}

// ========================= Errors =========================

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("page load timed out: {0}")]
    Timeout(String),
    #[error("dashboard payload missing or malformed: {0}")]
    Parse(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("account is suspended")]
    Suspended,
    #[error("{0}")]
    Unknown(String),
}

impl From<SurfaceError> for FetchError {
    fn from(err: SurfaceError) -> Self {
        match err {
            SurfaceError::Timeout(d) => FetchError::Timeout(format!("after {d:?}")),
            SurfaceError::Navigation(msg) => FetchError::Navigation(msg),
            SurfaceError::Protocol(msg) => FetchError::Unknown(msg),
        }
    }
}

/// Counters must satisfy `progress <= progress_max`; anything else means the
/// payload we scraped is corrupt, not a real business state.
pub fn validate(data: &DashboardData) -> Result<(), FetchError> {
    let counters = &data.user_status.counters;
    for counter in counters.pc_search.iter().chain(counters.mobile_search.iter()) {
        if counter.point_progress > counter.point_progress_max {
            return Err(FetchError::Parse(format!(
                "counter progress {} exceeds max {}",
                counter.point_progress, counter.point_progress_max
            )));
        }
    }
    Ok(())
}

// ========================= Parser =========================

/// Extraction strategy for the dashboard blob embedded in the page. `Ok(None)`
/// means the blob is not present yet (expected, worth retrying); `Err` means
/// it is there but malformed.
pub trait SnapshotParser: Send + Sync {
    fn parse(&self, body: &str) -> Result<Option<DashboardData>, FetchError>;
}

/// Default parser: tries the known inline-script assignment patterns in order.
pub struct ScriptPatternParser {
    patterns: Vec<Regex>,
}

impl ScriptPatternParser {
    pub fn new() -> Self {
        let sources = [
            r"(?s)var dashboard = (\{.*?\});",
            r"(?s)dashboard = (\{.*?\});",
            r"(?s)_w\.dashboard = (\{.*?\});",
        ];
        let patterns = sources
            .iter()
            .filter_map(|src| Regex::new(src).ok())
            .collect();
        Self { patterns }
    }
}

impl Default for ScriptPatternParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotParser for ScriptPatternParser {
    fn parse(&self, body: &str) -> Result<Option<DashboardData>, FetchError> {
        for pattern in &self.patterns {
            if let Some(caps) = pattern.captures(body) {
                let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let data: DashboardData = serde_json::from_str(raw)
                    .map_err(|e| FetchError::Parse(e.to_string()))?;
                validate(&data)?;
                return Ok(Some(data));
            }
        }
        Ok(None)
    }
}

// ========================= Fetcher =========================

#[derive(Clone)]
pub struct FetcherConfig {
    pub dashboard_url: String,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_step: Duration,
    pub script_tries: u32,
    pub script_pause: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            dashboard_url: "https://rewards.bing.com/".to_string(),
            max_attempts: 5,
            retry_base: Duration::from_secs(10),
            retry_step: Duration::from_secs(2),
            script_tries: 3,
            script_pause: Duration::from_secs(2),
        }
    }
}

/// Pulls a fresh [`DashboardData`] snapshot off the dashboard page, riding out
/// slow loads, missing blobs and the occasional lost session.
pub struct DashboardFetcher<S> {
    surface: Arc<S>,
    cfg: FetcherConfig,
    parser: Box<dyn SnapshotParser>,
}

impl<S: Surface> DashboardFetcher<S> {
    pub fn new(surface: Arc<S>, cfg: FetcherConfig) -> Self {
        Self {
            surface,
            cfg,
            parser: Box::new(ScriptPatternParser::new()),
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn SnapshotParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Navigate back to the dashboard origin and make sure the session is
    /// still usable there.
    pub async fn go_home(&self) -> Result<(), FetchError> {
        let current = self.surface.current_url().await?;
        if current == self.cfg.dashboard_url {
            return Ok(());
        }
        self.surface
            .navigate(
                &self.cfg.dashboard_url,
                WaitUntil::Loaded,
                Duration::from_secs(120),
            )
            .await?;
        dismiss_overlays(self.surface.as_ref()).await;
        let html = self.surface.content().await?;
        if html.contains("suspendedAccountHeader") {
            return Err(FetchError::Suspended);
        }
        Ok(())
    }

    /// Fetch one snapshot, retrying under the backoff envelope. Exhaustion
    /// surfaces the last error annotated with the attempt count.
    pub async fn fetch(&self) -> Result<DashboardData, Exhausted<FetchError>> {
        let policy = Backoff {
            max_attempts: self.cfg.max_attempts,
            base_delay: self.cfg.retry_base,
            step: self.cfg.retry_step,
        };
        let data = retry::run(
            &policy,
            |attempt| self.fetch_attempt(attempt),
            |attempt, err| self.recover(attempt, err),
        )
        .await?;
        Ok(data)
    }

    async fn fetch_attempt(&self, attempt: u32) -> Result<DashboardData, FetchError> {
        let home_host = host_of(&self.cfg.dashboard_url);
        let current_host = host_of(&self.surface.current_url().await?);
        if current_host != home_host {
            debug!(attempt, "surface drifted off the dashboard, re-homing");
            self.go_home().await?;
        }

        // Widening reload ladder: 30s, 45s, 60s, 75s, 90s.
        let reload_limit = Duration::from_secs((30 + 15 * u64::from(attempt - 1)).min(90));
        match self.surface.reload(WaitUntil::FullyIdle, reload_limit).await {
            Ok(()) => {}
            Err(SurfaceError::Timeout(_)) => {
                warn!(attempt, "idle wait timed out, falling back to plain load");
                let fallback = reload_limit.min(Duration::from_secs(60));
                self.surface.reload(WaitUntil::Loaded, fallback).await?;
            }
            Err(err) => return Err(err.into()),
        }

        for script_try in 1..=self.cfg.script_tries {
            let body = self.surface.content().await?;
            match self.parser.parse(&body)? {
                Some(data) => {
                    if attempt > 1 {
                        info!(attempt, "snapshot recovered after retries");
                    }
                    return Ok(data);
                }
                None if script_try < self.cfg.script_tries => {
                    debug!(attempt, script_try, "dashboard blob not present yet");
                    sleep(self.cfg.script_pause).await;
                }
                None => {}
            }
        }
        Err(FetchError::Parse(
            "dashboard blob not found in page".to_string(),
        ))
    }

    async fn recover(&self, attempt: u32, err: FetchError) -> (FetchError, Verdict) {
        match &err {
            FetchError::Suspended => return (err, Verdict::Fatal),
            FetchError::Timeout(_) => {
                warn!(attempt, "network timeout, forcing a plain reload");
                let _ = self
                    .surface
                    .reload(WaitUntil::Loaded, Duration::from_secs(60))
                    .await;
            }
            FetchError::Navigation(_) => {
                warn!(attempt, "navigation drift, re-homing before retry");
                if let Err(home_err) = self.go_home().await {
                    if matches!(home_err, FetchError::Suspended) {
                        return (err, Verdict::Fatal);
                    }
                    warn!(error = %home_err, "re-home failed, retrying from current state");
                }
            }
            _ => {}
        }
        // Second attempt doubles as a session revalidation pass.
        if attempt == 2 {
            debug!("revalidating session before retry");
            if let Err(home_err) = self.go_home().await {
                if matches!(home_err, FetchError::Suspended) {
                    return (err, Verdict::Fatal);
                }
                warn!(error = %home_err, "session revalidation failed");
            }
        }
        (err, Verdict::Retry)
    }
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blob() -> String {
        r#"{"userStatus":{"counters":{"pcSearch":[{"pointProgress":10,"pointProgressMax":90},{"pointProgress":0,"pointProgressMax":12}],"mobileSearch":[{"pointProgress":30,"pointProgressMax":100}]},"availablePoints":1234},"dailySetPromotions":{},"morePromotions":[]}"#.to_string()
    }

    #[test]
    fn parses_each_assignment_pattern() {
        let parser = ScriptPatternParser::new();
        let blob = sample_blob();
        for wrap in [
            format!("<script>var dashboard = {blob};</script>"),
            format!("<script>dashboard = {blob};</script>"),
            format!("<script>_w.dashboard = {blob};</script>"),
        ] {
            let data = parser.parse(&wrap).unwrap().expect("blob should parse");
            assert_eq!(data.user_status.counters.pc_search[0].point_progress_max, 90);
            assert_eq!(data.user_status.available_points, 1234);
        }
    }

    #[test]
    fn missing_blob_is_not_an_error() {
        let parser = ScriptPatternParser::new();
        assert!(parser.parse("<html><body>nothing here</body></html>").unwrap().is_none());
    }

    #[test]
    fn malformed_blob_is_a_parse_fault() {
        let parser = ScriptPatternParser::new();
        let page = "<script>var dashboard = {\"userStatus\": nonsense};</script>";
        assert!(matches!(parser.parse(page), Err(FetchError::Parse(_))));
    }

    #[test]
    fn progress_above_max_is_corruption() {
        let data = DashboardData {
            user_status: UserStatus {
                counters: Counters {
                    pc_search: vec![Counter::new(120, 90)],
                    mobile_search: vec![],
                },
                available_points: 0,
            },
            ..Default::default()
        };
        assert!(matches!(validate(&data), Err(FetchError::Parse(_))));
    }

    #[test]
    fn unknown_payload_fields_are_ignored() {
        let parser = ScriptPatternParser::new();
        let page = r#"<script>var dashboard = {"userStatus":{"counters":{"pcSearch":[],"mobileSearch":[],"shopAndEarn":[]},"availablePoints":5,"levelInfo":{}},"extra":true};</script>"#;
        let data = parser.parse(page).unwrap().expect("should tolerate extras");
        assert_eq!(data.user_status.available_points, 5);
    }
}
