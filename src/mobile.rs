use crate::retry::{self, Backoff, Exhausted, Verdict};
use chrono::{Datelike, Local, NaiveDateTime};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const APP_USER_DATA_URL: &str =
    "https://prod.rewardsplatform.microsoft.com/dapi/me?channel=SAAndroid&options=613";
const ANDROID_USER_AGENT: &str =
    "Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36";

/// Daily offers the app surfaces that are worth collecting.
const ELIGIBLE_OFFER_IDS: [&str; 2] = [
    "ENUS_readarticle3_30points",
    "Gamification_Sapphire_DailyCheckIn",
];

#[derive(Debug, Error)]
pub enum AppPointsError {
    #[error("app data request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("app data payload invalid: {0}")]
    Payload(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppUserData {
    pub response: AppResponse,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppResponse {
    #[serde(default)]
    pub promotions: Vec<AppPromotion>,
}

/// Offer attributes arrive as a flat string map; the check-in offer keys
/// its per-day rewards dynamically ("day_1_points" .. "day_7_points").
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AppPromotion {
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl AppPromotion {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    fn attr_u32(&self, key: &str) -> u32 {
        self.attr(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppEarnablePoints {
    pub read_to_earn: u32,
    pub check_in: u32,
}

impl AppEarnablePoints {
    pub fn total(&self) -> u32 {
        self.read_to_earn + self.check_in
    }
}

#[derive(Clone, Debug)]
pub struct AppPointsConfig {
    pub url: String,
    pub country: String,
    pub language: String,
    pub retry: Backoff,
    /// Base per-request timeout; grows with the attempt number.
    pub base_timeout: Duration,
    pub timeout_step: Duration,
    pub max_timeout: Duration,
    pub proxy: Option<String>,
}

impl Default for AppPointsConfig {
    fn default() -> Self {
        Self {
            url: APP_USER_DATA_URL.into(),
            country: "us".into(),
            language: "en".into(),
            retry: Backoff {
                max_attempts: 5,
                base_delay: Duration::from_secs(5),
                step: Duration::from_secs(2),
            },
            base_timeout: Duration::from_secs(30),
            timeout_step: Duration::from_secs(15),
            max_timeout: Duration::from_secs(90),
            proxy: None,
        }
    }
}

/// Reads the companion app's offer feed over its REST endpoint and totals
/// the points still collectable today.
pub struct AppPointsClient {
    http: reqwest::Client,
    cfg: AppPointsConfig,
    access_token: String,
}

impl AppPointsClient {
    pub fn new(cfg: AppPointsConfig, access_token: String) -> Result<Self, AppPointsError> {
        let mut builder = reqwest::Client::builder().user_agent(ANDROID_USER_AGENT);
        if let Some(proxy) = &cfg.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let http = builder.build()?;
        Ok(Self {
            http,
            cfg,
            access_token,
        })
    }

    fn timeout_for(&self, attempt: u32) -> Duration {
        (self.cfg.base_timeout + self.cfg.timeout_step * attempt.saturating_sub(1))
            .min(self.cfg.max_timeout)
    }

    async fn fetch_attempt(&self, attempt: u32) -> Result<AppUserData, AppPointsError> {
        let data: AppUserData = self
            .http
            .get(&self.cfg.url)
            .bearer_auth(&self.access_token)
            .header("X-Rewards-Country", &self.cfg.country)
            .header("X-Rewards-Language", &self.cfg.language)
            .timeout(self.timeout_for(attempt))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(data)
    }

    pub async fn earnable(&self, now: NaiveDateTime) -> Result<AppEarnablePoints, Exhausted<AppPointsError>> {
        let data = retry::run(
            &self.cfg.retry,
            |attempt| self.fetch_attempt(attempt),
            |attempt, err| {
                warn!(attempt, error = %err, "app data fetch failed");
                async move { (err, Verdict::Retry) }
            },
        )
        .await?;
        let points = earnable_from(&data, now);
        debug!(
            read_to_earn = points.read_to_earn,
            check_in = points.check_in,
            "app earnable points"
        );
        Ok(points)
    }

    pub async fn earnable_today(&self) -> Result<AppEarnablePoints, Exhausted<AppPointsError>> {
        self.earnable(Local::now().naive_local()).await
    }
}

/// Total the points the eligible daily offers still pay out, given the
/// current local time.
pub fn earnable_from(data: &AppUserData, now: NaiveDateTime) -> AppEarnablePoints {
    let mut points = AppEarnablePoints::default();
    for promo in &data.response.promotions {
        let Some(offer_id) = promo.attr("offerid") else {
            continue;
        };
        if !ELIGIBLE_OFFER_IDS.contains(&offer_id) {
            continue;
        }
        match promo.attr("type") {
            Some("msnreadearn") => {
                let max = promo.attr_u32("pointmax");
                let progress = promo.attr_u32("pointprogress");
                points.read_to_earn += max.saturating_sub(progress);
            }
            _ => {
                points.check_in += check_in_points(promo, now);
            }
        }
    }
    points
}

/// The check-in offer pays a ladder of per-day rewards over a 7-day cycle.
/// Nothing is earnable on the last day of a cycle or when the offer was
/// already claimed today.
fn check_in_points(promo: &AppPromotion, now: NaiveDateTime) -> u32 {
    let progress = promo.attr_u32("progress");
    let day = progress % 7;
    if day >= 6 {
        return 0;
    }
    let claimed_today = promo
        .attr("last_updated")
        .and_then(|raw| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%SZ").ok())
        .map(|updated| updated.day() == now.day())
        .unwrap_or(false);
    if claimed_today {
        return 0;
    }
    promo.attr_u32(&format!("day_{}_points", day + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn promo(pairs: &[(&str, &str)]) -> AppPromotion {
        AppPromotion {
            attributes: pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 8, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn data(promotions: Vec<AppPromotion>) -> AppUserData {
        AppUserData {
            response: AppResponse { promotions },
        }
    }

    #[test]
    fn read_offer_pays_the_remaining_points() {
        let d = data(vec![promo(&[
            ("offerid", "ENUS_readarticle3_30points"),
            ("type", "msnreadearn"),
            ("pointmax", "30"),
            ("pointprogress", "10"),
        ])]);
        let points = earnable_from(&d, at(20));
        assert_eq!(points.read_to_earn, 20);
        assert_eq!(points.total(), 20);
    }

    #[test]
    fn check_in_pays_the_next_day_of_the_cycle() {
        let d = data(vec![promo(&[
            ("offerid", "Gamification_Sapphire_DailyCheckIn"),
            ("type", "timedaction"),
            ("progress", "2"),
            ("last_updated", "2026-08-19T08:00:00Z"),
            ("day_3_points", "15"),
        ])]);
        let points = earnable_from(&d, at(20));
        assert_eq!(points.check_in, 15);
    }

    #[test]
    fn check_in_already_claimed_today_pays_nothing() {
        let d = data(vec![promo(&[
            ("offerid", "Gamification_Sapphire_DailyCheckIn"),
            ("progress", "2"),
            ("last_updated", "2026-08-20T08:00:00Z"),
            ("day_3_points", "15"),
        ])]);
        assert_eq!(earnable_from(&d, at(20)).check_in, 0);
    }

    #[test]
    fn check_in_cycle_end_pays_nothing() {
        let d = data(vec![promo(&[
            ("offerid", "Gamification_Sapphire_DailyCheckIn"),
            ("progress", "6"),
            ("last_updated", "2026-08-19T08:00:00Z"),
            ("day_7_points", "50"),
        ])]);
        assert_eq!(earnable_from(&d, at(20)).check_in, 0);
    }

    #[test]
    fn unknown_offers_are_ignored() {
        let d = data(vec![promo(&[
            ("offerid", "Some_Other_Offer"),
            ("type", "msnreadearn"),
            ("pointmax", "500"),
            ("pointprogress", "0"),
        ])]);
        assert_eq!(earnable_from(&d, at(20)), AppEarnablePoints::default());
    }

    #[test]
    fn offer_without_counters_pays_zero() {
        let d = data(vec![promo(&[("offerid", "ENUS_readarticle3_30points"), ("type", "msnreadearn")])]);
        assert_eq!(earnable_from(&d, at(20)).read_to_earn, 0);
    }

    #[test]
    fn payload_with_dynamic_day_keys_deserializes() {
        let raw = r#"{
            "response": {
                "promotions": [
                    {"attributes": {"offerid": "Gamification_Sapphire_DailyCheckIn",
                                    "progress": "0",
                                    "day_1_points": "5",
                                    "day_2_points": "10"}}
                ]
            }
        }"#;
        let data: AppUserData = serde_json::from_str(raw).unwrap();
        assert_eq!(data.response.promotions.len(), 1);
        let points = earnable_from(&data, at(20));
        assert_eq!(points.check_in, 5);
    }
}
