use crate::driver::{QueryTerm, RelatedSource};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TrendError {
    #[error("trends request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed trends payload: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug)]
pub struct TrendsConfig {
    pub trends_url: String,
    pub suggestions_url: String,
    /// Region used when the caller's region yields too few terms.
    pub fallback_geo: String,
    /// A feed below this size is considered too thin to farm from.
    pub min_terms: usize,
    pub proxy: Option<String>,
    pub timeout: Duration,
}

impl Default for TrendsConfig {
    fn default() -> Self {
        Self {
            trends_url:
                "https://trends.google.com/_/TrendsUi/data/batchexecute?rpcids=i0OFE&source-path=%2Ftrends%2Fexplore"
                    .into(),
            suggestions_url: "https://api.bing.com/osjson.aspx".into(),
            fallback_geo: "US".into(),
            min_terms: 90,
            proxy: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Pulls the day's trending topics (with their related queries) and serves
/// per-topic query suggestions for the fallback phase.
pub struct TrendsClient {
    http: reqwest::Client,
    cfg: TrendsConfig,
}

impl TrendsClient {
    pub fn new(cfg: TrendsConfig) -> Result<Self, TrendError> {
        let mut builder = reqwest::Client::builder().timeout(cfg.timeout);
        if let Some(proxy) = &cfg.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
            cfg,
        })
    }

    /// Fetch trending terms for a region, falling back to the default region
    /// when the feed comes back too thin.
    pub async fn fetch_terms(&self, geo: &str) -> Result<Vec<QueryTerm>, TrendError> {
        let mut geo = geo.to_uppercase();
        loop {
            let terms = self.fetch_terms_for(&geo).await?;
            if terms.len() < self.cfg.min_terms && geo != self.cfg.fallback_geo {
                warn!(
                    geo = %geo,
                    count = terms.len(),
                    "trend feed too thin, retrying with fallback region"
                );
                geo = self.cfg.fallback_geo.clone();
                continue;
            }
            return Ok(terms);
        }
    }

    async fn fetch_terms_for(&self, geo: &str) -> Result<Vec<QueryTerm>, TrendError> {
        let body = format!(
            "f.req=[[[i0OFE,\"[null, null, \\\"{geo}\\\", 0, null, 48]\"]]]"
        );
        let text = self
            .http
            .post(&self.cfg.trends_url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded;charset=UTF-8",
            )
            .body(body)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let terms = decode_trends_payload(&text)?;
        debug!(geo = %geo, count = terms.len(), "fetched trend terms");
        Ok(terms)
    }

    /// Random presentation order so repeated sessions do not replay the feed
    /// top to bottom.
    pub fn shuffle_terms(terms: &mut [QueryTerm], rng: &mut StdRng) {
        terms.shuffle(rng);
    }
}

/// The batchexecute envelope wraps a JSON array line inside junk framing;
/// inside it, element [0][2] is itself a JSON document whose entry [1] lists
/// the trends. Per trend, [0] is the topic and [9] the related queries (the
/// first of which repeats the topic).
pub(crate) fn decode_trends_payload(raw: &str) -> Result<Vec<QueryTerm>, TrendError> {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with('[') && l.ends_with(']'))
        .ok_or_else(|| TrendError::Malformed("no JSON line in envelope".into()))?;
    let envelope: Value = serde_json::from_str(line)
        .map_err(|e| TrendError::Malformed(format!("envelope: {e}")))?;
    let inner_raw = envelope
        .get(0)
        .and_then(|v| v.get(2))
        .and_then(Value::as_str)
        .ok_or_else(|| TrendError::Malformed("missing inner document".into()))?;
    let inner: Value = serde_json::from_str(inner_raw)
        .map_err(|e| TrendError::Malformed(format!("inner document: {e}")))?;
    let entries = inner
        .get(1)
        .and_then(Value::as_array)
        .ok_or_else(|| TrendError::Malformed("missing trend list".into()))?;

    let mut terms = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(topic) = entry.get(0).and_then(Value::as_str) else {
            continue;
        };
        let related = entry
            .get(9)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .skip(1)
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        terms.push(QueryTerm::new(topic, related));
    }
    Ok(terms)
}

#[async_trait]
impl RelatedSource for TrendsClient {
    async fn related(&self, topic: &str) -> Vec<String> {
        let result: Result<Vec<String>, TrendError> = async {
            let value: Value = self
                .http
                .get(&self.cfg.suggestions_url)
                .query(&[("query", topic)])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok(value
                .get(1)
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default())
        }
        .await;
        match result {
            Ok(suggestions) => suggestions,
            Err(err) => {
                warn!(topic = %topic, error = %err, "suggestion lookup failed");
                Vec::new()
            }
        }
    }
}
