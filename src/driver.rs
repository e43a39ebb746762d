use crate::accounting::{self, DeviceMode};
use crate::retry::Exhausted;
use crate::snapshot::{Counters, FetchError};
use async_trait::async_trait;
use nanoid::nanoid;
use rand::rngs::StdRng;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

// ========================= Core Types =========================

/// One candidate topic with the related queries the trends feed attached
/// to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryTerm {
    pub topic: String,
    pub related: Vec<String>,
}

impl QueryTerm {
    pub fn new(topic: impl Into<String>, related: Vec<String>) -> Self {
        Self {
            topic: topic.into(),
            related,
        }
    }
}

/// Why the driver stopped short of its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// Mobile session made no progress for too long; likely a bad
    /// environment, not worth expanding.
    StuckMobile,
    /// Fallback phase made no progress for too long.
    StuckExpansion,
    /// Every usable query was spent and the target is still unmet.
    TermsExhausted,
}

/// Terminal state of one farming session. An abort is a normal outcome for
/// the caller, never an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed {
        current: u32,
        total: u32,
        target: u32,
    },
    Aborted {
        reason: AbortReason,
    },
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Fetch(#[from] Exhausted<FetchError>),
}

/// Progress bookkeeping threaded through the loop. The transition is pure so
/// the stuck rule can be tested without any I/O.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopState {
    pub missing: u32,
    pub stuck: u32,
}

impl LoopState {
    pub fn new(missing: u32) -> Self {
        Self { missing, stuck: 0 }
    }

    /// Fold in a fresh missing-points reading: no movement bumps the stuck
    /// counter, any movement resets it.
    pub fn observe(self, new_missing: u32) -> Self {
        let stuck = if new_missing == self.missing {
            self.stuck + 1
        } else {
            0
        };
        Self {
            missing: new_missing,
            stuck,
        }
    }
}

// ========================= Pluggable Subsystems =========================

/// Source of fresh point counters (the dashboard fetcher in production).
#[async_trait]
pub trait PointSource: Send + Sync {
    async fn counters(&self) -> Result<Counters, Exhausted<FetchError>>;
}

/// Performs one remote search action. Failures are reported but non-fatal;
/// the driver observes progress through the point source either way.
#[async_trait]
pub trait SearchAction: Send + Sync {
    async fn search(&self, query: &str) -> Result<(), crate::surface::SurfaceError>;
}

/// Secondary lookup used in the fallback phase. A lookup failure yields an
/// empty list, which the driver simply skips.
#[async_trait]
pub trait RelatedSource: Send + Sync {
    async fn related(&self, topic: &str) -> Vec<String>;
}

#[async_trait]
impl<S: crate::surface::Surface> PointSource for crate::snapshot::DashboardFetcher<S> {
    async fn counters(&self) -> Result<Counters, Exhausted<FetchError>> {
        Ok(self.fetch().await?.user_status.counters)
    }
}

// ========================= Driver =========================

#[derive(Clone, Copy, Debug)]
pub struct DriverConfig {
    pub mode: DeviceMode,
    /// Primary loop: this many consecutive no-progress searches trips the
    /// fallback phase.
    pub primary_stuck_limit: u32,
    /// Mobile sessions give up earlier instead of expanding.
    pub mobile_stuck_limit: u32,
    /// Patience in the fallback phase is tighter than in the primary loop.
    pub expansion_stuck_limit: u32,
}

impl DriverConfig {
    pub fn desktop() -> Self {
        Self {
            mode: DeviceMode::Desktop,
            primary_stuck_limit: 10,
            mobile_stuck_limit: 5,
            expansion_stuck_limit: 5,
        }
    }

    pub fn mobile() -> Self {
        Self {
            mode: DeviceMode::Mobile,
            ..Self::desktop()
        }
    }
}

/// Sequential search loop: run an action, re-read the ledger, decide whether
/// to continue, expand into related terms, or stop. Owns the only logical
/// writer handle for the session's automation surface.
pub struct SearchDriver<P, A, R> {
    points: P,
    action: A,
    related: R,
    cfg: DriverConfig,
    rng: StdRng,
    session: String,
}

impl<P, A, R> SearchDriver<P, A, R>
where
    P: PointSource,
    A: SearchAction,
    R: RelatedSource,
{
    pub fn new(points: P, action: A, related: R, cfg: DriverConfig, rng: StdRng) -> Self {
        Self {
            points,
            action,
            related,
            cfg,
            rng,
            session: nanoid!(),
        }
    }

    /// Flatten the term list into the ordered query sequence for this device
    /// mode, deduplicated by value.
    fn build_queries(terms: &[QueryTerm], mode: DeviceMode) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queries = Vec::new();
        for term in terms {
            if seen.insert(term.topic.clone()) {
                queries.push(term.topic.clone());
            }
            // Mobile result pages choke on related queries, keep topics only.
            if !mode.is_mobile() {
                for related in &term.related {
                    if seen.insert(related.clone()) {
                        queries.push(related.clone());
                    }
                }
            }
        }
        queries
    }

    pub async fn run(&mut self, terms: &[QueryTerm]) -> Result<Outcome, DriverError> {
        let mode = self.cfg.mode;
        let counters = self.points.counters().await?;
        let missing = accounting::missing_points(&counters, mode);
        let total = accounting::total_possible(&counters, mode);
        if missing == 0 {
            info!(session = %self.session, "searches already completed");
            return Ok(Outcome::Completed {
                current: accounting::current_points(&counters, mode),
                total,
                target: accounting::current_points(&counters, mode),
            });
        }

        // The cutoff is drawn once against the first snapshot and kept for
        // the whole session, even if the remote total moves later.
        let target = accounting::search_target(total, &mut self.rng);
        info!(
            session = %self.session,
            mobile = mode.is_mobile(),
            target,
            total,
            missing,
            "starting search session"
        );

        let queries = Self::build_queries(terms, mode);
        let mut state = LoopState::new(missing);
        let mut tripped_fallback = false;

        for query in &queries {
            info!(session = %self.session, remaining = state.missing, query = %query, "running search");
            if let Err(err) = self.action.search(query).await {
                warn!(session = %self.session, query = %query, error = %err, "search action failed");
            }
            let counters = self.points.counters().await?;
            state = state.observe(accounting::missing_points(&counters, mode));

            if accounting::current_points(&counters, mode) >= target {
                info!(session = %self.session, target, "reached session target");
                return self.finish(target).await;
            }
            if mode.is_mobile() && state.stuck > self.cfg.mobile_stuck_limit {
                warn!(
                    session = %self.session,
                    iterations = state.stuck,
                    "no point movement on mobile, likely a bad user agent"
                );
                return Ok(Outcome::Aborted {
                    reason: AbortReason::StuckMobile,
                });
            }
            if state.stuck > self.cfg.primary_stuck_limit {
                warn!(
                    session = %self.session,
                    iterations = state.stuck,
                    "no point movement, switching to related terms"
                );
                state.stuck = 0;
                tripped_fallback = true;
                break;
            }
        }

        if mode.is_mobile() {
            return Ok(Outcome::Aborted {
                reason: AbortReason::TermsExhausted,
            });
        }
        if !tripped_fallback {
            info!(
                session = %self.session,
                remaining = state.missing,
                "primary queries spent below target, expanding with related terms"
            );
        }

        // Fallback phase: mine each topic's related terms for a couple of
        // extra searches.
        for term in terms {
            let related = self.related.related(&term.topic).await;
            if related.len() <= 3 {
                continue;
            }
            for query in &related[1..3] {
                info!(session = %self.session, remaining = state.missing, query = %query, "running fallback search");
                if let Err(err) = self.action.search(query).await {
                    warn!(session = %self.session, query = %query, error = %err, "search action failed");
                }
                let counters = self.points.counters().await?;
                state = state.observe(accounting::missing_points(&counters, mode));

                if accounting::current_points(&counters, mode) >= target {
                    info!(session = %self.session, target, "reached session target");
                    return self.finish(target).await;
                }
                if state.stuck > self.cfg.expansion_stuck_limit {
                    warn!(
                        session = %self.session,
                        iterations = state.stuck,
                        "fallback searches made no progress, giving up"
                    );
                    return Ok(Outcome::Aborted {
                        reason: AbortReason::StuckExpansion,
                    });
                }
            }
        }

        Ok(Outcome::Aborted {
            reason: AbortReason::TermsExhausted,
        })
    }

    /// Log the final completion ratio against a fresh snapshot. The target
    /// deliberately stays the one drawn at session start.
    async fn finish(&self, target: u32) -> Result<Outcome, DriverError> {
        let counters = self.points.counters().await?;
        let current = accounting::current_points(&counters, self.cfg.mode);
        let total = accounting::total_possible(&counters, self.cfg.mode);
        let ratio = if total > 0 {
            f64::from(current) / f64::from(total) * 100.0
        } else {
            100.0
        };
        info!(
            session = %self.session,
            current,
            total,
            target,
            ratio = format!("{ratio:.1}%"),
            "search session completed"
        );
        Ok(Outcome::Completed {
            current,
            total,
            target,
        })
    }
}
