use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

/// Linear backoff policy: attempt `n` sleeps `base_delay + step * (n - 1)`
/// before the next try.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub step: Duration,
}

impl Backoff {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay + self.step * attempt.saturating_sub(1)
    }
}

/// What the classifier decided about a failed attempt.
pub enum Verdict {
    /// Transient; recovery (if any) already ran, try again.
    Retry,
    /// Unrecoverable for this session, stop immediately.
    Fatal,
}

/// All attempts failed (or a fatal error cut them short); carries the last
/// underlying error annotated with how many attempts were made.
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {last}")]
pub struct Exhausted<E: fmt::Display + fmt::Debug> {
    pub attempts: u32,
    pub last: E,
}

/// Drive a fallible async operation under the backoff policy. `op` receives
/// the 1-based attempt number; `classify` runs on every failure and may
/// perform recovery side effects (re-navigate, force a reload) before the
/// next attempt, or declare the error fatal. It consumes the error and hands
/// it back so exhaustion can carry the last one.
pub async fn run<T, E, Op, OpFut, Cl, ClFut>(
    policy: &Backoff,
    mut op: Op,
    mut classify: Cl,
) -> Result<T, Exhausted<E>>
where
    E: fmt::Display + fmt::Debug,
    Op: FnMut(u32) -> OpFut,
    OpFut: Future<Output = Result<T, E>>,
    Cl: FnMut(u32, E) -> ClFut,
    ClFut: Future<Output = (E, Verdict)>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(attempt, max, error = %err, "attempt failed");
                let (err, verdict) = classify(attempt, err).await;
                if matches!(verdict, Verdict::Fatal) || attempt >= max {
                    return Err(Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max: u32) -> Backoff {
        Backoff {
            max_attempts: max,
            base_delay: Duration::from_secs(10),
            step: Duration::from_secs(2),
        }
    }

    #[test]
    fn delays_escalate_linearly() {
        let p = policy(5);
        let secs: Vec<u64> = (1..=4).map(|a| p.delay_for(a).as_secs()).collect();
        assert_eq!(secs, vec![10, 12, 14, 16]);
    }

    #[tokio::test(start_paused = true)]
    fn succeeds_on_fifth_attempt_after_full_backoff() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let out = run(
            &policy(5),
            |_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 5 {
                        Err("connection reset")
                    } else {
                        Ok(n)
                    }
                }
            },
            |_attempt, err| async move { (err, Verdict::Retry) },
        )
        .await
        .expect("fifth attempt succeeds");
        assert_eq!(out, 5);
        // Four sleeps: 10s + 12s + 14s + 16s.
        assert_eq!(started.elapsed(), Duration::from_secs(52));
    }

    #[tokio::test(start_paused = true)]
    fn exhaustion_carries_attempt_count_and_last_error() {
        let err = run::<(), _, _, _, _, _>(
            &policy(3),
            |attempt| async move { Err(format!("boom {attempt}")) },
            |_attempt, err| async move { (err, Verdict::Retry) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, "boom 3");
    }

    #[tokio::test(start_paused = true)]
    fn fatal_verdict_short_circuits() {
        let calls = AtomicU32::new(0);
        let err = run::<(), _, _, _, _, _>(
            &policy(5),
            |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("account locked") }
            },
            |_attempt, err| async move { (err, Verdict::Fatal) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
