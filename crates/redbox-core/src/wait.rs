//! Wait-for helpers for automation harnesses (no fixed sleeps).
//!
//! Harnesses drive a page, then poll the overlay until it reaches the
//! expected state. Polls back off exponentially and fail with a
//! [`WaitError`] that records the last observed state.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::watch;
use tokio::time::{Duration, Instant, sleep};

use crate::overlay::{OverlayHandle, OverlaySnapshot};
use crate::runtime::RenderActivity;

/// Backoff configuration for wait loops.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Initial delay before the second poll.
    pub initial: Duration,
    /// Maximum delay between polls.
    pub max: Duration,
    /// Multiplicative factor for backoff growth.
    pub factor: u32,
    /// Optional max retry count (inclusive of the first attempt).
    pub max_retries: Option<usize>,
}

impl Backoff {
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(self.factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(500),
            factor: 2,
            max_retries: None,
        }
    }
}

/// Result of a predicate check in a wait loop.
#[derive(Debug, Clone)]
pub enum WaitFor<T> {
    Ready(T),
    NotReady { last_observed: Option<String> },
}

/// A predicate used by [`wait_for`].
pub trait WaitPredicate {
    type Output: Send;

    /// Human-readable description for timeout errors.
    fn describe(&self) -> String;

    /// Execute a single poll.
    fn check(&mut self) -> Pin<Box<dyn Future<Output = WaitFor<Self::Output>> + Send + 'static>>;
}

/// `WaitPredicate` from a description and closure.
pub struct WaitCondition<F> {
    description: String,
    check: F,
}

impl<F> WaitCondition<F> {
    #[must_use]
    pub fn new(description: impl Into<String>, check: F) -> Self {
        Self {
            description: description.into(),
            check,
        }
    }
}

impl<F, Fut, T> WaitPredicate for WaitCondition<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = WaitFor<T>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn describe(&self) -> String {
        self.description.clone()
    }

    fn check(&mut self) -> Pin<Box<dyn Future<Output = WaitFor<Self::Output>> + Send + 'static>> {
        Box::pin((self.check)())
    }
}

/// Timeout error returned by wait helpers.
#[derive(Debug, Clone)]
pub struct WaitError {
    pub expected: String,
    pub last_observed: Option<String>,
    /// Polls attempted, including the first.
    pub retries: usize,
    pub elapsed: Duration,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.last_observed.as_deref().unwrap_or("<none>");
        write!(
            f,
            "timeout waiting for {} after {}ms (retries={}, last_observed={})",
            self.expected,
            self.elapsed.as_millis(),
            self.retries,
            last
        )
    }
}

impl std::error::Error for WaitError {}

/// Poll `predicate` with backoff until it is ready or `timeout` elapses.
pub async fn wait_for<P>(
    mut predicate: P,
    timeout: Duration,
    backoff: Backoff,
) -> Result<P::Output, WaitError>
where
    P: WaitPredicate + Send,
{
    let expected = predicate.describe();
    let start = Instant::now();
    let deadline = start + timeout;
    let mut retries = 0usize;
    let mut delay = backoff.initial;
    let mut last_observed = None;

    loop {
        retries = retries.saturating_add(1);
        match predicate.check().await {
            WaitFor::Ready(value) => return Ok(value),
            WaitFor::NotReady { last_observed: obs } => {
                if obs.is_some() {
                    last_observed = obs;
                }
            }
        }

        let now = Instant::now();
        let retries_exhausted = backoff.max_retries.is_some_and(|max| retries >= max);
        if now >= deadline || retries_exhausted {
            return Err(WaitError {
                expected,
                last_observed,
                retries,
                elapsed: now.saturating_duration_since(start),
            });
        }

        let sleep_for = delay.min(deadline.saturating_duration_since(now));
        if !sleep_for.is_zero() {
            sleep(sleep_for).await;
        }
        delay = backoff.next_delay(delay);
    }
}

fn describe_snapshot(snapshot: &OverlaySnapshot) -> String {
    match snapshot.diagnostic.as_ref() {
        Some(d) => format!(
            "showing epoch={} causes={:?} rebuilding={} seq={}",
            d.epoch,
            d.causes.to_vec(),
            snapshot.rebuilding,
            snapshot.commit_seq
        ),
        None => format!(
            "empty epoch={} rebuilding={} seq={}",
            snapshot.build_epoch, snapshot.rebuilding, snapshot.commit_seq
        ),
    }
}

async fn wait_for_snapshot<F>(
    handle: &OverlayHandle,
    description: &str,
    timeout: Duration,
    accept: F,
) -> Result<OverlaySnapshot, WaitError>
where
    F: Fn(&OverlaySnapshot) -> bool + Clone + Send + 'static,
{
    let handle = handle.clone();
    let condition = WaitCondition::new(description, move || {
        let snapshot = handle.snapshot();
        let accept = accept.clone();
        async move {
            if accept(&snapshot) {
                WaitFor::Ready(snapshot)
            } else {
                WaitFor::NotReady {
                    last_observed: Some(describe_snapshot(&snapshot)),
                }
            }
        }
    });
    wait_for(condition, timeout, Backoff::default()).await
}

/// Wait until the overlay shows a diagnostic.
pub async fn wait_for_redbox(
    handle: &OverlayHandle,
    timeout: Duration,
) -> Result<OverlaySnapshot, WaitError> {
    wait_for_snapshot(handle, "redbox shown", timeout, OverlaySnapshot::has_active).await
}

/// Wait until the overlay is empty and no rebuild is pending.
pub async fn wait_for_no_redbox(
    handle: &OverlayHandle,
    timeout: Duration,
) -> Result<OverlaySnapshot, WaitError> {
    wait_for_snapshot(handle, "no redbox", timeout, |s: &OverlaySnapshot| {
        !s.has_active() && !s.rebuilding
    })
    .await
}

/// Signals used to determine quiescence.
pub trait QuiescenceSignals {
    fn is_quiet(&self, now: Instant) -> bool;
    fn describe(&self, now: Instant) -> String;
}

/// Plain quiescence state for simple callers.
#[derive(Debug, Clone)]
pub struct QuiescenceState {
    pub pending: usize,
    pub last_activity: Option<Instant>,
    pub quiet_window: Duration,
}

impl QuiescenceSignals for QuiescenceState {
    fn is_quiet(&self, now: Instant) -> bool {
        self.pending == 0
            && self
                .last_activity
                .is_none_or(|last| now.saturating_duration_since(last) >= self.quiet_window)
    }

    fn describe(&self, now: Instant) -> String {
        let since_ms = self
            .last_activity
            .map_or(0, |last| now.saturating_duration_since(last).as_millis());
        format!(
            "pending={}, quiet_window_ms={}, since_last_ms={}",
            self.pending,
            self.quiet_window.as_millis(),
            since_ms
        )
    }
}

/// Render activity of one connection viewed as quiescence signals.
#[derive(Debug, Clone)]
pub struct RenderIdle {
    activity: watch::Receiver<RenderActivity>,
    quiet_window: Duration,
}

impl RenderIdle {
    #[must_use]
    pub fn new(activity: watch::Receiver<RenderActivity>, quiet_window: Duration) -> Self {
        Self {
            activity,
            quiet_window,
        }
    }

    fn state(&self) -> QuiescenceState {
        let activity = self.activity.borrow();
        QuiescenceState {
            pending: activity.in_flight,
            last_activity: activity.last_activity,
            quiet_window: self.quiet_window,
        }
    }
}

impl QuiescenceSignals for RenderIdle {
    fn is_quiet(&self, now: Instant) -> bool {
        self.state().is_quiet(now)
    }

    fn describe(&self, now: Instant) -> String {
        self.state().describe(now)
    }
}

/// Wait for quiescence using a custom backoff.
pub async fn wait_for_quiescence<S>(
    signals: S,
    timeout: Duration,
    backoff: Backoff,
) -> Result<(), WaitError>
where
    S: QuiescenceSignals + Clone + Send + Sync + 'static,
{
    let condition = WaitCondition::new("quiescence", move || {
        let now = Instant::now();
        let signals = signals.clone();
        async move {
            if signals.is_quiet(now) {
                WaitFor::Ready(())
            } else {
                WaitFor::NotReady {
                    last_observed: Some(signals.describe(now)),
                }
            }
        }
    });
    wait_for(condition, timeout, backoff).await
}

/// Wait until no render pass is in flight for `quiet_window`.
pub async fn wait_for_render_idle(
    activity: watch::Receiver<RenderActivity>,
    quiet_window: Duration,
    timeout: Duration,
) -> Result<(), WaitError> {
    wait_for_quiescence(RenderIdle::new(activity, quiet_window), timeout, Backoff::default()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::DiagnosticComposer;
    use crate::events::ConnectionId;
    use crate::overlay::OverlaySession;
    use crate::rebuild::{BuildEpoch, EpochClock};
    use crate::signals::{MismatchSignal, NodePath};

    #[test]
    fn backoff_schedule_increases_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(70),
            factor: 2,
            max_retries: None,
        };
        let mut delay = backoff.initial;
        delay = backoff.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(20));
        delay = backoff.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(40));
        delay = backoff.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(70));
        assert_eq!(backoff.next_delay(delay), Duration::from_millis(70));
    }

    #[tokio::test]
    async fn wait_for_redbox_times_out_with_last_state() {
        let session = OverlaySession::new(
            ConnectionId(1),
            EpochClock::shared(),
            DiagnosticComposer::default(),
        );
        let err = wait_for_redbox(&session.handle(), Duration::from_millis(0))
            .await
            .expect_err("should time out");
        assert_eq!(err.expected, "redbox shown");
        assert_eq!(err.retries, 1);
        assert!(err.last_observed.unwrap().starts_with("empty epoch=0"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_redbox_sees_later_commit() {
        let mut session = OverlaySession::new(
            ConnectionId(1),
            EpochClock::shared(),
            DiagnosticComposer::default(),
        );
        let handle = session.handle();
        let waiter =
            tokio::spawn(async move { wait_for_redbox(&handle, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        session.commit_pass(
            BuildEpoch(0),
            vec![MismatchSignal::client(NodePath::parse("span"), "x")],
        );
        let snapshot = waiter.await.unwrap().expect("redbox");
        assert!(snapshot.has_active());
    }

    #[tokio::test]
    async fn no_redbox_ready_immediately_when_empty() {
        let session = OverlaySession::new(
            ConnectionId(2),
            EpochClock::shared(),
            DiagnosticComposer::default(),
        );
        let snapshot = wait_for_no_redbox(&session.handle(), Duration::from_millis(0))
            .await
            .unwrap();
        assert!(!snapshot.has_active());
    }

    #[tokio::test]
    async fn quiescence_respects_pending_work() {
        let busy = QuiescenceState {
            pending: 1,
            last_activity: None,
            quiet_window: Duration::from_millis(0),
        };
        let err = wait_for_quiescence(busy, Duration::from_millis(0), Backoff::default())
            .await
            .unwrap_err();
        assert!(err.last_observed.unwrap().contains("pending=1"));

        let (_tx, rx) = watch::channel(RenderActivity::default());
        assert!(
            wait_for_render_idle(rx, Duration::from_millis(0), Duration::from_millis(0))
                .await
                .is_ok()
        );
    }
}
