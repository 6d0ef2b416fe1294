//! Observes CDP network events to signal when a page has gone "network
//! idle": few enough in-flight requests for long enough, bounded by a
//! global timeout and a safety timer for pages with no traffic at all.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Default number of in-flight requests considered "idle enough".
pub const DEFAULT_NUM_INFLIGHT: usize = 2;
/// Default seconds of quiet required once under the in-flight threshold.
pub const DEFAULT_IDLE_TIME_SECS: u64 = 2;
/// Default overall cap on how long to wait for idle.
pub const DEFAULT_GLOBAL_WAIT_SECS: u64 = 60;
/// Fixed safety timer: if no request activity is observed at all, idle
/// fires after this long regardless of the configured idle time.
const SAFETY_TIMER_SECS: u64 = 5;

struct State {
    active: HashSet<String>,
    idle_timer: Option<JoinHandle<()>>,
    safety_timer: Option<JoinHandle<()>>,
    global_timer: Option<JoinHandle<()>>,
    idle_tx: Option<oneshot::Sender<()>>,
}

/// Tracks in-flight CDP network requests for one page and resolves an
/// idle signal exactly once, then releases every listener and timer.
#[derive(Clone)]
pub struct NetworkIdleMonitor {
    num_inflight: usize,
    idle_time: Duration,
    global_wait: Duration,
    state: Arc<Mutex<State>>,
}

impl NetworkIdleMonitor {
    /// Constructs a monitor with the given thresholds.
    pub fn new(num_inflight: usize, idle_time: Duration, global_wait: Duration) -> Self {
        Self {
            num_inflight,
            idle_time,
            global_wait,
            state: Arc::new(Mutex::new(State {
                active: HashSet::new(),
                idle_timer: None,
                safety_timer: None,
                global_timer: None,
                idle_tx: None,
            })),
        }
    }

    /// Constructs a monitor using the documented defaults (2 in-flight, 2s
    /// idle time, 60s global wait).
    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_NUM_INFLIGHT,
            Duration::from_secs(DEFAULT_IDLE_TIME_SECS),
            Duration::from_secs(DEFAULT_GLOBAL_WAIT_SECS),
        )
    }

    /// Starts watching and returns a future that resolves when network
    /// idle is reached, via whichever of the per-request idle timer, the
    /// no-traffic safety timer, or the global timeout fires first.
    pub async fn wait_for_idle(&self) {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.idle_tx = Some(tx);

            let safety_state = self.state.clone();
            state.safety_timer = Some(tokio::spawn(async move {
                sleep(Duration::from_secs(SAFETY_TIMER_SECS)).await;
                Self::fire(&safety_state).await;
            }));

            let global_state = self.state.clone();
            let global_wait = self.global_wait;
            state.global_timer = Some(tokio::spawn(async move {
                sleep(global_wait).await;
                Self::fire(&global_state).await;
            }));
        }

        let _ = rx.await;
        self.clean_up().await;
    }

    /// Records a `Network.requestWillBeSent` event for `request_id`.
    /// Cancels the no-traffic safety timer unconditionally (activity was
    /// seen), and cancels any pending idle timer if this pushes the
    /// in-flight count above the threshold.
    pub async fn req_started(&self, request_id: &str) {
        let mut state = self.state.lock().await;
        state.active.insert(request_id.to_string());
        if let Some(timer) = state.safety_timer.take() {
            timer.abort();
        }
        if state.active.len() > self.num_inflight {
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
        }
    }

    /// Records a `Network.loadingFinished`/`loadingFailed` event for
    /// `request_id`; starts the idle timer if the in-flight count is now
    /// at or below the threshold and no timer is already running.
    pub async fn req_finished(&self, request_id: &str) {
        let mut state = self.state.lock().await;
        state.active.remove(request_id);
        if state.active.len() <= self.num_inflight && state.idle_timer.is_none() {
            let idle_time = self.idle_time;
            let timer_state = self.state.clone();
            state.idle_timer = Some(tokio::spawn(async move {
                sleep(idle_time).await;
                Self::fire(&timer_state).await;
            }));
        }
    }

    async fn fire(state: &Arc<Mutex<State>>) {
        let mut guard = state.lock().await;
        if let Some(tx) = guard.idle_tx.take() {
            let _ = tx.send(());
        }
    }

    async fn clean_up(&self) {
        let mut state = self.state.lock().await;
        if let Some(t) = state.idle_timer.take() {
            t.abort();
        }
        if let Some(t) = state.safety_timer.take() {
            t.abort();
        }
        if let Some(t) = state.global_timer.take() {
            t.abort();
        }
        state.active.clear();
    }

    /// Number of requests currently considered in-flight.
    pub async fn inflight_count(&self) -> usize {
        self.state.lock().await.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_idle_fires_via_global_timeout_with_no_traffic() {
        let monitor = NetworkIdleMonitor::new(0, Duration::from_secs(30), Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(2), monitor.wait_for_idle())
            .await
            .expect("idle should resolve via global timeout");
    }

    #[tokio::test]
    async fn test_idle_fires_once_requests_settle_under_threshold() {
        let monitor = NetworkIdleMonitor::new(1, Duration::from_millis(10), Duration::from_secs(30));
        let waiter = monitor.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_idle().await;
        });

        monitor.req_started("req-1").await;
        monitor.req_finished("req-1").await;

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("idle should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_req_started_cancels_pending_idle_timer_above_threshold() {
        let monitor = NetworkIdleMonitor::new(1, Duration::from_millis(5), Duration::from_secs(30));
        monitor.req_started("a").await;
        monitor.req_finished("a").await; // idle timer armed (0 active <= 1)
        monitor.req_started("b").await;
        monitor.req_started("c").await; // 2 active > 1: cancels the timer
        assert_eq!(monitor.inflight_count().await, 2);
    }

    #[tokio::test]
    async fn test_req_started_cancels_safety_timer() {
        let monitor = NetworkIdleMonitor::new(0, Duration::from_secs(30), Duration::from_secs(30));
        let waiter = monitor.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_idle().await;
        });
        // Stay above the threshold continuously: the safety timer must not
        // fire idle at 5s, only the (much longer) global timeout should.
        monitor.req_started("a").await;

        let result = tokio::time::timeout(Duration::from_millis(200), handle).await;
        assert!(result.is_err(), "idle should not fire via the cancelled safety timer");
    }

    #[tokio::test]
    async fn test_clean_up_resets_active_set() {
        let monitor = NetworkIdleMonitor::new(0, Duration::from_millis(5), Duration::from_millis(20));
        monitor.req_started("a").await;
        monitor.wait_for_idle().await;
        assert_eq!(monitor.inflight_count().await, 0);
    }

    #[tokio::test]
    async fn test_with_defaults_uses_documented_values() {
        let monitor = NetworkIdleMonitor::with_defaults();
        assert_eq!(monitor.num_inflight, DEFAULT_NUM_INFLIGHT);
        assert_eq!(monitor.idle_time, Duration::from_secs(DEFAULT_IDLE_TIME_SECS));
        assert_eq!(monitor.global_wait, Duration::from_secs(DEFAULT_GLOBAL_WAIT_SECS));
    }
}
