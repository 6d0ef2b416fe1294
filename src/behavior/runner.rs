//! Drives one JS-based behavior inside a tab until it reports `done`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{timeout, Duration};
use tracing::{debug, error};

use super::{Behavior, BehaviorHost};
use crate::{AutomationError, Result};

/// Default global wait, in seconds, used when a `perform_action` result
/// asks to wait for network idle.
const PERFORM_ACTION_NET_IDLE_WAIT_SECS: u64 = 30;

/// Page-injected expression default, evaluated once per step to advance the
/// behavior: returns `{done: bool, wait?: bool}`.
pub const DEFAULT_NEXT_ACTION_EXPR: &str = "window.$WRIteratorHandler$()";

/// Drives a single JS behavior inside a tab.
///
/// The page is expected to expose a callable "next-action" expression
/// (default [`DEFAULT_NEXT_ACTION_EXPR`]) and a boolean pause flag
/// (`window.$WBBehaviorPaused`).
pub struct BehaviorRunner<H: BehaviorHost> {
    host: Arc<H>,
    behavior_js: String,
    next_action_expression: String,
    collect_outlinks: bool,
    frame: Option<String>,
    initialized: AtomicBool,
    done: AtomicBool,
    paused: AtomicBool,
}

impl<H: BehaviorHost> BehaviorRunner<H> {
    /// Constructs a runner bound to `host`, with the given JS source.
    pub fn new(host: Arc<H>, behavior_js: impl Into<String>) -> Self {
        Self {
            host,
            behavior_js: behavior_js.into(),
            next_action_expression: DEFAULT_NEXT_ACTION_EXPR.to_string(),
            collect_outlinks: false,
            frame: None,
            initialized: AtomicBool::new(false),
            done: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    /// Overrides the default next-action expression.
    pub fn with_next_action_expression(mut self, expr: impl Into<String>) -> Self {
        self.next_action_expression = expr.into();
        self
    }

    /// Enables per-step outlink collection via the tab's harvester.
    pub fn with_collect_outlinks(mut self, collect: bool) -> Self {
        self.collect_outlinks = collect;
        self
    }

    /// Binds this behavior to a specific frame rather than the main page.
    pub fn with_frame(mut self, frame_id: impl Into<String>) -> Self {
        self.frame = Some(frame_id.into());
        self
    }

    async fn evaluate(&self, expr: &str) -> Result<serde_json::Value> {
        match &self.frame {
            Some(frame_id) => self.host.evaluate_in_frame(frame_id, expr).await,
            None => self.host.evaluate_in_page(expr).await,
        }
    }

    /// Evaluates the behavior's own JS source, idempotently, then clears
    /// the paused flag.
    async fn pre_action_init(&self) -> Result<()> {
        if let Err(e) = self.evaluate(&self.behavior_js).await {
            error!("behavior init evaluation failed: {}", e);
            return Err(e);
        }
        self.evaluate("window.$WBBehaviorPaused = false;").await?;
        Ok(())
    }
}

#[async_trait]
impl<H: BehaviorHost> Behavior for BehaviorRunner<H> {
    fn done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pre_action_init().await?;
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn perform_action(&self) -> Result<()> {
        let result = self.evaluate(&self.next_action_expression).await?;
        let wait = result.get("wait").and_then(|v| v.as_bool()).unwrap_or(false);
        let is_done = result.get("done").and_then(|v| v.as_bool()).unwrap_or(false);

        if wait && !is_done {
            self.host
                .wait_for_net_idle(PERFORM_ACTION_NET_IDLE_WAIT_SECS)
                .await?;
        }
        if is_done {
            self.end().await;
        }
        Ok(())
    }

    async fn end(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    async fn run(&self) -> Result<()> {
        self.init().await?;
        let result = async {
            while !self.done() {
                self.perform_action().await?;
                if !self.done() && self.collect_outlinks {
                    if let Err(e) = self.host.harvest_outlinks().await {
                        debug!("mid-run outlink harvest failed: {}", e);
                    }
                }
                tokio::task::yield_now().await;
            }
            Ok(())
        }
        .await;
        if let Err(ref e) = result {
            error!("behavior run aborted: {}", e);
        }
        result
    }

    async fn timed_run(&self, max_seconds: i64) -> Result<()> {
        if max_seconds < 0 {
            return self.run().await;
        }
        match timeout(Duration::from_secs(max_seconds as u64), self.run()).await {
            Ok(result) => result,
            Err(_) => {
                debug!("behavior run exceeded {}s budget, cancelling", max_seconds);
                self.end().await;
                Ok(())
            }
        }
    }
}

impl From<tokio::time::error::Elapsed> for AutomationError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AutomationError::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;

    struct FakeHost {
        /// Queue of canned next-action responses, consumed in order.
        responses: StdMutex<Vec<Value>>,
        evaluated: StdMutex<Vec<String>>,
        net_idle_calls: StdMutex<usize>,
    }

    impl FakeHost {
        fn new(responses: Vec<Value>) -> Self {
            Self {
                responses: StdMutex::new(responses),
                evaluated: StdMutex::new(Vec::new()),
                net_idle_calls: StdMutex::new(0),
            }
        }
    }

    #[async_trait]
    impl BehaviorHost for FakeHost {
        async fn evaluate_in_page(&self, expr: &str) -> Result<Value> {
            self.evaluated.lock().unwrap().push(expr.to_string());
            if expr == DEFAULT_NEXT_ACTION_EXPR {
                let mut queue = self.responses.lock().unwrap();
                if queue.is_empty() {
                    return Ok(json!({"done": true}));
                }
                return Ok(queue.remove(0));
            }
            Ok(Value::Null)
        }

        async fn evaluate_in_frame(&self, _frame_id: &str, expr: &str) -> Result<Value> {
            self.evaluate_in_page(expr).await
        }

        async fn wait_for_net_idle(&self, _global_wait_secs: u64) -> Result<()> {
            *self.net_idle_calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let host = Arc::new(FakeHost::new(vec![]));
        let runner = BehaviorRunner::new(host.clone(), "behaviorSetup();");
        runner.init().await.unwrap();
        runner.init().await.unwrap();
        let evaluated = host.evaluated.lock().unwrap();
        assert_eq!(
            evaluated.iter().filter(|e| *e == "behaviorSetup();").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_run_loops_until_done() {
        let host = Arc::new(FakeHost::new(vec![
            json!({"done": false}),
            json!({"done": false}),
            json!({"done": true}),
        ]));
        let runner = BehaviorRunner::new(host, "");
        runner.run().await.unwrap();
        assert!(runner.done());
    }

    #[tokio::test]
    async fn test_perform_action_waits_for_net_idle_when_requested() {
        let host = Arc::new(FakeHost::new(vec![json!({"wait": true, "done": false})]));
        let runner = BehaviorRunner::new(host.clone(), "");
        runner.perform_action().await.unwrap();
        assert_eq!(*host.net_idle_calls.lock().unwrap(), 1);
        assert!(!runner.done());
    }

    #[tokio::test]
    async fn test_perform_action_done_sets_finished() {
        let host = Arc::new(FakeHost::new(vec![json!({"done": true})]));
        let runner = BehaviorRunner::new(host, "");
        runner.perform_action().await.unwrap();
        assert!(runner.done());
    }

    #[tokio::test]
    async fn test_end_forces_loop_exit() {
        let host = Arc::new(FakeHost::new(vec![
            json!({"done": false}),
            json!({"done": false}),
        ]));
        let runner = BehaviorRunner::new(host, "");
        runner.end().await;
        runner.run().await.unwrap();
        assert!(runner.done());
    }

    #[tokio::test]
    async fn test_timed_run_unbounded_when_negative() {
        let host = Arc::new(FakeHost::new(vec![json!({"done": true})]));
        let runner = BehaviorRunner::new(host, "");
        runner.timed_run(-1).await.unwrap();
        assert!(runner.done());
    }

    #[tokio::test]
    async fn test_timed_run_cancels_on_budget_expiry_without_error() {
        struct HangingHost;
        #[async_trait]
        impl BehaviorHost for HangingHost {
            async fn evaluate_in_page(&self, _expr: &str) -> Result<Value> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!({"done": false}))
            }
            async fn evaluate_in_frame(&self, _f: &str, _e: &str) -> Result<Value> {
                Ok(Value::Null)
            }
            async fn wait_for_net_idle(&self, _g: u64) -> Result<()> {
                Ok(())
            }
        }
        let runner = BehaviorRunner::new(Arc::new(HangingHost), "");
        let result = runner.timed_run(0).await;
        assert!(result.is_ok());
        assert!(runner.done());
    }

    #[tokio::test]
    async fn test_frame_scoped_evaluation_routes_to_frame() {
        struct FrameHost {
            frame_calls: StdMutex<Vec<String>>,
        }
        #[async_trait]
        impl BehaviorHost for FrameHost {
            async fn evaluate_in_page(&self, _expr: &str) -> Result<Value> {
                Ok(json!({"done": true}))
            }
            async fn evaluate_in_frame(&self, frame_id: &str, _expr: &str) -> Result<Value> {
                self.frame_calls.lock().unwrap().push(frame_id.to_string());
                Ok(json!({"done": true}))
            }
            async fn wait_for_net_idle(&self, _g: u64) -> Result<()> {
                Ok(())
            }
        }
        let host = Arc::new(FrameHost {
            frame_calls: StdMutex::new(Vec::new()),
        });
        let runner = BehaviorRunner::new(host.clone(), "").with_frame("frame-42");
        runner.perform_action().await.unwrap();
        assert_eq!(host.frame_calls.lock().unwrap().as_slice(), ["frame-42"]);
    }
}
