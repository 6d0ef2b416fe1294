//! Behavior lifecycle: injecting a page-side automation script and driving
//! it to completion.

pub mod manager;
pub mod runner;

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;

/// The narrow surface a [`runner::BehaviorRunner`] needs from whatever tab
/// it is bound to. Kept as a trait (rather than a concrete `Tab`) so the
/// behavior layer has no dependency on the tab layer; `Tab` implements it.
#[async_trait]
pub trait BehaviorHost: Send + Sync {
    /// Evaluates `expr` in the page's main execution context.
    async fn evaluate_in_page(&self, expr: &str) -> Result<Value>;

    /// Evaluates `expr` in a specific frame with CLI API access.
    async fn evaluate_in_frame(&self, frame_id: &str, expr: &str) -> Result<Value>;

    /// Awaits the host's network-idle signal, capped at `global_wait_secs`.
    async fn wait_for_net_idle(&self, global_wait_secs: u64) -> Result<()>;

    /// Asks the host to harvest outlinks discovered so far and forward them
    /// to wherever it collects them (a crawl frontier, for a [`crate::tab::crawler_tab::CrawlerTab`]).
    /// A no-op by default; only hosts that do something with the harvested
    /// links need to override it.
    async fn harvest_outlinks(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared behavior lifecycle, implemented by [`runner::BehaviorRunner`].
///
/// Mirrors the canonical lifecycle documented in the original source's
/// abstract base: `init` then repeated `run`/`perform_action` until `done`.
#[async_trait]
pub trait Behavior: Send + Sync {
    /// Whether this behavior has finished running.
    fn done(&self) -> bool;

    /// Whether this behavior is currently paused.
    fn paused(&self) -> bool;

    /// Idempotent setup: injects the behavior JS and clears the paused flag.
    async fn init(&self) -> Result<()>;

    /// Runs one next-action step.
    async fn perform_action(&self) -> Result<()>;

    /// Unconditionally marks this behavior finished; the run loop exits at
    /// its next check.
    async fn end(&self);

    /// Drives the behavior to completion, looping `perform_action` until
    /// `done()`.
    async fn run(&self) -> Result<()>;

    /// Runs this behavior with a wall-clock budget; on expiry, the running
    /// evaluation is cancelled and no error is surfaced to the caller.
    async fn timed_run(&self, max_seconds: i64) -> Result<()>;
}
