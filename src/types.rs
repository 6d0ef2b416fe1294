//! Shared value types describing how tabs and browsers end their lifetime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The reason a [`crate::tab::Tab`] (and transitively a
/// [`crate::browser::Browser`]) stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// Shut down cooperatively, draining any in-flight work first.
    Gracefully,
    /// The CDP WebSocket connection closed unexpectedly.
    ConnectionClosed,
    /// `Inspector.targetCrashed` fired.
    TargetCrashed,
    /// Closed without a more specific reason (forced close).
    Closed,
    /// A CrawlerTab's frontier was exhausted.
    CrawlEnd,
    /// No close has happened yet.
    None,
}

impl CloseReason {
    /// Maps a close reason to the portion of the process exit code it
    /// contributes: `TargetCrashed`/`ConnectionClosed` are abnormal (2),
    /// everything else is normal (0).
    pub fn exit_code(self) -> i32 {
        match self {
            CloseReason::TargetCrashed | CloseReason::ConnectionClosed => 2,
            _ => 0,
        }
    }
}

/// Recorded reason a single tab closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabClosedInfo {
    /// Identifier of the tab that closed.
    pub tab_id: String,
    /// Why it closed.
    pub reason: CloseReason,
}

impl TabClosedInfo {
    /// Constructs a new closed-tab record.
    pub fn new(tab_id: impl Into<String>, reason: CloseReason) -> Self {
        Self {
            tab_id: tab_id.into(),
            reason,
        }
    }
}

/// Emitted exactly once by a [`crate::browser::Browser`] when it finishes
/// closing all of its tabs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserExitInfo {
    /// Identifier of the automation this browser ran.
    pub autoid: String,
    /// Identifier of the provisioning request that created this browser.
    pub reqid: String,
    /// Close reason recorded for every tab this browser owned.
    pub tab_closed_reasons: Vec<TabClosedInfo>,
}

impl BrowserExitInfo {
    /// Constructs a new exit record.
    pub fn new(
        autoid: impl Into<String>,
        reqid: impl Into<String>,
        tab_closed_reasons: Vec<TabClosedInfo>,
    ) -> Self {
        Self {
            autoid: autoid.into(),
            reqid: reqid.into(),
            tab_closed_reasons,
        }
    }

    /// Maps this browser's tab-closed reasons to a single exit code.
    ///
    /// A single reason is used directly; with multiple reasons the
    /// plurality (most common) reason's code wins, mirroring the original
    /// `Counter`-based vote.
    pub fn exit_reason_code(&self) -> i32 {
        match self.tab_closed_reasons.as_slice() {
            [] => 0,
            [only] => only.reason.exit_code(),
            many => {
                let mut counts: HashMap<CloseReason, usize> = HashMap::new();
                for info in many {
                    *counts.entry(info.reason).or_insert(0) += 1;
                }
                counts
                    .into_iter()
                    .max_by_key(|(_, count)| *count)
                    .map(|(reason, _)| reason.exit_code())
                    .unwrap_or(0)
            }
        }
    }
}
