//! # autobrowser-rs
//!
//! Headless-browser crawling automation driven over the Chrome DevTools
//! Protocol, coordinated through Redis.
//!
//! A running automation provisions one or more Chrome instances (directly,
//! or via the shepherd HTTP service), opens a configured number of tabs
//! against each, and drives each tab as either:
//!
//! - a [`tab::behavior_tab::BehaviorTab`], which runs a single in-page
//!   behavior script against whatever page it is pointed at, restarting the
//!   behavior whenever the page changes; or
//! - a [`tab::crawler_tab::CrawlerTab`], which pulls URLs from a
//!   Redis-backed frontier, runs a behavior on each, and folds any outlinks
//!   it finds back into the frontier.
//!
//! [`driver::single::SingleBrowserDriver`] manages exactly one browser for
//! the lifetime of the process; [`driver::multi::MultiBrowserDriver`]
//! manages a dynamic set of them, added and removed over a shared pub/sub
//! channel. Both report their exit through [`runner::run_to_exit_code`].

pub mod behavior;
pub mod browser;
pub mod cdp;
pub mod config;
pub mod driver;
pub mod error;
pub mod frontier;
pub mod netidle;
pub mod redis_conn;
pub mod runner;
pub mod scope;
pub mod screenshot;
pub mod shutdown;
pub mod tab;
pub mod types;

pub use config::AutomationConfig;
pub use error::{AutomationError, Result};
pub use shutdown::ShutdownCondition;
pub use types::{BrowserExitInfo, CloseReason, TabClosedInfo};
