//! Top-level exit-code-aware process lifecycle.

use std::sync::Arc;

use tracing::error;

use crate::driver::Driver;

/// Runs `driver` to completion, returning the process exit code to use.
///
/// An internal error while running maps to exit code `2`; a clean shutdown
/// (including one triggered by `SIGTERM`) defers to the driver's own
/// [`Driver::determine_exit_code`].
pub async fn run_to_exit_code<D: Driver>(driver: Arc<D>) -> i32 {
    match driver.run().await {
        Ok(()) => driver.determine_exit_code().await,
        Err(e) => {
            error!("driver run failed: {}", e);
            2
        }
    }
}
