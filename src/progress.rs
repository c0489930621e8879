//! Progress UI (spinner) for harvest runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use harvester_core::stats::RunStats;
use indicatif::{ProgressBar, ProgressStyle};

const TICK: Duration = Duration::from_millis(120);

pub(crate) fn is_dumb_terminal() -> bool {
    std::env::var("TERM")
        .map(|value| value.eq_ignore_ascii_case("dumb"))
        .unwrap_or(false)
}

pub(crate) fn should_use_spinner(stderr_is_terminal: bool, quiet: bool, dumb_terminal: bool) -> bool {
    stderr_is_terminal && !quiet && !dumb_terminal
}

/// Starts the run spinner on stderr. The returned flag stops it; without a
/// spinner there is no handle and the flag starts out set.
pub(crate) fn spawn_progress_ui(
    use_spinner: bool,
    stats: Arc<RunStats>,
    total: usize,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_spinner {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_spinner(stats, total, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_spinner(
    stats: Arc<RunStats>,
    total: usize,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(TICK);

        while !stop.load(Ordering::SeqCst) {
            spinner.set_message(format!(
                "[{}/{}] {} completed, {} failed, {} in flight",
                stats.finished().min(total),
                total,
                stats.completed(),
                stats.failed(),
                stats.in_flight()
            ));
            tokio::time::sleep(TICK).await;
        }

        spinner.finish_and_clear();
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_spinner_requires_interactive_stderr() {
        assert!(should_use_spinner(true, false, false));
        assert!(!should_use_spinner(false, false, false));
        assert!(!should_use_spinner(true, true, false));
        assert!(!should_use_spinner(true, false, true));
    }

    #[tokio::test]
    async fn test_disabled_ui_returns_no_handle_and_stop_already_true() {
        let (handle, stop) = spawn_progress_ui(false, Arc::new(RunStats::new()), 1);
        assert!(handle.is_none());
        assert!(stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_enabled_ui_stops_on_signal() {
        let (handle, stop) = spawn_progress_ui(true, Arc::new(RunStats::new()), 1);
        assert!(!stop.load(Ordering::SeqCst));
        stop.store(true, Ordering::SeqCst);
        handle.unwrap().await.unwrap();
    }
}
