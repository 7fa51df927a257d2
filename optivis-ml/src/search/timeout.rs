//! Wall-clock limits for candidate fits.
//!
//! Model fits cannot be interrupted, so a limited candidate runs on its own
//! thread and the driver stops waiting once the limit expires. The abandoned
//! thread finishes in the background and its result is dropped. Drivers
//! treat [`MlError::Timeout`] as a skipped candidate, never as a failure.

use crate::error::MlError;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Run `work`, giving up after `limit` with [`MlError::Timeout`].
///
/// Without a limit `work` runs on the calling thread.
pub fn run_with_timeout<T, F>(limit: Option<Duration>, label: &str, work: F) -> Result<T, MlError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, MlError> + Send + 'static,
{
    let Some(limit) = limit else {
        return work();
    };

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("optivis-candidate".into())
        .spawn(move || {
            // The receiver is gone once the driver has given up.
            let _ = tx.send(work());
        })?;

    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(MlError::Timeout(format!(
            "candidate {label} exceeded {:.1}s",
            limit.as_secs_f64()
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(MlError::search(format!(
            "candidate {label} stopped without a result"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_without_limit_runs_inline() {
        let out = run_with_timeout(None, "inline", || Ok(7)).unwrap();
        assert_eq!(out, 7);
    }

    #[test]
    fn test_fast_work_finishes() {
        let out = run_with_timeout(Some(Duration::from_secs(5)), "fast", || Ok("done")).unwrap();
        assert_eq!(out, "done");
    }

    #[test]
    fn test_slow_work_times_out() {
        let out = run_with_timeout(Some(Duration::from_millis(20)), "slow", || {
            thread::sleep(Duration::from_millis(500));
            Ok(1)
        });
        assert!(matches!(out, Err(MlError::Timeout(_))));
    }

    #[test]
    fn test_errors_propagate() {
        let out: Result<(), MlError> =
            run_with_timeout(Some(Duration::from_secs(5)), "bad", || Err(MlError::model("boom")));
        assert!(matches!(out, Err(MlError::Model(_))));
    }

    #[test]
    fn test_panicking_work_is_a_search_error() {
        let out: Result<(), MlError> =
            run_with_timeout(Some(Duration::from_secs(5)), "panic", || panic!("fit exploded"));
        assert!(matches!(out, Err(MlError::Search(_))));
    }
}
