use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::query::window::Window;

/// Concurrency and timeout limits for one request's windows.
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub window_timeout: Duration,
}

impl BatchSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            window_timeout: config.window_timeout(),
        }
    }
}

/// Per-window values in window order. Failed windows hold `T::default()`
/// and are listed in `degraded` by label.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub windows: Vec<Window>,
    pub values: Vec<T>,
    pub degraded: Vec<String>,
}

impl<T> BatchOutcome<T> {
    pub fn iter(&self) -> impl Iterator<Item = (&Window, &T)> {
        self.windows.iter().zip(self.values.iter())
    }
}

/// Run `compute` once per window, `batch_size` windows at a time.
///
/// Batches run one after another; windows inside a batch run concurrently.
/// A window that errors transiently or times out is retried once, then
/// zeroed. Configuration errors abort the whole run.
pub async fn run_windows<T, F, Fut>(
    windows: Vec<Window>,
    settings: BatchSettings,
    compute: F,
) -> Result<BatchOutcome<T>>
where
    T: Default + Send + 'static,
    F: Fn(Window) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let batch_size = settings.batch_size.max(1);
    let compute = Arc::new(compute);
    let mut slots: Vec<Option<T>> = windows.iter().map(|_| None).collect();

    for (batch_idx, batch) in windows.chunks(batch_size).enumerate() {
        let mut set = JoinSet::new();

        for (offset, window) in batch.iter().enumerate() {
            let index = batch_idx * batch_size + offset;
            let compute = Arc::clone(&compute);
            let window = window.clone();
            let after = settings.window_timeout;
            set.spawn(async move {
                let result = with_retry(compute.as_ref(), &window, after).await;
                (index, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(value))) => slots[index] = Some(value),
                Ok((index, Err(e))) if e.is_configuration() => {
                    log::warn!("Window {} rejected: {e}", windows[index].label);
                    set.abort_all();
                    return Err(e);
                }
                Ok((index, Err(e))) => {
                    log::warn!("Window {} zeroed after failure: {e}", windows[index].label);
                }
                Err(e) => log::error!("Window task panicked: {e}"),
            }
        }
    }

    let mut degraded = Vec::new();
    let values = slots
        .into_iter()
        .zip(windows.iter())
        .map(|(slot, window)| {
            slot.unwrap_or_else(|| {
                degraded.push(window.label.clone());
                T::default()
            })
        })
        .collect();

    Ok(BatchOutcome {
        windows,
        values,
        degraded,
    })
}

async fn with_retry<T, F, Fut>(compute: &F, window: &Window, after: Duration) -> Result<T>
where
    F: Fn(Window) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match attempt(compute, window, after).await {
        Err(e) if e.is_transient() => {
            log::warn!("Window {} failed ({e}), retrying once", window.label);
            attempt(compute, window, after).await
        }
        other => other,
    }
}

async fn attempt<T, F, Fut>(compute: &F, window: &Window, after: Duration) -> Result<T>
where
    F: Fn(Window) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    tokio::time::timeout(after, compute(window.clone()))
        .await
        .map_err(|_| Error::Timeout {
            label: window.label.clone(),
            after,
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_util::parse_ts;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn windows(n: usize) -> Vec<Window> {
        let start = parse_ts("2025-01-01").unwrap();
        (0..n)
            .map(|i| {
                let s = start + ChronoDuration::days(i as i64);
                Window::new(s, Some(s + ChronoDuration::days(1)), format!("w{i}"))
            })
            .collect()
    }

    fn settings(batch_size: usize, timeout_ms: u64) -> BatchSettings {
        BatchSettings {
            batch_size,
            window_timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn index_of(w: &Window) -> usize {
        w.label[1..].parse().unwrap()
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_and_order_preserved() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());

        let outcome = run_windows(windows(12), settings(5, 5_000), move |w| {
            let (f, p) = (f.clone(), p.clone());
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                // Later windows finish first
                let i = index_of(&w);
                tokio::time::sleep(Duration::from_millis(30 - i as u64 * 2)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok::<u64, Error>(i as u64)
            }
        })
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(outcome.values, (0..12).collect::<Vec<u64>>());
        assert!(outcome.degraded.is_empty());
        let labels: Vec<&str> = outcome.iter().map(|(w, _)| w.label.as_str()).collect();
        assert_eq!(labels[0], "w0");
        assert_eq!(labels[11], "w11");
    }

    #[tokio::test]
    async fn test_failed_window_is_zeroed_not_fatal() {
        let outcome = run_windows(windows(4), settings(2, 5_000), |w| async move {
            if w.label == "w2" {
                Err(Error::Other("corrupt row".into()))
            } else {
                Ok(10u64)
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.values, vec![10, 10, 0, 10]);
        assert_eq!(outcome.degraded, vec!["w2".to_string()]);
    }

    #[tokio::test]
    async fn test_transient_error_retried_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        let outcome = run_windows(windows(2), settings(5, 5_000), move |w| {
            let c = c.clone();
            async move {
                let attempts = {
                    let mut calls = c.lock().unwrap();
                    calls.push(w.label.clone());
                    calls.iter().filter(|l| **l == w.label).count()
                };
                match (w.label.as_str(), attempts) {
                    ("w0", 1) => Err(Error::Database("database is locked".into())),
                    ("w1", _) => Err(Error::Database("disk I/O error".into())),
                    _ => Ok(1u64),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.values, vec![1, 0]);
        assert_eq!(outcome.degraded, vec!["w1".to_string()]);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|l| *l == "w0").count(), 2);
        assert_eq!(calls.iter().filter(|l| *l == "w1").count(), 2);
    }

    #[tokio::test]
    async fn test_timeout_degrades_window() {
        let outcome = run_windows(windows(3), settings(3, 20), |w| async move {
            if w.label == "w1" {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok(7u64)
        })
        .await
        .unwrap();

        assert_eq!(outcome.values, vec![7, 0, 7]);
        assert_eq!(outcome.degraded, vec!["w1".to_string()]);
    }

    #[tokio::test]
    async fn test_configuration_error_propagates() {
        let result = run_windows(windows(3), settings(3, 5_000), |w| async move {
            if w.label == "w1" {
                Err(Error::Config("bad range".into()))
            } else {
                Ok(1u64)
            }
        })
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_typed_timeout_error() {
        let w = &windows(1)[0];
        let slow = |_w: Window| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<u64, Error>(1)
        };
        let err = attempt(&slow, w, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { ref label, .. } if label == "w0"));
    }
}
