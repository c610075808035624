//! Fetcher - source runs into Run Descriptors
//!
//! Metric history retrieval dominates migration latency, so per-run
//! fetches run on a bounded rayon pool of `dry_run_thread_pool_size`
//! workers. Workers share nothing mutable: each sends `(index, result)`
//! through a bounded queue to the single coordinator (the calling
//! thread), which restores listing order before handing results on.
//! Destination-side creation order is therefore the same for every pool
//! size.
//!
//! A worker may only claim a run fewer than `2 × pool` positions past
//! the last delivered one. One slow run therefore stalls the pool
//! instead of letting finished descriptors pile up in the reorder buffer.
//!
//! ```text
//! worker 0 ─┐
//! worker 1 ─┼─> bounded mpsc (2 × pool) ─> coordinator ─> reorder ─> deliver
//! worker N ─┘
//! ```

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{SourceClient, SourceRun};
use crate::config::MAX_THREAD_POOL_SIZE;
use crate::convert::{config_to_params, history_to_metrics, is_dual_writing, system_history_to_metrics};
use crate::experiment::{MetricFilter, RunDescriptor, RunSelector};
use crate::{Error, Result};

/// Pulls runs of one source project into descriptors.
pub struct Fetcher<'a> {
    source: &'a dyn SourceClient,
    filter: &'a MetricFilter,
    selector: &'a RunSelector,
    pool_size: usize,
}

impl<'a> Fetcher<'a> {
    /// Create a fetcher. `pool_size` is clamped to `1..=MAX_THREAD_POOL_SIZE`.
    #[must_use]
    pub fn new(
        source: &'a dyn SourceClient,
        filter: &'a MetricFilter,
        selector: &'a RunSelector,
        pool_size: usize,
    ) -> Self {
        Self {
            source,
            filter,
            selector,
            pool_size: pool_size.clamp(1, MAX_THREAD_POOL_SIZE),
        }
    }

    /// Worker pool size.
    #[must_use]
    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// List the project's runs admitted by the run selector, in source order.
    ///
    /// Runs outside the allow-list are never fetched.
    ///
    /// # Errors
    ///
    /// Returns error if the source cannot list the project
    pub fn list_candidates(&self, project: &str) -> Result<Vec<SourceRun>> {
        let runs = self.source.list_runs(project)?;
        let total = runs.len();
        let admitted: Vec<SourceRun> = runs
            .into_iter()
            .filter(|run| {
                let admitted = self.selector.admits(&run.name);
                if !admitted {
                    debug!(project, run = %run.name, "run not in allow-list, skipping");
                }
                admitted
            })
            .collect();
        info!(project, total, admitted = admitted.len(), "listed source runs");
        Ok(admitted)
    }

    /// Fetch one run's history and build its descriptor.
    ///
    /// # Errors
    ///
    /// Returns `Error::Fetch` if the source fails and `Error::MalformedRun`
    /// if the run lacks an id or name
    pub fn fetch_run(&self, project: &str, run: &SourceRun) -> Result<RunDescriptor> {
        let fetch_error = |err: Error| Error::Fetch {
            run: run.name.clone(),
            reason: err.to_string(),
        };
        let history = self
            .source
            .metric_history(project, &run.run_id)
            .map_err(fetch_error)?;
        let system_history = self
            .source
            .system_metric_history(project, &run.run_id)
            .map_err(fetch_error)?;
        debug!(
            run = %run.name,
            history_rows = history.len(),
            system_rows = system_history.len(),
            "fetched run history"
        );

        RunDescriptor::builder()
            .run_id(run.run_id.as_str())
            .name(run.name.as_str())
            .group(run.group.clone())
            .params(config_to_params(&run.config))
            .metrics(history_to_metrics(&history))
            .system_metrics(system_history_to_metrics(&system_history))
            .tags(run.tags.clone())
            .status(run.status)
            .created_at(Some(run.created_at))
            .dual_writing(is_dual_writing(&run.config))
            .build(self.filter)
    }

    /// Fetch every run and hand each result to `deliver` in `runs` order.
    ///
    /// `deliver` receives the index into `runs` alongside the result and
    /// always runs on the calling thread. Per-run failures arrive as `Err`
    /// items; an `Err` returned by `deliver` stops outstanding fetches and
    /// is returned.
    ///
    /// # Panics
    ///
    /// With a pool larger than one the coordinator blocks on the result
    /// queue, which panics if called from within an async runtime.
    ///
    /// # Errors
    ///
    /// Returns the first error from `deliver`, or `Error::QueueClosed` if
    /// the workers stopped before every run was delivered
    pub fn fetch_each<F>(&self, project: &str, runs: &[SourceRun], mut deliver: F) -> Result<()>
    where
        F: FnMut(usize, Result<RunDescriptor>) -> Result<()>,
    {
        if self.pool_size == 1 || runs.len() < 2 {
            for (index, run) in runs.iter().enumerate() {
                deliver(index, self.fetch_logged(project, run))?;
            }
            return Ok(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.pool_size)
            .thread_name(|i| format!("fetch-worker-{i}"))
            .build()
            .map_err(|e| Error::Other(format!("Failed to start fetch worker pool: {e}")))?;
        let window = self.window();
        let (sender, mut receiver) = mpsc::channel::<(usize, Result<RunDescriptor>)>(window);
        let claims = ClaimWindow::new(window);

        std::thread::scope(|scope| {
            let claims = &claims;
            scope.spawn(move || {
                pool.scope(|workers| {
                    for _ in 0..self.pool_size {
                        let sender = sender.clone();
                        workers.spawn(move |_| {
                            while let Some(index) = claims.claim(runs.len()) {
                                let result = self.fetch_logged(project, &runs[index]);
                                if sender.blocking_send((index, result)).is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    drop(sender);
                });
            });

            let mut reorder: BTreeMap<usize, Result<RunDescriptor>> = BTreeMap::new();
            let mut delivered = 0;
            let mut outcome = Ok(());
            'drain: while let Some((index, result)) = receiver.blocking_recv() {
                reorder.insert(index, result);
                while let Some(result) = reorder.remove(&delivered) {
                    if let Err(err) = deliver(delivered, result) {
                        claims.cancel();
                        outcome = Err(err);
                        break 'drain;
                    }
                    delivered += 1;
                    claims.advance(delivered);
                }
            }
            // Workers blocked on a full queue see the closed receiver and stop.
            claims.cancel();
            drop(receiver);
            if outcome.is_ok() && delivered < runs.len() {
                outcome = Err(Error::QueueClosed);
            }
            outcome
        })
    }

    /// Most runs fetched but not yet delivered at any time.
    ///
    /// Workers never claim a run at or beyond `delivered + window`, so the
    /// result queue and the reorder buffer together never hold more.
    #[must_use]
    pub const fn window(&self) -> usize {
        self.pool_size.saturating_mul(2)
    }

    fn fetch_logged(&self, project: &str, run: &SourceRun) -> Result<RunDescriptor> {
        let result = self.fetch_run(project, run);
        if let Err(err) = &result {
            warn!(project, run = %run.name, error = %err, "failed to fetch run");
        }
        result
    }
}

/// Hands out run indices in order, at most `window` ahead of delivery.
struct ClaimWindow {
    state: Mutex<ClaimState>,
    moved: Condvar,
    window: usize,
}

struct ClaimState {
    next: usize,
    delivered: usize,
    cancelled: bool,
}

impl ClaimWindow {
    fn new(window: usize) -> Self {
        Self {
            state: Mutex::new(ClaimState {
                next: 0,
                delivered: 0,
                cancelled: false,
            }),
            moved: Condvar::new(),
            window: window.max(1),
        }
    }

    /// Next index to fetch, blocking while the window is full.
    /// `None` once every index is claimed or the fetch was cancelled.
    fn claim(&self, len: usize) -> Option<usize> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.cancelled || state.next >= len {
                return None;
            }
            if state.next < state.delivered.saturating_add(self.window) {
                let index = state.next;
                state.next += 1;
                return Some(index);
            }
            state = self.moved.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn advance(&self, delivered: usize) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).delivered = delivered;
        self.moved.notify_all();
    }

    fn cancel(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).cancelled = true;
        self.moved.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemorySource;
    use crate::convert::HistoryRow;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn row(value: serde_json::Value) -> HistoryRow {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("history rows are objects"),
        }
    }

    fn source_with_runs(count: usize) -> MemorySource {
        let source = MemorySource::new();
        for i in 0..count {
            let mut run = SourceRun::new(format!("r{i}"), format!("run-{i}"));
            run.config.insert("lr".to_string(), json!(0.1));
            source.add_run(
                "demo",
                run,
                vec![
                    row(json!({"_step": 0, "_timestamp": 1.0, "loss": 1.0, "acc": 0.1})),
                    row(json!({"_step": 1, "_timestamp": 2.0, "loss": 0.5})),
                ],
                vec![row(json!({"system.cpu": 12.5}))],
            );
        }
        source
    }

    #[test]
    fn test_fetch_run_builds_descriptor() {
        let source = source_with_runs(1);
        let filter = MetricFilter::none();
        let selector = RunSelector::all();
        let fetcher = Fetcher::new(&source, &filter, &selector, 1);
        let runs = fetcher.list_candidates("demo").unwrap();

        let run = fetcher.fetch_run("demo", &runs[0]).unwrap();
        assert_eq!(run.run_id(), "r0");
        assert_eq!(run.params().len(), 1);
        assert_eq!(run.metrics()["loss"].len(), 2);
        // Single-point metrics move to step 0.
        assert_eq!(run.metrics()["acc"][0].step(), 0);
        assert!(run.created_at().is_some());
    }

    #[test]
    fn test_selector_limits_candidates() {
        let source = source_with_runs(3);
        let filter = MetricFilter::none();
        let selector = RunSelector::new(&["run-1"]).unwrap();
        let fetcher = Fetcher::new(&source, &filter, &selector, 1);
        let names: Vec<String> = fetcher
            .list_candidates("demo")
            .unwrap()
            .into_iter()
            .map(|run| run.name)
            .collect();
        assert_eq!(names, vec!["run-1"]);
    }

    #[test]
    fn test_fetch_failure_is_per_run() {
        let source = source_with_runs(3);
        source.fail_fetches_for("r1");
        let filter = MetricFilter::none();
        let selector = RunSelector::all();
        let fetcher = Fetcher::new(&source, &filter, &selector, 1);
        let runs = fetcher.list_candidates("demo").unwrap();

        let mut outcomes = Vec::new();
        fetcher
            .fetch_each("demo", &runs, |index, result| {
                outcomes.push((index, result.is_ok()));
                Ok(())
            })
            .unwrap();
        assert_eq!(outcomes, vec![(0, true), (1, false), (2, true)]);
    }

    #[test]
    fn test_pool_delivers_in_listing_order() {
        let source = source_with_runs(25);
        source.fail_fetches_for("r7");
        let filter = MetricFilter::new(&["acc"]).unwrap();
        let selector = RunSelector::all();
        let fetcher = Fetcher::new(&source, &filter, &selector, 4);
        let runs = fetcher.list_candidates("demo").unwrap();

        let mut seen = Vec::new();
        fetcher
            .fetch_each("demo", &runs, |index, result| {
                match result {
                    Ok(run) => {
                        assert_eq!(run.run_id(), format!("r{index}"));
                        assert!(!run.metrics().contains_key("acc"));
                    }
                    Err(err) => assert!(matches!(err, Error::Fetch { .. })),
                }
                seen.push(index);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, (0..25).collect::<Vec<_>>());
    }

    /// Counts history fetches and holds `r0` back so later runs finish first.
    struct SlowFirstRun {
        inner: MemorySource,
        started: AtomicUsize,
    }

    impl SourceClient for SlowFirstRun {
        fn list_projects(&self) -> Result<Vec<String>> {
            self.inner.list_projects()
        }

        fn list_runs(&self, project: &str) -> Result<Vec<SourceRun>> {
            self.inner.list_runs(project)
        }

        fn get_run(&self, project: &str, run_id: &str) -> Result<SourceRun> {
            self.inner.get_run(project, run_id)
        }

        fn metric_history(&self, project: &str, run_id: &str) -> Result<Vec<HistoryRow>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if run_id == "r0" {
                std::thread::sleep(Duration::from_millis(300));
            }
            self.inner.metric_history(project, run_id)
        }

        fn system_metric_history(&self, project: &str, run_id: &str) -> Result<Vec<HistoryRow>> {
            self.inner.system_metric_history(project, run_id)
        }
    }

    #[test]
    fn test_slow_run_bounds_fetched_but_undelivered() {
        let source = SlowFirstRun {
            inner: source_with_runs(60),
            started: AtomicUsize::new(0),
        };
        let filter = MetricFilter::none();
        let selector = RunSelector::all();
        let fetcher = Fetcher::new(&source, &filter, &selector, 4);
        let runs = fetcher.list_candidates("demo").unwrap();
        let window = fetcher.window();
        assert_eq!(window, 8);

        let mut started_at_delivery = Vec::new();
        fetcher
            .fetch_each("demo", &runs, |index, result| {
                assert!(result.is_ok());
                started_at_delivery.push((index, source.started.load(Ordering::SeqCst)));
                Ok(())
            })
            .unwrap();

        assert_eq!(started_at_delivery.len(), 60);
        // While r0 was held back no more than a window of runs was fetched.
        assert!(started_at_delivery[0].1 <= window, "{:?}", started_at_delivery[0]);
        for (index, started) in started_at_delivery {
            assert!(started <= index + window, "run {index}: {started} fetches started");
        }
    }

    #[test]
    fn test_oversized_pool_is_clamped() {
        let source = MemorySource::new();
        let filter = MetricFilter::none();
        let selector = RunSelector::all();
        let fetcher = Fetcher::new(&source, &filter, &selector, usize::MAX);
        assert_eq!(fetcher.pool_size(), MAX_THREAD_POOL_SIZE);
        assert_eq!(fetcher.window(), MAX_THREAD_POOL_SIZE * 2);
        assert_eq!(Fetcher::new(&source, &filter, &selector, 0).pool_size(), 1);
    }

    #[test]
    fn test_deliver_error_stops_fetching() {
        let source = source_with_runs(10);
        let filter = MetricFilter::none();
        let selector = RunSelector::all();
        let fetcher = Fetcher::new(&source, &filter, &selector, 3);
        let runs = fetcher.list_candidates("demo").unwrap();

        let mut delivered = 0;
        let err = fetcher
            .fetch_each("demo", &runs, |index, _| {
                delivered += 1;
                if index == 2 {
                    Err(Error::Other("stop".to_string()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert_eq!(delivered, 3);
    }
}
