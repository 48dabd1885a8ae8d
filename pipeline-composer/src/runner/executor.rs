// Manifest Runner
// Dependency-ordered, concurrent execution of a compiled manifest

use crate::compiler::{ExecutionManifest, StageExecution};
use crate::runner::cache::{CacheRecord, ExecutionCache};
use crate::runner::events::{EventSender, ProgressSender, RunEvent};
use crate::runner::result::{RunResult, SkipReason, StageReport, StageStatus};
use crate::runner::{Backend, StageOutcome};

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Configuration for manifest execution
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum stages running at once (0 = unlimited)
    pub max_parallel_stages: usize,
    /// Skip stages whose cache key has a recorded successful execution
    pub use_cache: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel_stages: 0,
            use_cache: true,
        }
    }
}

/// Runs manifests against a backend
///
/// A failed stage skips its downstream closure; independent branches keep
/// going. Stages are never retried.
pub struct Runner {
    backend: Arc<dyn Backend>,
    config: RunnerConfig,
    cache: ExecutionCache,
    event_tx: Option<ProgressSender>,
    cancel: CancellationToken,
}

struct Scheduler {
    unschedulable: Vec<bool>,
    downstreams: Vec<Vec<usize>>,
    waiting_on: Vec<usize>,
    reports: Vec<Option<StageReport>>,
    ready: BTreeSet<usize>,
}

/// Aborts the backend task when the stage task is dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Point inputs produced by reused executions at where that output lives
fn rebind_inputs(
    stage: Arc<StageExecution>,
    relocated: &HashMap<PathBuf, PathBuf>,
) -> Arc<StageExecution> {
    if !stage.inputs.values().any(|path| relocated.contains_key(path)) {
        return stage;
    }

    let mut rebound = StageExecution::clone(&stage);
    for path in rebound.inputs.values_mut() {
        if let Some(actual) = relocated.get(path) {
            *path = actual.clone();
        }
    }
    Arc::new(rebound)
}

impl Scheduler {
    fn new(stages: &[Arc<StageExecution>]) -> Self {
        let indices: HashMap<&str, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut upstreams = vec![Vec::new(); stages.len()];
        let mut downstreams = vec![Vec::new(); stages.len()];
        let mut unschedulable = vec![false; stages.len()];

        for (i, stage) in stages.iter().enumerate() {
            for name in &stage.upstreams {
                match indices.get(name.as_str()) {
                    Some(&up) if !upstreams[i].contains(&up) => {
                        upstreams[i].push(up);
                        downstreams[up].push(i);
                    }
                    Some(_) => {}
                    None => unschedulable[i] = true,
                }
            }
        }

        let waiting_on: Vec<usize> = upstreams.iter().map(Vec::len).collect();
        let ready = (0..stages.len())
            .filter(|&i| waiting_on[i] == 0 && !unschedulable[i])
            .collect();

        Self {
            unschedulable,
            downstreams,
            waiting_on,
            reports: vec![None; stages.len()],
            ready,
        }
    }

    /// Mark a stage successful and release dependents whose inputs are all done
    fn complete(&mut self, index: usize, report: StageReport) {
        self.reports[index] = Some(report);
        for &next in &self.downstreams[index] {
            self.waiting_on[next] -= 1;
            if self.waiting_on[next] == 0
                && self.reports[next].is_none()
                && !self.unschedulable[next]
            {
                self.ready.insert(next);
            }
        }
    }

    /// Mark a stage failed and skip everything downstream of it
    fn fail(&mut self, index: usize, report: StageReport, stages: &[Arc<StageExecution>]) -> Vec<usize> {
        let failed_name = report.stage.clone();
        self.reports[index] = Some(report);

        let mut skipped = Vec::new();
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            for &next in &self.downstreams[current] {
                if self.reports[next].is_none() {
                    self.ready.remove(&next);
                    self.reports[next] = Some(StageReport {
                        stage: stages[next].name.clone(),
                        cache_key: stages[next].cache_key.to_string(),
                        status: StageStatus::Skipped(SkipReason::UpstreamFailed {
                            upstream: failed_name.clone(),
                        }),
                        produced_manifest_ref: None,
                        duration: Duration::ZERO,
                    });
                    skipped.push(next);
                    stack.push(next);
                }
            }
        }
        skipped.sort_unstable();
        skipped
    }
}

impl Runner {
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
            config: RunnerConfig::default(),
            cache: ExecutionCache::in_memory(),
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a shared (possibly persistent) execution cache
    pub fn with_cache(mut self, cache: ExecutionCache) -> Self {
        self.cache = cache;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels runs of this runner; stages already running finish
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &ExecutionCache {
        &self.cache
    }

    /// Execute every stage of the manifest, respecting its ordering constraints
    pub async fn run(&self, manifest: &ExecutionManifest) -> RunResult {
        let start = Instant::now();
        let stages: Vec<Arc<StageExecution>> =
            manifest.stages.iter().cloned().map(Arc::new).collect();
        let mut scheduler = Scheduler::new(&stages);

        tracing::info!(
            pipeline = %manifest.pipeline,
            stages = stages.len(),
            "pipeline run started"
        );
        self.event_tx
            .send_event(RunEvent::pipeline_started(&manifest.pipeline, stages.len()));

        let mut running: JoinSet<(usize, StageOutcome, Duration)> = JoinSet::new();
        // Compiled output path -> location of the reused output
        let mut relocated: HashMap<PathBuf, PathBuf> = HashMap::new();
        let mut cancelled = self.cancel.is_cancelled();

        loop {
            cancelled = cancelled || self.cancel.is_cancelled();
            while !cancelled && self.has_capacity(running.len()) {
                let Some(index) = scheduler.ready.pop_first() else {
                    break;
                };
                let stage = Arc::clone(&stages[index]);

                if self.config.use_cache {
                    if let Some(record) = self.cached_record(&stage).await {
                        tracing::info!(stage = %stage.name, cache_key = %stage.cache_key.short(), "stage cached");
                        if record.output_path != stage.output_path {
                            tracing::debug!(
                                stage = %stage.name,
                                output = %record.output_path.display(),
                                "reusing output recorded at another location"
                            );
                            relocated.insert(stage.output_path.clone(), record.output_path.clone());
                        }
                        self.event_tx
                            .send_event(RunEvent::stage_cached(&stage.name, stage.cache_key.as_str()));
                        scheduler.complete(
                            index,
                            StageReport {
                                stage: stage.name.clone(),
                                cache_key: stage.cache_key.to_string(),
                                status: StageStatus::Cached,
                                produced_manifest_ref: record.produced_manifest_ref,
                                duration: Duration::ZERO,
                            },
                        );
                        continue;
                    }
                }

                let stage = rebind_inputs(stage, &relocated);
                tracing::info!(stage = %stage.name, cache_key = %stage.cache_key.short(), "stage started");
                self.event_tx
                    .send_event(RunEvent::stage_started(&stage.name, stage.cache_key.as_str()));

                let backend = Arc::clone(&self.backend);
                running.spawn(async move {
                    let started = Instant::now();
                    // Run on its own task so a panicking backend becomes a failure
                    let mut call = AbortOnDrop(tokio::spawn(async move {
                        backend.execute(&stage).await
                    }));
                    let outcome = match (&mut call.0).await {
                        Ok(outcome) => outcome,
                        Err(e) => StageOutcome::failed(format!("backend task failed: {}", e)),
                    };
                    (index, outcome, started.elapsed())
                });
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                joined = running.join_next() => {
                    match joined {
                        Some(Ok((index, outcome, duration))) => {
                            self.finish_stage(&mut scheduler, &stages, index, outcome, duration).await;
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "stage task aborted");
                        }
                        None => {}
                    }
                }
                _ = self.cancel.cancelled(), if !cancelled => {
                    tracing::warn!(pipeline = %manifest.pipeline, in_flight = running.len(), "run cancelled");
                    cancelled = true;
                }
            }
        }

        let reports: Vec<StageReport> = scheduler
            .reports
            .into_iter()
            .enumerate()
            .map(|(index, report)| {
                report.unwrap_or_else(|| {
                    let reason = if cancelled {
                        SkipReason::Cancelled
                    } else {
                        SkipReason::Unschedulable
                    };
                    self.event_tx
                        .send_event(RunEvent::stage_skipped(&stages[index].name, reason.clone()));
                    StageReport {
                        stage: stages[index].name.clone(),
                        cache_key: stages[index].cache_key.to_string(),
                        status: StageStatus::Skipped(reason),
                        produced_manifest_ref: None,
                        duration: Duration::ZERO,
                    }
                })
            })
            .collect();

        let result = RunResult {
            pipeline: manifest.pipeline.clone(),
            stages: reports,
            duration: start.elapsed(),
            cancelled,
        };

        tracing::info!(
            pipeline = %manifest.pipeline,
            success = result.success(),
            failed = result.failed().len(),
            cached = result.cached().len(),
            "pipeline run finished"
        );
        self.event_tx.send_event(RunEvent::pipeline_completed(
            &manifest.pipeline,
            result.success(),
            result.duration,
        ));

        result
    }

    fn has_capacity(&self, running: usize) -> bool {
        self.config.max_parallel_stages == 0 || running < self.config.max_parallel_stages
    }

    async fn cached_record(&self, stage: &StageExecution) -> Option<CacheRecord> {
        match self.cache.lookup(&stage.cache_key).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(stage = %stage.name, error = %e, "ignoring unreadable cache record");
                None
            }
        }
    }

    async fn finish_stage(
        &self,
        scheduler: &mut Scheduler,
        stages: &[Arc<StageExecution>],
        index: usize,
        outcome: StageOutcome,
        duration: Duration,
    ) {
        let stage = &stages[index];

        if outcome.success {
            tracing::info!(stage = %stage.name, ?duration, "stage succeeded");
            self.event_tx
                .send_event(RunEvent::stage_completed(&stage.name, None, duration));

            if self.config.use_cache {
                let record = CacheRecord {
                    stage: stage.name.clone(),
                    cache_key: stage.cache_key.clone(),
                    output_path: stage.output_path.clone(),
                    produced_manifest_ref: outcome.produced_manifest_ref.clone(),
                };
                if let Err(e) = self.cache.record(record).await {
                    tracing::warn!(stage = %stage.name, error = %e, "failed to record cache entry");
                }
            }

            scheduler.complete(
                index,
                StageReport {
                    stage: stage.name.clone(),
                    cache_key: stage.cache_key.to_string(),
                    status: StageStatus::Succeeded,
                    produced_manifest_ref: outcome.produced_manifest_ref,
                    duration,
                },
            );
        } else {
            let reason = outcome
                .failure_reason
                .unwrap_or_else(|| "stage failed without a reason".to_string());
            tracing::error!(stage = %stage.name, error = %reason, "stage failed");
            self.event_tx.send_event(RunEvent::stage_completed(
                &stage.name,
                Some(reason.clone()),
                duration,
            ));

            let skipped = scheduler.fail(
                index,
                StageReport {
                    stage: stage.name.clone(),
                    cache_key: stage.cache_key.to_string(),
                    status: StageStatus::Failed(reason),
                    produced_manifest_ref: None,
                    duration,
                },
                stages,
            );

            for next in skipped {
                self.event_tx.send_event(RunEvent::stage_skipped(
                    &stages[next].name,
                    SkipReason::UpstreamFailed {
                        upstream: stage.name.clone(),
                    },
                ));
            }
        }
    }
}
