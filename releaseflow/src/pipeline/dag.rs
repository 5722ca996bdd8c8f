//! StageGraph DAG execution engine.
//!
//! Executes stages as soon as their dependencies reach a terminal state,
//! bounded by a worker semaphore. Dependency satisfaction is event-driven:
//! the executor only wakes when a stage task completes.

use super::{JoinMode, RunReport, StageRecord, StageSpec};
use crate::context::{RunContext, StageContext};
use crate::core::{StageOutput, StageStatus};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// A stage task that has finished.
struct Completion {
    name: String,
    started_at: Option<DateTime<Utc>>,
    output: StageOutput,
}

/// What to do with a stage whose dependencies are all terminal.
enum Admission {
    Run(HashMap<String, StageStatus>),
    Resolve(StageOutput),
}

/// A directed acyclic graph of stages for execution.
#[derive(Debug)]
pub struct StageGraph {
    /// The pipeline name.
    name: String,
    /// Stage specifications.
    stages: HashMap<String, StageSpec>,
    /// Execution order (topologically sorted).
    execution_order: Vec<String>,
    /// Reverse edges, in execution order.
    dependents: HashMap<String, Vec<String>>,
    /// Maximum concurrently running stages.
    workers: usize,
}

impl StageGraph {
    /// Creates a new stage graph.
    #[must_use]
    pub fn new(
        name: String,
        stages: HashMap<String, StageSpec>,
        stage_order: &[String],
        workers: usize,
    ) -> Self {
        let execution_order = topological_sort(&stages, stage_order);

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for stage in &execution_order {
            if let Some(spec) = stages.get(stage) {
                for dep in &spec.dependencies {
                    dependents.entry(dep.clone()).or_default().push(stage.clone());
                }
            }
        }

        Self {
            name,
            stages,
            execution_order,
            dependents,
            workers: workers.max(1),
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the worker limit.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Returns the execution order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Returns the specification of `name`.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Returns stage specifications in execution order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.execution_order
            .iter()
            .filter_map(|name| self.stages.get(name))
    }

    /// Returns the stages that directly depend on `name`.
    #[must_use]
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents.get(name).map_or(&[], Vec::as_slice)
    }

    /// Executes the stage graph.
    ///
    /// Never fails: every stage ends in a terminal state recorded in the
    /// returned report.
    pub async fn execute(&self, run: Arc<RunContext>) -> RunReport {
        let started_at = Utc::now();
        info!(
            pipeline = %self.name,
            run_id = %run.run_id(),
            trigger = %run.trigger(),
            stages = self.stages.len(),
            workers = self.workers,
            "run started"
        );
        run.emit(
            "run.started",
            None,
            serde_json::json!({
                "pipeline": &self.name,
                "trigger": run.trigger().to_string(),
                "stages": &self.execution_order,
            }),
        );

        // Run-level predicates are evaluated exactly once.
        let preconditions: HashMap<&str, String> = self
            .stages
            .values()
            .filter_map(|spec| {
                spec.condition
                    .and_then(|condition| condition.evaluate(&run))
                    .map(|reason| (spec.name.as_str(), reason))
            })
            .collect();

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut waiting: HashMap<&str, usize> = self
            .stages
            .iter()
            .map(|(name, spec)| (name.as_str(), spec.dependencies.len()))
            .collect();
        let mut records: HashMap<String, StageRecord> = HashMap::new();
        let mut active: FuturesUnordered<BoxFuture<'static, Completion>> = FuturesUnordered::new();
        let mut ready: VecDeque<String> = self
            .execution_order
            .iter()
            .filter(|name| waiting.get(name.as_str()) == Some(&0))
            .cloned()
            .collect();

        loop {
            while let Some(name) = ready.pop_front() {
                let Some(spec) = self.stages.get(&name) else {
                    continue;
                };
                match admit(spec, &run, &records, &preconditions) {
                    Admission::Run(deps) => {
                        active.push(spawn_stage(spec, run.clone(), deps, permits.clone()));
                    }
                    Admission::Resolve(output) => {
                        self.finish(&run, spec, output, None, &mut records, &mut waiting, &mut ready);
                    }
                }
            }

            let Some(done) = active.next().await else {
                break;
            };
            if let Some(spec) = self.stages.get(&done.name) {
                self.finish(
                    &run,
                    spec,
                    done.output,
                    done.started_at,
                    &mut records,
                    &mut waiting,
                    &mut ready,
                );
            }
        }

        let stages: Vec<StageRecord> = self
            .execution_order
            .iter()
            .map(|name| {
                records.remove(name).unwrap_or_else(|| {
                    warn!(stage = %name, "stage was never scheduled");
                    let kind = self.stages.get(name).map(|s| s.kind).unwrap_or_default();
                    StageRecord::from_output(
                        name.clone(),
                        kind,
                        StageOutput::cancel("stage was never scheduled"),
                        None,
                    )
                })
            })
            .collect();

        let report = RunReport::assemble(
            run.run_id(),
            &self.name,
            run.trigger().to_string(),
            run.version().ok().map(ToString::to_string),
            stages,
            run.is_cancelled(),
            run.artifacts(),
            started_at,
        );

        let failed: Vec<&str> = report.failed_stages().iter().map(|s| s.name.as_str()).collect();
        info!(
            pipeline = %self.name,
            run_id = %run.run_id(),
            outcome = ?report.outcome,
            failed = ?failed,
            "run completed"
        );
        run.emit(
            "run.completed",
            None,
            serde_json::json!({
                "outcome": report.outcome,
                "failed": failed,
                "duration_ms": (report.finished_at - started_at).num_milliseconds(),
            }),
        );

        report
    }

    /// Records a terminal result and unblocks dependents.
    #[allow(clippy::too_many_arguments)]
    fn finish<'a>(
        &'a self,
        run: &RunContext,
        spec: &StageSpec,
        output: StageOutput,
        started_at: Option<DateTime<Utc>>,
        records: &mut HashMap<String, StageRecord>,
        waiting: &mut HashMap<&'a str, usize>,
        ready: &mut VecDeque<String>,
    ) {
        let name = spec.name.as_str();
        let duration_ms = started_at.map(|start| (Utc::now() - start).num_milliseconds());
        match output.status {
            StageStatus::Success => {
                debug!(stage = name, ?duration_ms, "stage completed");
                run.emit(
                    "stage.completed",
                    Some(name),
                    serde_json::json!({ "duration_ms": duration_ms, "uploads": &output.uploads }),
                );
            }
            StageStatus::Failure => {
                warn!(stage = name, error = ?output.error, code = ?output.error_code, "stage failed");
                run.emit(
                    "stage.failed",
                    Some(name),
                    serde_json::json!({
                        "error": &output.error,
                        "code": &output.error_code,
                        "failures": &output.failures,
                        "duration_ms": duration_ms,
                    }),
                );
            }
            StageStatus::Skipped => {
                info!(stage = name, reason = ?output.skip_reason, "stage skipped");
                run.emit(
                    "stage.skipped",
                    Some(name),
                    serde_json::json!({ "reason": &output.skip_reason }),
                );
            }
            StageStatus::Cancelled => {
                info!(stage = name, reason = ?output.cancel_reason, "stage cancelled");
                run.emit(
                    "stage.cancelled",
                    Some(name),
                    serde_json::json!({ "reason": &output.cancel_reason }),
                );
            }
            StageStatus::Pending | StageStatus::Running => {
                warn!(stage = name, status = %output.status, "stage returned a non-terminal status");
            }
        }

        let output = if output.status.is_terminal() {
            output
        } else {
            StageOutput::fail(format!("stage returned non-terminal status '{}'", output.status))
        };
        records.insert(
            spec.name.clone(),
            StageRecord::from_output(spec.name.clone(), spec.kind, output, started_at),
        );

        for dependent in self.dependents(name) {
            if let Some(count) = waiting.get_mut(dependent.as_str()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push_back(dependent.clone());
                }
            }
        }
    }
}

/// Decides whether a stage whose dependencies are terminal should run.
fn admit(
    spec: &StageSpec,
    run: &RunContext,
    records: &HashMap<String, StageRecord>,
    preconditions: &HashMap<&str, String>,
) -> Admission {
    if run.is_cancelled() {
        return Admission::Resolve(StageOutput::cancel(cancel_reason(run)));
    }

    let deps: HashMap<String, StageStatus> = spec
        .dependencies
        .iter()
        .map(|dep| {
            let status = records.get(dep).map_or(StageStatus::Pending, |r| r.status);
            (dep.clone(), status)
        })
        .collect();

    if let Some(reason) = preconditions.get(spec.name.as_str()) {
        return Admission::Resolve(StageOutput::skip(reason.clone()));
    }

    // Dependencies are a BTreeSet, so blocked lists are already sorted.
    let blocked: Vec<&str> = spec
        .dependencies
        .iter()
        .filter(|dep| {
            let status = deps.get(*dep).copied().unwrap_or_default();
            match spec.join {
                JoinMode::Success => !status.is_success(),
                JoinMode::Completion => !matches!(status, StageStatus::Success | StageStatus::Failure),
            }
        })
        .map(String::as_str)
        .collect();

    if !blocked.is_empty() {
        let reason = match spec.join {
            JoinMode::Success => format!("dependencies did not succeed: {}", blocked.join(", ")),
            JoinMode::Completion => {
                format!("dependencies did not run to completion: {}", blocked.join(", "))
            }
        };
        return Admission::Resolve(StageOutput::skip(reason));
    }

    Admission::Run(deps)
}

fn cancel_reason(run: &RunContext) -> String {
    run.cancellation()
        .reason()
        .unwrap_or_else(|| "run cancelled".to_string())
}

/// Spawns a task executing a single stage once a worker permit is free.
fn spawn_stage(
    spec: &StageSpec,
    run: Arc<RunContext>,
    deps: HashMap<String, StageStatus>,
    permits: Arc<Semaphore>,
) -> BoxFuture<'static, Completion> {
    let name = spec.name.clone();
    let runner = spec.runner.clone();
    let consumes: HashSet<String> = spec.consumes.iter().cloned().collect();

    let task_name = name.clone();
    let handle = tokio::spawn(async move {
        let Ok(_permit) = permits.acquire_owned().await else {
            return (None, StageOutput::cancel("worker pool closed"));
        };
        // Cancellation may arrive while waiting for a worker.
        if run.is_cancelled() {
            return (None, StageOutput::cancel(cancel_reason(&run)));
        }

        let started_at = Utc::now();
        debug!(stage = %task_name, "stage started");
        run.emit("stage.started", Some(&task_name), serde_json::json!({}));

        let ctx = StageContext::new(run, task_name, consumes, deps);
        let output = runner.execute(&ctx).await;
        (Some(started_at), output)
    });

    async move {
        match handle.await {
            Ok((started_at, output)) => Completion {
                name,
                started_at,
                output,
            },
            Err(err) => Completion {
                name,
                started_at: Some(Utc::now()),
                output: StageOutput::fail(format!("stage task aborted: {err}")),
            },
        }
    }
    .boxed()
}

/// Performs topological sort on the stage graph.
fn topological_sort(stages: &HashMap<String, StageSpec>, stage_order: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    let mut visited = HashSet::new();
    let mut temp_visited = HashSet::new();

    fn visit(
        node: &str,
        stages: &HashMap<String, StageSpec>,
        visited: &mut HashSet<String>,
        temp_visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if visited.contains(node) || temp_visited.contains(node) {
            return;
        }

        temp_visited.insert(node.to_string());

        if let Some(spec) = stages.get(node) {
            for dep in &spec.dependencies {
                visit(dep, stages, visited, temp_visited, result);
            }
        }

        temp_visited.remove(node);
        visited.insert(node.to_string());
        result.push(node.to_string());
    }

    // Visit in insertion order for determinism
    for name in stage_order {
        visit(name, stages, &mut visited, &mut temp_visited, &mut result);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::pipeline::{PipelineBuilder, RunCondition, RunOutcome};
    use crate::stages::{FnStage, NoOpStage, Stage};
    use crate::version::Trigger;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn noop(name: &str) -> Arc<dyn Stage> {
        Arc::new(NoOpStage::new(name))
    }

    fn failing(name: &str) -> Arc<dyn Stage> {
        Arc::new(FnStage::new(name, |_| StageOutput::fail("boom")))
    }

    fn branch_run() -> Arc<RunContext> {
        Arc::new(RunContext::new(Trigger::Branch("main".to_string())))
    }

    /// Sleeps and tracks the peak number of concurrent executions.
    #[derive(Debug)]
    struct SlowStage {
        name: String,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for SlowStage {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, _ctx: &StageContext) -> StageOutput {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            StageOutput::success()
        }
    }

    #[derive(Debug)]
    struct PanickingStage;

    #[async_trait]
    impl Stage for PanickingStage {
        fn name(&self) -> &str {
            "panics"
        }

        async fn execute(&self, _ctx: &StageContext) -> StageOutput {
            panic!("stage blew up");
        }
    }

    #[test]
    fn test_topological_order() {
        let graph = PipelineBuilder::new("test")
            .stage("stage1", noop("stage1"), &[])
            .unwrap()
            .stage("stage2", noop("stage2"), &["stage1"])
            .unwrap()
            .build()
            .unwrap();

        let order = graph.execution_order();
        let pos1 = order.iter().position(|n| n == "stage1").unwrap();
        let pos2 = order.iter().position(|n| n == "stage2").unwrap();
        assert!(pos1 < pos2);
        assert_eq!(graph.dependents("stage1"), &["stage2".to_string()]);
    }

    #[tokio::test]
    async fn test_graph_execution() {
        let sink = Arc::new(CollectingEventSink::new());
        let run = Arc::new(
            RunContext::new(Trigger::Branch("main".to_string())).with_event_sink(sink.clone()),
        );
        let graph = PipelineBuilder::new("test")
            .stage("stage1", noop("stage1"), &[])
            .unwrap()
            .stage("stage2", noop("stage2"), &["stage1"])
            .unwrap()
            .build()
            .unwrap();

        let report = graph.execute(run).await;

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.executed_stages(), vec!["stage1", "stage2"]);
        assert_eq!(sink.stages_with("stage.completed"), vec!["stage1", "stage2"]);
        assert_eq!(sink.events_of_type("run.").len(), 2);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_not_siblings() {
        let graph = PipelineBuilder::new("test")
            .stage("root", noop("root"), &[])
            .unwrap()
            .stage("left", failing("left"), &["root"])
            .unwrap()
            .stage("right", noop("right"), &["root"])
            .unwrap()
            .stage("after-left", noop("after-left"), &["left"])
            .unwrap()
            .stage("transitive", noop("transitive"), &["after-left"])
            .unwrap()
            .build()
            .unwrap();

        let report = graph.execute(branch_run()).await;

        assert_eq!(report.outcome, RunOutcome::Failure);
        assert_eq!(report.status_of("right"), Some(StageStatus::Success));
        assert_eq!(report.status_of("after-left"), Some(StageStatus::Skipped));
        assert_eq!(report.status_of("transitive"), Some(StageStatus::Skipped));
        assert!(!report.stage("transitive").unwrap().ran());
        assert_eq!(
            report.stage("after-left").unwrap().reason.as_deref(),
            Some("dependencies did not succeed: left")
        );
    }

    #[tokio::test]
    async fn test_completion_join_runs_after_failure() {
        let saw_failure = Arc::new(AtomicUsize::new(0));
        let observed = saw_failure.clone();
        let join = Arc::new(FnStage::new("join", move |ctx| {
            observed.store(ctx.failed_dependencies().len(), Ordering::SeqCst);
            StageOutput::fail("sibling missing")
        }));

        let mut builder = PipelineBuilder::new("test")
            .stage("a", noop("a"), &[])
            .unwrap()
            .stage("b", failing("b"), &[])
            .unwrap();
        builder
            .add_stage_spec(
                StageSpec::new("join", join)
                    .with_dependencies(["a", "b"])
                    .with_join(JoinMode::Completion),
            )
            .unwrap();
        let report = builder.build().unwrap().execute(branch_run()).await;

        assert_eq!(report.status_of("join"), Some(StageStatus::Failure));
        assert_eq!(saw_failure.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_join_skips_after_skip() {
        let mut builder = PipelineBuilder::new("test")
            .stage("gate", failing("gate"), &[])
            .unwrap()
            .stage("a", noop("a"), &["gate"])
            .unwrap();
        builder
            .add_stage_spec(
                StageSpec::new("join", noop("join"))
                    .with_dependency("a")
                    .with_join(JoinMode::Completion),
            )
            .unwrap();
        let report = builder.build().unwrap().execute(branch_run()).await;

        assert_eq!(report.status_of("a"), Some(StageStatus::Skipped));
        assert_eq!(report.status_of("join"), Some(StageStatus::Skipped));
        assert_eq!(report.executed_stages(), vec!["gate"]);
    }

    #[tokio::test]
    async fn test_precondition_skips_on_branch() {
        let mut builder = PipelineBuilder::new("test").stage("a", noop("a"), &[]).unwrap();
        builder
            .add_stage_spec(
                StageSpec::new("publish", noop("publish"))
                    .with_dependency("a")
                    .when(RunCondition::VersionTag),
            )
            .unwrap();
        let graph = builder.build().unwrap();

        let report = graph.execute(branch_run()).await;
        assert_eq!(report.status_of("publish"), Some(StageStatus::Skipped));
        assert_eq!(report.outcome, RunOutcome::Success);

        let tag_run = Arc::new(RunContext::new(Trigger::Tag("v1.0.0".to_string())));
        let report = graph.execute(tag_run).await;
        assert_eq!(report.status_of("publish"), Some(StageStatus::Success));
    }

    #[tokio::test]
    async fn test_worker_limit_is_respected() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut builder = PipelineBuilder::new("test").with_workers(2);
        for i in 0..6 {
            let name = format!("slow-{i}");
            let stage = Arc::new(SlowStage {
                name: name.clone(),
                running: running.clone(),
                peak: peak.clone(),
            });
            builder = builder.stage(name, stage, &[]).unwrap();
        }

        let report = builder.build().unwrap().execute(branch_run()).await;

        assert!(report.is_success());
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_stages() {
        let run = branch_run();
        let token = run.cancellation().clone();
        let cancel = Arc::new(FnStage::new("cancel", move |_| {
            token.cancel("operator abort");
            StageOutput::success()
        }));
        let graph = PipelineBuilder::new("test")
            .stage("cancel", cancel, &[])
            .unwrap()
            .stage("next", noop("next"), &["cancel"])
            .unwrap()
            .build()
            .unwrap();

        let report = graph.execute(run).await;

        assert_eq!(report.status_of("cancel"), Some(StageStatus::Success));
        assert_eq!(report.status_of("next"), Some(StageStatus::Cancelled));
        assert_eq!(report.stage("next").unwrap().reason.as_deref(), Some("operator abort"));
        assert_eq!(report.outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_panicking_stage_is_a_failure() {
        let graph = PipelineBuilder::new("test")
            .stage("panics", Arc::new(PanickingStage), &[])
            .unwrap()
            .stage("after", noop("after"), &["panics"])
            .unwrap()
            .build()
            .unwrap();

        let report = graph.execute(branch_run()).await;

        assert_eq!(report.status_of("panics"), Some(StageStatus::Failure));
        assert_eq!(report.status_of("after"), Some(StageStatus::Skipped));
    }
}
