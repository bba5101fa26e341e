//! Spec execution: order behaviors, run them, check them, thread
//! captures and propagate blocks.

use crate::checker;
use crate::config::RunConfig;
use crate::context::Context;
use crate::error::{ExecutionError, StructuralError};
use crate::executor::{ExecutorConfig, HttpExecutor};
use crate::model::*;
use crate::resolver::DependencyGraph;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Longest raw body excerpt attached to a problem.
const RAW_EXCERPT_LEN: usize = 500;

/// Spec runner trait
#[async_trait]
pub trait SpecRunner: Send + Sync {
    /// Execute every selected behavior of `spec`.
    ///
    /// Only a structural problem in the `requires` graph is an `Err`;
    /// everything else is reported per behavior.
    async fn run(&self, spec: &Spec, config: &RunConfig) -> Result<SpecResult, StructuralError>;
}

/// Default spec runner
#[derive(Debug, Clone)]
pub struct DefaultSpecRunner {
    executor: HttpExecutor,
}

/// What running a single behavior produced.
struct BehaviorRun {
    report: BehaviorReport,
    captures: Vec<(String, Value)>,
}

impl DefaultSpecRunner {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            executor: HttpExecutor::new()?,
        })
    }

    pub fn with_executor(executor: HttpExecutor) -> Self {
        Self { executor }
    }

    /// First dependency of `idx` that did not pass.
    fn blocking_dependency(
        graph: &DependencyGraph<'_>,
        idx: usize,
        outcomes: &[Option<BehaviorOutcome>],
    ) -> Option<String> {
        graph
            .requires(idx)
            .iter()
            .find(|&&dep| !matches!(outcomes[dep], Some(BehaviorOutcome::Passed)))
            .map(|&dep| graph.behavior(dep).name.clone())
    }

    fn blocked_report(name: &str, dependency: String) -> BehaviorReport {
        info!("Behavior '{}' blocked: requires {}", name, dependency);
        BehaviorReport {
            name: name.to_string(),
            outcome: BehaviorOutcome::Blocked { dependency },
            duration_ms: 0,
            method: None,
            url: None,
            status: None,
        }
    }

    /// Record a finished behavior; captures only land for passes.
    fn apply(
        ctx: &mut Context,
        outcomes: &mut [Option<BehaviorOutcome>],
        reports: &mut Vec<BehaviorReport>,
        idx: usize,
        run: BehaviorRun,
    ) {
        if run.report.outcome.is_passed() {
            for (name, value) in run.captures {
                debug!("Captured '{}' = {}", name, value);
                ctx.set(name, value);
            }
        }
        outcomes[idx] = Some(run.report.outcome.clone());
        reports.push(run.report);
    }

    async fn run_sequential(
        &self,
        graph: &DependencyGraph<'_>,
        order: &[usize],
        config: &ExecutorConfig,
    ) -> Vec<BehaviorReport> {
        let mut ctx = Context::new();
        let mut outcomes: Vec<Option<BehaviorOutcome>> = vec![None; graph.len()];
        let mut reports = Vec::with_capacity(order.len());

        for (pos, &idx) in order.iter().enumerate() {
            let behavior = graph.behavior(idx);
            if let Some(dep) = Self::blocking_dependency(graph, idx, &outcomes) {
                outcomes[idx] = Some(BehaviorOutcome::Blocked {
                    dependency: dep.clone(),
                });
                reports.push(Self::blocked_report(&behavior.name, dep));
                continue;
            }

            info!("Running behavior {}/{}: {}", pos + 1, order.len(), behavior.name);
            let run = run_behavior(&self.executor, behavior, &mut ctx, config).await;
            Self::apply(&mut ctx, &mut outcomes, &mut reports, idx, run);
        }

        reports
    }

    /// Run level by level; behaviors within a level run concurrently
    /// on snapshots of the context and their captures are merged back
    /// in resolved order before the next level starts.
    async fn run_levels(
        &self,
        graph: &DependencyGraph<'_>,
        order: &[usize],
        config: &ExecutorConfig,
    ) -> Vec<BehaviorReport> {
        let mut ctx = Context::new();
        let mut outcomes: Vec<Option<BehaviorOutcome>> = vec![None; graph.len()];
        let mut reports = Vec::with_capacity(order.len());

        for (level_no, level) in graph.levels(order).into_iter().enumerate() {
            debug!("Running level {} with {} behavior(s)", level_no, level.len());
            let mut finished: Vec<Option<BehaviorRun>> = (0..level.len()).map(|_| None).collect();
            let mut tasks = JoinSet::new();

            for (slot, &idx) in level.iter().enumerate() {
                let behavior = graph.behavior(idx);
                if let Some(dep) = Self::blocking_dependency(graph, idx, &outcomes) {
                    finished[slot] = Some(BehaviorRun {
                        report: Self::blocked_report(&behavior.name, dep),
                        captures: Vec::new(),
                    });
                    continue;
                }

                let executor = self.executor.clone();
                let behavior = behavior.clone();
                let config = config.clone();
                let mut snapshot = ctx.clone();
                tasks.spawn(async move {
                    let run = run_behavior(&executor, &behavior, &mut snapshot, &config).await;
                    (slot, run)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((slot, run)) => finished[slot] = Some(run),
                    Err(err) => error!("Behavior task failed: {}", err),
                }
            }

            for (slot, &idx) in level.iter().enumerate() {
                let run = finished[slot].take().unwrap_or_else(|| BehaviorRun {
                    report: BehaviorReport {
                        name: graph.behavior(idx).name.clone(),
                        outcome: BehaviorOutcome::Failed {
                            problems: vec![Problem::new(
                                ProblemKind::Transport,
                                "behavior task aborted before completing",
                            )],
                        },
                        duration_ms: 0,
                        method: None,
                        url: None,
                        status: None,
                    },
                    captures: Vec::new(),
                });
                Self::apply(&mut ctx, &mut outcomes, &mut reports, idx, run);
            }
        }

        reports
    }
}

#[async_trait]
impl SpecRunner for DefaultSpecRunner {
    #[instrument(skip(self, spec, config), fields(name = %spec.name))]
    async fn run(&self, spec: &Spec, config: &RunConfig) -> Result<SpecResult, StructuralError> {
        let start_time = Instant::now();
        let behaviors = spec.behaviors();

        let graph = DependencyGraph::build(&behaviors)?;
        let order = graph.order()?;
        let selected = graph.select(config.filter.as_deref(), &config.tags);
        let order: Vec<usize> = order.into_iter().filter(|&i| selected[i]).collect();

        info!(
            "Starting spec: {} ({} of {} behaviors selected)",
            spec.name,
            order.len(),
            graph.len()
        );

        let exec_config = ExecutorConfig::from_spec(&spec.config, config.allow_local_targets);
        let reports = if config.parallel {
            self.run_levels(&graph, &order, &exec_config).await
        } else {
            self.run_sequential(&graph, &order, &exec_config).await
        };

        let result = SpecResult::from_reports(
            &spec.name,
            reports,
            start_time.elapsed().as_millis() as u64,
        );

        info!(
            "Spec finished: {} ({} ms) - passed: {}, failed: {}, blocked: {}",
            spec.name, result.duration_ms, result.passed, result.failed, result.blocked
        );

        Ok(result)
    }
}

/// Execute, check and (on success) extract captures for one behavior.
///
/// `ctx` receives the request/response bodies of this behavior so the
/// checker can refer to them; captured variables are returned, not
/// written.
async fn run_behavior(
    executor: &HttpExecutor,
    behavior: &Behavior,
    ctx: &mut Context,
    config: &ExecutorConfig,
) -> BehaviorRun {
    let start = Instant::now();
    ctx.set_request_body(None);
    ctx.set_response_body(None);

    let mut report = BehaviorReport {
        name: behavior.name.clone(),
        outcome: BehaviorOutcome::Passed,
        duration_ms: 0,
        method: Some(behavior.request.method.to_string()),
        url: None,
        status: None,
    };

    let result = match executor.execute(&behavior.request, ctx, config).await {
        Ok(result) => result,
        Err(err) => {
            warn!("Behavior '{}' failed to execute: {}", behavior.name, err);
            report.outcome = BehaviorOutcome::Failed {
                problems: vec![execution_problem(&err)],
            };
            report.duration_ms = start.elapsed().as_millis() as u64;
            return BehaviorRun {
                report,
                captures: Vec::new(),
            };
        }
    };

    report.url = Some(result.url.clone());
    report.status = Some(result.status);
    ctx.set_request_body(result.request_body.clone());
    ctx.set_response_body(result.body.clone());

    let checked = checker::check(&behavior.response, &result, ctx);
    let mut problems = Vec::new();
    if !checked.status_ok {
        problems.push(Problem {
            kind: ProblemKind::Status,
            field: None,
            rule: None,
            expected: Some(checked.expected_status.to_string()),
            actual: Some(checked.actual_status.to_string()),
            explanation: format!(
                "expected status {} but got {}",
                checked.expected_status, checked.actual_status
            ),
        });
    }
    for failure in checked.failures() {
        if let CheckResult::Failed {
            field,
            rule,
            expected,
            actual,
            explanation,
        } = failure
        {
            problems.push(Problem {
                kind: ProblemKind::Check,
                field: Some(field.clone()),
                rule: Some(rule.clone()),
                expected: Some(expected.clone()),
                actual: Some(actual.clone()),
                explanation: explanation.clone(),
            });
        }
    }

    let mut captures = Vec::with_capacity(behavior.captures.len());
    if problems.is_empty() {
        for (name, path) in &behavior.captures {
            match ctx.extract(path) {
                Ok(value) => captures.push((name.clone(), value)),
                Err(err) => problems.push(Problem {
                    kind: ProblemKind::Capture,
                    field: Some(path.clone()),
                    rule: None,
                    expected: None,
                    actual: None,
                    explanation: format!("cannot capture '{name}': {err}"),
                }),
            }
        }
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    if problems.is_empty() {
        info!("Behavior '{}' passed ({} ms)", behavior.name, report.duration_ms);
    } else {
        info!(
            "Behavior '{}' failed with {} problem(s)",
            behavior.name,
            problems.len()
        );
        report.outcome = BehaviorOutcome::Failed { problems };
        captures.clear();
    }

    BehaviorRun { report, captures }
}

fn execution_problem(err: &ExecutionError) -> Problem {
    let kind = match err {
        ExecutionError::Interpolation(_) => ProblemKind::Interpolation,
        _ => ProblemKind::Transport,
    };
    let mut problem = Problem::new(kind, err.to_string());
    problem.rule = Some(err.kind().to_string());
    if let ExecutionError::ResponseParse { raw, .. } = err {
        problem.actual = Some(excerpt(raw));
    }
    problem
}

fn excerpt(raw: &str) -> String {
    if raw.chars().count() > RAW_EXCERPT_LEN {
        let cut: String = raw.chars().take(RAW_EXCERPT_LEN).collect();
        format!("{cut}...(truncated)")
    } else {
        raw.to_string()
    }
}
