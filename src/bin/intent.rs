//! Intent CLI - runs behavior specs against a live API.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use intent::{
    BehaviorOutcome, DefaultSpecRunner, RunConfig, Spec, SpecLoader, SpecResult, SpecRunner,
};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Load, structural or setup error.
const EXIT_LOAD_ERROR: i32 = 3;
const EXIT_USAGE_ERROR: i32 = 4;

/// Intent - contract testing for HTTP APIs described as behaviors.
#[derive(Parser, Debug)]
#[command(name = "intent", version, about)]
struct Cli {
    /// Spec file (.yaml, .yml, .json) or directory of spec files.
    spec_path: PathBuf,

    /// Base URL override for every spec.
    #[arg(short = 'b', long = "base-url", env = "INTENT_BASE_URL")]
    base_url: Option<String>,

    /// Per-request timeout in milliseconds.
    #[arg(short = 't', long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Allow requests to loopback, private and link-local addresses.
    #[arg(long = "allow-local", env = "INTENT_ALLOW_LOCAL")]
    allow_local: bool,

    /// Only run behaviors whose name contains this (plus dependencies).
    #[arg(short = 'f', long = "filter")]
    filter: Option<String>,

    /// Only run behaviors with this tag (repeatable).
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Run independent behaviors concurrently.
    #[arg(long = "parallel")]
    parallel: bool,

    /// Output format.
    #[arg(long = "format", default_value = "text")]
    format: OutputFormat,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Yaml,
}

/// What gets printed or saved for one spec run.
#[derive(Debug, Serialize)]
struct ReportEnvelope {
    spec: String,
    timestamp: String,
    result: SpecResult,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn print_spec_result(result: &SpecResult) {
    let status = if result.pass {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!("{} spec: {} ({} ms)", status, result.name, result.duration_ms);

    for (i, behavior) in result.behaviors.iter().enumerate() {
        let mark = match &behavior.outcome {
            BehaviorOutcome::Passed => "\x1b[32m✓\x1b[0m",
            BehaviorOutcome::Failed { .. } => "\x1b[31m✗\x1b[0m",
            BehaviorOutcome::Blocked { .. } => "\x1b[33m-\x1b[0m",
        };
        info!(
            "  {}. {} {} ({} ms)",
            i + 1,
            mark,
            behavior.name,
            behavior.duration_ms
        );
        if let (Some(method), Some(url)) = (&behavior.method, &behavior.url) {
            debug!(
                "     {} {} -> {}",
                method,
                url,
                behavior.status.map(|s| s.to_string()).unwrap_or_default()
            );
        }

        match &behavior.outcome {
            BehaviorOutcome::Failed { problems } => {
                for problem in problems {
                    let field = problem
                        .field
                        .as_deref()
                        .map(|f| format!("{f}: "))
                        .unwrap_or_default();
                    error!("     \x1b[31m{}{}\x1b[0m", field, problem.explanation);
                }
            }
            BehaviorOutcome::Blocked { dependency } => {
                info!("     \x1b[33mBlocked: requires {}\x1b[0m", dependency);
            }
            BehaviorOutcome::Passed => {}
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\
         \n  \x1b[31mFailed: {}\x1b[0m\n  \x1b[33mBlocked: {}\x1b[0m",
        result.total, result.passed, result.failed, result.blocked
    );
}

fn render_text(report: &ReportEnvelope) -> String {
    let result = &report.result;
    let mut content = String::new();
    content.push_str(&format!("Spec: {}\n", report.spec));
    content.push_str(&format!("Timestamp: {}\n", report.timestamp));
    content.push_str(&format!(
        "Status: {}\n",
        if result.pass { "PASS" } else { "FAIL" }
    ));
    content.push_str(&format!("Duration: {} ms\n\n", result.duration_ms));
    content.push_str("Behaviors:\n");
    for (i, behavior) in result.behaviors.iter().enumerate() {
        content.push_str(&format!(
            "  {}. {} ({})\n",
            i + 1,
            behavior.name,
            behavior.outcome.label().to_uppercase()
        ));
        match &behavior.outcome {
            BehaviorOutcome::Failed { problems } => {
                for problem in problems {
                    content.push_str(&format!("     Problem: {}\n", problem.explanation));
                }
            }
            BehaviorOutcome::Blocked { dependency } => {
                content.push_str(&format!("     Requires: {dependency}\n"));
            }
            BehaviorOutcome::Passed => {}
        }
    }
    content.push_str(&format!(
        "\nPassed: {}, Failed: {}, Blocked: {}, Total: {}\n",
        result.passed, result.failed, result.blocked, result.total
    ));
    content
}

fn render(reports: &[ReportEnvelope], format: OutputFormat) -> Result<String> {
    let content = match (format, reports) {
        (OutputFormat::Json, [single]) => serde_json::to_string_pretty(single)?,
        (OutputFormat::Json, many) => serde_json::to_string_pretty(many)?,
        (OutputFormat::Yaml, [single]) => serde_yaml::to_string(single)?,
        (OutputFormat::Yaml, many) => serde_yaml::to_string(many)?,
        (OutputFormat::Text, many) => many.iter().map(render_text).collect::<Vec<_>>().join("\n"),
    };
    Ok(content)
}

fn save_report(
    report: &ReportEnvelope,
    report_dir: &Path,
    format: OutputFormat,
) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir).with_context(|| {
            format!("Failed to create report directory: {}", report_dir.display())
        })?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = report.spec.replace([' ', '/'], "_");
    let extension = match format {
        OutputFormat::Json => "json",
        OutputFormat::Yaml => "yaml",
        OutputFormat::Text => "txt",
    };
    let file_path = report_dir.join(format!("{sanitized_name}-{timestamp}.{extension}"));

    let content = render(std::slice::from_ref(report), format)?;
    let mut file = File::create(&file_path)
        .with_context(|| format!("Failed to create report file: {}", file_path.display()))?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

fn load_specs(path: &Path) -> Result<Vec<Spec>> {
    if !path.exists() {
        return Err(anyhow!("Path does not exist: {}", path.display()));
    }

    let loader = SpecLoader::new();
    let specs = if path.is_dir() {
        loader.load_specs_from_dir(path)?
    } else {
        vec![loader.load_spec(path)?]
    };

    if specs.is_empty() {
        return Err(anyhow!("No specs found in {}", path.display()));
    }
    Ok(specs)
}

/// Worst code wins: load errors, then failures, then blocks.
fn combine_exit_codes(codes: impl IntoIterator<Item = i32>) -> i32 {
    codes.into_iter().fold(0, |acc, code| {
        let rank = |c: i32| match c {
            EXIT_LOAD_ERROR => 3,
            1 => 2,
            2 => 1,
            _ => 0,
        };
        if rank(code) > rank(acc) {
            code
        } else {
            acc
        }
    })
}

async fn run(args: Cli) -> i32 {
    let mut specs = match load_specs(&args.spec_path) {
        Ok(specs) => specs,
        Err(e) => {
            error!("\x1b[31mFailed to load spec: {:#}\x1b[0m", e);
            return EXIT_LOAD_ERROR;
        }
    };

    let config = RunConfig {
        allow_local_targets: args.allow_local,
        parallel: args.parallel,
        filter: args.filter,
        tags: args.tags,
    };
    let runner = match DefaultSpecRunner::new() {
        Ok(runner) => runner,
        Err(e) => {
            error!("\x1b[31mFailed to build HTTP client: {}\x1b[0m", e);
            return EXIT_LOAD_ERROR;
        }
    };
    let mut codes = Vec::with_capacity(specs.len());
    let mut reports = Vec::with_capacity(specs.len());

    for spec in &mut specs {
        if let Some(base_url) = &args.base_url {
            spec.config.base_url = base_url.clone();
        }
        if let Some(timeout_ms) = args.timeout_ms {
            spec.config.timeout_ms = timeout_ms;
        }

        match runner.run(spec, &config).await {
            Ok(result) => {
                codes.push(result.exit_code());
                let report = ReportEnvelope {
                    spec: spec.name.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                    result,
                };
                if args.format == OutputFormat::Text {
                    print_spec_result(&report.result);
                }
                if let Some(dir) = &args.report_dir {
                    match save_report(&report, dir, args.format) {
                        Ok(path) => info!("Report saved: {}", path.display()),
                        Err(e) => error!("Failed to save report: {:#}", e),
                    }
                }
                reports.push(report);
            }
            Err(e) => {
                error!("\x1b[31mSpec '{}' is invalid: {}\x1b[0m", spec.name, e);
                codes.push(EXIT_LOAD_ERROR);
            }
        }
    }

    if args.format != OutputFormat::Text && !reports.is_empty() {
        match render(&reports, args.format) {
            Ok(content) => println!("{content}"),
            Err(e) => error!("Failed to render report: {:#}", e),
        }
    }

    combine_exit_codes(codes)
}

#[tokio::main]
async fn main() {
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE_ERROR,
            };
            let _ = e.print();
            exit(code);
        }
    };

    init_tracing(args.verbose);
    exit(run(args).await);
}
