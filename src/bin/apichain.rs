//! apichain CLI - runs chained API test suites described in YAML.

use anyhow::{anyhow, Context, Result};
use apichain::{
    CallPipeline, ExecutionPlan, NodeResult, Orchestrator, PlanRunner, Project, ProjectLoader,
    RunReport,
};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Run API test suites whose calls feed each other through `${...}`
/// variables.
#[derive(Parser, Debug)]
#[command(name = "apichain", version, about)]
struct Cli {
    /// Project file or directory of project files.
    #[arg(short = 'p', long = "path", default_value = ".")]
    path: PathBuf,

    /// Run only this suite (and the suites it depends on).
    #[arg(short = 's', long = "suite")]
    suite: Option<String>,

    /// Maximum number of scenarios running at the same time.
    #[arg(short = 'w', long = "workers", env = "APICHAIN_WORKERS")]
    workers: Option<usize>,

    /// Timeout in seconds per API call.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Base URL for relative API urls.
    #[arg(short = 'b', long = "base-url", env = "APICHAIN_BASE_URL")]
    base_url: Option<String>,

    /// Keep running dependents and remaining steps after a failure.
    #[arg(long = "continue-on-failure")]
    continue_on_failure: bool,

    /// Validate the project and print the execution order without
    /// sending any request.
    #[arg(long = "check")]
    check: bool,

    /// Directory to save the run report.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
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
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn load_project(cli: &Cli) -> Result<Project> {
    if !cli.path.exists() {
        return Err(anyhow!("Path does not exist: {}", cli.path.display()));
    }
    let mut project = ProjectLoader::new()
        .load(&cli.path)
        .context(format!("Failed to load project from {}", cli.path.display()))?;

    if project.apis.is_empty() && project.suites.is_empty() {
        return Err(anyhow!("No API definitions or suites found in {}", cli.path.display()));
    }

    if project.name.is_empty() {
        project.name = cli
            .path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("apichain")
            .to_string();
    }

    let config = &mut project.config;
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout = timeout;
    }
    if let Some(base_url) = &cli.base_url {
        config.base_url = Some(base_url.clone());
    }
    if cli.continue_on_failure {
        config.continue_on_failure = true;
    }
    Ok(project)
}

fn print_check(plan: &ExecutionPlan, suite: Option<&str>) {
    info!("Project '{}' is valid", plan.name());
    for suite_id in plan.suite_order(suite) {
        info!("suite {}", suite_id);
        for scenario_id in plan.scenario_closure(suite_id) {
            info!("  scenario {}", scenario_id);
            for api_id in plan.api_closure(scenario_id) {
                info!("    api {}", api_id);
            }
        }
    }
}

fn print_node(result: &NodeResult, depth: usize, verbose: bool) {
    let status = if result.passed() {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    let indent = "  ".repeat(depth);
    info!(
        "{}{} {} {} ({} ms)",
        indent, status, result.kind, result.id, result.duration_ms
    );

    if let Some(failure) = &result.failure {
        error!("{}  \x1b[31m{}\x1b[0m", indent, failure);
    }

    if verbose {
        if let Some(request) = &result.request {
            debug!("{}  Request: {}", indent, truncate(&request.to_string()));
        }
        if let Some(response) = &result.response {
            debug!("{}  Response: {}", indent, truncate(&response.to_string()));
        }
    }

    for child in &result.children {
        print_node(child, depth + 1, verbose);
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(500) {
        Some((idx, _)) => format!("{}...(truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

fn render_text(report: &RunReport) -> String {
    fn node(content: &mut String, result: &NodeResult, depth: usize) {
        let indent = "  ".repeat(depth);
        content.push_str(&format!(
            "{}{} {} ({}, {} ms)\n",
            indent,
            result.kind,
            result.id,
            if result.passed() { "PASS" } else { "FAIL" },
            result.duration_ms
        ));
        if let Some(failure) = &result.failure {
            content.push_str(&format!("{indent}  Error: {failure}\n"));
        }
        for child in &result.children {
            node(content, child, depth + 1);
        }
    }

    let mut content = String::new();
    content.push_str(&format!("Project: {}\n", report.project));
    content.push_str(&format!(
        "Status: {}\n",
        if report.success() { "PASS" } else { "FAIL" }
    ));
    content.push_str(&format!(
        "Scenarios: {} passed, {} failed\n",
        report.passed, report.failed
    ));
    content.push_str(&format!("Duration: {} ms\n\n", report.total_duration_ms));
    for suite in &report.suites {
        node(&mut content, suite, 0);
    }
    content
}

fn save_report(report: &RunReport, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = report.project.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(report)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(report)?,
        ),
        ReportFormat::Text => (
            format!("{sanitized_name}-{timestamp}.txt"),
            render_text(report),
        ),
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let project = load_project(&args)?;
    let pipeline = CallPipeline::http().with_default_headers(project.config.headers.clone());

    let plan = match ExecutionPlan::build(project, &pipeline) {
        Ok(plan) => Arc::new(plan),
        Err(err) => {
            error!("\x1b[31m{}\x1b[0m", err);
            exit(1);
        }
    };

    if let Some(suite) = &args.suite {
        if plan.suite(suite).is_none() {
            return Err(anyhow!("Unknown suite: {suite}"));
        }
    }

    if args.check {
        print_check(&plan, args.suite.as_deref());
        return Ok(());
    }

    let orchestrator = Orchestrator::new(Arc::new(pipeline)).with_suite_filter(args.suite.clone());

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight requests");
            cancel.cancel();
        }
    });

    let report = orchestrator.run(plan).await;

    for suite in &report.suites {
        print_node(suite, 0, args.verbose);
    }
    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        report.passed + report.failed,
        report.passed,
        report.failed,
        report.total_duration_ms
    );

    if let Some(dir) = &args.report_dir {
        match save_report(&report, dir, args.report_format) {
            Ok(path) => info!("Report saved: {}", path.display()),
            Err(e) => error!("Failed to save report: {}", e),
        }
    }

    if !report.success() {
        exit(1);
    }

    Ok(())
}
