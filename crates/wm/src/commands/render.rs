//! `wm render` command implementation.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use wm_cache::FileCache;
use wm_config::{CliSettings, Config};
use wm_markup::{MarkupPipeline, Metrics, RenderContext, RenderReport, Services};

use crate::error::CliError;
use crate::output::Output;

/// Arguments for the render command.
#[derive(Args)]
pub(crate) struct RenderArgs {
    /// Wiki markup file to render (default: read stdin).
    file: Option<PathBuf>,

    /// Name of the page being rendered.
    #[arg(short, long, default_value = "Main")]
    page: String,

    /// Render as this user (default: anonymous).
    #[arg(short, long)]
    user: Option<String>,

    /// Variable for `[{$name}]` references, as `name=value`. Repeatable.
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    vars: Vec<(String, String)>,

    /// Path to configuration file (default: auto-discover wm.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disable caching.
    #[arg(long)]
    no_cache: bool,

    /// Persist cache regions under this directory between runs.
    #[arg(long, conflicts_with = "no_cache")]
    cache_dir: Option<PathBuf>,

    /// Disable content filters.
    #[arg(long)]
    no_filters: bool,

    /// Run filters of equal priority concurrently.
    #[arg(long)]
    parallel_filters: bool,

    /// Fail instead of skipping a filter that errors.
    #[arg(long)]
    fail_on_error: bool,

    /// Print render metrics as JSON to stderr.
    #[arg(long)]
    metrics: bool,

    /// Enable verbose output (pipeline logs and absorbed errors).
    #[arg(short, long)]
    pub verbose: bool,
}

impl RenderArgs {
    /// Execute the render command.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration fails, the input cannot be read or
    /// the pipeline cannot be built.
    pub(crate) fn execute(self, version: &str) -> Result<(), CliError> {
        let output = Output::new();

        let cli_settings = CliSettings {
            caching: self.no_cache.then_some(false),
            filters_enabled: self.no_filters.then_some(false),
            parallel_filters: self.parallel_filters.then_some(true),
            fail_on_error: self.fail_on_error.then_some(true),
            monitoring: self.metrics.then_some(true),
        };
        let config = Config::load(self.config.as_deref(), Some(&cli_settings))?;

        let content = match &self.file {
            Some(path) => std::fs::read_to_string(path)?,
            None => io::read_to_string(io::stdin())?,
        };

        let mut services = Services::new();
        if !self.vars.is_empty() {
            let vars: BTreeMap<String, String> = self.vars.into_iter().collect();
            services = services.with_variables(Arc::new(vars));
        }

        let mut builder = MarkupPipeline::builder()
            .with_config(config)
            .with_services(services);
        if let Some(dir) = self.cache_dir {
            if self.verbose {
                output.info(&format!("Cache directory: {}", dir.display()));
            }
            builder = builder.with_cache(FileCache::new(dir, version));
        }
        let pipeline = builder.build()?;

        let mut ctx = RenderContext::new(self.page);
        if let Some(user) = self.user {
            ctx = ctx.with_user(user);
        }

        let (html, report) = pipeline.render_with_report(&content, &ctx);
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{html}")?;
        stdout.flush()?;

        if self.verbose {
            print_report(&output, &report);
        }
        if self.metrics {
            print_metrics(&output, &pipeline.metrics())?;
        }

        Ok(())
    }
}

/// Parse a `name=value` variable assignment.
fn parse_var(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid variable '{s}': expected NAME=VALUE"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("invalid variable '{s}': empty name"));
    }
    Ok((name.to_owned(), value.to_owned()))
}

fn print_report(output: &Output, report: &RenderReport) {
    if !report.has_errors() {
        output.success(&format!("Rendered {} elements without errors", report.elements));
        return;
    }
    output.warning(&format!("{} errors absorbed during render:", report.errors.len()));
    for error in &report.errors {
        match &error.component {
            Some(component) => {
                output.warning(&format!("  [{}] {component}: {}", error.phase, error.message));
            }
            None => output.warning(&format!("  [{}] {}", error.phase, error.message)),
        }
    }
}

fn print_metrics(output: &Output, metrics: &Metrics) -> Result<(), CliError> {
    let json =
        serde_json::to_string_pretty(metrics).map_err(|e| CliError::Format(e.to_string()))?;
    output.section("Metrics");
    output.info(&json);
    for alert in &metrics.alerts {
        output.warning(&format!("Alert: {}", alert.message));
    }
    Ok(())
}
