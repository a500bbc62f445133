//! `wm config` command implementation.

use std::io::{self, Write};
use std::path::PathBuf;

use clap::Args;
use wm_config::Config;

use crate::error::CliError;
use crate::output::Output;

/// Arguments for the config command.
#[derive(Args)]
pub(crate) struct ConfigArgs {
    /// Dotted key to print, e.g. `filter_pipeline.timeout_ms` (default: all).
    key: Option<String>,

    /// Path to configuration file (default: auto-discover wm.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl ConfigArgs {
    /// Execute the config command.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration fails to load or the key is unknown.
    pub(crate) fn execute(self) -> Result<(), CliError> {
        let output = Output::new();
        let config = Config::load(self.config.as_deref(), None)?;

        if let Some(path) = &config.config_path {
            output.info(&format!("Using {}", path.display()));
        } else {
            output.info("No wm.toml found, showing defaults");
        }

        let key = self.key.unwrap_or_default();
        let value = config
            .lookup(&key)
            .ok_or_else(|| CliError::Validation(format!("unknown configuration key: {key}")))?;

        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", format_value(&value)?)?;
        Ok(())
    }
}

/// Tables print as TOML documents, everything else as a TOML value.
fn format_value(value: &toml::Value) -> Result<String, CliError> {
    match value {
        toml::Value::Table(_) => toml::to_string_pretty(value)
            .map(|s| s.trim_end().to_owned())
            .map_err(|e| CliError::Format(e.to_string())),
        toml::Value::String(s) => Ok(s.clone()),
        other => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_format_scalars() {
        let config = Config::default();
        let timeout = config.lookup("filter_pipeline.timeout_ms").unwrap();
        assert_eq!(format_value(&timeout).unwrap(), "10000");

        let base = config.lookup("links.page_base").unwrap();
        assert_eq!(format_value(&base).unwrap(), "/wiki/");
    }

    #[test]
    fn test_format_table() {
        let config = Config::default();
        let parser = config.lookup("parser").unwrap();
        let text = format_value(&parser).unwrap();
        assert!(text.contains("caching = true"));
        assert!(text.contains("max_handlers = 100"));
    }
}
