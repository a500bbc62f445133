//! Configuration management for the wm markup pipeline.
//!
//! Parses `wm.toml` configuration files with serde and provides
//! auto-discovery of config files in parent directories. Every section is
//! optional; missing keys take the documented defaults.
//!
//! CLI settings can be applied during load via [`CliSettings`], and any value
//! can be read back by its dotted key path with [`Config::lookup`].
//!
//! ## Environment Variable Expansion
//!
//! String configuration values support environment variable expansion:
//!
//! - `${VAR}` - expands to the value of VAR, errors if unset
//! - `${VAR:-default}` - expands to VAR if set, otherwise uses default
//!
//! Expanded fields:
//! - `links.page_base`
//! - `links.edit_base`
//! - `links.attachment_base`
//! - `links.interwiki.<name>.url`

mod expand;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// CLI settings that override configuration file values.
///
/// All fields are optional. Only non-None values override the loaded config.
#[derive(Debug, Default)]
pub struct CliSettings {
    /// Override the parse-result caching flag.
    pub caching: Option<bool>,
    /// Override the filter chain enable flag.
    pub filters_enabled: Option<bool>,
    /// Override parallel filter execution.
    pub parallel_filters: Option<bool>,
    /// Override fail-fast filter errors.
    pub fail_on_error: Option<bool>,
    /// Override performance monitoring.
    pub monitoring: Option<bool>,
}

/// Configuration filename to search for.
const CONFIG_FILENAME: &str = "wm.toml";

/// Highest priority a handler or filter may declare.
pub const MAX_PRIORITY: u32 = 1000;

/// Application configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Core parser switches.
    pub parser: ParserConfig,
    /// Per-handler overrides keyed by handler id.
    pub handlers: BTreeMap<String, HandlerOverride>,
    /// Content filter configuration.
    pub filters: FiltersConfig,
    /// Filter chain execution settings.
    pub filter_pipeline: FilterPipelineConfig,
    /// Cache region settings.
    pub cache: CacheConfig,
    /// Performance monitoring settings.
    pub performance: PerformanceConfig,
    /// Link resolution settings.
    pub links: LinksConfig,

    /// Path to the config file (set after loading).
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

/// Core parser switches.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Whether wiki markup processing is enabled at all.
    pub enabled: bool,
    /// Whether rendered pages are cached.
    pub caching: bool,
    /// Default TTL in seconds for rendered pages.
    pub cache_ttl: u64,
    /// Width in seconds of the time bucket mixed into cache fingerprints.
    pub time_bucket_secs: u64,
    /// Maximum number of registered syntax handlers.
    pub max_handlers: usize,
    /// Allow `%%(prop:value) … /%` inline CSS in style blocks.
    pub allow_inline_css: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            caching: true,
            cache_ttl: 300,
            time_bucket_secs: 300,
            max_handlers: 100,
            allow_inline_css: false,
        }
    }
}

/// Override for a single syntax handler.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HandlerOverride {
    /// Enable or disable the handler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Replace the handler's built-in priority.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

/// Content filter configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FiltersConfig {
    /// Master switch for the filter phase.
    pub enabled: bool,
    /// Security filter settings.
    pub security: SecurityConfig,
    /// Spam filter settings.
    pub spam: SpamConfig,
    /// Validation filter settings.
    pub validation: ValidationConfig,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            security: SecurityConfig::default(),
            spam: SpamConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

/// Security filter settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Whether the filter is registered.
    pub enabled: bool,
    /// Remove script injection vectors.
    pub prevent_xss: bool,
    /// Drop tags and attributes outside the allow lists.
    pub sanitize_html: bool,
    /// Remove embedded objects, frames and similar active content.
    pub strip_dangerous_content: bool,
    /// Keep `data:` URIs.
    pub allow_data_uris: bool,
    /// Content longer than this many bytes is rejected.
    pub max_content_length: usize,
    /// Tags kept by HTML sanitizing.
    pub allowed_tags: Vec<String>,
    /// Attributes kept by HTML sanitizing.
    pub allowed_attributes: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        let tags = [
            "p", "div", "span", "strong", "em", "b", "i", "u", "s", "del", "code", "pre",
            "blockquote", "ul", "ol", "li", "h1", "h2", "h3", "h4", "h5", "h6", "a", "img", "br",
            "hr", "table", "thead", "tbody", "tr", "th", "td", "sup", "sub", "input",
        ];
        let attributes = ["class", "id", "href", "src", "alt", "title", "target", "rel", "style"];
        Self {
            enabled: true,
            prevent_xss: true,
            sanitize_html: true,
            strip_dangerous_content: true,
            allow_data_uris: false,
            max_content_length: 1_048_576,
            allowed_tags: tags.iter().map(|t| (*t).to_owned()).collect(),
            allowed_attributes: attributes.iter().map(|a| (*a).to_owned()).collect(),
        }
    }
}

/// Spam filter settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SpamConfig {
    /// Whether the filter is registered.
    pub enabled: bool,
    /// Link count above which content is flagged.
    pub max_links: usize,
    /// Image count above which content is flagged.
    pub max_images: usize,
    /// Content shorter than this (in characters, trimmed) scores as suspicious.
    pub min_content_length: usize,
    /// Replace flagged content instead of prefixing a warning.
    pub auto_block: bool,
    /// Words that add to the spam score.
    pub blacklisted_words: Vec<String>,
    /// Link domains that never add to the spam score.
    pub whitelisted_domains: Vec<String>,
    /// Score at which content is flagged.
    pub score_threshold: u32,
}

impl Default for SpamConfig {
    fn default() -> Self {
        let words = ["spam", "casino", "pharmacy", "viagra", "cialis", "lottery", "winner"];
        let domains = ["wikipedia.org", "github.com", "stackoverflow.com", "mozilla.org"];
        Self {
            enabled: true,
            max_links: 10,
            max_images: 5,
            min_content_length: 10,
            auto_block: false,
            blacklisted_words: words.iter().map(|w| (*w).to_owned()).collect(),
            whitelisted_domains: domains.iter().map(|d| (*d).to_owned()).collect(),
            score_threshold: 50,
        }
    }
}

/// Validation filter settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Whether the filter is registered.
    pub enabled: bool,
    /// Check for unclosed markup constructs.
    pub validate_markup: bool,
    /// Check link URLs.
    pub validate_links: bool,
    /// Check image URLs.
    pub validate_images: bool,
    /// Maximum content length in characters (0 disables the rule).
    pub max_content_length: usize,
    /// Maximum line length in characters (0 disables the rule).
    pub max_line_length: usize,
    /// Minimum word count (0 disables the rule).
    pub min_word_count: usize,
    /// Annotate content with validation errors.
    pub report_errors: bool,
    /// Annotate content with validation warnings too.
    pub report_warnings: bool,
    /// Turn validation errors into a filter failure.
    pub fail_on_validation_error: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            validate_markup: true,
            validate_links: true,
            validate_images: true,
            max_content_length: 1_048_576,
            max_line_length: 10_000,
            min_word_count: 5,
            report_errors: true,
            report_warnings: false,
            fail_on_validation_error: false,
        }
    }
}

/// Filter chain execution settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterPipelineConfig {
    /// Maximum number of registered filters.
    pub max_filters: usize,
    /// Per-filter timeout in milliseconds.
    pub timeout_ms: u64,
    /// Fail the whole chain on the first filter error.
    pub fail_on_error: bool,
    /// Run filters sharing a priority concurrently.
    pub enable_parallel_execution: bool,
    /// Record chain timings and raise performance alerts.
    pub enable_profiling: bool,
}

impl Default for FilterPipelineConfig {
    fn default() -> Self {
        Self {
            max_filters: 50,
            timeout_ms: 10_000,
            fail_on_error: false,
            enable_parallel_execution: false,
            enable_profiling: true,
        }
    }
}

/// Named cache regions used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheRegionId {
    /// Fully rendered pages.
    ParseResults,
    /// Output of individual syntax handlers.
    HandlerResults,
    /// Extraction results (placeholder text and element list).
    Patterns,
    /// Resolved variable values.
    Variables,
}

impl CacheRegionId {
    /// All regions in a fixed order.
    pub const ALL: [Self; 4] = [
        Self::ParseResults,
        Self::HandlerResults,
        Self::Patterns,
        Self::Variables,
    ];

    /// Region name as used in configuration and by cache providers.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseResults => "parse_results",
            Self::HandlerResults => "handler_results",
            Self::Patterns => "patterns",
            Self::Variables => "variables",
        }
    }

    fn default_ttl(self) -> u64 {
        match self {
            Self::ParseResults => 300,
            Self::HandlerResults => 600,
            Self::Patterns => 3600,
            Self::Variables => 900,
        }
    }

    fn default_max_size(self) -> usize {
        match self {
            Self::ParseResults => 1000,
            Self::HandlerResults => 2000,
            Self::Patterns => 100,
            Self::Variables => 500,
        }
    }
}

/// Per-region overrides as written in `wm.toml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Enable or disable the region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Entry TTL in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Maximum number of entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
}

/// Resolved settings for one cache region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSettings {
    /// Whether reads and writes go to the provider.
    pub enabled: bool,
    /// Entry TTL in seconds.
    pub ttl: u64,
    /// Maximum number of entries.
    pub max_size: usize,
}

/// Cache region configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Rendered page region.
    pub parse_results: RegionConfig,
    /// Handler output region.
    pub handler_results: RegionConfig,
    /// Extraction result region.
    pub patterns: RegionConfig,
    /// Variable value region.
    pub variables: RegionConfig,
}

impl CacheConfig {
    /// Settings for `region` with defaults filled in.
    #[must_use]
    pub fn settings(&self, region: CacheRegionId) -> RegionSettings {
        let raw = match region {
            CacheRegionId::ParseResults => &self.parse_results,
            CacheRegionId::HandlerResults => &self.handler_results,
            CacheRegionId::Patterns => &self.patterns,
            CacheRegionId::Variables => &self.variables,
        };
        RegionSettings {
            enabled: raw.enabled.unwrap_or(true),
            ttl: raw.ttl.unwrap_or_else(|| region.default_ttl()),
            max_size: raw.max_size.unwrap_or_else(|| region.default_max_size()),
        }
    }
}

/// Performance monitoring settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Whether render metrics raise alerts.
    pub monitoring: bool,
    /// Alert thresholds.
    pub alert_thresholds: AlertThresholds,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            monitoring: true,
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

/// Thresholds that trigger render performance alerts.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Average uncached parse time in milliseconds.
    pub parse_time_ms: u64,
    /// Minimum acceptable cache hit ratio.
    pub cache_hit_ratio: f64,
    /// Maximum acceptable error ratio.
    pub error_rate: f64,
    /// Cache lookups required before the hit ratio is judged.
    pub min_cache_samples: u64,
    /// Minimum seconds between two threshold checks. 0 checks after every
    /// render.
    pub check_interval_secs: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            parse_time_ms: 100,
            cache_hit_ratio: 0.2,
            error_rate: 0.05,
            min_cache_samples: 50,
            check_interval_secs: 60,
        }
    }
}

/// Link resolution settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LinksConfig {
    /// URL prefix for existing pages.
    pub page_base: String,
    /// URL prefix for pages that do not exist yet.
    pub edit_base: String,
    /// URL prefix for page attachments.
    pub attachment_base: String,
    /// `InterWiki` sites keyed by prefix. Specifying this table replaces the defaults.
    pub interwiki: BTreeMap<String, InterWikiSite>,
}

impl Default for LinksConfig {
    fn default() -> Self {
        let mut interwiki = BTreeMap::new();
        interwiki.insert(
            "Wikipedia".to_owned(),
            InterWikiSite::new("https://en.wikipedia.org/wiki/%s"),
        );
        interwiki.insert(
            "JSPWiki".to_owned(),
            InterWikiSite::new("https://jspwiki-wiki.apache.org/Wiki.jsp?page=%s"),
        );
        Self {
            page_base: "/wiki/".to_owned(),
            edit_base: "/edit/".to_owned(),
            attachment_base: "/attachments/".to_owned(),
            interwiki,
        }
    }
}

/// A single `InterWiki` target.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InterWikiSite {
    /// URL template; `%s` is replaced by the encoded page name.
    pub url: String,
    /// Whether links with this prefix are resolved.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Open resolved links in a new window.
    #[serde(default = "default_true")]
    pub open_in_new_window: bool,
}

impl InterWikiSite {
    /// Enabled site opening in a new window.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            enabled: true,
            open_in_new_window: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File not found.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Validation error.
    #[error("Configuration error: {0}")]
    Validation(String),
    /// Environment variable error during expansion.
    #[error("Environment variable error in {field}: {message}")]
    EnvVar {
        /// Config field path (e.g., "`links.page_base`").
        field: String,
        /// Error message (e.g., "${`WIKI_BASE`} not set").
        message: String,
    },
}

/// Require a string field to be non-empty.
fn require_non_empty(value: &str, field: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

/// Require a URL field to use http:// or https:// scheme.
fn require_http_url(url: &str, field: &str) -> Result<(), ConfigError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "{field} must start with http:// or https://"
        )));
    }
    Ok(())
}

/// Require a positive numeric field.
fn require_positive(value: u64, field: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Validation(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

/// Require a ratio in `0.0..=1.0`.
fn require_ratio(value: f64, field: &str) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Validation(format!(
            "{field} must be between 0 and 1"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from file with optional CLI settings.
    ///
    /// If `config_path` is provided, loads from that file.
    /// Otherwise, searches for `wm.toml` in current directory and parents,
    /// falling back to defaults when none is found.
    ///
    /// # Errors
    ///
    /// Returns error if explicit `config_path` doesn't exist, or if parsing,
    /// expansion or validation fails.
    pub fn load(
        config_path: Option<&Path>,
        cli_settings: Option<&CliSettings>,
    ) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Self::load_from_file(path)?
        } else if let Some(discovered) = Self::discover_config() {
            Self::load_from_file(&discovered)?
        } else {
            Self::default()
        };

        if let Some(settings) = cli_settings {
            config.apply_cli_settings(settings);
        }

        Ok(config)
    }

    /// Parse configuration from a TOML string, expanding and validating it.
    ///
    /// # Errors
    ///
    /// Returns error if parsing, expansion or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.expand_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI settings to the configuration.
    fn apply_cli_settings(&mut self, settings: &CliSettings) {
        if let Some(caching) = settings.caching {
            self.parser.caching = caching;
        }
        if let Some(enabled) = settings.filters_enabled {
            self.filters.enabled = enabled;
        }
        if let Some(parallel) = settings.parallel_filters {
            self.filter_pipeline.enable_parallel_execution = parallel;
        }
        if let Some(fail_on_error) = settings.fail_on_error {
            self.filter_pipeline.fail_on_error = fail_on_error;
        }
        if let Some(monitoring) = settings.monitoring {
            self.performance.monitoring = monitoring;
        }
    }

    /// Override for the handler with `id`, if configured.
    #[must_use]
    pub fn handler_override(&self, id: &str) -> Option<&HandlerOverride> {
        self.handlers.get(id)
    }

    /// Look up a value by dotted key path (e.g. `filter_pipeline.timeout_ms`).
    ///
    /// Returns `None` for unknown keys.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<toml::Value> {
        let root = toml::Value::try_from(self).ok()?;
        if key.is_empty() {
            return Some(root);
        }
        key.split('.')
            .try_fold(root, |value, segment| match value {
                toml::Value::Table(mut table) => table.remove(segment),
                _ => None,
            })
    }

    /// Search for config file in current directory and parents.
    fn discover_config() -> Option<PathBuf> {
        let mut current = std::env::current_dir().ok()?;
        loop {
            let candidate = current.join(CONFIG_FILENAME);
            if candidate.exists() {
                return Some(candidate);
            }
            if !current.pop() {
                return None;
            }
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// Called automatically after loading from file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if any validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_parser()?;
        self.validate_handlers()?;
        self.validate_filters()?;
        self.validate_performance()?;
        self.validate_links()?;
        Ok(())
    }

    fn validate_parser(&self) -> Result<(), ConfigError> {
        require_positive(self.parser.cache_ttl, "parser.cache_ttl")?;
        require_positive(self.parser.time_bucket_secs, "parser.time_bucket_secs")?;
        require_positive(self.parser.max_handlers as u64, "parser.max_handlers")?;

        for region in CacheRegionId::ALL {
            let settings = self.cache.settings(region);
            let name = region.as_str();
            require_positive(settings.ttl, &format!("cache.{name}.ttl"))?;
            require_positive(settings.max_size as u64, &format!("cache.{name}.max_size"))?;
        }
        Ok(())
    }

    fn validate_handlers(&self) -> Result<(), ConfigError> {
        for (id, settings) in &self.handlers {
            if let Some(priority) = settings.priority
                && priority > MAX_PRIORITY
            {
                return Err(ConfigError::Validation(format!(
                    "handlers.{id}.priority cannot exceed {MAX_PRIORITY}"
                )));
            }
        }
        Ok(())
    }

    fn validate_filters(&self) -> Result<(), ConfigError> {
        let pipeline = &self.filter_pipeline;
        require_positive(pipeline.max_filters as u64, "filter_pipeline.max_filters")?;
        require_positive(pipeline.timeout_ms, "filter_pipeline.timeout_ms")?;
        require_positive(
            self.filters.security.max_content_length as u64,
            "filters.security.max_content_length",
        )?;
        require_positive(
            u64::from(self.filters.spam.score_threshold),
            "filters.spam.score_threshold",
        )?;
        Ok(())
    }

    fn validate_performance(&self) -> Result<(), ConfigError> {
        let thresholds = &self.performance.alert_thresholds;
        require_positive(
            thresholds.parse_time_ms,
            "performance.alert_thresholds.parse_time_ms",
        )?;
        require_ratio(
            thresholds.cache_hit_ratio,
            "performance.alert_thresholds.cache_hit_ratio",
        )?;
        require_ratio(
            thresholds.error_rate,
            "performance.alert_thresholds.error_rate",
        )?;
        Ok(())
    }

    fn validate_links(&self) -> Result<(), ConfigError> {
        require_non_empty(&self.links.page_base, "links.page_base")?;
        require_non_empty(&self.links.edit_base, "links.edit_base")?;
        require_non_empty(&self.links.attachment_base, "links.attachment_base")?;
        for (name, site) in &self.links.interwiki {
            let field = format!("links.interwiki.{name}.url");
            require_non_empty(&site.url, &field)?;
            require_http_url(&site.url, &field)?;
        }
        Ok(())
    }

    /// Expand environment variable references in configuration strings.
    fn expand_env_vars(&mut self) -> Result<(), ConfigError> {
        self.links.page_base = expand::expand_env(&self.links.page_base, "links.page_base")?;
        self.links.edit_base = expand::expand_env(&self.links.edit_base, "links.edit_base")?;
        self.links.attachment_base =
            expand::expand_env(&self.links.attachment_base, "links.attachment_base")?;

        for (name, site) in &mut self.links.interwiki {
            site.url = expand::expand_env(&site.url, &format!("links.interwiki.{name}.url"))?;
        }

        Ok(())
    }
}
