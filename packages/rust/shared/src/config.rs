//! Application configuration for toolpipe.
//!
//! User config lives at `~/.toolpipe/toolpipe.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ToolpipeError};
use crate::types::PipelineSpec;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "toolpipe.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".toolpipe";

// ---------------------------------------------------------------------------
// Config structs (matching toolpipe.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Audit sink settings.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Dynamic conversion heuristic and converter mapping.
    #[serde(default)]
    pub conversion: ConversionConfig,

    /// Keyword routes, checked in order.
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,

    /// Declarative pipelines.
    #[serde(default)]
    pub pipelines: Vec<PipelineSpec>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            audit: AuditConfig::default(),
            conversion: ConversionConfig::default(),
            routes: default_routes(),
            pipelines: Vec::new(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Pipeline used when neither the caller nor a keyword route picks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pipeline: Option<String>,

    /// Per-stage deadline in milliseconds. Unset means no deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_ms: Option<u64>,
}

/// `[audit]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Persist external tool results.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to the audit database. `~` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Fail the stage when persistence fails. `false` logs and continues.
    #[serde(default = "default_true")]
    pub strict: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: default_db_path(),
            strict: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_db_path() -> String {
    "~/.toolpipe/audit.db".into()
}

/// `[conversion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Exact character length of an identifier-shaped string.
    #[serde(default = "default_identifier_length")]
    pub identifier_length: usize,

    /// Literal prefix an identifier-shaped string must start with.
    #[serde(default = "default_identifier_prefix")]
    pub identifier_prefix: String,

    /// Lowercase key fragment that marks a keyed structure as convertible.
    #[serde(default = "default_key_fragment")]
    pub key_fragment: String,

    /// Characters of stringified content sent to the resolver.
    #[serde(default = "default_sample_len")]
    pub sample_len: usize,

    /// Type tag to registered capability name, used by the registry resolver.
    #[serde(default = "default_converters")]
    pub converters: BTreeMap<String, String>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            identifier_length: default_identifier_length(),
            identifier_prefix: default_identifier_prefix(),
            key_fragment: default_key_fragment(),
            sample_len: default_sample_len(),
            converters: default_converters(),
        }
    }
}

fn default_identifier_length() -> usize {
    42
}
fn default_identifier_prefix() -> String {
    "0x".into()
}
fn default_key_fragment() -> String {
    "address".into()
}
fn default_sample_len() -> usize {
    100
}
fn default_converters() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("object".to_string(), "address_to_symbol".to_string()),
        ("string".to_string(), "address_to_symbol".to_string()),
    ])
}

/// `[[routes]]` entry: a keyword trigger for a named pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Pipeline to run when a keyword matches.
    pub pipeline: String,
    /// Case-insensitive substrings that select the pipeline.
    pub keywords: Vec<String>,
}

fn default_routes() -> Vec<RouteConfig> {
    vec![RouteConfig {
        pipeline: "crypto_pipeline".into(),
        keywords: ["crypto", "token", "address", "symbol"]
            .into_iter()
            .map(String::from)
            .collect(),
    }]
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.toolpipe/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ToolpipeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.toolpipe/toolpipe.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ToolpipeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        ToolpipeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ToolpipeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ToolpipeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ToolpipeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ToolpipeError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Reject configs that would only fail later, at pipeline construction or run time.
fn validate(config: &AppConfig) -> Result<()> {
    if config.conversion.identifier_prefix.chars().count() > config.conversion.identifier_length {
        return Err(ToolpipeError::config(
            "conversion.identifier_prefix is longer than conversion.identifier_length",
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for spec in &config.pipelines {
        if spec.name.trim().is_empty() {
            return Err(ToolpipeError::config("pipeline name must not be empty"));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(ToolpipeError::config(format!(
                "pipeline '{}' is declared more than once",
                spec.name
            )));
        }
    }

    for route in &config.routes {
        if route.keywords.is_empty() {
            return Err(ToolpipeError::config(format!(
                "route for '{}' has no keywords",
                route.pipeline
            )));
        }
        if route.keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(ToolpipeError::config(format!(
                "route for '{}' has an empty keyword",
                route.pipeline
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StageSpec;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("db_path"));
        assert!(toml_str.contains("crypto_pipeline"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.conversion.identifier_length, 42);
        assert_eq!(parsed.conversion.identifier_prefix, "0x");
        assert_eq!(parsed.routes[0].keywords.len(), 4);
    }

    #[test]
    fn config_with_pipelines() {
        let toml_str = r#"
[defaults]
default_pipeline = "echo"
stage_timeout_ms = 500

[[pipelines]]
name = "echo"
stages = [{ type = "tool", name = "uppercase" }]

[[routes]]
pipeline = "echo"
keywords = ["shout"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        validate(&config).expect("valid");
        assert_eq!(config.defaults.default_pipeline.as_deref(), Some("echo"));
        assert_eq!(config.defaults.stage_timeout_ms, Some(500));
        assert_eq!(config.pipelines.len(), 1);
        assert_eq!(
            config.pipelines[0].stages[0],
            StageSpec::Tool {
                name: "uppercase".into()
            }
        );
        // Explicit routes replace the built-in crypto route.
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].pipeline, "echo");
        // Untouched sections fall back to defaults.
        assert!(config.audit.strict);
        assert_eq!(config.conversion.sample_len, 100);
    }

    #[test]
    fn duplicate_pipeline_names_rejected() {
        let toml_str = r#"
[[pipelines]]
name = "a"

[[pipelines]]
name = "a"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn routes_need_non_blank_keywords() {
        for (toml_str, expected) in [
            ("[[routes]]\npipeline = \"p\"\nkeywords = []\n", "no keywords"),
            ("[[routes]]\npipeline = \"p\"\nkeywords = [\"ok\", \"  \"]\n", "empty keyword"),
        ] {
            let config: AppConfig = toml::from_str(toml_str).expect("parse");
            let err = validate(&config).unwrap_err();
            assert!(err.to_string().contains(expected), "{err}");
        }
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("tp_cfg_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, "[audit]\nstrict = false\n").expect("write config");
        let config = load_config_from(&path).expect("load");
        assert!(!config.audit.strict);
        assert!(config.audit.enabled);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn expand_home_leaves_plain_paths() {
        assert_eq!(
            expand_home("/tmp/audit.db").expect("expand"),
            PathBuf::from("/tmp/audit.db")
        );
        let expanded = expand_home("~/x.db").expect("expand");
        assert!(expanded.ends_with("x.db"));
        assert!(!expanded.starts_with("~"));
    }
}
