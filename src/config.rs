//! Configuration for ledger-deploy.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LEDGER_DEPLOY_HOME, LEDGER_DEPLOY_DEPLOYMENTS)
//! 2. Config file (.ledger-deploy/config.yaml)
//! 3. Defaults (~/.ledger-deploy)
//!
//! Config file discovery:
//! - Searches current directory and parents for .ledger-deploy/config.yaml
//! - `home` is relative to the .ledger-deploy/ directory, every other path
//!   to the project root (the directory containing .ledger-deploy/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::RetryPolicy;

const CONFIG_DIR: &str = ".ledger-deploy";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Tool state directory (relative to .ledger-deploy/)
    pub home: Option<String>,
    /// Checkpoints, records and journals (relative to project root)
    pub deployments: Option<String>,
    /// Plan files (relative to project root)
    pub plans: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Helper program that submits operations to the ledger
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_seconds: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to the tool home
    pub home: PathBuf,
    /// Directory holding `<env>@partial.json` and archived records
    pub deployments: PathBuf,
    /// Directory searched for `<name>.yaml` plans
    pub plans: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub client: ClientSettings,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_seconds: 120,
        }
    }
}

impl ClientSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };

    resolve(file, config_file, default_home)
}

/// Combine a parsed config file with environment overrides
fn resolve(
    file: Option<ConfigFile>,
    config_file: Option<PathBuf>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let env_home = std::env::var("LEDGER_DEPLOY_HOME").ok().map(PathBuf::from);
    let env_deployments = std::env::var("LEDGER_DEPLOY_DEPLOYMENTS")
        .ok()
        .map(PathBuf::from);

    let (home, deployments, plans, retry, client) = match (file, config_file.as_deref()) {
        (Some(config), Some(config_path)) => {
            // .ledger-deploy/ and the project root above it
            let config_dir = config_path.parent().unwrap_or(Path::new("."));
            let base_dir = config_dir.parent().unwrap_or(Path::new("."));

            let home = match (env_home, &config.paths.home) {
                (Some(home), _) => home,
                (None, Some(home)) => resolve_path(config_dir, home),
                (None, None) => default_home,
            };

            let deployments = match (env_deployments, &config.paths.deployments) {
                (Some(dir), _) => dir,
                (None, Some(dir)) => resolve_path(base_dir, dir),
                (None, None) => home.join("deployments"),
            };

            let plans = config
                .paths
                .plans
                .as_deref()
                .map(|dir| resolve_path(base_dir, dir))
                .unwrap_or_else(|| base_dir.join("plans"));

            let client = config
                .client
                .map(|c| ClientSettings {
                    command: c.command,
                    args: c.args,
                    timeout_seconds: c.timeout_seconds.unwrap_or(120),
                })
                .unwrap_or_default();

            (home, deployments, plans, config.retry.unwrap_or_default(), client)
        }
        _ => {
            // No config file - use env vars or defaults
            let home = env_home.unwrap_or(default_home);
            let deployments = env_deployments.unwrap_or_else(|| home.join("deployments"));

            (
                home,
                deployments,
                PathBuf::from("plans"),
                RetryPolicy::default(),
                ClientSettings::default(),
            )
        }
    };

    Ok(ResolvedConfig {
        home,
        deployments,
        plans,
        config_file,
        retry,
        client,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the deployments directory
pub fn deployments_dir() -> Result<PathBuf> {
    Ok(config()?.deployments.clone())
}

/// Resolve a plan argument: an existing file path, or a name looked up as
/// `<plans>/<name>.yaml`
pub fn plan_path(name_or_path: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(name_or_path);
    if direct.is_file() {
        return Ok(direct);
    }

    let in_plans = config()?.plans.join(format!("{}.yaml", name_or_path));
    if in_plans.is_file() {
        return Ok(in_plans);
    }

    anyhow::bail!(
        "Plan '{}' not found. Looked for:\n  - {}\n  - {}",
        name_or_path,
        direct.display(),
        in_plans.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
version: "1.0"
paths:
  home: ./
  deployments: deployments
  plans: ops/plans
retry:
  max_attempts: 3
  initial_delay_ms: 500
client:
  command: hedera-helper
  args: ["--operator-env", ".env"]
  timeout_seconds: 60
"#;

    fn write_sample(temp: &TempDir) -> PathBuf {
        let dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", SAMPLE).unwrap();
        path
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = write_sample(&temp);

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.deployments.as_deref(), Some("deployments"));

        let retry = config.retry.unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay_ms, 500);
        // Unspecified fields keep their defaults
        assert_eq!(retry.max_delay_ms, RetryPolicy::default().max_delay_ms);

        let client = config.client.unwrap();
        assert_eq!(client.command.as_deref(), Some("hedera-helper"));
        assert_eq!(client.args.len(), 2);
    }

    #[test]
    fn test_resolve_relative_to_project_root() {
        let temp = TempDir::new().unwrap();
        let path = write_sample(&temp);
        let file = load_config_file(&path).unwrap();

        let resolved = resolve(Some(file), Some(path), PathBuf::from("/unused")).unwrap();

        if std::env::var("LEDGER_DEPLOY_DEPLOYMENTS").is_err() {
            assert!(resolved.deployments.ends_with("deployments"));
            assert!(resolved.deployments.starts_with(temp.path()));
        }
        assert!(resolved.plans.ends_with("ops/plans"));
        assert_eq!(resolved.retry.max_attempts, 3);
        assert_eq!(resolved.client.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_defaults_without_file() {
        let resolved = resolve(None, None, PathBuf::from("/opt/ledger-deploy")).unwrap();

        if std::env::var("LEDGER_DEPLOY_HOME").is_err()
            && std::env::var("LEDGER_DEPLOY_DEPLOYMENTS").is_err()
        {
            assert_eq!(resolved.home, PathBuf::from("/opt/ledger-deploy"));
            assert_eq!(
                resolved.deployments,
                PathBuf::from("/opt/ledger-deploy/deployments")
            );
        }
        assert_eq!(resolved.retry, RetryPolicy::default());
        assert!(resolved.client.command.is_none());
        assert!(resolved.config_file.is_none());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
