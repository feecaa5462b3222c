use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Command scheduler defaults, in milliseconds unless noted.
pub const DEFAULT_PARALLELISM: usize = 4;
pub const MAX_COMMAND_DELAY_MS: i64 = 14_400 * 60 * 1000; // 10 days
pub const DEFAULT_REPEAT_INTERVAL_MS: i64 = 5_000;
pub const PERMANENT_COMMAND_DELAY_MS: i64 = 60 * 1000;
pub const FINALIZED_RETENTION_MS: i64 = 4 * 24 * 60 * 60 * 1000;
pub const CLEANUP_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;
pub const COMMANDS_CLEANER: &str = "commandsCleanerCommand";

/// Top-level config (trailnode.toml + TRAILNODE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tuning for the durable command executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Maximum number of commands executing at the same time.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Longest single timer the executor arms. Longer waits are served as a
    /// chain of timers no longer than this.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: i64,
    /// Re-arm interval for repeating commands that carry no `period`.
    #[serde(default = "default_repeat_interval_ms")]
    pub default_repeat_interval_ms: i64,
    /// Delay before a freshly recreated permanent command first runs.
    #[serde(default = "default_permanent_command_delay_ms")]
    pub permanent_command_delay_ms: i64,
    /// Singleton maintenance commands deleted and recreated on every boot.
    #[serde(default = "default_permanent")]
    pub permanent: Vec<String>,
    /// Command names never resumed by replay.
    #[serde(default)]
    pub replay_excluded: Vec<String>,
    /// Emit per-command trace logs (started, delayed, processed).
    #[serde(default)]
    pub verbose_logging: bool,
    /// How long finished commands are kept before the cleaner removes them.
    #[serde(default = "default_finalized_retention_ms")]
    pub finalized_retention_ms: i64,
    /// How often the cleaner runs.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: i64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            max_delay_ms: MAX_COMMAND_DELAY_MS,
            default_repeat_interval_ms: DEFAULT_REPEAT_INTERVAL_MS,
            permanent_command_delay_ms: PERMANENT_COMMAND_DELAY_MS,
            permanent: default_permanent(),
            replay_excluded: Vec::new(),
            verbose_logging: false,
            finalized_retention_ms: FINALIZED_RETENTION_MS,
            cleanup_interval_ms: CLEANUP_INTERVAL_MS,
        }
    }
}

fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}
fn default_max_delay_ms() -> i64 {
    MAX_COMMAND_DELAY_MS
}
fn default_repeat_interval_ms() -> i64 {
    DEFAULT_REPEAT_INTERVAL_MS
}
fn default_permanent_command_delay_ms() -> i64 {
    PERMANENT_COMMAND_DELAY_MS
}
fn default_permanent() -> Vec<String> {
    vec![COMMANDS_CLEANER.to_string()]
}
fn default_finalized_retention_ms() -> i64 {
    FINALIZED_RETENTION_MS
}
fn default_cleanup_interval_ms() -> i64 {
    CLEANUP_INTERVAL_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.trailnode/trailnode.db", home)
}

impl NodeConfig {
    /// Load config from a TOML file with TRAILNODE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.trailnode/trailnode.toml
    ///
    /// Nested keys use a double underscore in env vars, e.g.
    /// `TRAILNODE_COMMANDS__PARALLELISM=8`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: NodeConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TRAILNODE_").split("__"))
            .extract()
            .map_err(|e| crate::error::NodeError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.trailnode/trailnode.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_node_constants() {
        let cfg = CommandsConfig::default();
        assert_eq!(cfg.parallelism, 4);
        assert_eq!(cfg.max_delay_ms, 864_000_000);
        assert_eq!(cfg.default_repeat_interval_ms, 5_000);
        assert_eq!(cfg.permanent, vec![COMMANDS_CLEANER.to_string()]);
        assert!(cfg.replay_excluded.is_empty());
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[commands]\nparallelism = 2\nreplay_excluded = [\"autoupdaterCommand\"]\n\n[database]\npath = \"/tmp/node.db\""
        )
        .unwrap();

        let cfg = NodeConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.commands.parallelism, 2);
        assert_eq!(cfg.commands.replay_excluded, vec!["autoupdaterCommand"]);
        assert_eq!(cfg.commands.default_repeat_interval_ms, DEFAULT_REPEAT_INTERVAL_MS);
        assert_eq!(cfg.database.path, "/tmp/node.db");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = NodeConfig::load(Some("/nonexistent/trailnode.toml")).unwrap();
        assert_eq!(cfg.commands.parallelism, DEFAULT_PARALLELISM);
    }
}
