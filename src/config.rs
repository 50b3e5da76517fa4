//! Configuration loading and schema definitions for testgrid.
//!
//! Configuration is TOML. Every field has a default; loading also expands
//! `~` and environment variables in paths and checks that the worker and
//! queue bounds are consistent.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Commented default configuration, printed by `testgrid init`.
pub const DEFAULT_CONFIG: &str = r#"# testgrid configuration

[queue]
# Submissions beyond this many queued tests are rejected.
max_size = 100
# Tests waiting longer than this are marked TIMEOUT.
timeout_secs = 1800
sweep_interval_secs = 60
# Finished tests stay queryable in memory this long.
retention_secs = 300

[pool]
min_workers = 3
max_workers = 10
idle_timeout_secs = 300
reclaim_interval_secs = 60

[autoscaler]
enabled = false
check_interval_ms = 10000
scale_up_threshold = 2
scale_down_threshold = 0
scale_up_step = 1
scale_down_step = 1

[execution]
test_retry_delay_ms = 3000
screenshots_dir = "screenshots"

[store]
type = "memory"
# type = "file"
# dir = "~/.testgrid"
"#;

/// Loads testgrid configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema or fails validation
///
/// # Example
///
/// ```no_run
/// use testgrid::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testgrid.toml"))?;
/// println!("Max workers: {}", config.pool.max_workers);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    load_config_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Loads testgrid configuration from a TOML string.
///
/// # Example
///
/// ```
/// use testgrid::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [autoscaler]
///     enabled = true
/// "#)?;
///
/// assert!(config.autoscaler.enabled);
/// assert_eq!(config.pool.min_workers, 3);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    expand_paths(&mut config)?;
    validate(&config)?;
    Ok(config)
}

/// Checks cross-field constraints the schema cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.pool.max_workers == 0 {
        bail!("pool.max_workers must be at least 1");
    }
    if config.pool.min_workers > config.pool.max_workers {
        bail!(
            "pool.min_workers ({}) exceeds pool.max_workers ({})",
            config.pool.min_workers,
            config.pool.max_workers
        );
    }
    if config.queue.max_size == 0 {
        bail!("queue.max_size must be at least 1");
    }
    if config.queue.sweep_interval_secs == 0 || config.pool.reclaim_interval_secs == 0 {
        bail!("sweep and reclaim intervals must be at least 1 second");
    }
    if config.autoscaler.check_interval_ms == 0 {
        bail!("autoscaler.check_interval_ms must be positive");
    }
    Ok(())
}

fn expand_paths(config: &mut Config) -> Result<()> {
    config.execution.screenshots_dir = expand(&config.execution.screenshots_dir)?;
    if let StoreConfig::File { dir } = &mut config.store {
        *dir = expand(dir)?;
    }
    Ok(())
}

fn expand(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path: {raw}"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.queue.max_size, 100);
        assert_eq!(config.queue.timeout_secs, 1800);
        assert_eq!(config.pool.min_workers, 3);
        assert_eq!(config.pool.max_workers, 10);
        assert!(!config.autoscaler.enabled);
        assert_eq!(config.autoscaler.check_interval_ms, 10_000);
        assert_eq!(config.execution.test_retry_delay_ms, 3000);
        assert_eq!(config.store, StoreConfig::Memory);
    }

    #[test]
    fn test_default_template_matches_defaults() {
        let config = load_config_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_file_store_with_home_expansion() {
        let config = load_config_str(
            r#"
            [store]
            type = "file"
            dir = "~/grid"
            "#,
        )
        .unwrap();

        match config.store {
            StoreConfig::File { dir } => {
                assert!(!dir.to_string_lossy().starts_with('~'));
                assert!(dir.ends_with("grid"));
            }
            other => panic!("unexpected store {other:?}"),
        }
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = load_config_str(
            r#"
            [pool]
            min_workers = 5
            max_workers = 2
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_unknown_store_type_rejected() {
        assert!(load_config_str("[store]\ntype = \"redis\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nmax_size = 7").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.queue.max_size, 7);
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = load_config(Path::new("/nonexistent/testgrid.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/testgrid.toml"));
    }
}
