//! Environment and file loading for the node configuration.
//!
//! Precedence: environment keys override file keys; defaults fill the rest.
//! Unknown keys in either source are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::defaults;
use crate::error::{ConfigError, ConfigResult};
use crate::model::{Config, NodeRole};

/// Keys recognised in the environment, without the `OMNICLOUD_` prefix.
const ENV_PREFIX: &str = "OMNICLOUD_";

/// File-side representation; every field optional so the file can be partial.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    role: Option<String>,
    node_name: Option<String>,
    hub_url: Option<String>,
    api_port: Option<u16>,
    tracker_port: Option<u16>,
    relay_port: Option<u16>,
    relay_enabled: Option<bool>,
    torrent_data_port: Option<u16>,
    registration_key: Option<String>,
    hash_workers: Option<usize>,
    generation_workers: Option<usize>,
    library_root: Option<PathBuf>,
    torrent_root: Option<PathBuf>,
    catalog_path: Option<PathBuf>,
    advertise_host: Option<String>,
    log_level: Option<String>,
    log_format: Option<String>,
}

/// Load configuration from the process environment, overlaying
/// `OMNICLOUD_CONFIG_FILE` when it points at a TOML file.
///
/// # Errors
///
/// Returns an error if a required key is missing from every source or a value
/// fails validation.
pub fn load_from_env() -> ConfigResult<Config> {
    let env: HashMap<String, String> = std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(ENV_PREFIX)
                .map(|stripped| (stripped.to_ascii_lowercase(), value))
        })
        .collect();

    let file = match env.get("config_file") {
        Some(path) => read_file(Path::new(path))?,
        None => FileConfig::default(),
    };

    load_from_sources(&env, file)
}

/// Assemble a configuration from pre-collected sources. Exposed for tests.
///
/// # Errors
///
/// Returns an error if a required key is missing or a value fails validation.
pub fn load_from_sources(
    env: &HashMap<String, String>,
    file: FileConfig,
) -> ConfigResult<Config> {

    let role_raw = env
        .get("role")
        .cloned()
        .or(file.role)
        .ok_or(ConfigError::MissingKey {
            key: "OMNICLOUD_ROLE",
        })?;
    let role = NodeRole::from_str(&role_raw)?;

    let node_name =
        env.get("node_name")
            .cloned()
            .or(file.node_name)
            .ok_or(ConfigError::MissingKey {
                key: "OMNICLOUD_NODE_NAME",
            })?;

    let registration_key = env
        .get("registration_key")
        .cloned()
        .or(file.registration_key)
        .ok_or(ConfigError::MissingKey {
            key: "OMNICLOUD_REGISTRATION_KEY",
        })?;

    let hub_url = env.get("hub_url").cloned().or(file.hub_url);
    if role == NodeRole::Site && hub_url.is_none() {
        return Err(ConfigError::MissingKey {
            key: "OMNICLOUD_HUB_URL",
        });
    }

    let library_root =
        env.get("library_root")
            .map(PathBuf::from)
            .or(file.library_root)
            .ok_or(ConfigError::MissingKey {
                key: "OMNICLOUD_LIBRARY_ROOT",
            })?;
    let torrent_root =
        env.get("torrent_root")
            .map(PathBuf::from)
            .or(file.torrent_root)
            .ok_or(ConfigError::MissingKey {
                key: "OMNICLOUD_TORRENT_ROOT",
            })?;

    let api_port = parse_port(env, "api_port", file.api_port, defaults::API_PORT)?;
    let tracker_port = parse_port(env, "tracker_port", file.tracker_port, defaults::TRACKER_PORT)?;
    let relay_port = parse_port(env, "relay_port", file.relay_port, defaults::RELAY_PORT)?;
    let torrent_data_port = parse_port(
        env,
        "torrent_data_port",
        file.torrent_data_port,
        defaults::TORRENT_DATA_PORT,
    )?;

    let relay_enabled = match env.get("relay_enabled") {
        Some(raw) => parse_bool("OMNICLOUD_RELAY_ENABLED", raw)?,
        None => file.relay_enabled.unwrap_or(true),
    };

    let hash_workers = parse_workers(
        env,
        "hash_workers",
        file.hash_workers,
        defaults::HASH_WORKERS,
    )?;
    let generation_workers = parse_workers(
        env,
        "generation_workers",
        file.generation_workers,
        defaults::GENERATION_WORKERS,
    )?;

    let catalog_path = env
        .get("catalog_path")
        .map(PathBuf::from)
        .or(file.catalog_path)
        .unwrap_or_else(|| torrent_root.join(defaults::CATALOG_FILE));

    let config = Config {
        role,
        node_name,
        hub_url,
        api_port,
        tracker_port,
        relay_port,
        relay_enabled,
        torrent_data_port,
        registration_key,
        hash_workers,
        generation_workers,
        library_root,
        torrent_root,
        catalog_path,
        advertise_host: env.get("advertise_host").cloned().or(file.advertise_host),
        log_level: env
            .get("log_level")
            .cloned()
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string()),
        log_format: env
            .get("log_format")
            .cloned()
            .or(file.log_format)
            .unwrap_or_else(|| "pretty".to_string()),
    };

    debug!(role = %config.role, node = %config.node_name, "configuration loaded");
    Ok(config)
}

fn read_file(path: &Path) -> ConfigResult<FileConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::FileParse {
        path: path.display().to_string(),
        source,
    })
}

fn parse_port(
    env: &HashMap<String, String>,
    key: &'static str,
    file_value: Option<u16>,
    default: u16,
) -> ConfigResult<u16> {
    match env.get(key) {
        Some(raw) => raw.parse::<u16>().map_err(|_err| ConfigError::InvalidValue {
            key: env_key(key),
            value: raw.clone(),
            reason: "expected a port number",
        }),
        None => Ok(file_value.unwrap_or(default)),
    }
}

fn parse_workers(
    env: &HashMap<String, String>,
    key: &'static str,
    file_value: Option<usize>,
    default: usize,
) -> ConfigResult<usize> {
    let value = match env.get(key) {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_err| ConfigError::InvalidValue {
                key: env_key(key),
                value: raw.clone(),
                reason: "expected a positive integer",
            })?,
        None => file_value.unwrap_or(default),
    };
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: env_key(key),
            value: value.to_string(),
            reason: "worker count must be positive",
        });
    }
    Ok(value)
}

fn parse_bool(key: &'static str, raw: &str) -> ConfigResult<bool> {
    match raw {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key,
            value: other.to_string(),
            reason: "expected a boolean",
        }),
    }
}

fn env_key(key: &str) -> &'static str {
    // Keys are a closed set; map back to the documented environment names.
    match key {
        "api_port" => "OMNICLOUD_API_PORT",
        "tracker_port" => "OMNICLOUD_TRACKER_PORT",
        "relay_port" => "OMNICLOUD_RELAY_PORT",
        "torrent_data_port" => "OMNICLOUD_TORRENT_DATA_PORT",
        "hash_workers" => "OMNICLOUD_HASH_WORKERS",
        "generation_workers" => "OMNICLOUD_GENERATION_WORKERS",
        _ => "OMNICLOUD_UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_env() -> HashMap<String, String> {
        HashMap::from([
            ("role".to_string(), "site".to_string()),
            ("node_name".to_string(), "site-01".to_string()),
            ("hub_url".to_string(), "http://hub:8080".to_string()),
            ("registration_key".to_string(), "secret".to_string()),
            ("library_root".to_string(), "/lib".to_string()),
            ("torrent_root".to_string(), "/tor".to_string()),
        ])
    }

    #[test]
    fn minimal_site_config_loads_with_defaults() {
        let config = load_from_sources(&minimal_env(), FileConfig::default()).expect("config");
        assert_eq!(config.role, NodeRole::Site);
        assert_eq!(config.api_port, defaults::API_PORT);
        assert_eq!(config.hash_workers, defaults::HASH_WORKERS);
        assert_eq!(config.catalog_path, PathBuf::from("/tor/catalog.db"));
        assert!(config.relay_enabled);
    }

    #[test]
    fn missing_role_is_fatal() {
        let mut env = minimal_env();
        env.remove("role");
        let err = load_from_sources(&env, FileConfig::default()).expect_err("must fail");
        assert!(matches!(
            err,
            ConfigError::MissingKey {
                key: "OMNICLOUD_ROLE"
            }
        ));
    }

    #[test]
    fn site_without_hub_url_is_fatal() {
        let mut env = minimal_env();
        env.remove("hub_url");
        let err = load_from_sources(&env, FileConfig::default()).expect_err("must fail");
        assert!(matches!(
            err,
            ConfigError::MissingKey {
                key: "OMNICLOUD_HUB_URL"
            }
        ));
    }

    #[test]
    fn hub_without_hub_url_is_allowed() {
        let mut env = minimal_env();
        env.insert("role".to_string(), "hub".to_string());
        env.remove("hub_url");
        let config = load_from_sources(&env, FileConfig::default()).expect("config");
        assert_eq!(config.role, NodeRole::Hub);
        assert!(config.hub_url.is_none());
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut env = minimal_env();
        env.insert("api_port".to_string(), "not-a-port".to_string());
        let err = load_from_sources(&env, FileConfig::default()).expect_err("must fail");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut env = minimal_env();
        env.insert("hash_workers".to_string(), "0".to_string());
        let err = load_from_sources(&env, FileConfig::default()).expect_err("must fail");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut env = minimal_env();
        env.insert("totally_unknown".to_string(), "x".to_string());
        assert!(load_from_sources(&env, FileConfig::default()).is_ok());
    }

    #[test]
    fn shadow_and_download_roots_derive_from_torrent_root() {
        let config = load_from_sources(&minimal_env(), FileConfig::default()).expect("config");
        assert_eq!(config.shadow_root(), PathBuf::from("/tor/canonical-xml"));
        assert_eq!(config.download_root(), PathBuf::from("/tor/downloads"));
    }
}
