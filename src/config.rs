use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{AuthScheme, Credential};
use crate::error::WekeoError;
use crate::poller::{Backoff, PollPolicy};

pub const DEFAULT_BROKER_URL: &str = "https://wekeo-broker.apps.mercator.dpi.wekeo.eu/databroker";
pub const CONFIG_FILE_NAME: &str = "wekeo.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub broker_url: Option<String>,
    #[serde(default)]
    pub auth_scheme: Option<AuthScheme>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub poll: Option<PollConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PollConfig {
    #[serde(default)]
    pub backoff: Option<BackoffConfig>,
    #[serde(default)]
    pub max_transient_retries: Option<u32>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffConfig {
    Fixed {
        interval_secs: f64,
    },
    Exponential {
        initial_secs: f64,
        #[serde(default = "default_factor")]
        factor: f64,
        max_secs: f64,
    },
}

fn default_factor() -> f64 {
    2.0
}

#[derive(Debug, Clone)]
pub struct Login {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub broker_url: String,
    pub auth_scheme: AuthScheme,
    pub login: Option<Login>,
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub output_dir: Utf8PathBuf,
    pub poll: PollPolicy,
}

impl ResolvedConfig {
    /// Overrides file values with `WEKEO_*` variables from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty("WEKEO_BROKER_URL") {
            self.broker_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(token) = non_empty("WEKEO_TOKEN") {
            self.token = Some(token.trim().to_string());
        }
        if let (Some(username), Some(password)) =
            (non_empty("WEKEO_USERNAME"), non_empty("WEKEO_PASSWORD"))
        {
            self.login = Some(Login { username, password });
        }
    }

    pub fn static_credential(&self) -> Option<Credential> {
        self.token
            .as_ref()
            .map(|token| Credential::new(token.as_str()).with_scheme(self.auth_scheme))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the explicit path, else `./wekeo.json`, else the user config
    /// file, else built-in defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, WekeoError> {
        let config_path = match path {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    return Err(WekeoError::MissingConfig(path));
                }
                Some(path)
            }
            None => Self::discover(),
        };

        let config = match config_path {
            Some(config_path) => {
                tracing::debug!(path = %config_path.display(), "loading config");
                let content = fs::read_to_string(&config_path)
                    .map_err(|_| WekeoError::ConfigRead(config_path.clone()))?;
                serde_json::from_str(&content)
                    .map_err(|err| WekeoError::ConfigParse(err.to_string()))?
            }
            None => Config::default(),
        };

        Self::resolve_config(config)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("eu", "wekeo", "wekeo")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, WekeoError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(WekeoError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let broker_url = config
            .broker_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BROKER_URL.to_string());
        if !broker_url.starts_with("http://") && !broker_url.starts_with("https://") {
            return Err(WekeoError::ConfigParse(format!(
                "broker_url must be an http(s) URL: {broker_url}"
            )));
        }

        let login = match (config.username, config.password) {
            (Some(username), Some(password)) => Some(Login { username, password }),
            (None, None) => None,
            _ => {
                return Err(WekeoError::ConfigParse(
                    "username and password must be set together".to_string(),
                ));
            }
        };

        let poll_config = config.poll.unwrap_or_default();
        let backoff = match poll_config.backoff {
            None => Backoff::default(),
            Some(BackoffConfig::Fixed { interval_secs }) => {
                Backoff::Fixed(seconds("poll.backoff.interval_secs", interval_secs)?)
            }
            Some(BackoffConfig::Exponential {
                initial_secs,
                factor,
                max_secs,
            }) => {
                if !factor.is_finite() || factor < 1.0 {
                    return Err(WekeoError::ConfigParse(format!(
                        "poll.backoff.factor must be >= 1.0, got {factor}"
                    )));
                }
                let initial = seconds("poll.backoff.initial_secs", initial_secs)?;
                let max = seconds("poll.backoff.max_secs", max_secs)?;
                if max < initial {
                    return Err(WekeoError::ConfigParse(
                        "poll.backoff.max_secs is below initial_secs".to_string(),
                    ));
                }
                Backoff::Exponential {
                    initial,
                    factor,
                    max,
                }
            }
        };
        let defaults = PollPolicy::default();
        let poll = PollPolicy {
            backoff,
            max_transient_retries: poll_config
                .max_transient_retries
                .unwrap_or(defaults.max_transient_retries),
            deadline: poll_config.deadline_secs.map(Duration::from_secs),
        };

        Ok(ResolvedConfig {
            schema_version,
            broker_url,
            auth_scheme: config.auth_scheme.unwrap_or_default(),
            login,
            token: config.token.filter(|token| !token.trim().is_empty()),
            request_timeout: Duration::from_secs(config.request_timeout_secs.unwrap_or(60)),
            output_dir: Utf8PathBuf::from(config.output_dir.unwrap_or_else(|| ".".to_string())),
            poll,
        })
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, WekeoError> {
    if !value.is_finite() || value < 0.0 {
        return Err(WekeoError::ConfigParse(format!(
            "{field} must be a non-negative number, got {value}"
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|err| WekeoError::ConfigParse(format!("{field} is out of range: {err}")))
}
