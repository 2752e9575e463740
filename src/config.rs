//! Gateway configuration.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;
use serde::Deserialize;
use url::Url;

use crate::model::ServiceInfoDocument;
use crate::model::WesEndpoint;

/// Default host to bind to.
const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port to bind to.
const DEFAULT_PORT: u16 = 8080;

/// Default database URL (in-memory SQLite database).
const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";

/// Default max database connections.
const DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// Default root directory for per-run workspaces.
const DEFAULT_STORAGE_PATH: &str = "./runs";

/// Default alphabet for generated run identifiers.
const DEFAULT_ID_CHARSET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Default length of generated run identifiers.
const DEFAULT_ID_LENGTH: usize = 6;

/// Default number of attempts when minting a unique run identifier.
const DEFAULT_DB_INSERT_ATTEMPTS: u32 = 10;

/// Default wait between status polls, in seconds.
const DEFAULT_POLLING_WAIT: f64 = 3.0;

/// Default number of consecutive bad poll responses tolerated.
const DEFAULT_POLLING_ATTEMPTS: u32 = 100;

/// Default page size for `GET /runs`.
const DEFAULT_PAGE_SIZE: i64 = 5;

/// Default timeout for outgoing status polls, in seconds.
const DEFAULT_TIMEOUT: u64 = 3;

/// Gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// The upstream WES endpoint run requests are forwarded to.
    #[serde(default)]
    pub wes: WesConfig,
    /// Settings for `POST /runs` and the background tracker.
    #[serde(default)]
    pub post_runs: PostRunsConfig,
    /// Settings for `GET /runs`.
    #[serde(default)]
    pub list_runs: ListRunsConfig,
    /// Global defaults for outgoing requests.
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Service descriptor registered into the service-info singleton at
    /// startup.
    #[serde(default)]
    pub service_info: Option<ServiceInfoDocument>,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host to bind to (default: `127.0.0.1`).
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to (default: `8080`).
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database URL (e.g., `sqlite://gateway.db`).
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum database connections (default: `20`).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// The configured upstream WES endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WesConfig {
    /// Host at which the upstream WES API is served, without the base path.
    #[serde(default)]
    pub host: String,
    /// Base path of the upstream WES API (default: `/ga4gh/wes/v1`).
    #[serde(default = "WesEndpoint::default_base_path")]
    pub base_path: String,
}

/// Configuration for `POST /runs` and the background tracker.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostRunsConfig {
    /// Root directory for per-run workspaces.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// How many times to mint a new run identifier when inserting a run
    /// document before giving up.
    #[serde(default = "default_db_insert_attempts")]
    pub db_insert_attempts: u32,
    /// Alphabet for generated run identifiers.
    #[serde(default = "default_id_charset")]
    pub id_charset: String,
    /// Length of generated run identifiers.
    #[serde(default = "default_id_length")]
    pub id_length: usize,
    /// Timeout, in seconds, when forwarding a run request upstream. Absent
    /// means no timeout.
    #[serde(default)]
    pub timeout_post: Option<u64>,
    /// Soft time limit, in seconds, for the background tracker of a run.
    /// Absent means no limit.
    #[serde(default)]
    pub timeout_job: Option<u64>,
    /// Wait, in seconds, between status polls.
    #[serde(default = "default_polling_wait")]
    pub polling_wait: f64,
    /// How many consecutive bad poll responses are tolerated before the run
    /// is moved to `SYSTEM_ERROR`.
    #[serde(default = "default_polling_attempts")]
    pub polling_attempts: u32,
}

impl PostRunsConfig {
    /// The forward timeout as a duration, if enabled.
    pub fn timeout_post(&self) -> Option<Duration> {
        self.timeout_post.map(Duration::from_secs)
    }

    /// The tracker soft time limit as a duration, if enabled.
    pub fn timeout_job(&self) -> Option<Duration> {
        self.timeout_job.map(Duration::from_secs)
    }

    /// The wait between status polls as a duration.
    pub fn polling_wait(&self) -> Duration {
        Duration::from_secs_f64(self.polling_wait)
    }
}

/// Configuration for `GET /runs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListRunsConfig {
    /// Default page size for response pagination.
    #[serde(default = "default_page_size")]
    pub default_page_size: i64,
}

/// Global defaults for outgoing requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultsConfig {
    /// Timeout, in seconds, applied to each status poll.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl DefaultsConfig {
    /// The status poll timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Default host function for serde.
fn default_host() -> String {
    String::from(DEFAULT_HOST)
}

/// Default port function for serde.
fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Default database URL function for serde.
fn default_database_url() -> String {
    String::from(DEFAULT_DATABASE_URL)
}

/// Default max connections function for serde.
fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

/// Default storage path function for serde.
fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_PATH)
}

/// Default insert attempts function for serde.
fn default_db_insert_attempts() -> u32 {
    DEFAULT_DB_INSERT_ATTEMPTS
}

/// Default identifier charset function for serde.
fn default_id_charset() -> String {
    String::from(DEFAULT_ID_CHARSET)
}

/// Default identifier length function for serde.
fn default_id_length() -> usize {
    DEFAULT_ID_LENGTH
}

/// Default polling wait function for serde.
fn default_polling_wait() -> f64 {
    DEFAULT_POLLING_WAIT
}

/// Default polling attempts function for serde.
fn default_polling_attempts() -> u32 {
    DEFAULT_POLLING_ATTEMPTS
}

/// Default page size function for serde.
fn default_page_size() -> i64 {
    DEFAULT_PAGE_SIZE
}

/// Default poll timeout function for serde.
fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for WesConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            base_path: WesEndpoint::default_base_path(),
        }
    }
}

impl Default for PostRunsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            db_insert_attempts: default_db_insert_attempts(),
            id_charset: default_id_charset(),
            id_length: default_id_length(),
            timeout_post: None,
            timeout_job: None,
            polling_wait: default_polling_wait(),
            polling_attempts: default_polling_attempts(),
        }
    }
}

impl Default for ListRunsConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// parsed configuration fails validation.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration at `{}`", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse configuration at `{}`", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any setting is out of range or the upstream host
    /// is missing or not a valid URL.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.wes.host.is_empty() {
            bail!("`wes.host` must be set");
        }
        Url::parse(&self.wes.host)
            .with_context(|| format!("`wes.host` is not a valid URL: `{}`", self.wes.host))?;
        if self.post_runs.id_charset.is_empty() {
            bail!("`post_runs.id_charset` must not be empty");
        }
        if self.post_runs.id_length == 0 {
            bail!("`post_runs.id_length` must be greater than zero");
        }
        if self.post_runs.db_insert_attempts == 0 {
            bail!("`post_runs.db_insert_attempts` must be greater than zero");
        }
        if self.post_runs.polling_wait < 0.0 {
            bail!("`post_runs.polling_wait` must be non-negative");
        }
        if self.list_runs.default_page_size <= 0 {
            bail!("`list_runs.default_page_size` must be greater than zero");
        }
        Ok(())
    }
}
