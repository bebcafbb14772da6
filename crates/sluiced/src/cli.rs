//! Command-line surface
//!
//! Required values may come from flags or environment; anything missing
//! is reported and the process exits with code 3.

use clap::Parser;
use sluice::consumer::{DEFAULT_MAX_ACK_PENDING, DEFAULT_MAX_PENDING_BUFFER};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "sluiced",
    version,
    about = "sluice change-data-streaming agent"
)]
pub struct Cli {
    /// Upstream server url, may be multiple comma separated
    #[arg(long, env = "SLUICE_SERVER")]
    pub server: Option<String>,

    /// Driver connection string, e.g. file:///var/lib/sluice/out
    #[arg(long, env = "SLUICE_URL")]
    pub url: Option<String>,

    /// Upstream credentials file (required unless the server is local)
    #[arg(long, env = "SLUICE_CREDS")]
    pub creds: Option<PathBuf>,

    /// Schema registry api url
    #[arg(long = "api-url", env = "SLUICE_API_URL")]
    pub api_url: Option<String>,

    /// Schema registry api key
    #[arg(long = "api-key", env = "SLUICE_API_KEY")]
    pub api_key: Option<String>,

    /// Directory for durable local state
    #[arg(long = "data-dir", env = "SLUICE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory for rotated log files
    #[arg(long = "logs-dir", env = "SLUICE_LOGS_DIR")]
    pub logs_dir: Option<PathBuf>,

    /// Port for the local control surface, health, and metrics
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Tenant owning the durable consumer
    #[arg(long = "company-id", env = "SLUICE_COMPANY_ID")]
    pub company_id: Option<String>,

    /// Restrict the subject filter to specific tenants
    #[arg(long = "company-ids", value_delimiter = ',')]
    pub company_ids: Vec<String>,

    /// Suffix for the durable consumer name (parallel workers)
    #[arg(long = "consumer-suffix", default_value = "")]
    pub consumer_suffix: String,

    /// Maximum number of in-flight messages
    #[arg(long = "max-ack-pending", default_value_t = DEFAULT_MAX_ACK_PENDING)]
    pub max_ack_pending: usize,

    /// Maximum number of messages pulled per request
    #[arg(long = "max-pending-buffer", default_value_t = DEFAULT_MAX_PENDING_BUFFER)]
    pub max_pending_buffer: usize,

    /// Minimum accumulation period in milliseconds (0 uses the default)
    #[arg(long = "min-pending-latency-ms", default_value_t = 0)]
    pub min_pending_latency_ms: u64,

    /// Maximum accumulation period in milliseconds (0 uses the default)
    #[arg(long = "max-pending-latency-ms", default_value_t = 0)]
    pub max_pending_latency_ms: u64,

    /// Read the stream from the beginning (only works on new consumers)
    #[arg(long)]
    pub restart: bool,

    /// Directory of per-table JSON Schema documents
    #[arg(long = "schema-validator")]
    pub schema_validator: Option<PathBuf>,

    /// Turn on verbose logging
    #[arg(long)]
    pub verbose: bool,

    /// Turn off all logging except errors
    #[arg(long)]
    pub silent: bool,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: String,
    pub url: String,
    pub creds: Option<PathBuf>,
    pub api_url: String,
    pub api_key: Option<String>,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub port: u16,
    pub company_id: String,
    pub company_ids: Vec<String>,
    pub consumer_suffix: String,
    pub max_ack_pending: usize,
    pub max_pending_buffer: usize,
    pub min_pending_latency: Duration,
    pub max_pending_latency: Duration,
    pub deliver_all: bool,
    pub schema_validator: Option<PathBuf>,
    pub verbose: bool,
    pub silent: bool,
}

pub fn is_localhost(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1") || url.contains("0.0.0.0")
}

impl Cli {
    /// Resolve required values, or report which flag is missing.
    pub fn validate(self) -> Result<Config, String> {
        fn required<T>(value: Option<T>, flag: &str) -> Result<T, String> {
            value.ok_or_else(|| format!("required flag --{flag} missing"))
        }

        let server = required(self.server, "server")?;
        let creds = match (&self.creds, is_localhost(&server)) {
            (Some(creds), _) => Some(creds.clone()),
            (None, true) => None,
            (None, false) => return Err("required flag --creds missing".to_string()),
        };
        let company_id = match self.company_id {
            Some(id) if !id.is_empty() => id,
            _ if is_localhost(&server) => "dev".to_string(),
            _ => return Err("required flag --company-id missing".to_string()),
        };

        Ok(Config {
            url: required(self.url, "url")?,
            api_url: required(self.api_url, "api-url")?,
            data_dir: required(self.data_dir, "data-dir")?,
            logs_dir: required(self.logs_dir, "logs-dir")?,
            server,
            creds,
            api_key: self.api_key,
            port: self.port,
            company_id,
            company_ids: self.company_ids,
            consumer_suffix: self.consumer_suffix,
            max_ack_pending: self.max_ack_pending,
            max_pending_buffer: self.max_pending_buffer,
            min_pending_latency: Duration::from_millis(self.min_pending_latency_ms),
            max_pending_latency: Duration::from_millis(self.max_pending_latency_ms),
            deliver_all: self.restart,
            schema_validator: self.schema_validator,
            verbose: self.verbose,
            silent: self.silent,
        })
    }
}
