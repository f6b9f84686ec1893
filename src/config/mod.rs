//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in secrecy::SecretString to prevent log leaks.

use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Overrides the host identity derived from the local hostname.
    pub host_name: Option<String>,
    pub pipeline: PipelineSettings,
    pub links: LinkSettings,
}

/// Batch sizes, retry bound and fleet size.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Items per reservation and per claimed batch.
    pub max_batch_size: u64,
    /// Attempts per email before it is marked failed.
    pub max_failure_count: u32,
    /// Worker tasks per host.
    pub process_count: u32,
    /// Send items scheduled further out than this are left for a later run.
    pub due_window_secs: u64,
    pub sendmail_program: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_failure_count: 3,
            process_count: 4,
            due_window_secs: 300,
            sendmail_program: "/usr/sbin/sendmail".to_string(),
        }
    }
}

impl PipelineSettings {
    pub fn due_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.due_window_secs).unwrap_or(i64::MAX))
    }

    fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be positive".into()));
        }
        if self.max_failure_count == 0 {
            return Err(Error::Config("max_failure_count must be positive".into()));
        }
        if self.process_count == 0 {
            return Err(Error::Config("process_count must be positive".into()));
        }
        Ok(())
    }
}

/// Locale-specific URL bases used by builtin tags.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Domain of the bounce mailbox used in envelope senders.
    pub mailbox_domain: String,
    pub userservice_da: String,
    pub userservice_other: String,
    pub letter_url_da: String,
    pub letter_url_int: String,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            mailbox_domain: "mailbox.localhost".to_string(),
            userservice_da: "http://localhost".to_string(),
            userservice_other: "http://localhost".to_string(),
            letter_url_da: "http://localhost".to_string(),
            letter_url_int: "http://localhost".to_string(),
        }
    }
}

impl LinkSettings {
    pub fn userservice(&self, danish: bool) -> &str {
        if danish {
            &self.userservice_da
        } else {
            &self.userservice_other
        }
    }

    pub fn letter_url(&self, danish: bool) -> &str {
        if danish {
            &self.letter_url_da
        } else {
            &self.letter_url_int
        }
    }
}

/// Layout of the `MAILQ_CONFIG` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    pipeline: PipelineSettings,
    links: LinkSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let file = match std::env::var("MAILQ_CONFIG") {
            Ok(path) => load_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };

        let mut pipeline = file.pipeline;
        if let Some(n) = parsed_var("MAX_BATCH_SIZE")? {
            pipeline.max_batch_size = n;
        }
        if let Some(n) = parsed_var("MAX_FAILURE_COUNT")? {
            pipeline.max_failure_count = n;
        }
        if let Some(n) = parsed_var("PROCESS_COUNT")? {
            pipeline.process_count = n;
        }
        pipeline.validate()?;

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            host_name: std::env::var("MAILQ_HOST").ok().filter(|h| !h.is_empty()),
            pipeline,
            links: file.links,
        })
    }
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&text).map_err(|e| Error::Config(format!("invalid {}: {e}", path.display())))
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} is not a valid number: {raw}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_tables_are_optional() {
        let parsed: FileConfig = toml::from_str(
            r#"
            [pipeline]
            process_count = 8

            [links]
            mailbox_domain = "bounce.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.pipeline.process_count, 8);
        assert_eq!(parsed.pipeline.max_batch_size, 1000);
        assert_eq!(parsed.links.mailbox_domain, "bounce.example.com");
        assert_eq!(parsed.links.letter_url_int, "http://localhost");
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let settings = PipelineSettings {
            process_count: 0,
            ..PipelineSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
