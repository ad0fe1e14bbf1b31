use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

impl std::fmt::Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SslMode::Disable => write!(f, "disable"),
            SslMode::Prefer => write!(f, "prefer"),
            SslMode::Require => write!(f, "require"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Seconds a cached query result stays valid.
    pub expiration_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            expiration_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CsvSettings {
    pub delimiter: char,
}

impl Default for CsvSettings {
    fn default() -> Self {
        CsvSettings { delimiter: ',' }
    }
}

/// Where stored SQL runs. Kept separate from the metadata database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadConnectionSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub ssl_mode: SslMode,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for ReadConnectionSettings {
    fn default() -> Self {
        ReadConnectionSettings {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            username: "postgres".to_string(),
            password: String::new(),
            ssl_mode: SslMode::default(),
            max_connections: 5,
            acquire_timeout_secs: 10,
        }
    }
}

impl ReadConnectionSettings {
    /// Connection URL with user and password percent-encoded.
    pub fn connection_string(&self) -> String {
        let username = urlencoding::encode(&self.username);
        let password = urlencoding::encode(&self.password);

        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            username, password, self.host, self.port, self.database, self.ssl_mode
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DataclipSettings {
    pub cache: CacheSettings,
    pub csv: CsvSettings,
    pub read_connection: ReadConnectionSettings,
}

impl DataclipSettings {
    pub fn cached_query_expiration(&self) -> Duration {
        Duration::from_secs(self.cache.expiration_secs)
    }

    /// The delimiter as the single byte the CSV writer expects.
    pub fn csv_delimiter(&self) -> Result<u8> {
        let delimiter = self.csv.delimiter;
        if delimiter.is_ascii() && delimiter != '"' && delimiter != '\n' && delimiter != '\r' {
            Ok(delimiter as u8)
        } else {
            Err(Error::Settings(format!(
                "csv delimiter must be a single ASCII character other than a quote or newline, got {:?}",
                delimiter
            )))
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.csv_delimiter()?;
        if self.cache.expiration_secs == 0 {
            return Err(Error::Settings(
                "cache expiration must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}
