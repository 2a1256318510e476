use std::{net::IpAddr, path::Path, path::PathBuf};

use serde::Deserialize;

/// Errors raised while loading or validating the TOML configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to decode config file: {0}")]
    Decode(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration for the daemon, deserialized from TOML.
///
/// ```toml
/// [ssh_server]
/// bind_address = "0.0.0.0"
/// bind_port = 2022
/// host_key_path = "/etc/localshow/host_key"
/// authorized_keys_path = "/etc/localshow/authorized_keys"
///
/// [http_server]
/// bind_address = "0.0.0.0"
/// bind_port = 8080
/// domain_name = "example.test"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ssh_server: SshServerConfig,
    pub http_server: HttpServerConfig,
    #[serde(default)]
    pub debug_server: DebugServerConfig,
    /// Statistics datastore used by the brute-force recorder. Optional;
    /// without it failed login attempts are only logged.
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshServerConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Host private key. Generated on first run if the file is absent.
    pub host_key_path: PathBuf,
    /// Required unless `disable_auth` is set.
    pub authorized_keys_path: Option<PathBuf>,
    #[serde(default)]
    pub disable_auth: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Apex domain under which tunnel subdomains are minted.
    pub domain_name: String,
    /// Reserved labels; tunnels requesting one of these are rejected.
    #[serde(default)]
    pub excluded_subdomains: Vec<String>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub tls_bind_port: u16,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugServerConfig {
    #[serde(default)]
    pub bind_address: String,
    #[serde(default)]
    pub bind_port: u16,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file. Created if missing.
    pub path: PathBuf,
    #[serde(default)]
    pub debug: bool,
    /// Recognized for compatibility; GeoIP enrichment is not performed.
    pub geoip_db_file: Option<PathBuf>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ssh_server.validate()?;
        self.http_server.validate()?;
        self.debug_server.validate()?;
        Ok(())
    }
}

impl SshServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_port == 0 {
            return Err(ConfigError::Invalid("invalid ssh port nr 0".into()));
        }
        if self.host_key_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("host key path is required".into()));
        }
        if !self.disable_auth
            && self
                .authorized_keys_path
                .as_ref()
                .is_none_or(|path| path.as_os_str().is_empty())
        {
            return Err(ConfigError::Invalid(
                "authorized keys path is required when auth is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}

impl HttpServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_port == 0 {
            return Err(ConfigError::Invalid("invalid http port nr 0".into()));
        }
        if self.bind_address.parse::<IpAddr>().is_err() {
            // Deeper validation is pointless; a bad address will fail at
            // bind time anyway.
            return Err(ConfigError::Invalid("invalid http IP address".into()));
        }
        if self.domain_name.is_empty() {
            return Err(ConfigError::Invalid("domain name is required".into()));
        }
        if self.use_tls {
            if self.tls_bind_port == 0 {
                return Err(ConfigError::Invalid("invalid tls port nr 0".into()));
            }
            let Some(tls) = self.tls.as_ref() else {
                return Err(ConfigError::Invalid("missing tls section".into()));
            };
            tls.validate()?;
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }

    pub fn tls_bind_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.tls_bind_port)
    }
}

impl TlsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.certificate.as_os_str().is_empty() || self.key.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("missing crt or key".into()));
        }
        if !self.certificate.exists() {
            return Err(ConfigError::Invalid(format!(
                "certificate file {} does not exist",
                self.certificate.display()
            )));
        }
        if !self.key.exists() {
            return Err(ConfigError::Invalid(format!(
                "key file {} does not exist",
                self.key.display()
            )));
        }
        Ok(())
    }
}

impl DebugServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.bind_port == 0 {
            return Err(ConfigError::Invalid("invalid debug port nr 0".into()));
        }
        if self.bind_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid("invalid debug IP address".into()));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}
