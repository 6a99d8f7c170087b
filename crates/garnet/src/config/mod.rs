use error::ConfigError;
use garnet_transport::ChannelConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod error;

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub channel: ChannelConfig,
    pub traffic: TrafficConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub local_port: u16,
    /// With a remote the binary generates traffic; without one it sinks it.
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficConfig {
    pub rate_pps: u32,
    pub duration_secs: u64,
    /// Probability that a generated packet goes over the reliable channel.
    pub reliable_ratio: f64,
    pub payload_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_port: 6000,
            remote_host: None,
            remote_port: None,
        }
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            rate_pps: 100,
            duration_secs: 30,
            reliable_ratio: 0.5,
            payload_bytes: 512,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.remote_host.is_some() != self.network.remote_port.is_some() {
            return Err(ConfigError::Validation(
                "remote_host and remote_port must be set together.".to_string(),
            ));
        }
        if let Some(host) = &self.network.remote_host {
            if host.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "remote_host cannot be empty.".to_string(),
                ));
            }
        }

        if self.channel.snd_win == 0 {
            return Err(ConfigError::Validation(
                "snd_win must be greater than 0.".to_string(),
            ));
        }
        if self.channel.recv_win == 0 || self.channel.recv_win > 0x7FFF {
            return Err(ConfigError::Validation(
                "recv_win must be between 1 and 32767.".to_string(),
            ));
        }
        if self.channel.skip_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "skip_timeout_ms must be greater than 0.".to_string(),
            ));
        }

        if self.traffic.rate_pps == 0 {
            return Err(ConfigError::Validation(
                "rate_pps must be greater than 0.".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.traffic.reliable_ratio) {
            return Err(ConfigError::Validation(format!(
                "reliable_ratio must be within [0.0, 1.0], got {}.",
                self.traffic.reliable_ratio
            )));
        }
        if self.traffic.payload_bytes == 0 || self.traffic.payload_bytes > 60_000 {
            return Err(ConfigError::Validation(
                "payload_bytes must be between 1 and 60000.".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn handle() -> Result<Config, ConfigError> {
    let config_path = PathBuf::from(CONFIG_FILE_NAME);
    if config_path.exists() {
        let config_content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    } else {
        let config = Config::default();
        save(&config, &config_path)?;
        Ok(config)
    }
}

fn save(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let config_content = toml::to_string_pretty(config)?;
    let mut file = fs::File::create(path)?;
    file.write_all(config_content.as_bytes())?;
    Ok(())
}
