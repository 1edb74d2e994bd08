use std::path::PathBuf;

use serde::Deserialize;

/// Static informations we require to operate
#[derive(Debug, Deserialize)]
pub struct Config {
    /// An optional custom data directory
    pub data_dir: Option<PathBuf>,
    /// What messages to log
    pub log_level: Option<String>,
    /// Whether to log to a file in the data directory rather than on stdout
    pub log_to_file: Option<bool>,
    /// A JSON file mapping block heights to the source of the payments created
    /// at that height, for databases holding payments recorded without one.
    pub payment_sources: Option<PathBuf>,
}

#[derive(PartialEq, Eq, Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Get the absolute path to our default data directory, `~/.pooldb/`
pub fn datadir_path() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|mut path| {
            path.push(".pooldb");
            path
        })
        .ok_or_else(|| ConfigError("Could not locate the configuration directory.".to_string()))
}

fn config_file_path() -> Result<PathBuf, ConfigError> {
    datadir_path().map(|mut path| {
        path.push("config.toml");
        path
    })
}

impl Config {
    /// Get our static configuration out of a mandatory configuration file.
    pub fn from_file(custom_path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let config_file = match custom_path {
            Some(path) => path,
            None => config_file_path()?,
        };

        let config = std::fs::read(&config_file)
            .map_err(|e| ConfigError(format!("Reading configuration file: {}", e)))
            .and_then(|file_content| {
                toml::from_slice::<Config>(&file_content)
                    .map_err(|e| ConfigError(format!("Parsing configuration file: {}", e)))
            })?;

        if let Some(ref level) = config.log_level {
            if level.parse::<log::LevelFilter>().is_err() {
                return Err(ConfigError(format!("Invalid log level '{}'", level)));
            }
        }

        Ok(config)
    }
}
