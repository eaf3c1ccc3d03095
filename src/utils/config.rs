use std::fs;

use crate::utils::types::{Config, Result};

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            max_connections: 1000,
            max_consecutive_errors: 10,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
