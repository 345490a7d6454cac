use std::fs::read_to_string;

use anyhow::{ensure, Result};
use once_cell::sync::Lazy;
use serde::{self, Deserialize};
use tracing::{debug, error, info};

use crate::log::DBID_LEN;

// the location of the replog configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/replog/replog.toml";

pub static CONFIG: Lazy<parking_lot::RwLock<Configuration>> = Lazy::new(Default::default);

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Configuration {
    pub log_dir: Option<String>,
    pub dbid: Option<String>,

    /// When set, durability syncs flush buffers but skip fsync.
    #[serde(default)]
    pub no_fsync: bool,
}

impl Configuration {
    pub fn parse_config_file(file: &str) -> Result<Configuration> {
        info!("parsing configuration file: {}", file);

        let file_contents = read_to_string(file)?;

        Ok(toml::from_str(&file_contents)?)
    }

    fn validate(&self) -> Result<()> {
        if let Some(dbid) = &self.dbid {
            ensure!(dbid.len() <= DBID_LEN, "dbid longer than {} bytes", DBID_LEN);
        }

        Ok(())
    }
}

pub fn init_config(config_file: &str) -> Result<()> {
    let conf = Configuration::parse_config_file(config_file)
        .inspect_err(|e| error!("failed to initialize config module, err: {e}"))?;

    conf.validate()?;

    *CONFIG.write() = conf;

    info!("successfully initialized config module");
    debug!("configuration: {:?}", *CONFIG.read());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_config_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replog.toml");
        std::fs::write(
            &path,
            "log_dir = \"/var/lib/replog\"\ndbid = \"db0\"\nno_fsync = true\n",
        )
        .unwrap();

        let conf = Configuration::parse_config_file(path.to_str().unwrap()).unwrap();

        assert_eq!(conf.log_dir.unwrap(), "/var/lib/replog");
        assert_eq!(conf.dbid.unwrap(), "db0");
        assert!(conf.no_fsync);
    }

    #[test]
    pub fn test_config_rejects_long_dbid() {
        let conf = Configuration {
            dbid: Some("x".repeat(DBID_LEN + 1)),
            ..Default::default()
        };

        assert!(conf.validate().is_err());
    }
}
