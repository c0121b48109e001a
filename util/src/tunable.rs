use anyhow::Result;
use config::{Config, ConfigError};
use lazy_static::lazy_static;
use log::*;
use serde::Deserialize;
use std::{fmt::Debug, sync::RwLock};

lazy_static! {
    pub static ref CONFIG: RwLock<Config> = Default::default();
}

/// Looks up `name` in the loaded tunable config, falling back to `default`
/// when the config has no such key or the value has the wrong type.
pub fn get_tunable<'de, T>(name: &str, default: T) -> T
where
    T: Deserialize<'de> + Debug,
{
    let config = match CONFIG.read() {
        Ok(config) => config,
        Err(poisoned) => poisoned.into_inner(),
    };
    match config.get(name) {
        Ok(v) => {
            info!("{}: using value {:?} from config file", name, v);
            v
        }
        Err(ConfigError::NotFound(_)) => default,
        Err(e) => {
            warn!("{}: {}; using default: {:?}", name, e, default);
            default
        }
    }
}

/// Merges a toml/json/yaml file into the tunable config.  Must be called
/// before the first get_tunable() of any value it sets, since tunables are
/// latched on first use.
pub fn read_tunable_config(file_name: &str) -> Result<()> {
    let mut config = match CONFIG.write() {
        Ok(config) => config,
        Err(poisoned) => poisoned.into_inner(),
    };
    config.merge(config::File::with_name(file_name))?;
    info!("tunable config {}: {}", file_name, config.cache);
    Ok(())
}
