#[cfg(test)]
pub mod config_test;

use thiserror::Error;
use zbus::names::WellKnownName;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::cli::{Args, BusKind};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required option --{0}")]
    MissingOption(&'static str),
    #[error("invalid bus name `{0}`")]
    InvalidBusName(String),
    #[error("invalid object path `{0}`")]
    InvalidObjectPath(String),
}

/// Validated runtime configuration for one proxy instance. Built once from
/// the command line and never mutated.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Well-known name of the proxied service on the source bus
    pub source_bus_name: String,
    /// Object path the proxied service is rooted at
    pub source_object_path: OwnedObjectPath,
    /// Well-known name the proxy claims on the target bus
    pub proxy_bus_name: String,
    pub source_bus_type: BusKind,
    pub target_bus_type: BusKind,
    /// Promote the oldest secondary agent registration when a primary's
    /// owner drops off the bus
    pub promote_secondary: bool,
}

impl ProxyConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let source_bus_name = required(&args.source_bus_name, "source-bus-name")?;
        let proxy_bus_name = required(&args.proxy_bus_name, "proxy-bus-name")?;
        let source_object_path = required(&args.source_object_path, "source-object-path")?;

        WellKnownName::try_from(source_bus_name.as_str())
            .map_err(|_| ConfigError::InvalidBusName(source_bus_name.clone()))?;
        WellKnownName::try_from(proxy_bus_name.as_str())
            .map_err(|_| ConfigError::InvalidBusName(proxy_bus_name.clone()))?;
        let source_object_path = ObjectPath::try_from(source_object_path.as_str())
            .map_err(|_| ConfigError::InvalidObjectPath(source_object_path.clone()))?
            .into();

        Ok(Self {
            source_bus_name,
            source_object_path,
            proxy_bus_name,
            source_bus_type: args.source_bus_type,
            target_bus_type: args.target_bus_type,
            promote_secondary: args.promote_secondary,
        })
    }
}

fn required(value: &str, option: &'static str) -> Result<String, ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::MissingOption(option));
    }
    Ok(value.to_string())
}
