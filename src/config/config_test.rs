use clap::Parser;

use crate::cli::{Args, BusKind};
use crate::config::{ConfigError, ProxyConfig};

fn full_args() -> Vec<&'static str> {
    vec![
        "busbridge",
        "--source-bus-name",
        "org.freedesktop.NetworkManager",
        "--source-object-path",
        "/org/freedesktop",
        "--proxy-bus-name",
        "org.freedesktop.NetworkManager",
    ]
}

#[test]
fn accepts_complete_arguments() {
    let args = Args::try_parse_from(full_args()).unwrap();
    let config = ProxyConfig::from_args(&args).unwrap();

    assert_eq!(config.source_bus_name, "org.freedesktop.NetworkManager");
    assert_eq!(config.source_object_path.as_str(), "/org/freedesktop");
    assert_eq!(config.proxy_bus_name, "org.freedesktop.NetworkManager");
    assert_eq!(config.source_bus_type, BusKind::System);
    assert_eq!(config.target_bus_type, BusKind::Session);
    assert!(!config.promote_secondary);
}

#[test]
fn rejects_missing_mandatory_options() {
    let args = Args::try_parse_from(["busbridge"]).unwrap();
    let err = ProxyConfig::from_args(&args).unwrap_err();
    assert!(matches!(err, ConfigError::MissingOption("source-bus-name")));
}

#[test]
fn rejects_empty_mandatory_option() {
    let mut argv = full_args();
    argv[2] = "";
    let args = Args::try_parse_from(argv).unwrap();
    let err = ProxyConfig::from_args(&args).unwrap_err();
    assert!(matches!(err, ConfigError::MissingOption("source-bus-name")));
}

#[test]
fn rejects_invalid_bus_name() {
    let mut argv = full_args();
    argv[2] = "not a bus name";
    let args = Args::try_parse_from(argv).unwrap();
    let err = ProxyConfig::from_args(&args).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidBusName(_)));
}

#[test]
fn rejects_invalid_object_path() {
    let mut argv = full_args();
    argv[4] = "no/leading/slash";
    let args = Args::try_parse_from(argv).unwrap();
    let err = ProxyConfig::from_args(&args).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidObjectPath(_)));
}

#[test]
fn parses_bus_types_and_promotion() {
    let mut argv = full_args();
    argv.extend([
        "--source-bus-type",
        "session",
        "--target-bus-type",
        "system",
        "--promote-secondary",
    ]);
    let args = Args::try_parse_from(argv).unwrap();
    let config = ProxyConfig::from_args(&args).unwrap();

    assert_eq!(config.source_bus_type, BusKind::Session);
    assert_eq!(config.target_bus_type, BusKind::System);
    assert!(config.promote_secondary);
}
