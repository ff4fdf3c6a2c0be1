use clap::{Parser, ValueEnum};

/// Which message bus a connection should be made to.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// The system-wide message bus
    System,
    /// The per-login-session message bus
    Session,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Well-known name of the service to proxy on the source bus
    #[arg(long, default_value = "")]
    pub source_bus_name: String,

    /// Object path the proxied service is rooted at
    #[arg(long, default_value = "")]
    pub source_object_path: String,

    /// Well-known name the proxy claims on the target bus
    #[arg(long, default_value = "")]
    pub proxy_bus_name: String,

    /// Bus the proxied service lives on
    #[arg(long, value_enum, default_value = "system")]
    pub source_bus_type: BusKind,

    /// Bus the proxy exposes the service on
    #[arg(long, value_enum, default_value = "session")]
    pub target_bus_type: BusKind,

    /// Hand the primary agent role to the oldest secondary when the primary's
    /// owner drops off the bus, keeping the service-side agent alive
    #[arg(long)]
    pub promote_secondary: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable info logging
    #[arg(long)]
    pub info: bool,
}
