use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::agent::AgentRegistry;
use crate::bus::{BusError, BusLink};
use crate::config::ProxyConfig;
use crate::introspection::IntrospectError;
use crate::relay::SignalRelay;
use crate::router::Router;
use crate::topology::{self, Topology};

/// The tables every component shares: the proxied-object topology and the
/// agent registry, behind one write-preferring lock. Readers are lookups on
/// the call and signal paths; writers are topology and registry mutation.
pub struct ProxyState {
    pub topology: Topology,
    pub agents: AgentRegistry,
}

pub type SharedState = Arc<RwLock<ProxyState>>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("initial discovery failed: {0}")]
    Discovery(#[from] IntrospectError),
    #[error("lost ownership of `{0}` on the target bus")]
    NameLost(String),
    #[error("connection closed unexpectedly: {0}")]
    ConnectionClosed(zbus::Error),
}

/// The daemon: owns the bus link and shared state, wires the router, signal
/// relay and topology maintenance together.
pub struct Proxy {
    config: ProxyConfig,
    bus: BusLink,
    state: SharedState,
}

impl Proxy {
    /// Open both connections, verify the source service is alive and claim
    /// the proxy's name on the target bus.
    pub async fn connect(config: ProxyConfig) -> Result<Self, ProxyError> {
        let bus = BusLink::connect(&config).await?;
        bus.own_proxy_name(&config.proxy_bus_name).await?;
        log::info!(
            "Acquired `{}` on the target bus",
            config.proxy_bus_name
        );
        let state = Arc::new(RwLock::new(ProxyState {
            topology: Topology::default(),
            agents: AgentRegistry::new(&config.source_bus_name, config.promote_secondary),
        }));
        Ok(Self { config, bus, state })
    }

    /// Discover the source topology, then serve both buses. Returns `Ok` when
    /// the source service leaves the bus, which is a clean shutdown.
    pub async fn run(&self) -> Result<(), ProxyError> {
        topology::discover(
            &self.state,
            &self.bus.source,
            &self.config.source_bus_name,
            &self.config.source_object_path,
        )
        .await?;
        {
            let state = self.state.read().await;
            log::info!(
                "Initial discovery complete: {} proxied object(s)",
                state.topology.object_count()
            );
        }

        let router = Router::new(
            self.state.clone(),
            self.bus.source.clone(),
            self.bus.target.clone(),
            self.config.source_bus_name.clone(),
        );
        let relay = SignalRelay::new(
            self.state.clone(),
            self.bus.source.clone(),
            self.bus.target.clone(),
            self.bus.source_owner.clone(),
            self.config.source_object_path.clone(),
        );

        tokio::select! {
            result = self.bus.wait_source_vanished(&self.config.source_bus_name) => {
                result.map_err(ProxyError::ConnectionClosed)?;
                Ok(())
            }
            result = self.bus.wait_proxy_name_lost(&self.config.proxy_bus_name) => {
                result.map_err(ProxyError::ConnectionClosed)?;
                Err(ProxyError::NameLost(self.config.proxy_bus_name.clone()))
            }
            result = router.serve(self.bus.target.clone()) => Err(stream_ended(result)),
            result = router.serve(self.bus.source.clone()) => Err(stream_ended(result)),
            result = relay.run() => Err(stream_ended(result)),
            result = topology::watch_object_manager(
                &self.state,
                &self.bus.source,
                &self.bus.target,
                &self.bus.source_owner,
                &self.config.source_bus_name,
            ) => Err(stream_ended(result)),
        }
    }

    /// Drain every registration, subscription and watch before the
    /// connections drop.
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        for watch in state.agents.drain() {
            watch.abort();
        }
        state.topology.clear();
        log::debug!("Drained topology and agent registry");
    }
}

fn stream_ended(result: zbus::Result<()>) -> ProxyError {
    ProxyError::ConnectionClosed(match result {
        Ok(()) => zbus::Error::Failure("message stream ended".to_string()),
        Err(err) => err,
    })
}
