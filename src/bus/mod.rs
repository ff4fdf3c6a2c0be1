use futures::StreamExt;
use thiserror::Error;
use zbus::fdo::DBusProxy;
use zbus::names::BusName;
use zbus::Connection;

use crate::cli::BusKind;
use crate::config::ProxyConfig;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("failed to connect to the {0:?} bus: {1}")]
    Connect(BusKind, zbus::Error),
    #[error("source service `{0}` is not on the bus")]
    SourceNotRunning(String),
    #[error("failed to resolve the source service owner: {0}")]
    ResolveOwner(#[from] zbus::fdo::Error),
    #[error("failed to own `{0}` on the target bus: {1}")]
    NameOwnership(String, zbus::Error),
    #[error("bus call failed: {0}")]
    Bus(#[from] zbus::Error),
}

/// The two connections the proxy lives on. Opened once at startup and
/// dropped in reverse order during shutdown.
pub struct BusLink {
    pub source: Connection,
    pub target: Connection,
    /// Unique name the source service owned at startup
    pub source_owner: String,
}

impl BusLink {
    /// Open both connections and resolve the source service's owner. The
    /// owner resolution doubles as the liveness check: a source that is not
    /// on the bus is a setup failure.
    pub async fn connect(config: &ProxyConfig) -> Result<Self, BusError> {
        let source = open(config.source_bus_type).await?;
        let target = open(config.target_bus_type).await?;

        let dbus = DBusProxy::new(&source).await?;
        let name = BusName::try_from(config.source_bus_name.as_str())
            .map_err(|err| BusError::Bus(err.into()))?;
        let source_owner = match dbus.get_name_owner(name).await {
            Ok(owner) => owner.to_string(),
            Err(zbus::fdo::Error::NameHasNoOwner(_)) => {
                return Err(BusError::SourceNotRunning(config.source_bus_name.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        log::debug!(
            "Source service `{}` is owned by {source_owner}",
            config.source_bus_name
        );

        Ok(Self {
            source,
            target,
            source_owner,
        })
    }

    /// Claim the proxy's well-known name on the target bus.
    pub async fn own_proxy_name(&self, name: &str) -> Result<(), BusError> {
        self.target
            .request_name(name.to_string())
            .await
            .map_err(|err| BusError::NameOwnership(name.to_string(), err))
    }

    /// Resolves when the source service drops or hands off its name. Either
    /// way the proxy is done; a restarted service gets a fresh proxy.
    pub async fn wait_source_vanished(&self, name: &str) -> zbus::Result<()> {
        let dbus = DBusProxy::new(&self.source).await?;
        let mut stream = dbus
            .receive_name_owner_changed_with_args(&[(0, name)])
            .await?;
        while let Some(event) = stream.next().await {
            let Ok(args) = event.args() else {
                continue;
            };
            match args.new_owner.as_ref() {
                None => {
                    log::info!("Source service `{name}` left the bus");
                    return Ok(());
                }
                Some(owner) if owner.as_str() != self.source_owner => {
                    log::info!("Source service `{name}` changed owner to {owner}");
                    return Ok(());
                }
                Some(_) => continue,
            }
        }
        Ok(())
    }

    /// Resolves if the proxy loses its well-known name on the target bus.
    pub async fn wait_proxy_name_lost(&self, name: &str) -> zbus::Result<()> {
        let dbus = DBusProxy::new(&self.target).await?;
        let mut stream = dbus.receive_name_lost().await?;
        while let Some(event) = stream.next().await {
            let Ok(args) = event.args() else {
                continue;
            };
            if args.name.as_str() == name {
                return Ok(());
            }
        }
        Ok(())
    }
}

async fn open(kind: BusKind) -> Result<Connection, BusError> {
    let result = match kind {
        BusKind::System => Connection::system().await,
        BusKind::Session => Connection::session().await,
    };
    result.map_err(|err| BusError::Connect(kind, err))
}
