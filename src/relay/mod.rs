use futures::TryStreamExt;
use zbus::message::{self, Message};
use zbus::zvariant::OwnedObjectPath;
use zbus::{Connection, MatchRule, MessageStream};

use crate::constants::{DBUS_PATH, OBJECT_MANAGER_IFACE};
use crate::proxy::SharedState;
use crate::router::build_with_copied_body;

/// Catch-all signal subscription on the source: every signal the proxied
/// service emits on a proxied path (or below the configured root) is
/// re-emitted on the target as a broadcast.
pub struct SignalRelay {
    state: SharedState,
    source: Connection,
    target: Connection,
    /// Resolved unique name of the source service, the sender to match
    source_owner: String,
    source_root: OwnedObjectPath,
}

impl SignalRelay {
    pub fn new(
        state: SharedState,
        source: Connection,
        target: Connection,
        source_owner: String,
        source_root: OwnedObjectPath,
    ) -> Self {
        Self {
            state,
            source,
            target,
            source_owner,
            source_root,
        }
    }

    /// Subscribe and relay until the source connection goes away.
    ///
    /// Signals are re-emitted in delivery order; the handler awaits each
    /// send before taking the next message.
    pub async fn run(&self) -> zbus::Result<()> {
        let rule = MatchRule::builder()
            .msg_type(message::Type::Signal)
            .sender(self.source_owner.as_str())?
            .build();
        let mut stream = MessageStream::for_match_rule(rule, &self.source, Some(64)).await?;

        while let Some(msg) = stream.try_next().await? {
            if let Err(err) = self.relay(&msg).await {
                log::warn!("Failed to relay signal: {err}");
            }
        }
        Ok(())
    }

    async fn relay(&self, msg: &Message) -> zbus::Result<()> {
        let header = msg.header();
        let Some(path) = header.path().map(|p| p.to_string()) else {
            return Ok(());
        };
        let Some(interface) = header.interface().map(|i| i.to_string()) else {
            return Ok(());
        };
        let Some(member) = header.member().map(|m| m.to_string()) else {
            return Ok(());
        };

        // ObjectManager traffic has its own subscription that updates the
        // topology before re-emitting.
        if interface == OBJECT_MANAGER_IFACE {
            return Ok(());
        }

        if !self.should_relay(&path).await {
            log::debug!("Dropping signal {interface}.{member} from `{path}`");
            return Ok(());
        }

        log::debug!("Relaying signal {interface}.{member} from `{path}`");
        forward_signal(&self.target, msg).await
    }

    /// A signal is relayed when its path is proxied, sits under the
    /// configured source root, or belongs to the bus daemon itself.
    async fn should_relay(&self, path: &str) -> bool {
        if path == DBUS_PATH {
            return true;
        }
        let root = self.source_root.as_str();
        if path == root || root == "/" || path.starts_with(&format!("{root}/")) {
            return true;
        }
        let state = self.state.read().await;
        state.topology.is_proxied(path)
    }
}

/// Re-emit `msg` on `conn` with the same path, interface, member and body,
/// as a broadcast.
pub async fn forward_signal(conn: &Connection, msg: &Message) -> zbus::Result<()> {
    let header = msg.header();
    let (Some(path), Some(interface), Some(member)) =
        (header.path(), header.interface(), header.member())
    else {
        return Ok(());
    };
    let builder = Message::signal(path.as_str(), interface.as_str(), member.as_str())?;
    let signal = build_with_copied_body(builder, &msg.body())?;
    conn.send(&signal).await
}
