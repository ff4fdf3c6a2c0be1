use tokio::time::timeout;
use zbus::fdo;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};
use zbus::Connection;
use zbus_xml::Node;

use thiserror::Error;

use crate::constants::{INTROSPECT_TIMEOUT, OBJECT_MANAGER_IFACE, STANDARD_INTERFACES};

#[derive(Error, Debug)]
pub enum IntrospectError {
    #[error("object is unknown to the service")]
    UnknownObject,
    #[error("introspection timed out")]
    Timeout,
    #[error("introspection call failed: {0}")]
    Call(#[from] fdo::Error),
    #[error("introspection proxy setup failed: {0}")]
    Bus(#[from] zbus::Error),
    #[error("introspection XML parse failed: {0}")]
    Parse(#[from] zbus_xml::Error),
}

/// Fetch and parse the introspection data of `path` on `destination`.
///
/// Each round-trip is bounded by [INTROSPECT_TIMEOUT] so a wedged service
/// cannot stall discovery forever.
pub async fn introspect(
    conn: &Connection,
    destination: &str,
    path: &OwnedObjectPath,
) -> Result<Node<'static>, IntrospectError> {
    let proxy = fdo::IntrospectableProxy::builder(conn)
        .destination(destination.to_string())?
        .path(path.clone())?
        .build()
        .await?;

    let xml = match timeout(INTROSPECT_TIMEOUT, proxy.introspect()).await {
        Ok(Ok(xml)) => xml,
        Ok(Err(fdo::Error::UnknownObject(_))) => return Err(IntrospectError::UnknownObject),
        Ok(Err(err)) => return Err(IntrospectError::Call(err)),
        Err(_) => return Err(IntrospectError::Timeout),
    };

    Ok(Node::from_reader(xml.as_bytes())?)
}

/// True for the interfaces the library plane covers on every object.
pub fn is_standard_interface(name: &str) -> bool {
    STANDARD_INTERFACES.contains(&name)
}

/// Names of the interfaces on this node that the proxy should serve.
pub fn proxied_interfaces(node: &Node) -> Vec<String> {
    node.interfaces()
        .iter()
        .map(|iface| iface.name().to_string())
        .filter(|name| !is_standard_interface(name))
        .collect()
}

/// Method names declared by `interface` on this node, if present.
pub fn interface_methods(node: &Node, interface: &str) -> Option<Vec<String>> {
    node.interfaces()
        .iter()
        .find(|iface| iface.name() == interface)
        .map(|iface| {
            iface
                .methods()
                .iter()
                .map(|method| method.name().to_string())
                .collect()
        })
}

/// Whether the node exports `org.freedesktop.DBus.ObjectManager`, which
/// switches discovery over to manager-assisted enumeration.
pub fn declares_object_manager(node: &Node) -> bool {
    node.interfaces()
        .iter()
        .any(|iface| iface.name() == OBJECT_MANAGER_IFACE)
}

/// Child node names declared for recursion during the introspection walk.
pub fn child_names(node: &Node) -> Vec<String> {
    node.nodes()
        .iter()
        .filter_map(|child| child.name().map(|name| name.to_string()))
        .collect()
}

/// Join a child node name onto its parent path.
pub fn child_path(
    parent: &OwnedObjectPath,
    name: &str,
) -> Result<OwnedObjectPath, zbus::zvariant::Error> {
    let joined = if parent.as_str() == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    };
    Ok(ObjectPath::try_from(joined)?.into())
}
