use std::collections::HashMap;

use futures::future::{BoxFuture, FutureExt};
use futures::TryStreamExt;
use zbus::fdo::ObjectManagerProxy;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::{Connection, MatchRule, MessageStream};
use zbus_xml::Node;

use crate::constants::{INTERFACES_ADDED, INTERFACES_REMOVED, OBJECT_MANAGER_IFACE};
use crate::introspection::{self, IntrospectError};
use crate::proxy::SharedState;
use crate::relay;

/// Target-side registration of one interface at one proxied path. The
/// presence of an entry is what makes the router dispatch calls for the
/// pair; removing the entry unregisters it.
#[derive(Debug, Clone)]
pub struct InterfaceRegistration {
    pub interface: String,
    pub methods: Vec<String>,
}

impl InterfaceRegistration {
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// One object on the source carrying at least one non-standard interface.
pub struct ProxiedObject {
    pub path: OwnedObjectPath,
    /// Parsed introspection data of the path, refreshed on `InterfacesAdded`
    pub node: Node<'static>,
    registrations: HashMap<String, InterfaceRegistration>,
}

impl ProxiedObject {
    pub fn registration(&self, interface: &str) -> Option<&InterfaceRegistration> {
        self.registrations.get(interface)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.registrations.keys().map(String::as_str)
    }
}

/// The set of proxied objects, keyed by object path.
#[derive(Default)]
pub struct Topology {
    objects: HashMap<String, ProxiedObject>,
}

impl Topology {
    pub fn is_proxied(&self, path: &str) -> bool {
        self.objects.contains_key(path)
    }

    pub fn object(&self, path: &str) -> Option<&ProxiedObject> {
        self.objects.get(path)
    }

    pub fn registration(&self, path: &str, interface: &str) -> Option<&InterfaceRegistration> {
        self.objects.get(path)?.registration(interface)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Filter `candidates` down to the interfaces not yet registered at `path`.
    pub fn missing_interfaces(&self, path: &str, candidates: &[String]) -> Vec<String> {
        candidates
            .iter()
            .filter(|iface| {
                self.objects
                    .get(path)
                    .map(|object| object.registration(iface).is_none())
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Register `interfaces` at `path`, creating the proxied object if this
    /// is the first registration there. The node replaces any previously
    /// stored introspection data for the path.
    pub fn register_interfaces(
        &mut self,
        path: &OwnedObjectPath,
        node: Node<'static>,
        interfaces: Vec<InterfaceRegistration>,
    ) {
        if interfaces.is_empty() {
            return;
        }
        if let Some(object) = self.objects.get_mut(path.as_str()) {
            object.node = node;
            for registration in interfaces {
                log::debug!(
                    "Registered interface `{}` on `{path}`",
                    registration.interface
                );
                object
                    .registrations
                    .insert(registration.interface.clone(), registration);
            }
            return;
        }

        let mut registrations = HashMap::new();
        for registration in interfaces {
            log::debug!(
                "Registered interface `{}` on `{path}`",
                registration.interface
            );
            registrations.insert(registration.interface.clone(), registration);
        }
        self.objects.insert(
            path.to_string(),
            ProxiedObject {
                path: path.clone(),
                node,
                registrations,
            },
        );
    }

    /// Unregister `interfaces` at `path`. Returns true when the object's
    /// registration set became empty and the object was destroyed.
    pub fn unregister_interfaces(&mut self, path: &str, interfaces: &[String]) -> bool {
        let Some(object) = self.objects.get_mut(path) else {
            return false;
        };
        for interface in interfaces {
            if object.registrations.remove(interface).is_some() {
                log::debug!("Unregistered interface `{interface}` on `{path}`");
            }
        }
        if object.registrations.is_empty() {
            self.objects.remove(path);
            log::debug!("Removed proxied object `{path}`");
            return true;
        }
        false
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

/// Walk the source object tree from `root` and register every reachable
/// non-standard interface.
///
/// Failures below the root are tolerated so one broken subtree cannot take
/// the whole proxy down; a failure at the root itself is fatal, except for
/// `UnknownObject` which simply leaves the topology empty.
pub async fn discover(
    state: &SharedState,
    conn: &Connection,
    service: &str,
    root: &OwnedObjectPath,
) -> Result<(), IntrospectError> {
    let node = match introspection::introspect(conn, service, root).await {
        Ok(node) => node,
        Err(IntrospectError::UnknownObject) => {
            log::warn!("Source service does not expose `{root}`, starting empty");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    visit(state, conn, service, root.clone(), node).await;
    Ok(())
}

fn visit<'a>(
    state: &'a SharedState,
    conn: &'a Connection,
    service: &'a str,
    path: OwnedObjectPath,
    node: Node<'static>,
) -> BoxFuture<'a, ()> {
    async move {
        let manager_assisted = introspection::declares_object_manager(&node);
        let children = introspection::child_names(&node);
        register_node(state, &path, node).await;

        // A node exporting ObjectManager enumerates its subtree for us;
        // ordinary child recursion stops here.
        if manager_assisted {
            match managed_paths(conn, service, &path).await {
                Ok(managed) => {
                    for child in managed {
                        match introspection::introspect(conn, service, &child).await {
                            Ok(child_node) => register_node(state, &child, child_node).await,
                            Err(err) => {
                                log::warn!("Skipping managed object `{child}`: {err}");
                            }
                        }
                    }
                }
                Err(err) => log::warn!("GetManagedObjects failed on `{path}`: {err}"),
            }
            return;
        }

        for name in children {
            let child = match introspection::child_path(&path, &name) {
                Ok(child) => child,
                Err(err) => {
                    log::warn!("Skipping child `{name}` of `{path}`: {err}");
                    continue;
                }
            };
            match introspection::introspect(conn, service, &child).await {
                Ok(child_node) => visit(state, conn, service, child, child_node).await,
                Err(IntrospectError::UnknownObject) => {
                    log::debug!("Skipping unknown object `{child}`");
                }
                Err(err) => log::warn!("Skipping subtree at `{child}`: {err}"),
            }
        }
    }
    .boxed()
}

async fn managed_paths(
    conn: &Connection,
    service: &str,
    path: &OwnedObjectPath,
) -> zbus::Result<Vec<OwnedObjectPath>> {
    let proxy = ObjectManagerProxy::builder(conn)
        .destination(service.to_string())?
        .path(path.clone())?
        .build()
        .await?;
    let managed = proxy.get_managed_objects().await?;
    Ok(managed.into_keys().collect())
}

/// Register every non-standard interface `node` declares at `path`.
async fn register_node(state: &SharedState, path: &OwnedObjectPath, node: Node<'static>) {
    let interfaces = introspection::proxied_interfaces(&node);
    if interfaces.is_empty() {
        return;
    }
    let registrations: Vec<InterfaceRegistration> = interfaces
        .into_iter()
        .map(|interface| {
            let methods =
                introspection::interface_methods(&node, &interface).unwrap_or_default();
            InterfaceRegistration { interface, methods }
        })
        .collect();

    log::info!(
        "Proxying `{path}` with interfaces: {:?}",
        registrations
            .iter()
            .map(|r| r.interface.as_str())
            .collect::<Vec<_>>()
    );
    let mut state = state.write().await;
    state.topology.register_interfaces(path, node, registrations);
}

/// Maintain the topology from the source's ObjectManager signals and re-emit
/// them on the target once the table reflects the change.
pub async fn watch_object_manager(
    state: &SharedState,
    source: &Connection,
    target: &Connection,
    source_owner: &str,
    service: &str,
) -> zbus::Result<()> {
    let rule = MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .sender(source_owner)?
        .interface(OBJECT_MANAGER_IFACE)?
        .build();
    let mut stream = MessageStream::for_match_rule(rule, source, Some(64)).await?;

    while let Some(msg) = stream.try_next().await? {
        let header = msg.header();
        let Some(member) = header.member() else {
            continue;
        };
        match member.as_str() {
            INTERFACES_ADDED => {
                let (path, interfaces): (
                    OwnedObjectPath,
                    HashMap<String, HashMap<String, OwnedValue>>,
                ) = match msg.body().deserialize() {
                    Ok(args) => args,
                    Err(err) => {
                        log::warn!("Malformed InterfacesAdded signal: {err}");
                        continue;
                    }
                };
                let interfaces: Vec<String> = interfaces.into_keys().collect();
                handle_interfaces_added(state, source, service, &path, &interfaces).await;
            }
            INTERFACES_REMOVED => {
                let (path, interfaces): (OwnedObjectPath, Vec<String>) =
                    match msg.body().deserialize() {
                        Ok(args) => args,
                        Err(err) => {
                            log::warn!("Malformed InterfacesRemoved signal: {err}");
                            continue;
                        }
                    };
                handle_interfaces_removed(state, &path, &interfaces).await;
            }
            _ => continue,
        }
        if let Err(err) = relay::forward_signal(target, &msg).await {
            log::warn!("Failed to re-emit {member} signal: {err}");
        }
    }
    Ok(())
}

/// Incremental registration for interfaces that appeared on `path`.
pub async fn handle_interfaces_added(
    state: &SharedState,
    conn: &Connection,
    service: &str,
    path: &OwnedObjectPath,
    interfaces: &[String],
) {
    let missing = {
        let state = state.read().await;
        let candidates: Vec<String> = interfaces
            .iter()
            .filter(|iface| !introspection::is_standard_interface(iface))
            .cloned()
            .collect();
        state.topology.missing_interfaces(path.as_str(), &candidates)
    };
    if missing.is_empty() {
        return;
    }

    let node = match introspection::introspect(conn, service, path).await {
        Ok(node) => node,
        Err(err) => {
            log::warn!("Cannot introspect `{path}` after InterfacesAdded: {err}");
            return;
        }
    };

    let registrations: Vec<InterfaceRegistration> = missing
        .into_iter()
        .filter_map(|interface| {
            let methods = introspection::interface_methods(&node, &interface)?;
            Some(InterfaceRegistration { interface, methods })
        })
        .collect();
    if registrations.is_empty() {
        return;
    }

    log::info!(
        "Interfaces appeared on `{path}`: {:?}",
        registrations
            .iter()
            .map(|r| r.interface.as_str())
            .collect::<Vec<_>>()
    );
    let mut state = state.write().await;
    state.topology.register_interfaces(path, node, registrations);
}

/// Incremental teardown for interfaces that disappeared from `path`.
pub async fn handle_interfaces_removed(
    state: &SharedState,
    path: &OwnedObjectPath,
    interfaces: &[String],
) {
    let mut state = state.write().await;
    if state
        .topology
        .unregister_interfaces(path.as_str(), interfaces)
    {
        log::info!("Proxied object `{path}` went away");
    }
}
