#[cfg(test)]
pub mod agent_test;

use thiserror::Error;
use tokio::task::JoinHandle;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("register call carries no object path argument")]
    MissingPathArgument,
    #[error("cannot form a valid surrogate path from `{0}`")]
    InvalidPath(String),
}

/// One entry of the static callback ruleset: which manager method hands a
/// client object to the service, and what the client-side agent looks like.
///
/// The table is loaded at startup and never mutates; registrations hold
/// plain references into it.
#[derive(Debug)]
pub struct AgentRule {
    /// Service this rule applies to
    pub source_bus_name: &'static str,
    /// Object the client calls to register its agent
    pub manager_path: &'static str,
    pub manager_interface: &'static str,
    pub register_method: &'static str,
    pub unregister_method: &'static str,
    /// Whether the register call carries the agent path as its first argument
    pub path_customizable: bool,
    /// Fixed agent path; ignored when `path_customizable` is set
    pub client_object_path: &'static str,
    /// Interface the service calls back on
    pub client_interface: &'static str,
    pub client_methods: &'static [&'static str],
}

static BUILTIN_RULES: &[AgentRule] = &[
    AgentRule {
        source_bus_name: "org.freedesktop.NetworkManager",
        manager_path: "/org/freedesktop/NetworkManager/AgentManager",
        manager_interface: "org.freedesktop.NetworkManager.AgentManager",
        register_method: "Register",
        unregister_method: "Unregister",
        path_customizable: false,
        client_object_path: "/org/freedesktop/NetworkManager/SecretAgent",
        client_interface: "org.freedesktop.NetworkManager.SecretAgent",
        client_methods: &[
            "GetSecrets",
            "CancelGetSecrets",
            "SaveSecrets",
            "DeleteSecrets",
        ],
    },
    AgentRule {
        source_bus_name: "org.bluez",
        manager_path: "/org/bluez",
        manager_interface: "org.bluez.AgentManager1",
        register_method: "RegisterAgent",
        unregister_method: "UnregisterAgent",
        path_customizable: true,
        client_object_path: "",
        client_interface: "org.bluez.Agent1",
        client_methods: &[
            "Release",
            "RequestPinCode",
            "DisplayPinCode",
            "RequestPasskey",
            "DisplayPasskey",
            "RequestConfirmation",
            "RequestAuthorization",
            "AuthorizeService",
            "Cancel",
        ],
    },
];

/// The callback rules shipped with the proxy.
pub fn builtin_rules() -> &'static [AgentRule] {
    BUILTIN_RULES
}

/// A live callback registration: one target-side client that handed an agent
/// object to the proxied service.
pub struct AgentRegistration {
    /// Unique bus name of the registering client on the target bus
    pub owner: String,
    /// The agent path as the client exported it
    pub client_object_path: OwnedObjectPath,
    /// The surrogate path the service calls back on
    pub unique_object_path: OwnedObjectPath,
    pub rule: &'static AgentRule,
    /// The primary holds the source-side surrogate; secondaries share it
    pub primary: bool,
    /// NameOwnerChanged watch for `owner`; aborted when the entry goes away
    pub name_watch: Option<JoinHandle<()>>,
    serial: u64,
}

/// How the router should answer a register call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First registration at this surrogate path: forward to the service so
    /// it learns an agent exists.
    Primary(OwnedObjectPath),
    /// The surrogate is already live under another owner: reply success
    /// without forwarding.
    Secondary(OwnedObjectPath),
    /// Same owner registered twice: reply success, nothing inserted.
    Duplicate,
}

/// How the router should answer an unregister call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnregisterOutcome {
    /// Last registration at the surrogate: forward so the service releases it.
    Forward(OwnedObjectPath),
    /// Other registrations still share the surrogate: reply success locally.
    Local,
    /// The caller never registered; forward unchanged and let the service
    /// produce its own answer.
    NotRegistered,
}

/// A service-side unregister the daemon must issue after an owner vanished.
#[derive(Debug)]
pub struct ServiceUnregister {
    pub rule: &'static AgentRule,
    pub unique_object_path: OwnedObjectPath,
}

/// Tracks every live agent callback and which client owns it.
pub struct AgentRegistry {
    rules: Vec<&'static AgentRule>,
    registrations: Vec<AgentRegistration>,
    promote_secondary: bool,
    next_serial: u64,
}

impl AgentRegistry {
    /// Registry over the builtin ruleset, narrowed to the proxied service.
    pub fn new(source_bus_name: &str, promote_secondary: bool) -> Self {
        let rules = builtin_rules()
            .iter()
            .filter(|rule| rule.source_bus_name == source_bus_name)
            .collect();
        Self::with_rules(rules, promote_secondary)
    }

    pub fn with_rules(rules: Vec<&'static AgentRule>, promote_secondary: bool) -> Self {
        Self {
            rules,
            registrations: Vec::new(),
            promote_secondary,
            next_serial: 0,
        }
    }

    /// Rule whose register method matches this incoming call, if any.
    pub fn match_register(
        &self,
        path: &str,
        interface: &str,
        method: &str,
    ) -> Option<&'static AgentRule> {
        self.rules
            .iter()
            .find(|rule| {
                rule.manager_path == path
                    && rule.manager_interface == interface
                    && rule.register_method == method
            })
            .copied()
    }

    /// Rule whose unregister method matches this incoming call, if any.
    pub fn match_unregister(
        &self,
        path: &str,
        interface: &str,
        method: &str,
    ) -> Option<&'static AgentRule> {
        self.rules
            .iter()
            .find(|rule| {
                rule.manager_path == path
                    && rule.manager_interface == interface
                    && rule.unregister_method == method
            })
            .copied()
    }

    /// The agent path this registration is about: the first call argument
    /// for customizable rules, the fixed rule path otherwise.
    pub fn client_path_for(
        rule: &'static AgentRule,
        argument: Option<OwnedObjectPath>,
    ) -> Result<OwnedObjectPath, AgentError> {
        if rule.path_customizable {
            return argument.ok_or(AgentError::MissingPathArgument);
        }
        ObjectPath::try_from(rule.client_object_path)
            .map(Into::into)
            .map_err(|_| AgentError::InvalidPath(rule.client_object_path.to_string()))
    }

    /// Insert a registration for `owner`, deciding whether the call must be
    /// forwarded to the service.
    pub fn register(
        &mut self,
        rule: &'static AgentRule,
        owner: &str,
        client_object_path: OwnedObjectPath,
    ) -> Result<RegisterOutcome, AgentError> {
        let unique_object_path = unique_object_path(rule, owner, &client_object_path)?;

        let mut exists = false;
        for entry in &self.registrations {
            if entry.unique_object_path == unique_object_path {
                if entry.owner == owner {
                    log::debug!("Duplicate agent registration from {owner}, answering locally");
                    return Ok(RegisterOutcome::Duplicate);
                }
                exists = true;
            }
        }

        let primary = !exists;
        self.registrations.push(AgentRegistration {
            owner: owner.to_string(),
            client_object_path,
            unique_object_path: unique_object_path.clone(),
            rule,
            primary,
            name_watch: None,
            serial: self.next_serial,
        });
        self.next_serial += 1;

        if primary {
            log::info!("Agent registered at `{unique_object_path}` for {owner} (primary)");
            Ok(RegisterOutcome::Primary(unique_object_path))
        } else {
            log::info!("Agent registered at `{unique_object_path}` for {owner} (secondary)");
            Ok(RegisterOutcome::Secondary(unique_object_path))
        }
    }

    /// Remove the caller's registration for `rule`. Returns the outcome and
    /// the entry's name watch for the caller to abort.
    pub fn unregister(
        &mut self,
        rule: &'static AgentRule,
        owner: &str,
        client_object_path: Option<&OwnedObjectPath>,
    ) -> (UnregisterOutcome, Option<JoinHandle<()>>) {
        let position = self.registrations.iter().position(|entry| {
            entry.owner == owner
                && std::ptr::eq(entry.rule, rule)
                && client_object_path
                    .map(|path| &entry.client_object_path == path)
                    .unwrap_or(true)
        });
        let Some(position) = position else {
            log::debug!("Unregister from {owner} without a matching registration");
            return (UnregisterOutcome::NotRegistered, None);
        };

        let removed = self.registrations.swap_remove(position);
        let survivors = self.promote_survivor(&removed);
        let watch = removed.name_watch;

        if survivors {
            log::info!(
                "Agent unregistered at `{}` for {owner}, surrogate stays live",
                removed.unique_object_path
            );
            (UnregisterOutcome::Local, watch)
        } else {
            log::info!(
                "Agent unregistered at `{}` for {owner}",
                removed.unique_object_path
            );
            (
                UnregisterOutcome::Forward(removed.unique_object_path),
                watch,
            )
        }
    }

    /// Drop every registration owned by a vanished client. Returns the
    /// service-side unregisters the daemon must issue and the name watches
    /// to abort.
    pub fn remove_owner(&mut self, owner: &str) -> (Vec<ServiceUnregister>, Vec<JoinHandle<()>>) {
        let mut unregisters = Vec::new();
        let mut watches = Vec::new();

        let mut index = 0;
        while index < self.registrations.len() {
            if self.registrations[index].owner != owner {
                index += 1;
                continue;
            }
            let removed = self.registrations.swap_remove(index);
            log::info!(
                "Owner {owner} vanished, dropping agent at `{}`",
                removed.unique_object_path
            );
            let survivors = removed.primary.then(|| self.promote_survivor(&removed));
            if let Some(watch) = removed.name_watch {
                watches.push(watch);
            }
            if removed.primary {
                if !survivors.unwrap_or(false) || !self.promote_secondary {
                    unregisters.push(ServiceUnregister {
                        rule: removed.rule,
                        unique_object_path: removed.unique_object_path,
                    });
                }
            }
        }

        (unregisters, watches)
    }

    /// Owner and client path of the primary registration serving `path`,
    /// checked against the rule's callback interface and method list.
    pub fn lookup_owner(
        &self,
        path: &str,
        interface: &str,
        method: &str,
    ) -> Option<(String, OwnedObjectPath)> {
        let entry = self
            .registrations
            .iter()
            .find(|entry| entry.primary && entry.unique_object_path.as_str() == path)?;
        if entry.rule.client_interface != interface || !entry.rule.client_methods.contains(&method)
        {
            return None;
        }
        Some((entry.owner.clone(), entry.client_object_path.clone()))
    }

    /// Attach the NameOwnerChanged watch to a freshly inserted entry.
    pub fn attach_watch(
        &mut self,
        owner: &str,
        unique_object_path: &OwnedObjectPath,
        watch: JoinHandle<()>,
    ) {
        let entry = self.registrations.iter_mut().find(|entry| {
            entry.owner == owner
                && &entry.unique_object_path == unique_object_path
                && entry.name_watch.is_none()
        });
        match entry {
            Some(entry) => entry.name_watch = Some(watch),
            // The entry is already gone; the watch has nothing to guard.
            None => watch.abort(),
        }
    }

    /// Roll back a registration whose forwarded register call failed.
    pub fn remove_registration(
        &mut self,
        owner: &str,
        unique_object_path: &OwnedObjectPath,
    ) -> Option<JoinHandle<()>> {
        let position = self.registrations.iter().position(|entry| {
            entry.owner == owner && &entry.unique_object_path == unique_object_path
        })?;
        let removed = self.registrations.swap_remove(position);
        self.promote_survivor(&removed);
        removed.name_watch
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn is_primary(&self, owner: &str, unique_object_path: &str) -> bool {
        self.registrations.iter().any(|entry| {
            entry.primary
                && entry.owner == owner
                && entry.unique_object_path.as_str() == unique_object_path
        })
    }

    /// Drop everything; returns the watches for the caller to abort.
    pub fn drain(&mut self) -> Vec<JoinHandle<()>> {
        self.registrations
            .drain(..)
            .filter_map(|entry| entry.name_watch)
            .collect()
    }

    /// After `removed` left the table, hand the primary role to the oldest
    /// survivor at the same surrogate path. Returns whether any survivor
    /// exists.
    fn promote_survivor(&mut self, removed: &AgentRegistration) -> bool {
        let mut oldest: Option<usize> = None;
        for (index, entry) in self.registrations.iter().enumerate() {
            if entry.unique_object_path != removed.unique_object_path {
                continue;
            }
            match oldest {
                Some(current) if self.registrations[current].serial <= entry.serial => {}
                _ => oldest = Some(index),
            }
        }
        let Some(oldest) = oldest else {
            return false;
        };
        let oldest = &mut self.registrations[oldest];
        if removed.primary && !oldest.primary {
            log::info!(
                "Promoting {} to primary agent at `{}`",
                oldest.owner,
                oldest.unique_object_path
            );
            oldest.primary = true;
        }
        true
    }
}

/// Replace the characters a bus name carries that are not valid in an
/// object path.
pub fn sanitize_bus_name(name: &str) -> String {
    name.replace(['.', ':'], "_")
}

/// The path the surrogate is served under on the source bus.
fn unique_object_path(
    rule: &AgentRule,
    owner: &str,
    client_object_path: &OwnedObjectPath,
) -> Result<OwnedObjectPath, AgentError> {
    if !rule.path_customizable {
        return Ok(client_object_path.clone());
    }
    let joined = format!("{}/{}", client_object_path, sanitize_bus_name(owner));
    ObjectPath::try_from(joined.clone())
        .map(Into::into)
        .map_err(|_| AgentError::InvalidPath(joined))
}
