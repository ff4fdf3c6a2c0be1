use std::time::Duration;

/// Interfaces the D-Bus library plane answers for every exported object.
/// These are forwarded verbatim instead of being entered into the proxy's
/// dispatch tables.
pub const STANDARD_INTERFACES: &[&str] = &[
    "org.freedesktop.DBus.Introspectable",
    "org.freedesktop.DBus.Peer",
    "org.freedesktop.DBus.Properties",
];

pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";

pub const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";
pub const INTERFACES_ADDED: &str = "InterfacesAdded";
pub const INTERFACES_REMOVED: &str = "InterfacesRemoved";

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERROR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// Bound on each Introspect round-trip during discovery.
pub const INTROSPECT_TIMEOUT: Duration = Duration::from_secs(10);
