use busbridge::introspection;
use busbridge::topology::{InterfaceRegistration, Topology};
use zbus::zvariant::{ObjectPath, OwnedObjectPath};
use zbus_xml::Node;

const GREETER_XML: &str = r#"
    <node>
      <interface name="org.freedesktop.DBus.Introspectable">
        <method name="Introspect"><arg name="xml" type="s" direction="out"/></method>
      </interface>
      <interface name="org.freedesktop.DBus.Properties"/>
      <interface name="com.example.I.Greeter">
        <method name="Hello">
          <arg name="name" type="s" direction="in"/>
          <arg name="greeting" type="s" direction="out"/>
        </method>
      </interface>
      <interface name="com.example.I.Counter">
        <method name="Add"><arg name="n" type="i" direction="in"/></method>
      </interface>
    </node>
"#;

fn path(value: &str) -> OwnedObjectPath {
    ObjectPath::try_from(value).unwrap().into()
}

fn registrations_from_xml() -> Vec<InterfaceRegistration> {
    let node = Node::from_reader(GREETER_XML.as_bytes()).unwrap();
    introspection::proxied_interfaces(&node)
        .into_iter()
        .map(|interface| {
            let methods = introspection::interface_methods(&node, &interface).unwrap_or_default();
            InterfaceRegistration { interface, methods }
        })
        .collect()
}

/// Every non-standard interface gets exactly one registration; standard
/// interfaces never enter the table.
#[test]
fn registers_each_non_standard_interface_once() {
    let node = Node::from_reader(GREETER_XML.as_bytes()).unwrap();
    let mut topology = Topology::default();
    let object_path = path("/x/y");

    topology.register_interfaces(&object_path, node, registrations_from_xml());

    assert!(topology.is_proxied("/x/y"));
    assert_eq!(topology.object_count(), 1);
    assert!(topology.registration("/x/y", "com.example.I.Greeter").is_some());
    assert!(topology.registration("/x/y", "com.example.I.Counter").is_some());
    assert!(topology
        .registration("/x/y", "org.freedesktop.DBus.Properties")
        .is_none());

    let greeter = topology.registration("/x/y", "com.example.I.Greeter").unwrap();
    assert!(greeter.has_method("Hello"));
    assert!(!greeter.has_method("Goodbye"));
}

/// Removing interfaces one by one destroys the object with the last one.
#[test]
fn interfaces_removed_tears_the_object_down() {
    let node = Node::from_reader(GREETER_XML.as_bytes()).unwrap();
    let mut topology = Topology::default();
    let object_path = path("/x/y");
    topology.register_interfaces(&object_path, node, registrations_from_xml());

    let destroyed =
        topology.unregister_interfaces("/x/y", &["com.example.I.Greeter".to_string()]);
    assert!(!destroyed);
    assert!(topology.is_proxied("/x/y"));

    let destroyed =
        topology.unregister_interfaces("/x/y", &["com.example.I.Counter".to_string()]);
    assert!(destroyed);
    assert!(!topology.is_proxied("/x/y"));
    assert_eq!(topology.object_count(), 0);
}

/// InterfacesAdded updates only register what is actually missing.
#[test]
fn missing_interfaces_skips_registered_ones() {
    let node = Node::from_reader(GREETER_XML.as_bytes()).unwrap();
    let mut topology = Topology::default();
    let object_path = path("/x/y");
    topology.register_interfaces(&object_path, node, registrations_from_xml());

    let candidates = vec![
        "com.example.I.Greeter".to_string(),
        "com.example.I.New".to_string(),
    ];
    let missing = topology.missing_interfaces("/x/y", &candidates);
    assert_eq!(missing, vec!["com.example.I.New".to_string()]);

    // Everything is missing on an unknown path
    let missing = topology.missing_interfaces("/a", &candidates);
    assert_eq!(missing.len(), 2);
}
