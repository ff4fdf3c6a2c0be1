use zbus::message::Message;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Structure, Value};

use crate::router::{
    body_is_empty, build_with_copied_body, first_path_argument, rewrite_first_path_argument,
};

fn surrogate() -> OwnedObjectPath {
    ObjectPath::try_from("/client/agent/_1_42").unwrap().into()
}

#[test]
fn detects_empty_bodies() {
    let empty = Message::method_call("/x/y", "Ping")
        .unwrap()
        .build(&())
        .unwrap();
    let full = Message::method_call("/x/y", "Hello")
        .unwrap()
        .build(&("world",))
        .unwrap();
    assert!(body_is_empty(&empty.body()));
    assert!(!body_is_empty(&full.body()));
}

#[test]
fn extracts_leading_path_argument() {
    let path = ObjectPath::try_from("/client/agent").unwrap();
    let msg = Message::method_call("/org/bluez", "RegisterAgent")
        .unwrap()
        .build(&(path, "keyboard-display"))
        .unwrap();
    let arg = first_path_argument(&msg).unwrap();
    assert_eq!(arg.as_str(), "/client/agent");
}

#[test]
fn ignores_non_path_leading_argument() {
    let msg = Message::method_call("/m", "Register")
        .unwrap()
        .build(&("identifier",))
        .unwrap();
    assert!(first_path_argument(&msg).is_none());

    let empty = Message::method_call("/m", "Register")
        .unwrap()
        .build(&())
        .unwrap();
    assert!(first_path_argument(&empty).is_none());
}

#[test]
fn rewrites_leading_path_argument() {
    let path = ObjectPath::try_from("/client/agent").unwrap();
    let msg = Message::method_call("/org/bluez", "RegisterAgent")
        .unwrap()
        .build(&(path, "keyboard-display"))
        .unwrap();

    let body = msg.body();
    let args: Structure = body.deserialize().unwrap();
    let rewritten = rewrite_first_path_argument(args, &surrogate()).unwrap();

    let forwarded = Message::method_call("/org/bluez", "RegisterAgent")
        .unwrap()
        .build(&rewritten)
        .unwrap();
    let (path, capability): (OwnedObjectPath, String) =
        forwarded.body().deserialize().unwrap();
    assert_eq!(path.as_str(), "/client/agent/_1_42");
    assert_eq!(capability, "keyboard-display");
}

#[test]
fn rewrite_replaces_the_first_field_positionally() {
    let msg = Message::method_call("/org/bluez", "RegisterAgent")
        .unwrap()
        .build(&("only-a-string",))
        .unwrap();
    let body = msg.body();
    let args: Structure = body.deserialize().unwrap();
    let rewritten = rewrite_first_path_argument(args, &surrogate()).unwrap();
    assert_eq!(rewritten.fields().len(), 1);
    assert!(matches!(
        rewritten.fields().first(),
        Some(Value::ObjectPath(_))
    ));
}

#[test]
fn copies_reply_bodies_verbatim() {
    let call = Message::method_call("/x/y", "Hello")
        .unwrap()
        .interface("com.example.I.Greeter")
        .unwrap()
        .build(&("world",))
        .unwrap();
    let remote_reply = Message::method_call("/x/y", "Placeholder")
        .unwrap()
        .build(&("hello world", 42u32))
        .unwrap();

    let header = call.header();
    let reply = build_with_copied_body(
        Message::method_return(&header).unwrap(),
        &remote_reply.body(),
    )
    .unwrap();

    let (text, count): (String, u32) = reply.body().deserialize().unwrap();
    assert_eq!(text, "hello world");
    assert_eq!(count, 42);
}

#[test]
fn copies_empty_reply_bodies() {
    let call = Message::method_call("/x/y", "Ping").unwrap().build(&()).unwrap();
    let remote_reply = Message::method_call("/x/y", "Placeholder")
        .unwrap()
        .build(&())
        .unwrap();

    let header = call.header();
    let reply = build_with_copied_body(
        Message::method_return(&header).unwrap(),
        &remote_reply.body(),
    )
    .unwrap();
    assert!(body_is_empty(&reply.body()));
}
