#[cfg(test)]
pub mod router_test;

use futures::{StreamExt, TryStreamExt};
use zbus::message::{self, Message};
use zbus::names::{InterfaceName, MemberName};
use zbus::zvariant::{OwnedObjectPath, Signature, Structure, StructureBuilder, Value};
use zbus::{fdo, Connection, MessageStream};

use crate::agent::{AgentRegistry, AgentRule, RegisterOutcome, ServiceUnregister, UnregisterOutcome};
use crate::constants::{
    ERROR_FAILED, ERROR_INVALID_ARGS, ERROR_UNKNOWN_INTERFACE, ERROR_UNKNOWN_METHOD,
    ERROR_UNKNOWN_OBJECT,
};
use crate::introspection;
use crate::proxy::SharedState;

/// Dispatches every incoming method call on either connection.
///
/// Calls arriving on the target connection are forwarded to the proxied
/// service; calls arriving on the source connection can only be the service
/// invoking a surrogate agent and are forwarded to the client that owns it.
#[derive(Clone)]
pub struct Router {
    state: SharedState,
    source: Connection,
    target: Connection,
    /// Well-known name of the proxied service, destination of all
    /// target-to-source forwards
    source_service: String,
}

impl Router {
    pub fn new(
        state: SharedState,
        source: Connection,
        target: Connection,
        source_service: String,
    ) -> Self {
        Self {
            state,
            source,
            target,
            source_service,
        }
    }

    /// Pump one connection's incoming method calls through the generic
    /// handler. Each call is served on its own task so a slow backend never
    /// stalls the stream.
    pub async fn serve(&self, conn: Connection) -> zbus::Result<()> {
        let mut stream = MessageStream::from(&conn);
        while let Some(msg) = stream.try_next().await? {
            if msg.header().message_type() != message::Type::MethodCall {
                continue;
            }
            let router = self.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                if let Err(err) = router.handle_method_call(&conn, &msg).await {
                    log::warn!("Failed to handle method call: {err}");
                }
            });
        }
        Ok(())
    }

    /// The generic method handler attached to both connections.
    pub async fn handle_method_call(&self, conn: &Connection, msg: &Message) -> zbus::Result<()> {
        if self.is_target(conn) {
            self.handle_target_call(msg).await
        } else {
            self.handle_source_call(msg).await
        }
    }

    fn is_target(&self, conn: &Connection) -> bool {
        conn.unique_name() == self.target.unique_name()
    }

    /// A client on the target bus called the proxy.
    async fn handle_target_call(&self, msg: &Message) -> zbus::Result<()> {
        let header = msg.header();
        let Some(path) = header.path().map(|p| p.to_string()) else {
            return self
                .reply_error(&self.target, msg, ERROR_INVALID_ARGS, "missing object path")
                .await;
        };
        let Some(member) = header.member().map(|m| m.to_string()) else {
            return self
                .reply_error(&self.target, msg, ERROR_INVALID_ARGS, "missing method name")
                .await;
        };
        let interface = header.interface().map(|i| i.to_string());
        let iface = interface.as_deref().unwrap_or_default();

        // The library plane: introspection, peer and property calls pass
        // through untouched so the target sees the source's own answers.
        if introspection::is_standard_interface(iface) {
            log::debug!("Forwarding {iface}.{member} on `{path}` to the source");
            return self
                .forward(&self.target, &self.source, &self.source_service, msg, None)
                .await;
        }

        let (register_rule, unregister_rule) = {
            let state = self.state.read().await;
            (
                state.agents.match_register(&path, iface, &member),
                state.agents.match_unregister(&path, iface, &member),
            )
        };
        if let Some(rule) = register_rule {
            return self.handle_register(msg, rule).await;
        }
        if let Some(rule) = unregister_rule {
            return self.handle_unregister(msg, rule).await;
        }

        enum Dispatch {
            Forward,
            UnknownObject,
            UnknownInterface,
            UnknownMethod,
        }

        let dispatch = {
            let state = self.state.read().await;
            match state.topology.object(&path) {
                None => Dispatch::UnknownObject,
                // Calls without an interface header are resolved by the
                // service itself.
                Some(_) if interface.is_none() => Dispatch::Forward,
                Some(object) => match object.registration(iface) {
                    None => Dispatch::UnknownInterface,
                    Some(reg) if !reg.has_method(&member) => Dispatch::UnknownMethod,
                    Some(_) => Dispatch::Forward,
                },
            }
        };

        match dispatch {
            Dispatch::Forward => {
                log::debug!("Forwarding {iface}.{member} on `{path}` to the source");
                self.forward(&self.target, &self.source, &self.source_service, msg, None)
                    .await
            }
            Dispatch::UnknownObject => {
                self.reply_error(
                    &self.target,
                    msg,
                    ERROR_UNKNOWN_OBJECT,
                    &format!("no such object `{path}`"),
                )
                .await
            }
            Dispatch::UnknownInterface => {
                self.reply_error(
                    &self.target,
                    msg,
                    ERROR_UNKNOWN_INTERFACE,
                    &format!("no such interface `{iface}` on `{path}`"),
                )
                .await
            }
            Dispatch::UnknownMethod => {
                self.reply_error(
                    &self.target,
                    msg,
                    ERROR_UNKNOWN_METHOD,
                    &format!("no such method `{iface}.{member}`"),
                )
                .await
            }
        }
    }

    /// The proxied service called one of the surrogate agent objects.
    async fn handle_source_call(&self, msg: &Message) -> zbus::Result<()> {
        let header = msg.header();
        let Some(path) = header.path().map(|p| p.to_string()) else {
            return self
                .reply_error(&self.source, msg, ERROR_INVALID_ARGS, "missing object path")
                .await;
        };
        let Some(member) = header.member().map(|m| m.to_string()) else {
            return self
                .reply_error(&self.source, msg, ERROR_INVALID_ARGS, "missing method name")
                .await;
        };
        let iface = header
            .interface()
            .map(|i| i.to_string())
            .unwrap_or_default();

        let lookup = {
            let state = self.state.read().await;
            state.agents.lookup_owner(&path, &iface, &member)
        };
        let Some((owner, client_path)) = lookup else {
            log::warn!("No agent found for {iface}.{member} at `{path}`");
            return self
                .reply_error(&self.source, msg, ERROR_FAILED, "no agent found")
                .await;
        };

        log::debug!("Forwarding agent callback {iface}.{member} to {owner}");
        match self
            .call_remote(&self.target, &owner, client_path.as_str(), msg, None)
            .await
        {
            Ok(reply) => self.send_reply(&self.source, msg, &reply).await,
            Err(err) => self.send_forward_error(&self.source, msg, err).await,
        }
    }

    /// A target-side client invoked a known agent register method.
    async fn handle_register(&self, msg: &Message, rule: &'static AgentRule) -> zbus::Result<()> {
        let header = msg.header();
        let Some(sender) = header.sender().map(|s| s.to_string()) else {
            return self
                .reply_error(&self.target, msg, ERROR_INVALID_ARGS, "missing sender")
                .await;
        };

        let client_path = match AgentRegistry::client_path_for(rule, first_path_argument(msg)) {
            Ok(path) => path,
            Err(err) => {
                return self
                    .reply_error(&self.target, msg, ERROR_INVALID_ARGS, &err.to_string())
                    .await;
            }
        };

        let outcome = {
            let mut state = self.state.write().await;
            state.agents.register(rule, &sender, client_path)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                return self
                    .reply_error(&self.target, msg, ERROR_FAILED, &err.to_string())
                    .await;
            }
        };

        match outcome {
            RegisterOutcome::Duplicate => self.reply_empty(&self.target, msg).await,
            RegisterOutcome::Secondary(unique_path) => {
                // The service already has the surrogate; answer locally.
                if let Err(err) = self.watch_owner(&sender, &unique_path).await {
                    log::warn!("Failed to watch owner {sender}: {err}");
                }
                self.reply_empty(&self.target, msg).await
            }
            RegisterOutcome::Primary(unique_path) => {
                if let Err(err) = self.watch_owner(&sender, &unique_path).await {
                    log::warn!("Failed to watch owner {sender}: {err}");
                }
                let rewrite = rule.path_customizable.then_some(&unique_path);
                match self
                    .call_remote(
                        &self.source,
                        &self.source_service,
                        rule.manager_path,
                        msg,
                        rewrite,
                    )
                    .await
                {
                    Ok(reply) => self.send_reply(&self.target, msg, &reply).await,
                    Err(err) => {
                        // The service rejected the agent; undo ours.
                        let watch = {
                            let mut state = self.state.write().await;
                            state.agents.remove_registration(&sender, &unique_path)
                        };
                        if let Some(watch) = watch {
                            watch.abort();
                        }
                        self.send_forward_error(&self.target, msg, err).await
                    }
                }
            }
        }
    }

    /// A target-side client invoked a known agent unregister method.
    async fn handle_unregister(&self, msg: &Message, rule: &'static AgentRule) -> zbus::Result<()> {
        let header = msg.header();
        let Some(sender) = header.sender().map(|s| s.to_string()) else {
            return self
                .reply_error(&self.target, msg, ERROR_INVALID_ARGS, "missing sender")
                .await;
        };
        let argument = first_path_argument(msg);

        let (outcome, watch) = {
            let mut state = self.state.write().await;
            state.agents.unregister(rule, &sender, argument.as_ref())
        };
        if let Some(watch) = watch {
            watch.abort();
        }

        match outcome {
            UnregisterOutcome::Local => self.reply_empty(&self.target, msg).await,
            UnregisterOutcome::Forward(unique_path) => {
                let rewrite = rule.path_customizable.then_some(&unique_path);
                self.forward_with_rewrite(msg, rewrite).await
            }
            UnregisterOutcome::NotRegistered => self.forward_with_rewrite(msg, None).await,
        }
    }

    async fn forward_with_rewrite(
        &self,
        msg: &Message,
        rewrite: Option<&OwnedObjectPath>,
    ) -> zbus::Result<()> {
        self.forward(&self.target, &self.source, &self.source_service, msg, rewrite)
            .await
    }

    /// Invoke the service's unregister method on behalf of a vanished owner.
    pub async fn issue_service_unregister(&self, unregister: &ServiceUnregister) -> zbus::Result<()> {
        let rule = unregister.rule;
        log::info!(
            "Unregistering vanished agent `{}` at the service",
            unregister.unique_object_path
        );
        if rule.path_customizable {
            self.source
                .call_method(
                    Some(self.source_service.as_str()),
                    rule.manager_path,
                    Some(rule.manager_interface),
                    rule.unregister_method,
                    &(unregister.unique_object_path.clone(),),
                )
                .await?;
        } else {
            self.source
                .call_method(
                    Some(self.source_service.as_str()),
                    rule.manager_path,
                    Some(rule.manager_interface),
                    rule.unregister_method,
                    &(),
                )
                .await?;
        }
        Ok(())
    }

    /// Subscribe to `NameOwnerChanged` for `owner` and attach the watch to
    /// its registry entry.
    async fn watch_owner(
        &self,
        owner: &str,
        unique_object_path: &OwnedObjectPath,
    ) -> zbus::Result<()> {
        let proxy = fdo::DBusProxy::new(&self.target).await?;
        let mut stream = proxy
            .receive_name_owner_changed_with_args(&[(0, owner)])
            .await?;

        let router = self.clone();
        let watched = owner.to_string();
        let handle = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let Ok(args) = event.args() else {
                    continue;
                };
                if args.old_owner.is_some() && args.new_owner.is_none() {
                    router.handle_owner_vanished(&watched).await;
                    break;
                }
                // Renames are out of scope; the entry stays put.
                log::debug!("Ignoring ownership change of {watched}");
            }
        });

        let mut state = self.state.write().await;
        state.agents.attach_watch(owner, unique_object_path, handle);
        Ok(())
    }

    /// `NameOwnerChanged` reported `owner` gone: drop its registrations and
    /// let the service clean up where required.
    async fn handle_owner_vanished(&self, owner: &str) {
        let (unregisters, watches) = {
            let mut state = self.state.write().await;
            state.agents.remove_owner(owner)
        };
        // The service is told first: one of the drained watches is the task
        // running this handler, and aborting it ends the turn.
        for unregister in &unregisters {
            if let Err(err) = self.issue_service_unregister(unregister).await {
                log::warn!(
                    "Service-side unregister for `{}` failed: {err}",
                    unregister.unique_object_path
                );
            }
        }
        for watch in watches {
            watch.abort();
        }
    }

    /// Forward `msg` to `destination` on `to`, then relay the reply or error
    /// back on `from`.
    async fn forward(
        &self,
        from: &Connection,
        to: &Connection,
        destination: &str,
        msg: &Message,
        rewrite: Option<&OwnedObjectPath>,
    ) -> zbus::Result<()> {
        let header = msg.header();
        let Some(path) = header.path().map(|p| p.to_string()) else {
            return self
                .reply_error(from, msg, ERROR_INVALID_ARGS, "missing object path")
                .await;
        };
        match self.call_remote(to, destination, &path, msg, rewrite).await {
            Ok(reply) => self.send_reply(from, msg, &reply).await,
            Err(err) => self.send_forward_error(from, msg, err).await,
        }
    }

    /// Issue the remote call for `msg` with the same interface, member and
    /// body, optionally rewriting the leading object path argument.
    async fn call_remote(
        &self,
        to: &Connection,
        destination: &str,
        path: &str,
        msg: &Message,
        rewrite: Option<&OwnedObjectPath>,
    ) -> zbus::Result<Message> {
        let header = msg.header();
        let interface: Option<InterfaceName<'_>> = header.interface().cloned();
        let member: MemberName<'_> = header
            .member()
            .cloned()
            .ok_or_else(|| zbus::Error::Failure("missing method name".to_string()))?;

        let body = msg.body();
        if body_is_empty(&body) {
            return to
                .call_method(Some(destination), path, interface, member, &())
                .await;
        }

        let args: Structure = body.deserialize()?;
        match rewrite {
            Some(unique_path) => {
                let args = rewrite_first_path_argument(args, unique_path)?;
                to.call_method(Some(destination), path, interface, member, &args)
                    .await
            }
            None => {
                to.call_method(Some(destination), path, interface, member, &args)
                    .await
            }
        }
    }

    /// Relay a remote reply to the original caller, body included.
    async fn send_reply(
        &self,
        conn: &Connection,
        call: &Message,
        reply: &Message,
    ) -> zbus::Result<()> {
        if !wants_reply(call) {
            return Ok(());
        }
        let header = call.header();
        let out = build_with_copied_body(Message::method_return(&header)?, &reply.body())?;
        conn.send(&out).await
    }

    /// Relay a failed forward, preserving the remote error name and body
    /// when there is one.
    async fn send_forward_error(
        &self,
        conn: &Connection,
        call: &Message,
        err: zbus::Error,
    ) -> zbus::Result<()> {
        if !wants_reply(call) {
            return Ok(());
        }
        match err {
            zbus::Error::MethodError(name, _, remote) => {
                let header = call.header();
                let name = name.to_string();
                let out = build_with_copied_body(
                    Message::error(&header, name.as_str())?,
                    &remote.body(),
                )?;
                conn.send(&out).await
            }
            err => {
                self.reply_error(conn, call, ERROR_FAILED, &err.to_string())
                    .await
            }
        }
    }

    /// Successful empty reply, used when an agent call is answered locally.
    async fn reply_empty(&self, conn: &Connection, call: &Message) -> zbus::Result<()> {
        if !wants_reply(call) {
            return Ok(());
        }
        let header = call.header();
        let reply = Message::method_return(&header)?.build(&())?;
        conn.send(&reply).await
    }

    async fn reply_error(
        &self,
        conn: &Connection,
        call: &Message,
        name: &str,
        text: &str,
    ) -> zbus::Result<()> {
        if !wants_reply(call) {
            return Ok(());
        }
        let header = call.header();
        let reply = Message::error(&header, name)?.build(&(text,))?;
        conn.send(&reply).await
    }
}

/// Whether the caller expects a reply at all.
fn wants_reply(call: &Message) -> bool {
    !call
        .primary_header()
        .flags()
        .contains(message::Flags::NoReplyExpected)
}

/// True when the message body carries no arguments.
pub fn body_is_empty(body: &message::Body) -> bool {
    matches!(body.signature(), Signature::Unit)
}

/// Finish a reply or signal builder by copying another message's body into
/// it, keeping the original signature.
pub fn build_with_copied_body(
    builder: message::Builder<'_>,
    body: &message::Body,
) -> zbus::Result<Message> {
    if body_is_empty(body) {
        builder.build(&())
    } else {
        let args: Structure = body.deserialize()?;
        builder.build(&args)
    }
}

/// The leading object path argument of a call, if it has one.
pub fn first_path_argument(msg: &Message) -> Option<OwnedObjectPath> {
    let body = msg.body();
    if body_is_empty(&body) {
        return None;
    }
    let args: Structure = body.deserialize().ok()?;
    match args.fields().first()? {
        Value::ObjectPath(path) => Some(path.clone().into()),
        _ => None,
    }
}

/// Replace the leading object path argument with the surrogate path before
/// handing a register or unregister call to the service.
pub fn rewrite_first_path_argument<'a>(
    args: Structure<'a>,
    unique_path: &OwnedObjectPath,
) -> zbus::Result<Structure<'a>> {
    let fields = args.into_fields();
    if fields.is_empty() {
        return Err(zbus::Error::Failure(
            "expected an object path argument".to_string(),
        ));
    }
    let mut builder = StructureBuilder::new()
        .append_field(Value::ObjectPath(unique_path.clone().into_inner()));
    for field in fields.into_iter().skip(1) {
        builder = builder.append_field(field);
    }
    Ok(builder.build()?)
}
