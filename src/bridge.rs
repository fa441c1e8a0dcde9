use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::config::BridgeConfig;
use crate::correlator::{Correlator, InvokeOptions};
use crate::descriptor::{Command, CommandDescriptor};
use crate::error::{Error, ProtocolViolation, Result, SerializationError};
use crate::events::{
    Delivery, Event, EventChannel, EventEnvelope, EventSource, Unlisten, validate_event_name,
};
use crate::ids::{CallId, ListenerId};
use crate::ipc::protocol::{self, Envelope, EventMessage, HostMessage};
use crate::ipc::Transport;

/// Where an emitted event goes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EmitTarget {
    /// Listeners in this context only
    #[default]
    Local,
    /// Listeners in this context, and forwarded to the host as a broadcast
    Host,
    /// Forwarded to the host, scoped to the window with this label
    Window(String),
}

/// What happened to an incoming host message
#[derive(Debug)]
pub enum Handled {
    /// A pending call was resolved or rejected
    Settled(CallId),
    /// An event went through a delivery pass
    Delivered(Delivery),
    /// An event scoped to another window
    Ignored,
    /// The message broke the protocol and was dropped
    Violation(ProtocolViolation),
}

/// The script side of the bridge
///
/// Commands go out through [`invoke`](Self::invoke) and their replies come
/// back through [`handle_message`](Self::handle_message), which whatever
/// owns the host connection calls for every incoming message.
///
/// # Example
///
/// ```rust,ignore
/// use tether::{Bridge, CommandDescriptor, InvokeOptions};
/// use tether::ipc::unix;
///
/// let (transport, link) = unix::connect("/run/app/tether.sock").await?;
/// let bridge = Arc::new(Bridge::new(transport));
/// smol::spawn({
///     let bridge = Arc::clone(&bridge);
///     async move { link.run(&bridge).await }
/// })
/// .detach();
///
/// let ready = bridge.listen("ready", |event| println!("{}", event.payload))?;
/// let version = bridge
///     .invoke(CommandDescriptor::new("app_version"), InvokeOptions::default())
///     .await?;
/// ready.unlisten();
/// ```
pub struct Bridge<T: Transport> {
    transport: T,
    config: BridgeConfig,
    correlator: Correlator,
    events: Arc<EventChannel>,
}

impl<T: Transport> Bridge<T> {
    /// Create a bridge with default configuration
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, BridgeConfig::default())
    }

    pub fn with_config(transport: T, config: BridgeConfig) -> Self {
        Self {
            transport,
            config,
            correlator: Correlator::new(),
            events: Arc::new(EventChannel::new()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The listener registry behind this bridge
    pub fn events(&self) -> &Arc<EventChannel> {
        &self.events
    }

    /// Invoke a host command and wait for its reply
    ///
    /// Resolves with the host's success value, or fails with
    /// [`Error::Host`] carrying the host's error value. Waits forever if the
    /// host never answers; see [`invoke_with_timeout`](Self::invoke_with_timeout).
    pub async fn invoke(&self, descriptor: CommandDescriptor, options: InvokeOptions) -> Result<Value> {
        self.correlator
            .invoke(
                &self.transport,
                descriptor,
                options,
                self.config.max_frame_len(),
            )
            .await
    }

    /// Like [`invoke`](Self::invoke), but gives up after `timeout`.
    ///
    /// On expiry the call is deregistered and a late reply is treated as a
    /// protocol violation.
    pub async fn invoke_with_timeout(
        &self,
        descriptor: CommandDescriptor,
        options: InvokeOptions,
        timeout: Duration,
    ) -> Result<Value> {
        let pending = self.correlator.dispatch(
            &self.transport,
            descriptor,
            options,
            self.config.max_frame_len(),
        )?;
        let call_id = pending.call_id();

        futures_lite::future::or(pending.wait(), async move {
            async_io::Timer::after(timeout).await;
            tracing::debug!(call_id = %call_id, ?timeout, "call timed out");
            Err(Error::Timeout(call_id))
        })
        .await
    }

    /// Invoke a typed command and deserialize its result
    pub async fn call<C: Command>(&self, command: &C) -> Result<C::Output> {
        let value = self.invoke(command.descriptor()?, InvokeOptions::default()).await?;
        serde_json::from_value(value).map_err(|e| Error::Serialization(SerializationError::Json(e)))
    }

    /// Listen to `event` until the returned handle is used to unlisten
    pub fn listen<F>(&self, event: &str, handler: F) -> Result<Unlisten>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let id = self.events.listen(event, handler)?;
        Ok(self.events.disposer(id))
    }

    /// Listen to the next `event` only
    pub fn once<F>(&self, event: &str, handler: F) -> Result<Unlisten>
    where
        F: FnOnce(Event) + Send + 'static,
    {
        let id = self.events.once(event, handler)?;
        Ok(self.events.disposer(id))
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn unlisten(&self, id: ListenerId) {
        self.events.unlisten(id);
    }

    /// Emit `event` to the listeners in this context
    pub fn emit<P: Serialize + ?Sized>(&self, event: &str, payload: &P) -> Result<Delivery> {
        self.emit_to(EmitTarget::Local, event, payload)
    }

    /// Emit `event` to `target`
    ///
    /// Forwarding happens before local delivery, so a payload the host cannot
    /// receive fails without any listener having run.
    pub fn emit_to<P: Serialize + ?Sized>(
        &self,
        target: EmitTarget,
        event: &str,
        payload: &P,
    ) -> Result<Delivery> {
        validate_event_name(event)?;
        let payload = serde_json::to_value(payload).map_err(SerializationError::from)?;

        let deliver_locally = match &target {
            EmitTarget::Local => true,
            EmitTarget::Host => {
                self.forward(event, payload.clone(), None)?;
                true
            }
            EmitTarget::Window(label) => {
                validate_event_name(label)?;
                self.forward(event, payload.clone(), Some(label.clone()))?;
                self.config.label() == Some(label.as_str())
            }
        };

        if !deliver_locally {
            return Ok(Delivery::default());
        }
        Ok(self.events.deliver(EventEnvelope {
            event: event.to_string(),
            payload,
            window_label: None,
            source: EventSource::Local,
        }))
    }

    fn forward(&self, event: &str, payload: Value, window_label: Option<String>) -> Result<()> {
        let envelope = Envelope::Emit(EventMessage {
            event: event.to_string(),
            payload,
            window_label,
        });
        self.transport.send(&envelope, self.config.max_frame_len())?;
        tracing::debug!(event = %event, "forwarded event to host");
        Ok(())
    }

    /// Route one message from the host
    ///
    /// Protocol violations are logged and returned; they never affect other
    /// calls or listeners.
    pub fn handle_message(&self, message: HostMessage) -> Handled {
        match message {
            HostMessage::Callback { callback, payload } => {
                match self.correlator.settle(&callback, payload) {
                    Ok(call_id) => Handled::Settled(call_id),
                    Err(violation) => {
                        tracing::warn!(callback = %callback, error = %violation, "ignoring host reply");
                        Handled::Violation(violation)
                    }
                }
            }
            HostMessage::Event(message) => {
                if let Some(label) = &message.window_label {
                    if self.config.label() != Some(label.as_str()) {
                        tracing::trace!(event = %message.event, label = %label, "event scoped to another window");
                        return Handled::Ignored;
                    }
                }
                Handled::Delivered(self.events.deliver(EventEnvelope {
                    event: message.event,
                    payload: message.payload,
                    window_label: message.window_label,
                    source: EventSource::Host,
                }))
            }
        }
    }

    /// Decode a frame body from the host and route it
    pub fn handle_frame(&self, body: &[u8]) -> Result<Handled> {
        let message: HostMessage = protocol::decode_body(body).inspect_err(|e| {
            tracing::warn!(error = %e, "dropping undecodable host frame");
        })?;
        Ok(self.handle_message(message))
    }

    /// Start a host-side watch and listen for its notifications
    ///
    /// The listener is registered before `start` is sent so no notification
    /// is missed. If `start` fails the listener is removed again.
    pub async fn watch<F>(
        &self,
        start: CommandDescriptor,
        event: &str,
        handler: F,
        stop: CommandDescriptor,
    ) -> Result<Watch<'_, T>>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let id = self.events.listen(event, handler)?;
        let mut guard = ListenerGuard {
            events: &self.events,
            id: Some(id),
        };

        let value = self.invoke(start, InvokeOptions::default()).await?;
        guard.id = None;

        Ok(Watch {
            bridge: self,
            listener: id,
            stop,
            value,
        })
    }

    /// Fail every outstanding call with [`Error::Disconnected`]
    ///
    /// Called when the connection to the host is gone. Returns the number of
    /// calls rejected.
    pub fn close(&self) -> usize {
        self.correlator.reject_all()
    }

    /// Number of calls waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.correlator.pending_count()
    }
}

struct ListenerGuard<'a> {
    events: &'a EventChannel,
    id: Option<ListenerId>,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.events.unlisten(id);
        }
    }
}

/// A running host-side watch
pub struct Watch<'a, T: Transport> {
    bridge: &'a Bridge<T>,
    listener: ListenerId,
    stop: CommandDescriptor,
    value: Value,
}

impl<T: Transport> Watch<'_, T> {
    /// What the host answered to the start command
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    /// Stop listening and tell the host to stop the watch
    pub async fn stop(self) -> Result<Value> {
        self.bridge.unlisten(self.listener);
        self.bridge.invoke(self.stop, InvokeOptions::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::InvokeRequest;
    use crate::ipc::ChannelTransport;
    use serde::Deserialize;
    use serde_json::json;
    use smol::channel::Receiver;
    use std::sync::Mutex;

    async fn next_envelope(incoming: &Receiver<Vec<u8>>) -> Envelope {
        let frame = incoming.recv().await.unwrap();
        protocol::decode_body(&frame[4..]).unwrap()
    }

    async fn next_request(incoming: &Receiver<Vec<u8>>) -> InvokeRequest {
        match next_envelope(incoming).await {
            Envelope::Invoke(request) => request,
            other => panic!("expected invoke, got {other:?}"),
        }
    }

    fn bridge() -> (Arc<Bridge<ChannelTransport>>, Receiver<Vec<u8>>) {
        let (transport, incoming) = ChannelTransport::new();
        let config = BridgeConfig::builder().label("main").build().unwrap();
        (Arc::new(Bridge::with_config(transport, config)), incoming)
    }

    #[tokio::test]
    async fn test_echo_roundtrip_is_untransformed() {
        let (bridge, incoming) = bridge();

        let call = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move {
                let descriptor = CommandDescriptor::new("echo").arg("x", 1).unwrap();
                bridge.invoke(descriptor, InvokeOptions::default()).await
            }
        });

        let request = next_request(&incoming).await;
        assert_eq!(request.cmd, "echo");
        assert_eq!(request.payload["x"], json!(1));

        let reply = request.resolve(Value::Object(request.payload.clone()));
        assert!(matches!(bridge.handle_message(reply), Handled::Settled(_)));

        assert_eq!(call.await.unwrap().unwrap(), json!({"x": 1}));
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_replies_settle_in_host_order() {
        let (bridge, incoming) = bridge();

        let spawn_call = |name: &'static str| {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .invoke(CommandDescriptor::new(name), InvokeOptions::default())
                    .await
            })
        };
        let call_a = spawn_call("a");
        let call_b = spawn_call("b");

        let first = next_request(&incoming).await;
        let second = next_request(&incoming).await;
        let (request_a, request_b) = if first.cmd == "a" {
            (first, second)
        } else {
            (second, first)
        };
        assert_ne!(request_a.call_id, request_b.call_id);

        bridge.handle_message(request_b.resolve(json!(2)));
        assert_eq!(call_b.await.unwrap().unwrap(), json!(2));
        assert!(!call_a.is_finished());
        assert_eq!(bridge.pending_calls(), 1);

        bridge.handle_message(request_a.reject(json!("boom")));
        let err = call_a.await.unwrap().unwrap_err();
        assert_eq!(err.host_value(), Some(&json!("boom")));
    }

    #[tokio::test]
    async fn test_second_reply_is_a_violation() {
        let (bridge, incoming) = bridge();

        let call = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move {
                bridge
                    .invoke(CommandDescriptor::new("ping"), InvokeOptions::default())
                    .await
            }
        });
        let request = next_request(&incoming).await;

        assert!(matches!(
            bridge.handle_message(request.resolve(json!("pong"))),
            Handled::Settled(_)
        ));
        assert!(matches!(
            bridge.handle_message(request.reject(json!("again"))),
            Handled::Violation(ProtocolViolation::AlreadySettled(_))
        ));
        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));

        // Still usable afterwards
        let call = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move {
                bridge
                    .invoke(CommandDescriptor::new("ping"), InvokeOptions::default())
                    .await
            }
        });
        let request = next_request(&incoming).await;
        bridge.handle_message(request.resolve(json!("pong")));
        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_typed_call() {
        #[derive(Serialize)]
        struct Add {
            a: i64,
            b: i64,
        }

        #[derive(Deserialize, Debug, PartialEq)]
        struct Sum {
            total: i64,
        }

        impl Command for Add {
            const NAME: &'static str = "add";
            type Output = Sum;
        }

        let (bridge, incoming) = bridge();
        let call = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.call(&Add { a: 2, b: 3 }).await }
        });

        let request = next_request(&incoming).await;
        let total = request.payload["a"].as_i64().unwrap() + request.payload["b"].as_i64().unwrap();
        bridge.handle_message(request.resolve(json!({ "total": total })));

        assert_eq!(call.await.unwrap().unwrap(), Sum { total: 5 });
    }

    #[tokio::test]
    async fn test_timeout_deregisters_call() {
        let (bridge, incoming) = bridge();

        let result = bridge
            .invoke_with_timeout(
                CommandDescriptor::new("hang"),
                InvokeOptions::default(),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(bridge.pending_calls(), 0);

        let request = next_request(&incoming).await;
        assert!(matches!(
            bridge.handle_message(request.resolve(json!(null))),
            Handled::Violation(ProtocolViolation::AlreadySettled(_))
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_outstanding_calls() {
        let (bridge, incoming) = bridge();

        let call = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move {
                bridge
                    .invoke(CommandDescriptor::new("hang"), InvokeOptions::default())
                    .await
            }
        });
        next_request(&incoming).await;

        assert_eq!(bridge.close(), 1);
        assert!(matches!(call.await.unwrap(), Err(Error::Disconnected)));
    }

    #[test]
    fn test_emit_local_stays_local() {
        let (bridge, incoming) = bridge();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bridge
            .listen("saved", move |event| {
                seen_clone.lock().unwrap().push((event.payload, event.source));
            })
            .unwrap();

        let delivery = bridge.emit("saved", &json!({"id": 4})).unwrap();
        assert_eq!(delivery.delivered, 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(json!({"id": 4}), EventSource::Local)]
        );
        assert!(incoming.try_recv().is_err());
    }

    #[test]
    fn test_emit_to_host_forwards_and_delivers() {
        let (bridge, incoming) = bridge();
        let hits = Arc::new(Mutex::new(0));
        let hits_clone = Arc::clone(&hits);
        bridge
            .listen("saved", move |_| *hits_clone.lock().unwrap() += 1)
            .unwrap();

        bridge.emit_to(EmitTarget::Host, "saved", &1).unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);

        let frame = incoming.try_recv().unwrap();
        let envelope: Envelope = protocol::decode_body(&frame[4..]).unwrap();
        assert_eq!(
            envelope,
            Envelope::Emit(EventMessage {
                event: "saved".to_string(),
                payload: json!(1),
                window_label: None,
            })
        );
    }

    #[test]
    fn test_emit_to_other_window_is_forwarded_only() {
        let (bridge, incoming) = bridge();
        let hits = Arc::new(Mutex::new(0));
        let hits_clone = Arc::clone(&hits);
        bridge
            .listen("focus", move |_| *hits_clone.lock().unwrap() += 1)
            .unwrap();

        let delivery = bridge
            .emit_to(EmitTarget::Window("settings".to_string()), "focus", &())
            .unwrap();
        assert_eq!(delivery.delivered, 0);
        assert_eq!(*hits.lock().unwrap(), 0);

        let frame = incoming.try_recv().unwrap();
        let Envelope::Emit(message) = protocol::decode_body(&frame[4..]).unwrap() else {
            panic!("expected emit");
        };
        assert_eq!(message.window_label.as_deref(), Some("settings"));

        // Our own label also reaches local listeners
        bridge
            .emit_to(EmitTarget::Window("main".to_string()), "focus", &())
            .unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_emit_when_host_gone_is_transport_error() {
        let (bridge, incoming) = bridge();
        drop(incoming);

        let hits = Arc::new(Mutex::new(0));
        let hits_clone = Arc::clone(&hits);
        bridge
            .listen("saved", move |_| *hits_clone.lock().unwrap() += 1)
            .unwrap();

        let err = bridge.emit_to(EmitTarget::Host, "saved", &1).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn test_host_events_respect_window_label() {
        let (bridge, _incoming) = bridge();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bridge
            .listen("theme", move |event| {
                seen_clone.lock().unwrap().push(event.payload);
            })
            .unwrap();

        let event = |label: Option<&str>, payload: Value| {
            HostMessage::Event(EventMessage {
                event: "theme".to_string(),
                payload,
                window_label: label.map(str::to_string),
            })
        };

        assert!(matches!(
            bridge.handle_message(event(None, json!("dark"))),
            Handled::Delivered(_)
        ));
        assert!(matches!(
            bridge.handle_message(event(Some("settings"), json!("light"))),
            Handled::Ignored
        ));
        assert!(matches!(
            bridge.handle_message(event(Some("main"), json!("light"))),
            Handled::Delivered(_)
        ));

        assert_eq!(*seen.lock().unwrap(), vec![json!("dark"), json!("light")]);
    }

    #[test]
    fn test_host_once_listener() {
        let (bridge, _incoming) = bridge();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handle = bridge
            .once("ready", move |event| {
                seen_clone.lock().unwrap().push(event.payload);
            })
            .unwrap();

        let ready = || {
            HostMessage::Event(EventMessage {
                event: "ready".to_string(),
                payload: json!({"ok": true}),
                window_label: None,
            })
        };
        bridge.handle_message(ready());
        bridge.handle_message(ready());

        assert!(!bridge.events().contains(handle.id()));
        assert_eq!(*seen.lock().unwrap(), vec![json!({"ok": true})]);
        handle.unlisten();
        handle.unlisten();
    }

    #[test]
    fn test_garbage_frame_is_rejected() {
        let (bridge, _incoming) = bridge();
        assert!(matches!(
            bridge.handle_frame(&[0xc1]),
            Err(Error::Serialization(SerializationError::Decode(_)))
        ));
    }

    #[tokio::test]
    async fn test_watch_lifecycle() {
        let (bridge, incoming) = bridge();
        let changes = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            let changes = Arc::clone(&changes);
            async move {
                let watch = bridge
                    .watch(
                        CommandDescriptor::new("watch_start").arg("path", "/tmp").unwrap(),
                        "fs:change",
                        move |event| changes.lock().unwrap().push(event.payload),
                        CommandDescriptor::new("watch_stop"),
                    )
                    .await?;
                assert_eq!(watch.value(), &json!("w1"));
                watch.stop().await
            }
        });

        let start = next_request(&incoming).await;
        assert_eq!(start.cmd, "watch_start");
        assert_eq!(bridge.events().listener_count("fs:change"), 1);
        bridge.handle_message(HostMessage::Event(EventMessage {
            event: "fs:change".to_string(),
            payload: json!("early"),
            window_label: None,
        }));
        bridge.handle_message(start.resolve(json!("w1")));

        let stop = next_request(&incoming).await;
        assert_eq!(stop.cmd, "watch_stop");
        assert_eq!(bridge.events().listener_count("fs:change"), 0);
        bridge.handle_message(stop.resolve(json!(true)));

        assert_eq!(task.await.unwrap().unwrap(), json!(true));
        assert_eq!(*changes.lock().unwrap(), vec![json!("early")]);
    }

    #[tokio::test]
    async fn test_failed_watch_start_removes_listener() {
        let (bridge, incoming) = bridge();

        let task = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move {
                bridge
                    .watch(
                        CommandDescriptor::new("watch_start"),
                        "fs:change",
                        |_| {},
                        CommandDescriptor::new("watch_stop"),
                    )
                    .await
                    .map(|watch| watch.listener())
            }
        });

        let start = next_request(&incoming).await;
        bridge.handle_message(start.reject(json!("no such path")));

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.host_value(), Some(&json!("no such path")));
        assert_eq!(bridge.events().listener_count("fs:change"), 0);
    }
}
