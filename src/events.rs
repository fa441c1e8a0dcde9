//! Event channel
//!
//! A registry of listeners keyed by event name. Envelopes from local emits and
//! from the host go through the same delivery pass.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, ListenerError, Result, SerializationError};
use crate::ids::{IdGen, ListenerId};

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Emitted in this context
    Local,
    /// Forwarded by the host
    Host,
}

/// An event as seen by a listener
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event: String,
    /// The listener receiving this event
    pub id: ListenerId,
    pub payload: Value,
    pub window_label: Option<String>,
    pub source: EventSource,
}

impl Event {
    /// Deserialize the payload into a concrete type
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.payload)
            .map_err(|e| Error::Serialization(SerializationError::Json(e)))
    }
}

/// A single event waiting to be delivered
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event: String,
    pub payload: Value,
    pub window_label: Option<String>,
    pub source: EventSource,
}

impl EventEnvelope {
    pub fn local(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            window_label: None,
            source: EventSource::Local,
        }
    }
}

/// How long a listener stays registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// Until explicitly removed
    Persistent,
    /// Fires in at most one pass and is removed before its callback runs
    Once,
}

/// Outcome of a single delivery pass
#[derive(Debug, Default)]
pub struct Delivery {
    /// Listeners invoked, including those that failed
    pub delivered: usize,
    pub failures: Vec<ListenerError>,
}

type Handler = Arc<dyn Fn(Event) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&ListenerError) + Send + Sync>;

struct ListenerRecord {
    id: ListenerId,
    event: String,
    kind: Subscription,
    handler: Handler,
    // Set by the pass that fires a once listener
    claimed: Arc<AtomicBool>,
}

/// Listener registry with snapshot delivery
#[derive(Default)]
pub struct EventChannel {
    ids: IdGen,
    // Registration order is delivery order
    listeners: Mutex<Vec<ListenerRecord>>,
    error_hook: Mutex<Option<ErrorHook>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Vec<ListenerRecord>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe `handler` to every later `event`
    pub fn listen<F>(&self, event: &str, handler: F) -> Result<ListenerId>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.subscribe(event, Subscription::Persistent, Arc::new(handler))
    }

    /// Subscribe `handler` to the next `event` only
    pub fn once<F>(&self, event: &str, handler: F) -> Result<ListenerId>
    where
        F: FnOnce(Event) + Send + 'static,
    {
        // A once listener can be reached by at most one pass, which takes the closure out
        let slot = Mutex::new(Some(handler));
        let handler = move |event: Event| {
            let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(handler) = taken {
                handler(event);
            }
        };
        self.subscribe(event, Subscription::Once, Arc::new(handler))
    }

    fn subscribe(&self, event: &str, kind: Subscription, handler: Handler) -> Result<ListenerId> {
        validate_event_name(event)?;

        let id = self.ids.listener_id();
        self.table().push(ListenerRecord {
            id,
            event: event.to_string(),
            kind,
            handler,
            claimed: Arc::new(AtomicBool::new(false)),
        });
        tracing::debug!(event = %event, listener = %id, ?kind, "listener registered");
        Ok(id)
    }

    /// Remove a listener. Unknown or already removed ids are ignored.
    ///
    /// Returns whether a listener was removed.
    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut table = self.table();
        let Some(index) = table.iter().position(|record| record.id == id) else {
            return false;
        };
        let record = table.remove(index);
        drop(table);

        tracing::debug!(event = %record.event, listener = %id, "listener removed");
        true
    }

    /// Deliver `payload` to the listeners of `event` in this context
    pub fn emit(&self, event: &str, payload: Value) -> Result<Delivery> {
        validate_event_name(event)?;
        Ok(self.deliver(EventEnvelope::local(event, payload)))
    }

    /// Run one delivery pass.
    ///
    /// Listeners are taken from a snapshot, so subscriptions made or removed by
    /// a listener only affect later passes. A once listener is removed before
    /// its callback runs and fires in at most one pass, even when passes nest.
    /// A panicking listener is reported and the pass moves on to the next one.
    pub fn deliver(&self, envelope: EventEnvelope) -> Delivery {
        let snapshot: Vec<_> = self
            .table()
            .iter()
            .filter(|record| record.event == envelope.event)
            .map(|record| {
                (
                    record.id,
                    record.kind,
                    Arc::clone(&record.handler),
                    Arc::clone(&record.claimed),
                )
            })
            .collect();

        let mut delivery = Delivery::default();
        for (id, kind, handler, claimed) in snapshot {
            match kind {
                Subscription::Persistent => {}
                Subscription::Once => {
                    if claimed.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    self.unlisten(id);
                }
            }

            let event = Event {
                event: envelope.event.clone(),
                id,
                payload: envelope.payload.clone(),
                window_label: envelope.window_label.clone(),
                source: envelope.source,
            };

            tracing::trace!(event = %envelope.event, listener = %id, "delivering event");
            delivery.delivered += 1;
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let failure = ListenerError {
                    event: envelope.event.clone(),
                    listener: id,
                    message: panic_message(panic.as_ref()),
                };
                self.report(&failure);
                delivery.failures.push(failure);
            }
        }
        delivery
    }

    fn report(&self, failure: &ListenerError) {
        tracing::error!(
            event = %failure.event,
            listener = %failure.listener,
            message = %failure.message,
            "event listener panicked"
        );
        let hook = self
            .error_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| hook(failure))) {
                tracing::error!(
                    event = %failure.event,
                    message = %panic_message(panic.as_ref()),
                    "listener error hook panicked"
                );
            }
        }
    }

    /// Install a hook that sees every listener failure
    pub fn on_listener_error<F>(&self, hook: F)
    where
        F: Fn(&ListenerError) + Send + Sync + 'static,
    {
        *self.error_hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Number of listeners registered for `event`
    pub fn listener_count(&self, event: &str) -> usize {
        self.table()
            .iter()
            .filter(|record| record.event == event)
            .count()
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.table().iter().any(|record| record.id == id)
    }

    /// A disposer that removes `id` from this channel
    pub fn disposer(self: &Arc<Self>, id: ListenerId) -> Unlisten {
        Unlisten {
            channel: Arc::downgrade(self),
            id,
        }
    }
}

/// Removes one listener when called. Calling it again does nothing.
#[derive(Debug, Clone)]
pub struct Unlisten {
    channel: Weak<EventChannel>,
    id: ListenerId,
}

impl Unlisten {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn unlisten(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.unlisten(self.id);
        }
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("listeners", &self.table().len())
            .finish()
    }
}

/// Check that `name` is non-empty and only uses `[A-Za-z0-9-/:_]`
pub fn validate_event_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | ':' | '_'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidEventName(name.to_string()))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(Event) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |tag: &str| -> Box<dyn Fn(Event) + Send + Sync> {
            let log = Arc::clone(&log_clone);
            let tag = tag.to_string();
            Box::new(move |event: Event| {
                log.lock().unwrap().push(format!("{tag}:{}", event.payload));
            })
        };
        (log, make)
    }

    #[test]
    fn test_once_listener_fires_once() {
        let channel = EventChannel::new();
        let (log, make) = recorder();

        let id = channel.once("ready", make("a")).unwrap();
        channel.emit("ready", json!({"ok": true})).unwrap();

        assert!(!channel.contains(id));
        assert_eq!(channel.listener_count("ready"), 0);

        let delivery = channel.emit("ready", json!({"ok": true})).unwrap();
        assert_eq!(delivery.delivered, 0);
        assert_eq!(*log.lock().unwrap(), vec![r#"a:{"ok":true}"#]);
    }

    #[test]
    fn test_persistent_listeners_fire_in_registration_order() {
        let channel = EventChannel::new();
        let (log, make) = recorder();

        channel.listen("tick", make("first")).unwrap();
        channel.listen("tick", make("second")).unwrap();
        channel.listen("other", make("other")).unwrap();

        channel.emit("tick", json!(1)).unwrap();
        channel.emit("tick", json!(2)).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:1", "second:1", "first:2", "second:2"]
        );
    }

    #[test]
    fn test_unlisten_is_idempotent() {
        let channel = EventChannel::new();
        let (log, make) = recorder();

        let id = channel.listen("tick", make("a")).unwrap();
        assert!(channel.unlisten(id));
        assert!(!channel.unlisten(id));

        channel.emit("tick", json!(1)).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let channel = EventChannel::new();
        let (log, make) = recorder();
        let hook_hits = Arc::new(Mutex::new(Vec::new()));
        let hook_clone = Arc::clone(&hook_hits);
        channel.on_listener_error(move |failure| {
            hook_clone.lock().unwrap().push(failure.listener);
        });

        let bad = channel
            .listen("save", |_event: Event| panic!("disk full"))
            .unwrap();
        channel.listen("save", make("good")).unwrap();

        let delivery = channel.emit("save", json!("doc")).unwrap();

        assert_eq!(delivery.delivered, 2);
        assert_eq!(delivery.failures.len(), 1);
        assert_eq!(delivery.failures[0].listener, bad);
        assert_eq!(delivery.failures[0].message, "disk full");
        assert_eq!(*log.lock().unwrap(), vec![r#"good:"doc""#]);
        assert_eq!(*hook_hits.lock().unwrap(), vec![bad]);
        // A failing persistent listener stays registered
        assert!(channel.contains(bad));
    }

    #[test]
    fn test_panicking_once_listener_is_still_removed() {
        let channel = EventChannel::new();
        let id = channel
            .once("boot", |_event: Event| panic!("bad boot"))
            .unwrap();

        let delivery = channel.emit("boot", json!(null)).unwrap();
        assert_eq!(delivery.failures.len(), 1);
        assert!(!channel.contains(id));
    }

    #[test]
    fn test_listener_added_during_pass_waits_for_next_pass() {
        let channel = Arc::new(EventChannel::new());
        let (log, make) = recorder();
        let make = Arc::new(make);

        let channel_clone = Arc::clone(&channel);
        let make_clone = Arc::clone(&make);
        channel
            .once("open", move |_event: Event| {
                channel_clone.listen("open", make_clone("late")).unwrap();
            })
            .unwrap();

        channel.emit("open", json!(1)).unwrap();
        assert!(log.lock().unwrap().is_empty());

        channel.emit("open", json!(2)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["late:2"]);
    }

    #[test]
    fn test_listener_removed_during_pass_still_fires_in_that_pass() {
        let channel = Arc::new(EventChannel::new());
        let (log, make) = recorder();

        let victim = Arc::new(Mutex::new(None));
        let victim_clone = Arc::clone(&victim);
        let channel_clone = Arc::clone(&channel);
        channel
            .listen("close", move |_event: Event| {
                if let Some(id) = *victim_clone.lock().unwrap() {
                    channel_clone.unlisten(id);
                }
            })
            .unwrap();
        let id = channel.listen("close", make("victim")).unwrap();
        *victim.lock().unwrap() = Some(id);

        channel.emit("close", json!(1)).unwrap();
        channel.emit("close", json!(2)).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["victim:1"]);
    }

    #[test]
    fn test_once_listener_removed_during_pass_still_fires_in_that_pass() {
        let channel = Arc::new(EventChannel::new());
        let (log, make) = recorder();

        let victim = Arc::new(Mutex::new(None));
        let victim_clone = Arc::clone(&victim);
        let channel_clone = Arc::clone(&channel);
        channel
            .listen("close", move |_event: Event| {
                if let Some(id) = *victim_clone.lock().unwrap() {
                    channel_clone.unlisten(id);
                }
            })
            .unwrap();
        let id = channel.once("close", make("victim")).unwrap();
        *victim.lock().unwrap() = Some(id);

        let delivery = channel.emit("close", json!(1)).unwrap();
        assert_eq!(delivery.delivered, 2);
        assert!(!channel.contains(id));

        channel.emit("close", json!(2)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["victim:1"]);
    }

    #[test]
    fn test_panicking_error_hook_does_not_abort_pass() {
        let channel = EventChannel::new();
        let (log, make) = recorder();
        channel.on_listener_error(|_failure| panic!("hook broke"));

        channel
            .listen("save", |_event: Event| panic!("disk full"))
            .unwrap();
        channel.listen("save", make("good")).unwrap();

        let delivery = channel.emit("save", json!("doc")).unwrap();

        assert_eq!(delivery.delivered, 2);
        assert_eq!(delivery.failures.len(), 1);
        assert_eq!(*log.lock().unwrap(), vec![r#"good:"doc""#]);
    }

    #[test]
    fn test_reentrant_emit_does_not_refire_once_listener() {
        let channel = Arc::new(EventChannel::new());
        let (log, make) = recorder();

        let channel_clone = Arc::clone(&channel);
        channel
            .listen("ping", move |event: Event| {
                if event.payload == json!(1) {
                    channel_clone.emit("ping", json!(2)).unwrap();
                }
            })
            .unwrap();
        channel.once("ping", make("once")).unwrap();

        channel.emit("ping", json!(1)).unwrap();

        // The nested pass wins the once listener; the outer pass skips it
        assert_eq!(*log.lock().unwrap(), vec!["once:2"]);
    }

    #[test]
    fn test_disposer_outlives_channel() {
        let channel = Arc::new(EventChannel::new());
        let id = channel.listen("tick", |_event: Event| {}).unwrap();
        let disposer = channel.disposer(id);

        disposer.unlisten();
        assert!(!channel.contains(id));
        disposer.unlisten();

        drop(channel);
        disposer.unlisten();
    }

    #[test]
    fn test_invalid_event_names() {
        let channel = EventChannel::new();
        for name in ["", "has space", "dot.ted", "emoji🙂"] {
            assert!(matches!(
                channel.listen(name, |_event: Event| {}),
                Err(Error::InvalidEventName(_))
            ));
        }
        for name in ["ready", "tether://window-created", "fs:change_1"] {
            assert!(channel.listen(name, |_event: Event| {}).is_ok());
        }
    }

    #[test]
    fn test_typed_payload() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Size {
            width: u32,
            height: u32,
        }

        let channel = EventChannel::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        channel
            .listen("resized", move |event: Event| {
                *seen_clone.lock().unwrap() = Some(event.payload_as::<Size>().unwrap());
            })
            .unwrap();

        channel
            .emit("resized", json!({"width": 3, "height": 4}))
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            Some(Size {
                width: 3,
                height: 4
            })
        );
    }
}
