//! Invocation correlator
//!
//! Gives every outgoing command a fresh [`CallId`], keeps a pending completion
//! for it until the host answers, and routes the answer back to the waiting
//! caller exactly once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use smol::channel::{Receiver, Sender};

use crate::descriptor::CommandDescriptor;
use crate::error::{Error, ProtocolViolation, Result};
use crate::ids::{CallId, CallbackKind, CallbackRef, IdGen};
use crate::ipc::protocol::{self, Envelope};
use crate::ipc::Transport;

/// What the host answered: `Ok` through the success callback, `Err` through
/// the error callback. Both carry the host's value untouched.
type Outcome = std::result::Result<Value, Value>;

/// Per-call options carried alongside the descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    pub headers: BTreeMap<String, String>,
}

impl InvokeOptions {
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

struct PendingCompletion {
    settle: Sender<Outcome>,
}

/// Table of calls awaiting a host reply
#[derive(Default)]
pub struct Correlator {
    ids: IdGen,
    pending: Mutex<HashMap<CallId, PendingCompletion>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<CallId, PendingCompletion>> {
        // Continuations never run under the lock, so a poisoned table is still consistent
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `descriptor` to the host and wait for its reply.
    ///
    /// There is no timeout: if the host never answers, the returned future
    /// never completes. Dropping the future deregisters the call.
    pub async fn invoke<T: Transport>(
        &self,
        transport: &T,
        descriptor: CommandDescriptor,
        options: InvokeOptions,
        max_frame_len: usize,
    ) -> Result<Value> {
        let pending = self.dispatch(transport, descriptor, options, max_frame_len)?;
        pending.wait().await
    }

    /// Register and send a call without waiting for it
    pub(crate) fn dispatch<T: Transport>(
        &self,
        transport: &T,
        descriptor: CommandDescriptor,
        options: InvokeOptions,
        max_frame_len: usize,
    ) -> Result<PendingCall<'_>> {
        let call_id = self.ids.call_id();
        let (cmd, payload) = descriptor.into_parts();

        // Encode before registering so a bad payload leaves no entry behind
        let envelope = Envelope::invoke(call_id, cmd, payload, options.headers);
        let frame = protocol::encode_frame(&envelope, max_frame_len)?;

        let pending = self.register(call_id)?;

        if let Err(e) = transport.send_frame(frame) {
            tracing::debug!(call_id = %call_id, error = %e, "failed to send invoke envelope");
            // Dropping `pending` removes the registration
            return Err(Error::Transport(e));
        }

        if let Envelope::Invoke(request) = &envelope {
            tracing::debug!(call_id = %call_id, cmd = %request.cmd, "dispatched command");
        }
        Ok(pending)
    }

    /// Register a pending completion for `call_id`.
    ///
    /// Fails fast instead of overwriting an outstanding entry.
    pub(crate) fn register(&self, call_id: CallId) -> Result<PendingCall<'_>> {
        let (settle, receiver) = smol::channel::bounded(1);

        let mut table = self.table();
        if table.contains_key(&call_id) {
            return Err(Error::DuplicateCallId(call_id));
        }
        table.insert(call_id, PendingCompletion { settle });

        Ok(PendingCall {
            correlator: self,
            call_id,
            receiver,
        })
    }

    /// Route a host reply addressed to the callback named `callback`.
    ///
    /// The entry is removed before the waiting caller is woken, so it is freed
    /// no matter what the caller does with the value.
    pub fn settle(&self, callback: &str, payload: Value) -> std::result::Result<CallId, ProtocolViolation> {
        let callback: CallbackRef = callback.parse()?;
        self.settle_ref(callback, payload)
    }

    pub fn settle_ref(
        &self,
        callback: CallbackRef,
        payload: Value,
    ) -> std::result::Result<CallId, ProtocolViolation> {
        let call_id = callback.call_id;
        let Some(completion) = self.table().remove(&call_id) else {
            let violation = if self.ids.issued(call_id.get()) {
                ProtocolViolation::AlreadySettled(call_id)
            } else {
                ProtocolViolation::UnknownCall(call_id)
            };
            return Err(violation);
        };

        let outcome = match callback.kind {
            CallbackKind::Success => Ok(payload),
            CallbackKind::Error => Err(payload),
        };
        tracing::debug!(call_id = %call_id, ok = outcome.is_ok(), "settled call");

        // The caller may have gone away in the meantime; nothing left to wake then
        let _ = completion.settle.try_send(outcome);
        Ok(call_id)
    }

    /// Fail every outstanding call with [`Error::Disconnected`]
    pub fn reject_all(&self) -> usize {
        let drained: Vec<_> = self.table().drain().collect();
        let count = drained.len();
        // Dropping the senders wakes each waiter with a closed channel
        drop(drained);
        if count > 0 {
            tracing::debug!(count, "rejected outstanding calls");
        }
        count
    }

    /// Number of calls still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    pub fn is_pending(&self, call_id: CallId) -> bool {
        self.table().contains_key(&call_id)
    }

    fn forget(&self, call_id: CallId) {
        if self.table().remove(&call_id).is_some() {
            tracing::debug!(call_id = %call_id, "abandoned call deregistered");
        }
    }
}

/// A registered call waiting for its reply.
///
/// Dropping it before the reply arrives deregisters the call.
pub(crate) struct PendingCall<'a> {
    correlator: &'a Correlator,
    call_id: CallId,
    receiver: Receiver<Outcome>,
}

impl PendingCall<'_> {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub async fn wait(self) -> Result<Value> {
        match self.receiver.recv().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Error::Host(error)),
            Err(_) => Err(Error::Disconnected),
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.correlator.forget(self.call_id);
    }
}
