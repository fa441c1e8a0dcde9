//! Identifiers shared by the correlator and the event channel

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolViolation;

/// Token correlating an invoke envelope with the host's reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle to a single listener record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Monotonic id source. Ids start at 1 and are never handed out twice.
#[derive(Debug)]
pub(crate) struct IdGen {
    next: AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    fn bump(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn call_id(&self) -> CallId {
        CallId(self.bump())
    }

    pub fn listener_id(&self) -> ListenerId {
        ListenerId(self.bump())
    }

    /// Whether `raw` has been handed out by this generator
    pub fn issued(&self, raw: u64) -> bool {
        raw != 0 && raw < self.next.load(Ordering::Relaxed)
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

const SUCCESS_PREFIX: &str = "_tether_ok_";
const ERROR_PREFIX: &str = "_tether_err_";

/// Which half of a pending completion a host reply addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Success,
    Error,
}

/// Host-visible name of one of the two reply callbacks of a call.
///
/// Rendered as `_tether_ok_<id>` or `_tether_err_<id>`, so names are unique
/// for as long as call ids are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackRef {
    pub call_id: CallId,
    pub kind: CallbackKind,
}

impl CallbackRef {
    pub fn success(call_id: CallId) -> Self {
        Self {
            call_id,
            kind: CallbackKind::Success,
        }
    }

    pub fn error(call_id: CallId) -> Self {
        Self {
            call_id,
            kind: CallbackKind::Error,
        }
    }
}

impl fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            CallbackKind::Success => SUCCESS_PREFIX,
            CallbackKind::Error => ERROR_PREFIX,
        };
        write!(f, "{prefix}{}", self.call_id)
    }
}

impl FromStr for CallbackRef {
    type Err = ProtocolViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, digits) = if let Some(rest) = s.strip_prefix(SUCCESS_PREFIX) {
            (CallbackKind::Success, rest)
        } else if let Some(rest) = s.strip_prefix(ERROR_PREFIX) {
            (CallbackKind::Error, rest)
        } else {
            return Err(ProtocolViolation::MalformedCallback(s.to_string()));
        };

        let raw: u64 = digits
            .parse()
            .map_err(|_| ProtocolViolation::MalformedCallback(s.to_string()))?;

        Ok(Self {
            call_id: CallId(raw),
            kind,
        })
    }
}
