use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::estimation::domain::vitals_estimate::VitalsEstimate;
use crate::shared::error::{VitalsError, Warning};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Vitals,
    Warning,
    Error,
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vitals" => Ok(EventKind::Vitals),
            "warning" => Ok(EventKind::Warning),
            "error" => Ok(EventKind::Error),
            other => Err(format!("unknown event kind '{other}'")),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Vitals => write!(f, "vitals"),
            EventKind::Warning => write!(f, "warning"),
            EventKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Vitals(VitalsEstimate),
    Warning(Warning),
    Error(VitalsError),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Vitals(_) => EventKind::Vitals,
            Event::Warning(_) => EventKind::Warning,
            Event::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(ListenerId, EventHandler)>>,
    closed: bool,
}

/// Ordered per-kind subscriber lists.
///
/// Handlers run on the emitting thread in insertion order. The list is
/// snapshotted before dispatch, so handlers may add or remove listeners.
/// Once closed, nothing is delivered and nothing can subscribe.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<Listeners>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` once the bus is closed.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Option<ListenerId> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return None;
        }
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.by_kind.entry(kind).or_default().push((id, handler));
        Some(id)
    }

    /// Returns whether a listener was removed.
    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = inner.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        list.len() != before
    }

    pub fn emit(&self, event: &Event) {
        let handlers: Vec<EventHandler> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed {
                return;
            }
            inner
                .by_kind
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(event);
        }
    }

    /// Drops every listener and rejects future events.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        inner.by_kind.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed
    }
}
