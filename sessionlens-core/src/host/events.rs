//! Page events and the window-level listener registry

use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the element an event fired on
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementInfo {
    pub tag_name: String,
    /// Rendered text of the element
    pub inner_text: Option<String>,
    /// Current value of a form control
    pub value: Option<String>,
    pub outer_html: Option<String>,
}

impl ElementInfo {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.inner_text = Some(text.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_outer_html(mut self, html: impl Into<String>) -> Self {
        self.outer_html = Some(html.into());
        self
    }
}

/// Events the page dispatches on its window target
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Click {
        target: Option<ElementInfo>,
    },
    Input {
        target: Option<ElementInfo>,
    },
    /// Uncaught exception
    RuntimeError {
        message: String,
        error: Value,
        stack: Option<String>,
    },
    /// A script, image or stylesheet failed to load
    ResourceError {
        element: ElementInfo,
    },
    UnhandledRejection {
        reason: Value,
        stack: Option<String>,
    },
    VisibilityChange {
        hidden: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostEventKind {
    Click,
    Input,
    RuntimeError,
    ResourceError,
    UnhandledRejection,
    VisibilityChange,
}

impl HostEvent {
    pub fn kind(&self) -> HostEventKind {
        match self {
            HostEvent::Click { .. } => HostEventKind::Click,
            HostEvent::Input { .. } => HostEventKind::Input,
            HostEvent::RuntimeError { .. } => HostEventKind::RuntimeError,
            HostEvent::ResourceError { .. } => HostEventKind::ResourceError,
            HostEvent::UnhandledRejection { .. } => HostEventKind::UnhandledRejection,
            HostEvent::VisibilityChange { .. } => HostEventKind::VisibilityChange,
        }
    }
}

pub type Listener = Arc<dyn Fn(&HostEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registered {
    id: ListenerId,
    kind: HostEventKind,
    capture: bool,
    listener: Listener,
}

/// Listener registry; capture-phase listeners run before bubble-phase ones
pub struct EventTarget {
    listeners: RwLock<Vec<Registered>>,
    next_id: AtomicU64,
}

impl EventTarget {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add_listener(&self, kind: HostEventKind, capture: bool, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registered {
            id,
            kind,
            capture,
            listener,
        });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| registered.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every listener registered for its kind
    pub fn dispatch(&self, event: &HostEvent) {
        let kind = event.kind();
        let (capturing, bubbling): (Vec<_>, Vec<_>) = self
            .listeners
            .read()
            .iter()
            .filter(|registered| registered.kind == kind)
            .map(|registered| (registered.capture, registered.listener.clone()))
            .partition(|(capture, _)| *capture);

        for (_, listener) in capturing.into_iter().chain(bubbling) {
            listener(event);
        }
    }
}

impl Default for EventTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTarget")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
