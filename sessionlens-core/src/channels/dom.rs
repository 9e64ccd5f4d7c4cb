//! DOM channel: click and input interactions, bounded by count rather than age

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::InterceptionAdapter;
use crate::bus::EventBus;
use crate::clock::{SharedClock, new_id};
use crate::error::{Result, SessionLensError};
use crate::host::{ElementInfo, HostEvent, HostEventKind, ListenerId, PageEnvironment};
use crate::types::{DomEventEntry, DomEventKind, DomOrigin, LogLevel};

pub const DEFAULT_DOM_LIMIT: usize = 100;
pub const MIN_DOM_LIMIT: usize = 10;
/// Longest text snippet kept from an element, in characters
pub const MAX_TEXT_CHARS: usize = 120;

const NAMESPACE: &str = "dom";

pub struct DomChannel {
    me: Weak<DomChannel>,
    buffer: Mutex<VecDeque<DomEventEntry>>,
    limit: RwLock<usize>,
    bus: Arc<EventBus>,
    clock: SharedClock,
    installation: Mutex<Option<(Arc<PageEnvironment>, Vec<ListenerId>)>>,
}

impl DomChannel {
    pub fn new(bus: Arc<EventBus>, clock: SharedClock) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            buffer: Mutex::new(VecDeque::new()),
            limit: RwLock::new(DEFAULT_DOM_LIMIT),
            bus,
            clock,
            installation: Mutex::new(None),
        })
    }

    /// Maximum number of retained events, floored at [`MIN_DOM_LIMIT`].
    /// Shrinking the limit evicts the oldest events right away.
    pub fn set_limit(&self, limit: usize) {
        let limit = limit.max(MIN_DOM_LIMIT);
        *self.limit.write() = limit;
        trim(&mut self.buffer.lock(), limit);
    }

    pub fn limit(&self) -> usize {
        *self.limit.read()
    }

    pub fn get_all(&self) -> Vec<DomEventEntry> {
        self.buffer.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    fn on_host_event(&self, event: &HostEvent) {
        let (kind, target, text) = match event {
            HostEvent::Click { target } => (
                DomEventKind::Click,
                target
                    .as_ref()
                    .map_or_else(|| "UNKNOWN".to_string(), |el| el.tag_name.clone()),
                target
                    .as_ref()
                    .and_then(|el| el.inner_text.as_deref())
                    .map(snippet)
                    .unwrap_or_default(),
            ),
            HostEvent::Input {
                target: Some(ElementInfo { tag_name, value, .. }),
            } => (
                DomEventKind::Input,
                tag_name.clone(),
                value.as_deref().map(snippet).unwrap_or_default(),
            ),
            _ => return,
        };

        self.record(DomEventEntry {
            id: new_id(),
            timestamp: self.clock.now(),
            event: kind,
            target,
            text,
            origin: DomOrigin::Dom,
        });
    }

    fn record(&self, entry: DomEventEntry) {
        {
            let mut buffer = self.buffer.lock();
            buffer.push_back(entry.clone());
            trim(&mut buffer, self.limit());
        }
        self.bus.publish(NAMESPACE, LogLevel::Info, &entry);
    }
}

impl InterceptionAdapter for DomChannel {
    fn name(&self) -> &'static str {
        NAMESPACE
    }

    fn install(&self, page: &Arc<PageEnvironment>) -> Result<()> {
        let mut installation = self.installation.lock();
        if installation.is_some() {
            return Err(SessionLensError::AlreadyInstalled(NAMESPACE));
        }

        let listeners = [HostEventKind::Click, HostEventKind::Input]
            .into_iter()
            .map(|kind| {
                let channel = self.me.clone();
                page.window.add_listener(
                    kind,
                    true,
                    Arc::new(move |event| {
                        if let Some(channel) = channel.upgrade() {
                            channel.on_host_event(event);
                        }
                    }),
                )
            })
            .collect();
        *installation = Some((page.clone(), listeners));
        drop(installation);

        debug!(channel = NAMESPACE, "installed");
        self.bus.publish(
            NAMESPACE,
            LogLevel::Info,
            &DomEventEntry {
                id: new_id(),
                timestamp: self.clock.now(),
                event: DomEventKind::Init,
                target: "window".to_string(),
                text: "DOM capture started".to_string(),
                origin: DomOrigin::Dom,
            },
        );
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        let Some((page, listeners)) = self.installation.lock().take() else {
            return Err(SessionLensError::NotInstalled(NAMESPACE));
        };
        for id in listeners {
            page.window.remove_listener(id);
        }
        debug!(channel = NAMESPACE, "uninstalled");
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.installation.lock().is_some()
    }
}

impl std::fmt::Debug for DomChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomChannel")
            .field("entries", &self.len())
            .field("limit", &self.limit())
            .field("installed", &self.is_installed())
            .finish()
    }
}

fn snippet(text: &str) -> String {
    text.chars().take(MAX_TEXT_CHARS).collect()
}

fn trim(buffer: &mut VecDeque<DomEventEntry>, limit: usize) {
    if buffer.len() > limit {
        let excess = buffer.len() - limit;
        buffer.drain(..excess);
    }
}
