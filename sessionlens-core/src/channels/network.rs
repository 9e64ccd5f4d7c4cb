//! Network channel
//!
//! Two adapters coexist: one around the promise-style fetch and one around
//! the legacy request-object factory. Both observe the outcome and hand it
//! back to the caller untouched. Capture is gated on the live
//! `capture_network` flag, read when each request settles.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::debug;

use super::{InterceptionAdapter, Patch};
use crate::bus::EventBus;
use crate::clock::{SharedClock, new_id};
use crate::error::{Result, SessionLensError};
use crate::host::{
    FetchApi, FetchError, FetchRequest, FetchResponse, LegacyRequest, LegacyRequestFactory,
    LoadEndListener, PageEnvironment,
};
use crate::retention::{RetentionWindow, prune_by_time};
use crate::types::{FeatureFlags, LogLevel, NetworkEntry, NetworkOrigin, SharedFlags};

const NAMESPACE: &str = "network";

pub struct NetworkChannel {
    me: Weak<NetworkChannel>,
    buffer: Mutex<VecDeque<NetworkEntry>>,
    retention: RwLock<RetentionWindow>,
    flags: RwLock<SharedFlags>,
    bus: Arc<EventBus>,
    clock: SharedClock,
    installation: Mutex<Option<Installation>>,
}

struct Installation {
    page: Arc<PageEnvironment>,
    fetch: Patch<dyn FetchApi>,
    legacy: Patch<dyn LegacyRequestFactory>,
}

impl NetworkChannel {
    pub fn new(bus: Arc<EventBus>, clock: SharedClock) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            buffer: Mutex::new(VecDeque::new()),
            retention: RwLock::new(RetentionWindow::default()),
            flags: RwLock::new(Arc::new(RwLock::new(FeatureFlags::default()))),
            bus,
            clock,
            installation: Mutex::new(None),
        })
    }

    /// Point the channel at a shared flags record; later writes to that
    /// record apply to requests already in flight.
    pub fn configure(&self, flags: SharedFlags) {
        *self.flags.write() = flags;
    }

    pub fn capture_enabled(&self) -> bool {
        self.flags.read().read().network_enabled()
    }

    pub fn set_retention(&self, minutes: u64) {
        *self.retention.write() = RetentionWindow::from_minutes(minutes);
    }

    pub fn retention(&self) -> RetentionWindow {
        *self.retention.read()
    }

    pub fn get_all(&self) -> Vec<NetworkEntry> {
        self.buffer.lock().iter().cloned().collect()
    }

    pub fn cleanup(&self) -> usize {
        let window = self.retention();
        let now = self.clock.now();
        prune_by_time(&mut self.buffer.lock(), window, now)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    fn record(&self, entry: NetworkEntry) {
        let level = if entry.status >= 500 {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        self.buffer.lock().push_back(entry.clone());
        self.bus.publish(NAMESPACE, level, &entry);
    }

    fn announce(&self) {
        let entry = NetworkEntry {
            id: new_id(),
            timestamp: self.clock.now(),
            url: "init".to_string(),
            method: "INIT".to_string(),
            status: 200,
            duration: 0.0,
            error: None,
            origin: NetworkOrigin::Network,
        };
        self.bus.publish(NAMESPACE, LogLevel::Info, &entry);
    }
}

impl InterceptionAdapter for NetworkChannel {
    fn name(&self) -> &'static str {
        NAMESPACE
    }

    fn install(&self, page: &Arc<PageEnvironment>) -> Result<()> {
        let mut installation = self.installation.lock();
        if installation.is_some() {
            return Err(SessionLensError::AlreadyInstalled(NAMESPACE));
        }

        let active = Arc::new(AtomicBool::new(true));

        let channel = self.me.clone();
        let flag = active.clone();
        let fetch = Patch::apply(&page.fetch, active.clone(), move |original| {
            Arc::new(FetchInterceptor {
                channel,
                original,
                active: flag,
            }) as Arc<dyn FetchApi>
        });

        let channel = self.me.clone();
        let flag = active.clone();
        let legacy = Patch::apply(&page.legacy_requests, active, move |original| {
            Arc::new(LegacyFactoryInterceptor {
                channel,
                original,
                active: flag,
            }) as Arc<dyn LegacyRequestFactory>
        });

        *installation = Some(Installation {
            page: page.clone(),
            fetch,
            legacy,
        });
        drop(installation);

        debug!(channel = NAMESPACE, "installed");
        self.announce();
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        let Some(installation) = self.installation.lock().take() else {
            return Err(SessionLensError::NotInstalled(NAMESPACE));
        };
        installation.fetch.restore(&installation.page.fetch);
        installation.legacy.restore(&installation.page.legacy_requests);
        debug!(channel = NAMESPACE, "uninstalled");
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.installation.lock().is_some()
    }
}

impl std::fmt::Debug for NetworkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkChannel")
            .field("entries", &self.len())
            .field("capture_enabled", &self.capture_enabled())
            .field("retention", &self.retention())
            .field("installed", &self.is_installed())
            .finish()
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1_000.0
}

struct FetchInterceptor {
    channel: Weak<NetworkChannel>,
    original: Arc<dyn FetchApi>,
    active: Arc<AtomicBool>,
}

#[async_trait]
impl FetchApi for FetchInterceptor {
    async fn fetch(&self, request: FetchRequest) -> std::result::Result<FetchResponse, FetchError> {
        if !self.active.load(Ordering::Acquire) {
            return self.original.fetch(request).await;
        }

        let start = Instant::now();
        let id = new_id();
        let url = request.url.clone();
        let method = request.effective_method().to_string();

        let outcome = self.original.fetch(request).await;
        let duration = elapsed_ms(start);

        if let Some(channel) = self.channel.upgrade() {
            if channel.capture_enabled() {
                let (status, error) = match &outcome {
                    Ok(response) => (response.status, None),
                    Err(e) => (0, Some(e.to_string())),
                };
                channel.record(NetworkEntry {
                    id,
                    timestamp: channel.clock.now(),
                    url,
                    method,
                    status,
                    duration,
                    error,
                    origin: NetworkOrigin::Fetch,
                });
            }
        }

        outcome
    }
}

struct LegacyFactoryInterceptor {
    channel: Weak<NetworkChannel>,
    original: Arc<dyn LegacyRequestFactory>,
    active: Arc<AtomicBool>,
}

impl LegacyRequestFactory for LegacyFactoryInterceptor {
    fn create(&self) -> Box<dyn LegacyRequest> {
        let inner = self.original.create();
        if !self.active.load(Ordering::Acquire) {
            return inner;
        }
        Box::new(TrackedRequest {
            inner,
            channel: self.channel.clone(),
            method: None,
            url: None,
        })
    }
}

/// Request object that remembers `open` and times `send`
struct TrackedRequest {
    inner: Box<dyn LegacyRequest>,
    channel: Weak<NetworkChannel>,
    method: Option<String>,
    url: Option<String>,
}

impl LegacyRequest for TrackedRequest {
    fn open(&mut self, method: &str, url: &str) {
        self.method = Some(method.to_string());
        self.url = Some(url.to_string());
        self.inner.open(method, url);
    }

    fn send(&mut self, body: Option<Vec<u8>>) {
        let start = Instant::now();
        let channel = self.channel.clone();
        let method = self.method.clone().unwrap_or_else(|| "GET".to_string());
        let url = self.url.clone().unwrap_or_else(|| "UNKNOWN".to_string());

        self.inner.add_load_end_listener(Box::new(move |status| {
            let duration = elapsed_ms(start);
            let Some(channel) = channel.upgrade() else {
                return;
            };
            if !channel.capture_enabled() {
                return;
            }
            channel.record(NetworkEntry {
                id: new_id(),
                timestamp: channel.clock.now(),
                url,
                method,
                status,
                duration,
                error: None,
                origin: NetworkOrigin::Xhr,
            });
        }));

        self.inner.send(body);
    }

    fn status(&self) -> u16 {
        self.inner.status()
    }

    fn add_load_end_listener(&mut self, listener: LoadEndListener) {
        self.inner.add_load_end_listener(listener);
    }
}
