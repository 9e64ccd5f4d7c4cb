//! Session coordination and report assembly
//!
//! The [`SessionCoordinator`] owns session identity, the shared feature flags
//! and the four capture channels. A report is a point-in-time copy of every
//! channel plus identity metadata; it is published on the bus and, when an
//! endpoint is configured, delivered in a detached task.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::channels::{ConsoleChannel, DomChannel, NetworkChannel, ReplayChannel};
use crate::clock::{SharedClock, new_id};
use crate::config::TrackerConfig;
use crate::delivery::{DeliveryPayload, ReportTransport};
use crate::error::SessionLensError;
use crate::host::PageEnvironment;
use crate::scheduler::SharedScheduler;
use crate::types::{
    DomEventEntry, FeatureFlags, LogEntry, LogLevel, NetworkEntry, ReplayFrameEntry, SharedFlags,
    UserInfo,
};

/// Trigger reason for reports requested through the page hook
pub const MANUAL_TRIGGER: &str = "manual";

/// Trigger reason for reports scheduled by a console trigger level
pub const CONSOLE_TRIGGER: &str = "consoleTrigger";

const NAMESPACE: &str = "session";

/// Snapshot of every channel at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    pub created_at: String,
    pub trigger: String,
    pub feature_flags: FeatureFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    pub console: Vec<LogEntry>,
    pub network: Vec<NetworkEntry>,
    pub dom: Vec<DomEventEntry>,
    pub rrweb: Vec<ReplayFrameEntry>,
}

#[derive(Debug)]
struct SessionState {
    session_id: String,
    user: Option<UserInfo>,
    triggers: Vec<LogLevel>,
    endpoint: Option<String>,
    replay_enabled: bool,
}

pub struct SessionCoordinator {
    state: RwLock<SessionState>,
    flags: SharedFlags,
    console: Arc<ConsoleChannel>,
    network: Arc<NetworkChannel>,
    dom: Arc<DomChannel>,
    replay: Arc<ReplayChannel>,
    page: RwLock<Option<Arc<PageEnvironment>>>,
    bus: Arc<EventBus>,
    clock: SharedClock,
    transport: Arc<dyn ReportTransport>,
}

impl SessionCoordinator {
    /// Create a coordinator with a fresh session id and its own channels.
    ///
    /// The console channel's report trigger is wired back to
    /// [`trigger_report`](Self::trigger_report).
    pub fn new(
        bus: Arc<EventBus>,
        clock: SharedClock,
        scheduler: SharedScheduler,
        transport: Arc<dyn ReportTransport>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let flags: SharedFlags = Arc::new(RwLock::new(FeatureFlags::all_enabled()));

            let console = ConsoleChannel::new(bus.clone(), clock.clone(), scheduler);
            let coordinator = me.clone();
            console.set_report_trigger(Arc::new(move || {
                if let Some(coordinator) = coordinator.upgrade() {
                    coordinator.trigger_report();
                }
            }));

            let network = NetworkChannel::new(bus.clone(), clock.clone());
            network.configure(flags.clone());
            let replay = ReplayChannel::new(bus.clone(), clock.clone());
            replay.configure(flags.clone());
            let dom = DomChannel::new(bus.clone(), clock.clone());

            Self {
                state: RwLock::new(SessionState {
                    session_id: new_id(),
                    user: None,
                    triggers: vec![LogLevel::Error, LogLevel::Warn],
                    endpoint: None,
                    replay_enabled: true,
                }),
                flags,
                console,
                network,
                dom,
                replay,
                page: RwLock::new(None),
                bus,
                clock,
                transport,
            }
        })
    }

    /// Apply a configuration: flags, triggers, user, endpoint and replay options.
    /// Starts the replay channel when replay is enabled.
    pub fn configure(&self, config: &TrackerConfig) {
        *self.flags.write() = config.feature_flags;
        self.network.configure(self.flags.clone());
        self.replay.configure(self.flags.clone());
        self.replay
            .set_options(config.rrweb_config.clone().unwrap_or_default());

        let replay_enabled = {
            let mut state = self.state.write();
            state.triggers = config.console_report_triggers.clone();
            state.user = config.user.clone();
            state.endpoint = config.report_endpoint.clone();
            state.replay_enabled = config.features.rrweb;
            state.replay_enabled
        };

        debug!(
            flags = ?config.feature_flags,
            triggers = ?config.console_report_triggers,
            endpoint = ?config.report_endpoint,
            "session configured"
        );

        if replay_enabled {
            self.replay.start();
        }
    }

    /// Page used for delivery context (user agent and URL)
    pub fn attach_page(&self, page: Arc<PageEnvironment>) {
        *self.page.write() = Some(page);
    }

    pub fn page(&self) -> Option<Arc<PageEnvironment>> {
        self.page.read().clone()
    }

    pub fn console(&self) -> &Arc<ConsoleChannel> {
        &self.console
    }

    pub fn network(&self) -> &Arc<NetworkChannel> {
        &self.network
    }

    pub fn dom(&self) -> &Arc<DomChannel> {
        &self.dom
    }

    pub fn replay(&self) -> &Arc<ReplayChannel> {
        &self.replay
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn set_user(&self, user: UserInfo) {
        self.state.write().user = Some(user);
    }

    pub fn user(&self) -> Option<UserInfo> {
        self.state.read().user.clone()
    }

    /// Force a session id, e.g. one shared with another device
    pub fn set_session_id(&self, id: impl Into<String>) {
        self.state.write().session_id = id.into();
    }

    /// Start a new session id and return it
    pub fn regenerate_session_id(&self) -> String {
        let id = new_id();
        self.state.write().session_id = id.clone();
        id
    }

    pub fn session_id(&self) -> String {
        self.state.read().session_id.clone()
    }

    pub fn feature_flags(&self) -> FeatureFlags {
        *self.flags.read()
    }

    /// Replace the live flags; channels see the change on their next capture
    pub fn set_feature_flags(&self, flags: FeatureFlags) {
        *self.flags.write() = flags;
    }

    pub fn triggers(&self) -> Vec<LogLevel> {
        self.state.read().triggers.clone()
    }

    pub fn report_endpoint(&self) -> Option<String> {
        self.state.read().endpoint.clone()
    }

    /// Create a console-triggered report, unless no trigger levels are configured
    pub fn trigger_report(&self) -> Option<SessionReport> {
        if self.state.read().triggers.is_empty() {
            debug!("no trigger levels configured; skipping triggered report");
            return None;
        }
        Some(self.create_report(CONSOLE_TRIGGER))
    }

    /// Assemble, publish and (if an endpoint is set) deliver a report
    pub fn create_report(&self, trigger: &str) -> SessionReport {
        let (session_id, user, endpoint, replay_enabled) = {
            let state = self.state.read();
            (
                state.session_id.clone(),
                state.user.clone(),
                state.endpoint.clone(),
                state.replay_enabled,
            )
        };

        if replay_enabled {
            self.replay.start();
        }

        self.console.cleanup();
        self.network.cleanup();
        self.replay.cleanup();

        let report = SessionReport {
            session_id,
            created_at: self.clock.now_iso(),
            trigger: trigger.to_string(),
            feature_flags: self.feature_flags(),
            user,
            console: self.console.get_all(),
            network: self.network.get_all(),
            dom: self.dom.get_all(),
            rrweb: self.replay.get_all(),
        };

        info!(
            session_id = %report.session_id,
            trigger,
            console = report.console.len(),
            network = report.network.len(),
            dom = report.dom.len(),
            rrweb = report.rrweb.len(),
            "session report created"
        );
        self.bus.publish(NAMESPACE, LogLevel::Info, &report);

        if let Some(endpoint) = endpoint {
            self.deliver(endpoint, &report);
        }

        report
    }

    /// Post the report in a detached task. Failures are logged on the bus.
    fn deliver(&self, endpoint: String, report: &SessionReport) {
        let page = self.page();
        let payload = DeliveryPayload::from_report(
            report,
            page.as_ref()
                .and_then(|page| page.user_agent().map(str::to_string)),
            page.as_ref().and_then(|page| page.url()),
        );

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %report.session_id, "no async runtime; report not delivered");
            return;
        };

        let transport = self.transport.clone();
        let bus = self.bus.clone();
        let session_id = report.session_id.clone();
        handle.spawn(async move {
            let failure = match transport.post_json(&endpoint, &payload).await {
                Ok(status) if (200..300).contains(&status) => {
                    debug!(session_id = %session_id, status, "report delivered");
                    return;
                }
                Ok(status) => SessionLensError::Delivery { status },
                Err(e) => e,
            };
            error!(session_id = %session_id, endpoint = %endpoint, error = %failure, "report delivery failed");
            bus.emit(NAMESPACE, LogLevel::Error, Value::String(failure.to_string()));
        });
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("state", &*self.state.read())
            .field("flags", &self.feature_flags())
            .field("console", &self.console)
            .field("network", &self.network)
            .field("dom", &self.dom)
            .field("replay", &self.replay)
            .finish_non_exhaustive()
    }
}
