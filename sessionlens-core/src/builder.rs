//! Fluent tracker assembly
//!
//! [`TrackerBuilder`] accumulates a [`TrackerConfig`]; every setter returns the
//! builder and later calls to the same setter win. [`TrackerBuilder::build`]
//! turns the configuration into a running [`Tracker`]: it configures the
//! session, installs the enabled channels on the page, applies retention and
//! installs the manual report hook.
//!
//! ```rust,ignore
//! let tracker = create_tracker()
//!     .with_page(page.clone())
//!     .with_console_auto_reporting([LogLevel::Error])
//!     .with_log_retention(10)
//!     .with_report_endpoint("https://collector.example.com/api/sessions")
//!     .build()?;
//!
//! page.console().call(LogLevel::Error, &[json!("checkout failed")]);
//! // a "consoleTrigger" report is created 50ms later
//! ```

use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::channels::{InterceptionAdapter, ReplayRecorder};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{ReplayOptions, TrackerConfig};
use crate::delivery::{HttpTransport, ReportTransport};
use crate::error::Result;
use crate::host::PageEnvironment;
use crate::scheduler::{SharedScheduler, TokioScheduler};
use crate::session::{MANUAL_TRIGGER, SessionCoordinator, SessionReport};
use crate::types::{FeatureFlags, LogLevel, UserInfo};

/// Start assembling a tracker with default settings
pub fn create_tracker() -> TrackerBuilder {
    TrackerBuilder::new()
}

/// Builder for [`Tracker`]
#[derive(Default)]
pub struct TrackerBuilder {
    config: TrackerConfig,
    page: Option<Arc<PageEnvironment>>,
    recorder: Option<Arc<dyn ReplayRecorder>>,
    transport: Option<Arc<dyn ReportTransport>>,
    clock: Option<SharedClock>,
    scheduler: Option<SharedScheduler>,
    bus: Option<Arc<EventBus>>,
}

impl TrackerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration
    pub fn from_config(config: TrackerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_console_logging(mut self, enabled: bool) -> Self {
        self.config.features.console = enabled;
        self
    }

    pub fn with_network_logging(mut self, enabled: bool) -> Self {
        self.config.features.network = enabled;
        self
    }

    pub fn with_dom_event_logging(mut self, enabled: bool) -> Self {
        self.config.features.dom = enabled;
        self
    }

    /// Toggle replay recording; also sets the `capture_rrweb` flag
    pub fn with_rrweb_logging(mut self, enabled: bool) -> Self {
        self.config.features.rrweb = enabled;
        self.config.feature_flags.capture_rrweb = Some(enabled);
        self
    }

    pub fn with_auto_error_reporting(mut self, enabled: bool) -> Self {
        self.config.features.auto_error = enabled;
        self
    }

    pub fn with_manual_reporting(mut self, enabled: bool) -> Self {
        self.config.features.manual = enabled;
        self
    }

    pub fn with_log_retention(mut self, minutes: u64) -> Self {
        self.config.log_retention_minutes = minutes;
        self
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.config.user = Some(user);
        self
    }

    /// Recorder options; setting them turns `capture_rrweb` on
    pub fn with_rrweb_config(mut self, options: ReplayOptions) -> Self {
        self.config.rrweb_config = Some(options);
        self.config.feature_flags.capture_rrweb = Some(true);
        self
    }

    /// Merge `flags` over the current flags; unset fields keep their value
    pub fn with_feature_flags(mut self, flags: FeatureFlags) -> Self {
        self.config.feature_flags.merge(flags);
        self
    }

    /// Console levels that trigger a report. An empty list turns
    /// auto-reporting off.
    pub fn with_console_auto_reporting(mut self, triggers: impl IntoIterator<Item = LogLevel>) -> Self {
        self.config.console_report_triggers = triggers.into_iter().collect();
        self.config.features.console_auto_report = !self.config.console_report_triggers.is_empty();
        self
    }

    pub fn with_report_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.report_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_dom_event_limit(mut self, limit: usize) -> Self {
        self.config.dom_event_limit = Some(limit);
        self
    }

    /// Page the channels install on. Without one, nothing is intercepted.
    pub fn with_page(mut self, page: Arc<PageEnvironment>) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_replay_recorder(mut self, recorder: Arc<dyn ReplayRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn ReportTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_scheduler(mut self, scheduler: SharedScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Configuration accumulated so far
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Wire everything up and start capturing.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation or a channel
    /// cannot be installed. Channels installed before the failure are removed
    /// again.
    pub fn build(self) -> Result<Tracker> {
        let config = self.config;
        config.validate()?;

        let coordinator = SessionCoordinator::new(
            self.bus.unwrap_or_else(|| Arc::new(EventBus::new())),
            self.clock
                .unwrap_or_else(|| Arc::new(SystemClock) as SharedClock),
            self.scheduler
                .unwrap_or_else(|| Arc::new(TokioScheduler) as SharedScheduler),
            self.transport
                .unwrap_or_else(|| Arc::new(HttpTransport::new()) as Arc<dyn ReportTransport>),
        );
        if let Some(page) = &self.page {
            coordinator.attach_page(page.clone());
        }
        if let Some(recorder) = self.recorder {
            coordinator.replay().set_recorder(recorder);
        }

        coordinator.configure(&config);

        let retention = config.log_retention_minutes;
        coordinator.console().set_retention(retention);
        coordinator.network().set_retention(retention);
        coordinator.replay().set_retention(retention);

        let features = config.features;
        let mut adapters: Vec<Arc<dyn InterceptionAdapter>> = Vec::new();
        match &self.page {
            Some(page) => {
                if features.console {
                    let console = coordinator.console();
                    if features.console_auto_report {
                        console.set_auto_report_triggers(config.console_report_triggers.iter().copied());
                    }
                    console.set_error_capture(features.auto_error);
                    adapters.push(console.clone());
                }
                if features.network {
                    adapters.push(coordinator.network().clone());
                }
                if features.dom {
                    if let Some(limit) = config.dom_event_limit {
                        coordinator.dom().set_limit(limit);
                    }
                    adapters.push(coordinator.dom().clone());
                }
                install_all(&adapters, page)?;
            }
            None => debug!("no page environment; capture adapters not installed"),
        }

        if let Some(user) = config.user.clone() {
            coordinator.set_user(user);
        }

        let manual_hook = match &self.page {
            Some(page) if features.manual => {
                let weak: Weak<SessionCoordinator> = Arc::downgrade(&coordinator);
                page.install_report_hook(Arc::new(move || {
                    weak.upgrade()
                        .map(|coordinator| coordinator.create_report(MANUAL_TRIGGER))
                }));
                true
            }
            _ => false,
        };

        debug!(
            session_id = %coordinator.session_id(),
            adapters = adapters.len(),
            manual_hook,
            "tracker built"
        );

        Ok(Tracker {
            coordinator,
            page: self.page,
            adapters,
            manual_hook,
        })
    }
}

fn install_all(adapters: &[Arc<dyn InterceptionAdapter>], page: &Arc<PageEnvironment>) -> Result<()> {
    for (index, adapter) in adapters.iter().enumerate() {
        if let Err(e) = adapter.install(page) {
            for installed in adapters[..index].iter().rev() {
                if let Err(undo) = installed.uninstall() {
                    warn!(channel = installed.name(), error = %undo, "rollback failed");
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

impl std::fmt::Debug for TrackerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerBuilder")
            .field("config", &self.config)
            .field("page", &self.page.is_some())
            .field("recorder", &self.recorder.is_some())
            .finish_non_exhaustive()
    }
}

/// A running tracker
#[derive(Debug)]
pub struct Tracker {
    coordinator: Arc<SessionCoordinator>,
    page: Option<Arc<PageEnvironment>>,
    adapters: Vec<Arc<dyn InterceptionAdapter>>,
    manual_hook: bool,
}

impl Tracker {
    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.coordinator.bus()
    }

    pub fn page(&self) -> Option<&Arc<PageEnvironment>> {
        self.page.as_ref()
    }

    pub fn create_report(&self, trigger: &str) -> SessionReport {
        self.coordinator.create_report(trigger)
    }

    /// Same as the page's manual hook
    pub fn report_session(&self) -> SessionReport {
        self.coordinator.create_report(MANUAL_TRIGGER)
    }

    /// Update the user attached to later reports
    pub fn update_user(&self, user: UserInfo) {
        self.coordinator.set_user(user);
    }

    pub fn session_id(&self) -> String {
        self.coordinator.session_id()
    }

    /// Stop the recorder, uninstall every adapter in reverse install order
    /// and remove the manual report hook.
    ///
    /// Trackers stacked on the same page must be shut down in reverse order
    /// of building. The first uninstall error is returned after the rest
    /// have been attempted.
    pub fn shutdown(self) -> Result<()> {
        self.coordinator.replay().stop();

        let mut first_error = None;
        for adapter in self.adapters.iter().rev() {
            if let Err(e) = adapter.uninstall() {
                warn!(channel = adapter.name(), error = %e, "uninstall failed");
                first_error.get_or_insert(e);
            }
        }

        if self.manual_hook {
            if let Some(page) = &self.page {
                page.remove_report_hook();
            }
        }

        debug!(session_id = %self.coordinator.session_id(), "tracker shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
