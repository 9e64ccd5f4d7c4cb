//! Console channel
//!
//! Wraps the page console so every call is recorded before it is forwarded,
//! and listens on the window for uncaught errors, unhandled rejections,
//! resource-load failures and the page being hidden. Console calls at a
//! trigger level schedule a report [`REPORT_DELAY`] later, one per call.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::VecDeque;
use std::panic::catch_unwind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

use super::{InterceptionAdapter, Patch};
use crate::bus::EventBus;
use crate::clock::{SharedClock, new_id};
use crate::error::{Result, SessionLensError};
use crate::host::{ConsoleApi, HostEvent, HostEventKind, Listener, ListenerId, PageEnvironment};
use crate::retention::{RetentionWindow, prune_by_time};
use crate::scheduler::SharedScheduler;
use crate::types::{LogEntry, LogLevel, LogOrigin};

/// Delay between a triggering console call and the report it schedules
pub const REPORT_DELAY: Duration = Duration::from_millis(50);

/// Callback run when a trigger-level console call's delay elapses
pub type TriggerHook = Arc<dyn Fn() + Send + Sync>;

const NAMESPACE: &str = "console";

pub struct ConsoleChannel {
    me: Weak<ConsoleChannel>,
    buffer: Mutex<VecDeque<LogEntry>>,
    triggers: RwLock<Vec<LogLevel>>,
    retention: RwLock<RetentionWindow>,
    capture_errors: AtomicBool,
    report_trigger: RwLock<Option<TriggerHook>>,
    bus: Arc<EventBus>,
    clock: SharedClock,
    scheduler: SharedScheduler,
    installation: Mutex<Option<Installation>>,
}

struct Installation {
    page: Arc<PageEnvironment>,
    console: Patch<dyn ConsoleApi>,
    listeners: Vec<ListenerId>,
}

impl ConsoleChannel {
    pub fn new(bus: Arc<EventBus>, clock: SharedClock, scheduler: SharedScheduler) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            buffer: Mutex::new(VecDeque::new()),
            triggers: RwLock::new(Vec::new()),
            retention: RwLock::new(RetentionWindow::default()),
            capture_errors: AtomicBool::new(true),
            report_trigger: RwLock::new(None),
            bus,
            clock,
            scheduler,
            installation: Mutex::new(None),
        })
    }

    /// Console levels that schedule a report when called
    pub fn set_auto_report_triggers(&self, levels: impl IntoIterator<Item = LogLevel>) {
        *self.triggers.write() = levels.into_iter().collect();
    }

    pub fn triggers(&self) -> Vec<LogLevel> {
        self.triggers.read().clone()
    }

    /// Retention in minutes, clamped to at least one
    pub fn set_retention(&self, minutes: u64) {
        *self.retention.write() = RetentionWindow::from_minutes(minutes);
    }

    pub fn retention(&self) -> RetentionWindow {
        *self.retention.read()
    }

    /// Whether `install` registers the uncaught error, rejection and
    /// resource-failure listeners. Takes effect on the next install.
    pub fn set_error_capture(&self, enabled: bool) {
        self.capture_errors.store(enabled, Ordering::Release);
    }

    /// Hook run [`REPORT_DELAY`] after each trigger-level console call
    pub fn set_report_trigger(&self, hook: TriggerHook) {
        *self.report_trigger.write() = Some(hook);
    }

    /// Copy of the buffer in insertion order
    pub fn get_all(&self) -> Vec<LogEntry> {
        self.buffer.lock().iter().cloned().collect()
    }

    /// Drop entries older than the retention window; returns how many went
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

    fn capture_call(&self, level: LogLevel, args: &[Value]) {
        self.record(LogEntry {
            id: new_id(),
            timestamp: self.clock.now(),
            method: level,
            args: args.to_vec(),
            stack: capture_stack(),
            origin: LogOrigin::Console,
        });

        if self.triggers.read().contains(&level) {
            self.schedule_report(level);
        }
    }

    fn schedule_report(&self, level: LogLevel) {
        let channel = self.me.clone();
        debug!(channel = NAMESPACE, %level, "scheduling triggered report");
        self.scheduler.schedule(
            REPORT_DELAY,
            Box::new(move || {
                if let Some(channel) = channel.upgrade() {
                    let hook = channel.report_trigger.read().clone();
                    if let Some(hook) = hook {
                        hook();
                    }
                }
            }),
        );
    }

    fn record(&self, entry: LogEntry) {
        let level = match entry.method {
            LogLevel::Warn | LogLevel::Error => entry.method,
            _ => LogLevel::Log,
        };
        self.buffer.lock().push_back(entry.clone());
        self.bus.publish(NAMESPACE, level, &entry);
    }

    fn on_host_event(&self, event: &HostEvent) {
        let (method, args, stack, origin) = match event {
            HostEvent::RuntimeError {
                message,
                error,
                stack,
            } => (
                LogLevel::Error,
                vec![Value::String(message.clone()), error.clone()],
                stack.clone().or_else(capture_stack),
                LogOrigin::RuntimeError,
            ),
            HostEvent::UnhandledRejection { reason, stack } => (
                LogLevel::Error,
                vec![
                    Value::String("Unhandled promise rejection".to_string()),
                    reason.clone(),
                ],
                stack.clone().or_else(capture_stack),
                LogOrigin::UnhandledRejection,
            ),
            HostEvent::ResourceError { element } => {
                let markup = element
                    .outer_html
                    .clone()
                    .unwrap_or_else(|| element.tag_name.clone());
                (
                    LogLevel::Error,
                    vec![
                        Value::String(format!("Resource failed to load: {}", element.tag_name)),
                        Value::String(markup),
                    ],
                    None,
                    LogOrigin::RuntimeError,
                )
            }
            HostEvent::VisibilityChange { hidden: true } => (
                LogLevel::Info,
                vec![Value::String("Page hidden".to_string())],
                None,
                LogOrigin::Console,
            ),
            _ => return,
        };

        self.record(LogEntry {
            id: new_id(),
            timestamp: self.clock.now(),
            method,
            args,
            stack,
            origin,
        });
    }

    fn listener(&self) -> Listener {
        let channel = self.me.clone();
        Arc::new(move |event| {
            if let Some(channel) = channel.upgrade() {
                channel.on_host_event(event);
            }
        })
    }
}

impl InterceptionAdapter for ConsoleChannel {
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
        let console = Patch::apply(&page.console, active, move |original| {
            Arc::new(ConsoleInterceptor {
                channel,
                original,
                active: flag,
            }) as Arc<dyn ConsoleApi>
        });

        let mut listeners = Vec::new();
        if self.capture_errors.load(Ordering::Acquire) {
            for (kind, capture) in [
                (HostEventKind::RuntimeError, false),
                (HostEventKind::UnhandledRejection, false),
                (HostEventKind::ResourceError, true),
            ] {
                listeners.push(page.window.add_listener(kind, capture, self.listener()));
            }
        }
        listeners.push(page.window.add_listener(
            HostEventKind::VisibilityChange,
            false,
            self.listener(),
        ));

        debug!(channel = NAMESPACE, listeners = listeners.len(), "installed");
        *installation = Some(Installation {
            page: page.clone(),
            console,
            listeners,
        });
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        let Some(installation) = self.installation.lock().take() else {
            return Err(SessionLensError::NotInstalled(NAMESPACE));
        };
        installation.console.restore(&installation.page.console);
        for id in installation.listeners {
            installation.page.window.remove_listener(id);
        }
        debug!(channel = NAMESPACE, "uninstalled");
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.installation.lock().is_some()
    }
}

impl std::fmt::Debug for ConsoleChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleChannel")
            .field("entries", &self.len())
            .field("triggers", &*self.triggers.read())
            .field("retention", &self.retention())
            .field("installed", &self.is_installed())
            .finish()
    }
}

struct ConsoleInterceptor {
    channel: Weak<ConsoleChannel>,
    original: Arc<dyn ConsoleApi>,
    active: Arc<AtomicBool>,
}

impl ConsoleApi for ConsoleInterceptor {
    fn call(&self, level: LogLevel, args: &[Value]) {
        if self.active.load(Ordering::Acquire) {
            if let Some(channel) = self.channel.upgrade() {
                channel.capture_call(level, args);
            }
        }
        self.original.call(level, args);
    }
}

/// Best-effort stack of the current call; `None` when backtraces are
/// disabled or capturing fails.
fn capture_stack() -> Option<String> {
    catch_unwind(|| {
        let trace = Backtrace::capture();
        match trace.status() {
            BacktraceStatus::Captured => Some(trace.to_string()),
            _ => None,
        }
    })
    .ok()
    .flatten()
}
