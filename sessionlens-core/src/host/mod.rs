//! Host page model
//!
//! The page's global entry points (console, fetch, the legacy request object)
//! live in [`GlobalSlot`]s. Application code always calls through the slot,
//! so an interception adapter can install itself by taking the current value
//! as its *original* and putting a wrapper in its place, and uninstall by
//! putting the original back.
//!
//! # Example
//!
//! ```rust,ignore
//! let page = PageEnvironment::builder()
//!     .console(Arc::new(StdoutConsole))
//!     .fetch(Arc::new(ReqwestFetch::new()))
//!     .url("https://app.example.com/checkout")
//!     .build();
//!
//! page.console().call(LogLevel::Warn, &[json!("low disk")]);
//! let response = page.fetch(FetchRequest::get("https://api.example.com")).await?;
//! ```

mod events;
mod http;

pub use events::{ElementInfo, EventTarget, HostEvent, HostEventKind, Listener, ListenerId};
pub use http::{
    FetchApi, FetchError, FetchRequest, FetchResponse, LegacyRequest, LegacyRequestFactory,
    LoadEndListener, ReqwestFetch, ReqwestLegacyRequests, UnavailableFetch,
};

use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::session::SessionReport;
use crate::types::LogLevel;

/// Replaceable global entry point
pub struct GlobalSlot<T: ?Sized> {
    current: RwLock<Arc<T>>,
}

impl<T: ?Sized> GlobalSlot<T> {
    pub fn new(initial: Arc<T>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Implementation callers currently reach
    pub fn get(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Swap in `next`, returning what was there before
    pub fn replace(&self, next: Arc<T>) -> Arc<T> {
        std::mem::replace(&mut *self.current.write(), next)
    }

    /// Whether the slot currently holds exactly `candidate`
    pub fn is(&self, candidate: &Arc<T>) -> bool {
        Arc::ptr_eq(&*self.current.read(), candidate)
    }
}

impl<T: ?Sized> fmt::Debug for GlobalSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalSlot").finish_non_exhaustive()
    }
}

/// The page's console object
pub trait ConsoleApi: Send + Sync {
    fn call(&self, level: LogLevel, args: &[Value]);
}

/// Console that discards output
#[derive(Debug, Clone, Copy, Default)]
pub struct NullConsole;

impl ConsoleApi for NullConsole {
    fn call(&self, _level: LogLevel, _args: &[Value]) {}
}

/// Console writing `args` space-separated, warnings and errors to stderr
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutConsole;

impl ConsoleApi for StdoutConsole {
    fn call(&self, level: LogLevel, args: &[Value]) {
        let line = args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        match level {
            LogLevel::Warn | LogLevel::Error => eprintln!("{line}"),
            _ => println!("{line}"),
        }
    }
}

/// Manual report entry point installed on the page
pub type ReportHook = Arc<dyn Fn() -> Option<SessionReport> + Send + Sync>;

/// Everything the capture channels intercept or listen to
pub struct PageEnvironment {
    pub console: GlobalSlot<dyn ConsoleApi>,
    pub fetch: GlobalSlot<dyn FetchApi>,
    pub legacy_requests: GlobalSlot<dyn LegacyRequestFactory>,
    /// Window-level event target for DOM and error events
    pub window: EventTarget,
    user_agent: Option<String>,
    url: RwLock<Option<String>>,
    report_hook: RwLock<Option<ReportHook>>,
}

impl PageEnvironment {
    pub fn builder() -> PageEnvironmentBuilder {
        PageEnvironmentBuilder::default()
    }

    /// Current console implementation
    pub fn console(&self) -> Arc<dyn ConsoleApi> {
        self.console.get()
    }

    /// Issue a request through the current fetch implementation
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let fetch = self.fetch.get();
        fetch.fetch(request).await
    }

    /// Construct a request object through the current factory
    pub fn new_legacy_request(&self) -> Box<dyn LegacyRequest> {
        self.legacy_requests.get().create()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn url(&self) -> Option<String> {
        self.url.read().clone()
    }

    /// Record a navigation
    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.write() = Some(url.into());
    }

    pub fn install_report_hook(&self, hook: ReportHook) {
        *self.report_hook.write() = Some(hook);
    }

    pub fn remove_report_hook(&self) {
        self.report_hook.write().take();
    }

    /// Invoke the manual report hook, if one is installed
    pub fn report_session(&self) -> Option<SessionReport> {
        let hook = self.report_hook.read().clone();
        hook.and_then(|hook| hook())
    }
}

impl fmt::Debug for PageEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEnvironment")
            .field("user_agent", &self.user_agent)
            .field("url", &*self.url.read())
            .field("report_hook", &self.report_hook.read().is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`PageEnvironment`]
#[derive(Default)]
pub struct PageEnvironmentBuilder {
    console: Option<Arc<dyn ConsoleApi>>,
    fetch: Option<Arc<dyn FetchApi>>,
    legacy_requests: Option<Arc<dyn LegacyRequestFactory>>,
    user_agent: Option<String>,
    url: Option<String>,
}

impl PageEnvironmentBuilder {
    pub fn console(mut self, console: Arc<dyn ConsoleApi>) -> Self {
        self.console = Some(console);
        self
    }

    pub fn fetch(mut self, fetch: Arc<dyn FetchApi>) -> Self {
        self.fetch = Some(fetch);
        self
    }

    pub fn legacy_requests(mut self, factory: Arc<dyn LegacyRequestFactory>) -> Self {
        self.legacy_requests = Some(factory);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Build the page; unset entry points default to a silent console,
    /// a fetch that always fails, and reqwest-backed request objects.
    pub fn build(self) -> PageEnvironment {
        PageEnvironment {
            console: GlobalSlot::new(
                self.console
                    .unwrap_or_else(|| Arc::new(NullConsole) as Arc<dyn ConsoleApi>),
            ),
            fetch: GlobalSlot::new(
                self.fetch
                    .unwrap_or_else(|| Arc::new(UnavailableFetch) as Arc<dyn FetchApi>),
            ),
            legacy_requests: GlobalSlot::new(self.legacy_requests.unwrap_or_else(|| {
                Arc::new(ReqwestLegacyRequests::default()) as Arc<dyn LegacyRequestFactory>
            })),
            window: EventTarget::new(),
            user_agent: self.user_agent,
            url: RwLock::new(self.url),
            report_hook: RwLock::new(None),
        }
    }
}
