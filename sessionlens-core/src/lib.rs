//! # SessionLens - capture-and-report engine for session replay
//!
//! SessionLens watches what a page does around the time something goes wrong
//! and hands it to a collector as one session report:
//! - Console calls, uncaught errors and unhandled rejections
//! - Outbound requests through fetch and the legacy request object
//! - Clicks and input on the page
//! - Frames from an external screen-replay recorder
//!
//! Every channel keeps a bounded buffer (time-windowed, or count-capped for
//! DOM events) and publishes each entry on a shared [`EventBus`](bus::EventBus).
//! Interception never changes what the page's own code observes: return
//! values and errors from the original entry points reach the caller
//! untouched.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sessionlens_core::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let page = Arc::new(
//!         PageEnvironment::builder()
//!             .console(Arc::new(StdoutConsole))
//!             .fetch(Arc::new(ReqwestFetch::new()))
//!             .build(),
//!     );
//!
//!     let tracker = create_tracker()
//!         .with_page(page.clone())
//!         .with_console_auto_reporting([LogLevel::Error])
//!         .with_report_endpoint("https://collector.example.com/api/sessions")
//!         .build()?;
//!
//!     page.console().call(LogLevel::Error, &[json!("payment failed")]);
//!
//!     let report = tracker.report_session();
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Host model** ([`host`]): replaceable global entry points and a window
//!   event target that channels install on
//! - **Channels** ([`channels`]): console, network, DOM and replay capture
//! - **Session** ([`session`]): identity, live feature flags, report assembly
//! - **Delivery** ([`delivery`]): collector wire format and HTTP transport
//! - **Builder** ([`builder`]): fluent assembly of a running [`Tracker`](builder::Tracker)
//!
//! ## Runtime
//!
//! Deferred work (bus observers, triggered reports, delivery) runs on the
//! ambient tokio runtime. Outside a runtime observers are called inline and
//! triggered reports and delivery are skipped.

pub mod builder;
pub mod bus;
pub mod channels;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod host;
pub mod retention;
pub mod scheduler;
pub mod session;
pub mod types;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::builder::{Tracker, TrackerBuilder, create_tracker};
    pub use crate::bus::{BusEvent, EventBus, LogSink, Subscription, TracingSink};
    pub use crate::channels::{
        ConsoleChannel, DomChannel, FrameCallback, InterceptionAdapter, NetworkChannel,
        ReplayChannel, ReplayRecorder, StopHandle,
    };
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock, new_id};
    pub use crate::config::{ReplayOptions, TrackerConfig, TrackerFeatures};
    pub use crate::delivery::{DeliveryPayload, HttpTransport, ReportTransport};
    pub use crate::error::{Result, SessionLensError};
    pub use crate::host::{
        ConsoleApi, ElementInfo, FetchApi, FetchError, FetchRequest, FetchResponse, HostEvent,
        LegacyRequest, LegacyRequestFactory, NullConsole, PageEnvironment, ReqwestFetch,
        ReqwestLegacyRequests, StdoutConsole,
    };
    pub use crate::retention::{RetentionWindow, Timestamped, prune_by_time};
    pub use crate::scheduler::{SharedScheduler, TaskScheduler, TokioScheduler};
    pub use crate::session::{CONSOLE_TRIGGER, MANUAL_TRIGGER, SessionCoordinator, SessionReport};
    pub use crate::types::{
        DomEventEntry, FeatureFlags, LogEntry, LogLevel, LogOrigin, NetworkEntry, NetworkOrigin,
        ReplayFrameEntry, UserInfo,
    };
}
