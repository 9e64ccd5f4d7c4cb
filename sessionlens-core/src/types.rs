//! Shared data model: captured entries, levels, feature flags and user info

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::retention::Timestamped;

/// Console method / bus level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Trace,
}

impl LogLevel {
    /// Every console method the console channel intercepts
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Log,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a console entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogOrigin {
    Console,
    RuntimeError,
    UnhandledRejection,
}

/// A captured console call or uncaught error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    #[serde(with = "crate::clock::iso_millis")]
    pub timestamp: DateTime<Utc>,
    pub method: LogLevel,
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub origin: LogOrigin,
}

/// Which adapter produced a network entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkOrigin {
    Fetch,
    Xhr,
    Network,
}

impl NetworkOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkOrigin::Fetch => "fetch",
            NetworkOrigin::Xhr => "xhr",
            NetworkOrigin::Network => "network",
        }
    }
}

/// Outcome of one outbound request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub id: String,
    #[serde(with = "crate::clock::iso_millis")]
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub method: String,
    /// HTTP status, `0` when the request failed before a response arrived
    pub status: u16,
    /// Elapsed time in milliseconds
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub origin: NetworkOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomEventKind {
    Click,
    Input,
    Init,
}

impl DomEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomEventKind::Click => "click",
            DomEventKind::Input => "input",
            DomEventKind::Init => "init",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomOrigin {
    Dom,
}

/// A user interaction with the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomEventEntry {
    pub id: String,
    #[serde(with = "crate::clock::iso_millis")]
    pub timestamp: DateTime<Utc>,
    pub event: DomEventKind,
    /// Tag name of the event target
    pub target: String,
    /// At most [`crate::channels::dom::MAX_TEXT_CHARS`] characters of text or input value
    pub text: String,
    pub origin: DomOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayOrigin {
    Rrweb,
}

/// One frame emitted by the external replay recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayFrameEntry {
    pub id: String,
    #[serde(with = "crate::clock::iso_millis")]
    pub timestamp: DateTime<Utc>,
    /// Producer-defined payload, passed through untouched
    pub event: Value,
    pub origin: ReplayOrigin,
}

impl Timestamped for LogEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for NetworkEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for DomEventEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for ReplayFrameEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Runtime capture policy, read on every captured event
///
/// Serialized in camelCase like the rest of the report; the snake_case keys
/// used in configuration files are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    #[serde(default, alias = "capture_network", skip_serializing_if = "Option::is_none")]
    pub capture_network: Option<bool>,
    #[serde(default, alias = "capture_rrweb", skip_serializing_if = "Option::is_none")]
    pub capture_rrweb: Option<bool>,
}

impl FeatureFlags {
    /// Both captures explicitly enabled
    pub fn all_enabled() -> Self {
        Self {
            capture_network: Some(true),
            capture_rrweb: Some(true),
        }
    }

    /// Network capture runs unless explicitly disabled
    pub fn network_enabled(&self) -> bool {
        self.capture_network != Some(false)
    }

    /// Replay capture runs unless explicitly disabled
    pub fn rrweb_enabled(&self) -> bool {
        self.capture_rrweb != Some(false)
    }

    /// Overlay the flags that are set in `other`
    pub fn merge(&mut self, other: FeatureFlags) {
        if other.capture_network.is_some() {
            self.capture_network = other.capture_network;
        }
        if other.capture_rrweb.is_some() {
            self.capture_rrweb = other.capture_rrweb;
        }
    }
}

/// Feature flags shared by reference between the coordinator and channels
pub type SharedFlags = Arc<RwLock<FeatureFlags>>;

/// Identity attached to reports
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Arbitrary extra attributes
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl UserInfo {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}
