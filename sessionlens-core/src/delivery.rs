//! Report delivery: the collector wire format and the transport that posts it

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::iso_millis;
use crate::error::Result;
use crate::session::SessionReport;
use crate::types::{LogEntry, UserInfo};
use chrono::{DateTime, Utc};

/// JSON body posted to the report endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    /// Session id
    pub id: String,
    /// Report creation time
    pub timestamp: String,
    /// Trigger reason
    #[serde(rename = "type")]
    pub kind: String,
    pub duration: u64,
    pub console_logs: Vec<LogEntry>,
    pub network_logs: Vec<WireNetworkEntry>,
    pub dom_events: Vec<WireDomEvent>,
    pub rrweb_events: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireNetworkEntry {
    pub id: String,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    /// Adapter that produced the entry (`fetch`, `xhr`, `network`)
    pub source: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDomEvent {
    pub id: String,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    pub data: WireDomData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDomData {
    pub text: String,
}

impl DeliveryPayload {
    /// Map a report onto the wire format, adding page context
    pub fn from_report(report: &SessionReport, user_agent: Option<String>, url: Option<String>) -> Self {
        Self {
            id: report.session_id.clone(),
            timestamp: report.created_at.clone(),
            kind: report.trigger.clone(),
            duration: 0,
            console_logs: report.console.clone(),
            network_logs: report
                .network
                .iter()
                .map(|entry| WireNetworkEntry {
                    id: entry.id.clone(),
                    timestamp: entry.timestamp,
                    source: entry.origin.as_str().to_string(),
                    method: entry.method.clone(),
                    url: entry.url.clone(),
                    status: entry.status,
                    duration_ms: entry.duration,
                })
                .collect(),
            dom_events: report
                .dom
                .iter()
                .map(|entry| WireDomEvent {
                    id: entry.id.clone(),
                    timestamp: entry.timestamp,
                    kind: entry.event.as_str().to_string(),
                    target: entry.target.clone(),
                    data: WireDomData {
                        text: entry.text.clone(),
                    },
                })
                .collect(),
            rrweb_events: report.rrweb.iter().map(|frame| frame.event.clone()).collect(),
            user_agent,
            url,
            user: report.user.clone(),
        }
    }
}

/// Posts delivery payloads to a collector
#[async_trait]
pub trait ReportTransport: Send + Sync + std::fmt::Debug {
    /// POST `payload` as JSON and return the response status
    async fn post_json(&self, endpoint: &str, payload: &DeliveryPayload) -> Result<u16>;
}

/// Transport backed by reqwest
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReportTransport for HttpTransport {
    async fn post_json(&self, endpoint: &str, payload: &DeliveryPayload) -> Result<u16> {
        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}
