//! SIEM (HTTP event collector) sink.

use std::time::Duration;

use anyhow::Context;
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

use super::Alert;
use super::webhook::http_client;

const SOURCETYPE: &str = "Podtrace:alert";
/// Context keys longer than this are dropped rather than truncated; a
/// mangled key is worse than an absent one in downstream searches.
const MAX_CONTEXT_KEY: usize = 64;

pub struct SiemSink {
    endpoint: Url,
    token: String,
    client: reqwest::Client,
}

#[derive(Debug, serde::Serialize)]
struct SiemPayload {
    time: i64,
    sourcetype: &'static str,
    event: serde_json::Map<String, serde_json::Value>,
}

impl SiemSink {
    pub fn new(endpoint: &str, token: &str, timeout: Duration) -> anyhow::Result<SiemSink> {
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("invalid SIEM endpoint {endpoint:?}"))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            anyhow::bail!("unsupported SIEM endpoint scheme {:?}", endpoint.scheme());
        }
        if token.is_empty() {
            anyhow::bail!("empty SIEM token");
        }
        Ok(SiemSink {
            endpoint,
            token: token.to_string(),
            client: http_client(timeout)?,
        })
    }

    fn payload(alert: &Alert) -> SiemPayload {
        let mut event = serde_json::Map::new();
        event.insert("severity".into(), alert.severity.as_str().into());
        event.insert("title".into(), alert.title.clone().into());
        event.insert("message".into(), alert.message.clone().into());
        event.insert("source".into(), alert.source.clone().into());
        event.insert("pod".into(), alert.pod_name.clone().into());
        event.insert("namespace".into(), alert.namespace.clone().into());
        if !alert.error_code.is_empty() {
            event.insert("error_code".into(), alert.error_code.clone().into());
        }
        if !alert.recommendations.is_empty() {
            event.insert(
                "recommendations".into(),
                alert.recommendations.clone().into(),
            );
        }
        for (key, value) in &alert.context {
            if key.len() <= MAX_CONTEXT_KEY && !event.contains_key(key) {
                event.insert(key.clone(), value.clone());
            }
        }

        SiemPayload {
            time: alert.timestamp.timestamp(),
            sourcetype: SOURCETYPE,
            event,
        }
    }
}

#[async_trait::async_trait]
impl super::AlertSink for SiemSink {
    fn name(&self) -> &'static str {
        "siem"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Splunk {}", self.token))
            .json(&Self::payload(alert))
            .send()
            .await
            .context("send SIEM event")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("SIEM endpoint returned {status}");
        }
        Ok(())
    }
}
