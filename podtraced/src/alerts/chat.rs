//! Chat-webhook sink (Slack-style attachments payload).

use std::time::Duration;

use anyhow::Context;
use reqwest::Url;
use reqwest::header::CONTENT_TYPE;

use super::webhook::http_client;
use super::{Alert, Severity};

/// Substring the webhook host must carry; chat webhooks are only ever issued
/// under the provider's own domain.
pub const PROVIDER_HOST: &str = "slack.com";

const COLOR_DANGER: &str = "danger";
const COLOR_WARNING: &str = "warning";

pub struct ChatSink {
    url: Url,
    channel: String,
    client: reqwest::Client,
}

#[derive(Debug, serde::Serialize)]
struct ChatPayload {
    channel: String,
    attachments: Vec<Attachment>,
}

#[derive(Debug, serde::Serialize)]
struct Attachment {
    color: &'static str,
    title: String,
    text: String,
    fields: Vec<Field>,
    footer: &'static str,
    ts: i64,
    mrkdwn_in: [&'static str; 2],
}

#[derive(Debug, serde::Serialize)]
struct Field {
    title: &'static str,
    value: String,
    short: bool,
}

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Fatal | Severity::Critical => COLOR_DANGER,
        Severity::Warning | Severity::Error => COLOR_WARNING,
    }
}

impl ChatSink {
    pub fn new(url: &str, channel: &str, timeout: Duration) -> anyhow::Result<ChatSink> {
        let url = Url::parse(url).with_context(|| format!("invalid chat webhook url {url:?}"))?;
        if url.scheme() != "https" {
            anyhow::bail!("chat webhook must use https");
        }
        let host = url.host_str().unwrap_or("");
        if !host.contains(PROVIDER_HOST) {
            anyhow::bail!("chat webhook host {host:?} does not look like {PROVIDER_HOST}");
        }
        Ok(ChatSink {
            url,
            channel: channel.to_string(),
            client: http_client(timeout)?,
        })
    }

    fn payload(&self, alert: &Alert) -> ChatPayload {
        let mut fields = vec![
            Field {
                title: "Severity",
                value: alert.severity.to_string(),
                short: true,
            },
            Field {
                title: "Source",
                value: alert.source.clone(),
                short: true,
            },
            Field {
                title: "Pod",
                value: alert.pod_name.clone(),
                short: true,
            },
            Field {
                title: "Namespace",
                value: alert.namespace.clone(),
                short: true,
            },
        ];
        if !alert.error_code.is_empty() {
            fields.push(Field {
                title: "Error",
                value: alert.error_code.clone(),
                short: true,
            });
        }
        if !alert.recommendations.is_empty() {
            fields.push(Field {
                title: "Recommendations",
                value: alert
                    .recommendations
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n"),
                short: false,
            });
        }

        ChatPayload {
            channel: self.channel.clone(),
            attachments: vec![Attachment {
                color: severity_color(alert.severity),
                title: alert.title.clone(),
                text: alert.message.clone(),
                fields,
                footer: "Podtrace",
                ts: alert.timestamp.timestamp(),
                mrkdwn_in: ["text", "fields"],
            }],
        }
    }
}

#[async_trait::async_trait]
impl super::AlertSink for ChatSink {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&self.payload(alert))
            .send()
            .await
            .context("send chat webhook")?;

        // The provider answers exactly 200 with "ok"; anything else (including
        // other 2xx) means the message did not post.
        let status = response.status();
        if status.as_u16() != 200 {
            anyhow::bail!("chat webhook returned {status}");
        }
        Ok(())
    }
}
