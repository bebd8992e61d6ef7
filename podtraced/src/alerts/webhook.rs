//! Generic JSON webhook sink.

use std::time::Duration;

use anyhow::Context;
use reqwest::Url;
use reqwest::header::CONTENT_TYPE;

use super::Alert;

/// POSTs each alert as a flat JSON document. Plain `http` is refused except
/// toward loopback hosts, and oversized payloads are rejected before any
/// request goes out.
pub struct WebhookSink {
    url: Url,
    client: reqwest::Client,
    max_payload: usize,
}

#[derive(Debug, serde::Serialize)]
struct WebhookPayload<'a> {
    severity: &'a str,
    title: &'a str,
    message: &'a str,
    timestamp: String,
    source: &'a str,
    pod: &'a str,
    namespace: &'a str,
    context: &'a serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recommendations: Option<&'a [String]>,
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
}

pub(crate) fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("Podtrace/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build http client")
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration, max_payload: usize) -> anyhow::Result<WebhookSink> {
        let url = Url::parse(url).with_context(|| format!("invalid webhook url {url:?}"))?;
        match url.scheme() {
            "https" => {}
            "http" => {
                let host = url.host_str().unwrap_or("");
                if !is_loopback_host(host) {
                    anyhow::bail!("plain http webhook refused for non-local host {host:?}");
                }
            }
            other => anyhow::bail!("unsupported webhook scheme {other:?}"),
        }
        Ok(WebhookSink {
            url,
            client: http_client(timeout)?,
            max_payload,
        })
    }

    fn payload<'a>(alert: &'a Alert) -> WebhookPayload<'a> {
        WebhookPayload {
            severity: alert.severity.as_str(),
            title: &alert.title,
            message: &alert.message,
            timestamp: alert.timestamp.to_rfc3339(),
            source: &alert.source,
            pod: &alert.pod_name,
            namespace: &alert.namespace,
            context: &alert.context,
            error_code: (!alert.error_code.is_empty()).then_some(alert.error_code.as_str()),
            recommendations: (!alert.recommendations.is_empty())
                .then_some(alert.recommendations.as_slice()),
        }
    }
}

#[async_trait::async_trait]
impl super::AlertSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let body = serde_json::to_vec(&Self::payload(alert))?;
        if body.len() > self.max_payload {
            anyhow::bail!(
                "webhook payload {} bytes exceeds limit {}",
                body.len(),
                self.max_payload
            );
        }

        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .context("send webhook request")?;

        let status = response.status();
        if !(200..300).contains(&status.as_u16()) {
            anyhow::bail!("webhook returned {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Alert, AlertSink, DEFAULT_MAX_PAYLOAD, Severity};
    use super::*;
    use httpmock::prelude::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn alert() -> Alert {
        let mut a = Alert::new(Severity::Critical, "memory pressure", "rss at 93%", "resource_monitor");
        a.pod_name = "web-0".to_string();
        a.namespace = "prod".to_string();
        a
    }

    #[test]
    fn url_policy() {
        assert!(WebhookSink::new("http://example.com/hook", TIMEOUT, DEFAULT_MAX_PAYLOAD).is_err());
        assert!(WebhookSink::new("ftp://example.com/hook", TIMEOUT, DEFAULT_MAX_PAYLOAD).is_err());
        assert!(WebhookSink::new("not a url", TIMEOUT, DEFAULT_MAX_PAYLOAD).is_err());
        assert!(
            WebhookSink::new("http://localhost:8080/hook", TIMEOUT, DEFAULT_MAX_PAYLOAD).is_ok()
        );
        assert!(
            WebhookSink::new("http://127.0.0.1:8080/hook", TIMEOUT, DEFAULT_MAX_PAYLOAD).is_ok()
        );
        assert!(WebhookSink::new("http://[::1]:8080/hook", TIMEOUT, DEFAULT_MAX_PAYLOAD).is_ok());
        assert!(
            WebhookSink::new("https://example.com/hook", TIMEOUT, DEFAULT_MAX_PAYLOAD).is_ok()
        );
    }

    #[test]
    fn payload_shape() {
        let mut a = alert();
        a.error_code = "ENOMEM".to_string();
        a.recommendations = vec!["Check for resource leaks".to_string()];

        let value = serde_json::to_value(WebhookSink::payload(&a)).unwrap();
        assert_eq!(value["severity"], "critical");
        assert_eq!(value["title"], "memory pressure");
        assert_eq!(value["pod"], "web-0");
        assert_eq!(value["namespace"], "prod");
        assert_eq!(value["error_code"], "ENOMEM");
        assert!(value["timestamp"].as_str().unwrap().contains('T'));

        // Optional fields disappear when empty.
        let bare = serde_json::to_value(WebhookSink::payload(&alert())).unwrap();
        assert!(bare.get("error_code").is_none());
        assert!(bare.get("recommendations").is_none());
    }

    #[tokio::test]
    async fn delivers_to_local_endpoint() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .header("content-type", "application/json")
                    .header("user-agent", concat!("Podtrace/", env!("CARGO_PKG_VERSION")))
                    .json_body_partial(r#"{"severity":"critical","pod":"web-0"}"#);
                then.status(204);
            })
            .await;

        let sink =
            WebhookSink::new(&server.url("/hook"), TIMEOUT, DEFAULT_MAX_PAYLOAD).unwrap();
        sink.deliver(&alert()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_2xx_status_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(500);
            })
            .await;

        let sink =
            WebhookSink::new(&server.url("/hook"), TIMEOUT, DEFAULT_MAX_PAYLOAD).unwrap();
        let err = sink.deliver(&alert()).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn oversized_payload_is_refused_before_sending() {
        let sink = WebhookSink::new("http://localhost:9/hook", TIMEOUT, 64).unwrap();
        let mut big = alert();
        big.message = "x".repeat(512);
        let err = sink.deliver(&big).await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }
}
