//! Periodic delivery of rendered relation lines.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::builder::RelationMetricsBuilder;

/// Where rendered lines go.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn push(&self, lines: &[String]) -> anyhow::Result<()>;
}

/// POSTs the lines as one `text/plain` body.
pub struct HttpPushSink {
    client: reqwest::Client,
    url: String,
}

impl HttpPushSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build relation push client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MetricsSink for HttpPushSink {
    async fn push(&self, lines: &[String]) -> anyhow::Result<()> {
        let mut body = lines.join("\n");
        body.push('\n');
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(body)
            .send()
            .await
            .with_context(|| format!("push relation metrics to {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("relation push to {} returned {status}", self.url);
        }
        Ok(())
    }
}

/// Only reports how many lines would have been sent.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl MetricsSink for LogSink {
    async fn push(&self, lines: &[String]) -> anyhow::Result<()> {
        info!(lines = lines.len(), "relation metrics rendered");
        Ok(())
    }
}

pub struct RelationPusher {
    builder: Arc<RelationMetricsBuilder>,
    sink: Arc<dyn MetricsSink>,
}

impl RelationPusher {
    pub fn new(builder: Arc<RelationMetricsBuilder>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { builder, sink }
    }

    /// Render and push once. Returns the number of lines sent.
    pub async fn push_once(&self) -> anyhow::Result<usize> {
        let lines = self.builder.metrics().await;
        if lines.is_empty() {
            debug!("no relation metrics to push");
            return Ok(0);
        }
        self.sink.push(&lines).await?;
        Ok(lines.len())
    }

    /// Push every `interval` until shutdown, then drop all held infos.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "relation pusher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.push_once().await {
                        Ok(count) => debug!(count, "relation metrics pushed"),
                        Err(e) => warn!(error = %e, "relation metrics push failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("relation pusher shutting down");
                    self.builder.clear_all().await;
                    break;
                }
            }
        }
    }
}
