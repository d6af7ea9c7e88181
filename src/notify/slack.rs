//! Slack notification support via Incoming Webhooks.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    Notifier, PhaseEvent, PhaseEventKind, build_completed_message, build_failed_message,
    build_started_message, should_notify,
};
use crate::crd::UpgradePhase;

/// Structured Slack message for Block Kit rendering.
pub struct SlackMessage {
    pub header: String,
    pub fields: Vec<(String, String)>,
    pub context: String,
}

/// Slack webhook client.
pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    /// Create a new Slack notifier with the given webhook URL.
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Send a Block Kit message to Slack.
    pub async fn send(&self, message: &SlackMessage) -> Result<()> {
        let payload = build_blocks_payload(message);
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("Slack webhook request failed")?;
        if !resp.status().is_success() {
            bail!("Slack webhook returned {}", resp.status());
        }
        Ok(())
    }
}

/// Message for `event`, or `None` when Slack does not report it.
///
/// Only the start of the run is announced: `Started` is sent when preflight
/// begins, after planning has produced the upgrade path.
pub fn message_for(event: &PhaseEvent) -> Option<SlackMessage> {
    let spec = &event.upgrade.spec;
    if !should_notify(spec) {
        return None;
    }
    let name = event.resource_name();
    match event.kind {
        PhaseEventKind::Started if event.phase() == UpgradePhase::PreflightChecking => {
            Some(build_started_message(name, spec, &event.status))
        }
        PhaseEventKind::Started => None,
        PhaseEventKind::Completed => Some(build_completed_message(name, spec, &event.status)),
        PhaseEventKind::Failed => Some(build_failed_message(
            name,
            spec,
            &event.status,
            event.from.as_str(),
        )),
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn notify(&self, event: &PhaseEvent) -> Result<()> {
        let Some(message) = message_for(event) else {
            debug!(
                resource = event.resource_name(),
                phase = %event.phase(),
                "Slack notification not sent for this transition"
            );
            return Ok(());
        };
        self.send(&message).await?;
        info!(
            resource = event.resource_name(),
            header = message.header.as_str(),
            "Slack notification sent"
        );
        Ok(())
    }
}

/// Build a Slack Block Kit payload from a [`SlackMessage`].
fn build_blocks_payload(message: &SlackMessage) -> Value {
    let mut blocks: Vec<Value> = Vec::new();

    // Header block
    blocks.push(json!({
        "type": "header",
        "text": {
            "type": "plain_text",
            "text": message.header,
            "emoji": true
        }
    }));

    // Section with fields (pairs of label/value as mrkdwn)
    if !message.fields.is_empty() {
        let fields: Vec<Value> = message
            .fields
            .iter()
            .map(|(label, value)| {
                json!({
                    "type": "mrkdwn",
                    "text": format!("*{label}*\n{value}")
                })
            })
            .collect();

        // Slack allows max 10 fields per section; split if needed
        for chunk in fields.chunks(10) {
            blocks.push(json!({
                "type": "section",
                "fields": chunk
            }));
        }
    }

    // Divider
    blocks.push(json!({"type": "divider"}));

    // Context block
    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": message.context
        }]
    }));

    // Fallback text for clients that don't support blocks
    let fallback = format!("{}\n{}", message.header, message.context);

    json!({
        "text": fallback,
        "blocks": blocks
    })
}
