//! MQTT feed driving the shadow projection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::state::{ShadowState, ValueSource};
use crate::{ShadowError, ShadowResult};

/// Produces a full `(submodel → path → value)` snapshot over HTTP.
///
/// Implemented by the twin client; stubbed in tests.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetches the complete projection.
    async fn snapshot(&self) -> ShadowResult<HashMap<String, HashMap<String, Value>>>;
}

/// Connection settings for the shadow feed.
#[derive(Clone, Debug)]
pub struct MqttFeedConfig {
    host: String,
    port: u16,
    client_id: String,
    repo_id: String,
    aas_id: String,
    keep_alive: Duration,
    reconnect_delay: Duration,
}

impl MqttFeedConfig {
    /// Creates a configuration for the given broker and twin identity.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        repo_id: impl Into<String>,
        aas_id: impl Into<String>,
    ) -> Self {
        let repo_id = repo_id.into();
        let aas_id = aas_id.into();
        Self {
            host: host.into(),
            port,
            client_id: format!("twinops-shadow-{repo_id}-{aas_id}"),
            repo_id,
            aas_id,
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
        }
    }

    /// Overrides the MQTT client identifier.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Sets the keep-alive interval.
    #[must_use]
    pub const fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the subscription filter for this twin.
    #[must_use]
    pub fn topic_filter(&self) -> String {
        format!("twinops/{}/{}/+/#", self.repo_id, self.aas_id)
    }
}

/// Background task pumping MQTT deliveries into a [`ShadowState`].
pub struct MqttFeed;

impl MqttFeed {
    /// Spawns the feed loop.
    ///
    /// On every (re)connect the feed subscribes with a persistent session
    /// and then reseeds the projection from `snapshot`, so values published
    /// while the connection was down are recovered. Connection errors back
    /// off and retry; the loop runs until the task is aborted.
    #[must_use]
    pub fn spawn(
        state: Arc<ShadowState>,
        snapshot: Arc<dyn SnapshotSource>,
        config: MqttFeedConfig,
    ) -> JoinHandle<()> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(false);

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let filter = config.topic_filter();

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(filter = %filter, "shadow feed connected");
                        if let Err(err) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                            warn!(error = %err, "shadow subscribe failed");
                            continue;
                        }
                        match snapshot.snapshot().await {
                            Ok(full) => {
                                state.apply_snapshot(full);
                                debug!("shadow reseeded after connect");
                            }
                            Err(err) => warn!(error = %err, "shadow reseed failed"),
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_publish(&state, &config, &publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "shadow feed connection error");
                        tokio::time::sleep(config.reconnect_delay).await;
                    }
                }
            }
        })
    }
}

fn handle_publish(state: &ShadowState, config: &MqttFeedConfig, topic: &str, payload: &[u8]) {
    let Some((submodel, path)) = parse_topic(&config.repo_id, &config.aas_id, topic) else {
        debug!(topic, "ignoring publish outside the twin namespace");
        return;
    };
    match parse_payload(payload) {
        Ok((value, timestamp)) => {
            state.apply_update(&submodel, &path, value, timestamp, ValueSource::Mqtt);
        }
        Err(err) => warn!(topic, error = %err, "undecodable shadow payload"),
    }
}

/// Splits `twinops/{repo}/{aas}/{submodel}/{path…}` into submodel and path.
///
/// Returns `None` for topics outside this twin's namespace or without a
/// path segment.
fn parse_topic(repo_id: &str, aas_id: &str, topic: &str) -> Option<(String, String)> {
    let mut parts = topic.splitn(5, '/');
    if parts.next() != Some("twinops") || parts.next() != Some(repo_id) || parts.next() != Some(aas_id)
    {
        return None;
    }
    let submodel = parts.next()?;
    let path = parts.next()?;
    if submodel.is_empty() || path.is_empty() {
        return None;
    }
    Some((submodel.to_owned(), path.to_owned()))
}

/// Decodes a publish payload into `(value, embedded_timestamp)`.
///
/// Payloads are either the bare JSON value or an envelope
/// `{"value": …, "timestamp": <epoch millis>}`.
fn parse_payload(payload: &[u8]) -> ShadowResult<(Value, Option<i64>)> {
    let decoded: Value = serde_json::from_slice(payload).map_err(|err| ShadowError::Feed {
        reason: format!("payload is not JSON: {err}"),
    })?;

    if let Value::Object(object) = &decoded {
        if let Some(value) = object.get("value") {
            let timestamp = object.get("timestamp").and_then(Value::as_i64);
            return Ok((value.clone(), timestamp));
        }
    }

    Ok((decoded, None))
}
