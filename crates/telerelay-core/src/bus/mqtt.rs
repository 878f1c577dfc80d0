//! MQTT bus adapter
//!
//! One rumqttc client per process. A background task drives the event loop and fans every
//! incoming publish into a broadcast channel; each `subscribe` call registers the filter with
//! the broker and returns a stream filtered to that topic.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, error, info, warn};

use super::topic;
use super::traits::{BusError, MessageBus, PayloadStream};

const CLIENT_CAPACITY: usize = 64;
const FANOUT_CAPACITY: usize = 256;
const RECONNECT_BACKOFF_SECS: u64 = 5;

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM file with the broker CA; enables TLS when set
    pub ca_cert: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_port() -> u16 {
    8883
}

fn default_client_id() -> String {
    "tg_mqtt_client".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            ca_cert: None,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl MqttConfig {
    fn options(&self) -> Result<MqttOptions, BusError> {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));

        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }

        if let Some(ca_path) = &self.ca_cert {
            let ca = std::fs::read(ca_path)?;
            options.set_transport(Transport::tls(ca, None, None));
        }

        Ok(options)
    }
}

type Delivery = (String, Bytes);

/// Live payload streams per topic filter
#[derive(Default)]
struct FilterRegistry {
    streams: HashMap<String, usize>,
}

impl FilterRegistry {
    fn acquire(&mut self, filter: &str) {
        *self.streams.entry(filter.to_string()).or_insert(0) += 1;
    }

    /// Returns true when the last stream for `filter` went away
    fn release(&mut self, filter: &str) -> bool {
        match self.streams.get_mut(filter) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.streams.remove(filter);
                true
            }
            None => false,
        }
    }

    fn active(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }
}

/// Dropped together with a payload stream; unsubscribes once nothing reads the filter
struct SubscriptionGuard {
    client: AsyncClient,
    filters: Arc<Mutex<FilterRegistry>>,
    filter: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if !self.filters.lock().release(&self.filter) {
            return;
        }
        match self.client.try_unsubscribe(self.filter.as_str()) {
            Ok(()) => info!(topic = %self.filter, "Unsubscribed from MQTT topic"),
            Err(e) => warn!(topic = %self.filter, error = %e, "MQTT unsubscribe failed"),
        }
    }
}

pub struct MqttBus {
    client: AsyncClient,
    deliveries: broadcast::Sender<Delivery>,
    /// Filters to restore after a reconnect (clean sessions drop them broker-side)
    filters: Arc<Mutex<FilterRegistry>>,
    event_loop: JoinHandle<()>,
}

impl MqttBus {
    /// Create the client and start driving its event loop
    ///
    /// The connection itself is established lazily by the event loop; failures there are
    /// logged and retried.
    pub fn connect(config: &MqttConfig) -> Result<Self, BusError> {
        let options = config.options()?;
        let (client, mut event_loop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let (deliveries, _) = broadcast::channel::<Delivery>(FANOUT_CAPACITY);

        let filters = Arc::new(Mutex::new(FilterRegistry::default()));

        let fanout = deliveries.clone();
        let resubscriber = client.clone();
        let known_filters = filters.clone();
        let broker = format!("{}:{}", config.host, config.port);
        let handle = tokio::spawn(async move {
            let mut connected_before = false;
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!(topic = %publish.topic, bytes = publish.payload.len(), "MQTT publish received");
                        // No live subscriptions is not an error
                        let _ = fanout.send((publish.topic.clone(), publish.payload.clone()));
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(broker = %broker, "Connected to MQTT broker");
                        if connected_before {
                            let filters = known_filters.lock().active();
                            for filter in filters {
                                // try_ variant: awaiting here would stall the loop that drains requests
                                if let Err(e) = resubscriber.try_subscribe(&filter, QoS::AtMostOnce) {
                                    warn!(topic = %filter, error = %e, "MQTT resubscribe failed");
                                }
                            }
                        }
                        connected_before = true;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(broker = %broker, error = %e, "MQTT connection error");
                        tokio::time::sleep(Duration::from_secs(RECONNECT_BACKOFF_SECS)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            deliveries,
            filters,
            event_loop: handle,
        })
    }

    /// Disconnect from the broker and stop the event loop
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "MQTT disconnect failed");
        }
        self.event_loop.abort();
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        if !topic::is_valid_topic(topic) {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }

        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        debug!(topic, "Published MQTT message");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BusError> {
        if !topic::is_valid_filter(topic) {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }

        // Receiver first so nothing delivered right after the SUBACK is missed
        let receiver = self.deliveries.subscribe();
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BusError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        info!(topic, "Subscribed to MQTT topic");

        self.filters.lock().acquire(topic);
        let guard = SubscriptionGuard {
            client: self.client.clone(),
            filters: self.filters.clone(),
            filter: topic.to_string(),
        };

        // Captures the whole guard, so it drops with the stream
        Ok(Box::pin(BroadcastStream::new(receiver).filter_map(
            move |item| match item {
                Ok((name, payload)) if topic::matches(&guard.filter, &name) => Some(payload),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(topic = %guard.filter, skipped, "MQTT subscriber lagged, payloads dropped");
                    None
                }
            },
        )))
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}
