use crate::errors::{Result, VigilError};
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::control;
use crate::notifier::{Event, FeedStatus, Notifier, RecordingStatus};
use crate::processing::ModeSwitch;

#[derive(Debug, Clone, Serialize)]
struct StatusPayload<'a> {
    camera_id: &'a str,
    status: FeedStatus,
    timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
struct RecordingPayload<'a> {
    camera_id: &'a str,
    status: RecordingStatus,
    timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
struct SavedPayload<'a> {
    camera_id: &'a str,
    recording_id: i64,
    file_path: &'a str,
}

pub struct MqttPublisher {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let url = url::Url::parse(&config.broker_url)
            .map_err(|e| VigilError::mqtt(format!("Invalid MQTT broker URL '{}': {}", config.broker_url, e)))?;

        let host = url.host_str()
            .ok_or_else(|| VigilError::mqtt(format!("No host found in MQTT broker URL: {}", config.broker_url)))?;

        let port = url.port().unwrap_or(1883);

        info!("Connecting to MQTT broker at {}:{}", host, port);

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let max_packet_size = config.max_packet_size.unwrap_or(268435455);
        mqtt_options.set_max_packet_size(max_packet_size, max_packet_size);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok(Self { client, eventloop, config })
    }

    /// Spawn the connection driver and hand back a notifier bound to it.
    /// Mode commands published to `{base_topic}/mode/set` are applied to `modes`.
    pub fn start(mut self, modes: ModeSwitch) -> MqttNotifier {
        let client = self.client.clone();
        let command_topic = mode_command_topic(&self.config);
        tokio::spawn(async move {
            loop {
                match self.eventloop.poll().await {
                    Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        // Subscriptions do not survive a clean session, renew on every connect
                        if let Err(e) = client.try_subscribe(command_topic.clone(), QoS::AtLeastOnce) {
                            error!("Failed to subscribe to '{}': {}", command_topic, e);
                        }
                    }
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        handle_command(&modes, &command_topic, &publish.topic, &publish.payload);
                    }
                    Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                        warn!("Disconnected from MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        MqttNotifier {
            client: self.client,
            config: self.config,
        }
    }
}

fn mode_command_topic(config: &MqttConfig) -> String {
    format!("{}/mode/set", config.base_topic)
}

fn handle_command(modes: &ModeSwitch, command_topic: &str, topic: &str, payload: &[u8]) -> bool {
    if topic != command_topic {
        debug!("Ignoring MQTT message on '{}'", topic);
        return false;
    }
    match control::parse_mode(payload) {
        Some(mode) => control::apply_mode(modes, mode, "mqtt"),
        None => {
            warn!("Unknown processing mode '{}' on '{}'", String::from_utf8_lossy(payload), topic);
            false
        }
    }
}

#[derive(Clone)]
pub struct MqttNotifier {
    client: AsyncClient,
    config: MqttConfig,
}

impl MqttNotifier {
    fn qos(&self) -> QoS {
        match self.config.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    fn camera_topic(&self, camera_id: &str, suffix: &str) -> String {
        format!("{}/cameras/{}/{}", self.config.base_topic, camera_id, suffix)
    }

    fn publish(&self, topic: String, retain: bool, payload: Vec<u8>) {
        // try_publish never waits; a full request queue drops the message
        if let Err(e) = self.client.try_publish(topic.clone(), self.qos(), retain, payload) {
            debug!("Dropped MQTT message for '{}': {}", topic, e);
        }
    }

    fn publish_json<T: Serialize>(&self, topic: String, retain: bool, payload: &T) {
        match serde_json::to_vec(payload) {
            Ok(bytes) => self.publish(topic, retain, bytes),
            Err(e) => error!("Failed to serialize MQTT payload for '{}': {}", topic, e),
        }
    }
}

impl Notifier for MqttNotifier {
    fn emit(&self, event: Event) {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let topic = self.camera_topic(event.camera_id(), event.topic());

        match &event {
            Event::FeedStatus { camera_id, status } => {
                let payload = StatusPayload { camera_id, status: *status, timestamp };
                self.publish_json(topic, self.config.retain, &payload);
            }
            Event::Recording { camera_id, status } => {
                let payload = RecordingPayload { camera_id, status: *status, timestamp };
                self.publish_json(topic, false, &payload);
            }
            Event::RecordingSaved { camera_id, recording_id, file_path } => {
                let payload = SavedPayload { camera_id, recording_id: *recording_id, file_path };
                self.publish_json(topic, false, &payload);
            }
            Event::Preview { frame, .. } => {
                if self.config.publish_preview.unwrap_or(false) {
                    self.publish(topic, false, frame.data.to_vec());
                }
            }
            Event::DetectionLog(entry) => {
                self.publish_json(topic, false, entry);
            }
        }
    }
}
