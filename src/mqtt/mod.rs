pub mod internal_commands;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::RwLock;

use crate::config::MqttConfig;
use crate::models::CommState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MqttConnectionStatus {
    Connected,
    Disconnected,
    Error(String),
}

#[derive(Clone)]
pub struct MqttHealthStatus {
    pub status: MqttConnectionStatus,
    pub last_connected: Option<Instant>,
    pub last_message_sent: Option<Instant>,
    pub last_message_received: Option<Instant>,
    pub connection_attempts: u64,
}

#[derive(Clone)]
pub struct AppStatus {
    pub start_time: Instant,
    pub mqtt_health: MqttHealthStatus,
}

impl MqttHealthStatus {
    pub fn new() -> Self {
        Self {
            status: MqttConnectionStatus::Disconnected,
            last_connected: None,
            last_message_sent: None,
            last_message_received: None,
            connection_attempts: 0,
        }
    }
}

impl AppStatus {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_health: MqttHealthStatus::new(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Committed state of one device as published on `<base>/<name>/state`
#[derive(Debug, Clone, Serialize)]
pub struct StateData {
    #[serde(skip)]
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub stale: bool,
    pub comm: CommState,
    pub values: serde_json::Map<String, serde_json::Value>,
}

pub struct PublishData {
    /// Relative to the base topic
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

pub struct SubscribeData {
    /// Relative to the base topic
    pub topic: String,
    pub sender: Sender<String>,
}

pub enum Transmission {
    State(StateData),
    Subscribe(SubscribeData),
    Publish(PublishData),
}

pub struct Callbacks {
    calls: HashMap<String, Vec<Sender<String>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Callbacks { calls: HashMap::new() }
    }

    pub fn insert(&mut self, topic: String, callback: Sender<String>) {
        debug!("Adding callback for {topic}");
        self.calls.entry(topic).or_default().push(callback);
    }

    pub async fn send(&self, topic: &str, payload: String) {
        let Some(calls) = self.calls.get(topic) else {
            debug!("Send for unknown topic {topic}");
            return;
        };

        for call in calls {
            if call.send(payload.clone()).await.is_err() {
                warn!("Callback for {topic} is gone");
            }
        }
    }

    pub fn get_topics(&self) -> Vec<String> {
        self.calls.keys().cloned().collect()
    }
}

lazy_static! {
    pub static ref CALLBACKS: RwLock<Callbacks> = RwLock::new(Callbacks::new());
    pub static ref APP_STATUS: RwLock<AppStatus> = RwLock::new(AppStatus::new());
}

fn qos_from(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

pub fn state_topic(base: &str, name: &str) -> String {
    format!("{base}/{name}/state")
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    client: AsyncClient,
    base_topic: String,
}

impl MqttManager {
    pub fn new(config: &MqttConfig) -> (Self, Sender<Transmission>) {
        let (mtx, mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        let reconnect_c = client.clone();
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let payload = String::from_utf8_lossy(&p.payload).to_string();
                        debug!("Received {payload:?} on {}", p.topic);
                        APP_STATUS.write().await.mqtt_health.last_message_received = Some(Instant::now());
                        CALLBACKS.read().await.send(&p.topic, payload).await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, resubscribing everything");
                        {
                            let mut status = APP_STATUS.write().await;
                            status.mqtt_health.status = MqttConnectionStatus::Connected;
                            status.mqtt_health.last_connected = Some(Instant::now());
                            status.mqtt_health.connection_attempts += 1;
                        }

                        let topics = CALLBACKS.read().await.get_topics();
                        for topic in topics {
                            let client_clone = reconnect_c.clone();
                            tokio::spawn(async move {
                                if let Err(e) = client_clone.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                                    error!("Resubscribing {topic} failed: {e}");
                                }
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting", e);
                        APP_STATUS.write().await.mqtt_health.status = MqttConnectionStatus::Error(e.to_string());
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (
            MqttManager {
                client,
                rx: mrx,
                base_topic: config.base_topic.clone(),
            },
            mtx,
        )
    }

    async fn publish(&self, topic: String, qos: QoS, retain: bool, payload: String) {
        match self.client.publish(topic.clone(), qos, retain, payload).await {
            Err(e) => error!("Error publishing to {topic}: {e}"),
            Ok(_) => {
                debug!("Published {topic}");
                APP_STATUS.write().await.mqtt_health.last_message_sent = Some(Instant::now());
            }
        }
    }

    pub async fn start_thread(&mut self) {
        while let Some(transmission) = self.rx.recv().await {
            match transmission {
                Transmission::State(data) => {
                    let payload = match serde_json::to_string(&data) {
                        Ok(p) => p,
                        Err(e) => {
                            error!("Unable to serialize state of {}: {e}", data.name);
                            continue;
                        }
                    };
                    self.publish(state_topic(&self.base_topic, &data.name), QoS::AtLeastOnce, true, payload).await;
                }
                Transmission::Subscribe(subscribe_data) => {
                    let topic = format!("{}/{}", self.base_topic, subscribe_data.topic);
                    match self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                        Ok(_) => {
                            CALLBACKS.write().await.insert(topic.clone(), subscribe_data.sender);
                            info!("Registered Callback {topic}");
                        }
                        Err(e) => error!("Subscribing {topic} failed: {e}"),
                    }
                }
                Transmission::Publish(publish_data) => {
                    let topic = format!("{}/{}", self.base_topic, publish_data.topic);
                    self.publish(topic, qos_from(publish_data.qos), publish_data.retain, publish_data.payload).await;
                }
            }
        }

        info!("All publishers are gone, MQTT manager exits");
    }
}

pub async fn get_mqtt_health_status() -> MqttHealthStatus {
    APP_STATUS.read().await.mqtt_health.clone()
}

pub async fn publish_uptime(mqtt_sender: &Sender<Transmission>, name: &str) {
    let uptime = APP_STATUS.read().await.uptime_seconds();
    let uptime_publish = PublishData {
        topic: format!("{name}/uptime"),
        payload: uptime.to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(uptime_publish)).await;
}
