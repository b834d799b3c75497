//! MQTT-backed point session
//!
//! Maps the station/point model onto broker topics:
//! - one topic per point: `telemetry/{common_address}/points/{address}`
//! - JSON payload carrying value, cause, quality and send time
//! - client mode publishes, server mode subscribes and dispatches to callbacks

use super::{Cause, Point, PointSession, PointType, PointUpdate, ReceiveHandler};
use crate::config::EndpointConfig;
use crate::error::ProtocolError;
use chrono::{DateTime, Utc};
use gethostname::gethostname;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

const REQUEST_CAPACITY: usize = 64;

/// Which end of the link this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Sends point values
    Client,
    /// Receives point values and runs callbacks
    Server,
}

impl SessionMode {
    fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Client => "client",
            SessionMode::Server => "server",
        }
    }
}

/// Wire format of one point value
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PointMessage {
    common_address: u16,
    address: u32,
    type_id: String,
    value: f64,
    cause: Cause,
    quality: u8,
    timestamp: DateTime<Utc>,
}

struct RegisteredPoint {
    point_type: PointType,
    value: Option<f64>,
    handler: Option<ReceiveHandler>,
}

type PointTable = Arc<RwLock<HashMap<u32, RegisteredPoint>>>;

/// State shared with the background event loop task
struct EventContext {
    common_address: u16,
    client: AsyncClient,
    subscription: Option<String>,
    points: PointTable,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
}

pub struct MqttPointSession {
    mode: SessionMode,
    endpoint: EndpointConfig,
    client_id: String,
    points: PointTable,
    client: Option<AsyncClient>,
    event_task: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
}

impl MqttPointSession {
    pub fn new(mode: SessionMode, endpoint: EndpointConfig) -> Self {
        let host = gethostname().to_string_lossy().to_string();
        let suffix = Uuid::new_v4().simple().to_string();
        let client_id = format!("telemetry-{}-{}-{}", mode.as_str(), host, &suffix[..8]);

        Self {
            mode,
            endpoint,
            client_id,
            points: Arc::new(RwLock::new(HashMap::new())),
            client: None,
            event_task: None,
            running: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client(endpoint: EndpointConfig) -> Self {
        Self::new(SessionMode::Client, endpoint)
    }

    pub fn server(endpoint: EndpointConfig) -> Self {
        Self::new(SessionMode::Server, endpoint)
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn point_count(&self) -> usize {
        self.points.read().len()
    }

    /// Last value seen or sent for a point
    pub fn point_value(&self, address: u32) -> Option<f64> {
        self.points.read().get(&address).and_then(|p| p.value)
    }

    pub fn point_topic(common_address: u16, address: u32) -> String {
        format!("telemetry/{}/points/{}", common_address, address)
    }

    fn topic_filter(&self) -> String {
        format!("telemetry/{}/points/+", self.endpoint.common_address)
    }
}

impl PointSession for MqttPointSession {
    fn common_address(&self) -> u16 {
        self.endpoint.common_address
    }

    fn add_point(&mut self, address: u32, point_type: PointType) -> Result<(), ProtocolError> {
        let mut points = self.points.write();
        if points.contains_key(&address) {
            return Err(ProtocolError::Session(format!(
                "point {} already registered on station {}",
                address, self.endpoint.common_address
            )));
        }
        points.insert(address, RegisteredPoint { point_type, value: None, handler: None });
        debug!("Point added: address={}, type={}", address, point_type.type_id());
        Ok(())
    }

    fn on_receive(&mut self, address: u32, handler: ReceiveHandler) -> Result<(), ProtocolError> {
        let mut points = self.points.write();
        let point = points.get_mut(&address).ok_or(ProtocolError::UnknownPoint(address))?;
        point.handler = Some(handler);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ProtocolError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut options = MqttOptions::new(&self.client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(Duration::from_secs(self.endpoint.keep_alive_secs.max(5)));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let context = EventContext {
            common_address: self.endpoint.common_address,
            client: client.clone(),
            subscription: (self.mode == SessionMode::Server).then(|| self.topic_filter()),
            points: self.points.clone(),
            running: self.running.clone(),
            connected: self.connected.clone(),
        };

        self.running.store(true, Ordering::SeqCst);
        self.event_task = Some(tokio::spawn(drive_event_loop(eventloop, context).in_current_span()));
        self.client = Some(client);

        info!(
            "point session started ({} mode, {}:{}, station {})",
            self.mode.as_str(),
            self.endpoint.host,
            self.endpoint.port,
            self.endpoint.common_address
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ProtocolError> {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        let mut result = Ok(());

        if let Some(client) = self.client.take() {
            if was_running {
                if let Err(e) = client.disconnect().await {
                    result = Err(ProtocolError::Transport(e));
                }
            }
        }

        if let Some(mut task) = self.event_task.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
                warn!("point session event loop did not exit, aborting it");
                task.abort();
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        info!("point session stopped");
        result
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn transmit(&self, point: &Point, cause: Cause) -> Result<(), ProtocolError> {
        let client = match (&self.client, self.is_running()) {
            (Some(client), true) => client,
            _ => return Err(ProtocolError::NotRunning),
        };

        let point_type = self
            .points
            .read()
            .get(&point.address)
            .map(|p| p.point_type)
            .ok_or(ProtocolError::UnknownPoint(point.address))?;

        let message = PointMessage {
            common_address: self.endpoint.common_address,
            address: point.address,
            type_id: point_type.type_id().to_string(),
            value: point.value,
            cause,
            quality: 0,
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_vec(&message)?;

        client
            .publish(
                Self::point_topic(self.endpoint.common_address, point.address),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await?;

        if let Some(entry) = self.points.write().get_mut(&point.address) {
            entry.value = Some(point.value);
        }
        Ok(())
    }
}

async fn drive_event_loop(mut eventloop: EventLoop, context: EventContext) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                context.connected.store(true, Ordering::SeqCst);
                info!("point session connected ({:?})", ack.code);

                // Clean sessions drop subscriptions, so renew on every ConnAck
                if let Some(filter) = &context.subscription {
                    if let Err(e) = context.client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                        error!("failed to subscribe to {}: {}", filter, e);
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                dispatch(&context.points, context.common_address, &publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                context.connected.store(false, Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(e) => {
                context.connected.store(false, Ordering::SeqCst);
                if !context.running.load(Ordering::SeqCst) {
                    debug!("point session event loop closed");
                    break;
                }
                warn!("point session connection error: {}", e);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Route one inbound message to its point's callback
fn dispatch(points: &PointTable, common_address: u16, topic: &str, payload: &[u8]) {
    let message: PointMessage = match serde_json::from_slice(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("dropping malformed point message on {}: {}", topic, e);
            return;
        }
    };

    if message.common_address != common_address {
        debug!("ignoring update for station {} on {}", message.common_address, topic);
        return;
    }

    let (handler, update) = {
        let mut table = points.write();
        let Some(entry) = table.get_mut(&message.address) else {
            debug!("update for unregistered point {}", message.address);
            return;
        };

        let update = PointUpdate {
            common_address: message.common_address,
            address: message.address,
            previous: entry.value,
            value: message.value,
            cause: message.cause,
            quality: message.quality,
            sent_at: message.timestamp,
        };
        entry.value = Some(message.value);
        (entry.handler.clone(), update)
    };

    if let Some(handler) = handler {
        let ack = handler(&update);
        trace!("point {} acknowledged: {:?}", update.address, ack);
    }
}
