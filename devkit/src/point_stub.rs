/*!
Mock point session for running both roles without a broker

Records every transmitted value and lets tests push inbound updates through
the registered callbacks. Failure modes (start error, never connecting,
transmit errors, slow transmits, dying mid-run) are opt-in per instance.
Clones share state, so a test keeps one clone and hands the other to the
code under test.
*/

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use telemetry_core::error::ProtocolError;
use telemetry_core::protocol::{
    AckResult, Cause, Point, PointSession, PointType, PointUpdate, ReceiveHandler,
};
use tokio::time::Instant;
use tracing::{debug, info};

/// One value seen by `transmit`
#[derive(Debug, Clone, PartialEq)]
pub struct SentValue {
    pub address: u32,
    pub value: f64,
    pub cause: Cause,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct Behaviour {
    fail_start: bool,
    never_connect: bool,
    transmit_delay: Duration,
    fail_transmit_after: Option<usize>,
}

struct MockPoint {
    point_type: PointType,
    value: Option<f64>,
    handler: Option<ReceiveHandler>,
}

#[derive(Default)]
struct MockState {
    points: HashMap<u32, MockPoint>,
    sent: Vec<SentValue>,
    running: bool,
    connected: bool,
    start_calls: usize,
    stop_calls: usize,
}

#[derive(Clone)]
pub struct MockPointSession {
    common_address: u16,
    behaviour: Behaviour,
    state: Arc<Mutex<MockState>>,
}

impl MockPointSession {
    pub fn new(common_address: u16) -> Self {
        Self {
            common_address,
            behaviour: Behaviour::default(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// `start()` returns an error
    pub fn failing_start(mut self) -> Self {
        self.behaviour.fail_start = true;
        self
    }

    /// `start()` succeeds but the link never comes up
    pub fn never_connecting(mut self) -> Self {
        self.behaviour.never_connect = true;
        self
    }

    /// Every transmit costs this long before it is recorded
    pub fn with_transmit_delay(mut self, delay: Duration) -> Self {
        self.behaviour.transmit_delay = delay;
        self
    }

    /// Transmits fail once `count` values have been recorded
    pub fn failing_transmit_after(mut self, count: usize) -> Self {
        self.behaviour.fail_transmit_after = Some(count);
        self
    }

    pub fn sent(&self) -> Vec<SentValue> {
        self.state.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn registered_points(&self) -> usize {
        self.state.lock().points.len()
    }

    pub fn point_type(&self, address: u32) -> Option<PointType> {
        self.state.lock().points.get(&address).map(|p| p.point_type)
    }

    pub fn point_value(&self, address: u32) -> Option<f64> {
        self.state.lock().points.get(&address).and_then(|p| p.value)
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }

    /// Simulate the transport dying under a running role
    pub fn kill(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.connected = false;
        info!("[MOCK] session killed");
    }

    /// Deliver an inbound update as the real transport would.
    ///
    /// Returns `None` when the point has no callback.
    pub fn simulate_incoming(&self, address: u32, value: f64, cause: Cause) -> Option<AckResult> {
        let (handler, update) = {
            let mut state = self.state.lock();
            let point = state.points.get_mut(&address)?;
            let update = PointUpdate {
                common_address: self.common_address,
                address,
                previous: point.value,
                value,
                cause,
                quality: 0,
                sent_at: chrono::Utc::now(),
            };
            point.value = Some(value);
            (point.handler.clone()?, update)
        };

        // Callbacks run without the state lock, like the real session
        Some(handler(&update))
    }
}

impl Default for MockPointSession {
    fn default() -> Self {
        Self::new(1)
    }
}

impl PointSession for MockPointSession {
    fn common_address(&self) -> u16 {
        self.common_address
    }

    fn add_point(&mut self, address: u32, point_type: PointType) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        if state.points.contains_key(&address) {
            return Err(ProtocolError::Session(format!("point {} already registered", address)));
        }
        state.points.insert(address, MockPoint { point_type, value: None, handler: None });
        Ok(())
    }

    fn on_receive(&mut self, address: u32, handler: ReceiveHandler) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        let point = state.points.get_mut(&address).ok_or(ProtocolError::UnknownPoint(address))?;
        point.handler = Some(handler);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        state.start_calls += 1;
        if self.behaviour.fail_start {
            return Err(ProtocolError::Session("[MOCK] start refused".into()));
        }
        state.running = true;
        state.connected = !self.behaviour.never_connect;
        info!("[MOCK] session started ({} points)", state.points.len());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        state.stop_calls += 1;
        state.running = false;
        state.connected = false;
        info!("[MOCK] session stopped after {} transmissions", state.sent.len());
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn transmit(&self, point: &Point, cause: Cause) -> Result<(), ProtocolError> {
        if !self.behaviour.transmit_delay.is_zero() {
            tokio::time::sleep(self.behaviour.transmit_delay).await;
        }

        let mut state = self.state.lock();
        if !state.running {
            return Err(ProtocolError::NotRunning);
        }
        if self.behaviour.fail_transmit_after.is_some_and(|limit| state.sent.len() >= limit) {
            return Err(ProtocolError::Session("[MOCK] link dropped".into()));
        }

        let entry = state
            .points
            .get_mut(&point.address)
            .ok_or(ProtocolError::UnknownPoint(point.address))?;
        entry.value = Some(point.value);

        state.sent.push(SentValue {
            address: point.address,
            value: point.value,
            cause,
            at: Instant::now(),
        });
        debug!("[MOCK] sent {:.2} to point {}", point.value, point.address);
        Ok(())
    }
}
