//! Point session abstraction
//!
//! The point protocol itself lives outside this crate. Everything here talks
//! to it through [`PointSession`]:
//! - station + point registration (address and type tag)
//! - per-point receive callbacks returning an [`AckResult`]
//! - start/stop and running/connected status
//! - `transmit` of a point value with a cause of transmission

pub mod mqtt;

use crate::error::ProtocolError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

pub use mqtt::{MqttPointSession, SessionMode};

/// Type tag given to a point when it is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointType {
    /// M_ME_NC_1
    MeasuredShortFloat,
    /// M_ME_NB_1
    MeasuredScaled,
    /// C_SE_NC_1
    SetpointShortFloat,
}

impl PointType {
    pub fn type_id(&self) -> &'static str {
        match self {
            PointType::MeasuredShortFloat => "M_ME_NC_1",
            PointType::MeasuredScaled => "M_ME_NB_1",
            PointType::SetpointShortFloat => "C_SE_NC_1",
        }
    }
}

/// Cause of transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    Periodic,
    Spontaneous,
    Request,
    Activation,
    ActivationConfirmation,
    ActivationTermination,
}

impl Cause {
    pub fn code(&self) -> u8 {
        match self {
            Cause::Periodic => 1,
            Cause::Spontaneous => 3,
            Cause::Request => 5,
            Cause::Activation => 6,
            Cause::ActivationConfirmation => 7,
            Cause::ActivationTermination => 10,
        }
    }
}

/// One logical measurement channel
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub address: u32,
    pub point_type: PointType,
    pub value: f64,
}

impl Point {
    pub fn new(address: u32, point_type: PointType) -> Self {
        Self { address, point_type, value: 0.0 }
    }
}

/// Inbound value update handed to receive callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct PointUpdate {
    pub common_address: u16,
    pub address: u32,
    pub previous: Option<f64>,
    pub value: f64,
    pub cause: Cause,
    /// Quality descriptor as assigned by the sender, opaque here
    pub quality: u8,
    pub sent_at: DateTime<Utc>,
}

/// Answer a receive callback gives back to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AckResult {
    Accepted,
}

pub type ReceiveHandler = Arc<dyn Fn(&PointUpdate) -> AckResult + Send + Sync>;

/// Client or server side of a point protocol connection
pub trait PointSession: Send + Sync {
    fn common_address(&self) -> u16;

    fn add_point(&mut self, address: u32, point_type: PointType) -> Result<(), ProtocolError>;

    /// Register the callback run for every inbound update on `address`
    fn on_receive(&mut self, address: u32, handler: ReceiveHandler) -> Result<(), ProtocolError>;

    fn start(&mut self) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    fn stop(&mut self) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    fn is_running(&self) -> bool;

    fn is_connected(&self) -> bool;

    fn transmit(&self, point: &Point, cause: Cause) -> impl Future<Output = Result<(), ProtocolError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_codes() {
        assert_eq!(Cause::Periodic.code(), 1);
        assert_eq!(Cause::Spontaneous.code(), 3);
        assert_eq!(Cause::ActivationTermination.code(), 10);
    }

    #[test]
    fn test_point_type_serde_names() {
        let json = serde_json::to_string(&PointType::SetpointShortFloat).unwrap();
        assert_eq!(json, "\"setpoint_short_float\"");
        assert_eq!(PointType::MeasuredShortFloat.type_id(), "M_ME_NC_1");
    }
}
