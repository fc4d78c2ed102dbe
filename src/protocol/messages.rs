use serde::{Deserialize, Serialize};

use crate::common::types::{ConnectionId, DriverId, ParcelId};
use crate::relay::store::{DriverStatus, LocationRecord};

/// Ops published by driver clients. The observed GPS payload is
/// `{driverId, lat, lng}`; `reportedAt` is optional and the server stamps
/// arrival time when it is absent.
#[derive(Deserialize, Debug)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DriverMessage {
    Location {
        driver_id: DriverId,
        lat: f64,
        lng: f64,
        #[serde(default)]
        reported_at: Option<u64>,
    },
    DeliveryComplete {
        driver_id: DriverId,
        lat: f64,
        lng: f64,
        point_id: ParcelId,
    },
    Heartbeat,
}

/// Ops sent by dashboard clients.
#[derive(Deserialize, Debug)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DashboardMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Heartbeat,
}

/// Ops fanned out to connected clients.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutgoingMessage {
    Ready {
        connection_id: ConnectionId,
    },
    LocationUpdate {
        driver_id: DriverId,
        status: DriverStatus,
        latitude: f64,
        longitude: f64,
        stale: bool,
    },
    ConnectionState {
        driver_id: DriverId,
        connected: bool,
    },
    DeliveryComplete {
        driver_id: DriverId,
        latitude: f64,
        longitude: f64,
        point_id: ParcelId,
        occurred_at: u64,
    },
    Stats(RelayStats),
    Error {
        code: String,
        message: String,
    },
}

impl OutgoingMessage {
    pub fn location_update(record: &LocationRecord) -> Self {
        Self::LocationUpdate {
            driver_id: record.driver_id.clone(),
            status: record.status,
            latitude: record.latitude,
            longitude: record.longitude,
            stale: record.stale,
        }
    }

    /// Position updates may be coalesced under backpressure; everything else
    /// must be delivered or the subscriber closed.
    pub fn is_coalescable(&self) -> bool {
        matches!(self, Self::LocationUpdate { .. } | Self::Stats(_))
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    /// Currently connected driver sessions.
    pub publishers: i32,
    /// Currently connected dashboard sessions.
    pub subscribers: i32,
    /// Drivers with a stored location record (live or stale).
    pub tracked_drivers: i32,
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub total: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: i32,
    pub system_load: f64,
    pub process_load: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_observed_gps_payload() {
        // Exactly what the Android tracking service sends, plus the op tag.
        let raw = r#"{"op":"location","driverId":"d1","lat":37.5,"lng":127.0}"#;
        let msg: DriverMessage = serde_json::from_str(raw).unwrap();
        match msg {
            DriverMessage::Location {
                driver_id,
                lat,
                lng,
                reported_at,
            } => {
                assert_eq!(driver_id, DriverId::from("d1"));
                assert_eq!(lat, 37.5);
                assert_eq!(lng, 127.0);
                assert!(reported_at.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parses_delivery_complete_payload() {
        let raw =
            r#"{"op":"deliveryComplete","driverId":"d1","lat":37.5,"lng":127.0,"pointId":"p9"}"#;
        let msg: DriverMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            msg,
            DriverMessage::DeliveryComplete { point_id, .. } if point_id == ParcelId::from("p9")
        ));
    }

    #[test]
    fn connection_state_uses_camel_case_fields() {
        let msg = OutgoingMessage::ConnectionState {
            driver_id: DriverId::from("d1"),
            connected: false,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], "connectionState");
        assert_eq!(json["driverId"], "d1");
        assert_eq!(json["connected"], false);
    }

    #[test]
    fn coalescable_classification() {
        let position = OutgoingMessage::LocationUpdate {
            driver_id: DriverId::from("d1"),
            status: DriverStatus::EnRoute,
            latitude: 0.0,
            longitude: 0.0,
            stale: false,
        };
        let completion = OutgoingMessage::DeliveryComplete {
            driver_id: DriverId::from("d1"),
            latitude: 0.0,
            longitude: 0.0,
            point_id: ParcelId::from("p1"),
            occurred_at: 0,
        };
        assert!(position.is_coalescable());
        assert!(!completion.is_coalescable());
    }
}
