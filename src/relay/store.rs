use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::types::DriverId;
use crate::geo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    EnRoute,
    Delayed,
    Completed,
}

/// Latest known state of one driver. At most one record per driver id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    pub driver_id: DriverId,
    pub latitude: f64,
    pub longitude: f64,
    /// Timestamp assigned by the publishing client (arrival time when the
    /// client did not send one).
    pub reported_at: u64,
    /// Timestamp assigned by this server on arrival.
    pub received_at: u64,
    pub status: DriverStatus,
    /// Set when the owning connection has disconnected; the last coordinates
    /// are retained so dashboards can show "last seen" instead of a blank map.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Accepted(LocationRecord),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// `reported_at` older than the stored record; dropped quietly so a
    /// network-delayed packet cannot clobber a newer position.
    Stale,
    InvalidCoordinate,
}

/// Authoritative latest-position cache, shared across all connection handlers.
/// The staleness check is atomic with the write: the DashMap entry guard
/// serializes updates per driver id.
#[derive(Default)]
pub struct LocationStore {
    records: DashMap<DriverId, LocationRecord>,
}

impl LocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &self,
        driver_id: DriverId,
        lat: f64,
        lng: f64,
        reported_at: u64,
        received_at: u64,
        status: DriverStatus,
    ) -> UpdateOutcome {
        if !geo::coordinates_in_range(lat, lng) {
            debug!("rejecting out-of-range coordinates for {}: {},{}", driver_id, lat, lng);
            return UpdateOutcome::Rejected(RejectReason::InvalidCoordinate);
        }

        match self.records.entry(driver_id) {
            Entry::Occupied(mut entry) => {
                if reported_at < entry.get().reported_at {
                    debug!(
                        "dropping stale update for {} (reported_at {} < stored {})",
                        entry.key(),
                        reported_at,
                        entry.get().reported_at
                    );
                    return UpdateOutcome::Rejected(RejectReason::Stale);
                }
                let record = entry.get_mut();
                record.latitude = lat;
                record.longitude = lng;
                record.reported_at = reported_at;
                record.received_at = received_at;
                record.status = status;
                record.stale = false;
                UpdateOutcome::Accepted(record.clone())
            }
            Entry::Vacant(entry) => {
                let record = LocationRecord {
                    driver_id: entry.key().clone(),
                    latitude: lat,
                    longitude: lng,
                    reported_at,
                    received_at,
                    status,
                    stale: false,
                };
                entry.insert(record.clone());
                UpdateOutcome::Accepted(record)
            }
        }
    }

    pub fn get(&self, driver_id: &DriverId) -> Option<LocationRecord> {
        self.records.get(driver_id).map(|r| r.clone())
    }

    /// Snapshot of every record; used for initial sync when a dashboard
    /// subscribes.
    pub fn list_all(&self) -> Vec<LocationRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    /// Flags the record of a disconnected driver without deleting it.
    pub fn mark_stale(&self, driver_id: &DriverId) {
        if let Some(mut record) = self.records.get_mut(driver_id) {
            record.stale = true;
        }
    }

    /// Explicit removal, e.g. after a completed route is acknowledged.
    pub fn remove(&self, driver_id: &DriverId) -> Option<LocationRecord> {
        self.records.remove(driver_id).map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Haversine distance in meters between a driver's last position and the
    /// given point.
    pub fn distance_to(&self, driver_id: &DriverId, lat: f64, lng: f64) -> Option<f64> {
        self.get(driver_id)
            .map(|r| geo::haversine_m(r.latitude, r.longitude, lat, lng))
    }
}
