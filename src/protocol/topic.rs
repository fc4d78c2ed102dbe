use crate::common::errors::RelayError;
use crate::common::types::DriverId;

/// Destination prefix shared with the mobile/dashboard clients.
pub const GPS_DESTINATION: &str = "/hypelink/gps";

/// A logical fan-out channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every driver's position updates and connection-state changes.
    AllDrivers,
    /// One driver's updates only.
    Driver(DriverId),
}

impl Topic {
    /// Parses a wire destination string. Subscribing to a driver that has
    /// never connected is allowed; fan-out starts once it publishes.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        if raw == GPS_DESTINATION {
            return Ok(Self::AllDrivers);
        }
        if let Some(rest) = raw.strip_prefix("/hypelink/gps/") {
            if !rest.is_empty() && !rest.contains('/') {
                return Ok(Self::Driver(DriverId::from(rest)));
            }
        }
        Err(RelayError::UnknownTopic(raw.to_string()))
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllDrivers => write!(f, "{}", GPS_DESTINATION),
            Self::Driver(id) => write!(f, "{}/{}", GPS_DESTINATION, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_and_per_driver_destinations() {
        assert_eq!(Topic::parse("/hypelink/gps").unwrap(), Topic::AllDrivers);
        assert_eq!(
            Topic::parse("/hypelink/gps/driver-7").unwrap(),
            Topic::Driver(DriverId::from("driver-7"))
        );
    }

    #[test]
    fn rejects_malformed_destinations() {
        for raw in ["/hypelink", "/hypelink/gps/", "/hypelink/gps/a/b", "gps"] {
            assert!(matches!(
                Topic::parse(raw),
                Err(RelayError::UnknownTopic(_))
            ));
        }
    }

    #[test]
    fn display_round_trips() {
        let topic = Topic::Driver(DriverId::from("d1"));
        assert_eq!(Topic::parse(&topic.to_string()).unwrap(), topic);
    }
}
