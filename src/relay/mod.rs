pub mod delivery;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod store;

pub use registry::{CloseReason, ConnectionRegistry, ControlCommand, SessionState};
pub use router::TopicRouter;
pub use store::{DriverStatus, LocationRecord, LocationStore, RejectReason, UpdateOutcome};
