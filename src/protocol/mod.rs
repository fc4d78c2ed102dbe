pub mod messages;
pub mod topic;

pub use messages::*;
pub use topic::*;
