pub mod locations;
pub mod stats;
