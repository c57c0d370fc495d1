// Incident module
// Escalation tracking and incident lifecycle against the pager providers
//
// Numan Thabit 2025 Nov

pub mod lifecycle;
pub mod tracker;

pub use lifecycle::{IncidentManager, IncidentRecord};
pub use tracker::{IncidentTracker, TrackOutcome, TrackerRegistry};
