// Probe modules
// Synthetic workloads measuring cluster availability and latency
//
// Numan Thabit 2025 Nov

pub mod admin;
pub mod brokers;
pub mod orchestrator;
pub mod partition;
pub mod pubsub;
pub mod site;
pub mod websocket;
