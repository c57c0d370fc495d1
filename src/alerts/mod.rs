// Alert sinks module
// Stateless adapters over outbound HTTP for paging, chat, and analytics
//
// Numan Thabit 2025 Nov

pub mod analytics;
pub mod chat;
pub mod events;
pub mod pager;

pub use analytics::AnalyticsClient;
pub use chat::ChatNotifier;
pub use events::EventsClient;
pub use pager::{Incident, PagerClient};

/// Priorities accepted by the pager provider.
pub const ALLOWED_PRIORITIES: [&str; 5] = ["P1", "P2", "P3", "P4", "P5"];

pub const DEFAULT_PRIORITY: &str = "P2";
