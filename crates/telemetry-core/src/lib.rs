pub mod alerts;
pub mod anomaly;
pub mod audit;
pub mod credentials;
pub mod db;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;
pub mod protocol_policy;
pub mod rules;

pub use db::Db;
pub use error::IngestError;
pub use events::EventBus;
pub use orchestrator::{CanonicalPayload, IngestResult, Orchestrator};
