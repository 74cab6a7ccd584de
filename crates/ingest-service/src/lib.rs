pub mod clients;
pub mod clustering;
pub mod config;
pub mod control;
pub mod events;
pub mod ingester;
pub mod metrics;
pub mod scenario;
pub mod service;
pub mod testvariants;

pub use clients::*;
pub use clustering::*;
pub use config::*;
pub use control::*;
pub use events::*;
pub use ingester::*;
pub use metrics::*;
pub use service::*;
pub use testvariants::*;
