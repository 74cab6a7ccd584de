pub mod error;
pub mod ids;
pub mod join;
pub mod model;
pub mod outcomes;
pub mod status;
pub mod tasks;
pub mod types;
pub mod validate;

pub use error::*;
pub use ids::*;
pub use join::*;
pub use model::*;
pub use outcomes::*;
pub use status::*;
pub use tasks::*;
pub use types::*;
pub use validate::*;
