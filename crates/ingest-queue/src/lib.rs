pub mod disposition;
pub mod memory;
pub mod queue;
pub mod relay;

pub use disposition::*;
pub use memory::*;
pub use queue::*;
pub use relay::*;
