//! Communication backends and the transfer engines built on them.

pub mod communicator;
pub mod exchange;
pub mod gather_scatter;
pub mod halo;
pub mod wire;

pub use exchange::TransferStats;
pub use gather_scatter::GatherScatter;
pub use halo::{HaloExchange, HaloNeighbor};
