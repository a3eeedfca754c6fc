#![cfg_attr(docsrs, feature(doc_cfg))]
//! # meshcomm
//!
//! meshcomm moves field data between the partitions of a distributed mesh. It
//! gathers partitioned fields into canonical global order, scatters them back,
//! and refreshes ghost ("halo") entries between neighbouring partitions, all
//! through one byte-oriented communication path.
//!
//! ## Features
//! - [`PartitionIndex`](data::partition_index::PartitionIndex): O(1) bijection
//!   between global indices and `(rank, local offset)` pairs
//! - [`FieldView`](data::field_view::FieldView): type- and rank-erased byte
//!   views over caller storage, for any `bytemuck::Pod` element and any rank
//! - Immutable transfer plans built from prefix sums
//! - [`GatherScatter`](algs::gather_scatter::GatherScatter) and
//!   [`HaloExchange`](algs::halo::HaloExchange) engines
//! - Pluggable communication backends (serial, in-process threads, MPI)
//!
//! ## Canonical order
//!
//! Local offsets on each rank follow ascending global index, and rank blocks
//! follow ascending rank. Gathers reproduce this order byte for byte whatever
//! the process count, delivery order or thread scheduling.
//!
//! ## Usage
//! Add `meshcomm` as a dependency in your `Cargo.toml` and enable features as needed:
//!
//! ```toml
//! [dependencies]
//! meshcomm = "0.3"
//! # Optional features:
//! # features = ["mpi-support", "check-invariants"]
//! ```
//!
//! ```
//! use meshcomm::prelude::*;
//!
//! let comm = RayonComm::group(1).remove(0);
//! let index = PartitionIndex::build(&[0, 0, 0], 1)?;
//! let local = [1u32, 2, 3];
//! let mut global = [0u32; 3];
//! GatherScatter::new(&index).gather(
//!     &comm,
//!     &mut [FieldView::from_slice(&local, 0)],
//!     &mut [FieldView::from_slice_mut(&mut global, 0)],
//! )?;
//! assert_eq!(global, local);
//! # Ok::<(), meshcomm::exchange_error::ExchangeError>(())
//! ```

pub mod algs;
pub mod data;
pub mod debug_invariants;
pub mod exchange_error;

pub use debug_invariants::DebugInvariants;
pub use exchange_error::ExchangeError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{
        CommTag, Communicator, GATHER_TAG, HALO_SETUP_TAGS, HALO_TAG, NoComm, RayonComm,
        SCATTER_TAG, Wait,
    };
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::exchange::TransferStats;
    pub use crate::algs::gather_scatter::GatherScatter;
    pub use crate::algs::halo::{HaloExchange, HaloNeighbor};
    pub use crate::data::field_view::{
        ArrayField, AsFieldViews, FieldLayout, FieldView, field_views, field_views_prefix,
        field_views_prefix_ref, field_views_ref,
    };
    pub use crate::data::partition_index::{
        BlockDistribution, Distribution, Location, PartitionIndex,
    };
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::exchange_error::ExchangeError;
}
