//! Data module: partition index, field views and transfer plans

pub mod field_view;
pub mod partition_index;
pub mod transfer_plan;

pub use field_view::{ArrayField, AsFieldViews, FieldLayout, FieldView};
pub use partition_index::{BlockDistribution, Distribution, Location, PartitionIndex};
pub use transfer_plan::{Extent, TransferPlan};
