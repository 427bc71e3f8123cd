pub mod snapshot;
pub mod state_cache;

pub use crate::snapshot::{ActiveCounts, PipelineStateSnapshot, SlotBank};
pub use crate::state_cache::{DuplicateSlots, PipelineStateCache};
