//! Resource allocation for admission control.
//!
//! Resources are finite pools of capacity (threads, API quota, database
//! connections). Work that declares a resource need only runs once the
//! allocator grants it, and gives the capacity back when it finishes.

mod allocator;
mod types;

pub use allocator::ResourceAllocator;
pub use types::{Allocation, AllocationId, ResourceRequest, ResourceType, ResourceUsage};
