//! Resource and allocation data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of capacity a resource represents.
///
/// The allocator treats every type the same way; the type is carried for
/// reporting and for callers that route requests by kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Compute,
    Memory,
    Storage,
    Network,
    ApiQuota,
    Database,
    FileHandle,
    Thread,
    Process,
    Lock,
    Custom(String),
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Compute => write!(f, "compute"),
            ResourceType::Memory => write!(f, "memory"),
            ResourceType::Storage => write!(f, "storage"),
            ResourceType::Network => write!(f, "network"),
            ResourceType::ApiQuota => write!(f, "api_quota"),
            ResourceType::Database => write!(f, "database"),
            ResourceType::FileHandle => write!(f, "file_handle"),
            ResourceType::Thread => write!(f, "thread"),
            ResourceType::Process => write!(f, "process"),
            ResourceType::Lock => write!(f, "lock"),
            ResourceType::Custom(name) => write!(f, "custom: {}", name),
        }
    }
}

/// Unique identifier for an allocation.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(pub Uuid);

impl AllocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capacity held by one requester against one resource.
///
/// Exists exactly while the capacity is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub resource_id: String,
    pub requester_id: String,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
}

impl Allocation {
    pub fn new(resource_id: &str, requester_id: &str, amount: u64) -> Self {
        Self {
            id: AllocationId::new(),
            resource_id: resource_id.to_string(),
            requester_id: requester_id.to_string(),
            amount,
            created_at: Utc::now(),
        }
    }
}

/// A declared need for capacity, used by scheduled tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub resource_id: String,
    pub amount: u64,
}

impl ResourceRequest {
    pub fn new(resource_id: &str, amount: u64) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            amount,
        }
    }
}

/// Point-in-time view of a resource's bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub capacity: u64,
    pub allocated: u64,
    /// Highest `allocated` value ever observed.
    pub peak: u64,
    pub available: u64,
    /// `allocated / capacity`, 0.0 for zero-capacity resources.
    pub utilization: f64,
    pub active_allocations: usize,
}
