//! Capacity-bounded resource allocator.
//!
//! The `ResourceAllocator` is shared by every concurrent requester in the
//! process. Each resource keeps its counters behind its own mutex, so the
//! check-and-reserve step in [`ResourceAllocator::allocate`] is atomic per
//! resource and `allocated <= capacity` holds at every instant.

use crate::error::{Error, Result};
use crate::resource::types::{
    Allocation, AllocationId, ResourceRequest, ResourceType, ResourceUsage,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, warn};

/// Counters mutated under the resource lock.
#[derive(Debug, Default)]
struct Counters {
    allocated: u64,
    peak: u64,
    active: usize,
}

#[derive(Debug)]
struct ResourceSlot {
    resource_type: ResourceType,
    capacity: u64,
    counters: Mutex<Counters>,
}

impl ResourceSlot {
    fn usage(&self, resource_id: &str) -> ResourceUsage {
        let counters = lock(&self.counters);
        ResourceUsage {
            resource_id: resource_id.to_string(),
            resource_type: self.resource_type.clone(),
            capacity: self.capacity,
            allocated: counters.allocated,
            peak: counters.peak,
            available: self.capacity - counters.allocated,
            utilization: ratio(counters.allocated, self.capacity),
            active_allocations: counters.active,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Thread-safe capacity bookkeeping for a set of resources.
///
/// # Example
///
/// ```
/// use flowcore::resource::{ResourceAllocator, ResourceType};
///
/// let allocator = ResourceAllocator::new();
/// allocator.register_resource("db", ResourceType::Database, 2).unwrap();
///
/// let first = allocator.allocate("db", "task-a", 2).unwrap();
/// assert!(allocator.allocate("db", "task-b", 1).is_err());
///
/// assert!(allocator.release(&first.id).unwrap());
/// assert!(!allocator.release(&first.id).unwrap());
/// ```
#[derive(Debug, Default)]
pub struct ResourceAllocator {
    resources: RwLock<HashMap<String, Arc<ResourceSlot>>>,
    allocations: Mutex<HashMap<AllocationId, Allocation>>,
}

impl ResourceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource with a fixed total capacity.
    ///
    /// # Errors
    /// Returns `Error::ResourceExists` if the id is already registered.
    pub fn register_resource(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
        capacity: u64,
    ) -> Result<()> {
        let mut resources = self
            .resources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if resources.contains_key(resource_id) {
            return Err(Error::ResourceExists(resource_id.to_string()));
        }
        debug!(resource = resource_id, %resource_type, capacity, "registered resource");
        resources.insert(
            resource_id.to_string(),
            Arc::new(ResourceSlot {
                resource_type,
                capacity,
                counters: Mutex::new(Counters::default()),
            }),
        );
        Ok(())
    }

    fn slot(&self, resource_id: &str) -> Result<Arc<ResourceSlot>> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_id)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound(resource_id.to_string()))
    }

    /// Reserve `amount` units of a resource for a requester.
    ///
    /// Either the full amount is granted or nothing is; partial grants never
    /// happen.
    ///
    /// # Errors
    /// - `Error::ResourceNotFound` if the resource was never registered
    /// - `Error::InvalidAmount` for a zero amount
    /// - `Error::InsufficientCapacity` if fewer than `amount` units are free
    pub fn allocate(&self, resource_id: &str, requester_id: &str, amount: u64) -> Result<Allocation> {
        let slot = self.slot(resource_id)?;
        if amount == 0 {
            return Err(Error::InvalidAmount {
                resource: resource_id.to_string(),
                amount,
            });
        }

        {
            let mut counters = lock(&slot.counters);
            let available = slot.capacity - counters.allocated;
            if available < amount {
                debug!(
                    resource = resource_id,
                    requester = requester_id,
                    requested = amount,
                    available,
                    "allocation refused"
                );
                return Err(Error::InsufficientCapacity {
                    resource: resource_id.to_string(),
                    requested: amount,
                    available,
                });
            }
            counters.allocated += amount;
            counters.peak = counters.peak.max(counters.allocated);
            counters.active += 1;
        }

        let allocation = Allocation::new(resource_id, requester_id, amount);
        lock(&self.allocations).insert(allocation.id, allocation.clone());
        debug!(
            resource = resource_id,
            requester = requester_id,
            amount,
            allocation = %allocation.id.short(),
            "allocated"
        );
        Ok(allocation)
    }

    /// Reserve several resources for one requester, all or nothing.
    ///
    /// Grants are taken in request order; if any request fails, the grants
    /// already taken are released before the error is returned.
    pub fn allocate_many(
        &self,
        requester_id: &str,
        requests: &[ResourceRequest],
    ) -> Result<Vec<Allocation>> {
        let mut granted = Vec::with_capacity(requests.len());
        for request in requests {
            match self.allocate(&request.resource_id, requester_id, request.amount) {
                Ok(allocation) => granted.push(allocation),
                Err(e) => {
                    for allocation in &granted {
                        self.release(&allocation.id)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(granted)
    }

    /// Return an allocation's capacity to its resource.
    ///
    /// Returns `Ok(true)` the first time and `Ok(false)` for any later call
    /// with the same id, so double release is harmless.
    pub fn release(&self, allocation_id: &AllocationId) -> Result<bool> {
        let Some(allocation) = lock(&self.allocations).remove(allocation_id) else {
            debug!(allocation = %allocation_id.short(), "release ignored, not held");
            return Ok(false);
        };

        let slot = self.slot(&allocation.resource_id)?;
        let mut counters = lock(&slot.counters);
        if counters.allocated < allocation.amount {
            warn!(
                resource = allocation.resource_id.as_str(),
                allocated = counters.allocated,
                amount = allocation.amount,
                "release exceeds allocated amount"
            );
        }
        counters.allocated = counters.allocated.saturating_sub(allocation.amount);
        counters.active = counters.active.saturating_sub(1);
        debug!(
            resource = allocation.resource_id.as_str(),
            requester = allocation.requester_id.as_str(),
            amount = allocation.amount,
            "released"
        );
        Ok(true)
    }

    /// Release every allocation held by a requester.
    ///
    /// Returns how many allocations were released.
    pub fn release_all(&self, requester_id: &str) -> Result<usize> {
        let ids: Vec<AllocationId> = lock(&self.allocations)
            .values()
            .filter(|a| a.requester_id == requester_id)
            .map(|a| a.id)
            .collect();

        let mut released = 0;
        for id in ids {
            if self.release(&id)? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Check whether `amount` units are free right now.
    ///
    /// This is a snapshot; a concurrent requester may take the capacity
    /// before a subsequent `allocate`.
    pub fn can_allocate(&self, resource_id: &str, amount: u64) -> Result<bool> {
        let slot = self.slot(resource_id)?;
        let counters = lock(&slot.counters);
        Ok(slot.capacity - counters.allocated >= amount)
    }

    /// Snapshot of a resource's current, peak and available capacity.
    pub fn get_usage(&self, resource_id: &str) -> Result<ResourceUsage> {
        Ok(self.slot(resource_id)?.usage(resource_id))
    }

    /// Usage of every registered resource, sorted by id.
    pub fn all_usage(&self) -> Vec<ResourceUsage> {
        let slots: Vec<(String, Arc<ResourceSlot>)> = self
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        let mut usage: Vec<ResourceUsage> =
            slots.iter().map(|(id, slot)| slot.usage(id)).collect();
        usage.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        usage
    }

    /// Allocated capacity across all resources as a fraction of the total.
    pub fn utilization(&self) -> f64 {
        let usage = self.all_usage();
        let allocated: u64 = usage.iter().map(|u| u.allocated).sum();
        let capacity: u64 = usage.iter().map(|u| u.capacity).sum();
        ratio(allocated, capacity)
    }

    /// Allocations currently held by a requester.
    pub fn allocations_for(&self, requester_id: &str) -> Vec<Allocation> {
        let mut held: Vec<Allocation> = lock(&self.allocations)
            .values()
            .filter(|a| a.requester_id == requester_id)
            .cloned()
            .collect();
        held.sort_by_key(|a| a.created_at);
        held
    }

    /// Number of allocations currently held across all resources.
    pub fn active_allocations(&self) -> usize {
        lock(&self.allocations).len()
    }

    pub fn resource_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, resource_id: &str) -> bool {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(resource_id)
    }
}
