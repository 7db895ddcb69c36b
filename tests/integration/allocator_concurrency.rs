//! Resource allocator tests under contention.
//!
//! Many threads and tasks allocate and release at once; the capacity
//! invariant must hold at every observation and all capacity must come back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use flowcore::resource::{ResourceAllocator, ResourceRequest, ResourceType};
use flowcore::Error;

/// Test: Capacity is never exceeded by concurrent threads
/// Given a pool of 5 and 16 threads each allocating 1-3 units repeatedly
/// When they race
/// Then allocated never exceeds capacity and everything is released
#[test]
fn test_threads_never_exceed_capacity() {
    let allocator = Arc::new(ResourceAllocator::new());
    allocator
        .register_resource("conn", ResourceType::Database, 5)
        .unwrap();
    let granted = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..16)
        .map(|t| {
            let allocator = Arc::clone(&allocator);
            let granted = Arc::clone(&granted);
            thread::spawn(move || {
                for i in 0..200u64 {
                    let amount = 1 + (t + i) % 3;
                    match allocator.allocate("conn", &format!("worker-{}", t), amount) {
                        Ok(allocation) => {
                            granted.fetch_add(1, Ordering::Relaxed);
                            let usage = allocator.get_usage("conn").unwrap();
                            assert!(usage.allocated <= usage.capacity);
                            assert!(allocator.release(&allocation.id).unwrap());
                        }
                        Err(Error::InsufficientCapacity { requested, available, .. }) => {
                            assert!(requested > available);
                        }
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let usage = allocator.get_usage("conn").unwrap();
    assert_eq!(usage.allocated, 0);
    assert_eq!(usage.active_allocations, 0);
    assert!(usage.peak <= 5);
    assert!(granted.load(Ordering::Relaxed) > 0);
}

/// Test: All-or-nothing grants roll back under contention
/// Given two resources of capacity 3 and tasks requesting 2 of each
/// When 32 tokio tasks race for both at once
/// Then no task ever holds only half of its request
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allocate_many_is_all_or_nothing() {
    let allocator = Arc::new(ResourceAllocator::new());
    allocator
        .register_resource("cpu", ResourceType::Compute, 3)
        .unwrap();
    allocator
        .register_resource("mem", ResourceType::Memory, 3)
        .unwrap();
    let requests = vec![ResourceRequest::new("cpu", 2), ResourceRequest::new("mem", 2)];

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let allocator = Arc::clone(&allocator);
            let requests = requests.clone();
            tokio::spawn(async move {
                let requester = format!("job-{}", i);
                for _ in 0..50 {
                    if let Ok(granted) = allocator.allocate_many(&requester, &requests) {
                        assert_eq!(granted.len(), 2);
                        assert_eq!(allocator.allocations_for(&requester).len(), 2);
                        tokio::task::yield_now().await;
                        assert_eq!(allocator.release_all(&requester).unwrap(), 2);
                    } else {
                        assert!(allocator.allocations_for(&requester).is_empty());
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    for id in ["cpu", "mem"] {
        let usage = allocator.get_usage(id).unwrap();
        assert_eq!(usage.allocated, 0, "{} still allocated", id);
        // Only one 2-unit grant fits in a capacity of 3.
        assert_eq!(usage.peak, 2);
    }
    assert_eq!(allocator.active_allocations(), 0);
}

/// Test: Double release is harmless
/// Given an allocation released twice from different threads
/// When both releases race
/// Then exactly one reports the release and capacity returns once
#[test]
fn test_racing_double_release() {
    let allocator = Arc::new(ResourceAllocator::new());
    allocator
        .register_resource("lock", ResourceType::Lock, 1)
        .unwrap();

    for _ in 0..50 {
        let allocation = allocator.allocate("lock", "holder", 1).unwrap();
        let releases: Vec<_> = (0..2)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                let id = allocation.id;
                thread::spawn(move || allocator.release(&id).unwrap())
            })
            .collect();
        let released: usize = releases
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(released, 1);
        assert_eq!(allocator.get_usage("lock").unwrap().allocated, 0);
    }
}
