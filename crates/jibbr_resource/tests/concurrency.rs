//! Concurrent load-or-create behavior.


use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::{Arc, Barrier, mpsc};
use std::thread;

use jibbr_resource::{Location, Resource, ResourceCache, ResourceCreator, ResourceError};
use test_utils::{CountingCreator, NODE, node_key};

const CALLERS: usize = 16;

/// N concurrent loads of one key run the creator once and share the instance.
#[test]
fn concurrent_first_loads_create_exactly_once() {
    let cache = Arc::new(ResourceCache::new());
    let creator = Arc::new(CountingCreator::new(NODE).with_delay(Duration::from_millis(50)));
    cache.register_creator(Arc::clone(&creator) as Arc<dyn ResourceCreator>);
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache
                    .load(NODE, Location::Virtual, "shared", &[])
                    .expect("load succeeds")
            })
        })
        .collect();

    let loaded: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("thread panicked"))
        .collect();

    assert_eq!(creator.calls(), 1, "creator must run exactly once");
    for resource in &loaded {
        assert!(Arc::ptr_eq(resource, &loaded[0]), "all callers see one instance");
    }
}

/// Distinct keys are created independently.
#[test]
fn concurrent_loads_of_distinct_keys_do_not_serialize_on_each_other() {
    let cache = Arc::new(ResourceCache::new());
    let creator = Arc::new(CountingCreator::new(NODE));
    cache.register_creator(Arc::clone(&creator) as Arc<dyn ResourceCreator>);
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache
                    .load(NODE, Location::Virtual, &format!("n{i}"), &[])
                    .expect("load succeeds")
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().expect("thread panicked").is_alive());
    }
    assert_eq!(creator.calls(), CALLERS);
    assert_eq!(cache.len(), CALLERS);
}

/// Waiters on a failing creation all receive the error and nothing is cached.
#[test]
fn concurrent_waiters_share_creation_failure() {
    let cache = Arc::new(ResourceCache::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.load_or_create(&node_key("broken"), |key| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    Err(ResourceError::NotViable {
                        key: key.clone(),
                        reason: "syntax error".to_owned(),
                    })
                })
            })
        })
        .collect();

    for handle in handles {
        let result = handle.join().expect("thread panicked");
        assert!(matches!(result, Err(ResourceError::NotViable { .. })));
    }
    assert!(calls.load(Ordering::SeqCst) >= 1);
    assert!(cache.find(&node_key("broken")).is_none());
    assert!(cache.is_empty(), "a failed creation leaves no slot behind");
}

/// Two creators waiting on each other's keys fail with a cycle instead of
/// blocking forever.
#[test]
fn cross_thread_creation_cycle_is_reported() {
    let cache = Arc::new(ResourceCache::new());
    let barrier = Arc::new(Barrier::new(2));
    let (done_tx, done) = mpsc::channel();

    for (own, other) in [("a", "b"), ("b", "a")] {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            let result = cache.load_or_create(&node_key(own), |_| {
                barrier.wait();
                cache.load_or_create(&node_key(other), |_| panic!("{other} is already in flight"))
            });
            let _ = done_tx.send(result);
        });
    }

    for _ in 0..2 {
        let result = done
            .recv_timeout(Duration::from_secs(5))
            .expect("creators deadlocked");
        assert!(matches!(result, Err(ResourceError::CreationCycle(_))));
    }
    assert!(cache.is_empty());

    let (tx, rx) = mpsc::channel();
    let reload = Arc::clone(&cache);
    thread::spawn(move || {
        let _ = tx.send(reload.load_or_create(&node_key("a"), |_| {
            reload.load_or_create(&node_key("b"), |key| {
                Err(ResourceError::NotFound(key.clone()))
            })
        }));
    });
    let after = rx.recv_timeout(Duration::from_secs(5)).expect("no stale waits");
    assert!(after.is_err_and(|error| error.is_not_found()));
}

/// Concurrent kills and dependent registration never leave a live dependent
/// hanging off a dead resource.
#[test]
fn add_dependent_racing_kill_never_leaves_live_orphans() {
    for round in 0..50 {
        let cache = Arc::new(ResourceCache::new());
        cache.register_creator(Arc::new(CountingCreator::new(NODE)) as Arc<dyn ResourceCreator>);
        let parent = cache
            .load(NODE, Location::Virtual, "parent", &[])
            .expect("parent");
        let children: Vec<_> = (0..8)
            .map(|i| {
                cache
                    .load(NODE, Location::Virtual, &format!("child-{round}-{i}"), &[])
                    .expect("child")
            })
            .collect();
        let barrier = Arc::new(Barrier::new(2));

        let linker = {
            let cache = Arc::clone(&cache);
            let parent = Arc::clone(&parent);
            let children = children.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for child in &children {
                    let _ = cache.add_dependent(&parent, child);
                }
            })
        };

        barrier.wait();
        let _ = cache.kill(&parent);
        linker.join().expect("linker panicked");

        assert!(!parent.is_alive());
        for child in &children {
            assert!(!child.is_alive(), "child must die with its dead dependency");
        }
    }
}
