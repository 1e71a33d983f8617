//! Cascading kill and root replacement.


use std::sync::Arc;

use jibbr_resource::{Location, Resource, ResourceEvent, ResourceEventKind};
use parking_lot::Mutex;
use test_utils::{NODE, ROOT, cache_with_creators, node_key, root_key};

/// C depends on B depends on A: killing A kills both, and neither is found.
#[test]
fn killing_a_dependency_kills_the_chain() {
    let (cache, _, _) = cache_with_creators();
    let a = cache.load(NODE, Location::Virtual, "a", &[]).expect("a");
    let b = cache.load(NODE, Location::Virtual, "b", &[]).expect("b");
    let c = cache.load(NODE, Location::Virtual, "c", &[]).expect("c");
    cache.add_dependent(&a, &b).expect("b depends on a");
    cache.add_dependent(&b, &c).expect("c depends on b");

    let _ = cache.kill(&a);

    assert!(!b.is_alive());
    assert!(!c.is_alive());
    assert!(cache.find(&node_key("a")).is_none());
    assert!(cache.find(&node_key("b")).is_none());
    assert!(cache.find(&node_key("c")).is_none());
}

/// Diamonds are killed once per resource.
#[test]
fn shared_dependents_die_once() {
    let (cache, _, _) = cache_with_creators();
    let top = cache.load(NODE, Location::Virtual, "top", &[]).expect("top");
    let left = cache.load(NODE, Location::Virtual, "left", &[]).expect("left");
    let right = cache.load(NODE, Location::Virtual, "right", &[]).expect("right");
    let bottom = cache.load(NODE, Location::Virtual, "bottom", &[]).expect("bottom");
    cache.add_dependent(&top, &left).expect("link");
    cache.add_dependent(&top, &right).expect("link");
    cache.add_dependent(&left, &bottom).expect("link");
    cache.add_dependent(&right, &bottom).expect("link");

    let killed = Arc::new(Mutex::new(Vec::new()));
    let killed_clone = Arc::clone(&killed);
    cache
        .events()
        .register_observer("kills", &[ResourceEventKind::Killed], move |event: &ResourceEvent| {
            if let ResourceEvent::Killed { key } = event {
                killed_clone.lock().push(key.name().to_owned());
            }
        })
        .expect("hook");

    let _ = cache.kill(&top);

    let killed = killed.lock();
    assert_eq!(killed.len(), 4);
    assert_eq!(killed.last().map(String::as_str), Some("top"));
    assert_eq!(killed.iter().filter(|name| *name == "bottom").count(), 1);
}

/// A root is replaced, not removed: the next load yields a new live instance.
#[test]
fn root_survives_invalidation() {
    let (cache, _, roots) = cache_with_creators();
    let root = cache.load(ROOT, Location::Virtual, "app", &[]).expect("root");
    let leaf = cache.load(NODE, Location::Virtual, "leaf", &[]).expect("leaf");
    cache.add_dependent(&leaf, &root).expect("root depends on leaf");

    let dead_roots = cache.kill(&leaf);
    assert_eq!(dead_roots, vec![root_key("app")]);
    assert!(!root.is_alive());
    assert!(cache.find(&root_key("app")).is_none());

    let reloaded = cache.reload(&root_key("app")).expect("reload");
    assert!(reloaded.is_alive());
    assert!(!Arc::ptr_eq(&root, &reloaded));
    assert_eq!(roots.calls(), 2);
}

/// Reloading a dead root publishes `Reloaded`, first loads publish `Loaded`.
#[test]
fn reload_events_distinguish_replacement() {
    let (cache, _, _) = cache_with_creators();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    cache
        .events()
        .register_observer(
            "loads",
            &[ResourceEventKind::Loaded, ResourceEventKind::Reloaded],
            move |event: &ResourceEvent| {
                seen_clone.lock().push(format!("{:?}", jibbr_events::HookEvent::kind(event)));
            },
        )
        .expect("hook");

    let root = cache.load(ROOT, Location::Virtual, "app", &[]).expect("root");
    let _ = cache.kill(&root);
    let _ = cache.reload(&root_key("app")).expect("reload");

    assert_eq!(*seen.lock(), vec!["Loaded", "Reloaded"]);
}
