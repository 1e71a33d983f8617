//! File changes propagating through environments.


use std::sync::Arc;

use jibbr_resource::{Resource, ResourceWatcher};
use jibbr_script::{ScriptError, native_fn};
use serde_json::{Value, json};
use tokio::runtime::Handle;

use test_utils::Harness;

/// `main.js` exports the version string `lib.js` was compiled from.
fn app(h: &Harness) {
    h.script(
        "main.js",
        native_fn(|cx, _| async move {
            let lib = cx.require("./lib").await?;
            cx.export("version", lib["version"].clone());
            Ok(Value::Null)
        }),
    );
    h.write("lib.js", "v1");
    h.registry.register_factory("lib.js", |source| {
        let version = source.to_owned();
        Ok(native_fn(move |cx, _| {
            let version = version.clone();
            async move {
                cx.export("version", json!(version));
                Ok(Value::Null)
            }
        }))
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn editing_a_module_rebuilds_its_root() {
    let h = Harness::new();
    app(&h);
    let watcher = ResourceWatcher::new(Arc::clone(h.cache()), Handle::current());

    let before = h.executor.environment("main.js").await.expect("main");
    assert_eq!(before.exports(), json!({ "version": "v1" }));
    assert_eq!(watcher.sweep(), 0);

    h.write("lib.js", "v2 with a longer body");
    assert!(watcher.sweep() >= 1);
    assert!(!before.is_alive(), "module edits take the root down");

    let after = h.executor.environment("main.js").await.expect("rebuilt");
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.exports(), json!({ "version": "v2 with a longer body" }));
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_a_module_fails_the_next_boot() {
    let h = Harness::new();
    app(&h);
    let watcher = ResourceWatcher::new(Arc::clone(h.cache()), Handle::current());

    let before = h.executor.environment("main.js").await.expect("main");
    let path = h.dir.path().join("lib.js");
    std::fs::remove_file(&path).expect("remove");
    assert!(watcher.path_changed(&path, true) >= 1);
    assert!(!before.is_alive());

    let after = h.executor.environment("main.js").await;
    assert!(matches!(after, Err(ScriptError::NotFound(ref name)) if name == "lib"), "got {after:?}");
}
