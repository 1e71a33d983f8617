//! End-to-end runs of an assembled runtime.

use core::time::Duration;
use std::fs;
use std::sync::Arc;
use std::thread;

use jibbr_core::{Runtime, RuntimeConfig};
use jibbr_resource::{FILE, Location, Resource, ResourceSettings};
use jibbr_script::{
    EnvironmentState, Execution, SCRIPT, ScriptError, ScriptRegistry, native_fn,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

const PATIENCE: Duration = Duration::from_secs(5);

/// An application whose `main.js` requires `lib.js` and exports a `wait`
/// function that suspends.
fn app() -> (TempDir, Arc<ScriptRegistry>) {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("main.js"), "// main").expect("write");
    fs::write(dir.path().join("lib.js"), "// lib").expect("write");
    fs::write(dir.path().join("settings.json"), r#"{ "greeting": "hi" }"#).expect("write");

    let registry = Arc::new(ScriptRegistry::new());
    registry.register(
        "lib.js",
        native_fn(|cx, _| async move {
            cx.export("answer", json!(42));
            Ok(Value::Null)
        }),
    );
    registry.register(
        "main.js",
        native_fn(|cx, _| async move {
            let lib = cx.require("./lib").await?;
            let settings = cx.require("./settings").await?;
            cx.export("answer", lib["answer"].clone());
            cx.export("greeting", settings["greeting"].clone());
            cx.define_function(
                "wait",
                native_fn(|cx, _| async move {
                    let value = cx.suspend_with(|_key| {}).await?;
                    Ok(json!({ "got": value }))
                }),
            );
            Ok(Value::Null)
        }),
    );
    (dir, registry)
}

fn runtime(dir: &TempDir, registry: &Arc<ScriptRegistry>) -> Runtime {
    let config = RuntimeConfig::default()
        .with_worker_threads(2)
        .with_load_timeout(PATIENCE)
        .with_resources(ResourceSettings::rooted_at(dir.path()));
    Runtime::builder()
        .with_config(config)
        .with_compiler(Arc::clone(registry) as Arc<dyn jibbr_script::ScriptCompiler>)
        .build()
        .expect("runtime starts")
}

#[test]
fn boots_and_requires() {
    let (dir, registry) = app();
    let runtime = runtime(&dir, &registry);

    let env = assert_ok!(runtime.block_on(runtime.environment("main.js")));
    assert!(matches!(env.state(), EnvironmentState::Initialized));
    assert_eq!(env.exports()["answer"], json!(42));
    assert_eq!(env.exports()["greeting"], json!("hi"));

    let file = assert_ok!(runtime.load_resource(FILE, Location::Base, "lib.js", &[]));
    assert!(runtime.find_resource(file.key()).is_some());

    runtime.shutdown();
}

#[test]
fn suspended_call_resumes_from_another_thread() {
    let (dir, registry) = app();
    let runtime = runtime(&dir, &registry);

    let execution = assert_ok!(runtime.block_on(runtime.execute("main.js", "wait", vec![])));
    let Execution::Suspended(completion) = execution else {
        panic!("expected the call to suspend");
    };
    let key = completion.key().cloned().expect("pending key");

    let executor = runtime.executor().clone();
    thread::spawn(move || executor.resume(&key, Ok(json!("late"))))
        .join()
        .expect("resume thread")
        .expect("first resume succeeds");

    let result = runtime.block_on(async { tokio::time::timeout(PATIENCE, completion).await });
    assert_eq!(result.expect("completes").expect("succeeds"), json!({ "got": "late" }));

    runtime.shutdown();
}

#[test]
fn invalidating_a_source_rebuilds_the_root() {
    let (dir, registry) = app();
    let runtime = runtime(&dir, &registry);

    let first = assert_ok!(runtime.block_on(runtime.environment("main.js")));
    let lib = assert_ok!(runtime.load_resource(SCRIPT, Location::Base, "lib.js", &[]));
    let roots = runtime.invalidate(&lib);

    assert!(!first.is_alive());
    assert!(matches!(first.state(), EnvironmentState::Dead));
    assert_eq!(roots, vec![first.key().clone()]);

    let second = assert_ok!(runtime.block_on(runtime.environment("main.js")));
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.exports()["answer"], json!(42));

    runtime.shutdown();
}

#[test]
fn missing_script_fails_to_boot() {
    let (dir, registry) = app();
    let runtime = runtime(&dir, &registry);

    let err = assert_err!(runtime.block_on(runtime.environment("absent.js")));
    assert!(err.is_not_found(), "unexpected error: {err}");

    runtime.shutdown();
}

#[test]
fn watching_picks_up_edits() {
    let (dir, registry) = app();
    let config = RuntimeConfig::default()
        .with_worker_threads(2)
        .with_watch_files(true)
        .with_poll_interval(Duration::from_millis(20))
        .with_resources(ResourceSettings::rooted_at(dir.path()));
    let runtime = Runtime::builder()
        .with_config(config)
        .with_compiler(Arc::clone(&registry) as Arc<dyn jibbr_script::ScriptCompiler>)
        .build()
        .expect("runtime starts");

    let env = assert_ok!(runtime.block_on(runtime.environment("main.js")));
    thread::sleep(Duration::from_millis(30));
    fs::write(dir.path().join("lib.js"), "// lib, edited and longer").expect("write");

    let died = runtime.block_on(async {
        tokio::time::timeout(PATIENCE, async {
            while env.is_alive() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    });
    assert!(died.is_ok(), "watcher never invalidated the edited module");

    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runs_on_a_borrowed_handle() {
    let (dir, registry) = app();
    let runtime = Runtime::builder()
        .with_config(RuntimeConfig::default().with_resources(ResourceSettings::rooted_at(dir.path())))
        .with_compiler(Arc::clone(&registry) as Arc<dyn jibbr_script::ScriptCompiler>)
        .with_handle(tokio::runtime::Handle::current())
        .build()
        .expect("runtime starts");

    let env = assert_ok!(runtime.environment("main.js").await);
    assert_eq!(env.exports()["answer"], json!(42));

    let err = assert_err!(runtime.execute("main.js", "missing", vec![]).await);
    assert!(matches!(err, ScriptError::NoSuchFunction(ref name) if name == "missing"));

    runtime.shutdown();
    assert!(!env.is_alive());
}
