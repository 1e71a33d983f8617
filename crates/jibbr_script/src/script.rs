//! Compiled scripts and the resource that holds them.
//!
//! Script bodies are native async closures ([`NativeFn`]). A
//! [`ScriptCompiler`] turns the source text of a `.js` resource into a
//! [`Script`]; the built-in [`ScriptRegistry`] binds bodies to file names and
//! lets a factory inspect the source, so a broken file surfaces as a compile
//! error exactly like a real front end would report it.

use core::fmt;
use std::path::Path;
use std::sync::Arc;

use hashbrown::HashMap;
use jibbr_execution::BoxFuture;
use jibbr_resource::{
    FileSnapshot, Location, Resource, ResourceBase, ResourceCache, ResourceCreator, ResourceError,
    ResourceKey, ResourceKind, ResourceSettings,
};
use parking_lot::RwLock;
use serde_json::Value;

use crate::context::ScriptContext;
use crate::error::ScriptError;
use crate::module::API_PREFIX;

/// Kind of [`ScriptResource`].
pub const SCRIPT: ResourceKind = ResourceKind::new("script");

/// A callable exposed to or defined by script code.
pub type NativeFn = Arc<
    dyn Fn(ScriptContext, Vec<Value>) -> BoxFuture<'static, Result<Value, ScriptError>>
        + Send
        + Sync,
>;

/// Wraps an async closure as a [`NativeFn`].
///
/// ```
/// use jibbr_script::native_fn;
/// use serde_json::json;
///
/// let add = native_fn(|_cx, args| async move {
///     let sum: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
///     Ok(json!(sum))
/// });
/// # let _ = add;
/// ```
pub fn native_fn<F, Fut>(f: F) -> NativeFn
where
    F: Fn(ScriptContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ScriptError>> + Send + 'static,
{
    Arc::new(
        move |cx: ScriptContext, args: Vec<Value>| -> BoxFuture<'static, Result<Value, ScriptError>> {
            Box::pin(f(cx, args))
        },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Script
// ─────────────────────────────────────────────────────────────────────────────

/// A compiled script: its top-level body, run once per environment.
#[derive(Clone)]
pub struct Script {
    name: Arc<str>,
    body: NativeFn,
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Script {
    /// Creates a script with the given top-level body.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, body: NativeFn) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    /// Returns the identifier the script was compiled from.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the top-level body in `cx`.
    pub fn run(&self, cx: ScriptContext) -> BoxFuture<'static, Result<Value, ScriptError>> {
        (self.body)(cx, Vec::new())
    }
}

/// Turns source text into a runnable [`Script`].
pub trait ScriptCompiler: Send + Sync + 'static {
    /// Compiles `source`, identified by `identifier` (`lib/util.js`,
    /// `jj/strings.js`). Errors are reported as a human-readable reason.
    fn compile(&self, identifier: &str, source: &str) -> Result<Script, String>;
}

type Factory = Arc<dyn Fn(&str) -> Result<NativeFn, String> + Send + Sync>;

/// Compiler for natively bound scripts, keyed by identifier.
#[derive(Default)]
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<String, Factory>>,
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scripts = self.scripts.read();
        f.debug_struct("ScriptRegistry")
            .field("scripts", &scripts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ScriptRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `body` to `identifier`, ignoring the file's source.
    pub fn register(&self, identifier: impl Into<String>, body: NativeFn) -> &Self {
        self.register_factory(identifier, move |_source| Ok(Arc::clone(&body)))
    }

    /// Binds a factory that builds the body from the file's source, or
    /// rejects it with a compile error.
    pub fn register_factory<F>(&self, identifier: impl Into<String>, factory: F) -> &Self
    where
        F: Fn(&str) -> Result<NativeFn, String> + Send + Sync + 'static,
    {
        self.scripts.write().insert(identifier.into(), Arc::new(factory));
        self
    }

    /// Returns `true` if `identifier` has a binding.
    #[must_use]
    pub fn contains(&self, identifier: &str) -> bool {
        self.scripts.read().contains_key(identifier)
    }
}

impl ScriptCompiler for ScriptRegistry {
    fn compile(&self, identifier: &str, source: &str) -> Result<Script, String> {
        let factory = self
            .scripts
            .read()
            .get(identifier)
            .cloned()
            .ok_or_else(|| format!("no native binding for '{identifier}'"))?;
        let body = factory(source)?;
        Ok(Script::new(identifier, body))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ScriptResource
// ─────────────────────────────────────────────────────────────────────────────

/// A `.js` file and the script compiled from it.
#[derive(Debug)]
pub struct ScriptResource {
    base: ResourceBase,
    snapshot: FileSnapshot,
    script: Script,
}

impl ScriptResource {
    /// Returns the compiled script.
    #[must_use]
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Returns the file snapshot the script was compiled from.
    #[must_use]
    pub fn snapshot(&self) -> &FileSnapshot {
        &self.snapshot
    }
}

impl Resource for ScriptResource {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn needs_replacing(&self) -> bool {
        self.snapshot.is_stale()
    }

    fn path(&self) -> Option<&Path> {
        Some(self.snapshot.path())
    }
}

/// Reads and compiles [`ScriptResource`]s.
pub struct ScriptResourceCreator {
    settings: Arc<ResourceSettings>,
    compiler: Arc<dyn ScriptCompiler>,
}

impl fmt::Debug for ScriptResourceCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptResourceCreator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ScriptResourceCreator {
    /// Creates a creator reading from `settings` and compiling with `compiler`.
    #[must_use]
    pub fn new(settings: Arc<ResourceSettings>, compiler: Arc<dyn ScriptCompiler>) -> Self {
        Self { settings, compiler }
    }
}

/// The identifier a script is compiled under: API modules keep their prefix.
fn compile_identifier(key: &ResourceKey) -> String {
    match key.location() {
        Location::ApiModules => format!("{API_PREFIX}{}", key.name()),
        _ => key.name().to_owned(),
    }
}

impl ResourceCreator for ScriptResourceCreator {
    fn kind(&self) -> ResourceKind {
        SCRIPT
    }

    fn create(
        &self,
        _cache: &ResourceCache,
        key: &ResourceKey,
    ) -> Result<Arc<dyn Resource>, ResourceError> {
        let path = self.settings.path_for(key)?;
        let snapshot = FileSnapshot::read(key, &path, self.settings.max_file_size)?;
        let identifier = compile_identifier(key);
        let script = self
            .compiler
            .compile(&identifier, snapshot.text(key)?)
            .map_err(|reason| {
                tracing::debug!(%key, %reason, "script failed to compile");
                ResourceError::NotViable {
                    key: key.clone(),
                    reason,
                }
            })?;

        Ok(Arc::new(ScriptResource {
            base: ResourceBase::new(key.clone()),
            snapshot,
            script,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn creator(dir: &Path, registry: ScriptRegistry) -> ScriptResourceCreator {
        ScriptResourceCreator::new(
            Arc::new(ResourceSettings::rooted_at(dir)),
            Arc::new(registry),
        )
    }

    #[test]
    fn registry_rejects_unbound_and_broken_sources() {
        let registry = ScriptRegistry::new();
        registry.register_factory("main.js", |source| {
            if source.contains("syntax error") {
                Err("unexpected token".to_owned())
            } else {
                Ok(native_fn(|_cx, _args| async { Ok(json!(null)) }))
            }
        });

        assert!(registry.contains("main.js"));
        assert!(registry.compile("main.js", "ok").is_ok());
        assert_eq!(
            registry.compile("main.js", "syntax error").map(|_| ()),
            Err("unexpected token".to_owned())
        );
        assert!(registry.compile("other.js", "").is_err());
    }

    #[test]
    fn creator_compiles_files_and_reports_failures_as_not_viable() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("good.js"), "fine").expect("write");
        fs::write(dir.path().join("bad.js"), "syntax error").expect("write");
        fs::create_dir(dir.path().join("api")).expect("mkdir");
        fs::write(dir.path().join("api/strings.js"), "fine").expect("write");

        let registry = ScriptRegistry::new();
        let body = |source: &str| {
            if source.contains("syntax error") {
                Err("unexpected token".to_owned())
            } else {
                Ok(native_fn(|_cx, _args| async { Ok(json!(null)) }))
            }
        };
        registry.register_factory("good.js", body);
        registry.register_factory("bad.js", body);
        registry.register_factory("jj/strings.js", body);

        let creator = creator(dir.path(), registry);
        let cache = ResourceCache::new();

        let good = creator
            .create(&cache, &ResourceKey::new(SCRIPT, Location::Base, "good.js"))
            .expect("compiles");
        let good = good.downcast_arc::<ScriptResource>().expect("script resource");
        assert_eq!(good.script().name(), "good.js");
        assert!(!good.needs_replacing());

        let api = creator
            .create(&cache, &ResourceKey::new(SCRIPT, Location::ApiModules, "strings.js"))
            .expect("compiles");
        let api = api.downcast_arc::<ScriptResource>().expect("script resource");
        assert_eq!(api.script().name(), "jj/strings.js");

        let bad = creator.create(&cache, &ResourceKey::new(SCRIPT, Location::Base, "bad.js"));
        assert!(matches!(bad, Err(ResourceError::NotViable { ref reason, .. }) if reason == "unexpected token"));

        let missing = creator.create(&cache, &ResourceKey::new(SCRIPT, Location::Base, "missing.js"));
        assert!(matches!(missing, Err(ResourceError::NotFound(_))));
    }
}
