//! Script environments.
//!
//! A [`ScriptEnvironment`] is the live state of one script: its scope, its
//! exports, the functions and event handlers it defined, and where it is in
//! its lifecycle. It is also a [`Resource`], so it dies with the script file
//! it was built from and takes its child modules down with it.
//!
//! Root environments are addressed by script name and keep their cache slot
//! when killed, so the next lookup rebuilds them in place. Module
//! environments are keyed by `(parent root, identifier)` and are removed.
//!
//! All code touching an environment runs on its [`AffinityKey`], one task at
//! a time.

use core::fmt;
use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use jibbr_events::HookRegistry;
use jibbr_execution::{AffinityKey, AffinityScheduler, PendingKey};
use jibbr_resource::{
    Location, Resource, ResourceBase, ResourceCache, ResourceCreator, ResourceError, ResourceKey,
    ResourceKind,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::ScriptError;
use crate::events::ScriptEvent;
use crate::script::{NativeFn, SCRIPT, ScriptResource};
use crate::services::ScriptContinuations;

/// Kind of root [`ScriptEnvironment`]s.
pub const SCRIPT_ENVIRONMENT: ResourceKind = ResourceKind::new("script-environment");

/// Kind of module [`ScriptEnvironment`]s.
pub const MODULE_ENVIRONMENT: ResourceKind = ResourceKind::new("module-environment");

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Where an environment is in its lifecycle.
#[derive(Debug, Clone)]
pub enum EnvironmentState {
    /// Created, top-level script not started.
    Uninitialized,
    /// Top-level script running (possibly suspended).
    Initializing,
    /// Top-level script finished; exports are final.
    Initialized,
    /// Top-level script failed.
    Errored(ScriptError),
    /// Killed.
    Dead,
}

/// What a module environment evaluates.
#[derive(Debug, Clone)]
pub enum ModuleBody {
    /// A compiled `.js` file.
    Script(Arc<ScriptResource>),
    /// A parsed `.json` file, exported as is.
    Json(Value),
}

/// Someone waiting for initialization to finish.
pub(crate) enum Waiter {
    /// A suspended script task.
    Pending(PendingKey),
    /// A caller outside the scheduler.
    Channel(oneshot::Sender<Result<Value, ScriptError>>),
}

impl Waiter {
    pub(crate) fn deliver(self, continuations: &ScriptContinuations, result: Result<Value, ScriptError>) {
        match self {
            // Already settled keys were timed out or cancelled.
            Waiter::Pending(key) if key.is_settled() => {}
            Waiter::Pending(key) => {
                let _ = continuations.resume(&key, result);
            }
            Waiter::Channel(sender) => {
                let _ = sender.send(result);
            }
        }
    }
}

struct Lifecycle {
    state: EnvironmentState,
    waiters: Vec<Waiter>,
}

/// Services every environment needs while it lives and when it dies.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub(crate) continuations: Arc<ScriptContinuations>,
    pub(crate) scheduler: Arc<AffinityScheduler>,
    pub(crate) events: Arc<HookRegistry<ScriptEvent>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ScriptEnvironment
// ─────────────────────────────────────────────────────────────────────────────

/// The live state of one root script or module.
pub struct ScriptEnvironment {
    base: ResourceBase,
    affinity: AffinityKey,
    location: Location,
    module_path: Arc<str>,
    body: ModuleBody,
    parent: Option<Weak<ScriptEnvironment>>,
    required_by: Option<Weak<ScriptEnvironment>>,
    scope: Mutex<Map<String, Value>>,
    exports: Mutex<Value>,
    functions: Mutex<HashMap<String, NativeFn>>,
    handlers: Mutex<HashMap<String, Vec<NativeFn>>>,
    // Lock order: `lifecycle` before `exports`.
    lifecycle: Mutex<Lifecycle>,
    collaborators: Collaborators,
}

impl fmt::Debug for ScriptEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptEnvironment")
            .field("key", self.key())
            .field("affinity", &self.affinity)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ScriptEnvironment {
    /// Returns the key of the root environment running the script `name`.
    #[must_use]
    pub fn root_key(name: &str) -> ResourceKey {
        ResourceKey::new(SCRIPT_ENVIRONMENT, Location::Virtual, name)
    }

    fn new(
        key: ResourceKey,
        location: Location,
        module_path: Arc<str>,
        body: ModuleBody,
        parent: Option<Weak<ScriptEnvironment>>,
        required_by: Option<Weak<ScriptEnvironment>>,
        collaborators: Collaborators,
    ) -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        Self {
            affinity: AffinityKey::new(format!("{key}@{instance}")),
            base: ResourceBase::new(key),
            location,
            module_path,
            body,
            parent,
            required_by,
            scope: Mutex::new(Map::new()),
            exports: Mutex::new(Value::Object(Map::new())),
            functions: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle {
                state: EnvironmentState::Uninitialized,
                waiters: Vec::new(),
            }),
            collaborators,
        }
    }

    pub(crate) fn module(
        key: ResourceKey,
        location: Location,
        module_path: &str,
        body: ModuleBody,
        root: &Arc<ScriptEnvironment>,
        required_by: &Arc<ScriptEnvironment>,
        collaborators: Collaborators,
    ) -> Self {
        Self::new(
            key,
            location,
            module_path.into(),
            body,
            Some(Arc::downgrade(root)),
            Some(Arc::downgrade(required_by)),
            collaborators,
        )
    }

    /// Returns the affinity all code in this environment runs on.
    #[must_use]
    pub fn affinity(&self) -> &AffinityKey {
        &self.affinity
    }

    /// Returns the location relative requires resolve in.
    #[must_use]
    pub fn location(&self) -> Location {
        self.location
    }

    /// Returns the script name of a root or the normalized identifier of a
    /// module.
    #[must_use]
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    /// Returns the directory of [`module_path`](Self::module_path), empty at
    /// the top level.
    #[must_use]
    pub fn directory(&self) -> &str {
        self.module_path
            .rsplit_once('/')
            .map_or("", |(directory, _)| directory)
    }

    /// Returns what the environment evaluates.
    #[must_use]
    pub fn body(&self) -> &ModuleBody {
        &self.body
    }

    /// Returns `true` for root environments.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Returns the root environment this one belongs to, or `None` if it has
    /// been dropped.
    #[must_use]
    pub fn root(self: &Arc<Self>) -> Option<Arc<ScriptEnvironment>> {
        match &self.parent {
            None => Some(Arc::clone(self)),
            Some(parent) => parent.upgrade(),
        }
    }

    /// Returns `true` if `module` is this environment or one of the modules
    /// whose initialization required it, transitively.
    pub(crate) fn is_required_through(self: &Arc<Self>, module: &ScriptEnvironment) -> bool {
        let mut current = Some(Arc::clone(self));
        while let Some(env) = current {
            if core::ptr::eq(Arc::as_ptr(&env), module) {
                return true;
            }
            current = env.required_by.as_ref().and_then(Weak::upgrade);
        }
        false
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EnvironmentState {
        self.lifecycle.lock().state.clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scope and exports
    // ─────────────────────────────────────────────────────────────────────────

    /// Reads a scope variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.scope.lock().get(name).cloned()
    }

    /// Writes a scope variable, returning the previous value.
    pub fn set(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.scope.lock().insert(name.into(), value)
    }

    /// Returns a copy of the exports, partial while initializing.
    #[must_use]
    pub fn exports(&self) -> Value {
        self.exports.lock().clone()
    }

    /// Replaces the exports object.
    pub fn set_exports(&self, exports: Value) {
        *self.exports.lock() = exports;
    }

    /// Adds one named export. Non-object exports are replaced by an object.
    pub fn export(&self, name: impl Into<String>, value: Value) {
        let mut exports = self.exports.lock();
        if let Value::Object(map) = &mut *exports {
            map.insert(name.into(), value);
        } else {
            let mut map = Map::new();
            map.insert(name.into(), value);
            *exports = Value::Object(map);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Functions and handlers
    // ─────────────────────────────────────────────────────────────────────────

    /// Defines (or redefines) a callable function.
    pub fn define_function(&self, name: impl Into<String>, function: NativeFn) {
        self.functions.lock().insert(name.into(), function);
    }

    /// Returns the function called `name`.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<NativeFn> {
        self.functions.lock().get(name).cloned()
    }

    /// Returns the names of all defined functions, sorted.
    #[must_use]
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Registers a handler for `event`. Handlers run in registration order.
    pub fn on(&self, event: impl Into<String>, handler: NativeFn) {
        self.handlers.lock().entry(event.into()).or_default().push(handler);
    }

    /// Returns the handlers registered for `event`.
    #[must_use]
    pub fn handlers(&self, event: &str) -> Vec<NativeFn> {
        self.handlers.lock().get(event).cloned().unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    /// Registers `waiter` for the outcome of initialization.
    ///
    /// Returns `true` if the caller claimed the initialization and must start
    /// it. Settled outcomes are delivered immediately.
    pub(crate) fn enroll(&self, waiter: Waiter) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let settled = match &lifecycle.state {
            EnvironmentState::Uninitialized | EnvironmentState::Initializing => None,
            EnvironmentState::Initialized => Some(Ok(self.exports())),
            EnvironmentState::Errored(error) => Some(Err(error.clone())),
            EnvironmentState::Dead => Some(Err(ScriptError::ParentDied(self.key().to_string()))),
        };

        match settled {
            None => {
                let claimed = matches!(lifecycle.state, EnvironmentState::Uninitialized);
                if claimed {
                    lifecycle.state = EnvironmentState::Initializing;
                }
                lifecycle.waiters.push(waiter);
                claimed
            }
            Some(result) => {
                drop(lifecycle);
                waiter.deliver(&self.collaborators.continuations, result);
                false
            }
        }
    }

    /// Records the outcome of initialization and hands back the waiters.
    pub(crate) fn finish_initialization(&self, result: &Result<Value, ScriptError>) -> Vec<Waiter> {
        let mut lifecycle = self.lifecycle.lock();
        if matches!(lifecycle.state, EnvironmentState::Dead) {
            return Vec::new();
        }
        lifecycle.state = match result {
            Ok(_) => EnvironmentState::Initialized,
            Err(error) => EnvironmentState::Errored(error.clone()),
        };
        mem::take(&mut lifecycle.waiters)
    }

    pub(crate) fn continuations(&self) -> &Arc<ScriptContinuations> {
        &self.collaborators.continuations
    }
}

impl Resource for ScriptEnvironment {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn remove_on_reload(&self) -> bool {
        !self.is_root()
    }

    fn died(&self) {
        let waiters = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = EnvironmentState::Dead;
            mem::take(&mut lifecycle.waiters)
        };
        let error = ScriptError::ParentDied(self.key().to_string());
        for waiter in waiters {
            waiter.deliver(&self.collaborators.continuations, Err(error.clone()));
        }

        let failed = self.collaborators.continuations.fail_owner(&self.affinity);
        self.collaborators.scheduler.retire(&self.affinity);
        tracing::debug!(key = %self.key(), failed, "script environment died");
        self.collaborators.events.invoke(&ScriptEvent::Killed {
            key: self.key().clone(),
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Root creator
// ─────────────────────────────────────────────────────────────────────────────

/// Builds root environments from the script of the same name in
/// [`Location::Base`].
pub(crate) struct ScriptEnvironmentCreator {
    pub(crate) collaborators: Collaborators,
}

impl ResourceCreator for ScriptEnvironmentCreator {
    fn kind(&self) -> ResourceKind {
        SCRIPT_ENVIRONMENT
    }

    fn create(
        &self,
        cache: &ResourceCache,
        key: &ResourceKey,
    ) -> Result<Arc<dyn Resource>, ResourceError> {
        let script = cache.load_typed::<ScriptResource>(SCRIPT, Location::Base, key.name(), &[])?;
        let env: Arc<dyn Resource> = Arc::new(ScriptEnvironment::new(
            key.clone(),
            Location::Base,
            key.name().into(),
            ModuleBody::Script(Arc::clone(&script)),
            None,
            None,
            self.collaborators.clone(),
        ));
        let script: Arc<dyn Resource> = script;
        cache.add_dependent(&script, &env)?;
        Ok(env)
    }
}
