//! The handle running script code works through.

use core::fmt;
use std::sync::Arc;

use jibbr_execution::PendingKey;
use jibbr_resource::Resource;
use parking_lot::Mutex;
use serde_json::Value;

use crate::environment::ScriptEnvironment;
use crate::error::ScriptError;
use crate::module::ModuleResolver;
use crate::script::NativeFn;
use crate::services::ScriptServices;

/// Access to the current environment from inside script code.
///
/// Cloning is cheap; clones share the record of the last suspension, which
/// the executor reads to report the [`PendingKey`] of a suspended execution.
#[derive(Clone)]
pub struct ScriptContext {
    env: Arc<ScriptEnvironment>,
    services: Arc<ScriptServices>,
    last_suspension: Arc<Mutex<Option<PendingKey>>>,
}

impl fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("environment", self.env.key())
            .finish_non_exhaustive()
    }
}

impl ScriptContext {
    pub(crate) fn new(env: Arc<ScriptEnvironment>, services: Arc<ScriptServices>) -> Self {
        Self {
            env,
            services,
            last_suspension: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns the environment the code runs in.
    #[must_use]
    pub fn environment(&self) -> &Arc<ScriptEnvironment> {
        &self.env
    }

    /// Returns the shared services.
    #[must_use]
    pub fn services(&self) -> &Arc<ScriptServices> {
        &self.services
    }

    /// Reads a scope variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.env.get(name)
    }

    /// Writes a scope variable.
    pub fn set(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.env.set(name, value)
    }

    /// Adds a named export.
    pub fn export(&self, name: impl Into<String>, value: Value) {
        self.env.export(name, value);
    }

    /// Returns the current exports.
    #[must_use]
    pub fn exports(&self) -> Value {
        self.env.exports()
    }

    /// Replaces the exports (`module.exports = ...`).
    pub fn set_exports(&self, exports: Value) {
        self.env.set_exports(exports);
    }

    /// Defines a function callers can execute by name.
    pub fn define_function(&self, name: impl Into<String>, function: NativeFn) {
        self.env.define_function(name, function);
    }

    /// Registers an event handler.
    pub fn on(&self, event: impl Into<String>, handler: NativeFn) {
        self.env.on(event, handler);
    }

    /// Loads a module and returns its exports.
    ///
    /// Suspends unless the module is already initialized, or is part of a
    /// require cycle through this environment, in which case its partial
    /// exports are returned immediately.
    pub async fn require(&self, identifier: &str) -> Result<Value, ScriptError> {
        ModuleResolver::new(Arc::clone(&self.services))
            .require(self, identifier)
            .await
    }

    /// Suspends until the key passed to `start` is resumed.
    ///
    /// `start` hands the key to whatever collaborator will finish the work.
    /// An error resume surfaces here as `Err`.
    pub async fn suspend_with<F>(&self, start: F) -> Result<Value, ScriptError>
    where
        F: FnOnce(PendingKey) + Send,
    {
        let (key, suspension) = self.env.continuations().suspend()?;
        *self.last_suspension.lock() = Some(key.clone());
        start(key);
        suspension.await
    }

    pub(crate) fn last_suspension(&self) -> Option<PendingKey> {
        self.last_suspension.lock().clone()
    }
}
