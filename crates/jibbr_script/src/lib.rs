//! Script environments and CommonJS-style modules on top of the resource
//! cache and the affinity scheduler.
//!
//! A script runs inside a [`ScriptEnvironment`]: a cached resource holding
//! its scope, exports, functions and event handlers. Every piece of code
//! touching an environment runs on the environment's affinity, so scope
//! access is single-writer without locks in script code.
//!
//! Script code is written as native async closures ([`NativeFn`]) that
//! receive a [`ScriptContext`]. Awaiting [`ScriptContext::require`] or
//! [`ScriptContext::suspend_with`] suspends the script without blocking a
//! thread; it continues when the pending key is resumed, from any thread.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use jibbr_execution::{AffinityScheduler, SchedulerConfig};
//! use jibbr_resource::{ResourceCache, ResourceSettings};
//! use jibbr_script::{native_fn, ScriptExecutor, ScriptRegistry, ScriptServices};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), jibbr_script::ScriptError> {
//! let registry = Arc::new(ScriptRegistry::new());
//! registry.register("main.js", native_fn(|cx, _| async move {
//!     let config = cx.require("./config").await?;
//!     cx.export("port", config["port"].clone());
//!     Ok(json!(null))
//! }));
//!
//! let scheduler = Arc::new(AffinityScheduler::new(
//!     tokio::runtime::Handle::current(),
//!     SchedulerConfig::default(),
//! ));
//! let services = ScriptServices::new(Arc::new(ResourceCache::new()), scheduler);
//! services.install_creators(Arc::new(ResourceSettings::rooted_at("app")), registry);
//!
//! let executor = ScriptExecutor::new(Arc::new(services));
//! let main = executor.environment("main.js").await?;
//! println!("{}", main.exports()["port"]);
//! # Ok(())
//! # }
//! ```

mod context;
mod environment;
mod error;
mod events;
mod executor;
mod module;
mod script;
mod services;

pub use context::ScriptContext;
pub use environment::{
    EnvironmentState, MODULE_ENVIRONMENT, ModuleBody, SCRIPT_ENVIRONMENT, ScriptEnvironment,
};
pub use error::ScriptError;
pub use events::{ScriptEvent, ScriptEventKind};
pub use executor::{Completion, Execution, ScriptExecutor};
pub use module::{API_PREFIX, ModuleIdentifier, ModuleResolver};
pub use script::{
    NativeFn, SCRIPT, Script, ScriptCompiler, ScriptRegistry, ScriptResource,
    ScriptResourceCreator, native_fn,
};
pub use services::{ScriptContinuations, ScriptServices};
