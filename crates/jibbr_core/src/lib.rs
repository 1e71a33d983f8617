//! Runtime assembly for jibbr.
//!
//! Ties the resource cache, affinity scheduler, continuation registry and
//! script executor together behind a single [`Runtime`], configured from a
//! [`RuntimeConfig`] that can be read from JSON. Logging is set up through
//! [`init_tracing`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use jibbr_core::{Runtime, RuntimeConfig};
//! use jibbr_resource::ResourceSettings;
//! use jibbr_script::{ScriptRegistry, native_fn};
//! use serde_json::json;
//!
//! let registry = Arc::new(ScriptRegistry::new());
//! registry.register(
//!     "main.js",
//!     native_fn(|cx, _| async move {
//!         cx.export("ready", json!(true));
//!         Ok(json!(null))
//!     }),
//! );
//!
//! let runtime = Runtime::builder()
//!     .with_config(RuntimeConfig::default().with_resources(ResourceSettings::rooted_at("app")))
//!     .with_compiler(registry)
//!     .with_tracing(true)
//!     .build()
//!     .unwrap();
//!
//! let env = runtime.block_on(runtime.environment("main.js")).unwrap();
//! assert_eq!(env.exports()["ready"], json!(true));
//! runtime.shutdown();
//! ```

mod config;
mod error;
mod runtime;
mod tracing_setup;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use runtime::{Runtime, RuntimeBuilder};
pub use tracing_setup::{TracingConfig, TracingFormat, init_tracing};
