//! The assembled runtime.
//!
//! [`Runtime`] owns one of each collaborator (cache, scheduler, continuation
//! registry, executor and watcher) wired together from a [`RuntimeConfig`].

use core::future::Future;
use core::time::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jibbr_execution::{AffinityScheduler, PendingKey, ResumeError};
use jibbr_resource::{
    Location, Resource, ResourceCache, ResourceCreator, ResourceError, ResourceKey, ResourceKind,
    ResourceSettings, ResourceWatcher, WatchHandle,
};
use jibbr_script::{
    Execution, ScriptCompiler, ScriptEnvironment, ScriptError, ScriptExecutor, ScriptRegistry,
    ScriptServices,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::tracing_setup::init_tracing;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// RuntimeBuilder
// ─────────────────────────────────────────────────────────────────────────────

/// Builds a [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    compiler: Option<Arc<dyn ScriptCompiler>>,
    handle: Option<Handle>,
    creators: Vec<Arc<dyn ResourceCreator>>,
    init_tracing: bool,
}

impl RuntimeBuilder {
    fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            compiler: None,
            handle: None,
            creators: Vec::new(),
            init_tracing: false,
        }
    }

    /// Uses `config` instead of the defaults.
    #[must_use]
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Compiles scripts with `compiler`. Defaults to an empty
    /// [`ScriptRegistry`].
    #[must_use]
    pub fn with_compiler(mut self, compiler: Arc<dyn ScriptCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Runs on an existing tokio runtime instead of starting one.
    #[must_use]
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Registers an extra resource creator. Creators for the built-in file
    /// and JSON kinds replace the defaults.
    #[must_use]
    pub fn with_creator(mut self, creator: Arc<dyn ResourceCreator>) -> Self {
        self.creators.push(creator);
        self
    }

    /// Installs the global tracing subscriber from the configuration.
    #[must_use]
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.init_tracing = enabled;
        self
    }

    /// Starts the runtime.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let Self {
            config,
            compiler,
            handle,
            creators,
            init_tracing: install_tracing,
        } = self;
        config.validate()?;

        if install_tracing {
            let _ = init_tracing(&config.tracing);
        }

        let (tokio, handle) = match handle {
            Some(handle) => (None, handle),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(config.worker_threads)
                    .thread_name("jibbr-worker")
                    .enable_all()
                    .build()?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            }
        };

        let scheduler = Arc::new(AffinityScheduler::new(
            handle.clone(),
            config.scheduler_config(),
        ));
        let cache = Arc::new(ResourceCache::new());
        for creator in creators {
            cache.register_creator(creator);
        }

        let mut services = ScriptServices::new(Arc::clone(&cache), scheduler);
        if let Some(timeout) = config.load_timeout() {
            services = services.with_load_timeout(timeout);
        }
        let compiler =
            compiler.unwrap_or_else(|| Arc::new(ScriptRegistry::new()) as Arc<dyn ScriptCompiler>);
        services.install_creators(Arc::new(config.resources.clone()), compiler);

        let executor = ScriptExecutor::new(Arc::new(services));
        let watcher = ResourceWatcher::new(Arc::clone(&cache), handle.clone());
        let watch = config
            .watch_files
            .then(|| watcher.watch(&watch_roots(&config.resources), config.poll_interval()));

        tracing::info!(
            base = %config.resources.base_path.display(),
            owned_runtime = tokio.is_some(),
            watching = watch.is_some(),
            native_watch = watch.as_ref().is_some_and(WatchHandle::is_native),
            "jibbr runtime started"
        );

        Ok(Runtime {
            tokio,
            handle,
            config,
            cache,
            executor,
            watcher,
            watch: Mutex::new(watch),
        })
    }
}

/// Existing resource directories, without those nested inside another.
fn watch_roots(settings: &ResourceSettings) -> Vec<PathBuf> {
    let directories: Vec<&Path> = [
        settings.base_path.as_path(),
        settings.api_modules_path.as_path(),
        settings.assets_path.as_path(),
    ]
    .into_iter()
    .filter(|directory| directory.is_dir())
    .collect();

    let mut roots: Vec<PathBuf> = Vec::new();
    for directory in &directories {
        let nested = directories
            .iter()
            .any(|other| other != directory && directory.starts_with(other));
        if !nested && !roots.iter().any(|root| root == directory) {
            roots.push(directory.to_path_buf());
        }
    }
    roots
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// A running jibbr instance.
///
/// A runtime built without [`RuntimeBuilder::with_handle`] owns its tokio
/// runtime, and must then be dropped or [shut down](Runtime::shutdown)
/// outside of async code.
pub struct Runtime {
    tokio: Option<tokio::runtime::Runtime>,
    handle: Handle,
    config: RuntimeConfig,
    cache: Arc<ResourceCache>,
    executor: ScriptExecutor,
    watcher: ResourceWatcher,
    watch: Mutex<Option<WatchHandle>>,
}

impl Runtime {
    /// Starts configuring a runtime.
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Runs `future` to completion on this runtime's threads, blocking the
    /// caller. Must not be called from async code.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        match &self.tokio {
            Some(runtime) => runtime.block_on(future),
            None => self.handle.block_on(future),
        }
    }

    /// Returns the tokio handle everything runs on.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Returns the configuration the runtime was built from.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Returns the resource cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Returns the script executor.
    #[must_use]
    pub fn executor(&self) -> &ScriptExecutor {
        &self.executor
    }

    /// Returns the shared script services.
    #[must_use]
    pub fn services(&self) -> &Arc<ScriptServices> {
        self.executor.services()
    }

    /// Returns the resource watcher.
    #[must_use]
    pub fn watcher(&self) -> &ResourceWatcher {
        &self.watcher
    }

    /// Loads a resource through the registered creators. Blocks on file
    /// I/O; async callers should go through the scheduler's I/O pool.
    pub fn load_resource(
        &self,
        kind: ResourceKind,
        location: Location,
        name: &str,
        args: &[&str],
    ) -> Result<Arc<dyn Resource>, ResourceError> {
        self.cache.load(kind, location, name, args)
    }

    /// Returns the live resource for `key`, if any.
    #[must_use]
    pub fn find_resource(&self, key: &ResourceKey) -> Option<Arc<dyn Resource>> {
        self.cache.find(key)
    }

    /// Returns the initialized root environment for the script `name`.
    pub async fn environment(&self, name: &str) -> Result<Arc<ScriptEnvironment>, ScriptError> {
        self.executor.environment(name).await
    }

    /// Calls `function` in the root environment of `script`.
    pub async fn execute(
        &self,
        script: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Execution, ScriptError> {
        let env = self.executor.environment(script).await?;
        self.executor.execute(&env, function, args).await
    }

    /// Resumes a suspended script.
    pub fn resume(&self, key: &PendingKey, result: Result<Value, ScriptError>) -> Result<(), ResumeError> {
        self.executor.resume(key, result)
    }

    /// Kills `resource` and its dependents; dead roots reload in the
    /// background.
    pub fn invalidate(&self, resource: &Arc<dyn Resource>) -> Vec<ResourceKey> {
        self.watcher.invalidate(resource)
    }

    /// Stops watching, kills every resource and, if the runtime owns its tokio
    /// runtime, shuts it down.
    pub fn shutdown(self) {
        let watch = self.watch.lock().take();
        match (&self.tokio, watch) {
            (Some(runtime), Some(watch)) => runtime.block_on(watch.stop()),
            (_, watch) => drop(watch),
        }

        self.cache.kill_all();
        tracing::info!("jibbr runtime stopped");

        if let Some(runtime) = self.tokio {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("owned_runtime", &self.tokio.is_some())
            .field("resources", &self.cache.len())
            .finish_non_exhaustive()
    }
}
