//! Shared handles every script operation needs.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use jibbr_events::HookRegistry;
use jibbr_execution::{AffinityScheduler, ContinuationRegistry};
use jibbr_resource::{
    FILE, FileResourceCreator, JSON, JsonResourceCreator, ResourceCache, ResourceSettings,
};
use serde_json::Value;

use crate::environment::{Collaborators, ScriptEnvironmentCreator};
use crate::error::ScriptError;
use crate::events::ScriptEvent;
use crate::script::{ScriptCompiler, ScriptResourceCreator};

/// The continuation registry scripts suspend through.
pub type ScriptContinuations = ContinuationRegistry<Value, ScriptError>;

/// Cache, scheduler, continuations and event hooks shared by the executor,
/// the module resolver and every running script.
pub struct ScriptServices {
    cache: Arc<ResourceCache>,
    scheduler: Arc<AffinityScheduler>,
    continuations: Arc<ScriptContinuations>,
    events: Arc<HookRegistry<ScriptEvent>>,
    load_timeout: Option<Duration>,
}

impl fmt::Debug for ScriptServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptServices")
            .field("scheduler", &self.scheduler)
            .field("continuations", &self.continuations)
            .field("load_timeout", &self.load_timeout)
            .finish_non_exhaustive()
    }
}

impl ScriptServices {
    /// Creates services over an existing cache and scheduler.
    #[must_use]
    pub fn new(cache: Arc<ResourceCache>, scheduler: Arc<AffinityScheduler>) -> Self {
        Self {
            cache,
            scheduler,
            continuations: Arc::new(ScriptContinuations::new()),
            events: Arc::new(HookRegistry::new()),
            load_timeout: None,
        }
    }

    /// Fails module loads that take longer than `timeout`.
    #[must_use]
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = Some(timeout);
        self
    }

    /// Registers the creators scripts are loaded through: files, JSON,
    /// compiled scripts and root environments.
    ///
    /// File and JSON creators already registered are left in place.
    pub fn install_creators(
        &self,
        settings: Arc<ResourceSettings>,
        compiler: Arc<dyn ScriptCompiler>,
    ) -> &Self {
        if !self.cache.has_creator(FILE) {
            self.cache
                .register_creator(Arc::new(FileResourceCreator::new(Arc::clone(&settings))));
        }
        if !self.cache.has_creator(JSON) {
            self.cache
                .register_creator(Arc::new(JsonResourceCreator::new(Arc::clone(&settings))));
        }
        self.cache
            .register_creator(Arc::new(ScriptResourceCreator::new(settings, compiler)));
        self.cache.register_creator(Arc::new(ScriptEnvironmentCreator {
            collaborators: self.collaborators(),
        }));
        self
    }

    /// Returns the resource cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Returns the scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<AffinityScheduler> {
        &self.scheduler
    }

    /// Returns the continuation registry.
    #[must_use]
    pub fn continuations(&self) -> &Arc<ScriptContinuations> {
        &self.continuations
    }

    /// Returns the script lifecycle hooks.
    #[must_use]
    pub fn events(&self) -> &Arc<HookRegistry<ScriptEvent>> {
        &self.events
    }

    /// Returns the module load timeout, if any.
    #[must_use]
    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout
    }

    pub(crate) fn collaborators(&self) -> Collaborators {
        Collaborators {
            continuations: Arc::clone(&self.continuations),
            scheduler: Arc::clone(&self.scheduler),
            events: Arc::clone(&self.events),
        }
    }
}
