//! Running script code on environment affinities.
//!
//! The [`ScriptExecutor`] is the entry point for callers outside the
//! scheduler: it loads and initializes root environments, calls the
//! functions they define, delivers events to their handlers and forwards
//! resumes from external collaborators.
//!
//! An execution reports whether it finished without suspending. If it
//! suspended, the caller gets a [`Completion`] carrying the [`PendingKey`]
//! the script is parked on and resolving once the script finishes.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;

use jibbr_execution::{PendingKey, ResumeError, ScheduleError, TaskHandle};
use jibbr_resource::{Location, Resource};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::context::ScriptContext;
use crate::environment::{ModuleBody, SCRIPT_ENVIRONMENT, ScriptEnvironment, Waiter};
use crate::error::ScriptError;
use crate::events::ScriptEvent;
use crate::script::NativeFn;
use crate::services::ScriptServices;

// ─────────────────────────────────────────────────────────────────────────────
// Execution results
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of [`ScriptExecutor::execute`].
#[derive(Debug)]
pub enum Execution {
    /// The call finished without suspending.
    Completed(Result<Value, ScriptError>),
    /// The call suspended; the completion resolves when it finishes.
    Suspended(Completion),
}

impl Execution {
    /// Returns `true` if the call suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(self, Execution::Suspended(_))
    }

    /// Returns the key the call is parked on, if it suspended through one.
    #[must_use]
    pub fn pending_key(&self) -> Option<&PendingKey> {
        match self {
            Execution::Completed(_) => None,
            Execution::Suspended(completion) => completion.key(),
        }
    }

    /// Waits for the final result.
    pub async fn finish(self) -> Result<Value, ScriptError> {
        match self {
            Execution::Completed(result) => result,
            Execution::Suspended(completion) => completion.await,
        }
    }
}

/// The eventual result of a suspended execution.
#[derive(Debug)]
pub struct Completion {
    key: Option<PendingKey>,
    rx: oneshot::Receiver<Result<Value, ScriptError>>,
    handle: Handle,
}

impl Completion {
    /// Returns the key the execution suspended on.
    ///
    /// `None` if the script yielded without going through a pending key.
    #[must_use]
    pub fn key(&self) -> Option<&PendingKey> {
        self.key.as_ref()
    }

    /// Calls `callback` with the result once the execution finishes.
    pub fn on_complete<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Value, ScriptError>) + Send + 'static,
    {
        let handle = self.handle.clone();
        handle.spawn(async move { callback(self.await) })
    }
}

impl Future for Completion {
    type Output = Result<Value, ScriptError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(ScriptError::Schedule(ScheduleError::TaskDropped)))
        })
    }
}

enum FirstPoll {
    Completed(Result<Value, ScriptError>),
    Suspended(Option<PendingKey>),
}

// ─────────────────────────────────────────────────────────────────────────────
// ScriptExecutor
// ─────────────────────────────────────────────────────────────────────────────

/// Loads environments and runs code in them.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    services: Arc<ScriptServices>,
}

impl ScriptExecutor {
    /// Creates an executor. Creators must already be installed on the
    /// services' cache.
    #[must_use]
    pub fn new(services: Arc<ScriptServices>) -> Self {
        Self { services }
    }

    /// Returns the shared services.
    #[must_use]
    pub fn services(&self) -> &Arc<ScriptServices> {
        &self.services
    }

    /// Returns the initialized root environment running the script `name`,
    /// loading it on the I/O pool and initializing it if needed.
    pub async fn environment(&self, name: &str) -> Result<Arc<ScriptEnvironment>, ScriptError> {
        let cache = Arc::clone(self.services.cache());
        let name = name.to_owned();
        let env = self
            .services
            .scheduler()
            .run_on_io(move || {
                cache.load_typed::<ScriptEnvironment>(SCRIPT_ENVIRONMENT, Location::Virtual, &name, &[])
            })
            .await??;
        self.initialize(&env).await?;
        Ok(env)
    }

    /// Returns the live root environment for `name` without loading or
    /// initializing anything.
    #[must_use]
    pub fn find_environment(&self, name: &str) -> Option<Arc<ScriptEnvironment>> {
        self.services
            .cache()
            .find_typed::<ScriptEnvironment>(&ScriptEnvironment::root_key(name))
    }

    /// Runs the top-level script of `env` once and returns its exports.
    ///
    /// Concurrent callers share the same initialization. A failed
    /// initialization kills the environment, so the next load rebuilds it.
    pub async fn initialize(&self, env: &Arc<ScriptEnvironment>) -> Result<Value, ScriptError> {
        let (tx, rx) = oneshot::channel();
        if env.enroll(Waiter::Channel(tx)) {
            let _ = spawn_initialization(&self.services, Arc::clone(env));
        }
        rx.await
            .unwrap_or_else(|_| Err(ScriptError::EnvironmentDead(env.key().to_string())))
    }

    /// Calls the function `function` defined by `env`.
    pub async fn execute(
        &self,
        env: &Arc<ScriptEnvironment>,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Execution, ScriptError> {
        let callable = env
            .function(function)
            .ok_or_else(|| ScriptError::NoSuchFunction(function.to_owned()))?;
        self.execute_callable(env, callable, args).await
    }

    /// Calls `callable` in `env`, on its affinity.
    pub async fn execute_callable(
        &self,
        env: &Arc<ScriptEnvironment>,
        callable: NativeFn,
        args: Vec<Value>,
    ) -> Result<Execution, ScriptError> {
        if !env.is_alive() {
            return Err(ScriptError::EnvironmentDead(env.key().to_string()));
        }

        let cx = ScriptContext::new(Arc::clone(env), Arc::clone(&self.services));
        let (first_tx, first_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let _ = self.services.scheduler().run_on(env.affinity().clone(), async move {
            let mut call = callable(cx.clone(), args);
            match futures::poll!(&mut call) {
                Poll::Ready(result) => {
                    let _ = first_tx.send(FirstPoll::Completed(result));
                }
                Poll::Pending => {
                    let _ = first_tx.send(FirstPoll::Suspended(cx.last_suspension()));
                    let _ = done_tx.send(call.await);
                }
            }
        });

        match first_rx.await {
            Ok(FirstPoll::Completed(result)) => Ok(Execution::Completed(result)),
            Ok(FirstPoll::Suspended(key)) => Ok(Execution::Suspended(Completion {
                key,
                rx: done_rx,
                handle: self.services.scheduler().handle().clone(),
            })),
            Err(_) => Err(ScriptError::Schedule(ScheduleError::TaskDropped)),
        }
    }

    /// Resumes a suspended script. Used by external collaborators once
    /// their work finishes.
    pub fn resume(&self, key: &PendingKey, result: Result<Value, ScriptError>) -> Result<(), ResumeError> {
        self.services.continuations().resume(key, result)
    }

    /// Runs every handler `env` registered for `event`, in order, on its
    /// affinity. Stops at the first failing handler.
    ///
    /// Returns how many handlers ran.
    pub async fn emit(
        &self,
        env: &Arc<ScriptEnvironment>,
        event: &str,
        payload: Value,
    ) -> Result<usize, ScriptError> {
        let handlers = env.handlers(event);
        if handlers.is_empty() {
            return Ok(0);
        }
        if !env.is_alive() {
            return Err(ScriptError::EnvironmentDead(env.key().to_string()));
        }

        let cx = ScriptContext::new(Arc::clone(env), Arc::clone(&self.services));
        self.services
            .scheduler()
            .run_on(env.affinity().clone(), async move {
                for handler in &handlers {
                    handler(cx.clone(), vec![payload.clone()]).await?;
                }
                Ok::<_, ScriptError>(handlers.len())
            })
            .await?
    }
}

/// Runs the body of `env` on its affinity and settles everyone waiting.
pub(crate) fn spawn_initialization(
    services: &Arc<ScriptServices>,
    env: Arc<ScriptEnvironment>,
) -> TaskHandle<()> {
    let affinity = env.affinity().clone();
    let services = Arc::clone(services);
    let scheduler = Arc::clone(services.scheduler());

    scheduler.run_on(affinity, async move {
        tracing::debug!(key = %env.key(), "initializing script environment");
        let cx = ScriptContext::new(Arc::clone(&env), Arc::clone(&services));
        let result = match env.body() {
            ModuleBody::Script(script) => script.script().run(cx).await.map(|_| env.exports()),
            ModuleBody::Json(value) => {
                env.set_exports(value.clone());
                Ok(value.clone())
            }
        };

        let waiters = env.finish_initialization(&result);
        match &result {
            Ok(_) => {
                services.events().invoke(&ScriptEvent::Initialized {
                    key: env.key().clone(),
                });
            }
            Err(error) => {
                tracing::warn!(key = %env.key(), %error, "script initialization failed");
                services.events().invoke(&ScriptEvent::InitializationFailed {
                    key: env.key().clone(),
                    error: error.to_string(),
                });
                let resource: Arc<dyn Resource> = Arc::clone(&env) as Arc<dyn Resource>;
                let _ = services.cache().kill(&resource);
            }
        }
        for waiter in waiters {
            waiter.deliver(services.continuations(), result.clone());
        }
    })
}
