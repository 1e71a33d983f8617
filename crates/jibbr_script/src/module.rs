//! CommonJS-style module resolution.
//!
//! `require(identifier)` resolves `identifier` against the requesting
//! environment and hands back the exports of a module environment keyed by
//! `(parent root, normalized identifier)`:
//!
//! 1. **Initialized**: the exports are returned without suspending.
//! 2. **Initializing**: if the module is on the requester's chain of
//!    requirers (a cycle), its partial exports are returned immediately;
//!    otherwise the requester suspends until initialization finishes.
//! 3. **Missing**: the requester suspends while the module is loaded on the
//!    I/O pool and initialized on its own affinity.
//!
//! # Identifiers
//!
//! - `./x`, `../x` resolve against the requester's directory and location;
//! - `jj/x` resolves in [`Location::ApiModules`];
//! - anything else resolves from the top of [`Location::Base`].
//!
//! Absolute identifiers and identifiers that climb above the top are
//! rejected. Without an extension, `x.js` is tried before `x.json`.

use core::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use jibbr_resource::{
    JSON, JsonResource, Location, Resource, ResourceCache, ResourceError, ResourceKey,
    ResourceKind,
};
use serde_json::Value;

use crate::context::ScriptContext;
use crate::environment::{
    EnvironmentState, MODULE_ENVIRONMENT, ModuleBody, ScriptEnvironment, Waiter,
};
use crate::error::ScriptError;
use crate::events::ScriptEvent;
use crate::executor::spawn_initialization;
use crate::script::{SCRIPT, ScriptResource};
use crate::services::ScriptServices;

/// Prefix of identifiers resolved in [`Location::ApiModules`].
pub const API_PREFIX: &str = "jj/";

// ─────────────────────────────────────────────────────────────────────────────
// ModuleIdentifier
// ─────────────────────────────────────────────────────────────────────────────

/// A normalized module identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleIdentifier {
    location: Location,
    path: String,
}

impl ModuleIdentifier {
    /// Normalizes `identifier` as required from `directory` in `location`.
    pub fn resolve(
        identifier: &str,
        location: Location,
        directory: &str,
    ) -> Result<Self, ScriptError> {
        let invalid = || ScriptError::InvalidIdentifier(identifier.to_owned());
        if identifier.is_empty()
            || identifier.starts_with('/')
            || identifier.contains(['\\', '\0'])
        {
            return Err(invalid());
        }

        let relative = identifier == "."
            || identifier == ".."
            || identifier.starts_with("./")
            || identifier.starts_with("../");
        let (location, directory, rest) = if let Some(rest) = identifier.strip_prefix(API_PREFIX) {
            (Location::ApiModules, "", rest)
        } else if relative {
            (location, directory, identifier)
        } else {
            (Location::Base, "", identifier)
        };

        let mut segments: Vec<&str> = directory
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        for segment in rest.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop().ok_or_else(invalid)?;
                }
                name => segments.push(name),
            }
        }
        if segments.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            location,
            path: segments.join("/"),
        })
    }

    /// Returns the location the module lives in.
    #[must_use]
    pub fn location(&self) -> Location {
        self.location
    }

    /// Returns the normalized path, without leading or trailing separators.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the key of this module's environment under `root`.
    #[must_use]
    pub fn environment_key(&self, root: &ResourceKey) -> ResourceKey {
        ResourceKey::new(MODULE_ENVIRONMENT, self.location, self.path.as_str())
            .with_args([root.to_string()])
    }

    /// Resource kinds and names to try, in order.
    fn candidates(&self) -> Vec<(ResourceKind, String)> {
        if self.path.ends_with(".js") {
            vec![(SCRIPT, self.path.clone())]
        } else if self.path.ends_with(".json") {
            vec![(JSON, self.path.clone())]
        } else {
            vec![
                (SCRIPT, format!("{}.js", self.path)),
                (JSON, format!("{}.json", self.path)),
            ]
        }
    }
}

impl fmt::Display for ModuleIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Location::ApiModules => write!(f, "{API_PREFIX}{}", self.path),
            _ => f.write_str(&self.path),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ModuleResolver
// ─────────────────────────────────────────────────────────────────────────────

/// Implements `require` on top of the shared services.
#[derive(Debug, Clone)]
pub struct ModuleResolver {
    services: Arc<ScriptServices>,
}

impl ModuleResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(services: Arc<ScriptServices>) -> Self {
        Self { services }
    }

    /// Resolves `identifier` for the environment of `cx` and returns the
    /// module's exports.
    pub async fn require(&self, cx: &ScriptContext, identifier: &str) -> Result<Value, ScriptError> {
        let requester = Arc::clone(cx.environment());
        let Some(root) = requester.root() else {
            return Err(ScriptError::ParentDied(requester.key().to_string()));
        };
        if !root.is_alive() || !requester.is_alive() {
            return Err(ScriptError::ParentDied(root.key().to_string()));
        }

        let id = ModuleIdentifier::resolve(identifier, requester.location(), requester.directory())?;
        let key = id.environment_key(root.key());

        if let Some(module) = self.services.cache().find_typed::<ScriptEnvironment>(&key) {
            match module.state() {
                EnvironmentState::Initialized => return Ok(module.exports()),
                EnvironmentState::Initializing if requester.is_required_through(&module) => {
                    tracing::debug!(
                        module = %id,
                        requester = %requester.key(),
                        "require cycle, returning partial exports"
                    );
                    return Ok(module.exports());
                }
                _ => {}
            }
        }

        let services = Arc::clone(&self.services);
        cx.suspend_with(move |pending| {
            if let Some(timeout) = services.load_timeout() {
                let _ = services.continuations().expire_after(&pending, timeout);
            }
            let io = Arc::clone(&services);
            let _ = services.scheduler().run_on_io(move || {
                let loaded = panic::catch_unwind(AssertUnwindSafe(|| {
                    load_module(&io, &root, &requester, &id, &key)
                }))
                .unwrap_or_else(|_| {
                    tracing::error!(module = %id, "module load panicked");
                    Err(ScriptError::Resource(ResourceError::CreationAborted(key.clone())))
                });
                match loaded {
                    Ok(module) => {
                        io.events().invoke(&ScriptEvent::ModuleRequired {
                            requester: requester.key().clone(),
                            module: key,
                        });
                        if module.enroll(Waiter::Pending(pending)) {
                            let _ = spawn_initialization(&io, module);
                        }
                    }
                    Err(error) => {
                        tracing::debug!(module = %id, %error, "require failed");
                        Waiter::Pending(pending).deliver(io.continuations(), Err(error));
                    }
                }
            });
        })
        .await
    }
}

/// Returns the module environment for `key`, building it on first use.
///
/// Blocking; runs on the I/O pool.
fn load_module(
    services: &ScriptServices,
    root: &Arc<ScriptEnvironment>,
    requester: &Arc<ScriptEnvironment>,
    id: &ModuleIdentifier,
    key: &ResourceKey,
) -> Result<Arc<ScriptEnvironment>, ScriptError> {
    let cache = services.cache();
    let created = cache.load_or_create(key, |key| {
        if !root.is_alive() {
            return Err(ResourceError::Dead(root.key().clone()));
        }
        let (body, source) = load_body(cache, id)?;
        let module: Arc<dyn Resource> = Arc::new(ScriptEnvironment::module(
            key.clone(),
            id.location(),
            id.path(),
            body,
            root,
            requester,
            services.collaborators(),
        ));

        // An edit to the module's file reloads the whole root; the root in
        // turn takes its modules down with it.
        let root: Arc<dyn Resource> = Arc::clone(root) as Arc<dyn Resource>;
        cache.add_dependent(&root, &module)?;
        cache.add_dependent(&source, &module)?;
        cache.add_dependent(&source, &root)?;
        Ok(module)
    });

    match created {
        Ok(resource) => resource
            .downcast_arc::<ScriptEnvironment>()
            .map_err(|_| ScriptError::Resource(ResourceError::WrongType(key.clone()))),
        Err(_) if !root.is_alive() => Err(ScriptError::ParentDied(root.key().to_string())),
        Err(error) => Err(error.into()),
    }
}

/// Loads the first existing candidate file for `id`.
fn load_body(
    cache: &ResourceCache,
    id: &ModuleIdentifier,
) -> Result<(ModuleBody, Arc<dyn Resource>), ResourceError> {
    for (kind, name) in id.candidates() {
        let resource = match cache.load(kind, id.location(), &name, &[]) {
            Ok(resource) => resource,
            Err(error) if error.is_not_found() => continue,
            Err(error) => return Err(error),
        };

        let body = match Arc::clone(&resource).downcast_arc::<ScriptResource>() {
            Ok(script) => ModuleBody::Script(script),
            Err(other) => match other.downcast_arc::<JsonResource>() {
                Ok(json) => ModuleBody::Json(json.value().clone()),
                Err(other) => return Err(ResourceError::WrongType(other.key().clone())),
            },
        };
        return Ok((body, resource));
    }
    Err(ResourceError::NotFound(ResourceKey::new(
        SCRIPT,
        id.location(),
        id.path(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(identifier: &str, location: Location, directory: &str) -> Result<(Location, String), ScriptError> {
        ModuleIdentifier::resolve(identifier, location, directory)
            .map(|id| (id.location(), id.path().to_owned()))
    }

    #[test]
    fn relative_identifiers_resolve_against_the_requester() {
        assert_eq!(
            resolve("./util", Location::Base, "lib").expect("valid"),
            (Location::Base, "lib/util".to_owned())
        );
        assert_eq!(
            resolve("../shared/x.js", Location::Base, "pages/admin").expect("valid"),
            (Location::Base, "pages/shared/x.js".to_owned())
        );
        assert_eq!(
            resolve("./strings", Location::ApiModules, "i18n").expect("valid"),
            (Location::ApiModules, "i18n/strings".to_owned())
        );
    }

    #[test]
    fn top_level_and_api_identifiers_ignore_the_requester() {
        assert_eq!(
            resolve("lib/util", Location::ApiModules, "deep/dir").expect("valid"),
            (Location::Base, "lib/util".to_owned())
        );
        assert_eq!(
            resolve("jj/strings", Location::Base, "pages").expect("valid"),
            (Location::ApiModules, "strings".to_owned())
        );
    }

    #[test]
    fn escaping_and_malformed_identifiers_are_rejected() {
        for identifier in ["", "/etc/passwd", "../x", "./..", "jj/../x", "a\\b", "."] {
            assert!(
                matches!(
                    resolve(identifier, Location::Base, ""),
                    Err(ScriptError::InvalidIdentifier(_))
                ),
                "{identifier:?} should be rejected"
            );
        }
        assert!(resolve("../../x", Location::Base, "a").is_err());
    }

    #[test]
    fn candidates_prefer_scripts() {
        let id = ModuleIdentifier::resolve("config", Location::Base, "").expect("valid");
        assert_eq!(
            id.candidates(),
            vec![(SCRIPT, "config.js".to_owned()), (JSON, "config.json".to_owned())]
        );
        let id = ModuleIdentifier::resolve("config.json", Location::Base, "").expect("valid");
        assert_eq!(id.candidates(), vec![(JSON, "config.json".to_owned())]);
    }

    #[test]
    fn environment_keys_are_scoped_by_root() {
        let id = ModuleIdentifier::resolve("jj/strings", Location::Base, "").expect("valid");
        let a = id.environment_key(&ScriptEnvironment::root_key("a.js"));
        let b = id.environment_key(&ScriptEnvironment::root_key("b.js"));
        assert_ne!(a, b);
        assert_eq!(a, id.environment_key(&ScriptEnvironment::root_key("a.js")));
        assert_eq!(id.to_string(), "jj/strings");
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        fn segment() -> impl Strategy<Value = String> {
            prop_oneof![
                Just(".".to_owned()),
                Just("..".to_owned()),
                Just(String::new()),
                "[a-z]{1,6}",
            ]
        }

        fn identifier() -> impl Strategy<Value = String> {
            (
                prop_oneof![Just(""), Just("./"), Just("../"), Just("jj/")],
                prop::collection::vec(segment(), 1..8),
            )
                .prop_map(|(prefix, segments)| format!("{prefix}{}", segments.join("/")))
        }

        fn directory() -> impl Strategy<Value = String> {
            prop::collection::vec("[a-z]{1,6}", 0..4).prop_map(|segments| segments.join("/"))
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            #[test]
            fn normalized_paths_stay_inside_the_namespace(
                identifier in identifier(),
                directory in directory(),
            ) {
                if let Ok(id) = ModuleIdentifier::resolve(&identifier, Location::Base, &directory) {
                    prop_assert!(!id.path().is_empty());
                    prop_assert!(!id.path().starts_with('/'));
                    prop_assert!(id
                        .path()
                        .split('/')
                        .all(|segment| !segment.is_empty() && segment != "." && segment != ".."));
                }
            }

            #[test]
            fn normalization_is_idempotent(
                identifier in identifier(),
                directory in directory(),
            ) {
                if let Ok(id) = ModuleIdentifier::resolve(&identifier, Location::Base, &directory) {
                    // A base module under a `jj` directory is only reachable relatively.
                    prop_assume!(id.location() == Location::ApiModules || !id.path().starts_with(API_PREFIX));
                    let again = ModuleIdentifier::resolve(&id.to_string(), Location::Base, "")
                        .expect("normalized identifiers stay valid");
                    prop_assert_eq!(again, id);
                }
            }
        }
    }
}
