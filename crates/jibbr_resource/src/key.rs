//! Resource identity.
//!
//! A [`ResourceKey`] is value-equal and hashable; two resources with equal
//! keys occupy the same cache slot. Its [`Display`](core::fmt::Display) form
//! is deterministic and used as a stable textual id elsewhere (for example as
//! the affinity of a script environment).

use core::fmt;
use std::sync::Arc;

/// Names the type of a resource, e.g. `"script"` or `"json"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind(&'static str);

impl ResourceKind {
    /// Creates a kind from a static name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the kind's name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Namespace a resource name is resolved in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    /// Application files under the configured base path.
    Base,
    /// Built-in modules, addressed by scripts with the `jj/` prefix.
    ApiModules,
    /// Static assets.
    Assets,
    /// No filesystem backing.
    Virtual,
}

impl Location {
    /// Every location, in declaration order.
    pub const ALL: [Location; 4] = [
        Location::Base,
        Location::ApiModules,
        Location::Assets,
        Location::Virtual,
    ];

    /// Returns a short stable name for the location.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Location::Base => "base",
            Location::ApiModules => "api",
            Location::Assets => "assets",
            Location::Virtual => "virtual",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a cached resource: `{kind, location, name, args}`.
///
/// Cloning is cheap; the name and arguments are reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    kind: ResourceKind,
    location: Location,
    name: Arc<str>,
    args: Arc<[String]>,
}

impl ResourceKey {
    /// Creates a key without extra arguments.
    #[must_use]
    pub fn new(kind: ResourceKind, location: Location, name: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            location,
            name: name.into(),
            args: Arc::from(Vec::new()),
        }
    }

    /// Replaces the discriminating arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the resource kind.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Returns the location the name resolves in.
    #[must_use]
    pub fn location(&self) -> Location {
        self.location
    }

    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the extra discriminating arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.kind, self.location, self.name)?;
        if !self.args.is_empty() {
            write!(f, "[{}]", self.args.join(","))?;
        }
        Ok(())
    }
}
