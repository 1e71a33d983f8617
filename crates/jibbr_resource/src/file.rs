//! File-backed resources.
//!
//! [`ResourceSettings`] maps each [`Location`] onto a directory. A file
//! resource remembers the size, modification time and BLAKE3 digest it was
//! read with. It reports [`needs_replacing`](Resource::needs_replacing) once
//! the file disappears or its contents differ; a touched file whose bytes are
//! unchanged stays current. Files larger than
//! [`max_file_size`](ResourceSettings::max_file_size) are not viable.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::{ResourceCache, ResourceCreator};
use crate::error::ResourceError;
use crate::key::{Location, ResourceKey, ResourceKind};
use crate::resource::{Resource, ResourceBase};

/// Kind of [`FileResource`].
pub const FILE: ResourceKind = ResourceKind::new("file");

/// Kind of [`JsonResource`].
pub const JSON: ResourceKind = ResourceKind::new("json");

// ─────────────────────────────────────────────────────────────────────────────
// ResourceSettings
// ─────────────────────────────────────────────────────────────────────────────

/// Directory layout and limits for file-backed resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    /// Directory of [`Location::Base`].
    pub base_path: PathBuf,
    /// Directory of [`Location::ApiModules`].
    pub api_modules_path: PathBuf,
    /// Directory of [`Location::Assets`].
    pub assets_path: PathBuf,
    /// Largest file, in bytes, that will be loaded.
    pub max_file_size: u64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            api_modules_path: PathBuf::from("api"),
            assets_path: PathBuf::from("assets"),
            max_file_size: 10 * 1024 * 1024,
        }
    }
}

impl ResourceSettings {
    /// Settings rooted at `base_path`, with the other locations beneath it.
    #[must_use]
    pub fn rooted_at(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            api_modules_path: base_path.join("api"),
            assets_path: base_path.join("assets"),
            base_path,
            ..Self::default()
        }
    }

    /// Sets the API modules directory.
    #[must_use]
    pub fn with_api_modules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.api_modules_path = path.into();
        self
    }

    /// Sets the size limit.
    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Returns the directory for `location`, or `None` for [`Location::Virtual`].
    #[must_use]
    pub fn directory(&self, location: Location) -> Option<&Path> {
        match location {
            Location::Base => Some(&self.base_path),
            Location::ApiModules => Some(&self.api_modules_path),
            Location::Assets => Some(&self.assets_path),
            Location::Virtual => None,
        }
    }

    /// Resolves `name` inside `location`'s directory.
    ///
    /// Returns `None` for virtual locations and for names that are absolute
    /// or climb out of the directory.
    #[must_use]
    pub fn resolve(&self, location: Location, name: &str) -> Option<PathBuf> {
        let directory = self.directory(location)?;
        let relative = Path::new(name);
        let contained = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if !contained || name.is_empty() {
            return None;
        }
        Some(directory.join(relative))
    }

    /// Resolves the file for `key`, failing with [`ResourceError::NotFound`].
    pub fn path_for(&self, key: &ResourceKey) -> Result<PathBuf, ResourceError> {
        self.resolve(key.location(), key.name())
            .ok_or_else(|| ResourceError::NotFound(key.clone()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FileSnapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Contents of a file plus the metadata used to detect changes.
#[derive(Debug)]
pub struct FileSnapshot {
    path: PathBuf,
    bytes: Arc<[u8]>,
    digest: blake3::Hash,
    /// Last modification time known to match `digest`.
    modified: Mutex<Option<SystemTime>>,
}

impl FileSnapshot {
    /// Reads `path` on behalf of `key`, enforcing `max_file_size`.
    pub fn read(key: &ResourceKey, path: &Path, max_file_size: u64) -> Result<Self, ResourceError> {
        let metadata = fs::metadata(path).map_err(|e| ResourceError::from_io(key, e))?;
        if !metadata.is_file() {
            return Err(ResourceError::NotFound(key.clone()));
        }
        if metadata.len() > max_file_size {
            return Err(ResourceError::NotViable {
                key: key.clone(),
                reason: format!(
                    "file is {} bytes, larger than the {} byte limit",
                    metadata.len(),
                    max_file_size
                ),
            });
        }

        let bytes = fs::read(path).map_err(|e| ResourceError::from_io(key, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            digest: blake3::hash(&bytes),
            bytes: bytes.into(),
            modified: Mutex::new(metadata.modified().ok()),
        })
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file contents.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the contents as UTF-8.
    pub fn text(&self, key: &ResourceKey) -> Result<&str, ResourceError> {
        core::str::from_utf8(&self.bytes).map_err(|e| ResourceError::NotViable {
            key: key.clone(),
            reason: format!("not valid UTF-8: {e}"),
        })
    }

    /// Returns the BLAKE3 digest of the contents.
    #[must_use]
    pub fn digest(&self) -> &blake3::Hash {
        &self.digest
    }

    /// Returns the digest as lowercase hex, usable as a content identity.
    #[must_use]
    pub fn digest_hex(&self) -> String {
        self.digest.to_hex().to_string()
    }

    /// Returns the last modification time known to match the contents.
    #[must_use]
    pub fn modified(&self) -> Option<SystemTime> {
        *self.modified.lock()
    }

    /// Whether the file on disk no longer matches this snapshot.
    ///
    /// A size change or a missing file is stale outright. A new modification
    /// time with the same size re-hashes the file.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        let Ok(metadata) = fs::metadata(&self.path) else {
            return true;
        };
        if metadata.len() != self.bytes.len() as u64 {
            return true;
        }

        let modified = metadata.modified().ok();
        let mut known = self.modified.lock();
        if modified.is_some() && modified == *known {
            return false;
        }

        match fs::read(&self.path) {
            Ok(current) if blake3::hash(&current) == self.digest => {
                *known = modified;
                false
            }
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(path = %self.path.display(), %error, "stale check could not read file");
                true
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FileResource
// ─────────────────────────────────────────────────────────────────────────────

/// Raw file contents.
#[derive(Debug)]
pub struct FileResource {
    base: ResourceBase,
    snapshot: FileSnapshot,
}

impl FileResource {
    /// Returns the snapshot the resource was built from.
    #[must_use]
    pub fn snapshot(&self) -> &FileSnapshot {
        &self.snapshot
    }

    /// Returns the file contents.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.snapshot.bytes()
    }

    /// Returns the BLAKE3 digest of the contents.
    #[must_use]
    pub fn digest(&self) -> &blake3::Hash {
        self.snapshot.digest()
    }
}

impl Resource for FileResource {
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

/// Creates [`FileResource`]s.
#[derive(Debug, Clone)]
pub struct FileResourceCreator {
    settings: Arc<ResourceSettings>,
}

impl FileResourceCreator {
    /// Creates a creator reading from the given layout.
    #[must_use]
    pub fn new(settings: Arc<ResourceSettings>) -> Self {
        Self { settings }
    }
}

impl ResourceCreator for FileResourceCreator {
    fn kind(&self) -> ResourceKind {
        FILE
    }

    fn create(
        &self,
        _cache: &ResourceCache,
        key: &ResourceKey,
    ) -> Result<Arc<dyn Resource>, ResourceError> {
        let path = self.settings.path_for(key)?;
        let snapshot = FileSnapshot::read(key, &path, self.settings.max_file_size)?;
        Ok(Arc::new(FileResource {
            base: ResourceBase::new(key.clone()),
            snapshot,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JsonResource
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed `.json` file.
#[derive(Debug)]
pub struct JsonResource {
    base: ResourceBase,
    snapshot: FileSnapshot,
    value: serde_json::Value,
}

impl JsonResource {
    /// Returns the parsed document.
    #[must_use]
    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }
}

impl Resource for JsonResource {
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

/// Creates [`JsonResource`]s.
#[derive(Debug, Clone)]
pub struct JsonResourceCreator {
    settings: Arc<ResourceSettings>,
}

impl JsonResourceCreator {
    /// Creates a creator reading from the given layout.
    #[must_use]
    pub fn new(settings: Arc<ResourceSettings>) -> Self {
        Self { settings }
    }
}

impl ResourceCreator for JsonResourceCreator {
    fn kind(&self) -> ResourceKind {
        JSON
    }

    fn create(
        &self,
        _cache: &ResourceCache,
        key: &ResourceKey,
    ) -> Result<Arc<dyn Resource>, ResourceError> {
        let path = self.settings.path_for(key)?;
        let snapshot = FileSnapshot::read(key, &path, self.settings.max_file_size)?;
        let value = serde_json::from_slice(snapshot.bytes()).map_err(|e| {
            ResourceError::NotViable {
                key: key.clone(),
                reason: format!("invalid JSON: {e}"),
            }
        })?;
        Ok(Arc::new(JsonResource {
            base: ResourceBase::new(key.clone()),
            snapshot,
            value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &Path) -> Arc<ResourceSettings> {
        Arc::new(ResourceSettings::rooted_at(dir).with_max_file_size(16))
    }

    #[test]
    fn resolve_rejects_escapes_and_virtual() {
        let settings = ResourceSettings::rooted_at("/srv/app");
        assert_eq!(
            settings.resolve(Location::Base, "lib/x.js"),
            Some(PathBuf::from("/srv/app/lib/x.js"))
        );
        assert_eq!(
            settings.resolve(Location::ApiModules, "fs.js"),
            Some(PathBuf::from("/srv/app/api/fs.js"))
        );
        assert!(settings.resolve(Location::Base, "../etc/passwd").is_none());
        assert!(settings.resolve(Location::Base, "/etc/passwd").is_none());
        assert!(settings.resolve(Location::Base, "").is_none());
        assert!(settings.resolve(Location::Virtual, "x").is_none());
    }

    #[test]
    fn file_resource_reads_and_detects_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), b"hello").expect("write");

        let cache = ResourceCache::new();
        cache.register_creator(Arc::new(FileResourceCreator::new(settings(dir.path()))));

        let file = cache
            .load_typed::<FileResource>(FILE, Location::Base, "a.txt", &[])
            .expect("loads");
        assert_eq!(file.bytes(), b"hello");
        assert!(!file.needs_replacing());

        fs::write(dir.path().join("a.txt"), b"hello, world").expect("rewrite");
        assert!(file.needs_replacing());

        fs::remove_file(dir.path().join("a.txt")).expect("remove");
        assert!(file.needs_replacing());
    }

    #[test]
    fn touching_without_edits_keeps_the_resource_current() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.txt");
        fs::write(&path, b"hello").expect("write");

        let cache = ResourceCache::new();
        cache.register_creator(Arc::new(FileResourceCreator::new(settings(dir.path()))));
        let file = cache
            .load_typed::<FileResource>(FILE, Location::Base, "a.txt", &[])
            .expect("loads");
        assert_eq!(*file.digest(), blake3::hash(b"hello"));

        let later = SystemTime::now() + core::time::Duration::from_secs(10);
        let handle = fs::File::options().write(true).open(&path).expect("open");
        handle.set_modified(later).expect("touch");
        drop(handle);

        assert!(!file.needs_replacing());
        assert_eq!(file.snapshot().modified(), fs::metadata(&path).expect("meta").modified().ok());
    }

    #[test]
    fn same_size_edit_is_caught_by_the_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.txt");
        fs::write(&path, b"hello").expect("write");

        let cache = ResourceCache::new();
        cache.register_creator(Arc::new(FileResourceCreator::new(settings(dir.path()))));
        let file = cache
            .load_typed::<FileResource>(FILE, Location::Base, "a.txt", &[])
            .expect("loads");
        let original = file.snapshot().modified().expect("mtime");

        fs::write(&path, b"jello").expect("rewrite");
        let handle = fs::File::options().write(true).open(&path).expect("open");
        handle
            .set_modified(original + core::time::Duration::from_secs(2))
            .expect("pin mtime");
        drop(handle);

        assert!(file.needs_replacing());
        assert_ne!(file.snapshot().digest_hex(), blake3::hash(b"jello").to_hex().to_string());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResourceCache::new();
        cache.register_creator(Arc::new(FileResourceCreator::new(settings(dir.path()))));

        let err = cache
            .load(FILE, Location::Base, "missing.txt", &[])
            .expect_err("absent");
        assert!(err.is_not_found());
    }

    #[test]
    fn oversized_file_is_not_viable() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("big.txt"), [b'x'; 64]).expect("write");
        let cache = ResourceCache::new();
        cache.register_creator(Arc::new(FileResourceCreator::new(settings(dir.path()))));

        let err = cache
            .load(FILE, Location::Base, "big.txt", &[])
            .expect_err("too large");
        assert!(matches!(err, ResourceError::NotViable { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn json_resource_parses_or_is_not_viable() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("ok.json"), br#"{"a":1}"#).expect("write");
        fs::write(dir.path().join("bad.json"), b"{nope").expect("write");
        let cache = ResourceCache::new();
        cache.register_creator(Arc::new(JsonResourceCreator::new(settings(dir.path()))));

        let ok = cache
            .load_typed::<JsonResource>(JSON, Location::Base, "ok.json", &[])
            .expect("parses");
        assert_eq!(ok.value()["a"], 1);

        let err = cache
            .load(JSON, Location::Base, "bad.json", &[])
            .expect_err("invalid");
        assert!(matches!(err, ResourceError::NotViable { .. }));
    }
}
