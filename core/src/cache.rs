//! Short-lived cache of projects and their versions.
//!
//! # Design
//! Projects live in one [`TtlCollection`]; versions live in one collection
//! per project, keyed by the lowercased plugin id. Both expire a fixed time
//! after insertion (five minutes by default) and are swept lazily on lookup
//! and eagerly by [`ObjectCache::poke`], which the facade calls whenever the
//! dispatcher goes idle.
//!
//! Entries are found through two small traits rather than concrete types so
//! the cache stays agnostic of the wire DTOs. A version points back at its
//! project through [`VersionIdentity::project`]; untracking a project drops
//! every version collection whose members point at it.
//!
//! The cache locks internally and hands out clones, so it can be shared
//! between caller threads and the dispatcher worker.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::trace;

use crate::clock::{system_clock, SharedClock};
use crate::ttl::TtlCollection;
use crate::types::{Namespace, Project, ProjectRef, Version};

/// How long cached objects stay visible.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

pub trait ProjectIdentity {
    fn plugin_id(&self) -> &str;
    fn namespace(&self) -> &Namespace;

    /// Same plugin id (ignoring case) or same namespace.
    fn same_project(&self, other: &dyn ProjectIdentity) -> bool {
        self.namespace() == other.namespace()
            || self.plugin_id().eq_ignore_ascii_case(other.plugin_id())
    }
}

pub trait VersionIdentity {
    fn name(&self) -> &str;
    fn project(&self) -> &ProjectRef;
}

impl ProjectIdentity for ProjectRef {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }
}

impl ProjectIdentity for Project {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }
}

impl VersionIdentity for Version {
    fn name(&self) -> &str {
        &self.name
    }

    fn project(&self) -> &ProjectRef {
        &self.project
    }
}

struct Inner<P, V> {
    projects: TtlCollection<P>,
    versions: HashMap<String, TtlCollection<V>>,
}

pub struct ObjectCache<P, V> {
    inner: Mutex<Inner<P, V>>,
    ttl: Duration,
    clock: SharedClock,
}

impl<P, V> ObjectCache<P, V>
where
    P: ProjectIdentity + Clone,
    V: VersionIdentity + Clone,
{
    pub fn new() -> Self {
        Self::with_clock(DEFAULT_TTL, system_clock())
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self::with_clock(ttl, system_clock())
    }

    pub fn with_clock(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner {
                projects: TtlCollection::with_clock(ttl, clock.clone()),
                versions: HashMap::new(),
            }),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Inner<P, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `project`, replacing any entry for the same project, and hands
    /// it back.
    pub fn cache_project(&self, project: P) -> P {
        let mut inner = self.lock();
        inner
            .projects
            .remove_if(|cached| cached.same_project(&project as &dyn ProjectIdentity));
        inner.projects.add(project.clone());
        trace!(plugin_id = project.plugin_id(), "project cached");
        project
    }

    /// Looks `reference` up by its namespace. A project cached under a
    /// different namespace, such as before a rename, is not returned.
    pub fn project(&self, reference: &dyn ProjectIdentity) -> Option<P> {
        self.project_by_namespace(reference.namespace())
    }

    pub fn project_by_namespace(&self, namespace: &Namespace) -> Option<P> {
        self.lock()
            .projects
            .find(|cached| cached.namespace() == namespace)
            .cloned()
    }

    pub fn project_by_plugin_id(&self, plugin_id: &str) -> Option<P> {
        self.lock()
            .projects
            .find(|cached| cached.plugin_id().eq_ignore_ascii_case(plugin_id))
            .cloned()
    }

    /// Stores `version` under `plugin_id`, replacing a version of the same
    /// name.
    pub fn cache_version(&self, plugin_id: &str, version: V) -> V {
        let mut inner = self.lock();
        let (ttl, clock) = (self.ttl, self.clock.clone());
        let versions = inner
            .versions
            .entry(plugin_id.to_lowercase())
            .or_insert_with(|| TtlCollection::with_clock(ttl, clock));
        versions.remove_if(|cached| cached.name().eq_ignore_ascii_case(version.name()));
        versions.add(version.clone());
        trace!(plugin_id, version = version.name(), "version cached");
        version
    }

    pub fn version(&self, plugin_id: &str, name: &str) -> Option<V> {
        self.lock()
            .versions
            .get_mut(&plugin_id.to_lowercase())?
            .find(|cached| cached.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Live versions cached for `plugin_id`, oldest first.
    pub fn versions(&self, plugin_id: &str) -> Vec<V> {
        self.lock()
            .versions
            .get_mut(&plugin_id.to_lowercase())
            .map(|versions| versions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forgets `project` and every version that belongs to it.
    pub fn untrack_project(&self, project: &dyn ProjectIdentity) {
        let mut inner = self.lock();
        let removed = inner
            .projects
            .remove_if(|cached| cached.same_project(project));
        inner.versions.remove(&project.plugin_id().to_lowercase());
        inner.versions.retain(|_, versions| {
            versions
                .iter()
                .all(|version| version.project().namespace != *project.namespace())
        });
        trace!(plugin_id = project.plugin_id(), removed, "project untracked");
    }

    pub fn untrack_version(&self, version: &V) {
        let mut inner = self.lock();
        let key = version.project().plugin_id.to_lowercase();
        let Some(versions) = inner.versions.get_mut(&key) else {
            return;
        };
        versions.remove_if(|cached| cached.name().eq_ignore_ascii_case(version.name()));
        if versions.is_empty() {
            inner.versions.remove(&key);
        }
    }

    /// Sweeps every collection and drops version collections left empty.
    pub fn poke(&self) {
        let mut inner = self.lock();
        let mut swept = inner.projects.sweep();
        inner.versions.retain(|_, versions| {
            swept += versions.sweep();
            !versions.is_empty()
        });
        if swept > 0 {
            trace!(swept, "cache swept");
        }
    }

    /// Live project count.
    pub fn project_count(&self) -> usize {
        self.lock().projects.len()
    }
}

impl<P, V> Default for ObjectCache<P, V>
where
    P: ProjectIdentity + Clone,
    V: VersionIdentity + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P: fmt::Debug, V> fmt::Debug for ObjectCache<P, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ObjectCache")
            .field("ttl", &self.ttl)
            .field("projects", &inner.projects)
            .field("version_collections", &inner.versions.len())
            .finish()
    }
}

/// The cache the facade uses.
pub type OreCache = ObjectCache<Project, Version>;
