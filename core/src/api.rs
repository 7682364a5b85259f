//! Rate-limited, caching facade over [`OreClient`].
//!
//! # Design
//! Every remote operation becomes one task on a [`Dispatcher`]. Inside the
//! task the facade makes sure a live session exists (authenticating first if
//! needed), waits for the admission policy before each HTTP call and records
//! it, and stores what comes back in the shared [`OreCache`].
//!
//! Reads that the cache can answer never reach the dispatcher: they return an
//! already finished handle. Mutations update the cache inside their own task,
//! once the server has accepted the change. Tasks run in submission order, so
//! a read queued before the mutation cannot cache the old object after it.
//!
//! The dispatcher is either owned (built from the config) or shared between
//! several facades through an `Arc`; only an owned one is halted on `close`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::cache::OreCache;
use crate::client::OreClient;
use crate::clock::{system_clock, SharedClock};
use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, ListenerId};
use crate::error::{ApiError, DispatchError};
use crate::http::{HttpRequest, HttpResponse, Transport};
use crate::limiter::AdmissionPolicy;
use crate::session::Session;
use crate::task::TaskHandle;
use crate::types::{
    Namespace, Permission, PermissionGrant, PermissionScope, Project, ProjectPatch, ProjectQuery,
    ProjectRef, ProjectTemplate, ResultList, Version,
};

/// Handle to the outcome of a facade call.
pub type ApiHandle<T> = TaskHandle<T, ApiError>;

/// Page size used when the facade pages through results on its own.
const PAGE_SIZE: u32 = 25;

struct Inner {
    client: OreClient,
    transport: Box<dyn Transport>,
    api_key: Option<String>,
    session: Mutex<Session>,
    cache: Arc<OreCache>,
    policy: Arc<dyn AdmissionPolicy>,
    clock: SharedClock,
}

impl Inner {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.policy.block_until_eligible();
        self.policy.record_request();
        debug!(method = request.method.as_str(), path = %request.path, "sending request");
        self.transport.execute(request)
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current session, authenticating first when it is not alive. The
    /// lock is not held while waiting for admission or the server.
    fn session(&self) -> Result<Session, ApiError> {
        let current = self.lock_session().clone();
        if current.is_alive() {
            return Ok(current);
        }
        let request = self.client.build_authenticate(self.api_key.as_deref());
        let grant = self.client.parse_authenticate(self.send(request)?)?;
        debug!(expires = %grant.expires, "session created");
        let session = Session::from_grant(&grant, self.clock.clone());
        *self.lock_session() = session.clone();
        Ok(session)
    }

    fn search(&self, query: &ProjectQuery) -> Result<ResultList<Project>, ApiError> {
        let session = self.session()?;
        let request = self.client.build_search_projects(&session, query);
        let mut page = self.client.parse_search_projects(self.send(request)?)?;
        page.result = page
            .result
            .into_iter()
            .map(|project| self.cache.cache_project(project))
            .collect();
        Ok(page)
    }

    fn find_by_plugin_id(&self, plugin_id: &str) -> Result<Project, ApiError> {
        let mut query = ProjectQuery {
            q: Some(plugin_id.to_string()),
            limit: Some(PAGE_SIZE),
            ..ProjectQuery::default()
        };
        loop {
            let page = self.search(&query)?;
            let returned = page.result.len();
            let is_last = page.pagination.is_last(returned);
            if let Some(found) = page
                .result
                .into_iter()
                .find(|project| project.plugin_id.eq_ignore_ascii_case(plugin_id))
            {
                return Ok(found);
            }
            if is_last {
                return Err(ApiError::NotFound);
            }
            query.offset += returned as u32;
        }
    }

    fn all_versions(&self, project: &ProjectRef) -> Result<Vec<Version>, ApiError> {
        let session = self.session()?;
        let mut versions = Vec::new();
        let mut offset = 0;
        loop {
            let request = self
                .client
                .build_list_versions(&session, &project.namespace, PAGE_SIZE, offset);
            let page = self.client.parse_list_versions(self.send(request)?, project)?;
            let returned = page.result.len();
            versions.extend(
                page.result
                    .into_iter()
                    .map(|version| self.cache.cache_version(&project.plugin_id, version)),
            );
            if page.pagination.is_last(returned) {
                return Ok(versions);
            }
            offset += returned as u32;
        }
    }
}

/// Client for the Ore API that paces, caches and authenticates for you.
pub struct OreApi {
    inner: Arc<Inner>,
    dispatcher: Arc<Dispatcher>,
    owns_dispatcher: bool,
    poke_listener: ListenerId,
}

impl OreApi {
    pub fn builder<T>(transport: T) -> OreApiBuilder
    where
        T: Transport + 'static,
    {
        OreApiBuilder {
            transport: Box::new(transport),
            config: ClientConfig::default(),
            dispatcher: None,
            clock: system_clock(),
        }
    }

    fn submit<T, F>(&self, work: F) -> Result<ApiHandle<T>, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, ApiError> + Send + 'static,
    {
        let inner = self.inner.clone();
        self.dispatcher.enqueue(move || work(&inner))
    }

    pub fn cache(&self) -> &Arc<OreCache> {
        &self.inner.cache
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn project(&self, namespace: &Namespace) -> Result<ApiHandle<Project>, DispatchError> {
        if let Some(project) = self.inner.cache.project_by_namespace(namespace) {
            return Ok(TaskHandle::ready(project));
        }
        let namespace = namespace.clone();
        self.submit(move |api| {
            let session = api.session()?;
            let request = api.client.build_get_project(&session, &namespace);
            let project = api.client.parse_get_project(api.send(request)?)?;
            Ok(api.cache.cache_project(project))
        })
    }

    /// Looks the project up in the cache, then pages through a search for it.
    pub fn project_by_plugin_id(&self, plugin_id: &str) -> Result<ApiHandle<Project>, DispatchError> {
        if let Some(project) = self.inner.cache.project_by_plugin_id(plugin_id) {
            return Ok(TaskHandle::ready(project));
        }
        let plugin_id = plugin_id.to_string();
        self.submit(move |api| api.find_by_plugin_id(&plugin_id))
    }

    pub fn search_projects(
        &self,
        query: ProjectQuery,
    ) -> Result<ApiHandle<ResultList<Project>>, DispatchError> {
        self.submit(move |api| api.search(&query))
    }

    pub fn create_project(&self, template: ProjectTemplate) -> Result<ApiHandle<Project>, DispatchError> {
        self.submit(move |api| {
            let session = api.session()?;
            let request = api.client.build_create_project(&session, &template)?;
            let project = api.client.parse_create_project(api.send(request)?)?;
            Ok(api.cache.cache_project(project))
        })
    }

    /// Applies `patch` to `project`. The patch is sent to the namespace the
    /// project had before, which may change as a result.
    pub fn update_project(
        &self,
        project: &ProjectRef,
        patch: ProjectPatch,
    ) -> Result<ApiHandle<Project>, DispatchError> {
        let previous = project.clone();
        self.submit(move |api| {
            let session = api.session()?;
            let request = api
                .client
                .build_update_project(&session, &previous.namespace, &patch)?;
            let updated = api.client.parse_update_project(api.send(request)?)?;
            api.cache.untrack_project(&previous);
            Ok(api.cache.cache_project(updated))
        })
    }

    pub fn delete_project(&self, project: &ProjectRef) -> Result<ApiHandle<()>, DispatchError> {
        let project = project.clone();
        self.submit(move |api| {
            let session = api.session()?;
            let request = api.client.build_delete_project(&session, &project.namespace);
            api.client.parse_delete_project(api.send(request)?)?;
            api.cache.untrack_project(&project);
            Ok(())
        })
    }

    /// Every version of `project`, fetched page by page and cached.
    pub fn versions(&self, project: &ProjectRef) -> Result<ApiHandle<Vec<Version>>, DispatchError> {
        let project = project.clone();
        self.submit(move |api| api.all_versions(&project))
    }

    pub fn version(&self, project: &ProjectRef, name: &str) -> Result<ApiHandle<Version>, DispatchError> {
        if let Some(version) = self.inner.cache.version(&project.plugin_id, name) {
            return Ok(TaskHandle::ready(version));
        }
        let (project, name) = (project.clone(), name.to_string());
        self.submit(move |api| {
            let session = api.session()?;
            let request = api.client.build_get_version(&session, &project.namespace, &name);
            let version = api.client.parse_get_version(api.send(request)?, &project)?;
            Ok(api.cache.cache_version(&project.plugin_id, version))
        })
    }

    pub fn delete_version(&self, version: &Version) -> Result<ApiHandle<()>, DispatchError> {
        let version = version.clone();
        self.submit(move |api| {
            let session = api.session()?;
            let request =
                api.client
                    .build_delete_version(&session, &version.project.namespace, &version.name);
            api.client.parse_delete_version(api.send(request)?)?;
            api.cache.untrack_version(&version);
            Ok(())
        })
    }

    /// The changelog of `version`, `None` if it has none. Not cached.
    pub fn changelog(&self, version: &Version) -> Result<ApiHandle<Option<String>>, DispatchError> {
        let (namespace, name) = (version.project.namespace.clone(), version.name.clone());
        self.submit(move |api| {
            let session = api.session()?;
            let request = api.client.build_get_changelog(&session, &namespace, &name);
            api.client.parse_get_changelog(api.send(request)?)
        })
    }

    /// Everything the current session may do in `scope`.
    pub fn permissions(&self, scope: PermissionScope) -> Result<ApiHandle<PermissionGrant>, DispatchError> {
        self.submit(move |api| {
            let session = api.session()?;
            let request = api.client.build_get_permissions(&session, &scope);
            api.client.parse_get_permissions(api.send(request)?)
        })
    }

    /// Whether the session holds every one of `required` in `scope`. An empty
    /// list is trivially held and costs no request.
    pub fn has_all_permissions(
        &self,
        scope: PermissionScope,
        required: Vec<Permission>,
    ) -> Result<ApiHandle<bool>, DispatchError> {
        if required.is_empty() {
            return Ok(TaskHandle::ready(true));
        }
        self.submit(move |api| {
            let session = api.session()?;
            let request = api.client.build_has_all_permissions(&session, &scope, &required);
            api.client.parse_has_permissions(api.send(request)?)
        })
    }

    /// Whether the session holds at least one of `required` in `scope`. An
    /// empty list is never satisfied and costs no request.
    pub fn has_any_permissions(
        &self,
        scope: PermissionScope,
        required: Vec<Permission>,
    ) -> Result<ApiHandle<bool>, DispatchError> {
        if required.is_empty() {
            return Ok(TaskHandle::ready(false));
        }
        self.submit(move |api| {
            let session = api.session()?;
            let request = api.client.build_has_any_permissions(&session, &scope, &required);
            api.client.parse_has_permissions(api.send(request)?)
        })
    }

    /// Ends the remote session, if any, and forgets the local one.
    pub fn destroy_session(&self) -> Result<ApiHandle<()>, DispatchError> {
        self.submit(|api| {
            let session = api.lock_session().clone();
            if session.is_alive() {
                let request = api.client.build_end_session(&session);
                api.client.parse_end_session(api.send(request)?)?;
            }
            api.lock_session().destroy();
            Ok(())
        })
    }

    /// Whether a live session is currently held. Never waits on a request in
    /// flight.
    pub fn is_authenticated(&self) -> bool {
        self.inner.lock_session().is_alive()
    }

    /// Halts the dispatcher if this facade created it.
    pub fn close(&self) {
        if self.owns_dispatcher {
            self.dispatcher.halt();
        }
    }
}

impl fmt::Debug for OreApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OreApi")
            .field("client", &self.inner.client)
            .field("dispatcher", &self.dispatcher)
            .field("owns_dispatcher", &self.owns_dispatcher)
            .finish()
    }
}

impl Drop for OreApi {
    fn drop(&mut self) {
        self.dispatcher.remove_idle_listener(self.poke_listener);
        self.close();
    }
}

pub struct OreApiBuilder {
    transport: Box<dyn Transport>,
    config: ClientConfig,
    dispatcher: Option<Arc<Dispatcher>>,
    clock: SharedClock,
}

impl OreApiBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs tasks on `dispatcher` instead of starting a private one. Its
    /// admission policy then paces this facade too.
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<OreApi, DispatchError> {
        let config = self.config;
        let (dispatcher, owns_dispatcher) = match self.dispatcher {
            Some(dispatcher) => (dispatcher, false),
            None => {
                let policy = config.limits.build(self.clock.clone());
                let dispatcher = Dispatcher::with_config(policy, &config.dispatcher)?;
                (Arc::new(dispatcher), true)
            }
        };

        let cache = Arc::new(OreCache::with_clock(config.cache.ttl, self.clock.clone()));
        let poke_listener = {
            let cache = cache.clone();
            dispatcher.add_idle_listener(move || cache.poke(), false)
        };

        let inner = Inner {
            client: OreClient::new(&config.base_url, &config.user_agent),
            transport: self.transport,
            api_key: config.api_key,
            session: Mutex::new(Session::none_with_clock(self.clock.clone())),
            cache,
            policy: dispatcher.policy().clone(),
            clock: self.clock,
        };
        debug!(root = inner.client.root(), owns_dispatcher, "ore api ready");

        Ok(OreApi {
            inner: Arc::new(inner),
            dispatcher,
            owns_dispatcher,
            poke_listener,
        })
    }
}
