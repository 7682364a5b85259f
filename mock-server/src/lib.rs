//! In-memory stand-in for the Ore v2 API.
//!
//! Serves the subset of routes the client core talks to under `/api/v2`.
//! Sessions come from `POST /authenticate`: a request carrying the
//! configured API key gets a user session that may mutate projects, a
//! request without a key gets a public, read-only session. Permission
//! queries answer from the same split: a user session holds the
//! project-owner permissions, a public one only `view_public_info`. Every
//! request is counted so tests can assert how many calls actually hit the
//! server.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use axum::{
    extract::{Path, Query, RawQuery, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

/// Key accepted by `app()` and the binary unless overridden.
pub const API_KEY: &str = "test-api-key";

const DEFAULT_LIMIT: u32 = 25;

const PUBLIC_PERMISSIONS: &[&str] = &["view_public_info"];

const USER_PERMISSIONS: &[&str] = &[
    "view_public_info",
    "edit_own_user_settings",
    "edit_subject_settings",
    "manage_subject_members",
    "is_subject_owner",
    "create_project",
    "edit_page",
    "delete_project",
    "create_version",
    "edit_version",
    "delete_version",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub owner: String,
    pub slug: String,
}

impl Namespace {
    fn matches(&self, owner: &str, slug: &str) -> bool {
        self.owner.eq_ignore_ascii_case(owner) && self.slug.eq_ignore_ascii_case(slug)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProjectStats {
    pub views: u64,
    pub downloads: u64,
    pub stars: u64,
    pub watchers: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub plugin_id: String,
    pub namespace: Namespace,
    pub name: String,
    pub summary: Option<String>,
    pub category: String,
    pub visibility: String,
    pub created_at: DateTime<Utc>,
    pub stats: ProjectStats,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VersionStats {
    pub downloads: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Version {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    pub visibility: String,
    pub stats: VersionStats,
    /// Served only by the changelog route.
    #[serde(skip)]
    pub changelog: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
    pub count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultList<T> {
    pub pagination: Pagination,
    pub result: Vec<T>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionGrant {
    pub session: String,
    pub expires: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionGrant {
    #[serde(rename = "type")]
    pub kind: String,
    pub permissions: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub result: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Changelog {
    pub changelog: Option<String>,
}

#[derive(Deserialize)]
pub struct NewProject {
    pub name: String,
    pub plugin_id: String,
    pub category: String,
    pub owner_name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct ProjectEdit {
    pub name: Option<String>,
    pub summary: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct Page {
    pub q: Option<String>,
    pub category: Option<String>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: u32,
}

struct SessionInfo {
    expires: DateTime<Utc>,
    user: bool,
}

#[derive(Default)]
pub struct Db {
    projects: Vec<Project>,
    versions: HashMap<String, Vec<Version>>,
    sessions: HashMap<String, SessionInfo>,
}

impl Db {
    pub fn insert_project(&mut self, project: Project) {
        self.projects.push(project);
    }

    pub fn insert_version(&mut self, plugin_id: &str, version: Version) {
        self.versions
            .entry(plugin_id.to_lowercase())
            .or_default()
            .push(version);
    }

    fn project_index(&self, owner: &str, slug: &str) -> Option<usize> {
        self.projects
            .iter()
            .position(|project| project.namespace.matches(owner, slug))
    }

    /// Checks the session header; `Ok(true)` for a user session.
    fn authorize(&self, headers: &HeaderMap, needs_user: bool) -> Result<bool, StatusCode> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("OreApi session="))
            .ok_or(StatusCode::UNAUTHORIZED)?;
        let session = self.sessions.get(token).ok_or(StatusCode::UNAUTHORIZED)?;
        if session.expires < Utc::now() {
            return Err(StatusCode::UNAUTHORIZED);
        }
        if needs_user && !session.user {
            return Err(StatusCode::FORBIDDEN);
        }
        Ok(session.user)
    }

    /// Resolves the scope named by a permission query to the grant's type.
    fn permission_scope(&self, pairs: &[(String, String)]) -> Result<&'static str, StatusCode> {
        let value = |key: &str| {
            pairs
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str())
        };
        match (value("projectOwner"), value("projectSlug"), value("organizationName")) {
            (None, None, None) => Ok("global"),
            (Some(owner), Some(slug), None) => self
                .project_index(owner, slug)
                .map(|_| "project")
                .ok_or(StatusCode::NOT_FOUND),
            (None, None, Some(organization)) => self
                .projects
                .iter()
                .any(|project| project.namespace.owner.eq_ignore_ascii_case(organization))
                .then_some("organization")
                .ok_or(StatusCode::NOT_FOUND),
            _ => Err(StatusCode::BAD_REQUEST),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    db: Arc<RwLock<Db>>,
    api_key: Arc<str>,
    hits: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(api_key: &str, db: Db) -> Self {
        Self {
            db: Arc::new(RwLock::new(db)),
            api_key: Arc::from(api_key),
            hits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// State preloaded with a couple of projects and versions.
    pub fn seeded(api_key: &str) -> Self {
        Self::new(api_key, seed())
    }

    /// Number of requests served so far.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }
}

pub fn seed() -> Db {
    let created_at = DateTime::parse_from_rfc3339("2019-06-01T12:00:00Z")
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let mut db = Db::default();
    for (plugin_id, owner, slug, summary) in [
        ("nucleus", "NucleusPowered", "Nucleus", "The Ultimate Essentials Plugin"),
        ("nucleus-heisenberg", "Someone", "Heisenberg", "Addon for Nucleus"),
        ("luckperms", "Luck", "LuckPerms", "A permissions plugin"),
    ] {
        db.insert_project(Project {
            plugin_id: plugin_id.to_string(),
            namespace: Namespace {
                owner: owner.to_string(),
                slug: slug.to_string(),
            },
            name: slug.to_string(),
            summary: Some(summary.to_string()),
            category: "misc".to_string(),
            visibility: "public".to_string(),
            created_at,
            stats: ProjectStats::default(),
        });
    }
    for (name, changelog) in [
        ("1.0.0", None),
        ("1.1.0", Some("Added warps")),
        ("2.0.0", Some("Rewritten for API 7")),
    ] {
        db.insert_version(
            "nucleus",
            Version {
                name: name.to_string(),
                created_at,
                description: None,
                visibility: "public".to_string(),
                stats: VersionStats::default(),
                changelog: changelog.map(str::to_string),
            },
        );
    }
    db
}

/// Router over seeded data, accepting [`API_KEY`].
pub fn app() -> Router {
    app_with(AppState::seeded(API_KEY))
}

pub fn app_with(state: AppState) -> Router {
    let api = Router::new()
        .route("/authenticate", post(authenticate))
        .route("/sessions/current", delete(end_session))
        .route("/projects", get(search_projects).post(create_project))
        .route(
            "/projects/{owner}/{slug}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/projects/{owner}/{slug}/versions", get(list_versions))
        .route(
            "/projects/{owner}/{slug}/versions/{name}",
            get(get_version).delete(delete_version),
        )
        .route(
            "/projects/{owner}/{slug}/versions/{name}/changelog",
            get(get_changelog),
        )
        .route("/permissions", get(get_permissions))
        .route("/permissions/hasAll", get(has_all_permissions))
        .route("/permissions/hasAny", get(has_any_permissions));
    Router::new()
        .nest("/api/v2", api)
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

pub async fn run_with(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with(state)).await
}

async fn count_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    tracing::debug!(method = %request.method(), uri = %request.uri(), "request");
    next.run(request).await
}

async fn authenticate(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionGrant>, StatusCode> {
    let user = match headers.get(header::AUTHORIZATION) {
        None => false,
        Some(value) => {
            let key = value
                .to_str()
                .ok()
                .and_then(|value| value.strip_prefix("OreApi apikey="))
                .ok_or(StatusCode::UNAUTHORIZED)?;
            if key != &*state.api_key {
                return Err(StatusCode::UNAUTHORIZED);
            }
            true
        }
    };
    let grant = SessionGrant {
        session: Uuid::new_v4().to_string(),
        expires: Utc::now() + Duration::hours(3),
        kind: if user { "user" } else { "public" }.to_string(),
    };
    state.db.write().await.sessions.insert(
        grant.session.clone(),
        SessionInfo {
            expires: grant.expires,
            user,
        },
    );
    Ok(Json(grant))
}

async fn end_session(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, StatusCode> {
    let mut db = state.db.write().await;
    db.authorize(&headers, false)?;
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("OreApi session="))
        .unwrap_or_default()
        .to_string();
    db.sessions.remove(&token);
    Ok(StatusCode::NO_CONTENT)
}

fn page_of<T: Clone>(items: &[T], limit: Option<u32>, offset: u32) -> ResultList<T> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    ResultList {
        pagination: Pagination {
            limit,
            offset,
            count: items.len() as u64,
        },
        result: items
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect(),
    }
}

async fn search_projects(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<Page>,
) -> Result<Json<ResultList<Project>>, StatusCode> {
    let db = state.db.read().await;
    db.authorize(&headers, false)?;
    let q = page.q.as_deref().unwrap_or_default().to_lowercase();
    let mut matches: Vec<Project> = db
        .projects
        .iter()
        .filter(|project| {
            project.plugin_id.to_lowercase().contains(&q) || project.name.to_lowercase().contains(&q)
        })
        .filter(|project| page.category.as_ref().map_or(true, |c| &project.category == c))
        .cloned()
        .collect();
    matches.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
    Ok(Json(page_of(&matches, page.limit, page.offset)))
}

async fn create_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<NewProject>,
) -> Result<(StatusCode, Json<Project>), StatusCode> {
    let mut db = state.db.write().await;
    db.authorize(&headers, true)?;
    if db
        .projects
        .iter()
        .any(|project| project.plugin_id.eq_ignore_ascii_case(&input.plugin_id))
    {
        return Err(StatusCode::CONFLICT);
    }
    let project = Project {
        plugin_id: input.plugin_id,
        namespace: Namespace {
            owner: input.owner_name,
            slug: input.name.clone(),
        },
        name: input.name,
        summary: input.description,
        category: input.category,
        visibility: "new".to_string(),
        created_at: Utc::now(),
        stats: ProjectStats::default(),
    };
    tracing::info!(plugin_id = %project.plugin_id, "project created");
    db.insert_project(project.clone());
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner, slug)): Path<(String, String)>,
) -> Result<Json<Project>, StatusCode> {
    let db = state.db.read().await;
    db.authorize(&headers, false)?;
    let index = db.project_index(&owner, &slug).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(db.projects[index].clone()))
}

/// Renaming a project moves it to a new slug.
async fn update_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner, slug)): Path<(String, String)>,
    Json(input): Json<ProjectEdit>,
) -> Result<Json<Project>, StatusCode> {
    let mut db = state.db.write().await;
    db.authorize(&headers, true)?;
    let index = db.project_index(&owner, &slug).ok_or(StatusCode::NOT_FOUND)?;
    let project = &mut db.projects[index];
    if let Some(name) = input.name {
        project.namespace.slug = name.clone();
        project.name = name;
    }
    if let Some(summary) = input.summary.or(input.description) {
        project.summary = Some(summary);
    }
    if let Some(category) = input.category {
        project.category = category;
    }
    Ok(Json(project.clone()))
}

async fn delete_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner, slug)): Path<(String, String)>,
) -> Result<StatusCode, StatusCode> {
    let mut db = state.db.write().await;
    db.authorize(&headers, true)?;
    let index = db.project_index(&owner, &slug).ok_or(StatusCode::NOT_FOUND)?;
    let project = db.projects.remove(index);
    db.versions.remove(&project.plugin_id.to_lowercase());
    tracing::info!(plugin_id = %project.plugin_id, "project deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_versions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner, slug)): Path<(String, String)>,
    Query(page): Query<Page>,
) -> Result<Json<ResultList<Version>>, StatusCode> {
    let db = state.db.read().await;
    db.authorize(&headers, false)?;
    let index = db.project_index(&owner, &slug).ok_or(StatusCode::NOT_FOUND)?;
    let versions = db
        .versions
        .get(&db.projects[index].plugin_id.to_lowercase())
        .map(Vec::as_slice)
        .unwrap_or_default();
    Ok(Json(page_of(versions, page.limit, page.offset)))
}

async fn get_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner, slug, name)): Path<(String, String, String)>,
) -> Result<Json<Version>, StatusCode> {
    let db = state.db.read().await;
    db.authorize(&headers, false)?;
    let index = db.project_index(&owner, &slug).ok_or(StatusCode::NOT_FOUND)?;
    db.versions
        .get(&db.projects[index].plugin_id.to_lowercase())
        .and_then(|versions| versions.iter().find(|version| version.name == name))
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_changelog(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner, slug, name)): Path<(String, String, String)>,
) -> Result<Json<Changelog>, StatusCode> {
    let db = state.db.read().await;
    db.authorize(&headers, false)?;
    let index = db.project_index(&owner, &slug).ok_or(StatusCode::NOT_FOUND)?;
    db.versions
        .get(&db.projects[index].plugin_id.to_lowercase())
        .and_then(|versions| versions.iter().find(|version| version.name == name))
        .map(|version| {
            Json(Changelog {
                changelog: version.changelog.clone(),
            })
        })
        .ok_or(StatusCode::NOT_FOUND)
}

fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .into_owned()
        .collect()
}

fn granted(user: bool) -> &'static [&'static str] {
    if user {
        USER_PERMISSIONS
    } else {
        PUBLIC_PERMISSIONS
    }
}

async fn get_permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Json<PermissionGrant>, StatusCode> {
    let db = state.db.read().await;
    let user = db.authorize(&headers, false)?;
    let kind = db.permission_scope(&query_pairs(query.as_deref()))?;
    Ok(Json(PermissionGrant {
        kind: kind.to_string(),
        permissions: granted(user).iter().map(|name| name.to_string()).collect(),
    }))
}

async fn has_all_permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Json<PermissionCheck>, StatusCode> {
    check_permissions(&state, &headers, query.as_deref(), true).await
}

async fn has_any_permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Json<PermissionCheck>, StatusCode> {
    check_permissions(&state, &headers, query.as_deref(), false).await
}

/// Answers `hasAll` when `all` is set, `hasAny` otherwise.
async fn check_permissions(
    state: &AppState,
    headers: &HeaderMap,
    query: Option<&str>,
    all: bool,
) -> Result<Json<PermissionCheck>, StatusCode> {
    let db = state.db.read().await;
    let user = db.authorize(headers, false)?;
    let pairs = query_pairs(query);
    db.permission_scope(&pairs)?;
    let granted = granted(user);
    let mut asked = pairs
        .iter()
        .filter(|(name, _)| name == "permissions")
        .map(|(_, permission)| granted.contains(&permission.as_str()))
        .peekable();
    if asked.peek().is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let result = if all { asked.all(|held| held) } else { asked.any(|held| held) };
    Ok(Json(PermissionCheck { result }))
}

async fn delete_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner, slug, name)): Path<(String, String, String)>,
) -> Result<StatusCode, StatusCode> {
    let mut db = state.db.write().await;
    db.authorize(&headers, true)?;
    let index = db.project_index(&owner, &slug).ok_or(StatusCode::NOT_FOUND)?;
    let plugin_id = db.projects[index].plugin_id.to_lowercase();
    let versions = db.versions.get_mut(&plugin_id).ok_or(StatusCode::NOT_FOUND)?;
    let position = versions
        .iter()
        .position(|version| version.name == name)
        .ok_or(StatusCode::NOT_FOUND)?;
    versions.remove(position);
    Ok(StatusCode::NO_CONTENT)
}
