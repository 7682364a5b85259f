//! Domain DTOs for the Ore v2 API.
//!
//! # Design
//! These types mirror the mock-server's schema but are defined independently;
//! integration tests catch any schema drift between the two crates.
//!
//! Versions are served without a reference to their project, so the client
//! parses them through a private wire struct and attaches the `ProjectRef`
//! the request was made for. The cache relies on that back-reference to
//! untrack versions together with their project.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MissingPermissions;

/// `owner/slug` pair addressing a project in URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub owner: String,
    pub slug: String,
}

impl Namespace {
    pub fn new(owner: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            slug: slug.into(),
        }
    }

    /// Both segments percent-encoded, joined by `/`.
    pub fn path(&self) -> String {
        format!("{}/{}", encode_segment(&self.owner), encode_segment(&self.slug))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.slug)
    }
}

pub(crate) fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// The two identities of a project: its stable plugin id and its current
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub plugin_id: String,
    pub namespace: Namespace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Visibility {
    Public,
    New,
    NeedsChanges,
    NeedsApproval,
    SoftDelete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectStats {
    pub views: u64,
    pub downloads: u64,
    pub stars: u64,
    pub watchers: u64,
}

/// A project returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub plugin_id: String,
    pub namespace: Namespace,
    pub name: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub category: String,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: ProjectStats,
}

impl Project {
    pub fn reference(&self) -> ProjectRef {
        ProjectRef {
            plugin_id: self.plugin_id.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

/// A version of a project, carrying a reference back to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub project: ProjectRef,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub downloads: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VersionBody {
    name: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    description: Option<String>,
    visibility: Visibility,
    #[serde(default)]
    stats: VersionStats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VersionStats {
    downloads: u64,
}

impl VersionBody {
    pub(crate) fn attach(self, project: &ProjectRef) -> Version {
        Version {
            project: project.clone(),
            name: self.name,
            created_at: self.created_at,
            description: self.description,
            visibility: self.visibility,
            downloads: self.stats.downloads,
        }
    }
}

/// Response of `POST /authenticate`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionGrant {
    pub session: String,
    pub expires: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
    pub count: u64,
}

impl Pagination {
    /// True when no page follows this one.
    pub fn is_last(&self, returned: usize) -> bool {
        returned == 0 || u64::from(self.offset) + returned as u64 >= self.count
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResultList<T> {
    pub pagination: Pagination,
    pub result: Vec<T>,
}

/// Request payload for creating a project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectTemplate {
    pub name: String,
    pub plugin_id: String,
    pub category: String,
    pub owner_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Request payload for editing a project. Only the fields present in the JSON
/// are applied; omitted fields remain unchanged on the server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Filters for `GET /projects`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectQuery {
    pub q: Option<String>,
    pub category: Option<String>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl ProjectQuery {
    pub fn search(q: impl Into<String>) -> Self {
        Self {
            q: Some(q.into()),
            ..Self::default()
        }
    }

    pub(crate) fn to_query_string(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(q) = &self.q {
            query.append_pair("q", q);
        }
        if let Some(category) = &self.category {
            query.append_pair("category", category);
        }
        if let Some(limit) = self.limit {
            query.append_pair("limit", &limit.to_string());
        }
        query.append_pair("offset", &self.offset.to_string());
        query.finish()
    }
}

/// Response of the changelog route.
#[derive(Debug, Deserialize)]
pub(crate) struct ChangelogBody {
    #[serde(default)]
    pub(crate) changelog: Option<String>,
}

/// A named permission, spelled on the wire in snake case
/// (`view_public_info`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewPublicInfo,
    EditOwnUserSettings,
    EditApiKeys,
    EditSubjectSettings,
    ManageSubjectMembers,
    IsSubjectOwner,
    CreateProject,
    EditPage,
    DeleteProject,
    CreateVersion,
    EditVersion,
    DeleteVersion,
    EditTags,
    CreateOrganization,
    PostAsOrganization,
    ModNotesAndFlags,
    SeeHidden,
    IsStaff,
    Reviewer,
    ViewHealth,
    ViewIp,
    ViewStats,
    ViewLogs,
    ManualValueChanges,
    HardDeleteProject,
    HardDeleteVersion,
    EditAllUserSettings,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::ViewPublicInfo => "view_public_info",
            Permission::EditOwnUserSettings => "edit_own_user_settings",
            Permission::EditApiKeys => "edit_api_keys",
            Permission::EditSubjectSettings => "edit_subject_settings",
            Permission::ManageSubjectMembers => "manage_subject_members",
            Permission::IsSubjectOwner => "is_subject_owner",
            Permission::CreateProject => "create_project",
            Permission::EditPage => "edit_page",
            Permission::DeleteProject => "delete_project",
            Permission::CreateVersion => "create_version",
            Permission::EditVersion => "edit_version",
            Permission::DeleteVersion => "delete_version",
            Permission::EditTags => "edit_tags",
            Permission::CreateOrganization => "create_organization",
            Permission::PostAsOrganization => "post_as_organization",
            Permission::ModNotesAndFlags => "mod_notes_and_flags",
            Permission::SeeHidden => "see_hidden",
            Permission::IsStaff => "is_staff",
            Permission::Reviewer => "reviewer",
            Permission::ViewHealth => "view_health",
            Permission::ViewIp => "view_ip",
            Permission::ViewStats => "view_stats",
            Permission::ViewLogs => "view_logs",
            Permission::ManualValueChanges => "manual_value_changes",
            Permission::HardDeleteProject => "hard_delete_project",
            Permission::HardDeleteVersion => "hard_delete_version",
            Permission::EditAllUserSettings => "edit_all_user_settings",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a permission query is asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionScope {
    Global,
    Project(Namespace),
    Organization(String),
}

impl PermissionScope {
    pub(crate) fn append_to(&self, query: &mut url::form_urlencoded::Serializer<'_, String>) {
        match self {
            PermissionScope::Global => {}
            PermissionScope::Project(namespace) => {
                query.append_pair("projectOwner", &namespace.owner);
                query.append_pair("projectSlug", &namespace.slug);
            }
            PermissionScope::Organization(name) => {
                query.append_pair("organizationName", name);
            }
        }
    }
}

/// Permissions the server confirmed for the current session in one scope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PermissionGrant {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub permissions: BTreeSet<Permission>,
}

impl PermissionGrant {
    pub fn contains(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn contains_all(&self, required: &[Permission]) -> bool {
        required.iter().all(|permission| self.contains(*permission))
    }

    /// False for an empty `required`.
    pub fn contains_any(&self, required: &[Permission]) -> bool {
        required.iter().any(|permission| self.contains(*permission))
    }

    /// Fails with every permission from `required` that is not granted.
    pub fn require_all(&self, required: &[Permission]) -> Result<(), MissingPermissions> {
        let missing: Vec<Permission> = required
            .iter()
            .copied()
            .filter(|permission| !self.contains(*permission))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MissingPermissions(missing))
        }
    }

    pub fn require_any(&self, required: &[Permission]) -> Result<(), MissingPermissions> {
        if self.contains_any(required) {
            Ok(())
        } else {
            Err(MissingPermissions(required.to_vec()))
        }
    }
}

/// Response of the `hasAll`/`hasAny` routes.
#[derive(Debug, Deserialize)]
pub(crate) struct PermissionCheck {
    pub(crate) result: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_path_is_encoded() {
        let namespace = Namespace::new("Some Owner", "my/plugin");
        assert_eq!(namespace.path(), "Some%20Owner/my%2Fplugin");
        assert_eq!(namespace.to_string(), "Some Owner/my/plugin");
    }

    #[test]
    fn project_parses_from_wire_json() {
        let json = r#"{
            "plugin_id": "nucleus",
            "namespace": {"owner": "NucleusPowered", "slug": "Nucleus"},
            "name": "Nucleus",
            "category": "admin_tools",
            "visibility": "needsApproval",
            "created_at": "2019-01-02T03:04:05Z"
        }"#;
        let project: Project = serde_json::from_str(json).unwrap();
        assert_eq!(project.visibility, Visibility::NeedsApproval);
        assert_eq!(project.summary, None);
        assert_eq!(project.stats, ProjectStats::default());
        assert_eq!(project.reference().namespace.slug, "Nucleus");
    }

    #[test]
    fn version_gets_project_reference_attached() {
        let json = r#"{
            "name": "2.1.0",
            "created_at": "2020-05-06T07:08:09Z",
            "visibility": "public",
            "stats": {"downloads": 12}
        }"#;
        let body: VersionBody = serde_json::from_str(json).unwrap();
        let project = ProjectRef {
            plugin_id: "nucleus".to_string(),
            namespace: Namespace::new("NucleusPowered", "Nucleus"),
        };
        let version = body.attach(&project);
        assert_eq!(version.project, project);
        assert_eq!(version.downloads, 12);
    }

    #[test]
    fn patch_omits_unset_fields() {
        let patch = ProjectPatch {
            summary: Some("New summary".to_string()),
            ..ProjectPatch::default()
        };
        assert_eq!(serde_json::to_string(&patch).unwrap(), r#"{"summary":"New summary"}"#);
    }

    #[test]
    fn query_string_encodes_terms() {
        let query = ProjectQuery {
            q: Some("world edit".to_string()),
            limit: Some(25),
            ..ProjectQuery::default()
        };
        assert_eq!(query.to_query_string(), "q=world+edit&limit=25&offset=0");
    }

    #[test]
    fn last_page_detection() {
        let pagination = Pagination { limit: 25, offset: 25, count: 40 };
        assert!(pagination.is_last(15));
        assert!(!pagination.is_last(10));
        assert!(pagination.is_last(0));
    }

    #[test]
    fn permissions_use_snake_case_names() {
        for permission in [Permission::ViewPublicInfo, Permission::ViewIp, Permission::HardDeleteVersion] {
            let json = serde_json::to_string(&permission).unwrap();
            assert_eq!(json, format!("\"{permission}\""));
        }
    }

    #[test]
    fn grant_parses_and_reports_missing_permissions() {
        let json = r#"{"type": "project", "permissions": ["view_public_info", "edit_page"]}"#;
        let grant: PermissionGrant = serde_json::from_str(json).unwrap();

        assert_eq!(grant.kind.as_deref(), Some("project"));
        assert!(grant.contains_all(&[Permission::ViewPublicInfo, Permission::EditPage]));
        assert!(grant.contains_any(&[Permission::DeleteProject, Permission::EditPage]));
        assert!(!grant.contains_any(&[]));
        assert!(grant.contains_all(&[]));

        let err = grant
            .require_all(&[Permission::EditPage, Permission::DeleteProject, Permission::IsStaff])
            .unwrap_err();
        assert_eq!(err.0, vec![Permission::DeleteProject, Permission::IsStaff]);
        assert_eq!(err.to_string(), "missing permission: delete_project, is_staff");
        assert!(grant.require_any(&[Permission::IsStaff, Permission::EditPage]).is_ok());
        assert!(grant.require_any(&[Permission::IsStaff]).is_err());
    }

    #[test]
    fn unknown_permission_is_rejected() {
        let json = r#"{"permissions": ["fly"]}"#;
        assert!(serde_json::from_str::<PermissionGrant>(json).is_err());
    }

    #[test]
    fn scope_adds_its_query_pairs() {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        PermissionScope::Project(Namespace::new("Some One", "Plugin")).append_to(&mut query);
        assert_eq!(query.finish(), "projectOwner=Some+One&projectSlug=Plugin");

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        PermissionScope::Global.append_to(&mut query);
        assert_eq!(query.finish(), "");
    }
}
