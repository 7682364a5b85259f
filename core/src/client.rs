//! Stateless HTTP request builder and response parser for the Ore v2 API.
//!
//! # Design
//! `OreClient` holds only the API root and the user agent, and carries no
//! mutable state between calls. Each operation is split into a `build_*`
//! method that produces an `HttpRequest` and a `parse_*` method that consumes
//! an `HttpResponse`. Sessions are passed in explicitly; the facade owns them.

use serde::de::DeserializeOwned;

use crate::error::ApiError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::session::Session;
use crate::types::{
    encode_segment, ChangelogBody, Namespace, Permission, PermissionCheck, PermissionGrant,
    PermissionScope, Project, ProjectPatch, ProjectQuery, ProjectRef, ProjectTemplate, ResultList,
    SessionGrant, Version, VersionBody,
};

/// Path of the API below the configured base URL.
pub const API_ROOT: &str = "/api/v2";

/// Synchronous, stateless client for the Ore API.
#[derive(Debug, Clone)]
pub struct OreClient {
    root: String,
    user_agent: String,
}

impl OreClient {
    pub fn new(base_url: &str, user_agent: &str) -> Self {
        Self {
            root: format!("{}{API_ROOT}", base_url.trim_end_matches('/')),
            user_agent: user_agent.to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn request(&self, method: HttpMethod, path: String, session: Option<&Session>) -> HttpRequest {
        let mut headers = vec![("user-agent".to_string(), self.user_agent.clone())];
        if let Some(authorization) = session.and_then(Session::authorization) {
            headers.push(("authorization".to_string(), authorization));
        }
        HttpRequest {
            method,
            path: format!("{}{path}", self.root),
            headers,
            body: None,
        }
    }

    fn with_json<T: serde::Serialize>(mut request: HttpRequest, body: &T) -> Result<HttpRequest, ApiError> {
        let body = serde_json::to_string(body).map_err(|e| ApiError::SerializationError(e.to_string()))?;
        request
            .headers
            .push(("content-type".to_string(), "application/json".to_string()));
        request.body = Some(body);
        Ok(request)
    }

    /// Without a key the server hands out a public session.
    pub fn build_authenticate(&self, api_key: Option<&str>) -> HttpRequest {
        let mut request = self.request(HttpMethod::Post, "/authenticate".to_string(), None);
        if let Some(key) = api_key {
            request
                .headers
                .push(("authorization".to_string(), format!("OreApi apikey={key}")));
        }
        request
    }

    pub fn build_end_session(&self, session: &Session) -> HttpRequest {
        self.request(HttpMethod::Delete, "/sessions/current".to_string(), Some(session))
    }

    pub fn build_search_projects(&self, session: &Session, query: &ProjectQuery) -> HttpRequest {
        let path = format!("/projects?{}", query.to_query_string());
        self.request(HttpMethod::Get, path, Some(session))
    }

    pub fn build_create_project(
        &self,
        session: &Session,
        template: &ProjectTemplate,
    ) -> Result<HttpRequest, ApiError> {
        let request = self.request(HttpMethod::Post, "/projects".to_string(), Some(session));
        Self::with_json(request, template)
    }

    pub fn build_get_project(&self, session: &Session, namespace: &Namespace) -> HttpRequest {
        let path = format!("/projects/{}", namespace.path());
        self.request(HttpMethod::Get, path, Some(session))
    }

    pub fn build_update_project(
        &self,
        session: &Session,
        namespace: &Namespace,
        patch: &ProjectPatch,
    ) -> Result<HttpRequest, ApiError> {
        let path = format!("/projects/{}", namespace.path());
        Self::with_json(self.request(HttpMethod::Patch, path, Some(session)), patch)
    }

    pub fn build_delete_project(&self, session: &Session, namespace: &Namespace) -> HttpRequest {
        let path = format!("/projects/{}", namespace.path());
        self.request(HttpMethod::Delete, path, Some(session))
    }

    pub fn build_list_versions(
        &self,
        session: &Session,
        namespace: &Namespace,
        limit: u32,
        offset: u32,
    ) -> HttpRequest {
        let path = format!(
            "/projects/{}/versions?limit={limit}&offset={offset}",
            namespace.path()
        );
        self.request(HttpMethod::Get, path, Some(session))
    }

    pub fn build_get_version(&self, session: &Session, namespace: &Namespace, name: &str) -> HttpRequest {
        let path = format!("/projects/{}/versions/{}", namespace.path(), encode_segment(name));
        self.request(HttpMethod::Get, path, Some(session))
    }

    pub fn build_delete_version(&self, session: &Session, namespace: &Namespace, name: &str) -> HttpRequest {
        let path = format!("/projects/{}/versions/{}", namespace.path(), encode_segment(name));
        self.request(HttpMethod::Delete, path, Some(session))
    }

    pub fn build_get_changelog(&self, session: &Session, namespace: &Namespace, name: &str) -> HttpRequest {
        let path = format!(
            "/projects/{}/versions/{}/changelog",
            namespace.path(),
            encode_segment(name)
        );
        self.request(HttpMethod::Get, path, Some(session))
    }

    pub fn build_get_permissions(&self, session: &Session, scope: &PermissionScope) -> HttpRequest {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        scope.append_to(&mut query);
        let query = query.finish();
        let path = if query.is_empty() {
            "/permissions".to_string()
        } else {
            format!("/permissions?{query}")
        };
        self.request(HttpMethod::Get, path, Some(session))
    }

    /// Asks whether the session holds every one of `permissions` in `scope`.
    pub fn build_has_all_permissions(
        &self,
        session: &Session,
        scope: &PermissionScope,
        permissions: &[Permission],
    ) -> HttpRequest {
        self.build_check_permissions("hasAll", session, scope, permissions)
    }

    /// Asks whether the session holds at least one of `permissions` in `scope`.
    pub fn build_has_any_permissions(
        &self,
        session: &Session,
        scope: &PermissionScope,
        permissions: &[Permission],
    ) -> HttpRequest {
        self.build_check_permissions("hasAny", session, scope, permissions)
    }

    fn build_check_permissions(
        &self,
        check: &str,
        session: &Session,
        scope: &PermissionScope,
        permissions: &[Permission],
    ) -> HttpRequest {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        scope.append_to(&mut query);
        for permission in permissions {
            query.append_pair("permissions", permission.as_str());
        }
        let path = format!("/permissions/{check}?{}", query.finish());
        self.request(HttpMethod::Get, path, Some(session))
    }

    pub fn parse_authenticate(&self, response: HttpResponse) -> Result<SessionGrant, ApiError> {
        if response.status == 401 || response.status == 403 {
            return Err(ApiError::Unauthenticated(response.body));
        }
        parse_json(response)
    }

    pub fn parse_end_session(&self, response: HttpResponse) -> Result<(), ApiError> {
        check_status(&response)
    }

    pub fn parse_search_projects(&self, response: HttpResponse) -> Result<ResultList<Project>, ApiError> {
        parse_json(response)
    }

    pub fn parse_create_project(&self, response: HttpResponse) -> Result<Project, ApiError> {
        parse_json(response)
    }

    pub fn parse_get_project(&self, response: HttpResponse) -> Result<Project, ApiError> {
        parse_json(response)
    }

    pub fn parse_update_project(&self, response: HttpResponse) -> Result<Project, ApiError> {
        parse_json(response)
    }

    pub fn parse_delete_project(&self, response: HttpResponse) -> Result<(), ApiError> {
        check_status(&response)
    }

    /// Versions come back without their project; `project` is attached.
    pub fn parse_list_versions(
        &self,
        response: HttpResponse,
        project: &ProjectRef,
    ) -> Result<ResultList<Version>, ApiError> {
        let page: ResultList<VersionBody> = parse_json(response)?;
        Ok(ResultList {
            pagination: page.pagination,
            result: page.result.into_iter().map(|body| body.attach(project)).collect(),
        })
    }

    pub fn parse_get_version(&self, response: HttpResponse, project: &ProjectRef) -> Result<Version, ApiError> {
        let body: VersionBody = parse_json(response)?;
        Ok(body.attach(project))
    }

    pub fn parse_delete_version(&self, response: HttpResponse) -> Result<(), ApiError> {
        check_status(&response)
    }

    /// `None` when the version has no changelog.
    pub fn parse_get_changelog(&self, response: HttpResponse) -> Result<Option<String>, ApiError> {
        let body: ChangelogBody = parse_json(response)?;
        Ok(body.changelog)
    }

    pub fn parse_get_permissions(&self, response: HttpResponse) -> Result<PermissionGrant, ApiError> {
        parse_json(response)
    }

    /// Answer of `build_has_all_permissions` or `build_has_any_permissions`.
    pub fn parse_has_permissions(&self, response: HttpResponse) -> Result<bool, ApiError> {
        let check: PermissionCheck = parse_json(response)?;
        Ok(check.result)
    }
}

fn parse_json<T: DeserializeOwned>(response: HttpResponse) -> Result<T, ApiError> {
    check_status(&response)?;
    serde_json::from_str(&response.body).map_err(|e| ApiError::DeserializationError(e.to_string()))
}

/// Map non-success status codes to the appropriate `ApiError` variant.
fn check_status(response: &HttpResponse) -> Result<(), ApiError> {
    match response.status {
        200..=299 => Ok(()),
        401 => Err(ApiError::Unauthenticated(response.body.clone())),
        403 => Err(ApiError::Forbidden),
        404 => Err(ApiError::NotFound),
        status => Err(ApiError::HttpError {
            status,
            body: response.body.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use chrono::Utc;

    fn client() -> OreClient {
        OreClient::new("http://localhost:3000", "ore-core-tests")
    }

    fn session() -> Session {
        let grant = SessionGrant {
            session: "token".to_string(),
            expires: Utc::now() + chrono::Duration::hours(1),
            kind: None,
        };
        Session::from_grant(&grant, system_clock())
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    fn nucleus() -> ProjectRef {
        ProjectRef {
            plugin_id: "nucleus".to_string(),
            namespace: Namespace::new("NucleusPowered", "Nucleus"),
        }
    }

    #[test]
    fn authenticate_sends_api_key() {
        let req = client().build_authenticate(Some("secret"));
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.path, "http://localhost:3000/api/v2/authenticate");
        assert_eq!(req.header("authorization"), Some("OreApi apikey=secret"));
        assert_eq!(req.header("User-Agent"), Some("ore-core-tests"));
    }

    #[test]
    fn anonymous_authenticate_has_no_authorization() {
        let req = client().build_authenticate(None);
        assert!(req.header("authorization").is_none());
    }

    #[test]
    fn requests_carry_live_session() {
        let req = client().build_get_project(&session(), &nucleus().namespace);
        assert_eq!(req.path, "http://localhost:3000/api/v2/projects/NucleusPowered/Nucleus");
        assert_eq!(req.header("authorization"), Some("OreApi session=token"));
    }

    #[test]
    fn expired_session_is_not_sent() {
        let req = client().build_end_session(&Session::none());
        assert_eq!(req.method, HttpMethod::Delete);
        assert!(req.header("authorization").is_none());
    }

    #[test]
    fn search_builds_query_string() {
        let query = ProjectQuery {
            q: Some("nucleus".to_string()),
            limit: Some(10),
            offset: 20,
            ..ProjectQuery::default()
        };
        let req = client().build_search_projects(&session(), &query);
        assert_eq!(
            req.path,
            "http://localhost:3000/api/v2/projects?q=nucleus&limit=10&offset=20"
        );
    }

    #[test]
    fn update_project_is_a_json_patch() {
        let patch = ProjectPatch {
            name: Some("Renamed".to_string()),
            ..ProjectPatch::default()
        };
        let req = client()
            .build_update_project(&session(), &nucleus().namespace, &patch)
            .unwrap();
        assert_eq!(req.method, HttpMethod::Patch);
        assert_eq!(req.header("content-type"), Some("application/json"));
        let body: serde_json::Value = serde_json::from_str(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["name"], "Renamed");
        assert!(body.get("summary").is_none());
    }

    #[test]
    fn version_name_is_encoded() {
        let req = client().build_get_version(&session(), &nucleus().namespace, "1.0 beta");
        assert!(req.path.ends_with("/projects/NucleusPowered/Nucleus/versions/1.0%20beta"));
    }

    #[test]
    fn parse_grant() {
        let grant = client()
            .parse_authenticate(response(
                200,
                r#"{"session":"s1","expires":"2030-01-01T00:00:00Z","type":"user"}"#,
            ))
            .unwrap();
        assert_eq!(grant.session, "s1");
        assert_eq!(grant.kind.as_deref(), Some("user"));
    }

    #[test]
    fn rejected_key_is_unauthenticated() {
        let err = client().parse_authenticate(response(401, "bad key")).unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated(body) if body == "bad key"));
    }

    #[test]
    fn status_codes_map_to_errors() {
        let client = client();
        assert!(matches!(client.parse_get_project(response(404, "")), Err(ApiError::NotFound)));
        assert!(matches!(client.parse_delete_project(response(403, "")), Err(ApiError::Forbidden)));
        assert!(matches!(
            client.parse_delete_version(response(401, "")),
            Err(ApiError::Unauthenticated(_))
        ));
        assert!(matches!(
            client.parse_create_project(response(500, "internal error")),
            Err(ApiError::HttpError { status: 500, .. })
        ));
        assert!(client.parse_delete_project(response(204, "")).is_ok());
    }

    #[test]
    fn versions_get_their_project_attached() {
        let body = r#"{
            "pagination": {"limit": 10, "offset": 0, "count": 1},
            "result": [{"name": "2.0.0", "created_at": "2020-01-01T00:00:00Z", "visibility": "public"}]
        }"#;
        let page = client().parse_list_versions(response(200, body), &nucleus()).unwrap();
        assert_eq!(page.pagination.count, 1);
        assert_eq!(page.result[0].project, nucleus());
    }

    #[test]
    fn bad_json_is_a_deserialization_error() {
        let err = client().parse_get_project(response(200, "not json")).unwrap_err();
        assert!(matches!(err, ApiError::DeserializationError(_)));
    }

    #[test]
    fn trailing_slash_is_stripped() {
        let client = OreClient::new("http://localhost:3000/", "ua");
        assert_eq!(client.root(), "http://localhost:3000/api/v2");
    }

    #[test]
    fn permission_queries_carry_scope_and_names() {
        let client = client();
        let req = client.build_get_permissions(&session(), &PermissionScope::Global);
        assert_eq!(req.path, "http://localhost:3000/api/v2/permissions");

        let scope = PermissionScope::Project(nucleus().namespace);
        let req = client.build_has_all_permissions(
            &session(),
            &scope,
            &[Permission::EditPage, Permission::DeleteVersion],
        );
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(
            req.path,
            "http://localhost:3000/api/v2/permissions/hasAll?projectOwner=NucleusPowered\
             &projectSlug=Nucleus&permissions=edit_page&permissions=delete_version"
        );

        let scope = PermissionScope::Organization("Sponge Team".to_string());
        let req = client.build_has_any_permissions(&session(), &scope, &[Permission::IsStaff]);
        assert!(req
            .path
            .ends_with("/permissions/hasAny?organizationName=Sponge+Team&permissions=is_staff"));
    }

    #[test]
    fn permission_answers_parse() {
        let client = client();
        let grant = client
            .parse_get_permissions(response(
                200,
                r#"{"type":"global","permissions":["view_public_info","create_project"]}"#,
            ))
            .unwrap();
        assert!(grant.contains(Permission::CreateProject));
        assert!(!grant.contains(Permission::IsStaff));

        assert!(client.parse_has_permissions(response(200, r#"{"result":true}"#)).unwrap());
        assert!(matches!(
            client.parse_has_permissions(response(404, "")),
            Err(ApiError::NotFound)
        ));
    }

    #[test]
    fn changelog_route_and_body() {
        let client = client();
        let req = client.build_get_changelog(&session(), &nucleus().namespace, "2.0.0");
        assert!(req.path.ends_with("/projects/NucleusPowered/Nucleus/versions/2.0.0/changelog"));

        let text = client
            .parse_get_changelog(response(200, r#"{"changelog":"Fixed things"}"#))
            .unwrap();
        assert_eq!(text.as_deref(), Some("Fixed things"));
        assert_eq!(client.parse_get_changelog(response(200, "{}")).unwrap(), None);
    }

    #[test]
    fn builders_only_use_routed_methods() {
        let client = client();
        let session = session();
        let ns = nucleus().namespace;
        let methods: Vec<HttpMethod> = vec![
            client.build_authenticate(None).method,
            client.build_end_session(&session).method,
            client.build_search_projects(&session, &ProjectQuery::default()).method,
            client.build_get_project(&session, &ns).method,
            client
                .build_update_project(&session, &ns, &ProjectPatch::default())
                .unwrap()
                .method,
            client.build_delete_project(&session, &ns).method,
            client.build_list_versions(&session, &ns, 10, 0).method,
            client.build_get_version(&session, &ns, "1").method,
            client.build_delete_version(&session, &ns, "1").method,
            client.build_get_changelog(&session, &ns, "1").method,
            client.build_get_permissions(&session, &PermissionScope::Global).method,
        ];
        let names: std::collections::BTreeSet<&str> = methods.into_iter().map(HttpMethod::as_str).collect();
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["DELETE", "GET", "PATCH", "POST"]);
    }
}
