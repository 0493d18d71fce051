//! Model registry client.
//!
//! The [`ModelRegistry`] trait is everything the watcher needs from the
//! registry: resolve an alias, list and fetch versions, and delete runs and
//! versions. [`MlflowRegistry`] implements it against the MLflow REST API;
//! [`MockRegistry`] is an in-memory double for tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use modelwatch_reconcile::{ModelVersion, VersionId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{RegistryError, RegistryResult};

/// Registry interface.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Resolve `alias` on `model`. `Ok(None)` when the alias is unbound.
    async fn get_version_by_alias(
        &self,
        model: &str,
        alias: &str,
    ) -> RegistryResult<Option<ModelVersion>>;

    /// List every version of `model`. The listing may lag the true state.
    async fn list_versions(&self, model: &str) -> RegistryResult<Vec<ModelVersion>>;

    /// Fetch the authoritative record for one version.
    async fn get_version(
        &self,
        model: &str,
        version: &VersionId,
    ) -> RegistryResult<Option<ModelVersion>>;

    /// Delete a run record.
    async fn delete_run(&self, run_id: &str) -> RegistryResult<()>;

    /// Delete a version record.
    async fn delete_version(&self, model: &str, version: &VersionId) -> RegistryResult<()>;
}

const API_PREFIX: &str = "/api/2.0/mlflow";

/// Page size for version searches.
const SEARCH_PAGE_SIZE: u32 = 200;

/// MLflow tracking server client.
pub struct MlflowRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl MlflowRegistry {
    /// Create a new client for the tracking server at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> RegistryResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    /// Turn a non-success response into an error, mapping MLflow's
    /// "does not exist" answers to [`RegistryError::NotFound`].
    async fn check(response: reqwest::Response, what: &str) -> RegistryResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = serde_json::from_str::<MlflowErrorBody>(&body).unwrap_or_default();

        if status.as_u16() == 404 || error.is_not_found() {
            debug!(status = %status, body = %body, "{} not found", what);
            return Err(RegistryError::NotFound(what.to_string()));
        }

        error!(status = %status, body = %body, "Registry request failed: {}", what);
        Err(RegistryError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> RegistryResult<T> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| RegistryError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ModelRegistry for MlflowRegistry {
    async fn get_version_by_alias(
        &self,
        model: &str,
        alias: &str,
    ) -> RegistryResult<Option<ModelVersion>> {
        let url = self.url("/registered-models/alias");
        debug!(url = %url, model, alias, "Resolving alias");

        let response = self
            .client
            .get(&url)
            .query(&[("name", model), ("alias", alias)])
            .send()
            .await?;

        match Self::check(response, "alias").await {
            Ok(response) => {
                let body: ModelVersionEnvelope = Self::decode(response).await?;
                Ok(Some(body.model_version.into()))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_versions(&self, model: &str) -> RegistryResult<Vec<ModelVersion>> {
        let url = self.url("/model-versions/search");
        let filter = format!("name='{}'", model.replace('\'', "\\'"));
        let page_size = SEARCH_PAGE_SIZE.to_string();

        let mut versions = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("filter", filter.as_str()), ("max_results", page_size.as_str())];
            if let Some(token) = page_token.as_deref() {
                query.push(("page_token", token));
            }

            let response = self.client.get(&url).query(&query).send().await?;
            let response = Self::check(response, "model versions").await?;
            let page: SearchVersionsResponse = Self::decode(response).await?;

            versions.extend(page.model_versions.into_iter().map(ModelVersion::from));

            match page.next_page_token {
                Some(token) if page_token.as_deref() == Some(token.as_str()) => {
                    warn!(model, token = %token, "Registry repeated a page token, stopping listing");
                    break;
                }
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(model, count = versions.len(), "Listed model versions");
        Ok(versions)
    }

    async fn get_version(
        &self,
        model: &str,
        version: &VersionId,
    ) -> RegistryResult<Option<ModelVersion>> {
        let url = self.url("/model-versions/get");

        let response = self
            .client
            .get(&url)
            .query(&[("name", model), ("version", version.as_str())])
            .send()
            .await?;

        match Self::check(response, "model version").await {
            Ok(response) => {
                let body: ModelVersionEnvelope = Self::decode(response).await?;
                Ok(Some(body.model_version.into()))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_run(&self, run_id: &str) -> RegistryResult<()> {
        let url = self.url("/runs/delete");
        let response = self
            .client
            .post(&url)
            .json(&DeleteRunRequest { run_id })
            .send()
            .await?;

        Self::check(response, "run").await?;
        Ok(())
    }

    async fn delete_version(&self, model: &str, version: &VersionId) -> RegistryResult<()> {
        let url = self.url("/model-versions/delete");
        let response = self
            .client
            .delete(&url)
            .json(&DeleteVersionRequest {
                name: model,
                version: version.as_str(),
            })
            .send()
            .await?;

        Self::check(response, "model version").await?;
        Ok(())
    }
}

/// Model version as serialized by MLflow.
#[derive(Debug, Clone, Deserialize)]
pub struct MlflowModelVersion {
    pub version: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl From<MlflowModelVersion> for ModelVersion {
    fn from(v: MlflowModelVersion) -> Self {
        ModelVersion {
            version: VersionId::new(v.version),
            run_id: v.run_id.filter(|id| !id.is_empty()),
            aliases: v.aliases,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelVersionEnvelope {
    model_version: MlflowModelVersion,
}

#[derive(Debug, Deserialize)]
struct SearchVersionsResponse {
    #[serde(default)]
    model_versions: Vec<MlflowModelVersion>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MlflowErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl MlflowErrorBody {
    /// MLflow reports an unbound alias as `INVALID_PARAMETER_VALUE` (400)
    /// with a "... not found" message rather than a 404.
    fn is_not_found(&self) -> bool {
        match self.error_code.as_deref() {
            Some("RESOURCE_DOES_NOT_EXIST") => true,
            Some("INVALID_PARAMETER_VALUE") => self
                .message
                .as_deref()
                .is_some_and(|m| m.to_lowercase().contains("not found")),
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct DeleteRunRequest<'a> {
    run_id: &'a str,
}

#[derive(Debug, Serialize)]
struct DeleteVersionRequest<'a> {
    name: &'a str,
    version: &'a str,
}

/// Calls recorded by [`MockRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    GetVersionByAlias,
    ListVersions,
    GetVersion(VersionId),
    DeleteRun(String),
    DeleteVersion(VersionId),
}

#[derive(Debug, Default)]
struct MockState {
    /// Authoritative records.
    versions: BTreeMap<VersionId, ModelVersion>,

    /// Alias bindings.
    aliases: BTreeMap<String, VersionId>,

    /// Listing served instead of the authoritative records, to model a
    /// lagging cache.
    stale_listing: Option<Vec<ModelVersion>>,

    /// Scripted alias responses consumed before the real binding is used.
    alias_script: Vec<Option<VersionId>>,

    deleted_runs: HashSet<String>,
    fail_alias_lookup: bool,
    fail_listing: bool,
    fail_run_deletes: HashSet<String>,
    fail_version_deletes: HashSet<VersionId>,
    calls: Vec<RegistryCall>,
}

/// In-memory registry for testing.
#[derive(Debug, Default)]
pub struct MockRegistry {
    state: Mutex<MockState>,
}

impl MockRegistry {
    /// Create an empty mock registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a version. Aliases listed on it are bound as well.
    pub fn add_version(&self, version: &str, run_id: Option<&str>, aliases: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let id = VersionId::new(version);
        for alias in aliases {
            bind(&mut state, alias, &id);
        }
        state.versions.insert(
            id.clone(),
            ModelVersion {
                version: id,
                run_id: run_id.map(str::to_string),
                aliases: aliases.iter().map(|a| a.to_string()).collect(),
            },
        );
    }

    /// Point `alias` at `version`, moving it off any previous target.
    pub fn set_alias(&self, alias: &str, version: &str) {
        let mut state = self.state.lock().unwrap();
        bind(&mut state, alias, &VersionId::new(version));
    }

    /// Serve alias lookups from `script` (in order) before falling back to
    /// the real binding.
    pub fn script_alias(&self, script: Vec<Option<&str>>) {
        let mut state = self.state.lock().unwrap();
        state.alias_script = script.into_iter().rev().map(|v| v.map(VersionId::new)).collect();
    }

    /// Serve `versions` from `list_versions` instead of the real records.
    pub fn set_stale_listing(&self, versions: Vec<ModelVersion>) {
        self.state.lock().unwrap().stale_listing = Some(versions);
    }

    pub fn fail_alias_lookup(&self, fail: bool) {
        self.state.lock().unwrap().fail_alias_lookup = fail;
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    pub fn fail_run_delete(&self, run_id: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_run_deletes
            .insert(run_id.to_string());
    }

    pub fn fail_version_delete(&self, version: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_version_deletes
            .insert(VersionId::new(version));
    }

    /// Returns true if the version record still exists.
    pub fn has_version(&self, version: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .versions
            .contains_key(&VersionId::new(version))
    }

    /// Returns true if the run was deleted.
    pub fn run_deleted(&self, run_id: &str) -> bool {
        self.state.lock().unwrap().deleted_runs.contains(run_id)
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<RegistryCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of delete calls (run or version) made so far.
    pub fn delete_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RegistryCall::DeleteRun(_) | RegistryCall::DeleteVersion(_)))
            .count()
    }
}

fn bind(state: &mut MockState, alias: &str, target: &VersionId) {
    for version in state.versions.values_mut() {
        version.aliases.retain(|a| a != alias);
    }
    if let Some(version) = state.versions.get_mut(target) {
        version.aliases.push(alias.to_string());
    }
    state.aliases.insert(alias.to_string(), target.clone());
}

#[async_trait]
impl ModelRegistry for MockRegistry {
    async fn get_version_by_alias(
        &self,
        _model: &str,
        alias: &str,
    ) -> RegistryResult<Option<ModelVersion>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RegistryCall::GetVersionByAlias);

        if state.fail_alias_lookup {
            return Err(RegistryError::Other("registry unreachable".to_string()));
        }

        let target = match state.alias_script.pop() {
            Some(scripted) => scripted,
            None => state.aliases.get(alias).cloned(),
        };

        Ok(target.map(|version| {
            state.versions.get(&version).cloned().unwrap_or(ModelVersion {
                version,
                run_id: None,
                aliases: vec![alias.to_string()],
            })
        }))
    }

    async fn list_versions(&self, _model: &str) -> RegistryResult<Vec<ModelVersion>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RegistryCall::ListVersions);

        if state.fail_listing {
            return Err(RegistryError::Other("search failed".to_string()));
        }

        Ok(match &state.stale_listing {
            Some(listing) => listing.clone(),
            None => state.versions.values().cloned().collect(),
        })
    }

    async fn get_version(
        &self,
        _model: &str,
        version: &VersionId,
    ) -> RegistryResult<Option<ModelVersion>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RegistryCall::GetVersion(version.clone()));
        Ok(state.versions.get(version).cloned())
    }

    async fn delete_run(&self, run_id: &str) -> RegistryResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RegistryCall::DeleteRun(run_id.to_string()));

        if state.fail_run_deletes.contains(run_id) {
            return Err(RegistryError::Status {
                status: 500,
                body: format!("cannot delete run {}", run_id),
            });
        }
        state.deleted_runs.insert(run_id.to_string());
        Ok(())
    }

    async fn delete_version(&self, _model: &str, version: &VersionId) -> RegistryResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RegistryCall::DeleteVersion(version.clone()));

        if state.fail_version_deletes.contains(version) {
            return Err(RegistryError::Status {
                status: 500,
                body: format!("cannot delete version {}", version),
            });
        }
        match state.versions.remove(version) {
            Some(_) => Ok(()),
            None => Err(RegistryError::NotFound(format!("version {}", version))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> MlflowRegistry {
        MlflowRegistry::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_model_version_deserialization() {
        let json = r#"{
            "model_version": {
                "name": "CarroModel",
                "version": "4",
                "creation_timestamp": 1734436800000,
                "run_id": "a1b2c3",
                "status": "READY",
                "aliases": ["production"]
            }
        }"#;

        let body: ModelVersionEnvelope = serde_json::from_str(json).unwrap();
        let version: ModelVersion = body.model_version.into();
        assert_eq!(version.version, VersionId::new("4"));
        assert_eq!(version.run_id.as_deref(), Some("a1b2c3"));
        assert_eq!(version.aliases, vec!["production".to_string()]);
        assert!(!version.is_orphan());
    }

    #[test]
    fn test_missing_aliases_and_empty_run_id() {
        let json = r#"{"version": "2", "run_id": ""}"#;
        let version: ModelVersion = serde_json::from_str::<MlflowModelVersion>(json)
            .unwrap()
            .into();
        assert_eq!(version.run_id, None);
        assert!(version.is_orphan());
    }

    #[tokio::test]
    async fn test_get_version_by_alias() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.0/mlflow/registered-models/alias"))
            .and(query_param("name", "CarroModel"))
            .and(query_param("alias", "production"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model_version": {"version": "7", "run_id": "r7", "aliases": ["production"]}
            })))
            .mount(&server)
            .await;

        let version = client(&server)
            .get_version_by_alias("CarroModel", "production")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version.version, VersionId::new("7"));
    }

    #[tokio::test]
    async fn test_unbound_alias_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.0/mlflow/registered-models/alias"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error_code": "RESOURCE_DOES_NOT_EXIST",
                "message": "Registered model alias production not found."
            })))
            .mount(&server)
            .await;

        let version = client(&server)
            .get_version_by_alias("CarroModel", "production")
            .await
            .unwrap();
        assert!(version.is_none());
    }

    #[tokio::test]
    async fn test_unbound_alias_invalid_parameter_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.0/mlflow/registered-models/alias"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error_code": "INVALID_PARAMETER_VALUE",
                "message": "Registered model alias production not found."
            })))
            .mount(&server)
            .await;

        let version = client(&server)
            .get_version_by_alias("CarroModel", "production")
            .await
            .unwrap();
        assert!(version.is_none());
    }

    #[tokio::test]
    async fn test_other_invalid_parameter_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.0/mlflow/registered-models/alias"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error_code": "INVALID_PARAMETER_VALUE",
                "message": "Missing value for required parameter 'alias'."
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .get_version_by_alias("CarroModel", "")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Status { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_list_versions_stops_on_repeated_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.0/mlflow/model-versions/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model_versions": [{"version": "1"}],
                "next_page_token": "stuck"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let versions = client(&server).list_versions("CarroModel").await.unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[tokio::test]
    async fn test_list_versions_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.0/mlflow/model-versions/search"))
            .and(query_param("page_token", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model_versions": [{"version": "1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/2.0/mlflow/model-versions/search"))
            .and(query_param("filter", "name='CarroModel'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model_versions": [{"version": "2", "aliases": ["production"]}],
                "next_page_token": "next"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let versions = client(&server).list_versions("CarroModel").await.unwrap();
        let ids: Vec<_> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
        assert!(versions[1].is_orphan());
    }

    #[tokio::test]
    async fn test_delete_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/runs/delete"))
            .and(body_json(serde_json::json!({"run_id": "r1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/2.0/mlflow/model-versions/delete"))
            .and(body_json(serde_json::json!({"name": "CarroModel", "version": "1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let registry = client(&server);
        registry.delete_run("r1").await.unwrap();
        registry
            .delete_version("CarroModel", &VersionId::new("1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/runs/delete"))
            .respond_with(ResponseTemplate::new(500).set_body_string("database is locked"))
            .mount(&server)
            .await;

        let err = client(&server).delete_run("r1").await.unwrap_err();
        match err {
            RegistryError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "database is locked");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mock_registry_alias_moves() {
        let registry = MockRegistry::new();
        registry.add_version("1", Some("r1"), &["production"]);
        registry.add_version("2", Some("r2"), &[]);
        registry.set_alias("production", "2");

        let current = registry
            .get_version_by_alias("m", "production")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.version, VersionId::new("2"));

        let old = registry
            .get_version("m", &VersionId::new("1"))
            .await
            .unwrap()
            .unwrap();
        assert!(old.is_orphan());
    }
}
