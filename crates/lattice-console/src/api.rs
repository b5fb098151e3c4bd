use crate::error::ApiError;
use async_trait::async_trait;
use lattice_core::{
    ActionResponse, ApiErrorBody, CreateVmRequest, LogPage, Operation, OperationKind,
    ResourceSnapshot, SubjectKind, SubjectRef,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// REST surface of the master that the console consumes.
#[async_trait]
pub trait FleetApi: Send + Sync {
    /// Current representation of a subject. `ApiError::NotFound` means it is gone.
    async fn get_resource(&self, subject: &SubjectRef) -> Result<ResourceSnapshot, ApiError>;

    /// Most recent operations for a subject, newest first.
    async fn list_operations(
        &self,
        subject: &SubjectRef,
        limit: u32,
    ) -> Result<Vec<Operation>, ApiError>;

    async fn invoke_action(
        &self,
        subject: &SubjectRef,
        kind: OperationKind,
    ) -> Result<ActionResponse, ApiError>;

    async fn create_vm(
        &self,
        node_id: &str,
        request: &CreateVmRequest,
    ) -> Result<ActionResponse, ApiError>;

    async fn node_logs(
        &self,
        node_id: &str,
        since_id: Option<i64>,
        limit: u32,
    ) -> Result<LogPage, ApiError>;
}

#[derive(Clone, Debug)]
pub struct HttpFleetApi {
    client: Client,
    base: Url,
}

impl HttpFleetApi {
    pub fn new(base: Url, request_timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        let base_path: Vec<String> = self
            .base
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();
        if let Ok(mut path) = url.path_segments_mut() {
            path.clear();
            path.extend(base_path.iter().map(String::as_str));
            path.push("api");
            path.extend(segments.iter().copied());
        }
        url
    }

    fn subject_endpoint(&self, subject: &SubjectRef, tail: &[&str]) -> Url {
        let mut segments = subject.path_segments();
        segments.extend_from_slice(tail);
        self.endpoint(&segments)
    }

    async fn post_json<B, T>(&self, url: Url, body: Option<&B>) -> Result<T, ApiError>
    where
        B: serde::Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!(event = "api_post", url = %url, request_id = %request_id);
        let mut request = self
            .client
            .post(url)
            .header(REQUEST_ID_HEADER, request_id.as_str());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        read_json(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        debug!(event = "api_get", url = %url);
        let response = self.client.get(url).send().await?;
        read_json(response).await
    }
}

#[async_trait]
impl FleetApi for HttpFleetApi {
    async fn get_resource(&self, subject: &SubjectRef) -> Result<ResourceSnapshot, ApiError> {
        if subject.kind != SubjectKind::Node {
            return self.get_json(self.subject_endpoint(subject, &[])).await;
        }
        let nodes: Vec<ResourceSnapshot> = self.get_json(self.endpoint(&["nodes"])).await?;
        nodes
            .into_iter()
            .find(|node| node.id == subject.node_id)
            .ok_or_else(|| ApiError::NotFound("node not found".to_string()))
    }

    async fn list_operations(
        &self,
        subject: &SubjectRef,
        limit: u32,
    ) -> Result<Vec<Operation>, ApiError> {
        let mut url = self.subject_endpoint(subject, &["operations"]);
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }

    async fn invoke_action(
        &self,
        subject: &SubjectRef,
        kind: OperationKind,
    ) -> Result<ActionResponse, ApiError> {
        if !kind.is_action() {
            return Err(ApiError::Rejected {
                status: 400,
                message: format!("{kind} is not an action"),
            });
        }
        let url = self.subject_endpoint(subject, &["actions", kind.as_str()]);
        self.post_json::<(), _>(url, None).await
    }

    async fn create_vm(
        &self,
        node_id: &str,
        request: &CreateVmRequest,
    ) -> Result<ActionResponse, ApiError> {
        let url = self.endpoint(&["nodes", node_id, "vms"]);
        self.post_json(url, Some(request)).await
    }

    async fn node_logs(
        &self,
        node_id: &str,
        since_id: Option<i64>,
        limit: u32,
    ) -> Result<LogPage, ApiError> {
        let mut url = self.endpoint(&["nodes", node_id, "logs"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(since_id) = since_id {
                query.append_pair("since_id", &since_id.to_string());
            }
        }
        self.get_json(url).await
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|parsed| parsed.error)
        .unwrap_or_else(|_| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                trimmed.to_string()
            }
        });
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound(message));
    }
    Err(ApiError::Rejected {
        status: status.as_u16(),
        message,
    })
}
