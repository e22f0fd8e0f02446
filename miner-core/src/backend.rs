//! Client for the job backend's REST surface.

use std::time::Duration;

use async_trait::async_trait;
use miner_model::{
    Credentials, JobSummary, LoginRequest, LoginResponse, RegisterMinerRequest,
    StartTrainingRequest, SystemDetails,
};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::error::NetworkError;

pub const MINER_ID_HEADER: &str = "X-Miner-ID";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("unexpected backend response: {0}")]
    Protocol(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<Credentials, BackendError>;

    async fn register_miner(&self, request: &RegisterMinerRequest) -> Result<Value, BackendError>;

    async fn pending_jobs(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<JobSummary>, BackendError>;

    /// Raw job payload; the caller binds it to a `JobSpec`.
    async fn job_details(
        &self,
        credentials: &Credentials,
        doc_id: &str,
    ) -> Result<Value, BackendError>;

    /// Claim a job for this miner. Responds with the job payload.
    async fn start_training(
        &self,
        credentials: &Credentials,
        doc_id: &str,
        system_details: &SystemDetails,
    ) -> Result<Value, BackendError>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| NetworkError::Request {
                url: base_url.to_string(),
                source,
            })?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                BackendError::Protocol(format!(
                    "{} cannot be used as a base URL",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, url: &Url, request: RequestBuilder) -> Result<Value, BackendError> {
        debug!(%url, "backend request");
        let response = request.send().await.map_err(|source| {
            NetworkError::Request {
                url: url.to_string(),
                source,
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(NetworkError::Unauthorized.into());
        }

        let body = response.text().await.map_err(|source| NetworkError::Request {
            url: url.to_string(),
            source,
        })?;

        if !status.is_success() {
            let message = error_message(&body).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("server error")
                    .to_string()
            });
            return Err(NetworkError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            }
            .into());
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|err| {
            BackendError::Protocol(format!("{url} returned invalid JSON: {err}"))
        })
    }
}

#[async_trait]
impl JobBackend for HttpBackend {
    async fn login(&self, username: &str, password: &str) -> Result<Credentials, BackendError> {
        let url = self.endpoint(&["login"])?;
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let value = self
            .send(&url, self.client.post(url.clone()).json(&body))
            .await?;

        let response: LoginResponse = serde_json::from_value(value)
            .map_err(|err| BackendError::Protocol(format!("login response: {err}")))?;
        let miner_id = response.miner_id.ok_or_else(|| {
            BackendError::Protocol("login response carries no miner id".into())
        })?;
        if response.token.trim().is_empty() {
            return Err(BackendError::Protocol(
                "login response carries an empty token".into(),
            ));
        }
        info!(username, %miner_id, "logged in");
        Ok(Credentials::new(response.token, miner_id))
    }

    async fn register_miner(&self, request: &RegisterMinerRequest) -> Result<Value, BackendError> {
        let url = self.endpoint(&["register-miner"])?;
        self.send(&url, self.client.post(url.clone()).json(request))
            .await
    }

    async fn pending_jobs(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<JobSummary>, BackendError> {
        let url = self.endpoint(&["pending-jobs"])?;
        let value = self
            .send(
                &url,
                self.client
                    .get(url.clone())
                    .bearer_auth(credentials.token()),
            )
            .await?;
        parse_job_list(value)
    }

    async fn job_details(
        &self,
        credentials: &Credentials,
        doc_id: &str,
    ) -> Result<Value, BackendError> {
        let url = self.endpoint(&["job-details", doc_id])?;
        self.send(
            &url,
            self.client
                .get(url.clone())
                .bearer_auth(credentials.token()),
        )
        .await
    }

    async fn start_training(
        &self,
        credentials: &Credentials,
        doc_id: &str,
        system_details: &SystemDetails,
    ) -> Result<Value, BackendError> {
        let url = self.endpoint(&["start-training", doc_id])?;
        let body = StartTrainingRequest {
            system_details: system_details.clone(),
            miner_id: credentials.miner_id().to_string(),
        };
        self.send(
            &url,
            self.client
                .post(url.clone())
                .bearer_auth(credentials.token())
                .header(MINER_ID_HEADER, credentials.miner_id())
                .json(&body),
        )
        .await
    }
}

/// `{"error": "..."}` bodies carry the backend's explanation.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}

/// Accepts a bare array or an object wrapping it under `jobs`.
fn parse_job_list(value: Value) -> Result<Vec<JobSummary>, BackendError> {
    let list = match value {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut map) => match map.remove("jobs") {
            Some(list) => list,
            None => {
                return Err(BackendError::Protocol(
                    "pending-jobs response has no `jobs` list".into(),
                ));
            }
        },
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(BackendError::Protocol(format!(
                "pending-jobs response is not a list: {other}"
            )));
        }
    };
    serde_json::from_value(list)
        .map_err(|err| BackendError::Protocol(format!("pending-jobs entry: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::Path,
        http::{HeaderMap, StatusCode},
        routing::{get, post},
    };
    use serde_json::json;

    async fn serve(router: Router) -> HttpBackend {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        let base = Url::parse(&format!("http://{addr}/api")).expect("url");
        HttpBackend::new(base, Duration::from_secs(5)).expect("client")
    }

    fn creds() -> Credentials {
        Credentials::new("tok-1", "miner-7")
    }

    #[test]
    fn endpoints_extend_base_path_and_escape_ids() {
        let backend = HttpBackend::new(
            Url::parse("https://backend.example.com/api/").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        let url = backend.endpoint(&["job-details", "a b"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://backend.example.com/api/job-details/a%20b"
        );
    }

    #[tokio::test]
    async fn login_returns_credentials() {
        let backend = serve(Router::new().route(
            "/api/login",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["username"], json!("alice"));
                Json(json!({"token": "t-123", "minerId": 42}))
            }),
        ))
        .await;

        let creds = backend.login("alice", "pw").await.unwrap();
        assert_eq!(creds.token(), "t-123");
        assert_eq!(creds.miner_id(), "42");
    }

    #[tokio::test]
    async fn login_without_miner_id_is_a_protocol_error() {
        let backend = serve(Router::new().route(
            "/api/login",
            post(|| async { Json(json!({"token": "t-123"})) }),
        ))
        .await;

        let err = backend.login("alice", "pw").await.unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
    }

    #[tokio::test]
    async fn start_training_sends_identity_headers() {
        let backend = serve(Router::new().route(
            "/api/start-training/{doc_id}",
            post(
                |Path(doc_id): Path<String>,
                 headers: HeaderMap,
                 Json(body): Json<Value>| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let miner = headers
                        .get(MINER_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({
                        "docId": doc_id,
                        "auth": auth,
                        "minerHeader": miner,
                        "minerId": body["minerId"],
                        "hasSystemDetails": body.get("systemDetails").is_some(),
                    }))
                },
            ),
        ))
        .await;

        let value = backend
            .start_training(&creds(), "job-1", &SystemDetails::default())
            .await
            .unwrap();
        assert_eq!(value["docId"], json!("job-1"));
        assert_eq!(value["auth"], json!("Bearer tok-1"));
        assert_eq!(value["minerHeader"], json!("miner-7"));
        assert_eq!(value["minerId"], json!("miner-7"));
        assert_eq!(value["hasSystemDetails"], json!(true));
    }

    #[tokio::test]
    async fn unauthorized_maps_to_dedicated_error() {
        let backend = serve(Router::new().route(
            "/api/pending-jobs",
            get(|| async { (StatusCode::UNAUTHORIZED, Json(json!({"error": "expired"}))) }),
        ))
        .await;

        let err = backend.pending_jobs(&creds()).await.unwrap_err();
        assert!(matches!(err, BackendError::Network(NetworkError::Unauthorized)));
    }

    #[tokio::test]
    async fn error_bodies_are_surfaced() {
        let backend = serve(Router::new().route(
            "/api/job-details/{doc_id}",
            get(|| async {
                (StatusCode::NOT_FOUND, Json(json!({"error": "Job not found"})))
            }),
        ))
        .await;

        let err = backend.job_details(&creds(), "nope").await.unwrap_err();
        match err {
            BackendError::Network(NetworkError::Status { status, message, .. }) => {
                assert_eq!(status, 404);
                assert_eq!(message, "Job not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn pending_jobs_accepts_bare_and_wrapped_lists() {
        let backend = serve(
            Router::new()
                .route(
                    "/api/pending-jobs",
                    get(|| async { Json(json!([{"docId": "a"}, {"id": "b", "status": "open"}])) }),
                ),
        )
        .await;
        let jobs = backend.pending_jobs(&creds()).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].doc_id.as_deref(), Some("b"));

        let wrapped = parse_job_list(json!({"jobs": [{"docId": "c"}]})).unwrap();
        assert_eq!(wrapped[0].doc_id.as_deref(), Some("c"));
        assert!(parse_job_list(json!("nope")).is_err());
    }

    #[test]
    fn error_message_handles_non_string_errors() {
        assert_eq!(error_message(r#"{"error": "bad"}"#).as_deref(), Some("bad"));
        assert_eq!(
            error_message(r#"{"error": {"code": 3}}"#).as_deref(),
            Some(r#"{"code":3}"#)
        );
        assert_eq!(error_message("not json"), None);
    }
}
