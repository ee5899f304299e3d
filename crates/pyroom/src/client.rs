use pyroom_core::SessionInfo;
use pyroom_server::api::{
    ConversationForm, MessageResponse, RunRequest, RunResponse, SessionsResponse,
};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server returned {status}: {}", detail_text(.detail))]
    Api { status: StatusCode, detail: Value },
}

impl ClientError {
    /// Traceback lines of an interpreter error, if this is one.
    pub fn traceback(&self) -> Option<Vec<&str>> {
        match self {
            ClientError::Api { detail, .. } => detail
                .get("traceback")?
                .as_array()
                .map(|lines| lines.iter().filter_map(Value::as_str).collect()),
            ClientError::Request(_) => None,
        }
    }
}

fn detail_text(detail: &Value) -> String {
    match detail {
        Value::String(s) => s.clone(),
        Value::Object(map) => match (map.get("ename"), map.get("evalue")) {
            (Some(Value::String(ename)), Some(Value::String(evalue))) => {
                format!("{ename}: {evalue}")
            }
            _ => detail.to_string(),
        },
        other => other.to_string(),
    }
}

/// HTTP client for a running pyroom service.
#[derive(Clone)]
pub struct PyroomClient {
    base_url: String,
    http: reqwest::Client,
}

impl PyroomClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn run(
        &self,
        conversation_id: &str,
        code: &str,
        dependencies: &[String],
    ) -> Result<String, ClientError> {
        let request = RunRequest {
            conversation_id: conversation_id.to_string(),
            code: code.to_string(),
            dependencies: (!dependencies.is_empty()).then(|| dependencies.to_vec()),
        };
        let response = self
            .http
            .post(self.url("run"))
            .json(&request)
            .send()
            .await?;
        Ok(decode::<RunResponse>(response).await?.output)
    }

    pub async fn reset(&self, conversation_id: &str) -> Result<String, ClientError> {
        self.post_form("reset", conversation_id).await
    }

    pub async fn end_session(&self, conversation_id: &str) -> Result<String, ClientError> {
        self.post_form("end_session", conversation_id).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, ClientError> {
        let response = self.http.get(self.url("sessions")).send().await?;
        Ok(decode::<SessionsResponse>(response).await?.sessions)
    }

    async fn post_form(&self, path: &str, conversation_id: &str) -> Result<String, ClientError> {
        let form = ConversationForm {
            conversation_id: conversation_id.to_string(),
        };
        let response = self.http.post(self.url(path)).form(&form).send().await?;
        Ok(decode::<MessageResponse>(response).await?.message)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);
    debug!(status = %status, body = %body, "Server returned an error");
    Err(ClientError::Api {
        status,
        detail: body.get("detail").cloned().unwrap_or(body),
    })
}
