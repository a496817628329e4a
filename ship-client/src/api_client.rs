//! REST client for the 0x.ship backend.
//!
//! Every endpoint answers with the `{ status, data, message? }` envelope.
//! Requests carry the stored bearer token; a 401 triggers one refresh via
//! `POST /auth/refresh` followed by a single retry.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use ship_core::{ApiEnvelope, ProjectId, UserId, VoteCounts, VoteDirection};
use std::sync::Arc;

use crate::config::ShipConfig;
use crate::persistence::{CredentialStore, PersistenceError};

const NETWORK_ERROR: &str = "Network error. Please check your connection";
const FORBIDDEN: &str = "You do not have permission to perform this action";
const NOT_FOUND: &str = "Resource not found";
const SERVER_ERROR: &str = "Server error. Please try again later";
const SESSION_EXPIRED: &str = "Your session has expired. Please log in again";
const UNEXPECTED: &str = "An unexpected error occurred";

#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status}: {}", message.as_deref().unwrap_or("no message"))]
    Status {
        status: u16,
        message: Option<String>,
    },
    #[error("Request rejected: {0}")]
    Envelope(String),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not authenticated")]
    Unauthorized,
    #[error("Credential store error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl ApiClientError {
    /// HTTP status of the failed response, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            Self::Unauthorized => Some(StatusCode::UNAUTHORIZED.as_u16()),
            _ => None,
        }
    }

    /// The explanation the server supplied, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Status {
                message: Some(message),
                ..
            } => Some(message),
            Self::Envelope(message) => Some(message),
            _ => None,
        }
    }

    /// Text suitable for a notification.
    pub fn user_message(&self) -> String {
        if let Some(message) = self.server_message() {
            return message.to_string();
        }
        match self {
            Self::Http(err) if err.status().is_none() => NETWORK_ERROR.to_string(),
            Self::Unauthorized => SESSION_EXPIRED.to_string(),
            _ => match self.status() {
                Some(403) => FORBIDDEN.to_string(),
                Some(404) => NOT_FOUND.to_string(),
                Some(s) if s >= 500 => SERVER_ERROR.to_string(),
                _ => UNEXPECTED.to_string(),
            },
        }
    }
}

/// Turn a raw response into the envelope's payload or a typed error.
///
/// A 2xx response whose envelope says `"error"` is still a failure.
pub fn parse_envelope(status: u16, body: &str) -> Result<ApiEnvelope<Value>, ApiClientError> {
    if !(200..300).contains(&status) {
        let message = serde_json::from_str::<ApiEnvelope<Value>>(body)
            .ok()
            .and_then(|env| env.server_message().map(str::to_string));
        return Err(ApiClientError::Status { status, message });
    }
    let envelope = serde_json::from_str::<ApiEnvelope<Value>>(body)?;
    if !envelope.is_success() {
        let message = envelope
            .server_message()
            .unwrap_or("request failed")
            .to_string();
        return Err(ApiClientError::Envelope(message));
    }
    Ok(envelope)
}

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
}

impl RestClient {
    pub fn new(config: &ShipConfig, credentials: Arc<CredentialStore>) -> Result<Self, ApiClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::with_client(client, &config.api_base_url, credentials))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// `GET` and return the envelope's `data`, `Null` when absent.
    pub async fn get_data(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ApiClientError> {
        let envelope = self.execute(Method::GET, path, query, None).await?;
        Ok(envelope.data.unwrap_or(Value::Null))
    }

    pub async fn post_data(&self, path: &str, body: &Value) -> Result<Option<Value>, ApiClientError> {
        let envelope = self.execute(Method::POST, path, &[], Some(body)).await?;
        Ok(envelope.data.filter(|d| !d.is_null()))
    }

    pub async fn delete_data(&self, path: &str) -> Result<Option<Value>, ApiClientError> {
        let envelope = self.execute(Method::DELETE, path, &[], None).await?;
        Ok(envelope.data.filter(|d| !d.is_null()))
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<ApiEnvelope<Value>, ApiClientError> {
        let token = self.credentials.access_token();
        let response = self
            .send(method.clone(), path, query, body, token.as_deref())
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED && self.credentials.refresh_token().is_some() {
            tracing::debug!(path, "access token rejected, refreshing");
            let fresh = self.refresh().await?;
            let retried = self.send(method, path, query, body, Some(&fresh)).await?;
            return Self::read(retried).await;
        }

        Self::read(response).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<reqwest::Response, ApiClientError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, bearer(token)?);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    async fn read(response: reqwest::Response) -> Result<ApiEnvelope<Value>, ApiClientError> {
        let status = response.status().as_u16();
        let body = response.text().await?;
        parse_envelope(status, &body)
    }

    /// Exchange the refresh token for a new access token and persist it.
    ///
    /// Any failure forgets both tokens.
    pub async fn refresh(&self) -> Result<String, ApiClientError> {
        let refresh_token = self
            .credentials
            .refresh_token()
            .ok_or(ApiClientError::Unauthorized)?;

        let outcome = async {
            let response = self
                .send(Method::POST, "/auth/refresh", &[], Some(&json!({})), Some(&refresh_token))
                .await?;
            let envelope = Self::read(response).await?;
            envelope
                .data
                .as_ref()
                .and_then(|d| d.get("access"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(ApiClientError::Unauthorized)
        }
        .await;

        match outcome {
            Ok(access) => {
                self.credentials.set_access_token(access.clone())?;
                tracing::info!("access token refreshed");
                Ok(access)
            }
            Err(err) => {
                tracing::warn!(error = %err, "token refresh failed, clearing credentials");
                self.credentials.clear()?;
                Err(ApiClientError::Unauthorized)
            }
        }
    }
}

fn bearer(token: &str) -> Result<HeaderValue, ApiClientError> {
    HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| ApiClientError::Config(e.to_string()))
}

/// Casting a vote.
#[async_trait]
pub trait VoteApi: Send + Sync {
    /// Returns the server's counts, or `None` when the vote was removed.
    async fn cast_vote(
        &self,
        project_id: &ProjectId,
        direction: VoteDirection,
    ) -> Result<Option<VoteCounts>, ApiClientError>;
}

/// Sending a direct message.
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// Returns the server's message record.
    async fn send_message(&self, recipient_id: &UserId, text: &str) -> Result<Value, ApiClientError>;
}

/// Bookmarking projects.
#[async_trait]
pub trait SaveApi: Send + Sync {
    async fn save_project(&self, project_id: &ProjectId) -> Result<(), ApiClientError>;
    async fn unsave_project(&self, project_id: &ProjectId) -> Result<(), ApiClientError>;
}

#[async_trait]
impl VoteApi for RestClient {
    async fn cast_vote(
        &self,
        project_id: &ProjectId,
        direction: VoteDirection,
    ) -> Result<Option<VoteCounts>, ApiClientError> {
        let body = json!({ "project_id": project_id.as_str(), "vote_type": direction.as_str() });
        match self.post_data("/votes", &body).await? {
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MessageApi for RestClient {
    async fn send_message(&self, recipient_id: &UserId, text: &str) -> Result<Value, ApiClientError> {
        let body = json!({ "recipient_id": recipient_id.as_str(), "message": text });
        self.post_data("/messages/send", &body)
            .await?
            .ok_or_else(|| ApiClientError::Envelope("Message send returned no record".to_string()))
    }
}

#[async_trait]
impl SaveApi for RestClient {
    async fn save_project(&self, project_id: &ProjectId) -> Result<(), ApiClientError> {
        let path = format!("/saved/save/{}", project_id.as_str());
        self.post_data(&path, &json!({})).await.map(|_| ())
    }

    async fn unsave_project(&self, project_id: &ProjectId) -> Result<(), ApiClientError> {
        let path = format!("/saved/unsave/{}", project_id.as_str());
        self.delete_data(&path).await.map(|_| ())
    }
}

#[async_trait]
impl<T: VoteApi + ?Sized> VoteApi for Arc<T> {
    async fn cast_vote(
        &self,
        project_id: &ProjectId,
        direction: VoteDirection,
    ) -> Result<Option<VoteCounts>, ApiClientError> {
        (**self).cast_vote(project_id, direction).await
    }
}

#[async_trait]
impl<T: MessageApi + ?Sized> MessageApi for Arc<T> {
    async fn send_message(&self, recipient_id: &UserId, text: &str) -> Result<Value, ApiClientError> {
        (**self).send_message(recipient_id, text).await
    }
}

#[async_trait]
impl<T: SaveApi + ?Sized> SaveApi for Arc<T> {
    async fn save_project(&self, project_id: &ProjectId) -> Result<(), ApiClientError> {
        (**self).save_project(project_id).await
    }

    async fn unsave_project(&self, project_id: &ProjectId) -> Result<(), ApiClientError> {
        (**self).unsave_project(project_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success_envelope() {
        let env = parse_envelope(200, r#"{"status":"success","data":{"saved":true}}"#).unwrap();
        assert_eq!(env.data.unwrap()["saved"], true);
    }

    #[test]
    fn test_error_envelope_on_ok_status() {
        let err = parse_envelope(200, r#"{"status":"error","message":"Already voted"}"#).unwrap_err();
        assert_eq!(err.user_message(), "Already voted");
    }

    #[test]
    fn test_server_message_wins_over_status_fallback() {
        let err = parse_envelope(403, r#"{"status":"error","message":"Banned"}"#).unwrap_err();
        assert_eq!(err.status(), Some(403));
        assert_eq!(err.user_message(), "Banned");
    }

    #[test]
    fn test_status_fallback_messages() {
        let forbidden = parse_envelope(403, "").unwrap_err();
        assert_eq!(forbidden.user_message(), FORBIDDEN);
        let missing = parse_envelope(404, "<html>").unwrap_err();
        assert_eq!(missing.user_message(), NOT_FOUND);
        let broken = parse_envelope(502, r#"{"error":""}"#).unwrap_err();
        assert_eq!(broken.user_message(), SERVER_ERROR);
        let teapot = parse_envelope(418, "{}").unwrap_err();
        assert_eq!(teapot.user_message(), UNEXPECTED);
    }

    #[test]
    fn test_framework_error_uses_error_field() {
        let err = parse_envelope(401, r#"{"error":"Token has expired"}"#).unwrap_err();
        assert_eq!(err.server_message(), Some("Token has expired"));
    }

    #[test]
    fn test_unauthorized_message() {
        assert_eq!(ApiClientError::Unauthorized.user_message(), SESSION_EXPIRED);
        assert_eq!(ApiClientError::Unauthorized.status(), Some(401));
    }

    #[test]
    fn test_base_url_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::open(dir.path().join("c.json")).unwrap());
        let client = RestClient::with_client(reqwest::Client::new(), "http://localhost:5000/api/", store);
        assert_eq!(client.base_url(), "http://localhost:5000/api");
    }

    #[tokio::test]
    async fn test_refresh_without_token_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::open(dir.path().join("c.json")).unwrap());
        let client = RestClient::with_client(reqwest::Client::new(), "http://127.0.0.1:9/api", store);
        assert!(matches!(client.refresh().await, Err(ApiClientError::Unauthorized)));
    }

    #[test]
    fn test_bearer_rejects_control_characters() {
        assert!(matches!(bearer("bad\ntoken"), Err(ApiClientError::Config(_))));
        assert_eq!(bearer("abc").unwrap(), "Bearer abc");
    }
}
