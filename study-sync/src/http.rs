//! HTTP client for the remote document service.
//!
//! ## Endpoints
//!
//! ```text
//! GET    {base}/users/{uid}/{collection}        -> {"documents": [{"id", "data"}]}
//! PUT    {base}/users/{uid}/{collection}/{id}   body = document data
//! DELETE {base}/users/{uid}/{collection}/{id}
//! POST   {base}/users/{uid}/{collection}/batch  body = {"writes": [...]}
//! ```
//!
//! Requests carry `Authorization: Bearer <token>` when the identity has one.
//! Nothing is retried here; the engines treat each failure as final.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use study_sync_core::{BatchWrite, Document, DocumentBackend, Identity, RemoteError, RemoteResult};

/// Path segment of the batch endpoint.
const BATCH_SEGMENT: &str = "batch";

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    documents: Vec<Document>,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    writes: &'a [BatchWrite],
}

/// [`DocumentBackend`] speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: Client,
    base: Url,
}

impl HttpBackend {
    /// Create a client for the service rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidUrl`] if the URL is malformed or cannot
    /// carry a path, and [`RemoteError::Http`] if the client fails to build.
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self, RemoteError> {
        let base = Url::parse(base_url.as_ref())
            .map_err(|e| RemoteError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(RemoteError::InvalidUrl(format!(
                "{base} cannot be used as a base URL"
            )));
        }

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("study-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Http(e.to_string()))?;

        Ok(Self { http, base })
    }

    /// Base URL requests are built from.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, identity: &Identity, collection: &str, tail: Option<&str>) -> RemoteResult<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| RemoteError::InvalidUrl(self.base.to_string()))?;
            segments
                .pop_if_empty()
                .extend(["users", identity.uid.as_str(), collection]);
            if let Some(tail) = tail {
                segments.push(tail);
            }
        }
        Ok(url)
    }

    async fn send(request: RequestBuilder, identity: &Identity) -> RemoteResult<Response> {
        let request = match &identity.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        let message = if message.is_empty() {
            status.to_string()
        } else {
            message
        };
        tracing::debug!(status = status.as_u16(), body = %message, "document service refused request");
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RemoteError::Unauthenticated(message))
            }
            _ => Err(RemoteError::Rejected {
                status: status.as_u16(),
                message,
            }),
        }
    }
}

/// Connection failures and timeouts mean "offline"; anything else is a fault.
fn transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_connect() || error.is_timeout() {
        RemoteError::Unavailable(error.to_string())
    } else {
        RemoteError::Http(error.to_string())
    }
}

#[async_trait]
impl DocumentBackend for HttpBackend {
    async fn list(&self, identity: &Identity, collection: &str) -> RemoteResult<Vec<Document>> {
        let url = self.url(identity, collection, None)?;
        let response = match Self::send(self.http.get(url), identity).await {
            Ok(response) => response,
            // A collection that was never written does not exist yet.
            Err(RemoteError::Rejected { status: 404, .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let body = response.bytes().await.map_err(transport_error)?;
        let list: ListResponse = serde_json::from_slice(&body)?;
        Ok(list.documents)
    }

    async fn set(
        &self,
        identity: &Identity,
        collection: &str,
        id: &str,
        data: Value,
    ) -> RemoteResult<()> {
        let url = self.url(identity, collection, Some(id))?;
        Self::send(self.http.put(url).json(&data), identity).await?;
        Ok(())
    }

    async fn delete(&self, identity: &Identity, collection: &str, id: &str) -> RemoteResult<()> {
        let url = self.url(identity, collection, Some(id))?;
        match Self::send(self.http.delete(url), identity).await {
            Ok(_) | Err(RemoteError::Rejected { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn commit(
        &self,
        identity: &Identity,
        collection: &str,
        writes: Vec<BatchWrite>,
    ) -> RemoteResult<()> {
        let url = self.url(identity, collection, Some(BATCH_SEGMENT))?;
        let body = BatchRequest { writes: &writes };
        Self::send(self.http.post(url).json(&body), identity).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_rejected() {
        let err = HttpBackend::new("not a url", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RemoteError::InvalidUrl(_)));

        let err = HttpBackend::new("mailto:someone@example.com", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RemoteError::InvalidUrl(_)));
    }

    #[test]
    fn test_url_layout() {
        let backend =
            HttpBackend::new("https://docs.example.com/v1/", Duration::from_secs(1)).expect("backend");
        let identity = Identity::new("u1");

        let url = backend.url(&identity, "progress", None).expect("url");
        assert_eq!(url.as_str(), "https://docs.example.com/v1/users/u1/progress");

        let url = backend
            .url(&identity, "flags", Some("1_1_q2"))
            .expect("url");
        assert_eq!(url.as_str(), "https://docs.example.com/v1/users/u1/flags/1_1_q2");
    }

    #[test]
    fn test_url_segments_are_escaped() {
        let backend =
            HttpBackend::new("https://docs.example.com", Duration::from_secs(1)).expect("backend");
        let url = backend
            .url(&Identity::new("u/1"), "progress", Some("a b"))
            .expect("url");
        assert_eq!(url.as_str(), "https://docs.example.com/users/u%2F1/progress/a%20b");
    }

    #[test]
    fn test_batch_body_shape() {
        let writes = vec![
            BatchWrite::Set {
                id: "a".into(),
                data: serde_json::json!({"createdAt": 1}),
            },
            BatchWrite::Delete { id: "b".into() },
        ];
        let body = serde_json::to_value(BatchRequest { writes: &writes }).expect("serialize");
        assert_eq!(
            body,
            serde_json::json!({
                "writes": [
                    {"op": "set", "id": "a", "data": {"createdAt": 1}},
                    {"op": "delete", "id": "b"}
                ]
            })
        );
    }
}
