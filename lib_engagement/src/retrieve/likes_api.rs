//! REST adapter for the likes endpoints.
//!
//! | Operation         | Request                          |
//! |-------------------|----------------------------------|
//! | `get_likes_count` | `GET    api/likes/{id}/count`    |
//! | `get_like_status` | `GET    api/likes/{id}/status`   |
//! | `like_template`   | `POST   api/likes/{id}`          |
//! | `unlike_template` | `DELETE api/likes/{id}`          |
//!
//! Count and status bodies are accepted either bare (`5`, `true`) or wrapped in an
//! object (`{"count": 5}`, `{"hasLiked": true}`).
//!
//! Only the two reads are retried on transient failures. A like or unlike is sent
//! once; a failure is rolled back by the reconciler and the next resync settles
//! the true state.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::configs::EngineConfig;
use crate::core::events::ResourceId;
use crate::core::reconciler::EngagementApi;
use crate::error::ApiError;
use crate::retrieve::ky_http::{ApiClient, ApiResponse};

const COUNT_KEYS: [&str; 3] = ["count", "likesCount", "likes"];
const STATUS_KEYS: [&str; 4] = ["hasLiked", "liked", "isLiked", "status"];

pub struct RestEngagementApi {
    /// Count and status reads.
    client: ApiClient,
    /// Like and unlike, without retries.
    mutations: ApiClient,
}

impl RestEngagementApi {
    pub fn new(client: ApiClient, mutations: ApiClient) -> Self {
        Self { client, mutations }
    }

    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let client = ApiClient::new(
            config.base_url(),
            config.access_token.clone(),
            config.rest_max_retries,
        )?;
        let mutations = ApiClient::new(config.base_url(), config.access_token.clone(), 0)?;
        Ok(Self::new(client, mutations))
    }

    fn client_for(&self, method: &Method) -> &ApiClient {
        if method.is_safe() {
            &self.client
        } else {
            &self.mutations
        }
    }

    async fn call(
        &self,
        method: Method,
        resource_id: &ResourceId,
        tail: Option<&str>,
    ) -> Result<Value, ApiError> {
        let mut segments = vec!["api", "likes", resource_id.as_str()];
        segments.extend(tail);
        let client = self.client_for(&method);
        let url = client.endpoint(&segments)?;
        log::debug!("{} {}", method, url);

        let response: ApiResponse<Value> = client
            .request_url(method, url, None, None::<()>)
            .await?;
        if !response.success {
            return Err(ApiError::Status {
                status: response.status,
                body: response.error_body,
            });
        }
        Ok(response.data.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl EngagementApi for RestEngagementApi {
    async fn get_likes_count(&self, resource_id: &ResourceId) -> Result<i64, ApiError> {
        let body = self.call(Method::GET, resource_id, Some("count")).await?;
        decode_count(&body)
    }

    async fn get_like_status(&self, resource_id: &ResourceId) -> Result<bool, ApiError> {
        let body = self.call(Method::GET, resource_id, Some("status")).await?;
        decode_status(&body)
    }

    async fn like_template(&self, resource_id: &ResourceId) -> Result<(), ApiError> {
        self.call(Method::POST, resource_id, None).await.map(drop)
    }

    async fn unlike_template(&self, resource_id: &ResourceId) -> Result<(), ApiError> {
        self.call(Method::DELETE, resource_id, None).await.map(drop)
    }
}

fn field<'a>(body: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| body.get(*key))
}

fn decode_count(body: &Value) -> Result<i64, ApiError> {
    let value = match body {
        Value::Object(_) => field(body, &COUNT_KEYS),
        other => Some(other),
    };
    value
        .and_then(Value::as_i64)
        .ok_or_else(|| ApiError::Decode(format!("expected a like count, got {}", body)))
}

fn decode_status(body: &Value) -> Result<bool, ApiError> {
    let value = match body {
        Value::Object(_) => field(body, &STATUS_KEYS),
        other => Some(other),
    };
    value
        .and_then(Value::as_bool)
        .ok_or_else(|| ApiError::Decode(format!("expected a like status, got {}", body)))
}
