//! REST client for the remote store API served by sync-relay.

use super::RemoteStore;
use crate::error::RemoteError;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use sync_types::{
    ChangesPage, EntityKey, ErrorBody, HealthResponse, LockConflict, LockRequest, MutationAck,
    MutationConflict, MutationRequest, RecordLock, SchemaVersionResponse, Sequence, TenantId,
};

/// HTTP remote store.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    /// Create a client for `base_url` (e.g. `http://127.0.0.1:8080`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn lock_url(&self, entity: &EntityKey, action: &str) -> String {
        self.url(&format!(
            "/locks/{}/{}/{}",
            entity.entity_type, entity.entity_id, action
        ))
    }

    async fn post<B: Serialize + ?Sized>(&self, url: String, body: &B) -> Result<Response, RemoteError> {
        self.client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)
    }

    async fn get(&self, url: String) -> Result<Response, RemoteError> {
        self.client.get(url).send().await.map_err(transport_error)
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Unreachable(err.to_string())
    }
}

async fn json<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    response
        .json::<T>()
        .await
        .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

/// Map a non-2xx answer without a dedicated body to an error.
async fn status_error(response: Response) -> RemoteError {
    let status = response.status();
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    if status.is_server_error() {
        RemoteError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        RemoteError::Rejected(message)
    }
}

/// Shared handling of lock answers.
async fn lock_response(
    response: Response,
    request: &LockRequest,
) -> Result<Response, RemoteError> {
    match response.status() {
        s if s.is_success() => Ok(response),
        StatusCode::CONFLICT => {
            let conflict: LockConflict = json(response).await?;
            Err(RemoteError::LockHeld {
                holder: conflict.holder,
                expires_at: conflict.expires_at,
            })
        }
        StatusCode::NOT_FOUND => match request.lock_id {
            Some(id) => Err(RemoteError::LockNotFound(id)),
            None => Err(status_error(response).await),
        },
        StatusCode::GONE => match request.lock_id {
            Some(id) => Err(RemoteError::LockExpired(id)),
            None => Err(status_error(response).await),
        },
        _ => Err(status_error(response).await),
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn health(&self) -> Result<HealthResponse, RemoteError> {
        let response = self.get(self.url("/health")).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        json(response).await
    }

    async fn apply_mutation(&self, request: &MutationRequest) -> Result<MutationAck, RemoteError> {
        let response = self.post(self.url("/sync/mutations"), request).await?;
        match response.status() {
            s if s.is_success() => json(response).await,
            StatusCode::CONFLICT => {
                let conflict: MutationConflict = json(response).await?;
                Err(RemoteError::MutationConflict(conflict))
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn acquire_lock(
        &self,
        entity: &EntityKey,
        request: &LockRequest,
    ) -> Result<RecordLock, RemoteError> {
        let response = self.post(self.lock_url(entity, "acquire"), request).await?;
        json(lock_response(response, request).await?).await
    }

    async fn renew_lock(
        &self,
        entity: &EntityKey,
        request: &LockRequest,
    ) -> Result<RecordLock, RemoteError> {
        let response = self.post(self.lock_url(entity, "renew"), request).await?;
        json(lock_response(response, request).await?).await
    }

    async fn release_lock(
        &self,
        entity: &EntityKey,
        request: &LockRequest,
    ) -> Result<(), RemoteError> {
        let response = self.post(self.lock_url(entity, "release"), request).await?;
        lock_response(response, request).await?;
        Ok(())
    }

    async fn schema_version(&self) -> Result<u32, RemoteError> {
        let response = self.get(self.url("/schema/version")).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body: SchemaVersionResponse = json(response).await?;
        Ok(body.version)
    }

    async fn changes_since(
        &self,
        tenant_id: &TenantId,
        after: Sequence,
        limit: u32,
    ) -> Result<ChangesPage, RemoteError> {
        let response = self
            .client
            .get(self.url("/sync/changes"))
            .query(&[
                ("tenant_id", tenant_id.as_str().to_string()),
                ("after", after.value().to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        json(response).await
    }
}
