//! Remote HTTP backend
//!
//! Proxies the store contract to an HTTP service (e.g. a Durable Object or
//! a thin REST shim over managed storage). Scope chain and id travel as
//! query parameters; record bodies are the same JSON the filesystem backend
//! writes, secrets already sealed. Every call is wrapped in bounded
//! exponential backoff with jitter.
//!
//! The contract expects the service to be strongly consistent per chain.
//! Fronting an eventually-consistent system breaks the reconciliation
//! assumptions and must be called out by the service, not hidden here.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;

use strata_core::{
    ResourceId, ScopeChain, StateRecord, StateStore, StoreFactory, StrataError, StrataResult,
};
use strata_crypto::SecretCipher;

use crate::retry::{with_backoff, RetryConfig};
use crate::serial;

/// Store partition proxied over HTTP.
pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
    chain: String,
    cipher: Option<Arc<SecretCipher>>,
    retry: RetryConfig,
}

impl RemoteStore {
    fn cipher(&self) -> Option<&SecretCipher> {
        self.cipher.as_deref()
    }

    fn state_url(&self) -> String {
        format!("{}/state", self.base_url)
    }
}

#[async_trait]
impl StateStore for RemoteStore {
    async fn list(&self) -> StrataResult<Vec<ResourceId>> {
        let ids: Vec<String> = with_backoff(&self.retry, "remote list", || async {
            let response = self
                .client
                .get(self.state_url())
                .query(&[("chain", self.chain.as_str())])
                .send()
                .await
                .map_err(StrataError::store)?;
            response
                .error_for_status()
                .map_err(StrataError::store)?
                .json()
                .await
                .map_err(StrataError::store)
        })
        .await?;
        Ok(ids.into_iter().map(ResourceId::new).collect())
    }

    async fn get(&self, id: &ResourceId) -> StrataResult<Option<StateRecord>> {
        let json: Option<serde_json::Value> =
            with_backoff(&self.retry, "remote get", || async {
                let response = self
                    .client
                    .get(self.state_url())
                    .query(&[("chain", self.chain.as_str()), ("id", id.as_str())])
                    .send()
                    .await
                    .map_err(StrataError::store)?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                response
                    .error_for_status()
                    .map_err(StrataError::store)?
                    .json()
                    .await
                    .map(Some)
                    .map_err(StrataError::store)
            })
            .await?;

        match json {
            Some(json) => serial::record_from_json(&json, self.cipher()).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, id: &ResourceId, record: &StateRecord) -> StrataResult<()> {
        let body = serial::record_to_json(record, self.cipher())?;
        with_backoff(&self.retry, "remote set", || async {
            let response = self
                .client
                .put(self.state_url())
                .query(&[("chain", self.chain.as_str()), ("id", id.as_str())])
                .json(&body)
                .send()
                .await
                .map_err(StrataError::store)?;
            response.error_for_status().map_err(StrataError::store)?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &ResourceId) -> StrataResult<()> {
        with_backoff(&self.retry, "remote delete", || async {
            let response = self
                .client
                .delete(self.state_url())
                .query(&[("chain", self.chain.as_str()), ("id", id.as_str())])
                .send()
                .await
                .map_err(StrataError::store)?;
            // Deleting an absent id is a no-op, matching the contract.
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(());
            }
            response.error_for_status().map_err(StrataError::store)?;
            Ok(())
        })
        .await
    }
}

/// Factory building [`RemoteStore`] partitions against one service.
pub struct RemoteStoreFactory {
    client: reqwest::Client,
    base_url: String,
    cipher: Option<Arc<SecretCipher>>,
    retry: RetryConfig,
}

impl RemoteStoreFactory {
    pub fn new(base_url: impl Into<String>, password: Option<&str>) -> Self {
        RemoteStoreFactory {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cipher: password.map(|pw| Arc::new(SecretCipher::from_passphrase(pw))),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl StoreFactory for RemoteStoreFactory {
    async fn open(&self, chain: &ScopeChain) -> StrataResult<Arc<dyn StateStore>> {
        Ok(Arc::new(RemoteStore {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            chain: chain.key(),
            cipher: self.cipher.clone(),
            retry: self.retry.clone(),
        }))
    }
}
