//! High-level client API for the object store
//!
//! `ObjectClient` wraps an [`ObjectBackend`] with the request throttles and
//! offers callback-style asynchronous calls for the data path. An asynchronous
//! call first takes its share of the inflight-bytes budget (blocking the
//! caller), then runs on its own task; on completion the budget is returned
//! before the caller's callback runs.

use super::throttle::{InflightBytesThrottle, IoKind, ReadWriteThrottle, ThrottleConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Object storage backend.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn put_object(&self, key: &str, data: &[u8]) -> std::result::Result<(), BackendError>;

    /// `Ok(None)` when the object does not exist.
    async fn get_object(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, BackendError>;

    /// Bytes `[offset, offset + len)` of an object, clipped at its end.
    async fn get_object_range(
        &self,
        key: &str,
        offset: u64,
        len: usize,
    ) -> std::result::Result<Option<Vec<u8>>, BackendError> {
        Ok(self.get_object(key).await?.map(|buf| {
            let start = (offset as usize).min(buf.len());
            let end = start.saturating_add(len).min(buf.len());
            buf[start..end].to_vec()
        }))
    }

    /// Deleting a missing object succeeds.
    async fn delete_object(&self, key: &str) -> std::result::Result<(), BackendError>;
}

pub struct ObjectClient<B: ObjectBackend> {
    backend: Arc<B>,
    throttle: Arc<ReadWriteThrottle>,
    inflight: Arc<InflightBytesThrottle>,
}

impl<B: ObjectBackend> Clone for ObjectClient<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            throttle: self.throttle.clone(),
            inflight: self.inflight.clone(),
        }
    }
}

impl<B: ObjectBackend + 'static> ObjectClient<B> {
    /// Client without limits.
    pub fn new(backend: B) -> Self {
        Self::with_limits(backend, ThrottleConfig::default(), 0)
    }

    pub fn with_limits(backend: B, throttle: ThrottleConfig, max_inflight_bytes: u64) -> Self {
        Self {
            backend: Arc::new(backend),
            throttle: Arc::new(ReadWriteThrottle::new(throttle)),
            inflight: Arc::new(InflightBytesThrottle::new(max_inflight_bytes)),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Bytes held by asynchronous requests right now.
    pub fn inflight_bytes(&self) -> u64 {
        self.inflight.current()
    }

    pub async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        self.throttle.acquire(IoKind::Write, data.len() as u64).await;
        trace!("put object {key} ({} bytes)", data.len());
        self.backend
            .put_object(key, data)
            .await
            .map_err(|e| Error::Remote(format!("put {key}: {e}")))
    }

    /// The size is unknown up front: the request slot is taken before the
    /// fetch and the bytes are charged after it.
    pub async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.throttle.acquire(IoKind::Read, 0).await;
        let buf = self
            .backend
            .get_object(key)
            .await
            .map_err(|e| Error::Remote(format!("get {key}: {e}")))?;
        if let Some(buf) = &buf {
            trace!("got object {key} ({} bytes)", buf.len());
            self.throttle.charge(IoKind::Read, buf.len() as u64).await;
        }
        Ok(buf)
    }

    pub async fn get_object_range(
        &self,
        key: &str,
        offset: u64,
        len: usize,
    ) -> Result<Option<Vec<u8>>> {
        self.throttle.acquire(IoKind::Read, len as u64).await;
        trace!("get object {key} [{offset}, +{len})");
        self.backend
            .get_object_range(key, offset, len)
            .await
            .map_err(|e| Error::Remote(format!("get {key}: {e}")))
    }

    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.backend
            .delete_object(key)
            .await
            .map_err(|e| Error::Remote(format!("delete {key}: {e}")))
    }

    /// Start an upload on its own task and call `done` with the result.
    ///
    /// Waits for inflight budget before returning.
    pub async fn put_object_async<F>(&self, key: String, data: Bytes, done: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let guard = self.inflight.acquire(data.len() as u64).await;
        let client = self.clone();
        tokio::spawn(async move {
            let res = client.put_object(&key, &data).await;
            drop(guard);
            if let Err(e) = &res {
                debug!("async put {key} failed: {e}");
            }
            done(res);
        })
    }

    /// Start a ranged read on its own task and call `done` with the result.
    pub async fn get_object_async<F>(
        &self,
        key: String,
        offset: u64,
        len: usize,
        done: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<Option<Vec<u8>>>) + Send + 'static,
    {
        let guard = self.inflight.acquire(len as u64).await;
        let client = self.clone();
        tokio::spawn(async move {
            let res = client.get_object_range(&key, offset, len).await;
            drop(guard);
            done(res);
        })
    }
}
