use crate::DEFAULT_MAX_BODY_SIZE;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full, Limited};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::sync::Arc;

/// Sends requests to backend services.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// An HTTP/1 client that buffers response bodies up to a size limit.
#[derive(Clone, Debug)]
pub struct HttpUpstream {
    client: Client<HttpConnector, Full<Bytes>>,
    max_body_size: usize,
}

// === impl HttpUpstream ===

impl HttpUpstream {
    /// Responses with larger bodies fail to be read.
    pub fn new(max_body_size: usize) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            max_body_size,
        }
    }
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_SIZE)
    }
}

#[async_trait::async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        let (parts, body) = req.into_parts();
        let rsp = self
            .client
            .request(Request::from_parts(parts, Full::new(body)))
            .await?;
        let (parts, body) = rsp.into_parts();
        let body = Limited::new(body, self.max_body_size)
            .collect()
            .await
            .map_err(|error| anyhow!(error))?
            .to_bytes();
        Ok(Response::from_parts(parts, body))
    }
}

#[async_trait::async_trait]
impl<U: Upstream + ?Sized> Upstream for Arc<U> {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        (**self).send(req).await
    }
}
