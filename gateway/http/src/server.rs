use crate::{admin::text, error_response, Chain, Exchange, DEFAULT_MAX_BODY_SIZE};
use anyhow::Result;
use bytes::Bytes;
use gateway_cache as cache;
use gateway_core::CacheStore;
use gateway_k8s_index as index;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use std::{convert::Infallible, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, debug_span, info, warn, Instrument};

/// Routes requests to the administrative API or through the interceptor chain.
pub struct Gateway<S> {
    chain: Chain,
    index: index::Controller,
    cache: Option<cache::Controller<S>>,
    max_body_size: usize,
}

// === impl Gateway ===

impl<S: CacheStore> Gateway<S> {
    pub fn new(
        chain: Chain,
        index: index::Controller,
        cache: Option<cache::Controller<S>>,
    ) -> Self {
        Self {
            chain,
            index,
            cache,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Limits the size of request bodies. Larger requests fail with 413.
    pub fn with_max_body_size(self, max_body_size: usize) -> Self {
        Self {
            max_body_size,
            ..self
        }
    }

    pub(crate) fn index(&self) -> &index::Controller {
        &self.index
    }

    pub(crate) fn cache(&self) -> Option<&cache::Controller<S>> {
        self.cache.as_ref()
    }

    pub async fn handle(&self, req: Request<Bytes>) -> Response<Bytes> {
        let res = match (req.method(), req.uri().path()) {
            (&Method::DELETE, "/api/cache") => self.delete_cache(req.body()).await,
            (&Method::GET, "/api/ingresses") => self.list_ingresses(),
            (&Method::GET, "/api/health") => Ok(text(StatusCode::OK, "ok")),
            _ => self.chain.handle(Exchange::new(req)).await,
        };
        res.unwrap_or_else(|error| error_response(&error))
    }

    async fn serve(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.max_body_size).collect().await {
            Ok(body) => body.to_bytes(),
            Err(error) if error.is::<LengthLimitError>() => {
                debug!(limit = self.max_body_size, "Request body is too large");
                return text(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large").map(Full::new);
            }
            Err(error) => {
                debug!(%error, "Failed to read request body");
                return text(StatusCode::BAD_REQUEST, "Bad request").map(Full::new);
            }
        };
        self.handle(Request::from_parts(parts, body))
            .await
            .map(Full::new)
    }
}

/// Serves connections accepted by `listener` until shutdown is signaled.
///
/// On shutdown the listener stops accepting. Open connections finish their in-flight requests
/// before closing, and the drain is held until they do.
pub async fn serve<S: CacheStore>(
    listener: TcpListener,
    gateway: Arc<Gateway<S>>,
    shutdown: drain::Watch,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Gateway listening");
    tokio::pin! {
        let signaled = shutdown.clone().signaled();
    }

    loop {
        let (stream, client_addr) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            _ = &mut signaled => {
                info!("Gateway listener shutting down");
                return Ok(());
            }
        };

        tokio::spawn(
            serve_connection(stream, gateway.clone(), shutdown.clone())
                .instrument(debug_span!("conn", client.addr = %client_addr)),
        );
    }
}

async fn serve_connection<S: CacheStore>(
    stream: TcpStream,
    gateway: Arc<Gateway<S>>,
    shutdown: drain::Watch,
) {
    let svc = service_fn(move |req| {
        let gateway = gateway.clone();
        async move { Ok::<_, Infallible>(gateway.serve(req).await) }
    });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let res = tokio::select! {
        res = conn.as_mut() => res,
        handle = shutdown.signaled() => {
            conn.as_mut().graceful_shutdown();
            handle.release_after(conn).await
        }
    };
    if let Err(error) = res {
        debug!(%error, "Connection failed");
    }
}
