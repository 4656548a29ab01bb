use bytes::Bytes;
use gateway_core::Error;
use http::{header, HeaderValue, Response, StatusCode};
use tracing::{error, info};

/// Translates an error into the response sent to the client.
///
/// Invalid cache deletions map to 400 and missing caches or ingresses to 404, with the error's
/// message as the body. Anything else is a 500 that doesn't leak details to the client.
pub fn error_response(err: &anyhow::Error) -> Response<Bytes> {
    let status = match err.downcast_ref::<Error>() {
        Some(e) if e.is_invalid_delete() => StatusCode::BAD_REQUEST,
        Some(e) if e.is_not_found() => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, %status, "Request failed");
        Bytes::from_static(b"Internal server error")
    } else {
        info!(error = %err, %status, "Request failed");
        Bytes::from(err.to_string())
    };

    let mut rsp = Response::new(body);
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    rsp
}
