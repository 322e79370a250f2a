//! Request dispatch
//!
//! One [`GatewayService`] serves each accepted connection: it applies the
//! request policy (only `GET`, a `Host` header, no body), then hands the
//! request to the socket handler (WebSocket upgrade onto a session), the
//! resource handler (bridge-backed fetch through a session), or the static
//! file handler, in that order.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};
use std::sync::Arc;

use hyper::{
    body::Incoming,
    header::{HeaderMap, CONTENT_LENGTH, HOST},
    service::Service,
    Method, Request, Response, StatusCode,
};

use crate::{
    app::GatewayEnv,
    error::Error,
    session::Session,
    tls::https_redirect,
    ws::{origin_ok, WebSocketUpgrade},
};

/// Response body used throughout the gateway.
pub type HttpBody = UnsyncBoxBody<Bytes, Error>;

/// Resolves the session behind a request, usually from a cookie.
///
/// Credential acquisition itself lives outside the gateway; this is the
/// contract through which it plugs in. Returning `None` sends WebSockets to
/// the no-auth stub and resource requests to a 401.
pub trait SessionSource: Send + Sync + 'static {
    fn lookup(&self, headers: &HeaderMap) -> Option<Session>;
}

impl<F> SessionSource for F
where
    F: Fn(&HeaderMap) -> Option<Session> + Send + Sync + 'static,
{
    fn lookup(&self, headers: &HeaderMap) -> Option<Session> {
        self(headers)
    }
}

/// Per-connection service: dispatches requests against the shared
/// environment, with the 301 redirect pre-armed for plaintext connections
/// from non-loopback peers.
pub(crate) struct GatewayService {
    pub(crate) env: Arc<GatewayEnv>,
    pub(crate) redirect: bool,
    pub(crate) tls: bool,
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<HttpBody>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    #[inline]
    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let env = self.env.clone();
        let redirect = self.redirect;
        let tls = self.tls;
        Box::pin(handle_request(request, env, redirect, tls))
    }
}

async fn handle_request(
    mut request: Request<Incoming>,
    env: Arc<GatewayEnv>,
    redirect: bool,
    tls: bool,
) -> Result<Response<HttpBody>, Error> {
    let path = request.uri().path().to_owned();

    // The TLS redirect was armed while sniffing the connection; paths under
    // the exception prefix are still served in clear (health endpoints).
    if redirect && !env.ssl_exception(&path) {
        return Ok(https_redirect::response(&request));
    }

    if request.method() != Method::GET {
        return Ok(error_response(StatusCode::METHOD_NOT_ALLOWED));
    }

    let host_present = request
        .headers()
        .get(HOST)
        .and_then(|host| host.to_str().ok())
        .map(|host| !host.is_empty())
        .unwrap_or(false);
    if !host_present {
        return Ok(error_response(StatusCode::BAD_REQUEST));
    }

    // Request bodies are out of contract; a declared one is refused before
    // it is read.
    if let Some(length) = request.headers().get(CONTENT_LENGTH) {
        match length.to_str().ok().and_then(|length| length.parse::<u64>().ok()) {
            Some(0) => (),
            Some(_) => {
                tracing::debug!("received non-zero Content-Length");
                return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE));
            }
            None => {
                tracing::warn!("received invalid Content-Length");
                return Ok(error_response(StatusCode::BAD_REQUEST));
            }
        }
    }

    if path == env.socket_path {
        return socket_handler(&mut request, &env, tls);
    }

    if path.starts_with("/cockpit/") || path == "/cockpit" {
        return match env.lookup(request.headers()) {
            Some(session) => Ok(session.resource(&path).await),
            None => Ok(error_response(StatusCode::UNAUTHORIZED)),
        };
    }

    Ok(env.roots.serve(&path).await)
}

fn socket_handler(
    request: &mut Request<Incoming>,
    env: &GatewayEnv,
    tls: bool,
) -> Result<Response<HttpBody>, Error> {
    if !origin_ok(request.headers(), tls) {
        tracing::warn!("received request from bad Origin");
        return Ok(error_response(StatusCode::FORBIDDEN));
    }

    let session = env.lookup(request.headers());
    let upgrade = match WebSocketUpgrade::try_from_request(request) {
        Ok(upgrade) => upgrade,
        Err(err) => {
            tracing::debug!("invalid websocket handshake: {err}");
            return Ok(error_response(err.status));
        }
    };

    Ok(match session {
        Some(session) => upgrade.respond(move |socket| async move {
            session.attach_socket(socket);
        }),
        None => upgrade.respond(Session::noauth_close),
    })
}

pub(crate) fn full_body(data: impl Into<Bytes>) -> HttpBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn empty_body() -> HttpBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// Minimal HTML error page, the same shape for every status.
pub(crate) fn error_response(status: StatusCode) -> Response<HttpBody> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let body = format!(
        "<html><head><title>{} {}</title></head><body>{}</body></html>",
        status.as_u16(),
        reason,
        reason
    );
    Response::builder()
        .status(status)
        .body(full_body(body))
        .expect("static error response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_renders_minimal_error_pages() {
        let response = error_response(StatusCode::NOT_FOUND);

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn it_renders_the_documented_not_found_body() {
        let response = error_response(StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();

        assert_eq!(
            &body[..],
            b"<html><head><title>404 Not Found</title></head><body>Not Found</body></html>"
        );
        assert_eq!(body.len(), 76);
    }
}
