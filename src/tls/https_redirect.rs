//! HTTP to HTTPS redirection

use hyper::{
    header::{HOST, LOCATION},
    Request, Response, StatusCode,
};

use crate::handlers::{error_response, full_body, HttpBody};

const REDIRECT_BODY: &str =
    "<html><head><title>Moved</title></head><body>Please use TLS</body></html>";

/// Answers a plaintext request from a non-loopback peer with a permanent
/// redirect to the same path over HTTPS.
pub(crate) fn response<B>(request: &Request<B>) -> Response<HttpBody> {
    let Some(host) = request
        .headers()
        .get(HOST)
        .and_then(|host| host.to_str().ok())
        .filter(|host| !host.is_empty())
    else {
        return error_response(StatusCode::BAD_REQUEST);
    };

    let path = request
        .uri()
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or("/");
    let location = format!("https://{host}{path}");

    match Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .body(full_body(REDIRECT_BODY))
    {
        Ok(response) => response,
        Err(_) => error_response(StatusCode::BAD_REQUEST),
    }
}
