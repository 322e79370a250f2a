//! On-demand resources fetched through the bridge
//!
//! Answers `GET /cockpit[/@host][/<package-or-hash>/<path>]` by opening a
//! transient `resource1` channel on the session's transport and streaming
//! the returned bytes into the HTTP response. Also provides the package
//! listing the bridge advertises, which teaches the session which host a
//! content checksum lives on.

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::{
    body::Frame as BodyFrame,
    header::{CACHE_CONTROL, CONTENT_TYPE},
    Response, StatusCode,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::Session;
use crate::{
    error::Error,
    handlers::{error_response, HttpBody},
    protocol::{ControlMessage, Problem},
};

/// Cache lifetime for content-hash addressed resources; the hash pins the
/// content, so clients may keep it for a year.
const CHECKSUM_CACHE_CONTROL: &str = "max-age=31556926, public";

pub(crate) struct ResourceRequest {
    pub package: Option<String>,
    pub path: Option<String>,
    pub accept: Option<String>,
    pub host: Option<String>,
}

pub(crate) struct ResourceChannel {
    pub events: mpsc::UnboundedReceiver<ResourceEvent>,
}

pub(crate) enum ResourceEvent {
    Data(Bytes),
    Close(ControlMessage),
    TransportClosed(Option<Problem>),
}

/// One package the bridge serves: its identifiers (an optional `$checksum`
/// plus any number of names) and its manifest.
#[derive(Clone, Debug, Deserialize)]
pub struct PackageEntry {
    pub id: Vec<String>,
    pub manifest: Value,
}

/// The bridge's manifest inventory.
pub type PackageListing = Vec<PackageEntry>;

struct ResourcePath {
    host: Option<String>,
    package: String,
    path: String,
}

impl Session {
    /// Serves one resource from the bridge as an HTTP response.
    ///
    /// `path` is the full request path, `/cockpit/<package>/<file>` with an
    /// optional `@host` suffix on the package and `$checksum` in place of a
    /// package name.
    pub async fn resource(&self, path: &str) -> Response<HttpBody> {
        let Some(parsed) = parse_resource_path(path) else {
            return error_response(StatusCode::NOT_FOUND);
        };
        let ResourcePath { mut host, package, path: file } = parsed;

        // Checksums are not tied to a host in the path; route them to the
        // host that announced them in a package listing.
        if host.is_none() && package.starts_with('$') {
            host = self.checksum_host(&package).await;
        }

        let request = ResourceRequest {
            package: Some(package.clone()),
            path: Some(file.clone()),
            accept: None,
            host,
        };
        let Some(mut channel) = self.open_resource(request).await else {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR);
        };

        match channel.events.recv().await {
            Some(ResourceEvent::Data(first)) => {
                stream_response(first, channel.events, &file, package.starts_with('$'))
            }
            Some(ResourceEvent::Close(control)) => {
                // The bridge produced nothing for this resource.
                match control.str_member("reason") {
                    None | Some("") | Some("not-found") => error_response(StatusCode::NOT_FOUND),
                    Some(reason) => {
                        tracing::warn!("failed to retrieve resource: {reason}");
                        error_response(StatusCode::INTERNAL_SERVER_ERROR)
                    }
                }
            }
            Some(ResourceEvent::TransportClosed(problem)) => {
                tracing::warn!("failed to retrieve resource: {}", problem_label(problem));
                error_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
            None => error_response(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Asks the bridge on `host` for its package inventory.
    ///
    /// Checksums found in the listing are recorded so hash-addressed
    /// resource fetches route to the announcing host.
    pub async fn packages(&self, host: Option<&str>) -> Result<PackageListing, Problem> {
        let request = ResourceRequest {
            package: None,
            path: None,
            accept: None,
            host: host.map(str::to_owned),
        };
        let Some(mut channel) = self.open_resource(request).await else {
            return Err(Problem::Disconnected);
        };

        let mut data = Vec::new();
        loop {
            match channel.events.recv().await {
                Some(ResourceEvent::Data(bytes)) => data.extend_from_slice(&bytes),
                Some(ResourceEvent::Close(_)) => break,
                Some(ResourceEvent::TransportClosed(problem)) => {
                    tracing::warn!(
                        "transport closed while listing packages: {}",
                        problem_label(problem)
                    );
                    return Err(problem.unwrap_or(Problem::Disconnected));
                }
                None => return Err(Problem::Disconnected),
            }
        }

        let listing: PackageListing = serde_json::from_slice(&data).map_err(|err| {
            tracing::warn!("got invalid package listing: {err}");
            Problem::InternalError
        })?;

        let checksums: Vec<String> = listing
            .iter()
            .flat_map(|entry| entry.id.iter())
            .filter(|id| id.starts_with('$'))
            .cloned()
            .collect();
        if !checksums.is_empty() {
            self.record_checksums(host.unwrap_or("localhost"), checksums);
        }

        Ok(listing)
    }
}

fn stream_response(
    first: Bytes,
    events: mpsc::UnboundedReceiver<ResourceEvent>,
    file: &str,
    checksum: bool,
) -> Response<HttpBody> {
    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(mime) = mime_guess::from_path(file).first() {
        builder = builder.header(CONTENT_TYPE, mime.essence_str());
    }
    if checksum {
        builder = builder.header(CACHE_CONTROL, CHECKSUM_CACHE_CONTROL);
    }

    let head = stream::iter([Ok(BodyFrame::data(first))]);
    let rest = stream::unfold(events, |mut events| async move {
        match events.recv().await {
            Some(ResourceEvent::Data(data)) => Some((Ok(BodyFrame::data(data)), events)),
            Some(ResourceEvent::Close(_)) | None => None,
            Some(ResourceEvent::TransportClosed(problem)) => {
                // Mid-stream loss: error the body so the response aborts
                // instead of ending as if complete.
                let label = problem_label(problem);
                tracing::warn!("failed to retrieve resource: {label}");
                Some((Err(Error::server_error(format!("resource interrupted: {label}"))), events))
            }
        }
    });
    let body = StreamBody::new(head.chain(rest)).boxed_unsync();

    match builder.body(body) {
        Ok(response) => response,
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn problem_label(problem: Option<Problem>) -> &'static str {
    problem.map(|p| p.as_str()).unwrap_or("disconnected")
}

/// Splits `/cockpit[/@host]/<package>/<path>`; `None` means the path does
/// not address a resource and the caller answers 404.
fn parse_resource_path(path: &str) -> Option<ResourcePath> {
    let rest = path.strip_prefix("/cockpit/")?;
    let (first, remainder) = rest.split_once('/')?;
    if first.is_empty() || remainder.is_empty() {
        return None;
    }

    let (package, host) = match first.split_once('@') {
        Some((package, host)) if !package.is_empty() && !host.is_empty() => {
            (package, Some(host.to_owned()))
        }
        Some(_) => return None,
        None => (first, None),
    };

    Some(ResourcePath {
        host,
        package: package.to_owned(),
        path: format!("/{remainder}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_parses_package_and_path() {
        let parsed = parse_resource_path("/cockpit/another/test.html").unwrap();

        assert_eq!(parsed.package, "another");
        assert_eq!(parsed.path, "/test.html");
        assert_eq!(parsed.host, None);
    }

    #[test]
    fn it_parses_host_qualified_package() {
        let parsed = parse_resource_path("/cockpit/another@localhost/test.html").unwrap();

        assert_eq!(parsed.package, "another");
        assert_eq!(parsed.path, "/test.html");
        assert_eq!(parsed.host.as_deref(), Some("localhost"));
    }

    #[test]
    fn it_parses_checksum_package() {
        let parsed =
            parse_resource_path("/cockpit/$fec489a692ee808950f34f6c519803aed65e1849/sub/file.ext")
                .unwrap();

        assert_eq!(parsed.package, "$fec489a692ee808950f34f6c519803aed65e1849");
        assert_eq!(parsed.path, "/sub/file.ext");
    }

    #[test]
    fn it_rejects_paths_without_a_resource() {
        assert!(parse_resource_path("/cockpit/").is_none());
        assert!(parse_resource_path("/cockpit/another").is_none());
        assert!(parse_resource_path("/cockpit/another@localhost").is_none());
        assert!(parse_resource_path("/cockpit/another/").is_none());
        assert!(parse_resource_path("/cockpit/@localhost/test.html").is_none());
        assert!(parse_resource_path("/elsewhere/another/test.html").is_none());
    }

    #[test]
    fn it_deserializes_package_listings() {
        let listing: PackageListing = serde_json::from_str(
            r#"[
                {"id": ["$2362deb82fad54aca51092c505a5660ac6c45a9f", "one", "two"],
                 "manifest": {"description": "second dummy description"}},
                {"id": ["another", "marmalade"],
                 "manifest": {"description": "another"}}
            ]"#,
        )
        .unwrap();

        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].id[0], "$2362deb82fad54aca51092c505a5660ac6c45a9f");
        assert_eq!(listing[1].manifest["description"], "another");
    }
}
