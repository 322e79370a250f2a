//! Static resources served from document roots

use futures_util::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::{body::Frame as BodyFrame, header::CONTENT_TYPE, Response, StatusCode};
use std::{
    io,
    path::{Component, Path, PathBuf},
};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::{
    error::Error,
    handlers::{error_response, HttpBody},
};

/// A set of directories files may be served from.
///
/// Roots are resolved with `realpath` once at startup; every request path is
/// resolved the same way and must stay inside one of the roots. A path that
/// escapes (through `..` or a symlink) answers 404 rather than 403, so the
/// response does not reveal whether the target exists.
pub(crate) struct DocumentRoots {
    roots: Vec<PathBuf>,
}

impl DocumentRoots {
    pub(crate) fn new(configured: &[PathBuf]) -> Self {
        let mut roots = Vec::with_capacity(configured.len());
        for root in configured {
            match root.canonicalize() {
                Ok(resolved) => roots.push(resolved),
                Err(err) => tracing::warn!("couldn't resolve document root {root:?}: {err}"),
            }
        }
        Self { roots }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub(crate) async fn serve(&self, path: &str) -> Response<HttpBody> {
        let Some(relative) = relative_path(path) else {
            return error_response(StatusCode::NOT_FOUND);
        };

        for root in &self.roots {
            let candidate = root.join(&relative);
            let resolved = match tokio::fs::canonicalize(&candidate).await {
                Ok(resolved) => resolved,
                Err(_) => continue,
            };
            if !resolved.starts_with(root) {
                tracing::debug!("request path escapes document root: {path}");
                continue;
            }

            match serve_file(&resolved).await {
                Ok(Some(response)) => return response,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!("couldn't serve {resolved:?}: {err}");
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR);
                }
            }
        }

        error_response(StatusCode::NOT_FOUND)
    }
}

async fn serve_file(path: &Path) -> io::Result<Option<Response<HttpBody>>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(_) => return Ok(None),
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    let file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let stream = ReaderStream::new(file)
        .map(|chunk| chunk.map(BodyFrame::data).map_err(Error::from));
    let body = StreamBody::new(stream).boxed_unsync();

    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(mime) = mime_guess::from_path(path).first() {
        builder = builder.header(CONTENT_TYPE, mime.essence_str());
    }
    builder
        .body(body)
        .map(Some)
        .map_err(|err| io::Error::other(err))
}

/// Turns a request path into a root-relative one made of plain components;
/// anything else (including `..`) does not resolve to a file.
fn relative_path(path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if relative.as_os_str().is_empty() {
        return None;
    }
    Some(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_builds_relative_paths() {
        assert_eq!(relative_path("/dir/file.html"), Some(PathBuf::from("dir/file.html")));
        assert_eq!(relative_path("/file"), Some(PathBuf::from("file")));
        assert_eq!(relative_path("//doubled/file"), Some(PathBuf::from("doubled/file")));
    }

    #[test]
    fn it_rejects_parent_components() {
        assert_eq!(relative_path("/../etc/passwd"), None);
        assert_eq!(relative_path("/dir/../../etc/passwd"), None);
        assert_eq!(relative_path("/"), None);
        assert_eq!(relative_path(""), None);
    }

    #[tokio::test]
    async fn it_serves_files_within_a_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.html"), "<html>hi</html>\n").unwrap();

        let roots = DocumentRoots::new(&[dir.path().to_path_buf()]);
        let response = roots.serve("/test.html").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/html"
        );
    }

    #[tokio::test]
    async fn it_hides_symlinks_that_escape_the_root() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "secret").unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link"))
            .unwrap();

        let roots = DocumentRoots::new(&[dir.path().to_path_buf()]);
        let response = roots.serve("/link").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn it_answers_not_found_for_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let roots = DocumentRoots::new(&[dir.path().to_path_buf()]);

        assert_eq!(roots.serve("/sub").await.status(), StatusCode::NOT_FOUND);
    }
}
