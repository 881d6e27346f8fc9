//! Static file listener: serves a directory tree under a context path.

use std::path::{Component, Path, PathBuf};

use portico_protocol::http::{Method, StatusCode, header};
use portico_protocol::{DispatchError, DispatchRequest, DispatchResponse, DispatchResult};
use portico_server::RequestDispatcher;
use tracing::debug;

const INDEX_FILE: &str = "index.html";

pub struct StaticFiles {
    root: PathBuf,
    context_path: String,
}

impl StaticFiles {
    /// Serve `root` for requests under `context_path`.
    pub fn new(root: impl Into<PathBuf>, context_path: &str) -> Self {
        Self {
            root: root.into(),
            context_path: context_path.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a request path onto the root, rejecting anything that escapes it.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = request_path
            .strip_prefix(self.context_path.as_str())
            .unwrap_or(request_path)
            .trim_start_matches('/');

        let mut path = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(path)
    }
}

impl RequestDispatcher for StaticFiles {
    async fn dispatch(
        &self,
        request: &DispatchRequest,
        response: &mut DispatchResponse,
    ) -> DispatchResult {
        if request.method != Method::GET && request.method != Method::HEAD {
            response.insert_header(header::ALLOW, "GET, HEAD");
            return Err(DispatchError::status(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("{} not supported", request.method),
            ));
        }

        let mut path = self
            .resolve(request.path())
            .ok_or_else(|| DispatchError::not_found(request.path()))?;

        if tokio::fs::metadata(&path).await?.is_dir() {
            path.push(INDEX_FILE);
        }

        let body = tokio::fs::read(&path).await?;
        debug!("Serving {} ({} bytes)", path.display(), body.len());

        let content_type = content_type_for(&path);
        if request.method == Method::HEAD {
            response.set_status(StatusCode::OK);
            response.insert_header(header::CONTENT_TYPE, content_type);
            response.insert_header(header::CONTENT_LENGTH, &body.len().to_string());
            response.write_body(Vec::new());
        } else {
            response.send(StatusCode::OK, content_type, body);
        }
        Ok(())
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
