use std::path::{Component, Path, PathBuf};

use log::debug;

use crate::net::http::{response, status_response, Request};

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

/// Maps a request path onto `root`. `None` for anything escaping it.
fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let path = request_path.split(['?', '#']).next().unwrap_or("");
    let relative = path.trim_start_matches('/');
    let relative = if relative.is_empty() || relative.ends_with('/') {
        format!("{relative}index.html")
    } else {
        relative.to_string()
    };

    let mut resolved = root.to_path_buf();
    for component in Path::new(&relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            _ => return None,
        }
    }
    Some(resolved)
}

/// Answers a plain (non-upgrade) request from files under `root`.
pub fn serve(root: &Path, req: &Request) -> Vec<u8> {
    let include_body = match req.method.as_str() {
        "GET" => true,
        "HEAD" => false,
        _ => return status_response(405, "Method Not Allowed"),
    };

    let Some(path) = resolve(root, &req.path) else {
        return status_response(404, "Not Found");
    };

    match std::fs::read(&path) {
        Ok(body) => {
            debug!("static: {} -> {} ({} bytes)", req.path, path.display(), body.len());
            response(200, "OK", content_type(&path), &body, include_body)
        }
        Err(e) => {
            debug!("static: {} -> {}: {}", req.path, path.display(), e);
            status_response(404, "Not Found")
        }
    }
}
