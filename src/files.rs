//! Static file serving below a tenant-configured root directory

use crate::error::{full_body, json_error_response, GatewayBody, GatewayErrorCode};
use crate::proxy::strip_request_path;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const INDEX_FILE: &str = "index.html";

/// Turn a request path into a path relative to the root.
///
/// Segments are percent-decoded; `.` is dropped and `..` never climbs above the
/// root. Returns `None` for segments that would smuggle a separator.
pub fn clean_relative_path(path: &str) -> Option<PathBuf> {
    let mut parts: Vec<String> = Vec::new();
    for raw in path.split('/') {
        let segment = urlencoding::decode(raw).ok()?.into_owned();
        if segment.contains('/') || segment.contains('\\') || segment.contains('\0') {
            return None;
        }
        match segment.as_str() {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(segment),
        }
    }
    Some(parts.iter().collect())
}

/// Serve `request_path` with `strip_prefix` removed, relative to `root`
pub async fn serve(
    request_path: &str,
    strip_prefix: &str,
    root: &Path,
    dir_listing: bool,
) -> Response<GatewayBody> {
    let stripped = strip_request_path(request_path, strip_prefix);
    let relative = match clean_relative_path(&stripped) {
        Some(relative) => relative,
        None => return not_found(request_path),
    };
    let full_path = root.join(&relative);

    let metadata = match tokio::fs::metadata(&full_path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return not_found(request_path),
        Err(e) => {
            warn!(path = %full_path.display(), error = %e, "Failed to stat file");
            return not_found(request_path);
        }
    };

    if !metadata.is_dir() {
        return serve_file(&full_path).await;
    }

    if !request_path.ends_with('/') {
        return redirect(&format!("{}/", request_path));
    }

    let index = full_path.join(INDEX_FILE);
    if tokio::fs::metadata(&index).await.map(|m| m.is_file()).unwrap_or(false) {
        return serve_file(&index).await;
    }

    if dir_listing {
        return match render_listing(&full_path, request_path).await {
            Ok(html) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/html; charset=utf-8")
                .header(CONTENT_LENGTH, html.len())
                .body(full_body(html))
                .expect("valid response with StatusCode enum and static headers"),
            Err(e) => {
                warn!(path = %full_path.display(), error = %e, "Failed to list directory");
                not_found(request_path)
            }
        };
    }

    not_found(request_path)
}

async fn serve_file(path: &Path) -> Response<GatewayBody> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to read file");
            return json_error_response(GatewayErrorCode::FileNotFound, "File not found");
        }
    };

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, mime.essence_str())
        .header(CONTENT_LENGTH, contents.len())
        .body(full_body(contents))
        .expect("valid response with StatusCode enum and static headers")
}

fn redirect(location: &str) -> Response<GatewayBody> {
    match Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .body(full_body(""))
    {
        Ok(response) => response,
        Err(_) => json_error_response(GatewayErrorCode::BadGatewayRequest, "Invalid redirect location"),
    }
}

fn not_found(request_path: &str) -> Response<GatewayBody> {
    json_error_response(
        GatewayErrorCode::FileNotFound,
        format!("No file at {}", request_path),
    )
}

async fn render_listing(dir: &Path, request_path: &str) -> io::Result<String> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let title = html_escape(request_path);
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {title}</title></head>\n<body>\n<h1>Index of {title}</h1>\n<ul>\n"
    );
    for name in &names {
        let href = match name.strip_suffix('/') {
            Some(dir_name) => format!("{}/", urlencoding::encode(dir_name)),
            None => urlencoding::encode(name).into_owned(),
        };
        html.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            href,
            html_escape(name)
        ));
    }
    html.push_str("</ul>\n</body>\n</html>\n");
    Ok(html)
}

fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
