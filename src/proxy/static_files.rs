use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED, LOCATION};
use hyper::{Body, Method, Request, Response, StatusCode};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::StaticConfig;

/// Root path under which all static directories are served
pub const STATIC_BASE_PATH: &str = "/static/";

const INDEX_FILE: &str = "index.html";

#[derive(Debug, Clone)]
struct StaticRoute {
    /// `/static/<key>/`
    prefix: String,
    root: PathBuf,
}

/// Directory mounts under `/static/<key>/`, built from [`StaticConfig`]
#[derive(Debug, Clone, Default)]
pub struct StaticRoutes {
    routes: Vec<StaticRoute>,
}

impl StaticRoutes {
    pub fn from_config(config: &StaticConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }

        info!("Registering static file routes...");
        let mut routes = Vec::new();
        for (key, dir) in &config.dirs {
            let route_key = key.trim_matches('/');
            if route_key.is_empty() {
                warn!("Skipping static route: invalid key {:?}", key);
                continue;
            }
            if dir.path.as_os_str().is_empty() {
                warn!(
                    "Skipping static route '/static/{}/': filesystem path is empty",
                    route_key
                );
                continue;
            }
            let prefix = format!("{}{}/", STATIC_BASE_PATH, route_key);
            info!("Route '{}' -> serves files from {:?}", prefix, dir.path);
            routes.push(StaticRoute {
                prefix,
                root: dir.path.clone(),
            });
        }
        // Longest prefix wins when keys nest
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Serve `req` if its path falls under a mounted route, `None` otherwise
    pub async fn serve(&self, req: &Request<Body>) -> Option<Response<Body>> {
        let path = req.uri().path();

        for route in &self.routes {
            // `/static/key` without the slash redirects like a directory
            if path == route.prefix.trim_end_matches('/') {
                return Some(redirect(&route.prefix));
            }
            if let Some(rest) = path.strip_prefix(&route.prefix) {
                debug!(route = %route.prefix, path, "Static request");
                return Some(serve_file(&route.root, rest, path, req.method()).await);
            }
        }
        None
    }
}

/// Map the URL remainder onto `root`, refusing anything that climbs out of it
fn resolve(root: &Path, rest: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(rest).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}

async fn serve_file(root: &Path, rest: &str, url_path: &str, method: &Method) -> Response<Body> {
    let Some(mut file) = resolve(root, rest) else {
        return plain(StatusCode::BAD_REQUEST, "invalid path");
    };

    let metadata = match tokio::fs::metadata(&file).await {
        Ok(m) => m,
        Err(e) => return fs_error(e),
    };
    if metadata.is_dir() {
        if !url_path.ends_with('/') {
            return redirect(&format!("{}/", url_path));
        }
        file.push(INDEX_FILE);
    }

    let body = match tokio::fs::read(&file).await {
        Ok(body) => body,
        Err(e) => return fs_error(e),
    };
    let content_type = mime_guess::from_path(&file).first_or_octet_stream();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type.as_ref())
        .header(CONTENT_LENGTH, body.len());
    if let Ok(modified) = tokio::fs::metadata(&file).await.and_then(|m| m.modified()) {
        builder = builder.header(LAST_MODIFIED, httpdate::fmt_http_date(modified));
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(body)
    };
    builder
        .body(body)
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
}

fn fs_error(err: io::Error) -> Response<Body> {
    match err.kind() {
        io::ErrorKind::NotFound => plain(StatusCode::NOT_FOUND, "404 page not found"),
        io::ErrorKind::PermissionDenied => plain(StatusCode::FORBIDDEN, "403 Forbidden"),
        _ => {
            warn!("Static file error: {}", err);
            plain(StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error")
        }
    }
}

fn redirect(location: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .body(Body::empty())
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
}

fn plain(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
