//! Git smart-HTTP endpoint backed by `git http-backend`.
//!
//! Repositories live under `{basedir}/repos/{name}.git` and are reachable as
//! `http://{hub}:{git_port}/{name}` (a trailing `.git` is accepted too).
//! Pushing to an unknown name creates the bare repository first. Every
//! successful push is announced on the push topic.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::protocol::validate_repo_name;

/// Largest request body (a pushed pack) accepted.
const MAX_BODY_BYTES: usize = 1 << 30;

/// A completed push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub repo: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("{0}")]
    InvalidName(String),

    #[error("git init failed for {repo}: {detail}")]
    Init { repo: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The hub's bare repositories.
#[derive(Debug, Clone)]
pub struct RepoStore {
    root: PathBuf,
}

impl RepoStore {
    /// Repositories under `{basedir}/repos`.
    pub fn new(basedir: &Path) -> Self {
        Self {
            root: basedir.join("repos"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, repo: &str) -> PathBuf {
        self.root.join(format!("{}.git", repo))
    }

    /// Names of every hosted repository, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.root).await else {
            return names;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str().and_then(|n| n.strip_suffix(".git")) {
                names.push(name.to_string());
            }
        }
        names.sort();
        names
    }

    /// Create the bare repository if it does not exist yet.
    pub async fn ensure(&self, repo: &str) -> Result<PathBuf, RepoError> {
        validate_repo_name(repo).map_err(RepoError::InvalidName)?;
        let path = self.path(repo);
        if path.exists() {
            return Ok(path);
        }
        tokio::fs::create_dir_all(&self.root).await?;
        let output = Command::new("git")
            .arg("init")
            .arg("--bare")
            .arg(&path)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(RepoError::Init {
                repo: repo.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        tracing::info!(repo, "created repository");
        Ok(path)
    }
}

#[derive(Clone)]
pub struct GitState {
    pub store: RepoStore,
    pub pushes: broadcast::Sender<PushEvent>,
}

pub fn router(state: GitState) -> Router {
    Router::new()
        .fallback(serve_git)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Split `/{repo}[.git]/{rest}` into the repository name and `rest`.
fn split_repo_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.strip_prefix('/')?;
    let (first, rest) = match trimmed.find('/') {
        Some(i) => (&trimmed[..i], &trimmed[i..]),
        None => (trimmed, ""),
    };
    if first.is_empty() {
        return None;
    }
    let repo = first.strip_suffix(".git").unwrap_or(first);
    Some((repo.to_string(), rest.to_string()))
}

async fn serve_git(State(state): State<GitState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let Some((repo, rest)) = split_repo_path(parts.uri.path()) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    if let Err(reason) = validate_repo_name(&repo) {
        return (StatusCode::BAD_REQUEST, reason).into_response();
    }
    let query = parts.uri.query().unwrap_or("").to_string();

    let receive_pack = rest == "/git-receive-pack";
    let push_related = receive_pack || query.split('&').any(|kv| kv == "service=git-receive-pack");
    if push_related {
        if let Err(e) = state.store.ensure(&repo).await {
            tracing::error!(repo = %repo, error = %e, "failed to create repository");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
    };

    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };

    let mut command = Command::new("git");
    command
        .arg("http-backend")
        .env("GIT_PROJECT_ROOT", state.store.root())
        .env("GIT_HTTP_EXPORT_ALL", "1")
        .env("GIT_CONFIG_COUNT", "1")
        .env("GIT_CONFIG_KEY_0", "http.receivepack")
        .env("GIT_CONFIG_VALUE_0", "true")
        .env("PATH_INFO", format!("/{}.git{}", repo, rest))
        .env("QUERY_STRING", &query)
        .env("REQUEST_METHOD", parts.method.as_str())
        .env("CONTENT_TYPE", header("content-type"))
        .env("CONTENT_LENGTH", body.len().to_string())
        .env("HTTP_CONTENT_ENCODING", header("content-encoding"))
        .env("GIT_PROTOCOL", header("git-protocol"))
        .env("REMOTE_ADDR", "127.0.0.1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(error = %e, "failed to start git http-backend");
            return (StatusCode::INTERNAL_SERVER_ERROR, "git unavailable").into_response();
        }
    };
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&body).await {
                tracing::debug!(error = %e, "http-backend closed stdin early");
            }
        });
    }
    let output = match child.wait_with_output().await {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(error = %e, "git http-backend failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "git failed").into_response();
        }
    };
    if !output.stderr.is_empty() {
        tracing::debug!(repo = %repo, stderr = %String::from_utf8_lossy(&output.stderr).trim(), "http-backend stderr");
    }

    let response = match parse_cgi(&output.stdout) {
        Some(response) => response,
        None => {
            tracing::error!(repo = %repo, "malformed http-backend output");
            return (StatusCode::BAD_GATEWAY, "malformed git response").into_response();
        }
    };

    if receive_pack && parts.method == Method::POST && response.status().is_success() && output.status.success() {
        tracing::info!(repo = %repo, "push received");
        let _ = state.pushes.send(PushEvent { repo });
    }
    response
}

/// Turn CGI output (headers, blank line, body) into a response.
fn parse_cgi(output: &[u8]) -> Option<Response> {
    let (head_len, sep_len) = find_header_end(output)?;
    let head = std::str::from_utf8(&output[..head_len]).ok()?;
    let body = output[head_len + sep_len..].to_vec();

    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();
    for line in head.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next()?.parse::<u16>().ok()?;
            status = StatusCode::from_u16(code).ok()?;
            continue;
        }
        let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
        let value = HeaderValue::from_str(value).ok()?;
        headers.append(name, value);
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Some(response)
}

fn find_header_end(output: &[u8]) -> Option<(usize, usize)> {
    let crlf = output.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    let lf = output.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}
