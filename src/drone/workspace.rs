use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::protocol::{validate_commit, validate_repo_name, PipelineReport};

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("{0}")]
    InvalidName(String),
}

/// Exit code reported when a step's program could not be started at all.
const LAUNCH_FAILURE_CODE: i32 = 127;

/// Written into a checkout's `.git` once it is complete.
const DEPLOYED_MARKER: &str = "flotilla-deployed";

/// The drone's git state: bare mirrors of hub repositories and checked-out
/// working trees, both under one base directory.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    basedir: PathBuf,
    /// Held while a working tree is being built.
    checkouts: Arc<Mutex<()>>,
}

impl GitWorkspace {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        Self {
            basedir: basedir.into(),
            checkouts: Arc::new(Mutex::new(())),
        }
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// `{basedir}/repos/{repo}.git`
    pub fn mirror_dir(&self, repo: &str) -> PathBuf {
        self.basedir.join("repos").join(format!("{}.git", repo))
    }

    /// `{basedir}/deploy/{repo}.{commit}`
    pub fn checkout_dir(&self, repo: &str, commit: &str) -> PathBuf {
        self.basedir.join("deploy").join(format!("{}.{}", repo, commit))
    }

    /// Bring the mirror of `repo` up to date with `origin`, creating it if
    /// needed.
    pub async fn fetch(&self, repo: &str, origin: &str) -> Result<PipelineReport, WorkspaceError> {
        validate_repo_name(repo).map_err(WorkspaceError::InvalidName)?;
        let mirror = self.mirror_dir(repo);

        if !mirror.exists() {
            if let Some(parent) = mirror.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    tracing::warn!(repo, error = %e, "failed to create mirror directory");
                }
            }
            let mirror_arg = mirror.to_string_lossy().into_owned();
            if let Err(report) = run_step("init", &["init", "--bare", &mirror_arg], &self.basedir).await {
                return Ok(report);
            }
        }

        match run_step("fetch", &["fetch", origin, "+refs/heads/*:refs/heads/*"], &mirror).await {
            Ok(()) => Ok(PipelineReport::success(None)),
            Err(report) => Ok(report),
        }
    }

    /// Produce a working tree of `repo` at `commit`.
    ///
    /// Mirror and fetch failures are logged and do not stop the pipeline;
    /// clone and checkout failures do. A completed checkout is reused; any
    /// other directory in its place is removed and rebuilt.
    pub async fn deploy(&self, repo: &str, commit: &str, origin: Option<&str>) -> Result<PipelineReport, WorkspaceError> {
        validate_repo_name(repo).map_err(WorkspaceError::InvalidName)?;
        validate_commit(commit).map_err(WorkspaceError::InvalidName)?;

        match origin {
            Some(origin) => {
                let report = self.fetch(repo, origin).await?;
                if !report.ok {
                    tracing::warn!(
                        repo,
                        step = report.step.as_deref().unwrap_or("?"),
                        code = ?report.code,
                        "fetch failed, trying the existing mirror"
                    );
                }
            }
            None => tracing::warn!(repo, "hub git port unknown, skipping fetch"),
        }

        let dir = self.checkout_dir(repo, commit);
        let dir_arg = dir.to_string_lossy().into_owned();
        let marker = dir.join(".git").join(DEPLOYED_MARKER);
        let _building = self.checkouts.lock().await;
        if marker.exists() {
            tracing::debug!(repo, commit, dir = %dir_arg, "reusing checkout");
            return Ok(PipelineReport::success(Some(dir_arg)));
        }
        if dir.exists() {
            tracing::warn!(repo, commit, dir = %dir_arg, "removing incomplete checkout");
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                tracing::warn!(repo, commit, error = %e, "failed to remove incomplete checkout");
            }
        }
        if let Some(parent) = dir.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(repo, error = %e, "failed to create deploy directory");
            }
        }

        let mirror_arg = self.mirror_dir(repo).to_string_lossy().into_owned();
        if let Err(mut report) = run_step("clone", &["clone", &mirror_arg, &dir_arg], &self.basedir).await {
            report.dir = Some(dir_arg);
            return Ok(report);
        }
        if let Err(mut report) = run_step("checkout", &["checkout", commit], &dir).await {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                tracing::warn!(repo, commit, error = %e, "failed to remove failed checkout");
            }
            report.dir = Some(dir_arg);
            return Ok(report);
        }
        if let Err(e) = tokio::fs::write(&marker, commit).await {
            tracing::warn!(repo, commit, error = %e, "failed to mark checkout complete");
        }

        tracing::info!(repo, commit, dir = %dir_arg, "deployed");
        Ok(PipelineReport::success(Some(dir_arg)))
    }

    /// Repositories currently mirrored here.
    pub async fn mirrors(&self) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.basedir.join("repos")).await else {
            return names;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str().and_then(|n| n.strip_suffix(".git")) {
                names.push(name.to_string());
            }
        }
        names.sort();
        names
    }
}

/// Run one git step. A non-zero exit or launch failure becomes the report.
async fn run_step(step: &str, args: &[&str], cwd: &Path) -> Result<(), PipelineReport> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => {
            tracing::debug!(
                step,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git step failed"
            );
            Err(PipelineReport {
                ok: false,
                step: Some(step.to_string()),
                code: output.status.code(),
                signal: output.status.signal(),
                dir: None,
            })
        }
        Err(e) => {
            tracing::warn!(step, error = %e, "failed to run git");
            Err(PipelineReport {
                ok: false,
                step: Some(step.to_string()),
                code: Some(LAUNCH_FAILURE_CODE),
                signal: None,
                dir: None,
            })
        }
    }
}
