//! Container engine boundary
//!
//! The materializer only talks to images through [`ImageEngine`]. The
//! shipped implementation shells out to `docker` or `podman`; tests plug in
//! their own.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::cancel::Cancellation;
use crate::error::{CatalogError, Result};

/// Registry credentials handed to `login`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Capabilities the materializer needs from a container engine
pub trait ImageEngine {
    /// Build `dockerfile` with `context_dir` as build context, tagged `tag`
    fn build(&self, context_dir: &Path, dockerfile: &Path, tag: &str, cancel: &Cancellation) -> Result<()>;
    fn tag(&self, source: &str, target: &str) -> Result<()>;
    fn push(&self, tag: &str, cancel: &Cancellation) -> Result<()>;
    fn pull(&self, image: &str, cancel: &Cancellation) -> Result<()>;
    fn login(&self, registry: &str, credentials: &Credentials) -> Result<()>;
    /// Write `image` as a `docker save` archive
    fn save(&self, image: &str, archive: &Path, cancel: &Cancellation) -> Result<()>;
    fn remove(&self, tag: &str) -> Result<()>;
}

/// Which CLI to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerTool {
    #[default]
    Docker,
    Podman,
}

impl ContainerTool {
    pub fn binary(&self) -> &'static str {
        match self {
            ContainerTool::Docker => "docker",
            ContainerTool::Podman => "podman",
        }
    }
}

impl fmt::Display for ContainerTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.binary())
    }
}

impl FromStr for ContainerTool {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(ContainerTool::Docker),
            "podman" => Ok(ContainerTool::Podman),
            other => Err(CatalogError::validation(format!(
                "unknown container tool '{}' (expected docker or podman)",
                other
            ))),
        }
    }
}

/// [`ImageEngine`] backed by the docker or podman CLI
#[derive(Debug, Clone)]
pub struct CliImageEngine {
    tool: ContainerTool,
    poll: Duration,
}

impl CliImageEngine {
    pub fn new(tool: ContainerTool) -> Self {
        Self {
            tool,
            poll: Duration::from_millis(100),
        }
    }

    pub fn tool(&self) -> ContainerTool {
        self.tool
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(self.tool.binary());
        cmd.args(args);
        cmd
    }

    /// Run to completion, killing the child if `cancel` fires
    fn run(&self, args: &[&str], cancel: &Cancellation) -> Result<()> {
        cancel.check(args.first().copied().unwrap_or("command"))?;
        debug!(tool = %self.tool, args = ?args, "running container engine");
        // stderr goes to a file so a chatty build cannot fill the pipe
        let mut stderr = tempfile::tempfile()?;
        let mut child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr.try_clone()?))
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        loop {
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    return Ok(());
                }
                return Err(CatalogError::Image(format!(
                    "{} {} exited with {}: {}",
                    self.tool,
                    args.join(" "),
                    status,
                    read_tail(&mut stderr)
                )));
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return cancel.check(&format!("{} {}", self.tool, args.join(" ")));
            }
            std::thread::sleep(self.poll);
        }
    }

    fn spawn_error(&self, err: std::io::Error) -> CatalogError {
        CatalogError::Image(format!("failed to start {}: {}", self.tool, err))
    }
}

fn read_tail(file: &mut File) -> String {
    let mut out = String::new();
    if file.seek(SeekFrom::Start(0)).is_ok() {
        let _ = file.read_to_string(&mut out);
    }
    let lines: Vec<&str> = out.trim().lines().collect();
    lines[lines.len().saturating_sub(20)..].join("\n")
}

impl ImageEngine for CliImageEngine {
    fn build(&self, context_dir: &Path, dockerfile: &Path, tag: &str, cancel: &Cancellation) -> Result<()> {
        let context = context_dir.to_string_lossy().into_owned();
        let file = dockerfile.to_string_lossy().into_owned();
        self.run(&["build", "-f", file.as_str(), "-t", tag, context.as_str()], cancel)
    }

    fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.run(&["tag", source, target], &Cancellation::new())
    }

    fn push(&self, tag: &str, cancel: &Cancellation) -> Result<()> {
        self.run(&["push", tag], cancel)
    }

    fn pull(&self, image: &str, cancel: &Cancellation) -> Result<()> {
        self.run(&["pull", image], cancel)
    }

    fn login(&self, registry: &str, credentials: &Credentials) -> Result<()> {
        use std::io::Write;

        let mut stderr = tempfile::tempfile()?;
        let mut child = self
            .command(&["login", registry, "-u", credentials.username.as_str(), "--password-stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr.try_clone()?))
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(credentials.password.as_bytes())?;
        }
        drop(child.stdin.take());
        let status = child.wait()?;
        if !status.success() {
            return Err(CatalogError::Image(format!(
                "{} login {} failed: {}",
                self.tool,
                registry,
                read_tail(&mut stderr)
            )));
        }
        Ok(())
    }

    fn save(&self, image: &str, archive: &Path, cancel: &Cancellation) -> Result<()> {
        let out = archive.to_string_lossy().into_owned();
        self.run(&["save", "-o", out.as_str(), image], cancel)
    }

    fn remove(&self, tag: &str) -> Result<()> {
        self.run(&["rmi", tag], &Cancellation::new())
    }
}
