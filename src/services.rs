use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::models::{Container, ContainerId, ContainerName, Project};

/// Build context submitted to the engine: either a directory on disk or an
/// in-memory tar archive (inline build file plus auxiliary files).
#[derive(Clone, Debug)]
pub enum BuildContext {
    Directory(PathBuf),
    Tar(Vec<u8>),
}

/// Fully merged creation parameters. Modern engines bind host configuration
/// (volumes, ports) at creation, so the create call carries the whole set.
#[derive(Clone, Debug, Default)]
pub struct CreateContainerOptions {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub open_stdin: bool,
    pub tty: bool,
    pub exposed_ports: Vec<String>,
    pub volumes_from: Vec<String>,
    pub binds: Vec<String>,
    pub port_bindings: Vec<String>,
    pub publish_all: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ExecOptions {
    /// Stream command output to the caller; otherwise output is captured
    /// and only surfaced on failure.
    pub show_output: bool,
    /// Run as this user instead of the container default.
    pub user: Option<String>,
}

pub trait ProjectFrontend {
    fn project<P: AsRef<Path>>(&mut self, repo_base: &str, project_file_path: P)
        -> Result<Project>;
}

/// The container engine API this crate consumes but does not implement.
///
/// Queries distinguish found from not-found explicitly; absence of a
/// container is a valid state, not an error.
pub trait ContainerEngine {
    /// Every `repository:tag` pair in the engine's image catalog.
    fn list_image_tags(&mut self) -> Result<Vec<String>>;

    /// Builds a context and tags the result. Build log output is streamed
    /// to the engine adapter's observer as it arrives.
    fn build_image(&mut self, context: BuildContext, tag: &str) -> Result<()>;

    fn tag_image(&mut self, reference: &str, repo: &str, tag: &str) -> Result<()>;

    fn remove_image(&mut self, reference: &str) -> Result<()>;

    fn get_container(&mut self, name: &ContainerName) -> Result<Option<Container>>;

    fn create_container(&mut self, options: CreateContainerOptions) -> Result<ContainerId>;

    fn start_container(&mut self, name: &ContainerName) -> Result<()>;

    /// Graceful stop; no forced kill.
    fn stop_container(&mut self, name: &ContainerName) -> Result<()>;

    fn restart_container(&mut self, name: &ContainerName) -> Result<()>;

    /// Force-removes the container including anonymous volumes. A container
    /// that is already gone counts as success; removal races with external
    /// state changes.
    fn remove_container(&mut self, name: &ContainerName) -> Result<()>;

    /// Runs a command inside a running container, failing on a non-zero
    /// exit code.
    fn exec(&mut self, name: &ContainerName, command: &[String], options: &ExecOptions)
        -> Result<()>;

    /// Probes a path inside the container's filesystem.
    fn path_exists(&mut self, name: &ContainerName, path: &str) -> Result<bool>;

    fn commit_container(&mut self, name: &ContainerName, repo: &str, tag: &str) -> Result<()>;

    /// Blocks until the container exits and returns its exit code.
    fn wait_container(&mut self, name: &ContainerName) -> Result<i64>;

    /// Starts the container and streams combined output until the process
    /// inside exits; returns its exit code.
    fn run_attached(&mut self, name: &ContainerName) -> Result<i64>;

    /// Attaches the caller's terminal to a running container.
    fn attach(&mut self, name: &ContainerName) -> Result<()>;
}
