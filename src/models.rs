use std::{collections::BTreeMap as Map, path::PathBuf};

use crate::fingerprint::DigestHasher;

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageName(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerName(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct JobName(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerId(pub String);

/// A `repository:tag` image reference.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ImageRef {
    pub repo: String,
    pub tag: String,
}

impl ImageRef {
    pub fn latest(repo: impl Into<String>) -> ImageRef {
        ImageRef {
            repo: repo.into(),
            tag: "latest".into(),
        }
    }

    /// Parses `repo[:tag]`, defaulting the tag to `latest`.
    pub fn parse(reference: &str) -> ImageRef {
        match reference.rfind(':') {
            // A colon inside a registry host port (`host:5000/img`) is not a tag.
            Some(index) if !reference[index..].contains('/') => ImageRef {
                repo: reference[..index].into(),
                tag: reference[index + 1..].into(),
            },
            _ => ImageRef::latest(reference),
        }
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.repo, self.tag)
    }
}

/// What an image is built from.
#[derive(Clone, Debug, Hash)]
pub enum BuildSource {
    /// A directory whose full recursive file contents form the build context.
    Directory(PathBuf),
    /// An inline build file plus auxiliary files, packed into a tar context.
    Inline {
        text: String,
        add_files: Vec<PathBuf>,
    },
}

#[derive(Clone, Debug)]
pub struct ImageSpec {
    pub name: ImageName,
    /// Fully qualified repository, `<base>/<image-name>`.
    pub repo: String,
    pub source: BuildSource,
    pub dep_image: Option<ImageName>,
    /// Extra task ids the build depends on.
    pub dep_other: Vec<String>,
    /// Survives `clean`; only `clobber` removes it.
    pub no_clean: bool,
}

/// One command of a post-start or one-time-job exec list.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ExecCommand {
    pub cmd: Vec<String>,
    /// Stream command output to the caller.
    pub show_output: bool,
    /// Restart the container after this command completes.
    pub restart_after: bool,
}

impl ExecCommand {
    pub fn new(cmd: Vec<String>) -> ExecCommand {
        ExecCommand {
            cmd,
            show_output: false,
            restart_after: false,
        }
    }
}

/// Create-time process flags. The engine defaults match an interactive
/// container kept attachable after creation.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CreateOptions {
    pub open_stdin: bool,
    pub tty: bool,
}

impl Default for CreateOptions {
    fn default() -> CreateOptions {
        CreateOptions {
            open_stdin: true,
            tty: true,
        }
    }
}

#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct StartOptions {
    pub volumes_from: Vec<ContainerName>,
    pub binds: Vec<String>,
    /// Raw `[host-ip:]host-port:container-port[/proto]` bindings.
    pub port_bindings: Vec<String>,
    pub publish_all: bool,
}

#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub name: ContainerName,
    /// Project-local name of the image this container runs; used to wire
    /// the build dependency.
    pub image_name: ImageName,
    pub image: ImageRef,
    /// The image is managed outside this project; no build edge is wired.
    pub image_nobuild: bool,
    pub command: Option<Vec<String>>,
    pub create: CreateOptions,
    pub exposed_ports: Vec<String>,
    pub start: StartOptions,
    /// Never restart once the engine reports a completed first run.
    pub start_once: bool,
    pub exec_on_start: Vec<ExecCommand>,
    /// Batch jobs that must complete before this container is created.
    pub dep_jobs: Vec<String>,
    pub allow_enter: bool,
    pub enter_dep_jobs: Vec<String>,
    pub no_clean: bool,
}

/// A named command batch run inside an already-running container at most
/// once, tracked by a marker file derived from the declaration hash.
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub name: JobName,
    pub container: ContainerName,
    pub exec_list: Vec<ExecCommand>,
    /// Other one-time jobs in the same container that must run first.
    pub dep_jobs: Vec<JobName>,
    /// Skip marker handling entirely; the job re-runs on every invocation.
    pub run_always: bool,
}

impl JobSpec {
    /// Content hash of the full job declaration, or `None` for jobs
    /// declared `run_always`.
    pub fn ident(&self) -> Option<String> {
        if self.run_always {
            return None;
        }
        let mut hasher = blake3::Hasher::new();
        hasher.input(&self.container);
        hasher.input(&self.exec_list);
        Some(hasher.finalize().to_hex().to_string())
    }

    /// Marker file touched inside the container once the job has completed.
    pub fn marker_path(&self) -> Option<String> {
        self.ident().map(|ident| format!("/.gantry-{}", ident))
    }
}

/// A fire-and-wait container run: executes `operation` to completion, then
/// either commits the filesystem as an image layer or expires the container.
#[derive(Clone, Debug)]
pub struct BatchSpec {
    pub name: String,
    pub image_name: ImageName,
    pub image: ImageRef,
    pub container_name: ContainerName,
    pub operation: String,
    pub volumes_from: Vec<ContainerName>,
    pub binds: Vec<String>,
    /// Stream combined output while waiting; otherwise wait silently.
    pub attach: bool,
    pub commit_changes: bool,
    pub dep_jobs: Vec<String>,
}

/// Everything a project file declares, after validation.
#[derive(Clone, Debug, Default)]
pub struct Project {
    pub repo_base: String,
    pub images: Vec<ImageSpec>,
    pub containers: Vec<ContainerSpec>,
    pub jobs: Vec<JobSpec>,
    pub batch_jobs: Vec<BatchSpec>,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Unknown,
}

/// The engine's "never started" sentinel, distinguished from any real
/// timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartedAt {
    Never,
    At(String),
}

/// Live container state as reported by the engine.
#[derive(Clone, Debug)]
pub struct Container {
    pub id: ContainerId,
    pub name: ContainerName,
    pub status: ContainerStatus,
    pub started_at: StartedAt,
    pub labels: Map<String, String>,
}

impl Container {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// True once the engine reports a real first-start timestamp.
    pub fn has_ever_started(&self) -> bool {
        self.started_at != StartedAt::Never
    }
}
