use anyhow::{Context, Result};
use log::{info, warn};
use std::{cell::RefCell, fs, path::PathBuf};

use crate::{
    fingerprint::{fingerprint, Fingerprint},
    graph::Task,
    inspect,
    models::{ContainerName, ContainerSpec, ExecCommand, ImageSpec, JobSpec},
    services::{BuildContext, ContainerEngine, CreateContainerOptions, ExecOptions},
};

/// Aggregate tasks (`clean`, `containers:stop`, ...) carry only
/// dependencies and never an action of their own.
pub struct NoopTask;

impl Task for NoopTask {
    fn is_needed(&self, _engine: &mut dyn ContainerEngine) -> Result<bool> {
        Ok(false)
    }

    fn execute(&self, _engine: &mut dyn ContainerEngine) -> Result<()> {
        Ok(())
    }
}

/// Builds an image when no tag equal to `repo:fingerprint` exists.
pub struct ImageBuildTask {
    spec: ImageSpec,
    // Memoised so the tag cannot change between the needed? check and the
    // build within one invocation.
    fingerprint: RefCell<Option<Fingerprint>>,
}

impl ImageBuildTask {
    pub fn new(spec: ImageSpec) -> ImageBuildTask {
        ImageBuildTask {
            spec,
            fingerprint: RefCell::new(None),
        }
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        if let Some(cached) = self.fingerprint.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let computed = fingerprint(&self.spec.source)
            .with_context(|| format!("failed to fingerprint source of image '{}'", self.spec.repo))?;
        *self.fingerprint.borrow_mut() = Some(computed.clone());
        Ok(computed)
    }

    fn build_reference(&self) -> Result<String> {
        Ok(format!("{}:{}", self.spec.repo, self.fingerprint()?))
    }
}

impl Task for ImageBuildTask {
    fn is_needed(&self, engine: &mut dyn ContainerEngine) -> Result<bool> {
        Ok(!inspect::image_exists(engine, &self.build_reference()?))
    }

    fn execute(&self, engine: &mut dyn ContainerEngine) -> Result<()> {
        let reference = self.build_reference()?;
        info!("image '{}' begin build", reference);

        let context = match &self.spec.source {
            crate::models::BuildSource::Directory(path) => BuildContext::Directory(path.clone()),
            crate::models::BuildSource::Inline { text, add_files } => {
                BuildContext::Tar(inline_context(text, add_files)?)
            }
        };

        engine
            .build_image(context, &reference)
            .with_context(|| format!("failed to build image '{}'", reference))?;
        engine
            .tag_image(&reference, &self.spec.repo, "latest")
            .with_context(|| format!("failed to tag image '{}' as latest", self.spec.repo))?;

        info!("image '{}' build complete", self.spec.repo);
        Ok(())
    }
}

/// Packs an inline build file plus auxiliary files into a tar context.
fn inline_context(text: &str, add_files: &[PathBuf]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(text.len() as u64);
    header.set_mode(0o640);
    header.set_cksum();
    builder.append_data(&mut header, "Dockerfile", text.as_bytes())?;

    for file in add_files {
        let data = fs::read(file)
            .with_context(|| format!("failed to read build context file {}", file.display()))?;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o640);
        header.set_cksum();
        builder.append_data(&mut header, file, data.as_slice())?;
    }

    Ok(builder.into_inner()?)
}

/// Removes every tag of an image repository. Individual deletions are best
/// effort; removal races with external changes.
pub struct ImageRemoveTask {
    repo: String,
}

impl ImageRemoveTask {
    pub fn new(repo: impl Into<String>) -> ImageRemoveTask {
        ImageRemoveTask { repo: repo.into() }
    }
}

impl Task for ImageRemoveTask {
    fn is_needed(&self, engine: &mut dyn ContainerEngine) -> Result<bool> {
        Ok(inspect::repo_exists(engine, &self.repo))
    }

    fn execute(&self, engine: &mut dyn ContainerEngine) -> Result<()> {
        let prefix = format!("{}:", self.repo);
        let tags = engine
            .list_image_tags()
            .with_context(|| format!("failed to list tags of image '{}'", self.repo))?;
        for tag in tags.iter().filter(|tag| tag.starts_with(&prefix)) {
            info!("removing image '{}'", tag);
            if let Err(err) = engine.remove_image(tag) {
                warn!("failed to remove image '{}': {:#}", tag, err);
            }
        }
        Ok(())
    }
}

pub struct ContainerCreateTask {
    spec: ContainerSpec,
}

impl ContainerCreateTask {
    pub fn new(spec: ContainerSpec) -> ContainerCreateTask {
        ContainerCreateTask { spec }
    }
}

impl Task for ContainerCreateTask {
    fn is_needed(&self, engine: &mut dyn ContainerEngine) -> Result<bool> {
        Ok(inspect::container_state(engine, &self.spec.name).is_none())
    }

    fn execute(&self, engine: &mut dyn ContainerEngine) -> Result<()> {
        let spec = &self.spec;
        let options = CreateContainerOptions {
            name: spec.name.0.clone(),
            image: spec.image.reference(),
            command: spec.command.clone(),
            open_stdin: spec.create.open_stdin,
            tty: spec.create.tty,
            exposed_ports: spec.exposed_ports.clone(),
            volumes_from: spec.start.volumes_from.iter().map(|v| v.0.clone()).collect(),
            binds: spec.start.binds.clone(),
            port_bindings: spec.start.port_bindings.clone(),
            publish_all: spec.start.publish_all,
        };

        let id = engine
            .create_container(options)
            .with_context(|| format!("failed to create container '{}'", spec.name.0))?;
        info!("created container '{}' ({})", spec.name.0, id.0);
        Ok(())
    }
}

/// Starts a container unless it is already running, or it is declared
/// `start_once` and the engine reports a completed earlier run. A container
/// that was never started always gets its first run regardless of the flag.
pub struct ContainerStartTask {
    spec: ContainerSpec,
}

impl ContainerStartTask {
    pub fn new(spec: ContainerSpec) -> ContainerStartTask {
        ContainerStartTask { spec }
    }
}

impl Task for ContainerStartTask {
    fn is_needed(&self, engine: &mut dyn ContainerEngine) -> Result<bool> {
        let needed = match inspect::container_state(engine, &self.spec.name) {
            None => true,
            Some(state) => {
                if state.is_running() {
                    false
                } else {
                    !(self.spec.start_once && state.has_ever_started())
                }
            }
        };
        Ok(needed)
    }

    fn execute(&self, engine: &mut dyn ContainerEngine) -> Result<()> {
        start_with_execs(engine, &self.spec)
    }
}

/// First-run-only variant: the dependency target for volumes-from edges.
/// A stopped container that has run before is left alone, so dependents can
/// require "has started at least once" without restarting it.
pub struct ContainerStartOnceTask {
    spec: ContainerSpec,
}

impl ContainerStartOnceTask {
    pub fn new(spec: ContainerSpec) -> ContainerStartOnceTask {
        ContainerStartOnceTask { spec }
    }
}

impl Task for ContainerStartOnceTask {
    fn is_needed(&self, engine: &mut dyn ContainerEngine) -> Result<bool> {
        let needed = match inspect::container_state(engine, &self.spec.name) {
            None => true,
            Some(state) => !state.is_running() && !state.has_ever_started(),
        };
        Ok(needed)
    }

    fn execute(&self, engine: &mut dyn ContainerEngine) -> Result<()> {
        start_with_execs(engine, &self.spec)
    }
}

fn start_with_execs(engine: &mut dyn ContainerEngine, spec: &ContainerSpec) -> Result<()> {
    info!("starting container '{}'", spec.name.0);
    engine
        .start_container(&spec.name)
        .with_context(|| format!("failed to start container '{}'", spec.name.0))?;
    run_exec_list(engine, &spec.name, &spec.exec_on_start)
        .with_context(|| format!("post-start commands failed for container '{}'", spec.name.0))
}

/// Runs an ordered command list inside a running container, honoring each
/// command's output-visibility and restart-after flags. The first failure
/// aborts the remainder.
pub(crate) fn run_exec_list(
    engine: &mut dyn ContainerEngine,
    name: &ContainerName,
    list: &[ExecCommand],
) -> Result<()> {
    for command in list {
        let options = ExecOptions {
            show_output: command.show_output,
            user: None,
        };
        engine
            .exec(name, &command.cmd, &options)
            .with_context(|| format!("command {:?} failed in container '{}'", command.cmd, name.0))?;
        if command.restart_after {
            engine
                .restart_container(name)
                .with_context(|| format!("failed to restart container '{}'", name.0))?;
        }
    }
    Ok(())
}

pub struct ContainerStopTask {
    name: ContainerName,
}

impl ContainerStopTask {
    pub fn new(name: ContainerName) -> ContainerStopTask {
        ContainerStopTask { name }
    }
}

impl Task for ContainerStopTask {
    fn is_needed(&self, engine: &mut dyn ContainerEngine) -> Result<bool> {
        Ok(inspect::container_state(engine, &self.name)
            .map(|state| state.is_running())
            .unwrap_or(false))
    }

    fn execute(&self, engine: &mut dyn ContainerEngine) -> Result<()> {
        info!("stopping container '{}'", self.name.0);
        engine
            .stop_container(&self.name)
            .with_context(|| format!("failed to stop container '{}'", self.name.0))
    }
}

pub struct ContainerRemoveTask {
    name: ContainerName,
}

impl ContainerRemoveTask {
    pub fn new(name: ContainerName) -> ContainerRemoveTask {
        ContainerRemoveTask { name }
    }
}

impl Task for ContainerRemoveTask {
    fn is_needed(&self, engine: &mut dyn ContainerEngine) -> Result<bool> {
        Ok(inspect::container_state(engine, &self.name).is_some())
    }

    fn execute(&self, engine: &mut dyn ContainerEngine) -> Result<()> {
        info!("removing container '{}'", self.name.0);
        engine
            .remove_container(&self.name)
            .with_context(|| format!("failed to remove container '{}'", self.name.0))
    }
}

/// Attaches the caller's terminal to a started container.
pub struct ContainerEnterTask {
    name: ContainerName,
}

impl ContainerEnterTask {
    pub fn new(name: ContainerName) -> ContainerEnterTask {
        ContainerEnterTask { name }
    }
}

impl Task for ContainerEnterTask {
    fn is_needed(&self, _engine: &mut dyn ContainerEngine) -> Result<bool> {
        Ok(true)
    }

    fn execute(&self, engine: &mut dyn ContainerEngine) -> Result<()> {
        info!("entering container '{}'", self.name.0);
        engine
            .attach(&self.name)
            .with_context(|| format!("failed to attach to container '{}'", self.name.0))
    }
}

/// Runs a one-time job's command list inside its container, then writes the
/// marker file that suppresses re-runs. A job without an ident hash is
/// always needed.
pub struct JobExecTask {
    spec: JobSpec,
}

impl JobExecTask {
    pub fn new(spec: JobSpec) -> JobExecTask {
        JobExecTask { spec }
    }
}

impl Task for JobExecTask {
    fn is_needed(&self, engine: &mut dyn ContainerEngine) -> Result<bool> {
        let needed = match self.spec.marker_path() {
            None => true,
            Some(marker) => !inspect::job_marker_present(engine, &self.spec.container, &marker),
        };
        Ok(needed)
    }

    fn execute(&self, engine: &mut dyn ContainerEngine) -> Result<()> {
        let spec = &self.spec;
        info!(
            "running job '{}' in container '{}'",
            spec.name.0, spec.container.0
        );
        run_exec_list(engine, &spec.container, &spec.exec_list).with_context(|| {
            format!(
                "one-time job '{}' failed in container '{}'",
                spec.name.0, spec.container.0
            )
        })?;

        // The marker is written last; any command failure above leaves it
        // absent so the whole job re-runs next time.
        if let Some(marker) = spec.marker_path() {
            let touch = vec!["touch".to_string(), marker.clone()];
            let options = ExecOptions {
                show_output: false,
                user: Some("root".into()),
            };
            engine
                .exec(&spec.container, &touch, &options)
                .with_context(|| {
                    format!("failed to write marker '{}' for job '{}'", marker, spec.name.0)
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MockEngine;
    use crate::models::{
        BuildSource, Container, ContainerId, ContainerStatus, CreateOptions, ImageName, ImageRef,
        JobName, StartOptions, StartedAt,
    };
    use std::collections::BTreeMap as Map;
    use std::io::Read;

    fn image_spec(repo: &str, source: BuildSource) -> ImageSpec {
        ImageSpec {
            name: ImageName("web".into()),
            repo: repo.into(),
            source,
            dep_image: None,
            dep_other: Vec::new(),
            no_clean: false,
        }
    }

    fn container_spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: ContainerName(name.into()),
            image_name: ImageName(name.into()),
            image: ImageRef::latest(format!("gantry/{}", name)),
            image_nobuild: false,
            command: None,
            create: CreateOptions::default(),
            exposed_ports: Vec::new(),
            start: StartOptions::default(),
            start_once: false,
            exec_on_start: Vec::new(),
            dep_jobs: Vec::new(),
            allow_enter: false,
            enter_dep_jobs: Vec::new(),
            no_clean: false,
        }
    }

    fn job_spec(name: &str, container: &str, run_always: bool) -> JobSpec {
        JobSpec {
            name: JobName(name.into()),
            container: ContainerName(container.into()),
            exec_list: vec![ExecCommand::new(vec!["echo".into(), "hi".into()])],
            dep_jobs: Vec::new(),
            run_always,
        }
    }

    fn stopped_container(name: &str, started_at: StartedAt) -> Container {
        Container {
            id: ContainerId(format!("id-{}", name)),
            name: ContainerName(name.into()),
            status: ContainerStatus::Exited,
            started_at,
            labels: Map::new(),
        }
    }

    #[test]
    fn image_build_predicate_flips_after_build() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::write(dir.path().join("b.txt"), "y").unwrap();

        let task = ImageBuildTask::new(image_spec(
            "gantry/web",
            BuildSource::Directory(dir.path().to_path_buf()),
        ));
        let mut engine = MockEngine::new();

        assert!(task.is_needed(&mut engine).unwrap());
        task.execute(&mut engine).unwrap();
        assert!(!task.is_needed(&mut engine).unwrap());

        // The build tagged both repo:fingerprint and repo:latest.
        assert!(inspect::image_exists(&mut engine, "gantry/web:latest"));
        assert_eq!(engine.build_count(), 1);
    }

    #[test]
    fn image_build_fails_fast_on_missing_source() {
        let task = ImageBuildTask::new(image_spec(
            "gantry/web",
            BuildSource::Directory("/nonexistent/gantry-src".into()),
        ));
        let mut engine = MockEngine::new();
        assert!(task.is_needed(&mut engine).is_err());
    }

    #[test]
    fn inline_context_packs_build_file_and_auxiliaries() {
        let dir = tempfile::tempdir().unwrap();
        let aux = dir.path().join("setup.sh");
        std::fs::write(&aux, "echo hi").unwrap();

        let bytes = inline_context("FROM busybox", &[aux.clone()]).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut names = Vec::new();
        let mut dockerfile = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            if path == "Dockerfile" {
                entry.read_to_string(&mut dockerfile).unwrap();
            }
            names.push(path);
        }
        assert!(names.contains(&"Dockerfile".to_string()));
        assert_eq!(names.len(), 2);
        assert_eq!(dockerfile, "FROM busybox");
    }

    #[test]
    fn image_remove_only_needed_while_tags_exist() {
        let mut engine = MockEngine::new();
        engine.add_image_tag("gantry/web:latest");
        engine.add_image_tag("gantry/web:abc123");
        engine.add_image_tag("gantry/other:latest");

        let task = ImageRemoveTask::new("gantry/web");
        assert!(task.is_needed(&mut engine).unwrap());
        task.execute(&mut engine).unwrap();
        assert!(!task.is_needed(&mut engine).unwrap());
        assert!(inspect::image_exists(&mut engine, "gantry/other:latest"));
    }

    #[test]
    fn create_and_start_are_idempotent() {
        let mut engine = MockEngine::new();
        let spec = container_spec("db");
        let create = ContainerCreateTask::new(spec.clone());
        let start = ContainerStartTask::new(spec);

        // Absent: create needed.
        assert!(create.is_needed(&mut engine).unwrap());
        create.execute(&mut engine).unwrap();

        // Created but not running: create done, start needed.
        assert!(!create.is_needed(&mut engine).unwrap());
        assert!(start.is_needed(&mut engine).unwrap());
        start.execute(&mut engine).unwrap();

        // Running: neither is needed.
        assert!(!create.is_needed(&mut engine).unwrap());
        assert!(!start.is_needed(&mut engine).unwrap());
        assert_eq!(engine.create_count(), 1);
        assert_eq!(engine.start_count(), 1);
    }

    #[test]
    fn stopped_container_restarts_unless_start_once() {
        let mut engine = MockEngine::new();
        engine.insert_container(stopped_container(
            "db",
            StartedAt::At("2020-01-01T00:00:00Z".into()),
        ));

        let mut spec = container_spec("db");
        let plain = ContainerStartTask::new(spec.clone());
        assert!(plain.is_needed(&mut engine).unwrap());

        spec.start_once = true;
        let once = ContainerStartTask::new(spec);
        assert!(!once.is_needed(&mut engine).unwrap());
    }

    #[test]
    fn start_once_container_still_gets_its_first_run() {
        let mut engine = MockEngine::new();
        let mut spec = container_spec("db");
        spec.start_once = true;

        // Absent container: first run always happens.
        let start = ContainerStartTask::new(spec.clone());
        assert!(start.is_needed(&mut engine).unwrap());

        // Created but never started: still the first run.
        engine.insert_container(stopped_container("db", StartedAt::Never));
        assert!(start.is_needed(&mut engine).unwrap());
    }

    #[test]
    fn start_once_task_gates_on_first_run() {
        let mut engine = MockEngine::new();
        let spec = container_spec("data");
        let once = ContainerStartOnceTask::new(spec);

        assert!(once.is_needed(&mut engine).unwrap());

        engine.insert_container(stopped_container("data", StartedAt::Never));
        assert!(once.is_needed(&mut engine).unwrap());

        engine.insert_container(stopped_container(
            "data",
            StartedAt::At("2020-01-01T00:00:00Z".into()),
        ));
        assert!(!once.is_needed(&mut engine).unwrap());
    }

    #[test]
    fn stop_needed_only_while_running() {
        let mut engine = MockEngine::new();
        let stop = ContainerStopTask::new(ContainerName("db".into()));

        assert!(!stop.is_needed(&mut engine).unwrap());

        let create = ContainerCreateTask::new(container_spec("db"));
        create.execute(&mut engine).unwrap();
        assert!(!stop.is_needed(&mut engine).unwrap());

        engine.start_container(&ContainerName("db".into())).unwrap();
        assert!(stop.is_needed(&mut engine).unwrap());

        stop.execute(&mut engine).unwrap();
        assert!(!stop.is_needed(&mut engine).unwrap());
    }

    #[test]
    fn remove_needed_only_while_present() {
        let mut engine = MockEngine::new();
        let remove = ContainerRemoveTask::new(ContainerName("db".into()));
        assert!(!remove.is_needed(&mut engine).unwrap());

        ContainerCreateTask::new(container_spec("db"))
            .execute(&mut engine)
            .unwrap();
        assert!(remove.is_needed(&mut engine).unwrap());
        remove.execute(&mut engine).unwrap();
        assert!(!remove.is_needed(&mut engine).unwrap());
    }

    #[test]
    fn post_start_commands_run_in_order_and_honor_restart() {
        let mut engine = MockEngine::new();
        let mut spec = container_spec("db");
        spec.exec_on_start = vec![
            ExecCommand {
                cmd: vec!["first".into()],
                show_output: true,
                restart_after: false,
            },
            ExecCommand {
                cmd: vec!["second".into()],
                show_output: false,
                restart_after: true,
            },
        ];

        ContainerCreateTask::new(spec.clone())
            .execute(&mut engine)
            .unwrap();
        ContainerStartTask::new(spec).execute(&mut engine).unwrap();

        let log = engine.exec_log();
        assert_eq!(log, vec![vec!["first".to_string()], vec!["second".to_string()]]);
        assert_eq!(engine.restart_count(), 1);
    }

    #[test]
    fn enter_is_always_needed() {
        let mut engine = MockEngine::new();
        ContainerCreateTask::new(container_spec("dev"))
            .execute(&mut engine)
            .unwrap();
        engine.start_container(&ContainerName("dev".into())).unwrap();

        let enter = ContainerEnterTask::new(ContainerName("dev".into()));
        assert!(enter.is_needed(&mut engine).unwrap());
        enter.execute(&mut engine).unwrap();
        assert!(enter.is_needed(&mut engine).unwrap());
        assert_eq!(engine.attach_count(), 1);
    }

    #[test]
    fn job_with_marker_present_executes_nothing() {
        let mut engine = MockEngine::new();
        let spec = job_spec("seed", "db", false);
        ContainerCreateTask::new(container_spec("db"))
            .execute(&mut engine)
            .unwrap();
        engine.start_container(&ContainerName("db".into())).unwrap();
        engine.insert_file(&ContainerName("db".into()), &spec.marker_path().unwrap());

        let task = JobExecTask::new(spec);
        assert!(!task.is_needed(&mut engine).unwrap());
        assert!(engine.exec_log().is_empty());
    }

    #[test]
    fn job_writes_marker_after_success() {
        let mut engine = MockEngine::new();
        ContainerCreateTask::new(container_spec("db"))
            .execute(&mut engine)
            .unwrap();
        engine.start_container(&ContainerName("db".into())).unwrap();

        let spec = job_spec("seed", "db", false);
        let marker = spec.marker_path().unwrap();
        let task = JobExecTask::new(spec);

        assert!(task.is_needed(&mut engine).unwrap());
        task.execute(&mut engine).unwrap();

        assert!(engine.has_file(&ContainerName("db".into()), &marker));
        assert!(!task.is_needed(&mut engine).unwrap());
    }

    #[test]
    fn run_always_job_repeats_every_invocation() {
        let mut engine = MockEngine::new();
        ContainerCreateTask::new(container_spec("db"))
            .execute(&mut engine)
            .unwrap();
        engine.start_container(&ContainerName("db".into())).unwrap();

        let task = JobExecTask::new(job_spec("refresh", "db", true));
        for _ in 0..3 {
            assert!(task.is_needed(&mut engine).unwrap());
            task.execute(&mut engine).unwrap();
        }
        assert_eq!(engine.exec_log().len(), 3);
    }

    #[test]
    fn failed_job_command_leaves_marker_absent() {
        let mut engine = MockEngine::new();
        ContainerCreateTask::new(container_spec("db"))
            .execute(&mut engine)
            .unwrap();
        engine.start_container(&ContainerName("db".into())).unwrap();
        engine.fail_exec_containing("boom");

        let mut spec = job_spec("seed", "db", false);
        spec.exec_list = vec![
            ExecCommand::new(vec!["boom".into()]),
            ExecCommand::new(vec!["after".into()]),
        ];
        let marker = spec.marker_path().unwrap();
        let task = JobExecTask::new(spec);

        let err = task.execute(&mut engine).unwrap_err();
        assert!(err.to_string().contains("seed"));

        // The failing command aborted the list and the marker stayed absent.
        assert!(!engine.has_file(&ContainerName("db".into()), &marker));
        assert!(engine.exec_log().iter().all(|cmd| cmd != &vec!["after".to_string()]));
        assert!(task.is_needed(&mut engine).unwrap());
    }
}
