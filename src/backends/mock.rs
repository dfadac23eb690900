use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::models::{
    Container, ContainerId, ContainerName, ContainerStatus, StartedAt,
};
use crate::services::{BuildContext, ContainerEngine, CreateContainerOptions, ExecOptions};

const MOCK_STARTED_AT: &str = "2020-01-01T00:00:00Z";

/// In-memory engine used by tests: tracks the image catalog, container
/// states, in-container files, and every mutating call.
#[derive(Default)]
pub struct MockEngine {
    image_tags: Set<String>,
    containers: Map<ContainerName, Container>,
    files: Map<ContainerName, Set<String>>,
    exec_log: Vec<Vec<String>>,
    create_log: Vec<CreateContainerOptions>,
    fail_exec_needle: Option<String>,
    fail_queries: bool,
    wait_exit_code: i64,
    build_count: usize,
    create_count: usize,
    start_count: usize,
    restart_count: usize,
    attach_count: usize,
    next_id: usize,
}

impl MockEngine {
    pub fn new() -> MockEngine {
        MockEngine::default()
    }

    pub fn add_image_tag(&mut self, tag: &str) {
        self.image_tags.insert(tag.into());
    }

    pub fn insert_container(&mut self, container: Container) {
        self.containers.insert(container.name.clone(), container);
    }

    pub fn insert_file(&mut self, name: &ContainerName, path: &str) {
        self.files.entry(name.clone()).or_default().insert(path.into());
    }

    pub fn has_file(&self, name: &ContainerName, path: &str) -> bool {
        self.files
            .get(name)
            .map(|files| files.contains(path))
            .unwrap_or(false)
    }

    /// Makes any exec whose arguments contain `needle` fail.
    pub fn fail_exec_containing(&mut self, needle: &str) {
        self.fail_exec_needle = Some(needle.into());
    }

    /// Makes read-only state queries fail, simulating an unreachable
    /// engine.
    pub fn fail_state_queries(&mut self) {
        self.fail_queries = true;
    }

    pub fn set_wait_exit_code(&mut self, code: i64) {
        self.wait_exit_code = code;
    }

    pub fn exec_log(&self) -> Vec<Vec<String>> {
        self.exec_log.clone()
    }

    pub fn create_log(&self) -> Vec<CreateContainerOptions> {
        self.create_log.clone()
    }

    pub fn build_count(&self) -> usize {
        self.build_count
    }

    pub fn create_count(&self) -> usize {
        self.create_count
    }

    pub fn start_count(&self) -> usize {
        self.start_count
    }

    pub fn restart_count(&self) -> usize {
        self.restart_count
    }

    pub fn attach_count(&self) -> usize {
        self.attach_count
    }

    pub fn container_status(&self, name: &ContainerName) -> Option<ContainerStatus> {
        self.containers.get(name).map(|c| c.status)
    }

    fn container_mut(&mut self, name: &ContainerName) -> Result<&mut Container> {
        self.containers
            .get_mut(name)
            .ok_or_else(|| anyhow!("no such container: {}", name.0))
    }
}

impl ContainerEngine for MockEngine {
    fn list_image_tags(&mut self) -> Result<Vec<String>> {
        if self.fail_queries {
            bail!("mock engine unreachable");
        }
        Ok(self.image_tags.iter().cloned().collect())
    }

    fn build_image(&mut self, _context: BuildContext, tag: &str) -> Result<()> {
        self.build_count += 1;
        self.image_tags.insert(tag.into());
        Ok(())
    }

    fn tag_image(&mut self, reference: &str, repo: &str, tag: &str) -> Result<()> {
        if !self.image_tags.contains(reference) {
            bail!("no such image: {}", reference);
        }
        self.image_tags.insert(format!("{}:{}", repo, tag));
        Ok(())
    }

    fn remove_image(&mut self, reference: &str) -> Result<()> {
        self.image_tags.remove(reference);
        Ok(())
    }

    fn get_container(&mut self, name: &ContainerName) -> Result<Option<Container>> {
        if self.fail_queries {
            bail!("mock engine unreachable");
        }
        Ok(self.containers.get(name).cloned())
    }

    fn create_container(&mut self, options: CreateContainerOptions) -> Result<ContainerId> {
        let name = ContainerName(options.name.clone());
        if self.containers.contains_key(&name) {
            bail!("container name already in use: {}", options.name);
        }
        self.create_count += 1;
        self.create_log.push(options.clone());
        self.next_id += 1;
        let id = ContainerId(format!("mock-{}", self.next_id));
        self.containers.insert(
            name.clone(),
            Container {
                id: id.clone(),
                name,
                status: ContainerStatus::Created,
                started_at: StartedAt::Never,
                labels: Map::new(),
            },
        );
        Ok(id)
    }

    fn start_container(&mut self, name: &ContainerName) -> Result<()> {
        self.start_count += 1;
        let container = self.container_mut(name)?;
        container.status = ContainerStatus::Running;
        container.started_at = StartedAt::At(MOCK_STARTED_AT.into());
        Ok(())
    }

    fn stop_container(&mut self, name: &ContainerName) -> Result<()> {
        let container = self.container_mut(name)?;
        container.status = ContainerStatus::Exited;
        Ok(())
    }

    fn restart_container(&mut self, name: &ContainerName) -> Result<()> {
        self.restart_count += 1;
        let container = self.container_mut(name)?;
        container.status = ContainerStatus::Running;
        container.started_at = StartedAt::At(MOCK_STARTED_AT.into());
        Ok(())
    }

    fn remove_container(&mut self, name: &ContainerName) -> Result<()> {
        // An already-gone container counts as success, as with the real
        // engine adapter.
        self.containers.remove(name);
        self.files.remove(name);
        Ok(())
    }

    fn exec(
        &mut self,
        name: &ContainerName,
        command: &[String],
        _options: &ExecOptions,
    ) -> Result<()> {
        let container = self.container_mut(name)?;
        if container.status != ContainerStatus::Running {
            bail!("container not running: {}", name.0);
        }
        if let Some(needle) = &self.fail_exec_needle {
            if command.iter().any(|arg| arg.contains(needle.as_str())) {
                bail!("exec failed: {:?}", command);
            }
        }
        self.exec_log.push(command.to_vec());
        if command.len() == 2 && command[0] == "touch" {
            let path = command[1].clone();
            self.files.entry(name.clone()).or_default().insert(path);
        }
        Ok(())
    }

    fn path_exists(&mut self, name: &ContainerName, path: &str) -> Result<bool> {
        if self.fail_queries {
            bail!("mock engine unreachable");
        }
        if !self.containers.contains_key(name) {
            bail!("no such container: {}", name.0);
        }
        Ok(self.has_file(name, path))
    }

    fn commit_container(&mut self, name: &ContainerName, repo: &str, tag: &str) -> Result<()> {
        if !self.containers.contains_key(name) {
            bail!("no such container: {}", name.0);
        }
        self.image_tags.insert(format!("{}:{}", repo, tag));
        Ok(())
    }

    fn wait_container(&mut self, name: &ContainerName) -> Result<i64> {
        let code = self.wait_exit_code;
        let container = self.container_mut(name)?;
        container.status = ContainerStatus::Exited;
        Ok(code)
    }

    fn run_attached(&mut self, name: &ContainerName) -> Result<i64> {
        self.start_count += 1;
        let code = self.wait_exit_code;
        let container = self.container_mut(name)?;
        container.started_at = StartedAt::At(MOCK_STARTED_AT.into());
        container.status = ContainerStatus::Exited;
        Ok(code)
    }

    fn attach(&mut self, name: &ContainerName) -> Result<()> {
        self.attach_count += 1;
        if !self.containers.contains_key(name) {
            bail!("no such container: {}", name.0);
        }
        Ok(())
    }
}
