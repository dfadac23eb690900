use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use number_prefix::NumberPrefix;
use serde::Deserialize;
use std::{
    collections::BTreeMap as Map,
    io::Write,
    process::{Command, Stdio},
};

use crate::models::{Container, ContainerId, ContainerName, ContainerStatus, StartedAt};
use crate::services::{BuildContext, ContainerEngine, CreateContainerOptions, ExecOptions};

/// The engine reports this start timestamp for a container that has never
/// run since creation.
const NEVER_STARTED_AT: &str = "0001-01-01T00:00:00Z";

/// `ContainerEngine` adapter over a local Docker engine, driven through the
/// `docker` client binary. Build and run output streams straight through to
/// the caller's terminal.
pub struct DockerCliEngine {
    binary: String,
}

impl DockerCliEngine {
    pub fn new() -> DockerCliEngine {
        DockerCliEngine::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<String>) -> DockerCliEngine {
        DockerCliEngine {
            binary: binary.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(args);
        debug!("engine call: {} {}", self.binary, args.join(" "));
        command
    }

    /// Runs a client command with captured output; a non-zero exit becomes
    /// an error carrying the engine's stderr.
    fn run_captured(&self, args: &[&str]) -> Result<String> {
        let output = self
            .command(args)
            .output()
            .with_context(|| format!("failed to run {}", self.binary))?;
        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                self.binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs a client command with output streamed to the terminal.
    fn run_streamed(&self, args: &[&str]) -> Result<()> {
        let status = self
            .command(args)
            .status()
            .with_context(|| format!("failed to run {}", self.binary))?;
        if !status.success() {
            bail!("{} {} failed", self.binary, args.join(" "));
        }
        Ok(())
    }
}

impl ContainerEngine for DockerCliEngine {
    fn list_image_tags(&mut self) -> Result<Vec<String>> {
        let stdout = self.run_captured(&[
            "image",
            "ls",
            "--all",
            "--format",
            "{{.Repository}}:{{.Tag}}",
        ])?;
        Ok(stdout
            .lines()
            .filter(|line| !line.contains("<none>"))
            .map(|line| line.to_string())
            .collect())
    }

    fn build_image(&mut self, context: BuildContext, tag: &str) -> Result<()> {
        match context {
            BuildContext::Directory(path) => {
                let path = path
                    .to_str()
                    .ok_or_else(|| anyhow!("build context path is not valid utf-8"))?
                    .to_string();
                self.run_streamed(&["build", "--force-rm", "--tag", tag, &path])
            }
            BuildContext::Tar(bytes) => {
                match NumberPrefix::binary(bytes.len() as f32) {
                    NumberPrefix::Standalone(size) => {
                        println!("Submitting build context ({} bytes)", size)
                    }
                    NumberPrefix::Prefixed(prefix, n) => {
                        println!("Submitting build context ({:.1} {}B)", n, prefix)
                    }
                };

                let mut child = self
                    .command(&["build", "--force-rm", "--tag", tag, "-"])
                    .stdin(Stdio::piped())
                    .spawn()
                    .with_context(|| format!("failed to run {}", self.binary))?;
                child
                    .stdin
                    .as_mut()
                    .ok_or_else(|| anyhow!("build stdin not piped"))?
                    .write_all(&bytes)?;
                let status = child.wait()?;
                if !status.success() {
                    bail!("build of '{}' failed", tag);
                }
                Ok(())
            }
        }
    }

    fn tag_image(&mut self, reference: &str, repo: &str, tag: &str) -> Result<()> {
        let target = format!("{}:{}", repo, tag);
        self.run_captured(&["tag", reference, &target])?;
        Ok(())
    }

    fn remove_image(&mut self, reference: &str) -> Result<()> {
        match self.run_captured(&["rmi", "--force", reference]) {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn get_container(&mut self, name: &ContainerName) -> Result<Option<Container>> {
        match self.run_captured(&["container", "inspect", &name.0]) {
            Ok(stdout) => {
                let mut containers = containers_from_inspect(&stdout)?;
                Ok(containers.pop())
            }
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn create_container(&mut self, options: CreateContainerOptions) -> Result<ContainerId> {
        let mut args: Vec<String> = vec!["create".into(), "--name".into(), options.name.clone()];
        if options.open_stdin {
            args.push("--interactive".into());
        }
        if options.tty {
            args.push("--tty".into());
        }
        for port in &options.exposed_ports {
            args.push("--expose".into());
            args.push(port.clone());
        }
        for binding in &options.port_bindings {
            args.push("--publish".into());
            args.push(binding.clone());
        }
        if options.publish_all {
            args.push("--publish-all".into());
        }
        for container in &options.volumes_from {
            args.push("--volumes-from".into());
            args.push(container.clone());
        }
        for bind in &options.binds {
            args.push("--volume".into());
            args.push(bind.clone());
        }
        args.push(options.image.clone());
        if let Some(command) = &options.command {
            args.extend(command.iter().cloned());
        }

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let stdout = self.run_captured(&arg_refs)?;
        Ok(ContainerId(stdout.trim().to_string()))
    }

    fn start_container(&mut self, name: &ContainerName) -> Result<()> {
        self.run_captured(&["start", &name.0])?;
        Ok(())
    }

    fn stop_container(&mut self, name: &ContainerName) -> Result<()> {
        self.run_captured(&["stop", &name.0])?;
        Ok(())
    }

    fn restart_container(&mut self, name: &ContainerName) -> Result<()> {
        self.run_captured(&["restart", &name.0])?;
        Ok(())
    }

    fn remove_container(&mut self, name: &ContainerName) -> Result<()> {
        match self.run_captured(&["rm", "--force", "--volumes", &name.0]) {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn exec(
        &mut self,
        name: &ContainerName,
        command: &[String],
        options: &ExecOptions,
    ) -> Result<()> {
        let mut args: Vec<String> = vec!["exec".into()];
        if let Some(user) = &options.user {
            args.push("--user".into());
            args.push(user.clone());
        }
        args.push(name.0.clone());
        args.extend(command.iter().cloned());
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

        if options.show_output {
            self.run_streamed(&arg_refs)
        } else {
            let stdout = self.run_captured(&arg_refs)?;
            debug!("exec output: {}", stdout.trim());
            Ok(())
        }
    }

    fn path_exists(&mut self, name: &ContainerName, path: &str) -> Result<bool> {
        let source = format!("{}:{}", name.0, path);
        let output = self
            .command(&["cp", &source, "-"])
            .stdout(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {}", self.binary))?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such") || stderr.contains("not find") {
            Ok(false)
        } else {
            bail!("path probe for '{}' failed: {}", source, stderr.trim());
        }
    }

    fn commit_container(&mut self, name: &ContainerName, repo: &str, tag: &str) -> Result<()> {
        let reference = format!("{}:{}", repo, tag);
        self.run_captured(&["commit", &name.0, &reference])?;
        Ok(())
    }

    fn wait_container(&mut self, name: &ContainerName) -> Result<i64> {
        let stdout = self.run_captured(&["wait", &name.0])?;
        stdout
            .trim()
            .parse()
            .with_context(|| format!("unexpected wait output: {:?}", stdout))
    }

    fn run_attached(&mut self, name: &ContainerName) -> Result<i64> {
        let status = self
            .command(&["start", "--attach", &name.0])
            .status()
            .with_context(|| format!("failed to run {}", self.binary))?;
        Ok(i64::from(status.code().unwrap_or(-1)))
    }

    fn attach(&mut self, name: &ContainerName) -> Result<()> {
        self.run_streamed(&["attach", &name.0])
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    let message = err.to_string().to_lowercase();
    message.contains("no such") || message.contains("not found")
}

#[derive(Debug, Deserialize)]
struct InspectContainer {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config", default)]
    config: InspectConfig,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "StartedAt")]
    started_at: String,
}

#[derive(Debug, Default, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<Map<String, String>>,
}

/// Maps raw inspect output into typed container state.
fn containers_from_inspect(json: &str) -> Result<Vec<Container>> {
    let inspected: Vec<InspectContainer> =
        serde_json::from_str(json).context("failed to parse container inspect output")?;

    Ok(inspected
        .into_iter()
        .map(|raw| {
            let status = match raw.state.status.as_str() {
                "created" => ContainerStatus::Created,
                "running" => ContainerStatus::Running,
                "exited" => ContainerStatus::Exited,
                status => {
                    warn!("unknown container status: {:?}", status);
                    ContainerStatus::Unknown
                }
            };
            let started_at = if raw.state.started_at.starts_with(&NEVER_STARTED_AT[..10]) {
                StartedAt::Never
            } else {
                StartedAt::At(raw.state.started_at)
            };
            Container {
                id: ContainerId(raw.id),
                name: ContainerName(raw.name.trim_start_matches('/').to_string()),
                status,
                started_at,
                labels: raw.config.labels.unwrap_or_default(),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspect_json(status: &str, started_at: &str) -> String {
        format!(
            r#"[{{
                "Id": "f2e8a1",
                "Name": "/db",
                "State": {{
                    "Status": "{}",
                    "Running": {},
                    "StartedAt": "{}"
                }},
                "Config": {{
                    "Labels": {{"io.gantry.project": "demo"}}
                }}
            }}]"#,
            status,
            status == "running",
            started_at
        )
    }

    #[test]
    fn inspect_parses_running_container() {
        let containers =
            containers_from_inspect(&inspect_json("running", "2024-05-01T10:00:00.0Z")).unwrap();
        assert_eq!(containers.len(), 1);
        let container = &containers[0];
        assert_eq!(container.name.0, "db");
        assert_eq!(container.status, ContainerStatus::Running);
        assert!(container.is_running());
        assert!(container.has_ever_started());
        assert_eq!(container.labels.get("io.gantry.project").unwrap(), "demo");
    }

    #[test]
    fn inspect_maps_never_started_sentinel() {
        let containers =
            containers_from_inspect(&inspect_json("created", "0001-01-01T00:00:00Z")).unwrap();
        assert_eq!(containers[0].status, ContainerStatus::Created);
        assert_eq!(containers[0].started_at, StartedAt::Never);
        assert!(!containers[0].has_ever_started());
    }

    #[test]
    fn inspect_tolerates_unknown_status() {
        let containers =
            containers_from_inspect(&inspect_json("restarting", "2024-05-01T10:00:00.0Z")).unwrap();
        assert_eq!(containers[0].status, ContainerStatus::Unknown);
    }

    #[test]
    fn inspect_rejects_malformed_json() {
        assert!(containers_from_inspect("not json").is_err());
    }
}
