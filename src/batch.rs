use anyhow::{bail, Context, Result};
use log::info;

use crate::{
    graph::Task,
    models::BatchSpec,
    services::{ContainerEngine, CreateContainerOptions},
};

/// A fire-and-wait container run: tear down any stale same-named
/// container, create a fresh one, run it to completion, then commit the
/// filesystem or expire the container. There is no retry; a failed batch
/// job is reported once.
pub struct BatchJobTask {
    spec: BatchSpec,
}

impl BatchJobTask {
    pub fn new(spec: BatchSpec) -> BatchJobTask {
        BatchJobTask { spec }
    }
}

impl Task for BatchJobTask {
    fn is_needed(&self, _engine: &mut dyn ContainerEngine) -> Result<bool> {
        Ok(true)
    }

    fn execute(&self, engine: &mut dyn ContainerEngine) -> Result<()> {
        let spec = &self.spec;
        let name = &spec.container_name;

        if let Some(stale) = engine
            .get_container(name)
            .with_context(|| format!("failed to look up batch container '{}'", name.0))?
        {
            info!(
                "batch job '{}' removing stale container '{}'",
                spec.name, name.0
            );
            if stale.is_running() {
                engine
                    .stop_container(name)
                    .with_context(|| format!("failed to stop stale container '{}'", name.0))?;
            }
            engine
                .remove_container(name)
                .with_context(|| format!("failed to remove stale container '{}'", name.0))?;
        }

        let options = CreateContainerOptions {
            name: name.0.clone(),
            image: spec.image.reference(),
            command: Some(vec![
                "/bin/sh".into(),
                "-c".into(),
                spec.operation.clone(),
            ]),
            open_stdin: true,
            tty: true,
            volumes_from: spec.volumes_from.iter().map(|v| v.0.clone()).collect(),
            binds: spec.binds.clone(),
            ..Default::default()
        };
        engine
            .create_container(options)
            .with_context(|| format!("failed to create batch container '{}'", name.0))?;

        let exit_code = if spec.attach {
            engine
                .run_attached(name)
                .with_context(|| format!("batch job '{}' failed to run", spec.name))?
        } else {
            engine
                .start_container(name)
                .with_context(|| format!("batch job '{}' failed to start", spec.name))?;
            engine
                .wait_container(name)
                .with_context(|| format!("batch job '{}' failed while waiting", spec.name))?
        };
        if exit_code != 0 {
            bail!("batch job '{}' exited with status {}", spec.name, exit_code);
        }

        if spec.commit_changes {
            info!(
                "batch job '{}' committing container '{}'",
                spec.name, name.0
            );
            engine
                .commit_container(name, &spec.image.repo, &spec.name)
                .with_context(|| format!("failed to commit batch container '{}'", name.0))?;
        } else {
            info!("batch job '{}' expiring container '{}'", spec.name, name.0);
            engine
                .remove_container(name)
                .with_context(|| format!("failed to remove batch container '{}'", name.0))?;
        }

        info!("batch job '{}' complete", spec.name);
        Ok(())
    }
}
