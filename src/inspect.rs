//! Read-only queries against the container engine.
//!
//! Idempotency predicates run before every action and must tolerate a
//! transient or unreachable engine: a failed query collapses to the
//! corresponding negative state (image absent, container absent, marker
//! absent) instead of aborting the run. The engine favors redoing work over
//! crashing; action executors themselves still propagate their errors.

use log::warn;

use crate::models::{Container, ContainerName};
use crate::services::ContainerEngine;

/// True if any image in the engine's catalog carries exactly `repo:tag`.
pub fn image_exists(engine: &mut dyn ContainerEngine, reference: &str) -> bool {
    match engine.list_image_tags() {
        Ok(tags) => tags.iter().any(|tag| tag == reference),
        Err(err) => {
            warn!("image catalog query failed, treating {} as absent: {:#}", reference, err);
            false
        }
    }
}

/// True if any tag of `repo` exists, regardless of which tag.
pub fn repo_exists(engine: &mut dyn ContainerEngine, repo: &str) -> bool {
    let prefix = format!("{}:", repo);
    match engine.list_image_tags() {
        Ok(tags) => tags.iter().any(|tag| tag.starts_with(&prefix)),
        Err(err) => {
            warn!("image catalog query failed, treating {} as absent: {:#}", repo, err);
            false
        }
    }
}

/// Resolves a container by name. Absence is a valid, common state; a failed
/// query reads as absent.
pub fn container_state(engine: &mut dyn ContainerEngine, name: &ContainerName) -> Option<Container> {
    match engine.get_container(name) {
        Ok(state) => state,
        Err(err) => {
            warn!(
                "container state query failed, treating '{}' as absent: {:#}",
                name.0, err
            );
            None
        }
    }
}

/// Probes a one-time job's marker file inside the container filesystem.
///
/// Fails open: any probe failure, including the container being
/// unreachable, reads as "marker absent" so the job re-runs rather than
/// being silently skipped.
pub fn job_marker_present(
    engine: &mut dyn ContainerEngine,
    name: &ContainerName,
    marker_path: &str,
) -> bool {
    match engine.path_exists(name, marker_path) {
        Ok(present) => present,
        Err(err) => {
            warn!(
                "marker probe failed for '{}' in '{}', treating as absent: {:#}",
                marker_path, name.0, err
            );
            false
        }
    }
}
