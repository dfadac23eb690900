use anyhow::Result;

use crate::{
    batch::BatchJobTask,
    graph::{TaskGraph, TaskId},
    models::{BatchSpec, ContainerSpec, ImageSpec, JobSpec, Project},
    tasks::{
        ContainerCreateTask, ContainerEnterTask, ContainerRemoveTask, ContainerStartOnceTask,
        ContainerStartTask, ContainerStopTask, ImageBuildTask, ImageRemoveTask, JobExecTask,
        NoopTask,
    },
};

pub fn image_task(name: &str, action: &str) -> TaskId {
    TaskId::new(vec!["images", name, action])
}

pub fn container_task(name: &str, action: &str) -> TaskId {
    TaskId::new(vec!["containers", name, action])
}

pub fn job_task(container: &str, job: &str) -> TaskId {
    TaskId::new(vec!["containers", container, "jobs", job])
}

pub fn batch_task(name: &str) -> TaskId {
    TaskId::new(vec!["batchjobs", name])
}

/// Translates the project's resource declarations into an owned task graph:
/// one node per resource action, dependency declarations turned into
/// explicit edges, and the aggregate clean/clobber surface fanned out over
/// every registered resource.
///
/// Nodes are registered before any edge is wired so declarations may
/// reference each other in any order.
pub fn wire(project: &Project) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();

    add_aggregates(&mut graph)?;
    for image in &project.images {
        add_image_nodes(&mut graph, image)?;
    }
    for container in &project.containers {
        add_container_nodes(&mut graph, container)?;
    }
    for job in &project.jobs {
        add_job_nodes(&mut graph, job)?;
    }
    for batch in &project.batch_jobs {
        add_batch_nodes(&mut graph, batch)?;
    }

    for image in &project.images {
        wire_image(&mut graph, image)?;
    }
    for container in &project.containers {
        wire_container(&mut graph, container)?;
    }
    for job in &project.jobs {
        wire_job(&mut graph, job)?;
    }
    for batch in &project.batch_jobs {
        wire_batch(&mut graph, batch)?;
    }

    Ok(graph)
}

fn add_aggregates(graph: &mut TaskGraph) -> Result<()> {
    let aggregates = [
        ("images:build", "Build all images"),
        ("images:clean", "Remove temporary images"),
        ("images:clobber", "Remove all images"),
        ("containers:start", "Start background containers"),
        ("containers:stop", "Stop background containers"),
        ("containers:clean", "Remove temporary containers"),
        ("containers:clobber", "Remove all containers including caches"),
        ("clean", "Remove transient containers and images"),
        ("clobber", "Remove everything including cached layers"),
    ];
    for (name, description) in &aggregates {
        let id = TaskId::parse(name)?;
        graph.add_task(id.clone(), Box::new(NoopTask))?;
        graph.describe(&id, *description);
    }

    // Containers hold images in use; container cleanup always runs first.
    graph.add_dep(&TaskId::parse("images:clean")?, TaskId::parse("containers:clean")?)?;
    graph.add_dep(&TaskId::parse("images:clobber")?, TaskId::parse("containers:clobber")?)?;
    graph.add_dep(&TaskId::parse("images:clobber")?, TaskId::parse("images:clean")?)?;
    graph.add_dep(&TaskId::parse("containers:clobber")?, TaskId::parse("containers:clean")?)?;
    graph.add_dep(&TaskId::parse("clean")?, TaskId::parse("containers:clean")?)?;
    graph.add_dep(&TaskId::parse("clean")?, TaskId::parse("images:clean")?)?;
    graph.add_dep(&TaskId::parse("clobber")?, TaskId::parse("containers:clobber")?)?;
    graph.add_dep(&TaskId::parse("clobber")?, TaskId::parse("images:clobber")?)?;

    Ok(())
}

fn add_image_nodes(graph: &mut TaskGraph, spec: &ImageSpec) -> Result<()> {
    let build = image_task(&spec.name.0, "build");
    let rmi = image_task(&spec.name.0, "rmi");

    graph.add_task(build.clone(), Box::new(ImageBuildTask::new(spec.clone())))?;
    graph.describe(&build, format!("Build image {}", spec.repo));
    graph.add_task(rmi.clone(), Box::new(ImageRemoveTask::new(spec.repo.clone())))?;
    graph.describe(&rmi, format!("Remove image {}", spec.repo));

    Ok(())
}

fn wire_image(graph: &mut TaskGraph, spec: &ImageSpec) -> Result<()> {
    let build = image_task(&spec.name.0, "build");
    let rmi = image_task(&spec.name.0, "rmi");

    graph.add_dep(&TaskId::parse("images:build")?, build.clone())?;

    if let Some(dep) = &spec.dep_image {
        // Build after the parent image; remove the parent only after this
        // dependent is gone.
        graph.add_dep(&build, image_task(&dep.0, "build"))?;
        graph.add_dep(&image_task(&dep.0, "rmi"), rmi.clone())?;
    }
    for other in &spec.dep_other {
        graph.add_dep(&build, TaskId::parse(other)?)?;
    }

    if spec.no_clean {
        graph.add_dep(&TaskId::parse("images:clobber")?, rmi)?;
    } else {
        graph.add_dep(&TaskId::parse("images:clean")?, rmi)?;
    }

    Ok(())
}

fn add_container_nodes(graph: &mut TaskGraph, spec: &ContainerSpec) -> Result<()> {
    let name = &spec.name.0;
    let create = container_task(name, "create");
    let start = container_task(name, "start");
    let startonce = container_task(name, "startonce");
    let stop = container_task(name, "stop");
    let rm = container_task(name, "rm");

    graph.add_task(create, Box::new(ContainerCreateTask::new(spec.clone())))?;
    graph.add_task(start.clone(), Box::new(ContainerStartTask::new(spec.clone())))?;
    graph.add_task(startonce, Box::new(ContainerStartOnceTask::new(spec.clone())))?;
    graph.add_task(stop, Box::new(ContainerStopTask::new(spec.name.clone())))?;
    graph.add_task(rm, Box::new(ContainerRemoveTask::new(spec.name.clone())))?;
    graph.describe(&start, format!("Start container {}", name));

    if spec.allow_enter {
        let enter = container_task(name, "enter");
        graph.add_task(enter.clone(), Box::new(ContainerEnterTask::new(spec.name.clone())))?;
        graph.describe(&enter, format!("Attach a terminal to container {}", name));
    }

    Ok(())
}

fn wire_container(graph: &mut TaskGraph, spec: &ContainerSpec) -> Result<()> {
    let name = &spec.name.0;
    let create = container_task(name, "create");
    let start = container_task(name, "start");
    let startonce = container_task(name, "startonce");
    let stop = container_task(name, "stop");
    let rm = container_task(name, "rm");

    if !spec.image_nobuild {
        graph.add_dep(&create, image_task(&spec.image_name.0, "build"))?;
        // The image cannot go away while a container of it exists.
        let rmi = image_task(&spec.image_name.0, "rmi");
        if graph.contains(&rmi) {
            graph.add_dep(&rmi, rm.clone())?;
        }
    }
    for job in &spec.dep_jobs {
        graph.add_dep(&create, batch_task(job))?;
    }
    // Volume donors must have run at least once before this container is
    // created over their volumes.
    for donor in &spec.start.volumes_from {
        graph.add_dep(&create, container_task(&donor.0, "startonce"))?;
    }

    graph.add_dep(&start, create.clone())?;
    graph.add_dep(&startonce, create)?;
    graph.add_dep(&rm, stop.clone())?;

    graph.add_dep(&TaskId::parse("containers:start")?, start.clone())?;
    graph.add_dep(&TaskId::parse("containers:stop")?, stop)?;
    if spec.no_clean {
        graph.add_dep(&TaskId::parse("containers:clobber")?, rm)?;
    } else {
        graph.add_dep(&TaskId::parse("containers:clean")?, rm)?;
    }

    if spec.allow_enter {
        let enter = container_task(name, "enter");
        graph.add_dep(&enter, start)?;
        for job in &spec.enter_dep_jobs {
            graph.add_dep(&enter, batch_task(job))?;
        }
    }

    Ok(())
}

fn add_job_nodes(graph: &mut TaskGraph, spec: &JobSpec) -> Result<()> {
    let id = job_task(&spec.container.0, &spec.name.0);
    graph.add_task(id.clone(), Box::new(JobExecTask::new(spec.clone())))?;
    graph.describe(
        &id,
        format!("Run job {} in container {}", spec.name.0, spec.container.0),
    );
    Ok(())
}

fn wire_job(graph: &mut TaskGraph, spec: &JobSpec) -> Result<()> {
    let id = job_task(&spec.container.0, &spec.name.0);

    // Jobs exec into a running container.
    graph.add_dep(&id, container_task(&spec.container.0, "start"))?;
    for dep in &spec.dep_jobs {
        graph.add_dep(&id, job_task(&spec.container.0, &dep.0))?;
    }

    Ok(())
}

fn add_batch_nodes(graph: &mut TaskGraph, spec: &BatchSpec) -> Result<()> {
    let id = batch_task(&spec.name);
    graph.add_task(id.clone(), Box::new(BatchJobTask::new(spec.clone())))?;
    graph.describe(&id, format!("Run batch job {}", spec.name));

    // The batch container gets its own removal node so cleanup and image
    // removal can order against it.
    let rm = container_task(&spec.container_name.0, "rm");
    graph.add_task(
        rm,
        Box::new(ContainerRemoveTask::new(spec.container_name.clone())),
    )?;

    Ok(())
}

fn wire_batch(graph: &mut TaskGraph, spec: &BatchSpec) -> Result<()> {
    let id = batch_task(&spec.name);
    let rm = container_task(&spec.container_name.0, "rm");

    graph.add_dep(&id, image_task(&spec.image_name.0, "build"))?;
    for donor in &spec.volumes_from {
        graph.add_dep(&id, container_task(&donor.0, "startonce"))?;
    }
    for dep in &spec.dep_jobs {
        graph.add_dep(&id, batch_task(dep))?;
    }

    let rmi = image_task(&spec.image_name.0, "rmi");
    if graph.contains(&rmi) {
        graph.add_dep(&rmi, rm.clone())?;
    }
    if spec.commit_changes {
        graph.add_dep(&TaskId::parse("containers:clobber")?, rm)?;
    } else {
        graph.add_dep(&TaskId::parse("containers:clean")?, rm)?;
    }

    Ok(())
}
