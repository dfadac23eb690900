use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::{
    collections::{BTreeMap as Map, BTreeSet as Set},
    fs::File,
    path::{Path, PathBuf},
};

use crate::{
    models::{
        BatchSpec, BuildSource, ContainerName, ContainerSpec, CreateOptions, ExecCommand,
        ImageName, ImageRef, ImageSpec, JobName, JobSpec, Project, StartOptions,
    },
    services::ProjectFrontend,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectFileShape {
    repo_base: Option<String>,

    #[serde(default)]
    images: Map<String, ImageEntry>,

    #[serde(default)]
    containers: Map<String, ContainerEntry>,

    #[serde(default)]
    jobs: Map<String, JobEntry>,

    #[serde(default)]
    batch_jobs: Map<String, BatchEntry>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageEntry {
    /// Directory build context.
    source: Option<PathBuf>,

    /// Inline build file, mutually exclusive with `source`.
    dockerfile: Option<String>,

    #[serde(default)]
    add_files: Vec<PathBuf>,

    dep_image: Option<String>,

    #[serde(default)]
    dep_other: Vec<String>,

    #[serde(default)]
    no_clean: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateArgsEntry {
    open_stdin: Option<bool>,
    tty: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartArgsEntry {
    #[serde(default)]
    start_once: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContainerEntry {
    image_name: Option<String>,

    #[serde(default)]
    image_nobuild: bool,

    command: Option<Vec<String>>,

    args_create: Option<CreateArgsEntry>,

    args_start: Option<StartArgsEntry>,

    #[serde(default)]
    volumes_from: Vec<String>,

    #[serde(default)]
    binds: Vec<String>,

    #[serde(default)]
    exposed_ports: Vec<String>,

    #[serde(default)]
    port_bindings: Vec<String>,

    #[serde(default)]
    publish_all: bool,

    #[serde(default)]
    dep_jobs: Vec<String>,

    #[serde(default)]
    exec_on_start: Vec<ExecEntry>,

    #[serde(default)]
    allow_enter: bool,

    #[serde(default)]
    enter_dep_jobs: Vec<String>,

    #[serde(default)]
    no_clean: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobEntry {
    container_name: String,

    #[serde(default)]
    exec_list: Vec<ExecEntry>,

    #[serde(default)]
    dep_jobs: Vec<String>,

    #[serde(default)]
    run_always: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchEntry {
    image_name: String,

    /// Shell operation run as the container command.
    operation: String,

    container_name: Option<String>,

    #[serde(default)]
    volumes_from: Vec<String>,

    #[serde(default)]
    binds: Vec<String>,

    #[serde(default)]
    attach: bool,

    #[serde(default)]
    commit_changes: bool,

    #[serde(default)]
    dep_jobs: Vec<String>,
}

/// One entry of an exec list: a raw command or one of the shorthands, plus
/// per-command flags.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecEntry {
    cmd: Option<Vec<String>>,

    bash: Option<String>,

    git_mirror: Option<GitMirrorEntry>,

    git_update: Option<GitUpdateEntry>,

    git_clone: Option<GitCloneEntry>,

    git_checkout: Option<GitCheckoutEntry>,

    #[serde(default)]
    show_output: bool,

    #[serde(default)]
    restart_after: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GitMirrorEntry {
    path: String,
    url: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GitUpdateEntry {
    path: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GitCloneEntry {
    branch: String,
    source: String,
    dest: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GitCheckoutEntry {
    commit: String,
    source: String,
    dest: String,
}

fn bash_command(script: impl Into<String>) -> Vec<String> {
    vec!["/bin/bash".into(), "-c".into(), script.into()]
}

impl ExecEntry {
    fn into_command(self, place: &str) -> Result<ExecCommand> {
        let mut forms: Vec<Vec<String>> = Vec::new();
        if let Some(cmd) = self.cmd {
            forms.push(cmd);
        }
        if let Some(script) = self.bash {
            forms.push(bash_command(script));
        }
        if let Some(entry) = self.git_mirror {
            forms.push(bash_command(format!(
                "if [[ -d {path} ]]; then\n\
                 /usr/bin/git --git-dir={path} fetch --all\n\
                 else\n\
                 /usr/bin/git clone --mirror {url} {path}\n\
                 fi",
                path = entry.path,
                url = entry.url,
            )));
        }
        if let Some(entry) = self.git_update {
            forms.push(bash_command(format!(
                "/usr/bin/git --git-dir={} fetch --all",
                entry.path
            )));
        }
        if let Some(entry) = self.git_clone {
            forms.push(bash_command(format!(
                "/usr/bin/git clone --branch {} {} {}",
                entry.branch, entry.source, entry.dest
            )));
        }
        if let Some(entry) = self.git_checkout {
            forms.push(bash_command(format!(
                "/usr/bin/git clone --no-checkout {source} {dest} && \
                 /usr/bin/git --work-tree {dest} --git-dir {dest}/.git checkout {commit}",
                source = entry.source,
                dest = entry.dest,
                commit = entry.commit,
            )));
        }

        let cmd = match (forms.pop(), forms.pop()) {
            (Some(cmd), None) => cmd,
            _ => bail!(
                "exec entry in {} must set exactly one of cmd, bash, git_mirror, git_update, \
                 git_clone, git_checkout",
                place
            ),
        };

        Ok(ExecCommand {
            cmd,
            show_output: self.show_output,
            restart_after: self.restart_after,
        })
    }
}

fn exec_list(entries: Vec<ExecEntry>, place: &str) -> Result<Vec<ExecCommand>> {
    entries
        .into_iter()
        .map(|entry| entry.into_command(place))
        .collect()
}

/// Parses and validates a `gantry.yml` project file. Configuration errors
/// (unknown keys, missing required fields, mutually exclusive options)
/// surface here, before any graph execution.
pub struct GantryFileFrontend;

impl GantryFileFrontend {
    pub fn new() -> GantryFileFrontend {
        GantryFileFrontend
    }
}

impl ProjectFrontend for GantryFileFrontend {
    fn project<P: AsRef<Path>>(
        &mut self,
        repo_base: &str,
        project_file_path: P,
    ) -> Result<Project> {
        let path = project_file_path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open project file {}", path.display()))?;
        let shape: ProjectFileShape = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse project file {}", path.display()))?;
        convert(repo_base, shape)
    }
}

fn convert(default_repo_base: &str, shape: ProjectFileShape) -> Result<Project> {
    let repo_base = shape
        .repo_base
        .unwrap_or_else(|| default_repo_base.to_string());
    if repo_base.is_empty() {
        bail!("repo_base must not be empty");
    }

    let image_names: Set<&String> = shape.images.keys().collect();
    let container_names: Set<&String> = shape.containers.keys().collect();
    let batch_names: Set<&String> = shape.batch_jobs.keys().collect();

    let mut project = Project {
        repo_base: repo_base.clone(),
        ..Default::default()
    };

    for (name, entry) in &shape.images {
        project.images.push(convert_image(&repo_base, name, entry)?);
    }

    for (name, entry) in &shape.containers {
        let spec = convert_container(&repo_base, name, entry, &image_names, &batch_names)?;
        for donor in &spec.start.volumes_from {
            if !container_names.contains(&donor.0) {
                bail!(
                    "container '{}' takes volumes from unknown container '{}'",
                    name,
                    donor.0
                );
            }
        }
        project.containers.push(spec);
    }

    for (name, entry) in &shape.jobs {
        if !container_names.contains(&entry.container_name) {
            bail!("job '{}' targets unknown container '{}'", name, entry.container_name);
        }
        for dep in &entry.dep_jobs {
            let sibling = shape.jobs.get(dep).ok_or_else(|| {
                anyhow!("job '{}' depends on unknown job '{}'", name, dep)
            })?;
            if sibling.container_name != entry.container_name {
                bail!(
                    "job '{}' depends on job '{}' in a different container",
                    name,
                    dep
                );
            }
        }
        if entry.exec_list.is_empty() {
            bail!("job '{}' must define a non-empty exec_list", name);
        }
        project.jobs.push(JobSpec {
            name: JobName(name.clone()),
            container: ContainerName(entry.container_name.clone()),
            exec_list: exec_list(entry.exec_list.clone(), &format!("job '{}'", name))?,
            dep_jobs: entry.dep_jobs.iter().map(|d| JobName(d.clone())).collect(),
            run_always: entry.run_always,
        });
    }

    let mut used_container_names: Set<String> =
        container_names.iter().map(|n| (*n).clone()).collect();
    for (name, entry) in &shape.batch_jobs {
        if !image_names.contains(&entry.image_name) {
            bail!("batch job '{}' uses unknown image '{}'", name, entry.image_name);
        }
        for dep in &entry.dep_jobs {
            if !batch_names.contains(dep) {
                bail!("batch job '{}' depends on unknown batch job '{}'", name, dep);
            }
        }
        for donor in &entry.volumes_from {
            if !container_names.contains(donor) {
                bail!(
                    "batch job '{}' takes volumes from unknown container '{}'",
                    name,
                    donor
                );
            }
        }
        let container_name = entry
            .container_name
            .clone()
            .unwrap_or_else(|| format!("job_{}", name));
        if !used_container_names.insert(container_name.clone()) {
            bail!(
                "batch job '{}' reuses container name '{}'",
                name,
                container_name
            );
        }
        project.batch_jobs.push(BatchSpec {
            name: name.clone(),
            image_name: ImageName(entry.image_name.clone()),
            image: ImageRef::latest(format!("{}/{}", repo_base, entry.image_name)),
            container_name: ContainerName(container_name),
            operation: entry.operation.clone(),
            volumes_from: entry
                .volumes_from
                .iter()
                .map(|v| ContainerName(v.clone()))
                .collect(),
            binds: entry.binds.clone(),
            attach: entry.attach,
            commit_changes: entry.commit_changes,
            dep_jobs: entry.dep_jobs.clone(),
        });
    }

    Ok(project)
}

fn convert_image(repo_base: &str, name: &str, entry: &ImageEntry) -> Result<ImageSpec> {
    let source = match (&entry.source, &entry.dockerfile) {
        (Some(_), Some(_)) => bail!(
            "image '{}' sets both 'source' and 'dockerfile'; they are mutually exclusive",
            name
        ),
        (Some(path), None) => {
            if !entry.add_files.is_empty() {
                bail!("image '{}': 'add_files' requires an inline 'dockerfile'", name);
            }
            BuildSource::Directory(path.clone())
        }
        (None, Some(text)) => BuildSource::Inline {
            text: text.clone(),
            add_files: entry.add_files.clone(),
        },
        (None, None) => BuildSource::Directory(PathBuf::from(format!("./{}/", name))),
    };

    Ok(ImageSpec {
        name: ImageName(name.into()),
        repo: format!("{}/{}", repo_base, name),
        source,
        dep_image: entry.dep_image.clone().map(ImageName),
        dep_other: entry.dep_other.clone(),
        no_clean: entry.no_clean,
    })
}

fn convert_container(
    repo_base: &str,
    name: &str,
    entry: &ContainerEntry,
    image_names: &Set<&String>,
    batch_names: &Set<&String>,
) -> Result<ContainerSpec> {
    if !entry.exposed_ports.is_empty() && !entry.port_bindings.is_empty() {
        bail!(
            "container '{}' sets both 'exposed_ports' and 'port_bindings'; \
             they are mutually exclusive",
            name
        );
    }

    let image_name = entry.image_name.clone().unwrap_or_else(|| name.to_string());
    let image = if entry.image_nobuild {
        ImageRef::parse(&image_name)
    } else {
        if !image_names.contains(&image_name) {
            bail!("container '{}' uses unknown image '{}'", name, image_name);
        }
        ImageRef::latest(format!("{}/{}", repo_base, image_name))
    };

    for job in entry.dep_jobs.iter().chain(entry.enter_dep_jobs.iter()) {
        if !batch_names.contains(job) {
            bail!("container '{}' depends on unknown batch job '{}'", name, job);
        }
    }

    let create_args = entry.args_create.clone().unwrap_or_default();
    let start_args = entry.args_start.clone().unwrap_or_default();

    Ok(ContainerSpec {
        name: ContainerName(name.into()),
        image_name: ImageName(image_name),
        image,
        image_nobuild: entry.image_nobuild,
        command: entry.command.clone(),
        create: CreateOptions {
            open_stdin: create_args.open_stdin.unwrap_or(true),
            tty: create_args.tty.unwrap_or(true),
        },
        exposed_ports: entry.exposed_ports.clone(),
        start: StartOptions {
            volumes_from: entry
                .volumes_from
                .iter()
                .map(|v| ContainerName(v.clone()))
                .collect(),
            binds: entry.binds.clone(),
            port_bindings: entry.port_bindings.clone(),
            publish_all: entry.publish_all,
        },
        start_once: start_args.start_once,
        exec_on_start: exec_list(
            entry.exec_on_start.clone(),
            &format!("container '{}'", name),
        )?,
        dep_jobs: entry.dep_jobs.clone(),
        allow_enter: entry.allow_enter,
        enter_dep_jobs: entry.enter_dep_jobs.clone(),
        no_clean: entry.no_clean,
    })
}
