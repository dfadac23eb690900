use anyhow::{anyhow, bail, Result};
use crossterm::{
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use log::info;
use std::{
    env, fs,
    io::{stdout, Write},
    path::{Path, PathBuf},
};
use structopt::StructOpt;

use backends::DockerCliEngine;
use frontends::GantryFileFrontend;
use graph::{InvokeObserver, TaskId};
use services::ProjectFrontend;

mod backends;
mod batch;
mod fingerprint;
mod frontends;
mod graph;
mod inspect;
mod models;
mod registry;
mod services;
mod tasks;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "gantry",
    about = "Declarative, idempotent container image builds and lifecycles as a task graph."
)]
struct Opt {
    #[structopt(short, long)]
    /// Project file to load instead of searching for gantry.yml.
    file: Option<PathBuf>,

    #[structopt(long)]
    /// List every addressable task and exit.
    list: bool,

    /// Tasks to invoke, e.g. containers:db:start, images:web:build, clean.
    tasks: Vec<String>,
}

fn find_project_file<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    for path in path.as_ref().ancestors() {
        let project_file_path = path.join("gantry.yml");
        if project_file_path.exists() {
            return Some(project_file_path);
        }

        let project_file_path = path.join("gantry.yaml");
        if project_file_path.exists() {
            return Some(project_file_path);
        }
    }

    None
}

/// Prints one line per needed action as the graph walk reaches it.
struct ProgressPrinter;

impl InvokeObserver for ProgressPrinter {
    fn action_started(&mut self, id: &TaskId) {
        let mut stdout = stdout();
        let _ = stdout.queue(style::PrintStyledContent("Running ".cyan().bold()));
        let _ = stdout.queue(style::Print(format!("{} ...\n", id)));
        let _ = stdout.flush();
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init_custom_env("LOG");

    let opt = Opt::from_args();

    let project_file_path = match &opt.file {
        Some(file) => fs::canonicalize(file)?,
        None => {
            let current_dir = env::current_dir()?;
            find_project_file(current_dir).ok_or_else(|| {
                anyhow!(
                    "Couldn't find a gantry.yml file in the current working directory \
                     or any of its parents."
                )
            })?
        }
    };
    info!("found project file {:?}", project_file_path);

    let work_directory = project_file_path
        .parent()
        .ok_or_else(|| anyhow!("Project file has no parent directory."))?;
    env::set_current_dir(work_directory)?;

    let repo_base = work_directory
        .file_name()
        .and_then(|path| path.to_str())
        .ok_or_else(|| anyhow!("Couldn't determine a default repository base."))?;
    info!("default repository base {:?}", repo_base);

    let mut frontend = GantryFileFrontend::new();
    let project = frontend.project(repo_base, &project_file_path)?;
    info!("parsed project");

    let graph = registry::wire(&project)?;

    if opt.list {
        for id in graph.task_ids() {
            match graph.description(id) {
                Some(description) => println!("{:<40} # {}", id.to_string(), description),
                None => println!("{}", id),
            }
        }
        return Ok(());
    }

    if opt.tasks.is_empty() {
        bail!("no tasks given; run with --list to see the available tasks");
    }

    let mut engine = DockerCliEngine::new();
    let mut observer = ProgressPrinter;
    let mut executed = 0;
    for name in &opt.tasks {
        let id = TaskId::parse(name)?;
        executed += graph.invoke(&id, &mut engine, &mut observer)?.len();
    }

    let mut stdout = stdout();
    if executed == 0 {
        stdout
            .queue(style::PrintStyledContent("Up to date".green().bold()))?
            .queue(style::Print(", no actions were needed.\n"))?
            .flush()?;
    } else {
        stdout
            .queue(style::PrintStyledContent("Finished".green().bold()))?
            .queue(style::Print(format!(", {} action(s) executed.\n", executed)))?
            .flush()?;
    }

    Ok(())
}
