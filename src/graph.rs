use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use std::{
    collections::{BTreeMap as Map, BTreeSet as Set},
    fmt,
};

use crate::services::ContainerEngine;

/// One node's capability set: decide whether its action is currently
/// needed, and perform it. Both operations observe live engine state; a
/// node never caches state across invocations.
pub trait Task {
    fn is_needed(&self, engine: &mut dyn ContainerEngine) -> Result<bool>;

    fn execute(&self, engine: &mut dyn ContainerEngine) -> Result<()>;
}

/// Hierarchical task identifier: an ordered tuple of name segments,
/// rendered `namespace:resource:action`.
#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct TaskId(Vec<String>);

impl TaskId {
    pub fn new<I, S>(segments: I) -> TaskId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TaskId(segments.into_iter().map(|s| s.into()).collect())
    }

    pub fn parse(name: &str) -> Result<TaskId> {
        let segments: Vec<String> = name.split(':').map(|s| s.to_string()).collect();
        if segments.iter().any(|s| s.is_empty()) {
            bail!("invalid task name: {:?}", name);
        }
        Ok(TaskId(segments))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0.join(":"))
    }
}

pub trait InvokeObserver {
    fn action_started(&mut self, _id: &TaskId) {}

    fn action_completed(&mut self, _id: &TaskId) {}

    fn action_skipped(&mut self, _id: &TaskId) {}
}

/// Observer that reports nothing; used by tests and aggregate-only runs.
pub struct Silent;

impl InvokeObserver for Silent {}

struct Node {
    task: Box<dyn Task>,
    deps: Vec<TaskId>,
    description: Option<String>,
}

/// An owned directed graph of tasks. Nodes are registered explicitly by the
/// wiring logic; there is no ambient registry or implicit current
/// namespace.
#[derive(Default)]
pub struct TaskGraph {
    nodes: Map<TaskId, Node>,
}

impl TaskGraph {
    pub fn new() -> TaskGraph {
        TaskGraph { nodes: Map::new() }
    }

    pub fn add_task(&mut self, id: TaskId, task: Box<dyn Task>) -> Result<()> {
        if self.nodes.contains_key(&id) {
            bail!("task '{}' is already defined", id);
        }
        self.nodes.insert(
            id,
            Node {
                task,
                deps: Vec::new(),
                description: None,
            },
        );
        Ok(())
    }

    pub fn describe(&mut self, id: &TaskId, description: impl Into<String>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.description = Some(description.into());
        }
    }

    /// Adds a dependency edge; `id` runs only after `dep` has been invoked.
    pub fn add_dep(&mut self, id: &TaskId, dep: TaskId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| anyhow!("cannot add dependency to unknown task '{}'", id))?;
        if !node.deps.contains(&dep) {
            node.deps.push(dep);
        }
        Ok(())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.nodes.keys()
    }

    pub fn description(&self, id: &TaskId) -> Option<&str> {
        self.nodes.get(id).and_then(|node| node.description.as_deref())
    }

    /// Walks the dependency graph depth-first and runs every needed action
    /// in dependency order. Each task is invoked at most once per walk; a
    /// task whose predicate reports "not needed" is skipped but its
    /// dependencies still run.
    ///
    /// Returns the ids of the tasks that actually executed, in order.
    pub fn invoke(
        &self,
        target: &TaskId,
        engine: &mut dyn ContainerEngine,
        observer: &mut dyn InvokeObserver,
    ) -> Result<Vec<TaskId>> {
        let mut visited = Set::new();
        let mut stack = Vec::new();
        let mut executed = Vec::new();
        self.invoke_inner(target, engine, observer, &mut visited, &mut stack, &mut executed)?;
        Ok(executed)
    }

    fn invoke_inner(
        &self,
        id: &TaskId,
        engine: &mut dyn ContainerEngine,
        observer: &mut dyn InvokeObserver,
        visited: &mut Set<TaskId>,
        stack: &mut Vec<TaskId>,
        executed: &mut Vec<TaskId>,
    ) -> Result<()> {
        if visited.contains(id) {
            return Ok(());
        }
        if stack.contains(id) {
            let path: Vec<String> = stack.iter().map(|t| t.to_string()).collect();
            bail!("dependency cycle: {} -> {}", path.join(" -> "), id);
        }

        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| anyhow!("unknown task '{}'", id))?;

        stack.push(id.clone());
        for dep in &node.deps {
            self.invoke_inner(dep, engine, observer, visited, stack, executed)?;
        }
        stack.pop();
        visited.insert(id.clone());

        let needed = node
            .task
            .is_needed(engine)
            .with_context(|| format!("failed to decide whether '{}' is needed", id))?;
        if needed {
            observer.action_started(id);
            node.task
                .execute(engine)
                .with_context(|| format!("task '{}' failed", id))?;
            executed.push(id.clone());
            observer.action_completed(id);
        } else {
            debug!("'{}' is not needed", id);
            observer.action_skipped(id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MockEngine;
    use std::{cell::RefCell, rc::Rc};

    struct ProbeTask {
        name: &'static str,
        needed: bool,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Task for ProbeTask {
        fn is_needed(&self, _engine: &mut dyn ContainerEngine) -> Result<bool> {
            Ok(self.needed)
        }

        fn execute(&self, _engine: &mut dyn ContainerEngine) -> Result<()> {
            self.log.borrow_mut().push(self.name);
            Ok(())
        }
    }

    fn probe(name: &'static str, needed: bool, log: &Rc<RefCell<Vec<&'static str>>>) -> Box<ProbeTask> {
        Box::new(ProbeTask {
            name,
            needed,
            log: log.clone(),
        })
    }

    fn id(name: &str) -> TaskId {
        TaskId::parse(name).unwrap()
    }

    #[test]
    fn parse_rejects_empty_segments() {
        assert!(TaskId::parse("images::build").is_err());
        assert!(TaskId::parse("").is_err());
        assert_eq!(id("images:web:build").to_string(), "images:web:build");
    }

    #[test]
    fn dependencies_run_before_dependents() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut graph = TaskGraph::new();
        graph.add_task(id("a"), probe("a", true, &log)).unwrap();
        graph.add_task(id("b"), probe("b", true, &log)).unwrap();
        graph.add_dep(&id("b"), id("a")).unwrap();

        let mut engine = MockEngine::new();
        let executed = graph.invoke(&id("b"), &mut engine, &mut Silent).unwrap();

        assert_eq!(*log.borrow(), vec!["a", "b"]);
        assert_eq!(executed, vec![id("a"), id("b")]);
    }

    #[test]
    fn shared_dependency_runs_once() {
        // Diamond: d depends on b and c, both of which depend on a.
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut graph = TaskGraph::new();
        for name in &["a", "b", "c", "d"] {
            graph.add_task(id(name), probe(name, true, &log)).unwrap();
        }
        graph.add_dep(&id("b"), id("a")).unwrap();
        graph.add_dep(&id("c"), id("a")).unwrap();
        graph.add_dep(&id("d"), id("b")).unwrap();
        graph.add_dep(&id("d"), id("c")).unwrap();

        let mut engine = MockEngine::new();
        graph.invoke(&id("d"), &mut engine, &mut Silent).unwrap();

        assert_eq!(*log.borrow(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn unneeded_task_is_skipped_but_deps_still_run() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut graph = TaskGraph::new();
        graph.add_task(id("dep"), probe("dep", true, &log)).unwrap();
        graph.add_task(id("top"), probe("top", false, &log)).unwrap();
        graph.add_dep(&id("top"), id("dep")).unwrap();

        let mut engine = MockEngine::new();
        let executed = graph.invoke(&id("top"), &mut engine, &mut Silent).unwrap();

        assert_eq!(*log.borrow(), vec!["dep"]);
        assert_eq!(executed, vec![id("dep")]);
    }

    #[test]
    fn cycles_are_reported() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut graph = TaskGraph::new();
        graph.add_task(id("a"), probe("a", true, &log)).unwrap();
        graph.add_task(id("b"), probe("b", true, &log)).unwrap();
        graph.add_dep(&id("a"), id("b")).unwrap();
        graph.add_dep(&id("b"), id("a")).unwrap();

        let mut engine = MockEngine::new();
        let err = graph.invoke(&id("a"), &mut engine, &mut Silent).unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn unknown_tasks_are_reported() {
        let graph = TaskGraph::new();
        let mut engine = MockEngine::new();
        let err = graph.invoke(&id("nope"), &mut engine, &mut Silent).unwrap_err();
        assert!(err.to_string().contains("unknown task"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut graph = TaskGraph::new();
        graph.add_task(id("a"), probe("a", true, &log)).unwrap();
        assert!(graph.add_task(id("a"), probe("a", true, &log)).is_err());
    }
}
