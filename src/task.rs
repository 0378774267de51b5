//! Hierarchical task tracking for composite operations.
//!
//! Every start/stop/restart operation builds a tree of named task nodes: one
//! child per service, with `Build`/`Start`/`Stop` leaves underneath. Leaves
//! carry directly-set states; a node with children always reports the
//! aggregate of its children, recomputed on every query. Each mutation emits
//! an update on a shared stream so a follower can render live progress; the
//! stream closes when the operation's root (and with it every node) is
//! dropped.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};

use chrono::{DateTime, Utc};

/// State of a single task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created but not yet started.
    Pending,
    InProgress,
    Success,
    /// Finished, but not cleanly (e.g. a process had to be killed).
    Warning,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Warning | TaskState::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::InProgress => "in progress",
            TaskState::Success => "ok",
            TaskState::Warning => "warning",
            TaskState::Failed => "failed",
        }
    }
}

/// One notification on the update stream.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    /// Node path from the root, e.g. `["start", "api", "Build"]`.
    pub path: Vec<String>,
    pub state: TaskState,
    pub messages: Vec<String>,
}

struct TaskStatus {
    state: TaskState,
    messages: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

struct TaskInner {
    path: Vec<String>,
    status: Mutex<TaskStatus>,
    children: Mutex<Vec<Task>>,
    updates: Mutex<Sender<TaskUpdate>>,
}

/// Handle to one node in the task tree. Cloning is cheap and refers to the
/// same node.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Creates the root of a new tree along with the update stream consumed
    /// by a follower.
    pub fn new_root(name: &str) -> (Task, Receiver<TaskUpdate>) {
        let (tx, rx) = mpsc::channel();
        let task = Task {
            inner: Arc::new(TaskInner {
                path: vec![name.to_string()],
                status: Mutex::new(TaskStatus {
                    state: TaskState::Pending,
                    messages: Vec::new(),
                    started_at: None,
                    ended_at: None,
                }),
                children: Mutex::new(Vec::new()),
                updates: Mutex::new(tx),
            }),
        };
        (task, rx)
    }

    /// Returns the child with this name, creating it on first reference.
    /// Repeated calls with the same name return the same node; first-seen
    /// order is preserved.
    pub fn child(&self, name: &str) -> Task {
        let mut children = self.inner.children.lock().unwrap();
        if let Some(existing) = children.iter().find(|child| child.name() == name) {
            return existing.clone();
        }
        let mut path = self.inner.path.clone();
        path.push(name.to_string());
        let updates = self.inner.updates.lock().unwrap().clone();
        let child = Task {
            inner: Arc::new(TaskInner {
                path,
                status: Mutex::new(TaskStatus {
                    state: TaskState::Pending,
                    messages: Vec::new(),
                    started_at: None,
                    ended_at: None,
                }),
                children: Mutex::new(Vec::new()),
                updates: Mutex::new(updates),
            }),
        };
        children.push(child.clone());
        child
    }

    /// Sets this node's state and appends diagnostic messages.
    ///
    /// Meaningful only on leaves: once a node has children, its observed
    /// state is always the child aggregate and the directly-set value is
    /// ignored.
    pub fn set_state(&self, state: TaskState, messages: Vec<String>) {
        {
            let mut status = self.inner.status.lock().unwrap();
            if status.started_at.is_none() && state != TaskState::Pending {
                status.started_at = Some(Utc::now());
            }
            if state.is_terminal() {
                status.ended_at = Some(Utc::now());
            }
            status.state = state;
            status.messages.extend(messages);
        }
        self.emit();
    }

    /// Observed state: the directly-set state for leaves, otherwise the
    /// child aggregate by priority (Failed > InProgress > Warning > Success).
    pub fn state(&self) -> TaskState {
        let children = self.inner.children.lock().unwrap();
        if children.is_empty() {
            return self.inner.status.lock().unwrap().state;
        }
        let states: Vec<TaskState> = children.iter().map(Task::state).collect();
        drop(children);
        aggregate(&states)
    }

    pub fn messages(&self) -> Vec<String> {
        self.inner.status.lock().unwrap().messages.clone()
    }

    pub fn name(&self) -> &str {
        self.inner.path.last().expect("task path is never empty")
    }

    pub fn path(&self) -> &[String] {
        &self.inner.path
    }

    pub fn children(&self) -> Vec<Task> {
        self.inner.children.lock().unwrap().clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.status.lock().unwrap().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.inner.status.lock().unwrap().ended_at
    }

    fn emit(&self) {
        let update = TaskUpdate {
            path: self.inner.path.clone(),
            state: self.state(),
            messages: self.messages(),
        };
        let updates = self.inner.updates.lock().unwrap();
        let _ = updates.send(update);
    }
}

fn aggregate(states: &[TaskState]) -> TaskState {
    // Failed short-circuits; it is always reported first.
    if states.iter().any(|state| *state == TaskState::Failed) {
        return TaskState::Failed;
    }
    if states
        .iter()
        .any(|state| matches!(state, TaskState::InProgress | TaskState::Pending))
    {
        return TaskState::InProgress;
    }
    if states.iter().any(|state| *state == TaskState::Warning) {
        return TaskState::Warning;
    }
    TaskState::Success
}

/// Consumes the update stream, printing one line per state transition.
/// Returns once the stream closes, i.e. once the operation's tree is dropped.
pub fn spawn_follower(rx: Receiver<TaskUpdate>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut last_printed: Option<(Vec<String>, TaskState)> = None;
        for update in rx {
            if update.state == TaskState::Pending {
                continue;
            }
            let key = (update.path.clone(), update.state);
            if last_printed.as_ref() == Some(&key) {
                continue;
            }
            last_printed = Some(key);
            // Skip the operation name in front of each line.
            let label = update.path[1..].join(" > ");
            println!("railyard: {} {}", label, update.state.label());
            if update.state == TaskState::Failed || update.state == TaskState::Warning {
                for message in &update.messages {
                    for line in message.lines() {
                        println!("    {}", line);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_lookup_is_idempotent() {
        let (root, _rx) = Task::new_root("start");
        let first = root.child("api");
        let second = root.child("api");
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn children_keep_first_seen_order() {
        let (root, _rx) = Task::new_root("start");
        root.child("web");
        root.child("api");
        root.child("web");
        let names: Vec<String> = root
            .children()
            .iter()
            .map(|child| child.name().to_string())
            .collect();
        assert_eq!(names, ["web", "api"]);
    }

    #[test]
    fn parent_state_is_aggregate_of_children() {
        let (root, _rx) = Task::new_root("start");
        let api = root.child("api");
        let web = root.child("web");

        api.set_state(TaskState::InProgress, Vec::new());
        web.set_state(TaskState::Success, Vec::new());
        assert_eq!(root.state(), TaskState::InProgress);

        api.set_state(TaskState::Warning, vec!["Killed".to_string()]);
        assert_eq!(root.state(), TaskState::Warning);

        web.set_state(TaskState::Failed, vec!["build broke".to_string()]);
        assert_eq!(root.state(), TaskState::Failed);
    }

    #[test]
    fn direct_state_is_ignored_once_children_exist() {
        let (root, _rx) = Task::new_root("start");
        let api = root.child("api");
        api.set_state(TaskState::Failed, Vec::new());
        assert_eq!(api.state(), TaskState::Failed);

        let build = api.child("Build");
        build.set_state(TaskState::Success, Vec::new());
        assert_eq!(api.state(), TaskState::Success);
    }

    #[test]
    fn aggregate_recomputes_after_transitions() {
        let (root, _rx) = Task::new_root("start");
        let api = root.child("api");
        let build = api.child("Build");
        let start = api.child("Start");

        build.set_state(TaskState::Success, Vec::new());
        start.set_state(TaskState::InProgress, Vec::new());
        assert_eq!(api.state(), TaskState::InProgress);
        start.set_state(TaskState::Success, Vec::new());
        assert_eq!(api.state(), TaskState::Success);
        assert_eq!(root.state(), TaskState::Success);
    }

    #[test]
    fn updates_flow_until_the_tree_is_dropped() {
        let (root, rx) = Task::new_root("stop");
        let api = root.child("api");
        api.set_state(TaskState::InProgress, Vec::new());
        api.set_state(TaskState::Success, Vec::new());
        drop(api);
        drop(root);

        let updates: Vec<TaskUpdate> = rx.iter().collect();
        let states: Vec<TaskState> = updates.iter().map(|update| update.state).collect();
        assert!(states.contains(&TaskState::InProgress));
        assert_eq!(*states.last().unwrap(), TaskState::Success);
        // rx.iter() ended, so the stream closed exactly once.
    }
}
