//! Collaborator seams consumed during parsing.
//!
//! An issue tracker is only visible through [`TaskProvider`]; the parser only
//! ever asks one question of it (or of version control): who worked on task
//! N? That question is [`AuthorLookup`], which must answer within a bounded
//! time and never fail.

use std::cell::RefCell;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{Task, TaskStatus};
use crate::task_id::TaskId;

/// Best-effort attribution for rows that name no user.
pub trait AuthorLookup {
    fn author_for(&self, task: TaskId) -> Option<String>;
}

/// Attribution disabled.
pub struct NoLookup;

impl AuthorLookup for NoLookup {
    fn author_for(&self, _task: TaskId) -> Option<String> {
        None
    }
}

/// Asks each lookup in order and keeps the first answer.
pub struct FirstMatch<'a>(pub Vec<&'a dyn AuthorLookup>);

impl AuthorLookup for FirstMatch<'_> {
    fn author_for(&self, task: TaskId) -> Option<String> {
        self.0.iter().find_map(|lookup| lookup.author_for(task))
    }
}

/// Remembers answers (including misses) so each task is looked up once per
/// parse.
pub struct CachedLookup<'a> {
    inner: &'a dyn AuthorLookup,
    cache: RefCell<HashMap<TaskId, Option<String>>>,
}

impl<'a> CachedLookup<'a> {
    pub fn new(inner: &'a dyn AuthorLookup) -> Self {
        Self {
            inner,
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl AuthorLookup for CachedLookup<'_> {
    fn author_for(&self, task: TaskId) -> Option<String> {
        if let Some(hit) = self.cache.borrow().get(&task) {
            return hit.clone();
        }
        let answer = self.inner.author_for(task);
        self.cache.borrow_mut().insert(task, answer.clone());
        answer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTask {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub state: Option<String>,
    pub assignee: Option<String>,
}

/// Opaque issue tracker.
pub trait TaskProvider {
    type Error: std::fmt::Display;

    fn get(&self, id: TaskId) -> Result<Option<ProviderTask>, Self::Error>;
    fn list(&self) -> Result<Vec<ProviderTask>, Self::Error>;
    fn update(&mut self, id: TaskId, update: TaskUpdate) -> Result<ProviderTask, Self::Error>;
}

/// Attributes a task to its assignee in the provider. Provider errors are
/// logged and treated as "no answer".
pub struct ProviderAttribution<P> {
    provider: P,
}

impl<P: TaskProvider> ProviderAttribution<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl<P: TaskProvider> AuthorLookup for ProviderAttribution<P> {
    fn author_for(&self, task: TaskId) -> Option<String> {
        match self.provider.get(task) {
            Ok(found) => found.and_then(|t| t.assignee).filter(|a| !a.trim().is_empty()),
            Err(err) => {
                tracing::debug!(task = %task, error = %err, "task provider lookup failed");
                None
            }
        }
    }
}

/// The project's own task list, served as a provider.
#[derive(Debug, Default, Clone)]
pub struct TaskListProvider {
    tasks: Vec<ProviderTask>,
}

impl TaskListProvider {
    pub fn new(tasks: &[Task]) -> Self {
        Self {
            tasks: tasks
                .iter()
                .map(|t| ProviderTask {
                    id: t.id,
                    title: t.title.clone(),
                    state: t.status.to_string(),
                    assignee: t.assignee.clone(),
                })
                .collect(),
        }
    }
}

impl TaskProvider for TaskListProvider {
    type Error = String;

    fn get(&self, id: TaskId) -> Result<Option<ProviderTask>, String> {
        Ok(self.tasks.iter().find(|t| t.id == id).cloned())
    }

    fn list(&self) -> Result<Vec<ProviderTask>, String> {
        Ok(self.tasks.clone())
    }

    fn update(&mut self, id: TaskId, update: TaskUpdate) -> Result<ProviderTask, String> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| format!("no task {id}"))?;
        if let Some(state) = update.state {
            let status = TaskStatus::parse_token(&state)
                .ok_or_else(|| format!("disallowed status token '{state}'"))?;
            task.state = status.to_string();
        }
        if update.assignee.is_some() {
            task.assignee = update.assignee;
        }
        Ok(task.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct MemoryProvider {
        tasks: Vec<ProviderTask>,
        fail: bool,
    }

    impl TaskProvider for MemoryProvider {
        type Error = String;

        fn get(&self, id: TaskId) -> Result<Option<ProviderTask>, String> {
            if self.fail {
                return Err("tracker offline".into());
            }
            Ok(self.tasks.iter().find(|t| t.id == id).cloned())
        }

        fn list(&self) -> Result<Vec<ProviderTask>, String> {
            Ok(self.tasks.clone())
        }

        fn update(&mut self, id: TaskId, update: TaskUpdate) -> Result<ProviderTask, String> {
            let task = self
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| format!("no task {id}"))?;
            if let Some(state) = update.state {
                task.state = state;
            }
            if update.assignee.is_some() {
                task.assignee = update.assignee;
            }
            Ok(task.clone())
        }
    }

    fn id(n: u32) -> TaskId {
        TaskId::parse_ref(&n.to_string()).unwrap()
    }

    fn provider() -> MemoryProvider {
        MemoryProvider {
            tasks: vec![ProviderTask {
                id: id(42),
                title: "Billing export".into(),
                state: "open".into(),
                assignee: Some("alice".into()),
            }],
            fail: false,
        }
    }

    #[test]
    fn provider_assignee_attributes_task() {
        let lookup = ProviderAttribution::new(provider());
        assert_eq!(lookup.author_for(id(42)).as_deref(), Some("alice"));
        assert_eq!(lookup.author_for(id(7)), None);
    }

    #[test]
    fn provider_updates_flow_through_get_and_list() {
        let mut provider = provider();
        let updated = provider
            .update(
                id(42),
                TaskUpdate {
                    assignee: Some("bob".into()),
                    ..TaskUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.assignee.as_deref(), Some("bob"));
        assert_eq!(provider.list().unwrap().len(), 1);
        assert!(provider.update(id(7), TaskUpdate::default()).is_err());

        let lookup = ProviderAttribution::new(provider);
        assert_eq!(lookup.author_for(id(42)).as_deref(), Some("bob"));
    }

    #[test]
    fn provider_errors_degrade_to_none() {
        let lookup = ProviderAttribution::new(MemoryProvider {
            fail: true,
            ..MemoryProvider::default()
        });
        assert_eq!(lookup.author_for(id(42)), None);
    }

    struct Counting {
        calls: Cell<usize>,
        answer: Option<&'static str>,
    }

    impl AuthorLookup for Counting {
        fn author_for(&self, _task: TaskId) -> Option<String> {
            self.calls.set(self.calls.get() + 1);
            self.answer.map(String::from)
        }
    }

    #[test]
    fn cached_lookup_asks_once_per_task() {
        let inner = Counting {
            calls: Cell::new(0),
            answer: None,
        };
        let cached = CachedLookup::new(&inner);
        assert_eq!(cached.author_for(id(42)), None);
        assert_eq!(cached.author_for(id(42)), None);
        assert_eq!(cached.author_for(id(7)), None);
        assert_eq!(inner.calls.get(), 2);
    }

    #[test]
    fn first_match_falls_through() {
        let tracker = ProviderAttribution::new(provider());
        let chain = FirstMatch(vec![&NoLookup as &dyn AuthorLookup, &tracker]);
        assert_eq!(chain.author_for(id(42)).as_deref(), Some("alice"));
        assert_eq!(chain.author_for(id(7)), None);
    }

    fn task(n: u32, status: TaskStatus, assignee: Option<&str>) -> Task {
        Task {
            id: id(n),
            title: format!("Task {n}"),
            status,
            assignee: assignee.map(String::from),
            subtasks: Vec::new(),
            line: 1,
        }
    }

    #[test]
    fn task_list_provider_serves_parsed_tasks() {
        let mut provider = TaskListProvider::new(&[
            task(42, TaskStatus::InProgress, Some("carol")),
            task(7, TaskStatus::Pending, None),
        ]);
        let found = provider.get(id(42)).unwrap().unwrap();
        assert_eq!(found.state, "in_progress");
        assert_eq!(found.assignee.as_deref(), Some("carol"));
        assert_eq!(provider.list().unwrap().len(), 2);

        let updated = provider
            .update(
                id(7),
                TaskUpdate {
                    state: Some("done".into()),
                    assignee: Some("dave".into()),
                },
            )
            .unwrap();
        assert_eq!(updated.state, "completed");
        assert!(
            provider
                .update(
                    id(7),
                    TaskUpdate {
                        state: Some("someday".into()),
                        ..TaskUpdate::default()
                    }
                )
                .is_err()
        );

        let lookup = ProviderAttribution::new(provider);
        assert_eq!(lookup.author_for(id(7)).as_deref(), Some("dave"));
        assert_eq!(lookup.author_for(id(99)), None);
    }
}
