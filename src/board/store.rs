//! Canonical in-memory record of every task on the board.
//!
//! The collection is persistent: each update produces a new `Arc<Vec<_>>`
//! that shares every untouched task with the previous one, so readers can
//! hold a snapshot while the engine keeps mutating. Updaters signal "no
//! change" by handing back the very `Arc<Task>` they were given; in that case
//! the original collection is returned and no change notification fires.

use std::sync::Arc;

use super::models::Task;

pub type TaskList = Arc<Vec<Arc<Task>>>;

#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    tasks: TaskList,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot of the collection.
    pub fn snapshot(&self) -> TaskList {
        Arc::clone(&self.tasks)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Linear lookup accepting either the task id or its spec id.
    pub fn find_by_id_or_spec_id(&self, key: &str) -> Option<usize> {
        self.tasks
            .iter()
            .position(|t| t.id == key)
            .or_else(|| self.tasks.iter().position(|t| t.spec_id == key))
    }

    pub fn get(&self, key: &str) -> Option<Arc<Task>> {
        self.find_by_id_or_spec_id(key)
            .map(|i| Arc::clone(&self.tasks[i]))
    }

    /// Build the collection that results from replacing the task at `index`.
    ///
    /// Returns the current collection untouched when `index` is out of range
    /// or when `updater` returns the same reference it was handed.
    pub fn update_at_index<F>(&self, index: usize, updater: F) -> TaskList
    where
        F: FnOnce(&Arc<Task>) -> Arc<Task>,
    {
        let Some(current) = self.tasks.get(index) else {
            return self.snapshot();
        };
        let next = updater(current);
        if Arc::ptr_eq(current, &next) {
            return self.snapshot();
        }
        let mut tasks: Vec<Arc<Task>> = self.tasks.iter().cloned().collect();
        tasks[index] = next;
        Arc::new(tasks)
    }

    /// Apply `updater` to the task matching `key` and commit the result.
    /// Returns the new task when something changed.
    pub fn update<F>(&mut self, key: &str, updater: F) -> Option<Arc<Task>>
    where
        F: FnOnce(&Arc<Task>) -> Arc<Task>,
    {
        let index = self.find_by_id_or_spec_id(key)?;
        let next = self.update_at_index(index, updater);
        if Arc::ptr_eq(&next, &self.tasks) {
            return None;
        }
        self.tasks = next;
        Some(Arc::clone(&self.tasks[index]))
    }

    pub fn insert(&mut self, task: Task) -> Arc<Task> {
        let task = Arc::new(task);
        let mut tasks: Vec<Arc<Task>> = self.tasks.iter().cloned().collect();
        tasks.push(Arc::clone(&task));
        self.tasks = Arc::new(tasks);
        task
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<Task>> {
        let index = self.find_by_id_or_spec_id(key)?;
        let mut tasks: Vec<Arc<Task>> = self.tasks.iter().cloned().collect();
        let removed = tasks.remove(index);
        self.tasks = Arc::new(tasks);
        Some(removed)
    }
}
