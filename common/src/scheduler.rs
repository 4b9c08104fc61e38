use std::collections::BTreeMap;

use chrono::NaiveDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

/// Delayed one-shot work, ordered by due time then insertion order.
#[derive(Debug, Clone)]
pub struct TaskQueue<T> {
    tasks: BTreeMap<(NaiveDateTime, u64), T>,
    next_id: u64,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            tasks: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: NaiveDateTime, task: T) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.insert((due, id), task);
        TaskId(id)
    }

    pub fn cancel(&mut self, id: TaskId) -> Option<T> {
        let key = self.tasks.keys().find(|(_, task_id)| *task_id == id.0).copied()?;
        self.tasks.remove(&key)
    }

    /// Drops every queued task matching `predicate` and returns how many went.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| !predicate(task));
        before - self.tasks.len()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    pub fn next_due(&self) -> Option<NaiveDateTime> {
        self.tasks.keys().next().map(|(due, _)| *due)
    }

    pub fn take_due(&mut self, now: NaiveDateTime) -> Vec<T> {
        let mut due = Vec::new();
        while self
            .tasks
            .first_key_value()
            .is_some_and(|((at, _), _)| *at <= now)
        {
            if let Some((_, task)) = self.tasks.pop_first() {
                due.push(task);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
