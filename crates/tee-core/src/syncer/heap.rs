//! Indexed min-heap of tasks ordered by expiration deadline.
//!
//! Tasks live in an arena and are addressed by [`TaskId`]. The heap itself
//! only orders ids; every task records its current heap slot so it can be
//! re-prioritized ([`TaskHeap::fix`]) or removed in `O(log n)`.

use super::task::Task;

pub(crate) type TaskId = usize;

#[derive(Debug, Default)]
pub(crate) struct TaskHeap {
    slots: Vec<Option<Task>>,
    free: Vec<TaskId>,
    heap: Vec<TaskId>,
    live: usize,
}

impl TaskHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `task` in the arena. It is not heap-resident until [`push`](Self::push).
    pub fn insert(&mut self, mut task: Task) -> TaskId {
        task.heap_idx = None;
        self.live += 1;
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(task);
                id
            }
            None => {
                self.slots.push(Some(task));
                self.slots.len() - 1
            }
        }
    }

    /// Remove a task from the arena.
    ///
    /// # Panics
    /// If `id` is vacant or the task is still heap-resident.
    pub fn take(&mut self, id: TaskId) -> Task {
        let task = self.slots[id].take().expect("taking vacant task slot");
        assert!(task.heap_idx.is_none(), "taking heap-resident task");
        self.free.push(id);
        self.live -= 1;
        task
    }

    pub fn get(&self, id: TaskId) -> &Task {
        self.slots[id].as_ref().expect("vacant task slot")
    }

    pub fn get_mut(&mut self, id: TaskId) -> &mut Task {
        self.slots[id].as_mut().expect("vacant task slot")
    }

    /// Heap-resident task count.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Tasks held by the arena, heap-resident or not.
    pub fn stored(&self) -> usize {
        self.live
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.get(id).heap_idx.is_some()
    }

    pub fn peek(&self) -> Option<TaskId> {
        self.heap.first().copied()
    }

    /// # Panics
    /// If the task is already heap-resident.
    pub fn push(&mut self, id: TaskId) {
        assert!(!self.contains(id), "pushing heap-resident task");
        let idx = self.heap.len();
        self.heap.push(id);
        self.get_mut(id).heap_idx = Some(idx);
        self.up(idx);
    }

    /// Remove and return the task with the earliest deadline.
    pub fn pop(&mut self) -> Option<TaskId> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(0, last);
        self.down(0, last);
        self.detach_last()
    }

    /// Remove `id` from the heap (it stays in the arena).
    #[cfg(test)]
    pub fn remove(&mut self, id: TaskId) {
        let idx = self.slot_of(id);
        let last = self.heap.len() - 1;
        if idx != last {
            self.swap(idx, last);
            if !self.down(idx, last) {
                self.up(idx);
            }
        }
        self.detach_last();
    }

    /// Restore ordering after `id`'s deadline changed.
    pub fn fix(&mut self, id: TaskId) {
        let idx = self.slot_of(id);
        if !self.down(idx, self.heap.len()) {
            self.up(idx);
        }
    }

    fn slot_of(&self, id: TaskId) -> usize {
        let idx = self.get(id).heap_idx.expect("task is not heap-resident");
        debug_assert_eq!(self.heap[idx], id);
        idx
    }

    fn detach_last(&mut self) -> Option<TaskId> {
        let id = self.heap.pop()?;
        self.get_mut(id).heap_idx = None;
        Some(id)
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.get(self.heap[i]).expiration_deadline() < self.get(self.heap[j]).expiration_deadline()
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        let (a, b) = (self.heap[i], self.heap[j]);
        self.get_mut(a).heap_idx = Some(i);
        self.get_mut(b).heap_idx = Some(j);
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let parent = (j - 1) / 2;
            if !self.less(j, parent) {
                break;
            }
            self.swap(parent, j);
            j = parent;
        }
    }

    /// Sift down within `heap[..n]`. Returns whether the entry moved.
    fn down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && self.less(right, left) {
                child = right;
            }
            if !self.less(child, i) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }
}
