use crate::path::Path;
use std::time::Duration;
use tokio::time::Instant;

/// Cap for deadlines so `Instant` arithmetic never overflows.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Debounce bounds shared by every task of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationWindow {
    /// Quiet time required after the last change.
    pub min: Duration,
    /// Longest wait after the first change.
    pub max: Duration,
}

/// One path's outstanding debounce window.
#[derive(Debug, Clone)]
pub struct Task {
    path: Path,
    first_event: Instant,
    last_event: Instant,
    window: AggregationWindow,
    expired: bool,
    /// Slot in the task heap while heap-resident.
    pub(crate) heap_idx: Option<usize>,
}

impl Task {
    pub fn new(path: Path, at: Instant, window: AggregationWindow) -> Self {
        Self {
            path,
            first_event: at,
            last_event: at,
            window,
            expired: false,
            heap_idx: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_event(&self) -> Instant {
        self.first_event
    }

    pub fn last_event(&self) -> Instant {
        self.last_event
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// `min(last_event + window.min, first_event + window.max)`
    pub fn expiration_deadline(&self) -> Instant {
        let since_first = self.last_event.saturating_duration_since(self.first_event);
        let offset = (since_first + self.window.min)
            .min(self.window.max)
            .min(FAR_FUTURE);
        self.first_event + offset
    }

    /// Widen the window to cover an observation at `at`.
    ///
    /// # Panics
    /// If the task already expired.
    pub(crate) fn merge(&mut self, at: Instant) {
        assert!(!self.expired, "merging into expired task for '{}'", self.path);
        self.first_event = self.first_event.min(at);
        self.last_event = self.last_event.max(at);
    }

    /// # Panics
    /// If the task already expired or is still heap-resident.
    pub(crate) fn expire(&mut self) {
        assert!(!self.expired, "task for '{}' expired twice", self.path);
        assert!(
            self.heap_idx.is_none(),
            "expiring heap-resident task for '{}'",
            self.path
        );
        self.expired = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(min_ms: u64, max_ms: u64) -> AggregationWindow {
        AggregationWindow {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn test_deadline_debounces_on_last_event() {
        let t0 = Instant::now();
        let mut task = Task::new(Path::new(["a"]), t0, window(1000, 30_000));
        assert_eq!(task.expiration_deadline(), t0 + Duration::from_millis(1000));

        task.merge(t0 + Duration::from_millis(200));
        assert_eq!(task.expiration_deadline(), t0 + Duration::from_millis(1200));
    }

    #[test]
    fn test_deadline_bounded_by_first_event() {
        let t0 = Instant::now();
        let mut task = Task::new(Path::new(["a"]), t0, window(1000, 5000));
        task.merge(t0 + Duration::from_millis(4800));
        assert_eq!(task.expiration_deadline(), t0 + Duration::from_millis(5000));
    }

    #[test]
    fn test_merge_is_order_independent() {
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        let mut forward = Task::new(Path::new(["a"]), t0 + ms(100), window(1000, 10_000));
        forward.merge(t0 + ms(200));
        forward.merge(t0 + ms(300));

        let mut shuffled = Task::new(Path::new(["a"]), t0 + ms(300), window(1000, 10_000));
        shuffled.merge(t0 + ms(100));
        shuffled.merge(t0 + ms(200));

        assert_eq!(forward.first_event(), shuffled.first_event());
        assert_eq!(forward.last_event(), shuffled.last_event());
        assert_eq!(shuffled.first_event(), t0 + ms(100));
        assert_eq!(shuffled.last_event(), t0 + ms(300));
    }

    #[test]
    #[should_panic(expected = "merging into expired task")]
    fn test_merge_into_expired_task_panics() {
        let t0 = Instant::now();
        let mut task = Task::new(Path::new(["a"]), t0, window(1000, 10_000));
        task.expire();
        task.merge(t0);
    }
}
