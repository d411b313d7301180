use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Cooperative cancellation shared between a caller and a running relocalization.
///
/// Clones observe the same flag. The token also fires on its own once an
/// optional deadline passes, which is how the per-call time budget is enforced.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that cancels itself `budget` from now.
    pub fn with_deadline(budget: Duration) -> Self {
        Self::new().child_with_budget(Some(budget))
    }

    /// Same flag, deadline tightened to `budget` from now if that is earlier.
    pub fn child_with_budget(&self, budget: Option<Duration>) -> Self {
        let deadline = budget.and_then(|b| Instant::now().checked_add(b));
        let deadline = match (self.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            flag: Arc::clone(&self.flag),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire) || self.deadline.map_or(false, |d| Instant::now() >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn deadline_fires() {
        assert!(CancellationToken::with_deadline(Duration::ZERO).is_cancelled());
        assert!(!CancellationToken::with_deadline(Duration::from_secs(3600)).is_cancelled());
    }

    #[test]
    fn child_keeps_the_earlier_deadline() {
        let parent = CancellationToken::with_deadline(Duration::ZERO);
        assert!(parent.child_with_budget(Some(Duration::from_secs(3600))).is_cancelled());

        let parent = CancellationToken::new();
        let child = parent.child_with_budget(None);
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
