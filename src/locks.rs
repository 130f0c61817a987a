use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held for the whole of one funnel's cycle; dropping it releases the funnel.
pub struct FunnelGuard {
    funnel_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl FunnelGuard {
    pub fn funnel_id(&self) -> &str {
        &self.funnel_id
    }
}

/// Single-flight guard: at most one cycle per funnel, cycles for different
/// funnels run freely.
#[derive(Clone, Default)]
pub struct FunnelLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl FunnelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when a cycle for `funnel_id` is already running.
    pub async fn try_acquire(&self, funnel_id: &str) -> Option<FunnelGuard> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(funnel_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.try_lock_owned().ok()?;
        Some(FunnelGuard {
            funnel_id: funnel_id.to_string(),
            _guard: guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::FunnelLocks;

    #[tokio::test]
    async fn second_acquire_for_same_funnel_is_refused() {
        let locks = FunnelLocks::new();
        let first = locks.try_acquire("quiz").await.expect("first");
        assert_eq!(first.funnel_id(), "quiz");
        assert!(locks.try_acquire("quiz").await.is_none());
        assert!(locks.try_acquire("checkout").await.is_some());

        drop(first);
        assert!(locks.try_acquire("quiz").await.is_some());
    }
}
