use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use network_client::domain::Target;
use tokio::sync::OwnedMutexGuard;

/// One async mutex per reconciliation target.
///
/// Units of work touching the same zone or line run one after another; units
/// on disjoint targets run in parallel. Guards are taken in sorted order so
/// that meters bordering two targets cannot deadlock.
#[derive(Default)]
pub struct TargetLocks {
    inner: Mutex<HashMap<Target, Arc<tokio::sync::Mutex<()>>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_all(&self, targets: &[Target]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted = targets.to_vec();
        sorted.sort();
        sorted.dedup();

        let mutexes: Vec<_> = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            sorted
                .iter()
                .map(|t| map.entry(t.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for m in mutexes {
            guards.push(m.lock_owned().await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn overlapping_targets_are_serialized() {
        let locks = Arc::new(TargetLocks::new());
        let red = Target::Zone("red".into());
        let yellow = Target::Zone("yellow".into());

        let held = locks.lock_all(&[yellow.clone(), red.clone(), red.clone()]).await;
        assert_eq!(held.len(), 2);

        let l = locks.clone();
        let waiter = tokio::spawn(async move { l.lock_all(&[Target::Zone("red".into())]).await.len() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn disjoint_targets_do_not_block() {
        let locks = TargetLocks::new();
        let _red = locks.lock_all(&[Target::Zone("red".into())]).await;
        let line = locks.lock_all(&[Target::Line("tsm".into())]).await;
        assert_eq!(line.len(), 1);
    }
}
