use std::collections::{BTreeMap, HashMap, HashSet};

use network_client::{
    db::{Change, Changeset, EntityStore, RollupOp, StoreError},
    domain::{PendingKey, PendingRecord, Pulse, RollupKey, Target},
};
use time::OffsetDateTime;

/// Staged view of the store for one unit of work.
///
/// Reads fall through to committed state unless this unit already staged a
/// value. Nothing reaches the store until [`UnitOfWork::finish`] hands the
/// changeset to `commit`.
pub struct UnitOfWork<'a> {
    store: &'a dyn EntityStore,
    pulses: HashMap<(String, OffsetDateTime), Pulse>,
    pending: BTreeMap<PendingKey, Option<PendingRecord>>,
    pending_loaded: HashSet<Target>,
    pending_committed: HashSet<PendingKey>,
    pending_dirty: HashSet<PendingKey>,
    quarter_hours: HashSet<RollupKey>,
    changes: Changeset,
}

impl<'a> UnitOfWork<'a> {
    pub fn new(store: &'a dyn EntityStore) -> Self {
        Self {
            store,
            pulses: HashMap::new(),
            pending: BTreeMap::new(),
            pending_loaded: HashSet::new(),
            pending_committed: HashSet::new(),
            pending_dirty: HashSet::new(),
            quarter_hours: HashSet::new(),
            changes: Changeset::new(),
        }
    }

    pub fn store(&self) -> &'a dyn EntityStore {
        self.store
    }

    pub async fn pulse(&self, meter_id: &str, ts: OffsetDateTime) -> Result<Option<Pulse>, StoreError> {
        if let Some(p) = self.pulses.get(&(meter_id.to_string(), ts)) {
            return Ok(Some(p.clone()));
        }
        self.store.pulse(meter_id, ts).await
    }

    pub async fn has_pulse(&self, meter_id: &str, ts: OffsetDateTime) -> Result<bool, StoreError> {
        Ok(self.pulse(meter_id, ts).await?.is_some())
    }

    pub async fn latest_pulse_before(
        &self,
        meter_id: &str,
        before: OffsetDateTime,
    ) -> Result<Option<Pulse>, StoreError> {
        let staged = self
            .pulses
            .values()
            .filter(|p| p.meter_id == meter_id && p.ts < before)
            .max_by_key(|p| p.ts)
            .cloned();
        let committed = self.store.latest_pulse_before(meter_id, before).await?;

        Ok(match (staged, committed) {
            (Some(a), Some(b)) => Some(if a.ts > b.ts { a } else { b }),
            (a, b) => a.or(b),
        })
    }

    pub fn insert_pulse(&mut self, pulse: Pulse) {
        self.pulses
            .insert((pulse.meter_id.clone(), pulse.ts), pulse.clone());
        self.changes.push(Change::InsertPulse(pulse));
    }

    /// Live pending records of `target`, ordered by tick.
    pub async fn pending_for(&mut self, target: &Target) -> Result<Vec<PendingRecord>, StoreError> {
        if self.pending_loaded.insert(target.clone()) {
            for rec in self.store.pending_for(target).await? {
                self.pending_committed.insert(rec.key.clone());
                self.pending.entry(rec.key.clone()).or_insert(Some(rec));
            }
        }

        Ok(self
            .pending
            .iter()
            .filter(|(k, _)| &k.target == target)
            .filter_map(|(_, rec)| rec.clone())
            .collect())
    }

    pub fn put_pending(&mut self, rec: PendingRecord) {
        self.pending_dirty.insert(rec.key.clone());
        self.pending.insert(rec.key.clone(), Some(rec));
    }

    pub fn delete_pending(&mut self, key: &PendingKey) {
        self.pending_dirty.insert(key.clone());
        self.pending.insert(key.clone(), None);
    }

    pub async fn quarter_hour_exists(&self, key: &RollupKey) -> Result<bool, StoreError> {
        if self.quarter_hours.contains(key) {
            return Ok(true);
        }
        Ok(self.store.rollup(key).await?.is_some())
    }

    pub fn rollup(&mut self, key: RollupKey, op: RollupOp) {
        if matches!(op, RollupOp::Set(_)) {
            self.quarter_hours.insert(key.clone());
        }
        self.changes.push(Change::Rollup { key, op });
    }

    pub fn stage(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn finish(self) -> Changeset {
        let mut changes = self.changes;
        for key in self.pending_dirty {
            match self.pending.get(&key) {
                Some(Some(rec)) => changes.push(Change::PutPending(rec.clone())),
                Some(None) if self.pending_committed.contains(&key) => {
                    changes.push(Change::DeletePending(key))
                }
                _ => {}
            }
        }
        changes
    }
}
