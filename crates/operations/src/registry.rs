//! Process-wide table of live operation records
//!
//! Records are keyed by identifier and link to their parent by identifier,
//! never by pointer. Each record carries two locks. `state` guards status,
//! progress and hierarchy and is only held for short critical sections.
//! `delivery` serialises the notifications of one operation and is held while
//! listeners run, so queries (which only take `state`) stay available to
//! listeners being notified.
//!
//! Lock order is `delivery` before `state`. At most one `state` lock is held
//! at a time, except on registration where the parent's is held while the
//! not yet reachable child is inserted.

use buildops_errors::OperationError;
use buildops_types::{
    OperationDescriptor, OperationId, OperationSnapshot, OperationState, OperationStatus, Sequence,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique operation identifier
pub(crate) fn allocate_id() -> OperationId {
    OperationId::from_raw(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
}

/// A committed state change, handed to the notifier under the delivery lock
#[derive(Debug)]
pub struct Transition<'a> {
    pub descriptor: &'a OperationDescriptor,
    pub sequence: Sequence,
    pub timestamp: DateTime<Utc>,
    pub change: Change<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change<'a> {
    Started,
    Progressed(&'a str),
    Finished {
        status: OperationStatus,
        duration: Duration,
    },
}

#[derive(Debug)]
struct Record {
    status: OperationStatus,
    progress_messages: Vec<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    finished_at: Option<DateTime<Utc>>,
    start_sequence: Sequence,
    last_sequence: Sequence,
    /// Start event delivered; until then the record is invisible to callers
    announced: bool,
    children: Vec<OperationId>,
    running_children: BTreeSet<OperationId>,
    latest_child_finish: Option<DateTime<Utc>>,
}

impl Record {
    fn new() -> Self {
        Self {
            status: OperationStatus::Running,
            progress_messages: Vec::new(),
            started_at: Utc::now(),
            started: Instant::now(),
            finished_at: None,
            start_sequence: Sequence::from_raw(0),
            last_sequence: Sequence::from_raw(0),
            announced: false,
            children: Vec::new(),
            running_children: BTreeSet::new(),
            latest_child_finish: None,
        }
    }

    fn snapshot(&self, descriptor: &OperationDescriptor) -> OperationSnapshot {
        OperationSnapshot {
            descriptor: descriptor.clone(),
            state: OperationState {
                status: self.status,
                progress_messages: self.progress_messages.clone(),
                started_at: self.started_at,
                finished_at: self.finished_at,
                start_sequence: self.start_sequence,
                last_sequence: self.last_sequence,
            },
            running_children: self.running_children.iter().copied().collect(),
        }
    }

    fn is_live_parent(&self) -> bool {
        self.announced && self.status == OperationStatus::Running
    }
}

#[derive(Debug)]
struct Slot {
    descriptor: OperationDescriptor,
    delivery: Mutex<()>,
    state: Mutex<Record>,
}

impl Slot {
    fn new(descriptor: OperationDescriptor) -> Self {
        Self {
            descriptor,
            delivery: Mutex::new(()),
            state: Mutex::new(Record::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, Record> {
        lock(&self.state)
    }

    fn delivery(&self) -> MutexGuard<'_, ()> {
        lock(&self.delivery)
    }
}

type SharedSlot = Arc<Slot>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // poisoned only by a listener panic with isolation off; state is
    // committed before listeners run
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `notify`, keeping a listener panic until the caller's bookkeeping is done
fn catch_notify<F>(notify: F, transition: &Transition<'_>) -> Option<Box<dyn Any + Send>>
where
    F: FnOnce(&Transition<'_>),
{
    catch_unwind(AssertUnwindSafe(|| notify(transition))).err()
}

/// Arena of operation records with authoritative hierarchy and status
#[derive(Debug, Default)]
pub struct OperationRegistry {
    records: DashMap<OperationId, SharedSlot>,
    /// Final status of evicted records
    tombstones: DashMap<OperationId, OperationStatus>,
    sequence: AtomicU64,
}

impl OperationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: OperationId) -> Option<SharedSlot> {
        self.records.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn next_sequence(&self) -> Sequence {
        Sequence::from_raw(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn insert(&self, descriptor: OperationDescriptor) -> Result<SharedSlot, OperationError> {
        let id = descriptor.id;
        if self.tombstones.contains_key(&id) {
            return Err(OperationError::DuplicateId { id: id.as_u64() });
        }
        match self.records.entry(id) {
            Entry::Occupied(_) => Err(OperationError::DuplicateId { id: id.as_u64() }),
            Entry::Vacant(entry) => {
                let slot = Arc::new(Slot::new(descriptor));
                entry.insert(Arc::clone(&slot));
                Ok(slot)
            }
        }
    }

    /// Stop counting a terminal operation as a running child of its parent
    fn release_parent(&self, descriptor: &OperationDescriptor, finished_at: DateTime<Utc>) {
        let Some(parent) = descriptor.parent_id.and_then(|parent_id| self.slot(parent_id)) else {
            return;
        };
        let mut parent = parent.state();
        parent.running_children.remove(&descriptor.id);
        parent.latest_child_finish = Some(
            parent
                .latest_child_finish
                .map_or(finished_at, |latest| latest.max(finished_at)),
        );
    }

    /// Insert a new running operation and announce it
    ///
    /// `notify` runs under the new record's delivery lock, after its start
    /// sequence has been allocated. If `notify` panics, the operation is
    /// closed as failed (no finish event is sent) and its parent stops
    /// waiting for it before the panic continues.
    ///
    /// # Errors
    ///
    /// `UnknownParent` if the descriptor names a parent that is not running,
    /// `DuplicateId` if the identifier was registered before.
    pub fn register<F>(&self, descriptor: OperationDescriptor, notify: F) -> Result<(), OperationError>
    where
        F: FnOnce(&Transition<'_>),
    {
        let id = descriptor.id;
        let parent_id = descriptor.parent_id;
        let slot = match parent_id {
            Some(parent_id) => {
                let unknown = OperationError::UnknownParent {
                    parent: parent_id.as_u64(),
                };
                let parent = self.slot(parent_id).ok_or_else(|| unknown.clone())?;
                let mut parent = parent.state();
                if !parent.is_live_parent() {
                    return Err(unknown);
                }
                // still holding the parent: it cannot finish before it counts this child
                let slot = self.insert(descriptor)?;
                parent.children.push(id);
                parent.running_children.insert(id);
                slot
            }
            None => self.insert(descriptor)?,
        };

        let _delivery = slot.delivery();
        let (sequence, timestamp) = {
            let mut record = slot.state();
            let sequence = self.next_sequence();
            record.start_sequence = sequence;
            record.last_sequence = sequence;
            record.started_at = Utc::now();
            record.started = Instant::now();
            (sequence, record.started_at)
        };
        let panicked = catch_notify(
            notify,
            &Transition {
                descriptor: &slot.descriptor,
                sequence,
                timestamp,
                change: Change::Started,
            },
        );
        let abandoned_at = {
            let mut record = slot.state();
            record.announced = true;
            // the producer never gets a handle to finish it with
            panicked.is_some().then(|| {
                let finished_at = Utc::now().max(record.started_at);
                record.status = OperationStatus::Failed;
                record.finished_at = Some(finished_at);
                finished_at
            })
        };

        if let (Some(payload), Some(finished_at)) = (panicked, abandoned_at) {
            self.release_parent(&slot.descriptor, finished_at);
            resume_unwind(payload);
        }
        Ok(())
    }

    /// Append a progress message to a running operation
    ///
    /// # Errors
    ///
    /// `NotRunning` once the operation is terminal, `UnknownOperation` if it
    /// was never registered.
    pub fn progress<F>(&self, id: OperationId, message: String, notify: F) -> Result<(), OperationError>
    where
        F: FnOnce(&Transition<'_>),
    {
        let Some(slot) = self.slot(id) else {
            return Err(match self.tombstones.get(&id) {
                Some(status) => OperationError::NotRunning {
                    id: id.as_u64(),
                    status: status.to_string(),
                },
                None => OperationError::UnknownOperation { id: id.as_u64() },
            });
        };

        let _delivery = slot.delivery();
        let sequence = {
            let mut record = slot.state();
            if !record.announced {
                return Err(OperationError::UnknownOperation { id: id.as_u64() });
            }
            if record.status.is_terminal() {
                return Err(OperationError::NotRunning {
                    id: id.as_u64(),
                    status: record.status.to_string(),
                });
            }
            let sequence = self.next_sequence();
            record.last_sequence = sequence;
            record.progress_messages.push(message.clone());
            sequence
        };

        notify(&Transition {
            descriptor: &slot.descriptor,
            sequence,
            timestamp: Utc::now(),
            change: Change::Progressed(&message),
        });
        Ok(())
    }

    /// Move a running operation to a terminal status
    ///
    /// The status is committed first, then `notify` runs under the delivery
    /// lock. The parent only stops counting this operation as running after
    /// `notify` returned (or panicked), which is what keeps a parent's finish
    /// event behind all of its children's.
    ///
    /// # Errors
    ///
    /// `AlreadyFinished` for a terminal operation, `InvalidTransition` if
    /// `status` is not terminal, `ChildrenStillRunning` while any direct
    /// child runs, `UnknownOperation` if the id was never registered.
    pub fn transition<F>(
        &self,
        id: OperationId,
        status: OperationStatus,
        evict: bool,
        notify: F,
    ) -> Result<(), OperationError>
    where
        F: FnOnce(&Transition<'_>),
    {
        let Some(slot) = self.slot(id) else {
            return Err(match self.tombstones.get(&id) {
                Some(previous) => OperationError::AlreadyFinished {
                    id: id.as_u64(),
                    status: previous.to_string(),
                },
                None => OperationError::UnknownOperation { id: id.as_u64() },
            });
        };

        let delivery = slot.delivery();
        let (sequence, finished_at, duration) = {
            let mut record = slot.state();
            if !record.announced {
                return Err(OperationError::UnknownOperation { id: id.as_u64() });
            }
            if record.status.is_terminal() {
                return Err(OperationError::AlreadyFinished {
                    id: id.as_u64(),
                    status: record.status.to_string(),
                });
            }
            if !record.status.can_transition_to(status) {
                return Err(OperationError::InvalidTransition {
                    id: id.as_u64(),
                    from: record.status.to_string(),
                    to: status.to_string(),
                });
            }
            if !record.running_children.is_empty() {
                return Err(OperationError::ChildrenStillRunning {
                    id: id.as_u64(),
                    running: record.running_children.iter().map(|c| c.as_u64()).collect(),
                });
            }

            // never before our own start nor before any child's finish
            let mut finished_at = Utc::now().max(record.started_at);
            if let Some(child_finish) = record.latest_child_finish {
                finished_at = finished_at.max(child_finish);
            }
            let sequence = self.next_sequence();
            record.status = status;
            record.finished_at = Some(finished_at);
            record.last_sequence = sequence;
            (sequence, finished_at, record.started.elapsed())
        };

        let panicked = catch_notify(
            notify,
            &Transition {
                descriptor: &slot.descriptor,
                sequence,
                timestamp: finished_at,
                change: Change::Finished { status, duration },
            },
        );
        drop(delivery);

        self.release_parent(&slot.descriptor, finished_at);
        if evict {
            self.evict(id, status);
        }
        if let Some(payload) = panicked {
            resume_unwind(payload);
        }
        Ok(())
    }

    fn evict(&self, id: OperationId, status: OperationStatus) {
        self.tombstones.insert(id, status);
        self.records.remove(&id);
    }

    /// Point-in-time copy of an operation
    ///
    /// # Errors
    ///
    /// `UnknownOperation` if the id is not registered (or was evicted).
    pub fn lookup(&self, id: OperationId) -> Result<OperationSnapshot, OperationError> {
        let unknown = || OperationError::UnknownOperation { id: id.as_u64() };
        let slot = self.slot(id).ok_or_else(unknown)?;
        let record = slot.state();
        if !record.announced {
            return Err(unknown());
        }
        Ok(record.snapshot(&slot.descriptor))
    }

    /// Whether `id` is announced and running
    #[must_use]
    pub fn is_running(&self, id: OperationId) -> bool {
        self.slot(id)
            .is_some_and(|slot| slot.state().is_live_parent())
    }

    /// Direct children of an operation, in start order
    ///
    /// # Errors
    ///
    /// `UnknownOperation` if the id is not registered.
    pub fn children(&self, id: OperationId) -> Result<Vec<OperationId>, OperationError> {
        let slot = self
            .slot(id)
            .ok_or(OperationError::UnknownOperation { id: id.as_u64() })?;
        let children = slot.state().children.clone();
        Ok(children)
    }

    fn all_slots(&self) -> Vec<SharedSlot> {
        // clone out first; record locks are never taken under a shard lock
        self.records
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshots of every running operation, in start order
    #[must_use]
    pub fn running(&self) -> Vec<OperationSnapshot> {
        let mut running: Vec<OperationSnapshot> = self
            .all_slots()
            .iter()
            .filter_map(|slot| {
                let record = slot.state();
                record
                    .is_live_parent()
                    .then(|| record.snapshot(&slot.descriptor))
            })
            .collect();
        running.sort_by_key(|snapshot| snapshot.state.start_sequence);
        running
    }

    /// Number of running operations
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.all_slots()
            .iter()
            .filter(|slot| slot.state().is_live_parent())
            .count()
    }

    /// Number of records currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Evict every terminal record, returning how many were removed
    ///
    /// A terminal record's subtree is terminal too, since finishing requires
    /// all children to be terminal first.
    pub fn evict_finished(&self) -> usize {
        let finished: Vec<(OperationId, OperationStatus)> = self
            .all_slots()
            .iter()
            .filter_map(|slot| {
                let status = slot.state().status;
                status.is_terminal().then_some((slot.descriptor.id, status))
            })
            .collect();
        for (id, status) in &finished {
            self.evict(*id, *status);
        }
        finished.len()
    }

    /// Forget the final status of evicted records, returning how many were dropped
    ///
    /// Afterwards a forgotten operation answers `UnknownOperation`.
    pub fn clear_tombstones(&self) -> usize {
        let dropped = self.tombstones.len();
        self.tombstones.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildops_types::OperationKind;

    fn descriptor(parent: Option<OperationId>) -> OperationDescriptor {
        OperationDescriptor::builder(OperationKind::Generic, "op").build(allocate_id(), parent)
    }

    fn start(registry: &OperationRegistry, parent: Option<OperationId>) -> OperationId {
        let descriptor = descriptor(parent);
        let id = descriptor.id;
        registry.register(descriptor, |_| {}).unwrap();
        id
    }

    fn finish(registry: &OperationRegistry, id: OperationId) -> Result<(), OperationError> {
        registry.transition(id, OperationStatus::Succeeded, false, |_| {})
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let registry = OperationRegistry::new();
        let descriptor = descriptor(None);
        registry.register(descriptor.clone(), |_| {}).unwrap();
        let err = registry.register(descriptor, |_| {}).unwrap_err();
        assert!(matches!(err, OperationError::DuplicateId { .. }));
    }

    #[test]
    fn parent_must_be_running() {
        let registry = OperationRegistry::new();
        let parent = start(&registry, None);
        finish(&registry, parent).unwrap();

        let err = registry.register(descriptor(Some(parent)), |_| {}).unwrap_err();
        assert_eq!(
            err,
            OperationError::UnknownParent {
                parent: parent.as_u64()
            }
        );
    }

    #[test]
    fn running_is_not_a_valid_target() {
        let registry = OperationRegistry::new();
        let id = start(&registry, None);
        let err = registry
            .transition(id, OperationStatus::Running, false, |_| {})
            .unwrap_err();
        assert!(matches!(err, OperationError::InvalidTransition { .. }));
    }

    #[test]
    fn sequences_increase_across_transitions() {
        let registry = OperationRegistry::new();
        let mut seen = Vec::new();
        let root = descriptor(None);
        let root_id = root.id;
        registry
            .register(root, |t| seen.push(t.sequence))
            .unwrap();
        registry
            .progress(root_id, "halfway".into(), |t| seen.push(t.sequence))
            .unwrap();
        registry
            .transition(root_id, OperationStatus::Succeeded, false, |t| {
                seen.push(t.sequence);
            })
            .unwrap();

        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        let snapshot = registry.lookup(root_id).unwrap();
        assert_eq!(snapshot.state.progress_messages, vec!["halfway"]);
        assert_eq!(snapshot.state.last_sequence, seen[2]);
    }

    #[test]
    fn child_finish_never_after_parent_finish() {
        let registry = OperationRegistry::new();
        let parent = start(&registry, None);
        let child = start(&registry, Some(parent));
        finish(&registry, child).unwrap();
        finish(&registry, parent).unwrap();

        let child_state = registry.lookup(child).unwrap().state;
        let parent_state = registry.lookup(parent).unwrap().state;
        assert!(child_state.finished_at.unwrap() <= parent_state.finished_at.unwrap());
        assert!(child_state.finished_at.unwrap() >= child_state.started_at);
    }

    #[test]
    fn evicted_records_keep_their_terminal_answers() {
        let registry = OperationRegistry::new();
        let id = start(&registry, None);
        registry
            .transition(id, OperationStatus::FailedExpectedly, true, |_| {})
            .unwrap();

        assert!(registry.is_empty());
        assert!(matches!(
            registry.lookup(id),
            Err(OperationError::UnknownOperation { .. })
        ));
        assert!(matches!(
            finish(&registry, id),
            Err(OperationError::AlreadyFinished { .. })
        ));
        assert!(matches!(
            registry.progress(id, "late".into(), |_| {}),
            Err(OperationError::NotRunning { .. })
        ));
    }

    #[test]
    fn evict_finished_leaves_running_records() {
        let registry = OperationRegistry::new();
        let root = start(&registry, None);
        let done = start(&registry, Some(root));
        let _running = start(&registry, Some(root));
        finish(&registry, done).unwrap();

        assert_eq!(registry.evict_finished(), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.running_count(), 2);
        // evicted children stay listed by id
        assert_eq!(registry.children(root).unwrap().len(), 2);
    }

    #[test]
    fn notifier_can_query_the_registry() {
        let registry = OperationRegistry::new();
        let parent = start(&registry, None);
        let child = descriptor(Some(parent));
        let child_id = child.id;

        let mut seen = Vec::new();
        registry
            .register(child, |_| {
                seen.push(registry.running().len());
                seen.push(registry.lookup(parent).unwrap().running_children.len());
            })
            .unwrap();
        registry
            .transition(child_id, OperationStatus::Succeeded, false, |_| {
                let snapshot = registry.lookup(child_id).unwrap();
                assert_eq!(snapshot.status(), OperationStatus::Succeeded);
                seen.push(registry.running_count());
            })
            .unwrap();

        // the child is not announced during its own start, nor running during its finish
        assert_eq!(seen, vec![1, 1, 1]);
    }

    #[test]
    fn panicking_start_notifier_releases_the_parent() {
        let registry = OperationRegistry::new();
        let parent = start(&registry, None);
        let child = descriptor(Some(parent));
        let child_id = child.id;

        let caught = catch_unwind(AssertUnwindSafe(|| {
            registry.register(child, |_| panic!("listener bug"))
        }));
        assert!(caught.is_err());

        let snapshot = registry.lookup(child_id).unwrap();
        assert_eq!(snapshot.status(), OperationStatus::Failed);
        assert!(registry.lookup(parent).unwrap().running_children.is_empty());
        assert!(matches!(
            finish(&registry, child_id),
            Err(OperationError::AlreadyFinished { .. })
        ));
        finish(&registry, parent).unwrap();
    }

    #[test]
    fn panicking_finish_notifier_releases_the_parent() {
        let registry = OperationRegistry::new();
        let parent = start(&registry, None);
        let child = start(&registry, Some(parent));

        let caught = catch_unwind(AssertUnwindSafe(|| {
            registry.transition(child, OperationStatus::Succeeded, true, |_| {
                panic!("listener bug")
            })
        }));
        assert!(caught.is_err());

        assert!(matches!(
            finish(&registry, child),
            Err(OperationError::AlreadyFinished { .. })
        ));
        finish(&registry, parent).unwrap();
    }

    #[test]
    fn cleared_tombstones_are_forgotten() {
        let registry = OperationRegistry::new();
        let id = start(&registry, None);
        finish(&registry, id).unwrap();
        assert_eq!(registry.evict_finished(), 1);
        assert_eq!(registry.clear_tombstones(), 1);
        assert!(matches!(
            finish(&registry, id),
            Err(OperationError::UnknownOperation { .. })
        ));
    }
}
