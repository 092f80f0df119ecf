//! State store interface, per-stack leases and an in-memory store
//!
//! The store is the only global state. Stacks, the append-only journal and
//! change sets are all keyed by stack id; a lease per stack serializes runs.

use crate::error::{Error, Result, StoreError};
use crate::model::{ChangeSet, Operation, Stack};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Durable state for stacks, their journals and change sets
pub trait StackStore: Send + Sync {
    fn load_stack(&self, stack_id: &str) -> std::result::Result<Option<Stack>, StoreError>;

    fn save_stack(&self, stack: &Stack) -> std::result::Result<(), StoreError>;

    /// Remove a stack record. Its journal is kept.
    fn delete_stack(&self, stack_id: &str) -> std::result::Result<(), StoreError>;

    /// Stack ids, sorted
    fn list_stacks(&self) -> std::result::Result<Vec<String>, StoreError>;

    /// Append a journal entry, returning its sequence number
    fn append_operation(&self, operation: &Operation) -> std::result::Result<u64, StoreError>;

    /// Journal entries of a stack in append order
    fn operations(&self, stack_id: &str) -> std::result::Result<Vec<Operation>, StoreError>;

    fn save_change_set(&self, change_set: &ChangeSet) -> std::result::Result<(), StoreError>;

    fn load_change_set(&self, id: &str) -> std::result::Result<Option<ChangeSet>, StoreError>;

    fn delete_change_set(&self, id: &str) -> std::result::Result<(), StoreError>;

    /// Change sets planned for a stack, oldest first
    fn list_change_sets(&self, stack_id: &str) -> std::result::Result<Vec<ChangeSet>, StoreError>;

    /// Take the stack lease for `holder`. Returns false if someone else holds it.
    fn try_acquire_lease(&self, stack_id: &str, holder: &str) -> std::result::Result<bool, StoreError>;

    /// Release the lease if `holder` owns it
    fn release_lease(&self, stack_id: &str, holder: &str) -> std::result::Result<(), StoreError>;
}

/// Exclusive right to run an operation on a stack
///
/// Released when dropped.
pub struct StackLease<'a> {
    store: &'a dyn StackStore,
    stack_id: String,
    holder: String,
}

impl<'a> StackLease<'a> {
    /// Acquire the lease or fail fast with `StackLocked`
    pub fn acquire(store: &'a dyn StackStore, stack_id: &str) -> Result<Self> {
        let holder = uuid::Uuid::new_v4().to_string();
        if !store.try_acquire_lease(stack_id, &holder)? {
            return Err(Error::StackLocked(stack_id.to_string()));
        }
        log::debug!("acquired lease on stack {stack_id}");
        Ok(Self {
            store,
            stack_id: stack_id.to_string(),
            holder,
        })
    }

    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }
}

impl Drop for StackLease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_lease(&self.stack_id, &self.holder) {
            log::error!("failed to release lease on stack {}: {e}", self.stack_id);
        } else {
            log::debug!("released lease on stack {}", self.stack_id);
        }
    }
}

#[derive(Default)]
struct MemoryState {
    stacks: HashMap<String, Stack>,
    operations: Vec<Operation>,
    change_sets: HashMap<String, ChangeSet>,
    leases: HashMap<String, String>,
}

/// Non-durable store for tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl StackStore for MemoryStore {
    fn load_stack(&self, stack_id: &str) -> std::result::Result<Option<Stack>, StoreError> {
        Ok(self.lock().stacks.get(stack_id).cloned())
    }

    fn save_stack(&self, stack: &Stack) -> std::result::Result<(), StoreError> {
        self.lock().stacks.insert(stack.id.clone(), stack.clone());
        Ok(())
    }

    fn delete_stack(&self, stack_id: &str) -> std::result::Result<(), StoreError> {
        self.lock().stacks.remove(stack_id);
        Ok(())
    }

    fn list_stacks(&self) -> std::result::Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.lock().stacks.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn append_operation(&self, operation: &Operation) -> std::result::Result<u64, StoreError> {
        let mut state = self.lock();
        let sequence = state.operations.len() as u64 + 1;
        let mut entry = operation.clone();
        entry.sequence = sequence;
        state.operations.push(entry);
        Ok(sequence)
    }

    fn operations(&self, stack_id: &str) -> std::result::Result<Vec<Operation>, StoreError> {
        Ok(self
            .lock()
            .operations
            .iter()
            .filter(|op| op.stack_id == stack_id)
            .cloned()
            .collect())
    }

    fn save_change_set(&self, change_set: &ChangeSet) -> std::result::Result<(), StoreError> {
        self.lock()
            .change_sets
            .insert(change_set.id.clone(), change_set.clone());
        Ok(())
    }

    fn load_change_set(&self, id: &str) -> std::result::Result<Option<ChangeSet>, StoreError> {
        Ok(self.lock().change_sets.get(id).cloned())
    }

    fn delete_change_set(&self, id: &str) -> std::result::Result<(), StoreError> {
        self.lock().change_sets.remove(id);
        Ok(())
    }

    fn list_change_sets(&self, stack_id: &str) -> std::result::Result<Vec<ChangeSet>, StoreError> {
        let mut sets: Vec<ChangeSet> = self
            .lock()
            .change_sets
            .values()
            .filter(|cs| cs.stack_id == stack_id)
            .cloned()
            .collect();
        sets.sort_by_key(|cs| cs.created_at);
        Ok(sets)
    }

    fn try_acquire_lease(&self, stack_id: &str, holder: &str) -> std::result::Result<bool, StoreError> {
        let mut state = self.lock();
        if state.leases.contains_key(stack_id) {
            return Ok(false);
        }
        state.leases.insert(stack_id.to_string(), holder.to_string());
        Ok(true)
    }

    fn release_lease(&self, stack_id: &str, holder: &str) -> std::result::Result<(), StoreError> {
        let mut state = self.lock();
        if state.leases.get(stack_id).is_some_and(|h| h == holder) {
            state.leases.remove(stack_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationKind, Phase};

    #[test]
    fn test_lease_is_exclusive_until_dropped() {
        let store = MemoryStore::new();
        let lease = StackLease::acquire(&store, "prod").unwrap();

        let err = StackLease::acquire(&store, "prod").err().unwrap();
        assert!(matches!(err, Error::StackLocked(ref id) if id == "prod"));

        // Other stacks are independent
        let _other = StackLease::acquire(&store, "staging").unwrap();

        drop(lease);
        assert!(StackLease::acquire(&store, "prod").is_ok());
    }

    #[test]
    fn test_release_by_non_holder_is_ignored() {
        let store = MemoryStore::new();
        assert!(store.try_acquire_lease("prod", "a").unwrap());
        store.release_lease("prod", "b").unwrap();
        assert!(!store.try_acquire_lease("prod", "c").unwrap());
    }

    #[test]
    fn test_operations_are_sequenced_per_store() {
        let store = MemoryStore::new();
        let a = Operation::intent("prod", "r1", Phase::Forward, 0, "A", OperationKind::Create, "t1");
        let b = Operation::intent("staging", "r2", Phase::Forward, 0, "B", OperationKind::Create, "t2");

        assert_eq!(store.append_operation(&a).unwrap(), 1);
        assert_eq!(store.append_operation(&b).unwrap(), 2);

        let prod = store.operations("prod").unwrap();
        assert_eq!(prod.len(), 1);
        assert_eq!(prod[0].sequence, 1);
    }
}
