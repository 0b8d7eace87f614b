//! Memory-manager contract.
//!
//! A task may only run once the chunk table files it reads are locked in
//! memory. The manager is the single globally shared resource on a worker;
//! its contract is pure request/release. The flexible flag is passed when
//! the requesting scheduler is otherwise idle, authorizing the manager to
//! reserve memory speculatively for a future attempt instead of refusing
//! outright.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use smq_common::metrics::global_metrics;
use tracing::debug;

/// Opaque handle for a granted lock set.
pub type HandleId = u64;

/// No lock held.
pub const HANDLE_INVALID: HandleId = 0;
/// Granted trivially: the file set was empty.
pub const HANDLE_EMPTY: HandleId = 1;

const FIRST_REAL_HANDLE: HandleId = 2;

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// All files locked; `bytes` now count against the budget.
    Locked { handle: HandleId, bytes: u64 },
    /// Not locked, but the request was flexible and memory was reserved for
    /// a future attempt.
    Reserved,
    /// Not locked; try again later.
    Insufficient,
}

impl LockResult {
    /// Handle when locked, `None` otherwise.
    pub fn handle(&self) -> Option<HandleId> {
        match self {
            LockResult::Locked { handle, .. } => Some(*handle),
            _ => None,
        }
    }
}

/// Contract between schedulers and the memory manager.
pub trait MemMan: Send + Sync {
    /// Try to lock `files` in memory.
    fn lock(&self, files: &[String], flexible: bool) -> LockResult;

    /// Release a previously granted handle. Unknown or empty handles are
    /// ignored.
    fn unlock(&self, handle: HandleId);

    /// Total bytes currently locked.
    fn locked_bytes(&self) -> u64;

    /// Number of outstanding real handles.
    fn handle_count(&self) -> usize;
}

/// Manager that never refuses. Used when no memory budget is configured;
/// still does handle accounting so unlock discipline stays observable.
#[derive(Debug, Default)]
pub struct MemManNone {
    next: AtomicU64,
    outstanding: Mutex<HashMap<HandleId, usize>>,
}

impl MemManNone {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(FIRST_REAL_HANDLE),
            outstanding: Mutex::new(HashMap::new()),
        }
    }
}

impl MemMan for MemManNone {
    fn lock(&self, files: &[String], _flexible: bool) -> LockResult {
        if files.is_empty() {
            return LockResult::Locked {
                handle: HANDLE_EMPTY,
                bytes: 0,
            };
        }
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.outstanding
            .lock()
            .expect("memman lock")
            .insert(handle, files.len());
        global_metrics().inc_memman_lock(true);
        LockResult::Locked { handle, bytes: 0 }
    }

    fn unlock(&self, handle: HandleId) {
        if handle <= HANDLE_EMPTY {
            return;
        }
        self.outstanding.lock().expect("memman lock").remove(&handle);
    }

    fn locked_bytes(&self) -> u64 {
        0
    }

    fn handle_count(&self) -> usize {
        self.outstanding.lock().expect("memman lock").len()
    }
}

#[derive(Debug, Default)]
struct BudgetState {
    locked: HashMap<HandleId, u64>,
    locked_bytes: u64,
    reserved_bytes: u64,
    next: HandleId,
}

/// Budgeted manager: each file costs a fixed number of bytes against a
/// total budget. A refused flexible request earmarks the needed bytes as
/// reserved so the retry is expected to succeed once running work unlocks.
#[derive(Debug)]
pub struct BudgetMemMan {
    budget_bytes: u64,
    bytes_per_file: u64,
    state: Mutex<BudgetState>,
}

impl BudgetMemMan {
    pub fn new(budget_bytes: u64, bytes_per_file: u64) -> Self {
        Self {
            budget_bytes,
            bytes_per_file,
            state: Mutex::new(BudgetState {
                next: FIRST_REAL_HANDLE,
                ..BudgetState::default()
            }),
        }
    }

    /// Bytes currently earmarked by refused flexible requests.
    pub fn reserved_bytes(&self) -> u64 {
        self.state.lock().expect("memman lock").reserved_bytes
    }
}

impl MemMan for BudgetMemMan {
    fn lock(&self, files: &[String], flexible: bool) -> LockResult {
        if files.is_empty() {
            return LockResult::Locked {
                handle: HANDLE_EMPTY,
                bytes: 0,
            };
        }
        let need = files.len() as u64 * self.bytes_per_file;
        let mut state = self.state.lock().expect("memman lock");
        if state.locked_bytes + need <= self.budget_bytes {
            let handle = state.next;
            state.next += 1;
            state.locked.insert(handle, need);
            state.locked_bytes += need;
            state.reserved_bytes = state.reserved_bytes.saturating_sub(need);
            global_metrics().inc_memman_lock(true);
            global_metrics().set_memman_bytes_locked(state.locked_bytes);
            debug!(handle, bytes = need, "memory locked");
            return LockResult::Locked {
                handle,
                bytes: need,
            };
        }
        global_metrics().inc_memman_lock(false);
        if flexible {
            state.reserved_bytes = state.reserved_bytes.max(need);
            debug!(bytes = need, "memory reserved for a future attempt");
            LockResult::Reserved
        } else {
            LockResult::Insufficient
        }
    }

    fn unlock(&self, handle: HandleId) {
        if handle <= HANDLE_EMPTY {
            return;
        }
        let mut state = self.state.lock().expect("memman lock");
        if let Some(bytes) = state.locked.remove(&handle) {
            state.locked_bytes -= bytes;
            global_metrics().set_memman_bytes_locked(state.locked_bytes);
        }
    }

    fn locked_bytes(&self) -> u64 {
        self.state.lock().expect("memman lock").locked_bytes
    }

    fn handle_count(&self) -> usize {
        self.state.lock().expect("memman lock").locked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("LSST/Object_{i}.MYD")).collect()
    }

    #[test]
    fn none_manager_always_grants_and_tracks_handles() {
        let mm = MemManNone::new();
        let result = mm.lock(&files(2), false);
        let handle = result.handle().unwrap();
        assert!(handle > HANDLE_EMPTY);
        assert_eq!(mm.handle_count(), 1);
        mm.unlock(handle);
        assert_eq!(mm.handle_count(), 0);
    }

    #[test]
    fn empty_file_set_gets_the_empty_handle() {
        let mm = MemManNone::new();
        assert_eq!(
            mm.lock(&[], true),
            LockResult::Locked {
                handle: HANDLE_EMPTY,
                bytes: 0
            }
        );
        assert_eq!(mm.handle_count(), 0);
    }

    #[test]
    fn budget_refuses_then_grants_after_unlock() {
        let mm = BudgetMemMan::new(100, 60);
        let first = mm.lock(&files(1), false);
        let handle = first.handle().unwrap();
        assert_eq!(mm.locked_bytes(), 60);

        assert_eq!(mm.lock(&files(1), false), LockResult::Insufficient);
        assert_eq!(mm.lock(&files(1), true), LockResult::Reserved);
        assert_eq!(mm.reserved_bytes(), 60);

        mm.unlock(handle);
        assert_eq!(mm.locked_bytes(), 0);
        let retry = mm.lock(&files(1), false);
        assert!(retry.handle().is_some());
        assert_eq!(mm.reserved_bytes(), 0);
    }
}
