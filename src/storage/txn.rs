//! Transaction bookkeeping: xid allocation, commit status, snapshots and
//! tuple-lock modes.
//!
//! The tree never waits on another transaction; it reads status here,
//! returns a structured conflict to the caller, and the caller decides
//! whether to wait or give up. Keeping this component small keeps that
//! boundary honest.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{Cid, Xid};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum XidStatus {
    InProgress,
    Committed,
    Aborted,
}

struct TxState {
    next_xid: u32,
    status: HashMap<u32, XidStatus>,
}

/// Central transaction registry shared by every table on a store.
pub struct TxManager {
    state: RwLock<TxState>,
}

impl Default for TxManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TxManager {
    pub fn new() -> TxManager {
        TxManager {
            state: RwLock::new(TxState {
                next_xid: Xid::FIRST.0,
                status: HashMap::new(),
            }),
        }
    }

    /// Starts a transaction and returns its xid.
    pub fn begin(&self) -> Xid {
        let mut state = self.state.write();
        let xid = Xid(state.next_xid);
        state.next_xid += 1;
        state.status.insert(xid.0, XidStatus::InProgress);
        xid
    }

    pub fn commit(&self, xid: Xid) {
        self.state.write().status.insert(xid.0, XidStatus::Committed);
    }

    pub fn abort(&self, xid: Xid) {
        self.state.write().status.insert(xid.0, XidStatus::Aborted);
    }

    /// A transaction we have no record of must have crashed before
    /// committing, which reads as aborted.
    pub fn status(&self, xid: Xid) -> XidStatus {
        *self
            .state
            .read()
            .status
            .get(&xid.0)
            .unwrap_or(&XidStatus::Aborted)
    }

    pub fn is_in_progress(&self, xid: Xid) -> bool {
        self.status(xid) == XidStatus::InProgress
    }

    pub fn did_commit(&self, xid: Xid) -> bool {
        self.status(xid) == XidStatus::Committed
    }

    /// Takes an MVCC snapshot for `xid` at command `curcid`: everything
    /// in progress right now (other than `xid` itself) stays invisible,
    /// as does everything that starts later.
    pub fn snapshot(&self, xid: Xid, curcid: Cid) -> Snapshot {
        let state = self.state.read();
        let mut xip: Vec<Xid> = state
            .status
            .iter()
            .filter(|(other, status)| **status == XidStatus::InProgress && **other != xid.0)
            .map(|(other, _)| Xid(*other))
            .collect();
        xip.sort_unstable();
        let xmax = Xid(state.next_xid);
        let xmin = xip.first().copied().unwrap_or(xmax);
        Snapshot {
            kind: SnapshotKind::Mvcc,
            current_xid: xid,
            curcid,
            xmin,
            xmax,
            xip,
        }
    }
}

/// Which visibility rule set a snapshot selects.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SnapshotKind {
    Mvcc,
    SelfVisible,
    Any,
    Dirty,
    NonVacuumable,
}

/// A visibility predicate over `{xid, cid}`.
///
/// For Dirty snapshots, `xmin`/`xmax` double as out-fields reporting the
/// in-progress inserter/deleter observed during the last check. For
/// NonVacuumable snapshots, `xmin` carries the caller's oldest-xmin
/// horizon.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub kind: SnapshotKind,
    pub current_xid: Xid,
    pub curcid: Cid,
    pub xmin: Xid,
    pub xmax: Xid,
    pub xip: Vec<Xid>,
}

impl Snapshot {
    pub fn self_visible(xid: Xid, curcid: Cid) -> Snapshot {
        Snapshot {
            kind: SnapshotKind::SelfVisible,
            current_xid: xid,
            curcid,
            xmin: Xid::INVALID,
            xmax: Xid::INVALID,
            xip: Vec::new(),
        }
    }

    pub fn any() -> Snapshot {
        Snapshot {
            kind: SnapshotKind::Any,
            current_xid: Xid::INVALID,
            curcid: Cid::INVALID,
            xmin: Xid::INVALID,
            xmax: Xid::INVALID,
            xip: Vec::new(),
        }
    }

    pub fn dirty() -> Snapshot {
        Snapshot {
            kind: SnapshotKind::Dirty,
            current_xid: Xid::INVALID,
            curcid: Cid::INVALID,
            xmin: Xid::INVALID,
            xmax: Xid::INVALID,
            xip: Vec::new(),
        }
    }

    pub fn non_vacuumable(oldest_xmin: Xid) -> Snapshot {
        Snapshot {
            kind: SnapshotKind::NonVacuumable,
            current_xid: Xid::INVALID,
            curcid: Cid::INVALID,
            xmin: oldest_xmin,
            xmax: Xid::INVALID,
            xip: Vec::new(),
        }
    }

    /// True when `xid` was in progress (or unborn) at snapshot time.
    pub fn xid_in_snapshot(&self, xid: Xid) -> bool {
        xid >= self.xmax || self.xip.binary_search(&xid).is_ok()
    }
}

/// Tuple lock strength, weakest to strongest.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LockMode {
    KeyShare,
    Share,
    NoKeyExclusive,
    Exclusive,
}

impl LockMode {
    pub fn from_u8(value: u8) -> Option<LockMode> {
        match value {
            0 => Some(LockMode::KeyShare),
            1 => Some(LockMode::Share),
            2 => Some(LockMode::NoKeyExclusive),
            3 => Some(LockMode::Exclusive),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            LockMode::KeyShare => 0,
            LockMode::Share => 1,
            LockMode::NoKeyExclusive => 2,
            LockMode::Exclusive => 3,
        }
    }
}

/// Whether a lock already held in `held` mode lets another transaction
/// acquire `requested`.
pub fn lock_modes_compatible(held: LockMode, requested: LockMode) -> bool {
    match requested {
        LockMode::KeyShare => held != LockMode::Exclusive,
        LockMode::Share => held == LockMode::KeyShare || held == LockMode::Share,
        LockMode::NoKeyExclusive => held == LockMode::KeyShare,
        LockMode::Exclusive => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_hides_concurrent_and_future_xids() {
        let txm = TxManager::new();
        let other = txm.begin();
        let me = txm.begin();
        let snapshot = txm.snapshot(me, Cid::FIRST);
        assert!(snapshot.xid_in_snapshot(other));
        let later = txm.begin();
        assert!(snapshot.xid_in_snapshot(later));
        txm.commit(other);
        // the snapshot is fixed; a later commit does not change it
        assert!(snapshot.xid_in_snapshot(other));
    }

    #[test]
    fn unknown_xid_reads_as_aborted() {
        let txm = TxManager::new();
        assert_eq!(txm.status(Xid(999)), XidStatus::Aborted);
    }

    #[test]
    fn lock_matrix_matches_tuple_lock_semantics() {
        use LockMode::*;
        // KeyShare conflicts only with Exclusive
        assert!(lock_modes_compatible(NoKeyExclusive, KeyShare));
        assert!(!lock_modes_compatible(Exclusive, KeyShare));
        // Share conflicts with both exclusive modes
        assert!(lock_modes_compatible(Share, Share));
        assert!(!lock_modes_compatible(NoKeyExclusive, Share));
        // NoKeyExclusive only tolerates KeyShare
        assert!(lock_modes_compatible(KeyShare, NoKeyExclusive));
        assert!(!lock_modes_compatible(Share, NoKeyExclusive));
        // Exclusive tolerates nothing
        assert!(!lock_modes_compatible(KeyShare, Exclusive));
    }

    #[test]
    fn lock_modes_are_totally_ordered() {
        use LockMode::*;
        assert!(KeyShare < Share && Share < NoKeyExclusive && NoKeyExclusive < Exclusive);
    }
}
