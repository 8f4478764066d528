#![forbid(unsafe_code)]

pub mod error;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

pub use crate::error::{Result, ZedError};
pub use crate::primitives::pager::{Pager, PagerOptions};
pub use crate::storage::table::{Table, TableOptions};
pub use crate::storage::txn::{LockMode, Snapshot, TxManager};
pub use crate::types::{Cid, Tid, UndoPtr, Xid};
