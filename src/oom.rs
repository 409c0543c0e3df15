//! Out-of-space callback protocol.
//!
//! When the allocator cannot satisfy a request because every retired page
//! is still pinned by some reader's snapshot, it offers the caller a chance
//! to intervene via an [`OomHandler`] before giving up with `Error::MapFull`
//! or `Error::TxnFull`.

use crate::error::TransactionId;

/// What the environment should do after an [`OomHandler`] callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomAction {
    /// Give up; surface the original space error to the caller (`< 0`).
    Abort,
    /// The handler did nothing; retry is pointless (`== 0`).
    Stop,
    /// Mark the laggard reader's slot invalid without touching its process;
    /// the reader will fail its next operation (`== 1`).
    InvalidateSlot,
    /// Forcibly release the laggard's slot so its snapshot stops pinning
    /// pages, e.g. because the handler confirmed the owning process is dead
    /// (`> 1`).
    ForceReleaseSlot,
}

impl OomAction {
    /// Reconstruct the action from the raw LMDB-style return-code
    /// convention this protocol is modeled on.
    pub fn from_code(code: i32) -> Self {
        match code.cmp(&0) {
            std::cmp::Ordering::Less => OomAction::Abort,
            std::cmp::Ordering::Equal => OomAction::Stop,
            std::cmp::Ordering::Greater if code == 1 => OomAction::InvalidateSlot,
            std::cmp::Ordering::Greater => OomAction::ForceReleaseSlot,
        }
    }
}

/// Context handed to an [`OomHandler`] describing the reader that is
/// blocking reclamation.
#[derive(Debug, Clone, Copy)]
pub struct LaggardReader {
    pub slot_index: usize,
    pub pid: u32,
    pub tid: u64,
    /// The snapshot this reader is pinning.
    pub txnid: TransactionId,
    /// How many committed transactions have happened since, i.e. how far
    /// behind the laggard is.
    pub lag: u64,
    /// Estimated bytes of retired-but-unreclaimable space this reader is
    /// responsible for holding onto.
    pub space_lost: u64,
    /// Which retry attempt this call is (starts at 0).
    pub retry: u32,
}

/// A caller-supplied policy for resolving OOM conditions caused by a
/// lagging reader. Implementations typically check whether `pid` is still
/// alive and decide whether to wait, invalidate, or forcibly evict.
pub trait OomHandler: Send + Sync {
    fn on_laggard(&self, laggard: &LaggardReader) -> OomAction;
}

/// The default policy: never intervene. Equivalent to having no callback
/// registered — space pressure from a lagging reader simply surfaces as an
/// error.
pub struct NoIntervention;

impl OomHandler for NoIntervention {
    fn on_laggard(&self, _laggard: &LaggardReader) -> OomAction {
        OomAction::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping_matches_the_four_way_protocol() {
        assert_eq!(OomAction::from_code(-1), OomAction::Abort);
        assert_eq!(OomAction::from_code(0), OomAction::Stop);
        assert_eq!(OomAction::from_code(1), OomAction::InvalidateSlot);
        assert_eq!(OomAction::from_code(2), OomAction::ForceReleaseSlot);
    }
}
