use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::ops::{BitOr, BitOrAssign};

use tokio::sync::oneshot;

use super::PageHandle;
use super::list::{Link, Linked};
use crate::layout::{Lsn, PageKey};

/// A request is waiting for the page.
pub const REQUEST: u16 = 1 << 0;
/// The page has never been written and is zero filled instead of read.
pub const EMPTY: u16 = 1 << 1;
/// The entry holds a cache slot.
pub const BOUND: u16 = 1 << 2;
/// The cache slot holds the page contents.
pub const MAPPED: u16 = 1 << 3;
/// The page has changes which have not been written out.
pub const DIRTY: u16 = 1 << 4;
/// A handle to the page is live.
pub const BUSY: u16 = 1 << 5;
/// The page is pinned in the cache until it is unlocked.
pub const LOCKED: u16 = 1 << 6;
/// The page is being read in.
pub const PAGEIN: u16 = 1 << 7;
/// The page is being written out.
pub const PAGEOUT: u16 = 1 << 8;
/// The pageout is waiting for the log to become durable.
pub const LOGSYNC: u16 = 1 << 9;
/// The pageout belongs to a checkpoint.
pub const LCP: u16 = 1 << 10;
/// The entry is in the hot set.
pub const HOT: u16 = 1 << 11;
/// The entry is on the LIRS stack.
pub const ONSTACK: u16 = 1 << 12;
/// The entry is on the LIRS queue.
pub const ONQUEUE: u16 = 1 << 13;

const STATE_NAMES: [(u16, &str); 14] = [
    (REQUEST, "REQUEST"),
    (EMPTY, "EMPTY"),
    (BOUND, "BOUND"),
    (MAPPED, "MAPPED"),
    (DIRTY, "DIRTY"),
    (BUSY, "BUSY"),
    (LOCKED, "LOCKED"),
    (PAGEIN, "PAGEIN"),
    (PAGEOUT, "PAGEOUT"),
    (LOGSYNC, "LOGSYNC"),
    (LCP, "LCP"),
    (HOT, "HOT"),
    (ONSTACK, "ONSTACK"),
    (ONQUEUE, "ONQUEUE"),
];

/// The bits describing outstanding work or residency, the LIRS bits are excluded.
const WORK_BITS: u16 = REQUEST
    | EMPTY
    | BOUND
    | MAPPED
    | DIRTY
    | BUSY
    | LOCKED
    | PAGEIN
    | PAGEOUT
    | LOGSYNC
    | LCP;

#[derive(Copy, Clone, Default, Eq, PartialEq)]
/// The state bits of a page entry.
pub struct PageState(u16);

impl Debug for PageState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_set();
        for (bit, name) in STATE_NAMES {
            if self.0 & bit != 0 {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

impl PageState {
    #[inline]
    /// Returns if any of the bits are set.
    pub fn any(self, bits: u16) -> bool {
        self.0 & bits != 0
    }

    #[inline]
    /// Returns if all of the bits are set.
    pub fn all(self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    #[inline]
    /// Returns the state with the bits set.
    pub fn with(self, bits: u16) -> Self {
        Self(self.0 | bits)
    }

    #[inline]
    /// Returns the state with the bits cleared.
    pub fn without(self, bits: u16) -> Self {
        Self(self.0 & !bits)
    }

    #[inline]
    /// The raw state bits.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// The sublist an entry in this state belongs to.
    ///
    /// `None` means the entry has no pending work and is not resident, it is
    /// only kept for its LIRS history.
    pub fn sublist(self) -> Option<Sublist> {
        if self.any(REQUEST) {
            let sublist = if !self.any(BOUND) {
                Sublist::Bind
            } else if !self.any(MAPPED) {
                if self.any(PAGEIN) {
                    Sublist::MapIo
                } else {
                    Sublist::Map
                }
            } else if self.any(PAGEOUT) {
                Sublist::CallbackIo
            } else {
                Sublist::Callback
            };
            return Some(sublist);
        }

        if self.any(BUSY) {
            Some(Sublist::Busy)
        } else if self.any(LOCKED) {
            Some(Sublist::Locked)
        } else if self.any(WORK_BITS) {
            Some(Sublist::Other)
        } else {
            None
        }
    }
}

#[repr(usize)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// Partitions the page entries by the class of work pending on them.
pub enum Sublist {
    /// Waiting for a cache slot.
    Bind = 0,
    /// Bound and waiting to be read in.
    Map = 1,
    /// Being read in.
    MapIo = 2,
    /// Resident with requests waiting to be served.
    Callback = 3,
    /// Resident with requests waiting for a pageout to complete.
    CallbackIo = 4,
    /// A handle to the page is live.
    Busy = 5,
    /// Pinned in the cache.
    Locked = 6,
    /// Everything else.
    Other = 7,
}

impl Sublist {
    /// The number of sublists.
    pub const COUNT: usize = 8;

    /// All sublists in order.
    pub const ALL: [Sublist; Self::COUNT] = [
        Sublist::Bind,
        Sublist::Map,
        Sublist::MapIo,
        Sublist::Callback,
        Sublist::CallbackIo,
        Sublist::Busy,
        Sublist::Locked,
        Sublist::Other,
    ];
}

#[derive(Copy, Clone, Default, Eq, PartialEq)]
/// Flags describing how a page request wants to access the page.
pub struct RequestFlags(u16);

impl RequestFlags {
    /// No special handling.
    pub const NONE: Self = Self(0);
    /// Pin the page in the cache.
    pub const LOCK_PAGE: Self = Self(1 << 0);
    /// Release a previous pin.
    pub const UNLOCK_PAGE: Self = Self(1 << 1);
    /// The page has never been written, do not read it from disk.
    pub const EMPTY_PAGE: Self = Self(1 << 2);
    /// The page is being allocated and will be changed.
    pub const ALLOC_REQ: Self = Self(1 << 3);
    /// The page is accessed to commit a change.
    pub const COMMIT_REQ: Self = Self(1 << 4);
    /// The page will be changed.
    pub const DIRTY_REQ: Self = Self(1 << 5);
    /// The access is correlated with a recent access, do not update the LIRS state.
    pub const CORR_REQ: Self = Self(1 << 6);

    /// Requests which change the page.
    pub const DIRTY_FLAGS: Self =
        Self(Self::ALLOC_REQ.0 | Self::COMMIT_REQ.0 | Self::DIRTY_REQ.0);

    #[inline]
    /// Returns if any of the given flags are set.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    /// Returns if all of the given flags are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RequestFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RequestFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Debug for RequestFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(RequestFlags, &str); 7] = [
            (RequestFlags::LOCK_PAGE, "LOCK_PAGE"),
            (RequestFlags::UNLOCK_PAGE, "UNLOCK_PAGE"),
            (RequestFlags::EMPTY_PAGE, "EMPTY_PAGE"),
            (RequestFlags::ALLOC_REQ, "ALLOC_REQ"),
            (RequestFlags::COMMIT_REQ, "COMMIT_REQ"),
            (RequestFlags::DIRTY_REQ, "DIRTY_REQ"),
            (RequestFlags::CORR_REQ, "CORR_REQ"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.intersects(flag) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

/// A request queued until its page is resident.
pub(crate) struct PageRequest {
    pub(crate) flags: RequestFlags,
    pub(crate) waiter: oneshot::Sender<PageHandle>,
}

/// Link role of the LIRS stack.
pub const STACK_LINK: usize = 0;
/// Link role of the LIRS queue.
pub const QUEUE_LINK: usize = 1;
/// Link role of the work sublists.
pub const SUBLIST_LINK: usize = 2;

/// The cache state of a single data page.
pub(crate) struct PageEntry {
    pub(crate) key: PageKey,
    pub(crate) hash_key: u64,
    pub(crate) state: PageState,
    /// The cache slot while [BOUND].
    pub(crate) slot: Option<u32>,
    /// The LSN of the newest change to the page.
    pub(crate) lsn: Lsn,
    /// The newest checkpoint which wrote the page.
    pub(crate) last_lcp: Option<u32>,
    /// The number of changes since the page was last written.
    pub(crate) dirty_count: u32,
    /// The number of live handles.
    pub(crate) busy_count: u32,
    pub(crate) requests: VecDeque<PageRequest>,
    links: [Link; 3],
}

impl PageEntry {
    pub(crate) fn new(key: PageKey, hash_key: u64) -> Self {
        Self {
            key,
            hash_key,
            state: PageState::default(),
            slot: None,
            lsn: 0,
            last_lcp: None,
            dirty_count: 0,
            busy_count: 0,
            requests: VecDeque::new(),
            links: [Link::default(); 3],
        }
    }

    #[inline]
    /// Returns if the entry can be written out right now.
    pub(crate) fn can_pageout(&self) -> bool {
        self.state.all(MAPPED | DIRTY)
            && !self.state.any(PAGEIN | PAGEOUT)
            && self.busy_count == 0
    }

    #[inline]
    /// Returns if the entry can give up its cache slot.
    pub(crate) fn can_evict(&self) -> bool {
        self.state.all(BOUND | MAPPED)
            && !self.state.any(REQUEST | DIRTY | BUSY | LOCKED | PAGEIN | PAGEOUT)
            && self.requests.is_empty()
    }
}

impl Linked for PageEntry {
    fn link(&self, role: usize) -> &Link {
        &self.links[role]
    }

    fn link_mut(&mut self, role: usize) -> &mut Link {
        &mut self.links[role]
    }
}

#[cfg(all(test, not(feature = "test-miri")))]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case::history(PageState::default().with(ONSTACK), None)]
    #[case::hot_history(PageState::default().with(HOT | ONSTACK), None)]
    #[case::unbound_request(PageState::default().with(REQUEST), Some(Sublist::Bind))]
    #[case::bound_request(PageState::default().with(REQUEST | BOUND), Some(Sublist::Map))]
    #[case::reading(PageState::default().with(REQUEST | BOUND | PAGEIN), Some(Sublist::MapIo))]
    #[case::resident_request(PageState::default().with(REQUEST | BOUND | MAPPED), Some(Sublist::Callback))]
    #[case::request_during_pageout(
        PageState::default().with(REQUEST | BOUND | MAPPED | PAGEOUT),
        Some(Sublist::CallbackIo),
    )]
    #[case::busy(PageState::default().with(BOUND | MAPPED | BUSY | LOCKED), Some(Sublist::Busy))]
    #[case::locked(PageState::default().with(BOUND | MAPPED | LOCKED), Some(Sublist::Locked))]
    #[case::resident(PageState::default().with(BOUND | MAPPED | HOT | ONSTACK), Some(Sublist::Other))]
    fn test_sublist_for_state(#[case] state: PageState, #[case] expected: Option<Sublist>) {
        assert_eq!(state.sublist(), expected);
    }

    #[test]
    fn test_state_debug_lists_bits() {
        let state = PageState::default().with(BOUND | DIRTY);
        assert_eq!(format!("{state:?}"), "{BOUND, DIRTY}");
        assert_eq!(
            format!("{:?}", RequestFlags::DIRTY_FLAGS),
            "{ALLOC_REQ, COMMIT_REQ, DIRTY_REQ}",
        );
    }

    #[test]
    fn test_request_flags() {
        let flags = RequestFlags::LOCK_PAGE | RequestFlags::DIRTY_REQ;
        assert!(flags.contains(RequestFlags::LOCK_PAGE));
        assert!(flags.intersects(RequestFlags::DIRTY_FLAGS));
        assert!(!flags.contains(RequestFlags::DIRTY_FLAGS));
        assert!(!RequestFlags::CORR_REQ.intersects(RequestFlags::DIRTY_FLAGS));
    }
}
