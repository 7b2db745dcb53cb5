//! Resource identifiers.
//!
//! Every object the capture layer tracks gets a `ResourceId` when it is
//! created. Identifiers are never reused while the generator that issued them
//! is alive, so an ID recorded in a capture file names exactly one object.
//!
//! A generator starts out issuing capture IDs. Replay switches it into replay
//! mode, after which it hands out IDs from a disjoint range, so that objects
//! created while replaying can never be confused with the IDs read from the
//! log.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An opaque identifier for a tracked resource.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    /// The null ID, never issued by a generator.
    pub const NULL: ResourceId = ResourceId(0);

    pub fn from_raw(raw: u64) -> ResourceId {
        ResourceId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True if this ID was issued after a switch to replay mode.
    pub fn is_replay(self) -> bool {
        self.0 >= REPLAY_ID_BASE
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ResourceId::{}", self.0)
    }
}

/// First ID handed out in replay mode.
const REPLAY_ID_BASE: u64 = 1 << 62;

/// Issues `ResourceId`s.
#[derive(Debug)]
pub struct IdGenerator {
    next_capture: AtomicU64,
    next_replay: AtomicU64,
    replay_mode: AtomicBool,
}

impl IdGenerator {
    pub fn new() -> IdGenerator {
        IdGenerator {
            next_capture: AtomicU64::new(1),
            next_replay: AtomicU64::new(REPLAY_ID_BASE),
            replay_mode: AtomicBool::new(false),
        }
    }

    /// Return an ID that no other call on this generator has returned.
    pub fn new_unique_id(&self) -> ResourceId {
        let counter = if self.replay_mode.load(Ordering::Acquire) {
            &self.next_replay
        } else {
            &self.next_capture
        };
        ResourceId(counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Switch to issuing replay IDs. There is no way back.
    pub fn set_replay_mode(&self) {
        self.replay_mode.store(true, Ordering::Release);
    }

    pub fn is_replay_mode(&self) -> bool {
        self.replay_mode.load(Ordering::Acquire)
    }
}

impl Default for IdGenerator {
    fn default() -> IdGenerator {
        IdGenerator::new()
    }
}

#[test]
fn test_ids_unique_across_threads() {
    use std::collections::HashSet;
    use std::sync::Arc;

    let ids = Arc::new(IdGenerator::new());
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let ids = ids.clone();
            std::thread::spawn(move || (0..1000).map(|_| ids.new_unique_id()).collect::<Vec<_>>())
        })
        .collect();

    let mut seen = HashSet::new();
    for thread in threads {
        for id in thread.join().unwrap() {
            assert!(!id.is_null());
            assert!(seen.insert(id), "duplicate id {}", id);
        }
    }
    assert_eq!(seen.len(), 4000);
}

#[test]
fn test_replay_mode() {
    let ids = IdGenerator::new();
    let a = ids.new_unique_id();
    assert!(!a.is_replay());
    assert!(!ids.is_replay_mode());

    ids.set_replay_mode();
    let b = ids.new_unique_id();
    let c = ids.new_unique_id();
    assert!(b.is_replay());
    assert!(c.is_replay());
    assert_ne!(b, c);
    assert_ne!(a, b);
}
