//! Per-request I/O trackers and the arena that owns them.
//!
//! A request is tracked by a chain: one head tracker, bound to the primary
//! backing store, plus one replica tracker per additional store (none for
//! reads). The head owns the request itself (segments and terminal
//! callback) together with the active and failure counts that every unit
//! completion folds into.
//!
//! Trackers live in a [`TrackerArena`] keyed by [`TrackerId`]. Ids are never
//! reused and release removes the entry, so touching a released tracker is
//! always detected and treated as a fatal invariant violation.

use crate::bio::{Bio, BioHeader, EndIo};
use fpx_backing::BackingHandle;
use fpx_types::TrackerId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Request state shared by every unit of a chain, owned by the head.
pub(crate) struct HeadState {
    pub header: BioHeader,
    /// Generation of the backing set the chain was built against.
    pub generation: u64,
    pub replicas: Vec<TrackerId>,
    pub active: AtomicUsize,
    pub fails: AtomicUsize,
    /// Replica units write from these concurrently; the read unit fills them.
    pub segments: RwLock<Vec<Vec<u8>>>,
    end_io: Mutex<Option<EndIo>>,
}

impl HeadState {
    fn new(bio: Bio, generation: u64, replicas: Vec<TrackerId>) -> Self {
        let (header, segments, end_io) = bio.into_parts();
        Self {
            header,
            generation,
            replicas,
            active: AtomicUsize::new(0),
            fails: AtomicUsize::new(0),
            segments: RwLock::new(segments),
            end_io: Mutex::new(Some(end_io)),
        }
    }

    /// Number of units a dispatch of this chain runs.
    pub fn unit_count(&self) -> usize {
        self.replicas.len() + 1
    }

    /// Take the request back out of the chain.
    ///
    /// # Panics
    ///
    /// If the request was already taken: a request completes exactly once.
    pub fn take_bio(&self) -> Bio {
        let end_io = self
            .end_io
            .lock()
            .take()
            .unwrap_or_else(|| panic!("request {:?} completed twice", self.header));
        let segments = std::mem::take(&mut *self.segments.write());
        Bio::from_parts(self.header, segments, end_io)
    }
}

pub(crate) enum Role {
    Head(HeadState),
    Replica { head: TrackerId },
}

/// One unit of a request, bound to one backing store.
pub(crate) struct Tracker {
    id: TrackerId,
    role: Role,
    handle: BackingHandle,
    start: Instant,
    released: AtomicBool,
}

impl Tracker {
    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn handle(&self) -> &BackingHandle {
        &self.handle
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn is_head(&self) -> bool {
        matches!(self.role, Role::Head(_))
    }

    /// Id of the chain's head (itself for a head tracker).
    pub fn head_id(&self) -> TrackerId {
        match self.role {
            Role::Head(_) => self.id,
            Role::Replica { head } => head,
        }
    }

    /// # Panics
    ///
    /// On a replica tracker, or on a released tracker.
    pub fn head_state(&self) -> &HeadState {
        self.check_live();
        match &self.role {
            Role::Head(state) => state,
            Role::Replica { head } => {
                panic!("{} is a replica of {head}, not a head tracker", self.id)
            }
        }
    }

    /// # Panics
    ///
    /// When the tracker was already released.
    pub fn check_live(&self) {
        assert!(
            !self.released.load(Ordering::Acquire),
            "use of released tracker {}",
            self.id
        );
    }
}

/// Owner of every live tracker of one device.
///
/// The arena is bounded: inserting beyond `capacity` live trackers fails,
/// which the engine reports as `NoMemory`.
pub(crate) struct TrackerArena {
    next_id: AtomicU64,
    capacity: usize,
    live: Mutex<HashMap<TrackerId, Arc<Tracker>>>,
}

impl TrackerArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            capacity,
            live: Mutex::new(HashMap::new()),
        }
    }

    fn reserve_id(&self) -> TrackerId {
        TrackerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, tracker: Tracker) -> std::result::Result<Arc<Tracker>, Tracker> {
        let mut live = self.live.lock();
        if live.len() >= self.capacity {
            return Err(tracker);
        }
        let tracker = Arc::new(tracker);
        live.insert(tracker.id, Arc::clone(&tracker));
        Ok(tracker)
    }

    /// Build the tracker chain of `bio`: the head against `handles[0]`, then
    /// one replica per remaining handle. On exhaustion everything allocated
    /// for the chain is released and the request is handed back.
    pub fn alloc_chain(
        &self,
        bio: Bio,
        handles: &[BackingHandle],
        generation: u64,
    ) -> std::result::Result<Arc<Tracker>, Bio> {
        let Some((primary, rest)) = handles.split_first() else {
            return Err(bio);
        };
        let rest = if bio.op().is_read() { &[][..] } else { rest };

        let head_id = self.reserve_id();
        let replica_ids: Vec<TrackerId> = rest.iter().map(|_| self.reserve_id()).collect();
        let head = Tracker {
            id: head_id,
            role: Role::Head(HeadState::new(bio, generation, replica_ids.clone())),
            handle: primary.clone(),
            start: Instant::now(),
            released: AtomicBool::new(false),
        };
        let head = match self.insert(head) {
            Ok(head) => head,
            Err(head) => return Err(head.head_state().take_bio()),
        };

        for (count, (&id, handle)) in replica_ids.iter().zip(rest).enumerate() {
            let replica = Tracker {
                id,
                role: Role::Replica { head: head_id },
                handle: handle.clone(),
                start: head.start,
                released: AtomicBool::new(false),
            };
            if self.insert(replica).is_err() {
                let bio = head.head_state().take_bio();
                for &allocated in &replica_ids[..count] {
                    self.release(allocated);
                }
                self.release(head_id);
                return Err(bio);
            }
        }
        Ok(head)
    }

    /// # Panics
    ///
    /// When `id` is not live.
    pub fn get(&self, id: TrackerId) -> Arc<Tracker> {
        self.live
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("tracker {id} is not live"))
    }

    /// Remove `id` from the arena and mark it released.
    ///
    /// # Panics
    ///
    /// When `id` is not live (double release or never allocated).
    pub fn release(&self, id: TrackerId) -> Arc<Tracker> {
        let tracker = self
            .live
            .lock()
            .remove(&id)
            .unwrap_or_else(|| panic!("release of tracker {id} that is not live"));
        let was = tracker.released.swap(true, Ordering::AcqRel);
        assert!(!was, "tracker {id} released twice");
        tracker
    }

    /// Release a whole chain, replicas first.
    pub fn release_chain(&self, head: &Tracker) {
        for &replica in &head.head_state().replicas {
            self.release(replica);
        }
        self.release(head.id);
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }
}
