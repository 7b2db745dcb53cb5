//! The resource registry: IDs, records, live objects, and per-frame
//! reference tracking.
//!
//! On the capture side, every object the application creates is entered here
//! as a *current* resource: its kind, its native handle, the application's
//! reference count, and its record. On the replay side, objects recreated
//! from the log are entered as *live* resources, keyed by the ID they had in
//! the capture.
//!
//! The registry also tracks, for the frame being captured, which resources
//! the frame referenced and how, which resources have been written since
//! they were created (and so need initial contents), and the initial
//! contents themselves.
//!
//! All of this sits behind one lock. Record chunk lists have locks of their
//! own, and `ResourceRecord::delete` re-enters the registry, so never hold
//! the registry lock while deleting a record.

use crate::id::{IdGenerator, ResourceId};
use crate::initial::InitialContents;
use crate::record::ResourceRecord;
use crate::resource::ResourceKind;

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// How a captured frame has used a resource so far.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrameRefType {
    Unknown,
    Read,
    Write,
    /// Only read so far.
    ReadOnly,
    /// Written first, and possibly read after.
    ReadAndWrite,
    /// Read, then written. Its pre-frame contents matter.
    ReadBeforeWrite,
}

impl FrameRefType {
    /// Combine the state recorded so far with a new use.
    pub fn merge(existing: Option<FrameRefType>, new: FrameRefType) -> FrameRefType {
        use FrameRefType::*;

        if new == ReadBeforeWrite {
            return ReadBeforeWrite;
        }
        match existing {
            None | Some(Unknown) => match new {
                Read | ReadOnly => ReadOnly,
                Write | ReadAndWrite => ReadAndWrite,
                other => other,
            },
            Some(ReadOnly) | Some(Read) if matches!(new, Write | ReadAndWrite) => ReadBeforeWrite,
            Some(Write) => ReadAndWrite,
            Some(old) => old,
        }
    }

    /// True if a use of this type modifies the resource.
    pub fn is_write(self) -> bool {
        !matches!(self, FrameRefType::Read | FrameRefType::ReadOnly | FrameRefType::Unknown)
    }
}

/// A capture-side object: what it is, the driver's handle for it, and the
/// application's reference count.
#[derive(Clone, Debug)]
pub struct TrackedResource<H> {
    pub kind: ResourceKind,
    pub handle: H,
    pub external_refs: u32,
    pub record: Option<Arc<ResourceRecord>>,
}

struct Inner<H> {
    records: HashMap<ResourceId, Arc<ResourceRecord>>,
    current: HashMap<ResourceId, TrackedResource<H>>,
    handle_ids: HashMap<H, ResourceId>,
    live: HashMap<ResourceId, H>,
    live_ids: HashMap<ResourceId, ResourceId>,
    original_ids: HashMap<ResourceId, ResourceId>,
    frame_refs: HashMap<ResourceId, FrameRefType>,
    dirty: HashSet<ResourceId>,
    pending_dirty: HashSet<ResourceId>,
    initial: HashMap<ResourceId, InitialContents<H>>,
}

pub struct ResourceManager<H> {
    ids: IdGenerator,
    inner: Mutex<Inner<H>>,
}

impl<H> ResourceManager<H>
where
    H: Copy + Eq + Hash + fmt::Debug,
{
    pub fn new() -> ResourceManager<H> {
        ResourceManager {
            ids: IdGenerator::new(),
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                current: HashMap::new(),
                handle_ids: HashMap::new(),
                live: HashMap::new(),
                live_ids: HashMap::new(),
                original_ids: HashMap::new(),
                frame_refs: HashMap::new(),
                dirty: HashSet::new(),
                pending_dirty: HashSet::new(),
                initial: HashMap::new(),
            }),
        }
    }

    pub fn new_unique_id(&self) -> ResourceId {
        self.ids.new_unique_id()
    }

    pub fn set_replay_mode(&self) {
        self.ids.set_replay_mode();
    }

    // Records.

    /// Create and register a record for `id`.
    ///
    /// Registering a second record for the same ID is a bug; the existing
    /// record is returned.
    pub fn add_resource_record(
        &self,
        id: ResourceId,
        special: bool,
        length: u64,
        num_subresources: u32,
    ) -> Arc<ResourceRecord> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.records.get(&id) {
            fatal!("duplicate resource record for {}", id);
            return existing.clone();
        }
        let record = Arc::new(ResourceRecord::new(id, special, length, num_subresources));
        inner.records.insert(id, record.clone());
        record
    }

    pub fn get_resource_record(&self, id: ResourceId) -> Option<Arc<ResourceRecord>> {
        self.inner.lock().records.get(&id).cloned()
    }

    pub fn has_resource_record(&self, id: ResourceId) -> bool {
        self.inner.lock().records.contains_key(&id)
    }

    /// Called by `ResourceRecord::delete` once the record is dead.
    pub(crate) fn release_resource_record(&self, id: ResourceId) {
        self.inner.lock().records.remove(&id);
    }

    // Capture-side objects.

    pub fn add_current_resource(&self, id: ResourceId, resource: TrackedResource<H>) {
        let mut inner = self.inner.lock();
        if inner.current.contains_key(&id) {
            fatal!("resource {} registered twice", id);
            return;
        }
        inner.handle_ids.insert(resource.handle, id);
        inner.current.insert(id, resource);
    }

    pub fn get_current_resource(&self, id: ResourceId) -> Option<TrackedResource<H>> {
        self.inner.lock().current.get(&id).cloned()
    }

    pub fn has_current_resource(&self, id: ResourceId) -> bool {
        self.inner.lock().current.contains_key(&id)
    }

    pub fn current_handle(&self, id: ResourceId) -> Option<H> {
        self.inner.lock().current.get(&id).map(|r| r.handle)
    }

    pub fn id_for_handle(&self, handle: H) -> Option<ResourceId> {
        self.inner.lock().handle_ids.get(&handle).copied()
    }

    pub fn current_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.inner.lock().current.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Adjust the application's reference count on `id` by `delta`,
    /// returning the new count.
    pub fn adjust_external_refs(&self, id: ResourceId, delta: i32) -> Option<u32> {
        let mut inner = self.inner.lock();
        let resource = inner.current.get_mut(&id)?;
        let count = (resource.external_refs as i64 + delta as i64).max(0) as u32;
        resource.external_refs = count;
        Some(count)
    }

    /// Forget a capture-side object, returning its entry.
    pub fn release_current_resource(&self, id: ResourceId) -> Option<TrackedResource<H>> {
        let mut inner = self.inner.lock();
        let resource = inner.current.remove(&id)?;
        inner.handle_ids.remove(&resource.handle);
        inner.dirty.remove(&id);
        inner.pending_dirty.remove(&id);
        Some(resource)
    }

    // Replay-side objects.

    /// Enter the object recreated for `original`. Return the replay ID the
    /// live object goes by.
    pub fn add_live_resource(&self, original: ResourceId, live: H) -> ResourceId {
        let live_id = self.ids.new_unique_id();
        let mut inner = self.inner.lock();
        if inner.live.insert(original, live).is_some() {
            fatal!("live resource for {} replaced", original);
        }
        inner.live_ids.insert(original, live_id);
        inner.original_ids.insert(live_id, original);
        live_id
    }

    pub fn has_live_resource(&self, original: ResourceId) -> bool {
        self.inner.lock().live.contains_key(&original)
    }

    pub fn get_live_resource(&self, original: ResourceId) -> Option<H> {
        self.inner.lock().live.get(&original).copied()
    }

    pub fn get_live_id(&self, original: ResourceId) -> Option<ResourceId> {
        self.inner.lock().live_ids.get(&original).copied()
    }

    pub fn erase_live_resource(&self, original: ResourceId) -> Option<H> {
        let mut inner = self.inner.lock();
        if let Some(live_id) = inner.live_ids.remove(&original) {
            inner.original_ids.remove(&live_id);
        }
        inner.live.remove(&original)
    }

    /// Translate a replay ID back to the ID in the capture. IDs that aren't
    /// replay IDs are returned unchanged.
    pub fn get_original_id(&self, live_id: ResourceId) -> ResourceId {
        self.inner.lock().original_ids.get(&live_id).copied().unwrap_or(live_id)
    }

    pub fn live_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.inner.lock().live.keys().copied().collect();
        ids.sort();
        ids
    }

    // Frame references.

    /// Note that the frame being captured used `id` as `ty`. Return true if
    /// this is the frame's first use of `id`.
    ///
    /// A first use takes an internal reference on the resource's record, so
    /// the record outlives the resource until the frame is written.
    pub fn mark_resource_frame_referenced(&self, id: ResourceId, ty: FrameRefType) -> bool {
        if id.is_null() {
            return false;
        }
        let mut inner = self.inner.lock();
        let existing = inner.frame_refs.get(&id).copied();
        inner.frame_refs.insert(id, FrameRefType::merge(existing, ty));
        if existing.is_none() {
            if let Some(record) = inner.records.get(&id) {
                record.add_ref();
            }
            return true;
        }
        false
    }

    pub fn frame_ref(&self, id: ResourceId) -> Option<FrameRefType> {
        self.inner.lock().frame_refs.get(&id).copied()
    }

    pub fn referenced_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.inner.lock().frame_refs.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Forget the frame's references, dropping the record references they
    /// held.
    pub fn clear_referenced_resources(&self) {
        let records: Vec<Arc<ResourceRecord>> = {
            let mut inner = self.inner.lock();
            let ids: Vec<ResourceId> = inner.frame_refs.drain().map(|(id, _)| id).collect();
            ids.iter().filter_map(|id| inner.records.get(id).cloned()).collect()
        };
        for record in records {
            record.delete(self);
        }
    }

    /// True if the frame's use of `id` so far means its pre-frame contents
    /// are observable: it was read before (or without) being written.
    pub fn read_before_write(&self, id: ResourceId) -> bool {
        matches!(
            self.frame_ref(id),
            Some(FrameRefType::ReadBeforeWrite) | Some(FrameRefType::ReadOnly)
        )
    }

    /// Merge the records of every referenced resource into `map`.
    pub fn insert_referenced_chunks(&self, map: &mut BTreeMap<i64, Arc<crate::chunk::Chunk>>) {
        let records: Vec<Arc<ResourceRecord>> = {
            let inner = self.inner.lock();
            let mut ids: Vec<_> = inner.frame_refs.keys().copied().collect();
            ids.sort();
            ids.iter().filter_map(|id| inner.records.get(id).cloned()).collect()
        };
        for record in records {
            record.insert(map);
        }
    }

    pub fn mark_unwritten_resources(&self) {
        let records: Vec<_> = self.inner.lock().records.values().cloned().collect();
        for record in records {
            record.mark_data_unwritten();
        }
    }

    // Dirty tracking.

    /// Note that the GPU wrote `id` outside a captured frame.
    pub fn mark_dirty(&self, id: ResourceId) {
        self.inner.lock().dirty.insert(id);
    }

    /// Note that the GPU wrote `id` during a captured frame. It becomes
    /// dirty when `flush_pending_dirty` is called at the end of the frame.
    pub fn mark_pending_dirty(&self, id: ResourceId) {
        self.inner.lock().pending_dirty.insert(id);
    }

    pub fn flush_pending_dirty(&self) {
        let mut inner = self.inner.lock();
        let pending: Vec<_> = inner.pending_dirty.drain().collect();
        inner.dirty.extend(pending);
    }

    pub fn is_dirty(&self, id: ResourceId) -> bool {
        self.inner.lock().dirty.contains(&id)
    }

    pub fn dirty_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.inner.lock().dirty.iter().copied().collect();
        ids.sort();
        ids
    }

    // Initial contents.

    /// Store initial contents for `id`, unless some are already stored, in
    /// which case `contents` is handed back.
    pub fn set_initial_contents(
        &self,
        id: ResourceId,
        contents: InitialContents<H>,
    ) -> Result<(), InitialContents<H>> {
        let mut inner = self.inner.lock();
        if inner.initial.contains_key(&id) {
            return Err(contents);
        }
        inner.initial.insert(id, contents);
        Ok(())
    }

    pub fn has_initial_contents(&self, id: ResourceId) -> bool {
        self.inner.lock().initial.contains_key(&id)
    }

    pub fn initial_contents_count(&self) -> usize {
        self.inner.lock().initial.len()
    }

    pub fn get_initial_contents(&self, id: ResourceId) -> Option<InitialContents<H>>
    where
        InitialContents<H>: Clone,
    {
        self.inner.lock().initial.get(&id).cloned()
    }

    pub fn initial_contents_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.inner.lock().initial.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Remove all stored initial contents, returning them so the caller can
    /// release any driver objects they hold.
    pub fn free_initial_contents(&self) -> Vec<InitialContents<H>> {
        self.inner.lock().initial.drain().map(|(_, contents)| contents).collect()
    }
}

impl<H> Default for ResourceManager<H>
where
    H: Copy + Eq + Hash + fmt::Debug,
{
    fn default() -> ResourceManager<H> {
        ResourceManager::new()
    }
}
