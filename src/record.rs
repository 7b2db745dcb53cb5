//! Per-resource capture bookkeeping.
//!
//! A `ResourceRecord` accumulates the chunks that describe one resource:
//! its creation, its debug name, and so on. Nothing is written out when the
//! chunks are recorded; at the end of a captured frame, the records of every
//! resource the frame referenced are merged into one list ordered by chunk
//! sequence number, and written.
//!
//! ## Lifetime
//!
//! A record carries an internal reference count, separate from the
//! application's reference count on the resource itself. The resource holds
//! one internal reference for as long as the application keeps it alive.
//! Every other reason to keep the record around holds another: a reference
//! from the frame being captured, a child record naming this one as a parent,
//! a command list that uses it. When the internal count reaches zero,
//! `delete` drops the record's chunks and removes it from the registry.

use crate::chunk::{Chunk, ChunkType};
use crate::id::ResourceId;
use crate::registry::ResourceManager;

use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct ResourceRecord {
    id: ResourceId,
    special: bool,
    data_in_serialiser: AtomicBool,
    length: u64,
    num_subresources: u32,
    ref_count: AtomicI32,
    data_written: AtomicBool,
    chunks: Mutex<Vec<Arc<Chunk>>>,
    parents: Mutex<Vec<Arc<ResourceRecord>>>,
}

impl ResourceRecord {
    pub(crate) fn new(id: ResourceId, special: bool, length: u64, num_subresources: u32) -> ResourceRecord {
        ResourceRecord {
            id,
            special,
            data_in_serialiser: AtomicBool::new(false),
            length,
            num_subresources,
            ref_count: AtomicI32::new(1),
            data_written: AtomicBool::new(false),
            chunks: Mutex::new(Vec::new()),
            parents: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Special resources (the device, contexts, swap chains and their back
    /// buffers) are exempt from dirty tracking and initial contents.
    pub fn is_special(&self) -> bool {
        self.special
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn num_subresources(&self) -> u32 {
        self.num_subresources
    }

    /// True if the record's chunks embed the resource's contents.
    pub fn data_in_serialiser(&self) -> bool {
        self.data_in_serialiser.load(Ordering::Acquire)
    }

    pub fn set_data_in_serialiser(&self, embedded: bool) {
        self.data_in_serialiser.store(embedded, Ordering::Release);
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn add_chunk(&self, chunk: Chunk) {
        self.chunks.lock().push(Arc::new(chunk));
    }

    /// Lock the chunk list for a sequence of inspections and removals.
    pub fn lock_chunks(&self) -> ChunkGuard<'_> {
        ChunkGuard(self.chunks.lock())
    }

    pub fn has_chunks(&self) -> bool {
        !self.chunks.lock().is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    /// A snapshot of the chunk list, in append order.
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.lock().clone()
    }

    /// Take all the chunks, leaving the record empty.
    pub fn take_chunks(&self) -> Vec<Arc<Chunk>> {
        std::mem::take(&mut *self.chunks.lock())
    }

    pub fn clear_chunks(&self) {
        self.chunks.lock().clear();
    }

    /// Append duplicates of all of `other`'s chunks, in order.
    pub fn append_from(&self, other: &ResourceRecord) {
        let source = other.chunks();
        let mut chunks = self.chunks.lock();
        chunks.extend(source.iter().map(|chunk| Arc::new(chunk.duplicate())));
    }

    /// Make `parent`'s chunks a prerequisite of this record's, and keep
    /// `parent` alive as long as this record is.
    pub fn add_parent(&self, parent: Arc<ResourceRecord>) {
        let mut parents = self.parents.lock();
        if parents.iter().any(|p| Arc::ptr_eq(p, &parent)) {
            return;
        }
        parent.add_ref();
        parents.push(parent);
    }

    pub fn parent_ids(&self) -> Vec<ResourceId> {
        self.parents.lock().iter().map(|p| p.id).collect()
    }

    /// Drop one internal reference. When the last one goes, discard the
    /// chunks, release the parents, and remove the record from `registry`.
    /// Return true if the record was freed.
    pub fn delete<H>(&self, registry: &ResourceManager<H>) -> bool
    where
        H: Copy + Eq + std::hash::Hash + std::fmt::Debug,
    {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous > 1 {
            return false;
        }
        if previous < 1 {
            fatal!("record {} deleted with reference count {}", self.id, previous);
            return false;
        }

        self.chunks.lock().clear();
        let parents = std::mem::take(&mut *self.parents.lock());
        for parent in parents {
            parent.delete(registry);
        }
        registry.release_resource_record(self.id);
        tracing::trace!(id = %self.id, "freed resource record");
        true
    }

    /// Add this record's chunks, and those of its parents, to `map`, keyed
    /// by sequence number. Each record contributes only once per flush; see
    /// `mark_data_unwritten`.
    pub fn insert(&self, map: &mut BTreeMap<i64, Arc<Chunk>>) {
        if self.data_written.swap(true, Ordering::AcqRel) {
            return;
        }

        let parents = self.parents.lock().clone();
        for parent in parents {
            parent.insert(map);
        }

        for chunk in self.chunks.lock().iter() {
            map.insert(chunk.sequence(), chunk.clone());
        }
    }

    pub fn mark_data_unwritten(&self) {
        self.data_written.store(false, Ordering::Release);
    }
}

/// Exclusive access to a record's chunk list.
pub struct ChunkGuard<'r>(MutexGuard<'r, Vec<Arc<Chunk>>>);

impl ChunkGuard<'_> {
    pub fn has_chunks(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn last_chunk(&self) -> Option<&Chunk> {
        self.0.last().map(|chunk| &**chunk)
    }

    pub fn pop_chunk(&mut self) -> Option<Arc<Chunk>> {
        self.0.pop()
    }

    pub fn add_chunk(&mut self, chunk: Chunk) {
        self.0.push(Arc::new(chunk));
    }

    /// Replace any trailing chunks of type `ty` with `chunk`.
    ///
    /// Objects that get renamed every frame would otherwise pile up an
    /// unbounded list of name chunks.
    pub fn coalesce(&mut self, ty: ChunkType, chunk: Chunk) {
        while self.last_chunk().map(Chunk::ty) == Some(ty) {
            self.pop_chunk();
        }
        self.add_chunk(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::ChunkBuilder;

    fn name_chunk(name: &str) -> Chunk {
        ChunkBuilder::new(ChunkType::SetResourceName).field("name", name).finish()
    }

    #[test]
    fn renames_coalesce() {
        let record = ResourceRecord::new(ResourceId::from_raw(1), false, 0, 1);
        record.add_chunk(ChunkBuilder::new(ChunkType::CreateBuffer).finish());
        for name in &["a", "b", "c"] {
            record.lock_chunks().coalesce(ChunkType::SetResourceName, name_chunk(name));
        }

        let chunks = record.chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].ty(), ChunkType::CreateBuffer);
        assert_eq!(chunks[1].ty(), ChunkType::SetResourceName);
        assert_eq!(chunks[1].payload(), name_chunk("c").payload());
    }

    #[test]
    fn delete_clears_chunks_at_zero() {
        let registry = ResourceManager::<u32>::new();
        let id = registry.new_unique_id();
        let record = registry.add_resource_record(id, false, 16, 1);
        record.add_chunk(ChunkBuilder::new(ChunkType::CreateBuffer).finish());
        record.add_ref();

        assert!(!record.delete(&registry));
        assert!(record.has_chunks());
        assert!(registry.has_resource_record(id));

        assert!(record.delete(&registry));
        assert!(!record.has_chunks());
        assert!(!registry.has_resource_record(id));
    }

    #[test]
    fn parents_insert_first_and_once() {
        let registry = ResourceManager::<u32>::new();
        let parent = registry.add_resource_record(registry.new_unique_id(), false, 0, 1);
        let child = registry.add_resource_record(registry.new_unique_id(), false, 0, 0);
        parent.add_chunk(ChunkBuilder::new(ChunkType::CreateBuffer).finish());
        child.add_chunk(ChunkBuilder::new(ChunkType::CreateCounterView).finish());
        child.add_parent(parent.clone());
        child.add_parent(parent.clone());
        assert_eq!(parent.ref_count(), 2);

        let mut map = BTreeMap::new();
        child.insert(&mut map);
        parent.insert(&mut map);
        let types: Vec<_> = map.values().map(|c| c.ty()).collect();
        assert_eq!(types, [ChunkType::CreateBuffer, ChunkType::CreateCounterView]);

        // Freeing the child drops its hold on the parent.
        assert!(child.delete(&registry));
        assert_eq!(parent.ref_count(), 1);
    }

    #[test]
    fn append_from_duplicates_in_order() {
        let a = ResourceRecord::new(ResourceId::from_raw(1), false, 0, 0);
        let b = ResourceRecord::new(ResourceId::from_raw(2), false, 0, 0);
        b.add_chunk(ChunkBuilder::new(ChunkType::Draw).finish());
        b.add_chunk(ChunkBuilder::new(ChunkType::FinishCommandList).finish());
        a.add_chunk(ChunkBuilder::new(ChunkType::ExecuteCommandList).finish());
        a.append_from(&b);

        let chunks = a.chunks();
        let types: Vec<_> = chunks.iter().map(|c| c.ty()).collect();
        assert_eq!(
            types,
            [ChunkType::ExecuteCommandList, ChunkType::Draw, ChunkType::FinishCommandList]
        );
        assert!(chunks.windows(2).all(|w| w[0].sequence() < w[1].sequence()));
        assert_eq!(b.chunk_count(), 2);
    }
}
