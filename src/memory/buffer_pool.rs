use crate::error::{Error, Result};
use crate::memory::Chunk;
use crate::transport::Fabric;
use bytes::BytesMut;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::Cell;
use std::collections::VecDeque;
use std::marker::PhantomData;

/// Id-keyed store of registered chunks.
///
/// The pool may move between threads but must not be shared: every mutation
/// assumes a single caller. Wrap it in a lock to share it.
pub struct BufferPool {
    chunks: FxHashMap<u32, Chunk>,
    free: VecDeque<u32>,
    available: FxHashSet<u32>,
    next_id: u32,
    _not_sync: PhantomData<Cell<()>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            chunks: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            free: VecDeque::with_capacity(capacity),
            available: FxHashSet::with_capacity_and_hasher(capacity, Default::default()),
            next_id: 0,
            _not_sync: PhantomData,
        }
    }

    /// Exact lookup.
    pub fn index(&self, id: u32) -> Result<&Chunk> {
        self.chunks.get(&id).ok_or_else(|| Error::not_found("chunk", id))
    }

    pub fn index_mut(&mut self, id: u32) -> Result<&mut Chunk> {
        self.chunks.get_mut(&id).ok_or_else(|| Error::not_found("chunk", id))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.chunks.contains_key(&id)
    }

    /// Insert or replace the chunk stored under `id`.
    ///
    /// The chunk takes `id` as its own and becomes available to [`get`](Self::get).
    /// A replaced chunk is returned to the caller.
    pub fn add(&mut self, id: u32, mut chunk: Chunk) -> Option<Chunk> {
        chunk.set_id(id);
        let old = self.chunks.insert(id, chunk);
        if self.available.insert(id) {
            self.free.push_back(id);
        }
        // Caller-chosen ids must not collide with later counter ids.
        self.next_id = self.next_id.max(id.saturating_add(1));
        old
    }

    /// Take some available chunk out of the free set.
    pub fn get(&mut self) -> Result<&mut Chunk> {
        while let Some(id) = self.free.pop_front() {
            if self.available.remove(&id) && self.chunks.contains_key(&id) {
                return self.index_mut(id);
            }
        }
        Err(Error::Empty)
    }

    /// Return a chunk taken with [`get`](Self::get) to the free set.
    pub fn recycle(&mut self, id: u32) -> Result<()> {
        let chunk = self.chunks.get_mut(&id).ok_or_else(|| Error::not_found("chunk", id))?;
        chunk.unbind();
        if self.available.insert(id) {
            self.free.push_back(id);
        }
        Ok(())
    }

    /// Return the counter value, then advance it.
    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        id
    }

    /// Register `buf` with `fabric` under a fresh id.
    pub fn register(&mut self, fabric: &dyn Fabric, buf: BytesMut) -> Result<u32> {
        let id = self.next_id();
        let region = fabric.register(buf)?;
        self.add(id, Chunk::new(id, region));
        Ok(id)
    }

    /// Register `buf` with `fabric` under a caller-chosen id, replacing any
    /// chunk already stored there.
    pub fn register_with_id(&mut self, fabric: &dyn Fabric, buf: BytesMut, id: u32) -> Result<()> {
        let region = fabric.register(buf)?;
        if let Some(mut old) = self.add(id, Chunk::new(id, region)) {
            old.release();
        }
        Ok(())
    }

    /// Remove a chunk and release its registration.
    pub fn unregister(&mut self, id: u32) -> Result<()> {
        let mut chunk = self.remove(id)?;
        chunk.release();
        Ok(())
    }

    /// Remove a chunk without releasing it.
    pub fn remove(&mut self, id: u32) -> Result<Chunk> {
        let chunk = self.chunks.remove(&id).ok_or_else(|| Error::not_found("chunk", id))?;
        // The stale free-list entry is skipped by `get`.
        self.available.remove(&id);
        Ok(chunk)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of chunks [`get`](Self::get) can still hand out.
    pub fn available(&self) -> usize {
        self.available.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.chunks.keys().copied()
    }

    /// Release every chunk.
    pub fn clear(&mut self) {
        for (_, mut chunk) in self.chunks.drain() {
            chunk.release();
        }
        self.free.clear();
        self.available.clear();
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if !self.chunks.is_empty() {
            tracing::trace!(chunks = self.chunks.len(), "releasing buffer pool");
        }
        self.clear();
    }
}
