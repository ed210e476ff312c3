//! Persistent Slot Table
//!
//! Two-level chunked table of `Arc`-shared entries used for heap objects and
//! static elements.
//!
//! ```text
//!   chunks: [Arc<Chunk 0>] [Arc<Chunk 1>] ...        64 slots per chunk
//!                │
//!                ▼
//!          [Some(Arc<T>), None, Some(Arc<T>), ...]
//! ```
//!
//! Cloning the table copies the chunk vector only. A mutable access makes
//! the chunk and the entry unique (`Arc::make_mut`), so the cost of a
//! snapshot is bounded by the entries changed after it, not by table size.

use std::sync::Arc;

const CHUNK_BITS: usize = 6;
const CHUNK_SIZE: usize = 1 << CHUNK_BITS;
const CHUNK_MASK: usize = CHUNK_SIZE - 1;

type Chunk<T> = Vec<Option<Arc<T>>>;

/// Copy-on-write slot table
#[derive(Debug)]
pub struct PersistentSlots<T> {
    chunks: Vec<Arc<Chunk<T>>>,
    len: usize,
}

impl<T> Clone for PersistentSlots<T> {
    fn clone(&self) -> Self {
        Self {
            chunks: self.chunks.clone(),
            len: self.len,
        }
    }
}

impl<T> Default for PersistentSlots<T> {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
        }
    }
}

impl<T: Clone> PersistentSlots<T> {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    const fn split(idx: usize) -> (usize, usize) {
        (idx >> CHUNK_BITS, idx & CHUNK_MASK)
    }

    /// Entry at `idx`
    pub fn get(&self, idx: usize) -> Option<&T> {
        let (c, s) = Self::split(idx);
        self.chunks.get(c)?.get(s)?.as_deref()
    }

    /// Entry at `idx`, made unique first
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        let (c, s) = Self::split(idx);
        let chunk = self.chunks.get_mut(c)?;
        if chunk.get(s)?.is_none() {
            return None;
        }
        Arc::make_mut(chunk)[s].as_mut().map(Arc::make_mut)
    }

    /// Occupied
    pub fn contains(&self, idx: usize) -> bool {
        self.get(idx).is_some()
    }

    /// Entry is shared with a snapshot (frozen)
    pub fn is_frozen(&self, idx: usize) -> bool {
        let (c, s) = Self::split(idx);
        self.chunks
            .get(c)
            .and_then(|chunk| chunk.get(s))
            .and_then(Option::as_ref)
            .is_some_and(|e| Arc::strong_count(e) > 1)
    }

    /// Store `value` at `idx`, returning the previous entry
    pub fn insert(&mut self, idx: usize, value: T) -> Option<Arc<T>> {
        let (c, s) = Self::split(idx);
        while self.chunks.len() <= c {
            self.chunks.push(Arc::new(vec![None; CHUNK_SIZE]));
        }
        let old = Arc::make_mut(&mut self.chunks[c])[s].replace(Arc::new(value));
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    /// Clear slot `idx`
    pub fn remove(&mut self, idx: usize) -> Option<Arc<T>> {
        let (c, s) = Self::split(idx);
        let chunk = self.chunks.get_mut(c)?;
        chunk.get(s)?.as_ref()?;
        let old = Arc::make_mut(chunk)[s].take();
        if old.is_some() {
            self.len -= 1;
        }
        old
    }

    /// Number of occupied slots
    pub const fn len(&self) -> usize {
        self.len
    }

    /// No occupied slots
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Occupied slots in index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.chunks.iter().enumerate().flat_map(|(c, chunk)| {
            chunk
                .iter()
                .enumerate()
                .filter_map(move |(s, e)| e.as_deref().map(|v| ((c << CHUNK_BITS) | s, v)))
        })
    }

    /// Indices of occupied slots
    pub fn indices(&self) -> Vec<usize> {
        self.iter().map(|(i, _)| i).collect()
    }
}
