//! # LRU Tile Cache
//!
//! Byte-bounded cache for decoded tile buffers, keyed by
//! `"<uri>+<offset>"` strings. The storage manager consults it before
//! touching the VFS and inserts after every uncached tile read.
//!
//! ## Eviction
//!
//! Strict least-recently-used. Entries form an intrusive doubly-linked
//! list over slab slots:
//!
//! ```text
//! head (most recent) <-> ... <-> tail (least recent)
//!        ^ read/insert touch           ^ evicted first
//! ```
//!
//! Inserting past the byte capacity evicts from the tail until the new
//! entry fits. An object larger than the whole capacity is never
//! admitted (the facade also refuses those before calling in).
//!
//! ## Contract
//!
//! - `read` returns a copy of `nbytes` at `offset` within the cached
//!   object, or `None` on a miss or out-of-range request. Hits refresh
//!   recency.
//! - `insert` stores an owned copy; re-inserting a key replaces the old
//!   bytes.
//!
//! ## Thread Safety
//!
//! One `parking_lot::Mutex` guards the whole structure. Operations only
//! copy bytes in or out, so the critical sections stay short; the cache
//! is shared freely across reader and writer threads.

use hashbrown::HashMap;
use parking_lot::Mutex;

const NIL: usize = usize::MAX;

struct Entry {
    key: String,
    bytes: Vec<u8>,
    prev: usize,
    next: usize,
}

struct LruState {
    map: HashMap<String, usize>,
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    size: u64,
}

impl LruState {
    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = self.slots[idx].as_ref().unwrap();
            (entry.prev, entry.next)
        };
        match prev {
            NIL => self.head = next,
            p => self.slots[p].as_mut().unwrap().next = next,
        }
        match next {
            NIL => self.tail = prev,
            n => self.slots[n].as_mut().unwrap().prev = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        {
            let entry = self.slots[idx].as_mut().unwrap();
            entry.prev = NIL;
            entry.next = self.head;
        }
        match self.head {
            NIL => self.tail = idx,
            h => self.slots[h].as_mut().unwrap().prev = idx,
        }
        self.head = idx;
    }

    fn remove(&mut self, idx: usize) -> Entry {
        self.detach(idx);
        let entry = self.slots[idx].take().unwrap();
        self.free.push(idx);
        self.map.remove(&entry.key);
        self.size -= entry.bytes.len() as u64;
        entry
    }

    fn evict_tail(&mut self) {
        let tail = self.tail;
        if tail != NIL {
            self.remove(tail);
        }
    }
}

pub struct TileCache {
    state: Mutex<LruState>,
    max_size: u64,
}

impl TileCache {
    pub fn new(max_size: u64) -> Self {
        Self {
            state: Mutex::new(LruState {
                map: HashMap::new(),
                slots: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
                size: 0,
            }),
            max_size,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Current total of cached bytes.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `nbytes` at `offset` out of the cached object, refreshing
    /// its recency. `None` on a miss or an out-of-range request.
    pub fn read(&self, key: &str, offset: u64, nbytes: u64) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let idx = *state.map.get(key)?;

        let out = {
            let entry = state.slots[idx].as_ref().unwrap();
            let start = usize::try_from(offset).ok()?;
            let len = usize::try_from(nbytes).ok()?;
            let end = start.checked_add(len)?;
            if end > entry.bytes.len() {
                return None;
            }
            entry.bytes[start..end].to_vec()
        };

        state.detach(idx);
        state.push_front(idx);
        Some(out)
    }

    /// Inserts an owned copy of `bytes`, evicting least-recently-used
    /// entries until it fits. Oversized objects are silently skipped.
    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        let object_size = bytes.len() as u64;
        if object_size > self.max_size {
            return;
        }

        let mut state = self.state.lock();
        if let Some(&idx) = state.map.get(key) {
            state.remove(idx);
        }
        while state.size + object_size > self.max_size {
            state.evict_tail();
        }

        let idx = match state.free.pop() {
            Some(idx) => idx,
            None => {
                state.slots.push(None);
                state.slots.len() - 1
            }
        };
        state.slots[idx] = Some(Entry {
            key: key.to_string(),
            bytes,
            prev: NIL,
            next: NIL,
        });
        state.map.insert(key.to_string(), idx);
        state.size += object_size;
        state.push_front(idx);
    }
}
