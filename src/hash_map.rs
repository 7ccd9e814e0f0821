//! A concurrent hash map with adaptive list/B-tree bucket chains.

mod tree;

use std::cell::UnsafeCell;
use std::collections::TryReserveError;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicUsize};

use crate::exit_guard::ExitGuard;
use crate::hash::MaskHash;
use crate::slab::Slab;
use crate::sync::{wait_until, Backoff, RwSpinLock, SeqLock, SpinLock};
use tree::{BTree, NodesExhausted, TreeCtx, TreeInsert, TreeNode, MIN_DEGREE, NIL};

/// Maximum length of a bucket's linked list; the next insert promotes the
/// chain to a tree.
const MAX_LIST: usize = 6;

/// Minimum record count of a bucket's tree; falling below it demotes the
/// chain back to a list. `MAX_LIST > MIN_TREE` keeps the two transitions from
/// thrashing at the boundary.
const MIN_TREE: usize = 5;

/// Default bucket count.
const DEFAULT_BUCKETS: usize = 256;

/// Default load factor.
const DEFAULT_LOAD_FACTOR: f64 = 0.75;

/// One record: the key-value pair, the cached hash, a sequence lock guarding
/// the value, and the list link used while the chain is a list.
pub(crate) struct DataNode<K, V> {
    pub(crate) hash: usize,
    pub(crate) next: usize,
    pub(crate) seq: SeqLock,
    pub(crate) key: K,
    pub(crate) value: UnsafeCell<V>,
}

/// The shape of a bucket's chain.
#[derive(Clone, Copy)]
enum Chain {
    Empty,
    List { head: usize, len: usize },
    Tree(BTree),
}

/// A bucket: its reader-writer lock and the chain it protects.
struct Bucket {
    lock: RwSpinLock,
    chain: UnsafeCell<Chain>,
}

/// Everything a rebuild replaces wholesale: the bucket array, both slabs, and
/// the derived masking parameters.
struct Core<K, V> {
    buckets: Box<[Bucket]>,
    data: Slab<DataNode<K, V>>,
    nodes: Slab<TreeNode>,
    pos_mask: usize,
    mask_bits: u32,
    threshold: usize,
}

/// Outcome of a bucket-level insertion attempt.
enum ChainInsert {
    Inserted,
    Exists,
    Full,
}

impl<K, V> Core<K, V> {
    fn new(bucket_count: usize, load_factor: f64) -> Result<Self, TryReserveError> {
        let threshold = ((bucket_count as f64 * load_factor) as usize).max(1);
        let mut buckets = Vec::new();
        buckets.try_reserve_exact(bucket_count)?;
        for _ in 0..bucket_count {
            buckets.push(Bucket {
                lock: RwSpinLock::new(),
                chain: UnsafeCell::new(Chain::Empty),
            });
        }
        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            data: Slab::new(threshold)?,
            // Every tree node anchors multiple records, so a pool of
            // `threshold / MIN_DEGREE` nodes outlasts the data pool in all but
            // pathological collision pile-ups, where exhaustion just triggers
            // the same growth path.
            nodes: Slab::new((threshold + MIN_DEGREE - 1) / MIN_DEGREE)?,
            pos_mask: bucket_count - 1,
            mask_bits: (bucket_count - 1).count_ones(),
            threshold,
        })
    }

    #[inline]
    fn tree_ctx(&self) -> TreeCtx<'_, K, V> {
        TreeCtx {
            data: &self.data,
            nodes: &self.nodes,
        }
    }
}

impl<K: MaskHash + Ord + Clone, V: Copy> Core<K, V> {
    /// Initializes a freshly allocated data node.
    ///
    /// # Safety
    ///
    /// `slot` must have just been obtained from `self.data`.
    unsafe fn write_node(&self, slot: usize, hash: usize, key: &K, value: V, next: usize) {
        self.data.slot_ptr(slot).write(DataNode {
            hash,
            next,
            seq: SeqLock::new(),
            key: key.clone(),
            value: UnsafeCell::new(value),
        });
    }

    /// Walks a chain for `(hash, key)`.
    ///
    /// # Safety
    ///
    /// The caller must hold the owning bucket's lock in at least read mode.
    unsafe fn chain_find(&self, chain: Chain, hash: usize, key: &K) -> Option<usize> {
        match chain {
            Chain::Empty => None,
            Chain::List { head, .. } => {
                let mut cur = head;
                while cur != NIL {
                    let node = &*self.data.slot_ptr(cur);
                    if node.hash == hash && node.key == *key {
                        return Some(cur);
                    }
                    cur = node.next;
                }
                None
            }
            Chain::Tree(chain_tree) => chain_tree.search(&self.tree_ctx(), hash, key),
        }
    }

    /// Inserts `(key, value)` into the bucket selected by `hash`, morphing the
    /// chain as needed. With `overwrite`, an existing entry's value is
    /// replaced in place.
    ///
    /// # Safety
    ///
    /// The caller must hold the owning bucket's write lock or otherwise have
    /// exclusive access to the table.
    unsafe fn chain_insert(&self, hash: usize, key: &K, value: V, overwrite: bool) -> ChainInsert {
        let bucket = &self.buckets[hash & self.pos_mask];
        let chain_ptr = bucket.chain.get();
        match *chain_ptr {
            Chain::Empty => {
                let Some(slot) = self.data.allocate() else {
                    return ChainInsert::Full;
                };
                self.write_node(slot, hash, key, value, NIL);
                *chain_ptr = Chain::List { head: slot, len: 1 };
                ChainInsert::Inserted
            }
            Chain::List { head, len } => {
                let mut cur = head;
                while cur != NIL {
                    let node = &*self.data.slot_ptr(cur);
                    if node.hash == hash && node.key == *key {
                        if overwrite {
                            ptr::write(node.value.get(), value);
                        }
                        return ChainInsert::Exists;
                    }
                    cur = node.next;
                }
                let Some(slot) = self.data.allocate() else {
                    return ChainInsert::Full;
                };
                if len == MAX_LIST {
                    // The list is at its limit: build the tree from the six
                    // resident records plus the new one. The list is untouched
                    // until the tree is complete, so a failure leaves no
                    // partial state behind.
                    match self.promote(head, hash, key, slot) {
                        Ok(promoted) => {
                            self.write_node(slot, hash, key, value, NIL);
                            *chain_ptr = Chain::Tree(promoted);
                            ChainInsert::Inserted
                        }
                        Err(NodesExhausted) => {
                            self.data.free(slot);
                            ChainInsert::Full
                        }
                    }
                } else {
                    self.write_node(slot, hash, key, value, head);
                    *chain_ptr = Chain::List {
                        head: slot,
                        len: len + 1,
                    };
                    ChainInsert::Inserted
                }
            }
            Chain::Tree(mut chain_tree) => {
                let ctx = self.tree_ctx();
                // The data node is claimed before the tree mutation so the
                // tree can never hold a handle without a backing slot.
                let Some(slot) = self.data.allocate() else {
                    return match chain_tree.search(&ctx, hash, key) {
                        Some(existing) => {
                            if overwrite {
                                ptr::write((*self.data.slot_ptr(existing)).value.get(), value);
                            }
                            ChainInsert::Exists
                        }
                        None => ChainInsert::Full,
                    };
                };
                let outcome = chain_tree.insert(&ctx, hash, key, slot);
                // Pre-splits may have moved the root even when nothing was
                // inserted.
                *chain_ptr = Chain::Tree(chain_tree);
                match outcome {
                    Ok(TreeInsert::Inserted) => {
                        self.write_node(slot, hash, key, value, NIL);
                        ChainInsert::Inserted
                    }
                    Ok(TreeInsert::Found(existing)) => {
                        self.data.free(slot);
                        if overwrite {
                            ptr::write((*self.data.slot_ptr(existing)).value.get(), value);
                        }
                        ChainInsert::Exists
                    }
                    Err(NodesExhausted) => {
                        self.data.free(slot);
                        ChainInsert::Full
                    }
                }
            }
        }
    }

    /// Builds a tree from the list rooted at `head` plus the record that will
    /// occupy `new_slot`.
    unsafe fn promote(
        &self,
        head: usize,
        new_hash: usize,
        new_key: &K,
        new_slot: usize,
    ) -> Result<BTree, NodesExhausted> {
        let ctx = self.tree_ctx();
        let mut built = BTree::new();
        let mut cur = head;
        while cur != NIL {
            let node = &*self.data.slot_ptr(cur);
            if built.insert(&ctx, node.hash, &node.key, cur).is_err() {
                built.clear(&ctx);
                return Err(NodesExhausted);
            }
            cur = node.next;
        }
        match built.insert(&ctx, new_hash, new_key, new_slot) {
            Ok(TreeInsert::Inserted) => Ok(built),
            _ => {
                built.clear(&ctx);
                Err(NodesExhausted)
            }
        }
    }

    /// Removes `(hash, key)` from its bucket, demoting a shrunken tree back
    /// to a list.
    ///
    /// # Safety
    ///
    /// The caller must hold the owning bucket's write lock or otherwise have
    /// exclusive access to the table.
    unsafe fn chain_remove(&self, hash: usize, key: &K) -> Option<V> {
        let bucket = &self.buckets[hash & self.pos_mask];
        let chain_ptr = bucket.chain.get();
        match *chain_ptr {
            Chain::Empty => None,
            Chain::List { head, len } => {
                let mut prev = NIL;
                let mut cur = head;
                while cur != NIL {
                    let node = &*self.data.slot_ptr(cur);
                    if node.hash == hash && node.key == *key {
                        break;
                    }
                    prev = cur;
                    cur = node.next;
                }
                if cur == NIL {
                    return None;
                }
                let next = (*self.data.slot_ptr(cur)).next;
                if prev == NIL {
                    *chain_ptr = if len == 1 {
                        Chain::Empty
                    } else {
                        Chain::List {
                            head: next,
                            len: len - 1,
                        }
                    };
                } else {
                    (*self.data.slot_ptr(prev)).next = next;
                    *chain_ptr = Chain::List {
                        head,
                        len: len - 1,
                    };
                }
                Some(self.release_node(cur))
            }
            Chain::Tree(mut chain_tree) => {
                let ctx = self.tree_ctx();
                let Some(slot) = chain_tree.remove(&ctx, hash, key) else {
                    *chain_ptr = Chain::Tree(chain_tree);
                    return None;
                };
                let value = self.release_node(slot);
                if chain_tree.len < MIN_TREE {
                    // The tree shrank below the hysteresis floor: collapse it
                    // back into a list.
                    let mut handles = Vec::with_capacity(chain_tree.len);
                    chain_tree.collect(&ctx, &mut handles);
                    chain_tree.clear(&ctx);
                    *chain_ptr = if handles.is_empty() {
                        Chain::Empty
                    } else {
                        for i in 0..handles.len() - 1 {
                            (*self.data.slot_ptr(handles[i])).next = handles[i + 1];
                        }
                        (*self.data.slot_ptr(handles[handles.len() - 1])).next = NIL;
                        Chain::List {
                            head: handles[0],
                            len: handles.len(),
                        }
                    };
                } else {
                    *chain_ptr = Chain::Tree(chain_tree);
                }
                Some(value)
            }
        }
    }

    /// Reads out the value, drops the key, and returns the slot to the slab.
    unsafe fn release_node(&self, slot: usize) -> V {
        let node = self.data.slot_ptr(slot);
        let value = *(*node).value.get();
        ptr::drop_in_place(node);
        self.data.free(slot);
        value
    }
}

impl<K, V> Drop for Core<K, V> {
    fn drop(&mut self) {
        for bucket in self.buckets.iter() {
            match unsafe { *bucket.chain.get() } {
                Chain::Empty => {}
                Chain::List { head, .. } => {
                    let mut cur = head;
                    while cur != NIL {
                        let node = self.data.slot_ptr(cur);
                        unsafe {
                            cur = (*node).next;
                            ptr::drop_in_place(node);
                        }
                    }
                }
                Chain::Tree(chain_tree) => {
                    let mut handles = Vec::with_capacity(chain_tree.len);
                    chain_tree.collect(&self.tree_ctx(), &mut handles);
                    for slot in handles {
                        unsafe { ptr::drop_in_place(self.data.slot_ptr(slot)) };
                    }
                }
            }
        }
    }
}

/// Errors surfaced by the mutating table operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The key is already present; nothing was mutated.
    KeyExists,
    /// An arena or the bucket array could not be grown; the table is exactly
    /// as it was before the operation.
    OutOfMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyExists => f.write_str("the key already exists"),
            Self::OutOfMemory => f.write_str("out of memory"),
        }
    }
}

impl std::error::Error for Error {}

/// A snapshot of how records are distributed over buckets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    /// Total bucket count, empty buckets included.
    pub buckets: usize,
    /// Buckets holding at least one record.
    pub filled_buckets: usize,
    /// Total record count.
    pub len: usize,
    /// Buckets holding two or more records.
    pub collisions: usize,
    /// Record count of the most collided bucket, or zero without collisions.
    pub max_collision: usize,
}

/// A configuration builder for [`HashMap`].
///
/// Every parameter is fixed at construction time.
///
/// # Examples
///
/// ```
/// use morphmap::HashMap;
///
/// let map: HashMap<u64, u64> = HashMap::builder()
///     .initial_buckets(16)
///     .load_factor(0.5)
///     .resizable(false)
///     .build();
/// assert_eq!(map.bucket_count(), 16);
/// ```
pub struct Builder<K, V> {
    initial_buckets: usize,
    load_factor: f64,
    resizable: bool,
    countable: bool,
    max_buckets: usize,
    hash_fn: Option<fn(&K, u32) -> usize>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: MaskHash + Ord + Clone, V: Copy> Builder<K, V> {
    fn new() -> Self {
        Self {
            initial_buckets: DEFAULT_BUCKETS,
            load_factor: DEFAULT_LOAD_FACTOR,
            resizable: true,
            countable: true,
            max_buckets: usize::MAX,
            hash_fn: None,
            _marker: PhantomData,
        }
    }

    /// Sets the initial bucket count, rounded up to a power of two of at
    /// least 2. Defaults to 256.
    #[must_use]
    pub fn initial_buckets(mut self, initial_buckets: usize) -> Self {
        self.initial_buckets = initial_buckets;
        self
    }

    /// Sets the load factor. Defaults to 0.75.
    ///
    /// The record capacity between growth steps is `⌊buckets · load_factor⌋`.
    /// Lower values trade memory for fewer collisions.
    ///
    /// # Panics
    ///
    /// Panics if `load_factor` is not strictly positive.
    #[must_use]
    pub fn load_factor(mut self, load_factor: f64) -> Self {
        assert!(load_factor > 0.0, "load factor must be positive");
        self.load_factor = load_factor;
        self
    }

    /// Sets whether the table grows automatically when its arenas fill up.
    /// Defaults to `true`, which forces record counting on.
    #[must_use]
    pub fn resizable(mut self, resizable: bool) -> Self {
        self.resizable = resizable;
        if resizable {
            self.countable = true;
        }
        self
    }

    /// Sets whether the table maintains its record count. Only effective on a
    /// fixed-capacity table; a resizable one always counts.
    #[must_use]
    pub fn countable(mut self, countable: bool) -> Self {
        if !self.resizable {
            self.countable = countable;
        }
        self
    }

    /// Caps automatic growth at the given bucket count. Defaults to
    /// `usize::MAX`.
    #[must_use]
    pub fn max_buckets(mut self, max_buckets: usize) -> Self {
        self.max_buckets = max_buckets;
        self
    }

    /// Replaces the default [`MaskHash`] hash with a custom function.
    #[must_use]
    pub fn hash_fn(mut self, hash_fn: fn(&K, u32) -> usize) -> Self {
        self.hash_fn = Some(hash_fn);
        self
    }

    /// Builds the table.
    ///
    /// # Panics
    ///
    /// Panics if the bucket array or the arenas cannot be allocated.
    #[must_use]
    pub fn build(self) -> HashMap<K, V> {
        let bucket_count = self.initial_buckets.next_power_of_two().max(2);
        let core =
            Core::new(bucket_count, self.load_factor).expect("initial table allocation failed");
        HashMap {
            core: UnsafeCell::new(core),
            resizing: AtomicBool::new(false),
            visitors: AtomicUsize::new(0),
            data_count: AtomicUsize::new(0),
            resize_lock: SpinLock::new(),
            resizable: self.resizable,
            countable: self.countable,
            max_buckets: self.max_buckets,
            load_factor: self.load_factor,
            hash_fn: self.hash_fn.unwrap_or(K::mask_hash),
        }
    }
}

/// A thread-safe hash map for read-heavy point-lookup workloads.
///
/// Records live in a preallocated slab arena; every bucket chain is either a
/// short linked list or a B-tree of record handles, switching shape with the
/// record count. Lookups and in-place updates share the bucket lock, inserts
/// and removals take it exclusively, and arena exhaustion triggers an atomic
/// rebuild that doubles the bucket array and rehashes every record.
///
/// Keys supply their own mask-aware hash through [`MaskHash`]; values are
/// `Copy` so readers can snapshot them under a sequence lock without blocking
/// a concurrent update.
///
/// # Examples
///
/// ```
/// use morphmap::{Error, HashMap};
///
/// let map: HashMap<u64, u32> = HashMap::new();
/// assert!(map.insert(17, 1).is_ok());
/// assert_eq!(map.insert(17, 2), Err(Error::KeyExists));
/// assert_eq!(map.get(&17), Some(1));
/// assert!(map.upsert(17, 2).is_ok());
/// assert_eq!(map.remove(&17), Some(2));
/// ```
pub struct HashMap<K, V> {
    core: UnsafeCell<Core<K, V>>,
    resizing: AtomicBool,
    visitors: AtomicUsize,
    data_count: AtomicUsize,
    resize_lock: SpinLock,
    resizable: bool,
    countable: bool,
    max_buckets: usize,
    load_factor: f64,
    hash_fn: fn(&K, u32) -> usize,
}

// SAFETY: all shared mutable state is reached through the bucket locks, the
// per-record sequence locks, or the visitor/rebuild protocol.
unsafe impl<K: Send, V: Send> Send for HashMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for HashMap<K, V> {}

impl<K: MaskHash + Ord + Clone, V: Copy> HashMap<K, V> {
    /// Creates a table with the default configuration: 256 buckets, load
    /// factor 0.75, resizable and counting.
    ///
    /// # Panics
    ///
    /// Panics if the bucket array or the arenas cannot be allocated.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns a configuration [`Builder`].
    #[must_use]
    pub fn builder() -> Builder<K, V> {
        Builder::new()
    }

    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// [`Error::KeyExists`] if the key is present (the stored value is left
    /// alone), or [`Error::OutOfMemory`] if the arenas are exhausted and the
    /// table cannot grow.
    pub fn insert(&self, key: K, value: V) -> Result<(), Error> {
        self.begin();
        match self.insert_node(&key, value, false) {
            ChainInsert::Inserted => {
                self.end_add();
                Ok(())
            }
            ChainInsert::Exists => {
                self.end();
                Err(Error::KeyExists)
            }
            ChainInsert::Full => {
                self.end();
                Err(Error::OutOfMemory)
            }
        }
    }

    /// Inserts the record, or overwrites the value if the key is present.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if the arenas are exhausted and the table
    /// cannot grow.
    pub fn upsert(&self, key: K, value: V) -> Result<(), Error> {
        self.begin();
        match self.insert_node(&key, value, true) {
            ChainInsert::Inserted => {
                self.end_add();
                Ok(())
            }
            ChainInsert::Exists => {
                self.end();
                Ok(())
            }
            ChainInsert::Full => {
                self.end();
                Err(Error::OutOfMemory)
            }
        }
    }

    /// Overwrites the value of an existing record, returning `false` if the
    /// key is absent.
    ///
    /// The bucket stays in shared mode: the write is guarded by the record's
    /// sequence lock, so concurrent readers and updaters of other keys in the
    /// same bucket proceed untouched.
    pub fn update(&self, key: &K, value: V) -> bool {
        self.begin();
        let core = unsafe { &*self.core.get() };
        let hash = (self.hash_fn)(key, core.mask_bits);
        let bucket = &core.buckets[hash & core.pos_mask];
        bucket.lock.read_lock();
        let chain = unsafe { *bucket.chain.get() };
        let updated = match unsafe { core.chain_find(chain, hash, key) } {
            Some(slot) => unsafe {
                let node = &*core.data.slot_ptr(slot);
                node.seq.write_lock();
                ptr::write_volatile(node.value.get(), value);
                node.seq.write_unlock();
                true
            },
            None => false,
        };
        bucket.lock.read_unlock();
        self.end();
        updated
    }

    /// Returns a copy of the value stored for `key`.
    ///
    /// An update racing on the same record only retries the sequence-lock
    /// read loop, never the bucket lookup.
    pub fn get(&self, key: &K) -> Option<V> {
        self.begin();
        let core = unsafe { &*self.core.get() };
        let hash = (self.hash_fn)(key, core.mask_bits);
        let bucket = &core.buckets[hash & core.pos_mask];
        bucket.lock.read_lock();
        let chain = unsafe { *bucket.chain.get() };
        let value = unsafe { core.chain_find(chain, hash, key) }
            .map(|slot| unsafe { Self::read_value(&*core.data.slot_ptr(slot)) });
        bucket.lock.read_unlock();
        self.end();
        value
    }

    /// Removes the record for `key`, returning its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.begin();
        let core = unsafe { &*self.core.get() };
        let hash = (self.hash_fn)(key, core.mask_bits);
        let bucket = &core.buckets[hash & core.pos_mask];
        bucket.lock.write_lock();
        let removed = unsafe { core.chain_remove(hash, key) };
        bucket.lock.write_unlock();
        if removed.is_some() {
            self.end_del();
        } else {
            self.end();
        }
        removed
    }

    /// Visits every record. The visiting order is unspecified.
    ///
    /// Each bucket is read-locked while its records are visited, so the
    /// closure must not call mutating operations of this table.
    pub fn scan<F: FnMut(&K, V)>(&self, mut f: F) {
        self.begin();
        let core = unsafe { &*self.core.get() };
        for bucket in core.buckets.iter() {
            bucket.lock.read_lock();
            let chain = unsafe { *bucket.chain.get() };
            unsafe {
                match chain {
                    Chain::Empty => {}
                    Chain::List { head, .. } => {
                        let mut cur = head;
                        while cur != NIL {
                            let node = &*core.data.slot_ptr(cur);
                            f(&node.key, Self::read_value(node));
                            cur = node.next;
                        }
                    }
                    Chain::Tree(chain_tree) => {
                        let mut handles = Vec::with_capacity(chain_tree.len);
                        chain_tree.collect(&core.tree_ctx(), &mut handles);
                        for slot in handles {
                            let node = &*core.data.slot_ptr(slot);
                            f(&node.key, Self::read_value(node));
                        }
                    }
                }
            }
            bucket.lock.read_unlock();
        }
        self.end();
    }

    /// Returns the record count.
    ///
    /// Meaningful only when counting is enabled (the default; fixed-capacity
    /// tables may opt out), in which case it is exact between operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data_count.load(Relaxed)
    }

    /// Returns `true` if the table holds no records, subject to the caveat on
    /// [`len`](Self::len).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current bucket count.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.begin();
        let count = unsafe { &*self.core.get() }.buckets.len();
        self.end();
        count
    }

    /// Returns the record capacity before the next growth step.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.begin();
        let threshold = unsafe { &*self.core.get() }.threshold;
        self.end();
        threshold
    }

    /// Returns the configured load factor.
    #[must_use]
    pub fn load_factor(&self) -> f64 {
        self.load_factor
    }

    /// Reports how records are spread over buckets.
    ///
    /// Automatic growth is paused for the duration of the scan; data
    /// operations are not, so the snapshot is only exact if mutators are
    /// quiescent.
    pub fn statistics(&self) -> Statistics {
        if self.resizable {
            self.resize_lock.lock();
        }
        let core = unsafe { &*self.core.get() };
        let mut stats = Statistics {
            buckets: core.buckets.len(),
            ..Statistics::default()
        };
        for bucket in core.buckets.iter() {
            bucket.lock.read_lock();
            let chain = unsafe { *bucket.chain.get() };
            bucket.lock.read_unlock();
            let len = match chain {
                Chain::Empty => 0,
                Chain::List { len, .. } => len,
                Chain::Tree(chain_tree) => chain_tree.len,
            };
            if len > 0 {
                stats.filled_buckets += 1;
                stats.len += len;
                if len >= 2 {
                    stats.collisions += 1;
                    stats.max_collision = stats.max_collision.max(len);
                }
            }
        }
        if self.resizable {
            self.resize_lock.unlock();
        }
        stats
    }

    /// Reads a value snapshot under the record's sequence lock.
    ///
    /// # Safety
    ///
    /// The record must stay alive for the duration of the call, which the
    /// bucket lock guarantees.
    unsafe fn read_value(node: &DataNode<K, V>) -> V {
        loop {
            let stamp = node.seq.read_begin();
            let value = ptr::read_volatile(node.value.get());
            if node.seq.read_validate(stamp) {
                return value;
            }
        }
    }

    /// Bucket-level insertion with growth-and-retry on arena exhaustion.
    fn insert_node(&self, key: &K, value: V, overwrite: bool) -> ChainInsert {
        loop {
            let core = unsafe { &*self.core.get() };
            // The hash depends on the mask width, so it is recomputed on
            // every attempt.
            let hash = (self.hash_fn)(key, core.mask_bits);
            let observed_buckets = core.buckets.len();
            let bucket = &core.buckets[hash & core.pos_mask];
            bucket.lock.write_lock();
            let outcome = unsafe { core.chain_insert(hash, key, value, overwrite) };
            bucket.lock.write_unlock();
            match outcome {
                ChainInsert::Full => {
                    if !self.try_grow(observed_buckets) {
                        return ChainInsert::Full;
                    }
                }
                done => return done,
            }
        }
    }

    /// Registers the calling thread as a visitor, waiting out any rebuild in
    /// progress.
    #[inline]
    fn begin(&self) {
        if !self.resizable {
            return;
        }
        loop {
            self.visitors.fetch_add(1, SeqCst);
            if !self.resizing.load(SeqCst) {
                return;
            }
            self.visitors.fetch_sub(1, SeqCst);
            wait_until(&self.resizing, false);
        }
    }

    #[inline]
    fn end(&self) {
        if self.resizable {
            self.visitors.fetch_sub(1, SeqCst);
        }
    }

    #[inline]
    fn end_add(&self) {
        if self.countable {
            self.data_count.fetch_add(1, Relaxed);
        }
        if self.resizable {
            self.visitors.fetch_sub(1, SeqCst);
        }
    }

    #[inline]
    fn end_del(&self) {
        if self.countable {
            self.data_count.fetch_sub(1, Relaxed);
        }
        if self.resizable {
            self.visitors.fetch_sub(1, SeqCst);
        }
    }

    fn wait_visitors(&self) {
        let mut backoff = Backoff::new();
        while self.visitors.load(SeqCst) != 0 {
            backoff.snooze();
        }
    }

    /// Attempts to double the table. Returns `true` if the caller should
    /// retry its operation (the table grew, or another thread grew it first).
    fn try_grow(&self, observed_buckets: usize) -> bool {
        if !self.resizable {
            return false;
        }
        // The visitor slot is surrendered before taking the resize lock;
        // holding it would deadlock against the visitor barrier below.
        self.visitors.fetch_sub(1, SeqCst);
        self.resize_lock.lock();
        let _cleanup = ExitGuard::new(|| {
            self.resize_lock.unlock();
            self.begin();
        });
        let bucket_count = unsafe { &*self.core.get() }.buckets.len();
        if bucket_count > observed_buckets {
            // Another thread grew the table while this one queued.
            return true;
        }
        if bucket_count >= self.max_buckets {
            return false;
        }
        self.resizing.store(true, SeqCst);
        let _unpause = ExitGuard::new(|| self.resizing.store(false, SeqCst));
        self.wait_visitors();
        unsafe { self.rebuild() }
    }

    /// Doubles the bucket array and migrates every record into fresh arenas.
    ///
    /// # Safety
    ///
    /// The caller must have drained all visitors and hold the resize lock,
    /// making this thread the only one touching the table.
    unsafe fn rebuild(&self) -> bool {
        let core = &mut *self.core.get();
        let Ok(mut next) = Core::new(core.buckets.len() << 1, self.load_factor) else {
            return false;
        };
        let mut migrated = true;
        'migration: for bucket in core.buckets.iter() {
            match *bucket.chain.get() {
                Chain::Empty => {}
                Chain::List { head, .. } => {
                    let mut cur = head;
                    while cur != NIL {
                        if !Self::migrate(core, &mut next, self.hash_fn, cur) {
                            migrated = false;
                            break 'migration;
                        }
                        cur = (*core.data.slot_ptr(cur)).next;
                    }
                }
                Chain::Tree(chain_tree) => {
                    let mut handles = Vec::with_capacity(chain_tree.len);
                    chain_tree.collect(&core.tree_ctx(), &mut handles);
                    for slot in handles {
                        if !Self::migrate(core, &mut next, self.hash_fn, slot) {
                            migrated = false;
                            break 'migration;
                        }
                    }
                }
            }
        }
        if !migrated {
            // Dropping the half-built replacement rolls everything back; the
            // old table was never modified.
            return false;
        }
        *core = next;
        true
    }

    /// Copies one record into the replacement core.
    unsafe fn migrate(
        old: &Core<K, V>,
        next: &mut Core<K, V>,
        hash_fn: fn(&K, u32) -> usize,
        slot: usize,
    ) -> bool {
        let node = &*old.data.slot_ptr(slot);
        // The fold depends on the mask width, so the cached hash is stale in
        // the doubled table.
        let hash = hash_fn(&node.key, next.mask_bits);
        matches!(
            next.chain_insert(hash, &node.key, *node.value.get(), false),
            ChainInsert::Inserted
        )
    }

    /// Reports the shape of the bucket chain the key belongs to.
    #[cfg(test)]
    pub(crate) fn chain_shape(&self, key: &K) -> (char, usize) {
        self.begin();
        let core = unsafe { &*self.core.get() };
        let hash = (self.hash_fn)(key, core.mask_bits);
        let bucket = &core.buckets[hash & core.pos_mask];
        bucket.lock.read_lock();
        let chain = unsafe { *bucket.chain.get() };
        bucket.lock.read_unlock();
        self.end();
        match chain {
            Chain::Empty => ('E', 0),
            Chain::List { len, .. } => ('L', len),
            Chain::Tree(chain_tree) => ('T', chain_tree.len),
        }
    }
}

impl<K: MaskHash + Ord + Clone, V: Copy> Default for HashMap<K, V> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K: MaskHash + Ord + Clone + Debug, V: Copy + Debug> Debug for HashMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.scan(|key, value| {
            map.entry(key, &value);
        });
        map.finish()
    }
}
