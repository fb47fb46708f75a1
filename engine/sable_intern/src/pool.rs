//! Reference-counted concurrent string pool.
//!
//! A single reader-writer lock guards the two tables. Reference-count
//! increments and decrements are atomic and run under a *read* lock, so the
//! common path never serialises. Only entry removal (a count reaching zero)
//! upgrades to the write lock, and must keep the entry alive across the
//! upgrade window — see [`StringPool::release`].

// Arc is the implementation of SharedPool; the pool must be shared across
// threads for concurrent interpretation and query execution.

use crate::StringId;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// One pool slot: the string and its reference count.
///
/// The count is signed so that racing decrements past zero stay comparable
/// instead of wrapping. Static entries keep a count of zero forever.
struct Entry {
    text: String,
    refcount: AtomicI64,
}

impl Entry {
    fn new(text: String, refcount: i64) -> Self {
        Entry {
            text,
            refcount: AtomicI64::new(refcount),
        }
    }
}

struct PoolInner {
    /// string → ID.
    string_to_id: FxHashMap<String, StringId>,
    /// ID (index) → string and refcount.
    entries: Vec<Entry>,
    /// Freed IDs ready for reuse; min-heap keeps the ID space compact.
    free_ids: BinaryHeap<Reverse<u32>>,
}

/// Counters reported by [`StringPool::stats`], mainly for leak tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total live entries, including the two reserved IDs and statics.
    pub strings_in_use: usize,
    /// Live entries above the static prefix.
    pub dynamic_strings_in_use: usize,
    /// Sum of reference counts over dynamic entries.
    pub dynamic_references_in_use: i64,
}

/// Process-wide reference-counted string pool.
///
/// ID 0 is "not a string", ID 1 is the empty string. IDs below the static
/// threshold are permanent and excluded from refcounting entirely; all
/// operations short-circuit for them.
pub struct StringPool {
    inner: RwLock<PoolInner>,
    num_static: u32,
}

impl StringPool {
    /// Create a pool whose static prefix holds the two reserved IDs plus
    /// every string in `static_strings`, in order.
    ///
    /// The engine passes its opcode keyword table here so keyword lookups
    /// never touch a reference count. Duplicate static strings are a caller
    /// defect and are debug-asserted.
    pub fn with_static_strings<'a>(static_strings: impl IntoIterator<Item = &'a str>) -> Self {
        let mut entries = Vec::with_capacity(256);
        let mut string_to_id = FxHashMap::default();

        // ID 0: not-a-string. Resolves to empty, never matched by content.
        entries.push(Entry::new(String::new(), 0));
        // ID 1: the empty string.
        entries.push(Entry::new(String::new(), 0));
        string_to_id.insert(String::new(), StringId::EMPTY);

        for s in static_strings {
            let id = StringId::from_raw(entries.len() as u32);
            let prev = string_to_id.insert(s.to_owned(), id);
            debug_assert!(prev.is_none(), "duplicate static string {s:?}");
            entries.push(Entry::new(s.to_owned(), 0));
        }

        let num_static = entries.len() as u32;
        StringPool {
            inner: RwLock::new(PoolInner {
                string_to_id,
                entries,
                free_ids: BinaryHeap::new(),
            }),
            num_static,
        }
    }

    /// Create a pool with only the two reserved static IDs.
    pub fn new() -> Self {
        Self::with_static_strings([])
    }

    /// Number of static (never-freed, never-refcounted) IDs.
    #[inline]
    pub fn num_static(&self) -> u32 {
        self.num_static
    }

    /// True if `id` is in the static prefix.
    #[inline]
    pub fn is_static(&self, id: StringId) -> bool {
        id.raw() < self.num_static
    }

    /// Intern `s`, creating a reference.
    ///
    /// Returns the existing ID with its count incremented, or a fresh ID
    /// (reusing the smallest freed one if any) with a count of one.
    pub fn intern(&self, s: &str) -> StringId {
        if s.is_empty() {
            return StringId::EMPTY;
        }

        let mut inner = self.inner.write();
        if let Some(&id) = inner.string_to_id.get(s) {
            if !self.is_static(id) {
                inner.entries[id.index()].refcount.fetch_add(1, Ordering::Relaxed);
            }
            return id;
        }

        let id = match inner.free_ids.pop() {
            Some(Reverse(raw)) => {
                let id = StringId::from_raw(raw);
                inner.entries[id.index()] = Entry::new(s.to_owned(), 1);
                id
            }
            None => {
                let id = StringId::from_raw(inner.entries.len() as u32);
                inner.entries.push(Entry::new(s.to_owned(), 1));
                id
            }
        };
        inner.string_to_id.insert(s.to_owned(), id);
        id
    }

    /// Create an additional reference to an already-live ID.
    #[inline]
    pub fn intern_id(&self, id: StringId) -> StringId {
        if !self.is_static(id) {
            // Only a read lock: the count is atomic.
            let inner = self.inner.read();
            debug_assert!(
                inner.entries[id.index()].refcount.load(Ordering::Relaxed) > 0,
                "intern_id on dead id {id:?}"
            );
            inner.entries[id.index()].refcount.fetch_add(1, Ordering::Relaxed);
        }
        id
    }

    /// Create one additional reference for every ID yielded, taking the read
    /// lock once.
    pub fn intern_ids(&self, ids: impl IntoIterator<Item = StringId>) {
        let inner = self.inner.read();
        for id in ids {
            if !self.is_static(id) {
                inner.entries[id.index()].refcount.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Release one reference to `id`. When the count reaches zero the entry
    /// is removed and the ID becomes reusable.
    ///
    /// Releasing a static ID is a no-op. Releasing a dead or never-interned
    /// ID is a defect.
    pub fn release(&self, id: StringId) {
        if self.is_static(id) {
            return;
        }

        {
            let inner = self.inner.read();
            let prev = inner.entries[id.index()].refcount.fetch_sub(1, Ordering::Relaxed);
            debug_assert!(prev >= 1, "refcount underflow on {id:?}");
            if prev > 1 {
                return;
            }

            // This thread is about to remove the entry but must upgrade to a
            // write lock first. Keep the ID alive across the upgrade window
            // by re-incrementing before the read lock is dropped; otherwise a
            // racing intern of the same string would observe a half-destroyed
            // entry.
            inner.entries[id.index()].refcount.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.inner.write();
        let prev = inner.entries[id.index()].refcount.fetch_sub(1, Ordering::Relaxed);
        if prev > 1 {
            // Someone re-interned while we waited for the write lock.
            return;
        }
        Self::remove_entry(&mut inner, id);
    }

    /// Release one reference for every ID yielded.
    ///
    /// Decrements run under a single read lock; the write lock is taken only
    /// when at least one count reached zero, with the same keep-alive dance
    /// as [`StringPool::release`].
    pub fn release_ids<I>(&self, ids: I)
    where
        I: IntoIterator<Item = StringId> + Clone,
    {
        let mut needs_removal = false;
        {
            let inner = self.inner.read();
            for id in ids.clone() {
                if self.is_static(id) {
                    continue;
                }
                let prev = inner.entries[id.index()].refcount.fetch_sub(1, Ordering::Relaxed);
                debug_assert!(prev >= 1, "refcount underflow on {id:?}");
                if prev <= 1 {
                    needs_removal = true;
                }
            }

            if !needs_removal {
                return;
            }

            // Put all counts back while waiting for the write lock.
            for id in ids.clone() {
                if !self.is_static(id) {
                    inner.entries[id.index()].refcount.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let mut inner = self.inner.write();
        for id in ids {
            if self.is_static(id) {
                continue;
            }
            let prev = inner.entries[id.index()].refcount.fetch_sub(1, Ordering::Relaxed);
            if prev <= 1 {
                Self::remove_entry(&mut inner, id);
            }
        }
    }

    fn remove_entry(inner: &mut PoolInner, id: StringId) {
        let text = std::mem::take(&mut inner.entries[id.index()].text);
        inner.string_to_id.remove(&text);
        inner.free_ids.push(Reverse(id.raw()));
    }

    /// Resolve `id` to its string.
    ///
    /// Returns an owned copy: the entry table may reallocate under a
    /// concurrent intern, so no reference into it can escape the lock.
    /// Resolving a released ID is a defect and yields the empty string.
    pub fn get(&self, id: StringId) -> String {
        let inner = self.inner.read();
        inner.entries[id.index()].text.clone()
    }

    /// Run `f` on the string for `id` without copying it out of the lock.
    pub fn with_str<R>(&self, id: StringId, f: impl FnOnce(&str) -> R) -> R {
        let inner = self.inner.read();
        f(&inner.entries[id.index()].text)
    }

    /// Look up the ID for `s` without creating a reference.
    ///
    /// Returns [`StringId::NOT_A_STRING`] when the string was never interned.
    pub fn get_id(&self, s: &str) -> StringId {
        if s.is_empty() {
            return StringId::EMPTY;
        }
        let inner = self.inner.read();
        inner.string_to_id.get(s).copied().unwrap_or(StringId::NOT_A_STRING)
    }

    /// Live-entry and reference counters, for diagnostics and leak tests.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.read();
        let dynamic_strings_in_use = inner
            .string_to_id
            .values()
            .filter(|id| !self.is_static(**id))
            .count();
        let dynamic_references_in_use = inner
            .entries
            .iter()
            .skip(self.num_static as usize)
            .map(|e| e.refcount.load(Ordering::Relaxed))
            .sum();
        PoolStats {
            strings_in_use: inner.string_to_id.len() + 1, // +1 for not-a-string
            dynamic_strings_in_use,
            dynamic_references_in_use,
        }
    }

    /// Visit every live entry as `(id, text, refcount)` in ID order.
    ///
    /// Static entries report a refcount of zero. Used by the wire format.
    pub(crate) fn for_each_entry(&self, mut f: impl FnMut(StringId, &str, i64)) {
        let inner = self.inner.read();
        for (index, entry) in inner.entries.iter().enumerate() {
            let id = StringId::from_raw(index as u32);
            f(id, &entry.text, entry.refcount.load(Ordering::Relaxed));
        }
    }

    /// Rebuild a pool from wire data: `(text, refcount)` in ID order.
    ///
    /// `num_static` marks the end of the static prefix; slots above it with a
    /// zero refcount are treated as freed and queued for reuse.
    pub(crate) fn from_entries(
        num_static: u32,
        entries_in: impl IntoIterator<Item = (String, i64)>,
    ) -> Self {
        let mut entries = Vec::new();
        let mut string_to_id = FxHashMap::default();
        let mut free_ids = BinaryHeap::new();

        for (index, (text, refcount)) in entries_in.into_iter().enumerate() {
            let id = StringId::from_raw(index as u32);
            let is_static = id.raw() < num_static;
            if !is_static && refcount <= 0 {
                free_ids.push(Reverse(id.raw()));
                entries.push(Entry::new(String::new(), 0));
                continue;
            }
            // ID 0 never participates in content lookup.
            if id != StringId::NOT_A_STRING {
                string_to_id.insert(text.clone(), id);
            }
            entries.push(Entry::new(text, if is_static { 0 } else { refcount }));
        }

        StringPool {
            inner: RwLock::new(PoolInner {
                string_to_id,
                entries,
                free_ids,
            }),
            num_static,
        }
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a [`StringPool`].
///
/// This newtype enforces that all cross-thread pool sharing goes through one
/// type instead of ad-hoc `Arc<StringPool>` plumbing.
#[derive(Clone)]
pub struct SharedPool(Arc<StringPool>);

impl SharedPool {
    /// Wrap a pool for sharing.
    pub fn new(pool: StringPool) -> Self {
        SharedPool(Arc::new(pool))
    }
}

impl Default for SharedPool {
    fn default() -> Self {
        SharedPool::new(StringPool::new())
    }
}

impl std::ops::Deref for SharedPool {
    type Target = StringPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn intern_and_get() {
        let pool = StringPool::new();
        let hello = pool.intern("hello");
        let world = pool.intern("world");
        assert_ne!(hello, world);
        assert_eq!(pool.get(hello), "hello");
        assert_eq!(pool.get(world), "world");
        assert_eq!(pool.intern("hello"), hello);
    }

    #[test]
    fn reserved_ids() {
        let pool = StringPool::new();
        assert_eq!(pool.intern(""), StringId::EMPTY);
        assert_eq!(pool.get(StringId::EMPTY), "");
        assert_eq!(pool.get(StringId::NOT_A_STRING), "");
        assert_eq!(pool.get_id("never-seen"), StringId::NOT_A_STRING);
        assert!(pool.is_static(StringId::EMPTY));
    }

    #[test]
    fn static_strings_are_not_refcounted() {
        let pool = StringPool::with_static_strings(["add", "subtract"]);
        let add = pool.get_id("add");
        assert!(pool.is_static(add));
        // Releasing more times than interned must be harmless for statics.
        pool.release(add);
        pool.release(add);
        assert_eq!(pool.get(add), "add");
    }

    #[test]
    fn release_to_zero_frees_and_reuses_id() {
        let pool = StringPool::new();
        let id = pool.intern("hello");
        pool.intern_id(id);
        pool.intern("hello");

        // Three references; after one release the string must survive.
        pool.release(id);
        assert_eq!(pool.get(id), "hello");

        pool.release(id);
        pool.release(id);
        assert_eq!(pool.get_id("hello"), StringId::NOT_A_STRING);

        // The freed ID is the smallest available and must be reused.
        let reused = pool.intern("world");
        assert_eq!(reused, id);
        assert_eq!(pool.get(reused), "world");
    }

    #[test]
    fn net_refcount_unchanged_by_intern_release_intern() {
        let pool = StringPool::new();
        let id = pool.intern("x");
        let before = pool.stats();

        let id2 = pool.intern("x");
        pool.release(id2);
        let again = pool.intern("x");
        pool.release(again);

        assert_eq!(id, id2);
        assert_eq!(pool.stats(), before);
        pool.release(id);
        assert_eq!(pool.stats().dynamic_strings_in_use, 0);
    }

    #[test]
    fn bulk_release_frees_only_last_references() {
        let pool = StringPool::new();
        let a = pool.intern("a");
        let b = pool.intern("b");
        pool.intern_id(a);

        pool.release_ids([a, b]);
        assert_eq!(pool.get(a), "a");
        assert_eq!(pool.get_id("b"), StringId::NOT_A_STRING);

        pool.release_ids([a]);
        assert_eq!(pool.get_id("a"), StringId::NOT_A_STRING);
        assert_eq!(pool.stats().dynamic_references_in_use, 0);
    }

    #[test]
    fn bulk_intern_ids() {
        let pool = StringPool::new();
        let a = pool.intern("a");
        pool.intern_ids([a, a]);
        pool.release(a);
        pool.release(a);
        assert_eq!(pool.get(a), "a");
        pool.release(a);
        assert_eq!(pool.get_id("a"), StringId::NOT_A_STRING);
    }

    #[test]
    fn shared_pool_clones_observe_each_other() {
        let pool = SharedPool::default();
        let other = pool.clone();
        let id = pool.intern("shared");
        assert_eq!(other.get(id), "shared");
        other.release(id);
        assert_eq!(pool.get_id("shared"), StringId::NOT_A_STRING);
    }

    #[test]
    fn concurrent_intern_release_churn() {
        use std::thread;

        let pool = SharedPool::default();
        let mut handles = Vec::new();
        for t in 0..4 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for i in 0..500 {
                    let s = format!("s{}", (t + i) % 7);
                    let id = pool.intern(&s);
                    pool.with_str(id, |text| assert_eq!(text, s));
                    pool.release(id);
                }
            }));
        }
        for h in handles {
            h.join().expect("worker panicked");
        }
        assert_eq!(pool.stats().dynamic_references_in_use, 0);
    }
}
