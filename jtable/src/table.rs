//! Integer hash map with collision chains threaded through the bucket array

extern crate alloc as crate_alloc;

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use crate_alloc::alloc;

/// Occupancy and chain role of a bucket. `Empty` is the zero tag so a zeroed
/// allocation is a valid table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Ctrl {
    /// Free slot, every other field is meaningless.
    Empty = 0,
    /// The entry's key hashes to this very slot.
    Snug = 1,
    /// The entry's key hashes elsewhere and an earlier chain link precedes it.
    Displaced = 2,
    /// First link of a chain whose home slot is held by a foreign entry.
    DisplacedHead = 3,
}

/// `prev`, `next` and `chain_start` are forward offsets measured mod `cap`;
/// 0 means "none". `prev` is subtracted to step back, the other two are
/// added.
#[derive(Clone, Copy)]
#[repr(C)]
struct Bucket {
    ctrl: Ctrl,
    prev: u16,
    next: u16,
    chain_start: u16,
    key: isize,
    val: isize,
}

fn step_fwd(i: usize, offset: u16, cap: usize) -> usize {
    (i + offset as usize) % cap
}

fn step_bwd(i: usize, offset: u16, cap: usize) -> usize {
    let offset = offset as usize % cap;
    if i >= offset {
        i - offset
    } else {
        i + cap - offset
    }
}

fn fwd_delta(i: usize, j: usize, cap: usize) -> u16 {
    let d = if j < i { cap - i + j } else { j - i };
    d as u16
}

/// Hash table from pointer-width integers to pointer-width integers.
///
/// Collision chains are doubly linked lists threaded through the bucket
/// array itself as small forward offsets, so every entry lives in one flat
/// allocation and a chain walk never leaves it. Hashing is the identity on
/// the key's bit pattern; callers whose keys cluster in the low bits must
/// mix them before inserting.
pub struct JTable {
    buf: NonNull<Bucket>,
    cap: usize,
    len: usize,
}

impl Drop for JTable {
    fn drop(&mut self) {
        if self.cap == 0 {
            return;
        }

        // Buckets are plain data, nothing to drop per entry.
        let layout = Self::layout(self.cap);
        unsafe { alloc::dealloc(self.buf.as_ptr().cast::<u8>(), layout) }
    }
}

impl Clone for JTable {
    fn clone(&self) -> Self {
        if self.cap == 0 {
            return Self::new();
        }

        let mut new = Self::with_capacity(self.cap);
        for i in 0..self.cap {
            let b = *self.bucket(i);
            if b.ctrl != Ctrl::Empty {
                new.insert(b.key, b.val);
            }
        }

        new
    }
}

impl fmt::Debug for JTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JTable")
            .field("buckets", &DebugBuckets { table: self })
            .field("cap", &self.cap)
            .field("len", &self.len)
            .finish()
    }
}

struct DebugBuckets<'a> {
    table: &'a JTable,
}

impl fmt::Debug for DebugBuckets<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();

        for i in 0..self.table.cap {
            list.entry(self.table.bucket(i));
        }

        list.finish()
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.ctrl {
            Ctrl::Empty => return f.write_str("e[]"),
            Ctrl::Snug => 's',
            Ctrl::Displaced => 'd',
            Ctrl::DisplacedHead => 'h',
        };
        write!(
            f,
            "{}[{}: {}] {} <-> {} => {}",
            tag, self.key, self.val, self.prev, self.next, self.chain_start
        )
    }
}

impl JTable {
    const INITIAL_CAP: usize = 32;
    /// Offsets are 16-bit and taken mod `cap`, so the bucket array must not
    /// outgrow 2^16 slots. Every capacity is a power of two, which also
    /// makes the `u16` wrap-around on combined offsets exact arithmetic
    /// mod `cap`.
    const MAX_CAP: usize = 1 << 16;

    pub fn new() -> Self {
        Self {
            buf: NonNull::dangling(),
            cap: 0,
            len: 0,
        }
    }

    /// # PANICS
    ///
    /// * if `cap` is not a power of two or exceeds `MAX_CAP`
    pub fn with_capacity(cap: usize) -> Self {
        assert!(cap.is_power_of_two());
        assert!(cap <= Self::MAX_CAP);
        Self {
            buf: Self::alloc_zeroed_buf(cap),
            cap,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    fn layout(cap: usize) -> Layout {
        Layout::array::<Bucket>(cap).unwrap()
    }

    /// # ABORTS
    ///
    /// * if allocation fails
    fn alloc_zeroed_buf(cap: usize) -> NonNull<Bucket> {
        let layout = Self::layout(cap);
        let buf = unsafe { alloc::alloc_zeroed(layout) };
        if buf.is_null() {
            alloc::handle_alloc_error(layout);
        }
        // SAFETY: just checked for null; zeroed bytes are a valid all-`Empty`
        // bucket array since `Empty` is the zero tag and the rest is plain
        // data.
        unsafe { NonNull::new_unchecked(buf.cast::<Bucket>()) }
    }

    fn bucket(&self, i: usize) -> &Bucket {
        debug_assert!(i < self.cap);
        unsafe { &*self.buf.as_ptr().add(i) }
    }

    fn bucket_mut(&mut self, i: usize) -> &mut Bucket {
        debug_assert!(i < self.cap);
        unsafe { &mut *self.buf.as_ptr().add(i) }
    }

    fn home_index(&self, key: isize) -> usize {
        key as usize % self.cap
    }

    fn lprobe_until_empty(&self, mut i: usize) -> usize {
        loop {
            i = (i + 1) % self.cap;
            if self.bucket(i).ctrl == Ctrl::Empty {
                return i;
            }
        }
    }

    // Triangular steps visit every residue when cap is a power of two, and
    // the load factor guarantees an empty slot.
    fn qprobe_until_empty(&self, mut i: usize) -> usize {
        let mut step = 1;
        loop {
            i = (i + step) % self.cap;
            step += 1;
            if self.bucket(i).ctrl == Ctrl::Empty {
                return i;
            }
        }
    }

    /// Walk the chain rooted at the home slot `i` looking for `key`. Returns
    /// the index of the matching bucket, or of the chain's tail if no link
    /// matches. The home slot must not be empty.
    fn follow_chain(&self, key: isize, i: usize) -> usize {
        let mut i = step_fwd(i, self.bucket(i).chain_start, self.cap);
        loop {
            let b = self.bucket(i);
            if b.key == key {
                return i;
            }
            if b.next == 0 {
                return i;
            }
            i = step_fwd(i, b.next, self.cap);
        }
    }

    /// Stores `key -> val`, overwriting the value if the key is already
    /// present.
    ///
    /// # PANICS
    ///
    /// * if the table would have to grow past `MAX_CAP` buckets
    pub fn insert(&mut self, key: isize, val: isize) {
        if self.len >= 3 * self.cap / 4 {
            self.grow();
        }

        debug_assert!(self.len < self.cap);
        let home = self.home_index(key);
        if self.bucket(home).ctrl == Ctrl::Empty {
            *self.bucket_mut(home) = Bucket {
                ctrl: Ctrl::Snug,
                prev: 0,
                next: 0,
                chain_start: 0,
                key,
                val,
            };
            self.len += 1;
            return;
        }

        let home_bucket = *self.bucket(home);
        if home_bucket.ctrl != Ctrl::Snug && home_bucket.chain_start == 0 {
            // The home slot is held by a foreign chain and no chain exists
            // for this hash yet. Start one at the quadratic probe target.
            let head = self.qprobe_until_empty(home);
            self.bucket_mut(home).chain_start = fwd_delta(home, head, self.cap);
            *self.bucket_mut(head) = Bucket {
                ctrl: Ctrl::DisplacedHead,
                prev: 0,
                next: 0,
                chain_start: 0,
                key,
                val,
            };
            self.len += 1;
            return;
        }

        let tail = self.follow_chain(key, home);
        if self.bucket(tail).key == key {
            self.bucket_mut(tail).val = val;
            return;
        }

        // Reached the end of the chain without a match; probe for a new
        // slot and link it in.
        let slot = self.lprobe_until_empty(tail);
        let d = fwd_delta(tail, slot, self.cap);
        self.bucket_mut(tail).next = d;
        *self.bucket_mut(slot) = Bucket {
            ctrl: Ctrl::Displaced,
            prev: d,
            next: 0,
            chain_start: 0,
            key,
            val,
        };
        self.len += 1;
    }

    fn lookup_index(&self, key: isize) -> Option<usize> {
        let home = self.home_index(key);
        if self.bucket(home).ctrl == Ctrl::Empty {
            return None;
        }
        let i = self.follow_chain(key, home);
        if self.bucket(i).key == key {
            Some(i)
        } else {
            None
        }
    }

    pub fn lookup(&self, key: isize) -> Option<&isize> {
        if self.cap == 0 {
            return None;
        }
        let i = self.lookup_index(key)?;
        Some(&self.bucket(i).val)
    }

    /// Like [`lookup`](Self::lookup) but the value may be updated in place.
    pub fn lookup_mut(&mut self, key: isize) -> Option<&mut isize> {
        if self.cap == 0 {
            return None;
        }
        let i = self.lookup_index(key)?;
        Some(&mut self.bucket_mut(i).val)
    }

    /// Removes `key` if present; removing an absent key is a no-op.
    pub fn remove(&mut self, key: isize) {
        if self.cap == 0 {
            return;
        }

        let home = self.home_index(key);
        if self.bucket(home).ctrl == Ctrl::Empty {
            return;
        }

        let rmvi = self.follow_chain(key, home);
        let rmvb = *self.bucket(rmvi);
        if rmvb.key != key {
            return;
        }

        if rmvb.ctrl == Ctrl::Snug {
            if rmvb.next == 0 {
                self.bucket_mut(rmvi).ctrl = Ctrl::Empty;
                self.len -= 1;
                return;
            }
            // Pull the second link over the head so the home slot stays
            // occupied, then rebase the third link's back pointer onto the
            // combined offset.
            let j = step_fwd(rmvi, rmvb.next, self.cap);
            let nextb = *self.bucket(j);
            self.bucket_mut(j).ctrl = Ctrl::Empty;
            let combined = if nextb.next != 0 {
                rmvb.next.wrapping_add(nextb.next)
            } else {
                0
            };
            let r = self.bucket_mut(rmvi);
            r.next = combined;
            r.key = nextb.key;
            r.val = nextb.val;
            r.prev = 0;
            if nextb.next != 0 {
                let nn = step_fwd(j, nextb.next, self.cap);
                self.bucket_mut(nn).prev = combined;
            }
            self.replace_with_chain_start(j);
            self.len -= 1;
            return;
        }

        // A displaced link: splice prev and next around it.
        self.bucket_mut(rmvi).ctrl = Ctrl::Empty;
        if rmvb.prev != 0 {
            let j = step_bwd(rmvi, rmvb.prev, self.cap);
            let prevb = self.bucket_mut(j);
            prevb.next = if rmvb.next != 0 {
                prevb.next.wrapping_add(rmvb.next)
            } else {
                0
            };
        }
        if rmvb.next != 0 {
            let j = step_fwd(rmvi, rmvb.next, self.cap);
            let nextb = self.bucket_mut(j);
            nextb.prev = if rmvb.prev != 0 {
                nextb.prev.wrapping_add(rmvb.prev)
            } else {
                0
            };
        }
        self.replace_with_chain_start(rmvi);
        // The home's chain may have started at the removed bucket; shift the
        // head pointer to the next link. The cascade can have rewritten the
        // home bucket by now, so reread it.
        let chain_start = self.bucket(home).chain_start;
        if step_fwd(home, chain_start, self.cap) == rmvi {
            self.bucket_mut(home).chain_start = if rmvb.next != 0 {
                chain_start.wrapping_add(rmvb.next)
            } else {
                0
            };
        }
        self.len -= 1;
    }

    /// A slot that just went empty may be the recorded hash-home of a
    /// foreign chain. Pull that chain's head into the slot so no
    /// `chain_start` is left referring to an empty bucket, and repeat for
    /// the slot the head vacated.
    fn replace_with_chain_start(&mut self, i: usize) {
        let chain_start = self.bucket(i).chain_start;
        if chain_start == 0 {
            return;
        }
        let j = step_fwd(i, chain_start, self.cap);
        let headb = *self.bucket(j);
        self.bucket_mut(j).ctrl = Ctrl::Empty;
        let combined = if headb.next != 0 {
            headb.next.wrapping_add(chain_start)
        } else {
            0
        };
        let b = self.bucket_mut(i);
        b.ctrl = Ctrl::Snug;
        b.next = combined;
        b.chain_start = 0;
        b.prev = 0;
        b.key = headb.key;
        b.val = headb.val;
        if headb.next != 0 {
            let nn = step_fwd(i, combined, self.cap);
            self.bucket_mut(nn).prev = combined;
        }
        if headb.chain_start != 0 {
            self.replace_with_chain_start(j);
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.cap == 0 {
            Self::INITIAL_CAP
        } else {
            (self.cap * 4).min(Self::MAX_CAP)
        };
        assert!(
            new_cap > self.cap,
            "jtable cannot grow past {} buckets",
            Self::MAX_CAP
        );

        let mut new = Self::with_capacity(new_cap);
        for i in 0..self.cap {
            let b = *self.bucket(i);
            if b.ctrl != Ctrl::Empty {
                new.insert(b.key, b.val);
            }
        }

        // old buffer is freed here
        *self = new;
    }
}
