//! The pushbuffer: a word-granular ring of encoded commands.
//!
//! Cursors are monotonic word counters; the physical offset is
//! `counter & (capacity - 1)`. The producer owns `put`; `get` is a cached
//! copy of the engine's consumption cursor and only ever moves forward.
//! The non-overwrite invariant is `put - get <= capacity` at all times.

use strato_mem::{DmaBuf, GpuVa};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RingFull {
    /// Free space cannot cover the reservation right now.
    Full { need: u64, free: u64 },
}

/// Reservation/commit view of the command ring.
///
/// `reserve` never blocks — the flow layer loops it against refreshed `get`
/// values under the configured timeout. Writes outside an active
/// reservation, or commits that do not match the written count, are caller
/// bugs and fail fast.
#[derive(Debug)]
pub struct Pushbuffer {
    buf: DmaBuf,
    cap: u64,
    put: u64,
    get: u64,
    /// Words granted by the active reservation, if any.
    reserved: Option<u64>,
    /// Words written under the active reservation.
    written: u64,
}

impl Pushbuffer {
    /// `buf.len_words()` must be a power of two (validated by the channel
    /// config before construction).
    pub(crate) fn new(buf: DmaBuf) -> Self {
        let cap = buf.len_words() as u64;
        debug_assert!(cap.is_power_of_two());
        Self {
            buf,
            cap,
            put: 0,
            get: 0,
            reserved: None,
            written: 0,
        }
    }

    pub fn capacity_words(&self) -> u64 {
        self.cap
    }

    pub fn put_words(&self) -> u64 {
        self.put
    }

    pub fn get_words(&self) -> u64 {
        self.get
    }

    /// Unconsumed words currently in the ring.
    pub fn in_flight_words(&self) -> u64 {
        self.put - self.get
    }

    pub fn free_words(&self) -> u64 {
        self.cap - self.in_flight_words()
    }

    /// Physical word offset of `put`.
    pub(crate) fn offset(&self) -> u64 {
        self.put & (self.cap - 1)
    }

    /// Words left before the physical end of the ring.
    pub(crate) fn words_to_boundary(&self) -> u64 {
        self.cap - self.offset()
    }

    /// GPU virtual address of the word at monotonic counter `at`.
    pub(crate) fn gpu_va_at(&self, at: u64) -> GpuVa {
        self.buf.gpu_va_of((at & (self.cap - 1)) as usize)
    }

    /// Read back `len` words starting at monotonic counter `at` (span must
    /// not cross the boundary; spans never do by construction).
    pub(crate) fn read_back(&self, at: u64, len: u64) -> Vec<u32> {
        let mut out = vec![0u32; len as usize];
        self.buf.read_span((at & (self.cap - 1)) as usize, &mut out);
        out
    }

    /// Fold a fresh engine-side `get` into the cache. The cursor is
    /// monotonic; a stale read never moves it backwards.
    pub(crate) fn update_get(&mut self, get: u64) {
        debug_assert!(get <= self.put);
        if get > self.get {
            self.get = get;
        }
    }

    /// Claim room for `n` words. Does not block; the caller refreshes `get`
    /// and retries on `RingFull`.
    pub(crate) fn reserve(&mut self, n: u64) -> Result<(), RingFull> {
        debug_assert!(self.reserved.is_none(), "reserve while reservation open");
        debug_assert!(n <= self.cap);
        let free = self.free_words();
        if n > free {
            return Err(RingFull::Full { need: n, free });
        }
        self.reserved = Some(n);
        self.written = 0;
        Ok(())
    }

    /// Append words within the active reservation.
    ///
    /// Panics if there is no reservation or the reservation is exceeded;
    /// both are producer bugs, not runtime conditions.
    pub(crate) fn write(&mut self, words: &[u32]) {
        let reserved = self.reserved.expect("write without reserve");
        assert!(
            self.written + words.len() as u64 <= reserved,
            "write exceeds reservation"
        );
        let mut at = self.put + self.written;
        for w in words {
            self.buf.write_word((at & (self.cap - 1)) as usize, *w);
            at += 1;
        }
        self.written += words.len() as u64;
    }

    /// Commit the written words, advancing `put`. The reservation must be
    /// fully used: a reserve without a matching commit is a caller bug.
    pub(crate) fn commit(&mut self) -> u64 {
        let reserved = self.reserved.take().expect("commit without reserve");
        assert_eq!(self.written, reserved, "commit does not match reservation");
        self.put += reserved;
        debug_assert!(self.in_flight_words() <= self.cap);
        self.put
    }

    /// Reset cursors to an authoritative snapshot after fault recovery.
    pub(crate) fn reset_to(&mut self, get_words: u64) {
        self.reserved = None;
        self.written = 0;
        self.put = get_words;
        self.get = get_words;
    }
}
