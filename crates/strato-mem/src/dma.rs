use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// GPU virtual address. CPU-side indices and GPU-side addresses of the same
/// buffer differ; the engine only ever sees `GpuVa` values.
pub type GpuVa = u64;

/// A word-addressable buffer shared between the CPU producer and the engine.
///
/// Cloning is cheap and yields another handle onto the same storage, so the
/// producer and an engine model on another thread can hold the buffer at the
/// same time. Word reads/writes are individually atomic; multi-word spans are
/// *not* a single atomic unit — the submission protocol (cursors published
/// after contents) is what makes spans safe to consume.
#[derive(Clone, Debug)]
pub struct DmaBuf {
    words: Arc<[AtomicU32]>,
    gpu_va: GpuVa,
}

impl DmaBuf {
    /// Allocate a zeroed buffer of `len_words` words mapped at `gpu_va`.
    ///
    /// `gpu_va` must be 4-aligned; in a real system it comes from the device
    /// address-space allocator.
    pub fn new(len_words: usize, gpu_va: GpuVa) -> Self {
        assert!(len_words > 0);
        assert_eq!(gpu_va & 3, 0, "gpu_va must be word aligned");
        let words: Arc<[AtomicU32]> = (0..len_words).map(|_| AtomicU32::new(0)).collect();
        Self { words, gpu_va }
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    /// Base GPU virtual address of word 0.
    pub fn gpu_va(&self) -> GpuVa {
        self.gpu_va
    }

    /// GPU virtual address of `word_index`.
    pub fn gpu_va_of(&self, word_index: usize) -> GpuVa {
        debug_assert!(word_index <= self.words.len());
        self.gpu_va + (word_index as u64) * 4
    }

    /// Map a GPU virtual address back to a word index, if it falls inside
    /// this buffer. Misaligned addresses never match.
    pub fn word_index_of(&self, va: GpuVa) -> Option<usize> {
        if va & 3 != 0 || va < self.gpu_va {
            return None;
        }
        let idx = ((va - self.gpu_va) / 4) as usize;
        (idx < self.words.len()).then_some(idx)
    }

    pub fn read_word(&self, word_index: usize) -> u32 {
        self.words[word_index].load(Ordering::Acquire)
    }

    pub fn write_word(&self, word_index: usize, value: u32) {
        self.words[word_index].store(value, Ordering::Release);
    }

    /// Read `out.len()` consecutive words starting at `word_index`.
    pub fn read_span(&self, word_index: usize, out: &mut [u32]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read_word(word_index + i);
        }
    }

    /// Write consecutive words starting at `word_index`.
    pub fn write_span(&self, word_index: usize, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            self.write_word(word_index + i, *w);
        }
    }

    /// True if both handles refer to the same storage.
    pub fn same_buffer(&self, other: &DmaBuf) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_storage() {
        let a = DmaBuf::new(16, 0x1000);
        let b = a.clone();
        a.write_word(3, 0xDEAD_BEEF);
        assert_eq!(b.read_word(3), 0xDEAD_BEEF);
        assert!(a.same_buffer(&b));
    }

    #[test]
    fn va_round_trip() {
        let buf = DmaBuf::new(8, 0x2_0000);
        assert_eq!(buf.gpu_va_of(0), 0x2_0000);
        assert_eq!(buf.gpu_va_of(5), 0x2_0014);
        assert_eq!(buf.word_index_of(0x2_0014), Some(5));
        assert_eq!(buf.word_index_of(0x2_0015), None, "misaligned");
        assert_eq!(buf.word_index_of(0x1_FFFC), None, "below base");
        assert_eq!(buf.word_index_of(0x2_0020), None, "past end");
    }

    #[test]
    fn span_round_trip() {
        let buf = DmaBuf::new(8, 0x1000);
        buf.write_span(2, &[1, 2, 3]);
        let mut out = [0u32; 3];
        buf.read_span(2, &mut out);
        assert_eq!(out, [1, 2, 3]);
    }
}
