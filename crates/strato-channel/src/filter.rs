//! Submit filters: an ordered middleware chain over the write/flush path.
//!
//! Filters are composed at construction and observe the same interface the
//! caller uses — a span about to close, an entry staged, cursors published.
//! A filter may contribute a trailer command to the closing span; the flow
//! layer appends it when it fits without crossing the wrap boundary
//! (wrap-forced closes go out untrailed).

use tracing::debug;

use strato_mem::GpuVa;
use strato_protocol::{MethodHeader, MethodMode, CRC_CHECK};

/// Read-only view of a span as it closes: the encoded words and where they
/// will sit in the engine's address space.
#[derive(Debug)]
pub struct SpanView<'a> {
    pub base: GpuVa,
    pub words: &'a [u32],
    pub subroutine: bool,
}

pub trait SubmitFilter: Send {
    /// Commands to append to the closing span (already-encoded words).
    fn span_trailer(&mut self, _span: &SpanView<'_>) -> Option<Vec<u32>> {
        None
    }

    /// A span entry was staged into the GPFIFO.
    fn entry_staged(&mut self, _span: &SpanView<'_>) {}

    /// Cursors were published (one call per effective flush).
    fn flushed(&mut self, _gp_put: u32) {}
}

/// CRC-32 (IEEE, reflected) over little-endian word bytes.
pub fn crc32(words: &[u32]) -> u32 {
    let mut crc = !0u32;
    for w in words {
        for byte in w.to_le_bytes() {
            crc ^= u32::from(byte);
            for _ in 0..8 {
                let mask = (crc & 1).wrapping_neg();
                crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
            }
        }
    }
    !crc
}

/// Appends a `CRC_CHECK` trailer to every span so the engine can verify the
/// fetched words match what the producer encoded. Requires the generation's
/// CRC capability (enforced at channel construction).
#[derive(Debug, Default)]
pub struct CrcFilter;

impl SubmitFilter for CrcFilter {
    fn span_trailer(&mut self, span: &SpanView<'_>) -> Option<Vec<u32>> {
        let hdr = MethodHeader::new(
            MethodMode::Increment,
            0,
            u32::from(CRC_CHECK),
            1,
        )
        .expect("CRC_CHECK header is statically valid");
        Some(vec![hdr.encode(), crc32(span.words)])
    }
}

/// Structured submission tracing.
#[derive(Debug, Default)]
pub struct TraceFilter {
    entries: u64,
    flushes: u64,
}

impl SubmitFilter for TraceFilter {
    fn entry_staged(&mut self, span: &SpanView<'_>) {
        self.entries += 1;
        debug!(
            base = span.base,
            len_words = span.words.len(),
            subroutine = span.subroutine,
            seq = self.entries,
            "entry staged"
        );
    }

    fn flushed(&mut self, gp_put: u32) {
        self.flushes += 1;
        debug!(gp_put, seq = self.flushes, "cursors published");
    }
}
