//! Flow control: wrap handling, room blocking, entry close and publish.
//!
//! This layer owns both rings and the open-span bookkeeping. The rules it
//! enforces:
//!
//! - a command (header + payload) never straddles the physical end of the
//!   pushbuffer; the remainder is padded and the span closed at the boundary,
//!   so every entry references a physically-contiguous span;
//! - every written word — padding included — is referenced by exactly one
//!   entry, which keeps consumed-word accounting exact;
//! - blocking for room first publishes staged entries (otherwise the engine
//!   could never drain what we are waiting on) and is bounded by the
//!   configured timeout.

use std::time::Duration;

use tracing::{debug, trace};

use strato_protocol::{GenCaps, GpEntry, PAD_WORD};

use crate::engine::{CursorSnapshot, EngineBus};
use crate::error::ChannelError;
use crate::filter::{SpanView, SubmitFilter};
use crate::gpfifo::GpFifo;
use crate::pushbuf::Pushbuffer;
use crate::wait::poll_until;

const EXT_BASE_MASK: u64 = 0xFFFF_FF00_0000_0000;

pub(crate) struct Flow {
    pub(crate) pb: Pushbuffer,
    pub(crate) gp: GpFifo,
    caps: GenCaps,
    subdev_mask: u32,
    doorbell_token: u32,
    /// `put` counter where the open span began.
    entry_start: u64,
    /// Words covered by published entries; what `wait_for_dma_push` drains.
    published_words: u64,
    /// Sticky extended base last programmed via a side-band entry.
    ext_base: u64,
}

type Filters = [Box<dyn SubmitFilter>];

impl Flow {
    pub(crate) fn new(
        pb: Pushbuffer,
        gp: GpFifo,
        caps: GenCaps,
        subdev_mask: u32,
        doorbell_token: u32,
    ) -> Self {
        Self {
            pb,
            gp,
            caps,
            subdev_mask,
            doorbell_token,
            entry_start: 0,
            published_words: 0,
            ext_base: 0,
        }
    }

    /// Words in the open (unclosed) span.
    pub(crate) fn open_span_words(&self) -> u64 {
        self.pb.put_words() - self.entry_start
    }

    pub(crate) fn refresh_cursors(&mut self, engine: &dyn EngineBus) {
        // Multi-unit devices drain independently; the usable cursor is the
        // slowest subunit's.
        let mut get = u64::MAX;
        for su in 0..engine.subunits() {
            get = get.min(engine.pb_get_words(su));
        }
        self.pb.update_get(get.min(self.pb.put_words()));
        self.gp.update_gp_get(engine.gp_get());
    }

    /// Both rings drained to the last publish.
    pub(crate) fn drained(&self) -> bool {
        self.pb.get_words() >= self.published_words
            && self.gp.gp_get() == self.gp.published_gp_put()
    }

    /// Publish `gp_put` (and ring the doorbell on doorbell generations).
    /// Idempotent: returns false without touching hardware when nothing new
    /// was staged.
    pub(crate) fn publish(&mut self, engine: &dyn EngineBus, filters: &mut Filters) -> bool {
        if !self.gp.mark_published() {
            return false;
        }
        self.published_words = self.entry_start;
        let gp_put = self.gp.gp_put();
        engine.publish_gp_put(gp_put);
        if self.caps.doorbell {
            engine.ring_doorbell(self.doorbell_token);
        }
        for f in filters.iter_mut() {
            f.flushed(gp_put);
        }
        debug!(gp_put, doorbell = self.caps.doorbell, "published cursors");
        true
    }

    /// Make room for a contiguous `n_words` command, padding and closing at
    /// the wrap boundary as needed, then open a reservation for it.
    pub(crate) fn reserve_command(
        &mut self,
        engine: &dyn EngineBus,
        timeout: Duration,
        filters: &mut Filters,
        n_words: u64,
    ) -> Result<(), ChannelError> {
        debug_assert!(n_words > 0 && n_words * 2 <= self.pb.capacity_words());
        loop {
            // Close early rather than let a span outgrow the entry length
            // field.
            if self.open_span_words() + n_words > u64::from(GpEntry::MAX_LEN_WORDS) {
                self.close_entry(engine, timeout, filters, false, false)?;
            }

            let to_boundary = self.pb.words_to_boundary();
            if n_words <= to_boundary {
                self.block_for_pb_space(engine, timeout, filters, n_words)?;
                self.pb
                    .reserve(n_words)
                    .expect("space was just blocked for");
                return Ok(());
            }

            // The command would straddle the wrap: pad out the line, close
            // the span at the physical end and restart at offset zero.
            trace!(n_words, to_boundary, "padding to wrap boundary");
            self.block_for_pb_space(engine, timeout, filters, to_boundary)?;
            self.pb
                .reserve(to_boundary)
                .expect("space was just blocked for");
            for _ in 0..to_boundary {
                self.pb.write(&[PAD_WORD]);
            }
            self.pb.commit();
            self.close_entry(engine, timeout, filters, false, false)?;
        }
    }

    fn block_for_pb_space(
        &mut self,
        engine: &dyn EngineBus,
        timeout: Duration,
        filters: &mut Filters,
        need: u64,
    ) -> Result<(), ChannelError> {
        if self.pb.free_words() >= need {
            return Ok(());
        }
        // The engine can only drain published work.
        self.publish(engine, filters);
        let pb = &mut self.pb;
        let gp = &mut self.gp;
        poll_until(timeout, || {
            let mut get = u64::MAX;
            for su in 0..engine.subunits() {
                get = get.min(engine.pb_get_words(su));
            }
            pb.update_get(get.min(pb.put_words()));
            gp.update_gp_get(engine.gp_get());
            pb.free_words() >= need
        })
        .map_err(|()| ChannelError::Timeout {
            what: "pushbuffer space",
            timeout,
        })
    }

    /// Close the open span into one entry (possibly preceded by an
    /// extended-base side-band entry). `trailed` lets filters append their
    /// span trailers; wrap-forced closes pass false so a trailer can never
    /// recurse into another wrap.
    pub(crate) fn close_entry(
        &mut self,
        engine: &dyn EngineBus,
        timeout: Duration,
        filters: &mut Filters,
        subroutine: bool,
        trailed: bool,
    ) -> Result<bool, ChannelError> {
        if self.open_span_words() == 0 {
            return Ok(false);
        }

        if trailed {
            self.append_trailers(engine, timeout, filters)?;
        }

        let len = self.open_span_words();
        let base = self.pb.gpu_va_at(self.entry_start);

        if self.caps.extended_base && (base & EXT_BASE_MASK) != self.ext_base {
            self.push_entry_blocking(
                engine,
                timeout,
                filters,
                GpEntry::encode_extended_base(base),
            )?;
            self.ext_base = base & EXT_BASE_MASK;
        }

        let raw = GpEntry::encode_span(&self.caps, base, len as u32, subroutine, self.subdev_mask)?;
        self.push_entry_blocking(engine, timeout, filters, raw)?;

        let words = self.pb.read_back(self.entry_start, len);
        let view = SpanView {
            base,
            words: &words,
            subroutine,
        };
        for f in filters.iter_mut() {
            f.entry_staged(&view);
        }

        trace!(base, len, subroutine, "span closed");
        self.entry_start = self.pb.put_words();
        Ok(true)
    }

    /// Stage an entry calling a separately-addressed command block. No open
    /// span is involved; the current span stays open around the call.
    pub(crate) fn push_external_entry(
        &mut self,
        engine: &dyn EngineBus,
        timeout: Duration,
        filters: &mut Filters,
        base: u64,
        len_words: u32,
    ) -> Result<(), ChannelError> {
        if self.caps.extended_base && (base & EXT_BASE_MASK) != self.ext_base {
            self.push_entry_blocking(
                engine,
                timeout,
                filters,
                GpEntry::encode_extended_base(base),
            )?;
            self.ext_base = base & EXT_BASE_MASK;
        }
        let raw = GpEntry::encode_span(&self.caps, base, len_words, true, self.subdev_mask)?;
        self.push_entry_blocking(engine, timeout, filters, raw)
    }

    fn append_trailers(
        &mut self,
        engine: &dyn EngineBus,
        timeout: Duration,
        filters: &mut Filters,
    ) -> Result<(), ChannelError> {
        let words = self.pb.read_back(self.entry_start, self.open_span_words());
        let base = self.pb.gpu_va_at(self.entry_start);
        let view = SpanView {
            base,
            words: &words,
            subroutine: false,
        };
        let mut trailer = Vec::new();
        for f in filters.iter_mut() {
            if let Some(mut t) = f.span_trailer(&view) {
                trailer.append(&mut t);
            }
        }
        if trailer.is_empty() {
            return Ok(());
        }
        // A trailer only goes out when it fits before the wrap and inside
        // the entry length field; a span closing at either limit ships
        // untrailed.
        if trailer.len() as u64 > self.pb.words_to_boundary()
            || self.open_span_words() + trailer.len() as u64 > u64::from(GpEntry::MAX_LEN_WORDS)
        {
            debug!(len = trailer.len(), "span trailer dropped at span limit");
            return Ok(());
        }
        self.block_for_pb_space(engine, timeout, filters, trailer.len() as u64)?;
        self.pb
            .reserve(trailer.len() as u64)
            .expect("space was just blocked for");
        self.pb.write(&trailer);
        self.pb.commit();
        Ok(())
    }

    fn push_entry_blocking(
        &mut self,
        engine: &dyn EngineBus,
        timeout: Duration,
        filters: &mut Filters,
        raw: strato_protocol::RawEntry,
    ) -> Result<(), ChannelError> {
        if self.gp.push(raw).is_ok() {
            return Ok(());
        }
        // Ring is full of published-or-staged entries; publish so the
        // engine can retire them, then wait for room.
        self.publish(engine, filters);
        let gp = &mut self.gp;
        poll_until(timeout, || {
            gp.update_gp_get(engine.gp_get());
            gp.free_entries() > 0
        })
        .map_err(|()| ChannelError::Timeout {
            what: "entry ring room",
            timeout,
        })?;
        self.gp.push(raw).expect("room was just blocked for");
        Ok(())
    }

    /// Reset all cursors to the authoritative post-fault snapshot.
    pub(crate) fn reset_to(&mut self, snap: CursorSnapshot) {
        self.pb.reset_to(snap.pb_get_words);
        self.gp.reset_to(snap.gp_get);
        self.entry_start = snap.pb_get_words;
        self.published_words = snap.pb_get_words;
        self.ext_base = 0;
    }
}
