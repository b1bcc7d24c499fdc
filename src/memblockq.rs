//! The per-stream queue: a FIFO of chunks with prebuffer, target-fill, and
//! minimum-request semantics.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::memblock::{McAlign, MemblockStat, Memchunk};

/// A FIFO of [`Memchunk`]s with the fill policy that drives playback
/// streams.
///
/// All metrics are byte counts and multiples of `base`, the frame size.
/// `prebuf` exists in two forms: the configured value, and a transient
/// value that is zeroed by the first successful [`Memblockq::peek`] so that
/// a stream which has started flowing is not throttled again until
/// [`Memblockq::prebuf_reenable`].
pub struct Memblockq {
    chunks: VecDeque<Memchunk>,
    current_length: usize,
    maxlength: usize,
    tlength: usize,
    base: usize,
    prebuf: usize,
    orig_prebuf: usize,
    minreq: usize,
    mcalign: Option<McAlign>,
    stat: Option<MemblockStat>,
}

impl Memblockq {
    /// Creates a queue, sanitizing the metrics:
    ///
    /// - `maxlength` is rounded up to `base`.
    /// - `tlength` is rounded up to `base`; zero or out-of-range means
    ///   `maxlength`.
    /// - `prebuf` of `None` defaults to `maxlength / 2`; it is rounded down
    ///   to `base` and clamped to `maxlength`.
    /// - `minreq` is rounded down to `base`, with a floor of 1.
    pub fn new(
        maxlength: usize,
        tlength: usize,
        base: usize,
        prebuf: Option<usize>,
        minreq: usize,
        stat: Option<&MemblockStat>,
    ) -> Memblockq {
        assert!(base > 0 && maxlength > 0);

        let maxlength = maxlength.div_ceil(base) * base;
        assert!(maxlength >= base);

        let mut tlength = tlength.div_ceil(base) * base;
        if tlength == 0 || tlength >= maxlength {
            tlength = maxlength;
        }

        let mut prebuf = prebuf.unwrap_or(maxlength / 2);
        prebuf = (prebuf / base) * base;
        if prebuf > maxlength {
            prebuf = maxlength;
        }

        let mut minreq = (minreq / base) * base;
        if minreq == 0 {
            minreq = 1;
        }

        log::debug!(
            "memblockq sanitized: maxlength={}, tlength={}, base={}, prebuf={}, minreq={}",
            maxlength,
            tlength,
            base,
            prebuf,
            minreq
        );

        Memblockq {
            chunks: VecDeque::new(),
            current_length: 0,
            maxlength,
            tlength,
            base,
            prebuf,
            orig_prebuf: prebuf,
            minreq,
            mcalign: None,
            stat: stat.cloned(),
        }
    }

    /// Appends a chunk. If `seek` is nonzero, the write pointer is first
    /// moved back by that many bytes (see [`Memblockq::seek`]).
    ///
    /// The chunk's length must be a multiple of `base`. If the new chunk
    /// continues the tail chunk inside the same block, the two are merged.
    /// Data exceeding `maxlength` is dropped from the head.
    pub fn push(&mut self, chunk: Memchunk, seek: usize) {
        assert!(chunk.length > 0 && chunk.length % self.base == 0);

        self.seek(seek);

        if let Some(tail) = self.chunks.back_mut() {
            // Try to merge memory chunks
            if Rc::ptr_eq(&tail.memblock, &chunk.memblock)
                && tail.index + tail.length == chunk.index
            {
                tail.length += chunk.length;
                self.current_length += chunk.length;
                self.shorten(self.maxlength);
                return;
            }
        }

        self.current_length += chunk.length;
        self.chunks.push_back(chunk);
        self.shorten(self.maxlength);
    }

    /// Like [`Memblockq::push`], but accepts chunks of any length,
    /// re-blocking them through an internal alignment filter first.
    pub fn push_align(&mut self, chunk: &Memchunk, seek: usize) {
        if self.base == 1 {
            self.push(chunk.clone(), seek);
            return;
        }

        let mcalign = self
            .mcalign
            .get_or_insert_with(|| McAlign::new(self.base, self.stat.as_ref()));
        mcalign.push(chunk);

        let mut seek = seek;
        while let Some(aligned) = self.mcalign.as_mut().and_then(|a| a.pop()) {
            self.push(aligned, seek);
            seek = 0;
        }
    }

    /// Returns a reference to the head chunk, without consuming it.
    ///
    /// Fails when the queue is empty or still prebuffering
    /// (`current_length < prebuf`). A successful peek clears the transient
    /// prebuffer, so the stream keeps flowing until it is explicitly
    /// re-enabled.
    pub fn peek(&mut self) -> Option<Memchunk> {
        if self.current_length < self.prebuf {
            return None;
        }

        let head = self.chunks.front()?;
        self.prebuf = 0;
        Some(head.clone())
    }

    /// Consumes `length` bytes from the head. `chunk` must be the chunk
    /// returned by the immediately preceding [`Memblockq::peek`]; anything
    /// else makes the call a no-op.
    pub fn drop(&mut self, chunk: &Memchunk, length: usize) {
        assert!(length > 0);

        match self.chunks.front() {
            Some(head)
                if Rc::ptr_eq(&head.memblock, &chunk.memblock)
                    && head.index == chunk.index
                    && head.length == chunk.length => {}
            _ => return,
        }

        assert!(length <= self.chunks.front().map(|c| c.length).unwrap_or(0));
        self.skip(length);
    }

    /// Drops `length` bytes from the head unconditionally. `length` must be
    /// a multiple of `base` and no more than the queued amount.
    pub fn skip(&mut self, mut length: usize) {
        assert!(length % self.base == 0);

        while length > 0 {
            assert!(self.current_length >= length);
            let head = self.chunks.front_mut().expect("skip beyond queue contents");

            let l = length.min(head.length);
            head.index += l;
            head.length -= l;
            self.current_length -= l;

            if head.length == 0 {
                self.chunks.pop_front();
            }

            length -= l;
        }
    }

    /// Drops data from the head until no more than `length` bytes remain,
    /// rounding the amount dropped down to `base`.
    pub fn shorten(&mut self, length: usize) {
        if self.current_length <= length {
            return;
        }

        let l = (self.current_length - length) / self.base * self.base;
        self.skip(l);
    }

    /// Moves the write pointer back by `length` bytes, consuming data from
    /// the tail, stopping when the queue empties. Lets a client overwrite
    /// recently-pushed data.
    pub fn seek(&mut self, mut length: usize) {
        while length >= self.base {
            if self.current_length == 0 {
                return;
            }

            let tail = self.chunks.back_mut().expect("nonempty queue has a tail");
            let l = length.min(tail.length);
            tail.length -= l;
            self.current_length -= l;

            if tail.length == 0 {
                self.chunks.pop_back();
            }

            length -= l;
        }
    }

    /// Drops everything and restores the transient prebuffer to the
    /// configured value.
    pub fn flush(&mut self) {
        self.chunks.clear();
        self.current_length = 0;
        self.prebuf = self.orig_prebuf;
    }

    /// How many bytes the stream's producer should be asked for: the
    /// deficit below the target, but only when it has grown to at least
    /// `minreq`.
    pub fn missing(&self) -> usize {
        if self.current_length >= self.tlength {
            return 0;
        }

        let l = self.tlength - self.current_length;
        if l >= self.minreq {
            l
        } else {
            0
        }
    }

    /// True iff `length` more bytes would not exceed the target.
    pub fn is_writable(&self, length: usize) -> bool {
        self.current_length + length <= self.tlength
    }

    /// True iff a peek would succeed.
    pub fn is_readable(&self) -> bool {
        self.current_length > 0 && self.current_length >= self.prebuf
    }

    /// Zeroes the transient prebuffer, forcing the stream to flow
    /// immediately.
    pub fn prebuf_disable(&mut self) {
        self.prebuf = 0;
    }

    /// Restores the configured prebuffer, forcing a refill before the next
    /// peek succeeds.
    pub fn prebuf_reenable(&mut self) {
        self.prebuf = self.orig_prebuf;
    }

    /// Bytes currently queued.
    pub fn len(&self) -> usize {
        self.current_length
    }

    /// True iff nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.current_length == 0
    }

    /// The sanitized target length.
    pub fn tlength(&self) -> usize {
        self.tlength
    }

    /// The sanitized minimum request.
    pub fn minreq(&self) -> usize {
        self.minreq
    }

    /// The frame size.
    pub fn base(&self) -> usize {
        self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memblock::Memblock;
    use pretty_assertions::assert_eq;

    fn chunk_of(bytes: &[u8]) -> Memchunk {
        Memchunk::from_block(Memblock::new_dynamic(bytes.to_vec(), None))
    }

    fn queue() -> Memblockq {
        // maxlength=64, tlength=32, base=4, prebuf=8, minreq=4
        Memblockq::new(64, 32, 4, Some(8), 4, None)
    }

    #[test]
    fn sanitization() {
        let q = Memblockq::new(102, 0, 4, None, 0, None);
        // maxlength rounded up, tlength defaults to maxlength, prebuf to
        // maxlength/2 rounded down, minreq floored at 1.
        assert_eq!(q.tlength(), 104);
        assert_eq!(q.minreq(), 1);
        assert!(!q.is_readable());
    }

    #[test]
    fn push_peek_drop_roundtrip() {
        let mut q = queue();
        q.push(chunk_of(&[1; 8]), 0);
        assert_eq!(q.len(), 8);

        let peeked = q.peek().expect("prebuf satisfied");
        assert_eq!(peeked.length, 8);

        q.drop(&peeked, 8);
        assert_eq!(q.len(), 0, "push-peek-drop is a no-op on length");
    }

    #[test]
    fn prebuf_gates_peek_until_first_success() {
        let mut q = queue();
        q.push(chunk_of(&[0; 4]), 0);
        assert!(q.peek().is_none(), "below prebuf");
        assert!(!q.is_readable());

        q.push(chunk_of(&[0; 4]), 0);
        assert!(q.is_readable());
        let c = q.peek().expect("prebuf reached");
        q.drop(&c, 8);

        // The transient prebuf is now zero: a single frame is peekable.
        q.push(chunk_of(&[0; 4]), 0);
        assert!(q.peek().is_some());

        q.prebuf_reenable();
        assert!(q.peek().is_none(), "prebuffering again after reenable");
    }

    #[test]
    fn contiguous_tail_chunks_merge() {
        let mut q = queue();
        let block = Memblock::new_dynamic(vec![0; 16], None);
        q.push(Memchunk::new(block.share(), 0, 8), 0);
        q.push(Memchunk::new(block.share(), 8, 8), 0);

        let peeked = q.peek().expect("readable");
        assert_eq!(peeked.length, 16, "adjacent chunks of one block merge");
    }

    #[test]
    fn push_beyond_maxlength_drops_head_bytes() {
        let mut q = queue();
        q.push(chunk_of(&[1; 64]), 0);
        q.push(chunk_of(&[2; 8]), 0);
        assert_eq!(q.len(), 64);

        let head = q.peek().unwrap();
        assert_eq!(head.bytes()[0], 1);
        assert_eq!(head.length, 56, "head was shortened to make room");
    }

    #[test]
    fn seek_consumes_from_the_tail() {
        let mut q = queue();
        q.push(chunk_of(&[1; 16]), 0);
        q.push(chunk_of(&[2; 8]), 4);
        // The seek of 4 retracted the tail before appending.
        assert_eq!(q.len(), 20);
    }

    #[test]
    fn drop_of_stale_chunk_is_a_no_op() {
        let mut q = queue();
        q.push(chunk_of(&[1; 8]), 0);
        let stale = chunk_of(&[9; 8]);
        q.drop(&stale, 8);
        assert_eq!(q.len(), 8);
    }

    #[test]
    fn missing_respects_minreq() {
        // tlength=32, minreq=16
        let mut q = Memblockq::new(64, 32, 4, Some(0), 16, None);
        assert_eq!(q.missing(), 32);

        q.push(chunk_of(&[0; 20]), 0);
        // Deficit of 12 is below minreq.
        assert_eq!(q.missing(), 0);

        q.skip(8);
        assert_eq!(q.missing(), 20);

        assert!(q.is_writable(20));
        assert!(!q.is_writable(24));
    }

    #[test]
    fn flush_resets_prebuf() {
        let mut q = queue();
        q.push(chunk_of(&[0; 8]), 0);
        let c = q.peek().unwrap();
        q.drop(&c, 4);

        q.flush();
        assert_eq!(q.len(), 0);
        q.push(chunk_of(&[0; 4]), 0);
        assert!(q.peek().is_none(), "flush restores the configured prebuf");
    }

    #[test]
    fn push_align_conserves_randomly_sized_chunks() {
        use rand::Rng;

        let mut rng = rand::rng();
        let mut q = Memblockq::new(1 << 20, 0, 6, Some(0), 1, None);

        let mut pushed = Vec::new();
        for _ in 0..100 {
            let len = rng.random_range(1..=97);
            let piece: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            pushed.extend_from_slice(&piece);
            q.push_align(&chunk_of(&piece), 0);
        }

        let mut out = Vec::new();
        while let Some(c) = q.peek() {
            out.extend_from_slice(&c.bytes());
            q.drop(&c, c.length);
        }

        let whole = pushed.len() / 6 * 6;
        assert_eq!(&out[..], &pushed[..whole]);
    }

    #[test]
    fn push_align_is_byte_conservative() {
        let mut q = Memblockq::new(1024, 0, 4, Some(0), 1, None);
        let data: Vec<u8> = (0..=41).collect();
        for piece in data.chunks(7) {
            q.push_align(&chunk_of(piece), 0);
        }

        let mut out = Vec::new();
        while let Some(c) = q.peek() {
            out.extend_from_slice(&c.bytes());
            q.drop(&c, c.length);
        }

        // Everything that completed a frame came out, in order.
        assert_eq!(&out[..], &data[..40]);
    }
}
