const INITIAL_SCORE: i32 = 4;
const MAX_SCORE: i32 = 16;

/// Bytes pulled from the kernel ahead of the caller's request.
///
/// Holds exactly the bytes already received but not yet handed out; together
/// with the kernel's queue that is everything undelivered. The backing buffer
/// is dropped again once large reads keep bypassing it.
#[derive(Debug)]
pub(crate) struct ReadAhead {
    buf: Option<Box<[u8]>>,
    start: usize,
    end: usize,
    capacity: usize,
    score: i32,
}

impl ReadAhead {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: None,
            start: 0,
            end: 0,
            capacity: capacity.max(1),
            score: INITIAL_SCORE,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending(&self) -> usize {
        self.end - self.start
    }

    pub fn is_allocated(&self) -> bool {
        self.buf.is_some()
    }

    /// Moves up to `out.len()` buffered bytes into `out`.
    pub fn take(&mut self, out: &mut [u8]) -> usize {
        let Some(buf) = self.buf.as_ref() else {
            return 0;
        };
        let n = out.len().min(self.end - self.start);
        out[..n].copy_from_slice(&buf[self.start..self.start + n]);
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
        n
    }

    /// Empty buffer space to receive into, allocating on first use. Only
    /// valid while nothing is pending.
    pub fn spare(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.pending(), 0);
        let capacity = self.capacity;
        self.buf
            .get_or_insert_with(|| vec![0u8; capacity].into_boxed_slice())
    }

    /// Records that `n` bytes were received into [`spare`](Self::spare).
    pub fn filled(&mut self, n: usize) {
        debug_assert!(n <= self.capacity);
        self.start = 0;
        self.end = n;
    }

    /// Buffering served a read.
    pub fn reward(&mut self) {
        self.score = (self.score + 1).min(MAX_SCORE);
    }

    /// A read bypassed the buffer. Releases it once the score runs out.
    pub fn decay(&mut self) {
        if self.buf.is_none() {
            return;
        }
        self.score -= 1;
        if self.score <= 0 && self.pending() == 0 {
            tracing::trace!("releasing {} byte read-ahead buffer", self.capacity);
            self.buf = None;
            self.score = INITIAL_SCORE;
        }
    }
}
