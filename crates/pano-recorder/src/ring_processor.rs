//! Cyclic consecutive-pair iteration.
//!
//! The ring processor feeds each consecutive pair `(xᵢ, xᵢ₊₁)` to a pair
//! handler and, on flush, the wrap-around pair `(xₙ, x₀)`, so cyclic
//! structures are processed without ever building a linked graph. Prepare
//! and release hooks bracket each item's lifetime so pixel buffers stay
//! loaded only while a pair actually needs them.

/// Drives pairwise processing over a cyclic sequence.
pub struct RingProcessor<T, FPrep, FPair, FRelease>
where
    FPrep: FnMut(&mut T),
    FPair: FnMut(&mut T, &mut T),
    FRelease: FnMut(T),
{
    prepare: FPrep,
    pair: FPair,
    release: FRelease,
    first: Option<T>,
    previous: Option<T>,
    count: usize,
}

impl<T, FPrep, FPair, FRelease> RingProcessor<T, FPrep, FPair, FRelease>
where
    T: Clone,
    FPrep: FnMut(&mut T),
    FPair: FnMut(&mut T, &mut T),
    FRelease: FnMut(T),
{
    pub fn new(prepare: FPrep, pair: FPair, release: FRelease) -> Self {
        Self {
            prepare,
            pair,
            release,
            first: None,
            previous: None,
            count: 0,
        }
    }

    /// Feed the next item of the ring.
    pub fn push(&mut self, mut item: T) {
        (self.prepare)(&mut item);
        self.count += 1;
        if self.first.is_none() {
            self.first = Some(item.clone());
        }
        if let Some(mut previous) = self.previous.take() {
            (self.pair)(&mut previous, &mut item);
            (self.release)(previous);
        }
        self.previous = Some(item);
    }

    /// Close the ring: emit `(last, first)` and release both.
    ///
    /// Resets the processor for the next ring.
    pub fn flush(&mut self) {
        let count = std::mem::take(&mut self.count);
        match (self.previous.take(), self.first.take()) {
            (Some(mut last), Some(mut first)) if count >= 2 => {
                (self.pair)(&mut last, &mut first);
                (self.release)(last);
                (self.release)(first);
            }
            (Some(last), Some(first)) => {
                (self.release)(last);
                (self.release)(first);
            }
            (Some(only), None) | (None, Some(only)) => (self.release)(only),
            (None, None) => {}
        }
    }
}
