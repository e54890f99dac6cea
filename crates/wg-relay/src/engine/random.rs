use rand::Rng;

/// Feedback polynomial x^24 + x^23 + x^21 + x^20 + 1, in Galois form
const TAPS: u32 = 0xd8_0000;
const INDEX_MASK: u32 = 0xff_ffff;

/// Hands out 24-bit session indices.
///
/// The sequence walks a maximal-length LFSR from a random start, so no
/// index repeats until all 2^24 - 1 of them have been handed out. Each
/// state is whitened with a random mask before it leaves.
#[derive(Debug)]
pub struct SessionIndices {
    start: u32,
    state: u32,
    whitening: u32,
    exhausted: bool,
}

impl SessionIndices {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let start = rng.gen_range(1..=INDEX_MASK);
        Self {
            start,
            state: start,
            whitening: rng.gen::<u32>() & INDEX_MASK,
            exhausted: false,
        }
    }
}

impl Iterator for SessionIndices {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.exhausted {
            return None;
        }

        let current = self.state;
        self.state = (current >> 1) ^ ((current & 1).wrapping_neg() & TAPS);
        self.exhausted = self.state == self.start;
        Some((current - 1) ^ self.whitening)
    }
}
