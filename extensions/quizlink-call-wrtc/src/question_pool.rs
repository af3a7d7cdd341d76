use rand::seq::SliceRandom;
use rand::Rng;

/// Shown when the question source can't be reached. The session still works,
/// it just asks the same thing every round.
pub const FALLBACK_QUESTION: &str =
    "What planet is known as the Red Planet due to its reddish appearance?";

/// Draws question indices without repeats. Once every index has been handed
/// out the pool reshuffles in place and starts a fresh pass, so a long session
/// cycles through the whole catalog before seeing anything twice.
pub struct QuestionPool {
    available: Vec<usize>,
    total: usize,
}

impl QuestionPool {
    pub fn new(total: usize) -> Self {
        Self::with_rng(total, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(total: usize, rng: &mut R) -> Self {
        let mut pool = Self {
            available: Vec::new(),
            total,
        };
        pool.reshuffle(rng);
        pool
    }

    fn reshuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.available = (0..self.total).collect();
        self.available.shuffle(rng);
    }

    pub fn next(&mut self) -> Option<usize> {
        self.next_with(&mut rand::thread_rng())
    }

    pub fn next_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<usize> {
        if self.total == 0 {
            return None;
        }
        if self.available.is_empty() {
            log::debug!("question pool exhausted. reshuffling {} entries", self.total);
            self.reshuffle(rng);
        }
        self.available.pop()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.available.len()
    }
}
