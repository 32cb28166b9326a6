use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use uuid::Uuid;

/// Source of the random pieces of a request: ids, trace ids, and picks from
/// small label sets.
pub trait RandomSource: Send {
    /// Uniform index in `0..upper`. `upper` must be non-zero.
    fn below(&mut self, upper: usize) -> usize;
    fn fill(&mut self, buf: &mut [u8]);
    /// Independent source for work that outlives a single request, so a
    /// shared source is not held across blocking calls.
    fn fork(&mut self) -> Box<dyn RandomSource>;

    fn hex(&mut self, bytes: usize) -> String {
        let mut buf = vec![0u8; bytes];
        self.fill(&mut buf);
        hex::encode(buf)
    }

    fn uuid(&mut self) -> Uuid {
        let mut buf = [0u8; 16];
        self.fill(&mut buf);
        uuid::Builder::from_random_bytes(buf).into_uuid()
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        if items.is_empty() {
            return "";
        }
        items[self.below(items.len()).min(items.len() - 1)]
    }
}

#[derive(Debug)]
pub struct ThreadRandom {
    rng: StdRng,
}

impl ThreadRandom {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for ThreadRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for ThreadRandom {
    fn below(&mut self, upper: usize) -> usize {
        if upper == 0 {
            return 0;
        }
        self.rng.gen_range(0..upper)
    }

    fn fill(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }

    fn fork(&mut self) -> Box<dyn RandomSource> {
        let mut seed = <StdRng as SeedableRng>::Seed::default();
        self.rng.fill_bytes(&mut seed);
        Box::new(Self {
            rng: StdRng::from_seed(seed),
        })
    }
}

/// Deterministic source for reproducible requests.
///
/// Picks cycle through `picks`; every byte is `byte`, so generated hex ids and
/// uuids are stable.
#[derive(Debug, Clone)]
pub struct SequenceRandom {
    picks: Vec<usize>,
    cursor: usize,
    byte: u8,
}

impl SequenceRandom {
    pub fn new(picks: Vec<usize>, byte: u8) -> Self {
        Self {
            picks,
            cursor: 0,
            byte,
        }
    }
}

impl RandomSource for SequenceRandom {
    fn below(&mut self, upper: usize) -> usize {
        if upper == 0 || self.picks.is_empty() {
            return 0;
        }
        let pick = self.picks[self.cursor % self.picks.len()];
        self.cursor += 1;
        pick % upper
    }

    fn fill(&mut self, buf: &mut [u8]) {
        buf.fill(self.byte);
    }

    fn fork(&mut self) -> Box<dyn RandomSource> {
        Box::new(self.clone())
    }
}
