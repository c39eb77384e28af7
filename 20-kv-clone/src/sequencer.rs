/// Publisher-side source of sequence numbers.
///
/// Starts at zero, meaning "nothing sequenced yet"; the first mutation gets 1.
#[derive(Debug, Default)]
pub struct Sequencer {
    current: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently issued sequence number.
    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn next(&mut self) -> u64 {
        self.current += 1;
        self.current
    }
}
