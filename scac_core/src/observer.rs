use tracing::{debug, info};

/// A `SearchObserver` is told about every evaluated round and every decision a
/// search strategy makes.
///
/// Strategies call it synchronously between rounds, so an observer never sees
/// a partially evaluated batch.
pub trait SearchObserver {
    /// Returns a static string name identifying the observer.
    fn name(&self) -> &'static str;

    /// Called once per evaluated batch. `guesses[i]` produced `counts[i]`.
    fn round_evaluated(&mut self, round: usize, guesses: &[String], counts: &[u64]);

    /// Called when a secret slot is fixed to `ch` after scoring `count`.
    fn slot_resolved(&mut self, round: usize, position: usize, ch: char, count: u64);

    /// Called when a length search settles on its best length.
    fn length_selected(&mut self, length: usize, count: u64);
}

/// Ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpObserver;

impl SearchObserver for NoOpObserver {
    fn name(&self) -> &'static str {
        "NoOpObserver"
    }

    fn round_evaluated(&mut self, _round: usize, _guesses: &[String], _counts: &[u64]) {}

    fn slot_resolved(&mut self, _round: usize, _position: usize, _ch: char, _count: u64) {}

    fn length_selected(&mut self, _length: usize, _count: u64) {}
}

/// Logs each candidate's count at debug level and each decision at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SearchObserver for TracingObserver {
    fn name(&self) -> &'static str {
        "TracingObserver"
    }

    fn round_evaluated(&mut self, round: usize, guesses: &[String], counts: &[u64]) {
        for (guess, count) in guesses.iter().zip(counts) {
            debug!(round, inscount = count, input = ?guess, "candidate measured");
        }
    }

    fn slot_resolved(&mut self, round: usize, position: usize, ch: char, count: u64) {
        info!(round, position, ch = ?ch, inscount = count, "slot resolved");
    }

    fn length_selected(&mut self, length: usize, count: u64) {
        info!(best_length = length, inscount = count, "length selected");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchEvent {
    Round { round: usize, guesses: Vec<String>, counts: Vec<u64> },
    Resolved { round: usize, position: usize, ch: char, count: u64 },
    Length { length: usize, count: u64 },
}

/// Keeps every event in memory, in the order received.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    pub events: Vec<SearchEvent>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rounds(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, SearchEvent::Round { .. }))
            .count()
    }

    /// `(position, ch)` pairs in resolution order.
    pub fn resolutions(&self) -> Vec<(usize, char)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SearchEvent::Resolved { position, ch, .. } => Some((*position, *ch)),
                _ => None,
            })
            .collect()
    }
}

impl SearchObserver for RecordingObserver {
    fn name(&self) -> &'static str {
        "RecordingObserver"
    }

    fn round_evaluated(&mut self, round: usize, guesses: &[String], counts: &[u64]) {
        self.events.push(SearchEvent::Round {
            round,
            guesses: guesses.to_vec(),
            counts: counts.to_vec(),
        });
    }

    fn slot_resolved(&mut self, round: usize, position: usize, ch: char, count: u64) {
        self.events.push(SearchEvent::Resolved {
            round,
            position,
            ch,
            count,
        });
    }

    fn length_selected(&mut self, length: usize, count: u64) {
        self.events.push(SearchEvent::Length { length, count });
    }
}
