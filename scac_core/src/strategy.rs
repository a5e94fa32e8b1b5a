//! Greedy search strategies driven by an instruction-count oracle.
//!
//! Every strategy builds a batch per round, evaluates it in one pass, and
//! keeps the first candidate that attains the highest count. Ties always go to
//! the earliest candidate in construction order, so a search is deterministic
//! for a deterministic oracle.
//!
//! Forward and backward search assume a monotonic prefix (or suffix) signal:
//! the count rises as more leading (or trailing) characters are right.
//! `BruteAll` only assumes a monotonic membership signal, that any correct
//! slot raises the count, and pays for it with `O(L² · |alphabet|)` calls.

use crate::config::SearchMode;
use crate::error::{Result, ScacError};
use crate::evaluator::BatchEvaluator;
use crate::input::InputTemplate;
use crate::observer::SearchObserver;
use serde::Serialize;
use std::iter::repeat_n;
use tracing::{debug, info};

/// Ordered set of characters to try per slot. The first occurrence of a
/// duplicate wins; order is tie-break priority.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Alphabet {
    chars: Vec<char>,
}

impl Alphabet {
    pub fn new(chars: &str) -> Self {
        let mut unique = Vec::with_capacity(chars.len());
        for c in chars.chars() {
            if !unique.contains(&c) {
                unique.push(c);
            }
        }
        Self { chars: unique }
    }

    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

/// A secret of fixed length whose slots are resolved one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSecret {
    slots: Vec<Option<char>>,
}

impl PartialSecret {
    pub fn new(length: usize) -> Self {
        Self {
            slots: vec![None; length],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<char> {
        self.slots.get(position).copied().flatten()
    }

    pub fn resolve(&mut self, position: usize, ch: char) -> Result<()> {
        let len = self.slots.len();
        let slot = self.slots.get_mut(position).ok_or_else(|| {
            ScacError::config(format!("slot {position} is outside a secret of length {len}"))
        })?;
        *slot = Some(ch);
        Ok(())
    }

    pub fn unresolved_positions(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Renders the secret with unresolved slots as `filler`, except `probe`
    /// which overrides its slot.
    pub fn render(&self, filler: char, probe: Option<(usize, char)>) -> String {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| match probe {
                Some((position, ch)) if position == i => ch,
                _ => slot.unwrap_or(filler),
            })
            .collect()
    }
}

/// Knobs shared by the character-recovering strategies.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub alphabet: Alphabet,
    pub filler: char,
    pub length: usize,
}

impl SearchParams {
    pub fn new(alphabet: Alphabet, filler: char, length: usize) -> Self {
        Self {
            alphabet,
            filler,
            length,
        }
    }

    fn require_alphabet(&self) -> Result<()> {
        if self.alphabet.is_empty() {
            return Err(ScacError::config("alphabet must contain at least one character"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum SearchResult {
    /// `max_count` is `None` when no length was probed.
    Length {
        best_length: usize,
        max_count: Option<u64>,
    },
    Secret { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SearchOutcome {
    pub strategy: &'static str,
    pub result: SearchResult,
    pub rounds: usize,
    pub oracle_calls: usize,
}

/// Everything a strategy needs for one search: how guesses become candidates,
/// who evaluates them, and who hears about it.
pub struct SearchContext<'a> {
    evaluator: &'a dyn BatchEvaluator,
    template: &'a InputTemplate,
    observer: &'a mut dyn SearchObserver,
    rounds: usize,
    oracle_calls: usize,
}

impl<'a> SearchContext<'a> {
    pub fn new(
        evaluator: &'a dyn BatchEvaluator,
        template: &'a InputTemplate,
        observer: &'a mut dyn SearchObserver,
    ) -> Self {
        Self {
            evaluator,
            template,
            observer,
            rounds: 0,
            oracle_calls: 0,
        }
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn oracle_calls(&self) -> usize {
        self.oracle_calls
    }

    /// Evaluates one round of guesses; `counts[i]` belongs to `guesses[i]`.
    fn run_round(&mut self, guesses: &[String]) -> Result<Vec<u64>> {
        let batch = self.template.batch(guesses);
        let counts = self.evaluator.evaluate(&batch)?;
        if counts.len() != guesses.len() {
            return Err(ScacError::oracle(
                format!(
                    "evaluator returned {} counts for {} candidates",
                    counts.len(),
                    guesses.len()
                ),
                String::new(),
            ));
        }
        self.observer.round_evaluated(self.rounds, guesses, &counts);
        self.rounds += 1;
        self.oracle_calls += guesses.len();
        Ok(counts)
    }

    fn resolved(&mut self, position: usize, ch: char, count: u64) {
        let round = self.rounds.saturating_sub(1);
        self.observer.slot_resolved(round, position, ch, count);
    }

    fn outcome(&self, strategy: &'static str, result: SearchResult) -> SearchOutcome {
        SearchOutcome {
            strategy,
            result,
            rounds: self.rounds,
            oracle_calls: self.oracle_calls,
        }
    }
}

/// Index and value of the first maximum.
fn first_max(counts: &[u64]) -> Option<(usize, u64)> {
    let mut best: Option<(usize, u64)> = None;
    for (i, &count) in counts.iter().enumerate() {
        match best {
            Some((_, top)) if count <= top => {}
            _ => best = Some((i, count)),
        }
    }
    best
}

fn best_of(counts: &[u64]) -> Result<(usize, u64)> {
    first_max(counts).ok_or_else(|| ScacError::config("round produced no candidates"))
}

pub trait SearchStrategy {
    fn name(&self) -> &'static str;

    fn search(&self, ctx: &mut SearchContext<'_>) -> Result<SearchOutcome>;
}

/// Probes the filler repeated to every length in `0..=max_length` and reports
/// the first length with the highest count.
#[derive(Debug, Clone)]
pub struct BruteLength {
    pub max_length: usize,
    pub filler: char,
}

impl SearchStrategy for BruteLength {
    fn name(&self) -> &'static str {
        "brute-length"
    }

    fn search(&self, ctx: &mut SearchContext<'_>) -> Result<SearchOutcome> {
        if self.max_length == 0 {
            let result = SearchResult::Length {
                best_length: 0,
                max_count: None,
            };
            return Ok(ctx.outcome(self.name(), result));
        }

        let guesses: Vec<String> = (0..=self.max_length)
            .map(|len| repeat_n(self.filler, len).collect())
            .collect();
        let counts = ctx.run_round(&guesses)?;
        let (best_length, max_count) = best_of(&counts)?;

        ctx.observer.length_selected(best_length, max_count);
        info!(best_length, max_count, "length search finished");
        let result = SearchResult::Length {
            best_length,
            max_count: Some(max_count),
        };
        Ok(ctx.outcome(self.name(), result))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Recovers one character per round growing from the front (forward) or the
/// back (backward). Exactly `length` rounds of `|alphabet|` candidates each.
fn brute_directional(
    name: &'static str,
    params: &SearchParams,
    direction: Direction,
    ctx: &mut SearchContext<'_>,
) -> Result<SearchOutcome> {
    params.require_alphabet()?;

    let mut found = String::new();
    let mut found_len = 0;
    while found_len < params.length {
        let pad: String = repeat_n(params.filler, params.length - found_len - 1).collect();
        let guesses: Vec<String> = params
            .alphabet
            .chars()
            .iter()
            .map(|c| match direction {
                Direction::Forward => format!("{found}{c}{pad}"),
                Direction::Backward => format!("{pad}{c}{found}"),
            })
            .collect();

        let counts = ctx.run_round(&guesses)?;
        let (best, count) = best_of(&counts)?;
        let ch = params.alphabet.chars()[best];
        let position = match direction {
            Direction::Forward => {
                found.push(ch);
                found_len
            }
            Direction::Backward => {
                found.insert(0, ch);
                params.length - found_len - 1
            }
        };
        found_len += 1;
        ctx.resolved(position, ch, count);
        debug!(position, ch = ?ch, inscount = count, found = ?found, "extended secret");
    }

    info!(found = ?found, "{name} search finished");
    Ok(ctx.outcome(name, SearchResult::Secret { value: found }))
}

#[derive(Debug, Clone)]
pub struct BruteForward {
    pub params: SearchParams,
}

impl SearchStrategy for BruteForward {
    fn name(&self) -> &'static str {
        "brute-forward"
    }

    fn search(&self, ctx: &mut SearchContext<'_>) -> Result<SearchOutcome> {
        brute_directional(self.name(), &self.params, Direction::Forward, ctx)
    }
}

#[derive(Debug, Clone)]
pub struct BruteBackward {
    pub params: SearchParams,
}

impl SearchStrategy for BruteBackward {
    fn name(&self) -> &'static str {
        "brute-backward"
    }

    fn search(&self, ctx: &mut SearchContext<'_>) -> Result<SearchOutcome> {
        brute_directional(self.name(), &self.params, Direction::Backward, ctx)
    }
}

/// Tries every alphabet character at every unresolved slot each round and
/// fixes the single best `(slot, char)` pair, so the most informative
/// position is found rather than assumed.
#[derive(Debug, Clone)]
pub struct BruteAll {
    pub params: SearchParams,
}

impl SearchStrategy for BruteAll {
    fn name(&self) -> &'static str {
        "brute-all"
    }

    fn search(&self, ctx: &mut SearchContext<'_>) -> Result<SearchOutcome> {
        let params = &self.params;
        params.require_alphabet()?;

        let mut secret = PartialSecret::new(params.length);
        while !secret.is_complete() {
            let unresolved = secret.unresolved_positions();
            let mut probes = Vec::with_capacity(unresolved.len() * params.alphabet.len());
            let mut guesses = Vec::with_capacity(probes.capacity());
            for &position in &unresolved {
                for &ch in params.alphabet.chars() {
                    probes.push((position, ch));
                    guesses.push(secret.render(params.filler, Some((position, ch))));
                }
            }

            let counts = ctx.run_round(&guesses)?;
            let (best, count) = best_of(&counts)?;
            let (position, ch) = probes[best];
            secret.resolve(position, ch)?;
            ctx.resolved(position, ch, count);
            debug!(position, ch = ?ch, inscount = count, "resolved slot");
        }

        let value = secret.render(params.filler, None);
        info!(found = ?value, "brute-all search finished");
        Ok(ctx.outcome(self.name(), SearchResult::Secret { value }))
    }
}

/// Builds the strategy for `mode`. `params.length` is the maximum length for
/// a length search.
pub fn build_strategy(mode: SearchMode, params: SearchParams) -> Box<dyn SearchStrategy> {
    match mode {
        SearchMode::BruteLength => Box::new(BruteLength {
            max_length: params.length,
            filler: params.filler,
        }),
        SearchMode::BruteForward => Box::new(BruteForward { params }),
        SearchMode::BruteBackward => Box::new(BruteBackward { params }),
        SearchMode::BruteAll => Box::new(BruteAll { params }),
    }
}
