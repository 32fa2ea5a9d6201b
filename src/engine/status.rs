use log::{debug, warn};

use crate::store::StateStore;

pub const STATUS_KEY: &str = "ups.status";
pub const ALARM_KEY: &str = "ups.alarm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Idle,
    Collecting,
}

/// Collects the tokens of one poll pass and publishes them as a single word.
///
/// Tokens keep their first insertion order and are deduplicated, so the
/// committed value only depends on the order items were walked in.
#[derive(Debug, Clone)]
pub struct StatusAccumulator {
    key: String,
    tokens: Vec<String>,
    state: AccumulatorState,
    delete_when_empty: bool,
    split_words: bool,
}

impl StatusAccumulator {
    pub fn new(key: &str) -> Self {
        StatusAccumulator {
            key: key.to_string(),
            tokens: Vec::new(),
            state: AccumulatorState::Idle,
            delete_when_empty: false,
            split_words: true,
        }
    }

    /// Accumulator for `ups.status`
    pub fn status() -> Self {
        StatusAccumulator::new(STATUS_KEY)
    }

    /// Accumulator for `ups.alarm`. Alarms are whole phrases and the key
    /// disappears when no alarm is active.
    pub fn alarm() -> Self {
        StatusAccumulator {
            delete_when_empty: true,
            split_words: false,
            ..StatusAccumulator::new(ALARM_KEY)
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    pub fn init(&mut self) {
        if self.state == AccumulatorState::Collecting {
            warn!("{} initialized twice within one pass, dropping {:?}", self.key, self.tokens);
        }
        self.tokens.clear();
        self.state = AccumulatorState::Collecting;
    }

    /// Add a token; status words accept several whitespace separated tokens at once
    pub fn set(&mut self, token: &str) {
        if self.state != AccumulatorState::Collecting {
            debug!("{} token {token:?} set outside of a pass", self.key);
        }
        if self.split_words {
            for t in token.split_whitespace() {
                self.push(t);
            }
        } else {
            self.push(token.trim());
        }
    }

    fn push(&mut self, token: &str) {
        if !token.is_empty() && !self.tokens.iter().any(|known| known == token) {
            self.tokens.push(token.to_string());
        }
    }

    pub(crate) fn unset(&mut self, token: &str) {
        self.tokens.retain(|t| t != token);
    }

    pub(crate) fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Publish the joined word and return to idle
    pub fn commit<S: StateStore>(&mut self, store: &mut S) -> String {
        let word = self.tokens.join(" ");
        if word.is_empty() && self.delete_when_empty {
            store.delete(&self.key);
        } else {
            store.set(&self.key, &word);
        }
        self.tokens.clear();
        self.state = AccumulatorState::Idle;
        word
    }

    /// Drop the working set, the last committed word stays published
    pub fn rollback(&mut self) {
        if !self.tokens.is_empty() {
            debug!("{} rolling back {:?}", self.key, self.tokens);
        }
        self.tokens.clear();
        self.state = AccumulatorState::Idle;
    }
}
