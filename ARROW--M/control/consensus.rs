use std::collections::VecDeque;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Label meaning "do not move".
pub const IDLE_LABEL: &str = "Idle";

/// Case-insensitive check for the idle label.
#[must_use]
pub fn is_idle(label: &str) -> bool {
    label.trim().eq_ignore_ascii_case(IDLE_LABEL)
}

/// Outcome of evaluating the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    /// Window holds exactly `capacity` labels.
    pub full: bool,
    /// Most frequent label; `None` until the window is full.
    pub winning_label: Option<String>,
    /// Occurrences of the winning label.
    pub count: usize,
    /// Label to execute, or [`IDLE_LABEL`].
    pub command: String,
}

impl ConsensusDecision {
    fn undecided() -> Self {
        Self {
            full: false,
            winning_label: None,
            count: 0,
            command: IDLE_LABEL.to_string(),
        }
    }

    /// Whether the decision asks for movement.
    #[must_use]
    pub fn is_movement(&self) -> bool {
        !is_idle(&self.command)
    }
}

#[derive(Debug)]
struct Window {
    capacity: usize,
    labels: VecDeque<String>,
}

impl Window {
    fn push(&mut self, label: String) {
        self.labels.push_back(label);
        while self.labels.len() > self.capacity {
            self.labels.pop_front();
        }
    }

    fn evaluate(&self, required: usize) -> ConsensusDecision {
        if self.labels.len() != self.capacity {
            return ConsensusDecision::undecided();
        }

        // Tally keeps first-seen order so ties go to the earliest label.
        let mut tally: IndexMap<&str, usize> = IndexMap::new();
        for label in &self.labels {
            *tally.entry(label.as_str()).or_insert(0) += 1;
        }
        let mut winner: Option<(&str, usize)> = None;
        for (label, count) in tally {
            if winner.map_or(true, |(_, best)| count > best) {
                winner = Some((label, count));
            }
        }

        let Some((label, count)) = winner else {
            return ConsensusDecision::undecided();
        };
        let command = if !is_idle(label) && count >= required {
            label.to_string()
        } else {
            IDLE_LABEL.to_string()
        };
        ConsensusDecision {
            full: true,
            winning_label: Some(label.to_string()),
            count,
            command,
        }
    }
}

/// Fixed-capacity FIFO window of recent classification labels.
#[derive(Debug)]
pub struct ConsensusBuffer {
    window: Mutex<Window>,
}

impl ConsensusBuffer {
    /// Creates an empty window; capacity is clamped to at least one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: Mutex::new(Window {
                capacity,
                labels: VecDeque::with_capacity(capacity),
            }),
        }
    }

    /// Changes the capacity, keeping the most recent labels on shrink.
    pub fn configure(&self, capacity: usize) {
        let mut window = self.window.lock();
        window.capacity = capacity.max(1);
        while window.labels.len() > window.capacity {
            window.labels.pop_front();
        }
    }

    /// Current capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.window.lock().capacity
    }

    /// Appends a label, evicting the oldest once over capacity.
    pub fn push(&self, label: impl Into<String>) {
        self.window.lock().push(label.into());
    }

    /// Majority decision over the current window.
    #[must_use]
    pub fn evaluate(&self, required: usize) -> ConsensusDecision {
        self.window.lock().evaluate(required)
    }

    /// Pushes and evaluates under one lock, returning the decision together
    /// with the window contents it was taken from.
    pub fn record(
        &self,
        label: impl Into<String>,
        required: usize,
    ) -> (ConsensusDecision, Vec<String>) {
        let mut window = self.window.lock();
        window.push(label.into());
        let decision = window.evaluate(required);
        (decision, window.labels.iter().cloned().collect())
    }

    /// Window contents, oldest first.
    #[must_use]
    pub fn contents(&self) -> Vec<String> {
        self.window.lock().labels.iter().cloned().collect()
    }

    /// Drops every label.
    pub fn clear(&self) {
        self.window.lock().labels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, labels: &[&str]) -> ConsensusBuffer {
        let buffer = ConsensusBuffer::new(capacity);
        for label in labels {
            buffer.push(*label);
        }
        buffer
    }

    #[test]
    fn length_never_exceeds_capacity() {
        for capacity in 1..6 {
            let buffer = ConsensusBuffer::new(capacity);
            for step in 0..12 {
                buffer.push(format!("L{}", step % 3));
                assert!(buffer.contents().len() <= capacity);
                assert_eq!(buffer.evaluate(1).full, buffer.contents().len() == capacity);
            }
        }
    }

    #[test]
    fn majority_moves_when_consensus_reached() {
        let decision = filled(3, &["Forward", "Forward", "Idle"]).evaluate(2);
        assert!(decision.full);
        assert_eq!(decision.winning_label.as_deref(), Some("Forward"));
        assert_eq!(decision.count, 2);
        assert_eq!(decision.command, "Forward");
    }

    #[test]
    fn no_consensus_means_idle() {
        let decision = filled(3, &["Forward", "Left", "Idle"]).evaluate(2);
        assert!(decision.full);
        assert_eq!(decision.count, 1);
        assert_eq!(decision.command, IDLE_LABEL);
    }

    #[test]
    fn partial_window_has_no_decision() {
        let decision = filled(3, &["Forward", "Forward"]).evaluate(2);
        assert!(!decision.full);
        assert_eq!(decision.winning_label, None);
        assert_eq!(decision.command, IDLE_LABEL);
    }

    #[test]
    fn ties_go_to_first_seen_label() {
        let decision = filled(4, &["Left", "Right", "Right", "Left"]).evaluate(2);
        assert_eq!(decision.winning_label.as_deref(), Some("Left"));
        let decision = filled(4, &["Right", "Left", "Left", "Right"]).evaluate(2);
        assert_eq!(decision.winning_label.as_deref(), Some("Right"));
    }

    #[test]
    fn idle_winner_is_case_insensitive() {
        let decision = filled(3, &["IDLE", "idle", "Forward"]).evaluate(1);
        assert_eq!(decision.winning_label.as_deref(), Some("IDLE"));
        assert_eq!(decision.command, IDLE_LABEL);
    }

    #[test]
    fn shrink_keeps_most_recent() {
        let buffer = filled(5, &["a", "b", "c", "d", "e"]);
        buffer.configure(2);
        assert_eq!(buffer.contents(), vec!["d".to_string(), "e".to_string()]);
        assert!(buffer.evaluate(1).full);
    }

    #[test]
    fn record_returns_matching_snapshot() {
        let buffer = ConsensusBuffer::new(2);
        let (_, snapshot) = buffer.record("Forward", 1);
        assert_eq!(snapshot, vec!["Forward".to_string()]);
        let (decision, snapshot) = buffer.record("Forward", 2);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(decision.command, "Forward");
    }
}
