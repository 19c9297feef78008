//! Conversation history: an ordered, bounded window of turns.
//!
//! The orchestrator owns one `History` per session. Only the most recent
//! [`History::DEFAULT_WINDOW`] turns are sent as dialogue context to cap
//! payload size; nothing is persisted beyond the session.

use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One exchange in the conversation, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Ordered turn log with a bounded context window.
#[derive(Debug, Clone)]
pub struct History {
    turns: Vec<ConversationTurn>,
    window: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

impl History {
    /// Turns sent as dialogue context.
    pub const DEFAULT_WINDOW: usize = 10;

    pub fn new(window: usize) -> Self {
        Self {
            turns: Vec::new(),
            window,
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    /// The most recent turns, at most the configured window.
    pub fn window(&self) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(self.window);
        &self.turns[start..]
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_last_n() {
        let mut h = History::new(3);
        for i in 0..5 {
            h.push(ConversationTurn::user(format!("turn {}", i)));
        }
        let w = h.window();
        assert_eq!(w.len(), 3);
        assert_eq!(w[0].text, "turn 2");
        assert_eq!(w[2].text, "turn 4");
        assert_eq!(h.len(), 5);
    }

    #[test]
    fn roles_serialize_lowercase() {
        let t = ConversationTurn::assistant("hi");
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"assistant\""));
    }

    #[test]
    fn clear_empties_history() {
        let mut h = History::default();
        h.push(ConversationTurn::user("hello"));
        assert!(!h.is_empty());
        h.clear();
        assert!(h.is_empty());
        assert!(h.window().is_empty());
    }
}
