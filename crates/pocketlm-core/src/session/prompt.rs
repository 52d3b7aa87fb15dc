//! Conversation prompt rendering and stop-sequence handling.

use serde::{Deserialize, Serialize};

/// System preamble every conversation opens with.
pub const SYSTEM_PREAMBLE: &str = "You are a helpful assistant.";

/// Turn delimiters of the ChatML convention the catalog models share.
pub const TURN_START: &str = "<|im_start|>";
pub const TURN_END: &str = "<|im_end|>";

/// Markers passed to the engine as stop sequences and applied again to its
/// raw output, so it can never speak for the next user turn.
pub fn stop_sequences() -> Vec<String> {
    vec![TURN_END.to_string(), TURN_START.to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn tag(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role-tagged message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
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

/// Render the full history as a single prompt, ending with an open
/// assistant turn for the engine to continue from.
pub fn render_prompt(history: &[Turn]) -> String {
    let mut prompt = format!("{TURN_START}system\n{SYSTEM_PREAMBLE}{TURN_END}\n");
    for turn in history {
        prompt.push_str(TURN_START);
        prompt.push_str(turn.role.tag());
        prompt.push('\n');
        prompt.push_str(&turn.text);
        prompt.push_str(TURN_END);
        prompt.push('\n');
    }
    prompt.push_str(TURN_START);
    prompt.push_str("assistant\n");
    prompt
}

/// Cut `text` at the first occurrence of any stop marker.
pub fn truncate_at_stop<'a>(text: &'a str, stops: &[String]) -> &'a str {
    let cut = stops
        .iter()
        .filter_map(|stop| text.find(stop.as_str()))
        .min()
        .unwrap_or(text.len());
    &text[..cut]
}

/// Streams deltas while never emitting text at or past a stop marker, even
/// when a marker straddles two deltas. Text that could be the start of a
/// marker is withheld until it is known not to be.
pub struct StopFilter {
    stops: Vec<String>,
    buffer: String,
    emitted: usize,
    done: bool,
}

impl StopFilter {
    pub fn new(stops: Vec<String>) -> Self {
        Self {
            stops,
            buffer: String::new(),
            emitted: 0,
            done: false,
        }
    }

    /// Feed a raw delta; returns the text now safe to emit.
    pub fn push(&mut self, delta: &str) -> String {
        if self.done {
            return String::new();
        }
        self.buffer.push_str(delta);

        let cut = self
            .stops
            .iter()
            .filter_map(|stop| self.buffer.find(stop.as_str()))
            .min();
        if let Some(cut) = cut {
            self.done = true;
            let cut = cut.max(self.emitted);
            let out = self.buffer[self.emitted..cut].to_string();
            self.emitted = cut;
            return out;
        }

        let safe = self.buffer.len() - self.holdback();
        if safe <= self.emitted {
            return String::new();
        }
        let out = self.buffer[self.emitted..safe].to_string();
        self.emitted = safe;
        out
    }

    /// Remaining withheld text once the stream has ended without a marker.
    pub fn finish(&mut self) -> String {
        if self.done {
            return String::new();
        }
        self.done = true;
        let out = self.buffer[self.emitted..].to_string();
        self.emitted = self.buffer.len();
        out
    }

    /// Everything emitted so far.
    pub fn text(&self) -> &str {
        &self.buffer[..self.emitted]
    }

    // Length of the longest buffer suffix that is a proper prefix of some
    // stop marker.
    fn holdback(&self) -> usize {
        let longest = self
            .stops
            .iter()
            .map(|stop| stop.len())
            .max()
            .unwrap_or(0)
            .saturating_sub(1);
        let len = self.buffer.len();
        for take in (1..=longest.min(len)).rev() {
            if let Some(suffix) = self.buffer.get(len - take..) {
                if self.stops.iter().any(|stop| stop.starts_with(suffix)) {
                    return take;
                }
            }
        }
        0
    }
}
