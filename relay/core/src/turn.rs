//! Reconstructed Assistant Turn
//!
//! Accumulates the fragments of a streamed response into the message a
//! non-streaming client would have received.

use crate::events::{ChatMessage, ToolCall};

/// The assistant turn rebuilt from a response stream
///
/// Content and reasoning only ever grow; tool calls are kept in arrival order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatTurn {
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
}

impl ChatTurn {
    /// Role of every reconstructed turn
    pub const ROLE: &'static str = "assistant";

    /// Create an empty turn
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one message fragment
    pub fn absorb(&mut self, fragment: &ChatMessage) {
        self.content.push_str(&fragment.content);
        if let Some(ref thinking) = fragment.thinking {
            self.reasoning.push_str(thinking);
        }
        if let Some(ref calls) = fragment.tool_calls {
            self.tool_calls.extend(calls.iter().cloned());
        }
    }

    /// Answer text so far
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Reasoning text so far, if any was produced
    #[must_use]
    pub fn reasoning(&self) -> Option<&str> {
        (!self.reasoning.is_empty()).then_some(self.reasoning.as_str())
    }

    /// Tool invocations so far
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    /// Render as a complete chat message
    #[must_use]
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage {
            role: Self::ROLE.to_string(),
            content: self.content.clone(),
            thinking: self.reasoning().map(str::to_string),
            tool_calls: (!self.tool_calls.is_empty()).then(|| self.tool_calls.clone()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ToolFunction;

    fn fragment(content: &str, thinking: Option<&str>) -> ChatMessage {
        ChatMessage {
            thinking: thinking.map(str::to_string),
            ..ChatMessage::new("assistant", content)
        }
    }

    fn tool(name: &str) -> ToolCall {
        ToolCall {
            function: ToolFunction {
                name: name.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_turn_message() {
        let message = ChatTurn::new().to_message();
        assert_eq!(message.role, "assistant");
        assert_eq!(message.content, "");
        assert!(message.thinking.is_none());
        assert!(message.tool_calls.is_none());
    }

    #[test]
    fn test_absorb_appends() {
        let mut turn = ChatTurn::new();
        turn.absorb(&fragment("", Some("A")));
        turn.absorb(&fragment("", Some("B")));
        turn.absorb(&fragment("X", None));
        turn.absorb(&fragment("Y", None));

        assert_eq!(turn.reasoning(), Some("AB"));
        assert_eq!(turn.content(), "XY");
    }

    #[test]
    fn test_tool_calls_keep_arrival_order() {
        let mut turn = ChatTurn::new();
        let mut first = fragment("", None);
        first.tool_calls = Some(vec![tool("a"), tool("b")]);
        let mut second = fragment("", None);
        second.tool_calls = Some(vec![tool("c")]);

        turn.absorb(&first);
        turn.absorb(&second);

        let names: Vec<_> = turn
            .tool_calls()
            .iter()
            .map(|c| c.function.name.as_str())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(turn.to_message().tool_calls.unwrap().len(), 3);
    }
}
