use crate::models::openai::Usage;

/// One dialect-neutral streaming event, produced by the upstream decoders
/// and consumed by the client-side encoders.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// The assistant role announcement (first chunk)
    Role,
    Content(String),
    Reasoning(String),
    /// A new suffix of one tool call's arguments. `call_id`/`name` are set
    /// on the slot's first delta only.
    ToolCall {
        index: usize,
        call_id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Finish {
        reason: String,
    },
    Usage(Usage),
}

/// Accumulator for one in-flight tool call
#[derive(Debug, Clone)]
pub struct ToolCallState {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
    /// Stable slot index: first-seen order, never reassigned
    pub index: usize,
    /// Gemini thought metadata captured alongside the call
    pub thought: Option<String>,
    pub thought_signature: Option<String>,
}

/// Mutable state threaded through one stream translation.
///
/// The pump owns exactly one of these per request; decoders update it and
/// derive deltas from it, encoders read identity fields from it.
#[derive(Debug, Default)]
pub struct StreamState {
    /// Upstream response id (for `previous_response_id` linkage)
    pub response_id: Option<String>,
    pub model: Option<String>,
    pub created: Option<u64>,
    pub role_sent: bool,
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallState>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub finished: bool,
    /// Claude block index -> tool slot, text, or thinking
    pub claude_blocks: std::collections::HashMap<u64, ClaudeBlockKind>,
    /// Chat-upstream tool_call index -> local slot
    pub index_map: std::collections::HashMap<u64, usize>,
    /// Signatures captured before their tool slots exist (synthesized path)
    pub pending_signatures: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClaudeBlockKind {
    Text,
    Thinking,
    Tool(usize),
}

impl StreamState {
    /// Find the slot for a call id, creating it in first-seen order.
    pub fn slot_for_call(&mut self, call_id: &str, name: Option<&str>) -> usize {
        if let Some(existing) = self.tool_calls.iter().position(|c| c.call_id == call_id) {
            if let Some(name) = name {
                if self.tool_calls[existing].name.is_empty() {
                    self.tool_calls[existing].name = name.to_string();
                }
            }
            return existing;
        }
        let index = self.tool_calls.len();
        self.tool_calls.push(ToolCallState {
            call_id: call_id.to_string(),
            name: name.unwrap_or_default().to_string(),
            arguments: String::new(),
            index,
            thought: None,
            thought_signature: None,
        });
        index
    }

    /// Append an arguments delta to a slot and build the matching event.
    /// The first event for a slot announces its id and name.
    pub fn push_arguments(&mut self, slot: usize, delta: &str) -> Option<StreamDelta> {
        if delta.is_empty() {
            return None;
        }
        let call = &mut self.tool_calls[slot];
        let first = call.arguments.is_empty();
        call.arguments.push_str(delta);
        Some(StreamDelta::ToolCall {
            index: slot,
            call_id: first.then(|| call.call_id.clone()),
            name: (first && !call.name.is_empty()).then(|| call.name.clone()),
            arguments: delta.to_string(),
        })
    }

    /// Reconcile a cumulative `done` arguments string against the slot's
    /// accumulator, emitting only the missing suffix.
    pub fn reconcile_arguments(&mut self, slot: usize, full: &str) -> Option<StreamDelta> {
        let buffered = self.tool_calls[slot].arguments.clone();
        let suffix = extension_suffix(&buffered, full)?;
        self.push_arguments(slot, &suffix)
    }

    /// Append a text delta, tracking the running buffer.
    pub fn push_text(&mut self, delta: &str) -> Option<StreamDelta> {
        if delta.is_empty() {
            return None;
        }
        self.text.push_str(delta);
        Some(StreamDelta::Content(delta.to_string()))
    }

    /// Reconcile a cumulative text against the buffer (see
    /// [`extension_suffix`]).
    pub fn reconcile_text(&mut self, full: &str) -> Option<StreamDelta> {
        let suffix = extension_suffix(&self.text, full)?;
        self.push_text(&suffix)
    }

    pub fn push_reasoning(&mut self, delta: &str) -> Option<StreamDelta> {
        if delta.is_empty() {
            return None;
        }
        self.reasoning.push_str(delta);
        Some(StreamDelta::Reasoning(delta.to_string()))
    }

    /// The finish reason this stream should report, honoring accumulated
    /// tool calls.
    pub fn computed_finish_reason(&self) -> String {
        if !self.tool_calls.is_empty() {
            return "tool_calls".to_string();
        }
        self.finish_reason.clone().unwrap_or_else(|| "stop".to_string())
    }
}

/// When an upstream emits both deltas and a cumulative `done` payload, only
/// the part extending the buffer may be emitted again. An empty buffer takes
/// the whole value; a non-extending value contributes nothing.
pub fn extension_suffix(buffered: &str, full: &str) -> Option<String> {
    if buffered.is_empty() {
        if full.is_empty() {
            return None;
        }
        return Some(full.to_string());
    }
    let suffix = full.strip_prefix(buffered)?;
    if suffix.is_empty() {
        None
    } else {
        Some(suffix.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_stability() {
        let mut state = StreamState::default();
        let a = state.slot_for_call("c1", Some("ping"));
        let b = state.slot_for_call("c2", Some("pong"));
        let again = state.slot_for_call("c1", None);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(again, 0);
    }

    #[test]
    fn test_first_arguments_delta_announces_call() {
        let mut state = StreamState::default();
        let slot = state.slot_for_call("c1", Some("ping"));
        let first = state.push_arguments(slot, "{\"x\"").unwrap();
        match first {
            StreamDelta::ToolCall { call_id, name, arguments, .. } => {
                assert_eq!(call_id.as_deref(), Some("c1"));
                assert_eq!(name.as_deref(), Some("ping"));
                assert_eq!(arguments, "{\"x\"");
            }
            other => panic!("unexpected delta {:?}", other),
        }
        let second = state.push_arguments(slot, ":1}").unwrap();
        match second {
            StreamDelta::ToolCall { call_id, name, arguments, .. } => {
                assert_eq!(call_id, None);
                assert_eq!(name, None);
                assert_eq!(arguments, ":1}");
            }
            other => panic!("unexpected delta {:?}", other),
        }
        assert_eq!(state.tool_calls[0].arguments, "{\"x\":1}");
    }

    #[test]
    fn test_reconcile_emits_only_missing_suffix() {
        let mut state = StreamState::default();
        let slot = state.slot_for_call("c1", Some("f"));
        state.push_arguments(slot, "{\"x\"");
        let delta = state.reconcile_arguments(slot, "{\"x\":1}").unwrap();
        match delta {
            StreamDelta::ToolCall { arguments, .. } => assert_eq!(arguments, ":1}"),
            other => panic!("unexpected delta {:?}", other),
        }
        // already complete: nothing more
        assert!(state.reconcile_arguments(slot, "{\"x\":1}").is_none());
        // non-extending value: nothing
        assert!(state.reconcile_arguments(slot, "{}").is_none());
    }

    #[test]
    fn test_text_done_without_deltas_takes_full_value() {
        let mut state = StreamState::default();
        let delta = state.reconcile_text("whole answer").unwrap();
        assert_eq!(delta, StreamDelta::Content("whole answer".to_string()));
    }

    #[test]
    fn test_computed_finish_reason() {
        let mut state = StreamState::default();
        assert_eq!(state.computed_finish_reason(), "stop");
        state.finish_reason = Some("length".to_string());
        assert_eq!(state.computed_finish_reason(), "length");
        state.slot_for_call("c1", None);
        assert_eq!(state.computed_finish_reason(), "tool_calls");
    }
}
