use crate::{
    config::TrimLimits,
    models::canonical::{CanonicalMessage, CanonicalRequest, ContentPart, Role},
};
use std::collections::HashSet;

/// Upper bound on trim passes; each pass must shed something or the loop
/// stops early.
const MAX_PASSES: usize = 12;

/// Shrink an oversized request to the configured limits.
///
/// The leading system prefix and the LAST user message survive every step;
/// the last user message may be truncated but never removed.
pub fn trim(req: &mut CanonicalRequest, limits: &TrimLimits) {
    for _ in 0..MAX_PASSES {
        if fits(req, limits) {
            return;
        }
        if !shed_one(req, limits) {
            break;
        }
    }

    if !fits(req, limits) {
        reset_to_minimal(req, limits);
    }
}

fn fits(req: &CanonicalRequest, limits: &TrimLimits) -> bool {
    turn_count(req) <= limits.max_turns
        && req.messages.len() <= limits.max_messages
        && req.char_count() <= limits.max_input_chars
}

/// User messages after the leading system prefix
fn turn_count(req: &CanonicalRequest) -> usize {
    req.messages
        .iter()
        .skip(system_prefix_len(req))
        .filter(|m| m.role == Role::User)
        .count()
}

fn system_prefix_len(req: &CanonicalRequest) -> usize {
    req.messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count()
}

/// One reduction step, strongest-preserving first. Returns false when
/// nothing further can be shed.
fn shed_one(req: &mut CanonicalRequest, limits: &TrimLimits) -> bool {
    if drop_oldest_turn(req) {
        return true;
    }
    if shrink_system_prefix(req, limits) {
        return true;
    }
    if drop_tail_non_user(req) {
        return true;
    }
    if truncate_longest_field(req, limits) {
        return true;
    }
    if !req.tools.is_empty() {
        req.tools.clear();
        req.tool_choice = None;
        return true;
    }
    false
}

/// Advance the window start to the next user message, dropping one turn.
/// The last user message is untouchable.
fn drop_oldest_turn(req: &mut CanonicalRequest) -> bool {
    let prefix = system_prefix_len(req);
    let user_indices: Vec<usize> = req
        .messages
        .iter()
        .enumerate()
        .skip(prefix)
        .filter(|(_, m)| m.role == Role::User)
        .map(|(i, _)| i)
        .collect();
    if user_indices.len() < 2 {
        return false;
    }
    let start = user_indices[0];
    let end = user_indices[1];
    req.messages.drain(start..end);
    true
}

/// Drop characters from the FRONT of the system prefix, keeping its tail.
fn shrink_system_prefix(req: &mut CanonicalRequest, limits: &TrimLimits) -> bool {
    let over_by = req
        .char_count()
        .saturating_sub(limits.max_input_chars);
    if over_by == 0 {
        return false;
    }
    let prefix = system_prefix_len(req);
    if prefix == 0 {
        return false;
    }
    let system = &mut req.messages[0];
    let text = system.joined_text();
    let len = text.chars().count();
    if len == 0 {
        return false;
    }
    let keep = len.saturating_sub(over_by);
    if keep == len {
        return false;
    }
    let tail: String = text.chars().skip(len - keep).collect();
    system.parts = vec![ContentPart::Text(tail)];
    true
}

/// Tail-drop messages after the latest user message.
fn drop_tail_non_user(req: &mut CanonicalRequest) -> bool {
    match req.last_user_index() {
        Some(last_user) if last_user + 1 < req.messages.len() => {
            req.messages.truncate(last_user + 1);
            true
        }
        _ => false,
    }
}

/// Truncate the single longest string field so the total fits, keeping the
/// field's tail. The largest surviving suffix is found by binary search.
fn truncate_longest_field(req: &mut CanonicalRequest, limits: &TrimLimits) -> bool {
    let total = req.char_count();
    let over_by = total.saturating_sub(limits.max_input_chars);
    if over_by == 0 {
        return false;
    }

    // locate the longest string field: (message, part index or tool call)
    let mut longest: Option<(usize, FieldRef, usize)> = None;
    for (mi, msg) in req.messages.iter().enumerate() {
        for (pi, part) in msg.parts.iter().enumerate() {
            if let ContentPart::Text(text) = part {
                let len = text.chars().count();
                if longest.as_ref().map(|(_, _, l)| len > *l).unwrap_or(true) {
                    longest = Some((mi, FieldRef::Part(pi), len));
                }
            }
        }
        for (ci, call) in msg.tool_calls.iter().enumerate() {
            let len = call.arguments.chars().count();
            if longest.as_ref().map(|(_, _, l)| len > *l).unwrap_or(true) {
                longest = Some((mi, FieldRef::Arguments(ci), len));
            }
        }
    }

    let (mi, field, len) = match longest {
        Some(found) if found.2 > 0 => found,
        _ => return false,
    };

    // binary-search the largest suffix of the field that still fits
    let others = total - len;
    let budget = limits.max_input_chars.saturating_sub(others);
    let mut lo = 0usize;
    let mut hi = len;
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if others + mid <= limits.max_input_chars {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    let keep = lo.min(budget).min(len);
    if keep == len {
        return false;
    }

    let msg = &mut req.messages[mi];
    match field {
        FieldRef::Part(pi) => {
            if let ContentPart::Text(text) = &msg.parts[pi] {
                let tail: String = text.chars().skip(len - keep).collect();
                msg.parts[pi] = ContentPart::Text(tail);
            }
        }
        FieldRef::Arguments(ci) => {
            let text = &msg.tool_calls[ci].arguments;
            let tail: String = text.chars().skip(len - keep).collect();
            msg.tool_calls[ci].arguments = tail;
        }
    }
    true
}

enum FieldRef {
    Part(usize),
    Arguments(usize),
}

/// Absolute last resort: only the latest user message survives, truncated
/// to the character budget.
fn reset_to_minimal(req: &mut CanonicalRequest, limits: &TrimLimits) {
    let last_user = match req.last_user_index() {
        Some(i) => req.messages.swap_remove(i),
        None => return,
    };
    let text = last_user.joined_text();
    let len = text.chars().count();
    let keep = len.min(limits.max_input_chars);
    let tail: String = text.chars().skip(len - keep).collect();

    req.messages = vec![CanonicalMessage::text(Role::User, tail)];
    req.tools.clear();
    req.tool_choice = None;
}

/// Drop unpaired tool items so upstreams never see a function_call_output
/// with no matching function_call (or vice versa).
///
/// `anchored` requests (previous_response_id / conversation) may carry
/// outputs whose calls live server-side, so their outputs survive.
pub fn sanitize_tool_pairs(req: &mut CanonicalRequest, anchored: bool) {
    let call_ids: HashSet<String> = req
        .messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|c| c.call_id.clone()))
        .collect();
    let output_ids: HashSet<String> = req
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect();

    for msg in &mut req.messages {
        msg.tool_calls
            .retain(|call| output_ids.contains(&call.call_id));
    }
    req.messages.retain(|msg| {
        if msg.role != Role::Tool {
            return !(msg.role == Role::Assistant
                && msg.parts.is_empty()
                && msg.tool_calls.is_empty()
                && msg.reasoning.is_none());
        }
        anchored
            || msg
                .tool_call_id
                .as_ref()
                .map(|id| call_ids.contains(id))
                .unwrap_or(false)
    });
}
