//! Message sanitizer
//!
//! Strips tool calls that were started but never resolved, so the history
//! sent to the model always pairs each call with exactly one result.
//! Pure function, no I/O.

use crate::models::{Message, MessagePart};
use std::collections::{HashMap, HashSet};
use tracing::debug;

type Position = (usize, usize);

/// Remove unpaired tool calls and results from a message list.
///
/// A tool call is kept iff a `tool-result` with the same id appears after it
/// (in the same message or a later one). Results are kept only for kept calls,
/// first match wins. Messages left without parts are dropped. Relative order
/// of everything retained is preserved.
pub fn sanitize_messages(messages: &[Message]) -> Vec<Message> {
    // First call position per id; later duplicates are malformed.
    let mut call_positions: HashMap<&str, Position> = HashMap::new();
    // Every result position per id, in encounter order.
    let mut result_positions: HashMap<&str, Vec<Position>> = HashMap::new();

    for (i, message) in messages.iter().enumerate() {
        for (j, part) in message.parts.iter().enumerate() {
            match part {
                MessagePart::ToolCall(call) => {
                    call_positions
                        .entry(call.tool_call_id.as_str())
                        .or_insert((i, j));
                }
                MessagePart::ToolResult(result) => {
                    result_positions
                        .entry(result.tool_call_id.as_str())
                        .or_default()
                        .push((i, j));
                }
                MessagePart::Text { .. } => {}
            }
        }
    }

    // Pair each call with the first result that follows it.
    let mut kept: HashSet<Position> = HashSet::new();
    for (id, call_pos) in &call_positions {
        let paired = result_positions
            .get(id)
            .and_then(|positions| positions.iter().find(|pos| **pos > *call_pos));

        match paired {
            Some(result_pos) => {
                kept.insert(*call_pos);
                kept.insert(*result_pos);
            }
            None => debug!(tool_call_id = %id, "Dropping unresolved tool call"),
        }
    }

    messages
        .iter()
        .enumerate()
        .filter_map(|(i, message)| {
            let parts: Vec<MessagePart> = message
                .parts
                .iter()
                .enumerate()
                .filter(|(j, part)| match part {
                    MessagePart::Text { .. } => true,
                    _ => kept.contains(&(i, *j)),
                })
                .map(|(_, part)| part.clone())
                .collect();

            if parts.is_empty() {
                debug!(message_id = %message.id, "Dropping empty message");
                return None;
            }

            Some(Message {
                parts,
                ..message.clone()
            })
        })
        .collect()
}
