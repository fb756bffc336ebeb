//! Reassembly of streamed tool-call fragments into complete calls.

use std::collections::{BTreeMap, HashMap};

use tiein_shared::ToolCall;
use tracing::warn;

use crate::delta::ToolFragment;
use crate::error::GatewayError;

/// A call frozen at end of round. `defect` is set when fragments belonging to
/// it were lost, in which case it must not be executed.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatedCall {
    pub call: ToolCall,
    pub defect: Option<String>,
}

/// Round-scoped merge state. Calls are kept in the order their ids were
/// first seen; upstream `index` values are only used to reattach
/// continuations.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<AccumulatedCall>,
    slot_by_id: HashMap<String, usize>,
    slot_by_index: HashMap<u32, usize>,
    orphaned: BTreeMap<u32, usize>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one fragment. A continuation whose index has no call yet is
    /// reported as `MalformedDelta`; the call later opened at that index (if
    /// any) is marked defective instead of running on truncated arguments.
    pub fn apply(&mut self, fragment: ToolFragment) -> Result<(), GatewayError> {
        match fragment {
            ToolFragment::Opener {
                index,
                id,
                name,
                args_chunk,
            } => {
                if let Some(&slot) = self.slot_by_id.get(&id) {
                    if let Some(chunk) = args_chunk {
                        self.calls[slot].call.arguments.push_str(&chunk);
                    }
                    self.slot_by_index.insert(index, slot);
                    return Ok(());
                }

                let defect = self.orphaned.remove(&index).map(|lost| {
                    format!(
                        "{lost} argument fragment(s) for tool-call index {index} arrived before the call was opened"
                    )
                });
                let slot = self.calls.len();
                self.calls.push(AccumulatedCall {
                    call: ToolCall {
                        id: id.clone(),
                        name: name.unwrap_or_default(),
                        arguments: args_chunk.unwrap_or_default(),
                    },
                    defect,
                });
                self.slot_by_id.insert(id, slot);
                self.slot_by_index.insert(index, slot);
                Ok(())
            }
            ToolFragment::Continuation {
                index,
                name,
                args_chunk,
            } => {
                let Some(&slot) = self.slot_by_index.get(&index) else {
                    *self.orphaned.entry(index).or_default() += 1;
                    return Err(GatewayError::MalformedDelta { index });
                };
                let call = &mut self.calls[slot].call;
                if let Some(chunk) = args_chunk {
                    call.arguments.push_str(&chunk);
                }
                if let Some(name) = name.filter(|name| !name.is_empty()) {
                    call.name = name;
                }
                Ok(())
            }
        }
    }

    /// Freeze the round's calls in first-seen order.
    pub fn finish(self) -> Vec<AccumulatedCall> {
        for (index, lost) in &self.orphaned {
            warn!(
                index,
                lost, "Discarding continuation fragments for a tool call that was never opened"
            );
        }
        self.calls
    }
}
