use std::collections::HashMap;

use serde_json::{Map, Value};
use toolstream_common::ToolCall;
use tracing::{debug, warn};

use crate::delta::delta_object;

const PLACEHOLDER_IDS: [&str; 2] = ["", "unknown"];

/// Argument text or structure carried by one fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentPiece {
    Absent,
    Text(String),
    Structured(Map<String, Value>),
}

impl ArgumentPiece {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => ArgumentPiece::Absent,
            Some(Value::String(s)) if s.is_empty() => ArgumentPiece::Absent,
            Some(Value::String(s)) => ArgumentPiece::Text(s.clone()),
            Some(Value::Object(map)) => ArgumentPiece::Structured(map.clone()),
            Some(other) => ArgumentPiece::Text(other.to_string()),
        }
    }
}

/// One entry of a frame's `tool_calls` array.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallFragment {
    pub index: Option<u64>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: ArgumentPiece,
    /// Position inside the frame's array, used when neither id nor index is usable.
    pub position: usize,
}

impl ToolCallFragment {
    pub fn from_delta(delta: &Value, position: usize) -> Self {
        let function = delta.get("function");
        let field = |name: &str| function.and_then(|f| f.get(name)).or_else(|| delta.get(name));
        // some providers send the function name as a bare string
        let name = match function {
            Some(Value::String(name)) => Some(name.as_str()),
            _ => field("name").and_then(Value::as_str),
        };

        Self {
            index: delta.get("index").and_then(Value::as_u64),
            id: delta
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !PLACEHOLDER_IDS.contains(id))
                .map(str::to_string),
            name: name
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            arguments: ArgumentPiece::from_value(field("arguments")),
            position,
        }
    }
}

#[derive(Debug)]
struct Accumulator {
    key: String,
    id: Option<String>,
    name: Option<String>,
    /// Arrival sequence of the fragment that set `name`.
    name_seq: u64,
    pieces: Vec<(u64, ArgumentPiece)>,
}

impl Accumulator {
    fn new(key: String) -> Self {
        Self {
            key,
            id: None,
            name: None,
            name_seq: 0,
            pieces: Vec::new(),
        }
    }

    fn absorb(&mut self, seq: u64, fragment: ToolCallFragment) {
        if fragment.name.is_some() {
            self.name = fragment.name;
            self.name_seq = seq;
        }
        if self.id.is_none() {
            self.id = fragment.id;
        }
        if fragment.arguments != ArgumentPiece::Absent {
            self.pieces.push((seq, fragment.arguments));
        }
    }

    /// Fold `other` in, interleaving pieces by arrival sequence.
    fn fold(&mut self, other: Accumulator) {
        if other.name.is_some() && (self.name.is_none() || other.name_seq > self.name_seq) {
            self.name = other.name;
            self.name_seq = other.name_seq;
        }
        self.id = self.id.take().or(other.id);
        self.pieces.extend(other.pieces);
        self.pieces.sort_by_key(|(seq, _)| *seq);
    }
}

/// Reassembles tool calls from the fragments cached during one turn.
///
/// Accumulators keep their first-seen slot. Folding a provisional `index_<n>` accumulator
/// into a real-id one leaves a tombstone behind so slots never shift.
#[derive(Debug, Default)]
pub struct FragmentMerger {
    seq: u64,
    slots: Vec<Option<Accumulator>>,
    by_key: HashMap<String, usize>,
    index_owner: HashMap<u64, String>,
}

impl FragmentMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge every `tool_calls` entry of the cached frames, in arrival order.
    pub fn merge_frames(frames: &[Value]) -> Vec<ToolCall> {
        let mut merger = Self::new();
        for frame in frames {
            let Some(deltas) = delta_object(frame)
                .and_then(|d| d.get("tool_calls"))
                .and_then(Value::as_array)
            else {
                continue;
            };
            for (position, delta) in deltas.iter().enumerate() {
                merger.push(ToolCallFragment::from_delta(delta, position));
            }
        }
        merger.finish()
    }

    pub fn push(&mut self, fragment: ToolCallFragment) {
        let key = self.resolve_key(&fragment);
        let slot = match self.by_key.get(&key) {
            Some(&slot) => slot,
            None => {
                self.slots.push(Some(Accumulator::new(key.clone())));
                self.by_key.insert(key, self.slots.len() - 1);
                self.slots.len() - 1
            }
        };
        let seq = self.seq;
        self.seq += 1;
        if let Some(acc) = self.slots[slot].as_mut() {
            acc.absorb(seq, fragment);
        }
    }

    fn resolve_key(&mut self, fragment: &ToolCallFragment) -> String {
        match (&fragment.id, fragment.index) {
            (Some(id), Some(index)) => match self.index_owner.get(&index).cloned() {
                Some(owner) => {
                    if &owner != id {
                        debug!(index, owner = %owner, ignored = %id, "index already bound, keeping earlier id");
                    }
                    owner
                }
                None => {
                    self.index_owner.insert(index, id.clone());
                    self.promote(&format!("index_{index}"), id);
                    id.clone()
                }
            },
            (Some(id), None) => id.clone(),
            (None, Some(index)) => self
                .index_owner
                .get(&index)
                .cloned()
                .unwrap_or_else(|| format!("index_{index}")),
            (None, None) => format!("tool_{}", fragment.position),
        }
    }

    /// Move a provisional accumulator under its real id. When the real id already has an
    /// accumulator, the two are folded in arrival order and keep the earlier slot.
    fn promote(&mut self, provisional: &str, id: &str) {
        let Some(from) = self.by_key.remove(provisional) else {
            return;
        };
        let Some(mut moved) = self.slots[from].take() else {
            return;
        };
        moved.key = id.to_string();

        let slot = match self.by_key.get(id).copied() {
            None => from,
            Some(existing_slot) => {
                if let Some(existing) = self.slots[existing_slot].take() {
                    moved.fold(existing);
                }
                from.min(existing_slot)
            }
        };
        self.slots[slot] = Some(moved);
        self.by_key.insert(id.to_string(), slot);
    }

    /// Emit completed calls in first-seen order. Calls that never got a name are dropped.
    pub fn finish(self) -> Vec<ToolCall> {
        self.slots
            .into_iter()
            .flatten()
            .filter_map(|acc| {
                let Some(name) = acc.name else {
                    warn!(key = %acc.key, "dropping tool call without a function name");
                    return None;
                };
                let id = acc.id.unwrap_or(acc.key);
                let pieces = acc.pieces.into_iter().map(|(_, piece)| piece).collect();
                Some(ToolCall::new(id, name).with_arguments(materialize(pieces)))
            })
            .collect()
    }
}

/// Replay argument pieces in arrival order into a single argument map.
pub fn materialize(pieces: Vec<ArgumentPiece>) -> Map<String, Value> {
    let mut structured: Option<Map<String, Value>> = None;
    let mut pending = String::new();

    for piece in pieces {
        match piece {
            ArgumentPiece::Absent => {}
            ArgumentPiece::Text(text) => pending.push_str(&text),
            ArgumentPiece::Structured(map) => match structured.as_mut() {
                None => {
                    if pending.trim().is_empty() {
                        pending.clear();
                        structured = Some(map);
                    } else if let Some(mut base) = parse_object(&pending) {
                        pending.clear();
                        deep_merge(&mut base, map);
                        structured = Some(base);
                    } else {
                        structured = Some(map);
                    }
                }
                Some(base) => {
                    if let Some(tail) = parse_object(&pending) {
                        pending.clear();
                        deep_merge(base, tail);
                    }
                    deep_merge(base, map);
                }
            },
        }
    }

    match structured {
        None => {
            if pending.trim().is_empty() {
                return Map::new();
            }
            parse_object(&pending).unwrap_or_else(|| raw(pending))
        }
        Some(mut base) => {
            if !pending.trim().is_empty() {
                match parse_object(&pending) {
                    Some(tail) => deep_merge(&mut base, tail),
                    None => {
                        base.insert("raw".to_string(), Value::String(pending));
                    }
                }
            }
            base
        }
    }
}

/// Nested objects merge recursively; anything else in `source` replaces the target value.
pub fn deep_merge(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match value {
            Value::Object(incoming) => match target.get_mut(&key) {
                Some(Value::Object(existing)) => deep_merge(existing, incoming),
                _ => {
                    target.insert(key, Value::Object(incoming));
                }
            },
            value => {
                target.insert(key, value);
            }
        }
    }
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(map)) => Some(map),
        Ok(Value::Null) => Some(Map::new()),
        _ => None,
    }
}

fn raw(text: String) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("raw".to_string(), Value::String(text));
    map
}
