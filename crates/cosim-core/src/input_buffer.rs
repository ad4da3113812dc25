//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Time-ordered buffer for inputs delivered at a later step."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use serde_json::Value;

use crate::types::{full_id, InputData, SimTime};

#[derive(Debug, Clone)]
struct TimedInput {
    time: SimTime,
    seq: u64,
    src_full_id: String,
    dest_eid: String,
    dest_attr: String,
    value: Value,
}

impl PartialEq for TimedInput {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimedInput {}

impl PartialOrd for TimedInput {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedInput {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

/// Inputs waiting for the step at which they become visible.
///
/// Entries leave in `(time, insertion order)` order, so a later write for the
/// same entity, attribute and source replaces an earlier one when drained.
#[derive(Debug, Default)]
pub struct TimedInputBuffer {
    queue: BinaryHeap<Reverse<TimedInput>>,
    next_seq: u64,
}

impl TimedInputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `value` from `src_sid.src_eid` for `dest_eid.dest_attr` at `time`.
    pub fn add(
        &mut self,
        time: SimTime,
        src_sid: &str,
        src_eid: &str,
        dest_eid: impl Into<String>,
        dest_attr: impl Into<String>,
        value: Value,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(TimedInput {
            time,
            seq,
            src_full_id: full_id(src_sid, src_eid),
            dest_eid: dest_eid.into(),
            dest_attr: dest_attr.into(),
            value,
        }));
    }

    /// Move every entry due at or before `step` into `inputs`.
    pub fn drain_up_to(&mut self, step: SimTime, inputs: &mut InputData) {
        while matches!(self.queue.peek(), Some(Reverse(entry)) if entry.time <= step) {
            let Some(Reverse(entry)) = self.queue.pop() else {
                break;
            };
            inputs
                .entry(entry.dest_eid)
                .or_default()
                .entry(entry.dest_attr)
                .or_default()
                .insert(entry.src_full_id, entry.value);
        }
    }

    /// Time of the earliest queued entry.
    pub fn next_time(&self) -> Option<SimTime> {
        self.queue.peek().map(|Reverse(entry)| entry.time)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> TimedInputBuffer {
        let mut buffer = TimedInputBuffer::new();
        buffer.add(10, "srcA", "x", "e1", "attr", json!(5));
        buffer.add(10, "srcB", "x", "e1", "attr", json!(9));
        buffer.add(5, "srcA", "x", "e1", "attr", json!(1));
        buffer
    }

    #[test]
    fn drains_everything_due_with_last_writer_per_source() {
        let mut buffer = sample();
        let mut inputs = InputData::new();
        buffer.drain_up_to(10, &mut inputs);

        assert_eq!(
            serde_json::to_value(&inputs).unwrap(),
            json!({"e1": {"attr": {"srcA.x": 5, "srcB.x": 9}}})
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn keeps_entries_that_are_not_due() {
        let mut buffer = sample();
        let mut inputs = InputData::new();
        buffer.drain_up_to(4, &mut inputs);

        assert!(inputs.is_empty());
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.next_time(), Some(5));

        buffer.drain_up_to(5, &mut inputs);
        assert_eq!(inputs["e1"]["attr"]["srcA.x"], json!(1));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn same_time_writes_keep_insertion_order() {
        let mut buffer = TimedInputBuffer::new();
        buffer.add(3, "srcA", "x", "e1", "attr", json!("first"));
        buffer.add(3, "srcA", "x", "e1", "attr", json!("second"));
        let mut inputs = InputData::new();
        buffer.drain_up_to(3, &mut inputs);
        assert_eq!(inputs["e1"]["attr"]["srcA.x"], json!("second"));
    }
}
