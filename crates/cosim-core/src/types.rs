//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Identifiers and data shapes exchanged with simulators."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use serde_json::Value;

/// Identifier of a started simulator, e.g. `PV-0`.
pub type SimId = String;

/// Integer simulated time. One unit equals the configured time resolution.
pub type SimTime = i64;

/// Keyword parameters forwarded to simulator calls.
pub type Params = serde_json::Map<String, Value>;

/// `eid → attr → value` as produced by a simulator.
pub type OutputData = BTreeMap<String, BTreeMap<String, Value>>;

/// `eid → attr → source full id → value` as delivered to a simulator.
pub type InputData = BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>;

/// `eid → [attr]` requested from a simulator.
pub type OutputRequest = BTreeMap<String, Vec<String>>;

/// Separator between simulator id and entity id in full ids.
pub const FULL_ID_SEP: char = '.';

/// Build the full id `sid.eid`.
pub fn full_id(sid: &str, eid: &str) -> String {
    format!("{sid}{FULL_ID_SEP}{eid}")
}

/// Split a full id at its first separator into `(sid, eid)`.
pub fn split_full_id(full_id: &str) -> Option<(&str, &str)> {
    full_id.split_once(FULL_ID_SEP)
}
