//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Manager functions a simulator may call back into while stepping."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use cosim_logging::{sim_warn, LogContext};
use cosim_msg::{Call, RequestRouter};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SimManagerError};
use crate::graph::RelatedEntities;
use crate::types::{full_id, split_full_id, OutputData, OutputRequest, SimTime};
use crate::world::World;

/// `{src_full_id: {dest_full_id: {attr: value}}}` as passed to `set_data`.
pub type SetDataRequest = BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>;

/// Which part of the entity graph `get_related_entities` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityQuery {
    All,
    One(String),
    Many(Vec<String>),
}

impl EntityQuery {
    fn from_param(param: Option<&Value>) -> std::result::Result<Self, String> {
        match param {
            None | Some(Value::Null) => Ok(EntityQuery::All),
            Some(Value::String(id)) => Ok(EntityQuery::One(id.clone())),
            Some(Value::Array(ids)) => ids
                .iter()
                .map(|id| {
                    id.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| format!("entity ids must be strings, got {id}"))
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(EntityQuery::Many),
            Some(other) => Err(format!(
                "entities must be null, an id or a list of ids, got {other}"
            )),
        }
    }
}

/// Handle through which one simulator talks back to the manager.
///
/// In-process simulators receive it in `init`; for remote simulators it serves
/// the requests arriving on their connection.
#[derive(Clone)]
pub struct ManagerRemote {
    world: Weak<World>,
    sid: String,
}

impl fmt::Debug for ManagerRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerRemote")
            .field("sid", &self.sid)
            .finish()
    }
}

impl ManagerRemote {
    pub(crate) fn new(world: &Arc<World>, sid: impl Into<String>) -> Self {
        Self {
            world: Arc::downgrade(world),
            sid: sid.into(),
        }
    }

    /// Id of the simulator this handle belongs to.
    pub fn sid(&self) -> &str {
        &self.sid
    }

    fn world(&self) -> Result<Arc<World>> {
        self.world
            .upgrade()
            .ok_or_else(|| SimManagerError::runtime(&self.sid, "the simulation manager has shut down"))
    }

    /// Global progress of the simulation.
    pub fn get_progress(&self) -> Result<SimTime> {
        Ok(self.world()?.progress())
    }

    pub fn get_related_entities(&self, query: &EntityQuery) -> Result<RelatedEntities> {
        self.world()?.related_entities(query)
    }

    /// Fetch `{full_id: [attr]}` from other simulators, answering from the
    /// step cache where possible. Returns `{full_id: {attr: value}}`.
    pub async fn get_data(&self, attrs: &BTreeMap<String, Vec<String>>) -> Result<OutputData> {
        let world = self.world()?;
        let caller = world.sim(&self.sid)?;
        if !caller.is_in_step() {
            return Err(SimManagerError::runtime(
                &self.sid,
                "get_data() is only available during a step",
            ));
        }
        let last_step = caller.last_step();

        let mut data = OutputData::new();
        let mut missing: BTreeMap<String, OutputRequest> = BTreeMap::new();
        {
            let dataflow = world.dataflow.read();
            for (entity, attr_names) in attrs {
                let (sid, eid) = split_full_id(entity).ok_or_else(|| {
                    SimManagerError::config(&self.sid, format!("malformed entity id \"{entity}\""))
                })?;
                dataflow.assert_async_requests(sid, &self.sid)?;
                let values = data.entry(entity.clone()).or_default();
                for attr in attr_names {
                    match world.cached_value(last_step, sid, eid, attr) {
                        Some(value) => {
                            values.insert(attr.clone(), value);
                        }
                        None => missing
                            .entry(sid.to_owned())
                            .or_default()
                            .entry(eid.to_owned())
                            .or_default()
                            .push(attr.clone()),
                    }
                }
            }
        }

        for (sid, request) in missing {
            let source = world.sim(&sid)?;
            let (progress, source_last_step) = (source.progress(), source.last_step());
            if !(progress > last_step && last_step >= source_last_step) {
                return Err(SimManagerError::runtime(
                    &self.sid,
                    format!(
                        "scheduling invariant violated: \"{sid}\" has progress {progress} and last step \
                         {source_last_step}, but \"{}\" is at step {last_step}",
                        self.sid
                    ),
                ));
            }
            debug!(sim = %self.sid, source = %sid, entities = request.len(), "fetching data from source");
            let reply = source.get_data(&request).await?;
            for (eid, values) in reply.data {
                data.entry(full_id(&sid, &eid)).or_default().extend(values);
            }
        }
        Ok(data)
    }

    /// Buffer values for other simulators' next steps.
    ///
    /// Nothing is buffered unless every destination accepts the request.
    pub fn set_data(&self, request: &SetDataRequest) -> Result<()> {
        let world = self.world()?;
        let mut deliveries = Vec::new();
        {
            let dataflow = world.dataflow.read();
            for (src_full_id, destinations) in request {
                for (dest_full_id, values) in destinations {
                    let (sid, eid) = split_full_id(dest_full_id).ok_or_else(|| {
                        SimManagerError::config(
                            &self.sid,
                            format!("malformed entity id \"{dest_full_id}\""),
                        )
                    })?;
                    dataflow.assert_async_requests(sid, &self.sid)?;
                    deliveries.push((world.sim(sid)?, eid, src_full_id, values));
                }
            }
        }
        for (destination, eid, src_full_id, values) in deliveries {
            for (attr, value) in values {
                destination.buffer_input(eid, attr, src_full_id, value.clone());
            }
        }
        Ok(())
    }

    /// Request an extra step of this simulator at `event_time`.
    pub fn set_event(&self, event_time: SimTime) -> Result<()> {
        let world = self.world()?;
        if world.rt_factor().is_none() {
            return Err(SimManagerError::runtime(
                &self.sid,
                "set_event() is only available in real-time mode",
            ));
        }
        let until = world.until();
        if event_time < until {
            world.sim(&self.sid)?.push_event(event_time);
        } else {
            let ctx = LogContext::new().with_sim(&self.sid).with_step(event_time);
            sim_warn!(
                context = ctx,
                "event at {event_time} is not before the end of the simulation ({until}); discarded"
            );
        }
        Ok(())
    }
}

fn parse_param<T: serde::de::DeserializeOwned>(
    call: &Call,
    index: usize,
    name: &str,
) -> std::result::Result<T, String> {
    let value = call
        .param(index, name)
        .cloned()
        .ok_or_else(|| format!("{}() is missing argument \"{name}\"", call.method))?;
    serde_json::from_value(value).map_err(|err| format!("invalid argument \"{name}\": {err}"))
}

fn to_value<T: serde::Serialize>(value: T) -> std::result::Result<Value, String> {
    serde_json::to_value(value).map_err(|err| err.to_string())
}

#[async_trait]
impl RequestRouter for ManagerRemote {
    async fn dispatch(&self, call: Call) -> std::result::Result<Value, String> {
        match call.method.as_str() {
            "get_progress" => to_value(self.get_progress().map_err(|err| err.to_string())?),
            "get_related_entities" => {
                let query = EntityQuery::from_param(call.param(0, "entities"))?;
                to_value(self.get_related_entities(&query).map_err(|err| err.to_string())?)
            }
            "get_data" => {
                let attrs: BTreeMap<String, Vec<String>> = parse_param(&call, 0, "attrs")?;
                to_value(self.get_data(&attrs).await.map_err(|err| err.to_string())?)
            }
            "set_data" => {
                let request: SetDataRequest = parse_param(&call, 0, "data")?;
                self.set_data(&request).map_err(|err| err.to_string())?;
                Ok(Value::Null)
            }
            "set_event" => {
                let event_time: SimTime = parse_param(&call, 0, "event_time")?;
                self.set_event(event_time).map_err(|err| err.to_string())?;
                Ok(Value::Null)
            }
            other => Err(format!("unknown method \"{other}\"")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn entity_query_accepts_null_id_or_list() {
        assert_eq!(EntityQuery::from_param(None), Ok(EntityQuery::All));
        assert_eq!(EntityQuery::from_param(Some(&Value::Null)), Ok(EntityQuery::All));
        assert_eq!(
            EntityQuery::from_param(Some(&json!("Grid-0.n1"))),
            Ok(EntityQuery::One("Grid-0.n1".into()))
        );
        assert_eq!(
            EntityQuery::from_param(Some(&json!(["a.b", "c.d"]))),
            Ok(EntityQuery::Many(vec!["a.b".into(), "c.d".into()]))
        );
        assert!(EntityQuery::from_param(Some(&json!(3))).is_err());
        assert!(EntityQuery::from_param(Some(&json!(["a.b", 3]))).is_err());
    }

    #[test]
    fn missing_arguments_are_reported_by_name() {
        let err = parse_param::<SimTime>(&Call::new("set_event"), 0, "event_time").unwrap_err();
        assert!(err.contains("event_time"));
        let value: SimTime =
            parse_param(&Call::new("set_event").with_kwarg("event_time", 12), 0, "event_time")
                .unwrap();
        assert_eq!(value, 12);
    }
}
