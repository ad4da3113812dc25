//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Validation and expansion of simulator capability descriptors."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
//! Capability descriptors ("meta") as announced by a simulator's `init` reply
//! and their validated form.
//!
//! Validation runs in a fixed order: API version, simulator type, per-model
//! expansion of trigger and persistent sets, and finally the name-collision
//! check against the reserved simulator methods.

use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::error::{Result, SimManagerError};

/// Methods every simulator implements; models and extra methods may not reuse them.
pub const RESERVED_METHODS: [&str; 4] = ["create", "setup_done", "step", "get_data"];

/// How a simulator advances in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimType {
    TimeBased,
    EventBased,
    Hybrid,
}

impl SimType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimType::TimeBased => "time-based",
            SimType::EventBased => "event-based",
            SimType::Hybrid => "hybrid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "time-based" => Some(SimType::TimeBased),
            "event-based" => Some(SimType::EventBased),
            "hybrid" => Some(SimType::Hybrid),
            _ => None,
        }
    }
}

impl fmt::Display for SimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `major.minor[.patch]` version of the simulator API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

/// API version implemented by this manager.
pub const SUPPORTED_API_VERSION: ApiVersion = ApiVersion::new(3, 2);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("version must be major.minor[.patch], got \"{0}\"")]
    Format(String),
    #[error("version parts must be integers, got \"{0}\"")]
    NotInteger(String),
    #[error("version {found} is not compatible with {supported}")]
    Incompatible {
        found: ApiVersion,
        supported: ApiVersion,
    },
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            patch: None,
        }
    }

    pub fn parse(value: &str) -> std::result::Result<Self, VersionError> {
        let parts: Vec<&str> = value.trim().split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(VersionError::Format(value.to_owned()));
        }
        let mut numbers = parts.iter().map(|part| {
            part.parse::<u32>()
                .map_err(|_| VersionError::NotInteger(value.to_owned()))
        });
        let major = numbers.next().transpose()?.unwrap_or_default();
        let minor = numbers.next().transpose()?.unwrap_or_default();
        let patch = numbers.next().transpose()?;
        Ok(Self {
            major,
            minor,
            patch,
        })
    }

    /// Same major version and a minor version no newer than `supported`.
    pub fn is_compatible_with(&self, supported: ApiVersion) -> bool {
        self.major == supported.major && self.minor <= supported.minor
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if let Some(patch) = self.patch {
            write!(f, ".{patch}")?;
        }
        Ok(())
    }
}

/// Parse `version` and check it against `supported`.
pub fn validate_api_version(
    version: &str,
    supported: ApiVersion,
) -> std::result::Result<ApiVersion, VersionError> {
    let found = ApiVersion::parse(version)?;
    if !found.is_compatible_with(supported) {
        return Err(VersionError::Incompatible { found, supported });
    }
    Ok(found)
}

/// Either a flag selecting all attributes or an explicit attribute list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrSelection {
    All(bool),
    Only(Vec<String>),
}

/// A model exactly as announced by the simulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawModelMeta {
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub attrs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any_inputs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<AttrSelection>,
    #[serde(rename = "non-trigger", default, skip_serializing_if = "Option::is_none")]
    pub non_trigger: Option<Vec<String>>,
    #[serde(rename = "non-persistent", default, skip_serializing_if = "Option::is_none")]
    pub non_persistent: Option<AttrSelection>,
}

/// A capability descriptor exactly as announced by the simulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMeta {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub sim_type: Option<String>,
    #[serde(default)]
    pub models: IndexMap<String, RawModelMeta>,
    #[serde(default)]
    pub extra_methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<Value>,
}

/// A validated model with its derived attribute sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelMeta {
    pub public: bool,
    pub params: Vec<String>,
    pub attrs: Vec<String>,
    pub any_inputs: bool,
    pub trigger: BTreeSet<String>,
    pub persistent: BTreeSet<String>,
}

/// A validated capability descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meta {
    #[serde(rename = "type")]
    pub sim_type: SimType,
    /// The simulator did not declare a type and predates typed descriptors.
    #[serde(skip)]
    pub legacy: bool,
    pub api_version: ApiVersion,
    pub models: IndexMap<String, ModelMeta>,
    pub extra_methods: Vec<String>,
}

impl Meta {
    /// Validate the descriptor returned by `init` of simulator `sid` started as `sim_name`.
    pub fn validate(raw: Value, sim_name: &str, sid: &str) -> Result<Self> {
        let raw: RawMeta = serde_json::from_value(raw).map_err(|err| {
            SimManagerError::config(sid, format!("malformed meta of \"{sim_name}\": {err}"))
        })?;
        Self::from_raw(&raw, sim_name, sid)
    }

    pub fn from_raw(raw: &RawMeta, sim_name: &str, sid: &str) -> Result<Self> {
        let version = match &raw.api_version {
            Some(Value::String(version)) => version.clone(),
            Some(Value::Number(version)) => version.to_string(),
            _ => {
                return Err(SimManagerError::config(
                    sid,
                    format!("\"{sim_name}\" did not declare an api_version"),
                ))
            }
        };
        let api_version = validate_api_version(&version, SUPPORTED_API_VERSION).map_err(|err| {
            SimManagerError::config(
                sid,
                format!("\"{sim_name}\" could not be started: invalid version \"{version}\": {err}"),
            )
        })?;

        let (sim_type, legacy) = type_check(raw.sim_type.as_deref(), sim_name, sid)?;

        let mut models = IndexMap::with_capacity(raw.models.len());
        for (model_name, model) in &raw.models {
            let expanded = expand_model(model_name, model, sim_type)
                .map_err(|reason| SimManagerError::config(sid, reason))?;
            models.insert(model_name.clone(), expanded);
        }

        let meta = Self {
            sim_type,
            legacy,
            api_version,
            models,
            extra_methods: raw.extra_methods.clone(),
        };
        meta.check_names(sid)?;
        Ok(meta)
    }

    pub fn model(&self, model: &str) -> Option<&ModelMeta> {
        self.models.get(model)
    }

    pub fn has_extra_method(&self, method: &str) -> bool {
        self.extra_methods.iter().any(|name| name == method)
    }

    /// Reject models and extra methods that shadow reserved or each other's names.
    pub fn check_names(&self, sid: &str) -> Result<()> {
        let mut illegal_models: Vec<&str> = self
            .models
            .keys()
            .map(String::as_str)
            .filter(|name| RESERVED_METHODS.contains(name))
            .collect();
        if !illegal_models.is_empty() {
            illegal_models.sort_unstable();
            return Err(SimManagerError::config(
                sid,
                format!(
                    "model names collide with reserved methods: {}",
                    illegal_models.join(", ")
                ),
            ));
        }

        let mut illegal_methods: Vec<&str> = self
            .extra_methods
            .iter()
            .map(String::as_str)
            .filter(|name| RESERVED_METHODS.contains(name) || self.models.contains_key(*name))
            .collect();
        if !illegal_methods.is_empty() {
            illegal_methods.sort_unstable();
            illegal_methods.dedup();
            return Err(SimManagerError::config(
                sid,
                format!(
                    "extra methods collide with model or reserved names: {}",
                    illegal_methods.join(", ")
                ),
            ));
        }
        Ok(())
    }
}

/// Resolve the declared simulator type. Returns the type and whether the
/// descriptor is a legacy one without a type.
pub fn type_check(declared: Option<&str>, sim_name: &str, sid: &str) -> Result<(SimType, bool)> {
    match declared {
        None => {
            warn!(
                sim = %sid,
                sim_name,
                "simulator did not declare a type; assuming time-based"
            );
            Ok((SimType::TimeBased, true))
        }
        Some(value) => SimType::parse(value).map(|kind| (kind, false)).ok_or_else(|| {
            SimManagerError::config(
                sid,
                format!(
                    "\"{sim_name}\" declares unknown type \"{value}\"; expected time-based, event-based or hybrid"
                ),
            )
        }),
    }
}

/// Derive the trigger and persistent sets of one model.
pub fn expand_model(
    model_name: &str,
    raw: &RawModelMeta,
    sim_type: SimType,
) -> std::result::Result<ModelMeta, String> {
    let attrs: BTreeSet<String> = raw.attrs.iter().cloned().collect();
    let non_trigger: BTreeSet<String> = raw.non_trigger.iter().flatten().cloned().collect();
    let explicit_trigger: BTreeSet<String> = match &raw.trigger {
        Some(AttrSelection::All(true)) => attrs.clone(),
        Some(AttrSelection::Only(list)) => list.iter().cloned().collect(),
        Some(AttrSelection::All(false)) | None => BTreeSet::new(),
    };

    let overlap: Vec<&str> = explicit_trigger
        .intersection(&non_trigger)
        .map(String::as_str)
        .collect();
    if !overlap.is_empty() {
        return Err(format!(
            "model \"{model_name}\": attributes cannot be both trigger and non-trigger: {}",
            overlap.join(", ")
        ));
    }

    let trigger = match (explicit_trigger.is_empty(), non_trigger.is_empty()) {
        (false, false) => {
            let union: BTreeSet<String> = explicit_trigger.union(&non_trigger).cloned().collect();
            if union != attrs {
                return Err(format!(
                    "model \"{model_name}\": trigger and non-trigger must be a disjoint split of attrs"
                ));
            }
            explicit_trigger
        }
        (false, true) => {
            if !explicit_trigger.is_subset(&attrs) {
                return Err(format!(
                    "model \"{model_name}\": trigger attributes must be a subset of attrs"
                ));
            }
            explicit_trigger
        }
        (true, false) => attrs.difference(&non_trigger).cloned().collect(),
        (true, true) if sim_type == SimType::EventBased => attrs.clone(),
        (true, true) => BTreeSet::new(),
    };

    let persistent = match sim_type {
        SimType::TimeBased => attrs.clone(),
        SimType::EventBased => BTreeSet::new(),
        SimType::Hybrid => match &raw.non_persistent {
            Some(AttrSelection::All(true)) => BTreeSet::new(),
            Some(AttrSelection::Only(list)) => {
                let excluded: BTreeSet<&String> = list.iter().collect();
                attrs.iter().filter(|attr| !excluded.contains(attr)).cloned().collect()
            }
            Some(AttrSelection::All(false)) | None => attrs.clone(),
        },
    };

    Ok(ModelMeta {
        public: raw.public,
        params: raw.params.clone(),
        attrs: raw.attrs.clone(),
        any_inputs: raw.any_inputs.unwrap_or(false),
        trigger,
        persistent,
    })
}
