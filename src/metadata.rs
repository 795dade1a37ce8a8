//! Bundle metadata (`metadata.yaml`)
//!
//! ```yaml
//! name: tcpconnect
//! description: Trace TCP connections
//! tracers:
//!   connections:
//!     mapName: events
//!     structName: event
//! ebpfParams:
//!   targ_pid:
//!     key: pid
//!     description: Only trace this pid
//!     type: uint32
//! ```

use crate::ebpf::collection::ConstValue;
use crate::{ProbekitError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tracers: BTreeMap<String, TracerInfo>,
    #[serde(default)]
    pub snapshotters: BTreeMap<String, SnapshotterInfo>,
    #[serde(default, rename = "ebpfParams")]
    pub ebpf_params: BTreeMap<String, EbpfParam>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracerInfo {
    pub map_name: String,
    pub struct_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotterInfo {
    pub struct_name: String,
}

/// Runtime constant exposed as a user parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EbpfParam {
    pub key: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
}

impl ParamType {
    pub fn parse(&self, key: &str, value: &str) -> Result<ConstValue> {
        fn num<T: FromStr>(key: &str, value: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value.trim().parse::<T>().map_err(|e| ProbekitError::InvalidParam {
                key: key.to_string(),
                value: value.to_string(),
                reason: e.to_string(),
            })
        }

        Ok(match self {
            ParamType::Bool => ConstValue::Bool(num(key, value)?),
            ParamType::Uint8 => ConstValue::U8(num(key, value)?),
            ParamType::Uint16 => ConstValue::U16(num(key, value)?),
            ParamType::Uint32 => ConstValue::U32(num(key, value)?),
            ParamType::Uint64 => ConstValue::U64(num(key, value)?),
            ParamType::Int8 => ConstValue::I8(num(key, value)?),
            ParamType::Int16 => ConstValue::I16(num(key, value)?),
            ParamType::Int32 => ConstValue::I32(num(key, value)?),
            ParamType::Int64 => ConstValue::I64(num(key, value)?),
        })
    }
}

impl BundleMetadata {
    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(data)?)
    }

    /// Tracer whose map carries the streaming output, the first by name
    pub fn tracer(&self) -> Option<(&str, &TracerInfo)> {
        self.tracers.iter().next().map(|(k, v)| (k.as_str(), v))
    }

    /// Struct describing one event record: the first tracer's, else the
    /// first snapshotter's
    pub fn event_struct_name(&self) -> Result<&str> {
        if let Some((_, tracer)) = self.tracer() {
            return Ok(&tracer.struct_name);
        }
        self.snapshotters
            .values()
            .next()
            .map(|s| s.struct_name.as_str())
            .ok_or(ProbekitError::NoEventSource)
    }

    /// Constant values for the parameters the user actually set.
    ///
    /// Parameters left unset keep the value compiled into the bundle.
    pub fn constants(&self, params: &BTreeMap<String, String>) -> Result<BTreeMap<String, ConstValue>> {
        let mut consts = BTreeMap::new();
        for (variable, param) in &self.ebpf_params {
            if let Some(value) = params.get(&param.key) {
                consts.insert(variable.clone(), param.param_type.parse(&param.key, value)?);
            }
        }

        for key in params.keys() {
            if !self.ebpf_params.values().any(|p| &p.key == key) {
                warn!("Parameter {:?} is not used by bundle {}", key, self.name);
            }
        }
        Ok(consts)
    }
}
