//! Classification of output objects into typed results.

use super::model::AutodetectResult;
use crate::error::ResultParseError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Turn one JSON object into a typed result.
///
/// The first distinguishing key found decides the kind, checked in this
/// order: `flush`, `quantileState`, `modelBytes`, `categoryDefinition`,
/// `snapshotId`, `debugFeature`, `influencerFieldName` together with
/// `timestamp`, then `timestamp` alone for buckets.
pub fn classify(value: Value) -> Result<AutodetectResult, ResultParseError> {
    let map = match value {
        Value::Object(map) => map,
        Value::Array(_) => return Err(ResultParseError::NotAnObject("an array")),
        Value::String(_) => return Err(ResultParseError::NotAnObject("a string")),
        Value::Number(_) => return Err(ResultParseError::NotAnObject("a number")),
        Value::Bool(_) => return Err(ResultParseError::NotAnObject("a boolean")),
        Value::Null => return Err(ResultParseError::NotAnObject("null")),
    };
    if map.is_empty() {
        return Err(ResultParseError::EmptyObject);
    }

    if map.contains_key("flush") {
        convert(map, "flush acknowledgement").map(AutodetectResult::FlushAcknowledgement)
    } else if map.contains_key("quantileState") {
        convert(map, "quantiles").map(AutodetectResult::Quantiles)
    } else if map.contains_key("modelBytes") {
        convert(map, "model size stats").map(AutodetectResult::ModelSizeStats)
    } else if map.contains_key("categoryDefinition") {
        convert(map, "category definition").map(AutodetectResult::CategoryDefinition)
    } else if map.contains_key("snapshotId") {
        convert(map, "model snapshot").map(AutodetectResult::ModelSnapshot)
    } else if map.contains_key("debugFeature") {
        convert(map, "model debug output").map(AutodetectResult::ModelDebugOutput)
    } else if map.contains_key("influencerFieldName") && map.contains_key("timestamp") {
        convert(map, "influencer").map(AutodetectResult::Influencer)
    } else if map.contains_key("timestamp") {
        convert(map, "bucket").map(AutodetectResult::Bucket)
    } else {
        let first = map.keys().next().cloned().unwrap_or_default();
        Err(ResultParseError::UnknownObject(first))
    }
}

fn convert<T: DeserializeOwned>(
    map: Map<String, Value>,
    kind: &'static str,
) -> Result<T, ResultParseError> {
    serde_json::from_value(Value::Object(map))
        .map_err(|source| ResultParseError::InvalidField { kind, source })
}
