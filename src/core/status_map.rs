// JSON converter for the holdings status map column.
use std::collections::BTreeMap;

use crate::core::error::Error;

/// Holding counts per status category.
pub type StatusMap = BTreeMap<String, i32>;

pub fn marshal(map: &StatusMap) -> Result<String, Error> {
    Ok(serde_json::to_string(map)?)
}

pub fn unmarshal(text: &str) -> Result<StatusMap, Error> {
    Ok(serde_json::from_str(text)?)
}

pub(crate) fn marshal_column(map: Option<&StatusMap>) -> Result<Option<String>, Error> {
    map.map(marshal).transpose()
}

pub(crate) fn unmarshal_column(text: Option<&str>) -> Result<Option<StatusMap>, Error> {
    text.map(unmarshal).transpose()
}
