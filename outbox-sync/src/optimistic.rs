//! Optimistic response synthesis.

use crate::registry::CacheOperation;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Prefix of temporary ids minted for records not yet created on the backend.
pub const CLIENT_ID_PREFIX: &str = "client:";

/// Field flagging a locally synthesized result.
pub const OPTIMISTIC_FLAG: &str = "optimisticResponse";

/// Builds the result shown to the UI before the backend confirms a mutation:
/// the variables, tagged with the return type and an optimistic flag.
///
/// Inserts without an id get a temporary `client:<uuid>` id so the record can
/// be placed in cached lists right away.
pub fn create_optimistic_response(
    return_type: &str,
    variables: &Value,
    kind: CacheOperation,
    id_field: &str,
) -> Value {
    let mut response = Map::new();
    response.insert("__typename".to_string(), Value::String(return_type.to_string()));
    if let Some(fields) = variables.as_object() {
        for (k, v) in fields {
            response.insert(k.clone(), v.clone());
        }
    }

    let has_id = response.get(id_field).is_some_and(|v| !v.is_null());
    if kind == CacheOperation::Insert && !has_id {
        response.insert(
            id_field.to_string(),
            Value::String(format!("{CLIENT_ID_PREFIX}{}", Uuid::new_v4())),
        );
    }
    response.insert(OPTIMISTIC_FLAG.to_string(), Value::Bool(true));
    Value::Object(response)
}

/// True for ids minted by [`create_optimistic_response`].
pub fn is_client_id(id: &Value) -> bool {
    id.as_str().is_some_and(|s| s.starts_with(CLIENT_ID_PREFIX))
}
