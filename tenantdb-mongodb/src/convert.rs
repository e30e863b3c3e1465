//! JSON to BSON and back.
//!
//! Commands arrive as JSON; results leave as relaxed extended JSON, so
//! ObjectIds read back as `{"$oid": "..."}` and dates as `{"$date": "..."}`.

use bson::{Bson, Document};
use serde_json::{Map, Value};

use crate::error::{MongoError, MongoResult};

/// Convert a JSON object to a BSON document.
pub fn to_document(map: &Map<String, Value>) -> MongoResult<Document> {
    Ok(bson::to_document(map)?)
}

/// Convert a JSON value to BSON.
pub fn to_bson(value: &Value) -> MongoResult<Bson> {
    Ok(bson::to_bson(value)?)
}

/// Convert a BSON document to a JSON object.
pub fn document_to_json(doc: Document) -> Value {
    Bson::Document(doc).into_relaxed_extjson()
}

/// Convert a BSON value to JSON.
pub fn bson_to_json(value: Bson) -> Value {
    value.into_relaxed_extjson()
}

/// Require `value` to be a JSON object.
pub fn expect_object<'v>(value: &'v Value, what: &str) -> MongoResult<&'v Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| MongoError::serialization(format!("{} must be a JSON object", what)))
}
