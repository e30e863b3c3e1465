//! JSON commands understood by the document adapters.
//!
//! Document stores have no query text, so `execute_query` takes a small JSON
//! command instead. String values of the form `"$1"`, `"$2"`, ... are bound
//! from the query parameters before the command is decoded.
//!
//! ```rust
//! use serde_json::json;
//! use tenantdb_core::command::DocumentCommand;
//!
//! let cmd = DocumentCommand::parse(
//!     r#"{"op": "find", "collection": "users", "filter": {"email": "$1"}}"#,
//!     &[json!("ada@example.com")],
//! )
//! .unwrap();
//!
//! assert_eq!(cmd.collection(), "users");
//! ```
//!
//! Every field of a filter must match the document's field: plain values by
//! equality (a missing field equals `null`), operator objects such as
//! `{"$gte": 10}` by comparison. The in-process store only evaluates the
//! [`FILTER_OPERATORS`] and rejects the rest through [`check_filter`].

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{TenantError, TenantResult};
use crate::tenant::TenantScope;

/// A JSON document.
pub type Document = Map<String, Value>;

/// One command against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DocumentCommand {
    /// Insert documents.
    Insert {
        /// Target collection.
        collection: String,
        /// Documents to insert.
        documents: Vec<Document>,
    },
    /// Find documents matching a filter.
    Find {
        /// Target collection.
        collection: String,
        /// Equality filter.
        #[serde(default)]
        filter: Document,
        /// Maximum number of documents to return.
        #[serde(default)]
        limit: Option<u64>,
    },
    /// Set fields on every document matching a filter.
    Update {
        /// Target collection.
        collection: String,
        /// Equality filter.
        #[serde(default)]
        filter: Document,
        /// Fields to set.
        set: Document,
    },
    /// Delete every document matching a filter.
    Delete {
        /// Target collection.
        collection: String,
        /// Equality filter.
        #[serde(default)]
        filter: Document,
    },
    /// Count documents matching a filter.
    Count {
        /// Target collection.
        collection: String,
        /// Equality filter.
        #[serde(default)]
        filter: Document,
    },
    /// Distinct values of a field among documents matching a filter.
    Distinct {
        /// Target collection.
        collection: String,
        /// Field to collect.
        field: String,
        /// Equality filter.
        #[serde(default)]
        filter: Document,
    },
}

impl DocumentCommand {
    /// Decode a command, binding `"$n"` placeholders from `params`.
    pub fn parse(query: &str, params: &[Value]) -> TenantResult<Self> {
        let mut value: Value = serde_json::from_str(query).map_err(|e| {
            TenantError::invalid_query(format!("Document command is not valid JSON: {}", e))
        })?;
        bind_params(&mut value, params)?;
        serde_json::from_value(value).map_err(|e| {
            TenantError::invalid_query(format!("Unrecognized document command: {}", e))
                .with_suggestion("Commands look like {\"op\": \"find\", \"collection\": \"users\", \"filter\": {}}")
        })
    }

    /// The collection this command targets.
    pub fn collection(&self) -> &str {
        match self {
            Self::Insert { collection, .. }
            | Self::Find { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. }
            | Self::Count { collection, .. }
            | Self::Distinct { collection, .. } => collection,
        }
    }

    /// The operation name.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Find { .. } => "find",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Count { .. } => "count",
            Self::Distinct { .. } => "distinct",
        }
    }

    /// The filter, for commands that take one.
    pub fn filter(&self) -> Option<&Document> {
        match self {
            Self::Insert { .. } => None,
            Self::Find { filter, .. }
            | Self::Update { filter, .. }
            | Self::Delete { filter, .. }
            | Self::Count { filter, .. }
            | Self::Distinct { filter, .. } => Some(filter),
        }
    }

    /// Confine the command to `scope`'s tenant.
    ///
    /// Inserts are stamped with the tenant, filters gain the tenant equality
    /// and updates may not move a document to another tenant. Shared
    /// collections pass through unchanged.
    pub fn scoped(self, scope: &TenantScope) -> TenantResult<Self> {
        if scope.is_shared(self.collection()) {
            return Ok(self);
        }

        let column = scope.column();
        let tenant = Value::String(scope.tenant().to_string());

        Ok(match self {
            Self::Insert {
                collection,
                mut documents,
            } => {
                for doc in &mut documents {
                    claim(doc, column, &tenant, "inserted document")?;
                }
                Self::Insert {
                    collection,
                    documents,
                }
            }
            Self::Find {
                collection,
                mut filter,
                limit,
            } => {
                claim(&mut filter, column, &tenant, "filter")?;
                Self::Find {
                    collection,
                    filter,
                    limit,
                }
            }
            Self::Update {
                collection,
                mut filter,
                mut set,
            } => {
                claim(&mut filter, column, &tenant, "filter")?;
                if let Some(value) = set.remove(column) {
                    if value != tenant {
                        return Err(TenantError::invalid_query(format!(
                            "Updates cannot move documents out of tenant '{}'",
                            scope.tenant()
                        ))
                        .with_tenant(scope.tenant()));
                    }
                }
                Self::Update {
                    collection,
                    filter,
                    set,
                }
            }
            Self::Delete {
                collection,
                mut filter,
            } => {
                claim(&mut filter, column, &tenant, "filter")?;
                Self::Delete { collection, filter }
            }
            Self::Count {
                collection,
                mut filter,
            } => {
                claim(&mut filter, column, &tenant, "filter")?;
                Self::Count { collection, filter }
            }
            Self::Distinct {
                collection,
                field,
                mut filter,
            } => {
                claim(&mut filter, column, &tenant, "filter")?;
                Self::Distinct {
                    collection,
                    field,
                    filter,
                }
            }
        })
    }
}

/// Set `column` to `tenant` in `doc`, refusing a different explicit value.
fn claim(doc: &mut Document, column: &str, tenant: &Value, what: &str) -> TenantResult<()> {
    match doc.get(column) {
        Some(existing) if existing != tenant => Err(TenantError::invalid_query(format!(
            "The {} names {} = {} outside the current tenant",
            what, column, existing
        ))),
        _ => {
            doc.insert(column.to_string(), tenant.clone());
            Ok(())
        }
    }
}

/// Replace `"$n"` strings with `params[n - 1]`.
fn bind_params(value: &mut Value, params: &[Value]) -> TenantResult<()> {
    let placeholder = value
        .as_str()
        .and_then(|s| s.strip_prefix('$'))
        .and_then(|n| n.parse::<usize>().ok());
    if let Some(index) = placeholder {
        let param = index
            .checked_sub(1)
            .and_then(|i| params.get(i))
            .ok_or_else(|| {
                TenantError::invalid_query(format!(
                    "Placeholder ${} has no parameter ({} given)",
                    index,
                    params.len()
                ))
            })?;
        *value = param.clone();
        return Ok(());
    }

    match value {
        Value::Array(items) => items.iter_mut().try_for_each(|item| bind_params(item, params)),
        Value::Object(map) => map.values_mut().try_for_each(|item| bind_params(item, params)),
        _ => Ok(()),
    }
}

/// Field operators [`matches`] evaluates.
pub const FILTER_OPERATORS: &[&str] = &["$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists"];

/// Reject filters [`matches`] cannot evaluate the way MongoDB would.
pub fn check_filter(filter: &Document) -> TenantResult<()> {
    for (key, expected) in filter {
        if key.starts_with('$') {
            return Err(TenantError::invalid_query(format!(
                "Top-level filter operator '{}' is not supported by this store",
                key
            ))
            .with_suggestion("Combine conditions as fields of one filter document"));
        }
        let Some(operators) = operators(expected) else {
            continue;
        };
        for (op, arg) in operators {
            if !FILTER_OPERATORS.contains(&op.as_str()) {
                return Err(TenantError::invalid_query(format!(
                    "Filter operator '{}' on '{}' is not supported by this store",
                    op, key
                ))
                .with_help(format!("Supported operators: {}", FILTER_OPERATORS.join(", "))));
            }
            if matches!(op.as_str(), "$in" | "$nin") && !arg.is_array() {
                return Err(TenantError::invalid_query(format!("'{}' on '{}' needs an array", op, key)));
            }
        }
    }
    Ok(())
}

/// Check whether `doc` satisfies `filter`.
///
/// Plain values match by equality, a missing field matching `null`.
/// Objects with `$`-keys apply the [`FILTER_OPERATORS`]; run
/// [`check_filter`] first to reject anything else.
pub fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| {
        let actual = doc.get(key);
        match operators(expected) {
            Some(operators) => operators.iter().all(|(op, arg)| satisfies(actual, op, arg)),
            None => actual.unwrap_or(&Value::Null) == expected,
        }
    })
}

fn operators(value: &Value) -> Option<&Document> {
    match value {
        Value::Object(map) if map.keys().any(|key| key.starts_with('$')) => Some(map),
        _ => None,
    }
}

fn satisfies(actual: Option<&Value>, op: &str, arg: &Value) -> bool {
    let value = actual.unwrap_or(&Value::Null);
    let in_list = || arg.as_array().is_some_and(|items| items.contains(value));
    match op {
        "$eq" => value == arg,
        "$ne" => value != arg,
        "$gt" => compare(value, arg) == Some(Ordering::Greater),
        "$gte" => matches!(compare(value, arg), Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => compare(value, arg) == Some(Ordering::Less),
        "$lte" => matches!(compare(value, arg), Some(Ordering::Less | Ordering::Equal)),
        "$in" => in_list(),
        "$nin" => !in_list(),
        "$exists" => actual.is_some() == truthy(arg),
        _ => false,
    }
}

/// Order values of the same type; mixed types never compare.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantId;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn scope() -> TenantScope {
        let shared: HashSet<String> = ["plans".to_string()].into_iter().collect();
        TenantScope::new(TenantId::new("acme").unwrap(), "tenant_id").with_shared_tables(Arc::new(shared))
    }

    #[test]
    fn test_parse_binds_params() {
        let cmd = DocumentCommand::parse(
            r#"{"op": "update", "collection": "users", "filter": {"id": "$1"}, "set": {"tags": ["$2", "x"]}}"#,
            &[json!(7), json!("vip")],
        )
        .unwrap();

        assert_eq!(
            cmd,
            DocumentCommand::Update {
                collection: "users".into(),
                filter: doc(json!({"id": 7})),
                set: doc(json!({"tags": ["vip", "x"]})),
            }
        );
    }

    #[test]
    fn test_parse_leaves_operators_alone() {
        let cmd = DocumentCommand::parse(
            r#"{"op": "find", "collection": "users", "filter": {"name": "$set"}}"#,
            &[],
        )
        .unwrap();
        assert!(matches!(cmd, DocumentCommand::Find { ref filter, .. } if filter["name"] == "$set"));
    }

    #[test]
    fn test_parse_errors() {
        let missing = DocumentCommand::parse(r#"{"op": "find", "collection": "u", "filter": {"a": "$2"}}"#, &[json!(1)]);
        assert!(missing.unwrap_err().is_validation_error());

        let zero = DocumentCommand::parse(r#"{"op": "find", "collection": "u", "filter": {"a": "$0"}}"#, &[json!(1)]);
        assert!(zero.unwrap_err().is_validation_error());

        assert!(DocumentCommand::parse("SELECT 1", &[]).unwrap_err().is_validation_error());
        assert!(DocumentCommand::parse(r#"{"op": "upsert", "collection": "u"}"#, &[]).is_err());
    }

    #[test]
    fn test_scoped_insert_stamps_tenant() {
        let cmd = DocumentCommand::Insert {
            collection: "users".into(),
            documents: vec![doc(json!({"name": "ada"})), doc(json!({"name": "bob", "tenant_id": "acme"}))],
        };

        let DocumentCommand::Insert { documents, .. } = cmd.scoped(&scope()).unwrap() else {
            panic!("expected insert");
        };
        assert!(documents.iter().all(|d| d["tenant_id"] == "acme"));
    }

    #[test]
    fn test_scoped_insert_rejects_other_tenant() {
        let cmd = DocumentCommand::Insert {
            collection: "users".into(),
            documents: vec![doc(json!({"name": "eve", "tenant_id": "globex"}))],
        };
        assert!(cmd.scoped(&scope()).unwrap_err().is_validation_error());
    }

    #[test]
    fn test_scoped_filters() {
        let cmd = DocumentCommand::Find {
            collection: "users".into(),
            filter: doc(json!({"name": "ada"})),
            limit: None,
        };
        let DocumentCommand::Find { filter, .. } = cmd.scoped(&scope()).unwrap() else {
            panic!("expected find");
        };
        assert_eq!(filter, doc(json!({"name": "ada", "tenant_id": "acme"})));
    }

    #[test]
    fn test_scoped_update_cannot_move_tenant() {
        let cmd = DocumentCommand::Update {
            collection: "users".into(),
            filter: Document::new(),
            set: doc(json!({"tenant_id": "globex"})),
        };
        assert!(cmd.scoped(&scope()).unwrap_err().is_validation_error());

        let cmd = DocumentCommand::Update {
            collection: "users".into(),
            filter: Document::new(),
            set: doc(json!({"tenant_id": "acme", "name": "x"})),
        };
        let DocumentCommand::Update { set, .. } = cmd.scoped(&scope()).unwrap() else {
            panic!("expected update");
        };
        assert_eq!(set, doc(json!({"name": "x"})));
    }

    #[test]
    fn test_shared_collection_untouched() {
        let cmd = DocumentCommand::Find {
            collection: "plans".into(),
            filter: Document::new(),
            limit: Some(5),
        };
        assert_eq!(cmd.clone().scoped(&scope()).unwrap(), cmd);
    }

    #[test]
    fn test_matches() {
        let d = doc(json!({"a": 1, "b": "x"}));
        assert!(matches(&d, &doc(json!({"a": 1}))));
        assert!(matches(&d, &doc(json!({"c": null}))));
        assert!(!matches(&d, &doc(json!({"b": "y"}))));
        assert!(matches(&d, &Document::new()));
    }

    #[test]
    fn test_matches_operators() {
        let d = doc(json!({"total": 15, "status": "open", "note": null}));
        assert!(matches(&d, &doc(json!({"total": {"$gt": 10, "$lte": 15}}))));
        assert!(!matches(&d, &doc(json!({"total": {"$lt": 15}}))));
        assert!(matches(&d, &doc(json!({"status": {"$in": ["open", "held"]}}))));
        assert!(!matches(&d, &doc(json!({"status": {"$nin": ["open"]}}))));
        assert!(matches(&d, &doc(json!({"status": {"$ne": "closed"}}))));
        assert!(matches(&d, &doc(json!({"note": {"$exists": true}, "owner": {"$exists": false}}))));
        // Mixed types never compare.
        assert!(!matches(&d, &doc(json!({"status": {"$gt": 1}}))));
    }

    #[test]
    fn test_check_filter() {
        assert!(check_filter(&doc(json!({"total": {"$gte": 1}, "tags": {"$in": ["a"]}}))).is_ok());
        assert!(check_filter(&doc(json!({"address": {"city": "Oslo"}}))).is_ok());

        for bad in [
            json!({"$or": [{"a": 1}, {"b": 2}]}),
            json!({"name": {"$regex": "^a"}}),
            json!({"total": {"$gt": 1, "limit": 2}}),
            json!({"status": {"$in": "open"}}),
        ] {
            let err = check_filter(&doc(bad.clone())).unwrap_err();
            assert_eq!(err.code, crate::error::ErrorCode::InvalidQuery, "{}", bad);
        }
    }
}
