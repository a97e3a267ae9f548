// Query Model - Provider-neutral query plan
// A source type, an ordered filter chain, an optional projection, and an
// optional target-shard set. Providers translate this into their own dialect.

use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::strong_types::ShardId;
use crate::infrastructure::merge::SortDirection;

/// Comparison operator for a filter predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Substring match for strings, element match for arrays
    Contains,
}

/// One predicate in the filter chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl FilterPredicate {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Evaluate this predicate against a row. Missing fields never match.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(actual) = field_value(row, &self.field) else {
            return false;
        };
        match self.operator {
            FilterOperator::Eq => actual == &self.value,
            FilterOperator::Ne => actual != &self.value,
            FilterOperator::Lt => json_cmp(actual, &self.value) == Ordering::Less,
            FilterOperator::Lte => json_cmp(actual, &self.value) != Ordering::Greater,
            FilterOperator::Gt => json_cmp(actual, &self.value) == Ordering::Greater,
            FilterOperator::Gte => json_cmp(actual, &self.value) != Ordering::Less,
            FilterOperator::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
        }
    }
}

/// Look up a (possibly dotted) field path in a JSON row
pub(crate) fn field_value<'a>(row: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = row;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Total order over JSON scalars: null < bool < number < string < array < object.
/// Composite values compare by their serialized form, which is enough to make
/// the merge deterministic.
pub(crate) fn json_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Ordering key wrapper giving `serde_json::Value` a total order
#[derive(Debug, Clone)]
pub struct JsonOrderKey(pub Value);

impl JsonOrderKey {
    /// Extract the ordering key for `field` from a row; missing fields sort first
    pub fn extract(row: &Value, field: &str) -> Self {
        Self(field_value(row, field).cloned().unwrap_or(Value::Null))
    }
}

impl PartialEq for JsonOrderKey {
    fn eq(&self, other: &Self) -> bool {
        json_cmp(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for JsonOrderKey {}

impl PartialOrd for JsonOrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JsonOrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        json_cmp(&self.0, &other.0)
    }
}

/// Projection onto a subset of top-level fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projection {
    pub fields: Vec<String>,
}

impl Projection {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn apply(&self, row: &Value) -> Value {
        match row {
            Value::Object(map) => {
                let mut projected = serde_json::Map::new();
                for field in &self.fields {
                    if let Some(value) = map.get(field) {
                        projected.insert(field.clone(), value.clone());
                    }
                }
                Value::Object(projected)
            }
            other => other.clone(),
        }
    }
}

/// Requested per-shard result ordering, set by the executor when an ordered
/// merge strategy is in effect. Providers that declare the ordered-merge
/// capability must emit rows sorted accordingly.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// Provider-neutral query plan
#[derive(Debug, Clone)]
pub struct QueryModel {
    pub source_type: String,
    pub filters: Vec<FilterPredicate>,
    pub projection: Option<Projection>,
    /// `None` or empty = all registered shards
    pub target_shards: Option<Vec<ShardId>>,
    pub order_by: Option<OrderBy>,
}

impl QueryModel {
    pub fn new(source_type: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            filters: Vec::new(),
            projection: None,
            target_shards: None,
            order_by: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        self.filters.push(FilterPredicate::new(field, operator, value));
        self
    }

    pub fn project(mut self, fields: Vec<String>) -> Self {
        self.projection = Some(Projection::new(fields));
        self
    }

    /// Restrict execution to the given shards
    pub fn where_shards(mut self, shards: Vec<ShardId>) -> Self {
        self.target_shards = Some(shards);
        self
    }

    /// Restrict execution to a single shard
    pub fn where_shard(self, shard: ShardId) -> Self {
        self.where_shards(vec![shard])
    }

    pub(crate) fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    /// Apply the filter chain and projection to a row; `None` = filtered out
    pub fn evaluate(&self, row: &Value) -> Option<Value> {
        if self.filters.iter().all(|f| f.matches(row)) {
            Some(match &self.projection {
                Some(projection) => projection.apply(row),
                None => row.clone(),
            })
        } else {
            None
        }
    }
}

/// How per-shard streams are combined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Arrival-order interleave, no ordering promised
    Unordered,
    /// Globally ordered k-way merge by `field`
    Ordered {
        field: String,
        direction: SortDirection,
    },
}

impl MergeStrategy {
    pub fn tag(&self) -> &'static str {
        match self {
            MergeStrategy::Unordered => "unordered",
            MergeStrategy::Ordered { .. } => "ordered",
        }
    }
}

/// What happens when one shard fails mid-query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// First error cancels siblings and is re-raised
    FailFast,
    /// Per-shard errors are captured; the merged stream completes normally
    BestEffort,
}

impl FailureMode {
    pub fn tag(&self) -> &'static str {
        match self {
            FailureMode::FailFast => "fail-fast",
            FailureMode::BestEffort => "best-effort",
        }
    }
}

/// Execution options for the fan-out query executor
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Maximum shards queried concurrently; `None` = all at once
    pub concurrency: Option<usize>,
    /// Merge buffer capacity; `None` = unbounded
    pub channel_capacity: Option<usize>,
    pub per_shard_command_timeout: Option<Duration>,
    /// When false, sessions are cached and reused across queries
    pub dispose_session_per_query: bool,
    pub merge_strategy: MergeStrategy,
    pub failure_mode: FailureMode,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            channel_capacity: Some(256),
            per_shard_command_timeout: None,
            dispose_session_per_query: true,
            merge_strategy: MergeStrategy::Unordered,
            failure_mode: FailureMode::FailFast,
        }
    }
}
