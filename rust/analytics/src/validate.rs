//! Request validation: every token that ends up in SQL text is resolved here.
//!
//! Metric and dimension names must exist in the [`Catalog`]; the only free-form text
//! accepted is a single-column aggregate matching [`CUSTOM_AGGREGATE`]. Filter values are
//! turned into the [`FilterValue`] union so the compiler never inspects JSON shapes.

use crate::{
    catalog::{Catalog, ValueKind},
    query::{AnalyticsQueryRequest, FilterInput, OrderSpec},
    time::DateRange,
};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

const MAX_FILTER_LIST_VALUES: usize = 200;
const DATE_FROM_FILTER: &str = "data_venda_gte";
const DATE_TO_FILTER: &str = "data_venda_lte";

/// `FUNCTION(column) AS alias`, optionally `DISTINCT` and a table-qualified column.
static CUSTOM_AGGREGATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(SUM|AVG|COUNT|MIN|MAX)\((DISTINCT\s+)?([a-zA-Z_][a-zA-Z0-9_]*)(\.([a-zA-Z_][a-zA-Z0-9_]*))?\)\s+AS\s+([a-zA-Z_][a-zA-Z0-9_]*)$",
    )
    .expect("custom aggregate grammar is a valid regex")
});

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unknown metric '{0}'")]
    InvalidMetric(String),
    #[error("unknown dimension '{0}'")]
    InvalidDimension(String),
    #[error("unsupported filter field '{0}'")]
    InvalidFilterField(String),
    #[error("invalid value for filter '{field}': {reason}")]
    InvalidFilterValue { field: String, reason: String },
    #[error("cannot order by '{0}': not a selected column")]
    InvalidOrderField(String),
    #[error("invalid order direction '{0}' (expected asc or desc)")]
    InvalidOrderDirection(String),
    #[error("column '{0}' is selected more than once")]
    DuplicateColumn(String),
    #[error("at least one metric or dimension is required")]
    EmptySelection,
    #[error("limit {limit} outside 1..={max}")]
    LimitOutOfRange { limit: i64, max: i64 },
    #[error("offset must be non-negative, got {0}")]
    NegativeOffset(i64),
    #[error("invalid date range: {0}")]
    InvalidDateRange(String),
    #[error("{0}")]
    Malformed(String),
}

type Result<T> = std::result::Result<T, ValidationError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl ScalarValue {
    fn from_json(field: &str, kind: ValueKind, value: &Value) -> Result<Self> {
        if kind == ValueKind::Date {
            return match value {
                Value::String(raw) => parse_date(field, raw).map(ScalarValue::Date),
                _ => Err(invalid_value(field, "expected a YYYY-MM-DD string")),
            };
        }
        match value {
            Value::Bool(flag) => Ok(ScalarValue::Bool(*flag)),
            Value::Number(number) => match number.as_i64() {
                Some(int) => Ok(ScalarValue::Int(int)),
                None => number.as_f64().map(ScalarValue::Float).ok_or_else(|| {
                    invalid_value(field, format!("number {number} is out of range"))
                }),
            },
            Value::String(text) => Ok(ScalarValue::Text(text.clone())),
            Value::Null => Err(invalid_value(field, "null is not a filter value")),
            Value::Array(_) | Value::Object(_) => {
                Err(invalid_value(field, "expected a scalar value"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FilterValue {
    Equals(ScalarValue),
    In(Vec<ScalarValue>),
    Compare(CompareOp, ScalarValue),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterPredicate {
    pub field: String,
    pub value: FilterValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomAggregate {
    /// Validated text, emitted verbatim.
    pub text: String,
    pub alias: String,
    /// Table alias of a qualified column, if any.
    pub qualifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSelection {
    Catalog(String),
    Custom(CustomAggregate),
}

impl MetricSelection {
    pub fn output_name(&self) -> &str {
        match self {
            MetricSelection::Catalog(name) => name,
            MetricSelection::Custom(custom) => &custom.alias,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderTerm {
    pub field: String,
    pub direction: OrderDirection,
}

/// A request whose every token has been resolved against the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedQuery {
    pub dimensions: Vec<String>,
    pub metrics: Vec<MetricSelection>,
    pub filters: Vec<FilterPredicate>,
    pub date_range: Option<DateRange>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Canonical form of a request: trimmed, deduplicated tokens and date shortcut filters
/// lifted into `date_range`. Cache fingerprints are taken over this form.
pub fn normalize(mut request: AnalyticsQueryRequest) -> Result<AnalyticsQueryRequest> {
    request.metrics = dedup_tokens(request.metrics);
    request.dimensions = dedup_tokens(request.dimensions);

    let from = request.filters.remove(DATE_FROM_FILTER);
    let to = request.filters.remove(DATE_TO_FILTER);
    if request.date_range.is_none() && (from.is_some() || to.is_some()) {
        request.date_range = Some(DateRange {
            start_date: from.map(|v| shortcut_date(DATE_FROM_FILTER, v)).transpose()?,
            end_date: to.map(|v| shortcut_date(DATE_TO_FILTER, v)).transpose()?,
        });
    }

    Ok(request)
}

pub fn validate(
    catalog: &Catalog,
    request: &AnalyticsQueryRequest,
    max_limit: i64,
) -> Result<ValidatedQuery> {
    let mut dimensions = Vec::with_capacity(request.dimensions.len());
    for token in &request.dimensions {
        if catalog.dimension(token).is_none() {
            return Err(ValidationError::InvalidDimension(token.clone()));
        }
        if !dimensions.contains(token) {
            dimensions.push(token.clone());
        }
    }

    let mut metrics: Vec<MetricSelection> = Vec::with_capacity(request.metrics.len());
    for token in &request.metrics {
        let selection = resolve_metric(catalog, token)?;
        if !metrics.contains(&selection) {
            metrics.push(selection);
        }
    }

    if dimensions.is_empty() && metrics.is_empty() {
        return Err(ValidationError::EmptySelection);
    }

    let outputs: Vec<&str> = dimensions
        .iter()
        .map(String::as_str)
        .chain(metrics.iter().map(MetricSelection::output_name))
        .collect();
    for (idx, name) in outputs.iter().enumerate() {
        if outputs[..idx].iter().any(|seen| seen.eq_ignore_ascii_case(name)) {
            return Err(ValidationError::DuplicateColumn((*name).to_string()));
        }
    }

    let mut filters = Vec::new();
    for (field, input) in &request.filters {
        let kind = catalog
            .filter_field(field)
            .ok_or_else(|| ValidationError::InvalidFilterField(field.clone()))?
            .value_kind;
        for value in resolve_filter_value(field, kind, input)? {
            filters.push(FilterPredicate {
                field: field.clone(),
                value,
            });
        }
    }

    if let Some(range) = &request.date_range {
        range
            .check()
            .map_err(ValidationError::InvalidDateRange)?;
    }

    let order_by = request
        .order_by
        .iter()
        .flatten()
        .map(|spec| resolve_order(&outputs, spec))
        .collect::<Result<Vec<_>>>()?;

    if let Some(limit) = request.limit {
        if limit < 1 || limit > max_limit {
            return Err(ValidationError::LimitOutOfRange {
                limit,
                max: max_limit,
            });
        }
    }
    if let Some(offset) = request.offset {
        if offset < 0 {
            return Err(ValidationError::NegativeOffset(offset));
        }
    }

    Ok(ValidatedQuery {
        dimensions,
        metrics,
        filters,
        date_range: request.date_range.clone(),
        order_by,
        limit: request.limit,
        offset: request.offset,
    })
}

/// Checks a metric token against the catalog and the custom aggregate grammar.
pub fn resolve_metric(catalog: &Catalog, token: &str) -> Result<MetricSelection> {
    if catalog.metric(token).is_some() {
        return Ok(MetricSelection::Catalog(token.to_string()));
    }

    let trimmed = token.trim();
    let captures = CUSTOM_AGGREGATE
        .captures(trimmed)
        .ok_or_else(|| ValidationError::InvalidMetric(token.to_string()))?;

    let qualifier = captures
        .get(5)
        .and_then(|_| captures.get(3))
        .map(|m| m.as_str().to_ascii_lowercase());
    if let Some(alias) = &qualifier {
        if !catalog.knows_alias(alias) {
            return Err(ValidationError::InvalidMetric(token.to_string()));
        }
    }

    let alias = captures
        .get(6)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ValidationError::InvalidMetric(token.to_string()))?;

    Ok(MetricSelection::Custom(CustomAggregate {
        text: trimmed.to_string(),
        alias,
        qualifier,
    }))
}

fn resolve_filter_value(
    field: &str,
    kind: ValueKind,
    input: &FilterInput,
) -> Result<Vec<FilterValue>> {
    match input {
        FilterInput::List(items) => Ok(vec![FilterValue::In(scalar_list(field, kind, items)?)]),
        FilterInput::Operators(ops) => {
            if ops.is_empty() {
                return Err(invalid_value(field, "operator map is empty"));
            }
            ops.iter()
                .map(|(op, value)| resolve_operator(field, kind, op, value))
                .collect()
        }
        FilterInput::Scalar(value) => {
            Ok(vec![FilterValue::Equals(ScalarValue::from_json(field, kind, value)?)])
        }
    }
}

fn resolve_operator(field: &str, kind: ValueKind, op: &str, value: &Value) -> Result<FilterValue> {
    let scalar = || ScalarValue::from_json(field, kind, value);
    let compare = |cmp| Ok(FilterValue::Compare(cmp, scalar()?));
    match op.to_ascii_lowercase().as_str() {
        "eq" => Ok(FilterValue::Equals(scalar()?)),
        "in" => match value {
            Value::Array(items) => Ok(FilterValue::In(scalar_list(field, kind, items)?)),
            _ => Err(invalid_value(field, "operator 'in' expects a list")),
        },
        "gt" => compare(CompareOp::Gt),
        "gte" => compare(CompareOp::Gte),
        "lt" => compare(CompareOp::Lt),
        "lte" => compare(CompareOp::Lte),
        other => Err(invalid_value(field, format!("unsupported operator '{other}'"))),
    }
}

fn scalar_list(field: &str, kind: ValueKind, items: &[Value]) -> Result<Vec<ScalarValue>> {
    if items.len() > MAX_FILTER_LIST_VALUES {
        return Err(invalid_value(
            field,
            format!("list filters support at most {MAX_FILTER_LIST_VALUES} values"),
        ));
    }
    items
        .iter()
        .map(|item| ScalarValue::from_json(field, kind, item))
        .collect()
}

fn resolve_order(outputs: &[&str], spec: &OrderSpec) -> Result<OrderTerm> {
    let field = outputs
        .iter()
        .find(|name| name.eq_ignore_ascii_case(spec.field.trim()))
        .ok_or_else(|| ValidationError::InvalidOrderField(spec.field.clone()))?;

    let direction = match spec.direction.as_deref().map(str::trim) {
        None | Some("") => OrderDirection::Desc,
        Some(raw) if raw.eq_ignore_ascii_case("desc") => OrderDirection::Desc,
        Some(raw) if raw.eq_ignore_ascii_case("asc") => OrderDirection::Asc,
        Some(raw) => return Err(ValidationError::InvalidOrderDirection(raw.to_string())),
    };

    Ok(OrderTerm {
        field: (*field).to_string(),
        direction,
    })
}

fn dedup_tokens(tokens: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::with_capacity(tokens.len());
    for token in tokens {
        let token = token.trim().to_string();
        if !seen.contains(&token) {
            seen.push(token);
        }
    }
    seen
}

fn shortcut_date(field: &str, input: FilterInput) -> Result<NaiveDate> {
    let raw = match &input {
        FilterInput::Scalar(Value::String(raw)) => raw.as_str(),
        _ => return Err(invalid_value(field, "expected a YYYY-MM-DD string")),
    };
    parse_date(field, raw)
}

fn parse_date(field: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| invalid_value(field, format!("'{raw}' is not a YYYY-MM-DD date")))
}

fn invalid_value(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidFilterValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}
