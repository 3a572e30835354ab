//! Whitelisted metrics, dimensions and filter columns over the sales schema.
//!
//! The catalog is built once at start-up and shared read-only. Every SQL fragment the
//! compiler emits for a named token comes from here; nothing supplied by a caller is
//! spliced into SQL except custom aggregates that passed the validator's grammar.

use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

pub const BASE_TABLE: &str = "sales";
pub const BASE_ALIAS: &str = "s";
/// Only completed sales participate in analytics.
pub const BASE_PREDICATE: &str = "s.sale_status_desc = 'COMPLETED'";
pub const SALE_DATE_EXPR: &str = "DATE(s.created_at)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    pub fn keyword(self) -> &'static str {
        match self {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
        }
    }
}

/// Value type a filter on a field is bound as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Bound by the JSON type of the value.
    #[default]
    Any,
    /// `YYYY-MM-DD` strings bound as `date`.
    Date,
}

/// Key pair linking a one-to-many join back to the sale: `outer IN (SELECT inner ...)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanOutKey {
    pub outer: String,
    pub inner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinSpec {
    pub table: String,
    pub alias: String,
    pub on_condition: String,
    pub kind: JoinKind,
    /// Alias this join's condition references, joined first.
    pub depends_on: Option<String>,
    /// Set when the join can match several rows per sale.
    pub fan_out: Option<FanOutKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricDefinition {
    pub name: String,
    pub sql_expression: String,
    pub required_join: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimensionDefinition {
    pub name: String,
    pub sql_expression: String,
    pub required_join: Option<String>,
    pub value_kind: ValueKind,
}

/// A raw sale column that may be filtered on but is not a grouping dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterColumn {
    pub name: String,
    pub sql_expression: String,
    pub required_join: Option<String>,
}

/// Resolution of a filter field name to the expression used in WHERE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef<'a> {
    pub sql_expression: &'a str,
    pub required_join: Option<&'a str>,
    pub value_kind: ValueKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate catalog entry '{0}'")]
    Duplicate(String),
    #[error("'{name}' requires unknown join alias '{alias}'")]
    UnknownJoin { name: String, alias: String },
    #[error("join alias '{0}' collides with the base table alias")]
    BaseAliasCollision(String),
    #[error("join dependency cycle through alias '{0}'")]
    Cycle(String),
}

#[derive(Debug, Clone)]
pub struct Catalog {
    metrics: Vec<MetricDefinition>,
    dimensions: Vec<DimensionDefinition>,
    filter_columns: Vec<FilterColumn>,
    joins: Vec<JoinSpec>,
}

impl Catalog {
    pub fn new(
        metrics: Vec<MetricDefinition>,
        dimensions: Vec<DimensionDefinition>,
        filter_columns: Vec<FilterColumn>,
        joins: Vec<JoinSpec>,
    ) -> Result<Self, CatalogError> {
        let catalog = Self {
            metrics,
            dimensions,
            filter_columns,
            joins,
        };
        catalog.check()?;
        Ok(catalog)
    }

    /// The restaurant sales catalog served by the analytics API.
    pub fn restaurant() -> Self {
        let joins = vec![
            join("channels", "ch", "s.channel_id = ch.id", JoinKind::Inner, None),
            join("stores", "st", "s.store_id = st.id", JoinKind::Inner, None),
            join("product_sales", "ps", "s.id = ps.sale_id", JoinKind::Inner, None)
                .fanning_out("s.id", "ps.sale_id"),
            join("products", "p", "ps.product_id = p.id", JoinKind::Inner, Some("ps")),
            join("categories", "cat", "p.category_id = cat.id", JoinKind::Inner, Some("p")),
            join("delivery_addresses", "da", "s.id = da.sale_id", JoinKind::Left, None),
            join("customers", "cu", "s.customer_id = cu.id", JoinKind::Left, None),
        ];

        let metrics = vec![
            metric("faturamento", "SUM(s.total_amount)", None),
            metric("ticket_medio", "AVG(s.total_amount)", None),
            metric("qtd_vendas", "COUNT(DISTINCT s.id)", None),
            metric("qtd_produtos", "SUM(ps.quantity)", Some("ps")),
            metric("tempo_medio_entrega", "AVG(s.delivery_seconds / 60.0)", None),
            metric(
                "p50_entrega",
                "PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY s.delivery_seconds / 60.0)",
                None,
            ),
            metric(
                "p90_entrega",
                "PERCENTILE_CONT(0.9) WITHIN GROUP (ORDER BY s.delivery_seconds / 60.0)",
                None,
            ),
            metric(
                "p95_entrega",
                "PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY s.delivery_seconds / 60.0)",
                None,
            ),
            metric("tempo_medio_preparo", "AVG(s.production_seconds / 60.0)", None),
            metric("clientes_unicos", "COUNT(DISTINCT s.customer_id)", None),
            metric("valor_total_desconto", "SUM(s.total_discount)", None),
            metric(
                "taxa_cancelamento",
                "SUM(CASE WHEN s.sale_status_desc = 'CANCELLED' THEN 1 ELSE 0 END) * 100.0 / COUNT(*)",
                None,
            ),
        ];

        let dimensions = vec![
            dimension("channel", "ch.name", Some("ch")),
            dimension("canal_venda", "ch.name", Some("ch")),
            dimension("store", "st.name", Some("st")),
            dimension("nome_loja", "st.name", Some("st")),
            dimension("store_id", "s.store_id", None),
            dimension("channel_id", "s.channel_id", None),
            dimension("data", SALE_DATE_EXPR, None).of_kind(ValueKind::Date),
            dimension("hora", "EXTRACT(HOUR FROM s.created_at)", None),
            dimension("dia_semana", "EXTRACT(DOW FROM s.created_at)", None),
            dimension("mes", "TO_CHAR(s.created_at, 'YYYY-MM')", None),
            dimension(
                "periodo_dia",
                "CASE WHEN EXTRACT(HOUR FROM s.created_at) BETWEEN 6 AND 11 THEN 'Manhã' \
                 WHEN EXTRACT(HOUR FROM s.created_at) BETWEEN 12 AND 17 THEN 'Tarde' \
                 WHEN EXTRACT(HOUR FROM s.created_at) BETWEEN 18 AND 23 THEN 'Noite' \
                 ELSE 'Madrugada' END",
                None,
            ),
            dimension("produto", "p.name", Some("p")),
            dimension("nome_produto", "p.name", Some("p")),
            dimension("categoria", "cat.name", Some("cat")),
            dimension("bairro", "da.neighborhood", Some("da")),
            dimension("cidade", "da.city", Some("da")),
            dimension("cliente", "COALESCE(cu.customer_name, s.customer_name)", Some("cu")),
        ];

        let filter_columns = vec![
            filter_column("total_amount", "s.total_amount"),
            filter_column("total_discount", "s.total_discount"),
            filter_column("customer_id", "s.customer_id"),
            filter_column("delivery_seconds", "s.delivery_seconds"),
            filter_column("production_seconds", "s.production_seconds"),
        ];

        Self {
            metrics,
            dimensions,
            filter_columns,
            joins,
        }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn dimension(&self, name: &str) -> Option<&DimensionDefinition> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn join(&self, alias: &str) -> Option<&JoinSpec> {
        self.joins.iter().find(|j| j.alias == alias)
    }

    /// Whether `alias` can be referenced by a qualified column in a custom aggregate.
    pub fn knows_alias(&self, alias: &str) -> bool {
        alias == BASE_ALIAS || self.join(alias).is_some()
    }

    /// Dimensions filter on their own expression; raw sale columns come after.
    pub fn filter_field(&self, name: &str) -> Option<FieldRef<'_>> {
        if let Some(dim) = self.dimension(name) {
            return Some(FieldRef {
                sql_expression: &dim.sql_expression,
                required_join: dim.required_join.as_deref(),
                value_kind: dim.value_kind,
            });
        }
        self.filter_columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| FieldRef {
                sql_expression: &c.sql_expression,
                required_join: c.required_join.as_deref(),
                value_kind: ValueKind::Any,
            })
    }

    /// Returns the joins needed to reach `alias`, dependencies first.
    pub fn join_chain(&self, alias: &str) -> Option<Vec<&JoinSpec>> {
        if alias == BASE_ALIAS {
            return Some(Vec::new());
        }

        let mut chain = Vec::new();
        let mut next = Some(alias);
        while let Some(current) = next {
            let spec = self.join(current)?;
            if chain.len() > self.joins.len() {
                return None;
            }
            chain.push(spec);
            next = spec.depends_on.as_deref();
        }
        chain.reverse();
        Some(chain)
    }

    fn check(&self) -> Result<(), CatalogError> {
        let mut aliases = HashSet::new();
        for spec in &self.joins {
            if spec.alias == BASE_ALIAS {
                return Err(CatalogError::BaseAliasCollision(spec.alias.clone()));
            }
            if !aliases.insert(spec.alias.as_str()) {
                return Err(CatalogError::Duplicate(spec.alias.clone()));
            }
        }

        for spec in &self.joins {
            if let Some(parent) = &spec.depends_on {
                if !aliases.contains(parent.as_str()) {
                    return Err(CatalogError::UnknownJoin {
                        name: spec.alias.clone(),
                        alias: parent.clone(),
                    });
                }
            }
            if self.join_chain(&spec.alias).is_none() {
                return Err(CatalogError::Cycle(spec.alias.clone()));
            }
        }

        let mut names = HashSet::new();
        let entries = self
            .metrics
            .iter()
            .map(|m| (&m.name, &m.required_join))
            .chain(self.dimensions.iter().map(|d| (&d.name, &d.required_join)));
        for (name, required) in entries {
            if !names.insert(name.as_str()) {
                return Err(CatalogError::Duplicate(name.clone()));
            }
            check_join_ref(&aliases, name, required)?;
        }

        for column in &self.filter_columns {
            if self.dimension(&column.name).is_some() {
                return Err(CatalogError::Duplicate(column.name.clone()));
            }
            check_join_ref(&aliases, &column.name, &column.required_join)?;
        }

        Ok(())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::restaurant()
    }
}

fn check_join_ref(
    aliases: &HashSet<&str>,
    name: &str,
    required: &Option<String>,
) -> Result<(), CatalogError> {
    match required {
        Some(alias) if !aliases.contains(alias.as_str()) => Err(CatalogError::UnknownJoin {
            name: name.to_string(),
            alias: alias.clone(),
        }),
        _ => Ok(()),
    }
}

fn join(
    table: &str,
    alias: &str,
    on_condition: &str,
    kind: JoinKind,
    depends_on: Option<&str>,
) -> JoinSpec {
    JoinSpec {
        table: table.to_string(),
        alias: alias.to_string(),
        on_condition: on_condition.to_string(),
        kind,
        depends_on: depends_on.map(str::to_string),
        fan_out: None,
    }
}

impl JoinSpec {
    fn fanning_out(mut self, outer: &str, inner: &str) -> Self {
        self.fan_out = Some(FanOutKey {
            outer: outer.to_string(),
            inner: inner.to_string(),
        });
        self
    }
}

fn metric(name: &str, sql_expression: &str, required_join: Option<&str>) -> MetricDefinition {
    MetricDefinition {
        name: name.to_string(),
        sql_expression: sql_expression.to_string(),
        required_join: required_join.map(str::to_string),
    }
}

fn dimension(
    name: &str,
    sql_expression: &str,
    required_join: Option<&str>,
) -> DimensionDefinition {
    DimensionDefinition {
        name: name.to_string(),
        sql_expression: sql_expression.to_string(),
        required_join: required_join.map(str::to_string),
        value_kind: ValueKind::Any,
    }
}

impl DimensionDefinition {
    fn of_kind(mut self, kind: ValueKind) -> Self {
        self.value_kind = kind;
        self
    }
}

fn filter_column(name: &str, sql_expression: &str) -> FilterColumn {
    FilterColumn {
        name: name.to_string(),
        sql_expression: sql_expression.to_string(),
        required_join: None,
    }
}
