//! Turns a [`ValidatedQuery`] into a [`CompiledQuery`].

use super::{
    ast::{CompiledQuery, JoinClause, OrderItem, Predicate, SelectItem, SelectStatement, SqlWriter},
    BindParam,
};
use crate::{
    catalog::{Catalog, JoinSpec, BASE_ALIAS, BASE_PREDICATE, BASE_TABLE, SALE_DATE_EXPR},
    error::{Result, ServiceError},
    validate::{FilterValue, MetricSelection, ValidatedQuery},
};

pub fn compile(query: &ValidatedQuery, catalog: &Catalog) -> Result<CompiledQuery> {
    let mut joins = JoinPlanner::new(catalog);
    let mut columns = Vec::with_capacity(query.dimensions.len() + query.metrics.len());

    for name in &query.dimensions {
        let dimension = catalog
            .dimension(name)
            .ok_or_else(|| missing("dimension", name))?;
        joins.require(dimension.required_join.as_deref())?;
        columns.push(SelectItem::Aliased {
            expr: dimension.sql_expression.clone(),
            alias: dimension.name.clone(),
        });
    }

    for selection in &query.metrics {
        match selection {
            MetricSelection::Catalog(name) => {
                let metric = catalog.metric(name).ok_or_else(|| missing("metric", name))?;
                joins.require(metric.required_join.as_deref())?;
                columns.push(SelectItem::Aliased {
                    expr: metric.sql_expression.clone(),
                    alias: metric.name.clone(),
                });
            }
            MetricSelection::Custom(custom) => {
                joins.require(custom.qualifier.as_deref())?;
                columns.push(SelectItem::Verbatim(custom.text.clone()));
            }
        }
    }

    let mut predicates = vec![Predicate::Raw(BASE_PREDICATE.to_string())];
    if let Some(range) = &query.date_range {
        if let Some(start) = range.start_date {
            predicates.push(Predicate::Compare {
                expr: SALE_DATE_EXPR.to_string(),
                op: ">=",
                value: BindParam::Date(start),
            });
        }
        if let Some(end) = range.end_date {
            predicates.push(Predicate::Compare {
                expr: SALE_DATE_EXPR.to_string(),
                op: "<=",
                value: BindParam::Date(end),
            });
        }
    }

    for filter in &query.filters {
        let field = catalog
            .filter_field(&filter.field)
            .ok_or_else(|| missing("filter field", &filter.field))?;
        let expr = field.sql_expression.to_string();
        let predicate = match &filter.value {
            FilterValue::Equals(value) => Predicate::Compare {
                expr,
                op: "=",
                value: BindParam::from(value),
            },
            FilterValue::In(values) => Predicate::InList {
                expr,
                values: values.iter().map(BindParam::from).collect(),
            },
            FilterValue::Compare(op, value) => Predicate::Compare {
                expr,
                op: op.as_sql(),
                value: BindParam::from(value),
            },
        };
        predicates.push(joins.filter(field.required_join, predicate)?);
    }

    let statement = SelectStatement {
        columns,
        from_table: BASE_TABLE.to_string(),
        from_alias: BASE_ALIAS.to_string(),
        joins: joins.into_clauses(),
        predicates,
        group_by: (1..=query.dimensions.len()).collect(),
        order_by: query
            .order_by
            .iter()
            .map(|term| OrderItem {
                expr: term.field.clone(),
                direction: term.direction.as_sql(),
            })
            .collect(),
        limit: query.limit,
        offset: query.offset,
    };

    Ok(SqlWriter::render(&statement))
}

/// Ordered, alias-deduplicated join set. Joins are appended on first use and never reordered.
struct JoinPlanner<'a> {
    catalog: &'a Catalog,
    joins: Vec<&'a JoinSpec>,
}

impl<'a> JoinPlanner<'a> {
    fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            joins: Vec::new(),
        }
    }

    fn require(&mut self, alias: Option<&str>) -> Result<()> {
        let Some(alias) = alias else {
            return Ok(());
        };
        let chain = self
            .catalog
            .join_chain(alias)
            .ok_or_else(|| missing("join alias", alias))?;
        for spec in chain {
            if !self.joins.iter().any(|joined| joined.alias == spec.alias) {
                self.joins.push(spec);
            }
        }
        Ok(())
    }

    fn is_joined(&self, alias: &str) -> bool {
        self.joins.iter().any(|joined| joined.alias == alias)
    }

    /// Places a filter predicate. Joins that would multiply sale rows and are not already
    /// part of the query move into a semi-join on the sale key instead.
    fn filter(&mut self, alias: Option<&str>, predicate: Predicate) -> Result<Predicate> {
        let Some(alias) = alias else {
            return Ok(predicate);
        };
        let chain = self
            .catalog
            .join_chain(alias)
            .ok_or_else(|| missing("join alias", alias))?;
        let fanning = chain.iter().enumerate().find_map(|(idx, spec)| {
            spec.fan_out
                .as_ref()
                .filter(|_| !self.is_joined(&spec.alias))
                .map(|key| (idx, key))
        });
        let Some((start, key)) = fanning else {
            self.require(Some(alias))?;
            return Ok(predicate);
        };

        if let Some(parent) = start.checked_sub(1).map(|idx| chain[idx].alias.as_str()) {
            self.require(Some(parent))?;
        }
        let root = chain[start];
        Ok(Predicate::SemiJoin {
            outer: key.outer.clone(),
            inner: key.inner.clone(),
            table: root.table.clone(),
            alias: root.alias.clone(),
            joins: chain[start + 1..].iter().copied().map(clause).collect(),
            predicate: Box::new(predicate),
        })
    }

    fn into_clauses(self) -> Vec<JoinClause> {
        self.joins.into_iter().map(clause).collect()
    }
}

fn clause(spec: &JoinSpec) -> JoinClause {
    JoinClause {
        keyword: spec.kind.keyword(),
        table: spec.table.clone(),
        alias: spec.alias.clone(),
        on_condition: spec.on_condition.clone(),
    }
}

fn missing(kind: &str, name: &str) -> ServiceError {
    ServiceError::Compilation(format!("{kind} '{name}' is not in the catalog"))
}
