//! Minimal SELECT tree and its renderer.
//!
//! Fragments stored in the tree are catalog SQL or validated custom aggregates. Values are
//! only ever held as [`BindParam`]s; [`SqlWriter`] assigns `$n` at the moment a value is
//! pushed, so the parameter list always lines up with the placeholders.

use super::BindParam;
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Aliased { expr: String, alias: String },
    Verbatim(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub keyword: &'static str,
    pub table: String,
    pub alias: String,
    pub on_condition: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Raw(String),
    Compare {
        expr: String,
        op: &'static str,
        value: BindParam,
    },
    InList {
        expr: String,
        values: Vec<BindParam>,
    },
    /// `outer IN (SELECT inner FROM table alias <joins> WHERE predicate)`.
    SemiJoin {
        outer: String,
        inner: String,
        table: String,
        alias: String,
        joins: Vec<JoinClause>,
        predicate: Box<Predicate>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: String,
    pub direction: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub columns: Vec<SelectItem>,
    pub from_table: String,
    pub from_alias: String,
    pub joins: Vec<JoinClause>,
    pub predicates: Vec<Predicate>,
    /// 1-based column ordinals.
    pub group_by: Vec<usize>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<BindParam>,
}

#[derive(Debug, Default)]
pub struct SqlWriter {
    sql: String,
    params: Vec<BindParam>,
}

impl SqlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_sql(&mut self, fragment: &str) {
        self.sql.push_str(fragment);
    }

    pub fn push_bind(&mut self, value: BindParam) {
        self.params.push(value);
        let _ = write!(self.sql, "${}", self.params.len());
    }

    pub fn finish(self) -> CompiledQuery {
        CompiledQuery {
            sql: self.sql,
            params: self.params,
        }
    }

    pub fn render(statement: &SelectStatement) -> CompiledQuery {
        let mut writer = Self::new();
        writer.write_statement(statement);
        writer.finish()
    }

    fn write_statement(&mut self, statement: &SelectStatement) {
        self.push_sql("SELECT ");
        for (idx, column) in statement.columns.iter().enumerate() {
            if idx > 0 {
                self.push_sql(", ");
            }
            match column {
                SelectItem::Aliased { expr, alias } => {
                    let _ = write!(self.sql, "{expr} AS {alias}");
                }
                SelectItem::Verbatim(text) => self.push_sql(text),
            }
        }

        let _ = write!(
            self.sql,
            "\nFROM {} {}",
            statement.from_table, statement.from_alias
        );
        for join in &statement.joins {
            let _ = write!(
                self.sql,
                "\n{} {} {} ON {}",
                join.keyword, join.table, join.alias, join.on_condition
            );
        }

        if !statement.predicates.is_empty() {
            self.push_sql("\nWHERE ");
            for (idx, predicate) in statement.predicates.iter().enumerate() {
                if idx > 0 {
                    self.push_sql(" AND ");
                }
                self.write_predicate(predicate);
            }
        }

        if !statement.group_by.is_empty() {
            let ordinals = statement
                .group_by
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(self.sql, "\nGROUP BY {ordinals}");
        }

        if !statement.order_by.is_empty() {
            let terms = statement
                .order_by
                .iter()
                .map(|item| format!("{} {}", item.expr, item.direction))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(self.sql, "\nORDER BY {terms}");
        }

        if let Some(limit) = statement.limit {
            let _ = write!(self.sql, "\nLIMIT {limit}");
        }
        if let Some(offset) = statement.offset.filter(|offset| *offset > 0) {
            let _ = write!(self.sql, "\nOFFSET {offset}");
        }
    }

    fn write_predicate(&mut self, predicate: &Predicate) {
        match predicate {
            Predicate::Raw(text) => self.push_sql(text),
            Predicate::Compare { expr, op, value } => {
                let _ = write!(self.sql, "{expr} {op} ");
                self.push_bind(value.clone());
            }
            Predicate::InList { values, .. } if values.is_empty() => self.push_sql("FALSE"),
            Predicate::InList { expr, values } => {
                let _ = write!(self.sql, "{expr} IN (");
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        self.push_sql(", ");
                    }
                    self.push_bind(value.clone());
                }
                self.push_sql(")");
            }
            Predicate::SemiJoin {
                outer,
                inner,
                table,
                alias,
                joins,
                predicate,
            } => {
                let _ = write!(self.sql, "{outer} IN (SELECT {inner} FROM {table} {alias}");
                for join in joins {
                    let _ = write!(
                        self.sql,
                        " {} {} {} ON {}",
                        join.keyword, join.table, join.alias, join.on_condition
                    );
                }
                self.push_sql(" WHERE ");
                self.write_predicate(predicate);
                self.push_sql(")");
            }
        }
    }
}

/// Highest `$n` placeholder referenced by `sql`.
pub fn max_dollar_placeholder(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }

        i += 1;
        if i >= bytes.len() || !bytes[i].is_ascii_digit() {
            continue;
        }

        let mut value = 0usize;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            value = value * 10 + (bytes[i] - b'0') as usize;
            i += 1;
        }

        max = max.max(value);
    }

    max
}
