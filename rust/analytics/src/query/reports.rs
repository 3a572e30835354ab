//! Fixed report queries: the KPI dashboard and period comparison.
//!
//! Both evaluate one aggregate row over completed sales. Channel, store and product filters
//! are applied as subquery membership so a product filter never multiplies sale rows.

use super::{
    ast::{CompiledQuery, SqlWriter},
    BindParam,
};
use crate::{
    catalog::{BASE_PREDICATE, SALE_DATE_EXPR},
    error::{Result, ServiceError},
    models::{round_to, KpiCard, KpiFormat, MetricComparison, Row},
    time::{DateRange, Period},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const AGGREGATE_SELECT: &str = "SELECT\n    \
    SUM(s.total_amount) AS faturamento_total,\n    \
    AVG(s.total_amount) AS ticket_medio,\n    \
    COUNT(DISTINCT s.id) AS total_vendas,\n    \
    COUNT(DISTINCT s.customer_id) FILTER (WHERE s.customer_id IS NOT NULL) AS clientes_unicos,\n    \
    AVG(s.delivery_seconds / 60.0) FILTER (WHERE s.delivery_seconds IS NOT NULL) AS tempo_medio_entrega_min,\n    \
    AVG(s.production_seconds / 60.0) FILTER (WHERE s.production_seconds IS NOT NULL) AS tempo_medio_preparo_min";

const CHANNEL_MEMBERSHIP: (&str, &str) = ("s.channel_id", "SELECT ch.id FROM channels ch WHERE ch.name");
const STORE_MEMBERSHIP: (&str, &str) = ("s.store_id", "SELECT st.id FROM stores st WHERE st.name");
const PRODUCT_MEMBERSHIP: (&str, &str) = (
    "s.id",
    "SELECT ps.sale_id FROM product_sales ps JOIN products p ON ps.product_id = p.id WHERE p.name",
);

const COMPARED_METRICS: [(&str, &str); 5] = [
    ("faturamento_total", "Faturamento Total"),
    ("ticket_medio", "Ticket Médio"),
    ("total_vendas", "Total de Vendas"),
    ("clientes_unicos", "Clientes Únicos"),
    ("tempo_medio_entrega_min", "Tempo Médio de Entrega (min)"),
];

/// Names of channels, stores and products a report is restricted to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReportFilters {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub stores: Vec<String>,
    #[serde(default)]
    pub products: Vec<String>,
}

/// Query string of `GET /kpis`; list filters arrive comma separated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KpiParams {
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub channels: Option<String>,
    #[serde(default)]
    pub stores: Option<String>,
    #[serde(default)]
    pub products: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KpiRequest {
    pub date_range: DateRange,
    pub filters: ReportFilters,
}

impl KpiParams {
    pub fn into_request(self) -> Result<KpiRequest> {
        let date_range = DateRange::new(self.start_date, self.end_date);
        date_range.check().map_err(ServiceError::invalid)?;
        Ok(KpiRequest {
            date_range,
            filters: ReportFilters {
                channels: split_csv(self.channels.as_deref()),
                stores: split_csv(self.stores.as_deref()),
                products: split_csv(self.products.as_deref()),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ComparisonRequest {
    pub base_start: NaiveDate,
    pub base_end: NaiveDate,
    pub compare_start: NaiveDate,
    pub compare_end: NaiveDate,
    #[serde(flatten)]
    pub filters: ReportFilters,
}

impl ComparisonRequest {
    pub fn periods(&self) -> Result<(Period, Period)> {
        let base = Period::new(self.base_start, self.base_end).map_err(ServiceError::invalid)?;
        let compare =
            Period::new(self.compare_start, self.compare_end).map_err(ServiceError::invalid)?;
        Ok((base, compare))
    }
}

pub fn aggregate_query(range: &DateRange, filters: &ReportFilters) -> CompiledQuery {
    let mut writer = SqlWriter::new();
    writer.push_sql(AGGREGATE_SELECT);
    writer.push_sql("\nFROM sales s\nWHERE ");
    writer.push_sql(BASE_PREDICATE);

    if let Some(start) = range.start_date {
        writer.push_sql(&format!("\n  AND {SALE_DATE_EXPR} >= "));
        writer.push_bind(BindParam::Date(start));
    }
    if let Some(end) = range.end_date {
        writer.push_sql(&format!("\n  AND {SALE_DATE_EXPR} <= "));
        writer.push_bind(BindParam::Date(end));
    }

    push_membership(&mut writer, CHANNEL_MEMBERSHIP, &filters.channels);
    push_membership(&mut writer, STORE_MEMBERSHIP, &filters.stores);
    push_membership(&mut writer, PRODUCT_MEMBERSHIP, &filters.products);

    writer.finish()
}

fn push_membership(writer: &mut SqlWriter, (column, subquery): (&str, &str), names: &[String]) {
    if names.is_empty() {
        return;
    }
    writer.push_sql(&format!("\n  AND {column} IN ({subquery} IN ("));
    for (idx, name) in names.iter().enumerate() {
        if idx > 0 {
            writer.push_sql(", ");
        }
        writer.push_bind(BindParam::Text(name.clone()));
    }
    writer.push_sql("))");
}

pub fn kpi_cards(row: Option<&Row>) -> Vec<KpiCard> {
    vec![
        KpiCard::new(
            "Faturamento Total",
            number(row, "faturamento_total"),
            KpiFormat::Currency,
        ),
        KpiCard::new("Ticket Médio", number(row, "ticket_medio"), KpiFormat::Currency),
        KpiCard::new("Total de Vendas", count(row, "total_vendas"), KpiFormat::Number),
        KpiCard::new("Clientes Únicos", count(row, "clientes_unicos"), KpiFormat::Number),
        KpiCard::new(
            "Tempo Médio Entrega",
            round_to(number(row, "tempo_medio_entrega_min"), 1),
            KpiFormat::Duration,
        ),
        KpiCard::new(
            "Tempo Médio Preparo",
            round_to(number(row, "tempo_medio_preparo_min"), 1),
            KpiFormat::Duration,
        ),
    ]
}

pub fn comparisons(base: Option<&Row>, compare: Option<&Row>) -> Vec<MetricComparison> {
    COMPARED_METRICS
        .iter()
        .map(|(key, label)| MetricComparison::new(label, number(base, key), number(compare, key)))
        .collect()
}

fn number(row: Option<&Row>, key: &str) -> f64 {
    row.and_then(|row| row.get(key))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

fn count(row: Option<&Row>, key: &str) -> i64 {
    row.and_then(|row| row.get(key))
        .and_then(|value| value.as_i64().or_else(|| value.as_f64().map(|v| v as i64)))
        .unwrap_or(0)
}

fn split_csv(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::max_dollar_placeholder;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn unfiltered_dashboard_has_no_params() {
        let compiled = aggregate_query(&DateRange::default(), &ReportFilters::default());
        assert!(compiled.sql.ends_with("WHERE s.sale_status_desc = 'COMPLETED'"));
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn filters_use_subquery_membership() {
        let filters = ReportFilters {
            channels: vec!["iFood".into(), "Rappi".into()],
            stores: Vec::new(),
            products: vec!["X-Burger".into()],
        };
        let range = DateRange::new(Some(day(2024, 1, 1)), Some(day(2024, 1, 31)));
        let compiled = aggregate_query(&range, &filters);

        assert!(compiled.sql.contains(
            "AND s.channel_id IN (SELECT ch.id FROM channels ch WHERE ch.name IN ($3, $4))"
        ));
        assert!(compiled.sql.contains(
            "AND s.id IN (SELECT ps.sale_id FROM product_sales ps \
             JOIN products p ON ps.product_id = p.id WHERE p.name IN ($5))"
        ));
        assert!(!compiled.sql.contains("s.store_id IN"));
        assert_eq!(max_dollar_placeholder(&compiled.sql), compiled.params.len());
        assert_eq!(compiled.params[0], BindParam::Date(day(2024, 1, 1)));
        assert_eq!(compiled.params[4], BindParam::Text("X-Burger".into()));
    }

    #[test]
    fn cards_follow_dashboard_layout() {
        let row = json!({
            "faturamento_total": 15234.5,
            "ticket_medio": 76.17,
            "total_vendas": 200,
            "clientes_unicos": 150,
            "tempo_medio_entrega_min": 32.456,
            "tempo_medio_preparo_min": 12.04
        });
        let row = row.as_object().unwrap();
        let cards = kpi_cards(Some(row));

        let labels: Vec<_> = cards.iter().map(|card| card.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "Faturamento Total",
                "Ticket Médio",
                "Total de Vendas",
                "Clientes Únicos",
                "Tempo Médio Entrega",
                "Tempo Médio Preparo",
            ]
        );
        assert_eq!(cards[0].format, KpiFormat::Currency);
        assert_eq!(cards[2].value, json!(200));
        assert_eq!(cards[4].value, json!(32.5));
        assert_eq!(cards[5].value, json!(12.0));
    }

    #[test]
    fn empty_aggregate_yields_zero_cards() {
        let row = json!({"faturamento_total": null, "total_vendas": 0});
        let cards = kpi_cards(row.as_object());
        assert_eq!(cards[0].value, json!(0.0));
        assert_eq!(cards[2].value, json!(0));
        assert_eq!(kpi_cards(None).len(), 6);
    }

    #[test]
    fn comparison_covers_five_metrics() {
        let base = json!({"faturamento_total": 1200.0, "total_vendas": 12});
        let compare = json!({"faturamento_total": 1000.0, "total_vendas": 0});
        let result = comparisons(base.as_object(), compare.as_object());
        assert_eq!(result.len(), 5);
        assert_eq!(result[0].percentage_change, 20.0);
        assert_eq!(result[2].percentage_change, 0.0);
        assert_eq!(result[4].metric_name, "Tempo Médio de Entrega (min)");
    }

    #[test]
    fn kpi_params_split_csv_lists() {
        let params = KpiParams {
            start_date: Some(day(2024, 1, 1)),
            end_date: None,
            channels: Some("iFood, Rappi,,".into()),
            stores: None,
            products: Some(" ".into()),
        };
        let request = params.into_request().unwrap();
        assert_eq!(request.filters.channels, vec!["iFood", "Rappi"]);
        assert!(request.filters.products.is_empty());
    }

    #[test]
    fn comparison_rejects_inverted_periods() {
        let request = ComparisonRequest {
            base_start: day(2024, 2, 1),
            base_end: day(2024, 1, 1),
            compare_start: day(2024, 1, 1),
            compare_end: day(2024, 1, 31),
            filters: ReportFilters::default(),
        };
        assert!(request.periods().is_err());
    }

    #[test]
    fn comparison_request_accepts_flat_filters() {
        let request: ComparisonRequest = serde_json::from_value(json!({
            "base_start": "2024-02-01",
            "base_end": "2024-02-29",
            "compare_start": "2024-01-01",
            "compare_end": "2024-01-31",
            "stores": ["Centro"]
        }))
        .unwrap();
        assert_eq!(request.filters.stores, vec!["Centro"]);
        assert!(request.filters.channels.is_empty());
    }
}
