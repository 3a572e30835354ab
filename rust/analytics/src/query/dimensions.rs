//! Value listings used to populate filter pickers.

use super::{
    ast::{CompiledQuery, SqlWriter},
    BindParam,
};
use crate::{
    models::{DimensionValue, Row},
    validate::ValidationError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PRODUCT_LIMIT: i64 = 100;
pub const MAX_PRODUCT_LIMIT: i64 = 500;

const STORES_SQL: &str = "SELECT st.id AS id, st.name AS label, COUNT(DISTINCT s.id) AS count
FROM stores st
LEFT JOIN sales s ON st.id = s.store_id
WHERE st.is_active = true
GROUP BY st.id, st.name
ORDER BY st.name";

const CHANNELS_SQL: &str = "SELECT ch.id AS id, ch.name AS label, COUNT(DISTINCT s.id) AS count
FROM channels ch
LEFT JOIN sales s ON ch.id = s.channel_id
GROUP BY ch.id, ch.name
ORDER BY ch.name";

const PRODUCTS_SQL: &str = "SELECT p.id AS id, p.name AS label, COUNT(DISTINCT ps.id) AS count
FROM products p
LEFT JOIN product_sales ps ON p.id = ps.product_id
GROUP BY p.id, p.name
ORDER BY count DESC, p.name
LIMIT ";

const REGIONS_SQL: &str = "SELECT da.neighborhood AS id, CONCAT(da.neighborhood, ' - ', da.city) AS label, COUNT(DISTINCT s.id) AS count
FROM delivery_addresses da
JOIN sales s ON da.sale_id = s.id
WHERE da.neighborhood IS NOT NULL
GROUP BY da.neighborhood, da.city
ORDER BY count DESC, label
LIMIT 100";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionKind {
    Stores,
    Channels,
    Products,
    Regions,
}

impl DimensionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DimensionKind::Stores => "stores",
            DimensionKind::Channels => "channels",
            DimensionKind::Products => "products",
            DimensionKind::Regions => "regions",
        }
    }

    /// `limit` only applies to products.
    pub fn query(self, limit: Option<i64>) -> Result<CompiledQuery, ValidationError> {
        let mut writer = SqlWriter::new();
        match self {
            DimensionKind::Stores => writer.push_sql(STORES_SQL),
            DimensionKind::Channels => writer.push_sql(CHANNELS_SQL),
            DimensionKind::Regions => writer.push_sql(REGIONS_SQL),
            DimensionKind::Products => {
                let limit = limit.unwrap_or(DEFAULT_PRODUCT_LIMIT);
                if !(1..=MAX_PRODUCT_LIMIT).contains(&limit) {
                    return Err(ValidationError::LimitOutOfRange {
                        limit,
                        max: MAX_PRODUCT_LIMIT,
                    });
                }
                writer.push_sql(PRODUCTS_SQL);
                writer.push_bind(BindParam::Int(limit));
            }
        }
        Ok(writer.finish())
    }
}

pub fn dimension_values(rows: &[Row]) -> Vec<DimensionValue> {
    rows.iter()
        .map(|row| DimensionValue {
            id: row.get("id").cloned().unwrap_or(Value::Null),
            label: match row.get("label") {
                Some(Value::String(label)) => label.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            },
            count: row.get("count").and_then(Value::as_i64),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::max_dollar_placeholder;
    use serde_json::json;

    #[test]
    fn product_limit_is_bound() {
        let compiled = DimensionKind::Products.query(Some(25)).unwrap();
        assert!(compiled.sql.ends_with("LIMIT $1"));
        assert_eq!(compiled.params, vec![BindParam::Int(25)]);

        let default = DimensionKind::Products.query(None).unwrap();
        assert_eq!(default.params, vec![BindParam::Int(DEFAULT_PRODUCT_LIMIT)]);
    }

    #[test]
    fn product_limit_is_capped() {
        assert_eq!(
            DimensionKind::Products.query(Some(501)).unwrap_err(),
            ValidationError::LimitOutOfRange {
                limit: 501,
                max: MAX_PRODUCT_LIMIT
            }
        );
        assert!(DimensionKind::Products.query(Some(0)).is_err());
    }

    #[test]
    fn fixed_listings_take_no_params() {
        for kind in [
            DimensionKind::Stores,
            DimensionKind::Channels,
            DimensionKind::Regions,
        ] {
            let compiled = kind.query(Some(9999)).unwrap();
            assert!(compiled.params.is_empty());
            assert_eq!(max_dollar_placeholder(&compiled.sql), 0);
        }
        assert!(DimensionKind::Stores
            .query(None)
            .unwrap()
            .sql
            .contains("st.is_active = true"));
    }

    #[test]
    fn rows_become_dimension_values() {
        let rows = vec![
            json!({"id": 3, "label": "iFood", "count": 120}),
            json!({"id": "Centro", "label": "Centro - BH", "count": 7}),
            json!({"id": 9, "label": null}),
        ];
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|value| value.as_object().cloned().unwrap())
            .collect();
        let values = dimension_values(&rows);
        assert_eq!(values[0].id, json!(3));
        assert_eq!(values[0].count, Some(120));
        assert_eq!(values[1].label, "Centro - BH");
        assert_eq!(values[2].label, "");
        assert_eq!(values[2].count, None);
    }
}
