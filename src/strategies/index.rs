use crate::model::{
    ActionStep, AdviceType, AnalysisResult, ContentionMetrics, ContentionPattern,
    OptimizationAdvice,
};
use crate::strategies::{Strategy, quote_ident, quote_qualified};
use once_cell::sync::Lazy;
use regex::Regex;

const MAX_INDEX_COLUMNS: usize = 3;
// PostgreSQL truncates identifiers at 63 bytes, MySQL at 64.
const MAX_IDENTIFIER_LEN: usize = 63;

#[allow(clippy::expect_used)]
static WHERE_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)\bwhere\b(.*?)(?:\border\s+by\b|\bgroup\s+by\b|\blimit\b|\breturning\b|\bfor\s+(?:update|share)\b|;|$)",
    )
    .expect("valid where clause regex")
});

#[allow(clippy::expect_used)]
static PREDICATE_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b((?:[a-z_][a-z0-9_]*\.)?[a-z_][a-z0-9_]*)\s*(?:=|<>|!=|<=|>=|<|>|\bin\b|\bis\b|\blike\b|\bbetween\b)",
    )
    .expect("valid predicate column regex")
});

const NOT_COLUMNS: &[&str] = &["and", "or", "not", "null", "true", "false", "exists"];

/// Suggests indexes on hot tables from the predicates of the queries that
/// wait on them, so lock holders touch fewer rows.
#[derive(Clone, Debug, Default)]
pub struct IndexStrategy;

impl IndexStrategy {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Columns used in equality/range predicates of `queries`, first seen first,
/// at most three.
#[must_use]
pub fn candidate_columns(queries: &[String]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();

    for query in queries {
        let Some(clause) = WHERE_CLAUSE.captures(query).and_then(|c| c.get(1)) else {
            continue;
        };

        for cap in PREDICATE_COLUMN.captures_iter(clause.as_str()) {
            let Some(raw) = cap.get(1) else {
                continue;
            };
            let column = raw
                .as_str()
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .to_lowercase();

            if NOT_COLUMNS.contains(&column.as_str()) || columns.contains(&column) {
                continue;
            }

            columns.push(column);
            if columns.len() == MAX_INDEX_COLUMNS {
                return columns;
            }
        }
    }

    columns
}

// Cut at the last character boundary that fits, so multibyte names stay
// valid UTF-8.
fn index_name(table: &str, columns: &[String]) -> String {
    let mut name = format!("idx_{}_{}", table, columns.join("_")).to_lowercase();
    if name.len() > MAX_IDENTIFIER_LEN {
        let cut = (0..=MAX_IDENTIFIER_LEN)
            .rev()
            .find(|&i| name.is_char_boundary(i))
            .unwrap_or(0);
        name.truncate(cut);
    }
    name
}

fn advise(backend: &str, c: &ContentionMetrics) -> Option<OptimizationAdvice> {
    let columns = candidate_columns(&c.sample_queries);
    if columns.is_empty() {
        return None;
    }

    let table = c.qualified_name();
    let column_list = columns.join(", ");

    let name = index_name(&c.object_name, &columns);
    let schema = c.schema_name.as_deref();
    let quoted_table = quote_qualified(backend, schema, &c.object_name);
    let quoted_index = quote_ident(backend, &name);
    let quoted_columns = columns
        .iter()
        .map(|col| quote_ident(backend, col))
        .collect::<Vec<_>>()
        .join(", ");

    let create = if backend == "mysql" {
        ActionStep::sql(
            "Create the index",
            format!("CREATE INDEX {quoted_index} ON {quoted_table} ({quoted_columns});"),
            Some(format!("DROP INDEX {quoted_index} ON {quoted_table};")),
        )
    } else {
        ActionStep::sql(
            "Create the index without blocking writes",
            format!(
                "CREATE INDEX CONCURRENTLY IF NOT EXISTS {quoted_index} ON {quoted_table} ({quoted_columns});"
            ),
            Some(format!(
                "DROP INDEX CONCURRENTLY IF EXISTS {};",
                quote_qualified(backend, schema, &name)
            )),
        )
    };

    Some(OptimizationAdvice {
        id: format!("index:{table}"),
        advice_type: AdviceType::Index,
        priority: c.priority,
        title: format!("Index {table} on ({column_list})"),
        description: format!(
            "{} lock waits ({:.1}s total, pattern {}) on {table}. The waiting statements filter on {column_list}; an index lets them lock only the rows they need.",
            c.contention_count,
            c.total_wait_time,
            c.pattern.as_str(),
        ),
        target_object: Some(table.clone()),
        impact_score: c.performance_impact,
        estimated_improvement: format!(
            "Fewer rows scanned and locked per statement on {table}; shorter lock hold times"
        ),
        steps: vec![
            ActionStep::note(format!(
                "Confirm with EXPLAIN that the waiting statements scan {table} without a usable index"
            )),
            create,
            ActionStep::note("Re-run the analysis and compare contention on the table"),
        ],
    })
}

impl Strategy for IndexStrategy {
    fn name(&self) -> &'static str {
        "index"
    }

    fn generate(&self, result: &AnalysisResult) -> Vec<OptimizationAdvice> {
        result
            .contentions
            .iter()
            .filter(|c| c.pattern != ContentionPattern::Isolated && c.object_type == "table")
            .filter_map(|c| advise(&result.backend, c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::testing::{contention, result};

    #[test]
    fn test_candidate_columns() {
        let queries = vec![
            "UPDATE orders SET status = 'paid' WHERE o.customer_id = 7 AND created_at > now() - interval '1 day' RETURNING id".to_string(),
            "DELETE FROM orders WHERE customer_id = 9 OR region IN ('eu')".to_string(),
        ];
        assert_eq!(
            candidate_columns(&queries),
            vec!["customer_id", "created_at", "region"]
        );
    }

    #[test]
    fn test_no_where_clause() {
        assert!(candidate_columns(&["LOCK TABLE orders".to_string()]).is_empty());
    }

    #[test]
    fn test_postgres_advice() {
        let mut r = result("postgresql");
        r.contentions = vec![contention(
            "orders",
            ContentionPattern::HotSpot,
            &["UPDATE orders SET qty = qty - 1 WHERE sku = 'A1'"],
        )];

        let advice = IndexStrategy::new().generate(&r);

        assert_eq!(advice.len(), 1);
        let a = &advice[0];
        assert_eq!(a.id, "index:public.orders");
        assert_eq!(a.advice_type, AdviceType::Index);
        assert_eq!(
            a.steps[1].statement.as_deref(),
            Some(
                r#"CREATE INDEX CONCURRENTLY IF NOT EXISTS "idx_orders_sku" ON "public"."orders" ("sku");"#
            )
        );
        assert_eq!(
            a.steps[1].rollback.as_deref(),
            Some(r#"DROP INDEX CONCURRENTLY IF EXISTS "public"."idx_orders_sku";"#)
        );
    }

    #[test]
    fn test_mysql_advice() {
        let mut r = result("mysql");
        r.contentions = vec![contention(
            "inventory",
            ContentionPattern::Burst,
            &["UPDATE inventory SET qty = qty - 1 WHERE warehouse_id = 3 AND sku = 'A1'"],
        )];

        let advice = IndexStrategy::new().generate(&r);
        assert_eq!(
            advice[0].steps[1].statement.as_deref(),
            Some(
                "CREATE INDEX `idx_inventory_warehouse_id_sku` ON `public`.`inventory` (`warehouse_id`, `sku`);"
            )
        );
        assert_eq!(
            advice[0].steps[1].rollback.as_deref(),
            Some("DROP INDEX `idx_inventory_warehouse_id_sku` ON `public`.`inventory`;")
        );
    }

    #[test]
    fn test_mixed_case_table_is_quoted() {
        let mut r = result("postgresql");
        r.contentions = vec![contention(
            "OrderItems",
            ContentionPattern::HotSpot,
            &["UPDATE order_items SET qty = 0 WHERE sku = 'A1'"],
        )];

        let advice = IndexStrategy::new().generate(&r);

        assert_eq!(
            advice[0].steps[1].statement.as_deref(),
            Some(
                r#"CREATE INDEX CONCURRENTLY IF NOT EXISTS "idx_orderitems_sku" ON "public"."OrderItems" ("sku");"#
            )
        );
    }

    #[test]
    fn test_multibyte_table_name() {
        let table = "ж".repeat(40);
        let mut r = result("postgresql");
        r.contentions = vec![contention(
            &table,
            ContentionPattern::HotSpot,
            &["UPDATE t SET qty = 0 WHERE sku = 'A1'"],
        )];

        let advice = IndexStrategy::new().generate(&r);

        assert_eq!(advice.len(), 1);
        let name = index_name(&table, &["sku".to_string()]);
        assert!(name.len() <= MAX_IDENTIFIER_LEN);
        assert!(name.starts_with("idx_жж"));
        assert!(advice[0].steps[1].statement.as_deref().is_some_and(|s| s.contains(&name)));
    }

    #[test]
    fn test_isolated_contention_ignored() {
        let mut r = result("postgresql");
        r.contentions = vec![contention(
            "orders",
            ContentionPattern::Isolated,
            &["UPDATE orders SET qty = 1 WHERE id = 1"],
        )];
        assert!(IndexStrategy::new().generate(&r).is_empty());
    }

    #[test]
    fn test_index_name_truncated() {
        let long = "t".repeat(80);
        assert_eq!(index_name(&long, &["c".to_string()]).len(), MAX_IDENTIFIER_LEN);
    }
}
