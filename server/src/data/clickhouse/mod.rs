//! ClickHouse trace store
//!
//! Routes reads and writes through `trace_tenant_tables_cfg`: each tenant owns
//! one span table per TTL class plus an annotation table. Multi-tenant reads
//! run one sub-select per table joined with `UNION ALL`, then order and page
//! the merged result.
//!
//! The client uses LZ4 compression and HTTP keep-alive; every statement is
//! bounded by the configured query timeout.

pub mod filter;
pub mod rows;
pub mod schema;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use clickhouse::Client;

use crate::core::config::ClickhouseConfig;
use crate::core::constants::DEFAULT_LIST_SPANS_LIMIT;
use crate::core::trace_config::TenantTables;
use crate::data::error::DataError;
use crate::data::traits::{
    GetTraceParam, ListAnnotationsParam, ListSpansParam, ListSpansResult, PageToken, SortOrder,
    TraceRepository, finish_page, latest_annotations,
};
use crate::data::types::{Annotation, Span, TtlClass};

use filter::{ConditionBuilder, QueryParam, bind_all, validate_identifier};
use rows::{ANNOTATION_COLUMNS, AnnotationRow, SpanRow, span_select_list};

const BACKEND: &str = "clickhouse";

pub struct ClickhouseTraceRepository {
    client: Client,
    tables: HashMap<String, TenantTables>,
    timeout: Duration,
}

impl ClickhouseTraceRepository {
    /// Connect, then create every configured table that is missing
    pub async fn init(
        config: &ClickhouseConfig,
        tables: HashMap<String, TenantTables>,
    ) -> Result<Self, DataError> {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database)
            .with_compression(clickhouse::Compression::Lz4);

        if let Some(ref user) = config.user {
            client = client.with_user(user);
        }
        if let Some(ref password) = config.password {
            client = client.with_password(password);
        }

        let repo = Self {
            client,
            tables,
            timeout: Duration::from_secs(config.timeout_secs),
        };

        repo.with_timeout(async {
            repo.client
                .query("SELECT 1")
                .execute()
                .await
                .map_err(DataError::from)
        })
        .await
        .map_err(|e| {
            DataError::Config(format!(
                "ClickHouse at {} is unreachable: {e}. Verify it is running and accessible.",
                config.url
            ))
        })?;
        repo.bootstrap_schema().await?;

        tracing::debug!(
            url = %config.url,
            database = %config.database,
            tenants = repo.tables.len(),
            "ClickHouse trace store initialized"
        );
        Ok(repo)
    }

    async fn bootstrap_schema(&self) -> Result<(), DataError> {
        let mut statements = Vec::new();
        for (tenant, tables) in &self.tables {
            for (ttl_key, table) in &tables.span_tables {
                let days = schema::ttl_days(ttl_key).ok_or_else(|| {
                    DataError::Config(format!("tenant {tenant}: invalid TTL class {ttl_key:?}"))
                })?;
                statements.push(schema::span_table(validate_identifier(table)?, days));
            }
            if !tables.annotation_table.is_empty() {
                statements.push(schema::annotation_table(validate_identifier(
                    &tables.annotation_table,
                )?));
            }
        }
        statements.sort();
        statements.dedup();
        for ddl in statements {
            self.with_timeout(async { self.client.query(&ddl).execute().await.map_err(DataError::from) })
                .await?;
        }
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, DataError>>,
    ) -> Result<T, DataError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| DataError::timeout(BACKEND, self.timeout.as_secs()))?
    }

    fn tenant_tables(&self, tenant: &str) -> Result<&TenantTables, DataError> {
        self.tables
            .get(tenant)
            .ok_or_else(|| DataError::NotFound(format!("no tables configured for tenant {tenant}")))
    }

    /// Every span table of the given tenants; unknown tenants are skipped
    fn span_tables(&self, tenants: &[String]) -> Result<Vec<&str>, DataError> {
        let mut out = Vec::new();
        for tenant in tenants {
            match self.tables.get(tenant) {
                Some(tables) => {
                    for table in tables.all_span_tables() {
                        out.push(validate_identifier(table)?);
                    }
                }
                None => tracing::warn!(tenant = %tenant, "No span tables configured for tenant"),
            }
        }
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }

    fn annotation_tables(&self, tenants: &[String]) -> Result<Vec<&str>, DataError> {
        let mut out = Vec::new();
        for tenant in tenants {
            if let Some(tables) = self.tables.get(tenant)
                && !tables.annotation_table.is_empty()
            {
                out.push(validate_identifier(&tables.annotation_table)?);
            }
        }
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }

    async fn fetch_spans(&self, sql: String, params: Vec<QueryParam>) -> Result<Vec<Span>, DataError> {
        tracing::trace!(sql = %sql, params = params.len(), "ClickHouse span query");
        let rows: Vec<SpanRow> = self
            .with_timeout(async {
                bind_all(self.client.query(&sql), &params)
                    .fetch_all::<SpanRow>()
                    .await
                    .map_err(DataError::from)
            })
            .await?;
        Ok(rows.into_iter().map(Span::from).collect())
    }

    async fn fetch_annotations(
        &self,
        tables: &[&str],
        conditions: &ConditionBuilder,
    ) -> Result<Vec<Annotation>, DataError> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let where_clause = conditions.build();
        let sql = tables
            .iter()
            .map(|t| format!("SELECT {ANNOTATION_COLUMNS} FROM {t} WHERE {where_clause}"))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let params = repeat_params(conditions.params(), tables.len());

        let rows: Vec<AnnotationRow> = self
            .with_timeout(async {
                bind_all(self.client.query(&sql), &params)
                    .fetch_all::<AnnotationRow>()
                    .await
                    .map_err(DataError::from)
            })
            .await?;
        Ok(latest_annotations(
            rows.into_iter()
                .filter_map(AnnotationRow::into_annotation)
                .collect(),
        ))
    }
}

fn repeat_params(params: &[QueryParam], times: usize) -> Vec<QueryParam> {
    let mut out = Vec::with_capacity(params.len() * times);
    for _ in 0..times {
        out.extend(params.iter().cloned());
    }
    out
}

fn order_clause(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Desc => "ORDER BY start_time DESC, span_id DESC",
        SortOrder::Asc => "ORDER BY start_time ASC, span_id ASC",
    }
}

#[async_trait]
impl TraceRepository for ClickhouseTraceRepository {
    async fn insert_spans(&self, tenant: &str, ttl: TtlClass, spans: &[Span]) -> Result<(), DataError> {
        if spans.is_empty() {
            return Ok(());
        }
        let table = self.tenant_tables(tenant)?.span_table(ttl).ok_or_else(|| {
            DataError::NotFound(format!("no {ttl} span table configured for tenant {tenant}"))
        })?;
        let table = validate_identifier(table)?;

        self.with_timeout(async {
            let mut insert: clickhouse::insert::Insert<SpanRow> = self.client.insert(table).await?;
            for span in spans {
                insert.write(&SpanRow::from(span)).await?;
            }
            insert.end().await?;
            Ok::<(), DataError>(())
        })
        .await?;
        tracing::debug!(tenant, table, count = spans.len(), "Inserted spans");
        Ok(())
    }

    async fn list_spans(&self, param: &ListSpansParam) -> Result<ListSpansResult, DataError> {
        let limit = if param.limit == 0 {
            DEFAULT_LIST_SPANS_LIMIT
        } else {
            param.limit
        };
        let tables = self.span_tables(&param.tenants)?;
        if tables.is_empty() {
            return Ok(ListSpansResult::default());
        }

        let mut conditions = ConditionBuilder::new();
        conditions.add_time_range(param.start_time, param.end_time);
        if let Some(token) = param.page_token.as_deref().filter(|t| !t.is_empty()) {
            let cursor = PageToken::decode(token)?;
            conditions.add_cursor(
                cursor.start_time,
                &cursor.span_id,
                param.order == SortOrder::Desc,
            );
        }
        if let Some(filter) = &param.filters {
            conditions.add_filter(filter)?;
        }

        let columns = span_select_list(&param.omit_columns);
        let where_clause = conditions.build();
        let order = order_clause(param.order);
        let fetch = limit + 1;
        let union = tables
            .iter()
            .map(|t| {
                format!("(SELECT {columns} FROM {t} WHERE {where_clause} {order} LIMIT {fetch})")
            })
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let sql = format!("SELECT * FROM ({union}) {order} LIMIT {fetch}");

        let spans = self
            .fetch_spans(sql, repeat_params(conditions.params(), tables.len()))
            .await?;
        Ok(finish_page(spans, limit))
    }

    async fn get_trace(&self, param: &GetTraceParam) -> Result<Vec<Span>, DataError> {
        let tables = self.span_tables(&param.tenants)?;
        if tables.is_empty() {
            return Ok(Vec::new());
        }

        let mut conditions = ConditionBuilder::new();
        conditions.add_time_range(param.start_time, param.end_time);
        if !param.trace_id.is_empty() {
            conditions.add_eq("trace_id", &param.trace_id);
        } else if let Some(log_id) = param.log_id.as_deref().filter(|l| !l.is_empty()) {
            conditions.add_eq("log_id", log_id);
        } else {
            return Err(DataError::InvalidInput(
                "trace_id or log_id is required".to_string(),
            ));
        }
        conditions.add_in("span_id", &param.span_ids);

        let columns = span_select_list(&param.omit_columns);
        let where_clause = conditions.build();
        let limit = if param.limit == 0 {
            String::new()
        } else {
            format!(" LIMIT {}", param.limit)
        };
        let union = tables
            .iter()
            .map(|t| format!("SELECT {columns} FROM {t} WHERE {where_clause}"))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let sql = format!("SELECT * FROM ({union}){limit}");

        self.fetch_spans(sql, repeat_params(conditions.params(), tables.len()))
            .await
    }

    async fn insert_annotations(
        &self,
        tenant: &str,
        annotations: &[Annotation],
    ) -> Result<(), DataError> {
        if annotations.is_empty() {
            return Ok(());
        }
        let tables = self.tenant_tables(tenant)?;
        if tables.annotation_table.is_empty() {
            return Err(DataError::NotFound(format!(
                "no annotation table configured for tenant {tenant}"
            )));
        }
        let table = validate_identifier(&tables.annotation_table)?;

        self.with_timeout(async {
            let mut insert: clickhouse::insert::Insert<AnnotationRow> =
                self.client.insert(table).await?;
            for annotation in annotations {
                insert.write(&AnnotationRow::from(annotation)).await?;
            }
            insert.end().await?;
            Ok::<(), DataError>(())
        })
        .await
    }

    async fn get_annotation(
        &self,
        tenants: &[String],
        id: &str,
        start_time: i64,
        end_time: i64,
    ) -> Result<Option<Annotation>, DataError> {
        let tables = self.annotation_tables(tenants)?;
        let mut conditions = ConditionBuilder::new();
        conditions.add_eq("id", id);
        conditions.add_time_range(start_time, end_time);
        let rows = self.fetch_annotations(&tables, &conditions).await?;
        Ok(rows.into_iter().next())
    }

    async fn list_annotations(
        &self,
        param: &ListAnnotationsParam,
    ) -> Result<Vec<Annotation>, DataError> {
        let tables = self.annotation_tables(&param.tenants)?;
        let mut conditions = ConditionBuilder::new();
        conditions.add_time_range(param.start_time, param.end_time);
        for (column, value) in [
            ("workspace_id", &param.workspace_id),
            ("trace_id", &param.trace_id),
            ("span_id", &param.span_id),
        ] {
            if !value.is_empty() {
                conditions.add_eq(column, value);
            }
        }

        // Tombstones are dropped after collapsing so a deleted ID stays hidden
        let mut rows: Vec<Annotation> = self
            .fetch_annotations(&tables, &conditions)
            .await?
            .into_iter()
            .filter(|a| param.include_deleted || !a.is_deleted)
            .collect();
        if param.desc_by_updated_at {
            rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        } else {
            rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        }
        if param.limit > 0 {
            rows.truncate(param.limit);
        }
        Ok(rows)
    }
}
