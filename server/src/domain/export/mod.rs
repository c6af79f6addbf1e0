//! Trace export into datasets
//!
//! Selected spans are projected into dataset rows through a field mapping.
//! Rows that fail conversion are reported per error type instead of failing
//! the whole export; rows the dataset accepts are annotated back onto their
//! span.

mod convert;


pub use convert::{ContentType, FieldContent, extract, field_value};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::constants::MANUAL_ANNOTATION_WINDOW_MICROS;
use crate::core::trace_config::TraceConfig;
use crate::data::types::{Annotation, AnnotationType, AnnotationValue, PlatformType, Span, SpanTarget};
use crate::data::{GetTraceParam, TraceRepository};
use crate::domain::annotation::{LocatedSpan, persist_located};
use crate::domain::error::{ServiceError, ServiceResult};
use crate::domain::processor::{ProcessContext, ProcessorBuilder, run_stages};

// ============================================================================
// DATASET SEAM
// ============================================================================

/// One dataset column as the dataset service knows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetField {
    /// Internal key rows are written under
    pub key: String,
    /// Name shown to users and used by field mappings
    pub name: String,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub fields: Vec<DatasetField>,
}

impl DatasetSchema {
    pub fn field_key(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.key.as_str())
    }
}

/// A row ready for the dataset, remembering the span it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetItem {
    pub trace_id: String,
    pub span_id: String,
    /// Field key -> content
    pub fields: BTreeMap<String, FieldContent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorType {
    MismatchSchema,
    InternalError,
    ExceedCapacity,
    IllegalContent,
}

/// Failures of one type, aggregated over items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemErrorGroup {
    #[serde(rename = "type")]
    pub error_type: ItemErrorType,
    /// First reason seen for this type
    pub summary: String,
    pub error_count: usize,
}

/// A row the dataset stored, by position in the submitted batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedItem {
    pub index: usize,
    pub item_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddItemsResult {
    pub added: Vec<AddedItem>,
    pub errors: Vec<ItemErrorGroup>,
}

/// The dataset service rows are exported into
#[async_trait]
pub trait DatasetProvider: Send + Sync {
    async fn clear_dataset(&self, workspace_id: &str, dataset_id: i64) -> ServiceResult<()>;

    async fn get_dataset_schema(
        &self,
        workspace_id: &str,
        dataset_id: i64,
    ) -> ServiceResult<DatasetSchema>;

    /// Validate and store rows; rejected rows come back as error groups
    async fn add_items(
        &self,
        workspace_id: &str,
        dataset_id: i64,
        items: Vec<DatasetItem>,
    ) -> ServiceResult<AddItemsResult>;
}

// ============================================================================
// REQUESTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// `input`, `output`, a column name, or `tags.<key>`
    pub trace_field_key: String,
    /// Empty selects the whole field
    #[serde(default)]
    pub jsonpath: String,
    pub dataset_field_name: String,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    #[default]
    Append,
    Overwrite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRef {
    pub trace_id: String,
    pub span_id: String,
    /// Claimed start in microseconds
    pub start_time: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    pub platform: PlatformType,
    pub workspace_id: String,
    pub dataset_id: i64,
    pub mode: ExportMode,
    pub spans: Vec<SpanRef>,
    pub field_mappings: Vec<FieldMapping>,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportResult {
    pub success_count: usize,
    pub item_ids: Vec<String>,
    pub errors: Vec<ItemErrorGroup>,
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct ExportService {
    config: Arc<dyn TraceConfig>,
    repository: Arc<dyn TraceRepository>,
    processors: ProcessorBuilder,
    provider: Arc<dyn DatasetProvider>,
}

impl ExportService {
    pub fn new(
        config: Arc<dyn TraceConfig>,
        repository: Arc<dyn TraceRepository>,
        processors: ProcessorBuilder,
        provider: Arc<dyn DatasetProvider>,
    ) -> Self {
        Self {
            config,
            repository,
            processors,
            provider,
        }
    }

    pub async fn export_spans(&self, req: ExportRequest) -> ServiceResult<ExportResult> {
        if req.field_mappings.is_empty() {
            return Err(ServiceError::invalid_argument("field_mappings is empty"));
        }
        let schema = self
            .provider
            .get_dataset_schema(&req.workspace_id, req.dataset_id)
            .await?;
        let located = self.fetch_spans(&req).await?;

        let mut errors = ErrorGroups::default();
        let mut items = Vec::with_capacity(located.len());
        let mut sources = Vec::with_capacity(located.len());
        for span in located {
            match build_item(&span.span, &req.field_mappings, &schema) {
                Ok(item) => {
                    items.push(item);
                    sources.push(span);
                }
                Err((error_type, reason)) => {
                    tracing::debug!(span_id = %span.span.span_id, reason = %reason, "Span not exportable");
                    errors.add(error_type, &reason, 1);
                }
            }
        }

        if req.mode == ExportMode::Overwrite {
            self.provider
                .clear_dataset(&req.workspace_id, req.dataset_id)
                .await?;
        }
        let added = if items.is_empty() {
            AddItemsResult::default()
        } else {
            self.provider
                .add_items(&req.workspace_id, req.dataset_id, items)
                .await?
        };
        for group in &added.errors {
            errors.add(group.error_type, &group.summary, group.error_count);
        }

        for item in &added.added {
            let Some(source) = sources.get(item.index) else {
                continue;
            };
            self.annotate(&req, source, &item.item_id).await;
        }

        Ok(ExportResult {
            success_count: added.added.len(),
            item_ids: added.added.into_iter().map(|a| a.item_id).collect(),
            errors: errors.into_vec(),
        })
    }

    /// Load full spans in request order; a span that is not stored aborts the export
    async fn fetch_spans(&self, req: &ExportRequest) -> ServiceResult<Vec<LocatedSpan>> {
        let tenants = self.config.platform_tenants(req.platform)?;
        let stages = self.processors.query_stages(req.platform.as_str())?;
        let mut out = Vec::with_capacity(req.spans.len());
        for target in &req.spans {
            let found = self.fetch_one(&tenants, target).await?.ok_or_else(|| {
                ServiceError::not_found(format!(
                    "span {} of trace {} not found",
                    target.span_id, target.trace_id
                ))
            })?;
            let ctx = ProcessContext {
                tenant: found.tenant.clone(),
                workspace_id: (!req.workspace_id.is_empty()).then(|| req.workspace_id.clone()),
            };
            let tenant = found.tenant;
            let span = run_stages(&stages, &ctx, vec![found.span])
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    ServiceError::not_found(format!("span {} not visible", target.span_id))
                })?;
            out.push(LocatedSpan { tenant, span });
        }
        Ok(out)
    }

    async fn fetch_one(
        &self,
        tenants: &[String],
        target: &SpanRef,
    ) -> ServiceResult<Option<LocatedSpan>> {
        for tenant in tenants {
            let spans = self
                .repository
                .get_trace(&GetTraceParam {
                    tenants: vec![tenant.clone()],
                    trace_id: target.trace_id.clone(),
                    span_ids: vec![target.span_id.clone()],
                    start_time: target.start_time - MANUAL_ANNOTATION_WINDOW_MICROS,
                    end_time: target.start_time + MANUAL_ANNOTATION_WINDOW_MICROS,
                    limit: 1,
                    ..Default::default()
                })
                .await?;
            if let Some(span) = spans.into_iter().next() {
                return Ok(Some(LocatedSpan {
                    tenant: tenant.clone(),
                    span,
                }));
            }
        }
        Ok(None)
    }

    /// Record dataset membership on the span; failures only log
    async fn annotate(&self, req: &ExportRequest, source: &LocatedSpan, item_id: &str) {
        let annotation = Annotation::build(
            &SpanTarget {
                workspace_id: source.span.workspace_id.clone(),
                trace_id: source.span.trace_id.clone(),
                span_id: source.span.span_id.clone(),
                start_time: source.span.start_time,
            },
            AnnotationType::ManualDataset,
            &req.dataset_id.to_string(),
            AnnotationValue::String(item_id.to_string()),
            "",
            &req.user_id,
        );
        if let Err(e) = persist_located(self.repository.as_ref(), source, annotation).await {
            tracing::warn!(
                span_id = %source.span.span_id,
                dataset_id = req.dataset_id,
                error = %e,
                "Failed to annotate exported span"
            );
        }
    }
}

// ============================================================================
// ITEMS
// ============================================================================

fn build_item(
    span: &Span,
    mappings: &[FieldMapping],
    schema: &DatasetSchema,
) -> Result<DatasetItem, (ItemErrorType, String)> {
    let mut fields = BTreeMap::new();
    for mapping in mappings {
        let raw = field_value(span, &mapping.trace_field_key);
        let value = extract(&raw, &mapping.jsonpath);
        let content = convert::convert(value, mapping.content_type).map_err(|reason| {
            (
                ItemErrorType::MismatchSchema,
                format!("{}: {reason}", mapping.dataset_field_name),
            )
        })?;
        let key = schema.field_key(&mapping.dataset_field_name).ok_or_else(|| {
            (
                ItemErrorType::InternalError,
                format!("dataset has no field {}", mapping.dataset_field_name),
            )
        })?;
        fields.insert(key.to_string(), content);
    }
    Ok(DatasetItem {
        trace_id: span.trace_id.clone(),
        span_id: span.span_id.clone(),
        fields,
    })
}

/// Error groups keyed by type, keeping the first summary
#[derive(Default)]
struct ErrorGroups(BTreeMap<ItemErrorType, ItemErrorGroup>);

impl ErrorGroups {
    fn add(&mut self, error_type: ItemErrorType, summary: &str, count: usize) {
        self.0
            .entry(error_type)
            .and_modify(|g| g.error_count += count)
            .or_insert_with(|| ItemErrorGroup {
                error_type,
                summary: summary.to_string(),
                error_count: count,
            });
    }

    fn into_vec(self) -> Vec<ItemErrorGroup> {
        self.0.into_values().collect()
    }
}
