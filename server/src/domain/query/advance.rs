//! Bounded fan-out for per-trace token totals

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::constants::ADVANCE_INFO_WINDOW_MICROS;
use crate::data::types::{COL_INPUT, COL_OUTPUT, Span, TAG_INPUT_TOKENS, TAG_OUTPUT_TOKENS};
use crate::data::{GetTraceParam, TraceRepository};
use crate::domain::error::{ServiceError, ServiceResult};

/// One trace to summarize
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceQueryParam {
    pub trace_id: String,
    /// Start of the trace in milliseconds; the lookup window begins here
    pub start_time_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceAdvanceInfo {
    pub trace_id: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl TraceAdvanceInfo {
    fn from_spans(trace_id: String, spans: &[Span]) -> Self {
        let sum = |key: &str| spans.iter().filter_map(|s| s.tags_long.get(key)).sum();
        Self {
            trace_id,
            input_tokens: sum(TAG_INPUT_TOKENS),
            output_tokens: sum(TAG_OUTPUT_TOKENS),
        }
    }
}

/// Query every trace with at most `concurrency` lookups in flight.
///
/// The first failing lookup cancels the others and is returned. A panicking
/// lookup counts as an internal failure.
pub(super) async fn fan_out(
    repository: Arc<dyn TraceRepository>,
    tenants: Vec<String>,
    traces: Vec<TraceQueryParam>,
    concurrency: usize,
) -> ServiceResult<Vec<TraceAdvanceInfo>> {
    if traces.is_empty() {
        return Ok(Vec::new());
    }

    let cancel = CancellationToken::new();
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let results = Arc::new(Mutex::new(Vec::with_capacity(traces.len())));
    let tenants = Arc::new(tenants);
    let mut tasks = JoinSet::new();

    for (index, trace) in traces.into_iter().enumerate() {
        let repository = Arc::clone(&repository);
        let tenants = Arc::clone(&tenants);
        let cancel = cancel.clone();
        let permits = Arc::clone(&permits);
        let results = Arc::clone(&results);

        tasks.spawn(async move {
            let lookup = async {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    permit = permits.acquire_owned() => permit
                        .map_err(|_| ServiceError::internal("fan-out pool closed"))?,
                };
                let start = trace.start_time_ms.saturating_mul(1_000);
                let param = GetTraceParam {
                    tenants: tenants.to_vec(),
                    trace_id: trace.trace_id.clone(),
                    start_time: start,
                    end_time: start.saturating_add(ADVANCE_INFO_WINDOW_MICROS),
                    omit_columns: vec![COL_INPUT.to_string(), COL_OUTPUT.to_string()],
                    ..Default::default()
                };
                let spans = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    spans = repository.get_trace(&param) => spans?,
                };
                let info = TraceAdvanceInfo::from_spans(trace.trace_id, &spans);
                results.lock().push((index, info));
                Ok::<(), ServiceError>(())
            };
            match AssertUnwindSafe(lookup).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::internal("trace lookup panicked")),
            }
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|e| {
            Err(ServiceError::internal(format!("trace lookup task failed: {e}")))
        });
        if let Err(e) = outcome
            && first_error.is_none()
        {
            tracing::warn!(error = %e, "Trace lookup failed, cancelling the rest");
            cancel.cancel();
            first_error = Some(e);
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let mut infos = std::mem::take(&mut *results.lock());
    infos.sort_by_key(|(index, _)| *index);
    Ok(infos.into_iter().map(|(_, info)| info).collect())
}
