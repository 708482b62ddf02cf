//! Bulk data handlers: copy, in-place transform and seed.
//!
//! All three write in batches of [`MAX_BATCH_WRITE_ITEMS`]. A failed batch
//! is recorded in the output's `errors` list and the handler moves on to the
//! next batch; only scan failures and cancellation abort the operation.

use super::{OperationError, OperationOutput, OperationRegistry, OutcomeStatus};
use crate::backend::{Item, ScanRequest, MAX_BATCH_WRITE_ITEMS};
use crate::context::ExecutionContext;
use crate::expr::{CompiledTransform, Expression, ItemTransform};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Payload of `migrateData`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateData {
    pub source_table: String,
    pub target_table: String,
    /// Applied to each item before it is written to the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<ItemTransform>,
}

/// Payload of `transformData`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformData {
    pub table_name: String,
    pub transform: ItemTransform,
    /// Only items for which this predicate is `true` are rewritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Payload of `seedData`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedData {
    pub table_name: String,
    pub items: Vec<Item>,
}

/// Running totals for a batched write.
#[derive(Debug, Default)]
struct BatchReport {
    scanned: u64,
    matched: u64,
    written: u64,
    batches: u64,
    errors: Vec<Value>,
}

impl BatchReport {
    fn into_output(self, table: &str) -> OperationOutput {
        OperationOutput::new(OutcomeStatus::Completed)
            .with("tableName", table)
            .with("itemsScanned", self.scanned)
            .with("itemsMatched", self.matched)
            .with("itemsWritten", self.written)
            .with("batches", self.batches)
            .with("errors", self.errors)
    }
}

impl OperationRegistry {
    /// Write `items` in fixed-size batches, recording failed batches in `report`.
    async fn write_batches(
        &self,
        table: &str,
        items: &[Item],
        report: &mut BatchReport,
        ctx: &ExecutionContext,
    ) -> Result<(), OperationError> {
        for chunk in items.chunks(MAX_BATCH_WRITE_ITEMS) {
            if ctx.is_cancelled() {
                return Err(OperationError::Cancelled);
            }

            report.batches += 1;
            match self.backend.batch_write(table, chunk).await {
                Ok(()) => {
                    report.written += chunk.len() as u64;
                    tracing::debug!(
                        migration_id = %ctx.migration_id,
                        table = %table,
                        batch = report.batches,
                        items = chunk.len(),
                        "batch written"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        migration_id = %ctx.migration_id,
                        table = %table,
                        batch = report.batches,
                        error = %e,
                        "batch write failed"
                    );
                    report.errors.push(json!({
                        "batch": report.batches,
                        "items": chunk.len(),
                        "error": e.to_string(),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Scan `source` page by page, feeding each item through `prepare` and
    /// writing the result to `target`.
    ///
    /// Prepared items are buffered across pages so that only full batches are
    /// written until the scan ends; the page size never changes the batch count.
    async fn scan_and_write<F>(
        &self,
        source: &str,
        target: &str,
        ctx: &ExecutionContext,
        mut prepare: F,
    ) -> Result<BatchReport, OperationError>
    where
        F: FnMut(&Item, &mut BatchReport) -> Option<Item> + Send,
    {
        let mut report = BatchReport::default();
        let mut pending: Vec<Item> = Vec::with_capacity(MAX_BATCH_WRITE_ITEMS);
        let mut token = None;

        loop {
            if ctx.is_cancelled() {
                return Err(OperationError::Cancelled);
            }

            let request =
                ScanRequest::new(source, self.settings.scan_page_size).starting_after(token);
            let page = self.backend.scan(&request).await?;
            report.scanned += page.items.len() as u64;

            for item in &page.items {
                if let Some(prepared) = prepare(item, &mut report) {
                    report.matched += 1;
                    pending.push(prepared);
                }
            }

            let full = pending.len() - pending.len() % MAX_BATCH_WRITE_ITEMS;
            if full > 0 {
                let ready: Vec<Item> = pending.drain(..full).collect();
                self.write_batches(target, &ready, &mut report, ctx).await?;
            }

            token = page.last_evaluated_key;
            if token.is_none() {
                self.write_batches(target, &pending, &mut report, ctx).await?;
                return Ok(report);
            }
        }
    }

    pub(crate) async fn migrate_data(
        &self,
        payload: &MigrateData,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let transform = payload
            .transform
            .as_ref()
            .map(ItemTransform::compile)
            .transpose()?;

        let report = self
            .scan_and_write(&payload.source_table, &payload.target_table, ctx, |item, report| {
                apply_transform(transform.as_ref(), item, report)
            })
            .await?;

        tracing::info!(
            migration_id = %ctx.migration_id,
            source = %payload.source_table,
            target = %payload.target_table,
            written = report.written,
            failed_batches = report.errors.len(),
            "data migration finished"
        );
        Ok(report
            .into_output(&payload.target_table)
            .with("sourceTable", payload.source_table.as_str()))
    }

    pub(crate) async fn transform_data(
        &self,
        payload: &TransformData,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let transform = payload.transform.compile()?;
        let filter = payload.filter.as_deref().map(Expression::parse).transpose()?;
        let table = payload.table_name.as_str();

        let report = self
            .scan_and_write(table, table, ctx, |item, report| {
                if let Some(filter) = &filter {
                    match filter.matches(item) {
                        Ok(true) => {}
                        Ok(false) => return None,
                        Err(e) => {
                            report.errors.push(json!({"item": item_label(item), "error": e.to_string()}));
                            return None;
                        }
                    }
                }
                apply_transform(Some(&transform), item, report)
            })
            .await?;

        tracing::info!(
            migration_id = %ctx.migration_id,
            table = %table,
            matched = report.matched,
            written = report.written,
            "data transform finished"
        );
        Ok(report.into_output(table))
    }

    pub(crate) async fn seed_data(
        &self,
        payload: &SeedData,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let mut report = BatchReport {
            matched: payload.items.len() as u64,
            ..Default::default()
        };
        self.write_batches(&payload.table_name, &payload.items, &mut report, ctx)
            .await?;
        Ok(report.into_output(&payload.table_name))
    }
}

/// Transform one item, recording evaluation failures instead of aborting.
fn apply_transform(
    transform: Option<&CompiledTransform>,
    item: &Item,
    report: &mut BatchReport,
) -> Option<Item> {
    let Some(transform) = transform else {
        return Some(item.clone());
    };
    match transform.apply(item) {
        Ok(output) => Some(output),
        Err(e) => {
            report
                .errors
                .push(json!({"item": item_label(item), "error": e.to_string()}));
            None
        }
    }
}

/// Compact identification of an item for error entries.
fn item_label(item: &Item) -> Value {
    ["id", "pk", "PK"]
        .iter()
        .find_map(|key| item.get(*key).cloned())
        .unwrap_or_else(|| Value::from(item.len()))
}
