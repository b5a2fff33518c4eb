//! Map/reduce result storage operations
//!
//! All reads here follow the same discipline: seek by the composite
//! hash (fast, fixed width, collision-prone), then verify the true
//! view / reduce key / group id on every candidate row before yielding
//! it. Rows that fail verification are skipped, never fatal, and never
//! terminate the scan: the index range is approximate by construction.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::engine::{encode_key, EngineError, Row, TableId, Value};
use crate::mapreduce::types::{eq_ignore_case, GetMapReduceResults, MappedResultInfo};
use crate::store::{
    bytes_column, int_column, text_column, StorageAccessor, StorageError, StorageResult,
};

impl StorageAccessor {
    /// Persists one per-document map emission. Never overwrites:
    /// repeated puts for the same (view, document, key) append rows,
    /// and supersession is the caller's delete-then-reinsert.
    pub fn put_mapped_result(
        &self,
        view: &str,
        document_key: &str,
        reduce_key: &str,
        reduce_group_id: i32,
        data: &serde_json::Value,
        view_and_reduce_key_hashed: [u8; 16],
    ) -> StorageResult<()> {
        let etag = self.alloc_etag();
        let row = vec![
            Value::Text(view.to_string()),
            Value::Text(reduce_key.to_string()),
            Value::Text(document_key.to_string()),
            Value::Bytes(encode_payload(data)?),
            Value::Int(etag as i64),
            Value::Int(Utc::now().timestamp_millis()),
            Value::Bytes(view_and_reduce_key_hashed.to_vec()),
            Value::Int(reduce_group_id as i64),
        ];
        self.insert_row(TableId::MappedResults, row)?;
        Ok(())
    }

    /// Persists one reduce output for a reduce key.
    pub fn put_reduce_result(
        &self,
        view: &str,
        reduce_key: &str,
        reduce_group_id: i32,
        data: &serde_json::Value,
        view_and_reduce_key_hashed: [u8; 16],
    ) -> StorageResult<()> {
        let etag = self.alloc_etag();
        let row = vec![
            Value::Text(view.to_string()),
            Value::Text(reduce_key.to_string()),
            Value::Bytes(encode_payload(data)?),
            Value::Int(etag as i64),
            Value::Int(Utc::now().timestamp_millis()),
            Value::Bytes(view_and_reduce_key_hashed.to_vec()),
            Value::Int(reduce_group_id as i64),
        ];
        self.insert_row(TableId::ReduceResults, row)?;
        Ok(())
    }

    /// Payloads of all mapped results matching the requests, in
    /// caller-supplied request order.
    pub fn get_mapped_results(
        &self,
        requests: &[GetMapReduceResults],
    ) -> StorageResult<impl Iterator<Item = serde_json::Value>> {
        let columns = self.columns().mapped_results;
        let mut payloads = Vec::new();
        for request in requests {
            let prefix = encode_key(&[
                (
                    &Value::Bytes(request.view_and_reduce_key_hashed.to_vec()),
                    false,
                ),
                (
                    &Value::Int(request.reduce_key.reduce_group_id as i64),
                    false,
                ),
            ]);
            for row_id in self.scan(
                TableId::MappedResults,
                "by_reduce_key_and_view_hashed",
                &prefix,
            )? {
                let row = self.mapped_row(row_id)?;
                // hashes collide across distinct logical keys; check
                // the real fields before yielding
                let reduce_key = text_column(&row, columns.reduce_key, "mapped_results")?;
                if !eq_ignore_case(reduce_key, &request.reduce_key.reduce_key) {
                    continue;
                }
                let group_id = int_column(&row, columns.reduce_group_id, "mapped_results")? as i32;
                if group_id != request.reduce_key.reduce_group_id {
                    continue;
                }
                let view = text_column(&row, columns.view, "mapped_results")?;
                if !eq_ignore_case(view, &request.view) {
                    continue;
                }
                payloads.push(decode_payload(bytes_column(
                    &row,
                    columns.data,
                    "mapped_results",
                )?)?);
            }
        }
        Ok(payloads.into_iter())
    }

    /// Payloads of all reduce results matching the requests, in
    /// caller-supplied request order.
    pub fn get_reduce_results(
        &self,
        requests: &[GetMapReduceResults],
    ) -> StorageResult<impl Iterator<Item = serde_json::Value>> {
        let columns = self.columns().reduce_results;
        let mut payloads = Vec::new();
        for request in requests {
            let prefix = encode_key(&[(
                &Value::Bytes(request.view_and_reduce_key_hashed.to_vec()),
                false,
            )]);
            for row_id in self.scan(
                TableId::ReduceResults,
                "by_reduce_key_and_view_hashed",
                &prefix,
            )? {
                let row = self.reduce_row(row_id)?;
                let reduce_key = text_column(&row, columns.reduce_key, "reduce_results")?;
                if !eq_ignore_case(reduce_key, &request.reduce_key.reduce_key) {
                    continue;
                }
                let view = text_column(&row, columns.view, "reduce_results")?;
                if !eq_ignore_case(view, &request.view) {
                    continue;
                }
                payloads.push(decode_payload(bytes_column(
                    &row,
                    columns.data,
                    "reduce_results",
                )?)?);
            }
        }
        Ok(payloads.into_iter())
    }

    /// Deletes every mapped result for (view, document), returning the
    /// distinct reduce keys that were touched so the caller knows
    /// which reduce groups need recomputation. The set deduplicates
    /// case-insensitively.
    pub fn delete_mapped_results_for_document_id(
        &self,
        document_key: &str,
        view: &str,
    ) -> StorageResult<HashSet<String>> {
        let columns = self.columns().mapped_results;
        let prefix = encode_key(&[
            (&Value::Text(view.to_string()), false),
            (&Value::Text(document_key.to_string()), false),
        ]);
        let mut reduce_keys = HashSet::new();
        let mut seen_folded = HashSet::new();
        for row_id in self.scan(TableId::MappedResults, "by_view_and_doc_key", &prefix)? {
            let row = self.mapped_row(row_id)?;
            // index ranges are approximate, check the fields ourselves
            let row_view = text_column(&row, columns.view, "mapped_results")?;
            if !eq_ignore_case(row_view, view) {
                continue;
            }
            let row_document = text_column(&row, columns.document_key, "mapped_results")?;
            if !eq_ignore_case(row_document, document_key) {
                continue;
            }
            let reduce_key = text_column(&row, columns.reduce_key, "mapped_results")?.to_string();
            if seen_folded.insert(reduce_key.to_lowercase()) {
                reduce_keys.insert(reduce_key);
            }
            self.delete_row(TableId::MappedResults, row_id)?;
        }
        Ok(reduce_keys)
    }

    /// Deletes every mapped result for a view; used on index drop and
    /// rebuild.
    pub fn delete_mapped_results_for_view(&self, view: &str) -> StorageResult<()> {
        let columns = self.columns().mapped_results;
        let prefix = encode_key(&[(&Value::Text(view.to_string()), false)]);
        for row_id in self.scan(TableId::MappedResults, "by_view", &prefix)? {
            let row = self.mapped_row(row_id)?;
            let row_view = text_column(&row, columns.view, "mapped_results")?;
            if !eq_ignore_case(row_view, view) {
                continue;
            }
            self.delete_row(TableId::MappedResults, row_id)?;
        }
        Ok(())
    }

    /// Walks mapped results for `view` starting at the row whose etag
    /// is at or before `last_etag` in the view-ascending,
    /// etag-descending ordering, moving toward the start of the index,
    /// which yields etags in increasing order: the results that became
    /// available since the caller last reduced. Stops as soon as the
    /// view no longer matches. Payloads are loaded only when
    /// `load_data` is set.
    pub fn get_mapped_results_reduce_keys_after(
        &self,
        view: &str,
        last_etag: u64,
        load_data: bool,
    ) -> StorageResult<impl Iterator<Item = MappedResultInfo>> {
        let columns = self.columns().mapped_results;
        let prefix = encode_key(&[(&Value::Text(view.to_string()), false)]);
        let upper = encode_key(&[
            (&Value::Text(view.to_string()), false),
            (&Value::Int(last_etag as i64), true),
        ]);
        let mut infos = Vec::new();
        for row_id in self.scan_rev_upto(TableId::MappedResults, "by_view_and_etag", &prefix, &upper)?
        {
            let row = self.mapped_row(row_id)?;
            let row_view = text_column(&row, columns.view, "mapped_results")?;
            if !eq_ignore_case(row_view, view) {
                break;
            }
            let timestamp_millis = int_column(&row, columns.timestamp, "mapped_results")?;
            let timestamp = DateTime::<Utc>::from_timestamp_millis(timestamp_millis)
                .ok_or_else(|| {
                    StorageError::Engine(EngineError::Corruption(format!(
                        "mapped result carries an invalid timestamp {}",
                        timestamp_millis
                    )))
                })?;
            let data = if load_data {
                Some(decode_payload(bytes_column(
                    &row,
                    columns.data,
                    "mapped_results",
                )?)?)
            } else {
                None
            };
            infos.push(MappedResultInfo {
                reduce_key: text_column(&row, columns.reduce_key, "mapped_results")?.to_string(),
                reduce_group_id: int_column(&row, columns.reduce_group_id, "mapped_results")?
                    as i32,
                etag: int_column(&row, columns.etag, "mapped_results")? as u64,
                timestamp,
                data,
            });
        }
        Ok(infos.into_iter())
    }

    fn mapped_row(&self, row_id: u64) -> StorageResult<std::sync::Arc<Row>> {
        self.get_row(TableId::MappedResults, row_id)
            .ok_or_else(|| {
                StorageError::Engine(EngineError::RowNotFound {
                    table: "mapped_results",
                    row_id,
                })
            })
    }

    fn reduce_row(&self, row_id: u64) -> StorageResult<std::sync::Arc<Row>> {
        self.get_row(TableId::ReduceResults, row_id)
            .ok_or_else(|| {
                StorageError::Engine(EngineError::RowNotFound {
                    table: "reduce_results",
                    row_id,
                })
            })
    }
}

fn encode_payload(data: &serde_json::Value) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(data).map_err(|e| {
        StorageError::Engine(EngineError::Corruption(format!(
            "could not serialize result payload: {}",
            e
        )))
    })
}

fn decode_payload(bytes: &[u8]) -> StorageResult<serde_json::Value> {
    serde_json::from_slice(bytes).map_err(|e| {
        StorageError::Engine(EngineError::Corruption(format!(
            "stored result payload is not valid JSON: {}",
            e
        )))
    })
}
