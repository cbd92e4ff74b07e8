//! Composite connector over an ordered list of sub-connectors.
//!
//! Lookups go to the sub-connectors in priority order and stop at the first
//! hit. Saves fan out to every sub-connector. Sub-connector failures are
//! attributed to the sub-connector that raised them and only fail the
//! composite when no sub-connector can serve the operation.
//!
//! Sub-connectors are listed in `extra_config.connectors`; each one is built
//! through the factory from its own config view, so they share the parent's
//! role and runtime version.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::block::{BlockId, KvBlockPool, LayerIndex};
use crate::cache::state::{StateError, TransferStatus};
use crate::config::{ConnectorConfig, SubConnectorEntry};
use crate::connector::base::{
    BackendStats, BuildContext, ConnectorClass, ConnectorInstance, ConnectorMetadata,
    ConnectorOutput, ConnectorRole, LayerLoadOutcome, RequestInfo, RuntimeVersion,
    SchedulerConnector, TransferEvent, WorkerConnector,
};
use crate::error::{ConfigurationError, Result, TransferError};

pub const MODULE_PATH: &str = "kv_connector::connector::multi";
pub const CLASS_NAME: &str = "MultiConnector";

pub fn class() -> Arc<dyn ConnectorClass> {
    Arc::new(MultiConnectorClass)
}

struct MultiConnectorClass;

impl MultiConnectorClass {
    fn entries(config: &ConnectorConfig) -> Result<Vec<SubConnectorEntry>, ConfigurationError> {
        let invalid = |message: &str| ConfigurationError::InvalidOption {
            connector: config.kv_connector.clone(),
            message: message.to_string(),
        };
        let value = config
            .extra_config
            .get("connectors")
            .ok_or_else(|| invalid("missing 'connectors' list"))?;
        let entries: Vec<SubConnectorEntry> = serde_json::from_value(value.clone())
            .map_err(|e| invalid(&format!("malformed 'connectors' list: {e}")))?;
        if entries.is_empty() {
            return Err(invalid("'connectors' list is empty"));
        }
        Ok(entries)
    }
}

impl ConnectorClass for MultiConnectorClass {
    fn class_name(&self) -> &str {
        CLASS_NAME
    }

    fn supported_versions(&self) -> &[RuntimeVersion] {
        &[RuntimeVersion::Current]
    }

    fn supports_role(&self, _role: ConnectorRole) -> bool {
        true
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<ConnectorInstance> {
        let entries = Self::entries(&ctx.config)?;
        let name = ctx.config.kv_connector.clone();

        let mut instances = Vec::with_capacity(entries.len());
        for entry in &entries {
            let sub = ctx.config.sub_config(entry);
            instances.push(ctx.factory.create(ctx.role, sub)?);
        }
        debug!(connector = %name, children = instances.len(), role = %ctx.role, "Built composite connector");

        Ok(match ctx.role {
            ConnectorRole::Scheduler => ConnectorInstance::Scheduler(Box::new(MultiScheduler::new(
                name,
                instances
                    .into_iter()
                    .filter_map(ConnectorInstance::into_scheduler)
                    .collect(),
            ))),
            ConnectorRole::Worker => ConnectorInstance::Worker(Box::new(MultiWorker::new(
                name,
                instances
                    .into_iter()
                    .filter_map(ConnectorInstance::into_worker)
                    .collect(),
            ))),
        })
    }
}

/// Save outcome of one sub-connector for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveOutcome {
    /// The sub-connector had nothing to save.
    NotRequested,
    Pending,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubSaveReport {
    pub connector: String,
    pub outcome: SaveOutcome,
}

pub struct MultiScheduler {
    name: String,
    children: Vec<Box<dyn SchedulerConnector>>,

    /// Sub-connector supplying each request's external blocks.
    chosen: HashMap<String, usize>,

    /// Failures of lower-priority work, per request: (sub-connector, error).
    partial_failures: HashMap<String, Vec<(String, String)>>,

    /// Reported save results per request, keyed by sub-connector index.
    saves: HashMap<String, BTreeMap<usize, SaveOutcome>>,

    /// Finished requests whose saves are still held by some sub-connector.
    held: HashSet<String>,
}

impl MultiScheduler {
    pub fn new(name: String, children: Vec<Box<dyn SchedulerConnector>>) -> Self {
        Self {
            name,
            children,
            chosen: HashMap::new(),
            partial_failures: HashMap::new(),
            saves: HashMap::new(),
            held: HashSet::new(),
        }
    }

    pub fn children(&self) -> &[Box<dyn SchedulerConnector>] {
        &self.children
    }

    /// Index of the sub-connector chosen to load a request, if any.
    pub fn chosen_connector(&self, request_id: &str) -> Option<usize> {
        self.chosen.get(request_id).copied()
    }

    /// Sub-connector failures that did not fail the request.
    pub fn partial_failures(&self, request_id: &str) -> &[(String, String)] {
        self.partial_failures
            .get(request_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Save outcome of every sub-connector for a request, in priority order.
    pub fn save_report(&self, request_id: &str) -> Vec<SubSaveReport> {
        let recorded = self.saves.get(request_id);
        self.children
            .iter()
            .enumerate()
            .map(|(i, child)| {
                let outcome = match recorded.and_then(|r| r.get(&i)) {
                    Some(outcome) => outcome.clone(),
                    None if child.transfer_status(request_id) == Some(TransferStatus::Saving) => {
                        SaveOutcome::Pending
                    }
                    None => SaveOutcome::NotRequested,
                };
                SubSaveReport {
                    connector: child.name().to_string(),
                    outcome,
                }
            })
            .collect()
    }

    fn record_partial_failure(&mut self, request_id: &str, connector: &str, error: String) {
        self.partial_failures
            .entry(request_id.to_string())
            .or_default()
            .push((connector.to_string(), error));
    }

    fn forget(&mut self, request_id: &str) {
        self.chosen.remove(request_id);
        self.partial_failures.remove(request_id);
        self.saves.remove(request_id);
        self.held.remove(request_id);
    }
}

impl SchedulerConnector for MultiScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_num_new_matched_blocks(
        &mut self,
        request: &RequestInfo,
        num_computed_blocks: usize,
    ) -> Result<usize> {
        let request_id = request.request_id.as_str();
        self.chosen.remove(request_id);

        let mut failures = Vec::new();
        let mut found = None;
        for (i, child) in self.children.iter_mut().enumerate() {
            match child.get_num_new_matched_blocks(request, num_computed_blocks) {
                Ok(0) => {}
                Ok(n) => {
                    found = Some((i, n));
                    break;
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(
                        connector = %self.name,
                        sub_connector = child.name(),
                        request_id,
                        error = %e,
                        "Sub-connector lookup failed"
                    );
                    failures.push((child.name().to_string(), e.to_string()));
                }
            }
        }

        if let Some((i, n)) = found {
            debug!(
                connector = %self.name,
                sub_connector = self.children[i].name(),
                request_id,
                matched = n,
                "External hit"
            );
            self.chosen.insert(request_id.to_string(), i);
        } else if !failures.is_empty() && failures.len() == self.children.len() {
            return Err(TransferError::AllBackendsFailed {
                attempted: self.children.len(),
                failures,
            }
            .into());
        }

        for (connector, error) in failures {
            self.record_partial_failure(request_id, &connector, error);
        }
        Ok(found.map_or(0, |(_, n)| n))
    }

    fn update_state_after_alloc(
        &mut self,
        request: &RequestInfo,
        block_ids: &[BlockId],
        num_external_blocks: usize,
    ) -> Result<()> {
        let request_id = request.request_id.as_str();
        let chosen = self.chosen.get(request_id).copied();
        if num_external_blocks > 0 && chosen.is_none() {
            return Err(StateError::BlockCountMismatch {
                request_id: request_id.to_string(),
                requested: num_external_blocks,
                available: 0,
            }
            .into());
        }

        // The loading sub-connector goes first; its failure fails the allocation.
        if let Some(i) = chosen {
            self.children[i].update_state_after_alloc(request, block_ids, num_external_blocks)?;
        }

        let mut failures = Vec::new();
        for (i, child) in self.children.iter_mut().enumerate() {
            if chosen == Some(i) {
                continue;
            }
            if let Err(e) = child.update_state_after_alloc(request, block_ids, 0) {
                if e.is_cancellation() {
                    return Err(e);
                }
                warn!(
                    connector = %self.name,
                    sub_connector = child.name(),
                    request_id,
                    error = %e,
                    "Sub-connector failed to track request"
                );
                failures.push((child.name().to_string(), e.to_string()));
            }
        }
        for (connector, error) in failures {
            self.record_partial_failure(request_id, &connector, error);
        }
        Ok(())
    }

    fn build_connector_meta(&mut self) -> ConnectorMetadata {
        ConnectorMetadata {
            children: self
                .children
                .iter_mut()
                .map(|child| child.build_connector_meta())
                .collect(),
            ..Default::default()
        }
    }

    fn update_connector_output(&mut self, output: &ConnectorOutput) {
        for (i, (child, child_output)) in self
            .children
            .iter_mut()
            .zip(&output.children)
            .enumerate()
        {
            child.update_connector_output(child_output);

            for event in &child_output.events {
                let outcome = match event {
                    TransferEvent::SaveFinished { .. } => SaveOutcome::Succeeded,
                    TransferEvent::SaveFailed { error, .. } => SaveOutcome::Failed(error.to_string()),
                    _ => continue,
                };
                self.saves
                    .entry(event.request_id().to_string())
                    .or_default()
                    .insert(i, outcome);
            }
        }

        // Finished requests are forgotten once no sub-connector holds them.
        let released: Vec<String> = self
            .held
            .iter()
            .filter(|id| self.children.iter().all(|c| c.transfer_status(id).is_none()))
            .cloned()
            .collect();
        for request_id in released {
            self.forget(&request_id);
        }
    }

    fn request_finished(&mut self, request_id: &str) -> bool {
        let mut held = false;
        for child in self.children.iter_mut() {
            held |= child.request_finished(request_id);
        }
        if held {
            self.held.insert(request_id.to_string());
        } else {
            self.forget(request_id);
        }
        held
    }

    fn cancel_request(&mut self, request_id: &str) -> Vec<BlockId> {
        let mut released: Vec<BlockId> = self
            .children
            .iter_mut()
            .flat_map(|child| child.cancel_request(request_id))
            .collect();
        released.sort_unstable();
        released.dedup();
        self.forget(request_id);
        released
    }

    /// Load progress comes from the chosen sub-connector while it is
    /// unresolved; after that any sub-connector still saving keeps the
    /// request in `Saving`, and one successful save makes it `Saved`.
    fn transfer_status(&self, request_id: &str) -> Option<TransferStatus> {
        let statuses: Vec<TransferStatus> = self
            .children
            .iter()
            .filter_map(|c| c.transfer_status(request_id))
            .collect();
        if statuses.is_empty() {
            return None;
        }

        if let Some(chosen) = self.chosen.get(request_id) {
            if let Some(status) = self.children[*chosen].transfer_status(request_id) {
                if !status.is_load_resolved() {
                    return Some(status);
                }
            }
        }
        for status in [
            TransferStatus::Saving,
            TransferStatus::Saved,
            TransferStatus::SaveFailed,
        ] {
            if statuses.contains(&status) {
                return Some(status);
            }
        }
        self.chosen
            .get(request_id)
            .and_then(|&i| self.children[i].transfer_status(request_id))
            .or_else(|| statuses.first().copied())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MultiWorker {
    name: String,
    children: Vec<Box<dyn WorkerConnector>>,
}

impl MultiWorker {
    pub fn new(name: String, children: Vec<Box<dyn WorkerConnector>>) -> Self {
        Self { name, children }
    }

    pub fn children(&self) -> &[Box<dyn WorkerConnector>] {
        &self.children
    }

    /// Fail only when every sub-connector failed.
    fn aggregate(&self, operation: &str, results: Vec<Result<()>>) -> Result<()> {
        let failures: Vec<(String, String)> = self
            .children
            .iter()
            .zip(results)
            .filter_map(|(child, result)| {
                result.err().map(|e| (child.name().to_string(), e.to_string()))
            })
            .collect();
        for (sub_connector, error) in &failures {
            warn!(connector = %self.name, sub_connector = %sub_connector, error = %error, operation, "Sub-connector failed");
        }
        if !failures.is_empty() && failures.len() == self.children.len() {
            return Err(TransferError::AllBackendsFailed {
                attempted: self.children.len(),
                failures,
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerConnector for MultiWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_kv_caches(&self, pool: Arc<KvBlockPool>) -> Result<()> {
        for child in &self.children {
            child.register_kv_caches(pool.clone())?;
        }
        Ok(())
    }

    fn bind_connector_metadata(&self, metadata: ConnectorMetadata) -> Result<()> {
        let mut children = metadata.children;
        if children.is_empty() {
            children.resize_with(self.children.len(), ConnectorMetadata::default);
        }
        if children.len() != self.children.len() {
            return Err(ConfigurationError::InvalidOption {
                connector: self.name.clone(),
                message: format!(
                    "metadata has {} children for {} sub-connectors",
                    children.len(),
                    self.children.len()
                ),
            }
            .into());
        }
        for (child, meta) in self.children.iter().zip(children) {
            child.bind_connector_metadata(meta)?;
        }
        Ok(())
    }

    fn start_load_kv(&self) -> Result<()> {
        let results = self.children.iter().map(|c| c.start_load_kv()).collect();
        self.aggregate("start_load_kv", results)
    }

    async fn wait_for_layer_load(&self, layer: LayerIndex, block_ids: &[BlockId]) -> LayerLoadOutcome {
        let outcomes = join_all(
            self.children
                .iter()
                .map(|child| child.wait_for_layer_load(layer, block_ids)),
        )
        .await;
        let mut merged = LayerLoadOutcome::default();
        for outcome in outcomes {
            merged.merge(outcome);
        }
        merged
    }

    fn save_kv_layer(&self, layer: LayerIndex) -> Result<()> {
        let results = self.children.iter().map(|c| c.save_kv_layer(layer)).collect();
        self.aggregate("save_kv_layer", results)
    }

    async fn wait_for_save(&self) {
        join_all(self.children.iter().map(|child| child.wait_for_save())).await;
    }

    fn get_finished(&self) -> ConnectorOutput {
        ConnectorOutput {
            events: Vec::new(),
            children: self.children.iter().map(|c| c.get_finished()).collect(),
        }
    }

    fn cancel_request(&self, request_id: &str) {
        for child in &self.children {
            child.cancel_request(request_id);
        }
    }

    fn clear_connector_metadata(&self) {
        for child in &self.children {
            child.clear_connector_metadata();
        }
    }

    fn backend_stats(&self) -> Vec<BackendStats> {
        self.children.iter().flat_map(|c| c.backend_stats()).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
