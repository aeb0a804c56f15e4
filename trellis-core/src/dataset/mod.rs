//! Datasets: the rows processors produce, and the tree they form.
//!
//! A [`Dataset`] is a loaded row plus the collaborators needed to change it.
//! Every mutation is a single-row store write issued immediately; the
//! in-memory copy is updated alongside.

pub mod genealogy;
pub mod key;
pub mod ownership;
pub mod record;
pub mod result_file;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use futures::future::BoxFuture;
use rand::Rng;
use tracing::{debug, info};

use self::key::get_key;
use self::record::{
    ANONYMOUS_OWNER, DatasetParameters, DatasetPatch, DatasetRecord, OwnerRole,
};
use self::result_file::{ResultStore, log_name, result_stem};
use crate::{
    clock::Clock,
    config::{DatasetConfig, KeyCollisionPolicy},
    error::{OrchestrationError, Result},
    modules::{ModuleRegistry, ProcessorDescriptor},
    store::Store,
    users::User,
};

/// Collaborators every [`Dataset`] carries.
#[derive(Clone)]
pub struct DatasetContext {
    pub store: Arc<dyn Store>,
    pub results: Arc<dyn ResultStore>,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<ModuleRegistry>,
    pub config: DatasetConfig,
}

impl fmt::Debug for DatasetContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetContext")
            .field("store", &self.store)
            .field("results", &self.results)
            .field("config", &self.config)
            .finish()
    }
}

/// Request for [`Dataset::create`].
#[derive(Clone, Debug, Default)]
pub struct NewDataset {
    pub dataset_type: String,
    pub parameters: DatasetParameters,
    pub parent: Option<String>,
    pub creator: Option<String>,
    /// Query label; defaults to the `label` parameter, then the dataset type.
    pub query: Option<String>,
    /// Result extension; defaults to the processor's.
    pub extension: Option<String>,
    pub is_private: bool,
}

impl NewDataset {
    pub fn new(dataset_type: impl Into<String>, parameters: DatasetParameters) -> Self {
        Self {
            dataset_type: dataset_type.into(),
            parameters,
            is_private: true,
            ..Self::default()
        }
    }

    pub fn parent(mut self, key: impl Into<String>) -> Self {
        self.parent = Some(key.into());
        self
    }

    pub fn creator(mut self, name: impl Into<String>) -> Self {
        self.creator = Some(name.into());
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn private(mut self, is_private: bool) -> Self {
        self.is_private = is_private;
        self
    }
}

fn reroll_offset() -> i64 {
    rand::rng().random_range(1..=10)
}

pub struct Dataset {
    record: DatasetRecord,
    /// Direct owners, `tag:` entries included.
    owners: BTreeMap<String, OwnerRole>,
    /// Users reached through `tag:` owners.
    tagged_owners: BTreeMap<String, OwnerRole>,
    genealogy: Option<Vec<DatasetRecord>>,
    preset_parents: Option<Vec<String>>,
    /// Set once a final status was written; later updates are ignored.
    final_status: bool,
    ctx: DatasetContext,
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("key", &self.record.key)
            .field("type", &self.record.dataset_type)
            .field("status", &self.record.status)
            .field("is_finished", &self.record.is_finished)
            .field("owners", &self.owners)
            .finish()
    }
}

impl Dataset {
    /// Create and persist a dataset, reserve its result file and assign
    /// owners: the parent's owners, then the creator (or `anonymous`).
    pub async fn create(ctx: DatasetContext, new: NewDataset) -> Result<Dataset> {
        let policy = ctx.config.key_collision;
        Self::create_with_policy(ctx, new, policy).await
    }

    async fn create_with_policy(
        ctx: DatasetContext,
        new: NewDataset,
        policy: KeyCollisionPolicy,
    ) -> Result<Dataset> {
        let query = new
            .query
            .clone()
            .or_else(|| new.parameters.label.clone())
            .unwrap_or_else(|| new.dataset_type.clone());

        let parent = match new.parent.as_deref().filter(|key| !key.is_empty()) {
            Some(key) => Some(ctx.store.dataset(key).await?.ok_or_else(|| {
                OrchestrationError::NotFound(format!("parent dataset {key}"))
            })?),
            None => None,
        };

        let now = ctx.clock.now();
        let mut salt = now;
        let key = loop {
            let key = get_key(&query, &new.parameters, new.parent.as_deref(), salt);
            let Some(existing) = ctx.store.dataset(&key).await? else {
                break key;
            };
            match policy {
                KeyCollisionPolicy::ReuseExisting => {
                    debug!(dataset = %key, "dataset already exists, reusing");
                    return Self::from_record(ctx, existing).await;
                }
                KeyCollisionPolicy::Reject => {
                    return Err(OrchestrationError::DuplicateDataset(key));
                }
                KeyCollisionPolicy::Reroll => salt += reroll_offset(),
            }
        };

        let record = DatasetRecord {
            key: key.clone(),
            query,
            parameters: new.parameters.clone(),
            result_file: String::new(),
            creator: new.creator.clone().unwrap_or_default(),
            status: String::new(),
            dataset_type: new.dataset_type.clone(),
            timestamp: now,
            is_finished: false,
            is_private: new.is_private,
            software_version: ctx.config.software_version.clone(),
            software_file: String::new(),
            num_rows: 0,
            progress: 0.0,
            key_parent: parent
                .as_ref()
                .map(|parent| parent.key.clone())
                .unwrap_or_default(),
            job: None,
        };

        match ctx.store.insert_dataset(&record).await {
            Ok(()) => {}
            Err(OrchestrationError::DuplicateDataset(_))
                if policy == KeyCollisionPolicy::ReuseExisting =>
            {
                return Self::get(ctx, &key).await;
            }
            Err(err) => return Err(err),
        }

        if let Some(parent) = &parent {
            for (name, role) in ctx.store.dataset_owners(&parent.key).await? {
                ctx.store.upsert_owner(&key, &name, role).await?;
            }
        }
        if let Some(creator) = new.creator.as_deref().filter(|name| !name.is_empty()) {
            ctx.store.upsert_owner(&key, creator, OwnerRole::Owner).await?;
        }
        if ctx.store.dataset_owners(&key).await?.is_empty() {
            ctx.store
                .upsert_owner(&key, ANONYMOUS_OWNER, OwnerRole::Owner)
                .await?;
        }

        let extension = new
            .extension
            .clone()
            .or_else(|| {
                ctx.registry
                    .processor(&new.dataset_type)
                    .map(|processor| processor.extension.clone())
            })
            .unwrap_or_else(|| ctx.config.default_extension.clone());

        let mut dataset = Self::from_record(ctx, record).await?;
        dataset.reserve_result_file(&extension).await?;
        info!(dataset = %dataset.key(), dataset_type = %dataset.dataset_type(), parent = %dataset.key_parent(), "dataset created");
        Ok(dataset)
    }

    pub async fn get(ctx: DatasetContext, key: &str) -> Result<Dataset> {
        let record = ctx
            .store
            .dataset(key)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("dataset {key}")))?;
        Self::from_record(ctx, record).await
    }

    pub(crate) async fn from_record(ctx: DatasetContext, record: DatasetRecord) -> Result<Dataset> {
        let mut dataset = Dataset {
            record,
            owners: BTreeMap::new(),
            tagged_owners: BTreeMap::new(),
            genealogy: None,
            preset_parents: None,
            final_status: false,
            ctx,
        };
        dataset.refresh_owners().await?;
        Ok(dataset)
    }

    pub fn key(&self) -> &str {
        &self.record.key
    }

    pub fn record(&self) -> &DatasetRecord {
        &self.record
    }

    pub fn dataset_type(&self) -> &str {
        &self.record.dataset_type
    }

    pub fn parameters(&self) -> &DatasetParameters {
        &self.record.parameters
    }

    pub fn status(&self) -> &str {
        &self.record.status
    }

    pub fn label(&self) -> &str {
        self.record.label()
    }

    pub fn creator(&self) -> &str {
        &self.record.creator
    }

    pub fn key_parent(&self) -> &str {
        &self.record.key_parent
    }

    pub fn result_file(&self) -> &str {
        &self.record.result_file
    }

    pub fn num_rows(&self) -> i64 {
        self.record.num_rows
    }

    pub fn progress(&self) -> f64 {
        self.record.progress
    }

    pub fn job_id(&self) -> Option<i64> {
        self.record.job
    }

    pub fn is_finished(&self) -> bool {
        self.record.is_finished
    }

    pub fn is_top_dataset(&self) -> bool {
        self.record.is_top_dataset()
    }

    pub fn is_preset(&self) -> bool {
        self.record.is_preset()
    }

    pub fn context(&self) -> &DatasetContext {
        &self.ctx
    }

    pub fn results(&self) -> &Arc<dyn ResultStore> {
        &self.ctx.results
    }

    pub fn results_path(&self) -> Option<PathBuf> {
        (!self.record.result_file.is_empty())
            .then(|| self.ctx.results.path_of(&self.record.result_file))
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        (!self.record.result_file.is_empty())
            .then(|| self.ctx.results.path_of(&log_name(&self.record.result_file)))
    }

    /// Re-read the row, dropping cached genealogy.
    pub async fn reload(&mut self) -> Result<()> {
        self.record = self
            .ctx
            .store
            .dataset(&self.record.key)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("dataset {}", self.record.key)))?;
        self.genealogy = None;
        self.preset_parents = None;
        Ok(())
    }

    async fn write(&self, patch: DatasetPatch) -> Result<u64> {
        self.ctx.store.update_dataset(&self.record.key, &patch).await
    }

    /// Pick and persist the result file name. A dataset reserves exactly once.
    pub async fn reserve_result_file(&mut self, extension: &str) -> Result<String> {
        if !self.record.result_file.is_empty() {
            return Err(OrchestrationError::InvalidState(format!(
                "dataset {} already reserved {}",
                self.record.key, self.record.result_file
            )));
        }
        let name = self
            .ctx
            .results
            .reserve_path(&result_stem(&self.record), extension)
            .await?;
        self.write(DatasetPatch {
            result_file: Some(name.clone()),
            ..DatasetPatch::default()
        })
        .await?;
        self.record.result_file = name.clone();
        Ok(name)
    }

    /// Append a timestamped line to the dataset log.
    pub async fn log(&self, message: &str) -> Result<()> {
        append_log(&self.ctx, &self.record, message).await
    }

    /// Presets above this dataset that are still running, nearest last.
    async fn preset_parents(&mut self) -> Result<Vec<String>> {
        if let Some(keys) = &self.preset_parents {
            return Ok(keys.clone());
        }
        let genealogy = self.get_genealogy().await?;
        let keys: Vec<String> = genealogy[..genealogy.len().saturating_sub(1)]
            .iter()
            .filter(|ancestor| ancestor.is_preset() && !ancestor.is_finished)
            .map(|ancestor| ancestor.key.clone())
            .collect();
        self.preset_parents = Some(keys.clone());
        Ok(keys)
    }

    /// Write the status, mirror it to the log and to unfinished presets
    /// above. After a final status, further updates are ignored. Once the
    /// row is gone nothing is written, so a deleted dataset gets no new log.
    pub async fn update_status(&mut self, status: &str, is_final: bool) -> Result<bool> {
        if self.final_status {
            return Ok(false);
        }

        let updated = self.write(DatasetPatch::status(status)).await?;
        if updated == 0 {
            debug!(dataset = %self.record.key, "dataset row gone, status dropped");
            return Ok(false);
        }
        self.record.status = status.to_string();
        if is_final {
            self.final_status = true;
        }

        for key in self.preset_parents().await? {
            if let Some(preset) = self.ctx.store.dataset(&key).await?
                && !preset.is_finished
            {
                self.ctx
                    .store
                    .update_dataset(&key, &DatasetPatch::status(status))
                    .await?;
                append_log(&self.ctx, &preset, status).await?;
            }
        }

        self.log(status).await?;
        Ok(true)
    }

    /// Progress in `[0, 1]`, mirrored to unfinished presets above.
    pub async fn update_progress(&mut self, progress: f64) -> Result<bool> {
        let progress = progress.clamp(0.0, 1.0);
        for key in self.preset_parents().await? {
            if let Some(preset) = self.ctx.store.dataset(&key).await?
                && !preset.is_finished
            {
                self.ctx
                    .store
                    .update_dataset(&key, &DatasetPatch::progress(progress))
                    .await?;
            }
        }
        let updated = self.write(DatasetPatch::progress(progress)).await?;
        self.record.progress = progress;
        Ok(updated > 0)
    }

    /// Mark the dataset finished with `num_rows` rows.
    ///
    /// Finishing twice means two workers executed the same dataset, so it
    /// fails loudly with `InvalidState`.
    pub async fn finish(&mut self, num_rows: i64) -> Result<()> {
        if self.record.is_finished {
            return Err(OrchestrationError::InvalidState(format!(
                "dataset {} is already finished",
                self.record.key
            )));
        }
        self.write(DatasetPatch {
            is_finished: Some(true),
            num_rows: Some(num_rows),
            progress: Some(1.0),
            ..DatasetPatch::default()
        })
        .await?;
        self.record.is_finished = true;
        self.record.num_rows = num_rows;
        self.record.progress = 1.0;
        debug!(dataset = %self.record.key, num_rows, "dataset finished");
        Ok(())
    }

    /// Final status `message`, finished with zero rows.
    pub async fn finish_with_error(&mut self, message: &str) -> Result<()> {
        self.update_status(message, true).await?;
        self.finish(0).await
    }

    /// Reset a finished dataset so it can be processed again. The old result
    /// file is removed; its name stays reserved on the row.
    pub async fn unfinish(&mut self) -> Result<()> {
        if !self.record.is_finished {
            return Err(OrchestrationError::InvalidState(format!(
                "dataset {} is not finished",
                self.record.key
            )));
        }
        if !self.record.result_file.is_empty() {
            self.ctx.results.delete(&self.record.result_file).await?;
        }

        let now = self.ctx.clock.now();
        self.write(DatasetPatch {
            timestamp: Some(now),
            is_finished: Some(false),
            num_rows: Some(0),
            status: Some(String::new()),
            progress: Some(0.0),
            ..DatasetPatch::default()
        })
        .await?;
        self.record.timestamp = now;
        self.record.is_finished = false;
        self.record.num_rows = 0;
        self.record.status.clear();
        self.record.progress = 0.0;
        self.final_status = false;
        Ok(())
    }

    /// Delete this dataset and every descendant, deepest first: queued jobs,
    /// owners, favourites, result and log files, then the row.
    pub async fn delete(self) -> Result<()> {
        let mut doomed = vec![self.record.clone()];
        doomed.extend(self.descendant_records().await?);

        for record in doomed.iter().rev() {
            delete_record(&self.ctx, record).await?;
        }
        info!(dataset = %self.record.key, deleted = doomed.len(), "dataset deleted");
        Ok(())
    }

    /// Duplicate this dataset with its result, log and owners. The copy
    /// records where it came from in `copied_from`. Unless `shallow`, the
    /// whole subtree is copied beneath the new dataset.
    pub fn copy(&self, shallow: bool) -> BoxFuture<'_, Result<Dataset>> {
        Box::pin(async move {
            let mut parameters = self.record.parameters.clone();
            parameters.copied_from = Some(self.record.key.clone());
            let extension = Path::new(&self.record.result_file)
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned());

            let mut new = NewDataset::new(self.record.dataset_type.clone(), parameters)
                .query(self.record.query.clone())
                .private(self.record.is_private);
            new.extension = extension;
            if !self.record.creator.is_empty() {
                new.creator = Some(self.record.creator.clone());
            }
            if !self.record.key_parent.is_empty() {
                new.parent = Some(self.record.key_parent.clone());
            }

            let mut copy =
                Self::create_with_policy(self.ctx.clone(), new, KeyCollisionPolicy::Reroll)
                    .await?;

            copy.write(DatasetPatch {
                status: Some(self.record.status.clone()),
                is_finished: Some(self.record.is_finished),
                num_rows: Some(self.record.num_rows),
                progress: Some(self.record.progress),
                software_version: Some(self.record.software_version.clone()),
                software_file: Some(self.record.software_file.clone()),
                ..DatasetPatch::default()
            })
            .await?;
            copy.record.status = self.record.status.clone();
            copy.record.is_finished = self.record.is_finished;
            copy.record.num_rows = self.record.num_rows;
            copy.record.progress = self.record.progress;
            copy.record.software_version = self.record.software_version.clone();
            copy.record.software_file = self.record.software_file.clone();

            let results = &self.ctx.results;
            if !self.record.result_file.is_empty() {
                if results.exists(&self.record.result_file).await? {
                    results
                        .copy(&self.record.result_file, &copy.record.result_file)
                        .await?;
                }
                let log = log_name(&self.record.result_file);
                if results.exists(&log).await? {
                    results.copy(&log, &log_name(&copy.record.result_file)).await?;
                }
            }

            for (name, role) in &self.owners {
                self.ctx.store.upsert_owner(copy.key(), name, *role).await?;
            }
            copy.refresh_owners().await?;

            if !shallow {
                for child in self.get_children().await? {
                    let mut child_copy = child.copy(false).await?;
                    child_copy.link_parent(copy.key()).await?;
                }
            }

            Ok(copy)
        })
    }

    /// Take over `source`'s result as this dataset's own and finish with its
    /// row count. Presets receive the output of their last pipeline step
    /// this way. The reserved name follows the source's extension.
    pub async fn attach_result_from(&mut self, source: &Dataset) -> Result<()> {
        let results = self.ctx.results.clone();
        let source_file = source.result_file();

        if !source_file.is_empty() && results.exists(source_file).await? {
            let extension = Path::new(source_file)
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.ctx.config.default_extension.clone());

            if self.record.result_file.is_empty() {
                self.reserve_result_file(&extension).await?;
            } else if Path::new(&self.record.result_file).extension()
                != Path::new(source_file).extension()
            {
                let renamed = Path::new(&self.record.result_file)
                    .with_extension(&extension)
                    .to_string_lossy()
                    .into_owned();
                results.delete(&self.record.result_file).await?;
                self.write(DatasetPatch {
                    result_file: Some(renamed.clone()),
                    ..DatasetPatch::default()
                })
                .await?;
                self.record.result_file = renamed;
            }
            results.copy(source_file, &self.record.result_file).await?;
        }

        if !self.record.is_finished {
            self.update_status(source.status(), false).await?;
            self.finish(source.num_rows()).await?;
        }
        Ok(())
    }

    pub async fn update_label(&mut self, label: &str) -> Result<String> {
        let mut parameters = self.record.parameters.clone();
        parameters.label = Some(label.to_string());
        self.write(DatasetPatch {
            parameters: Some(parameters.clone()),
            ..DatasetPatch::default()
        })
        .await?;
        self.record.parameters = parameters;
        Ok(label.to_string())
    }

    /// Record the software that produced this dataset.
    pub async fn update_version(&mut self, version: &str, software_file: &str) -> Result<()> {
        self.write(DatasetPatch {
            software_version: Some(version.to_string()),
            software_file: Some(software_file.to_string()),
            ..DatasetPatch::default()
        })
        .await?;
        self.record.software_version = version.to_string();
        self.record.software_file = software_file.to_string();
        Ok(())
    }

    pub async fn link_job(&mut self, job_id: i64) -> Result<()> {
        self.write(DatasetPatch {
            job: Some(Some(job_id)),
            ..DatasetPatch::default()
        })
        .await?;
        self.record.job = Some(job_id);
        Ok(())
    }

    /// Move this dataset under `key_parent` (empty for top-level).
    pub async fn link_parent(&mut self, key_parent: &str) -> Result<()> {
        self.write(DatasetPatch {
            key_parent: Some(key_parent.to_string()),
            ..DatasetPatch::default()
        })
        .await?;
        self.record.key_parent = key_parent.to_string();
        self.genealogy = None;
        self.preset_parents = None;
        Ok(())
    }

    /// Make this a top-level dataset.
    pub async fn detach(&mut self) -> Result<()> {
        self.link_parent("").await
    }

    pub fn get_own_processor(&self) -> Option<&ProcessorDescriptor> {
        self.ctx.registry.processor(&self.record.dataset_type)
    }

    pub fn get_compatible_processors(
        &self,
        user: Option<&User>,
    ) -> BTreeMap<String, &ProcessorDescriptor> {
        self.ctx.registry.get_compatible_processors(&self.record, user)
    }

    pub async fn get_available_processors(
        &self,
        user: Option<&User>,
        exclude_hidden: bool,
    ) -> Result<BTreeMap<String, &ProcessorDescriptor>> {
        let children = self.ctx.store.child_datasets(&self.record.key).await?;
        Ok(self
            .ctx
            .registry
            .get_available_processors(&self.record, &children, user, exclude_hidden))
    }

    pub async fn add_favourite(&self, user: &str) -> Result<()> {
        self.ctx.store.add_favourite(user, &self.record.key).await
    }
}

async fn append_log(ctx: &DatasetContext, record: &DatasetRecord, message: &str) -> Result<()> {
    if record.result_file.is_empty() {
        return Ok(());
    }
    let stamp = DateTime::from_timestamp(ctx.clock.now(), 0)
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    ctx.results
        .append_log(&log_name(&record.result_file), &format!("{stamp}: {message}"))
        .await
}

async fn delete_record(ctx: &DatasetContext, record: &DatasetRecord) -> Result<()> {
    ctx.store.delete_jobs_for_remote_id(&record.key).await?;
    ctx.store.remove_all_owners(&record.key).await?;
    ctx.store.remove_favourites(&record.key).await?;
    if !record.result_file.is_empty() {
        ctx.results.delete(&record.result_file).await?;
        ctx.results.delete(&log_name(&record.result_file)).await?;
    }
    ctx.store.delete_dataset(&record.key).await?;
    debug!(dataset = %record.key, "dataset row deleted");
    Ok(())
}
