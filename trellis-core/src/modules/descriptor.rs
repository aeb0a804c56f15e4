use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::context::{ProcessorContext, WorkContext};
use crate::{dataset::record::DatasetRecord, error::Result, users::User};

/// What a processor reports when it returns normally.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessOutcome {
    /// The result file is complete with `rows` rows.
    Finished { rows: i64 },
    /// The dataset is completed by someone else later, as presets are once
    /// the last step of their pipeline attaches its result.
    Deferred,
}

/// Processes the dataset a job points at and writes its result file.
///
/// Long-running implementations call [`ProcessorContext::checkpoint`] at
/// yield points and propagate its error with `?`.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: &mut ProcessorContext) -> Result<ProcessOutcome>;
}

/// What a plain worker wants done with its job afterwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkOutcome {
    /// Finish the job: delete one-shot rows, reset recurring ones.
    Done,
    /// Hand the job back, claimable again after `delay` seconds.
    Release { delay: i64 },
}

/// Job handler that does not produce a dataset, such as maintenance tasks
/// and queue control jobs.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn work(&self, ctx: WorkContext) -> Result<WorkOutcome>;
}

pub type CompatibilityFn = Arc<dyn Fn(&DatasetRecord, Option<&User>) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ProcessorDescriptor {
    /// Dataset type and job type this processor services.
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    /// Extension of the result file, without the dot.
    pub extension: String,
    pub version: String,
    /// Parallel instances to run; `None` defers to configuration.
    pub max_instances: Option<usize>,
    pub is_hidden: bool,
    /// Whether the processor takes user options. Option-less processors are
    /// only offered once per dataset.
    pub has_options: bool,
    /// Processor ids never offered as follow-ups of this processor's output.
    pub excluded_followups: Vec<String>,
    pub compatible_with: Option<CompatibilityFn>,
    pub processor: Arc<dyn Processor>,
}

impl fmt::Debug for ProcessorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorDescriptor")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("category", &self.category)
            .field("extension", &self.extension)
            .field("max_instances", &self.max_instances)
            .field("is_hidden", &self.is_hidden)
            .field("has_options", &self.has_options)
            .field("has_compatibility_check", &self.compatible_with.is_some())
            .finish()
    }
}

impl ProcessorDescriptor {
    pub fn new(id: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            description: String::new(),
            category: String::new(),
            extension: "csv".to_string(),
            version: String::new(),
            max_instances: None,
            is_hidden: false,
            has_options: false,
            excluded_followups: Vec::new(),
            compatible_with: None,
            processor,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn max_instances(mut self, instances: usize) -> Self {
        self.max_instances = Some(instances);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.is_hidden = true;
        self
    }

    pub fn with_options(mut self) -> Self {
        self.has_options = true;
        self
    }

    pub fn exclude_followup(mut self, processor_id: impl Into<String>) -> Self {
        self.excluded_followups.push(processor_id.into());
        self
    }

    pub fn compatible_with<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DatasetRecord, Option<&User>) -> bool + Send + Sync + 'static,
    {
        self.compatible_with = Some(Arc::new(predicate));
        self
    }

    /// Datasource collectors create top-level datasets and are never offered
    /// as analyses.
    pub fn is_collector(&self) -> bool {
        self.id.ends_with("-search") || self.id.ends_with("-import")
    }

    pub fn excludes_followup(&self, processor_id: &str) -> bool {
        self.excluded_followups.iter().any(|id| id == processor_id)
    }
}

#[derive(Clone, Debug)]
pub struct DatasourceDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl DatasourceDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Processor that collects this datasource's datasets.
    pub fn search_processor_id(&self) -> String {
        format!("{}-search", self.id)
    }
}

#[derive(Clone)]
pub struct WorkerDescriptor {
    /// Job type this worker services.
    pub id: String,
    pub max_instances: Option<usize>,
    pub worker: Arc<dyn Worker>,
}

impl fmt::Debug for WorkerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDescriptor")
            .field("id", &self.id)
            .field("max_instances", &self.max_instances)
            .finish()
    }
}

impl WorkerDescriptor {
    pub fn new(id: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self {
            id: id.into(),
            max_instances: None,
            worker,
        }
    }

    pub fn max_instances(mut self, instances: usize) -> Self {
        self.max_instances = Some(instances);
        self
    }
}
