#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use trellis_core::{
    clock::ManualClock,
    config::{DatasetConfig, OrchestratorConfig},
    dataset::{Dataset, NewDataset, record::DatasetParameters, result_file::FsResultStore},
    error::{OrchestrationError, Result},
    modules::{
        ModuleRegistry, ProcessOutcome, Processor, ProcessorContext, ProcessorDescriptor,
        WorkContext, WorkOutcome, Worker, WorkerDescriptor,
    },
    orchestration::{interrupt::InterruptLevel, runtime::WorkerLoop},
    service::Orchestrator,
    store::MemoryStore,
};

pub const START: i64 = 1_000;

/// Writes `rows` lines to the result file.
pub struct WriteRows(pub i64);

#[async_trait]
impl Processor for WriteRows {
    async fn process(&self, ctx: &mut ProcessorContext) -> Result<ProcessOutcome> {
        ctx.update_status("Writing rows").await?;
        let mut file = ctx.open_result().await?;
        for row in 0..self.0 {
            ctx.checkpoint()?;
            file.write_all(format!("row {row}\n").as_bytes()).await?;
            ctx.record_rows(row + 1);
        }
        file.flush().await?;
        Ok(ProcessOutcome::Finished { rows: self.0 })
    }
}

/// Writes two rows, then interrupts itself at the given level.
pub struct StopsItself(pub InterruptLevel);

#[async_trait]
impl Processor for StopsItself {
    async fn process(&self, ctx: &mut ProcessorContext) -> Result<ProcessOutcome> {
        let mut file = ctx.open_result().await?;
        file.write_all(b"a\nb\n").await?;
        file.flush().await?;
        ctx.record_rows(2);
        ctx.interrupt().interrupt(self.0);
        ctx.checkpoint()?;
        Ok(ProcessOutcome::Finished { rows: 2 })
    }
}

/// Blocks until interrupted from outside.
pub struct WaitsForInterrupt;

#[async_trait]
impl Processor for WaitsForInterrupt {
    async fn process(&self, ctx: &mut ProcessorContext) -> Result<ProcessOutcome> {
        ctx.interrupt().interrupted().await;
        ctx.checkpoint()?;
        Ok(ProcessOutcome::Finished { rows: 0 })
    }
}

/// Reports one more status after being interrupted, then stops.
pub struct Lingers;

#[async_trait]
impl Processor for Lingers {
    async fn process(&self, ctx: &mut ProcessorContext) -> Result<ProcessOutcome> {
        ctx.interrupt().interrupted().await;
        ctx.update_status("Wrapping up").await?;
        ctx.checkpoint()?;
        Ok(ProcessOutcome::Finished { rows: 0 })
    }
}

pub struct Fails;

#[async_trait]
impl Processor for Fails {
    async fn process(&self, _ctx: &mut ProcessorContext) -> Result<ProcessOutcome> {
        Err(OrchestrationError::external("upstream API returned 503"))
    }
}

pub struct Panics;

#[async_trait]
impl Processor for Panics {
    async fn process(&self, _ctx: &mut ProcessorContext) -> Result<ProcessOutcome> {
        panic!("processor bug");
    }
}

/// Maintenance worker steered by its job details: `{"outcome": "release"}`
/// hands the job back, `"fail"` errors, anything else completes.
pub struct Maintenance;

#[async_trait]
impl Worker for Maintenance {
    async fn work(&self, ctx: WorkContext) -> Result<WorkOutcome> {
        match ctx.job.details.get("outcome").and_then(|v| v.as_str()) {
            Some("release") => Ok(WorkOutcome::Release { delay: 5 }),
            Some("fail") => Err(OrchestrationError::external("disk full")),
            _ => Ok(WorkOutcome::Done),
        }
    }
}

pub fn registry() -> ModuleRegistry {
    ModuleRegistry::builder()
        .processor(
            ProcessorDescriptor::new("forum-search", Arc::new(WriteRows(3)))
                .extension("ndjson")
                .version("2.1.0"),
        )
        .processor(ProcessorDescriptor::new("empty-search", Arc::new(WriteRows(0))))
        .processor(ProcessorDescriptor::new("count-posts", Arc::new(WriteRows(1))))
        .processor(
            ProcessorDescriptor::new("word-tree", Arc::new(WriteRows(1)))
                .compatible_with(|_, _| true)
                .with_options(),
        )
        .processor(ProcessorDescriptor::new("stop-finish", Arc::new(StopsItself(InterruptLevel::Finish))))
        .processor(ProcessorDescriptor::new("stop-abort", Arc::new(StopsItself(InterruptLevel::Abort))))
        .processor(ProcessorDescriptor::new("stop-retry", Arc::new(StopsItself(InterruptLevel::Retry))))
        .processor(ProcessorDescriptor::new("slow", Arc::new(WaitsForInterrupt)))
        .processor(ProcessorDescriptor::new("lingering", Arc::new(Lingers)))
        .processor(ProcessorDescriptor::new("failing", Arc::new(Fails)))
        .processor(ProcessorDescriptor::new("crashing", Arc::new(Panics)))
        .worker(WorkerDescriptor::new("expire-datasets", Arc::new(Maintenance)))
        .build()
        .expect("test registry is valid")
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub results: Arc<FsResultStore>,
    pub orchestrator: Orchestrator,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    pub fn with_datasets(datasets: DatasetConfig) -> Self {
        Self::with_config(OrchestratorConfig {
            datasets,
            ..OrchestratorConfig::default()
        })
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let results = Arc::new(FsResultStore::new(dir.path()));
        let orchestrator = Orchestrator::new(
            store.clone(),
            results.clone(),
            clock.clone(),
            Arc::new(registry()),
            config,
        );
        Self {
            store,
            clock,
            results,
            orchestrator,
            _dir: dir,
        }
    }

    pub async fn dataset(&self, dataset_type: &str, label: &str) -> Dataset {
        self.create(NewDataset::new(dataset_type, DatasetParameters::default().with_label(label)))
            .await
    }

    pub async fn child(&self, parent: &Dataset, dataset_type: &str, creator: Option<&str>) -> Dataset {
        let mut new =
            NewDataset::new(dataset_type, DatasetParameters::default()).parent(parent.key());
        if let Some(creator) = creator {
            new = new.creator(creator);
        }
        self.create(new).await
    }

    pub async fn create(&self, new: NewDataset) -> Dataset {
        self.orchestrator
            .create_dataset(new)
            .await
            .expect("dataset created")
    }

    pub async fn reload(&self, dataset: &Dataset) -> Dataset {
        self.orchestrator
            .get_dataset(dataset.key())
            .await
            .expect("dataset exists")
    }

    pub fn worker(&self, jobtype: &str) -> WorkerLoop {
        self.orchestrator
            .worker_manager()
            .worker_loop(jobtype, 0)
            .expect("job type is registered")
    }
}
