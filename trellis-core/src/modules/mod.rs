//! Registry of processors, datasources and plain workers.
//!
//! Built once at start-up through [`ModuleRegistryBuilder`] and shared as an
//! `Arc<ModuleRegistry>`; nothing mutates it afterwards.

pub mod context;
pub mod descriptor;

use std::collections::BTreeMap;

use tracing::warn;

pub use context::{ProcessorContext, WorkContext};
pub use descriptor::{
    CompatibilityFn, DatasourceDescriptor, ProcessOutcome, Processor, ProcessorDescriptor,
    WorkOutcome, Worker, WorkerDescriptor,
};

use crate::{
    dataset::record::DatasetRecord,
    error::{OrchestrationError, Result},
    users::User,
};

/// A job type and how many instances its descriptor asks for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobTypeSpec {
    pub jobtype: String,
    pub max_instances: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    processors: BTreeMap<String, ProcessorDescriptor>,
    datasources: BTreeMap<String, DatasourceDescriptor>,
    workers: BTreeMap<String, WorkerDescriptor>,
}

impl ModuleRegistry {
    pub fn builder() -> ModuleRegistryBuilder {
        ModuleRegistryBuilder::default()
    }

    pub fn processors(&self) -> &BTreeMap<String, ProcessorDescriptor> {
        &self.processors
    }

    pub fn datasources(&self) -> &BTreeMap<String, DatasourceDescriptor> {
        &self.datasources
    }

    pub fn processor(&self, id: &str) -> Option<&ProcessorDescriptor> {
        self.processors.get(id)
    }

    pub fn datasource(&self, id: &str) -> Option<&DatasourceDescriptor> {
        self.datasources.get(id)
    }

    pub fn worker(&self, id: &str) -> Option<&WorkerDescriptor> {
        self.workers.get(id)
    }

    /// Every job type some module services.
    pub fn jobtypes(&self) -> Vec<JobTypeSpec> {
        let processors = self.processors.values().map(|p| JobTypeSpec {
            jobtype: p.id.clone(),
            max_instances: p.max_instances,
        });
        let workers = self.workers.values().map(|w| JobTypeSpec {
            jobtype: w.id.clone(),
            max_instances: w.max_instances,
        });
        processors.chain(workers).collect()
    }

    /// Whether `processor` may run on `dataset`: its predicate passes, or it
    /// has none and the dataset is top-level.
    pub fn is_compatible(
        &self,
        processor: &ProcessorDescriptor,
        dataset: &DatasetRecord,
        user: Option<&User>,
    ) -> bool {
        match &processor.compatible_with {
            Some(predicate) => predicate(dataset, user),
            None => dataset.is_top_dataset(),
        }
    }

    /// Processors that could run on `dataset`, keyed by id.
    pub fn get_compatible_processors(
        &self,
        dataset: &DatasetRecord,
        user: Option<&User>,
    ) -> BTreeMap<String, &ProcessorDescriptor> {
        let own = self.processor(&dataset.dataset_type);
        self.processors
            .values()
            .filter(|processor| !processor.is_collector())
            .filter(|processor| !own.is_some_and(|own| own.excludes_followup(&processor.id)))
            .filter(|processor| self.is_compatible(processor, dataset, user))
            .map(|processor| (processor.id.clone(), processor))
            .collect()
    }

    /// Compatible processors minus option-less ones that already ran on
    /// `dataset` (one of `children` has their type), and minus hidden ones
    /// when `exclude_hidden` is set.
    pub fn get_available_processors(
        &self,
        dataset: &DatasetRecord,
        children: &[DatasetRecord],
        user: Option<&User>,
        exclude_hidden: bool,
    ) -> BTreeMap<String, &ProcessorDescriptor> {
        let mut processors = self.get_compatible_processors(dataset, user);
        for child in children {
            let optionless = processors
                .get(&child.dataset_type)
                .is_some_and(|processor| !processor.has_options);
            if optionless {
                processors.remove(&child.dataset_type);
            }
        }
        if exclude_hidden {
            processors.retain(|_, processor| !processor.is_hidden);
        }
        processors
    }
}

#[derive(Debug, Default)]
pub struct ModuleRegistryBuilder {
    processors: Vec<ProcessorDescriptor>,
    datasources: Vec<DatasourceDescriptor>,
    workers: Vec<WorkerDescriptor>,
}

impl ModuleRegistryBuilder {
    pub fn processor(mut self, descriptor: ProcessorDescriptor) -> Self {
        self.processors.push(descriptor);
        self
    }

    pub fn datasource(mut self, descriptor: DatasourceDescriptor) -> Self {
        self.datasources.push(descriptor);
        self
    }

    pub fn worker(mut self, descriptor: WorkerDescriptor) -> Self {
        self.workers.push(descriptor);
        self
    }

    /// Validate and freeze the registry.
    ///
    /// Ids must be unique across processors and workers, since both name a
    /// job type. Datasources without a `<id>-search` processor are skipped
    /// with a warning.
    pub fn build(self) -> Result<ModuleRegistry> {
        let mut registry = ModuleRegistry::default();

        for descriptor in self.processors {
            if registry.processors.contains_key(&descriptor.id) {
                return Err(OrchestrationError::Registry(format!(
                    "processor '{}' registered twice",
                    descriptor.id
                )));
            }
            registry.processors.insert(descriptor.id.clone(), descriptor);
        }

        for descriptor in self.workers {
            if registry.processors.contains_key(&descriptor.id)
                || registry.workers.contains_key(&descriptor.id)
            {
                return Err(OrchestrationError::Registry(format!(
                    "job type '{}' registered twice",
                    descriptor.id
                )));
            }
            registry.workers.insert(descriptor.id.clone(), descriptor);
        }

        for descriptor in self.datasources {
            let search = descriptor.search_processor_id();
            if !registry.processors.contains_key(&search) {
                warn!(datasource = %descriptor.id, search_processor = %search, "datasource has no search processor, skipping");
                continue;
            }
            if registry.datasources.contains_key(&descriptor.id) {
                return Err(OrchestrationError::Registry(format!(
                    "datasource '{}' registered twice",
                    descriptor.id
                )));
            }
            registry.datasources.insert(descriptor.id.clone(), descriptor);
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::dataset::record::DatasetParameters;

    struct Noop;

    #[async_trait]
    impl Processor for Noop {
        async fn process(&self, _ctx: &mut ProcessorContext) -> Result<ProcessOutcome> {
            Ok(ProcessOutcome::Finished { rows: 0 })
        }
    }

    fn descriptor(id: &str) -> ProcessorDescriptor {
        ProcessorDescriptor::new(id, Arc::new(Noop))
    }

    fn dataset(dataset_type: &str, parent: &str) -> DatasetRecord {
        DatasetRecord {
            key: format!("{dataset_type}-key"),
            query: String::new(),
            parameters: DatasetParameters::default(),
            result_file: String::new(),
            creator: String::new(),
            status: String::new(),
            dataset_type: dataset_type.into(),
            timestamp: 0,
            is_finished: true,
            is_private: false,
            software_version: String::new(),
            software_file: String::new(),
            num_rows: 10,
            progress: 1.0,
            key_parent: parent.into(),
            job: None,
        }
    }

    fn registry() -> ModuleRegistry {
        ModuleRegistry::builder()
            .processor(descriptor("forum-search"))
            .processor(descriptor("count-posts").exclude_followup("wordcloud"))
            .processor(descriptor("wordcloud").compatible_with(|_, _| true).with_options())
            .processor(
                descriptor("admin-only").compatible_with(|_, user| user.is_some_and(|u| u.is_admin)),
            )
            .processor(descriptor("secret").compatible_with(|_, _| true).hidden())
            .datasource(DatasourceDescriptor::new("forum", "Forum"))
            .datasource(DatasourceDescriptor::new("orphan", "No collector"))
            .build()
            .unwrap()
    }

    #[test]
    fn datasources_without_search_processor_are_skipped() {
        let registry = registry();
        assert!(registry.datasource("forum").is_some());
        assert!(registry.datasource("orphan").is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let result = ModuleRegistry::builder()
            .processor(descriptor("a"))
            .processor(descriptor("a"))
            .build();
        assert!(matches!(result, Err(OrchestrationError::Registry(_))));
    }

    #[test]
    fn compatibility_rules() {
        let registry = registry();
        let top = dataset("forum-search", "");
        let compatible = registry.get_compatible_processors(&top, None);
        let ids: Vec<_> = compatible.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["count-posts", "secret", "wordcloud"]);

        let admin = User::new("root").admin();
        assert!(registry.get_compatible_processors(&top, Some(&admin)).contains_key("admin-only"));

        let derived = dataset("count-posts", "parent");
        let compatible = registry.get_compatible_processors(&derived, None);
        assert!(!compatible.contains_key("count-posts"));
        assert!(!compatible.contains_key("wordcloud"));
    }

    #[test]
    fn available_drops_optionless_processors_that_already_ran() {
        let registry = registry();
        let top = dataset("forum-search", "");
        let children = vec![dataset("count-posts", &top.key), dataset("wordcloud", &top.key)];

        let available = registry.get_available_processors(&top, &children, None, true);
        let ids: Vec<_> = available.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["wordcloud"]);
    }
}
