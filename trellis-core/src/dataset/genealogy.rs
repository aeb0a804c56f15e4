use std::collections::{HashSet, VecDeque};

use super::{Dataset, record::DatasetRecord};
use crate::error::{OrchestrationError, Result};

impl Dataset {
    /// Lineage from the top dataset down to this one, inclusive.
    ///
    /// Walks `key_parent` through the store and caches the result on this
    /// instance until [`Dataset::link_parent`] or [`Dataset::reload`].
    pub async fn get_genealogy(&mut self) -> Result<Vec<DatasetRecord>> {
        if let Some(genealogy) = &self.genealogy {
            return Ok(genealogy.clone());
        }

        let mut lineage = vec![self.record.clone()];
        let mut seen = HashSet::from([self.record.key.clone()]);
        let mut parent = self.record.key_parent.clone();
        while !parent.is_empty() {
            if !seen.insert(parent.clone()) {
                return Err(OrchestrationError::InvalidState(format!(
                    "dataset {} has a cyclic parent chain through {parent}",
                    self.record.key
                )));
            }
            let record = self.ctx.store.dataset(&parent).await?.ok_or_else(|| {
                OrchestrationError::NotFound(format!("parent dataset {parent}"))
            })?;
            parent = record.key_parent.clone();
            lineage.push(record);
        }

        lineage.reverse();
        self.genealogy = Some(lineage.clone());
        Ok(lineage)
    }

    /// The first dataset of the lineage; this dataset if it is top-level.
    pub async fn top_parent(&mut self) -> Result<Dataset> {
        let genealogy = self.get_genealogy().await?;
        let top = genealogy
            .into_iter()
            .next()
            .unwrap_or_else(|| self.record.clone());
        Dataset::from_record(self.ctx.clone(), top).await
    }

    pub async fn get_parent(&self) -> Result<Option<Dataset>> {
        if self.record.key_parent.is_empty() {
            return Ok(None);
        }
        Dataset::get(self.ctx.clone(), &self.record.key_parent)
            .await
            .map(Some)
    }

    /// Direct children, oldest first.
    pub async fn get_children(&self) -> Result<Vec<Dataset>> {
        let records = self.ctx.store.child_datasets(&self.record.key).await?;
        let mut children = Vec::with_capacity(records.len());
        for record in records {
            children.push(Dataset::from_record(self.ctx.clone(), record).await?);
        }
        Ok(children)
    }

    /// Every descendant, breadth first.
    pub async fn get_all_children(&self) -> Result<Vec<Dataset>> {
        let records = self.descendant_records().await?;
        let mut children = Vec::with_capacity(records.len());
        for record in records {
            children.push(Dataset::from_record(self.ctx.clone(), record).await?);
        }
        Ok(children)
    }

    /// Descendant rows, breadth first, through key-indexed child lookups.
    pub(crate) async fn descendant_records(&self) -> Result<Vec<DatasetRecord>> {
        let mut seen = HashSet::from([self.record.key.clone()]);
        let mut pending = VecDeque::from([self.record.key.clone()]);
        let mut descendants = Vec::new();

        while let Some(key) = pending.pop_front() {
            for child in self.ctx.store.child_datasets(&key).await? {
                if seen.insert(child.key.clone()) {
                    pending.push_back(child.key.clone());
                    descendants.push(child);
                }
            }
        }
        Ok(descendants)
    }
}
