//! Result files and dataset logs.
//!
//! The core only does path arithmetic; reading and writing goes through a
//! [`ResultStore`]. Names handed around are file names relative to the
//! store's root.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::record::DatasetRecord;
use crate::error::Result;

const MAX_SLUG_LEN: usize = 100;

static NON_SLUG_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9\-]").expect("valid slug regex"));
static REPEATED_DASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-+").expect("valid dash regex"));

/// File name stem for a dataset's result, without extension or probe suffix.
pub fn result_stem(record: &DatasetRecord) -> String {
    let parameters = &record.parameters;
    if let Some(amount) = parameters.random_amount.filter(|amount| *amount > 0) {
        return format!("random-{amount}-{}", record.key);
    }
    if let Some(country) = parameters
        .country_flag
        .as_deref()
        .filter(|country| !country.is_empty() && *country != "all")
    {
        return format!("countryflag-{country}-{}", record.key);
    }

    let lowered = record.query.replace(' ', "-").to_lowercase();
    let slug: String = NON_SLUG_CHARS
        .replace_all(&lowered, "")
        .chars()
        .take(MAX_SLUG_LEN)
        .collect();
    REPEATED_DASHES
        .replace_all(&format!("{slug}-{}", record.key), "-")
        .into_owned()
}

/// `stem.ext` for the first probe, `stem-N.ext` afterwards.
pub fn probe_name(stem: &str, extension: &str, index: usize) -> String {
    let extension = extension.to_lowercase();
    if index == 0 {
        format!("{stem}.{extension}")
    } else {
        format!("{stem}-{index}.{extension}")
    }
}

/// Log file that sits next to `result_file`.
pub fn log_name(result_file: &str) -> String {
    match Path::new(result_file).file_stem() {
        Some(stem) => format!("{}.log", stem.to_string_lossy()),
        None => format!("{result_file}.log"),
    }
}

#[async_trait]
pub trait ResultStore: Send + Sync + fmt::Debug {
    fn root(&self) -> &Path;

    fn path_of(&self, file_name: &str) -> PathBuf {
        self.root().join(file_name)
    }

    async fn exists(&self, file_name: &str) -> Result<bool>;

    /// Claim the first unused name among `stem.ext`, `stem-1.ext`, ... and
    /// return it. The name is unused at the moment it is returned.
    async fn reserve_path(&self, stem: &str, extension: &str) -> Result<String> {
        let mut index = 0;
        loop {
            let candidate = probe_name(stem, extension, index);
            if !self.exists(&candidate).await? {
                return Ok(candidate);
            }
            index += 1;
        }
    }

    /// Open for writing, truncating existing content.
    async fn open_for_write(&self, file_name: &str) -> Result<File>;

    /// Remove a file. Missing files are not an error.
    async fn delete(&self, file_name: &str) -> Result<()>;

    async fn append_log(&self, file_name: &str, line: &str) -> Result<()>;

    async fn copy(&self, from: &str, to: &str) -> Result<()>;
}

/// [`ResultStore`] over a local directory.
#[derive(Clone, Debug)]
pub struct FsResultStore {
    root: PathBuf,
}

impl FsResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for FsResultStore {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn exists(&self, file_name: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_of(file_name)).await?)
    }

    /// Creates the file with `create_new`, so two processes probing at the
    /// same time cannot end up with the same name.
    async fn reserve_path(&self, stem: &str, extension: &str) -> Result<String> {
        self.ensure_root().await?;
        let mut index = 0;
        loop {
            let candidate = probe_name(stem, extension, index);
            let created = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.path_of(&candidate))
                .await;
            match created {
                Ok(_) => return Ok(candidate),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => index += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn open_for_write(&self, file_name: &str) -> Result<File> {
        self.ensure_root().await?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path_of(file_name))
            .await?;
        Ok(file)
    }

    async fn delete(&self, file_name: &str) -> Result<()> {
        match fs::remove_file(self.path_of(file_name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn append_log(&self, file_name: &str, line: &str) -> Result<()> {
        self.ensure_root().await?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.path_of(file_name))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        fs::copy(self.path_of(from), self.path_of(to)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::record::DatasetParameters;

    fn record(query: &str, parameters: DatasetParameters) -> DatasetRecord {
        DatasetRecord {
            key: "abc123".into(),
            query: query.into(),
            parameters,
            result_file: String::new(),
            creator: String::new(),
            status: String::new(),
            dataset_type: "search".into(),
            timestamp: 0,
            is_finished: false,
            is_private: true,
            software_version: String::new(),
            software_file: String::new(),
            num_rows: 0,
            progress: 0.0,
            key_parent: String::new(),
            job: None,
        }
    }

    #[test]
    fn stem_slugifies_the_query() {
        let stem = result_stem(&record("Cats & Dogs  2024!", DatasetParameters::default()));
        assert_eq!(stem, "cats-dogs-2024-abc123");
    }

    #[test]
    fn stem_crops_long_queries() {
        let long = "a".repeat(300);
        let stem = result_stem(&record(&long, DatasetParameters::default()));
        assert_eq!(stem, format!("{}-abc123", "a".repeat(100)));
    }

    #[test]
    fn stem_prefers_random_then_country() {
        let random = DatasetParameters {
            random_amount: Some(50),
            country_flag: Some("nl".into()),
            ..DatasetParameters::default()
        };
        assert_eq!(result_stem(&record("q", random)), "random-50-abc123");

        let country = DatasetParameters {
            country_flag: Some("nl".into()),
            ..DatasetParameters::default()
        };
        assert_eq!(result_stem(&record("q", country)), "countryflag-nl-abc123");

        let all = DatasetParameters {
            country_flag: Some("all".into()),
            ..DatasetParameters::default()
        };
        assert_eq!(result_stem(&record("q", all)), "q-abc123");
    }

    #[test]
    fn log_sits_next_to_result() {
        assert_eq!(log_name("cats-abc.csv"), "cats-abc.log");
        assert_eq!(log_name("cats-abc-2.ndjson"), "cats-abc-2.log");
    }

    #[tokio::test]
    async fn reserve_probes_numbered_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path());

        let first = store.reserve_path("cats-abc", "CSV").await.unwrap();
        let second = store.reserve_path("cats-abc", "csv").await.unwrap();
        let third = store.reserve_path("cats-abc", "csv").await.unwrap();

        assert_eq!(first, "cats-abc.csv");
        assert_eq!(second, "cats-abc-1.csv");
        assert_eq!(third, "cats-abc-2.csv");
    }

    #[tokio::test]
    async fn delete_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path());
        store.delete("nope.csv").await.unwrap();

        store.append_log("x.log", "one").await.unwrap();
        store.append_log("x.log", "two").await.unwrap();
        let content = std::fs::read_to_string(dir.path().join("x.log")).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }
}
