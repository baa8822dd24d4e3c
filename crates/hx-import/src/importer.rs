//! Import jobs: one file into the store, or many files concurrently.

use crate::detect::FormatRegistry;
use anyhow::anyhow;
use hx_core::{ErrorPolicy, HxConfig, HxError, ImportConfig, Result};
use hx_parser::NormalizeExt;
use hx_storage::Store;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of one successful file import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub job_id: String,
    pub path: PathBuf,
    pub format: String,
    pub committed: usize,
    pub batches: usize,
    pub elapsed_ms: u64,
}

/// A file import that stopped early.
#[derive(Debug)]
pub struct ImportFailure {
    pub path: PathBuf,
    /// Records committed before the failure; these stay in the store.
    pub committed: usize,
    pub error: HxError,
}

impl fmt::Display for ImportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({} records committed)",
            self.path.display(),
            self.error,
            self.committed
        )
    }
}

impl std::error::Error for ImportFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Results of a multi-file run, in input order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub imported: Vec<ImportReport>,
    pub failed: Vec<ImportFailure>,
    /// Files not attempted because an earlier failure aborted the run.
    pub skipped: Vec<PathBuf>,
}

impl RunReport {
    pub fn total_committed(&self) -> usize {
        self.imported.iter().map(|r| r.committed).sum::<usize>()
            + self.failed.iter().map(|f| f.committed).sum::<usize>()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Clone)]
pub struct Importer {
    store: Arc<Store>,
    registry: Arc<FormatRegistry>,
    config: ImportConfig,
}

impl Importer {
    pub fn new(store: Arc<Store>, config: ImportConfig) -> Self {
        Self {
            store,
            registry: Arc::new(FormatRegistry::new()),
            config,
        }
    }

    pub fn from_config(config: &HxConfig) -> Result<Self> {
        config.validate()?;
        let store = Store::from_config(&config.storage)?;
        Ok(Self::new(Arc::new(store), config.import.clone()))
    }

    pub fn with_registry(mut self, registry: FormatRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Import one file. Parsing and writing run on the calling thread.
    pub fn import_file(&self, path: impl AsRef<Path>) -> std::result::Result<ImportReport, ImportFailure> {
        let path = path.as_ref();
        let job_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let failed = |committed: usize, error: HxError| {
            if error.is_storage() {
                error!(job = %job_id, path = %path.display(), committed, error = %error, "import failed in storage");
            } else {
                warn!(job = %job_id, path = %path.display(), committed, error = %error, "import failed");
            }
            ImportFailure {
                path: path.to_path_buf(),
                committed,
                error,
            }
        };

        let format = self.registry.detect(path).map_err(|e| failed(0, e))?;
        info!(job = %job_id, path = %path.display(), format = format.name(), "import started");
        let _relaxed = self.config.relax_durability.then(|| self.store.relax_durability());

        let stream = format.open(path).map_err(|e| failed(0, e))?;
        let summary = self
            .store
            .writer(self.config.batch_size)
            .write_all(stream.normalized())
            .map_err(|f| failed(f.committed, f.error))?;

        let report = ImportReport {
            job_id,
            path: path.to_path_buf(),
            format: format.name().to_string(),
            committed: summary.committed,
            batches: summary.batches,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            job = %report.job_id,
            path = %path.display(),
            committed = report.committed,
            batches = report.batches,
            elapsed_ms = report.elapsed_ms,
            "import finished"
        );
        Ok(report)
    }

    /// Import files one after another, honoring the error policy.
    pub fn import_all<I, P>(&self, paths: I) -> RunReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut run = RunReport::default();
        let mut aborted = false;
        for path in paths {
            let path = path.as_ref();
            if aborted {
                run.skipped.push(path.to_path_buf());
                continue;
            }
            match self.import_file(path) {
                Ok(report) => run.imported.push(report),
                Err(failure) => {
                    aborted = self.config.on_error == ErrorPolicy::Abort;
                    run.failed.push(failure);
                }
            }
        }
        run
    }

    /// Import files concurrently, at most `max_concurrent_jobs` at a time.
    ///
    /// Each file runs on the blocking pool with its own transaction. Under
    /// [`ErrorPolicy::Abort`], files not yet started when a job fails are
    /// skipped; jobs already running finish.
    pub async fn import_files(&self, paths: Vec<PathBuf>) -> RunReport {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_jobs.max(1)));
        let abort = Arc::new(AtomicBool::new(false));
        let abort_on_error = self.config.on_error == ErrorPolicy::Abort;
        let mut run = RunReport::default();
        let mut jobs = Vec::with_capacity(paths.len());

        for path in paths {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                run.skipped.push(path);
                continue;
            };
            if abort.load(Ordering::Acquire) {
                run.skipped.push(path);
                continue;
            }
            let importer = self.clone();
            let abort = Arc::clone(&abort);
            let job_path = path.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let result = importer.import_file(&job_path);
                if result.is_err() && abort_on_error {
                    abort.store(true, Ordering::Release);
                }
                result
            });
            jobs.push((path, handle));
        }

        for (path, handle) in jobs {
            match handle.await {
                Ok(Ok(report)) => run.imported.push(report),
                Ok(Err(failure)) => run.failed.push(failure),
                Err(join) => run.failed.push(ImportFailure {
                    path,
                    committed: 0,
                    error: anyhow!("import job did not complete: {join}").into(),
                }),
            }
        }
        run
    }
}
