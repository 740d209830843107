//! JSON-lines store with advisory locking and compaction.

use crate::models::JobRecord;
use crate::{Error, Result};
use nix::fcntl::{Flock, FlockArg};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a lock acquisition may spin before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Compaction triggers when the file grows past this multiple of the live
/// record footprint.
const COMPACTION_FACTOR: u64 = 4;

/// Handle to the execution database file.
///
/// The handle is cheap to clone and carries no open file descriptors; every
/// operation opens, locks, and releases the file so cooperating processes
/// interleave safely. Tests point it at a temporary path via [`ExecutionDb::open`].
#[derive(Debug, Clone)]
pub struct ExecutionDb {
    path: PathBuf,
}

impl ExecutionDb {
    /// Open (creating parent directories for) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Open the database at the default per-user path.
    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    /// `~/.nemo-evaluator/exec.db.jsonl`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or(Error::NoHome)?;
        Ok(home.join(".nemo-evaluator").join("exec.db.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert one record. Appends under an exclusive lock, then compacts if
    /// the file has outgrown its live footprint.
    pub fn write_job(&self, record: &JobRecord) -> Result<()> {
        let _guard = self.acquire_lock(FlockArg::LockExclusiveNonblock, "exclusive")?;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        drop(file);

        self.maybe_compact()?;
        Ok(())
    }

    /// Fetch the latest record for `job_id`, or `None`.
    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.load_all()?.remove(job_id))
    }

    /// All records of one invocation, ordered by task index ascending.
    pub fn list_jobs_by_invocation(&self, invocation_id: &str) -> Result<Vec<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self
            .load_all()?
            .into_values()
            .filter(|r| r.invocation_id == invocation_id)
            .collect();
        jobs.sort_by_key(|r| r.task_index());
        Ok(jobs)
    }

    /// Every invocation with its records, grouped and ordered.
    pub fn iter_invocations(&self) -> Result<Vec<(String, Vec<JobRecord>)>> {
        let mut grouped: BTreeMap<String, Vec<JobRecord>> = BTreeMap::new();
        for record in self.load_all()?.into_values() {
            grouped.entry(record.invocation_id.clone()).or_default().push(record);
        }
        for jobs in grouped.values_mut() {
            jobs.sort_by_key(|r| r.task_index());
        }
        Ok(grouped.into_iter().collect())
    }

    /// Read the whole file under a shared lock, folding later records over
    /// earlier ones. A lock timeout is retried once before failing.
    fn load_all(&self) -> Result<BTreeMap<String, JobRecord>> {
        let guard = match self.acquire_lock(FlockArg::LockSharedNonblock, "shared") {
            Ok(guard) => guard,
            Err(Error::LockTimeout { .. }) => {
                warn!(path = %self.path.display(), "shared lock timed out, retrying once");
                self.acquire_lock(FlockArg::LockSharedNonblock, "shared")?
            }
            Err(e) => return Err(e),
        };
        let records = self.read_records();
        drop(guard);
        records
    }

    fn read_records(&self) -> Result<BTreeMap<String, JobRecord>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            // A missing database is an empty database.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = BTreeMap::new();
        let lines: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;
        let last = lines.len().saturating_sub(1);
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JobRecord>(line) {
                Ok(record) => {
                    records.insert(record.job_id.clone(), record);
                }
                Err(e) if i == last => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "discarding corrupt trailing record (partial write)"
                    );
                }
                Err(e) => {
                    warn!(line = i + 1, error = %e, "skipping corrupt record");
                }
            }
        }
        Ok(records)
    }

    /// Rewrite the file with only live records when the append log has grown
    /// past `COMPACTION_FACTOR` times their footprint. Caller holds the
    /// exclusive lock.
    fn maybe_compact(&self) -> Result<()> {
        let file_len = std::fs::metadata(&self.path)?.len();
        let records = self.read_records()?;

        let mut live = Vec::with_capacity(records.len());
        let mut live_len = 0u64;
        for record in records.values() {
            let line = serde_json::to_string(record)?;
            live_len += line.len() as u64 + 1;
            live.push(line);
        }
        if file_len <= live_len.saturating_mul(COMPACTION_FACTOR) {
            return Ok(());
        }

        debug!(
            path = %self.path.display(),
            file_len,
            live_len,
            records = live.len(),
            "compacting execution database"
        );
        let tmp = self.path.with_extension("jsonl.compact");
        {
            let mut out = File::create(&tmp)?;
            for line in &live {
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
            }
            out.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Spin on a non-blocking flock of the sidecar lock file until acquired
    /// or `LOCK_TIMEOUT` elapses. The sidecar survives compaction renames.
    fn acquire_lock(&self, arg: FlockArg, mode: &'static str) -> Result<Flock<File>> {
        let lock_path = self.path.with_extension("jsonl.lock");
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            let file = OpenOptions::new().create(true).write(true).open(&lock_path)?;
            match Flock::lock(file, arg) {
                Ok(guard) => return Ok(guard),
                Err((_, nix::errno::Errno::EWOULDBLOCK)) | Err((_, nix::errno::Errno::EAGAIN)) => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout {
                            mode,
                            path: self.path.display().to_string(),
                            seconds: LOCK_TIMEOUT.as_secs(),
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
            }
        }
    }
}
