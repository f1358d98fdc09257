//! Append-only journal for tracker records
//!
//! Every record write is appended as one JSON line before the backend call
//! it precedes. On open the journal is replayed (the last line for an id
//! wins, evictions remove the id) and rewritten in compacted form. A running
//! tracker compacts again from a snapshot of its maps, keeping every line
//! appended after the snapshot began.
//!
//! A torn final line from a crash mid-write is skipped with a warning.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use nc_core::types::{Deployment, DeploymentId, Execution, ExecutionId, Node, NodeId};

/// Journal line, borrowed form used for writing
#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum EntryRef<'a> {
    Node(&'a Node),
    Deployment(&'a Deployment),
    Execution(&'a Execution),
    EvictDeployment(&'a DeploymentId),
    EvictExecution(&'a ExecutionId),
}

/// Journal line, owned form used for replay
#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum Entry {
    Node(Node),
    Deployment(Deployment),
    Execution(Execution),
    EvictDeployment(DeploymentId),
    EvictExecution(ExecutionId),
}

/// Records recovered from a journal
#[derive(Debug, Default)]
pub struct Replayed {
    pub nodes: Vec<Node>,
    pub deployments: Vec<Deployment>,
    pub executions: Vec<Execution>,
}

struct JournalFile {
    file: File,
    /// Lines appended since the last compaction
    appended: usize,
}

/// Durable log of tracker writes
pub struct Journal {
    path: PathBuf,
    file: Mutex<JournalFile>,
}

impl Journal {
    /// Open (or create) a journal, replay it and compact it
    pub fn open(path: &Path) -> io::Result<(Self, Replayed)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let replayed = if path.exists() {
            replay(path)?
        } else {
            Replayed::default()
        };

        rewrite(path, &replayed, None)?;

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        tracing::info!(
            "Journal {:?} replayed: {} nodes, {} deployments, {} executions",
            path,
            replayed.nodes.len(),
            replayed.deployments.len(),
            replayed.executions.len()
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                file: Mutex::new(JournalFile { file, appended: 0 }),
            },
            replayed,
        ))
    }

    /// Path of the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, JournalFile>> {
        self.file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "journal lock poisoned"))
    }

    /// Append one entry and sync it to disk
    pub(crate) fn append(&self, entry: &EntryRef<'_>) -> io::Result<()> {
        let line = encode(entry)?;

        let mut journal = self.lock()?;
        journal.file.write_all(&line)?;
        journal.file.sync_data()?;
        journal.appended += 1;
        Ok(())
    }

    /// Lines appended since the journal was last compacted
    pub fn appended_since_compaction(&self) -> io::Result<usize> {
        Ok(self.lock()?.appended)
    }

    /// Current end of the journal; pass it to [`compact`](Self::compact)
    /// before taking the snapshot
    pub fn end_offset(&self) -> io::Result<u64> {
        Ok(self.lock()?.file.metadata()?.len())
    }

    /// Replace the journal with `snapshot` followed by every line written at
    /// or after `since`
    pub fn compact(&self, snapshot: &Replayed, since: u64) -> io::Result<()> {
        let mut journal = self.lock()?;
        rewrite(&self.path, snapshot, Some(since))?;
        journal.file = OpenOptions::new().append(true).open(&self.path)?;
        journal.appended = 0;
        Ok(())
    }
}

fn encode(entry: &EntryRef<'_>) -> io::Result<Vec<u8>> {
    let mut line =
        serde_json::to_vec(entry).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    Ok(line)
}

fn replay(path: &Path) -> io::Result<Replayed> {
    let reader = BufReader::new(File::open(path)?);

    let mut nodes: HashMap<NodeId, Node> = HashMap::new();
    let mut deployments: HashMap<DeploymentId, Deployment> = HashMap::new();
    let mut executions: HashMap<ExecutionId, Execution> = HashMap::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Entry>(line) {
            Ok(Entry::Node(node)) => {
                nodes.insert(node.id.clone(), node);
            }
            Ok(Entry::Deployment(deployment)) => {
                deployments.insert(deployment.id.clone(), deployment);
            }
            Ok(Entry::Execution(execution)) => {
                executions.insert(execution.id.clone(), execution);
            }
            Ok(Entry::EvictDeployment(id)) => {
                deployments.remove(&id);
            }
            Ok(Entry::EvictExecution(id)) => {
                executions.remove(&id);
            }
            Err(e) => {
                tracing::warn!(
                    "Skipping unreadable journal line {} of {:?}: {}",
                    line_num + 1,
                    path,
                    e
                );
            }
        }
    }

    Ok(Replayed {
        nodes: nodes.into_values().collect(),
        deployments: deployments.into_values().collect(),
        executions: executions.into_values().collect(),
    })
}

/// Rewrite the journal as one line per record in `replayed`, then the tail
/// of the current file from `tail_from` if given
fn rewrite(path: &Path, replayed: &Replayed, tail_from: Option<u64>) -> io::Result<()> {
    let tmp = path.with_extension("compact");
    {
        let mut out = File::create(&tmp)?;
        for node in &replayed.nodes {
            out.write_all(&encode(&EntryRef::Node(node))?)?;
        }
        for deployment in &replayed.deployments {
            out.write_all(&encode(&EntryRef::Deployment(deployment))?)?;
        }
        for execution in &replayed.executions {
            out.write_all(&encode(&EntryRef::Execution(execution))?)?;
        }
        if let Some(offset) = tail_from {
            let mut current = File::open(path)?;
            current.seek(SeekFrom::Start(offset))?;
            io::copy(&mut current, &mut out)?;
        }
        out.sync_all()?;
    }
    fs::rename(&tmp, path)
}
