//! Replays a JSON-lines stream of lifecycle events through a [`Driver`].
//!
//! Each line holds one [`Record`]. Updates and deletes name the object by its current state, so
//! the replayer resolves the prior object from the driver before dispatching the event.

use crate::mapping::{Driver, Error, ErrorClass, Event};
use anyhow::{Context, Result};
use grouppolicy_core::policy::{Resource, ResourceKind};
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

// Records are small; a short queue keeps the reader just ahead of the driver.
const RECORD_QUEUE_SIZE: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Record {
    Create { resource: Resource },
    Update { resource: Resource },
    Delete { kind: ResourceKind, id: String },
}

/// The result of one record, written to the output as a JSON line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub line: usize,
    pub op: String,
    pub kind: ResourceKind,
    pub id: String,

    /// The object with its derived fields, for creates and updates that succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,

    /// The canonical name of the error, if the event failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub applied: usize,

    /// Events refused by validation or for lack of addresses.
    pub rejected: usize,

    /// Events that failed in a collaborator or on an internal inconsistency.
    pub failed: usize,

    /// Whether replay stopped before the end of the input.
    pub interrupted: bool,
}

#[derive(Clone)]
pub struct Replay {
    driver: Arc<Driver>,
    fail_fast: bool,
}

// === impl Record ===

impl Record {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Create { resource } | Self::Update { resource } => resource.kind(),
            Self::Delete { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Create { resource } | Self::Update { resource } => resource.id(),
            Self::Delete { id, .. } => id,
        }
    }
}

// === impl Summary ===

impl Summary {
    fn record(&mut self, result: &Result<Option<Resource>, Error>) {
        match result {
            Ok(_) => self.applied += 1,
            Err(error) => match error.class() {
                ErrorClass::Validation | ErrorClass::Exhausted => self.rejected += 1,
                ErrorClass::Collaborator | ErrorClass::Internal => self.failed += 1,
            },
        }
    }

    pub fn errors(&self) -> usize {
        self.rejected + self.failed
    }
}

// === impl Replay ===

impl Replay {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self {
            driver,
            fail_fast: false,
        }
    }

    /// Stops at the first record that fails.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    /// Applies one record.
    pub fn apply(&self, record: Record) -> Result<Option<Resource>, Error> {
        let event = match record {
            Record::Create { resource } => Event::Create(resource),
            Record::Update { resource } => {
                let before = self.current(resource.kind(), resource.id())?;
                Event::Update {
                    before,
                    after: resource,
                }
            }
            Record::Delete { kind, id } => Event::Delete(self.current(kind, &id)?),
        };
        self.driver.handle(event)
    }

    /// Reads records from `input` until it ends or `shutdown` completes, writing an [`Outcome`]
    /// line to `output` for each.
    ///
    /// Malformed input is fatal. Events that fail are counted in the summary.
    pub async fn run<R, W>(
        &self,
        input: R,
        mut output: W,
        shutdown: impl Future<Output = ()>,
    ) -> Result<Summary>
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Unpin,
    {
        let (records_tx, mut records_rx) = mpsc::channel(RECORD_QUEUE_SIZE);
        let reader = tokio::spawn(read(input, records_tx));
        tokio::pin!(shutdown);

        let mut summary = Summary::default();
        loop {
            let (line, record) = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested; stopping replay");
                    summary.interrupted = true;
                    break;
                }
                next = records_rx.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            tracing::debug!(line, op = record.op(), kind = %record.kind(), id = record.id(), "Applying record");
            let mut outcome = Outcome {
                line,
                op: record.op().to_string(),
                kind: record.kind(),
                id: record.id().to_string(),
                resource: None,
                error: None,
                message: None,
            };
            let result = self.apply(record);
            summary.record(&result);
            let stop = match result {
                Ok(resource) => {
                    outcome.resource = resource;
                    false
                }
                Err(error) => {
                    outcome.error = Some(error.name().to_string());
                    outcome.message = Some(error.to_string());
                    self.fail_fast
                }
            };

            let mut json = serde_json::to_vec(&outcome).context("failed to encode outcome")?;
            json.push(b'\n');
            output
                .write_all(&json)
                .await
                .context("failed to write outcome")?;

            if stop {
                tracing::info!(line, "Stopping replay after failed event");
                summary.interrupted = true;
                break;
            }
        }
        output.flush().await.context("failed to flush output")?;

        if summary.interrupted {
            // The reader may be blocked on input that will never be consumed.
            reader.abort();
        } else {
            reader.await.context("record reader panicked")??;
        }
        Ok(summary)
    }

    fn current(&self, kind: ResourceKind, id: &str) -> Result<Resource, Error> {
        self.driver
            .get(kind, id)
            .ok_or_else(|| Error::ReferencedPolicyObjectNotFound {
                kind,
                id: id.to_string(),
            })
    }
}

/// Parses records from `input`, skipping blank lines and `#` comments.
async fn read<R>(input: R, tx: mpsc::Sender<(usize, Record)>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut line = 0;
    while let Some(text) = lines.next_line().await.context("failed to read events")? {
        line += 1;
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let record = serde_json::from_str::<Record>(text)
            .with_context(|| format!("invalid record on line {line}"))?;
        if tx.send((line, record)).await.is_err() {
            break;
        }
    }
    Ok(())
}
