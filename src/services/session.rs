//! One upload request: staged files in, one report out.

use crate::error::UploadError;
use crate::events::{AbortPayload, EventBus, UploadEvent};
use crate::models::{DerivedFile, FileRecord, FileResponse};
use crate::services::naming;
use crate::services::pipeline::{PipelineOutcome, ProcessingPipeline};
use crate::services::storage::FileStore;
use crate::utils::latch::CompletionLatch;
use crate::utils::urls::PublicUrls;
use crate::utils::validation::validate_file;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const INCOMPLETE_UPLOAD: &str = "File upload incomplete";

/// What the transport reports while decoding a request body.
#[derive(Debug, Clone, PartialEq)]
pub enum FormEvent {
    /// A file part started; its bytes are being written to `path`.
    FileBegin {
        name: String,
        content_type: Option<String>,
        path: PathBuf,
    },
    Field {
        name: String,
        value: String,
    },
    /// The part at `path` is complete.
    File { path: PathBuf, size: u64 },
    Progress { received: u64, expected: Option<u64> },
    Aborted,
    Error(String),
    End,
}

/// Shared pause flag between the session and the transport feeding it.
#[derive(Debug, Clone, Default)]
pub struct FlowControl(Arc<AtomicBool>);

impl FlowControl {
    pub fn pause(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Arrived,
    Rejected,
    Processing,
    Processed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Arrival order. Rejected files are included with their error set,
    /// aborted ones are not.
    pub files: Vec<FileRecord>,
    pub derived: Vec<DerivedFile>,
    pub redirect: Option<String>,
    /// The transport went away before the body was fully parsed.
    pub aborted: bool,
}

impl SessionReport {
    pub fn responses(&self) -> Vec<FileResponse> {
        self.files.iter().map(FileRecord::to_response).collect()
    }
}

struct Entry {
    record: FileRecord,
    temp: PathBuf,
    state: FileState,
}

type Job = BoxFuture<'static, (usize, PipelineOutcome)>;

pub struct UploadSession {
    pipeline: Arc<ProcessingPipeline>,
    store: FileStore,
    events: EventBus,
    urls: PublicUrls,
    flow: FlowControl,
    entries: Vec<Entry>,
    /// Temp path -> entry index, for parts not yet confirmed by the transport.
    pending: HashMap<PathBuf, usize>,
    derived: Vec<DerivedFile>,
    redirect: Option<String>,
    latch: CompletionLatch,
    parsing: bool,
    aborted: bool,
    failure: Option<String>,
}

impl UploadSession {
    pub fn new(
        pipeline: Arc<ProcessingPipeline>,
        store: FileStore,
        events: EventBus,
        urls: PublicUrls,
    ) -> Self {
        Self {
            pipeline,
            store,
            events,
            urls,
            flow: FlowControl::default(),
            entries: Vec::new(),
            pending: HashMap::new(),
            derived: Vec::new(),
            redirect: None,
            latch: CompletionLatch::new(),
            parsing: true,
            aborted: false,
            failure: None,
        }
    }

    pub fn with_flow_control(mut self, flow: FlowControl) -> Self {
        self.flow = flow;
        self
    }

    pub fn flow_control(&self) -> FlowControl {
        self.flow.clone()
    }

    /// Drives the session until every accepted file is processed and the
    /// body is fully parsed, then hands the report to `on_complete`.
    ///
    /// A transport error is returned instead, without calling `on_complete`.
    /// Files already processing still finish first.
    pub async fn run<S, F>(mut self, mut form: S, on_complete: F) -> Result<(), UploadError>
    where
        S: Stream<Item = FormEvent> + Unpin,
        F: FnOnce(SessionReport),
    {
        let mut jobs: FuturesUnordered<Job> = FuturesUnordered::new();

        loop {
            tokio::select! {
                event = form.next(), if self.parsing => {
                    let released = match event {
                        Some(event) => self.on_form_event(event, &mut jobs).await?,
                        None => {
                            debug!("Form stream ended without end marker");
                            self.abort().await?
                        }
                    };
                    if released {
                        break;
                    }
                }
                Some((idx, outcome)) = jobs.next() => {
                    if self.on_job_done(idx, outcome).await? {
                        break;
                    }
                }
                else => break,
            }
        }

        if let Some(err) = self.failure.take() {
            return Err(UploadError::Transport(err));
        }

        let report = self.into_report().await;
        info!(
            "Upload session complete: {} files, {} derived",
            report.files.len(),
            report.derived.len()
        );
        on_complete(report);
        Ok(())
    }

    async fn on_form_event(
        &mut self,
        event: FormEvent,
        jobs: &mut FuturesUnordered<Job>,
    ) -> Result<bool, UploadError> {
        match event {
            FormEvent::FileBegin {
                name,
                content_type,
                path,
            } => {
                let upload_dir = self.pipeline.config().upload_dir();
                let name = naming::available_name(upload_dir, &name).await;
                let record = FileRecord::new(name, 0, content_type);
                self.events.emit(UploadEvent::Begin(record.clone()));
                self.pending.insert(path.clone(), self.entries.len());
                self.entries.push(Entry {
                    record,
                    temp: path,
                    state: FileState::Arrived,
                });
                Ok(false)
            }
            FormEvent::Field { name, value } => {
                if name == "redirect" {
                    self.redirect = Some(value);
                }
                Ok(false)
            }
            FormEvent::File { path, size } => {
                self.on_file(path, size, jobs).await?;
                Ok(false)
            }
            FormEvent::Progress { received, .. } => {
                if let Some(max) = self.pipeline.config().max_post_size {
                    if received > max && !self.flow.is_paused() {
                        warn!("Received {} bytes, over the {} byte limit; pausing", received, max);
                        self.flow.pause();
                    }
                }
                Ok(false)
            }
            FormEvent::End => {
                for idx in self.pending.drain().map(|(_, idx)| idx).collect::<Vec<_>>() {
                    let entry = &mut self.entries[idx];
                    entry.record.set_error(INCOMPLETE_UPLOAD);
                    entry.state = FileState::Rejected;
                    remove_temp(&entry.temp).await;
                }
                self.finish_parsing()
            }
            FormEvent::Aborted => self.abort().await,
            FormEvent::Error(err) => {
                error!("Upload transport failed: {}", err);
                self.events.emit(UploadEvent::Error(err.clone()));
                self.events
                    .emit(UploadEvent::Abort(AbortPayload::Error(err.clone())));
                self.failure = Some(err);
                self.abort().await
            }
        }
    }

    async fn on_file(
        &mut self,
        path: PathBuf,
        size: u64,
        jobs: &mut FuturesUnordered<Job>,
    ) -> Result<(), UploadError> {
        let Some(idx) = self.pending.remove(&path) else {
            warn!("Completed part {} was never announced", path.display());
            return Ok(());
        };
        let entry = &mut self.entries[idx];
        entry.record.confirm_size(size);

        let complete = tokio::fs::metadata(&path)
            .await
            .is_ok_and(|meta| meta.is_file());
        if !complete {
            entry.record.set_error(INCOMPLETE_UPLOAD);
        } else if let Err(e) = validate_file(&entry.record, self.pipeline.config()) {
            info!("Rejected {}: {}", entry.record.name, e);
            entry.record.set_error(e.to_string());
        }

        if entry.record.has_error() {
            entry.state = FileState::Rejected;
            remove_temp(&entry.temp).await;
            return Ok(());
        }

        self.latch.enter()?;
        entry.state = FileState::Processing;

        let record = entry.record.clone();
        let temp = entry.temp.clone();
        let pipeline = self.pipeline.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        jobs.push(
            async move {
                let mut record = record;
                let outcome = match store.promote(&temp, &record.name).await {
                    Ok((name, stored)) => {
                        record.name = name;
                        pipeline.process(record, &stored, &events).await
                    }
                    Err(e) => {
                        error!("Failed to store {}: {}", record.name, e);
                        remove_temp(&temp).await;
                        record.set_error(e.to_string());
                        PipelineOutcome {
                            error: record.error().map(str::to_string),
                            record,
                            derived: Vec::new(),
                        }
                    }
                };
                (idx, outcome)
            }
            .boxed(),
        );
        Ok(())
    }

    async fn on_job_done(&mut self, idx: usize, outcome: PipelineOutcome) -> Result<bool, UploadError> {
        let PipelineOutcome {
            mut record,
            derived,
            error,
        } = outcome;

        self.store.init_urls(&mut record, &self.urls).await;
        let state = if error.is_some() || record.has_error() {
            FileState::Failed
        } else {
            FileState::Processed
        };
        debug!("{} finished as {:?}", record.name, state);

        self.events.emit(UploadEvent::End(record.clone()));
        let entry = &mut self.entries[idx];
        entry.record = record;
        entry.state = state;
        self.derived.extend(derived);

        Ok(self.latch.leave()?)
    }

    /// Drops every part that is still being received.
    async fn abort(&mut self) -> Result<bool, UploadError> {
        self.aborted = true;
        let mut pending: Vec<usize> = self.pending.drain().map(|(_, idx)| idx).collect();
        pending.sort_unstable();
        for idx in pending {
            let entry = &mut self.entries[idx];
            warn!("Aborting {}", entry.record.name);
            self.events
                .emit(UploadEvent::Abort(AbortPayload::Record(entry.record.clone())));
            remove_temp(&entry.temp).await;
            entry.state = FileState::Aborted;
        }
        self.finish_parsing()
    }

    fn finish_parsing(&mut self) -> Result<bool, UploadError> {
        self.parsing = false;
        Ok(self.latch.leave()?)
    }

    /// Rejected files never went through a job, so they get their URLs and
    /// `end` event here.
    async fn into_report(mut self) -> SessionReport {
        for entry in &mut self.entries {
            if entry.state == FileState::Rejected {
                self.store.init_urls(&mut entry.record, &self.urls).await;
                self.events.emit(UploadEvent::End(entry.record.clone()));
            }
        }

        SessionReport {
            files: self
                .entries
                .into_iter()
                .filter(|e| e.state != FileState::Aborted)
                .map(|e| e.record)
                .collect(),
            derived: self.derived,
            redirect: self.redirect,
            aborted: self.aborted,
        }
    }
}

async fn remove_temp(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove temp file {}: {}", path.display(), e);
        }
    }
}
