use crate::config::UploadConfig;
use crate::events::{EventBus, UploadEvent};
use crate::models::{DerivedFile, FileRecord};
use crate::services::probe::{self, MetadataProbe};
use crate::services::versions::VersionGenerator;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// User-supplied processing step, run in declared order after identification.
///
/// A step may rewrite the record, call [`FileRecord::set_error`] to stop the
/// remaining steps, and return an additional file to list in
/// `processed_files`.
#[async_trait]
pub trait CustomStep: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn apply(&self, record: &mut FileRecord, src_path: &Path)
        -> Result<Option<FileRecord>>;
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub record: FileRecord,
    /// One fragment per attempted version, failed ones included.
    pub derived: Vec<DerivedFile>,
    /// Set when a custom step or a version failed.
    pub error: Option<String>,
}

pub struct ProcessingPipeline {
    config: Arc<UploadConfig>,
    probe: Arc<dyn MetadataProbe>,
    generator: VersionGenerator,
}

impl ProcessingPipeline {
    pub fn new(
        config: Arc<UploadConfig>,
        probe: Arc<dyn MetadataProbe>,
        generator: VersionGenerator,
    ) -> Self {
        Self {
            config,
            probe,
            generator,
        }
    }

    pub fn config(&self) -> &Arc<UploadConfig> {
        &self.config
    }

    /// Identify, custom steps, then versions. The first failure ends the run.
    pub async fn process(
        &self,
        mut record: FileRecord,
        src_path: &Path,
        events: &EventBus,
    ) -> PipelineOutcome {
        let is_image = self.config.is_image(&record.name);

        if self.config.identify && is_image {
            record.metadata = Some(probe::probe(self.probe.as_ref(), src_path, true).await);
        }

        if let Some(error) = self.run_custom_steps(&mut record, src_path, events).await {
            return PipelineOutcome {
                record,
                derived: Vec::new(),
                error: Some(error),
            };
        }

        let mut derived = Vec::new();
        let mut error = None;
        if is_image {
            for version in &self.config.image_versions {
                let dst = self.config.version_path(&version.name, &record.name);
                let fragment = self
                    .generator
                    .generate(&record, src_path, &dst, version)
                    .await;
                let failed = fragment.error().map(str::to_string);
                if failed.is_none() {
                    events.emit(UploadEvent::Image(fragment.clone()));
                }
                derived.push(fragment);
                if failed.is_some() {
                    error = failed;
                    break;
                }
            }
        } else {
            debug!("{} is not an image, skipping versions", record.name);
        }

        if error.is_none() {
            info!(
                "Processed {} ({} versions)",
                record.name,
                derived.len()
            );
            events.emit(UploadEvent::Processed {
                record: record.clone(),
                derived: derived.clone(),
            });
        }

        PipelineOutcome {
            record,
            derived,
            error,
        }
    }

    async fn run_custom_steps(
        &self,
        record: &mut FileRecord,
        src_path: &Path,
        events: &EventBus,
    ) -> Option<String> {
        for step in &self.config.custom_steps {
            match step.apply(record, src_path).await {
                Ok(extra) => {
                    if let Some(extra) = extra {
                        events.emit(UploadEvent::File(extra.clone()));
                        record.processed_files.push(extra);
                    }
                }
                Err(e) => {
                    warn!("Custom step {} failed for {}: {:#}", step.name(), record.name, e);
                    record.set_error(format!("{:#}", e));
                }
            }
            if let Some(error) = record.error() {
                return Some(error.to_string());
            }
        }
        None
    }
}
