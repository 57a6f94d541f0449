//! Named derived files ("versions") generated from an uploaded image.

use crate::models::{DerivedFile, FileRecord};
use crate::services::image_tool::ImageTool;
use crate::services::probe::{self, MetadataProbe};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_IMAGE_ARGS: &[&str] = &["-auto-orient"];

/// Declarative `convert` options, resized unless `crop` is set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConvertOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<f32>,
    /// Output format prefix, e.g. `jpg` writes `jpg:<dst>`.
    pub format: Option<String>,
    pub progressive: Option<bool>,
    pub colorspace: Option<String>,
    pub strip: Option<bool>,
    pub filter: Option<String>,
    pub sharpening: Option<f32>,
    pub gravity: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Extra arguments placed right after the source; `-auto-orient` when unset.
    #[serde(alias = "image_args", alias = "customArgs", alias = "imageArgs")]
    pub custom_args: Option<Vec<String>>,
    pub crop: bool,
}

impl ConvertOptions {
    fn geometry(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(format!("{}x{}", w, h)),
            (Some(w), None) => Some(w.to_string()),
            (None, Some(h)) => Some(format!("x{}", h)),
            (None, None) => None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Translates the options into a `convert` argument list.
    pub fn to_args(&self, src: &Path, dst: &Path) -> Vec<String> {
        let mut args = vec![src.display().to_string()];

        match &self.custom_args {
            Some(custom) => args.extend(custom.iter().cloned()),
            None => args.extend(DEFAULT_IMAGE_ARGS.iter().map(|a| a.to_string())),
        }

        if let Some(filter) = &self.filter {
            args.extend(["-filter".to_string(), filter.clone()]);
        }

        match (self.crop, self.width, self.height) {
            (true, Some(w), Some(h)) => {
                let gravity = self.gravity.as_deref().unwrap_or("Center");
                args.extend([
                    "-resize".to_string(),
                    format!("{}x{}^", w, h),
                    "-gravity".to_string(),
                    gravity.to_string(),
                    "-extent".to_string(),
                    format!("{}x{}", w, h),
                ]);
            }
            _ => {
                if let Some(geometry) = self.geometry() {
                    args.extend(["-resize".to_string(), geometry]);
                }
                if let Some(gravity) = &self.gravity {
                    args.extend(["-gravity".to_string(), gravity.clone()]);
                }
            }
        }

        if let Some(sharpening) = self.sharpening {
            args.extend(["-unsharp".to_string(), format!("0x{}", sharpening)]);
        }
        if let Some(quality) = self.quality {
            args.extend(["-quality".to_string(), quality.to_string()]);
        }
        if let Some(colorspace) = &self.colorspace {
            args.extend(["-colorspace".to_string(), colorspace.clone()]);
        }
        if self.strip == Some(true) {
            args.push("-strip".to_string());
        }
        if self.progressive == Some(true) {
            args.extend(["-interlace".to_string(), "Plane".to_string()]);
        }

        let dst = dst.display().to_string();
        args.push(match &self.format {
            Some(format) => format!("{}:{}", format, dst),
            None => dst,
        });
        args
    }
}

/// Programmatic version transform. Resolving the returned future is the
/// completion signal.
#[async_trait]
pub trait VersionFunction: Send + Sync {
    async fn transform(
        &self,
        record: &FileRecord,
        src: &Path,
        dst: &Path,
        tool: &dyn ImageTool,
    ) -> Result<()>;
}

#[derive(Clone)]
pub enum VersionTransform {
    Function(Arc<dyn VersionFunction>),
    /// Passed to `convert` as is, apart from `{src}` / `{dst}` substitution.
    Raw(Vec<String>),
    Options(ConvertOptions),
}

impl fmt::Debug for VersionTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionTransform::Function(_) => f.write_str("Function(..)"),
            VersionTransform::Raw(args) => f.debug_tuple("Raw").field(args).finish(),
            VersionTransform::Options(opts) => f.debug_tuple("Options").field(opts).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VersionSpec {
    pub transform: VersionTransform,
    /// Overrides the global identify setting for this version.
    pub identify: Option<bool>,
}

impl VersionSpec {
    pub fn options(options: ConvertOptions) -> Self {
        Self {
            transform: VersionTransform::Options(options),
            identify: None,
        }
    }

    pub fn raw(args: Vec<String>) -> Self {
        Self {
            transform: VersionTransform::Raw(args),
            identify: None,
        }
    }

    pub fn function(function: Arc<dyn VersionFunction>) -> Self {
        Self {
            transform: VersionTransform::Function(function),
            identify: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageVersion {
    pub name: String,
    pub spec: VersionSpec,
}

impl ImageVersion {
    pub fn new(name: impl Into<String>, spec: VersionSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

/// Create-if-absent; another writer creating the same directory is fine.
pub async fn ensure_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::create_dir_all(dir).await {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            match tokio::fs::metadata(dir).await {
                Ok(meta) if meta.is_dir() => Ok(()),
                _ => Err(e),
            }
        }
        other => other,
    }
}

pub struct VersionGenerator {
    tool: Arc<dyn ImageTool>,
    probe: Arc<dyn MetadataProbe>,
    identify: bool,
}

impl VersionGenerator {
    pub fn new(tool: Arc<dyn ImageTool>, probe: Arc<dyn MetadataProbe>, identify: bool) -> Self {
        Self {
            tool,
            probe,
            identify,
        }
    }

    /// Generates one version. Failures are reported on the returned fragment.
    pub async fn generate(
        &self,
        record: &FileRecord,
        src: &Path,
        dst: &Path,
        version: &ImageVersion,
    ) -> DerivedFile {
        let mut fragment = DerivedFile {
            record: record.clone(),
            version: version.name.clone(),
            src_path: src.to_path_buf(),
            dst_path: dst.to_path_buf(),
        };
        fragment.record.metadata = None;
        fragment.record.processed_files.clear();

        if record.has_error() {
            return fragment;
        }

        match self.run(record, src, dst, &version.spec.transform).await {
            Ok(()) => {
                info!("Generated version {} of {}", version.name, record.name);
                if version.spec.identify.unwrap_or(self.identify) {
                    fragment.record.metadata =
                        Some(probe::probe(self.probe.as_ref(), dst, false).await);
                }
            }
            Err(e) => {
                warn!(
                    "Version {} of {} failed: {:#}",
                    version.name, record.name, e
                );
                fragment.record.set_error(format!("{:#}", e));
            }
        }
        fragment
    }

    async fn run(
        &self,
        record: &FileRecord,
        src: &Path,
        dst: &Path,
        transform: &VersionTransform,
    ) -> Result<()> {
        if let Some(dir) = dst.parent() {
            ensure_dir(dir).await?;
        }

        match transform {
            VersionTransform::Function(function) => {
                function
                    .transform(record, src, dst, self.tool.as_ref())
                    .await
            }
            VersionTransform::Raw(args) => {
                let (src, dst) = (src.display().to_string(), dst.display().to_string());
                let args: Vec<String> = args
                    .iter()
                    .map(|arg| arg.replace("{src}", &src).replace("{dst}", &dst))
                    .collect();
                self.tool.convert(&args, None).await
            }
            VersionTransform::Options(options) => {
                self.tool
                    .convert(&options.to_args(src, dst), options.timeout())
                    .await
            }
        }
    }
}
