use crate::events::DEFAULT_EVENT_BUFFER;
use crate::services::pipeline::CustomStep;
use crate::services::versions::{ConvertOptions, ImageVersion, VersionSpec};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_IMAGE_TYPES: &str = r"\.(gif|jpe?g|png)$";

/// Upload and processing configuration.
///
/// Built once at startup and shared as `Arc<UploadConfig>`; nothing mutates it
/// afterwards. Custom steps and programmatic version transforms can only be
/// attached in code (`with_custom_step`, `with_image_version`).
#[derive(Clone)]
pub struct UploadConfig {
    /// Directory originals are stored in, versions go to `<upload_dir>/<version>/`.
    pub upload_dir: PathBuf,

    /// Where the transport stages incoming parts.
    pub tmp_dir: PathBuf,

    /// Public URL path the upload directory is served under (default: "/files")
    pub upload_url: String,

    pub min_file_size: Option<u64>,
    pub max_file_size: Option<u64>,

    /// Matched against the file name.
    pub accept_file_types: Regex,

    /// Files whose name matches get identified and get image versions.
    pub image_types: Option<Regex>,

    /// Received bytes ceiling for one request before the transport is paused.
    pub max_post_size: Option<u64>,

    /// Probe image metadata of originals and versions.
    pub identify: bool,

    pub custom_steps: Vec<Arc<dyn CustomStep>>,

    /// Generated in declared order.
    pub image_versions: Vec<ImageVersion>,

    /// Used in public URLs instead of the request `Host` header.
    pub hostname: Option<String>,

    pub ssl: bool,

    /// Directory holding the `convert` and `identify` binaries; `PATH` when unset.
    pub imagemagick_path: Option<PathBuf>,

    /// Events a subscriber may fall behind by before the oldest are dropped.
    pub event_buffer: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("public/files"),
            tmp_dir: env::temp_dir(),
            upload_url: "/files".to_string(),
            min_file_size: Some(1),
            max_file_size: Some(10_000_000_000), // 10 GB
            accept_file_types: Regex::new(".+").expect("valid default pattern"),
            image_types: Some(image_pattern(DEFAULT_IMAGE_TYPES).expect("valid default pattern")),
            max_post_size: Some(11_000_000_000), // 11 GB
            identify: false,
            custom_steps: Vec::new(),
            image_versions: vec![ImageVersion::new(
                "thumbnail",
                VersionSpec::options(ConvertOptions {
                    width: Some(80),
                    height: Some(80),
                    ..Default::default()
                }),
            )],
            hostname: None,
            ssl: false,
            imagemagick_path: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Deserialize)]
struct VersionEntry {
    name: String,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    identify: Option<bool>,
    #[serde(flatten)]
    options: ConvertOptions,
}

/// Parses a JSON array of version entries, e.g.
/// `[{"name": "thumbnail", "width": 80, "height": 80, "crop": true}]`.
/// An entry with `args` is a raw argument list for `convert`.
pub fn parse_image_versions(json: &str) -> Result<Vec<ImageVersion>, serde_json::Error> {
    let entries: Vec<VersionEntry> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let mut spec = match entry.args {
                Some(args) => VersionSpec::raw(args),
                None => VersionSpec::options(entry.options),
            };
            spec.identify = entry.identify;
            ImageVersion::new(entry.name, spec)
        })
        .collect())
}

fn image_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

fn env_size(key: &str, default: Option<u64>) -> Option<u64> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() || v == "0" => None,
        Ok(v) => v.parse().ok().or(default),
        Err(_) => default,
    }
}

fn parse_count(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|n| *n > 0)
}

fn env_count(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(v) => parse_count(&v).unwrap_or_else(|| {
            tracing::warn!("Invalid {} '{}', using {}", key, v, default);
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(default)
}

impl UploadConfig {
    /// Load configuration from environment variables.
    ///
    /// Unparseable values fall back to the defaults with a warning.
    pub fn from_env() -> Self {
        let default = Self::default();

        let accept_file_types = match env::var("ACCEPT_FILE_TYPES") {
            Ok(v) => Regex::new(&v).unwrap_or_else(|e| {
                tracing::warn!("Invalid ACCEPT_FILE_TYPES '{}': {}", v, e);
                default.accept_file_types.clone()
            }),
            Err(_) => default.accept_file_types.clone(),
        };

        let image_types = match env::var("IMAGE_TYPES") {
            Ok(v) if v.is_empty() => None,
            Ok(v) => match image_pattern(&v) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("Invalid IMAGE_TYPES '{}': {}", v, e);
                    default.image_types.clone()
                }
            },
            Err(_) => default.image_types.clone(),
        };

        let image_versions = match env::var("IMAGE_VERSIONS") {
            Ok(v) => parse_image_versions(&v).unwrap_or_else(|e| {
                tracing::warn!("Invalid IMAGE_VERSIONS: {}", e);
                default.image_versions.clone()
            }),
            Err(_) => default.image_versions.clone(),
        };

        Self {
            upload_dir: env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.upload_dir),
            tmp_dir: env::var("TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.tmp_dir),
            upload_url: env::var("UPLOAD_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(default.upload_url),
            min_file_size: env_size("MIN_FILE_SIZE", default.min_file_size),
            max_file_size: env_size("MAX_FILE_SIZE", default.max_file_size),
            accept_file_types,
            image_types,
            max_post_size: env_size("MAX_POST_SIZE", default.max_post_size),
            identify: env_flag("IDENTIFY", default.identify),
            custom_steps: Vec::new(),
            image_versions,
            hostname: env::var("HOSTNAME_OVERRIDE").ok().filter(|h| !h.is_empty()),
            ssl: env_flag("SSL", default.ssl),
            imagemagick_path: env::var("IMAGEMAGICK_PATH").ok().map(PathBuf::from),
            event_buffer: env_count("EVENT_BUFFER", default.event_buffer),
        }
    }

    /// Create config for development (local directories, identify on)
    pub fn development() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads/files"),
            tmp_dir: PathBuf::from("uploads/tmp"),
            identify: true,
            ..Self::default()
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn upload_url(&self) -> &str {
        &self.upload_url
    }

    pub fn is_image(&self, name: &str) -> bool {
        self.image_types.as_ref().is_some_and(|re| re.is_match(name))
    }

    pub fn original_path(&self, name: &str) -> PathBuf {
        self.upload_dir.join(name)
    }

    pub fn version_path(&self, version: &str, name: &str) -> PathBuf {
        self.upload_dir.join(version).join(name)
    }

    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = dir.into();
        self
    }

    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    pub fn with_custom_step(mut self, step: Arc<dyn CustomStep>) -> Self {
        self.custom_steps.push(step);
        self
    }

    /// Adds a version, replacing one with the same name in place.
    pub fn with_image_version(mut self, name: impl Into<String>, spec: VersionSpec) -> Self {
        let version = ImageVersion::new(name, spec);
        match self
            .image_versions
            .iter_mut()
            .find(|v| v.name == version.name)
        {
            Some(existing) => *existing = version,
            None => self.image_versions.push(version),
        }
        self
    }

    pub fn without_image_versions(mut self) -> Self {
        self.image_versions.clear();
        self
    }
}

impl fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadConfig")
            .field("upload_dir", &self.upload_dir)
            .field("tmp_dir", &self.tmp_dir)
            .field("upload_url", &self.upload_url)
            .field("min_file_size", &self.min_file_size)
            .field("max_file_size", &self.max_file_size)
            .field("accept_file_types", &self.accept_file_types.as_str())
            .field("image_types", &self.image_types.as_ref().map(Regex::as_str))
            .field("max_post_size", &self.max_post_size)
            .field("identify", &self.identify)
            .field(
                "custom_steps",
                &self.custom_steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field(
                "image_versions",
                &self
                    .image_versions
                    .iter()
                    .map(|v| v.name.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("hostname", &self.hostname)
            .field("ssl", &self.ssl)
            .field("event_buffer", &self.event_buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::versions::VersionTransform;

    #[test]
    fn test_default_config() {
        let config = UploadConfig::default();
        assert_eq!(config.upload_url(), "/files");
        assert_eq!(config.min_file_size, Some(1));
        assert!(!config.identify);
        assert_eq!(config.image_versions.len(), 1);
        assert_eq!(config.image_versions[0].name, "thumbnail");
        assert_eq!(config.event_buffer, 256);
    }

    #[test]
    fn test_event_buffer_values() {
        assert_eq!(parse_count(" 1024 "), Some(1024));
        assert_eq!(parse_count("0"), None);
        assert_eq!(parse_count("lots"), None);
        assert_eq!(env_count("UPLOAD_TEST_UNSET_BUFFER", 64), 64);
    }

    #[test]
    fn test_development_config() {
        let config = UploadConfig::development();
        assert!(config.identify);
        assert_eq!(config.upload_dir(), Path::new("uploads/files"));
        assert_eq!(config.version_path("thumbnail", "a.png"), Path::new("uploads/files/thumbnail/a.png"));
    }

    #[test]
    fn test_image_classification() {
        let config = UploadConfig::default();
        assert!(config.is_image("photo.JPG"));
        assert!(config.is_image("photo.jpeg"));
        assert!(config.is_image("anim.gif"));
        assert!(!config.is_image("notes.txt"));
        assert!(!config.is_image("png"));
    }

    #[test]
    fn test_parse_image_versions_keeps_order() {
        let versions = parse_image_versions(
            r#"[
                {"name": "thumb", "width": 80, "height": 80, "crop": true, "identify": true},
                {"name": "large", "width": 1024},
                {"name": "gray", "args": ["{src}", "-colorspace", "Gray", "{dst}"]}
            ]"#,
        )
        .unwrap();

        let names: Vec<_> = versions.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["thumb", "large", "gray"]);
        assert_eq!(versions[0].spec.identify, Some(true));
        match &versions[0].spec.transform {
            VersionTransform::Options(opts) => {
                assert!(opts.crop);
                assert_eq!(opts.width, Some(80));
            }
            other => panic!("expected options, got {:?}", other),
        }
        assert!(matches!(
            versions[2].spec.transform,
            VersionTransform::Raw(ref args) if args.len() == 4
        ));
    }

    #[test]
    fn test_with_image_version_replaces_same_name() {
        let config = UploadConfig::default()
            .with_image_version("large", VersionSpec::raw(vec!["a".into()]))
            .with_image_version("thumbnail", VersionSpec::raw(vec!["b".into()]));
        let names: Vec<_> = config.image_versions.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["thumbnail", "large"]);
    }
}
