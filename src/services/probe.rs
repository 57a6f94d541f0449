use crate::models::Metadata;
use crate::services::image_tool::ImageMagick;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;

/// `identify -format` template producing one `key=value` line per field.
const IDENTIFY_FORMAT: &str = "format=%m\\nwidth=%w\\nheight=%h\\ndepth=%z\\ncolorspace=%[colorspace]\\nquality=%Q\\nfilesize=%B\\n";

/// Inspects a file on disk and describes it.
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn identify(&self, path: &Path) -> Result<Map<String, Value>>;
}

/// Probe backed by ImageMagick `identify`.
#[derive(Debug, Clone, Default)]
pub struct IdentifyProbe {
    magick: ImageMagick,
}

impl IdentifyProbe {
    pub fn new(magick: ImageMagick) -> Self {
        Self { magick }
    }
}

#[async_trait]
impl MetadataProbe for IdentifyProbe {
    async fn identify(&self, path: &Path) -> Result<Map<String, Value>> {
        // [0]: first frame only, animated images would repeat every field.
        let target = format!("{}[0]", path.display());
        let stdout = self
            .magick
            .run("identify", ["-format", IDENTIFY_FORMAT, target.as_str()], None)
            .await?;
        Ok(parse_identify_output(&String::from_utf8_lossy(&stdout)))
    }
}

/// Probe that knows nothing; used when identification is disabled.
pub struct NoOpProbe;

#[async_trait]
impl MetadataProbe for NoOpProbe {
    async fn identify(&self, _path: &Path) -> Result<Map<String, Value>> {
        Ok(Map::new())
    }
}

/// First value per key wins; integers become JSON numbers.
pub fn parse_identify_output(output: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || fields.contains_key(key) {
            continue;
        }
        let value = match value.parse::<u64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::from(value),
        };
        fields.insert(key.to_string(), value);
    }
    fields
}

/// Best-effort probe: a failing tool yields empty metadata, never an error.
pub async fn probe(probe: &dyn MetadataProbe, path: &Path, from_original: bool) -> Metadata {
    match probe.identify(path).await {
        Ok(fields) => Metadata {
            from_original,
            fields,
        },
        Err(e) => {
            tracing::warn!("Metadata probe failed for {}: {:#}", path.display(), e);
            Metadata::empty(from_original)
        }
    }
}
