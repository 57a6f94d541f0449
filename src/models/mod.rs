use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

const DELETE_TYPE: &str = "DELETE";

/// Descriptive fields captured by a metadata probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// `true` when captured from the uploaded file, `false` for a derived version.
    pub from_original: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Metadata {
    pub fn empty(from_original: bool) -> Self {
        Self {
            from_original,
            fields: Map::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One uploaded or derived file.
///
/// `name` is the only identity field that may change after creation (it is
/// rewritten to avoid collisions); `original_name`, `size` and `content_type`
/// come from the transport. The first error recorded is kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub name: String,
    original_name: String,
    size: u64,
    #[serde(rename = "type")]
    content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub processed_files: Vec<FileRecord>,
    /// Keyed by version name, the empty key is the original.
    pub urls: BTreeMap<String, String>,
    #[serde(rename = "delete_url", skip_serializing_if = "Option::is_none")]
    pub delete_url: Option<String>,
}

impl FileRecord {
    pub fn new(name: impl Into<String>, size: u64, content_type: Option<String>) -> Self {
        let name = name.into();
        Self {
            original_name: name.clone(),
            name,
            size,
            content_type,
            error: None,
            metadata: None,
            processed_files: Vec::new(),
            urls: BTreeMap::new(),
            delete_url: None,
        }
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Records a failure. A record that already failed keeps its first reason.
    pub fn set_error(&mut self, reason: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(reason.into());
        }
    }

    /// The transport reports the final size only once the part is fully received.
    pub(crate) fn confirm_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn url(&self, version: Option<&str>) -> Option<&str> {
        self.urls.get(version.unwrap_or_default()).map(String::as_str)
    }

    /// JSON shape returned to clients: no metadata, no processed files, and
    /// urls flattened to `url` / `<version>_url`.
    pub fn to_response(&self) -> FileResponse {
        let urls = self
            .urls
            .iter()
            .map(|(version, url)| {
                let key = if version.is_empty() {
                    "url".to_string()
                } else {
                    format!("{version}_url")
                };
                (key, url.clone())
            })
            .collect();

        FileResponse {
            name: self.name.clone(),
            original_name: self.original_name.clone(),
            size: self.size,
            content_type: self.content_type.clone(),
            error: self.error.clone(),
            urls,
            delete_url: self.delete_url.clone(),
            delete_type: DELETE_TYPE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub name: String,
    pub original_name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub urls: BTreeMap<String, String>,
    #[serde(rename = "delete_url", skip_serializing_if = "Option::is_none")]
    pub delete_url: Option<String>,
    /// Verb the client uses against `delete_url`.
    #[serde(rename = "delete_type")]
    pub delete_type: &'static str,
}

/// A file produced from an original by one image version.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedFile {
    #[serde(flatten)]
    pub record: FileRecord,
    pub version: String,
    pub src_path: PathBuf,
    pub dst_path: PathBuf,
}

impl DerivedFile {
    pub fn error(&self) -> Option<&str> {
        self.record.error()
    }
}
