use crate::config::UploadConfig;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Characters `encodeURIComponent` leaves alone.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// Public locations of stored files for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicUrls {
    base: String,
}

impl PublicUrls {
    /// `request_host` is the `Host` header; the configured hostname wins over it.
    pub fn new(config: &UploadConfig, request_host: Option<&str>) -> Self {
        let scheme = if config.ssl { "https:" } else { "http:" };
        let host = config
            .hostname
            .as_deref()
            .or(request_host)
            .unwrap_or("localhost");
        Self {
            base: format!("{}//{}{}", scheme, host, config.upload_url()),
        }
    }

    pub fn original(&self, name: &str) -> String {
        format!("{}/{}", self.base, encode_component(name))
    }

    pub fn version(&self, version: &str, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base,
            encode_component(version),
            encode_component(name)
        )
    }
}
