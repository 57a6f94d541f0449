//! Collision-free, traversal-safe file names.

use regex::{Captures, Regex};
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::LazyLock;

/// Optional `-N` counter right before the final extension.
static COUNTER_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(?:-(\d+))?(\.[^.]+))?$").expect("valid counter pattern")
});

const FALLBACK_NAME: &str = "unnamed";
const MAX_RESERVE_ATTEMPTS: usize = 10_000;

/// Answers whether a name is already used in the target directory.
pub trait NameOracle {
    fn is_taken(&self, name: &str) -> bool;
}

impl NameOracle for HashSet<String> {
    fn is_taken(&self, name: &str) -> bool {
        self.contains(name)
    }
}

/// Strips directory components and leading dots.
pub fn sanitize(candidate: &str) -> String {
    let base = candidate
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim_start_matches('.');
    if base.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        base.to_string()
    }
}

/// `a.png` -> `a-1.png`, `a-1.png` -> `a-2.png`, `a` -> `a-1`.
pub fn increment(name: &str) -> String {
    COUNTER_SUFFIX
        .replace(name, |caps: &Captures| {
            let counter = caps
                .get(1)
                .and_then(|n| n.as_str().parse::<u64>().ok())
                .unwrap_or(0);
            let ext = caps.get(2).map(|e| e.as_str()).unwrap_or_default();
            format!("-{}{}", counter.saturating_add(1), ext)
        })
        .into_owned()
}

/// Sanitizes `candidate` and bumps its counter until `existing` no longer knows it.
///
/// Checking and later creating are separate steps, so two writers can still
/// pick the same name; staging goes through [`reserve`] for that reason.
pub fn safe_name<O: NameOracle + ?Sized>(candidate: &str, existing: &O) -> String {
    let mut name = sanitize(candidate);
    while existing.is_taken(&name) {
        name = increment(&name);
    }
    name
}

/// Directory-backed `safe_name`, checked through `tokio::fs`.
pub async fn available_name(dir: &Path, candidate: &str) -> String {
    let mut name = sanitize(candidate);
    while tokio::fs::try_exists(dir.join(&name)).await.unwrap_or(false) {
        name = increment(&name);
    }
    name
}

/// Claims a name in `dir` by creating an empty placeholder with `create_new`,
/// moving to the next counter whenever another writer got there first.
pub async fn reserve(dir: &Path, candidate: &str) -> io::Result<String> {
    let mut name = available_name(dir, candidate).await;
    for _ in 0..MAX_RESERVE_ATTEMPTS {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(&name))
            .await
        {
            Ok(_) => return Ok(name),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!("Name {} taken, trying next counter", name);
                name = increment(&name);
            }
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", candidate, dir.display()),
    ))
}
