use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::error;

/// External image conversion tool.
#[async_trait]
pub trait ImageTool: Send + Sync {
    /// Runs one conversion with an ordered argument list (source first,
    /// destination last), killing the tool once `timeout` elapses.
    async fn convert(&self, args: &[String], timeout: Option<Duration>) -> Result<()>;
}

/// ImageMagick command line (`convert`, `identify`).
#[derive(Debug, Clone, Default)]
pub struct ImageMagick {
    bin_dir: Option<PathBuf>,
}

impl ImageMagick {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    fn program(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Runs `program` and returns its stdout; a non-zero exit is an error
    /// carrying stderr.
    pub(crate) async fn run<I, S>(
        &self,
        program: &str,
        args: I,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(self.program(program));
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = command.output();
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, output)
                .await
                .map_err(|_| anyhow!("{} timed out after {:?}", program, limit))?,
            None => output.await,
        }
        .with_context(|| format!("failed to run {}", program))?;

        if !output.status.success() {
            let err_msg = String::from_utf8_lossy(&output.stderr);
            error!("{} failed: {}", program, err_msg.trim());
            return Err(anyhow!("{} failed: {}", program, err_msg.trim()));
        }

        Ok(output.stdout)
    }

    pub async fn health_check(&self) -> bool {
        self.run("convert", ["-version"], Some(Duration::from_secs(5)))
            .await
            .is_ok()
    }
}

#[async_trait]
impl ImageTool for ImageMagick {
    async fn convert(&self, args: &[String], timeout: Option<Duration>) -> Result<()> {
        self.run("convert", args, timeout).await.map(|_| ())
    }
}
