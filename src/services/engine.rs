use crate::services::config::file_stem;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub result_path: PathBuf,
    pub log_path: PathBuf,
}

impl EngineOutput {
    /// Where the engine leaves its outputs for a staged input file.
    pub fn expected_for(input_path: &Path) -> Self {
        let dir = input_path.parent().unwrap_or_else(|| Path::new("."));
        let name = input_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let stem = file_stem(name);
        Self {
            result_path: dir.join(format!("{stem}.annot.vcf")),
            log_path: dir.join(format!("{stem}.vcf.count.log")),
        }
    }
}

/// The external annotation engine, treated as a black box.
#[async_trait::async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn annotate(&self, input_path: &Path) -> anyhow::Result<EngineOutput>;
}

/// Runs a configured program with the input path as its only argument.
pub struct CommandEngine {
    program: String,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait::async_trait]
impl AnalysisEngine for CommandEngine {
    async fn annotate(&self, input_path: &Path) -> anyhow::Result<EngineOutput> {
        let output = Command::new(&self.program)
            .arg(input_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("failed to launch {}: {e}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }

        let expected = EngineOutput::expected_for(input_path);
        for path in [&expected.result_path, &expected.log_path] {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                anyhow::bail!("engine finished without producing {}", path.display());
            }
        }
        Ok(expected)
    }
}
