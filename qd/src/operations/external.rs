//! ExternalCommand - runs a configured program as an operation collaborator
//!
//! Arguments are templates: `{input}` becomes the input path, `{subject}` the
//! subject id. A nonzero exit status is an error carrying stderr.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, eyre};
use tracing::debug;

use super::builtin::{Article, ArticleExtractor, OcrEngine, PageSegmenter, Segment};

/// Default time limit for one invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn render_args(&self, input: &Path, subject_id: &str, extra: &[(&str, &str)]) -> Vec<String> {
        let input = input.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                let mut arg = arg.replace("{input}", &input).replace("{subject}", subject_id);
                for (key, value) in extra {
                    arg = arg.replace(&format!("{{{}}}", key), value);
                }
                arg
            })
            .collect()
    }

    /// Run the program and return its stdout
    pub async fn run(&self, input: &Path, subject_id: &str, extra: &[(&str, &str)]) -> eyre::Result<String> {
        let args = self.render_args(input, subject_id, extra);
        debug!(program = %self.program, ?args, "ExternalCommand::run: executing command");

        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.program)
                .args(&args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| eyre!("{} timed out after {}ms", self.program, self.timeout.as_millis()))?
        .context(format!("Failed to run {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(eyre!(
                "{} exited with {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        debug!(program = %self.program, bytes = output.stdout.len(), "ExternalCommand::run: command completed");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl OcrEngine for ExternalCommand {
    async fn recognize(&self, subject_id: &str, image_path: &Path, language: Option<&str>) -> eyre::Result<String> {
        let language = language.unwrap_or("eng");
        let text = self.run(image_path, subject_id, &[("language", language)]).await?;
        Ok(text.trim_end().to_string())
    }
}

/// Expects a JSON array of segments on stdout
#[async_trait]
impl PageSegmenter for ExternalCommand {
    async fn segment(&self, subject_id: &str, page_path: &Path) -> eyre::Result<Vec<Segment>> {
        let stdout = self.run(page_path, subject_id, &[]).await?;
        serde_json::from_str(&stdout).context(format!("{} produced invalid segment JSON", self.program))
    }
}

/// Expects a JSON array of articles on stdout
#[async_trait]
impl ArticleExtractor for ExternalCommand {
    async fn extract(&self, subject_id: &str, page_path: &Path) -> eyre::Result<Vec<Article>> {
        let stdout = self.run(page_path, subject_id, &[]).await?;
        serde_json::from_str(&stdout).context(format!("{} produced invalid article JSON", self.program))
    }
}
