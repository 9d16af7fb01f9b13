use super::{AcquiredArtifact, ArtifactSource, SourceError};
use crate::config::get_fallback_tool_timeout;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Tier 2: external tool that downloads the artifact and prints its path
///
/// The tool is invoked as `program [args...] <catalog_id>`. On success it
/// exits with status 0 and prints the absolute path of the file; the file is
/// read into memory and removed from disk.
pub struct ToolSource {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolSource {
    /// Create a tool source with the configured timeout
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_timeout(program, args, get_fallback_tool_timeout())
    }

    /// Create a tool source with an explicit timeout
    #[must_use]
    pub fn with_timeout(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

/// Last non-empty stdout line, which carries the artifact path
fn printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
}

#[async_trait]
impl ArtifactSource for ToolSource {
    fn name(&self) -> &'static str {
        "fallback-tool"
    }

    async fn fetch(&self, catalog_id: &str) -> Result<AcquiredArtifact, SourceError> {
        debug!(program = %self.program, catalog_id = %catalog_id, "Spawning fallback tool");

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(catalog_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SourceError::Spawn)?;

        // Dropping the output future on timeout kills the child
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SourceError::Timeout(self.timeout.as_secs()))?
            .map_err(SourceError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                status = %output.status,
                stderr = %crate::utils::truncate_str(stderr.trim(), 500),
                "Fallback tool failed"
            );
            return Err(SourceError::ToolFailed(output.status.to_string()));
        }

        let path = printed_path(&output.stdout)
            .ok_or_else(|| SourceError::InvalidPayload("tool printed no path".into()))?;

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| SourceError::Unreadable {
                path: path.clone(),
                source,
            })?;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path, error = %e, "Failed to remove fallback artifact");
        }

        let file_name = Path::new(&path)
            .file_name()
            .and_then(|name| name.to_str())
            .map_or_else(|| format!("{catalog_id}.apk"), str::to_string);

        Ok(AcquiredArtifact::new(bytes, file_name))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Scripts run through `sh` so the freshly written file is never exec'd directly
    fn write_script(dir: &TempDir, body: &str) -> std::io::Result<Vec<String>> {
        let path = dir.path().join("tool.sh");
        std::fs::write(&path, format!("{body}\n"))?;
        Ok(vec![path.to_string_lossy().into_owned()])
    }

    #[test]
    fn test_printed_path_takes_last_line() {
        assert_eq!(
            printed_path(b"progress 50%\n/tmp/x.apk\n\n"),
            Some("/tmp/x.apk".to_string())
        );
        assert_eq!(printed_path(b"  \n"), None);
    }

    #[tokio::test]
    async fn test_tool_success_reads_and_removes_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let artifact = dir.path().join("wa.apk");
        let script = write_script(
            &dir,
            &format!("printf 'APKDATA' > {0}\necho {0}", artifact.display()),
        )?;

        let source = ToolSource::with_timeout("sh", script, Duration::from_secs(10));
        let fetched = source.fetch("com.whatsapp").await?;

        assert_eq!(fetched.file_name, "wa.apk");
        assert_eq!(fetched.bytes, b"APKDATA".to_vec());
        assert_eq!(fetched.size, 7);
        assert!(!artifact.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_receives_catalog_id_last() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let out = dir.path().join("args.apk");
        let script = write_script(&dir, &format!("echo \"$@\" > {0}\necho {0}", out.display()))?;

        let mut args = script;
        args.push("--quiet".to_string());
        let source = ToolSource::with_timeout("sh", args, Duration::from_secs(10));
        let fetched = source.fetch("com.game").await?;
        assert_eq!(String::from_utf8_lossy(&fetched.bytes).trim(), "--quiet com.game");
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_failures() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;

        let failing = write_script(&dir, "echo boom >&2\nexit 3")?;
        let source = ToolSource::with_timeout("sh", failing, Duration::from_secs(10));
        assert!(matches!(
            source.fetch("com.a").await,
            Err(SourceError::ToolFailed(_))
        ));

        let missing = ToolSource::with_timeout(
            "/nonexistent/tool",
            Vec::new(),
            Duration::from_secs(10),
        );
        assert!(matches!(
            missing.fetch("com.a").await,
            Err(SourceError::Spawn(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_missing_artifact_path() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let script = write_script(&dir, "echo /nonexistent/artifact.apk")?;
        let source = ToolSource::with_timeout("sh", script, Duration::from_secs(10));
        assert!(matches!(
            source.fetch("com.a").await,
            Err(SourceError::Unreadable { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_timeout() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let script = write_script(&dir, "sleep 5")?;
        let source = ToolSource::with_timeout("sh", script, Duration::from_millis(200));
        assert!(matches!(
            source.fetch("com.a").await,
            Err(SourceError::Timeout(_))
        ));
        Ok(())
    }
}
