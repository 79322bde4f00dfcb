//! Runs the external image-acquisition command.
//!
//! The command template is split into arguments with POSIX shell quoting
//! rules before placeholders are substituted, and the process is spawned directly without a shell. The
//! output path therefore always reaches the program as exactly one argument,
//! whatever characters it contains.

use crate::error::CaptureError;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

const RESOLUTION_PLACEHOLDER: &str = "{resolution}";
const OUTFILE_PLACEHOLDER: &str = "{outfile}";

/// Invokes the capture command described by a template such as
/// `fswebcam -r {resolution} --no-banner -S 2 {outfile}`.
#[derive(Debug, Clone)]
pub struct CaptureInvoker {
    template: Vec<String>,
    timeout: Duration,
}

impl CaptureInvoker {
    pub fn new(template: &str, timeout: Duration) -> Result<Self, CaptureError> {
        let template = shlex::split(template).ok_or_else(|| {
            CaptureError::InvalidTemplate("unbalanced quotes or trailing escape".to_string())
        })?;

        if template.is_empty() {
            return Err(CaptureError::InvalidTemplate("empty command".to_string()));
        }
        if !template.iter().any(|arg| arg.contains(OUTFILE_PLACEHOLDER)) {
            return Err(CaptureError::InvalidTemplate(format!(
                "missing {} placeholder",
                OUTFILE_PLACEHOLDER
            )));
        }

        Ok(Self { template, timeout })
    }

    /// Program and arguments for one invocation.
    pub fn build_args(&self, output: &Path, resolution: &str) -> (String, Vec<String>) {
        let outfile = output.to_string_lossy();
        let mut args = self.template.iter().map(|arg| {
            arg.replace(RESOLUTION_PLACEHOLDER, resolution)
                .replace(OUTFILE_PLACEHOLDER, &outfile)
        });

        // `new` guarantees at least one element
        let program = args.next().unwrap_or_default();
        (program, args.collect())
    }

    /// Capture one still to `output`, blocking the caller until the command
    /// exits or the timeout elapses.
    #[instrument(skip(self), fields(output = %output.display()))]
    pub async fn capture_raw(&self, output: &Path, resolution: &str) -> Result<(), CaptureError> {
        let (program, args) = self.build_args(output, resolution);

        debug!(program = %program, args = ?args, "Running capture command");

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Dropping the future on timeout kills the child
        let output_result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await
        {
            Ok(result) => result.map_err(|source| CaptureError::Spawn {
                program: program.clone(),
                source,
            })?,
            Err(_) => {
                warn!(program = %program, timeout_secs = self.timeout.as_secs(), "Capture command timed out");
                return Err(CaptureError::TimedOut(self.timeout.as_secs()));
            }
        };

        if !output_result.status.success() {
            let stderr = String::from_utf8_lossy(&output_result.stderr).trim().to_string();
            return Err(CaptureError::Exited {
                status: output_result.status.to_string(),
                stderr,
            });
        }

        if !output.is_file() {
            return Err(CaptureError::MissingOutput(output.to_path_buf()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_args() {
        let invoker = CaptureInvoker::new(
            "fswebcam -r {resolution} --no-banner -S 2 {outfile}",
            Duration::from_secs(5),
        )
        .unwrap();

        let (program, args) =
            invoker.build_args(Path::new("/data/images/a b;rm -rf.jpg"), "1280x720");

        assert_eq!(program, "fswebcam");
        assert_eq!(
            args,
            vec![
                "-r",
                "1280x720",
                "--no-banner",
                "-S",
                "2",
                "/data/images/a b;rm -rf.jpg"
            ]
        );
    }

    #[test]
    fn test_template_validation() {
        assert!(matches!(
            CaptureInvoker::new("   ", Duration::from_secs(1)),
            Err(CaptureError::InvalidTemplate(_))
        ));
        assert!(matches!(
            CaptureInvoker::new("fswebcam -r {resolution}", Duration::from_secs(1)),
            Err(CaptureError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_quoted_template_args() {
        let invoker = CaptureInvoker::new(
            r#"fswebcam --title "Pet Cam" --font 'sans:12' -r {resolution} {outfile}"#,
            Duration::from_secs(5),
        )
        .unwrap();

        let (program, args) = invoker.build_args(Path::new("/data/out.jpg"), "640x480");

        assert_eq!(program, "fswebcam");
        assert_eq!(
            args,
            vec!["--title", "Pet Cam", "--font", "sans:12", "-r", "640x480", "/data/out.jpg"]
        );
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        assert!(matches!(
            CaptureInvoker::new(r#"fswebcam --title "Pet Cam {outfile}"#, Duration::from_secs(1)),
            Err(CaptureError::InvalidTemplate(_))
        ));
    }

    #[tokio::test]
    async fn test_capture_success() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("fixture.jpg");
        std::fs::write(&src, b"jpeg bytes").unwrap();
        let out = dir.path().join("out.jpg");

        let invoker = CaptureInvoker::new(
            &format!("cp {} {{outfile}}", src.display()),
            Duration::from_secs(5),
        )
        .unwrap();

        invoker.capture_raw(&out, "640x480").await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_capture_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = CaptureInvoker::new(
            "cp /definitely/not/here.jpg {outfile}",
            Duration::from_secs(5),
        )
        .unwrap();

        let err = invoker
            .capture_raw(&dir.path().join("out.jpg"), "640x480")
            .await
            .unwrap_err();

        match err {
            CaptureError::Exited { status, stderr } => {
                assert!(!status.is_empty());
                assert!(!stderr.is_empty());
            }
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_capture_command_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let invoker =
            CaptureInvoker::new("no-such-camera-tool {outfile}", Duration::from_secs(5)).unwrap();

        let err = invoker
            .capture_raw(&dir.path().join("out.jpg"), "640x480")
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hang.sh");
        std::fs::write(&script, "sleep 5\n").unwrap();

        let invoker = CaptureInvoker::new(
            &format!("sh {} {{outfile}}", script.display()),
            Duration::from_millis(200),
        )
        .unwrap();

        let started = std::time::Instant::now();
        let err = invoker
            .capture_raw(&dir.path().join("out.jpg"), "640x480")
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_capture_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = CaptureInvoker::new("true {outfile}", Duration::from_secs(5)).unwrap();

        let err = invoker
            .capture_raw(&dir.path().join("out.jpg"), "640x480")
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::MissingOutput(_)));
    }
}
