use super::BackendError;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs a speech command, feeding `input` on stdin and collecting stdout, killing the
/// process if it outlives `timeout`.
///
/// The child is spawned with `kill_on_drop`, so dropping the returned future (timeout
/// or cancellation upstream) also stops the engine process.
pub async fn run_with_timeout(
    engine: &str,
    mut command: Command,
    input: &str,
    timeout: Duration,
) -> Result<Vec<u8>, BackendError> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take();
    let payload = format!("{}\n", input);
    // Feed stdin while stdout drains so a chatty engine can't fill the pipe and stall.
    let feed = async move {
        let Some(mut stdin) = stdin else {
            return Ok(());
        };
        match stdin.write_all(payload.as_bytes()).await {
            // Engine exited before reading; its exit status tells the real story.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
        // stdin is dropped here, closing the pipe
    };
    let run = async {
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed.and(output)
    };

    let output = match tokio::time::timeout(timeout, run).await {
        Ok(output) => output?,
        Err(_) => return Err(BackendError::Timeout(timeout)),
    };

    if !output.status.success() {
        let err_text = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::Process {
            engine: engine.to_string(),
            message: if err_text.trim().is_empty() {
                format!("exited with {}", output.status)
            } else {
                err_text.trim().to_string()
            },
        });
    }
    if output.stdout.is_empty() {
        return Err(BackendError::InvalidResponse(format!(
            "{} produced no audio",
            engine
        )));
    }
    Ok(output.stdout)
}
