use async_trait::async_trait;
use presence_core::extractor::{ExtractorError, FaceExtractor, Faces};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("extractor command is empty")]
    EmptyCommand,
}

/// External extractor program. The image path is appended as the last argument.
#[derive(Debug, Clone)]
pub struct ExtractorCommand {
    program: String,
    args: Vec<String>,
}

impl ExtractorCommand {
    pub fn from_argv(argv: &[String]) -> Result<Self, EngineError> {
        let (program, args) = argv.split_first().ok_or(EngineError::EmptyCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Messages sent from the service to the engine task.
enum EngineRequest {
    Extract {
        image: PathBuf,
        reply: oneshot::Sender<Result<Faces, ExtractorError>>,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

#[async_trait]
impl FaceExtractor for EngineHandle {
    async fn extract(&self, image: &Path) -> Result<Faces, ExtractorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image: image.to_path_buf(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ExtractorError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ExtractorError::ChannelClosed)?
    }
}

/// Spawn the engine task.
///
/// Requests are served one at a time, in order. A request whose caller has
/// already given up (the reply channel is closed) is skipped without running
/// the extractor; if the caller gives up mid-run, the child is killed and the
/// worker moves on to the next request.
pub fn spawn_engine(
    command: ExtractorCommand,
    timeout: Duration,
    queue_depth: usize,
) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    tokio::spawn(async move {
        tracing::info!(program = command.program(), ?timeout, "extractor engine started");
        while let Some(req) = rx.recv().await {
            match req {
                EngineRequest::Extract { image, mut reply } => {
                    if reply.is_closed() {
                        tracing::debug!(
                            image = %image.display(),
                            "extract request abandoned; skipping"
                        );
                        continue;
                    }
                    // Dropping the run future drops the child, which kill_on_drop reaps.
                    tokio::select! {
                        result = run_extractor(&command, &image, timeout) => {
                            let _ = reply.send(result);
                        }
                        _ = reply.closed() => {
                            tracing::debug!(
                                image = %image.display(),
                                "extract request abandoned; child killed"
                            );
                        }
                    }
                }
            }
        }
        tracing::info!("extractor engine exiting");
    });

    EngineHandle { tx }
}

/// Run the extractor once. The child is killed if it outlives `timeout`.
async fn run_extractor(
    command: &ExtractorCommand,
    image: &Path,
    timeout: Duration,
) -> Result<Faces, ExtractorError> {
    let child = Command::new(&command.program)
        .args(&command.args)
        .arg(image)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExtractorError::Failed(format!("failed to start {}: {e}", command.program)))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.map_err(|e| ExtractorError::Failed(e.to_string()))?,
        Err(_) => {
            tracing::warn!(image = %image.display(), ?timeout, "extractor timed out; killed");
            return Err(ExtractorError::Timeout(timeout));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExtractorError::Failed(format!(
            "{} exited with {}: {}",
            command.program,
            output.status,
            stderr.trim()
        )));
    }

    let faces = parse_faces(&output.stdout)?;
    tracing::debug!(image = %image.display(), faces = faces.len(), "extractor finished");
    Ok(faces)
}

/// Parse extractor stdout: a JSON array with one numeric array per face.
pub fn parse_faces(stdout: &[u8]) -> Result<Faces, ExtractorError> {
    serde_json::from_slice(stdout).map_err(|e| ExtractorError::InvalidOutput(e.to_string()))
}
