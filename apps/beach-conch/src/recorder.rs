use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use metrics::counter;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::error::RecorderError;
use crate::pcm;
use crate::registry::now_millis;

/// Depth of the sample queue between the peer event pump and the encoder writer.
const SAMPLE_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    program: String,
    args: Vec<String>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// ffmpeg reading raw mono s16le at 48 kHz from stdin and encoding to Opus.
    pub fn ffmpeg(program: impl Into<String>, output: &Path) -> Self {
        Self::new(program)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("s16le")
            .arg("-ar")
            .arg(pcm::SAMPLE_RATE.to_string())
            .arg("-ac")
            .arg(pcm::CHANNELS.to_string())
            .arg("-i")
            .arg("pipe:0")
            .arg("-c:a")
            .arg("libopus")
            .arg(output.to_string_lossy().into_owned())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// Where recordings go and which encoder binary produces them.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub dir: PathBuf,
    pub encoder: String,
}

impl RecorderConfig {
    /// Creates the recording directory when it is missing.
    pub async fn prepare(&self) -> Result<(), RecorderError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| RecorderError::OutputDir {
                dir: self.dir.clone(),
                source,
            })
    }

    pub fn command_for(&self, label: &str) -> EncoderCommand {
        let file = format!("{}_{}.ogg", sanitize(label), now_millis());
        EncoderCommand::ffmpeg(self.encoder.clone(), &self.dir.join(file))
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingSummary {
    pub samples_written: u64,
}

/// Encoder subprocess fed through its standard input.
pub struct Transcoder {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    scratch: Vec<u8>,
    samples_written: u64,
}

impl Transcoder {
    pub fn spawn(command: &EncoderCommand) -> Result<Self, RecorderError> {
        let mut child = Command::new(command.program())
            .args(command.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RecorderError::Spawn {
                program: command.program().to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(RecorderError::StdinUnavailable)?;
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text).await;
                text
            })
        });

        debug!(program = command.program(), args = ?command.args(), "encoder spawned");
        Ok(Self {
            program: command.program().to_string(),
            child,
            stdin: Some(stdin),
            stderr,
            scratch: Vec::new(),
            samples_written: 0,
        })
    }

    pub async fn write_samples(&mut self, samples: &[f32]) -> Result<(), RecorderError> {
        self.scratch.clear();
        pcm::encode_s16le(samples, &mut self.scratch);
        let stdin = self.stdin.as_mut().ok_or(RecorderError::StdinUnavailable)?;
        stdin
            .write_all(&self.scratch)
            .await
            .map_err(RecorderError::Write)?;
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    /// Closes stdin and waits for the encoder to exit.
    pub async fn finish(mut self) -> Result<RecordingSummary, RecorderError> {
        if let Some(mut stdin) = self.stdin.take() {
            // An encoder that already exited reports through its status below.
            let _ = stdin.shutdown().await;
        }
        let status = self.child.wait().await.map_err(RecorderError::Wait)?;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(RecorderError::ExitStatus {
                status,
                stderr: stderr.trim().to_string(),
            });
        }
        debug!(
            program = %self.program,
            samples = self.samples_written,
            "encoder finished"
        );
        Ok(RecordingSummary {
            samples_written: self.samples_written,
        })
    }
}

/// Handle to a running recording; dropping it ends the recording.
pub struct RecordingHandle {
    samples: mpsc::Sender<Vec<f32>>,
    task: JoinHandle<Result<RecordingSummary, RecorderError>>,
}

impl RecordingHandle {
    pub fn start(command: EncoderCommand, label: String) -> Result<Self, RecorderError> {
        let mut transcoder = Transcoder::spawn(&command)?;
        let (tx, mut rx) = mpsc::channel::<Vec<f32>>(SAMPLE_QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            while let Some(block) = rx.recv().await {
                if let Err(err) = transcoder.write_samples(&block).await {
                    warn!(recording = %label, error = %err, "encoder write failed");
                    break;
                }
            }
            let result = transcoder.finish().await;
            match &result {
                Ok(summary) => info!(
                    recording = %label,
                    samples = summary.samples_written,
                    "recording finished"
                ),
                Err(err) => {
                    counter!("beach_conch_recording_failures_total", 1);
                    warn!(recording = %label, error = %err, "recording failed");
                }
            }
            result
        });
        Ok(Self { samples: tx, task })
    }

    /// Queues a block; drops it when the encoder is behind.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        self.samples.try_send(samples).is_ok()
    }

    /// Ends the recording and waits for the encoder's verdict.
    pub async fn finish(self) -> Result<RecordingSummary, RecorderError> {
        let RecordingHandle { samples, task } = self;
        drop(samples);
        match task.await {
            Ok(result) => result,
            Err(err) => Err(RecorderError::Wait(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))),
        }
    }
}
