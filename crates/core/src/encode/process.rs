use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};

use super::FrameSink;
use crate::{config::EncoderConfig, FrameSize, Result, VizError};

/// Everything the encoder needs to know about one output video.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    pub output: PathBuf,
    pub audio: PathBuf,
    pub frame_size: FrameSize,
    pub fps: u32,
    /// Delay applied to the audio track by the encoder, in seconds.
    pub audio_offset_secs: f64,
    pub flip_vertical: bool,
}

/// External encoder fed raw BGRA frames on its standard input.
///
/// The child's exit status is never checked while frames are flowing; a
/// child that died shows up only as a failed write.
pub struct EncoderProcess {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl EncoderProcess {
    /// Builds the command line for `job` without spawning it.
    pub fn command(config: &EncoderConfig, job: &EncodeJob) -> Command {
        let mut cmd = Command::new(&config.program);

        cmd.arg("-y").arg("-loglevel").arg(&config.log_level);

        // Video arrives on stdin as raw frames at a fixed rate.
        cmd.arg("-f").arg("rawvideo");
        cmd.arg("-pix_fmt").arg("bgra");
        cmd.arg("-s")
            .arg(format!("{}x{}", job.frame_size.width, job.frame_size.height));
        cmd.arg("-r").arg(job.fps.to_string());
        cmd.arg("-i").arg("pipe:0");

        // Audio is read straight from the source file, shifted by the lead-in.
        cmd.arg("-itsoffset")
            .arg(format!("{:.3}", job.audio_offset_secs));
        cmd.arg("-i").arg(&job.audio);

        cmd.arg("-map").arg("0:v:0");
        cmd.arg("-map").arg("1:a:0");
        if job.flip_vertical {
            cmd.arg("-vf").arg("vflip");
        }
        cmd.args(&config.codec_args);
        cmd.arg(&job.output);

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit());
        cmd
    }

    pub fn spawn(config: &EncoderConfig, job: &EncodeJob) -> Result<Self> {
        let mut child = Self::command(config, job).spawn().map_err(|e| {
            VizError::config(format!("failed to launch encoder `{}`: {e}", config.program))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| VizError::msg("encoder stdin was not captured"))?;

        tracing::info!(
            program = %config.program,
            pid = child.id(),
            output = %job.output.display(),
            width = job.frame_size.width,
            height = job.frame_size.height,
            fps = job.fps,
            audio_offset = job.audio_offset_secs,
            "encoder started"
        );

        Ok(Self {
            program: config.program.clone(),
            child,
            stdin: Some(stdin),
        })
    }
}

impl Write for EncoderProcess {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "encoder pipe closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl FrameSink for EncoderProcess {
    fn close(&mut self) -> Result<()> {
        // Dropping stdin delivers EOF; the encoder then finalises the file.
        drop(self.stdin.take());
        match self.child.wait() {
            Ok(status) => tracing::info!(program = %self.program, %status, "encoder exited"),
            Err(err) => tracing::warn!(program = %self.program, %err, "could not reap encoder"),
        }
        Ok(())
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            let _ = FrameSink::close(self);
        }
    }
}

impl std::fmt::Debug for EncoderProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderProcess")
            .field("program", &self.program)
            .field("pid", &self.child.id())
            .field("open", &self.stdin.is_some())
            .finish()
    }
}
