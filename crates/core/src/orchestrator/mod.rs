use rand::Rng;

use crate::{
    audio::{AudioChunk, SampleSink, SampleSource, SilenceGenerator, SourceRead},
    encode::FrameEncoderBridge,
    engine::RenderEngine,
    events::{EventSource, WindowEvent},
    pacing::{Clock, FramePacer, PacingMode},
    Result, SessionConfig, VizError,
};

/// State of the real-audio pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Real audio chunks remain.
    Running,
    /// The audio ended; only lead-out padding is left.
    DrainingToSilence,
    /// Terminal.
    Done,
}

/// Where the session currently is, including the lead-in that precedes the
/// pipeline proper. `remaining` counts the padding ticks still to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    LeadIn { remaining: u64 },
    Running,
    DrainingToSilence { remaining: u64 },
    Done,
}

impl Phase {
    /// Pipeline state for this phase; `None` during lead-in.
    pub fn pipeline_state(&self) -> Option<PipelineState> {
        match self {
            Self::LeadIn { .. } => None,
            Self::Running => Some(PipelineState::Running),
            Self::DrainingToSilence { .. } => Some(PipelineState::DrainingToSilence),
            Self::Done => Some(PipelineState::Done),
        }
    }
}

/// Why a session reached [`Phase::Done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Audio and lead-out padding ran to the end.
    Completed,
    /// The user asked to quit.
    UserQuit,
    /// Writing to the encoder failed.
    EncodeFailed,
    /// Another collaborator returned an error.
    Failed,
}

/// Counters collected over a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub lead_in_ticks: u64,
    /// Ticks spent in [`PipelineState::Running`], including the tick that
    /// observed end-of-stream.
    pub running_ticks: u64,
    pub lead_out_ticks: u64,
    /// Sample frames read from the source.
    pub frames_read: u64,
    /// Non-empty chunks of real audio fed to the engine.
    pub chunks_read: u64,
    /// Chunks written to the live sink.
    pub chunks_played: u64,
    /// Silence chunks fed to the engine during padding.
    pub silence_chunks: u64,
    pub frames_encoded: u64,
    pub underruns: u64,
    pub end_reason: Option<EndReason>,
}

impl SessionReport {
    pub fn ticks(&self) -> u64 {
        self.lead_in_ticks + self.running_ticks + self.lead_out_ticks
    }
}

/// Owns every handle of one playback run.
pub struct Session {
    config: SessionConfig,
    engine: Box<dyn RenderEngine>,
    events: Box<dyn EventSource>,
    source: Option<Box<dyn SampleSource>>,
    sink: Option<Box<dyn SampleSink>>,
    encoder: Option<FrameEncoderBridge>,
    clock: Box<dyn Clock>,
    pacer: FramePacer,
    silence: SilenceGenerator,
    phase: Phase,
    started: bool,
    report: SessionReport,
    encode_error: Option<VizError>,
}

impl Session {
    /// Creates a session that renders `source` through `engine`. The source
    /// format must match `config`.
    pub fn new(
        config: SessionConfig,
        engine: Box<dyn RenderEngine>,
        source: Box<dyn SampleSource>,
        events: Box<dyn EventSource>,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        if source.sample_rate() != config.sample_rate() || source.channels() != config.channels() {
            return Err(VizError::config(format!(
                "source is {} Hz / {} ch but the session expects {} Hz / {} ch",
                source.sample_rate(),
                source.channels(),
                config.sample_rate(),
                config.channels()
            )));
        }

        let phase = match config.lead_in_ticks() {
            0 => Phase::Running,
            remaining => Phase::LeadIn { remaining },
        };
        Ok(Self {
            pacer: FramePacer::new(config.fps(), PacingMode::Simple),
            silence: SilenceGenerator::new(config.channels()),
            config,
            engine,
            events,
            source: Some(source),
            sink: None,
            encoder: None,
            clock,
            phase,
            started: false,
            report: SessionReport::default(),
            encode_error: None,
        })
    }

    /// Attaches a live playback sink. The device becomes the timing master,
    /// so pacing switches to compensated mode.
    pub fn with_sink(mut self, sink: Box<dyn SampleSink>) -> Self {
        self.sink = Some(sink);
        self.pacer = FramePacer::new(self.config.fps(), PacingMode::Compensated);
        self
    }

    /// Attaches the encoder bridge; every rendered frame is piped out.
    pub fn with_encoder(mut self, encoder: FrameEncoderBridge) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    pub fn pacer(&self) -> &FramePacer {
        &self.pacer
    }

    pub fn encoder(&self) -> Option<&FrameEncoderBridge> {
        self.encoder.as_ref()
    }

    /// True once the source has been released after end-of-stream.
    pub fn source_released(&self) -> bool {
        self.source.is_none()
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Runs the session to completion and releases every handle. An encoder
    /// failure ends the session and is returned as the error.
    pub fn run(&mut self) -> Result<SessionReport> {
        let outcome = self.drive();
        if outcome.is_err() && self.report.end_reason.is_none() {
            self.report.end_reason = Some(EndReason::Failed);
        }
        self.phase = Phase::Done;
        let cleanup = self.shutdown();

        tracing::info!(
            end_reason = ?self.report.end_reason,
            lead_in = self.report.lead_in_ticks,
            running = self.report.running_ticks,
            lead_out = self.report.lead_out_ticks,
            frames_read = self.report.frames_read,
            frames_encoded = self.report.frames_encoded,
            underruns = self.report.underruns,
            "session finished"
        );

        outcome?;
        if let Some(err) = self.encode_error.take() {
            return Err(err);
        }
        cleanup?;
        Ok(self.report.clone())
    }

    fn drive(&mut self) -> Result<()> {
        while !self.is_done() {
            self.tick()?;
        }
        Ok(())
    }

    /// Runs a single tick. Does nothing once the session is done.
    pub fn tick(&mut self) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }
        if !self.started {
            self.start()?;
        }

        let tick = self.pacer.begin_tick(self.clock.as_ref());

        self.engine.render_frame()?;
        if !self.encode(tick.sequence()) {
            self.end(EndReason::EncodeFailed);
            return Ok(());
        }
        if let Some(pixels) = self.engine.frame_bgra() {
            self.events.present(pixels, self.engine.frame_size())?;
        }
        self.move_audio()?;
        self.handle_events();

        if !self.is_done() {
            self.pacer.finish_tick(tick, self.clock.as_ref());
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        self.pacer.reset(self.clock.as_ref());
        tracing::info!(
            fps = self.config.fps(),
            sample_rate = self.config.sample_rate(),
            channels = self.config.channels(),
            lead_in_ticks = self.config.lead_in_ticks(),
            lead_out_ticks = self.config.lead_out_ticks(),
            pacing = ?self.pacer.mode(),
            encoding = self.encoder.is_some(),
            "session started"
        );
        if self.phase == Phase::Running {
            self.start_sink()?;
        }
        Ok(())
    }

    fn start_sink(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.start()?;
        }
        Ok(())
    }

    /// Returns false when the encoder failed and the session must end.
    fn encode(&mut self, frame: u64) -> bool {
        let Some(encoder) = self.encoder.as_mut() else {
            return true;
        };
        let result = encoder.transfer(frame, self.engine.readback());
        self.report.frames_encoded = encoder.frames_written();
        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(frame, %err, "encoding failed, ending session");
                self.encode_error = Some(err);
                false
            }
        }
    }

    fn move_audio(&mut self) -> Result<()> {
        match self.phase {
            Phase::LeadIn { remaining } => {
                self.feed_silence();
                self.report.lead_in_ticks += 1;
                if remaining <= 1 {
                    tracing::info!(ticks = self.report.lead_in_ticks, "lead-in finished");
                    self.phase = Phase::Running;
                    self.start_sink()?;
                } else {
                    self.phase = Phase::LeadIn {
                        remaining: remaining - 1,
                    };
                }
            }
            Phase::Running => {
                self.report.running_ticks += 1;
                self.read_audio()?;
            }
            Phase::DrainingToSilence { remaining } => {
                self.feed_silence();
                self.report.lead_out_ticks += 1;
                if remaining <= 1 {
                    self.end(EndReason::Completed);
                } else {
                    self.phase = Phase::DrainingToSilence {
                        remaining: remaining - 1,
                    };
                }
            }
            Phase::Done => {}
        }
        Ok(())
    }

    fn read_audio(&mut self) -> Result<()> {
        let read = match self.source.as_mut() {
            Some(source) => source.read(self.config.samples_per_tick())?,
            None => SourceRead::Exhausted,
        };
        self.report.frames_read += read.frames() as u64;

        match read {
            SourceRead::Chunk(chunk) => self.play(&chunk),
            SourceRead::EndOfStream(chunk) => {
                if !chunk.is_empty() {
                    self.play(&chunk)?;
                }
                self.end_of_stream();
                Ok(())
            }
            SourceRead::Exhausted => {
                self.end_of_stream();
                Ok(())
            }
        }
    }

    fn play(&mut self, chunk: &AudioChunk) -> Result<()> {
        self.engine.push_pcm16(chunk.samples(), chunk.frames());
        self.report.chunks_read += 1;
        if let Some(sink) = self.sink.as_mut() {
            sink.write(chunk)?;
            self.report.chunks_played += 1;
        }
        Ok(())
    }

    fn end_of_stream(&mut self) {
        self.source = None;
        tracing::info!(
            frames = self.report.frames_read,
            ticks = self.report.running_ticks,
            "end of audio stream"
        );
        match self.config.lead_out_ticks() {
            0 => self.end(EndReason::Completed),
            remaining => self.phase = Phase::DrainingToSilence { remaining },
        }
    }

    fn feed_silence(&mut self) {
        let chunk = self.silence.chunk();
        self.engine.push_pcm16(chunk.samples(), chunk.frames());
        self.report.silence_chunks += 1;
    }

    fn handle_events(&mut self) {
        for event in self.events.poll() {
            match event {
                WindowEvent::Quit => {
                    self.end(EndReason::UserQuit);
                    return;
                }
                WindowEvent::Resized(size) => {
                    if self.encoder.is_some() {
                        tracing::warn!(
                            width = size.width,
                            height = size.height,
                            "ignoring resize while encoding"
                        );
                    } else {
                        self.engine.resize(size);
                    }
                }
                WindowEvent::NextPreset => self.step_preset(1),
                WindowEvent::PreviousPreset => self.step_preset(-1),
                WindowEvent::RandomPreset => {
                    let count = self.engine.preset_count();
                    if count > 0 {
                        let index = rand::thread_rng().gen_range(0..count);
                        self.select_preset(index);
                    }
                }
                WindowEvent::TogglePresetLock => {
                    let locked = !self.engine.preset_locked();
                    self.engine.set_preset_lock(locked);
                }
                WindowEvent::BeatSensitivity(delta) => {
                    let sensitivity = (self.engine.beat_sensitivity() + delta).max(0.0);
                    self.engine.set_beat_sensitivity(sensitivity);
                }
            }
        }
    }

    fn step_preset(&mut self, step: isize) {
        let count = self.engine.preset_count() as isize;
        if count == 0 {
            return;
        }
        let current = self.engine.selected_preset().unwrap_or(0) as isize;
        self.select_preset((current + step).rem_euclid(count) as usize);
    }

    fn select_preset(&mut self, index: usize) {
        if let Err(err) = self.engine.select_preset(index) {
            tracing::warn!(index, %err, "preset change failed");
        }
    }

    fn end(&mut self, reason: EndReason) {
        if self.phase != Phase::Done {
            tracing::info!(?reason, from = ?self.phase, "session done");
            self.phase = Phase::Done;
            self.report.end_reason.get_or_insert(reason);
        }
    }

    /// Flushes and closes the encoder, then releases the sink and source.
    fn shutdown(&mut self) -> Result<()> {
        let mut result = Ok(());

        if let Some(mut encoder) = self.encoder.take() {
            if self.encode_error.is_some() {
                encoder.close();
            } else if let Err(err) = encoder.finish(self.engine.readback()) {
                self.report.end_reason = Some(EndReason::EncodeFailed);
                result = Err(err);
            }
            self.report.frames_encoded = encoder.frames_written();
        }

        if let Some(mut sink) = self.sink.take() {
            let closed = sink.close();
            self.report.underruns = sink.underruns();
            if let Err(err) = closed {
                tracing::warn!(%err, "closing playback sink failed");
                result = result.and(Err(err));
            }
        }

        self.source = None;
        result
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("phase", &self.phase)
            .field("pacer", &self.pacer)
            .field("encoder", &self.encoder)
            .field("has_sink", &self.sink.is_some())
            .field("source_released", &self.source.is_none())
            .field("report", &self.report)
            .finish()
    }
}
