use std::cell::RefCell;
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use sndviz_core::{
    EndReason, EngineConfig, EventSource, FrameEncoderBridge, FrameSink, FrameSize, ManualClock,
    PresetLibrary, SampleSource, ScriptedEvents, Session, SessionConfig, SoftwareVisualizer,
    VizError, WavSource, WindowEvent,
};

const SIZE: FrameSize = FrameSize {
    width: 32,
    height: 16,
};

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    closes: u32,
}

/// In-memory stand-in for the encoder's stdin. Fails every write once
/// `limit` bytes have been accepted.
struct CapturePipe {
    captured: Rc<RefCell<Captured>>,
    limit: usize,
}

impl Write for CapturePipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut captured = self.captured.borrow_mut();
        let room = self.limit - captured.bytes.len();
        if room == 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "encoder went away"));
        }
        let n = buf.len().min(room);
        captured.bytes.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FrameSink for CapturePipe {
    fn close(&mut self) -> sndviz_core::Result<()> {
        self.captured.borrow_mut().closes += 1;
        Ok(())
    }
}

/// Half a second of a 220 Hz tone, mono, 8 kHz.
fn write_tone(path: &Path) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..4_000 {
        let t = i as f32 / 8_000.0;
        let sample = (t * 220.0 * std::f32::consts::TAU).sin() * 16_000.0;
        writer.write_sample(sample as i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Window stand-in that keeps every presented frame.
struct Screen {
    events: ScriptedEvents,
    frames: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl EventSource for Screen {
    fn poll(&mut self) -> Vec<WindowEvent> {
        self.events.poll()
    }

    fn present(&mut self, frame: &[u8], size: FrameSize) -> sndviz_core::Result<()> {
        assert_eq!(size, SIZE);
        self.frames.borrow_mut().push(frame.to_vec());
        Ok(())
    }
}

fn session(
    audio: &Path,
    events: impl EventSource + 'static,
    limit: usize,
) -> (Session, Rc<RefCell<Captured>>) {
    let source = WavSource::open(audio).unwrap();
    let config = SessionConfig::new(25, source.sample_rate(), source.channels(), SIZE)
        .unwrap()
        .with_padding(Duration::from_millis(200), Duration::from_millis(400));

    let settings = EngineConfig {
        shuffle: false,
        ..EngineConfig::default()
    };
    let engine = SoftwareVisualizer::new(
        SIZE,
        config.fps(),
        config.sample_rate(),
        config.channels(),
        PresetLibrary::builtin(),
        settings,
    )
    .unwrap()
    .with_seed(7);

    let captured = Rc::new(RefCell::new(Captured::default()));
    let pipe = CapturePipe {
        captured: Rc::clone(&captured),
        limit,
    };

    let session = Session::new(
        config,
        Box::new(engine),
        Box::new(source),
        Box::new(events),
        Box::new(ManualClock::new()),
    )
    .unwrap()
    .with_encoder(FrameEncoderBridge::new(SIZE, Box::new(pipe)));
    (session, captured)
}

#[test]
fn wav_file_is_rendered_and_encoded_frame_for_frame() {
    let dir = tempfile::tempdir().unwrap();
    let audio = dir.path().join("tone.wav");
    write_tone(&audio);

    let (mut session, captured) = session(&audio, ScriptedEvents::new(), usize::MAX);
    let report = session.run().unwrap();

    // 4000 frames at 320 per tick: 12 full chunks, then a short final one.
    assert_eq!(report.lead_in_ticks, 5);
    assert_eq!(report.running_ticks, 13);
    assert_eq!(report.lead_out_ticks, 10);
    assert_eq!(report.frames_read, 4_000);
    assert_eq!(report.chunks_read, 13);
    assert_eq!(report.end_reason, Some(EndReason::Completed));
    assert_eq!(report.frames_encoded, 28);

    let captured = captured.borrow();
    assert_eq!(captured.closes, 1);
    assert_eq!(captured.bytes.len(), 28 * SIZE.bgra_len());

    // Every frame is opaque BGRA.
    assert!(captured
        .bytes
        .chunks_exact(4)
        .all(|pixel| pixel[3] == 255));
    // Real audio shows up in the picture; the first lead-in frame is blank.
    let first = &captured.bytes[..SIZE.bgra_len()];
    let loud = &captured.bytes[10 * SIZE.bgra_len()..11 * SIZE.bgra_len()];
    assert_ne!(first, loud);
}

#[test]
fn quit_flushes_and_closes_encoder() {
    let dir = tempfile::tempdir().unwrap();
    let audio = dir.path().join("tone.wav");
    write_tone(&audio);

    let events = ScriptedEvents::new()
        .at(3, WindowEvent::NextPreset)
        .at(8, WindowEvent::Quit);
    let (mut session, captured) = session(&audio, events, usize::MAX);
    let report = session.run().unwrap();

    assert_eq!(report.end_reason, Some(EndReason::UserQuit));
    assert_eq!(report.ticks(), 9);
    assert_eq!(report.frames_encoded, 9);
    let captured = captured.borrow();
    assert_eq!(captured.closes, 1);
    assert_eq!(captured.bytes.len(), 9 * SIZE.bgra_len());
}

#[test]
fn broken_encoder_pipe_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let audio = dir.path().join("tone.wav");
    write_tone(&audio);

    // Room for three frames and a bit of the fourth.
    let limit = 3 * SIZE.bgra_len() + 100;
    let (mut session, captured) = session(&audio, ScriptedEvents::new(), limit);
    let err = session.run().unwrap_err();

    assert_eq!(err.exit_code(), 4);
    assert!(matches!(err, VizError::EncodeWrite { written: 100, .. }));
    assert_eq!(session.report().end_reason, Some(EndReason::EncodeFailed));
    assert_eq!(session.report().frames_encoded, 3);
    // Frame 3 is drained on tick 4, which ends the session before any audio
    // moves, so only ticks 0..=3 are counted.
    assert_eq!(session.report().ticks(), 4);
    assert_eq!(captured.borrow().closes, 1);
}

#[test]
fn every_rendered_frame_reaches_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let audio = dir.path().join("tone.wav");
    write_tone(&audio);

    let frames = Rc::new(RefCell::new(Vec::new()));
    let screen = Screen {
        events: ScriptedEvents::new(),
        frames: Rc::clone(&frames),
    };
    let (mut session, captured) = session(&audio, screen, usize::MAX);
    let report = session.run().unwrap();

    let frames = frames.borrow();
    assert_eq!(frames.len() as u64, report.ticks());
    // The window shows the same pictures the encoder receives.
    let captured = captured.borrow();
    assert_eq!(frames.concat(), captured.bytes);
}

#[test]
fn missing_audio_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = WavSource::open(dir.path().join("nope.wav")).unwrap_err();
    assert!(matches!(err, VizError::Config(_)));
    assert_eq!(err.exit_code(), 2);
}
