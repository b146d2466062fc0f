use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::Parser;
use sndviz_core::{
    config::DEFAULT_DATA_DIR, AppConfig, EncodeJob, EncoderProcess, EventSource,
    FrameEncoderBridge, FrameSize, PixelReadback, PresetLibrary, SampleSink, SampleSource,
    Session, SessionConfig, SoftwareVisualizer, SystemClock, VisualizerEngine, VizError,
    WavSource,
};
use tracing_subscriber::EnvFilter;

/// Raised by the SIGINT handler, polled once per tick.
static QUIT: AtomicBool = AtomicBool::new(false);

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug_graphics);
    install_quit_handler();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("sndviz: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> sndviz_core::Result<()> {
    tracing::info!(
        audio = %cli.audio.display(),
        video = ?cli.video,
        device = ?cli.device,
        "starting sndviz"
    );

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let mut config = AppConfig::discover(&data_dir)?;
    if let Some(sensitivity) = cli.beat_sensitivity {
        config.engine.beat_sensitivity = sensitivity;
    }

    let source = WavSource::open(&cli.audio)?;
    let frame_size = FrameSize::new(config.video.width, config.video.height);
    let session_config = SessionConfig::new(
        config.video.fps,
        source.sample_rate(),
        source.channels(),
        frame_size,
    )?
    .with_padding(padding("-b", cli.before)?, padding("-a", cli.after)?);

    let presets = PresetLibrary::load(&data_dir)?;
    let initial = cli
        .preset
        .as_deref()
        .map(|name| presets.resolve(name))
        .transpose()?;

    let mut engine = SoftwareVisualizer::new(
        frame_size,
        session_config.fps(),
        session_config.sample_rate(),
        session_config.channels(),
        presets,
        config.engine.clone(),
    )?;
    if let Some(index) = initial {
        engine.select_preset(index)?;
    }

    let sink = cli
        .device
        .as_deref()
        .map(|name| open_sink(name, &session_config))
        .transpose()?;

    let encoder = match cli.video.as_ref() {
        Some(output) => {
            let job = EncodeJob {
                output: output.clone(),
                audio: cli.audio.clone(),
                frame_size,
                fps: session_config.fps(),
                audio_offset_secs: session_config.audio_offset_secs(),
                flip_vertical: engine.rows_bottom_up(),
            };
            let process = EncoderProcess::spawn(&config.encoder, &job)?;
            Some(FrameEncoderBridge::new(frame_size, Box::new(process)))
        }
        None => None,
    };

    let events = open_events(&cli, frame_size)?;
    let mut session = Session::new(
        session_config,
        Box::new(engine),
        Box::new(source),
        events,
        Box::new(SystemClock::start()),
    )?;
    if let Some(sink) = sink {
        session = session.with_sink(sink);
    }
    if let Some(encoder) = encoder {
        session = session.with_encoder(encoder);
    }

    session.run()?;
    Ok(())
}

fn padding(flag: &str, secs: f64) -> sndviz_core::Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| VizError::config(format!("{flag} expects non-negative seconds, got {secs}")))
}

#[cfg(feature = "window")]
fn open_events(cli: &Cli, frame_size: FrameSize) -> sndviz_core::Result<Box<dyn EventSource>> {
    let name = cli
        .audio
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let window = sndviz_core::WindowSurface::open(
        &format!("sndviz - {name}"),
        frame_size,
        cli.fullscreen,
        &QUIT,
    )?;
    Ok(Box::new(window))
}

#[cfg(not(feature = "window"))]
fn open_events(cli: &Cli, _frame_size: FrameSize) -> sndviz_core::Result<Box<dyn EventSource>> {
    Ok(Box::new(sndviz_core::HeadlessEvents::new(&QUIT, cli.fullscreen)))
}

#[cfg(feature = "playback")]
fn open_sink(name: &str, config: &SessionConfig) -> sndviz_core::Result<Box<dyn SampleSink>> {
    use sndviz_core::{CpalDevice, DevicePlayback};

    let device = CpalDevice::open(name, config.channels(), config.sample_rate())?;
    Ok(Box::new(DevicePlayback::new(device)))
}

#[cfg(not(feature = "playback"))]
fn open_sink(name: &str, _config: &SessionConfig) -> sndviz_core::Result<Box<dyn SampleSink>> {
    Err(VizError::DeviceOpen(format!(
        "cannot open `{name}`: sndviz was built without the `playback` feature"
    )))
}

fn init_tracing(debug_graphics: bool) {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if debug_graphics {
        for directive in ["sndviz_core::render=trace", "sndviz_core::encode=trace"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(unix)]
fn install_quit_handler() {
    use std::sync::atomic::Ordering;

    extern "C" fn on_interrupt(_signal: libc::c_int) {
        QUIT.store(true, Ordering::Relaxed);
    }

    // SAFETY: the handler only stores to an atomic, which is signal safe.
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}

#[cfg(not(unix))]
fn install_quit_handler() {}

#[derive(Parser, Debug)]
#[command(author, version, about = "Renders an audio visualisation in time with playback", long_about = None)]
struct Cli {
    /// Preset to start with, by name or file name.
    #[arg(short = 'p', value_name = "PRESET")]
    preset: Option<String>,

    /// Data directory holding config.json and presets/.
    #[arg(short = 'D', value_name = "DATADIR")]
    data_dir: Option<PathBuf>,

    /// Live playback device ("default" or part of a device name).
    #[arg(short = 'd', value_name = "DEVICE")]
    device: Option<String>,

    /// Seconds of silence before the audio starts.
    #[arg(short = 'b', value_name = "SECONDS", default_value_t = 0.0)]
    before: f64,

    /// Seconds of silence after the audio ends.
    #[arg(short = 'a', value_name = "SECONDS", default_value_t = 0.0)]
    after: f64,

    /// Beat sensitivity, overriding the config file.
    #[arg(short = 's', value_name = "BEATSENS")]
    beat_sensitivity: Option<f32>,

    /// Encode the visualisation to this video file.
    #[arg(short = 'v', value_name = "VIDEO")]
    video: Option<PathBuf>,

    /// Request a fullscreen window.
    #[arg(short = 'f')]
    fullscreen: bool,

    /// Trace rendering and encoding.
    #[arg(short = 'x')]
    debug_graphics: bool,

    /// WAV file to visualise.
    audio: PathBuf,
}
