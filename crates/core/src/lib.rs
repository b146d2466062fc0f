//! Core library for the sndviz audio visualiser.
//!
//! The crate drives a visualiser engine from an audio file in lock-step with
//! wall-clock time. Each module owns one subsystem: frame pacing, audio
//! sources and sinks, the encoder bridge that pipes rendered frames to an
//! external encoder, and the playback loop tying them together. A CPU
//! reference engine (`render`) is included for headless runs and tests.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod encode;
pub mod engine;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pacing;
pub mod preset;
pub mod render;
pub mod session;

pub use analysis::{AnalysisEngine, AnalysisFrame};
pub use audio::{
    AudioChunk, DevicePlayback, DeviceWrite, MemorySource, PlaybackDevice, SampleSink,
    SampleSource, SilenceGenerator, SourceRead, WavSource,
};
pub use config::{AppConfig, EncoderConfig, EngineConfig, VideoConfig};
pub use encode::{
    EncodeJob, EncoderProcess, FrameEncoderBridge, FrameRing, FrameSink, PixelReadback, SlotState,
};
pub use engine::{RenderEngine, VisualizerEngine};
pub use error::{Result, VizError};
pub use events::{EventSource, HeadlessEvents, ScriptedEvents, WindowEvent};
pub use orchestrator::{EndReason, Phase, PipelineState, Session, SessionReport};
pub use pacing::{Clock, FramePacer, FrameTick, ManualClock, PacingMode, SystemClock};
pub use preset::{Preset, PresetLibrary, PresetStyle};
pub use render::SoftwareVisualizer;
pub use session::{FrameSize, SessionConfig};

#[cfg(feature = "playback")]
pub use audio::CpalDevice;
#[cfg(feature = "window")]
pub use events::WindowSurface;
