use crate::{encode::PixelReadback, FrameSize, Result};

pub trait VisualizerEngine {
    /// Renders one frame from the PCM pushed so far.
    fn render_frame(&mut self) -> Result<()>;

    /// Feeds `frames` interleaved sample frames to the engine's PCM intake.
    fn push_pcm16(&mut self, samples: &[i16], frames: usize);

    fn preset_count(&self) -> usize;

    fn select_preset(&mut self, index: usize) -> Result<()>;

    fn selected_preset(&self) -> Option<usize>;

    /// While locked the engine never switches presets on its own.
    fn set_preset_lock(&mut self, locked: bool);

    fn preset_locked(&self) -> bool;

    /// Viewport size changed (window resize).
    fn resize(&mut self, size: FrameSize);

    fn beat_sensitivity(&self) -> f32;

    fn set_beat_sensitivity(&mut self, sensitivity: f32);

    /// CPU copy of the last frame as top-down BGRA, for surfaces that show
    /// it. Engines drawing straight into a window return `None`.
    fn frame_bgra(&self) -> Option<&[u8]> {
        None
    }
}

/// An engine whose color buffer can be read back for encoding.
pub trait RenderEngine: VisualizerEngine + PixelReadback {
    fn readback(&mut self) -> &mut dyn PixelReadback;
}

impl<T: VisualizerEngine + PixelReadback> RenderEngine for T {
    fn readback(&mut self) -> &mut dyn PixelReadback {
        self
    }
}
