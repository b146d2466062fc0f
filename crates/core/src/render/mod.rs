use std::collections::VecDeque;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    analysis::{AnalysisEngine, AnalysisFrame},
    config::EngineConfig,
    encode::PixelReadback,
    engine::VisualizerEngine,
    preset::{Preset, PresetLibrary, PresetStyle},
    FrameSize, Result, VizError,
};

/// Mono samples kept for analysis and the scope trace.
const WINDOW: usize = 1024;

pub struct SoftwareVisualizer {
    size: FrameSize,
    pixels: Vec<u8>,
    presets: PresetLibrary,
    current: usize,
    locked: bool,
    settings: EngineConfig,
    fps: u32,
    sample_rate: u32,
    channels: u16,
    window: VecDeque<f32>,
    samples_seen: u64,
    analysis: AnalysisEngine,
    frames_rendered: u64,
    preset_since: u64,
    last_hard_cut: Option<u64>,
    last_frame: AnalysisFrame,
    rng: StdRng,
}

impl SoftwareVisualizer {
    pub fn new(
        size: FrameSize,
        fps: u32,
        sample_rate: u32,
        channels: u16,
        presets: PresetLibrary,
        settings: EngineConfig,
    ) -> Result<Self> {
        if presets.is_empty() {
            return Err(VizError::config("no presets available"));
        }
        let mut analysis = AnalysisEngine::new(sample_rate);
        analysis.set_beat_sensitivity(settings.beat_sensitivity);

        let mut engine = Self {
            size,
            pixels: Vec::new(),
            presets,
            current: 0,
            locked: false,
            settings,
            fps: fps.max(1),
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            window: VecDeque::with_capacity(WINDOW),
            samples_seen: 0,
            analysis,
            frames_rendered: 0,
            preset_since: 0,
            last_hard_cut: None,
            last_frame: AnalysisFrame::default(),
            rng: StdRng::from_entropy(),
        };
        engine.clear();
        Ok(engine)
    }

    /// Replaces the random source used for shuffled preset changes.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn current_preset(&self) -> &Preset {
        // `current` is always in range; `new` rejects empty libraries.
        &self.presets.as_slice()[self.current]
    }

    /// Features computed for the most recent frame.
    pub fn last_analysis(&self) -> &AnalysisFrame {
        &self.last_frame
    }

    /// The current framebuffer, BGRA, top row first.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    fn clear(&mut self) {
        let [r, g, b] = self.current_preset().background;
        self.pixels = [b, g, r, 255].repeat(self.size.width as usize * self.size.height as usize);
    }

    fn switch_to(&mut self, index: usize, reason: &str) {
        self.current = index;
        self.preset_since = self.frames_rendered;
        tracing::info!(preset = %self.current_preset().name, index, reason, "displaying preset");
    }

    fn next_index(&mut self) -> usize {
        let count = self.presets.len();
        if self.settings.shuffle && count > 1 {
            let offset = self.rng.gen_range(1..count);
            (self.current + offset) % count
        } else {
            (self.current + 1) % count
        }
    }

    fn maybe_switch(&mut self) {
        if self.locked || self.presets.len() < 2 {
            return;
        }

        let shown_secs = (self.frames_rendered - self.preset_since) as f32 / self.fps as f32;
        if shown_secs >= self.settings.preset_duration_secs {
            let next = self.next_index();
            self.switch_to(next, "timer");
            return;
        }

        if self.settings.hard_cut && self.last_frame.beat {
            let threshold = (1.0 / self.settings.hard_cut_sensitivity.max(0.01)).min(1.0);
            let min_gap = (self.settings.hard_cut_min_secs * self.fps as f32) as u64;
            let rested = self
                .last_hard_cut
                .map_or(true, |at| self.frames_rendered - at >= min_gap);
            if self.last_frame.beat_confidence >= threshold && rested {
                self.last_hard_cut = Some(self.frames_rendered);
                let next = self.next_index();
                self.switch_to(next, "hard cut");
            }
        }
    }

    fn analysis_window(&self) -> Vec<f32> {
        let mut window = vec![0.0; WINDOW - self.window.len()];
        window.extend(self.window.iter());
        window
    }

    fn draw(&mut self, window: &[f32]) {
        let preset = self.current_preset().clone();
        self.fade(&preset);
        match preset.style {
            PresetStyle::Spectrum => self.draw_spectrum(&preset),
            PresetStyle::Scope => self.draw_scope(&preset, window),
            PresetStyle::Pulse => self.draw_pulse(&preset),
        }
    }

    /// Pulls every pixel towards the background, leaving a trail.
    fn fade(&mut self, preset: &Preset) {
        let trail = preset.trail.clamp(0.0, 0.99);
        let [r, g, b] = preset.background;
        let target = [b as f32, g as f32, r as f32];
        for pixel in self.pixels.chunks_exact_mut(4) {
            for (channel, bg) in pixel.iter_mut().zip(target) {
                *channel = (bg + (*channel as f32 - bg) * trail) as u8;
            }
            pixel[3] = 255;
        }
    }

    fn draw_spectrum(&mut self, preset: &Preset) {
        let (width, height) = (self.size.width as usize, self.size.height as usize);
        let bands = self.last_frame.bands.clone();
        if bands.is_empty() {
            return;
        }
        let bar_width = (width / bands.len()).max(1);

        for (i, level) in bands.iter().enumerate() {
            let level = (level * preset.gain).clamp(0.0, 1.0);
            let bar_height = (level * height as f32) as usize;
            let color = scale(preset.foreground, 0.4 + 0.6 * level);
            let x0 = i * bar_width;
            let x1 = (x0 + bar_width.saturating_sub(1).max(1)).min(width);
            for y in height - bar_height..height {
                for x in x0..x1 {
                    self.put(x, y, color);
                }
            }
        }
    }

    fn draw_scope(&mut self, preset: &Preset, window: &[f32]) {
        let (width, height) = (self.size.width as usize, self.size.height as usize);
        let mid = height as f32 / 2.0;
        let to_y = |sample: f32| {
            let y = mid - (sample * preset.gain).clamp(-1.0, 1.0) * mid * 0.9;
            (y as usize).min(height - 1)
        };

        let mut previous = to_y(window[0]);
        for x in 0..width {
            let y = to_y(window[x * window.len() / width]);
            let (lo, hi) = if y < previous { (y, previous) } else { (previous, y) };
            for row in lo..=hi {
                self.put(x, row, preset.foreground);
            }
            previous = y;
        }
    }

    fn draw_pulse(&mut self, preset: &Preset) {
        let (width, height) = (self.size.width as i64, self.size.height as i64);
        if self.last_frame.beat {
            let flash = mix(preset.background, preset.foreground, 0.25);
            let [r, g, b] = flash;
            for pixel in self.pixels.chunks_exact_mut(4) {
                pixel.copy_from_slice(&[b, g, r, 255]);
            }
        }

        let level = (0.15 + self.last_frame.rms * preset.gain * 1.5).min(1.0);
        let radius = (width.min(height) as f32 / 2.0 * level) as i64;
        let (cx, cy) = (width / 2, height / 2);
        let color = scale(preset.foreground, 0.5 + 0.5 * self.last_frame.bass);
        for y in (cy - radius).max(0)..(cy + radius).min(height) {
            for x in (cx - radius).max(0)..(cx + radius).min(width) {
                let (dx, dy) = (x - cx, y - cy);
                if dx * dx + dy * dy <= radius * radius {
                    self.put(x as usize, y as usize, color);
                }
            }
        }
    }

    fn put(&mut self, x: usize, y: usize, [r, g, b]: [u8; 3]) {
        let offset = (y * self.size.width as usize + x) * 4;
        if let Some(pixel) = self.pixels.get_mut(offset..offset + 4) {
            pixel.copy_from_slice(&[b, g, r, 255]);
        }
    }
}

impl VisualizerEngine for SoftwareVisualizer {
    fn render_frame(&mut self) -> Result<()> {
        let window = self.analysis_window();
        let time = self.samples_seen as f32 / self.sample_rate as f32;
        self.last_frame = self.analysis.process_window(&window, time)?;
        self.maybe_switch();
        self.draw(&window);
        self.frames_rendered += 1;
        tracing::trace!(
            frame = self.frames_rendered,
            rms = self.last_frame.rms,
            beat = self.last_frame.beat,
            "software frame rendered"
        );
        Ok(())
    }

    fn push_pcm16(&mut self, samples: &[i16], frames: usize) {
        let channels = self.channels as usize;
        for frame in samples.chunks_exact(channels).take(frames) {
            let sum: f32 = frame.iter().map(|s| *s as f32 / 32_768.0).sum();
            if self.window.len() == WINDOW {
                self.window.pop_front();
            }
            self.window.push_back(sum / channels as f32);
        }
        self.samples_seen += frames as u64;
    }

    fn preset_count(&self) -> usize {
        self.presets.len()
    }

    fn select_preset(&mut self, index: usize) -> Result<()> {
        if index >= self.presets.len() {
            return Err(VizError::msg(format!(
                "preset index {index} out of range ({} presets)",
                self.presets.len()
            )));
        }
        self.switch_to(index, "selected");
        Ok(())
    }

    fn selected_preset(&self) -> Option<usize> {
        Some(self.current)
    }

    fn set_preset_lock(&mut self, locked: bool) {
        self.locked = locked;
        tracing::info!(locked, "preset lock changed");
    }

    fn preset_locked(&self) -> bool {
        self.locked
    }

    fn resize(&mut self, size: FrameSize) {
        if size != self.size && size.width > 0 && size.height > 0 {
            self.size = size;
            self.clear();
            tracing::debug!(width = size.width, height = size.height, "viewport resized");
        }
    }

    fn beat_sensitivity(&self) -> f32 {
        self.analysis.beat_sensitivity()
    }

    fn set_beat_sensitivity(&mut self, sensitivity: f32) {
        self.analysis.set_beat_sensitivity(sensitivity);
        tracing::info!(sensitivity = self.analysis.beat_sensitivity(), "beat sensitivity changed");
    }

    fn frame_bgra(&self) -> Option<&[u8]> {
        Some(&self.pixels)
    }
}

impl PixelReadback for SoftwareVisualizer {
    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn queue_readback(&mut self, slot: usize, pixels: &mut [u8]) -> Result<()> {
        if pixels.len() != self.pixels.len() {
            return Err(VizError::msg(format!(
                "readback slot holds {} bytes, frame has {}",
                pixels.len(),
                self.pixels.len()
            )));
        }
        pixels.copy_from_slice(&self.pixels);
        tracing::trace!(slot, frame = self.frames_rendered, "software readback");
        Ok(())
    }

    fn wait_readback(&mut self, _slot: usize) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for SoftwareVisualizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareVisualizer")
            .field("size", &self.size)
            .field("preset", &self.current_preset().name)
            .field("locked", &self.locked)
            .field("frames_rendered", &self.frames_rendered)
            .finish()
    }
}

fn scale([r, g, b]: [u8; 3], factor: f32) -> [u8; 3] {
    let f = factor.clamp(0.0, 1.0);
    [(r as f32 * f) as u8, (g as f32 * f) as u8, (b as f32 * f) as u8]
}

fn mix(a: [u8; 3], b: [u8; 3], t: f32) -> [u8; 3] {
    let lerp = |x: u8, y: u8| (x as f32 + (y as f32 - x as f32) * t) as u8;
    [lerp(a[0], b[0]), lerp(a[1], b[1]), lerp(a[2], b[2])]
}
