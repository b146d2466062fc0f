use std::num::NonZeroU32;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use softbuffer::{Context, Surface};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent as SystemEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{KeyCode, ModifiersState, PhysicalKey};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Fullscreen, Window, WindowAttributes, WindowId};

use super::{EventSource, WindowEvent};
use crate::{FrameSize, Result, VizError};

/// Beat sensitivity change per Up/Down key press.
pub const BEAT_SENSITIVITY_STEP: f32 = 0.1;
/// Pumps allowed for the platform to hand out the first window.
const OPEN_ATTEMPTS: u32 = 50;

/// Desktop window that shows every rendered frame and turns keyboard and
/// window-manager input into [`WindowEvent`]s.
///
/// The event loop is pumped from the playback loop once per poll, so no
/// extra thread is involved and the window lives on the main thread.
pub struct WindowSurface {
    event_loop: EventLoop<()>,
    handler: SurfaceHandler,
    quit: &'static AtomicBool,
    quit_reported: bool,
    closed: bool,
}

impl WindowSurface {
    /// Opens a window of `size` (or fullscreen) and waits for it to appear.
    /// `quit` is the interrupt flag also honoured by headless runs.
    pub fn open(
        title: &str,
        size: FrameSize,
        fullscreen: bool,
        quit: &'static AtomicBool,
    ) -> Result<Self> {
        let event_loop = EventLoop::new()
            .map_err(|e| VizError::msg(format!("cannot create event loop: {e}")))?;

        let mut attributes = Window::default_attributes()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(size.width, size.height));
        if fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let mut surface = Self {
            event_loop,
            handler: SurfaceHandler::new(attributes, size),
            quit,
            quit_reported: false,
            closed: false,
        };

        for _ in 0..OPEN_ATTEMPTS {
            surface.pump(Some(Duration::from_millis(10)));
            if let Some(err) = surface.handler.error.take() {
                return Err(VizError::msg(err));
            }
            if surface.handler.display.is_some() {
                break;
            }
        }
        let Some(display) = surface.handler.display.as_ref() else {
            return Err(VizError::msg("the window never appeared"));
        };
        display.window.set_cursor_visible(!fullscreen);

        tracing::info!(
            width = size.width,
            height = size.height,
            fullscreen,
            "opened window"
        );
        Ok(surface)
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        let status = self
            .event_loop
            .pump_app_events(timeout, &mut self.handler);
        if let PumpStatus::Exit(code) = status {
            if !self.closed {
                self.closed = true;
                tracing::info!(code, "window event loop exited");
                self.handler.pending.push(WindowEvent::Quit);
            }
        }
    }
}

impl EventSource for WindowSurface {
    fn poll(&mut self) -> Vec<WindowEvent> {
        if !self.closed {
            self.pump(Some(Duration::ZERO));
        }
        if !self.quit_reported && self.quit.load(Ordering::Relaxed) {
            self.quit_reported = true;
            tracing::info!("quit requested");
            self.handler.pending.push(WindowEvent::Quit);
        }
        std::mem::take(&mut self.handler.pending)
    }

    fn present(&mut self, frame: &[u8], size: FrameSize) -> Result<()> {
        let Some(display) = self.handler.display.as_mut() else {
            return Ok(());
        };
        let inner = display.window.inner_size();
        // Minimised windows report a zero size; nothing to draw into.
        let (Some(width), Some(height)) = (
            NonZeroU32::new(inner.width),
            NonZeroU32::new(inner.height),
        ) else {
            return Ok(());
        };

        display
            .surface
            .resize(width, height)
            .map_err(|e| VizError::msg(format!("cannot resize window surface: {e}")))?;
        let mut buffer = display
            .surface
            .buffer_mut()
            .map_err(|e| VizError::msg(format!("cannot map window surface: {e}")))?;
        blit_scaled(
            frame,
            size,
            &mut buffer,
            inner.width as usize,
            inner.height as usize,
        );
        buffer
            .present()
            .map_err(|e| VizError::msg(format!("cannot present frame: {e}")))
    }
}

impl std::fmt::Debug for WindowSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowSurface")
            .field("open", &self.handler.display.is_some())
            .field("pending", &self.handler.pending)
            .field("closed", &self.closed)
            .finish()
    }
}

struct Display {
    window: Rc<Window>,
    surface: Surface<Rc<Window>, Rc<Window>>,
    _context: Context<Rc<Window>>,
}

struct SurfaceHandler {
    attributes: WindowAttributes,
    display: Option<Display>,
    error: Option<String>,
    pending: Vec<WindowEvent>,
    modifiers: ModifiersState,
    size: FrameSize,
}

impl SurfaceHandler {
    fn new(attributes: WindowAttributes, size: FrameSize) -> Self {
        Self {
            attributes,
            display: None,
            error: None,
            pending: Vec::new(),
            modifiers: ModifiersState::empty(),
            size,
        }
    }

    fn create_display(&self, event_loop: &ActiveEventLoop) -> std::result::Result<Display, String> {
        let window = event_loop
            .create_window(self.attributes.clone())
            .map_err(|e| format!("cannot create window: {e}"))?;
        let window = Rc::new(window);
        let context = Context::new(Rc::clone(&window))
            .map_err(|e| format!("cannot create drawing context: {e}"))?;
        let surface = Surface::new(&context, Rc::clone(&window))
            .map_err(|e| format!("cannot create window surface: {e}"))?;
        Ok(Display {
            window,
            surface,
            _context: context,
        })
    }

    fn key_pressed(&mut self, code: KeyCode) {
        match key_action(code, self.modifiers) {
            Some(KeyAction::Event(event)) => {
                tracing::debug!(?code, ?event, "key pressed");
                self.pending.push(event);
            }
            Some(KeyAction::ToggleFullscreen) => {
                if let Some(display) = self.display.as_ref() {
                    toggle_fullscreen(&display.window);
                }
            }
            None => {}
        }
    }
}

impl ApplicationHandler for SurfaceHandler {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.display.is_some() {
            return;
        }
        match self.create_display(event_loop) {
            Ok(display) => self.display = Some(display),
            Err(err) => {
                self.error = Some(err);
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: SystemEvent,
    ) {
        match event {
            SystemEvent::CloseRequested => self.pending.push(WindowEvent::Quit),
            SystemEvent::Resized(inner) => {
                let size = FrameSize::new(inner.width, inner.height);
                if inner.width > 0 && inner.height > 0 && size != self.size {
                    self.size = size;
                    self.pending.push(WindowEvent::Resized(size));
                }
            }
            SystemEvent::ModifiersChanged(modifiers) => self.modifiers = modifiers.state(),
            SystemEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => self.key_pressed(code),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum KeyAction {
    Event(WindowEvent),
    ToggleFullscreen,
}

/// Keyboard shortcuts. Keys are matched by position so they stay put on
/// non-QWERTY layouts.
fn key_action(code: KeyCode, modifiers: ModifiersState) -> Option<KeyAction> {
    let command = modifiers.control_key() || modifiers.super_key();
    let event = match code {
        KeyCode::KeyQ if command => WindowEvent::Quit,
        KeyCode::KeyN => WindowEvent::NextPreset,
        KeyCode::KeyP => WindowEvent::PreviousPreset,
        KeyCode::KeyR => WindowEvent::RandomPreset,
        KeyCode::KeyL | KeyCode::Space => WindowEvent::TogglePresetLock,
        KeyCode::ArrowUp => WindowEvent::BeatSensitivity(BEAT_SENSITIVITY_STEP),
        KeyCode::ArrowDown => WindowEvent::BeatSensitivity(-BEAT_SENSITIVITY_STEP),
        KeyCode::KeyF => return Some(KeyAction::ToggleFullscreen),
        _ => return None,
    };
    Some(KeyAction::Event(event))
}

fn toggle_fullscreen(window: &Window) {
    if window.fullscreen().is_some() {
        window.set_fullscreen(None);
        window.set_cursor_visible(true);
    } else {
        window.set_cursor_visible(false);
        window.set_fullscreen(Some(Fullscreen::Borderless(None)));
    }
}

/// Nearest-neighbour copy of a top-down BGRA frame into a `width` x `height`
/// buffer of `0RGB` pixels.
fn blit_scaled(frame: &[u8], size: FrameSize, out: &mut [u32], width: usize, height: usize) {
    let (src_width, src_height) = (size.width as usize, size.height as usize);
    if src_width == 0 || src_height == 0 || width == 0 || frame.len() < size.bgra_len() {
        out.fill(0);
        return;
    }

    for (y, row) in out.chunks_exact_mut(width).take(height).enumerate() {
        let src_row = y * src_height / height;
        for (x, pixel) in row.iter_mut().enumerate() {
            let i = (src_row * src_width + x * src_width / width) * 4;
            let (b, g, r) = (frame[i], frame[i + 1], frame[i + 2]);
            *pixel = u32::from(r) << 16 | u32::from(g) << 8 | u32::from(b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_keys_map_to_events() {
        let none = ModifiersState::empty();
        let event = |code| match key_action(code, none) {
            Some(KeyAction::Event(event)) => Some(event),
            _ => None,
        };

        assert_eq!(event(KeyCode::KeyN), Some(WindowEvent::NextPreset));
        assert_eq!(event(KeyCode::KeyP), Some(WindowEvent::PreviousPreset));
        assert_eq!(event(KeyCode::KeyR), Some(WindowEvent::RandomPreset));
        assert_eq!(event(KeyCode::KeyL), Some(WindowEvent::TogglePresetLock));
        assert_eq!(event(KeyCode::Space), Some(WindowEvent::TogglePresetLock));
        assert_eq!(
            event(KeyCode::ArrowUp),
            Some(WindowEvent::BeatSensitivity(BEAT_SENSITIVITY_STEP))
        );
        assert_eq!(
            event(KeyCode::ArrowDown),
            Some(WindowEvent::BeatSensitivity(-BEAT_SENSITIVITY_STEP))
        );
        assert_eq!(event(KeyCode::KeyZ), None);
        assert_eq!(key_action(KeyCode::KeyF, none), Some(KeyAction::ToggleFullscreen));
    }

    #[test]
    fn quit_needs_control_or_command() {
        assert_eq!(key_action(KeyCode::KeyQ, ModifiersState::empty()), None);
        for modifiers in [ModifiersState::CONTROL, ModifiersState::SUPER] {
            assert_eq!(
                key_action(KeyCode::KeyQ, modifiers),
                Some(KeyAction::Event(WindowEvent::Quit))
            );
        }
    }

    #[test]
    fn blit_scales_and_converts_bgra() {
        // 2x1 frame: a blue pixel then a red one, blown up to 4x2.
        let frame = [255, 0, 0, 255, 0, 0, 255, 255];
        let mut out = vec![7_u32; 8];
        blit_scaled(&frame, FrameSize::new(2, 1), &mut out, 4, 2);

        let (blue, red) = (0x0000_00ff, 0x00ff_0000);
        assert_eq!(out, vec![blue, blue, red, red, blue, blue, red, red]);
    }

    #[test]
    fn blit_clears_on_short_frame() {
        let mut out = vec![7_u32; 4];
        blit_scaled(&[0; 4], FrameSize::new(2, 2), &mut out, 2, 2);
        assert!(out.iter().all(|pixel| *pixel == 0));
    }
}
