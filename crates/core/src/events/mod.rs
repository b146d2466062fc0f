//! Window and input events polled once per tick.

#[cfg(feature = "window")]
mod window;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::{FrameSize, Result};

#[cfg(feature = "window")]
pub use window::{WindowSurface, BEAT_SENSITIVITY_STEP};

/// Input the playback loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowEvent {
    /// Close the window or Ctrl-C: ends the session immediately.
    Quit,
    /// The drawable area changed size.
    Resized(FrameSize),
    NextPreset,
    PreviousPreset,
    RandomPreset,
    TogglePresetLock,
    /// Adds the given amount to the engine's beat sensitivity.
    BeatSensitivity(f32),
}

/// Windowing layer as seen by the playback loop.
pub trait EventSource {
    /// Returns every event that arrived since the previous poll.
    fn poll(&mut self) -> Vec<WindowEvent>;

    /// Shows a rendered BGRA frame. Sources without a surface drop it.
    fn present(&mut self, _frame: &[u8], _size: FrameSize) -> Result<()> {
        Ok(())
    }
}

/// Event source for runs without a window. The only input is a quit flag,
/// typically raised by a signal handler.
#[derive(Debug)]
pub struct HeadlessEvents {
    quit: &'static AtomicBool,
    reported: bool,
}

impl HeadlessEvents {
    pub fn new(quit: &'static AtomicBool, fullscreen: bool) -> Self {
        if fullscreen {
            tracing::warn!("fullscreen requested but running without a window");
        }
        Self {
            quit,
            reported: false,
        }
    }
}

impl EventSource for HeadlessEvents {
    fn poll(&mut self) -> Vec<WindowEvent> {
        if !self.reported && self.quit.load(Ordering::Relaxed) {
            self.reported = true;
            tracing::info!("quit requested");
            return vec![WindowEvent::Quit];
        }
        Vec::new()
    }
}

/// Replays a fixed list of events, each delivered on a given poll (tick).
#[derive(Debug, Default, Clone)]
pub struct ScriptedEvents {
    events: Vec<(u64, WindowEvent)>,
    next_event: usize,
    polls: u64,
}

impl ScriptedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `event` for the poll with index `tick` (zero-based).
    pub fn at(mut self, tick: u64, event: WindowEvent) -> Self {
        self.events.push((tick, event));
        self.events.sort_by_key(|(tick, _)| *tick);
        self
    }

    /// Number of polls served so far.
    pub fn polls(&self) -> u64 {
        self.polls
    }
}

impl EventSource for ScriptedEvents {
    fn poll(&mut self) -> Vec<WindowEvent> {
        let mut due = Vec::new();
        while let Some((tick, event)) = self.events.get(self.next_event) {
            if *tick > self.polls {
                break;
            }
            due.push(*event);
            self.next_event += 1;
        }
        self.polls += 1;
        due
    }
}
