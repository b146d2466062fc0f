//! Streams rendered frames to an external encoder through a two-slot ring.

mod process;

pub use process::{EncodeJob, EncoderProcess};

use std::io::{self, Write};

use crate::{FrameSize, Result, VizError};

/// Number of transfer slots in the ring.
pub const SLOT_COUNT: usize = 2;

/// Graphics-side half of the readback protocol.
pub trait PixelReadback {
    /// Size of the color buffer being read back.
    fn frame_size(&self) -> FrameSize;

    /// Whether rows come out bottom row first (as with OpenGL readback).
    fn rows_bottom_up(&self) -> bool {
        false
    }

    /// Starts copying the current color buffer into `pixels` (BGRA, tightly
    /// packed). The copy may still be in progress when this returns; the
    /// bridge will not touch `pixels` before [`PixelReadback::wait_readback`]
    /// for the same slot.
    fn queue_readback(&mut self, slot: usize, pixels: &mut [u8]) -> Result<()>;

    /// Blocks until the transfer queued for `slot` is complete.
    fn wait_readback(&mut self, slot: usize) -> Result<()>;
}

/// Byte pipe into the encoder. Broken pipes surface only as write errors.
pub trait FrameSink: Write {
    /// Closes the pipe. The bridge calls this exactly once.
    fn close(&mut self) -> Result<()>;
}

/// Ownership state of one transfer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the bridge and safe to hand to the backend.
    Free,
    /// Lent to the backend for the readback of `frame`.
    InFlight { frame: u64 },
}

struct FrameSlot {
    pixels: Vec<u8>,
    state: SlotState,
}

impl std::fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot")
            .field("bytes", &self.pixels.len())
            .field("state", &self.state)
            .finish()
    }
}

/// Two-slot transfer ring indexed by frame parity.
#[derive(Debug)]
pub struct FrameRing {
    slots: [FrameSlot; SLOT_COUNT],
}

impl FrameRing {
    pub fn new(frame_len: usize) -> Self {
        let slot = || FrameSlot {
            pixels: vec![0; frame_len],
            state: SlotState::Free,
        };
        Self {
            slots: [slot(), slot()],
        }
    }

    /// Slot used for `frame`.
    pub fn slot_for(frame: u64) -> usize {
        (frame % SLOT_COUNT as u64) as usize
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.slots[slot].state
    }

    /// Lends the slot for `frame` to the backend.
    fn issue(&mut self, frame: u64, backend: &mut dyn PixelReadback) -> Result<()> {
        let index = Self::slot_for(frame);
        let slot = &mut self.slots[index];
        if let SlotState::InFlight { frame: pending } = slot.state {
            return Err(VizError::msg(format!(
                "readback slot {index} still holds frame {pending} when frame {frame} was issued"
            )));
        }
        backend.queue_readback(index, &mut slot.pixels)?;
        slot.state = SlotState::InFlight { frame };
        Ok(())
    }

    /// Waits for the in-flight slot of a frame older than `current`, if any,
    /// and returns its slot index and frame number. The slot stays in flight until
    /// [`FrameRing::release`].
    fn complete_before(
        &mut self,
        current: Option<u64>,
        backend: &mut dyn PixelReadback,
    ) -> Result<Option<(usize, u64)>> {
        let oldest = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot.state {
                SlotState::InFlight { frame } if current.map_or(true, |c| frame < c) => {
                    Some((index, frame))
                }
                _ => None,
            })
            .min_by_key(|(_, frame)| *frame);

        if let Some((index, _)) = oldest {
            backend.wait_readback(index)?;
        }
        Ok(oldest)
    }

    fn pixels(&self, slot: usize) -> &[u8] {
        &self.slots[slot].pixels
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot].state = SlotState::Free;
    }
}

/// Moves rendered frames from the backend into the encoder pipe.
///
/// Tick `N` queues its readback into slot `N % 2` before the frame from tick
/// `N - 1` is mapped and written, so output lags one frame behind.
pub struct FrameEncoderBridge {
    ring: FrameRing,
    sink: Option<Box<dyn FrameSink>>,
    frame_size: FrameSize,
    frames_written: u64,
}

impl FrameEncoderBridge {
    pub fn new(frame_size: FrameSize, sink: Box<dyn FrameSink>) -> Self {
        Self {
            ring: FrameRing::new(frame_size.bgra_len()),
            sink: Some(sink),
            frame_size,
            frames_written: 0,
        }
    }

    pub fn frame_size(&self) -> FrameSize {
        self.frame_size
    }

    /// Frames fully written to the pipe so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    /// Per-tick transfer for `frame`: queue its readback, then drain the frame
    /// queued on the previous tick. A failed write closes the pipe and is
    /// returned as [`VizError::EncodeWrite`].
    pub fn transfer(&mut self, frame: u64, backend: &mut dyn PixelReadback) -> Result<()> {
        if self.sink.is_none() {
            return Err(VizError::msg("encoder pipe is already closed"));
        }
        let size = backend.frame_size();
        if size != self.frame_size {
            return Err(VizError::msg(format!(
                "backend frame {}x{} does not match encoder frame {}x{}",
                size.width, size.height, self.frame_size.width, self.frame_size.height
            )));
        }

        self.ring.issue(frame, backend)?;
        tracing::trace!(frame, slot = FrameRing::slot_for(frame), "readback queued");
        self.drain(Some(frame), backend)
    }

    /// Writes the last in-flight frame and closes the pipe.
    pub fn finish(&mut self, backend: &mut dyn PixelReadback) -> Result<()> {
        if self.sink.is_some() {
            while self.ring.slots.iter().any(|s| s.state != SlotState::Free) {
                self.drain(None, backend)?;
            }
        }
        self.close();
        Ok(())
    }

    /// Closes the pipe without flushing. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            match sink.close() {
                Ok(()) => tracing::info!(frames = self.frames_written, "encoder pipe closed"),
                Err(err) => tracing::warn!(%err, "closing encoder pipe failed"),
            }
        }
    }

    fn drain(&mut self, current: Option<u64>, backend: &mut dyn PixelReadback) -> Result<()> {
        let Some((slot, frame)) = self.ring.complete_before(current, backend)? else {
            return Ok(());
        };

        let result = match self.sink.as_mut() {
            Some(sink) => write_frame(sink.as_mut(), self.ring.pixels(slot)),
            None => Ok(()),
        };
        self.ring.release(slot);

        match result {
            Ok(()) => {
                self.frames_written += 1;
                tracing::trace!(frame, slot, "frame written to encoder");
                Ok(())
            }
            Err((written, source)) => {
                tracing::error!(frame, written, %source, "encoder pipe write failed");
                self.close();
                Err(VizError::EncodeWrite {
                    written,
                    expected: self.frame_size.bgra_len(),
                    source,
                })
            }
        }
    }
}

impl std::fmt::Debug for FrameEncoderBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameEncoderBridge")
            .field("ring", &self.ring)
            .field("open", &self.sink.is_some())
            .field("frame_size", &self.frame_size)
            .field("frames_written", &self.frames_written)
            .finish()
    }
}

/// Writes a whole frame, reporting how far it got on failure. A zero-length
/// write counts as a failure since the encoder would lose frame alignment.
fn write_frame(sink: &mut dyn FrameSink, pixels: &[u8]) -> std::result::Result<(), (usize, io::Error)> {
    let mut written = 0;
    while written < pixels.len() {
        match sink.write(&pixels[written..]) {
            Ok(0) => {
                return Err((
                    written,
                    io::Error::new(io::ErrorKind::WriteZero, "encoder accepted no bytes"),
                ))
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err((written, err)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Queue(usize),
        Wait(usize),
    }

    /// Backend that stamps each readback with the number of frames rendered.
    struct StampBackend {
        size: FrameSize,
        rendered: u8,
        calls: Vec<Call>,
    }

    impl StampBackend {
        fn new() -> Self {
            Self {
                size: FrameSize::new(2, 1),
                rendered: 0,
                calls: Vec::new(),
            }
        }
    }

    impl PixelReadback for StampBackend {
        fn frame_size(&self) -> FrameSize {
            self.size
        }

        fn queue_readback(&mut self, slot: usize, pixels: &mut [u8]) -> Result<()> {
            self.calls.push(Call::Queue(slot));
            pixels.fill(self.rendered);
            self.rendered += 1;
            Ok(())
        }

        fn wait_readback(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            Ok(())
        }
    }

    #[derive(Default)]
    struct PipeLog {
        bytes: Vec<u8>,
        closes: u32,
    }

    /// Pipe that accepts `budget` bytes, then short-writes.
    struct TestPipe {
        log: Rc<RefCell<PipeLog>>,
        budget: usize,
    }

    impl Write for TestPipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.log.borrow_mut().bytes.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl FrameSink for TestPipe {
        fn close(&mut self) -> Result<()> {
            self.log.borrow_mut().closes += 1;
            Ok(())
        }
    }

    fn bridge(budget: usize) -> (FrameEncoderBridge, Rc<RefCell<PipeLog>>) {
        let log = Rc::new(RefCell::new(PipeLog::default()));
        let pipe = TestPipe {
            log: Rc::clone(&log),
            budget,
        };
        (FrameEncoderBridge::new(FrameSize::new(2, 1), Box::new(pipe)), log)
    }

    #[test]
    fn slot_is_mapped_one_tick_after_it_was_queued() {
        let (mut bridge, log) = bridge(usize::MAX);
        let mut backend = StampBackend::new();

        for frame in 0..4 {
            bridge.transfer(frame, &mut backend).unwrap();
        }

        assert_eq!(
            backend.calls,
            vec![
                Call::Queue(0),
                Call::Queue(1),
                Call::Wait(0),
                Call::Queue(0),
                Call::Wait(1),
                Call::Queue(1),
                Call::Wait(0),
            ]
        );
        // Frames 0..=2 are out, frame 3 is still in flight.
        assert_eq!(log.borrow().bytes, vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 2]);
        assert_eq!(bridge.ring().state(1), SlotState::InFlight { frame: 3 });
        assert_eq!(bridge.ring().state(0), SlotState::Free);
    }

    #[test]
    fn finish_flushes_pending_frame_and_closes_once() {
        let (mut bridge, log) = bridge(usize::MAX);
        let mut backend = StampBackend::new();

        for frame in 0..3 {
            bridge.transfer(frame, &mut backend).unwrap();
        }
        bridge.finish(&mut backend).unwrap();
        bridge.finish(&mut backend).unwrap();

        let log = log.borrow();
        assert_eq!(log.bytes.len(), 3 * 8);
        assert_eq!(&log.bytes[16..], &[2; 8]);
        assert_eq!(log.closes, 1);
        assert_eq!(bridge.frames_written(), 3);
        assert!(!bridge.is_open());
    }

    #[test]
    fn short_write_closes_pipe_exactly_once() {
        // One full frame plus half of the next.
        let (mut bridge, log) = bridge(12);
        let mut backend = StampBackend::new();

        bridge.transfer(0, &mut backend).unwrap();
        bridge.transfer(1, &mut backend).unwrap();
        let err = bridge.transfer(2, &mut backend).unwrap_err();

        match err {
            VizError::EncodeWrite {
                written, expected, ..
            } => {
                assert_eq!(written, 4);
                assert_eq!(expected, 8);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!bridge.is_open());
        assert!(bridge.transfer(3, &mut backend).is_err());
        bridge.finish(&mut backend).unwrap();
        bridge.close();
        assert_eq!(log.borrow().closes, 1);
    }

    #[test]
    fn rejects_mismatched_frame_size() {
        let (mut bridge, _log) = bridge(usize::MAX);
        let mut backend = StampBackend::new();
        backend.size = FrameSize::new(4, 4);
        assert!(bridge.transfer(0, &mut backend).is_err());
    }
}
