use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic time source used by the pacer and the orchestrator.
pub trait Clock {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    /// Blocks the calling thread for at least `duration`.
    fn sleep(&self, duration: Duration);
}

/// Clock backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::start()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock for tests and offline runs. Time only moves through
/// [`ManualClock::advance`] and [`Clock::sleep`]; clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Rc<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    now: Cell<Duration>,
    oversleep: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward, simulating work done by the caller.
    pub fn advance(&self, delta: Duration) {
        self.inner.now.set(self.inner.now.get() + delta);
    }

    /// Extra time added to every subsequent sleep, simulating scheduler lag.
    pub fn set_oversleep(&self, extra: Duration) {
        self.inner.oversleep.set(extra);
    }

    /// Every sleep requested so far, as requested (without oversleep).
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.sleeps.borrow().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.inner.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.inner.sleeps.borrow_mut().push(duration);
        self.advance(duration + self.inner.oversleep.get());
    }
}

/// Selects how [`FramePacer`] fills the remainder of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMode {
    /// Integer-millisecond budget, overruns absorbed without catch-up.
    Simple,
    /// Nanosecond budget with carried compensation.
    Compensated,
}

/// One iteration of the control loop as seen by the pacer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTick {
    pub sequence: u64,
    pub start: Duration,
    pub end: Duration,
    /// Render, audio and event work measured before the pacing sleep.
    pub processing: Duration,
    /// Sleep requested by the pacer for this tick.
    pub slept: Duration,
    /// Timing error carried into the next tick, in nanoseconds. Positive
    /// means this tick ran long.
    pub compensation_ns: i64,
}

impl FrameTick {
    /// Wall-clock period of the tick, including the pacing sleep.
    pub fn period(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Open tick handed out by [`FramePacer::begin_tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickStart {
    sequence: u64,
    start: Duration,
}

impl TickStart {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn start(&self) -> Duration {
        self.start
    }
}

#[derive(Debug, Clone)]
pub struct FramePacer {
    mode: PacingMode,
    frame_delay_ms: u64,
    plan_ns: i64,
    last_time_ms: u64,
    compensation_ns: i64,
    next_sequence: u64,
}

impl FramePacer {
    /// Creates a pacer for `fps` frames per second. `fps` must be positive;
    /// callers get it from [`crate::SessionConfig`], which guarantees that.
    pub fn new(fps: u32, mode: PacingMode) -> Self {
        let fps = fps.max(1);
        Self {
            mode,
            frame_delay_ms: 1_000 / fps as u64,
            plan_ns: 1_000_000_000 / fps as i64,
            last_time_ms: 0,
            compensation_ns: 0,
            next_sequence: 0,
        }
    }

    pub fn mode(&self) -> PacingMode {
        self.mode
    }

    /// Ideal frame duration in whole milliseconds (simple mode budget).
    pub fn frame_delay(&self) -> Duration {
        Duration::from_millis(self.frame_delay_ms)
    }

    /// Ideal frame duration in nanoseconds (compensated mode budget).
    pub fn plan(&self) -> Duration {
        Duration::from_nanos(self.plan_ns as u64)
    }

    /// Compensation that the next tick will apply.
    pub fn compensation_ns(&self) -> i64 {
        self.compensation_ns
    }

    /// Anchors the pacer to the current time. Call once before the first tick.
    pub fn reset(&mut self, clock: &dyn Clock) {
        self.last_time_ms = millis(clock.now());
        self.compensation_ns = 0;
    }

    pub fn begin_tick(&mut self, clock: &dyn Clock) -> TickStart {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        TickStart {
            sequence,
            start: clock.now(),
        }
    }

    /// Sleeps for whatever the current mode decides is left of the tick and
    /// returns the completed tick.
    pub fn finish_tick(&mut self, tick: TickStart, clock: &dyn Clock) -> FrameTick {
        let end_of_work = clock.now();
        let processing = end_of_work.saturating_sub(tick.start);

        let slept = match self.mode {
            PacingMode::Simple => self.simple_wait(clock),
            PacingMode::Compensated => self.compensated_wait(tick.start, processing, clock),
        };

        let completed = FrameTick {
            sequence: tick.sequence,
            start: tick.start,
            end: clock.now(),
            processing,
            slept,
            compensation_ns: self.compensation_ns,
        };
        tracing::trace!(
            sequence = completed.sequence,
            processing_us = completed.processing.as_micros() as u64,
            slept_us = completed.slept.as_micros() as u64,
            compensation_ns = completed.compensation_ns,
            "tick paced"
        );
        completed
    }

    fn simple_wait(&mut self, clock: &dyn Clock) -> Duration {
        let elapsed = millis(clock.now()).saturating_sub(self.last_time_ms);
        let mut slept = Duration::ZERO;
        if elapsed < self.frame_delay_ms {
            slept = Duration::from_millis(self.frame_delay_ms - elapsed);
            clock.sleep(slept);
        }
        // Resynchronise even after an overrun so there is no catch-up burst.
        self.last_time_ms = millis(clock.now());
        slept
    }

    fn compensated_wait(
        &mut self,
        start: Duration,
        processing: Duration,
        clock: &dyn Clock,
    ) -> Duration {
        // At most one tick of debt is paid back per tick, and anything beyond
        // that is forgotten.
        let carry = self.compensation_ns.clamp(0, self.plan_ns);
        let dur = nanos(processing);
        let mut slept = Duration::ZERO;

        if dur < self.plan_ns {
            let sleep_ns = self.plan_ns - dur - carry;
            if sleep_ns > 0 {
                slept = Duration::from_nanos(sleep_ns as u64);
                clock.sleep(slept);
            }
        }

        // Error measured against this tick's shortened budget, so positive
        // carry that could not be absorbed stays in the books.
        let elapsed = nanos(clock.now().saturating_sub(start));
        self.compensation_ns = elapsed - (self.plan_ns - carry);
        self.last_time_ms = millis(clock.now());
        slept
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn nanos(duration: Duration) -> i64 {
    duration.as_nanos().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn run_tick(pacer: &mut FramePacer, clock: &ManualClock, work: Duration) -> FrameTick {
        let tick = pacer.begin_tick(clock);
        clock.advance(work);
        pacer.finish_tick(tick, clock)
    }

    #[test]
    fn simple_mode_sleeps_remaining_budget() {
        let clock = ManualClock::new();
        let mut pacer = FramePacer::new(25, PacingMode::Simple);
        pacer.reset(&clock);

        let tick = run_tick(&mut pacer, &clock, Duration::from_millis(15));
        assert_eq!(tick.slept, Duration::from_millis(25));
        assert_eq!(clock.now(), Duration::from_millis(40));
    }

    #[test]
    fn simple_mode_absorbs_overrun_without_catch_up() {
        let clock = ManualClock::new();
        let mut pacer = FramePacer::new(25, PacingMode::Simple);
        pacer.reset(&clock);

        let late = run_tick(&mut pacer, &clock, Duration::from_millis(70));
        assert_eq!(late.slept, Duration::ZERO);

        // The next tick gets a full budget again rather than a shortened one.
        let next = run_tick(&mut pacer, &clock, Duration::from_millis(5));
        assert_eq!(next.slept, Duration::from_millis(35));
    }

    #[test]
    fn simple_mode_never_exceeds_frame_delay() {
        let mut rng = StdRng::seed_from_u64(7);
        for fps in [1_u32, 24, 25, 30, 60, 144, 240, 1000] {
            let clock = ManualClock::new();
            let mut pacer = FramePacer::new(fps, PacingMode::Simple);
            pacer.reset(&clock);
            let limit = Duration::from_millis(1_000 / fps as u64);

            for _ in 0..200 {
                let work = Duration::from_micros(rng.gen_range(0..2_000_000 / fps as u64));
                clock.set_oversleep(Duration::from_micros(rng.gen_range(0..1_500)));
                let tick = run_tick(&mut pacer, &clock, work);
                assert!(tick.slept <= limit, "fps {fps}: slept {:?}", tick.slept);
            }
        }
    }

    #[test]
    fn compensated_mode_subtracts_previous_overrun() {
        let clock = ManualClock::new();
        let mut pacer = FramePacer::new(25, PacingMode::Compensated);
        pacer.reset(&clock);

        let first = run_tick(&mut pacer, &clock, Duration::from_millis(10));
        assert_eq!(first.slept, Duration::from_millis(30));
        assert_eq!(first.compensation_ns, 0);

        clock.set_oversleep(Duration::from_millis(2));
        let second = run_tick(&mut pacer, &clock, Duration::from_millis(10));
        assert_eq!(second.compensation_ns, 2_000_000);

        clock.set_oversleep(Duration::ZERO);
        let third = run_tick(&mut pacer, &clock, Duration::from_millis(10));
        assert_eq!(third.slept, Duration::from_millis(28));
        assert_eq!(clock.now(), Duration::from_millis(120));
    }

    #[test]
    fn compensated_mode_pays_off_overrun_debt() {
        let clock = ManualClock::new();
        let mut pacer = FramePacer::new(25, PacingMode::Compensated);
        pacer.reset(&clock);

        run_tick(&mut pacer, &clock, Duration::from_millis(70));
        assert_eq!(pacer.compensation_ns(), 30_000_000);
        let tick = run_tick(&mut pacer, &clock, Duration::from_millis(5));
        assert_eq!(tick.slept, Duration::from_millis(5));
        assert_eq!(tick.compensation_ns, 0);

        let next = run_tick(&mut pacer, &clock, Duration::from_millis(5));
        assert_eq!(next.slept, Duration::from_millis(35));
        assert_eq!(clock.now(), Duration::from_millis(120));
    }

    #[test]
    fn compensated_mode_forgets_a_long_stall() {
        let clock = ManualClock::new();
        let mut pacer = FramePacer::new(25, PacingMode::Compensated);
        pacer.reset(&clock);

        run_tick(&mut pacer, &clock, Duration::from_millis(5));
        run_tick(&mut pacer, &clock, Duration::from_secs(1));

        let shortened = (0..50)
            .map(|_| run_tick(&mut pacer, &clock, Duration::from_millis(5)))
            .filter(|tick| tick.slept < Duration::from_millis(35))
            .count();
        assert!(shortened <= 2, "{shortened} shortened ticks after the stall");

        // Back on the nominal period once the stall is behind us.
        let tick = run_tick(&mut pacer, &clock, Duration::from_millis(5));
        assert_eq!(tick.slept, Duration::from_millis(35));
        assert_eq!(tick.compensation_ns, 0);
    }

    /// Clock whose sleeps return early by a fixed amount.
    struct EarlyWaker {
        now: Cell<Duration>,
        early: Duration,
    }

    impl Clock for EarlyWaker {
        fn now(&self) -> Duration {
            self.now.get()
        }

        fn sleep(&self, duration: Duration) {
            self.now.set(self.now.get() + duration.saturating_sub(self.early));
        }
    }

    #[test]
    fn compensated_mode_ignores_negative_compensation() {
        let clock = EarlyWaker {
            now: Cell::new(Duration::ZERO),
            early: Duration::from_millis(3),
        };
        let mut pacer = FramePacer::new(25, PacingMode::Compensated);
        pacer.reset(&clock);

        let tick = pacer.begin_tick(&clock);
        clock.now.set(clock.now.get() + Duration::from_millis(10));
        let first = pacer.finish_tick(tick, &clock);
        assert_eq!(first.compensation_ns, -3_000_000);

        let tick = pacer.begin_tick(&clock);
        clock.now.set(clock.now.get() + Duration::from_millis(10));
        let second = pacer.finish_tick(tick, &clock);
        assert_eq!(second.slept, Duration::from_millis(30));
    }

    #[test]
    fn compensated_mode_keeps_cumulative_drift_bounded() {
        let fps = 30;
        let clock = ManualClock::new();
        let mut pacer = FramePacer::new(fps, PacingMode::Compensated);
        pacer.reset(&clock);
        let plan = pacer.plan();
        let plan_us = plan.as_micros() as u64;
        let mut rng = StdRng::seed_from_u64(0x5eed);

        let ticks = 20_000_u32;
        let mut max_drift = Duration::ZERO;
        for n in 1..=ticks {
            let work = Duration::from_micros(rng.gen_range(0..plan_us * 9 / 10));
            // Occasional long frames, and constant scheduler lag on sleeps.
            let work = if n % 97 == 0 { work + plan / 2 } else { work };
            clock.set_oversleep(Duration::from_micros(rng.gen_range(0..2_000)));
            run_tick(&mut pacer, &clock, work);

            let ideal = plan * n;
            let drift = clock.now().saturating_sub(ideal);
            max_drift = max_drift.max(drift);
        }

        assert!(
            max_drift < plan * 2,
            "drift grew to {max_drift:?} over {ticks} ticks"
        );
        let average = clock.now() / ticks;
        let error = if average > plan {
            average - plan
        } else {
            plan - average
        };
        assert!(error < Duration::from_micros(5), "average period off by {error:?}");
    }

    #[test]
    fn sequence_numbers_increase_monotonically() {
        let clock = ManualClock::new();
        let mut pacer = FramePacer::new(60, PacingMode::Simple);
        pacer.reset(&clock);
        let sequences: Vec<u64> = (0..5)
            .map(|_| run_tick(&mut pacer, &clock, Duration::from_millis(1)).sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }
}
