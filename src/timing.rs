//! Coarse peripheral pacing. Peripherals are polled between instructions,
//! every `instructions_per_poll` steps, never from inside the engine.

use std::time::{Duration, Instant};

use crate::cpu::Cpu;

pub const KEYBOARD_TIMER_UPDATE_DELAY: u64 = 20_000;
/// One PIT channel 0 period at the default divisor (65536 / 1.193182 MHz).
pub const PIT_TICK: Duration = Duration::from_nanos(54_925_493);
pub const TIMER_VECTOR: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub instructions_per_poll: u64,
    pub tick_interval: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            instructions_per_poll: KEYBOARD_TIMER_UPDATE_DELAY,
            tick_interval: PIT_TICK,
        }
    }
}

/// Something outside the core that runs at poll points.
pub trait Peripheral {
    fn service(&mut self, cpu: &mut Cpu);
}

/// Counts steps and says when peripherals are due.
#[derive(Debug, Clone)]
pub struct Pacer {
    every: u64,
    count: u64,
}

impl Pacer {
    pub fn new(config: &PacingConfig) -> Self {
        Self {
            every: config.instructions_per_poll.max(1),
            count: 0,
        }
    }

    /// Records one step; true on every `instructions_per_poll`-th call.
    pub fn tick(&mut self) -> bool {
        self.count += 1;
        self.count % self.every == 0
    }
}

/// Raises IRQ0 (INT 8) once per tick interval of wall-clock time.
#[derive(Debug)]
pub struct TimerTick {
    interval: Duration,
    last: Instant,
}

impl TimerTick {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }
}

impl Peripheral for TimerTick {
    fn service(&mut self, cpu: &mut Cpu) {
        let now = Instant::now();
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            cpu.request_interrupt(TIMER_VECTOR);
        }
    }
}
