use std::time::{Duration, Instant};

/// Clock sample handed to the animators each frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameTime {
    /// Seconds since the clock started.
    pub elapsed: f32,
    pub delta: f32,
}

impl FrameTime {
    pub fn new(elapsed: f32, delta: f32) -> Self {
        Self { elapsed, delta }
    }
}

pub struct Time {
    last: Instant,
    elapsed: Duration,
    pub delta: Duration,
}

impl Default for Time {
    fn default() -> Self {
        Self::new()
    }
}

impl Time {
    pub fn new() -> Self {
        Self { last: Instant::now(), elapsed: Duration::ZERO, delta: Duration::ZERO }
    }

    /// Advances by wall-clock time since the previous tick.
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.delta = now - self.last;
        self.last = now;
        self.elapsed += self.delta;
    }

    /// Advances by a fixed step, for headless runs and tests.
    pub fn advance(&mut self, step: Duration) {
        self.delta = step;
        self.elapsed += step;
        self.last = Instant::now();
    }

    pub fn delta_seconds(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    pub fn elapsed_seconds(&self) -> f32 {
        self.elapsed.as_secs_f32()
    }

    pub fn frame(&self) -> FrameTime {
        FrameTime { elapsed: self.elapsed_seconds(), delta: self.delta_seconds() }
    }
}
