//! Virtual time base shared by every component of the harness loop.

/// Clock transition produced by [`SimulationContext::toggle_clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockEdge {
    /// Low-to-high transition.
    Rising,
    /// High-to-low transition.
    Falling,
}

/// Mutable simulation state owned by the driver loop.
///
/// Components receive it by reference; nothing here is process-global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimulationContext {
    /// Monotonic virtual time in simulated nanoseconds.
    pub virtual_time: u64,
    /// Current level of the model clock line.
    pub clock_level: bool,
    /// Set once any termination trigger fired during the current iteration.
    pub termination_requested: bool,
}

impl SimulationContext {
    /// Creates a context at time zero with the given initial clock level.
    #[must_use]
    pub const fn new(clock_starts_high: bool) -> Self {
        Self {
            virtual_time: 0,
            clock_level: clock_starts_high,
            termination_requested: false,
        }
    }

    /// Advances virtual time by `step`, saturating at `u64::MAX`.
    pub const fn advance(&mut self, step: u64) {
        self.virtual_time = self.virtual_time.saturating_add(step);
    }

    /// Inverts the clock level and reports which edge that produced.
    pub const fn toggle_clock(&mut self) -> ClockEdge {
        self.clock_level = !self.clock_level;
        if self.clock_level {
            ClockEdge::Rising
        } else {
            ClockEdge::Falling
        }
    }

    /// Latches the termination flag for this run.
    pub const fn request_termination(&mut self) {
        self.termination_requested = true;
    }

    /// Returns true when `timeout` is non-zero and has been reached.
    #[must_use]
    pub const fn timed_out(&self, timeout: u64) -> bool {
        timeout != 0 && self.virtual_time >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::{ClockEdge, SimulationContext};

    #[test]
    fn new_context_starts_at_time_zero() {
        let ctx = SimulationContext::new(true);
        assert_eq!(ctx.virtual_time, 0);
        assert!(ctx.clock_level);
        assert!(!ctx.termination_requested);
    }

    #[test]
    fn toggle_reports_alternating_edges() {
        let mut ctx = SimulationContext::new(true);
        assert_eq!(ctx.toggle_clock(), ClockEdge::Falling);
        assert_eq!(ctx.toggle_clock(), ClockEdge::Rising);
        assert!(ctx.clock_level);
    }

    #[test]
    fn advance_saturates_instead_of_wrapping() {
        let mut ctx = SimulationContext {
            virtual_time: u64::MAX - 3,
            ..SimulationContext::default()
        };
        ctx.advance(10);
        assert_eq!(ctx.virtual_time, u64::MAX);
    }

    const AFTER_FIRST_STEP: SimulationContext = {
        let mut ctx = SimulationContext::new(true);
        ctx.toggle_clock();
        ctx.advance(10);
        ctx.request_termination();
        ctx
    };

    #[test]
    fn context_updates_are_usable_in_const_context() {
        assert_eq!(AFTER_FIRST_STEP.virtual_time, 10);
        assert!(!AFTER_FIRST_STEP.clock_level);
        assert!(AFTER_FIRST_STEP.termination_requested);
    }

    #[test]
    fn zero_timeout_is_unbounded() {
        let ctx = SimulationContext {
            virtual_time: u64::MAX,
            ..SimulationContext::default()
        };
        assert!(!ctx.timed_out(0));
        assert!(ctx.timed_out(u64::MAX));
    }

    #[test]
    fn timeout_fires_at_first_time_not_below_limit() {
        let mut ctx = SimulationContext::new(false);
        ctx.advance(990);
        assert!(!ctx.timed_out(1000));
        ctx.advance(7);
        assert!(!ctx.timed_out(1000));
        ctx.advance(7);
        assert!(ctx.timed_out(1000));
    }
}
