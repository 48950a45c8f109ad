//! GPIO input ownership, the periodic input stimulus and the output monitor.
//!
//! The combined GPIO input word is shared between the built-in counter
//! stimulus and the telemetry observer. Each writer owns a disjoint bit range
//! and only ever touches that range through [`PinAccess::write_field`].

use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

use crate::pins::{field_mask, PinAccess, PinRole};

/// Width of the combined GPIO input word.
pub const GPIO_INPUT_WIDTH: u32 = 32;

/// Writers that may claim GPIO input bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputOwner {
    /// Counter stimulus.
    Stimulus,
    /// Remote telemetry observer.
    Telemetry,
}

impl fmt::Display for InputOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stimulus => f.write_str("stimulus"),
            Self::Telemetry => f.write_str("telemetry"),
        }
    }
}

/// Contiguous bit range of the GPIO input word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputRange {
    /// Owning writer.
    pub owner: InputOwner,
    /// Lowest bit.
    pub lsb: u32,
    /// Number of bits.
    pub width: u32,
}

impl InputRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(owner: InputOwner, lsb: u32, width: u32) -> Self {
        Self { owner, lsb, width }
    }

    /// One past the highest bit.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.lsb.saturating_add(self.width)
    }

    const fn overlaps(&self, other: &Self) -> bool {
        self.width != 0 && other.width != 0 && self.lsb < other.end() && other.lsb < self.end()
    }
}

/// Reasons a channel allocation is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// Two writers claim at least one common bit.
    #[error("{first} and {second} both claim GPIO input bits")]
    Overlap {
        /// Earlier claimant.
        first: InputOwner,
        /// Later claimant.
        second: InputOwner,
    },
    /// A range extends past the input word.
    #[error("{owner} range {lsb}+{width} exceeds the 32-bit input word")]
    OutOfRange {
        /// Claimant.
        owner: InputOwner,
        /// Requested lowest bit.
        lsb: u32,
        /// Requested width.
        width: u32,
    },
    /// A writer appears more than once.
    #[error("{0} claims more than one GPIO input range")]
    DuplicateOwner(InputOwner),
}

/// Validated set of GPIO input ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAllocation {
    ranges: Vec<InputRange>,
}

impl Default for ChannelAllocation {
    fn default() -> Self {
        Self {
            ranges: vec![
                InputRange::new(InputOwner::Stimulus, 0, 16),
                InputRange::new(InputOwner::Telemetry, 16, 16),
            ],
        }
    }
}

impl ChannelAllocation {
    /// Validates `ranges`.
    ///
    /// # Errors
    ///
    /// Returns an [`AllocationError`] when ranges overlap, leave the input
    /// word, or repeat an owner.
    pub fn new(ranges: Vec<InputRange>) -> Result<Self, AllocationError> {
        for (index, range) in ranges.iter().enumerate() {
            if range.end() > GPIO_INPUT_WIDTH {
                return Err(AllocationError::OutOfRange {
                    owner: range.owner,
                    lsb: range.lsb,
                    width: range.width,
                });
            }
            for earlier in &ranges[..index] {
                if earlier.owner == range.owner {
                    return Err(AllocationError::DuplicateOwner(range.owner));
                }
                if earlier.overlaps(range) {
                    return Err(AllocationError::Overlap {
                        first: earlier.owner,
                        second: range.owner,
                    });
                }
            }
        }
        Ok(Self { ranges })
    }

    /// Range claimed by `owner`, if any.
    #[must_use]
    pub fn range(&self, owner: InputOwner) -> Option<InputRange> {
        self.ranges.iter().copied().find(|range| range.owner == owner)
    }
}

/// Counter written into the stimulus range at a fixed virtual-time interval.
#[derive(Debug, Clone)]
pub struct GpioStimulus {
    range: InputRange,
    interval: u64,
    next_at: u64,
    value: u64,
}

impl GpioStimulus {
    /// Creates a stimulus that first fires at `interval`.
    #[must_use]
    pub const fn new(range: InputRange, interval: u64) -> Self {
        Self {
            range,
            interval,
            next_at: interval,
            value: 0,
        }
    }

    /// Current counter value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Increments the counter once `now` reaches the next interval boundary.
    pub fn tick(&mut self, now: u64, pins: &mut dyn PinAccess) -> Option<u64> {
        if self.interval == 0 || now < self.next_at {
            return None;
        }
        self.next_at = self.next_at.saturating_add(self.interval);
        self.value = self.value.wrapping_add(1) & field_mask(self.range.width);
        pins.write_field(PinRole::GpioIn, self.range.lsb, self.range.width, self.value);
        debug!(time = now, value = self.value, "incremented GPIO input");
        Some(self.value)
    }
}

/// Reports changes of the GPIO output word.
#[derive(Debug, Clone, Default)]
pub struct OutputMonitor {
    last: u64,
}

impl OutputMonitor {
    /// Creates a monitor that assumes all outputs start low.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Samples the output word and returns it when it changed.
    pub fn tick(&mut self, now: u64, pins: &dyn PinAccess) -> Option<u64> {
        let value = pins.read(PinRole::GpioOut);
        if value == self.last {
            return None;
        }
        self.last = value;
        info!(time = now, value, "gpio output is {value:#06x}");
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{
        AllocationError, ChannelAllocation, GpioStimulus, InputOwner, InputRange, OutputMonitor,
    };
    use crate::pins::{PinAccess, PinRole};

    #[derive(Default)]
    struct Word {
        gpio_in: u64,
        gpio_out: u64,
    }

    impl PinAccess for Word {
        fn read(&self, role: PinRole) -> u64 {
            match role {
                PinRole::GpioIn => self.gpio_in,
                PinRole::GpioOut => self.gpio_out,
                _ => 0,
            }
        }

        fn write(&mut self, role: PinRole, value: u64) {
            if role == PinRole::GpioIn {
                self.gpio_in = value & 0xFFFF_FFFF;
            }
        }
    }

    #[test]
    fn default_allocation_splits_the_word_in_half() {
        let allocation = ChannelAllocation::default();
        assert_eq!(
            allocation.range(InputOwner::Stimulus),
            Some(InputRange::new(InputOwner::Stimulus, 0, 16))
        );
        assert_eq!(
            allocation.range(InputOwner::Telemetry),
            Some(InputRange::new(InputOwner::Telemetry, 16, 16))
        );
    }

    #[rstest]
    #[case(
        vec![
            InputRange::new(InputOwner::Stimulus, 0, 17),
            InputRange::new(InputOwner::Telemetry, 16, 16),
        ],
        AllocationError::Overlap { first: InputOwner::Stimulus, second: InputOwner::Telemetry },
    )]
    #[case(
        vec![InputRange::new(InputOwner::Telemetry, 20, 16)],
        AllocationError::OutOfRange { owner: InputOwner::Telemetry, lsb: 20, width: 16 },
    )]
    #[case(
        vec![
            InputRange::new(InputOwner::Stimulus, 0, 4),
            InputRange::new(InputOwner::Stimulus, 8, 4),
        ],
        AllocationError::DuplicateOwner(InputOwner::Stimulus),
    )]
    fn conflicting_allocations_are_rejected(
        #[case] ranges: Vec<InputRange>,
        #[case] expected: AllocationError,
    ) {
        assert_eq!(ChannelAllocation::new(ranges), Err(expected));
    }

    #[test]
    fn adjacent_and_empty_ranges_are_accepted() {
        let allocation = ChannelAllocation::new(vec![
            InputRange::new(InputOwner::Stimulus, 0, 0),
            InputRange::new(InputOwner::Telemetry, 0, 32),
        ]);
        assert!(allocation.is_ok());
    }

    #[test]
    fn stimulus_fires_on_interval_boundaries_only() {
        let mut pins = Word::default();
        let mut stimulus = GpioStimulus::new(InputRange::new(InputOwner::Stimulus, 0, 16), 100);
        assert_eq!(stimulus.tick(90, &mut pins), None);
        assert_eq!(stimulus.tick(100, &mut pins), Some(1));
        assert_eq!(stimulus.tick(110, &mut pins), None);
        assert_eq!(stimulus.tick(200, &mut pins), Some(2));
        assert_eq!(pins.gpio_in, 2);
    }

    #[test]
    fn stimulus_wraps_inside_its_range_and_keeps_other_bits() {
        let mut pins = Word {
            gpio_in: 0xABCD_0000,
            gpio_out: 0,
        };
        let mut stimulus = GpioStimulus::new(InputRange::new(InputOwner::Stimulus, 0, 2), 10);
        for step in 1..=4 {
            stimulus.tick(step * 10, &mut pins);
        }
        assert_eq!(stimulus.value(), 0);
        assert_eq!(pins.gpio_in, 0xABCD_0000);
    }

    #[test]
    fn zero_interval_disables_stimulus() {
        let mut pins = Word::default();
        let mut stimulus = GpioStimulus::new(InputRange::new(InputOwner::Stimulus, 0, 16), 0);
        assert_eq!(stimulus.tick(0, &mut pins), None);
        assert_eq!(stimulus.tick(1_000, &mut pins), None);
    }

    #[test]
    fn monitor_reports_changes_once() {
        let mut pins = Word::default();
        let mut monitor = OutputMonitor::new();
        assert_eq!(monitor.tick(0, &pins), None);
        pins.gpio_out = 0x00F0;
        assert_eq!(monitor.tick(10, &pins), Some(0x00F0));
        assert_eq!(monitor.tick(20, &pins), None);
        pins.gpio_out = 0;
        assert_eq!(monitor.tick(30, &pins), Some(0));
    }
}
