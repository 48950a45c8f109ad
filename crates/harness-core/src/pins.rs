//! Pin-level boundary between the harness and an opaque hardware model.
//!
//! A model publishes a table of named signals. The harness resolves the names
//! it cares about into [`PinRole`] bindings once at startup, after which bridges
//! only talk to roles through [`PinAccess`].

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Which side of the boundary owns a signal's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Input to the model; written by the harness.
    HostDriven,
    /// Output from the model; sampled by the harness.
    HostSampled,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostDriven => f.write_str("host-driven"),
            Self::HostSampled => f.write_str("host-sampled"),
        }
    }
}

/// One entry of a model's signal table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSpec {
    /// Hierarchical signal name; scopes are separated by `.`.
    pub name: String,
    /// Width in bits, `1..=64`.
    pub width: u32,
    /// Ownership of the signal value.
    pub direction: Direction,
}

impl SignalSpec {
    /// Declares a model input.
    #[must_use]
    pub fn input(name: &str, width: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            direction: Direction::HostDriven,
        }
    }

    /// Declares a model output.
    #[must_use]
    pub fn output(name: &str, width: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            direction: Direction::HostSampled,
        }
    }

    /// Bit mask covering the signal width.
    #[must_use]
    pub const fn mask(&self) -> u64 {
        field_mask(self.width)
    }
}

/// Index into a model's signal table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(pub usize);

/// Contract every pin-level model satisfies.
///
/// `read` must also return the last value written to host-driven signals so
/// that disjoint bit fields of one input word can be updated independently.
pub trait HardwareModel {
    /// Returns the full signal table in a stable order.
    fn signals(&self) -> &[SignalSpec];

    /// Reads the current value of a signal.
    fn read(&self, id: SignalId) -> u64;

    /// Drives a host-driven signal; takes effect at the next [`eval`](Self::eval).
    fn write(&mut self, id: SignalId, value: u64);

    /// Settles the model against the current input values.
    fn eval(&mut self);

    /// Returns true once the model reports that it has finished.
    fn finished(&self) -> bool {
        false
    }
}

/// Functional roles the harness binds to model signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PinRole {
    /// System clock input.
    Clock,
    /// System reset input.
    Reset,
    /// Serial line from the harness into the model.
    UartRx,
    /// Serial line from the model to the harness.
    UartTx,
    /// Combined general-purpose input word.
    GpioIn,
    /// General-purpose output word (LEDs).
    GpioOut,
    /// JTAG test clock.
    JtagTck,
    /// JTAG test mode select.
    JtagTms,
    /// JTAG test data in.
    JtagTdi,
    /// JTAG test reset, active low.
    JtagTrst,
    /// JTAG test data out.
    JtagTdo,
}

impl PinRole {
    /// Number of distinct roles.
    pub const COUNT: usize = 11;

    /// Every role in declaration order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Clock,
        Self::Reset,
        Self::UartRx,
        Self::UartTx,
        Self::GpioIn,
        Self::GpioOut,
        Self::JtagTck,
        Self::JtagTms,
        Self::JtagTdi,
        Self::JtagTrst,
        Self::JtagTdo,
    ];

    /// Direction the bound signal must have.
    #[must_use]
    pub const fn direction(self) -> Direction {
        match self {
            Self::UartTx | Self::GpioOut | Self::JtagTdo => Direction::HostSampled,
            Self::Clock
            | Self::Reset
            | Self::UartRx
            | Self::GpioIn
            | Self::JtagTck
            | Self::JtagTms
            | Self::JtagTdi
            | Self::JtagTrst => Direction::HostDriven,
        }
    }

    /// Default top-level signal name for this role.
    #[must_use]
    pub const fn default_signal(self) -> &'static str {
        match self {
            Self::Clock => "clk",
            Self::Reset => "rst",
            Self::UartRx => "i_uart_rx",
            Self::UartTx => "o_uart_tx",
            Self::GpioIn => "i_sw",
            Self::GpioOut => "o_led",
            Self::JtagTck => "i_jtag_tck",
            Self::JtagTms => "i_jtag_tms",
            Self::JtagTdi => "i_jtag_tdi",
            Self::JtagTrst => "i_jtag_trst_n",
            Self::JtagTdo => "o_jtag_tdo",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PinRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Clock => "clock",
            Self::Reset => "reset",
            Self::UartRx => "uart-rx",
            Self::UartTx => "uart-tx",
            Self::GpioIn => "gpio-in",
            Self::GpioOut => "gpio-out",
            Self::JtagTck => "jtag-tck",
            Self::JtagTms => "jtag-tms",
            Self::JtagTdi => "jtag-tdi",
            Self::JtagTrst => "jtag-trst",
            Self::JtagTdo => "jtag-tdo",
        };
        f.write_str(label)
    }
}

/// Errors raised while binding roles to model signals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PinError {
    /// Lookup of a signal name that the model does not publish.
    #[error("model has no signal named `{name}`")]
    UnknownSignal {
        /// Requested signal name.
        name: String,
    },
    /// A role was mapped onto a signal of the wrong direction.
    #[error("signal `{name}` bound to {role} must be {expected}")]
    DirectionMismatch {
        /// Role being bound.
        role: PinRole,
        /// Offending signal name.
        name: String,
        /// Direction the role requires.
        expected: Direction,
    },
    /// An enabled component needs a role that is not bound.
    #[error("{role} pin is required but the model does not provide it")]
    MissingRole {
        /// Unbound role.
        role: PinRole,
    },
}

/// Role to signal-name table used by [`PinInterface::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinMap {
    names: BTreeMap<PinRole, String>,
}

impl Default for PinMap {
    fn default() -> Self {
        let names = PinRole::ALL
            .iter()
            .map(|role| (*role, role.default_signal().to_string()))
            .collect();
        Self { names }
    }
}

impl PinMap {
    /// Overrides the signal name for one role.
    #[must_use]
    pub fn with(mut self, role: PinRole, name: &str) -> Self {
        self.names.insert(role, name.to_string());
        self
    }

    /// Removes a role so it stays unbound.
    #[must_use]
    pub fn without(mut self, role: PinRole) -> Self {
        self.names.remove(&role);
        self
    }

    /// Returns the signal name mapped to a role.
    #[must_use]
    pub fn name(&self, role: PinRole) -> Option<&str> {
        self.names.get(&role).map(String::as_str)
    }
}

/// Typed role-level accessors used by bridges.
pub trait PinAccess {
    /// Reads the signal bound to `role`; unbound roles read as zero.
    fn read(&self, role: PinRole) -> u64;

    /// Drives the signal bound to `role`, masked to its width.
    ///
    /// Writes to unbound or host-sampled roles are ignored.
    fn write(&mut self, role: PinRole, value: u64);

    /// Replaces `width` bits starting at `lsb` and leaves every other bit as is.
    fn write_field(&mut self, role: PinRole, lsb: u32, width: u32, value: u64) {
        if lsb >= 64 {
            return;
        }
        let mask = field_mask(width) << lsb;
        let current = self.read(role);
        self.write(role, (current & !mask) | ((value << lsb) & mask));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    id: SignalId,
    mask: u64,
}

/// A hardware model plus its resolved role bindings.
#[derive(Debug)]
pub struct PinInterface<M> {
    model: M,
    bindings: [Option<Binding>; PinRole::COUNT],
}

impl<M: HardwareModel> PinInterface<M> {
    /// Resolves every mapped role against the model's signal table.
    ///
    /// Names the model does not publish leave their role unbound; use
    /// [`require`](Self::require) to insist on a role.
    ///
    /// # Errors
    ///
    /// Returns [`PinError::DirectionMismatch`] when a mapped signal has the
    /// wrong direction for its role.
    pub fn bind(model: M, map: &PinMap) -> Result<Self, PinError> {
        let mut bindings = [None; PinRole::COUNT];
        for role in PinRole::ALL {
            let Some(name) = map.name(role) else {
                continue;
            };
            let Some((index, spec)) = model
                .signals()
                .iter()
                .enumerate()
                .find(|(_, spec)| spec.name == name)
            else {
                continue;
            };
            if spec.direction != role.direction() {
                return Err(PinError::DirectionMismatch {
                    role,
                    name: name.to_string(),
                    expected: role.direction(),
                });
            }
            bindings[role.index()] = Some(Binding {
                id: SignalId(index),
                mask: spec.mask(),
            });
        }
        Ok(Self { model, bindings })
    }

    /// Fails unless `role` is bound.
    ///
    /// # Errors
    ///
    /// Returns [`PinError::MissingRole`] for unbound roles.
    pub fn require(&self, role: PinRole) -> Result<(), PinError> {
        if self.is_bound(role) {
            Ok(())
        } else {
            Err(PinError::MissingRole { role })
        }
    }

    /// Returns true when `role` resolved to a model signal.
    #[must_use]
    pub fn is_bound(&self, role: PinRole) -> bool {
        self.bindings[role.index()].is_some()
    }

    /// Width in bits of the signal bound to `role`.
    #[must_use]
    pub fn width(&self, role: PinRole) -> Option<u32> {
        self.bindings[role.index()].map(|binding| binding.mask.count_ones())
    }

    /// Looks up a signal by its full name.
    ///
    /// # Errors
    ///
    /// Returns [`PinError::UnknownSignal`] when the model has no such signal.
    pub fn signal_id(&self, name: &str) -> Result<SignalId, PinError> {
        self.model
            .signals()
            .iter()
            .position(|spec| spec.name == name)
            .map(SignalId)
            .ok_or_else(|| PinError::UnknownSignal {
                name: name.to_string(),
            })
    }

    /// Settles the model.
    pub fn eval(&mut self) {
        self.model.eval();
    }

    /// Returns true once the model reported completion.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.model.finished()
    }

    /// Borrows the model.
    #[must_use]
    pub const fn model(&self) -> &M {
        &self.model
    }

    /// Mutably borrows the model.
    pub const fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }
}

impl<M: HardwareModel> PinAccess for PinInterface<M> {
    fn read(&self, role: PinRole) -> u64 {
        self.bindings[role.index()].map_or(0, |binding| self.model.read(binding.id) & binding.mask)
    }

    fn write(&mut self, role: PinRole, value: u64) {
        if role.direction() != Direction::HostDriven {
            debug_assert!(false, "write to host-sampled role {role}");
            return;
        }
        if let Some(binding) = self.bindings[role.index()] {
            self.model.write(binding.id, value & binding.mask);
        }
    }
}

/// Mask of the low `width` bits.
#[must_use]
pub const fn field_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}
