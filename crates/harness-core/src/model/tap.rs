//! IEEE 1149.1 test access port with IDCODE and BYPASS instructions.

/// Instruction register width in bits.
pub const IR_LENGTH: u32 = 5;

/// IDCODE instruction opcode; selected after Test-Logic-Reset.
pub const IDCODE_INSTRUCTION: u8 = 0x01;

/// BYPASS instruction opcode.
pub const BYPASS_INSTRUCTION: u8 = 0x1F;

/// The sixteen TAP controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapState {
    /// Test logic disabled; instruction forced to IDCODE.
    TestLogicReset,
    /// Idle between scans.
    RunTestIdle,
    /// Entry of the data register column.
    SelectDrScan,
    /// Parallel load of the selected data register.
    CaptureDr,
    /// Data register shifting toward TDO.
    ShiftDr,
    /// First exit from data shifting.
    Exit1Dr,
    /// Data shifting paused.
    PauseDr,
    /// Exit from the data pause.
    Exit2Dr,
    /// Data register update.
    UpdateDr,
    /// Entry of the instruction register column.
    SelectIrScan,
    /// Instruction register loads `0b00001`.
    CaptureIr,
    /// Instruction register shifting toward TDO.
    ShiftIr,
    /// First exit from instruction shifting.
    Exit1Ir,
    /// Instruction shifting paused.
    PauseIr,
    /// Exit from the instruction pause.
    Exit2Ir,
    /// New instruction becomes active.
    UpdateIr,
}

impl TapState {
    /// State entered on a rising TCK edge with the given TMS level.
    #[must_use]
    pub const fn next(self, tms: bool) -> Self {
        match (self, tms) {
            (Self::TestLogicReset, false)
            | (Self::RunTestIdle | Self::UpdateDr | Self::UpdateIr, false) => Self::RunTestIdle,
            (Self::TestLogicReset | Self::SelectIrScan, true) => Self::TestLogicReset,
            (Self::RunTestIdle | Self::UpdateDr | Self::UpdateIr, true) => Self::SelectDrScan,
            (Self::SelectDrScan, false) => Self::CaptureDr,
            (Self::SelectDrScan, true) => Self::SelectIrScan,
            (Self::CaptureDr | Self::ShiftDr | Self::Exit2Dr, false) => Self::ShiftDr,
            (Self::CaptureDr | Self::ShiftDr, true) => Self::Exit1Dr,
            (Self::Exit1Dr | Self::PauseDr, false) => Self::PauseDr,
            (Self::Exit1Dr | Self::Exit2Dr, true) => Self::UpdateDr,
            (Self::PauseDr, true) => Self::Exit2Dr,
            (Self::SelectIrScan, false) => Self::CaptureIr,
            (Self::CaptureIr | Self::ShiftIr | Self::Exit2Ir, false) => Self::ShiftIr,
            (Self::CaptureIr | Self::ShiftIr, true) => Self::Exit1Ir,
            (Self::Exit1Ir | Self::PauseIr, false) => Self::PauseIr,
            (Self::Exit1Ir | Self::Exit2Ir, true) => Self::UpdateIr,
            (Self::PauseIr, true) => Self::Exit2Ir,
        }
    }

    /// Encoding exposed on the model's debug signal.
    #[must_use]
    pub const fn code(self) -> u64 {
        self as u64
    }
}

/// TAP controller clocked by the JTAG pins.
#[derive(Debug, Clone)]
pub struct TapController {
    state: TapState,
    instruction: u8,
    ir_shift: u8,
    dr_shift: u64,
    dr_length: u32,
    idcode: u32,
    tdo: bool,
    last_tck: bool,
}

impl TapController {
    /// Creates a controller in Test-Logic-Reset reporting `idcode`.
    #[must_use]
    pub const fn new(idcode: u32) -> Self {
        Self {
            state: TapState::TestLogicReset,
            instruction: IDCODE_INSTRUCTION,
            ir_shift: 0,
            dr_shift: 0,
            dr_length: 1,
            idcode,
            tdo: false,
            last_tck: false,
        }
    }

    /// Asynchronous test reset.
    pub fn reset(&mut self) {
        self.state = TapState::TestLogicReset;
        self.instruction = IDCODE_INSTRUCTION;
        self.tdo = false;
    }

    /// Current controller state.
    #[must_use]
    pub const fn state(&self) -> TapState {
        self.state
    }

    /// Active instruction.
    #[must_use]
    pub const fn instruction(&self) -> u8 {
        self.instruction
    }

    /// Test data out.
    #[must_use]
    pub const fn tdo(&self) -> bool {
        self.tdo
    }

    /// Applies the pin levels and reacts to TCK edges.
    pub fn clock(&mut self, tck: bool, tms: bool, tdi: bool) {
        match (self.last_tck, tck) {
            (false, true) => self.rising(tms, tdi),
            (true, false) => self.falling(),
            _ => {}
        }
        self.last_tck = tck;
    }

    fn rising(&mut self, tms: bool, tdi: bool) {
        match self.state {
            TapState::CaptureDr => {
                if self.instruction == IDCODE_INSTRUCTION {
                    self.dr_shift = u64::from(self.idcode);
                    self.dr_length = 32;
                } else {
                    self.dr_shift = 0;
                    self.dr_length = 1;
                }
            }
            TapState::ShiftDr => {
                self.dr_shift =
                    (self.dr_shift >> 1) | (u64::from(tdi) << (self.dr_length - 1));
            }
            TapState::CaptureIr => self.ir_shift = 0b0_0001,
            TapState::ShiftIr => {
                self.ir_shift = (self.ir_shift >> 1) | (u8::from(tdi) << (IR_LENGTH - 1));
            }
            _ => {}
        }
        self.state = self.state.next(tms);
        if self.state == TapState::TestLogicReset {
            self.instruction = IDCODE_INSTRUCTION;
        }
    }

    fn falling(&mut self) {
        match self.state {
            TapState::ShiftDr => self.tdo = self.dr_shift & 1 != 0,
            TapState::ShiftIr => self.tdo = self.ir_shift & 1 != 0,
            TapState::UpdateIr => {
                self.instruction = self.ir_shift;
                self.tdo = false;
            }
            _ => self.tdo = false,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{TapController, TapState, BYPASS_INSTRUCTION, IDCODE_INSTRUCTION};

    const IDCODE: u32 = 0x4BA0_0477;

    /// One full TCK period; returns TDO as sampled while TCK is low.
    fn pulse(tap: &mut TapController, tms: bool, tdi: bool) -> bool {
        tap.clock(false, tms, tdi);
        let tdo = tap.tdo();
        tap.clock(true, tms, tdi);
        tdo
    }

    fn walk(tap: &mut TapController, tms: &[bool]) {
        for level in tms {
            pulse(tap, *level, false);
        }
    }

    /// Shifts `bits` through the current register, raising TMS on the last bit.
    fn shift(tap: &mut TapController, value: u64, bits: u32) -> u64 {
        (0..bits).fold(0, |captured, bit| {
            let tdi = (value >> bit) & 1 != 0;
            let tdo = pulse(tap, bit + 1 == bits, tdi);
            captured | (u64::from(tdo) << bit)
        })
    }

    #[rstest]
    #[case(TapState::TestLogicReset, false, TapState::RunTestIdle)]
    #[case(TapState::SelectDrScan, true, TapState::SelectIrScan)]
    #[case(TapState::SelectIrScan, true, TapState::TestLogicReset)]
    #[case(TapState::Exit1Dr, false, TapState::PauseDr)]
    #[case(TapState::Exit2Ir, false, TapState::ShiftIr)]
    #[case(TapState::UpdateDr, true, TapState::SelectDrScan)]
    fn state_transitions(#[case] from: TapState, #[case] tms: bool, #[case] to: TapState) {
        assert_eq!(from.next(tms), to);
    }

    #[test]
    fn five_tms_high_reaches_reset_from_anywhere() {
        let mut tap = TapController::new(IDCODE);
        walk(&mut tap, &[false, true, false, false]);
        assert_eq!(tap.state(), TapState::ShiftDr);
        walk(&mut tap, &[true; 5]);
        assert_eq!(tap.state(), TapState::TestLogicReset);
    }

    #[test]
    fn idcode_is_read_after_reset() {
        let mut tap = TapController::new(IDCODE);
        walk(&mut tap, &[true, true, true, true, true, false, true, false, false]);
        assert_eq!(tap.state(), TapState::ShiftDr);
        assert_eq!(shift(&mut tap, 0, 32), u64::from(IDCODE));
        assert_eq!(tap.state(), TapState::Exit1Dr);
    }

    #[test]
    fn bypass_delays_tdi_by_one_bit() {
        let mut tap = TapController::new(IDCODE);
        walk(&mut tap, &[true; 5]);
        walk(&mut tap, &[false, true, true, false, false]);
        assert_eq!(tap.state(), TapState::ShiftIr);
        let captured_ir = shift(&mut tap, u64::from(BYPASS_INSTRUCTION), 5);
        assert_eq!(captured_ir, 0b0_0001);
        walk(&mut tap, &[true, false]);
        assert_eq!(tap.instruction(), BYPASS_INSTRUCTION);

        walk(&mut tap, &[true, false, false]);
        assert_eq!(tap.state(), TapState::ShiftDr);
        let out = shift(&mut tap, 0b1011, 5);
        assert_eq!(out, 0b1_0110);
    }

    #[test]
    fn trst_restores_idcode() {
        let mut tap = TapController::new(IDCODE);
        walk(&mut tap, &[true; 5]);
        walk(&mut tap, &[false, true, true, false, false]);
        shift(&mut tap, u64::from(BYPASS_INSTRUCTION), 5);
        walk(&mut tap, &[true, false]);
        tap.reset();
        assert_eq!(tap.instruction(), IDCODE_INSTRUCTION);
        assert_eq!(tap.state(), TapState::TestLogicReset);
    }
}
