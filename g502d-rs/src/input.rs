/* Regular mouse reports on the non-protocol interface.
 *
 * Motion and buttons pass straight through to the kernel input layer; the
 * daemon only watches the button bitmask for the profile-switch button. */

use crate::driver::g502::REGULAR_REPORT_SIZE;

/* Button that cycles profiles unless configured otherwise. */
pub const DEFAULT_SWITCH_BUTTON: u8 = 9;

const MAX_BUTTONS: u8 = 16;

/* Layout: `[buttons lo, buttons hi, x lo, x hi, y lo, y hi, wheel, pan]` */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseReport {
    pub buttons: u16,
    pub x: i16,
    pub y: i16,
    pub wheel: i8,
    pub pan: i8,
}

impl MouseReport {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; REGULAR_REPORT_SIZE] = buf.try_into().ok()?;
        Some(Self {
            buttons: u16::from_le_bytes([buf[0], buf[1]]),
            x: i16::from_le_bytes([buf[2], buf[3]]),
            y: i16::from_le_bytes([buf[4], buf[5]]),
            wheel: buf[6] as i8,
            pan: buf[7] as i8,
        })
    }

    /* Buttons are numbered from 1. */
    pub fn is_pressed(&self, button: u8) -> bool {
        (1..=MAX_BUTTONS).contains(&button) && self.buttons & (1 << (button - 1)) != 0
    }
}

/* Press detector for the profile-switch button. Fires once per press. */
#[derive(Debug, Clone)]
pub struct SwitchButton {
    button: u8,
    held: bool,
}

impl SwitchButton {
    /* `None` when `button` is outside 1..=16. */
    pub fn new(button: u8) -> Option<Self> {
        (1..=MAX_BUTTONS)
            .contains(&button)
            .then_some(Self { button, held: false })
    }

    pub fn button(&self) -> u8 {
        self.button
    }

    /* Returns `true` on the report where the button goes down. */
    pub fn feed(&mut self, report: &MouseReport) -> bool {
        let pressed = report.is_pressed(self.button);
        let rising = pressed && !self.held;
        self.held = pressed;
        rising
    }
}

impl Default for SwitchButton {
    fn default() -> Self {
        Self {
            button: DEFAULT_SWITCH_BUTTON,
            held: false,
        }
    }
}
