/// Logitech G502 HERO (wired, 046d:c08b) protocol definitions.
///
/// The feature indices below are the ones this firmware reports for its
/// HID++ 2.0 feature pages. They are fixed per firmware, so the driver
/// addresses them directly instead of querying the Root feature.
use super::hidpp::{CodecError, Packet, ReportKind};

/* ------------------------------------------------------------------ */
/* Device identification                                                */
/* ------------------------------------------------------------------ */

pub const LOGITECH_VENDOR_ID: u16 = 0x046D;
pub const G502_HERO_PRODUCT_ID: u16 = 0xC08B;

/// USB interface carrying HID++ traffic. Interface 0 is the plain mouse.
pub const PROTOCOL_INTERFACE: u8 = 1;

pub const MAX_PROFILES: usize = 5;
pub const MAX_DPI: u16 = 25600;

/// Size of a regular (non-HID++) mouse input report.
pub const REGULAR_REPORT_SIZE: usize = 8;

/* ------------------------------------------------------------------ */
/* Feature indices and functions                                        */
/* ------------------------------------------------------------------ */

pub const FEATURE_COLOR_LED_EFFECTS: u8 = 0x02; /* page 0x8070 */
pub const FEATURE_DEVICE_FW: u8 = 0x03; /* page 0x0003 */
pub const FEATURE_DPI: u8 = 0x0A; /* page 0x2201 */
pub const FEATURE_REPORT_RATE: u8 = 0x0B; /* page 0x8060 */
pub const FEATURE_ONBOARD_PROFILES: u8 = 0x0C; /* page 0x8100 */

pub const RATE_FN_GET: u8 = 0x01;
pub const RATE_FN_SET: u8 = 0x02;

pub const DPI_FN_GET: u8 = 0x02;
pub const DPI_FN_SET: u8 = 0x03;

pub const ONBOARD_FN_SET_MODE: u8 = 0x01;
pub const ONBOARD_MODE_DEVICE: u8 = 0x01;
pub const ONBOARD_MODE_HOST: u8 = 0x02;

pub const FW_FN_GET_INFO: u8 = 0x01;

/// Sensor addressed by DPI requests. The G502 HERO has a single sensor.
const SENSOR_INDEX: u8 = 0;

/// Firmware entity selector for the firmware-info feature.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareEntity {
    MainApp = 0,
    Bootloader = 1,
    Hardware = 2,
    OpticalSensor = 4,
}

/* ------------------------------------------------------------------ */
/* Report rate encoding                                                 */
/* ------------------------------------------------------------------ */

/// Maps report rates in Hz to the vendor byte and back.
///
/// Unknown inputs map to 0 in both directions; callers treat 0 as
/// "invalid" when encoding and "unknown" when decoding.
pub struct RateTable;

impl RateTable {
    const ENTRIES: [(u16, u8); 4] = [(125, 0x01), (250, 0x02), (500, 0x04), (1000, 0x08)];

    pub fn to_device(hz: u16) -> u8 {
        Self::ENTRIES
            .iter()
            .find(|&&(rate, _)| rate == hz)
            .map_or(0, |&(_, raw)| raw)
    }

    pub fn to_host(raw: u8) -> u16 {
        Self::ENTRIES
            .iter()
            .find(|&&(_, value)| value == raw)
            .map_or(0, |&(rate, _)| rate)
    }

    pub fn supported() -> impl Iterator<Item = u16> {
        Self::ENTRIES.iter().map(|&(rate, _)| rate)
    }
}

/* ------------------------------------------------------------------ */
/* Request builders                                                     */
/* ------------------------------------------------------------------ */

pub fn set_report_rate(raw: u8) -> Result<Packet, CodecError> {
    Packet::encode(ReportKind::Short, FEATURE_REPORT_RATE, RATE_FN_SET, &[raw])
}

pub fn get_report_rate() -> Result<Packet, CodecError> {
    Packet::encode(ReportKind::Short, FEATURE_REPORT_RATE, RATE_FN_GET, &[])
}

/// DPI travels big-endian: `[sensor, dpi_hi, dpi_lo]`.
pub fn set_dpi(dpi: u16) -> Result<Packet, CodecError> {
    let [hi, lo] = dpi.to_be_bytes();
    Packet::encode(ReportKind::Short, FEATURE_DPI, DPI_FN_SET, &[SENSOR_INDEX, hi, lo])
}

pub fn get_dpi() -> Result<Packet, CodecError> {
    Packet::encode(ReportKind::Short, FEATURE_DPI, DPI_FN_GET, &[SENSOR_INDEX])
}

pub fn set_onboard_mode(mode: u8) -> Result<Packet, CodecError> {
    Packet::encode(
        ReportKind::Short,
        FEATURE_ONBOARD_PROFILES,
        ONBOARD_FN_SET_MODE,
        &[mode],
    )
}

pub fn get_firmware_info(entity: FirmwareEntity) -> Result<Packet, CodecError> {
    Packet::encode(
        ReportKind::Short,
        FEATURE_DEVICE_FW,
        FW_FN_GET_INFO,
        &[entity as u8],
    )
}

/* ------------------------------------------------------------------ */
/* Report descriptor fixup                                              */
/* ------------------------------------------------------------------ */

const RDESC_SIZE: usize = 67;
const RDESC_USAGE_MAXIMUM: usize = 15;
const RDESC_REPORT_COUNT: usize = 21;
const RDESC_ADVERTISED_BUTTONS: u8 = 16;

/// Button count the device actually has.
pub const PATCHED_USAGE_MAXIMUM: u8 = 9;

/// Narrow the advertised button usage range to the real button count.
///
/// Only the exact 67-byte descriptor with 16 buttons advertised at both the
/// Usage Maximum and Report Count offsets is touched. Report Count stays at
/// 16: shrinking it breaks interrupt input with EOVERFLOW.
///
/// Returns `true` if the descriptor was patched.
pub fn fixup_report_descriptor(rdesc: &mut [u8]) -> bool {
    if rdesc.len() != RDESC_SIZE
        || rdesc[RDESC_USAGE_MAXIMUM] != RDESC_ADVERTISED_BUTTONS
        || rdesc[RDESC_REPORT_COUNT] != RDESC_ADVERTISED_BUTTONS
    {
        return false;
    }

    rdesc[RDESC_USAGE_MAXIMUM] = PATCHED_USAGE_MAXIMUM;
    true
}

/// Button usage maximum of a mouse-interface descriptor, if it has the known layout.
pub fn usage_maximum(rdesc: &[u8]) -> Option<u8> {
    if rdesc.len() != RDESC_SIZE {
        return None;
    }
    rdesc.get(RDESC_USAGE_MAXIMUM).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_table_roundtrips_known_values() {
        for raw in [0x01, 0x02, 0x04, 0x08] {
            assert_eq!(RateTable::to_device(RateTable::to_host(raw)), raw);
        }
        for hz in [125, 250, 500, 1000] {
            assert_eq!(RateTable::to_host(RateTable::to_device(hz)), hz);
        }
    }

    #[test]
    fn rate_table_unknown_values_map_to_zero() {
        assert_eq!(RateTable::to_device(300), 0);
        assert_eq!(RateTable::to_device(0), 0);
        assert_eq!(RateTable::to_host(0x03), 0);
        assert_eq!(RateTable::to_host(0x00), 0);
        assert_eq!(RateTable::to_host(0xFF), 0);
    }

    #[test]
    fn set_dpi_is_big_endian() {
        let packet = set_dpi(0x0C80).expect("fits");
        assert_eq!(packet.feature_index(), FEATURE_DPI);
        assert_eq!(packet.function(), DPI_FN_SET);
        assert_eq!(packet.params(), &[SENSOR_INDEX, 0x0C, 0x80]);
    }

    #[test]
    fn report_rate_requests() {
        let set = set_report_rate(0x04).expect("fits");
        assert_eq!(set.as_bytes(), &[0x10, 0xFF, 0x0B, 0x21, 0x04, 0x00, 0x00]);
        let get = get_report_rate().expect("fits");
        assert_eq!(get.as_bytes(), &[0x10, 0xFF, 0x0B, 0x11, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn host_mode_request() {
        let packet = set_onboard_mode(ONBOARD_MODE_HOST).expect("fits");
        assert_eq!(packet.as_bytes(), &[0x10, 0xFF, 0x0C, 0x11, 0x02, 0x00, 0x00]);
    }

    fn broken_rdesc() -> Vec<u8> {
        let mut rdesc: Vec<u8> = (0..RDESC_SIZE as u8).map(|b| b.wrapping_mul(3)).collect();
        rdesc[RDESC_USAGE_MAXIMUM] = 16;
        rdesc[RDESC_REPORT_COUNT] = 16;
        rdesc
    }

    #[test]
    fn fixup_patches_only_usage_maximum() {
        let broken = broken_rdesc();
        let mut rdesc = broken.clone();
        assert!(fixup_report_descriptor(&mut rdesc));
        assert_eq!(rdesc[RDESC_USAGE_MAXIMUM], PATCHED_USAGE_MAXIMUM);
        for (i, (a, b)) in broken.iter().zip(&rdesc).enumerate() {
            if i != RDESC_USAGE_MAXIMUM {
                assert_eq!(a, b, "byte {i} changed");
            }
        }
        assert_eq!(usage_maximum(&rdesc), Some(PATCHED_USAGE_MAXIMUM));
    }

    #[test]
    fn fixup_leaves_other_descriptors_alone() {
        let mut wrong_size = broken_rdesc();
        wrong_size.push(0);
        let before = wrong_size.clone();
        assert!(!fixup_report_descriptor(&mut wrong_size));
        assert_eq!(wrong_size, before);

        let mut wrong_count = broken_rdesc();
        wrong_count[RDESC_REPORT_COUNT] = 9;
        let before = wrong_count.clone();
        assert!(!fixup_report_descriptor(&mut wrong_count));
        assert_eq!(wrong_count, before);

        let mut already_fixed = broken_rdesc();
        already_fixed[RDESC_USAGE_MAXIMUM] = PATCHED_USAGE_MAXIMUM;
        assert!(!fixup_report_descriptor(&mut already_fixed));
    }
}
