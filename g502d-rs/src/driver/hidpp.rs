/* HID++ report framing for commands and responses. */
/*  */
/* HID++ uses two report formats on this device: */
/* - Short (Report ID 0x10): 7 bytes total, 3 parameter bytes */
/* - Long  (Report ID 0x11): 20 bytes total, 16 parameter bytes */
/*  */
/* Layout: `[report_id, device_idx, feature_idx, (function << 4 | sw_id), params...]` */

use std::fmt;

use thiserror::Error;

/* HID++ report IDs */
pub const REPORT_ID_SHORT: u8 = 0x10;
pub const REPORT_ID_LONG: u8 = 0x11;

/* Very long reports (64 bytes) exist in the protocol but this device never needs them. */
#[allow(dead_code)]
pub const REPORT_ID_VERY_LONG: u8 = 0x12;

pub const SHORT_SIZE: usize = 7;
pub const LONG_SIZE: usize = 20;
const HEADER_SIZE: usize = 4;

/* Device index used when the mouse is wired directly (no receiver pairing slot). */
pub const DEVICE_IDX_DIRECT: u8 = 0xFF;

/* Software ID tagged into every request so replies can be told apart from */
/* device-initiated notifications. */
pub const SW_ID: u8 = 0x01;
const SW_ID_MASK: u8 = 0x0F;

/* Feature index the device answers with when a request was rejected. */
pub const HIDPP20_ERROR: u8 = 0xFF;

/* Frame size selector. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Short,
    Long,
}

impl ReportKind {
    pub const fn report_id(self) -> u8 {
        match self {
            Self::Short => REPORT_ID_SHORT,
            Self::Long => REPORT_ID_LONG,
        }
    }

    /* Total frame size on the wire, report ID included. */
    pub const fn size(self) -> usize {
        match self {
            Self::Short => SHORT_SIZE,
            Self::Long => LONG_SIZE,
        }
    }

    pub const fn params_len(self) -> usize {
        self.size() - HEADER_SIZE
    }

    pub fn from_report_id(id: u8) -> Option<Self> {
        match id {
            REPORT_ID_SHORT => Some(Self::Short),
            REPORT_ID_LONG => Some(Self::Long),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("{kind:?} report carries at most {max} parameter bytes, got {len}")]
    ParamsTooLong {
        kind: ReportKind,
        max: usize,
        len: usize,
    },

    #[error("function 0x{0:X} does not fit the 4-bit function field")]
    InvalidFunction(u8),
}

/* An encoded outbound command, built fresh for every request. */
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    kind: ReportKind,
    buf: [u8; LONG_SIZE],
}

impl Packet {
    /* Build a zeroed frame of the requested size and fill in the header and */
    /* parameters. Parameters beyond what the frame can carry are rejected */
    /* rather than silently dropped. */
    pub fn encode(
        kind: ReportKind,
        feature_index: u8,
        function: u8,
        params: &[u8],
    ) -> Result<Self, CodecError> {
        if function > 0x0F {
            return Err(CodecError::InvalidFunction(function));
        }
        if params.len() > kind.params_len() {
            return Err(CodecError::ParamsTooLong {
                kind,
                max: kind.params_len(),
                len: params.len(),
            });
        }

        let mut buf = [0u8; LONG_SIZE];
        buf[0] = kind.report_id();
        buf[1] = DEVICE_IDX_DIRECT;
        buf[2] = feature_index;
        buf[3] = (function << 4) | SW_ID;
        buf[HEADER_SIZE..HEADER_SIZE + params.len()].copy_from_slice(params);

        Ok(Self { kind, buf })
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    pub fn report_id(&self) -> u8 {
        self.buf[0]
    }

    pub fn feature_index(&self) -> u8 {
        self.buf[2]
    }

    /* Function number with the software ID masked off. */
    pub fn function(&self) -> u8 {
        self.buf[3] >> 4
    }

    pub fn params(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..self.kind.size()]
    }

    /* The exact bytes to put on the wire. */
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.kind.size()]
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({:02x?})", self.as_bytes())
    }
}

/* A read-only view over an inbound frame delivered by the transport. */
/*  */
/* The view borrows the transport's buffer and is only valid for the */
/* duration of the response-handling call. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response<'a> {
    kind: ReportKind,
    buf: &'a [u8],
}

impl<'a> Response<'a> {
    /* Interpret `buf` as a HID++ frame. Returns `None` unless the report ID */
    /* is known and the length matches that report's frame size exactly. */
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        let kind = ReportKind::from_report_id(*buf.first()?)?;
        if buf.len() != kind.size() {
            return None;
        }
        Some(Self { kind, buf })
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    pub fn device_index(&self) -> u8 {
        self.buf[1]
    }

    pub fn feature_index(&self) -> u8 {
        self.buf[2]
    }

    /* Function number with the software ID masked off. */
    pub fn function(&self) -> u8 {
        self.buf[3] >> 4
    }

    pub fn sw_id(&self) -> u8 {
        self.buf[3] & SW_ID_MASK
    }

    pub fn params(&self) -> &'a [u8] {
        &self.buf[HEADER_SIZE..]
    }

    pub fn is_error(&self) -> bool {
        self.feature_index() == HIDPP20_ERROR
    }

    /* HID++ 2.0 error reply layout: */
    /* `[report_id, device_idx, 0xFF, feature_idx, (function << 4 | sw_id), error_code, ...]` */
    /* Returns `(feature_idx, function, error_code)` of the rejected request. */
    pub fn error(&self) -> Option<(u8, u8, u8)> {
        if !self.is_error() {
            return None;
        }
        Some((self.buf[3], self.buf[4] >> 4, self.buf[5]))
    }
}
