use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::measurement::Reading;
use crate::proto::DecodeError;

/// Size of one measurement notification.
pub const FRAME_LEN: usize = 6;

const DECIMAL_MASK: u16 = 0x07;
const SCALE_SHIFT: u16 = 3;
const SCALE_MASK: u16 = 0x07;
const FUNCTION_SHIFT: u16 = 6;
const FUNCTION_MASK: u16 = 0x0f;

const SIGN_BIT: u16 = 0x8000;
const MAGNITUDE_MASK: u16 = 0x7fff;

/// Undecoded field values of a measurement frame.
///
/// The frame consists of three little endian words:
///
/// | word | bits  | content                 |
/// |------|-------|-------------------------|
/// | 0    | 0-2   | decimal places          |
/// | 0    | 3-5   | scale code              |
/// | 0    | 6-9   | function code           |
/// | 1    | 0-15  | option flags            |
/// | 2    | 0-14  | magnitude               |
/// | 2    | 15    | sign                    |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub decimal_places: u8,
    pub scale: u8,
    pub function: u8,
    pub options: u16,
    pub value: i16,
}

impl TryFrom<&[u8]> for RawFrame {
    type Error = DecodeError;

    fn try_from(value: &[u8]) -> std::result::Result<Self, Self::Error> {
        if value.len() != FRAME_LEN {
            return Err(DecodeError::InvalidLength(value.len()));
        }
        let mut cur = Cursor::new(value);

        let truncated = |_| DecodeError::InvalidLength(value.len());
        let mode = cur.read_u16::<LittleEndian>().map_err(truncated)?;
        let options = cur.read_u16::<LittleEndian>().map_err(truncated)?;
        let value_word = cur.read_u16::<LittleEndian>().map_err(truncated)?;

        let magnitude = (value_word & MAGNITUDE_MASK) as i16;
        let value = if value_word & SIGN_BIT != 0 {
            -magnitude
        } else {
            magnitude
        };

        Ok(RawFrame {
            decimal_places: (mode & DECIMAL_MASK) as u8,
            scale: ((mode >> SCALE_SHIFT) & SCALE_MASK) as u8,
            function: ((mode >> FUNCTION_SHIFT) & FUNCTION_MASK) as u8,
            options,
            value,
        })
    }
}

impl RawFrame {
    /// Serialize into the on-air layout.
    ///
    /// Field values wider than their bit slot are truncated to it.
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mode = (self.decimal_places as u16 & DECIMAL_MASK)
            | ((self.scale as u16 & SCALE_MASK) << SCALE_SHIFT)
            | ((self.function as u16 & FUNCTION_MASK) << FUNCTION_SHIFT);

        let magnitude = self.value.unsigned_abs() & MAGNITUDE_MASK;
        let value_word = if self.value < 0 {
            magnitude | SIGN_BIT
        } else {
            magnitude
        };

        let mut buf = [0_u8; FRAME_LEN];
        LittleEndian::write_u16_into(&[mode, self.options, value_word], &mut buf);
        buf
    }
}

impl From<&Reading> for RawFrame {
    fn from(value: &Reading) -> Self {
        Self {
            decimal_places: value.decimal_places(),
            scale: value.scale().code(),
            function: value.function().code(),
            options: value.options().bits(),
            value: value.raw_value(),
        }
    }
}
