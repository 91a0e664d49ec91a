use std::fmt;

/// Short (16 bit) GATT attribute identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid16(pub u16);

impl fmt::Display for Uuid16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// Proprietary multimeter service.
pub const OWON_SERVICE: Uuid16 = Uuid16(0xfff0);
/// Command endpoint (write).
pub const COMMAND_CHARACTERISTIC: Uuid16 = Uuid16(0xfff1);
/// Control endpoint (write).
pub const CONTROL_CHARACTERISTIC: Uuid16 = Uuid16(0xfff3);
/// Measurement endpoint (notify/read), carries one frame per update.
pub const MEASUREMENT_CHARACTERISTIC: Uuid16 = Uuid16(0xfff4);
