use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};

use crate::{
    proto::{conv::unit_prefix, DecodeError},
    rawframe::RawFrame,
};

/// Decimal place counts from this value upwards mark an overload.
pub const OVERLOAD_DECIMALS: u8 = 4;

static NEXT_SEQUENCE_ID: AtomicU64 = AtomicU64::new(0);

/// Unit prefix of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scale {
    Pico,
    Nano,
    Micro,
    Milli,
    One,
    Kilo,
    Mega,
    Giga,
}

impl Scale {
    pub fn code(&self) -> u8 {
        match self {
            Scale::Pico => 0,
            Scale::Nano => 1,
            Scale::Micro => 2,
            Scale::Milli => 3,
            Scale::One => 4,
            Scale::Kilo => 5,
            Scale::Mega => 6,
            Scale::Giga => 7,
        }
    }

    /// Power of ten this prefix stands for.
    pub fn exponent(&self) -> i32 {
        (self.code() as i32 - 4) * 3
    }
}

impl TryFrom<u8> for Scale {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pico),
            1 => Ok(Self::Nano),
            2 => Ok(Self::Micro),
            3 => Ok(Self::Milli),
            4 => Ok(Self::One),
            5 => Ok(Self::Kilo),
            6 => Ok(Self::Mega),
            7 => Ok(Self::Giga),
            x => Err(DecodeError::UnknownScale(x)),
        }
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(unit_prefix(self.exponent()))
    }
}

/// Measurement function selected on the rotary switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    VoltageDc,
    VoltageAc,
    CurrentDc,
    CurrentAc,
    Resistance,
    Capacitance,
    Frequency,
    Percent,
    Celsius,
    Fahrenheit,
    Voltage,
    /// Second resistance range (continuity/diode position).
    Resistance2,
    /// Transistor gain.
    TransistorGain,
}

impl Function {
    pub fn code(&self) -> u8 {
        match self {
            Function::VoltageDc => 0,
            Function::VoltageAc => 1,
            Function::CurrentDc => 2,
            Function::CurrentAc => 3,
            Function::Resistance => 4,
            Function::Capacitance => 5,
            Function::Frequency => 6,
            Function::Percent => 7,
            Function::Celsius => 8,
            Function::Fahrenheit => 9,
            Function::Voltage => 10,
            Function::Resistance2 => 11,
            Function::TransistorGain => 12,
        }
    }
}

impl TryFrom<u8> for Function {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::VoltageDc),
            1 => Ok(Self::VoltageAc),
            2 => Ok(Self::CurrentDc),
            3 => Ok(Self::CurrentAc),
            4 => Ok(Self::Resistance),
            5 => Ok(Self::Capacitance),
            6 => Ok(Self::Frequency),
            7 => Ok(Self::Percent),
            8 => Ok(Self::Celsius),
            9 => Ok(Self::Fahrenheit),
            10 => Ok(Self::Voltage),
            11 => Ok(Self::Resistance2),
            12 => Ok(Self::TransistorGain),
            x => Err(DecodeError::UnknownFunction(x)),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::VoltageDc => f.write_str("V DC"),
            Function::VoltageAc => f.write_str("V AC"),
            Function::CurrentDc => f.write_str("A DC"),
            Function::CurrentAc => f.write_str("A AC"),
            Function::Resistance => f.write_str("Ω"),
            Function::Capacitance => f.write_str("F"),
            Function::Frequency => f.write_str("Hz"),
            Function::Percent => f.write_str("%"),
            Function::Celsius => f.write_str("°C"),
            Function::Fahrenheit => f.write_str("°F"),
            Function::Voltage => f.write_str("V"),
            Function::Resistance2 => f.write_str("Ω"),
            Function::TransistorGain => f.write_str("hFE"),
        }
    }
}

/// Display annunciators sent along with a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Options(u16);

impl Options {
    pub const HOLD: Options = Options(0x01);
    pub const DELTA: Options = Options(0x02);
    pub const LOW_BATTERY: Options = Options(0x08);
    pub const MIN: Options = Options(0x10);
    pub const MAX: Options = Options(0x20);

    const NAMED: [(Options, &'static str); 5] = [
        (Options::HOLD, "Hold"),
        (Options::DELTA, "Delta"),
        (Options::LOW_BATTERY, "Low battery"),
        (Options::MIN, "Min"),
        (Options::MAX, "Max"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Bits without a name are kept so the word survives re-encoding.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, other: Options) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Options) {
        self.0 |= other.0;
    }
}

impl BitOr for Options {
    type Output = Options;

    fn bitor(self, rhs: Self) -> Self::Output {
        Options(self.0 | rhs.0)
    }
}

impl BitOrAssign for Options {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect::<Vec<&str>>()
            .join(", ");
        f.write_str(&str)
    }
}

/// One decoded measurement frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    scale: Scale,
    function: Function,
    decimal_places: u8,
    options: Options,
    raw_value: i16,
    ts: DateTime<Utc>,
    sequence_id: u64,
}

impl TryFrom<(RawFrame, DateTime<Utc>)> for Reading {
    type Error = DecodeError;

    fn try_from(value: (RawFrame, DateTime<Utc>)) -> Result<Self, Self::Error> {
        let raw = value.0;
        let scale = Scale::try_from(raw.scale)?;
        let function = Function::try_from(raw.function)?;
        Ok(Self {
            scale,
            function,
            decimal_places: raw.decimal_places,
            options: Options::from_bits(raw.options),
            raw_value: raw.value,
            ts: value.1,
            sequence_id: NEXT_SEQUENCE_ID.fetch_add(1, Ordering::Relaxed),
        })
    }
}

impl Reading {
    pub fn scale(&self) -> Scale {
        self.scale
    }

    pub fn function(&self) -> Function {
        self.function
    }

    /// Decimal places shown on the meter. Values of 4 and above mean overload.
    pub fn decimal_places(&self) -> u8 {
        self.decimal_places
    }

    pub fn options(&self) -> Options {
        self.options
    }

    /// Signed display digits without decimal point.
    pub fn raw_value(&self) -> i16 {
        self.raw_value
    }

    /// Capture time.
    pub fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    /// Process wide, strictly increasing construction counter.
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn is_overload(&self) -> bool {
        self.decimal_places >= OVERLOAD_DECIMALS
    }

    /// Value as shown on the display, in units of [`Reading::scale`].
    ///
    /// Returns `None` for overload readings.
    pub fn display_value(&self) -> Option<f64> {
        if self.is_overload() {
            None
        } else {
            Some(self.raw_value as f64 / 10_f64.powi(self.decimal_places as i32))
        }
    }

    /// Value converted to the base unit (e.g. volts for a mV reading).
    pub fn base_value(&self) -> Option<f64> {
        self.display_value()
            .map(|v| v * 10_f64.powi(self.scale.exponent()))
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = f.width().unwrap_or(0);
        match self.display_value() {
            Some(v) => {
                let prec = f.precision().unwrap_or(self.decimal_places as usize);
                f.write_fmt(format_args!(
                    "{:>width$.prec$} {}{}",
                    v, self.scale, self.function
                ))?;
            }
            None => f.write_fmt(format_args!("{:>width$}", "Overload"))?,
        }
        if f.alternate() && !self.options.is_empty() {
            f.write_fmt(format_args!(" [{}]", self.options))?;
        }
        Ok(())
    }
}
