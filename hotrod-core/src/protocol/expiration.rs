//! Entry expiration parameters.

use std::time::Duration;

use bytes::BufMut;

use super::version::{Feature, ProtocolVersion};
use super::wire::{vint_size, vlong_size, write_vint, write_vlong};

const UNIT_DEFAULT: u8 = 0x07;
const UNIT_INFINITE: u8 = 0x08;

/// Time unit of an expiration amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    /// Seconds.
    Seconds,
    /// Milliseconds.
    Milliseconds,
    /// Nanoseconds (4.0 and later on the wire).
    Nanoseconds,
    /// Microseconds (4.0 and later on the wire).
    Microseconds,
    /// Minutes.
    Minutes,
    /// Hours.
    Hours,
    /// Days.
    Days,
}

impl TimeUnit {
    /// Returns the 4-bit wire code.
    pub fn code(self) -> u8 {
        match self {
            TimeUnit::Seconds => 0x00,
            TimeUnit::Milliseconds => 0x01,
            TimeUnit::Nanoseconds => 0x02,
            TimeUnit::Microseconds => 0x03,
            TimeUnit::Minutes => 0x04,
            TimeUnit::Hours => 0x05,
            TimeUnit::Days => 0x06,
        }
    }

    fn nanos(self) -> u128 {
        match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => 1_000,
            TimeUnit::Milliseconds => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
            TimeUnit::Minutes => 60_000_000_000,
            TimeUnit::Hours => 3_600_000_000_000,
            TimeUnit::Days => 86_400_000_000_000,
        }
    }

    fn is_sub_millisecond(self) -> bool {
        matches!(self, TimeUnit::Nanoseconds | TimeUnit::Microseconds)
    }
}

/// Converts `amount` of `from` into `to`, rounding any remainder up.
fn convert_rounding_up(amount: u64, from: TimeUnit, to: TimeUnit) -> u64 {
    let nanos = u128::from(amount) * from.nanos();
    let converted = nanos.div_ceil(to.nanos());
    u64::try_from(converted).unwrap_or(u64::MAX)
}

/// How long an entry may live or stay idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Lifetime {
    /// Use the server's configured default.
    #[default]
    Default,
    /// Never expire.
    Infinite,
    /// Expire after `amount` of `unit`. A zero amount means the default.
    Finite {
        /// Number of units.
        amount: u64,
        /// Unit of `amount`.
        unit: TimeUnit,
    },
}

impl Lifetime {
    /// Creates a finite lifetime.
    pub fn new(amount: u64, unit: TimeUnit) -> Self {
        Lifetime::Finite { amount, unit }
    }

    /// Lowers the lifetime to what `version` can express.
    fn for_version(self, version: ProtocolVersion) -> Self {
        match self {
            Lifetime::Finite { amount: 0, .. } => Lifetime::Default,
            Lifetime::Finite { amount, unit }
                if unit.is_sub_millisecond() && !version.supports(Feature::SubMillisecondUnits) =>
            {
                Lifetime::Finite {
                    amount: convert_rounding_up(amount, unit, TimeUnit::Milliseconds),
                    unit: TimeUnit::Milliseconds,
                }
            }
            other => other,
        }
    }

    fn unit_code(self) -> u8 {
        match self {
            Lifetime::Default => UNIT_DEFAULT,
            Lifetime::Infinite => UNIT_INFINITE,
            Lifetime::Finite { unit, .. } => unit.code(),
        }
    }

    /// Legacy encoding: whole seconds as a vint, rounded up, `0` for the
    /// default and `-1` for never.
    fn legacy_seconds(self) -> u32 {
        match self {
            Lifetime::Default => 0,
            Lifetime::Infinite => -1i32 as u32,
            Lifetime::Finite { amount, unit } => {
                let seconds = convert_rounding_up(amount, unit, TimeUnit::Seconds);
                seconds.min(i32::MAX as u64) as u32
            }
        }
    }
}

impl From<Duration> for Lifetime {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Lifetime::Default
        } else if duration.subsec_nanos() % 1_000_000 == 0 {
            Lifetime::new(duration.as_millis() as u64, TimeUnit::Milliseconds)
        } else {
            Lifetime::new(duration.as_nanos() as u64, TimeUnit::Nanoseconds)
        }
    }
}

/// Lifespan and max-idle of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Expiration {
    /// Maximum time since creation.
    pub lifespan: Lifetime,
    /// Maximum time since last access.
    pub max_idle: Lifetime,
}

impl Expiration {
    /// Creates expiration parameters.
    pub fn new(lifespan: Lifetime, max_idle: Lifetime) -> Self {
        Self { lifespan, max_idle }
    }

    /// Writes the expiration in the shape `version` expects.
    pub fn write(&self, buf: &mut impl BufMut, version: ProtocolVersion) {
        let lifespan = self.lifespan.for_version(version);
        let max_idle = self.max_idle.for_version(version);
        if !version.supports(Feature::TimeUnitExpiration) {
            write_vint(buf, lifespan.legacy_seconds());
            write_vint(buf, max_idle.legacy_seconds());
            return;
        }
        buf.put_u8((lifespan.unit_code() << 4) | max_idle.unit_code());
        if let Lifetime::Finite { amount, .. } = lifespan {
            write_vlong(buf, amount);
        }
        if let Lifetime::Finite { amount, .. } = max_idle {
            write_vlong(buf, amount);
        }
    }

    /// Returns the number of bytes [`write`](Self::write) produces.
    pub fn encoded_size(&self, version: ProtocolVersion) -> usize {
        let lifespan = self.lifespan.for_version(version);
        let max_idle = self.max_idle.for_version(version);
        if !version.supports(Feature::TimeUnitExpiration) {
            return vint_size(lifespan.legacy_seconds()) + vint_size(max_idle.legacy_seconds());
        }
        let amount_size = |l: Lifetime| match l {
            Lifetime::Finite { amount, .. } => vlong_size(amount),
            _ => 0,
        };
        1 + amount_size(lifespan) + amount_size(max_idle)
    }
}
