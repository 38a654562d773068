use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use rosc::OscTime;

/// seconds between the NTP epoch (1900-01-01) that OSC time tags are based on and the Unix epoch
const SECONDS_1900_TO_1970: u64 = 2_208_988_800;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// An absolute point in time as transmitted in an OSC bundle header: seconds since 1900-01-01
///  plus a fractional part in units of 2^-32 seconds.
///
/// The value `(0, 1)` is reserved by OSC 1.0 and means 'immediately'.
///
/// NB: Ordering is by raw value, i.e. it does not account for the NTP era rollover in 2036
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TimeTag {
    seconds: u32,
    fractional: u32,
}

impl TimeTag {
    pub const IMMEDIATE: TimeTag = TimeTag { seconds: 0, fractional: 1 };

    pub fn new(seconds: u32, fractional: u32) -> TimeTag {
        TimeTag { seconds, fractional }
    }

    pub fn now() -> TimeTag {
        Self::from_system_time(SystemTime::now())
    }

    /// the time tag for a point in time `delay` after the current wall clock time
    pub fn after(delay: Duration) -> TimeTag {
        Self::from_system_time(SystemTime::now() + delay)
    }

    /// Points in time before 1970 are clamped to the Unix epoch. Points in time beyond the NTP
    ///  era (2036) wrap around, as they do on the wire.
    pub fn from_system_time(t: SystemTime) -> TimeTag {
        let since_unix = t.duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        let seconds = since_unix.as_secs() + SECONDS_1900_TO_1970;
        let fractional = ((since_unix.subsec_nanos() as u64) << 32) / NANOS_PER_SECOND;

        TimeTag {
            seconds: seconds as u32,
            fractional: fractional as u32,
        }
    }

    pub fn to_system_time(&self) -> SystemTime {
        let nanos = ((self.fractional as u64) * NANOS_PER_SECOND) >> 32;
        let since_ntp_epoch = Duration::new(self.seconds as u64, nanos as u32);
        let unix_epoch_offset = Duration::from_secs(SECONDS_1900_TO_1970);

        if since_ntp_epoch >= unix_epoch_offset {
            UNIX_EPOCH + (since_ntp_epoch - unix_epoch_offset)
        }
        else {
            // not representable on all platforms
            UNIX_EPOCH.checked_sub(unix_epoch_offset - since_ntp_epoch)
                .unwrap_or(UNIX_EPOCH)
        }
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn fractional(&self) -> u32 {
        self.fractional
    }

    pub fn is_immediate(&self) -> bool {
        *self == Self::IMMEDIATE
    }

    /// true iff this time tag denotes a point in time strictly after `now`
    pub fn is_future(&self, now: SystemTime) -> bool {
        self.to_system_time() > now
    }

    /// The interval from `now` until this time tag, rounded to microseconds. Returns `None` if
    ///  this time tag is not in the future or the rounded interval is zero.
    pub fn duration_since(&self, now: SystemTime) -> Option<Duration> {
        let raw = self.to_system_time()
            .duration_since(now)
            .ok()?;

        let micros = (raw.as_nanos() + 500) / 1_000;
        let micros = u64::try_from(micros).unwrap_or(u64::MAX);
        if micros == 0 {
            return None;
        }
        Some(Duration::from_micros(micros))
    }
}

impl Default for TimeTag {
    fn default() -> Self {
        Self::IMMEDIATE
    }
}

impl From<OscTime> for TimeTag {
    fn from(value: OscTime) -> Self {
        TimeTag::new(value.seconds, value.fractional)
    }
}

impl From<TimeTag> for OscTime {
    fn from(value: TimeTag) -> Self {
        OscTime {
            seconds: value.seconds,
            fractional: value.fractional,
        }
    }
}

impl Display for TimeTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_immediate() {
            return write!(f, "immediate");
        }

        match self.to_system_time().duration_since(UNIX_EPOCH) {
            Ok(d) => write!(f, "{}.{:06}", d.as_secs(), d.subsec_micros()),
            Err(_) => write!(f, "{}:{}", self.seconds, self.fractional),
        }
    }
}
