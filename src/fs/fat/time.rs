use std::fmt;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

/// Packed FAT date (high word) and time (low word).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FatTimestamp(u32);

impl FatTimestamp {
    pub const EPOCH_YEAR: u16 = 1980;

    /// Out of range fields are clamped into what the format can hold.
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        let year = year.max(Self::EPOCH_YEAR).min(Self::EPOCH_YEAR + 127) - Self::EPOCH_YEAR;
        let month = month.max(1).min(12) as u32;
        let day = day.max(1).min(31) as u32;
        let hour = hour.min(23) as u32;
        let minute = minute.min(59) as u32;
        let second = second.min(59) as u32;

        Self(
            (year as u32) << 25
                | month << 21
                | day << 16
                | hour << 11
                | minute << 5
                | second / 2,
        )
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn from_parts(date: u16, time: u16) -> Self {
        Self((date as u32) << 16 | time as u32)
    }

    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        let year = dt.year().max(0).min(u16::MAX as i32) as u16;
        Self::new(
            year,
            dt.month() as u8,
            dt.day() as u8,
            dt.hour() as u8,
            dt.minute() as u8,
            dt.second() as u8,
        )
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn date(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn time(self) -> u16 {
        self.0 as u16
    }

    pub fn year(self) -> u16 {
        Self::EPOCH_YEAR + (self.0 >> 25) as u16
    }

    pub fn month(self) -> u8 {
        (self.0 >> 21 & 0x0F) as u8
    }

    pub fn day(self) -> u8 {
        (self.0 >> 16 & 0x1F) as u8
    }

    pub fn hour(self) -> u8 {
        (self.0 >> 11 & 0x1F) as u8
    }

    pub fn minute(self) -> u8 {
        (self.0 >> 5 & 0x3F) as u8
    }

    pub fn second(self) -> u8 {
        (self.0 & 0x1F) as u8 * 2
    }

    /// `None` for a stamp that does not name a real date, e.g. all zeroes.
    pub fn to_datetime(self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year() as i32, self.month() as u32, self.day() as u32)?
            .and_hms_opt(
                self.hour() as u32,
                self.minute() as u32,
                self.second() as u32,
            )
    }
}

impl fmt::Debug for FatTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FatTimestamp({})", self)
    }
}

impl fmt::Display for FatTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year(),
            self.month(),
            self.day(),
            self.hour(),
            self.minute(),
            self.second()
        )
    }
}

/// Supplies modification times for written files.
pub trait TimeSource {
    fn now(&self) -> FatTimestamp;
}

/// Always reports the same instant, for systems without a clock.
#[derive(Debug, Copy, Clone)]
pub struct FixedTime(pub FatTimestamp);

impl Default for FixedTime {
    fn default() -> Self {
        Self(FatTimestamp::new(2025, 12, 12, 12, 0, 0))
    }
}

impl TimeSource for FixedTime {
    fn now(&self) -> FatTimestamp {
        self.0
    }
}

/// Host wall clock in local time.
#[derive(Debug, Default, Copy, Clone)]
pub struct LocalTime;

impl TimeSource for LocalTime {
    fn now(&self) -> FatTimestamp {
        FatTimestamp::from_datetime(&Local::now().naive_local())
    }
}
