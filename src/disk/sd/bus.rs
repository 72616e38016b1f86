/// SPI clock rates the driver switches between.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BusClock {
    /// Card identification phase, must stay at or below 400 kHz.
    Initialization,
    /// Data transfer once the card left the idle state.
    Operating,
}

impl BusClock {
    pub fn hz(self) -> u32 {
        match self {
            Self::Initialization => 400_000,
            Self::Operating => 10_500_000,
        }
    }
}

/// Lets the driver retune the bus between card identification and data transfer.
///
/// `embedded-hal` leaves clock configuration to the HAL, so SPI buses used with
/// [`SdCard`](super::SdCard) implement this on top of [`SpiBus`](embedded_hal::spi::SpiBus).
pub trait ClockControl {
    fn set_clock(&mut self, clock: BusClock);
}

impl<T: ClockControl + ?Sized> ClockControl for &mut T {
    fn set_clock(&mut self, clock: BusClock) {
        (**self).set_clock(clock)
    }
}
