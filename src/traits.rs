use anyhow::Result;
use std::time::{Duration, Instant};

use crate::schedule::Schedule;

/// Hands a validated schedule to whatever configures the switch.
#[cfg_attr(test, mockall::automock)]
pub trait ScheduleApplier {
    /// Returns Err with the tool's output when the switch rejected the schedule.
    fn apply(&mut self, schedule: &Schedule) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait PacketSource {
    /// Receive one datagram. Returns Ok(Some((len, rx_time))) if a packet arrived,
    /// where rx_time is taken right after the receive returned.
    /// Returns Ok(None) if the receive timed out.
    fn recv_packet(&mut self) -> Result<Option<(usize, Instant)>>;
}

/// One bounded capture window, owning the receive surface only for its duration.
#[cfg_attr(test, mockall::automock)]
pub trait Capturer {
    fn capture(&mut self, duration: Duration) -> Result<Vec<Instant>>;
}

impl<T: ScheduleApplier + ?Sized> ScheduleApplier for Box<T> {
    fn apply(&mut self, schedule: &Schedule) -> Result<()> {
        (**self).apply(schedule)
    }
}

impl<T: Capturer + ?Sized> Capturer for Box<T> {
    fn capture(&mut self, duration: Duration) -> Result<Vec<Instant>> {
        (**self).capture(duration)
    }
}
