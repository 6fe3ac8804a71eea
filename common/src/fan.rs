use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use thiserror::Error;

use crate::types::FanSnapshot;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FanError {
    #[error("fan channel {channel} out of range (0..{count})")]
    ChannelOutOfRange { channel: usize, count: usize },
}

/// Tach edge counter shared between the interrupt handler and the RPM
/// computation. Drained with a single atomic exchange so edges landing
/// mid-read are never lost.
#[derive(Debug, Default)]
pub struct PulseCounter(AtomicU32);

impl PulseCounter {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Called from the tach edge interrupt.
    pub fn record_edge(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads and resets the accumulated edge count.
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FanBankConfig {
    /// Full-scale raw drive level; on ESP32 this is the LEDC max duty.
    pub max_duty: u32,
    /// Lowest raw drive that reliably starts the motor from standstill.
    pub min_start_duty: u32,
    pub pulses_per_rev: u32,
    /// Pulse counts are only meaningful over a window at least this long.
    pub rpm_refresh_ms: u64,
}

impl Default for FanBankConfig {
    fn default() -> Self {
        Self {
            max_duty: 255,
            min_start_duty: 30,
            pulses_per_rev: 2,
            rpm_refresh_ms: 1_000,
        }
    }
}

/// Raw drive level to write to one channel's PWM output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveLevel {
    pub channel: usize,
    pub duty: u32,
}

#[derive(Debug)]
struct FanChannel {
    speed_percent: u8,
    last_pulse_count: u32,
    last_rpm: u32,
    last_rpm_sample_ms: Option<u64>,
    counter: Arc<PulseCounter>,
}

impl FanChannel {
    fn new() -> Self {
        Self {
            speed_percent: 0,
            last_pulse_count: 0,
            last_rpm: 0,
            last_rpm_sample_ms: None,
            counter: Arc::new(PulseCounter::new()),
        }
    }
}

/// Owns the fixed set of fan channels. Speed commands return the raw drive
/// level for the hardware layer to write; the bank itself never touches
/// hardware.
#[derive(Debug)]
pub struct FanBank {
    config: FanBankConfig,
    channels: Vec<FanChannel>,
}

impl FanBank {
    pub fn new(config: FanBankConfig, channel_count: usize) -> Self {
        Self {
            config,
            channels: (0..channel_count).map(|_| FanChannel::new()).collect(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Handle for wiring a channel's counter into its edge interrupt.
    pub fn counter(&self, channel: usize) -> Result<Arc<PulseCounter>, FanError> {
        self.channel(channel).map(|ch| ch.counter.clone())
    }

    pub fn speed(&self, channel: usize) -> Result<u8, FanError> {
        self.channel(channel).map(|ch| ch.speed_percent)
    }

    /// Clamps to [0, 100], maps linearly into the raw drive range and
    /// enforces the start floor for any non-zero request.
    pub fn set_speed(&mut self, channel: usize, percent: i32) -> Result<DriveLevel, FanError> {
        let duty = self.duty_for(percent);
        let clamped = percent.clamp(0, 100) as u8;

        let ch = self.channel_mut(channel)?;
        ch.speed_percent = clamped;

        Ok(DriveLevel { channel, duty })
    }

    pub fn set_all(&mut self, percent: i32) -> Vec<DriveLevel> {
        let duty = self.duty_for(percent);
        let clamped = percent.clamp(0, 100) as u8;

        self.channels
            .iter_mut()
            .enumerate()
            .map(|(channel, ch)| {
                ch.speed_percent = clamped;
                DriveLevel { channel, duty }
            })
            .collect()
    }

    /// Returns the cached sample while it is younger than the refresh
    /// window; otherwise drains the pulse counter and recomputes.
    pub fn rpm(&mut self, channel: usize, now_ms: u64) -> Result<u32, FanError> {
        let refresh_ms = self.config.rpm_refresh_ms;
        let pulses_per_rev = self.config.pulses_per_rev.max(1);

        let ch = self.channel_mut(channel)?;
        if let Some(sampled_ms) = ch.last_rpm_sample_ms {
            if now_ms.saturating_sub(sampled_ms) < refresh_ms {
                return Ok(ch.last_rpm);
            }
        }

        let count = ch.counter.take();
        ch.last_pulse_count = count;
        ch.last_rpm = count * 60 / pulses_per_rev;
        ch.last_rpm_sample_ms = Some(now_ms);

        Ok(ch.last_rpm)
    }

    /// Cached per-channel views; never drains a counter.
    pub fn snapshot(&self) -> Vec<FanSnapshot> {
        self.channels
            .iter()
            .enumerate()
            .map(|(index, ch)| FanSnapshot {
                index,
                speed_percent: ch.speed_percent,
                rpm: ch.last_rpm,
            })
            .collect()
    }

    fn duty_for(&self, percent: i32) -> u32 {
        let clamped = percent.clamp(0, 100) as u32;
        if clamped == 0 {
            return 0;
        }

        let scaled = clamped * self.config.max_duty / 100;
        scaled.max(self.config.min_start_duty)
    }

    fn channel(&self, channel: usize) -> Result<&FanChannel, FanError> {
        let count = self.channels.len();
        self.channels
            .get(channel)
            .ok_or(FanError::ChannelOutOfRange { channel, count })
    }

    fn channel_mut(&mut self, channel: usize) -> Result<&mut FanChannel, FanError> {
        let count = self.channels.len();
        self.channels
            .get_mut(channel)
            .ok_or(FanError::ChannelOutOfRange { channel, count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> FanBank {
        FanBank::new(FanBankConfig::default(), 3)
    }

    #[test]
    fn set_speed_clamps_to_bounds() {
        let mut fans = bank();

        fans.set_speed(0, 150).unwrap();
        assert_eq!(fans.speed(0).unwrap(), 100);

        fans.set_speed(0, -5).unwrap();
        assert_eq!(fans.speed(0).unwrap(), 0);
    }

    #[test]
    fn full_scale_maps_to_max_duty() {
        let mut fans = bank();
        let drive = fans.set_speed(1, 100).unwrap();
        assert_eq!(drive.duty, 255);
    }

    #[test]
    fn low_percent_is_floored_to_start_duty() {
        let mut fans = bank();
        let drive = fans.set_speed(0, 1).unwrap();
        assert_eq!(drive.duty, 30);
    }

    #[test]
    fn zero_percent_is_a_full_stop() {
        let mut fans = bank();
        let drive = fans.set_speed(0, 0).unwrap();
        assert_eq!(drive.duty, 0);
    }

    #[test]
    fn set_all_updates_every_channel() {
        let mut fans = bank();
        let drives = fans.set_all(70);

        assert_eq!(drives.len(), 3);
        for (index, drive) in drives.iter().enumerate() {
            assert_eq!(drive.channel, index);
            assert_eq!(fans.speed(index).unwrap(), 70);
        }
    }

    #[test]
    fn invalid_channel_is_rejected() {
        let mut fans = bank();
        let err = fans.set_speed(3, 50).unwrap_err();
        assert_eq!(err, FanError::ChannelOutOfRange { channel: 3, count: 3 });
    }

    #[test]
    fn rpm_follows_pulse_count() {
        let mut fans = bank();
        let counter = fans.counter(0).unwrap();

        for _ in 0..40 {
            counter.record_edge();
        }

        assert_eq!(fans.rpm(0, 1_000).unwrap(), 1_200);
    }

    #[test]
    fn rpm_is_cached_within_refresh_window() {
        let mut fans = bank();
        let counter = fans.counter(0).unwrap();

        for _ in 0..40 {
            counter.record_edge();
        }
        assert_eq!(fans.rpm(0, 1_000).unwrap(), 1_200);

        // Edges keep accumulating; a read inside the window must return the
        // cached value and leave the counter alone.
        for _ in 0..10 {
            counter.record_edge();
        }
        assert_eq!(fans.rpm(0, 1_500).unwrap(), 1_200);
        assert_eq!(counter.take(), 10);
    }

    #[test]
    fn rpm_recomputes_after_refresh_window() {
        let mut fans = bank();
        let counter = fans.counter(0).unwrap();

        for _ in 0..40 {
            counter.record_edge();
        }
        assert_eq!(fans.rpm(0, 1_000).unwrap(), 1_200);

        for _ in 0..20 {
            counter.record_edge();
        }
        assert_eq!(fans.rpm(0, 2_000).unwrap(), 600);
    }

    #[test]
    fn disconnected_fan_reads_zero_rpm() {
        let mut fans = bank();
        assert_eq!(fans.rpm(2, 5_000).unwrap(), 0);
    }

    #[test]
    fn snapshot_reports_cached_values() {
        let mut fans = bank();
        fans.set_speed(1, 60).unwrap();

        let snapshot = fans.snapshot();
        assert_eq!(snapshot[1].speed_percent, 60);
        assert_eq!(snapshot[1].rpm, 0);
        assert_eq!(snapshot[0].speed_percent, 0);
    }
}
