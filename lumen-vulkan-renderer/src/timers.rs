//! GPU timestamp ring for per-frame diagnostics.
//!
//! A fixed set of named operations each own two slots in one timestamp
//! query pool. `start`/`end` bracket an operation inside the frame's
//! command stream; after the frame's fence wait, [`GpuTimers::collect`]
//! reads every armed pair back, skips pairs that are not yet available
//! (a normal outcome for timers skipped that frame, never an error) and
//! feeds a running average per name.

use std::time::Instant;

use ash::vk;
use log::{debug, info};

use crate::error::Result;

/// Names of the timed operations, in slot order.
pub const TIMER_NAMES: [&str; 4] = ["frame", "surfaces", "blur", "postprocess"];

/// Index into [`TIMER_NAMES`]; also the slot-pair index in the query pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Frame = 0,
    Surfaces = 1,
    Blur = 2,
    Postprocess = 3,
}

impl Timer {
    pub fn name(self) -> &'static str {
        TIMER_NAMES[self as usize]
    }

    fn start_slot(self) -> u32 {
        (self as u32) * 2
    }

    fn end_slot(self) -> u32 {
        (self as u32) * 2 + 1
    }
}

const QUERY_COUNT: u32 = (TIMER_NAMES.len() * 2) as u32;

/// Running sum/count average for one named timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerStats {
    sum_ms: f64,
    count: u64,
}

impl TimerStats {
    pub fn record(&mut self, elapsed_ms: f64) {
        self.sum_ms += elapsed_ms;
        self.count += 1;
    }

    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Timestamp query pool plus per-name rolling averages.
pub struct GpuTimers {
    device: ash::Device,
    query_pool: vk::QueryPool,
    timestamp_period: f32,
    armed: [bool; TIMER_NAMES.len()],
    stats: [TimerStats; TIMER_NAMES.len()],
    frame_started: Option<Instant>,
    cpu_frame_stats: TimerStats,
    summary_interval: u64,
}

impl GpuTimers {
    pub fn new(device: &ash::Device, timestamp_period: f32, summary_interval: u64) -> Result<Self> {
        let pool_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(QUERY_COUNT);
        let query_pool = unsafe { device.create_query_pool(&pool_info, None) }?;
        debug!("Timestamp query pool created ({} slots).", QUERY_COUNT);
        Ok(Self {
            device: device.clone(),
            query_pool,
            timestamp_period,
            armed: [false; TIMER_NAMES.len()],
            stats: [TimerStats::default(); TIMER_NAMES.len()],
            frame_started: None,
            cpu_frame_stats: TimerStats::default(),
            summary_interval,
        })
    }

    /// Resets every slot for a new frame. Must be recorded before any
    /// `start` of the same frame.
    pub fn reset(&mut self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .cmd_reset_query_pool(command_buffer, self.query_pool, 0, QUERY_COUNT);
        }
        self.armed = [false; TIMER_NAMES.len()];
        self.frame_started = Some(Instant::now());
    }

    /// Writes the start timestamp for `timer`.
    pub fn start(&mut self, command_buffer: vk::CommandBuffer, timer: Timer) {
        unsafe {
            self.device.cmd_write_timestamp(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                self.query_pool,
                timer.start_slot(),
            );
        }
        self.armed[timer as usize] = true;
    }

    /// Writes the end timestamp for `timer`.
    pub fn end(&mut self, command_buffer: vk::CommandBuffer, timer: Timer) {
        unsafe {
            self.device.cmd_write_timestamp(
                command_buffer,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.query_pool,
                timer.end_slot(),
            );
        }
    }

    /// Reads back every armed pair for the frame just waited on.
    ///
    /// Pairs whose results are unavailable are skipped silently; a device
    /// error reading an available pair propagates (timestamps are a hard
    /// requirement of device selection).
    pub fn collect(&mut self, frame: u64) -> Result<()> {
        for index in 0..TIMER_NAMES.len() {
            if !self.armed[index] {
                continue;
            }
            let mut results = [0u64; 2];
            let read = unsafe {
                self.device.get_query_pool_results(
                    self.query_pool,
                    (index as u32) * 2,
                    2,
                    &mut results,
                    vk::QueryResultFlags::TYPE_64,
                )
            };
            match read {
                Ok(()) => {}
                // the pair was skipped this frame; expected, not an error
                Err(vk::Result::NOT_READY) => continue,
                Err(e) => return Err(e.into()),
            }
            let ticks = results[1].saturating_sub(results[0]);
            let elapsed_ms = ticks as f64 * self.timestamp_period as f64 / 1_000_000.0;
            self.stats[index].record(elapsed_ms);
            debug!(
                "frame {}: gpu timer '{}' {:.3} ms (avg {:.3} ms)",
                frame,
                TIMER_NAMES[index],
                elapsed_ms,
                self.stats[index].average_ms()
            );
        }

        if let Some(started) = self.frame_started.take() {
            let cpu_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.cpu_frame_stats.record(cpu_ms);
            if self.summary_interval > 0 && frame > 0 && frame % self.summary_interval == 0 {
                let avg_ms = self.cpu_frame_stats.average_ms();
                let fps = if avg_ms > 0.0 { 1000.0 / avg_ms } else { 0.0 };
                info!(
                    "frame {}: this frame {:.2} ms, avg {:.2} ms ({:.1} fps)",
                    frame, cpu_ms, avg_ms, fps
                );
            }
        }
        Ok(())
    }

    /// Rolling average for one timer, for the diagnostics consumer.
    pub fn average_ms(&self, timer: Timer) -> f64 {
        self.stats[timer as usize].average_ms()
    }
}

impl Drop for GpuTimers {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_query_pool(self.query_pool, None);
        }
        debug!("Timestamp query pool destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_disjoint_pairs() {
        let timers = [Timer::Frame, Timer::Surfaces, Timer::Blur, Timer::Postprocess];
        let mut seen = Vec::new();
        for timer in timers {
            seen.push(timer.start_slot());
            seen.push(timer.end_slot());
            assert_eq!(timer.end_slot(), timer.start_slot() + 1);
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), QUERY_COUNT as usize);
    }

    #[test]
    fn stats_accumulate_running_average() {
        let mut stats = TimerStats::default();
        assert_eq!(stats.average_ms(), 0.0);
        stats.record(2.0);
        stats.record(4.0);
        assert!((stats.average_ms() - 3.0).abs() < 1e-9);
        assert_eq!(stats.count(), 2);
    }

    #[test]
    fn timer_names_match_variants() {
        assert_eq!(Timer::Frame.name(), "frame");
        assert_eq!(Timer::Postprocess.name(), "postprocess");
    }
}
