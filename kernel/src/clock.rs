//! The monotonic tick counter and wall-clock `(date, time_of_day,
//! subsecond_ticks)` triple it drives.
//!
//! The spec permits either a 64-bit or (with documented wrap behavior) a
//! 32-bit tick counter; this follows the spec's own recommendation and
//! uses 64 bits, which doesn't wrap inside any realistic uptime and so
//! needs no wraparound handling at all.

/// `(date, time_of_day, subsecond_ticks)` as the original `tm_get`/`tm_set`
/// API encodes it. `date` packs year/month/day; `time` packs
/// hour/minute/second; both use the original's bit-packed encoding so a
/// value round-trips through `tm_get`/`tm_set` unchanged. Internally the
/// clock just keeps a tick count and converts on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WallClock {
    pub date: u32,
    pub time: u32,
    pub ticks: u32,
}

const SECONDS_PER_DAY: u64 = 86_400;

pub struct Clock {
    /// Ticks elapsed since kernel start.
    now: u64,
    tick_rate_hz: u32,
    /// `now` at the instant `base` was set via `tm_set`, so `tm_get` can
    /// report the wall-clock value as `base + elapsed`.
    base: WallClock,
    base_tick: u64,
}

impl Clock {
    pub fn new(tick_rate_hz: u32) -> Self {
        Self {
            now: 0,
            tick_rate_hz,
            base: WallClock::default(),
            base_tick: 0,
        }
    }

    pub fn now_ticks(&self) -> u64 {
        self.now
    }

    pub fn tick_rate_hz(&self) -> u32 {
        self.tick_rate_hz
    }

    pub fn advance(&mut self, ticks: u64) {
        self.now = self.now.wrapping_add(ticks);
    }

    pub fn set(&mut self, wall: WallClock) {
        self.base = wall;
        self.base_tick = self.now;
    }

    pub fn get(&self) -> WallClock {
        let elapsed_ticks = self.now - self.base_tick;
        let elapsed_secs = elapsed_ticks / self.tick_rate_hz as u64;
        let rem_ticks = (elapsed_ticks % self.tick_rate_hz as u64) as u32;

        let mut subsecond = self.base.ticks + rem_ticks;
        let mut carry_secs = elapsed_secs;
        if subsecond >= self.tick_rate_hz {
            carry_secs += (subsecond / self.tick_rate_hz) as u64;
            subsecond %= self.tick_rate_hz;
        }

        let (date, time) = advance_date_time(self.base.date, self.base.time, carry_secs);
        WallClock {
            date,
            time,
            ticks: subsecond,
        }
    }

    /// Absolute tick corresponding to `(date, time, ticks)` being reached,
    /// relative to the clock's current wall-clock value. Used by
    /// `tm_wkwhen`/`tm_evwhen`.
    pub fn abs_tick_for(&self, target: WallClock) -> Option<u64> {
        let current = self.get();
        let delta_secs = wall_time_delta_secs(current, target)?;
        let delta_ticks = delta_secs
            .saturating_mul(self.tick_rate_hz as u64)
            .saturating_add(target.ticks as u64)
            .saturating_sub(current.ticks as u64);
        Some(self.now + delta_ticks)
    }
}

/// Seconds-of-day plus day count encoded as `date*86400 + time_as_seconds`,
/// used only to compute a delta between two wall-clock values. `date` and
/// `time` are treated as opaque monotonically increasing packed integers
/// here (the original pSOS encoding is day-count/seconds-of-day already in
/// a sortable form), so the delta is well-defined as long as `target` is
/// not earlier than `current`.
fn wall_time_delta_secs(current: WallClock, target: WallClock) -> Option<u64> {
    let cur = current.date as u64 * SECONDS_PER_DAY + current.time as u64;
    let tgt = target.date as u64 * SECONDS_PER_DAY + target.time as u64;
    tgt.checked_sub(cur)
}

fn advance_date_time(date: u32, time: u32, add_secs: u64) -> (u32, u32) {
    let total = time as u64 + add_secs;
    let extra_days = total / SECONDS_PER_DAY;
    let new_time = (total % SECONDS_PER_DAY) as u32;
    (date.wrapping_add(extra_days as u32), new_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_rolls_seconds_into_time_and_date() {
        let mut clk = Clock::new(100);
        clk.set(WallClock {
            date: 1,
            time: SECONDS_PER_DAY as u32 - 1,
            ticks: 0,
        });
        clk.advance(200); // 2 seconds
        let w = clk.get();
        assert_eq!(w.date, 2);
        assert_eq!(w.time, 1);
    }

    #[test]
    fn subsecond_ticks_accumulate() {
        let mut clk = Clock::new(100);
        clk.set(WallClock {
            date: 0,
            time: 0,
            ticks: 95,
        });
        clk.advance(10);
        let w = clk.get();
        assert_eq!(w.time, 1);
        assert_eq!(w.ticks, 5);
    }
}
