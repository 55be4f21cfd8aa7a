// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Shard window derivation and boundary arithmetic. Pure; no I/O.

use std::time::Duration;

use core_types::types::UnixNanos;

/// Precomputed shard geometry, fixed for the life of the updater.
///
/// Picture the timeline cut into `window_width`-sized epochs anchored at the
/// Unix epoch, each epoch cut into `num_shards` equal chunks numbered 0 to
/// `num_shards - 1`. A chunk's boundaries never move as `at_time` advances;
/// a revoked certificate therefore lands in the same shard on every tick.
/// The live window `[at_time - lookback, at_time + lookforward)` usually
/// clips two instances of the chunk at its edges, so a shard resolves to the
/// leftmost instance with any overlap. The lookforward is padded past the
/// furthest real expiry by several chunk widths so that padding is what gets
/// clipped on the right, never real expirations.
#[derive(Debug, Clone, Copy)]
pub struct ShardCalendar {
    num_shards: usize,
    lookback_ns: i64,
    lookforward_ns: i64,
}

impl ShardCalendar {
    /// Derives the calendar from the update cadence and the longest
    /// currently-issued certificate lifetime. `num_shards` must be >= 1.
    pub(crate) fn new(num_shards: usize, cert_lifetime: Duration, update_period: Duration) -> Self {
        // Four update cycles of lookback guarantee that a certificate
        // revoked shortly before its natural expiry still appears on at
        // least one CRL (RFC 5280 section 3.3).
        let lookback_ns = 4 * duration_ns(update_period);

        // Overshoot the furthest real expiry by four tentative chunk widths,
        // then round the total window up to an exact multiple of num_shards
        // so every chunk has the same integer-nanosecond width.
        let lifetime_ns = duration_ns(cert_lifetime);
        let shards = num_shards as i64;
        let tentative_shard_width = (lookback_ns + lifetime_ns) / shards;
        let mut lookforward_ns = lifetime_ns + 4 * tentative_shard_width;
        let rem = (lookback_ns + lookforward_ns) % shards;
        if rem != 0 {
            lookforward_ns += shards - rem;
        }

        Self {
            num_shards,
            lookback_ns,
            lookforward_ns,
        }
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn lookback_ns(&self) -> i64 {
        self.lookback_ns
    }

    pub fn lookforward_ns(&self) -> i64 {
        self.lookforward_ns
    }

    pub fn window_width_ns(&self) -> i64 {
        self.lookback_ns + self.lookforward_ns
    }

    pub fn shard_width_ns(&self) -> i64 {
        self.window_width_ns() / self.num_shards as i64
    }

    /// Start (inclusive) and end (exclusive) expiry bounds for one shard:
    /// the leftmost instance of chunk `shard_idx` overlapping the live
    /// window around `at`.
    pub fn shard_boundaries(&self, at: UnixNanos, shard_idx: usize) -> (UnixNanos, UnixNanos) {
        let shard_idx = (shard_idx % self.num_shards) as i64;

        let window = self.window_width_ns();
        // Left edge of the epoch containing `at`; chunk 0 starts here.
        let at_offset = at.rem_euclid(window);
        let zero_start = at - at_offset;

        let shard_width = self.shard_width_ns();
        let mut shard_start = zero_start + shard_idx * shard_width;
        let mut shard_end = shard_start + shard_width;

        // The instance in the current epoch may sit entirely behind the live
        // window's left edge; if so the next instance is the leftmost one
        // with overlap.
        if shard_end < at - self.lookback_ns {
            shard_start += window;
            shard_end += window;
        }
        (shard_start, shard_end)
    }
}

/// Delay until the next wall-clock instant `t` with
/// `t mod update_period == update_offset`, so tick times do not depend on
/// when the process started.
pub(crate) fn initial_wait(
    now: UnixNanos,
    update_period: Duration,
    update_offset: Duration,
) -> Duration {
    let period_ns = duration_ns(update_period);
    let offset_ns = duration_ns(update_offset);
    let curr_offset = now.rem_euclid(period_ns);
    let wait_ns = if curr_offset <= offset_ns {
        offset_ns - curr_offset
    } else {
        period_ns - curr_offset + offset_ns
    };
    Duration::from_nanos(wait_ns as u64)
}

fn duration_ns(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).expect("duration fits in i64 nanoseconds")
}
