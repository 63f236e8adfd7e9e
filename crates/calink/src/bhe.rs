//! Beacon history entries: per-server liveness estimation.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A beacon period sample outside this band around the learned period is
/// an anomaly. The exact tolerance is a tuning choice, not protocol.
const PERIOD_LOW: f64 = 0.8;
const PERIOD_HIGH: f64 = 1.25;

/// Per-server beacon history.
///
/// The estimated period is only meaningful after two beacons have been
/// observed; until then every update is treated as seeding.
#[derive(Debug)]
pub(crate) struct Bhe {
    addr: SocketAddr,
    last_seen: Option<Instant>,
    last_number: u32,
    period: Option<Duration>,
    /// Circuit registered against this server, as a server-table key.
    iiu: Option<(SocketAddr, u8)>,
}

impl Bhe {
    /// Entry seeded from a first observed beacon.
    pub fn new(now: Instant, number: u32, addr: SocketAddr) -> Self {
        Self {
            addr,
            last_seen: Some(now),
            last_number: number,
            period: None,
            iiu: None,
        }
    }

    /// Entry created for a circuit before any beacon was seen.
    pub fn new_unseen(addr: SocketAddr) -> Self {
        Self {
            addr,
            last_seen: None,
            last_number: 0,
            period: None,
            iiu: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Learned inter-beacon period, if two or more beacons were seen.
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn register_iiu(&mut self, key: (SocketAddr, u8)) {
        self.iiu = Some(key);
    }

    pub fn unregister_iiu(&mut self, key: (SocketAddr, u8)) {
        if self.iiu == Some(key) {
            self.iiu = None;
        }
    }

    /// Record a beacon; returns true when it is evidence of an anomaly
    /// (server restart, or a significant period change).
    pub fn update_period(&mut self, now: Instant, number: u32, protocol_revision: u16) -> bool {
        let _ = protocol_revision;

        let Some(last_seen) = self.last_seen else {
            self.last_seen = Some(now);
            self.last_number = number;
            return false;
        };

        let sample = now.saturating_duration_since(last_seen);

        // A regression that is not a plain 2^32 wrap means the counter
        // started over: restart evidence.
        let delta = number.wrapping_sub(self.last_number);
        let restarted = delta == 0 || delta > u32::MAX / 2;

        let anomaly = match self.period {
            Some(period) => {
                let lo = period.mul_f64(PERIOD_LOW);
                let hi = period.mul_f64(PERIOD_HIGH);
                restarted || sample < lo || sample > hi
            }
            None => restarted,
        };

        self.period = Some(match self.period {
            // Exponentially smoothed: 1/4 new sample, 3/4 history.
            Some(period) => (period * 3 + sample) / 4,
            None => sample,
        });
        self.last_seen = Some(now);
        self.last_number = number;

        anomaly
    }
}
