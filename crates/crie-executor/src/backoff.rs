use std::time::Duration;

/// Exponential backoff for respawning a crashing worker child.
///
/// A child that keeps exiting immediately would otherwise be respawned in
/// a tight loop. Delays double from `first` up to `max`; a child that
/// stayed up for at least `stable_uptime` resets the sequence.
#[derive(Clone, Copy, Debug)]
pub struct RespawnBackoff {
    pub first: Duration,
    pub max: Duration,
    pub stable_uptime: Duration,
}

impl Default for RespawnBackoff {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            stable_uptime: Duration::from_secs(60),
        }
    }
}

impl RespawnBackoff {
    /// Next delay given the previous one and how long the child ran.
    pub fn next(&self, prev: Option<Duration>, uptime: Duration) -> Duration {
        if uptime >= self.stable_uptime {
            return self.first;
        }
        match prev {
            None => self.first,
            Some(d) => (d * 2).min(self.max),
        }
    }
}
