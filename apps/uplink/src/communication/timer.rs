use std::time::{Duration, Instant};

/// A single-purpose, cancellable deadline. Arming an armed timer replaces the
/// previous deadline, so one timer never has two pending firings.
#[derive(Clone, Debug, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn schedule(&mut self, now: Instant, after: Duration) {
        self.deadline = Some(now + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarms and returns `true` once `now` has reached the deadline.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of several optional deadlines.
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearming_replaces_deadline() {
        let now = Instant::now();
        let mut timer = Timer::default();
        timer.schedule(now, Duration::from_secs(5));
        timer.schedule(now, Duration::from_secs(1));
        assert_eq!(timer.deadline(), Some(now + Duration::from_secs(1)));
        assert!(!timer.fire(now));
        assert!(timer.fire(now + Duration::from_secs(1)));
        assert!(!timer.is_running());
        assert!(!timer.fire(now + Duration::from_secs(10)));
    }

    #[test]
    fn earliest_skips_idle_timers() {
        let now = Instant::now();
        let later = now + Duration::from_millis(10);
        assert_eq!(earliest([None, Some(later), Some(now)]), Some(now));
        assert_eq!(earliest([None, None]), None);
    }
}
