use std::time::{Duration, Instant};

/// Where a timer lives and who hears about it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerScope {
    /// Timer 0: hub-wide, expiry is announced to every session.
    Global,
    /// Timers 1-4: owned by one area, announced only there.
    Area { area: usize, slot: usize },
}

impl TimerScope {
    /// The timer id clients see. Slot 0 maps to id 1.
    pub fn client_id(&self) -> usize {
        match self {
            TimerScope::Global => 0,
            TimerScope::Area { slot, .. } => slot + 1,
        }
    }
}

/// A countdown a steward can set, start, pause and clear. The value is
/// stored statically while paused and as a deadline while running; the
/// owning state machine schedules exactly one deferred expiry per
/// running timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct CourtTimer {
    is_set: bool,
    deadline: Option<Instant>,
    remaining: Duration,
}

impl CourtTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.is_set
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Replaces the timer value. A running timer keeps running against
    /// the new deadline.
    pub fn set(&mut self, value: Duration, now: Instant) {
        self.is_set = true;
        if self.deadline.is_some() {
            self.deadline = Some(now + value);
        } else {
            self.remaining = value;
        }
    }

    /// Adds (or, when negative, removes) time. Removing more than is
    /// left clamps at zero.
    pub fn adjust(&mut self, delta: Duration, add: bool, now: Instant) {
        if !self.is_set {
            return;
        }
        let current = self.remaining(now);
        let next = if add {
            current.saturating_add(delta)
        } else {
            current.saturating_sub(delta)
        };
        self.set(next, now);
    }

    /// Converts the stored value into a live deadline. No-op when
    /// already running or never set.
    pub fn start(&mut self, now: Instant) -> bool {
        if !self.is_set || self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.remaining);
        true
    }

    /// Freezes the deadline back into a static value.
    pub fn pause(&mut self, now: Instant) -> bool {
        let Some(deadline) = self.deadline.take() else {
            return false;
        };
        self.remaining = deadline.saturating_duration_since(now);
        true
    }

    /// Clears and hides the timer.
    pub fn unset(&mut self) {
        self.is_set = false;
        self.deadline = None;
        self.remaining = Duration::ZERO;
    }

    /// Natural expiry: back to a zero, stopped, still-visible state.
    pub fn expire(&mut self) {
        self.deadline = None;
        self.remaining = Duration::ZERO;
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => self.remaining,
        }
    }
}

/// Parses `mm:ss`, `hh:mm:ss` or a bare second count.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let parts: Vec<&str> = text.split(':').collect();
    let seconds = match parts.as_slice() {
        [secs] => parse_component(secs)?,
        [mins, secs] => parse_component(mins)? * 60 + parse_component(secs)?,
        [hours, mins, secs] => {
            parse_component(hours)? * 3600 + parse_component(mins)? * 60 + parse_component(secs)?
        }
        _ => return Err(format!("unrecognized duration '{}'", text)),
    };
    Ok(Duration::from_secs(seconds))
}

fn parse_component(text: &str) -> Result<u64, String> {
    text.parse::<u64>()
        .map_err(|_| format!("unrecognized duration component '{}'", text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_start_establishes_deadline() {
        let now = Instant::now();
        let mut timer = CourtTimer::new();
        assert!(!timer.start(now));
        timer.set(Duration::from_secs(60), now);
        assert!(timer.is_set());
        assert!(!timer.is_running());
        assert!(timer.start(now));
        assert!(timer.is_running());
        assert_eq!(timer.remaining(now), Duration::from_secs(60));
        assert_eq!(
            timer.remaining(now + Duration::from_secs(15)),
            Duration::from_secs(45)
        );
    }

    #[test]
    fn pause_freezes_remaining_value() {
        let now = Instant::now();
        let mut timer = CourtTimer::new();
        timer.set(Duration::from_secs(90), now);
        timer.start(now);
        let later = now + Duration::from_secs(30);
        assert!(timer.pause(later));
        assert!(!timer.is_running());
        assert_eq!(timer.remaining(later), Duration::from_secs(60));
        // The frozen value no longer decays.
        assert_eq!(
            timer.remaining(later + Duration::from_secs(500)),
            Duration::from_secs(60)
        );
        assert!(!timer.pause(later));
    }

    #[test]
    fn adjust_applies_deltas_and_clamps_at_zero() {
        let now = Instant::now();
        let mut timer = CourtTimer::new();
        timer.set(Duration::from_secs(20), now);
        timer.adjust(Duration::from_secs(10), true, now);
        assert_eq!(timer.remaining(now), Duration::from_secs(30));
        timer.adjust(Duration::from_secs(45), false, now);
        assert_eq!(timer.remaining(now), Duration::ZERO);
    }

    #[test]
    fn adjust_while_running_moves_deadline() {
        let now = Instant::now();
        let mut timer = CourtTimer::new();
        timer.set(Duration::from_secs(10), now);
        timer.start(now);
        timer.adjust(Duration::from_secs(5), true, now);
        assert!(timer.is_running());
        assert_eq!(timer.remaining(now), Duration::from_secs(15));
    }

    #[test]
    fn unset_clears_everything() {
        let now = Instant::now();
        let mut timer = CourtTimer::new();
        timer.set(Duration::from_secs(5), now);
        timer.start(now);
        timer.unset();
        assert!(!timer.is_set());
        assert!(!timer.is_running());
        assert_eq!(timer.remaining(now), Duration::ZERO);
    }

    #[test]
    fn expire_resets_to_stopped_zero() {
        let now = Instant::now();
        let mut timer = CourtTimer::new();
        timer.set(Duration::from_secs(1), now);
        timer.start(now);
        timer.expire();
        assert!(timer.is_set());
        assert!(!timer.is_running());
        assert_eq!(timer.remaining(now), Duration::ZERO);
    }

    #[test]
    fn duration_parsing_accepts_all_forms() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("2:30").unwrap(), Duration::from_secs(150));
        assert_eq!(
            parse_duration("1:02:03").unwrap(),
            Duration::from_secs(3723)
        );
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("1:2:3:4").is_err());
    }
}
