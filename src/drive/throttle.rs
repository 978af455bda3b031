use log::trace;
use tokio::time::{Duration, Instant};

use crate::drive::command::{Aux, MotorCommand};

/// Last continuous send that actually reached the transport. Only
/// `Throttler` touches this.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ThrottleWindow {
    last_sent_at: Option<Instant>,
    // None until something was sent on this link
    last_values: Option<(i32, i32)>,
}

/// Rate limits and deduplicates outbound drive commands.
///
/// Deciding and recording are separate steps: `offer_*` never changes the
/// window, the caller records a command once the transport took it. A
/// write that fails therefore never suppresses the same value later.
///
/// Rejected continuous values are dropped, never deferred: the next input
/// sample supersedes them.
#[derive(Debug, Clone)]
pub struct Throttler {
    send_interval: Duration,
    window: ThrottleWindow,
}

impl Throttler {
    pub fn new(send_interval: Duration) -> Self {
        Throttler {
            send_interval,
            window: ThrottleWindow::default(),
        }
    }

    pub fn send_interval(&self) -> Duration {
        self.send_interval
    }

    /// The (left, right) pair of the last recorded command.
    pub fn last_sent(&self) -> Option<(i32, i32)> {
        self.window.last_values
    }

    pub fn offer_continuous(&self, left: i32, right: i32) -> Option<MotorCommand> {
        self.offer_continuous_at(left, right, Instant::now())
    }

    pub fn offer_continuous_at(&self, left: i32, right: i32, now: Instant) -> Option<MotorCommand> {
        if let Some(last_sent_at) = self.window.last_sent_at {
            let elapsed = now.saturating_duration_since(last_sent_at);
            if elapsed < self.send_interval {
                trace!("Throttled {}:{} ({:?} since last send)", left, right, elapsed);
                return None;
            }
        }

        if self.window.last_values == Some((left, right)) {
            trace!("Suppressed duplicate {}:{}", left, right);
            return None;
        }

        Some(MotorCommand::new(left, right, Aux::Neutral))
    }

    /// Bypasses rate and dedup checks. Keeps the last drive values.
    pub fn offer_immediate(&self, aux: Aux) -> MotorCommand {
        let (left, right) = self.window.last_values.unwrap_or((0, 0));
        MotorCommand::new(left, right, aux)
    }

    /// Always (0,0,0).
    pub fn force_stop(&self) -> MotorCommand {
        MotorCommand::STOP
    }

    /// A continuous command went out at `now`.
    pub fn record_continuous(&mut self, command: &MotorCommand, now: Instant) {
        self.window = ThrottleWindow {
            last_sent_at: Some(now),
            last_values: Some((command.left, command.right)),
        };
    }

    /// A forced stop went out. Dedup state becomes (0,0) so a later zero
    /// input is not resent, while any non-zero input goes out on the next
    /// tick. The rate timer is left alone.
    pub fn record_stop(&mut self) {
        self.window.last_values = Some((0, 0));
    }

    /// Forget everything, used when the link goes away.
    pub fn reset(&mut self) {
        self.window = ThrottleWindow::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(50);

    fn send(throttler: &mut Throttler, left: i32, right: i32, now: Instant) -> Option<MotorCommand> {
        let command = throttler.offer_continuous_at(left, right, now)?;
        throttler.record_continuous(&command, now);
        Some(command)
    }

    #[test]
    fn test_first_value_is_sent() {
        let mut throttler = Throttler::new(INTERVAL);
        let now = Instant::now();
        assert_eq!(send(&mut throttler, 100, 200, now), Some(MotorCommand::new(100, 200, Aux::Neutral)));
        assert_eq!(throttler.last_sent(), Some((100, 200)));
    }

    #[test]
    fn test_duplicate_within_interval_is_sent_once() {
        let mut throttler = Throttler::new(INTERVAL);
        let now = Instant::now();
        let first = send(&mut throttler, 10, 10, now);
        let second = send(&mut throttler, 10, 10, now + Duration::from_millis(5));
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn test_duplicate_after_interval_is_suppressed() {
        let mut throttler = Throttler::new(INTERVAL);
        let now = Instant::now();
        assert!(send(&mut throttler, 10, 10, now).is_some());
        assert!(send(&mut throttler, 10, 10, now + INTERVAL * 3).is_none());
    }

    #[test]
    fn test_different_value_within_interval_is_dropped() {
        let mut throttler = Throttler::new(INTERVAL);
        let now = Instant::now();
        assert!(send(&mut throttler, 10, 10, now).is_some());
        assert!(send(&mut throttler, 20, 20, now + Duration::from_millis(49)).is_none());
        // dropped values are not queued; the window still holds the first value
        assert_eq!(throttler.last_sent(), Some((10, 10)));
    }

    #[test]
    fn test_spaced_different_values_always_emit() {
        let mut throttler = Throttler::new(INTERVAL);
        let mut now = Instant::now();
        for step in 1..20 {
            let emitted = send(&mut throttler, step, -step, now);
            assert_eq!(emitted, Some(MotorCommand::new(step, -step, Aux::Neutral)));
            now += INTERVAL;
        }
    }

    #[test]
    fn test_offer_does_not_touch_window() {
        let mut throttler = Throttler::new(INTERVAL);
        let now = Instant::now();
        send(&mut throttler, 300, 300, now);

        // offered but never recorded, as when the write fails
        assert!(throttler.offer_continuous_at(100, 100, now + INTERVAL).is_some());
        assert_eq!(throttler.last_sent(), Some((300, 300)));
        assert!(throttler.offer_continuous_at(100, 100, now + INTERVAL + Duration::from_millis(1)).is_some());
    }

    #[test]
    fn test_zero_is_sent_until_something_was_recorded() {
        let mut throttler = Throttler::new(INTERVAL);
        let now = Instant::now();
        assert!(throttler.offer_continuous_at(0, 0, now).is_some());

        throttler.record_stop();
        assert!(throttler.offer_continuous_at(0, 0, now).is_none());
    }

    #[test]
    fn test_recorded_stop_resets_dedup() {
        let mut throttler = Throttler::new(INTERVAL);
        let now = Instant::now();
        send(&mut throttler, 300, 300, now);

        assert_eq!(throttler.force_stop(), MotorCommand::STOP);
        assert_eq!(throttler.last_sent(), Some((300, 300)));
        throttler.record_stop();
        assert_eq!(throttler.last_sent(), Some((0, 0)));
        assert!(send(&mut throttler, 0, 0, now + INTERVAL).is_none());
        assert!(send(&mut throttler, 300, 300, now + INTERVAL * 2).is_some());
    }

    #[test]
    fn test_recorded_stop_keeps_rate_timer() {
        let mut throttler = Throttler::new(INTERVAL);
        let now = Instant::now();
        send(&mut throttler, 300, 300, now);
        throttler.record_stop();
        assert!(throttler.offer_continuous_at(200, 200, now + Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_offer_immediate_uses_last_values() {
        let mut throttler = Throttler::new(INTERVAL);
        assert_eq!(throttler.offer_immediate(Aux::StepDown), MotorCommand::new(0, 0, Aux::StepDown));

        send(&mut throttler, 120, -80, Instant::now());
        assert_eq!(throttler.offer_immediate(Aux::StepUp), MotorCommand::new(120, -80, Aux::StepUp));
        assert_eq!(throttler.offer_immediate(Aux::StepUp), MotorCommand::new(120, -80, Aux::StepUp));
        assert_eq!(throttler.last_sent(), Some((120, -80)));
    }

    #[test]
    fn test_reset_clears_interval() {
        let mut throttler = Throttler::new(INTERVAL);
        let now = Instant::now();
        send(&mut throttler, 1, 1, now);
        throttler.reset();
        assert_eq!(throttler.last_sent(), None);
        assert!(send(&mut throttler, 1, 1, now + Duration::from_millis(1)).is_some());
    }
}
