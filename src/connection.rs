//! Connection lifecycle as a pure state machine.
//!
//! [`ConnectionStatus::apply`] takes the current status and one input and
//! returns the next status plus the actions the driver has to perform. No
//! I/O or timers live here, which keeps the retry policy testable.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    ClosedPermanently,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential { max_delay: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed connections tolerated before giving up.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(3_000),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay } => {
                let shift = attempt.saturating_sub(1).min(16);
                self.delay
                    .checked_mul(1u32 << shift)
                    .unwrap_or(max_delay)
                    .min(max_delay)
            }
        }
    }
}

/// Signals for observers (status badges, toasts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// Open after at least one failed attempt.
    Restored,
    Lost { reason: String, attempt: u32 },
    /// First transport error since the last successful open.
    Error { reason: String },
    /// Retries used up; only an explicit `connect()` starts over.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `connect()` from the holder.
    Connect,
    /// The scheduled reconnect delay elapsed.
    RetryElapsed,
    Opened,
    Closed { reason: Option<String> },
    Errored { reason: String },
    /// `disconnect()` from the holder.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    OpenTransport,
    CloseTransport,
    ReplaySubscriptions,
    ScheduleReconnect(Duration),
    CancelReconnect,
    Emit(ConnectionEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Delay of the pending reconnect, if one is scheduled.
    pub backoff: Option<Duration>,
    error_reported: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_error: None,
            backoff: None,
            error_reported: false,
        }
    }
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    fn has_transport(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        )
    }

    pub fn apply(&self, input: Input, policy: &RetryPolicy) -> (ConnectionStatus, Vec<Action>) {
        let mut next = self.clone();
        let mut actions = Vec::new();

        match input {
            Input::Connect => {
                if self.has_transport() {
                    return (next, actions);
                }
                let exhausted = self.state == ConnectionState::ClosedPermanently
                    || self.attempts >= policy.max_attempts;
                if exhausted {
                    next.attempts = 0;
                    next.error_reported = false;
                }
                next.state = ConnectionState::Connecting;
                next.backoff = None;
                actions.push(Action::CancelReconnect);
                actions.push(Action::OpenTransport);
            }
            Input::RetryElapsed => {
                if self.state != ConnectionState::Disconnected || self.backoff.is_none() {
                    return (next, actions);
                }
                next.state = ConnectionState::Connecting;
                next.backoff = None;
                actions.push(Action::OpenTransport);
            }
            Input::Opened => {
                if self.state != ConnectionState::Connecting {
                    return (next, actions);
                }
                let restored = self.attempts > 0;
                next.state = ConnectionState::Open;
                next.attempts = 0;
                next.last_error = None;
                next.backoff = None;
                next.error_reported = false;
                actions.push(Action::ReplaySubscriptions);
                actions.push(Action::Emit(ConnectionEvent::Connected));
                if restored {
                    actions.push(Action::Emit(ConnectionEvent::Restored));
                }
            }
            Input::Closed { reason } => {
                if !self.has_transport() {
                    return (next, actions);
                }
                let reason = reason
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "Connection lost".to_string());
                next.attempts = self.attempts.saturating_add(1);
                next.last_error = Some(reason.clone());
                actions.push(Action::Emit(ConnectionEvent::Lost {
                    reason,
                    attempt: next.attempts,
                }));

                if next.attempts < policy.max_attempts {
                    let delay = policy.delay_for(next.attempts);
                    next.state = ConnectionState::Disconnected;
                    next.backoff = Some(delay);
                    actions.push(Action::ScheduleReconnect(delay));
                } else {
                    next.state = ConnectionState::ClosedPermanently;
                    next.backoff = None;
                    next.last_error = Some("Maximum reconnection attempts reached".to_string());
                    actions.push(Action::Emit(ConnectionEvent::Exhausted {
                        attempts: next.attempts,
                    }));
                }
            }
            Input::Errored { reason } => {
                if !self.has_transport() {
                    return (next, actions);
                }
                next.last_error = Some(reason.clone());
                if !self.error_reported {
                    next.error_reported = true;
                    actions.push(Action::Emit(ConnectionEvent::Error { reason }));
                }
            }
            Input::Disconnect => {
                actions.push(Action::CancelReconnect);
                if self.has_transport() {
                    actions.push(Action::CloseTransport);
                }
                next.state = ConnectionState::Disconnected;
                next.attempts = policy.max_attempts;
                next.backoff = None;
            }
        }

        (next, actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(status: &ConnectionStatus, input: Input) -> (ConnectionStatus, Vec<Action>) {
        status.apply(input, &RetryPolicy::default())
    }

    fn open() -> ConnectionStatus {
        let (status, _) = step(&ConnectionStatus::default(), Input::Connect);
        let (status, _) = step(&status, Input::Opened);
        status
    }

    fn close(status: &ConnectionStatus) -> (ConnectionStatus, Vec<Action>) {
        step(status, Input::Closed { reason: None })
    }

    #[test]
    fn connect_is_noop_while_open_or_connecting() {
        let status = open();
        let (next, actions) = step(&status, Input::Connect);
        assert_eq!(next, status);
        assert!(actions.is_empty());

        let (connecting, _) = step(&ConnectionStatus::default(), Input::Connect);
        let (_, actions) = step(&connecting, Input::Connect);
        assert!(actions.is_empty());
    }

    #[test]
    fn first_open_replays_without_restored_signal() {
        let (status, actions) = step(&ConnectionStatus::default(), Input::Connect);
        assert_eq!(status.state, ConnectionState::Connecting);
        assert!(actions.contains(&Action::OpenTransport));

        let (status, actions) = step(&status, Input::Opened);
        assert_eq!(status.state, ConnectionState::Open);
        assert_eq!(
            actions,
            vec![
                Action::ReplaySubscriptions,
                Action::Emit(ConnectionEvent::Connected)
            ]
        );
    }

    #[test]
    fn close_schedules_fixed_delay_and_reopen_restores() {
        let (status, actions) = close(&open());
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.attempts, 1);
        assert!(actions.contains(&Action::ScheduleReconnect(Duration::from_millis(3_000))));

        let (status, actions) = step(&status, Input::RetryElapsed);
        assert_eq!(status.state, ConnectionState::Connecting);
        assert_eq!(actions, vec![Action::OpenTransport]);

        let (status, actions) = step(&status, Input::Opened);
        assert_eq!(status.attempts, 0);
        assert!(actions.contains(&Action::Emit(ConnectionEvent::Restored)));
    }

    #[test]
    fn five_consecutive_closes_are_terminal() {
        let mut status = open();
        for attempt in 1..5 {
            let (next, actions) = close(&status);
            assert_eq!(next.state, ConnectionState::Disconnected, "attempt {attempt}");
            assert!(actions
                .iter()
                .any(|a| matches!(a, Action::ScheduleReconnect(_))));
            let (next, _) = step(&next, Input::RetryElapsed);
            status = next;
        }

        let (status, actions) = close(&status);
        assert_eq!(status.state, ConnectionState::ClosedPermanently);
        assert!(actions.contains(&Action::Emit(ConnectionEvent::Exhausted { attempts: 5 })));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::ScheduleReconnect(_) | Action::OpenTransport)));

        let (after, actions) = step(&status, Input::RetryElapsed);
        assert_eq!(after, status);
        assert!(actions.is_empty());

        let (status, actions) = step(&status, Input::Connect);
        assert_eq!(status.state, ConnectionState::Connecting);
        assert_eq!(status.attempts, 0);
        assert!(actions.contains(&Action::OpenTransport));
    }

    #[test]
    fn only_first_error_since_open_is_signalled() {
        let status = open();
        let (status, actions) = step(
            &status,
            Input::Errored {
                reason: "reset".into(),
            },
        );
        assert_eq!(status.state, ConnectionState::Open);
        assert_eq!(status.last_error.as_deref(), Some("reset"));
        assert_eq!(actions.len(), 1);

        let (status, actions) = step(
            &status,
            Input::Errored {
                reason: "reset again".into(),
            },
        );
        assert!(actions.is_empty());

        let (status, _) = close(&status);
        let (status, _) = step(&status, Input::RetryElapsed);
        let (_, actions) = step(
            &status,
            Input::Errored {
                reason: "refused".into(),
            },
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn disconnect_cancels_retry_and_blocks_reconnect() {
        let (status, _) = close(&open());
        assert!(status.backoff.is_some());

        let (status, actions) = step(&status, Input::Disconnect);
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.attempts, 5);
        assert_eq!(actions, vec![Action::CancelReconnect]);

        let (after, actions) = step(&status, Input::RetryElapsed);
        assert_eq!(after, status);
        assert!(actions.is_empty());

        let (again, _) = step(&status, Input::Disconnect);
        assert_eq!(again, status);
    }

    #[test]
    fn disconnect_closes_live_transport() {
        let (status, actions) = step(&open(), Input::Disconnect);
        assert_eq!(
            actions,
            vec![Action::CancelReconnect, Action::CloseTransport]
        );

        let (_, actions) = close(&status);
        assert!(actions.is_empty());
    }

    #[test]
    fn exponential_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            delay: Duration::from_millis(1_000),
            backoff: Backoff::Exponential {
                max_delay: Duration::from_millis(5_000),
            },
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(5_000));
    }
}
