//! Per-account connection lifecycle.
//!
//! [`AccountConnection`] is a synchronous state machine; all IO happens in
//! the scheduler's tasks, which report back with the attempt id they were
//! started under. Reports from a superseded attempt are ignored, so a slow
//! connect finishing after the account was failed over cannot corrupt the
//! state.
//!
//! Failure accounting follows a flap rule: a successful attempt resets
//! the consecutive-failure count, but a connection that dies less than a
//! minute after it was established resumes the old series instead, so
//! the backoff table still engages under connect/drop flapping.

use crate::account::Account;
use crate::connection::Connection;
use crate::error::XmppError;
use crate::stanza::Stanza;

/// Host-side notifications. Implementations must not block; heavy work
/// belongs on the host's own executor.
pub trait ConnectionEvents: Send + Sync {
    /// One inbound stanza, `via` already set to the receiving full JID.
    fn on_stanza(&self, stanza: Stanza);

    fn on_connected(&self, _account_jid: &str, _full_jid: &str) {}

    fn on_connection_failed(&self, _account_jid: &str, _error: &XmppError) {}

    /// An established connection went away (EOF, idle timeout, failed
    /// send). Not emitted for attempts that never reached Connected.
    fn on_disconnected(&self, _account_jid: &str) {}
}

/// Reconnect backoff by consecutive failure count, in minutes. Indexed
/// with the count clamped to the last entry.
const BACKOFF_MINUTES: [u64; 12] = [0, 0, 1, 3, 5, 10, 15, 20, 30, 40, 50, 60];

/// How long a connection must hold before its death starts a fresh
/// backoff series instead of resuming the one from before the connect.
const FLAP_WINDOW_MS: u64 = 60_000;

pub fn backoff_ms(fail_count: u32) -> u64 {
    let index = (fail_count as usize).min(BACKOFF_MINUTES.len() - 1);
    BACKOFF_MINUTES[index] * 60_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Never attempted.
    Start,
    /// A connect attempt is in flight.
    Connecting,
    /// Holding a negotiated connection.
    Connected,
    /// Last attempt or connection failed; waiting out the backoff.
    Failed,
}

/// Outcome of reporting a finished attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The report was applied. Carries the connection being replaced, if
    /// any; the caller must close it.
    Applied(Option<Connection>),
    /// The report came from a superseded attempt and was ignored. Carries
    /// the new connection back for closing, if one was offered.
    Stale(Option<Connection>),
    /// The attempt failed but a still-usable connection from before it
    /// remains in place; the account is Connected again and the failure
    /// is swallowed.
    RolledBack,
}

#[derive(Debug)]
pub struct AccountConnection {
    account: Account,
    state: State,
    connection: Option<Connection>,
    attempt: u64,
    fail_count: u32,
    /// Failure count carried into the current Connected phase; a quick
    /// death resumes counting from here.
    fail_count_at_connect: u32,
    last_failure_ms: u64,
    connected_at_ms: u64,
}

impl AccountConnection {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            state: State::Start,
            connection: None,
            attempt: 0,
            fail_count: 0,
            fail_count_at_connect: 0,
            last_failure_ms: 0,
            connected_at_ms: 0,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Replace the account data (changed password or resource) without
    /// touching connection state; the new values apply from the next
    /// attempt.
    pub fn update_account(&mut self, account: Account) {
        self.account = account;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn full_jid(&self) -> Option<&str> {
        match self.state {
            State::Connected => self.connection.as_ref().map(|c| c.full_jid()),
            _ => None,
        }
    }

    /// Whether a new connect attempt may start at `now`.
    pub fn retry_due(&self, now_ms: u64) -> bool {
        match self.state {
            State::Start => true,
            State::Failed => now_ms >= self.last_failure_ms.saturating_add(backoff_ms(self.fail_count)),
            State::Connecting | State::Connected => false,
        }
    }

    /// Milliseconds until the next attempt is due. Zero when due now.
    pub fn retry_in_ms(&self, now_ms: u64) -> u64 {
        match self.state {
            State::Failed => self
                .last_failure_ms
                .saturating_add(backoff_ms(self.fail_count))
                .saturating_sub(now_ms),
            _ => 0,
        }
    }

    /// Move to Connecting and hand out the attempt id the eventual report
    /// must carry. Starting while already Connecting is refused; starting
    /// while Connected is allowed and keeps the old connection serving
    /// until the new one proves itself.
    pub fn begin_attempt(&mut self) -> Option<u64> {
        if self.state == State::Connecting {
            return None;
        }
        self.attempt += 1;
        self.state = State::Connecting;
        Some(self.attempt)
    }

    /// Report a successful attempt. The caller has already verified the
    /// connection by pushing initial presence through it.
    pub fn attempt_succeeded(
        &mut self,
        attempt: u64,
        connection: Connection,
        now_ms: u64,
    ) -> AttemptOutcome {
        if attempt != self.attempt || self.state != State::Connecting {
            return AttemptOutcome::Stale(Some(connection));
        }
        // Entering Connected with a dead stream would leave the account
        // unreachable until the idle check happens to notice; a caller
        // reporting success with one has a broken verification step.
        assert!(
            !connection.is_closed(),
            "attempt {attempt} reported success with a closed connection"
        );
        let old = self.connection.replace(connection);
        self.state = State::Connected;
        self.connected_at_ms = now_ms;
        self.fail_count_at_connect = self.fail_count;
        self.fail_count = 0;
        AttemptOutcome::Applied(old)
    }

    /// Report a failed attempt. An attempt begun while Connected rolls
    /// back to the held connection when that is still open; the failure
    /// is swallowed and the backoff series untouched.
    pub fn attempt_failed(&mut self, attempt: u64, now_ms: u64) -> AttemptOutcome {
        if attempt != self.attempt || self.state != State::Connecting {
            return AttemptOutcome::Stale(None);
        }
        if self.connection.as_ref().is_some_and(|c| !c.is_closed()) {
            self.state = State::Connected;
            return AttemptOutcome::RolledBack;
        }
        self.state = State::Failed;
        self.fail_count = self.fail_count.saturating_add(1);
        self.last_failure_ms = now_ms;
        // A held connection at this point is closed; hand it back for
        // final cleanup.
        AttemptOutcome::Applied(self.connection.take())
    }

    /// An established connection died. Returns it for closing.
    pub fn connection_lost(&mut self, now_ms: u64) -> Option<Connection> {
        if self.state != State::Connected {
            return None;
        }
        let uptime = now_ms.saturating_sub(self.connected_at_ms);
        self.fail_count = if uptime >= FLAP_WINDOW_MS {
            1
        } else {
            self.fail_count_at_connect.saturating_add(1)
        };
        self.last_failure_ms = now_ms;
        self.state = State::Failed;
        self.connection.take()
    }

    /// Tear down regardless of state (account removed). Returns the held
    /// connection for closing.
    pub fn shutdown(&mut self) -> Option<Connection> {
        // Bump the attempt counter so any in-flight attempt reports stale.
        self.attempt += 1;
        self.state = State::Failed;
        self.connection.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new("romeo@example.com", "pw", "balcony")
    }

    #[test]
    fn backoff_table_is_monotonic_and_clamped() {
        let mut previous = 0;
        for count in 0..20 {
            let backoff = backoff_ms(count);
            assert!(backoff >= previous, "backoff shrank at count {count}");
            previous = backoff;
        }
        assert_eq!(backoff_ms(0), 0);
        assert_eq!(backoff_ms(1), 0);
        assert_eq!(backoff_ms(2), 60_000);
        assert_eq!(backoff_ms(11), 60 * 60_000);
        assert_eq!(backoff_ms(100), 60 * 60_000);
    }

    #[test]
    fn fresh_account_is_due_immediately() {
        let ac = AccountConnection::new(account());
        assert_eq!(ac.state(), State::Start);
        assert!(ac.retry_due(0));
        assert!(ac.full_jid().is_none());
    }

    #[test]
    fn failed_attempts_grow_the_backoff() {
        let mut ac = AccountConnection::new(account());
        let mut now = 1_000_000;
        for expected_count in 1..=4u32 {
            let attempt = ac.begin_attempt().unwrap();
            now += 10;
            assert!(matches!(
                ac.attempt_failed(attempt, now),
                AttemptOutcome::Applied(None)
            ));
            assert_eq!(ac.fail_count(), expected_count);
            let backoff = backoff_ms(expected_count);
            if backoff > 0 {
                assert!(!ac.retry_due(now + backoff - 1));
            }
            assert!(ac.retry_due(now + backoff));
            now += backoff;
        }
    }

    #[test]
    fn begin_attempt_is_refused_while_connecting() {
        let mut ac = AccountConnection::new(account());
        ac.begin_attempt().unwrap();
        assert!(ac.begin_attempt().is_none());
        assert!(!ac.retry_due(u64::MAX));
    }

    #[test]
    fn stale_failure_report_is_ignored() {
        let mut ac = AccountConnection::new(account());
        let first = ac.begin_attempt().unwrap();
        // The first attempt is abandoned and a new one starts.
        ac.attempt_failed(first, 1_000);
        let second = ac.begin_attempt().unwrap();
        assert!(matches!(
            ac.attempt_failed(first, 2_000),
            AttemptOutcome::Stale(None)
        ));
        assert_eq!(ac.state(), State::Connecting);
        assert!(matches!(
            ac.attempt_failed(second, 3_000),
            AttemptOutcome::Applied(None)
        ));
        assert_eq!(ac.state(), State::Failed);
    }

    #[test]
    fn shutdown_invalidates_in_flight_attempts() {
        let mut ac = AccountConnection::new(account());
        let attempt = ac.begin_attempt().unwrap();
        assert!(ac.shutdown().is_none());
        assert!(matches!(
            ac.attempt_failed(attempt, 1_000),
            AttemptOutcome::Stale(None)
        ));
    }

    #[test]
    fn retry_in_ms_counts_down() {
        let mut ac = AccountConnection::new(account());
        for _ in 0..3 {
            let attempt = ac.begin_attempt().unwrap();
            ac.attempt_failed(attempt, 10_000);
        }
        // fail_count 3 -> 3 minutes.
        assert_eq!(ac.retry_in_ms(10_000), 180_000);
        assert_eq!(ac.retry_in_ms(100_000), 90_000);
        assert_eq!(ac.retry_in_ms(190_000), 0);
    }

    #[test]
    fn update_account_keeps_state() {
        let mut ac = AccountConnection::new(account());
        let attempt = ac.begin_attempt().unwrap();
        ac.attempt_failed(attempt, 1_000);
        let fail_count = ac.fail_count();
        ac.update_account(Account::new("romeo@example.com", "newpw", "balcony"));
        assert_eq!(ac.state(), State::Failed);
        assert_eq!(ac.fail_count(), fail_count);
        assert_eq!(ac.account().password, "newpw");
    }

    // The flap rule and success paths need a real Connection; they are
    // covered in the scheduler tests where a loopback connection exists.
}
