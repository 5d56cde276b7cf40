//! Poll loop driving both device cadences from one timer.
//!
//! The timer ticks at the shorter of the two intervals. Each tick services
//! exactly one cadence: the one furthest past its due time, JSON on a tie.
//! Only a successful poll moves a cadence's last poll time, so a failed one
//! stays overdue and is retried on the next tick.

use std::future::Future;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PollSettings;
use crate::error::{AppError, Result};
use crate::fetch::{Fetcher, INDEX_PATH, JSON_PATH};
use crate::ingest::Ingestor;
use crate::state::StateStore;
use crate::validate::ReadingValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Uninitialized,
    Bootstrapping,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Index,
    Json,
}

impl Cadence {
    pub fn path(self) -> &'static str {
        match self {
            Cadence::Index => INDEX_PATH,
            Cadence::Json => JSON_PATH,
        }
    }
}

/// Last successful poll per cadence, in ms since the scheduler was created.
#[derive(Debug, Clone, PartialEq)]
pub struct PollState {
    pub last_index_poll: Option<u64>,
    pub last_json_poll: Option<u64>,
    pub index_interval_ms: u64,
    pub json_interval_ms: u64,
}

impl PollState {
    pub fn new(index_interval: Duration, json_interval: Duration) -> Self {
        Self {
            last_index_poll: None,
            last_json_poll: None,
            index_interval_ms: index_interval.as_millis() as u64,
            json_interval_ms: json_interval.as_millis() as u64,
        }
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.index_interval_ms.min(self.json_interval_ms))
    }

    /// How far past its due time `cadence` is at `now`; negative when not due.
    pub fn overdue(&self, cadence: Cadence, now: u64) -> i64 {
        let (last, interval) = match cadence {
            Cadence::Index => (self.last_index_poll, self.index_interval_ms),
            Cadence::Json => (self.last_json_poll, self.json_interval_ms),
        };
        now as i64 - last.unwrap_or(0) as i64 - interval as i64
    }

    pub fn next_cadence(&self, now: u64) -> Cadence {
        if self.overdue(Cadence::Json, now) >= self.overdue(Cadence::Index, now) {
            Cadence::Json
        } else {
            Cadence::Index
        }
    }

    pub fn mark_polled(&mut self, cadence: Cadence, now: u64) {
        match cadence {
            Cadence::Index => self.last_index_poll = Some(now),
            Cadence::Json => self.last_json_poll = Some(now),
        }
    }
}

pub struct PollScheduler<S> {
    settings: PollSettings,
    ingestor: Ingestor<S>,
    fetcher: Option<Fetcher>,
    poll: PollState,
    state: SchedulerState,
    origin: Instant,
}

impl<S: StateStore> PollScheduler<S> {
    pub fn new(settings: PollSettings, store: S) -> Result<Self> {
        let ingestor = Ingestor::new(store, ReadingValidator::new(settings.max_watts))?;
        let poll = PollState::new(settings.index_interval, settings.json_interval);
        Ok(Self {
            settings,
            ingestor,
            fetcher: None,
            poll,
            state: SchedulerState::Uninitialized,
            origin: Instant::now(),
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn poll_state(&self) -> &PollState {
        &self.poll
    }

    pub fn ingestor(&self) -> &Ingestor<S> {
        &self.ingestor
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Validate settings and run the bootstrap index poll.
    ///
    /// Any failure leaves the scheduler `Stopped` and is returned; polling
    /// never begins.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SchedulerState::Uninitialized {
            return Err(AppError::Other(anyhow::anyhow!(
                "scheduler already started (state {:?})",
                self.state
            )));
        }

        let fetcher = match self
            .settings
            .validate()
            .and_then(|_| Fetcher::new(&self.settings.base_url, self.settings.request_timeout))
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "please configure the device settings");
                self.state = SchedulerState::Stopped;
                return Err(e);
            }
        };
        info!(
            base_url = %fetcher.base_url(),
            index_secs = self.settings.index_interval.as_secs(),
            json_secs = self.settings.json_interval.as_secs(),
            "starting poller"
        );
        self.fetcher = Some(fetcher);
        self.state = SchedulerState::Bootstrapping;

        if let Err(e) = self.ingestor.define_states() {
            warn!(error = %e, "failed to register state definitions");
        }

        if let Err(e) = self.poll_once(Cadence::Index).await {
            error!(error = %e, "bootstrap index poll failed");
            self.state = SchedulerState::Stopped;
            return Err(e);
        }

        self.state = SchedulerState::Running;
        info!(tick_ms = self.poll.tick_period().as_millis() as u64, "poller running");
        Ok(())
    }

    /// Fetch and apply one response; marks the cadence polled on success.
    pub async fn poll_once(&mut self, cadence: Cadence) -> Result<()> {
        if self.state == SchedulerState::Stopped {
            return Err(AppError::Other(anyhow::anyhow!("scheduler is stopped")));
        }
        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| AppError::Other(anyhow::anyhow!("scheduler not started")))?;

        let body = fetcher.fetch(cadence.path()).await?;
        let now = self.now_ms();
        match cadence {
            Cadence::Index => self.ingestor.handle_index(&body, now)?,
            Cadence::Json => self.ingestor.handle_json(&body, now)?,
        }
        self.poll.mark_polled(cadence, now);
        debug!(?cadence, now, "poll applied");
        Ok(())
    }

    /// Poll until `shutdown` resolves, then stop.
    ///
    /// A poll still in flight when `shutdown` resolves is dropped, so its
    /// result never reaches the store.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if self.state != SchedulerState::Running {
            warn!(state = ?self.state, "poll loop not started");
            self.stop();
            return;
        }

        let period = self.poll.tick_period();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let cadence = self.poll.next_cadence(self.now_ms());
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        res = self.poll_once(cadence) => {
                            if let Err(e) = res {
                                error!(?cadence, error = %e, "poll failed; will retry");
                            }
                        }
                    }
                }
            }
        }

        drop(ticker);
        self.stop();
    }

    /// Zero every power value and move to `Stopped`. Always completes.
    pub fn stop(&mut self) {
        if self.state != SchedulerState::Uninitialized {
            self.ingestor.zero_readings();
        }
        self.state = SchedulerState::Stopped;
        info!("poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_state(index_ms: u64, json_ms: u64) -> PollState {
        PollState::new(Duration::from_millis(index_ms), Duration::from_millis(json_ms))
    }

    #[test]
    fn test_tie_selects_json() {
        let mut ps = poll_state(10_000, 5_000);
        let now = 50_000;
        ps.mark_polled(Cadence::Index, now - 10_000);
        ps.mark_polled(Cadence::Json, now - 5_000);

        assert_eq!(ps.overdue(Cadence::Index, now), 0);
        assert_eq!(ps.overdue(Cadence::Json, now), 0);
        for _ in 0..3 {
            assert_eq!(ps.next_cadence(now), Cadence::Json);
        }
    }

    #[test]
    fn test_most_overdue_wins() {
        let mut ps = poll_state(10_000, 5_000);
        ps.mark_polled(Cadence::Index, 0);
        ps.mark_polled(Cadence::Json, 10_000);

        // index 5s late, json 0s late
        assert_eq!(ps.next_cadence(15_000), Cadence::Index);
        // json 1s late, index not due
        ps.mark_polled(Cadence::Index, 15_000);
        assert_eq!(ps.next_cadence(16_000), Cadence::Json);
    }

    #[test]
    fn test_never_polled_counts_from_zero() {
        let mut ps = poll_state(10_000, 5_000);
        ps.mark_polled(Cadence::Index, 0);
        assert_eq!(ps.overdue(Cadence::Json, 5_000), 0);
        assert_eq!(ps.next_cadence(5_000), Cadence::Json);
    }

    #[test]
    fn test_tick_period_is_shorter_interval() {
        assert_eq!(poll_state(60_000, 5_000).tick_period(), Duration::from_millis(5_000));
        assert_eq!(poll_state(2_000, 5_000).tick_period(), Duration::from_millis(2_000));
    }
}
