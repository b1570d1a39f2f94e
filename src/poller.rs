use crate::dtu::{DtuClient, DtuConnector, TransportError};
use crate::metrics::{MetricRegistry, PollResult};
use crate::normalizer;
use crate::session::{Obtained, Session, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};

pub const HANDSHAKE_BACKOFF_SECS: u64 = 15; //after a failed session establishment
pub const TRANSPORT_BACKOFF_SECS: u64 = 10; //after a failed data request
pub const STATS_DUMP_INTERVAL_SECS: u64 = 3600; //secs between showing stats

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    NoSession,
    Polling,
    BackoffShort,
    BackoffLong,
}

/// Outcome of a failed data request.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("DTU returned no data")]
    SoftMiss,
    #[error("DTU payloads are encrypted, decryption is not supported")]
    EncryptionUnsupported,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone, Debug)]
pub struct PollTiming {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// consecutive soft misses that force a new session, 0 = never
    pub max_soft_misses: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollStats {
    pub poll_ok: u64,
    pub soft_misses: u64,
    pub poll_errors: u64,
    pub handshake_errors: u64,
}

pub struct Poller<K: DtuConnector> {
    pub name: String,
    manager: SessionManager<K>,
    metrics: Arc<MetricRegistry>,
    timing: PollTiming,
    shutdown: watch::Receiver<bool>,
    session: Option<Session<K::Client>>,
    state: PollState,
    consecutive_soft_misses: u32,
    //session already reported as unreadable
    unsupported_session: Option<u64>,
    stats: PollStats,
    stats_interval: Instant,
}

impl<K: DtuConnector> Poller<K> {
    pub fn new(
        name: String,
        manager: SessionManager<K>,
        metrics: Arc<MetricRegistry>,
        timing: PollTiming,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name,
            manager,
            metrics,
            timing,
            shutdown,
            session: None,
            state: PollState::NoSession,
            consecutive_soft_misses: 0,
            unsupported_session: None,
            stats: PollStats::default(),
            stats_interval: Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> Option<&Session<K::Client>> {
        self.session.as_ref()
    }

    #[cfg(test)]
    pub fn stats(&self) -> PollStats {
        self.stats
    }

    fn terminated(&self) -> bool {
        //a dropped sender counts as a termination request
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Sleeps for `duration`, waking early on termination request.
    async fn pause(&mut self, duration: Duration) {
        if self.terminated() {
            return;
        }
        let shutdown = &mut self.shutdown;
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
    }

    /// Performs a single state transition and returns the new state.
    pub async fn step(&mut self) -> PollState {
        let next = match self.state {
            PollState::NoSession => self.connect().await,
            PollState::Polling => self.poll().await,
            PollState::BackoffShort => {
                self.pause(Duration::from_secs(HANDSHAKE_BACKOFF_SECS)).await;
                PollState::NoSession
            }
            PollState::BackoffLong => {
                self.pause(Duration::from_secs(TRANSPORT_BACKOFF_SECS)).await;
                PollState::NoSession
            }
        };
        self.state = next;
        next
    }

    async fn connect(&mut self) -> PollState {
        match self.manager.obtain(self.session.take()).await {
            Ok(Obtained::Reused(session)) => {
                self.session = Some(session);
                PollState::Polling
            }
            Ok(Obtained::Established(session)) => {
                self.consecutive_soft_misses = 0;
                let negotiated = session.negotiated();
                self.session = Some(session);
                if negotiated {
                    self.metrics.record_handshake(true);
                    let settle = self.manager.settle_delay();
                    debug!("{}: waiting {:?} for the DTU to settle", self.name, settle);
                    self.pause(settle).await;
                }
                PollState::Polling
            }
            Err(e) => {
                self.stats.handshake_errors += 1;
                self.metrics.record_handshake(false);
                error!(
                    "{}: {}, retrying in {} s",
                    self.name, e, HANDSHAKE_BACKOFF_SECS
                );
                PollState::BackoffShort
            }
        }
    }

    /// One data request; publishes only when a complete payload arrived.
    async fn fetch_and_publish(
        session: &mut Session<K::Client>,
        metrics: &MetricRegistry,
        limit: Duration,
    ) -> std::result::Result<usize, PollError> {
        let raw = match timeout(limit, session.client_mut().fetch_real_data(limit)).await {
            Ok(Err(TransportError::EncryptionUnsupported)) => {
                return Err(PollError::EncryptionUnsupported)
            }
            Ok(res) => res?,
            Err(_) => return Err(TransportError::Timeout(limit).into()),
        };
        let reading = match raw {
            Some(raw) => normalizer::normalize(&raw),
            None => return Err(PollError::SoftMiss),
        };
        if reading.is_empty() {
            return Err(PollError::SoftMiss);
        }
        metrics.publish(&reading);
        Ok(reading.inverters.len() + reading.panels.len())
    }

    async fn poll(&mut self) -> PollState {
        let session = match self.session.as_mut() {
            Some(s) if s.is_ready() => s,
            _ => return PollState::NoSession,
        };
        let session_id = session.id();

        match Self::fetch_and_publish(session, &self.metrics, self.timing.timeout).await {
            Ok(records) => {
                self.stats.poll_ok += 1;
                self.consecutive_soft_misses = 0;
                self.metrics.record_poll(PollResult::Ok);
                debug!("{}: published {} records", self.name, records);
                self.pause(self.timing.poll_interval).await;
                PollState::Polling
            }
            Err(PollError::SoftMiss) => {
                self.stats.soft_misses += 1;
                self.consecutive_soft_misses += 1;
                self.metrics.record_poll(PollResult::SoftMiss);
                warn!(
                    "{}: session #{}: no data from DTU ({} in a row)",
                    self.name, session_id, self.consecutive_soft_misses
                );
                let limit = self.timing.max_soft_misses;
                if limit > 0 && self.consecutive_soft_misses >= limit {
                    warn!(
                        "{}: {} empty responses in a row, rebuilding session",
                        self.name, self.consecutive_soft_misses
                    );
                    self.drop_session();
                    return PollState::BackoffLong;
                }
                self.pause(self.timing.poll_interval).await;
                PollState::Polling
            }
            Err(PollError::EncryptionUnsupported) => {
                //permanent for this device, the session is kept
                self.stats.poll_errors += 1;
                self.metrics.record_poll(PollResult::TransportError);
                if self.unsupported_session != Some(session_id) {
                    self.unsupported_session = Some(session_id);
                    error!(
                        "{}: session #{}: {}, no data will be published",
                        self.name,
                        session_id,
                        PollError::EncryptionUnsupported
                    );
                }
                self.pause(self.timing.poll_interval).await;
                PollState::Polling
            }
            Err(e) => {
                self.stats.poll_errors += 1;
                self.metrics.record_poll(PollResult::TransportError);
                error!(
                    "{}: session #{}: {}, reconnecting in {} s",
                    self.name, session_id, e, TRANSPORT_BACKOFF_SECS
                );
                self.drop_session();
                PollState::BackoffLong
            }
        }
    }

    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.session = Some(self.manager.invalidate(session));
        }
    }

    fn dump_stats(&mut self, force: bool) {
        if force || self.stats_interval.elapsed() > Duration::from_secs(STATS_DUMP_INTERVAL_SECS) {
            self.stats_interval = Instant::now();
            info!(
                "{}: 📊 DTU query statistics: ok: {}, no data: {}, errors: {}, handshake errors: {}, sessions: {}",
                self.name,
                self.stats.poll_ok,
                self.stats.soft_misses,
                self.stats.poll_errors,
                self.stats.handshake_errors,
                self.manager.sessions_created(),
            );
        }
    }

    pub async fn worker(&mut self) -> Result<()> {
        info!("{}: Starting task", self.name);
        loop {
            if self.terminated() {
                debug!("{}: Got terminate signal from main", self.name);
                break;
            }
            self.step().await;
            self.dump_stats(false);
        }
        self.dump_stats(true);
        info!("{}: task stopped", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtu::{DeviceInfo, RawReading, SgsRecord, DFS_ENCRYPTION_BIT};
    use crate::session::tests::{manager, plain_device, HandshakeReply, MockConnector, Reply, Script};
    use crate::session::{EncryptionConfig, SessionStatus};

    fn timing() -> PollTiming {
        PollTiming {
            poll_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            max_soft_misses: 0,
        }
    }

    fn data(voltage: i64) -> RawReading {
        RawReading {
            sgs_data: vec![SgsRecord {
                serial_number: Some("SN1".into()),
                voltage: Some(voltage),
                ..SgsRecord::default()
            }],
            pv_data: vec![],
        }
    }

    fn poller(
        script: &Script,
        encryption: EncryptionConfig,
        timing: PollTiming,
    ) -> (Poller<MockConnector>, Arc<MetricRegistry>, watch::Sender<bool>) {
        let metrics = Arc::new(MetricRegistry::new().unwrap());
        let (tx, rx) = watch::channel(false);
        let poller = Poller::new(
            "test".into(),
            manager(script, encryption),
            metrics.clone(),
            timing,
            rx,
        );
        (poller, metrics, tx)
    }

    fn voltage(metrics: &MetricRegistry) -> Option<f64> {
        let text = metrics.render().unwrap();
        text.lines()
            .find(|l| l.starts_with("hoymiles_sgs_voltage{"))
            .and_then(|l| l.rsplit(' ').next())
            .and_then(|v| v.parse().ok())
    }

    #[tokio::test(start_paused = true)]
    async fn polls_and_publishes() {
        let script = Script::default();
        {
            let mut state = script.state();
            state.handshakes.push_back(HandshakeReply::Info(plain_device()));
            state.fetches.push_back(Reply::Data(data(2300)));
        }
        let (mut poller, metrics, _tx) = poller(&script, EncryptionConfig::AutoNegotiate, timing());

        let started = Instant::now();
        assert_eq!(poller.step().await, PollState::Polling);
        //settle delay after the handshake
        assert!(started.elapsed() >= Duration::from_secs(5));

        assert_eq!(poller.step().await, PollState::Polling);
        assert_eq!(voltage(&metrics), Some(230.0));
        assert_eq!(poller.stats().poll_ok, 1);
        assert!(started.elapsed() >= Duration::from_secs(65));
    }

    #[tokio::test(start_paused = true)]
    async fn soft_misses_keep_session_until_transport_failure() {
        let script = Script::default();
        {
            let mut state = script.state();
            state.handshakes.push_back(HandshakeReply::Info(plain_device()));
            state.handshakes.push_back(HandshakeReply::Info(plain_device()));
            state.fetches.push_back(Reply::Empty);
            state.fetches.push_back(Reply::Empty);
            state.fetches.push_back(Reply::Empty);
            state.fetches.push_back(Reply::Hang);
        }
        let (mut poller, metrics, _tx) = poller(&script, EncryptionConfig::AutoNegotiate, timing());

        assert_eq!(poller.step().await, PollState::Polling);
        let first_id = poller.session().unwrap().id();

        for _ in 0..3 {
            assert_eq!(poller.step().await, PollState::Polling);
            assert_eq!(poller.session().unwrap().id(), first_id);
        }
        {
            let state = script.state();
            assert_eq!(state.handshake_calls, 1);
            assert_eq!(state.connects, 1);
            assert_eq!(state.fetch_calls, 3);
        }
        assert_eq!(voltage(&metrics), None);

        //fourth cycle times out
        assert_eq!(poller.step().await, PollState::BackoffLong);
        assert_eq!(
            poller.session().unwrap().status(),
            SessionStatus::Invalid
        );
        assert_eq!(poller.step().await, PollState::NoSession);
        assert_eq!(poller.step().await, PollState::Polling);

        let state = script.state();
        assert_eq!(state.handshake_calls, 2);
        assert_eq!(state.connects, 2);
        assert_ne!(poller.session().unwrap().id(), first_id);
        assert_eq!(poller.stats().soft_misses, 3);
        assert_eq!(poller.stats().poll_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_failure_backs_off_and_retries() {
        let script = Script::default();
        {
            let mut state = script.state();
            state.handshakes.push_back(HandshakeReply::Fail);
            state.handshakes.push_back(HandshakeReply::Empty);
            state.handshakes.push_back(HandshakeReply::Info(plain_device()));
        }
        let (mut poller, _metrics, _tx) = poller(&script, EncryptionConfig::AutoNegotiate, timing());

        let started = Instant::now();
        assert_eq!(poller.step().await, PollState::BackoffShort);
        assert!(poller.session().is_none());
        assert_eq!(poller.step().await, PollState::NoSession);
        assert!(started.elapsed() >= Duration::from_secs(15));

        assert_eq!(poller.step().await, PollState::BackoffShort);
        assert!(poller.session().is_none());
        assert_eq!(poller.step().await, PollState::NoSession);

        assert_eq!(poller.step().await, PollState::Polling);
        assert!(poller.session().unwrap().is_ready());
        assert_eq!(script.state().handshake_calls, 3);
        assert_eq!(poller.stats().handshake_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_rebuilds_preshared_session() {
        let script = Script::default();
        {
            let mut state = script.state();
            state.fetches.push_back(Reply::Fail);
            state.fetches.push_back(Reply::Data(data(2310)));
        }
        let (mut poller, metrics, _tx) =
            poller(&script, EncryptionConfig::PresharedKey(vec![1; 16]), timing());

        let started = Instant::now();
        assert_eq!(poller.step().await, PollState::Polling);
        //no settle delay without a handshake
        assert!(started.elapsed() < Duration::from_secs(5));
        let first_id = poller.session().unwrap().id();

        assert_eq!(poller.step().await, PollState::BackoffLong);
        assert_eq!(poller.step().await, PollState::NoSession);
        assert_eq!(poller.step().await, PollState::Polling);
        assert_ne!(poller.session().unwrap().id(), first_id);
        assert_eq!(script.state().connects, 2);
        assert_eq!(script.state().handshake_calls, 0);

        assert_eq!(poller.step().await, PollState::Polling);
        assert_eq!(voltage(&metrics), Some(231.0));
    }

    #[tokio::test(start_paused = true)]
    async fn soft_miss_threshold_forces_new_session() {
        let script = Script::default();
        {
            let mut state = script.state();
            state.fetches.push_back(Reply::Empty);
            state.fetches.push_back(Reply::Data(RawReading::default()));
        }
        let timing = PollTiming {
            max_soft_misses: 2,
            ..timing()
        };
        let (mut poller, _metrics, _tx) = poller(&script, EncryptionConfig::NoEncryption, timing);

        assert_eq!(poller.step().await, PollState::Polling);
        assert_eq!(poller.step().await, PollState::Polling);
        //a payload without records is a soft miss as well
        assert_eq!(poller.step().await, PollState::BackoffLong);
        assert_eq!(
            poller.session().unwrap().status(),
            SessionStatus::Invalid
        );
    }

    #[tokio::test(start_paused = true)]
    async fn encrypted_device_keeps_its_session() {
        let script = Script::default();
        {
            let mut state = script.state();
            state.handshakes.push_back(HandshakeReply::Info(DeviceInfo {
                serial_number: Some("4143A0123456".into()),
                dfs: Some(1 << DFS_ENCRYPTION_BIT),
                enc_rand: Some(vec![0x5a; 16]),
            }));
            for _ in 0..10 {
                state.fetches.push_back(Reply::Unsupported);
            }
        }
        let (mut poller, metrics, _tx) = poller(&script, EncryptionConfig::AutoNegotiate, timing());

        let started = Instant::now();
        assert_eq!(poller.step().await, PollState::Polling);
        let first_id = poller.session().unwrap().id();
        for _ in 0..10 {
            assert_eq!(poller.step().await, PollState::Polling);
            assert!(poller.session().unwrap().is_ready());
            assert_eq!(poller.session().unwrap().id(), first_id);
        }
        assert!(started.elapsed() >= Duration::from_secs(600));

        let state = script.state();
        assert_eq!(state.handshake_calls, 1);
        assert_eq!(state.connects, 1);
        assert_eq!(state.fetch_calls, 10);
        assert_eq!(poller.stats().poll_errors, 10);
        assert_eq!(voltage(&metrics), None);
    }

    #[tokio::test(start_paused = true)]
    async fn records_without_serial_are_a_soft_miss() {
        let script = Script::default();
        script.state().fetches.push_back(Reply::Data(RawReading {
            sgs_data: vec![SgsRecord {
                voltage: Some(2300),
                ..SgsRecord::default()
            }],
            pv_data: vec![],
        }));
        let (mut poller, metrics, _tx) = poller(&script, EncryptionConfig::NoEncryption, timing());

        assert_eq!(poller.step().await, PollState::Polling);
        assert_eq!(poller.step().await, PollState::Polling);
        assert_eq!(poller.stats().soft_misses, 1);
        assert_eq!(poller.stats().poll_ok, 0);
        assert_eq!(voltage(&metrics), None);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_stops_on_shutdown() {
        let script = Script::default();
        let (mut poller, _metrics, tx) = poller(&script, EncryptionConfig::NoEncryption, timing());

        let handle = tokio::spawn(async move {
            poller.worker().await.unwrap();
            poller.stats()
        });
        tokio::time::sleep(Duration::from_secs(130)).await;
        tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        //empty replies at 0 s, 60 s and 120 s
        assert_eq!(stats.soft_misses, 3);
    }
}
