//! UDS request/response handling on top of one ISO-TP channel

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{RetryPolicy, SecurityState, SessionError, SessionLevel, SessionState};
use crate::address::ModuleEndpoint;
use crate::config::{AdapterOptions, SessionConfig};
use crate::isotp::{ChannelError, IsoTpChannel};
use crate::transport::{AdapterTransport, TransportError};
use crate::uds::{
    service_id, NegativeResponseCode, PositiveResponse, UdsOutcome, UdsRequest, UdsResponse,
};

/// Exclusive UDS client for whichever module is currently targeted
pub struct UdsSession<T> {
    channel: IsoTpChannel<T>,
    config: SessionConfig,
    retry: RetryPolicy,
    state: SessionState,
    target: Option<ModuleEndpoint>,
}

impl<T: AdapterTransport> UdsSession<T> {
    pub fn new(mut channel: IsoTpChannel<T>, config: SessionConfig) -> Self {
        channel.set_reply_timeout(config.response_timeout());
        let retry = RetryPolicy::from(&config.retry);
        Self {
            channel,
            config,
            retry,
            state: SessionState::new(),
            target: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn target(&self) -> Option<&ModuleEndpoint> {
        self.target.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn channel(&self) -> &IsoTpChannel<T> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut IsoTpChannel<T> {
        &mut self.channel
    }

    /// Retarget the session. A different module starts from the default session.
    pub fn select(&mut self, endpoint: &ModuleEndpoint) {
        if self
            .target
            .as_ref()
            .is_some_and(|current| current.same_address(endpoint))
        {
            return;
        }
        if self.state.level() != SessionLevel::Default {
            debug!(
                from = ?self.target.as_ref().map(|t| &t.name),
                to = %endpoint.name,
                "Leaving non-default session behind"
            );
        }
        self.state.reset();
        self.channel.discard_pending();
        self.target = Some(endpoint.clone());
    }

    fn require_target(&self) -> Result<ModuleEndpoint, SessionError> {
        self.target.clone().ok_or(SessionError::NoTarget)
    }

    /// Re-run adapter initialization; the ECU side is assumed back in default
    pub async fn reset_adapter(&mut self, options: &AdapterOptions) -> Result<(), SessionError> {
        self.state.reset();
        match self.channel.reset(options).await {
            Ok(()) => {
                info!(bus = %options.bus, "Adapter reset, session state back to default");
                Ok(())
            }
            Err(ChannelError::Transport(source)) if source.is_fatal() => {
                Err(SessionError::LinkLost(source))
            }
            Err(ChannelError::Transport(source)) => Err(SessionError::Adapter(source)),
            Err(other) => Err(SessionError::Malformed(other.to_string())),
        }
    }

    /// Send a request and classify the answer.
    ///
    /// Only a lost link is an error; every other failure below this layer
    /// comes back as `NoResponse` or `MalformedFrame`. A ResponsePending is
    /// waited out by listening; the request goes out again only when the ECU
    /// asks for it (busyRepeatRequest) or when the final answer never came
    /// and the request is safe to repeat.
    pub async fn request(
        &mut self,
        request: &UdsRequest,
        endpoint: &ModuleEndpoint,
    ) -> Result<UdsResponse, SessionError> {
        self.select(endpoint);
        let payload = request.encode();
        let started = Instant::now();
        let mut attempt = 1u32;

        loop {
            debug!(
                module = %endpoint.name,
                request_id = format!("0x{:03X}", endpoint.request_id),
                request = %request,
                attempt,
                "UDS request"
            );

            if let Err(err) = self.channel.send(&payload, endpoint).await {
                return self.fold_channel_error(request, err);
            }

            if request.suppresses_response() {
                self.state.touch();
                return Ok(UdsResponse::no_response());
            }

            let reply_timeout = self.config.response_timeout();
            let mut response = self.collect(request, reply_timeout).await?;
            let mut was_pending = false;
            while response.is_response_pending() {
                was_pending = true;
                if started.elapsed() >= self.config.pending_budget() {
                    warn!(
                        module = %endpoint.name,
                        request = %request,
                        attempt,
                        "Response still pending, giving up"
                    );
                    return Ok(UdsResponse::no_response());
                }
                debug!(module = %endpoint.name, "Response pending, listening for the answer");
                response = self.await_final_answer(request).await?;
            }

            let repeat = match response.nrc() {
                Some(NegativeResponseCode::BusyRepeatRequest) => true,
                _ if was_pending && response.is_no_response() => {
                    if !request.is_idempotent() {
                        warn!(
                            module = %endpoint.name,
                            request = %request,
                            "Pending request never answered, not repeating it"
                        );
                    }
                    request.is_idempotent() && started.elapsed() < self.config.pending_budget()
                }
                _ => false,
            };
            if !repeat || !self.retry.allows_retry(attempt) {
                return Ok(response);
            }
            warn!(module = %endpoint.name, request = %request, attempt, "Repeating request");

            tokio::time::sleep(self.retry.delay(attempt)).await;
            attempt += 1;
        }
    }

    /// Listen for what follows a ResponsePending without sending anything
    async fn await_final_answer(&mut self, request: &UdsRequest) -> Result<UdsResponse, SessionError> {
        let timeout = self.config.response_pending_timeout();
        if self.channel.pending_frames() == 0 {
            if let Err(err) = self.channel.listen(timeout).await {
                return self.fold_channel_error(request, err);
            }
        }
        self.collect(request, timeout).await
    }

    /// Drain the channel for one answer, skipping pending notices the real answer already followed
    async fn collect(
        &mut self,
        request: &UdsRequest,
        timeout: std::time::Duration,
    ) -> Result<UdsResponse, SessionError> {
        loop {
            let response = match self.channel.receive(timeout).await {
                Ok(message) => UdsResponse::classify(request, &message.payload),
                Err(err) => return self.fold_channel_error(request, err),
            };
            if response.confirms_presence() {
                self.state.touch();
            }
            if response.is_response_pending() && self.channel.pending_frames() > 0 {
                debug!("Response pending, answer already buffered");
                continue;
            }
            return Ok(response);
        }
    }

    fn fold_channel_error(
        &mut self,
        request: &UdsRequest,
        err: ChannelError,
    ) -> Result<UdsResponse, SessionError> {
        match err {
            ChannelError::Transport(source) if source.is_fatal() => {
                Err(SessionError::LinkLost(source))
            }
            ChannelError::Timeout(kind) => {
                debug!(request = %request, %kind, "No response");
                Ok(UdsResponse::no_response())
            }
            ChannelError::Transport(TransportError::Timeout { .. }) => {
                Ok(UdsResponse::no_response())
            }
            other => {
                warn!(request = %request, error = %other, "Exchange failed");
                Ok(UdsResponse::malformed(other.to_string(), Vec::new()))
            }
        }
    }

    /// Change the diagnostic session of the selected module
    pub async fn enter_session(&mut self, level: SessionLevel) -> Result<(), SessionError> {
        let endpoint = self.require_target()?;
        if self.state.level() == level {
            debug!(module = %endpoint.name, %level, "Already in requested session");
            return Ok(());
        }

        let request = UdsRequest::diagnostic_session_control(level.sub_function());
        let response = self.request(&request, &endpoint).await?;
        match response.outcome {
            UdsOutcome::Positive(_) => {
                self.state.enter(level);
                info!(module = %endpoint.name, %level, "Session changed (security re-locked)");
                Ok(())
            }
            UdsOutcome::Negative { nrc, .. }
                if level != SessionLevel::Default
                    && matches!(
                        nrc,
                        NegativeResponseCode::ServiceNotSupported
                            | NegativeResponseCode::SubFunctionNotSupported
                            | NegativeResponseCode::SubFunctionNotSupportedInActiveSession
                    ) =>
            {
                info!(module = %endpoint.name, %level, %nrc, "Session not offered");
                Err(SessionError::ExtendedSessionUnavailable {
                    module: endpoint.name,
                    level,
                })
            }
            outcome => Err(outcome_error(service_id::DIAGNOSTIC_SESSION_CONTROL, outcome)),
        }
    }

    /// Service the TesterPresent cadence. Call between requests.
    pub async fn keep_alive(&mut self) -> Result<(), SessionError> {
        if self.state.level() == SessionLevel::Default {
            return Ok(());
        }

        let keepalive = &self.config.keepalive;
        let idle = self.state.idle();
        if idle.as_millis() > u128::from(keepalive.s3_timeout_ms) {
            warn!(
                idle_ms = idle.as_millis() as u64,
                "S3 timeout lapsed, assuming ECU is back in default session"
            );
            self.state.reset();
            return Ok(());
        }
        if !keepalive.enabled || idle.as_millis() < u128::from(keepalive.interval_ms) {
            return Ok(());
        }

        let Some(endpoint) = self.target.clone() else {
            return Ok(());
        };
        let request = UdsRequest::tester_present(keepalive.suppress_response);
        let response = self.request(&request, &endpoint).await?;
        if !request.suppresses_response() && !response.is_positive() {
            warn!(module = %endpoint.name, outcome = ?response.outcome, "Tester present not acknowledged");
        }
        Ok(())
    }

    /// SecurityAccess requestSeed. An empty result means the ECU is already unlocked.
    pub async fn request_seed(&mut self, level: u8) -> Result<Vec<u8>, SessionError> {
        let endpoint = self.require_target()?;
        let response = self
            .request(&UdsRequest::security_access_seed(level), &endpoint)
            .await?;
        let seed = expect_positive(service_id::SECURITY_ACCESS, response)?
            .record()
            .to_vec();

        if seed.iter().all(|&b| b == 0) {
            debug!(level, "Security already unlocked (zero seed)");
            self.state.security = SecurityState::Unlocked { level };
            return Ok(Vec::new());
        }

        info!(level, seed_len = seed.len(), "Security seed requested");
        self.state.security = SecurityState::SeedIssued {
            level,
            seed: seed.clone(),
        };
        Ok(seed)
    }

    /// SecurityAccess sendKey for the seed issued at `level`
    pub async fn send_key(&mut self, level: u8, key: &[u8]) -> Result<(), SessionError> {
        let endpoint = self.require_target()?;
        match &self.state.security {
            SecurityState::SeedIssued { level: issued, .. } if *issued == level => {}
            SecurityState::SeedIssued { level: issued, .. } => {
                return Err(SessionError::SecurityAccessFailed(format!(
                    "Level mismatch: seed issued for {}, key sent for {}",
                    issued, level
                )))
            }
            _ => {
                return Err(SessionError::SecurityAccessFailed(
                    "No pending seed - request a seed first".to_string(),
                ))
            }
        }

        let response = self
            .request(&UdsRequest::security_access_key(level, key), &endpoint)
            .await?;
        match response.outcome {
            UdsOutcome::Positive(_) => {
                self.state.security = SecurityState::Unlocked { level };
                info!(module = %endpoint.name, level, "Security access granted");
                Ok(())
            }
            UdsOutcome::Negative { nrc, .. } => {
                self.state.security = SecurityState::Locked;
                Err(SessionError::SecurityAccessFailed(format!(
                    "Key rejected: {} (0x{:02X})",
                    nrc, nrc
                )))
            }
            outcome => Err(outcome_error(service_id::SECURITY_ACCESS, outcome)),
        }
    }

    /// Seed, derive, key. The key algorithm is supplied by the caller.
    pub async fn unlock<F>(&mut self, level: u8, derive: F) -> Result<(), SessionError>
    where
        F: Fn(&[u8]) -> Vec<u8>,
    {
        let seed = self.request_seed(level).await?;
        if seed.is_empty() {
            return Ok(());
        }
        let key = derive(&seed);
        self.send_key(level, &key).await
    }
}

fn expect_positive(service: u8, response: UdsResponse) -> Result<PositiveResponse, SessionError> {
    match response.outcome {
        UdsOutcome::Positive(positive) => Ok(positive),
        outcome => Err(outcome_error(service, outcome)),
    }
}

fn outcome_error(service: u8, outcome: UdsOutcome) -> SessionError {
    match outcome {
        UdsOutcome::Negative { service, nrc } => SessionError::Rejected { service, nrc },
        UdsOutcome::NoResponse => SessionError::NoResponse { service },
        UdsOutcome::MalformedFrame { reason } => SessionError::Malformed(reason),
        UdsOutcome::Positive(_) => SessionError::Malformed(format!(
            "unexpected positive response to service 0x{:02X}",
            service
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::address::Bus;
    use crate::config::{IsoTpConfig, MockConfig};
    use crate::transport::{MockAdapter, MockHandle, SimulatedEcu};
    use pretty_assertions::assert_eq;

    fn pcm() -> ModuleEndpoint {
        ModuleEndpoint::new("PCM", 0x7E0, 0x7E8, Bus::Hs)
    }

    fn session_over(adapter: MockAdapter) -> (UdsSession<MockAdapter>, MockHandle) {
        let handle = adapter.handle();
        let channel = IsoTpChannel::new(adapter, IsoTpConfig::default());
        (UdsSession::new(channel, SessionConfig::default()), handle)
    }

    fn demo() -> (UdsSession<MockAdapter>, MockHandle) {
        session_over(MockAdapter::demo_vehicle(&MockConfig::default()))
    }

    fn xor_key(seed: &[u8]) -> Vec<u8> {
        seed.iter().map(|b| b ^ 0xFF).collect()
    }

    #[tokio::test]
    async fn test_positive_read() {
        let (mut session, _) = demo();
        let response = session
            .request(&UdsRequest::read_data_by_identifier(0x0100), &pcm())
            .await
            .unwrap();
        assert_eq!(response.positive().unwrap().record(), &[0x0C]);
        assert_eq!(response.raw, vec![0x62, 0x01, 0x00, 0x0C]);
    }

    #[tokio::test]
    async fn test_pending_answer_in_same_exchange() {
        let (mut session, handle) = demo();
        let abs = ModuleEndpoint::new("ABS", 0x760, 0x768, Bus::Hs);
        let response = session
            .request(&UdsRequest::read_data_by_identifier(0x2B00), &abs)
            .await
            .unwrap();
        assert_eq!(response.positive().unwrap().record(), &[0x01, 0x90]);
        assert_eq!(handle.frame_commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endless_pending_is_bounded() {
        let ecu = SimulatedEcu::new("PCM", 0x7E0, Bus::Hs, |request| {
            vec![vec![0x7F, request[0], 0x78]]
        });
        let (mut session, handle) =
            session_over(MockAdapter::new(&MockConfig::default()).with_ecu(ecu));

        let response = session
            .request(&UdsRequest::read_data_by_identifier(0x0100), &pcm())
            .await
            .unwrap();
        assert!(response.is_no_response());
        assert_eq!(handle.frame_commands().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_routine_start_is_sent_once() {
        let ecu = SimulatedEcu::new("PCM", 0x7E0, Bus::Hs, |request| match request {
            [0x31, ..] => vec![vec![0x7F, 0x31, 0x78]],
            _ => Vec::new(),
        });
        let (mut session, handle) =
            session_over(MockAdapter::new(&MockConfig::default()).with_ecu(ecu));

        let response = session
            .request(&UdsRequest::routine_control(0x01, 0x0200, &[]), &pcm())
            .await
            .unwrap();
        assert!(response.is_no_response());
        let frames = handle.frame_commands();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].command.starts_with("0431010200"));
        // the final answer was listened for, not asked for again
        assert!(handle.commands().iter().any(|c| c.command == "ATMA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_answer_is_listened_for() {
        let ecu = SimulatedEcu::new("PCM", 0x7E0, Bus::Hs, |request| match request {
            [0x31, 0x01, hi, lo] => vec![
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x71, 0x01, *hi, *lo, 0x00],
            ],
            _ => Vec::new(),
        })
        .with_slow_answers();
        let (mut session, handle) =
            session_over(MockAdapter::new(&MockConfig::default()).with_ecu(ecu));

        let response = session
            .request(&UdsRequest::routine_control(0x01, 0x0200, &[]), &pcm())
            .await
            .unwrap();
        assert_eq!(response.positive().unwrap().record(), &[0x00]);
        assert_eq!(handle.frame_commands().len(), 1);
        let monitors = handle
            .commands()
            .iter()
            .filter(|c| c.command == "ATMA")
            .count();
        assert_eq!(monitors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_budget_ends_the_wait() {
        let ecu = SimulatedEcu::new("PCM", 0x7E0, Bus::Hs, |_| vec![vec![0x7F, 0x22, 0x78]; 100])
            .with_slow_answers();
        let adapter = MockAdapter::new(&MockConfig { latency_ms: 400 }).with_ecu(ecu);
        let handle = adapter.handle();
        let channel = IsoTpChannel::new(adapter, IsoTpConfig::default());
        let config = SessionConfig {
            pending_budget_ms: 4000,
            ..SessionConfig::default()
        };
        let mut session = UdsSession::new(channel, config);

        let started = Instant::now();
        let response = session
            .request(&UdsRequest::read_data_by_identifier(0x0100), &pcm())
            .await
            .unwrap();
        assert!(response.is_no_response());
        assert_eq!(handle.frame_commands().len(), 1);
        // addressing and the request take 2 s, then 400 ms per pending notice
        assert!(started.elapsed() >= Duration::from_millis(4000));
        assert!(started.elapsed() < Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_is_repeated() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let ecu = SimulatedEcu::new("PCM", 0x7E0, Bus::Hs, move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![vec![0x7F, 0x22, 0x21]]
            } else {
                vec![vec![0x62, 0x01, 0x00, 0x0C]]
            }
        });
        let (mut session, handle) =
            session_over(MockAdapter::new(&MockConfig::default()).with_ecu(ecu));

        let response = session
            .request(&UdsRequest::read_data_by_identifier(0x0100), &pcm())
            .await
            .unwrap();
        assert!(response.is_positive());
        let frames = handle.frame_commands();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].at - frames[0].at >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_silence_and_link_loss() {
        let (mut session, handle) = demo();
        let absent = ModuleEndpoint::new("XYZ", 0x7A0, 0x7A8, Bus::Hs);
        let response = session
            .request(&UdsRequest::read_data_by_identifier(0x0100), &absent)
            .await
            .unwrap();
        assert!(response.is_no_response());

        handle.set_link_up(false);
        let err = session
            .request(&UdsRequest::read_data_by_identifier(0x0100), &pcm())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LinkLost(TransportError::IoFailure(_))));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_enter_session() {
        let (mut session, handle) = demo();
        assert!(matches!(
            session.enter_session(SessionLevel::Extended).await,
            Err(SessionError::NoTarget)
        ));

        session.select(&pcm());
        session.enter_session(SessionLevel::Extended).await.unwrap();
        assert_eq!(session.state().level(), SessionLevel::Extended);

        handle.clear_log();
        session.enter_session(SessionLevel::Extended).await.unwrap();
        assert!(handle.commands().is_empty());

        let bcm = ModuleEndpoint::new("BCM", 0x726, 0x72E, Bus::Ms);
        session.select(&bcm);
        assert_eq!(session.state().level(), SessionLevel::Default);
        let err = session.enter_session(SessionLevel::Extended).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::ExtendedSessionUnavailable { ref module, .. } if module == "BCM"
        ));
        assert_eq!(session.state().level(), SessionLevel::Default);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_cadence_and_s3_lapse() {
        let (mut session, handle) = demo();
        session.select(&pcm());
        session.enter_session(SessionLevel::Extended).await.unwrap();

        handle.clear_log();
        session.keep_alive().await.unwrap();
        assert!(handle.frame_commands().is_empty());

        tokio::time::advance(Duration::from_millis(2100)).await;
        session.keep_alive().await.unwrap();
        let frames = handle.frame_commands();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, "023E80CCCCCCCCCC");
        assert_eq!(session.state().level(), SessionLevel::Extended);

        handle.clear_log();
        tokio::time::advance(Duration::from_millis(6000)).await;
        session.keep_alive().await.unwrap();
        assert!(handle.commands().is_empty());
        assert_eq!(session.state().level(), SessionLevel::Default);
    }

    #[tokio::test]
    async fn test_unlock() {
        let (mut session, _) = demo();
        session.select(&pcm());

        let locked = session
            .request(&UdsRequest::read_data_by_identifier(0xD100), &pcm())
            .await
            .unwrap();
        assert_eq!(locked.nrc(), Some(NegativeResponseCode::SecurityAccessDenied));

        session.enter_session(SessionLevel::Extended).await.unwrap();
        session.unlock(1, xor_key).await.unwrap();
        assert_eq!(session.state().security(), &SecurityState::Unlocked { level: 1 });

        let unlocked = session
            .request(&UdsRequest::read_data_by_identifier(0xD100), &pcm())
            .await
            .unwrap();
        assert_eq!(unlocked.positive().unwrap().record(), &[0xA5]);

        // a second seed request reports the zero seed
        assert!(session.request_seed(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key() {
        let (mut session, _) = demo();
        session.select(&pcm());
        session.enter_session(SessionLevel::Extended).await.unwrap();

        assert!(matches!(
            session.send_key(1, &[0x00]).await,
            Err(SessionError::SecurityAccessFailed(_))
        ));

        let err = session.unlock(1, |seed| seed.to_vec()).await.unwrap_err();
        assert!(matches!(err, SessionError::SecurityAccessFailed(_)));
        assert_eq!(session.state().security(), &SecurityState::Locked);
    }

    #[tokio::test]
    async fn test_reset_adapter() {
        let (mut session, handle) = demo();
        session.select(&pcm());
        session.enter_session(SessionLevel::Extended).await.unwrap();

        session.reset_adapter(&AdapterOptions::default()).await.unwrap();
        assert_eq!(session.state().level(), SessionLevel::Default);
        assert!(handle.commands().iter().any(|c| c.command == "ATZ"));

        // addressing is re-applied after the reset
        handle.clear_log();
        session
            .request(&UdsRequest::read_data_by_identifier(0x0100), &pcm())
            .await
            .unwrap();
        let commands: Vec<String> = handle.commands().into_iter().map(|c| c.command).collect();
        assert_eq!(commands[0], "ATSH7E0");
    }
}
