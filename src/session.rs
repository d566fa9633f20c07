use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use futures::StreamExt;
use strum_macros::Display;
use tokio::sync::{RwLock, mpsc, watch};
use uuid::Uuid;

use crate::client::ApiClient;
use crate::error::{ClientError, Result, log_error};
use crate::stream::decode_stream;
use crate::types::{AgentResult, Intelligence, ProgressUpdate, RunRequest, SkillTree};

// ============================================================================
// Cancellation Token
// ============================================================================

#[derive(Clone, Debug)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        // send_replace: the flag must flip even when no one is awaiting it.
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Session State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Cancelled,
    Errored,
    Completed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Errored | Self::Completed)
    }
}

/// Live view model of one generation run. Exactly one exists per run; `start`
/// replaces it wholesale. Mutated only by the owning session's merge step.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub status: SessionStatus,
    pub last_event: Option<ProgressUpdate>,
    pub result: Option<AgentResult>,
    pub error: Option<String>,
    pub request_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl SessionState {
    pub fn idle() -> Self {
        Self {
            status: SessionStatus::Idle,
            last_event: None,
            result: None,
            error: None,
            request_id: Uuid::now_v7(),
            started_at: Utc::now(),
        }
    }

    fn running() -> Self {
        Self {
            status: SessionStatus::Running,
            ..Self::idle()
        }
    }

    /// Merge one decoded record into the state. Most-recent-wins: only the
    /// newest record is retained, and percent is reported exactly as received
    /// (a regression is cosmetic input, never corrected here — clamping would
    /// mask upstream bugs).
    pub fn apply_update(&mut self, update: ProgressUpdate) -> MergeOutcome {
        let intelligence = update.intelligence();
        let mut completed = false;

        if update.is_terminal() {
            let payload = update.data.clone().unwrap_or_default();
            match serde_json::from_value::<AgentResult>(payload) {
                Ok(result) => {
                    self.result = Some(result);
                    self.status = SessionStatus::Completed;
                    completed = true;
                }
                Err(e) => {
                    // A terminal record whose payload does not decode is
                    // treated like any malformed frame.
                    log::debug!("terminal payload did not decode: {}", e);
                }
            }
        }

        self.last_event = Some(update);
        MergeOutcome {
            intelligence,
            completed,
        }
    }
}

/// What a merge produced beyond the state mutation: an intelligence snapshot
/// riding the side channel, and whether the terminal record landed.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub intelligence: Option<Intelligence>,
    pub completed: bool,
}

/// Updates pushed to the caller while a run is in flight.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Snapshot of the session state after a merge or transition.
    State(SessionState),
    /// Intelligence snapshot carried on a progress record's side channel.
    Intelligence(Intelligence),
    /// One-shot auxiliary refresh after completion. Either side may be `None`
    /// when that collaborator fetch failed; failures never touch the run.
    Refreshed {
        intelligence: Option<Intelligence>,
        skills: Option<SkillTree>,
    },
}

// ============================================================================
// Stream Session
// ============================================================================

/// Orchestrates one generation run end to end: opens the request, drives the
/// decode/merge loop, exposes cancellation, and reports the terminal outcome.
///
/// Starting a new run supersedes any previous one: the epoch counter is bumped
/// under the state lock, and every mutation from a driver task re-checks its
/// epoch there, so a late chunk from a superseded run is a no-op.
pub struct StreamSession {
    api: Arc<ApiClient>,
    state: Arc<RwLock<SessionState>>,
    epoch: Arc<AtomicU64>,
    token: RwLock<Option<CancellationToken>>,
}

impl StreamSession {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api: Arc::new(api),
            state: Arc::new(RwLock::new(SessionState::idle())),
            epoch: Arc::new(AtomicU64::new(0)),
            token: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    /// Begin a fresh run. Valid from `Idle` or any terminal state; a run that
    /// is still `Running` must be cancelled first (or superseded explicitly by
    /// the caller's own policy — we refuse rather than guess).
    pub async fn start(&self, request: RunRequest) -> Result<mpsc::Receiver<SessionEvent>> {
        let token = CancellationToken::new();
        let epoch;
        {
            let mut state = self.state.write().await;
            if state.status == SessionStatus::Running {
                return Err(ClientError::invalid_state("a run is already in progress"));
            }
            epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *state = SessionState::running();
            // Registered before the state lock drops so a concurrent cancel
            // always finds the token belonging to the run it observed.
            *self.token.write().await = Some(token.clone());
        }

        let (tx, rx) = mpsc::channel(self.api.config().event_buffer);
        let _ = tx.send(SessionEvent::State(self.state().await)).await;

        let api = self.api.clone();
        let state = self.state.clone();
        let current_epoch = self.epoch.clone();
        log::info!("starting generation run (improve={})", request.improve);

        tokio::spawn(async move {
            let end = match api.run_stream(&request).await {
                Ok(chunks) => {
                    drive_stream(chunks, token.clone(), epoch, &current_epoch, &state, &tx).await
                }
                Err(e) => Err(e),
            };
            finish_run(end, &token, epoch, &current_epoch, &state, &tx, &api).await;
        });

        Ok(rx)
    }

    /// `start` for callers that prefer `StreamExt` over a raw receiver.
    pub async fn start_streaming(
        &self,
        request: RunRequest,
    ) -> Result<tokio_stream::wrappers::ReceiverStream<SessionEvent>> {
        Ok(tokio_stream::wrappers::ReceiverStream::new(self.start(request).await?))
    }

    /// Request cancellation of the in-flight run. The abort is cooperative:
    /// observable within one chunk-read latency. Frames already buffered when
    /// the abort is observed are discarded; no partial terminal result is
    /// honoured afterwards.
    pub async fn cancel(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.status != SessionStatus::Running {
                return Err(ClientError::invalid_state("no run in progress"));
            }
            state.status = SessionStatus::Cancelled;
            state.result = None;
        }
        if let Some(token) = self.token.read().await.as_ref() {
            log::info!("cancelling generation run");
            token.cancel();
        }
        Ok(())
    }
}

// ============================================================================
// Driver Loop
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DriveEnd {
    Completed,
    Cancelled,
    Superseded,
    /// Transport signalled end of stream without a terminal record.
    EndOfStream,
}

/// Core decode/merge loop over the raw byte stream. Factored out of the
/// spawned task so tests can feed in-memory streams.
pub(crate) async fn drive_stream<S>(
    chunks: S,
    token: CancellationToken,
    epoch: u64,
    current_epoch: &AtomicU64,
    state: &RwLock<SessionState>,
    tx: &mpsc::Sender<SessionEvent>,
) -> Result<DriveEnd>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut updates = Box::pin(decode_stream(chunks));

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(DriveEnd::Cancelled),
            next = updates.next() => next,
        };
        let Some(update) = next else { break };
        let update = update?;

        // Records buffered before the abort was observed are discarded.
        if token.is_cancelled() {
            return Ok(DriveEnd::Cancelled);
        }

        let outcome = {
            let mut guard = state.write().await;
            if current_epoch.load(Ordering::SeqCst) != epoch {
                return Ok(DriveEnd::Superseded);
            }
            // Re-checked under the lock: a cancel that landed after the
            // unlocked check above has already transitioned the state, and a
            // merge must not rewrite it.
            if token.is_cancelled() || guard.status == SessionStatus::Cancelled {
                return Ok(DriveEnd::Cancelled);
            }
            guard.apply_update(update)
        };

        if let Some(intelligence) = outcome.intelligence {
            let _ = tx.send(SessionEvent::Intelligence(intelligence)).await;
        }
        let _ = tx.send(SessionEvent::State(state.read().await.clone())).await;

        if outcome.completed {
            return Ok(DriveEnd::Completed);
        }
    }

    Ok(DriveEnd::EndOfStream)
}

/// Resolve the run to its terminal state and emit the final snapshot. Every
/// mutation is epoch-guarded; a superseded run resolves to a no-op.
async fn finish_run(
    end: Result<DriveEnd>,
    token: &CancellationToken,
    epoch: u64,
    current_epoch: &AtomicU64,
    state: &RwLock<SessionState>,
    tx: &mpsc::Sender<SessionEvent>,
    api: &ApiClient,
) {
    let (status, error, refresh) = match end {
        // A completion racing a cancel is still a cancel.
        Ok(DriveEnd::Completed) if token.is_cancelled() => (SessionStatus::Cancelled, None, false),
        Ok(DriveEnd::Completed) => (SessionStatus::Completed, None, true),
        Ok(DriveEnd::Cancelled) => (SessionStatus::Cancelled, None, false),
        Ok(DriveEnd::Superseded) => {
            log::debug!("run superseded; discarding further effects");
            return;
        }
        Ok(DriveEnd::EndOfStream) => (
            SessionStatus::Errored,
            Some("stream ended without a terminal record".to_string()),
            false,
        ),
        Err(e) => {
            // A transport error racing a cancel is still a cancel.
            if token.is_cancelled() {
                (SessionStatus::Cancelled, None, false)
            } else {
                log_error(&e);
                (SessionStatus::Errored, Some(e.to_string()), false)
            }
        }
    };

    let mut do_refresh = false;
    {
        let mut guard = state.write().await;
        if current_epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if guard.status == SessionStatus::Cancelled && status != SessionStatus::Cancelled {
            // A cancel raced the driver's resolution. Cancellation wins; no
            // partial terminal result is honoured after it.
            guard.result = None;
        } else {
            guard.status = status;
            guard.error = error;
            do_refresh = refresh;
        }
    }
    let _ = tx.send(SessionEvent::State(state.read().await.clone())).await;

    if do_refresh {
        // Exactly once per completed run; failed fetches leave their side
        // unset rather than disturbing the finished session.
        let intelligence = api.intelligence().await.ok();
        let skills = api.skills().await.ok();
        let _ = tx
            .send(SessionEvent::Refreshed {
                intelligence,
                skills,
            })
            .await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::STEP_COMPLETE;
    use futures::stream;

    fn update(step: &str, percent: u8, data: Option<serde_json::Value>) -> ProgressUpdate {
        ProgressUpdate {
            step: step.to_string(),
            message: format!("{}...", step),
            percent,
            data,
        }
    }

    fn terminal_payload() -> serde_json::Value {
        serde_json::json!({
            "idea": "a calculator",
            "plan": {},
            "code_files": ["index.html"],
            "all_code": {"index.html": "<html></html>"},
            "final_code": "",
            "review": {"has_errors": false, "errors": []},
            "learned_from": false
        })
    }

    fn frame(update: &ProgressUpdate) -> Bytes {
        Bytes::from(format!("data: {}\n", serde_json::to_string(update).unwrap()))
    }

    fn byte_stream(
        frames: Vec<Result<Bytes>>,
    ) -> impl Stream<Item = Result<Bytes>> + Unpin {
        stream::iter(frames)
    }

    async fn drive_fresh(
        frames: Vec<Result<Bytes>>,
        token: CancellationToken,
        epoch: u64,
        current: u64,
    ) -> (Result<DriveEnd>, SessionState, Vec<SessionEvent>) {
        let state = RwLock::new(SessionState::idle());
        let current_epoch = AtomicU64::new(current);
        let (tx, mut rx) = mpsc::channel(64);

        let end = drive_stream(byte_stream(frames), token, epoch, &current_epoch, &state, &tx).await;
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (end, state.into_inner(), events)
    }

    // ------------------------------------------------------------------
    // Merge semantics
    // ------------------------------------------------------------------

    #[test]
    fn test_merge_keeps_most_recent_event() {
        let mut state = SessionState::idle();
        state.apply_update(update("plan", 10, None));
        state.apply_update(update("code", 55, None));
        assert_eq!(state.last_event.as_ref().unwrap().step, "code");
        assert!(state.result.is_none());
        assert_eq!(state.status, SessionStatus::Idle);
    }

    #[test]
    fn test_merge_reports_percent_regression_verbatim() {
        let mut state = SessionState::idle();
        state.apply_update(update("code", 70, None));
        state.apply_update(update("retry", 40, None));
        assert_eq!(state.last_event.as_ref().unwrap().percent, 40);
    }

    #[test]
    fn test_complete_with_payload_transitions_and_sets_result() {
        let mut state = SessionState::idle();
        let outcome = state.apply_update(update(STEP_COMPLETE, 100, Some(terminal_payload())));
        assert!(outcome.completed);
        assert_eq!(state.status, SessionStatus::Completed);
        assert_eq!(state.result.as_ref().unwrap().idea, "a calculator");
    }

    #[test]
    fn test_complete_without_payload_is_informational() {
        let mut state = SessionState::idle();
        let outcome = state.apply_update(update(STEP_COMPLETE, 100, None));
        assert!(!outcome.completed);
        assert!(state.result.is_none());
        assert_ne!(state.status, SessionStatus::Completed);
    }

    #[test]
    fn test_unknown_step_never_sets_result() {
        let mut state = SessionState::idle();
        let outcome = state.apply_update(update("mystery", 50, Some(terminal_payload())));
        assert!(!outcome.completed);
        assert!(state.result.is_none());
    }

    #[test]
    fn test_intelligence_side_channel_on_any_step() {
        let mut state = SessionState::idle();
        let outcome = state.apply_update(update(
            "review",
            80,
            Some(serde_json::json!({
                "intelligence": {"level": 4, "xp": 200, "stage_name": "Teen"}
            })),
        ));
        assert_eq!(outcome.intelligence.unwrap().level, 4);
        assert!(!outcome.completed);
    }

    // ------------------------------------------------------------------
    // Driver loop
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_drive_to_completion() {
        let frames = vec![
            Ok(frame(&update("plan", 10, None))),
            Ok(frame(&update(STEP_COMPLETE, 100, Some(terminal_payload())))),
        ];
        let (end, state, events) =
            drive_fresh(frames, CancellationToken::new(), 1, 1).await;

        assert_eq!(end.unwrap(), DriveEnd::Completed);
        assert_eq!(state.status, SessionStatus::Completed);
        assert!(state.result.is_some());
        assert!(events.len() >= 2);
    }

    #[tokio::test]
    async fn test_drive_survives_malformed_frame() {
        let frames = vec![
            Ok(frame(&update("plan", 10, None))),
            Ok(Bytes::from("data: {broken\n")),
            Ok(frame(&update(STEP_COMPLETE, 100, Some(terminal_payload())))),
        ];
        let (end, state, _) = drive_fresh(frames, CancellationToken::new(), 1, 1).await;
        assert_eq!(end.unwrap(), DriveEnd::Completed);
        assert_eq!(state.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_discards_buffered_terminal_record() {
        // The terminal record is already buffered when the abort is observed:
        // cancellation still wins, the result is never honoured.
        let token = CancellationToken::new();
        token.cancel();
        let frames = vec![Ok(frame(&update(STEP_COMPLETE, 100, Some(terminal_payload()))))];
        let (end, state, _) = drive_fresh(frames, token, 1, 1).await;

        assert_eq!(end.unwrap(), DriveEnd::Cancelled);
        assert!(state.result.is_none());
        assert_ne!(state.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_state_blocks_terminal_merge() {
        // A cancel can transition the state after the driver's unlocked token
        // check but before the merge takes the lock. Simulate exactly that
        // interleaving: the state already says Cancelled, the token flip has
        // not been observed yet. The merge must not rewrite the status.
        let state = RwLock::new(SessionState::running());
        {
            let mut guard = state.write().await;
            guard.status = SessionStatus::Cancelled;
            guard.result = None;
        }
        let current_epoch = AtomicU64::new(1);
        let (tx, _rx) = mpsc::channel(64);
        let frames = vec![Ok(frame(&update(STEP_COMPLETE, 100, Some(terminal_payload()))))];

        let end = drive_stream(
            byte_stream(frames),
            CancellationToken::new(),
            1,
            &current_epoch,
            &state,
            &tx,
        )
        .await;

        assert_eq!(end.unwrap(), DriveEnd::Cancelled);
        let snapshot = state.into_inner();
        assert_eq!(snapshot.status, SessionStatus::Cancelled);
        assert!(snapshot.result.is_none());
    }

    #[tokio::test]
    async fn test_stale_epoch_is_a_no_op() {
        let frames = vec![Ok(frame(&update(STEP_COMPLETE, 100, Some(terminal_payload()))))];
        // Driver believes it is epoch 1, but a newer run bumped it to 2.
        let (end, state, events) = drive_fresh(frames, CancellationToken::new(), 1, 2).await;

        assert_eq!(end.unwrap(), DriveEnd::Superseded);
        assert!(state.result.is_none());
        assert!(state.last_event.is_none());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        let frames = vec![
            Ok(frame(&update("plan", 10, None))),
            Err(ClientError::transport("connection reset")),
        ];
        let (end, state, _) = drive_fresh(frames, CancellationToken::new(), 1, 1).await;
        assert!(end.is_err());
        // The merge before the failure still happened.
        assert_eq!(state.last_event.unwrap().step, "plan");
    }

    #[tokio::test]
    async fn test_end_of_stream_without_terminal_record() {
        let frames = vec![Ok(frame(&update("plan", 10, None)))];
        let (end, state, _) = drive_fresh(frames, CancellationToken::new(), 1, 1).await;
        assert_eq!(end.unwrap(), DriveEnd::EndOfStream);
        assert!(state.result.is_none());
    }

    #[tokio::test]
    async fn test_frame_split_across_chunks() {
        let whole = frame(&update(STEP_COMPLETE, 100, Some(terminal_payload())));
        let mid = whole.len() / 2;
        let frames = vec![
            Ok(whole.slice(..mid)),
            Ok(whole.slice(mid..)),
        ];
        let (end, state, _) = drive_fresh(frames, CancellationToken::new(), 1, 1).await;
        assert_eq!(end.unwrap(), DriveEnd::Completed);
        assert_eq!(state.status, SessionStatus::Completed);
    }

    // ------------------------------------------------------------------
    // Session state machine guards
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_cancel_without_run_is_invalid() {
        let session = StreamSession::new(ApiClient::new(crate::config::ClientConfig::default()));
        let err = session.cancel().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_cancel_beats_racing_completion() {
        // The terminal merge landed, then a cancel slipped in before the
        // driver resolved the run. Cancellation wins and the result is gone.
        let state = RwLock::new(SessionState::idle());
        {
            let mut guard = state.write().await;
            guard.apply_update(update(STEP_COMPLETE, 100, Some(terminal_payload())));
            guard.status = SessionStatus::Cancelled;
            guard.result = None;
        }
        let current_epoch = AtomicU64::new(1);
        let (tx, mut rx) = mpsc::channel(8);
        let api = ApiClient::new(crate::config::ClientConfig::new("http://127.0.0.1:1"));
        let token = CancellationToken::new();
        token.cancel();

        finish_run(Ok(DriveEnd::Completed), &token, 1, &current_epoch, &state, &tx, &api).await;
        drop(tx);

        let final_state = state.read().await.clone();
        assert_eq!(final_state.status, SessionStatus::Cancelled);
        assert!(final_state.result.is_none());
        // No auxiliary refresh was emitted, only the final snapshot.
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::State(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_resolves_to_errored() {
        // Nothing listens on this port: opening the stream fails, the run
        // reports Errored, and the event channel closes.
        let session = StreamSession::new(ApiClient::new(
            crate::config::ClientConfig::new("http://127.0.0.1:1"),
        ));
        let events = session
            .start_streaming(RunRequest::new("anything"))
            .await
            .unwrap();
        let events: Vec<_> = events.collect::<Vec<_>>().await;

        let last_state = events
            .iter()
            .rev()
            .find_map(|e| match e {
                SessionEvent::State(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_state.status, SessionStatus::Errored);
        assert!(last_state.error.is_some());
        assert_eq!(session.state().await.status, SessionStatus::Errored);
    }

    #[tokio::test]
    async fn test_start_refused_while_running() {
        let session = StreamSession::new(ApiClient::new(
            crate::config::ClientConfig::new("http://127.0.0.1:1"),
        ));
        {
            let mut state = session.state.write().await;
            state.status = SessionStatus::Running;
        }
        let err = session.start(RunRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_cancellation_token_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        token.cancel();
        assert!(handle.await.unwrap());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_status_display_and_terminality() {
        assert_eq!(SessionStatus::Running.to_string(), "running");
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(SessionStatus::Errored.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
    }
}
