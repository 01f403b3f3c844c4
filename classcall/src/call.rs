//! Call lifecycle management and API
//!
//! A [`CallController`] takes one user through one call: it resolves the
//! session, joins it, opens the signaling channel and then hands everything
//! to a single task that owns the negotiation engine and the diagnostics
//! window. The controller talks to that task through a command channel and a
//! shutdown signal; the task reports back through [`CallEvent`]s and the
//! shared [`CallState`].

use crate::event::EventHub;
use crate::{CallConfig, CallEvent, EventStream};
use classcall_core::{
    ClassCallError, ConnectionState, LocalMediaSource, NegotiationEngine, NegotiationEvent,
    NegotiationEvents, Result, Role, RoomId, SignalingMessage, TrackKind, TransportEvents,
    TransportFactory, TransportSettings, UserId,
};
use classcall_diagnostics::{DiagnosticEvent, DiagnosticsAggregator, DiagnosticsSink, TracingSink};
use classcall_signaling::{
    ChannelConnector, ChannelEvent, HttpSessionDirectory, SessionDirectory,
    SessionDirectoryClient, SessionRef, SessionResolution, SignalingSender, WebSocketConnector,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Not started
    Idle,
    /// Looking up or creating the session
    ResolvingSession,
    /// No active session and the user may not create one
    WaitingForHost,
    /// Session joined, channel not open yet
    SessionReady,
    /// Signaling channel open, no peer yet
    ChannelOpen,
    /// Offer/answer exchange under way
    Negotiating,
    /// Peer connection established
    Connected,
    /// Torn down
    Ended,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::ResolvingSession => "resolving-session",
            CallState::WaitingForHost => "waiting-for-host",
            CallState::SessionReady => "session-ready",
            CallState::ChannelOpen => "channel-open",
            CallState::Negotiating => "negotiating",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Invoked once when the call is over, however it ended
pub type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Fluent builder for a [`CallController`]
pub struct CallBuilder {
    config: CallConfig,
    directory: Option<Arc<dyn SessionDirectory>>,
    connector: Option<Arc<dyn ChannelConnector>>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    media: LocalMediaSource,
    diagnostics: Arc<dyn DiagnosticsSink>,
    on_complete: Option<CompletionCallback>,
}

impl CallBuilder {
    /// Builder with the given configuration
    pub fn new(config: CallConfig) -> Self {
        Self {
            config,
            directory: None,
            connector: None,
            transport_factory: None,
            media: LocalMediaSource::new(),
            diagnostics: Arc::new(TracingSink),
            on_complete: None,
        }
    }

    /// Session directory; defaults to the REST API at `api_url`
    pub fn directory(mut self, directory: Arc<dyn SessionDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Signaling connector; defaults to WebSocket at `ws_url`
    pub fn connector(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Transport endpoint factory; required unless the `webrtc` feature is on
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Local media to publish
    pub fn media(mut self, media: LocalMediaSource) -> Self {
        self.media = media;
        self
    }

    /// Where diagnostics go besides the event stream
    pub fn diagnostics_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    /// Callback run once the call is over
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Build the controller
    pub fn build(self) -> Result<CallController> {
        let token = self.config.auth_token.clone();
        let directory = match self.directory {
            Some(directory) => directory,
            None => Arc::new(HttpSessionDirectory::new(&self.config.api_url, token.clone())?),
        };
        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WebSocketConnector::new(&self.config.ws_url, token)?),
        };
        let transports = match self.transport_factory {
            Some(factory) => factory,
            None => default_transport_factory()?,
        };

        let (state, _) = watch::channel(CallState::Idle);
        Ok(CallController {
            shared: Arc::new(Shared {
                directory: SessionDirectoryClient::new(directory),
                media: self.media,
                events: EventHub::default(),
                state,
                ended: AtomicBool::new(false),
                membership: Mutex::new(None),
                on_complete: Mutex::new(self.on_complete),
            }),
            config: self.config,
            connector,
            transports,
            diagnostics: self.diagnostics,
            running: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }
}

#[cfg(feature = "webrtc")]
fn default_transport_factory() -> Result<Arc<dyn TransportFactory>> {
    Ok(Arc::new(classcall_core::WebRtcFactory))
}

#[cfg(not(feature = "webrtc"))]
fn default_transport_factory() -> Result<Arc<dyn TransportFactory>> {
    Err(ClassCallError::MissingConfiguration {
        field: "transport_factory".to_string(),
    })
}

/// Why the call task stopped
#[derive(Debug)]
enum EndReason {
    Local,
    Remote(Option<UserId>),
    ChannelClosed(String),
    TransportFailed(String),
}

/// Request from the controller to the call task
#[derive(Debug)]
enum Command {
    Playback(DiagnosticEvent),
}

/// State shared between the controller and its call task
struct Shared {
    directory: SessionDirectoryClient,
    media: LocalMediaSource,
    events: EventHub,
    state: watch::Sender<CallState>,
    ended: AtomicBool,
    membership: Mutex<Option<(SessionRef, UserId)>>,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl Shared {
    fn state(&self) -> CallState {
        *self.state.borrow()
    }

    fn set_state(&self, state: CallState) {
        let changed = self.state.send_if_modified(|current| {
            // Ended is final
            if *current == state || *current == CallState::Ended {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!("📞 Call state: {}", state);
            self.events.emit(CallEvent::StateChanged { state });
        }
    }

    /// Move forward only; later phases are never downgraded by earlier signals
    fn advance(&self, state: CallState) {
        if phase(self.state()) < phase(state) {
            self.set_state(state);
        }
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Best-effort backend leave for whatever membership was recorded
    async fn release_membership(&self) {
        let membership = self.membership.lock().clone();
        if let Some((session, user)) = membership {
            self.directory.leave(&session.id, &user).await;
        }
    }

    fn complete(&self) {
        let callback = self.on_complete.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        self.set_state(CallState::Ended);
    }

    /// Notify the backend, run the completion callback and mark the call ended
    async fn finish(&self) {
        self.media.stop_all();
        self.release_membership().await;
        self.complete();
    }

    /// `finish` for a controller dropped without `leave`
    fn finish_detached(self: Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { self.finish().await });
            }
            Err(_) => {
                warn!("No runtime to notify the backend, skipping leave");
                self.media.stop_all();
                self.complete();
            }
        }
    }
}

fn phase(state: CallState) -> u8 {
    match state {
        CallState::Idle => 0,
        CallState::ResolvingSession => 1,
        CallState::WaitingForHost | CallState::SessionReady => 2,
        CallState::ChannelOpen => 3,
        CallState::Negotiating => 4,
        CallState::Connected => 5,
        CallState::Ended => 6,
    }
}

/// Handles of a running call task
struct Running {
    local_user: UserId,
    signals: SignalingSender,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// One user's side of one call
pub struct CallController {
    shared: Arc<Shared>,
    config: CallConfig,
    connector: Arc<dyn ChannelConnector>,
    transports: Arc<dyn TransportFactory>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    running: Mutex<Option<Running>>,
    started: AtomicBool,
}

impl fmt::Debug for CallController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallController")
            .field("state", &self.state())
            .field("ended", &self.shared.ended.load(Ordering::SeqCst))
            .finish()
    }
}

impl CallController {
    /// Start building a controller
    pub fn builder(config: CallConfig) -> CallBuilder {
        CallBuilder::new(config)
    }

    /// Current lifecycle state
    pub fn state(&self) -> CallState {
        self.shared.state()
    }

    /// Watch lifecycle state changes
    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to call events from now on
    pub fn events(&self) -> EventStream {
        self.shared.events.subscribe()
    }

    /// Local media handed to the call
    pub fn media(&self) -> &LocalMediaSource {
        &self.shared.media
    }

    /// Session this call joined, if any
    pub fn session(&self) -> Option<SessionRef> {
        self.shared
            .membership
            .lock()
            .as_ref()
            .map(|(session, _)| session.clone())
    }

    /// Resolve the room's session, join it and begin negotiating.
    ///
    /// Returns [`CallState::WaitingForHost`] when there is no active session
    /// and `role` may not create one. A controller starts at most once.
    pub async fn start(&self, room_id: RoomId, user_id: UserId, role: Role) -> Result<CallState> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClassCallError::InvalidState {
                expected: CallState::Idle.to_string(),
                actual: self.state().to_string(),
            });
        }

        match self.setup(room_id, user_id, role).await {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("Call setup failed: {}", e);
                if self.shared.ended.swap(true, Ordering::SeqCst) {
                    // leave() already finished; undo a join it could not see
                    self.shared.release_membership().await;
                } else {
                    self.shared.finish().await;
                }
                Err(e)
            }
        }
    }

    async fn setup(&self, room_id: RoomId, user_id: UserId, role: Role) -> Result<CallState> {
        let shared = &self.shared;
        if shared.is_ended() {
            return Ok(CallState::Ended);
        }
        shared.set_state(CallState::ResolvingSession);

        let session = match shared.directory.resolve_or_create_session(&room_id, role).await? {
            SessionResolution::Ready(session) => session,
            SessionResolution::WaitingForHost => {
                info!("⏳ No active call in room {}, waiting for host", room_id);
                shared.set_state(CallState::WaitingForHost);
                return Ok(self.state());
            }
        };
        if shared.is_ended() {
            debug!("Call left during session lookup");
            return Ok(CallState::Ended);
        }

        let joined = shared.directory.ensure_joined(&session.id, &user_id).await?;
        *shared.membership.lock() = Some((session.clone(), user_id.clone()));
        if shared.is_ended() {
            debug!("Call left while joining");
            shared.release_membership().await;
            return Ok(CallState::Ended);
        }
        shared.set_state(CallState::SessionReady);

        let politeness = self
            .config
            .politeness_policy
            .resolve(role, !joined.others.is_empty());
        info!(
            "📞 {} joined session {} as {:?} ({:?})",
            user_id, session.id, role, politeness
        );

        let channel = self.connector.connect(&session.id, &user_id).await?;
        let (signals, channel_events) = channel.into_parts();
        if shared.is_ended() {
            debug!("Call left while connecting");
            signals.close();
            shared.release_membership().await;
            return Ok(CallState::Ended);
        }

        let settings = self.config.transport_settings();
        let (transport, transport_events) = match self.transports.create(&settings).await {
            Ok(created) => created,
            Err(e) => {
                signals.close();
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (engine, negotiation_events) = NegotiationEngine::new(
            user_id.clone(),
            politeness,
            transport,
            Arc::new(signals.clone()),
            shared.media.clone(),
            self.config.negotiation_config(),
        );
        let engine = engine.with_shutdown(shutdown_rx.clone());
        let aggregator = DiagnosticsAggregator::new(
            self.config.diagnostics_window,
            self.config.force_relay,
            self.diagnostics.clone(),
        )
        .with_playback_grace(self.config.playback_grace);
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let call = CallTask {
            shared: self.shared.clone(),
            engine,
            negotiation_events,
            transport_events,
            transports: self.transports.clone(),
            settings,
            peer_left: false,
            channel_events,
            commands: commands_rx,
            shutdown: shutdown_rx,
            media_changes: shared.media.subscribe(),
            aggregator,
            signals: signals.clone(),
        };

        // leave() flips `ended` before taking `running`, so checking under
        // the lock leaves no window for an unowned task
        let abandoned = {
            let mut running = self.running.lock();
            if shared.is_ended() {
                Some(call)
            } else {
                let task = tokio::spawn(call.run());
                *running = Some(Running {
                    local_user: user_id,
                    signals,
                    commands,
                    shutdown,
                    task: Some(task),
                });
                None
            }
        };
        if let Some(call) = abandoned {
            debug!("Call left before negotiation started");
            call.teardown(EndReason::Local).await;
            shared.release_membership().await;
            return Ok(CallState::Ended);
        }
        Ok(self.state())
    }

    /// Flip the microphone and tell the peer. Returns the new state, or
    /// `None` without an audio track.
    pub fn toggle_mic(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio)
    }

    /// Flip the camera and tell the peer. Returns the new state, or `None`
    /// without a video track.
    pub fn toggle_camera(&self) -> Option<bool> {
        self.toggle(TrackKind::Video)
    }

    fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let track = self.shared.media.track(kind)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        debug!("Local {:?} track {} enabled={}", kind, track.id(), enabled);

        if let Some(running) = self.running.lock().as_ref() {
            let user = Some(running.local_user.clone());
            let notice = match kind {
                TrackKind::Audio => SignalingMessage::ToggleMic {
                    status: enabled,
                    user,
                },
                TrackKind::Video => SignalingMessage::ToggleCamera {
                    status: enabled,
                    user,
                },
            };
            running.signals.send(notice);
        }
        Some(enabled)
    }

    /// The UI rendered the first remote frame
    pub fn report_first_frame(&self) {
        self.command(Command::Playback(DiagnosticEvent::FirstFrameRendered));
    }

    /// The UI tried to autoplay remote media
    pub fn report_autoplay(&self, succeeded: bool) {
        self.command(Command::Playback(DiagnosticEvent::Autoplay { succeeded }));
    }

    fn command(&self, command: Command) {
        match self.running.lock().as_ref() {
            Some(running) => {
                if running.commands.send(command).is_err() {
                    debug!("Call task gone, dropping command");
                }
            }
            None => debug!("Call not running, dropping command"),
        }
    }

    /// End the call. The first call sends one `end_call`, closes the channel,
    /// stops local media and notifies the backend; later calls do nothing.
    /// The completion callback runs even when the network calls fail.
    pub async fn leave(&self) {
        if self.shared.ended.swap(true, Ordering::SeqCst) {
            debug!("Call already ended");
            return;
        }

        let running = self.running.lock().take();
        if let Some(mut running) = running {
            running.signals.send(SignalingMessage::EndCall {
                user: Some(running.local_user.clone()),
            });
            let _ = running.shutdown.send(true);
            if let Some(task) = running.task.take() {
                if let Err(e) = task.await {
                    warn!("Call task ended abnormally: {}", e);
                }
            }
        }

        self.shared.finish().await;
        info!("👋 Left call");
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            let _ = running.shutdown.send(true);
        }
        if !self.shared.ended.swap(true, Ordering::SeqCst) {
            debug!("Call dropped without leave");
            self.shared.clone().finish_detached();
        }
    }
}

/// The single task that owns a call's engine and diagnostics window
struct CallTask {
    shared: Arc<Shared>,
    engine: NegotiationEngine,
    negotiation_events: NegotiationEvents,
    transport_events: TransportEvents,
    transports: Arc<dyn TransportFactory>,
    settings: TransportSettings,
    peer_left: bool,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    media_changes: watch::Receiver<u64>,
    aggregator: DiagnosticsAggregator,
    signals: SignalingSender,
}

impl CallTask {
    async fn run(mut self) {
        if self.shared.media.has_tracks() {
            self.engine.on_media_ready().await;
        }
        let mut media_open = true;

        let reason = loop {
            if let Some(reason) = self.drain_negotiation_events() {
                break reason;
            }
            if std::mem::take(&mut self.peer_left) {
                if let Err(e) = self.renew_transport().await {
                    break EndReason::TransportFailed(e.to_string());
                }
                continue;
            }

            let deadline = self.aggregator.deadline();
            let diagnostics_open = !self.aggregator.is_finalized();

            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    break EndReason::Local;
                }
                Some(event) = self.transport_events.recv() => {
                    self.engine.handle_transport_event(event).await;
                }
                event = self.channel_events.recv() => match event {
                    Some(ChannelEvent::Open) => {
                        self.record(DiagnosticEvent::ChannelOpened);
                        self.shared.advance(CallState::ChannelOpen);
                    }
                    Some(ChannelEvent::Message(message)) => {
                        self.record(DiagnosticEvent::MessageReceived);
                        self.engine.handle_signal(message).await;
                    }
                    Some(ChannelEvent::Error(error)) => {
                        warn!("Signaling channel error: {}", error);
                        break EndReason::ChannelClosed(error);
                    }
                    Some(ChannelEvent::Closed { reason }) => {
                        break EndReason::ChannelClosed(reason);
                    }
                    None => {
                        break EndReason::ChannelClosed("channel dropped".to_string());
                    }
                },
                Some(command) = self.commands.recv() => match command {
                    Command::Playback(event) => self.record(event),
                },
                changed = self.media_changes.changed(), if media_open => {
                    if changed.is_ok() {
                        self.engine.on_media_ready().await;
                    } else {
                        media_open = false;
                    }
                }
                _ = tokio::time::sleep_until(deadline), if diagnostics_open => {
                    self.finalize_diagnostics();
                }
            }
        };

        self.teardown(reason).await;
    }

    /// Forward engine events. Returns a reason when the call must end.
    fn drain_negotiation_events(&mut self) -> Option<EndReason> {
        let mut end = None;
        while let Ok(event) = self.negotiation_events.try_recv() {
            if let Some(fact) = DiagnosticEvent::from_negotiation(&event) {
                self.record(fact);
            }
            let events = &self.shared.events;
            match event {
                NegotiationEvent::PeerJoined(user) => {
                    events.emit(CallEvent::PeerJoined { user });
                    self.shared.advance(CallState::Negotiating);
                }
                NegotiationEvent::PeerLeft(user) => {
                    events.emit(CallEvent::PeerLeft { user });
                    self.shared.set_state(CallState::ChannelOpen);
                    self.peer_left = true;
                }
                NegotiationEvent::OfferSent
                | NegotiationEvent::AnswerSent
                | NegotiationEvent::RemoteOfferReceived { .. } => {
                    self.shared.advance(CallState::Negotiating);
                }
                NegotiationEvent::ConnectionStateChanged(state) => {
                    events.emit(CallEvent::ConnectionChanged { state });
                    if matches!(state, ConnectionState::Connected | ConnectionState::Completed) {
                        self.shared.advance(CallState::Connected);
                    }
                }
                NegotiationEvent::RemoteTrack { track_id, kind } => {
                    events.emit(CallEvent::TrackReceived { track_id, kind });
                }
                NegotiationEvent::RemoteMediaToggled {
                    user,
                    kind,
                    enabled,
                } => {
                    events.emit(CallEvent::RemoteMediaToggled {
                        user,
                        kind,
                        enabled,
                    });
                }
                NegotiationEvent::MediaUnavailable { reason } => {
                    events.emit(CallEvent::MediaUnavailable { reason });
                }
                NegotiationEvent::CallEnded { by } => {
                    if end.is_none() {
                        end = Some(EndReason::Remote(by));
                    }
                }
                _ => {}
            }
        }
        end
    }

    /// Give the engine a fresh endpoint for whoever joins next
    async fn renew_transport(&mut self) -> Result<()> {
        let (transport, events) = self.transports.create(&self.settings).await?;
        self.transport_events = events;
        self.engine.replace_transport(transport).await;
        Ok(())
    }

    fn record(&mut self, event: DiagnosticEvent) {
        if self.aggregator.record(event) {
            self.finalize_diagnostics();
        }
    }

    fn finalize_diagnostics(&mut self) {
        if self.aggregator.is_finalized() {
            return;
        }
        let verdict = self.aggregator.finalize();
        self.shared.events.emit(CallEvent::Diagnostics { verdict });
    }

    async fn teardown(mut self, reason: EndReason) {
        self.engine.close().await;
        // Drain what close emitted; the call is ending either way
        let _ = self.drain_negotiation_events();
        self.signals.close();

        match reason {
            EndReason::Local => {
                debug!("Call task stopped by leave");
                // leave() finishes the call
                return;
            }
            EndReason::Remote(by) => {
                info!("📴 Call ended by remote participant {:?}", by);
                self.shared.events.emit(CallEvent::CallEnded { by });
            }
            EndReason::ChannelClosed(reason) => {
                warn!("Signaling channel closed: {}", reason);
                self.shared.events.emit(CallEvent::ChannelClosed { reason });
            }
            EndReason::TransportFailed(reason) => {
                warn!("No transport for the next peer: {}", reason);
                self.shared.events.emit(CallEvent::TransportFailed { reason });
            }
        }

        if !self.shared.ended.swap(true, Ordering::SeqCst) {
            self.shared.finish().await;
        }
    }
}
