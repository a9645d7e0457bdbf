//! Session controller.
//!
//! The single state machine behind the whole client: it owns the signalling
//! channel, the registry of local capture devices, every capture and
//! renderer session, the shared mixer/voice chain and the recorder. All
//! signalling commands are processed in arrival order on one dispatch task;
//! nothing else mutates the session maps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use confero_media_core::codec::KeyFrameRequest;
use confero_media_core::{AudioMixer, Resolution, TimeMeter, VoiceProcessor};
use confero_proto_core as proto;
use confero_proto_core::command::{
    CallRequest, ChangeMemberState, ChangeServer, ConferenceConnectResult, ConferencesList,
    ConnectRequest, ConnectResponse, ConnectResult, ConnectToConferenceRequest,
    ConnectToConferenceResponse, ConnectType, ContactList, ContactsUpdate,
    CreateTempConference, DeliveryMessages, DeviceConnect, DeviceDisconnect, DeviceParams,
    Disconnect, DisconnectFromConference, GroupList, LoadMessages, MediaAddressesList,
    MemberActionCommand, MicrophoneActive, Ping, RendererConnect, RendererDisconnect,
    ResolutionChange, ScheduleConnect, SendConnectToConference, SetMaxBitrate, TurnSpeaker,
    UpdateGrants, WantSpeak,
};
use confero_proto_core::command::{CallResponse, ConferenceUpdateRequest, ConferenceUpdateResponse};
use confero_proto_core::entities::MemberAction;
use confero_proto_core::{command_type, CommandType, Conference, DeviceType, Group, Member};
use confero_transport_core::socket::{Packet, PacketSink, SharedSink};
use confero_transport_core::tunnel::TunnelClient;
use confero_transport_core::{Address, RtpHeader, RtpPacket, RtpPayloadType};

use crate::config::ClientConfig;
use crate::error::{AuthFailReason, ClientError, Result};
use crate::events::{ClientEvent, DeviceNotify, DeviceNotifyCallback};
use crate::recorder::Recorder;
use crate::session::{
    CaptureAudioSession, CaptureVideoSession, RendererAudioSession, RendererVideoSession,
};
use crate::signaling::{SignalingChannel, SignalingNotice};

/// Client version reported in `connect_request`.
const CLIENT_VERSION: u32 = 302;

/// Mixer output cadence.
const AUDIO_OUTPUT_TICK: Duration = Duration::from_millis(40);

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    AuthNeeded,
    Online,
    Conferencing,
    ServerChangedRedirect,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "Disconnected",
            ClientState::Connecting => "Connecting",
            ClientState::AuthNeeded => "AuthNeeded",
            ClientState::Online => "Online",
            ClientState::Conferencing => "Conferencing",
            ClientState::ServerChangedRedirect => "ServerChangedRedirect",
        }
    }
}

/// A local capture device the application wants to publish.
#[derive(Debug, Clone)]
pub struct LocalDevice {
    pub device_id: u32,
    pub device_type: DeviceType,
    pub name: String,
    pub resolution: Resolution,
    pub ord: u32,
}

/// Mixed output consumer (the platform audio renderer).
pub type AudioOutputCallback = Arc<dyn Fn(&[i16]) + Send + Sync>;

struct Caches {
    my_id: i64,
    connection_id: u32,
    my_name: String,
    secure_key: String,
    server_version: u32,
    options: u32,
    grants: u32,
    max_output_bitrate: u32,
    reduced_frame_rate: u16,
}

struct Inner {
    config: Mutex<ClientConfig>,
    state: Mutex<ClientState>,
    signaling: SignalingChannel,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    time_meter: TimeMeter,
    mixer: Arc<AudioMixer>,
    voice: Arc<VoiceProcessor>,
    recorder: Arc<Recorder>,
    caches: Mutex<Caches>,
    members: Mutex<Vec<Member>>,
    groups: Mutex<Vec<Group>>,
    conferences: Mutex<Vec<Conference>>,
    current_conference: Mutex<Option<Conference>>,
    media_addresses: Mutex<Vec<Address>>,
    local_devices: Mutex<Vec<LocalDevice>>,
    capture_audio: Arc<CaptureAudioSession>,
    capture_videos: Mutex<HashMap<u32, Arc<CaptureVideoSession>>>,
    renderer_audios: Mutex<HashMap<u32, Arc<RendererAudioSession>>>,
    renderer_videos: Mutex<HashMap<u32, Arc<RendererVideoSession>>>,
    audio_output: Mutex<Option<AudioOutputCallback>>,
    audio_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    conferencing: Arc<AtomicBool>,
    next_ssrc: AtomicU32,
    tunnel: TunnelClient,
    use_tunnel: AtomicBool,
    use_wsm: AtomicBool,
}

/// The client-side conferencing engine.
pub struct ClientController {
    inner: Arc<Inner>,
    dispatch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ClientController {
    /// Build the engine. Events arrive on the returned receiver.
    pub fn new(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let time_meter = TimeMeter::new();
        let mixer = Arc::new(AudioMixer::new());
        let voice = Arc::new(VoiceProcessor::new());
        let recorder = Recorder::new();
        let capture_audio = CaptureAudioSession::new();

        // Processed microphone audio flows straight into the capture session.
        voice.set_receiver(Some(capture_audio.pcm_sink()));
        voice.set_render_latency(config.renderer_latency_ms);
        capture_audio.set_sample_freq(config.microphone_sample_freq);
        capture_audio.set_gain(config.microphone_gain);

        let inner = Arc::new(Inner {
            config: Mutex::new(config),
            state: Mutex::new(ClientState::Disconnected),
            signaling: SignalingChannel::new(),
            event_tx,
            time_meter,
            mixer,
            voice,
            recorder,
            caches: Mutex::new(Caches {
                my_id: 0,
                connection_id: 0,
                my_name: String::new(),
                secure_key: String::new(),
                server_version: 0,
                options: 0,
                grants: 0,
                max_output_bitrate: 0,
                reduced_frame_rate: 0,
            }),
            members: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
            conferences: Mutex::new(Vec::new()),
            current_conference: Mutex::new(None),
            media_addresses: Mutex::new(Vec::new()),
            local_devices: Mutex::new(Vec::new()),
            capture_audio,
            capture_videos: Mutex::new(HashMap::new()),
            renderer_audios: Mutex::new(HashMap::new()),
            renderer_videos: Mutex::new(HashMap::new()),
            audio_output: Mutex::new(None),
            audio_thread: Mutex::new(None),
            conferencing: Arc::new(AtomicBool::new(false)),
            next_ssrc: AtomicU32::new(rand::random::<u16>() as u32 + 1000),
            tunnel: TunnelClient::new(),
            use_tunnel: AtomicBool::new(false),
            use_wsm: AtomicBool::new(false),
        });

        (Self { inner, dispatch_task: Mutex::new(None) }, event_rx)
    }

    /// Open the signalling connection and log on.
    pub fn connect(&self) {
        let inner = self.inner.clone();
        if inner.config.lock().server_address.is_empty() {
            inner.set_state(ClientState::AuthNeeded);
            inner.emit(ClientEvent::AuthFailed(AuthFailReason::NoUrl));
            return;
        }
        inner.set_state(ClientState::Connecting);

        let url = inner.config.lock().signaling_url();
        let mut notices = inner.signaling.connect(&url);

        let dispatch = self.inner.clone();
        let task = tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                match notice {
                    SignalingNotice::Connected => dispatch.send_logon(),
                    SignalingNotice::Message(text) => dispatch.handle_message(&text),
                    SignalingNotice::Disconnected => {
                        dispatch.emit(ClientEvent::ConnectionLost);
                        if *dispatch.state.lock() == ClientState::Conferencing {
                            dispatch.teardown_conference(false);
                        }
                    }
                }
            }
        });
        *self.dispatch_task.lock() = Some(task);
    }

    /// Clean shutdown: leave the conference, say goodbye, close everything.
    pub fn disconnect(&self) {
        if *self.inner.state.lock() == ClientState::Conferencing {
            self.inner.teardown_conference(true);
        }
        self.inner.signaling.send(proto::serialize(&Disconnect {}));
        self.inner.signaling.stop();
        self.inner.tunnel.end_session();
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
        self.inner.set_state(ClientState::Disconnected);
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    pub fn members(&self) -> Vec<Member> {
        self.inner.members.lock().clone()
    }

    pub fn groups(&self) -> Vec<Group> {
        self.inner.groups.lock().clone()
    }

    pub fn conferences(&self) -> Vec<Conference> {
        self.inner.conferences.lock().clone()
    }

    pub fn current_conference(&self) -> Option<Conference> {
        self.inner.current_conference.lock().clone()
    }

    pub fn media_addresses(&self) -> Vec<Address> {
        self.inner.media_addresses.lock().clone()
    }

    pub fn secure_key(&self) -> String {
        self.inner.caches.lock().secure_key.clone()
    }

    pub fn my_id(&self) -> i64 {
        self.inner.caches.lock().my_id
    }

    pub fn grants(&self) -> u32 {
        self.inner.caches.lock().grants
    }

    pub fn server_version(&self) -> u32 {
        self.inner.caches.lock().server_version
    }

    pub fn server_options(&self) -> u32 {
        self.inner.caches.lock().options
    }

    /// Frame rate the server asks reduced-capability clients to use.
    pub fn reduced_frame_rate(&self) -> u16 {
        self.inner.caches.lock().reduced_frame_rate
    }

    pub fn max_output_bitrate(&self) -> u32 {
        self.inner.caches.lock().max_output_bitrate
    }

    /// Register a local capture device for publishing on the next join.
    pub fn add_local_device(&self, device: LocalDevice) {
        self.inner.local_devices.lock().push(device);
    }

    /// Entry sink for raw microphone PCM (feeds the voice chain).
    pub fn microphone_sink(&self) -> SharedSink {
        self.inner.voice.microphone_sink()
    }

    /// Entry sink for raw camera frames of a published video device.
    pub fn camera_sink(&self, device_id: u32) -> Option<SharedSink> {
        self.inner
            .capture_videos
            .lock()
            .get(&device_id)
            .map(|session| session.frame_sink())
    }

    /// Mixed audio consumer (the platform speaker).
    pub fn set_audio_output(&self, callback: Option<AudioOutputCallback>) {
        *self.inner.audio_output.lock() = callback;
    }

    pub fn set_microphone_mute(&self, yes: bool) {
        self.inner.capture_audio.set_mute(yes);
    }

    /// Report local voice activity to the conference.
    pub fn set_microphone_active(&self, active: bool) {
        let ssrc = self.inner.capture_audio.ssrc();
        self.inner
            .signaling
            .send(proto::serialize(&MicrophoneActive { active, ssrc }));
    }

    /// Route all media through the TCP tunnel on `port` at the signalling
    /// host. Used when the UDP probe finds every candidate blocked.
    pub fn enable_tcp_tunnel(&self, port: u16) {
        let host = {
            let config = self.inner.config.lock();
            config
                .server_address
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| config.server_address.clone())
        };
        self.inner.tunnel.set_server_address(&host, port);
        self.inner.use_tunnel.store(true, Ordering::SeqCst);
        info!("Controller :: media will go through the TCP tunnel at {host}:{port}");
    }

    /// Route all media through the signalling WebSocket (the last-resort
    /// fallback when both UDP and the TCP tunnel are blocked).
    pub fn enable_wsm_media(&self, yes: bool) {
        self.inner.use_wsm.store(yes, Ordering::SeqCst);
        if yes {
            info!("Controller :: media will go through the signalling websocket");
        }
    }

    /// The application's speaker tracker decided another client is talking.
    pub fn speaker_changed(&self, client_id: i64) {
        self.inner.recorder.speaker_changed(client_id);
        for session in self.inner.renderer_videos.lock().values() {
            session.set_speaking(session.client_id() == client_id);
        }
        self.inner.emit(ClientEvent::SpeakerChanged { client_id });
    }

    /// Ask to join a conference by tag.
    pub fn connect_to_conference(
        &self,
        tag: &str,
        has_camera: bool,
        has_microphone: bool,
        has_demonstration: bool,
    ) -> Result<()> {
        let state = *self.inner.state.lock();
        if state != ClientState::Online {
            return Err(ClientError::InvalidState {
                expected: "Online",
                actual: state.as_str(),
            });
        }
        self.inner.signaling.send(proto::serialize(&ConnectToConferenceRequest {
            tag: tag.to_string(),
            connect_members: true,
            has_camera,
            has_microphone,
            has_demonstration,
        }));
        Ok(())
    }

    /// Leave the current conference.
    pub fn disconnect_from_conference(&self) {
        if *self.inner.state.lock() == ClientState::Conferencing {
            self.inner.teardown_conference(true);
        }
    }

    /// Moderator action against conference members.
    pub fn member_action(&self, ids: Vec<i64>, action: MemberAction) {
        let actor_id = self.my_id();
        self.inner.signaling.send(proto::serialize(&MemberActionCommand {
            ids,
            action,
            actor_id,
            ..MemberActionCommand::default()
        }));
    }

    /// Request the floor (or give it back).
    pub fn want_speak(&self, is_speak: bool) {
        let caches = self.inner.caches.lock();
        self.inner.signaling.send(proto::serialize(&WantSpeak {
            user_id: caches.my_id,
            user_name: caches.my_name.clone(),
            is_speak,
        }));
    }

    /// Create or update a conference (action 1 = create, 2 = edit,
    /// 3 = delete, server-defined).
    pub fn update_conference(&self, action: u32, conference: Conference) {
        self.inner
            .signaling
            .send(proto::serialize(&ConferenceUpdateRequest { action, conference }));
    }

    /// Ask the server for a temporary one-on-one conference with a contact.
    pub fn create_temp_conference(&self, subscriber_id: i64) {
        self.inner
            .signaling
            .send(proto::serialize(&CreateTempConference { subscriber_id }));
    }

    /// Ring a user into a conference.
    pub fn ring_member(&self, tag: &str) {
        let caches = self.inner.caches.lock();
        self.inner.signaling.send(proto::serialize(&SendConnectToConference {
            tag: tag.to_string(),
            connecter_id: caches.my_id,
            connecter_connection_id: caches.connection_id,
            flags: 0,
        }));
    }

    /// Offer a direct call to a contact.
    pub fn call(&self, id: i64) {
        let caches = self.inner.caches.lock();
        self.inner.signaling.send(proto::serialize(&CallRequest {
            id,
            name: caches.my_name.clone(),
            connection_id: caches.connection_id,
        }));
    }

    /// Answer (or refuse) an incoming call offer.
    pub fn answer_call(&self, id: i64, connection_id: u32, accept: bool) {
        self.inner.signaling.send(proto::serialize(&CallResponse {
            id,
            connection_id,
            result: if accept { 1 } else { 0 },
        }));
    }

    /// Send chat messages over the signalling channel.
    pub fn send_messages(&self, messages: Vec<proto::Message>) {
        self.inner
            .signaling
            .send(proto::serialize(&DeliveryMessages { messages }));
    }

    pub fn load_messages(&self, from_dt: i64, count: u32) {
        self.inner
            .signaling
            .send(proto::serialize(&LoadMessages { from_dt, count }));
    }

    /// Ask the server for its media endpoint candidates (UDP probing).
    pub fn request_media_addresses(&self) {
        self.inner
            .signaling
            .send(proto::serialize(&proto::command::RequestMediaAddresses {}));
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        self.inner.recorder.clone()
    }

    pub fn mixer(&self) -> Arc<AudioMixer> {
        self.inner.mixer.clone()
    }

    pub fn voice(&self) -> Arc<VoiceProcessor> {
        self.inner.voice.clone()
    }

    #[cfg(test)]
    pub(crate) fn handle_message_for_test(&self, text: &str) {
        self.inner.handle_message(text);
    }
}

impl Drop for ClientController {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Inner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, state: ClientState) {
        let mut current = self.state.lock();
        if *current != state {
            info!("Controller :: {} -> {}", current.as_str(), state.as_str());
            *current = state;
            drop(current);
            self.emit(ClientEvent::StateChanged(state));
        }
    }

    fn send_logon(&self) {
        let config = self.config.lock().clone();
        if config.login.is_empty() && config.password.is_empty() {
            self.set_state(ClientState::AuthNeeded);
            self.emit(ClientEvent::AuthFailed(AuthFailReason::NoCredentials));
            return;
        }
        self.signaling.send(proto::serialize(&ConnectRequest {
            connect_type: ConnectType::Client,
            client_version: CLIENT_VERSION,
            system: std::env::consts::OS.to_string(),
            login: config.login,
            password: config.password,
            ..ConnectRequest::default()
        }));
    }

    fn handle_message(&self, text: &str) {
        match command_type(text) {
            CommandType::Ping => self.signaling.send(proto::serialize(&Ping {})),
            CommandType::ConnectResponse => self.on_connect_response(text),
            CommandType::Disconnect => {
                self.teardown_conference(false);
                self.set_state(ClientState::Disconnected);
            }
            CommandType::ChangeServer => {
                if let Ok(cmd) = proto::parse::<ChangeServer>(text) {
                    let scheme = if cmd.secure { "wss" } else { "ws" };
                    let url = format!("{scheme}://{}", cmd.address);
                    info!("Controller :: change server to {url}");
                    self.emit(ClientEvent::ServerChanged(cmd.address));
                    self.set_state(ClientState::Connecting);
                    self.signaling.change_server(&url);
                }
            }
            CommandType::ContactList => {
                if let Ok(cmd) = proto::parse::<ContactList>(text) {
                    *self.members.lock() = cmd.members.clone();
                    self.emit(ClientEvent::ContactsUpdated(cmd.members));
                }
            }
            CommandType::ContactsUpdate => {
                if let Ok(cmd) = proto::parse::<ContactsUpdate>(text) {
                    self.apply_member_updates(&cmd.members);
                    self.emit(ClientEvent::ContactsUpdated(cmd.members));
                }
            }
            CommandType::GroupList => {
                if let Ok(cmd) = proto::parse::<GroupList>(text) {
                    *self.groups.lock() = cmd.groups.clone();
                    self.emit(ClientEvent::GroupsUpdated(cmd.groups));
                }
            }
            CommandType::ConferencesList => {
                if let Ok(cmd) = proto::parse::<ConferencesList>(text) {
                    *self.conferences.lock() = cmd.conferences.clone();
                    self.emit(ClientEvent::ConferencesUpdated(cmd.conferences));
                }
            }
            CommandType::ChangeMemberState => {
                if let Ok(cmd) = proto::parse::<ChangeMemberState>(text) {
                    self.apply_member_updates(&cmd.members);
                    self.emit(ClientEvent::MemberStateChanged(cmd.members));
                }
            }
            CommandType::ConnectToConferenceResponse => self.on_conference_response(text),
            CommandType::ConferenceUpdateResponse => {
                if let Ok(cmd) = proto::parse::<ConferenceUpdateResponse>(text) {
                    self.emit(ClientEvent::ConferenceUpdateResult {
                        result: cmd.result,
                        id: cmd.id,
                    });
                }
            }
            CommandType::DeviceConnect => {
                if let Ok(cmd) = proto::parse::<DeviceConnect>(text) {
                    self.on_device_connect(cmd);
                }
            }
            CommandType::DeviceDisconnect => {
                if let Ok(cmd) = proto::parse::<DeviceDisconnect>(text) {
                    self.on_device_disconnect(cmd);
                }
            }
            CommandType::ResolutionChange => {
                if let Ok(cmd) = proto::parse::<ResolutionChange>(text) {
                    self.on_resolution_change(cmd);
                }
            }
            CommandType::SetMaxBitrate => {
                if let Ok(cmd) = proto::parse::<SetMaxBitrate>(text) {
                    info!("Controller :: max output bitrate {}", cmd.bitrate);
                    self.caches.lock().max_output_bitrate = cmd.bitrate;
                    for session in self.capture_videos.lock().values() {
                        if session.bitrate() > cmd.bitrate {
                            session.set_bitrate(cmd.bitrate);
                        }
                    }
                }
            }
            CommandType::UpdateGrants => {
                if let Ok(cmd) = proto::parse::<UpdateGrants>(text) {
                    self.caches.lock().grants = cmd.grants;
                }
            }
            CommandType::MemberAction => {
                if let Ok(cmd) = proto::parse::<MemberActionCommand>(text) {
                    self.on_member_action(cmd);
                }
            }
            CommandType::TurnSpeaker => {
                if let Ok(cmd) = proto::parse::<TurnSpeaker>(text) {
                    self.emit(ClientEvent::SpeakerChanged { client_id: cmd.id });
                    self.recorder.speaker_changed(cmd.id);
                }
            }
            CommandType::WantSpeak => {
                if let Ok(cmd) = proto::parse::<WantSpeak>(text) {
                    self.emit(ClientEvent::WantSpeak {
                        user_id: cmd.user_id,
                        user_name: cmd.user_name,
                        is_speak: cmd.is_speak,
                    });
                }
            }
            CommandType::ScheduleConnect => {
                if let Ok(cmd) = proto::parse::<ScheduleConnect>(text) {
                    self.emit(ClientEvent::ScheduleConnect { tag: cmd.tag, name: cmd.name });
                }
            }
            CommandType::CallRequest => {
                if let Ok(cmd) = proto::parse::<CallRequest>(text) {
                    self.emit(ClientEvent::CallIncoming { id: cmd.id, name: cmd.name });
                }
            }
            CommandType::DeliveryMessages => {
                if let Ok(cmd) = proto::parse::<DeliveryMessages>(text) {
                    self.emit(ClientEvent::MessagesDelivered(cmd.messages));
                }
            }
            CommandType::MediaAddressesList => {
                if let Ok(cmd) = proto::parse::<MediaAddressesList>(text) {
                    let mut resolved = Vec::new();
                    for address in &cmd.addresses {
                        for port in &cmd.ports {
                            if let Ok(addr) = Address::resolve(address, *port) {
                                resolved.push(addr);
                            }
                        }
                    }
                    *self.media_addresses.lock() = resolved;
                }
            }
            CommandType::Undefined => debug!("Controller :: unknown command dropped"),
            other => debug!("Controller :: unhandled command {other:?}"),
        }
    }

    fn on_connect_response(&self, text: &str) {
        let Ok(cmd) = proto::parse::<ConnectResponse>(text) else {
            return;
        };
        match cmd.result {
            ConnectResult::Ok => {
                {
                    let mut caches = self.caches.lock();
                    caches.my_id = cmd.id;
                    caches.connection_id = cmd.connection_id;
                    caches.my_name = cmd.name.clone();
                    caches.secure_key = cmd.secure_key.clone();
                    caches.server_version = cmd.server_version;
                    caches.options = cmd.options;
                    caches.grants = cmd.grants;
                    caches.max_output_bitrate = cmd.max_output_bitrate;
                    caches.reduced_frame_rate = cmd.reduced_frame_rate;
                }
                info!(
                    "Controller :: logon ok, id: {}, connection id: {}, server version: {}",
                    cmd.id, cmd.connection_id, cmd.server_version
                );
                self.set_state(ClientState::Online);
            }
            ConnectResult::Redirected => {
                self.set_state(ClientState::ServerChangedRedirect);
                self.emit(ClientEvent::ServerChanged(cmd.redirect_url.clone()));
                if !cmd.redirect_url.is_empty() {
                    self.signaling.change_server(&cmd.redirect_url);
                    self.set_state(ClientState::Connecting);
                }
            }
            ConnectResult::InvalidCredentials => {
                self.set_state(ClientState::AuthNeeded);
                self.emit(ClientEvent::AuthFailed(AuthFailReason::BadCredentials));
            }
            ConnectResult::NoCredentials => {
                self.set_state(ClientState::AuthNeeded);
                self.emit(ClientEvent::AuthFailed(AuthFailReason::NoCredentials));
            }
            other => {
                warn!("Controller :: logon refused: {other:?}");
                self.set_state(ClientState::Disconnected);
            }
        }
    }

    fn on_conference_response(&self, text: &str) {
        let Ok(cmd) = proto::parse::<ConnectToConferenceResponse>(text) else {
            return;
        };
        if cmd.result != ConferenceConnectResult::Ok {
            let reason = match cmd.result {
                ConferenceConnectResult::NotExists => "conference does not exist",
                ConferenceConnectResult::NotAllowed => "not allowed to join",
                ConferenceConnectResult::LicenseFull => "license is full",
                _ => "join refused",
            };
            self.emit(ClientEvent::ConferenceRefused { reason: reason.to_string() });
            return;
        }

        let conference = Conference {
            id: cmd.id,
            tag: cmd.tag.clone(),
            name: cmd.name.clone(),
            founder_id: cmd.founder_id,
            grants: cmd.grants,
            temp: cmd.temp,
            ..Conference::default()
        };
        *self.current_conference.lock() = Some(conference.clone());

        self.mixer.start(48_000);
        self.voice.start();
        self.voice.set_mic_level(self.config.lock().microphone_gain);
        self.capture_audio
            .set_device_notify_callback(Some(self.device_notify_callback()));
        self.start_audio_output_thread();
        self.set_state(ClientState::Conferencing);
        self.emit(ClientEvent::ConferenceJoined(conference));

        // Announce every registered local capturer; the server answers each
        // with a device_connect carrying the media address and key.
        let devices = self.local_devices.lock().clone();
        for device in devices {
            let ssrc = self.next_ssrc.fetch_add(1, Ordering::SeqCst);
            if matches!(device.device_type, DeviceType::Camera | DeviceType::Demonstration) {
                self.ensure_capture_video(&device);
            }
            self.signaling.send(proto::serialize(&DeviceParams {
                id: device.device_id,
                ssrc,
                device_type: device.device_type,
                ord: device.ord,
                name: device.name.clone(),
                metadata: String::new(),
                resolution: device.resolution.wire_value(),
                color_space: 0,
            }));
        }
    }

    fn ensure_capture_video(&self, device: &LocalDevice) {
        let mut sessions = self.capture_videos.lock();
        if sessions.contains_key(&device.device_id) {
            return;
        }
        let session = CaptureVideoSession::new(device.device_type);
        session.set_name(&device.name);
        session.set_resolution(device.resolution);
        session.set_device_notify_callback(Some(self.device_notify_callback()));
        sessions.insert(device.device_id, session);
    }

    fn device_notify_callback(&self) -> DeviceNotifyCallback {
        let event_tx = self.event_tx.clone();
        Arc::new(move |notify: DeviceNotify| {
            let _ = event_tx.send(ClientEvent::DeviceNotify(notify));
        })
    }

    fn on_device_connect(&self, cmd: DeviceConnect) {
        let Ok(peer) = self.media_address(&cmd.address, cmd.port) else {
            error!("Controller :: device_connect with unresolvable address {}", cmd.address);
            return;
        };
        let secure_key = if cmd.secure_key.is_empty() {
            self.caches.lock().secure_key.clone()
        } else {
            cmd.secure_key.clone()
        };

        let wsm = if self.use_wsm.load(Ordering::SeqCst) {
            Some((
                self.config.lock().server_address.clone(),
                secure_key.clone(),
                format!("{}:{}", cmd.address, cmd.port),
            ))
        } else {
            None
        };

        if cmd.my {
            // Routing information for one of our own capturers.
            match cmd.device_type {
                DeviceType::Microphone => {
                    match &wsm {
                        Some((addr, token, dest)) => {
                            self.capture_audio.set_wsm_params(addr, token, dest)
                        }
                        None => self.capture_audio.set_rtp_params(peer),
                    }
                    self.capture_audio.start(cmd.author_ssrc, cmd.device_id, &secure_key);
                }
                DeviceType::Camera | DeviceType::Demonstration => {
                    if let Some(session) = self.capture_videos.lock().get(&cmd.device_id) {
                        match &wsm {
                            Some((addr, token, dest)) => session.set_wsm_params(addr, token, dest),
                            None => session.set_rtp_params(peer),
                        }
                        session.start(cmd.author_ssrc, cmd.device_id, &secure_key);
                    }
                }
                _ => {}
            }
            return;
        }

        // A remote device: bring up the matching renderer session.
        match cmd.device_type {
            DeviceType::Microphone => {
                let mut sessions = self.renderer_audios.lock();
                if sessions.contains_key(&cmd.author_ssrc) {
                    return;
                }
                let session = RendererAudioSession::new(self.time_meter.clone(), self.mixer.clone());
                session.set_name(&cmd.name);
                session.set_client_id(cmd.client_id);
                session.set_device_notify_callback(Some(self.device_notify_callback()));
                match &wsm {
                    Some((addr, token, dest)) => session.set_wsm_params(addr, token, dest),
                    None => session.set_rtp_params(peer),
                }
                let config = self.config.lock();
                session.set_volume(config.renderer_volume);
                if !config.renderer_enabled {
                    session.set_mute(true);
                }
                drop(config);
                session.start(cmd.receiver_ssrc, cmd.author_ssrc, cmd.device_id, &secure_key);
                sessions.insert(cmd.author_ssrc, session);
            }
            DeviceType::Camera | DeviceType::Demonstration => {
                let mut sessions = self.renderer_videos.lock();
                if sessions.contains_key(&cmd.author_ssrc) {
                    return;
                }
                let session = RendererVideoSession::new(self.time_meter.clone());
                session.set_name(&cmd.name);
                session.set_client_id(cmd.client_id);
                session.set_device_notify_callback(Some(self.device_notify_callback()));
                match &wsm {
                    Some((addr, token, dest)) => session.set_wsm_params(addr, token, dest),
                    None => session.set_rtp_params(peer),
                }
                session.set_resolution(Resolution::from_wire(cmd.resolution));
                session.set_recorder(Some(self.recorder.media_sink()));

                let back = Arc::downgrade(&session);
                let request: KeyFrameRequest = Arc::new(move |seq| {
                    if let Some(session) = back.upgrade() {
                        session.send_force_key_frame(seq);
                    }
                });
                self.recorder.add_video(
                    cmd.author_ssrc,
                    cmd.client_id,
                    if cmd.device_type == DeviceType::Demonstration { 2 } else { 1 },
                    Resolution::from_wire(cmd.resolution),
                    Some(request),
                );

                session.start(cmd.receiver_ssrc, cmd.author_ssrc, cmd.device_id, &secure_key);
                sessions.insert(cmd.author_ssrc, session);
            }
            _ => return,
        }

        // Ask the server to route the author's stream to this client.
        self.signaling.send(proto::serialize(&RendererConnect {
            device_type: cmd.device_type,
            author_ssrc: cmd.author_ssrc,
            client_id: cmd.client_id,
        }));
    }

    fn on_device_disconnect(&self, cmd: DeviceDisconnect) {
        match cmd.device_type {
            DeviceType::Microphone => {
                if let Some(session) = self.renderer_audios.lock().remove(&cmd.author_ssrc) {
                    session.stop();
                    self.signaling.send(proto::serialize(&RendererDisconnect {
                        device_type: cmd.device_type,
                        author_ssrc: cmd.author_ssrc,
                        client_id: cmd.client_id,
                    }));
                } else if self.capture_audio.device_id() == cmd.device_id {
                    self.capture_audio.stop();
                }
            }
            DeviceType::Camera | DeviceType::Demonstration => {
                if let Some(session) = self.renderer_videos.lock().remove(&cmd.author_ssrc) {
                    self.recorder.delete_video(cmd.author_ssrc);
                    session.stop();
                    self.signaling.send(proto::serialize(&RendererDisconnect {
                        device_type: cmd.device_type,
                        author_ssrc: cmd.author_ssrc,
                        client_id: cmd.client_id,
                    }));
                } else if let Some(session) = self.capture_videos.lock().remove(&cmd.device_id) {
                    session.stop();
                }
            }
            _ => {}
        }
    }

    /// Resolve the media peer, mapping it through a tunnel pipe when the
    /// tunnel fallback is active.
    fn media_address(&self, host: &str, port: u16) -> Result<Address> {
        if self.use_tunnel.load(Ordering::SeqCst) {
            let local_port = self.tunnel.create_pipe(port)?;
            return Ok(Address::resolve("127.0.0.1", local_port)?);
        }
        Ok(Address::resolve(host, port)?)
    }

    fn on_resolution_change(&self, cmd: ResolutionChange) {
        let resolution = Resolution::from_wire(cmd.resolution);
        for session in self.renderer_videos.lock().values() {
            if session.device_id() == cmd.id {
                session.set_resolution(resolution);
                self.recorder.change_video_resolution(session.author_ssrc(), resolution);
            }
        }
    }

    fn on_member_action(&self, cmd: MemberActionCommand) {
        let my_id = self.caches.lock().my_id;
        if cmd.ids.contains(&my_id) {
            match cmd.action {
                MemberAction::MuteMicrophone => self.capture_audio.set_mute(true),
                MemberAction::TurnMicrophone => {
                    let muted = self.capture_audio.mute();
                    self.capture_audio.set_mute(!muted);
                }
                MemberAction::TurnCamera => {
                    for session in self.capture_videos.lock().values() {
                        if session.is_started() {
                            session.pause();
                        } else {
                            session.resume();
                        }
                    }
                }
                MemberAction::TurnSpeaker => {
                    let enabled = {
                        let mut config = self.config.lock();
                        config.renderer_enabled = !config.renderer_enabled;
                        config.renderer_enabled
                    };
                    for session in self.renderer_audios.lock().values() {
                        session.set_mute(!enabled);
                    }
                }
                MemberAction::EnableRemoteControl | MemberAction::DisableRemoteControl => {
                    let enable = cmd.action == MemberAction::EnableRemoteControl;
                    for session in self.capture_videos.lock().values() {
                        if session.device_type() == DeviceType::Demonstration {
                            session.set_rc_actions(enable);
                        }
                    }
                }
                MemberAction::DisconnectFromConference => self.teardown_conference(true),
                _ => {}
            }
        }
    }

    fn apply_member_updates(&self, updates: &[Member]) {
        let mut members = self.members.lock();
        for update in updates {
            if let Some(member) = members.iter_mut().find(|m| m.id == update.id) {
                if update.deleted {
                    member.deleted = true;
                } else {
                    *member = update.clone();
                }
            } else if !update.deleted {
                members.push(update.clone());
            }
        }
    }

    /// Stop all sessions and (optionally) tell the server we left. Reverse
    /// of the join order: capture first, then renderers, then shared state.
    fn teardown_conference(&self, notify_server: bool) {
        if !self.conferencing.load(Ordering::SeqCst)
            && *self.state.lock() != ClientState::Conferencing
        {
            return;
        }

        self.capture_audio.stop();
        for (_, session) in self.capture_videos.lock().drain() {
            session.stop();
        }
        for (_, session) in self.renderer_audios.lock().drain() {
            session.stop();
        }
        for (_, session) in self.renderer_videos.lock().drain() {
            self.recorder.delete_video(session.author_ssrc());
            session.stop();
        }

        self.stop_audio_output_thread();
        self.voice.stop();
        self.mixer.stop();
        *self.current_conference.lock() = None;

        if notify_server {
            self.signaling.send(proto::serialize(&DisconnectFromConference {}));
        }
        self.set_state(ClientState::Online);
        self.emit(ClientEvent::ConferenceLeft);
    }

    /// The single audio output thread: pulls the mixer every 40 ms, feeds
    /// the recorder, the echo canceller's far-end reference and the platform
    /// output.
    fn start_audio_output_thread(&self) {
        if self.conferencing.swap(true, Ordering::SeqCst) {
            return;
        }

        let conferencing = self.conferencing.clone();
        let mixer = self.mixer.clone();
        let recorder = self.recorder.clone();
        let speaker_sink = self.voice.speaker_sink();
        let output = self.audio_output.lock().clone();

        let handle = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let mut next_tick = Instant::now();
                while conferencing.load(Ordering::SeqCst) {
                    next_tick += AUDIO_OUTPUT_TICK;

                    let samples = mixer.frame_size() / 2;
                    if samples > 0 {
                        let mut frame = vec![0i16; samples];
                        mixer.get_sound(&mut frame);

                        recorder.mixed_pcm(&frame);

                        // Far-end reference for the echo canceller.
                        let payload: Vec<u8> =
                            frame.iter().flat_map(|s| s.to_le_bytes()).collect();
                        let header = RtpHeader {
                            payload_type: RtpPayloadType::Pcm as u8,
                            ..RtpHeader::default()
                        };
                        speaker_sink.send_packet(
                            Packet::Rtp(RtpPacket::new(header, bytes::Bytes::from(payload))),
                            None,
                        );

                        if let Some(output) = &output {
                            output(&frame);
                        }
                    }

                    let now = Instant::now();
                    if next_tick > now {
                        std::thread::sleep(next_tick - now);
                    } else {
                        next_tick = now;
                    }
                }
            });
        *self.audio_thread.lock() = handle.ok();
    }

    fn stop_audio_output_thread(&self) {
        self.conferencing.store(false, Ordering::SeqCst);
        if let Some(handle) = self.audio_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn test_config(port: u16) -> ClientConfig {
        ClientConfig::new(format!("127.0.0.1:{port}")).with_credentials("u", "p")
    }

    async fn expect_state(
        events: &mut mpsc::UnboundedReceiver<ClientEvent>,
        wanted: ClientState,
    ) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event wait timed out")
                .expect("event stream closed")
            {
                ClientEvent::StateChanged(state) if state == wanted => return,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn signalling_handshake_reaches_online_with_cached_key() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                let WsMessage::Text(text) = message else { continue };
                if command_type(&text) == CommandType::ConnectRequest {
                    let request = proto::parse::<ConnectRequest>(&text).unwrap();
                    assert_eq!(request.login, "u");
                    assert_eq!(request.password, "p");
                    let response = proto::serialize(&ConnectResponse {
                        result: ConnectResult::Ok,
                        id: 7,
                        connection_id: 1,
                        name: "u".into(),
                        secure_key: "k".into(),
                        ..ConnectResponse::default()
                    });
                    ws.send(WsMessage::Text(response)).await.unwrap();
                }
            }
        });

        let (controller, mut events) = ClientController::new(test_config(port));
        controller.connect();

        expect_state(&mut events, ClientState::Online).await;
        assert_eq!(controller.state(), ClientState::Online);
        assert_eq!(controller.secure_key(), "k");
        assert_eq!(controller.my_id(), 7);

        controller.disconnect();
    }

    #[tokio::test]
    async fn bad_credentials_move_to_auth_needed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(WsMessage::Text(_))) = ws.next().await {
                let response = proto::serialize(&ConnectResponse {
                    result: ConnectResult::InvalidCredentials,
                    ..ConnectResponse::default()
                });
                ws.send(WsMessage::Text(response)).await.unwrap();
            }
        });

        let (controller, mut events) = ClientController::new(test_config(port));
        controller.connect();
        expect_state(&mut events, ClientState::AuthNeeded).await;
        controller.disconnect();
    }

    #[tokio::test]
    async fn device_connect_creates_exactly_one_renderer_per_remote_device() {
        let (controller, _events) = ClientController::new(test_config(1));
        // Drive the dispatcher directly; no server needed.
        *controller.inner.state.lock() = ClientState::Conferencing;

        let connect = proto::serialize(&DeviceConnect {
            device_type: DeviceType::Microphone,
            device_id: 4,
            client_id: 55,
            receiver_ssrc: 1000,
            author_ssrc: 2000,
            address: "127.0.0.1".into(),
            port: 5004,
            secure_key: "k".into(),
            ..DeviceConnect::default()
        });
        controller.handle_message_for_test(&connect);
        controller.handle_message_for_test(&connect); // duplicate is a no-op
        assert_eq!(controller.inner.renderer_audios.lock().len(), 1);
        assert_eq!(controller.inner.mixer.input_count(), 1);

        let disconnect = proto::serialize(&DeviceDisconnect {
            device_type: DeviceType::Microphone,
            device_id: 4,
            client_id: 55,
            author_ssrc: 2000,
        });
        controller.handle_message_for_test(&disconnect);
        assert!(controller.inner.renderer_audios.lock().is_empty());
        assert_eq!(controller.inner.mixer.input_count(), 0);
    }

    #[tokio::test]
    async fn member_updates_apply_in_place() {
        let (controller, _events) = ClientController::new(test_config(1));

        let list = proto::serialize(&ContactList {
            members: vec![Member { id: 1, name: "A".into(), ..Member::default() }],
            ..ContactList::default()
        });
        controller.handle_message_for_test(&list);
        assert_eq!(controller.members().len(), 1);

        let update = proto::serialize(&ChangeMemberState {
            members: vec![Member {
                id: 1,
                name: "A".into(),
                state: proto::MemberState::Conferencing,
                ..Member::default()
            }],
        });
        controller.handle_message_for_test(&update);
        assert_eq!(controller.members()[0].state, proto::MemberState::Conferencing);
    }
}
