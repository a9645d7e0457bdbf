//! Conference recorder.
//!
//! Muxes one selected VP8 video track and the mixed Opus audio into a WebM
//! file, or just the mixed PCM into an MP3. Video source selection follows
//! the active speaker: the highest-priority registered video of the speaking
//! client wins, and when the speaker publishes no video a fake black 720p
//! channel keeps the track alive. Switching sources resets the key-frame
//! gate and asks the selected encoder for a fresh keyframe.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use confero_media_core::codec::{is_key_frame, AudioEncoder, KeyFrameRequest, VideoEncoder};
use confero_media_core::Resolution;
use confero_transport_core::socket::{FnSink, Packet, PacketSink, SharedSink};
use confero_transport_core::{Address, RtpHeader, RtpPacket, RtpPayloadType};

use crate::error::{ClientError, Result};

/// Audio timestamp step per mixed frame, 10 ms in nanoseconds.
const AUDIO_FRAME_STEP_NS: u64 = 10_000_000;

/// The fake channel's SSRC; a real stream never uses zero.
const FAKE_SSRC: u32 = 0;

/// One candidate video source.
#[derive(Clone)]
pub struct VideoChannel {
    pub ssrc: u32,
    pub client_id: i64,
    pub priority: i32,
    pub resolution: Resolution,
    pub key_frame_request: Option<KeyFrameRequest>,
}

enum Sink {
    Webm {
        segment: webm::mux::Segment<webm::mux::Writer<File>>,
        video_track: webm::mux::VideoTrack,
        audio_track: webm::mux::AudioTrack,
    },
    Mp3 {
        encoder: mp3lame_encoder::Encoder,
        file: File,
    },
}

struct WriterState {
    sink: Sink,
    ts_ns: u64,
    has_key_frame: bool,
}

/// WebM / MP3 conference recorder.
pub struct Recorder {
    writer: Mutex<Option<WriterState>>,
    videos: RwLock<HashMap<u32, VideoChannel>>,
    current: Mutex<VideoChannel>,
    audio_encoder: Arc<AudioEncoder>,
    fake_encoder: Arc<VideoEncoder>,
    fake_frame: Bytes,
    runned: AtomicBool,
    mp3_mode: AtomicBool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        let fake_resolution = Resolution::HD;
        let recorder = Arc::new(Self {
            writer: Mutex::new(None),
            videos: RwLock::new(HashMap::new()),
            current: Mutex::new(VideoChannel {
                ssrc: FAKE_SSRC,
                client_id: -1,
                priority: 0,
                resolution: fake_resolution,
                key_frame_request: None,
            }),
            audio_encoder: Arc::new(AudioEncoder::new()),
            fake_encoder: Arc::new(VideoEncoder::new()),
            // Black I420: luma 16 would be studio black, the deployed fake
            // frame uses mid-chroma 0x80 fill everywhere.
            fake_frame: Bytes::from(vec![0x80u8; fake_resolution.i420_size()]),
            runned: AtomicBool::new(false),
            mp3_mode: AtomicBool::new(false),
        });

        // Both internal encoders deliver straight back into the muxer.
        let weak = Arc::downgrade(&recorder);
        let self_sink: SharedSink = Arc::new(FnSink(move |packet, _| {
            if let Some(recorder) = weak.upgrade() {
                if let Packet::Rtp(rtp) = packet {
                    recorder.on_media(rtp);
                }
            }
        }));
        recorder.audio_encoder.set_receiver(Some(self_sink.clone()));
        recorder.fake_encoder.set_receiver(Some(self_sink));
        recorder.fake_encoder.set_resolution(fake_resolution);

        recorder
    }

    /// Everything the renderer sessions tap into the recorder arrives here.
    pub fn media_sink(self: &Arc<Self>) -> SharedSink {
        let weak = Arc::downgrade(self);
        Arc::new(FnSink(move |packet, _| {
            if let Some(recorder) = weak.upgrade() {
                if let Packet::Rtp(rtp) = packet {
                    recorder.on_media(rtp);
                }
            }
        }))
    }

    pub fn start(&self, path: &str, mp3_mode: bool) -> Result<()> {
        if self.runned.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.mp3_mode.store(mp3_mode, Ordering::SeqCst);

        if mp3_mode {
            let file = File::create(path)?;
            let mut builder = mp3lame_encoder::Builder::new()
                .ok_or_else(|| ClientError::Recorder("cannot create mp3 encoder".into()))?;
            builder
                .set_num_channels(1)
                .map_err(|e| ClientError::Recorder(format!("mp3 channels: {e:?}")))?;
            builder
                .set_sample_rate(48_000)
                .map_err(|e| ClientError::Recorder(format!("mp3 sample rate: {e:?}")))?;
            builder
                .set_brate(mp3lame_encoder::Birtate::Kbps128)
                .map_err(|e| ClientError::Recorder(format!("mp3 bitrate: {e:?}")))?;
            let encoder = builder
                .build()
                .map_err(|e| ClientError::Recorder(format!("mp3 build: {e:?}")))?;

            *self.writer.lock() = Some(WriterState {
                sink: Sink::Mp3 { encoder, file },
                ts_ns: 0,
                has_key_frame: false,
            });
            self.runned.store(true, Ordering::SeqCst);
            info!("Recorder started in mp3 only mode, writing file: {path}");
            return Ok(());
        }

        let file = File::create(path)?;
        let mut segment = webm::mux::Segment::new(webm::mux::Writer::new(file))
            .ok_or_else(|| ClientError::Recorder("cannot initialize webm muxer".into()))?;

        let resolution = self.current.lock().resolution;
        let video_track = segment.add_video_track(
            resolution.width(),
            resolution.height(),
            None,
            webm::mux::VideoCodecId::VP8,
        );
        let audio_track =
            segment.add_audio_track(48_000, 1, None, webm::mux::AudioCodecId::Opus);

        *self.writer.lock() = Some(WriterState {
            sink: Sink::Webm { segment, video_track, audio_track },
            ts_ns: 0,
            has_key_frame: false,
        });

        self.audio_encoder
            .start()
            .map_err(|e| ClientError::Recorder(format!("audio encoder: {e}")))?;
        self.fake_encoder
            .start()
            .map_err(|e| ClientError::Recorder(format!("fake video encoder: {e}")))?;

        self.runned.store(true, Ordering::SeqCst);
        info!("Recorder started in normal mode, writing file: {path}");
        Ok(())
    }

    pub fn stop(&self) {
        if !self.runned.swap(false, Ordering::SeqCst) {
            return;
        }

        self.audio_encoder.stop();
        self.fake_encoder.stop();

        let Some(state) = self.writer.lock().take() else { return };
        match state.sink {
            Sink::Webm { segment, .. } => {
                let duration_ms = state.ts_ns / 1_000_000;
                if !segment.finalize(Some(duration_ms)) {
                    error!("Recorder :: webm finalize failed");
                }
                info!("Recorder ended (normal mode)");
            }
            Sink::Mp3 { mut encoder, mut file } => {
                let mut out = Vec::with_capacity(8192);
                if let Ok(size) = encoder.flush::<mp3lame_encoder::FlushNoGap>(out.spare_capacity_mut()) {
                    unsafe { out.set_len(size) };
                    let _ = file.write_all(&out);
                }
                info!("Recorder ended (mp3 mode)");
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.runned.load(Ordering::SeqCst)
    }

    /// Register a candidate video source. Becomes current immediately when
    /// it outranks the current choice for the same client, or when nothing
    /// real is selected yet.
    pub fn add_video(
        &self,
        ssrc: u32,
        client_id: i64,
        priority: i32,
        resolution: Resolution,
        key_frame_request: Option<KeyFrameRequest>,
    ) {
        if self.mp3_mode.load(Ordering::SeqCst) {
            return;
        }

        let channel =
            VideoChannel { ssrc, client_id, priority, resolution, key_frame_request };
        {
            let mut videos = self.videos.write();
            if videos.contains_key(&ssrc) {
                return;
            }
            videos.insert(ssrc, channel.clone());
        }
        info!("Recorder::add_video (ssrc: {ssrc}, client_id: {client_id}, priority: {priority})");

        let mut current = self.current.lock();
        if (current.client_id == client_id && current.priority < priority)
            || current.ssrc == FAKE_SSRC
        {
            *current = channel;
            if let Some(state) = self.writer.lock().as_mut() {
                state.has_key_frame = false;
            }
            debug!("Recorder :: current video channel now ssrc {ssrc}");
        }
    }

    pub fn change_video_resolution(&self, ssrc: u32, resolution: Resolution) {
        if self.mp3_mode.load(Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = self.videos.write().get_mut(&ssrc) {
            channel.resolution = resolution;
        }
        let mut current = self.current.lock();
        if current.ssrc == ssrc {
            current.resolution = resolution;
        }
    }

    pub fn delete_video(&self, ssrc: u32) {
        if self.mp3_mode.load(Ordering::SeqCst) {
            return;
        }
        let client_id = {
            let mut videos = self.videos.write();
            if videos.remove(&ssrc).is_none() {
                return;
            }
            let current = self.current.lock();
            if current.ssrc == ssrc {
                current.client_id
            } else {
                return;
            }
        };
        info!("Recorder::delete_video (ssrc: {ssrc}, client_id: {client_id})");
        self.speaker_changed(client_id);
    }

    /// Re-select the current track to the speaking client's best video, or
    /// the fake channel when that client publishes none.
    pub fn speaker_changed(&self, client_id: i64) {
        if self.mp3_mode.load(Ordering::SeqCst) {
            return;
        }

        let mut selected: Option<VideoChannel> = None;
        {
            let videos = self.videos.read();
            for channel in videos.values() {
                if channel.client_id == client_id
                    && selected.as_ref().map_or(true, |best| channel.priority > best.priority)
                {
                    selected = Some(channel.clone());
                }
            }
        }

        let channel = selected.unwrap_or_else(|| {
            debug!("Recorder::speaker_changed to fake channel (client_id: {client_id})");
            VideoChannel {
                ssrc: FAKE_SSRC,
                client_id,
                priority: 0,
                resolution: Resolution::HD,
                key_frame_request: None,
            }
        });

        *self.current.lock() = channel;
        if let Some(state) = self.writer.lock().as_mut() {
            state.has_key_frame = false;
        }
        self.fake_encoder.force_key_frame();
        debug!("Recorder::speaker_changed to client_id: {client_id}");
    }

    pub fn current_ssrc(&self) -> u32 {
        self.current.lock().ssrc
    }

    /// Mixed PCM from the audio output thread, one frame per call.
    pub fn mixed_pcm(&self, pcm: &[i16]) {
        if !self.runned.load(Ordering::SeqCst) {
            return;
        }

        if self.mp3_mode.load(Ordering::SeqCst) {
            let mut writer = self.writer.lock();
            let Some(state) = writer.as_mut() else { return };
            if let Sink::Mp3 { encoder, file } = &mut state.sink {
                let mut out =
                    Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(pcm.len()));
                match encoder.encode(mp3lame_encoder::MonoPcm(pcm), out.spare_capacity_mut()) {
                    Ok(size) => {
                        unsafe { out.set_len(size) };
                        if let Err(e) = file.write_all(&out) {
                            error!("Recorder :: mp3 write error: {e}");
                        }
                    }
                    Err(e) => error!("Recorder :: mp3 encode error: {e:?}"),
                }
            }
            return;
        }

        // WebM mode: run the mixed frame through the recorder's own Opus
        // encoder; the encoded packet comes back through on_media.
        let payload: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
        self.audio_encoder.send_packet(
            Packet::Rtp(RtpPacket::new(RtpHeader::default(), Bytes::from(payload))),
            None,
        );
    }

    fn on_media(&self, packet: RtpPacket) {
        if !self.runned.load(Ordering::SeqCst) || packet.payload.is_empty() {
            return;
        }

        match RtpPayloadType::from_u8(packet.header.payload_type) {
            Some(RtpPayloadType::Opus) => {
                // Keep the video track alive when the speaker has no camera.
                if self.current_ssrc() == FAKE_SSRC {
                    self.generate_fake_video();
                }

                let mut writer = self.writer.lock();
                let Some(state) = writer.as_mut() else { return };
                if let Sink::Webm { audio_track, .. } = &mut state.sink {
                    if !audio_track.add_frame(&packet.payload, state.ts_ns, true) {
                        error!("Recorder :: audio add_frame failed");
                    }
                    state.ts_ns += AUDIO_FRAME_STEP_NS;
                }
            }
            Some(RtpPayloadType::Vp8) => {
                if self.mp3_mode.load(Ordering::SeqCst) {
                    return;
                }
                let current = self.current.lock().clone();
                if packet.header.ssrc != current.ssrc {
                    return; // not the selected source
                }

                let is_key = is_key_frame(&packet.payload);
                let mut writer = self.writer.lock();
                let Some(state) = writer.as_mut() else { return };

                if !state.has_key_frame && !is_key {
                    drop(writer);
                    if let Some(request) = current.key_frame_request {
                        request(packet.header.seq);
                    }
                    debug!("Recorder :: waiting for a key frame");
                    return;
                }
                state.has_key_frame = true;

                if let Sink::Webm { video_track, .. } = &mut state.sink {
                    if !video_track.add_frame(&packet.payload, state.ts_ns, is_key) {
                        error!("Recorder :: video add_frame failed");
                    }
                }
            }
            _ => {}
        }
    }

    fn generate_fake_video(&self) {
        let header = RtpHeader { ssrc: FAKE_SSRC, ..RtpHeader::default() };
        self.fake_encoder
            .send_packet(Packet::Rtp(RtpPacket::new(header, self.fake_frame.clone())), None);
    }
}

impl PacketSink for Recorder {
    fn send_packet(&self, packet: Packet, _addr: Option<&Address>) {
        if let Packet::Rtp(rtp) = packet {
            self.on_media(rtp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_counter() -> (KeyFrameRequest, Arc<std::sync::atomic::AtomicUsize>) {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = count.clone();
        (
            Arc::new(move |_| {
                counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
            count,
        )
    }

    #[test]
    fn speaker_without_video_selects_fake_channel() {
        let recorder = Recorder::new();
        let (request, _) = request_counter();
        recorder.add_video(1, 77, 1, Resolution::VGA, Some(request));
        assert_eq!(recorder.current_ssrc(), 1);

        // Client 88 publishes nothing: the fake channel takes over.
        recorder.speaker_changed(88);
        assert_eq!(recorder.current_ssrc(), FAKE_SSRC);

        // Back to a client with video.
        recorder.speaker_changed(77);
        assert_eq!(recorder.current_ssrc(), 1);
    }

    #[test]
    fn highest_priority_video_wins_for_a_client() {
        let recorder = Recorder::new();
        recorder.add_video(1, 77, 1, Resolution::VGA, None);
        recorder.add_video(2, 77, 5, Resolution::HD, None);
        recorder.speaker_changed(77);
        assert_eq!(recorder.current_ssrc(), 2);
    }

    #[test]
    fn delete_of_current_video_reselects() {
        let recorder = Recorder::new();
        recorder.add_video(1, 77, 5, Resolution::VGA, None);
        recorder.add_video(2, 77, 1, Resolution::VGA, None);
        assert_eq!(recorder.current_ssrc(), 1);
        recorder.delete_video(1);
        assert_eq!(recorder.current_ssrc(), 2);
    }

    #[test]
    fn webm_records_fake_video_and_audio() {
        let dir = std::env::temp_dir().join("confero-recorder-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.webm");

        let recorder = Recorder::new();
        recorder.start(path.to_str().unwrap(), false).unwrap();

        // Two mixed audio frames while nobody publishes video: the fake
        // channel must produce valid keyframes.
        let pcm = vec![0i16; 1920];
        recorder.mixed_pcm(&pcm);
        recorder.mixed_pcm(&pcm);
        recorder.stop();

        let written = std::fs::metadata(&path).unwrap().len();
        assert!(written > 0, "webm file is empty");
        std::fs::remove_file(&path).ok();
    }
}
