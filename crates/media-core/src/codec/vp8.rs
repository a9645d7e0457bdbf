//! VP8 video codec stages over libvpx.
//!
//! The safe wrappers in the ecosystem expose none of the rate-control and
//! latency knobs this engine drives (error resilience, one-pass CBR with
//! tight buffers, forced keyframes, screen-content mode), so the encoder and
//! decoder talk to libvpx directly.

use std::os::raw::{c_int, c_long, c_uint};
use std::ptr;

use bytes::Bytes;
use vpx_sys as ffi;
use parking_lot::Mutex;
use tracing::{error, trace};

use confero_transport_core::socket::{Packet, PacketSink, SharedSink};
use confero_transport_core::{Address, RtpPacket, RtpPayloadType};

use crate::error::{Error, Result};
use crate::time::TimeMeter;
use crate::types::{ColorSpace, Resolution};

/// Minimum spacing between outbound force-keyframe requests per decoder.
const KEY_FRAME_FORCE_INTERVAL_MS: u32 = 200;

/// Back-channel used by decoders and the recorder to ask the producing
/// encoder for a keyframe.
pub type KeyFrameRequest = std::sync::Arc<dyn Fn(u16) + Send + Sync>;

/// VP8 frame header probe: bit 0 of the first three-octet word is the
/// inverse key-frame flag.
pub fn is_key_frame(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let word = (frame[2] as u32) << 16 | (frame[1] as u32) << 8 | frame[0] as u32;
    word & 0x1 == 0
}

fn codec_error(ctx: &mut ffi::vpx_codec_ctx_t, what: &str) -> Error {
    let detail = unsafe {
        let err = ffi::vpx_codec_error(ctx);
        if err.is_null() {
            String::new()
        } else {
            std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    };
    Error::Vp8(format!("{what}: {detail}"))
}

struct EncoderContext {
    ctx: ffi::vpx_codec_ctx_t,
    cfg: ffi::vpx_codec_enc_cfg_t,
    raw: *mut ffi::vpx_image_t,
}

unsafe impl Send for EncoderContext {}

impl Drop for EncoderContext {
    fn drop(&mut self) {
        unsafe {
            ffi::vpx_codec_destroy(&mut self.ctx);
            if !self.raw.is_null() {
                ffi::vpx_img_free(self.raw);
            }
        }
    }
}

struct VideoEncoderState {
    receiver: Option<SharedSink>,
    context: Option<EncoderContext>,
    force_key_frame: bool,
    resolution: Resolution,
    bitrate: u32,
    screen_content: bool,
}

/// One-pass CBR VP8 encoder tuned for conferencing latency.
pub struct VideoEncoder {
    state: Mutex<VideoEncoderState>,
}

impl VideoEncoder {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VideoEncoderState {
                receiver: None,
                context: None,
                force_key_frame: false,
                resolution: Resolution::HD,
                bitrate: 1024,
                screen_content: false,
            }),
        }
    }

    pub fn set_receiver(&self, receiver: Option<SharedSink>) {
        self.state.lock().receiver = receiver;
    }

    pub fn set_resolution(&self, resolution: Resolution) {
        let restart = {
            let mut state = self.state.lock();
            state.resolution = resolution;
            state.context.is_some()
        };
        if restart {
            self.stop();
            if let Err(e) = self.start() {
                error!("VideoEncoder :: restart error: {e}");
            }
        }
    }

    /// Live bitrate change through `vpx_codec_enc_config_set`.
    pub fn set_bitrate(&self, kbps: u32) {
        let mut state = self.state.lock();
        state.bitrate = kbps;
        if let Some(context) = state.context.as_mut() {
            context.cfg.rc_target_bitrate = kbps;
            let res = unsafe { ffi::vpx_codec_enc_config_set(&mut context.ctx, &context.cfg) };
            if res != ffi::vpx_codec_err_t::VPX_CODEC_OK {
                error!("VideoEncoder :: bitrate update rejected");
            }
        }
    }

    pub fn bitrate(&self) -> u32 {
        self.state.lock().bitrate
    }

    /// Screen-content mode 2 for demonstrations, 0 for camera video.
    pub fn set_screen_content(&self, yes: bool) {
        let mut state = self.state.lock();
        state.screen_content = yes;
        if let Some(context) = state.context.as_mut() {
            let mode: c_uint = if yes { 2 } else { 0 };
            unsafe {
                ffi::vpx_codec_control_(
                    &mut context.ctx,
                    ffi::vp8e_enc_control_id::VP8E_SET_SCREEN_CONTENT_MODE as c_int,
                    mode,
                );
            }
        }
    }

    pub fn force_key_frame(&self) {
        self.state.lock().force_key_frame = true;
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.context.is_some() {
            return Ok(());
        }

        let width = state.resolution.width();
        let height = state.resolution.height();

        unsafe {
            let mut cfg: ffi::vpx_codec_enc_cfg_t = std::mem::zeroed();
            let res = ffi::vpx_codec_enc_config_default(ffi::vpx_codec_vp8_cx(), &mut cfg, 0);
            if res != ffi::vpx_codec_err_t::VPX_CODEC_OK {
                return Err(Error::Vp8("cannot load default encoder config".into()));
            }

            cfg.g_w = width;
            cfg.g_h = height;
            cfg.rc_target_bitrate = state.bitrate;
            cfg.rc_end_usage = ffi::vpx_rc_mode::VPX_CBR;
            cfg.g_error_resilient =
                (ffi::VPX_ERROR_RESILIENT_DEFAULT | ffi::VPX_ERROR_RESILIENT_PARTITIONS) as _;
            cfg.g_timebase.num = 1;
            cfg.g_timebase.den = 50;
            cfg.g_threads = state.resolution.codec_threads();
            cfg.rc_dropframe_thresh = 0;
            cfg.g_pass = ffi::vpx_enc_pass::VPX_RC_ONE_PASS;
            cfg.rc_undershoot_pct = 95;
            cfg.rc_overshoot_pct = 5;
            cfg.g_lag_in_frames = 0;
            cfg.rc_buf_initial_sz = 500;
            cfg.rc_buf_optimal_sz = 600;
            cfg.rc_buf_sz = 1000;
            cfg.kf_mode = ffi::vpx_kf_mode::VPX_KF_DISABLED;

            let mut ctx: ffi::vpx_codec_ctx_t = std::mem::zeroed();
            let res = ffi::vpx_codec_enc_init_ver(
                &mut ctx,
                ffi::vpx_codec_vp8_cx(),
                &cfg,
                0,
                ffi::VPX_ENCODER_ABI_VERSION as c_int,
            );
            if res != ffi::vpx_codec_err_t::VPX_CODEC_OK {
                return Err(codec_error(&mut ctx, "encoder init failed"));
            }

            ffi::vpx_codec_control_(
                &mut ctx,
                ffi::vp8e_enc_control_id::VP8E_SET_STATIC_THRESHOLD as c_int,
                1 as c_uint,
            );
            ffi::vpx_codec_control_(
                &mut ctx,
                ffi::vp8e_enc_control_id::VP8E_SET_TOKEN_PARTITIONS as c_int,
                0 as c_uint,
            );
            ffi::vpx_codec_control_(
                &mut ctx,
                ffi::vp8e_enc_control_id::VP8E_SET_NOISE_SENSITIVITY as c_int,
                4 as c_uint,
            );
            ffi::vpx_codec_control_(
                &mut ctx,
                ffi::vp8e_enc_control_id::VP8E_SET_MAX_INTRA_BITRATE_PCT as c_int,
                max_intra_target(cfg.rc_buf_optimal_sz as u32, 25),
            );
            ffi::vpx_codec_control_(
                &mut ctx,
                ffi::vp8e_enc_control_id::VP8E_SET_ENABLEAUTOALTREF as c_int,
                1 as c_uint,
            );
            let screen_mode: c_uint = if state.screen_content { 2 } else { 0 };
            ffi::vpx_codec_control_(
                &mut ctx,
                ffi::vp8e_enc_control_id::VP8E_SET_SCREEN_CONTENT_MODE as c_int,
                screen_mode,
            );

            let raw = ffi::vpx_img_alloc(
                ptr::null_mut(),
                ffi::vpx_img_fmt::VPX_IMG_FMT_I420,
                width,
                height,
                1,
            );
            if raw.is_null() {
                ffi::vpx_codec_destroy(&mut ctx);
                return Err(Error::Vp8("cannot allocate encoder image".into()));
            }

            state.context = Some(EncoderContext { ctx, cfg, raw });
        }

        state.force_key_frame = true;
        Ok(())
    }

    pub fn stop(&self) {
        self.state.lock().context = None;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().context.is_some()
    }

    fn encode_frame(&self, packet: RtpPacket) {
        let mut state = self.state.lock();
        let resolution = state.resolution;
        if packet.payload.len() < resolution.i420_size() {
            error!(
                "VideoEncoder :: short frame, got {} bytes for {resolution}",
                packet.payload.len()
            );
            return;
        }
        let force = std::mem::take(&mut state.force_key_frame);
        let receiver = state.receiver.clone();
        let Some(context) = state.context.as_mut() else { return };

        let mut outputs = Vec::new();
        unsafe {
            let img = &mut *context.raw;
            copy_i420_into(&packet.payload, resolution, img);

            let mut flags: c_long = 0;
            if force {
                flags |= (ffi::VPX_EFLAG_FORCE_KF | ffi::VP8_EFLAG_NO_REF_LAST) as c_long;
            }

            let res = ffi::vpx_codec_encode(
                &mut context.ctx,
                context.raw,
                packet.header.seq as i64,
                1,
                flags,
                ffi::VPX_DL_REALTIME as _,
            );
            if res != ffi::vpx_codec_err_t::VPX_CODEC_OK {
                error!("VideoEncoder :: encode failed");
                return;
            }

            let mut iter: ffi::vpx_codec_iter_t = ptr::null();
            loop {
                let pkt = ffi::vpx_codec_get_cx_data(&mut context.ctx, &mut iter);
                if pkt.is_null() {
                    break;
                }
                if (*pkt).kind == ffi::vpx_codec_cx_pkt_kind::VPX_CODEC_CX_FRAME_PKT {
                    let frame = (*pkt).data.frame;
                    let data =
                        std::slice::from_raw_parts(frame.buf as *const u8, frame.sz as usize);
                    outputs.push(Bytes::copy_from_slice(data));
                }
            }
        }
        drop(state);

        let Some(receiver) = receiver else { return };
        for data in outputs {
            let mut header = packet.header;
            header.payload_type = RtpPayloadType::Vp8 as u8;
            receiver.send_packet(Packet::Rtp(RtpPacket::new(header, data)), None);
        }
    }
}

impl Default for VideoEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSink for VideoEncoder {
    fn send_packet(&self, packet: Packet, _addr: Option<&Address>) {
        if let Packet::Rtp(packet) = packet {
            if self.is_started() {
                self.encode_frame(packet);
            }
        }
    }
}

/// Keyframe bitrate cap: the optimal buffer level scaled against the frame
/// rate, floored at three times the per-frame bandwidth.
fn max_intra_target(optimal_buffer_size: u32, frame_rate: u32) -> c_uint {
    let scale_par = 0.5f32;
    let target_pct = (optimal_buffer_size as f32 * scale_par * frame_rate as f32 / 10.0) as u32;
    target_pct.max(300) as c_uint
}

unsafe fn copy_i420_into(payload: &[u8], resolution: Resolution, img: &mut ffi::vpx_image_t) {
    let width = resolution.width() as usize;
    let height = resolution.height() as usize;

    let mut offset = 0usize;
    for plane in 0..3usize {
        let (plane_w, plane_h) = if plane == 0 {
            (width, height)
        } else {
            (width.div_ceil(2), height.div_ceil(2))
        };
        let stride = img.stride[plane] as usize;
        let dst = img.planes[plane];
        for row in 0..plane_h {
            let src = &payload[offset..offset + plane_w];
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(row * stride), plane_w);
            offset += plane_w;
        }
    }
}

struct DecoderContext {
    ctx: ffi::vpx_codec_ctx_t,
}

unsafe impl Send for DecoderContext {}

impl Drop for DecoderContext {
    fn drop(&mut self) {
        unsafe {
            ffi::vpx_codec_destroy(&mut self.ctx);
        }
    }
}

struct VideoDecoderState {
    receiver: Option<SharedSink>,
    context: Option<DecoderContext>,
    key_frame_request: Option<KeyFrameRequest>,
    key_frame_needed: bool,
    last_force_time: Option<u32>,
    last_frame_seq: u16,
    resolution: Resolution,
    output: ColorSpace,
}

/// VP8 decoder with post-processing and error concealment. A sequence gap
/// marks the stream key-frame-needed: non-keyframes are dropped and a
/// force-keyframe request goes upstream, throttled per decoder.
pub struct VideoDecoder {
    state: Mutex<VideoDecoderState>,
    time_meter: TimeMeter,
}

impl VideoDecoder {
    pub fn new(time_meter: TimeMeter) -> Self {
        Self {
            state: Mutex::new(VideoDecoderState {
                receiver: None,
                context: None,
                key_frame_request: None,
                key_frame_needed: true,
                last_force_time: None,
                last_frame_seq: 0,
                resolution: Resolution::VGA,
                output: ColorSpace::I420,
            }),
            time_meter,
        }
    }

    pub fn set_receiver(&self, receiver: Option<SharedSink>) {
        self.state.lock().receiver = receiver;
    }

    /// Install the back-channel that carries force-keyframe requests to the
    /// producing encoder.
    pub fn set_key_frame_request(&self, request: Option<KeyFrameRequest>) {
        self.state.lock().key_frame_request = request;
    }

    pub fn set_resolution(&self, resolution: Resolution) {
        let restart = {
            let mut state = self.state.lock();
            state.resolution = resolution;
            state.context.is_some()
        };
        if restart {
            let output = self.state.lock().output;
            self.stop();
            if let Err(e) = self.start(output) {
                error!("VideoDecoder :: restart error: {e}");
            }
        }
    }

    pub fn start(&self, output: ColorSpace) -> Result<()> {
        let mut state = self.state.lock();
        if state.context.is_some() {
            return Ok(());
        }
        state.output = output;

        unsafe {
            let cfg = ffi::vpx_codec_dec_cfg_t {
                threads: state.resolution.codec_threads(),
                w: state.resolution.width(),
                h: state.resolution.height(),
            };
            let mut ctx: ffi::vpx_codec_ctx_t = std::mem::zeroed();
            let res = ffi::vpx_codec_dec_init_ver(
                &mut ctx,
                ffi::vpx_codec_vp8_dx(),
                &cfg,
                (ffi::VPX_CODEC_USE_POSTPROC | ffi::VPX_CODEC_USE_ERROR_CONCEALMENT) as _,
                ffi::VPX_DECODER_ABI_VERSION as c_int,
            );
            if res != ffi::vpx_codec_err_t::VPX_CODEC_OK {
                return Err(codec_error(&mut ctx, "decoder init failed"));
            }
            state.context = Some(DecoderContext { ctx });
        }

        state.last_frame_seq = 0;
        state.last_force_time = None;
        state.key_frame_needed = true;
        Ok(())
    }

    pub fn stop(&self) {
        self.state.lock().context = None;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().context.is_some()
    }

    fn request_key_frame(&self, state: &mut VideoDecoderState, seq: u16) {
        let now = self.time_meter.measure_ms();
        match state.last_force_time {
            Some(at) if at + KEY_FRAME_FORCE_INTERVAL_MS > now => {} // throttled
            _ => {
                if let Some(request) = state.key_frame_request.clone() {
                    trace!("VideoDecoder :: requesting key frame, seq: {seq}");
                    request(seq);
                }
                state.last_force_time = Some(now);
            }
        }
    }

    fn decode(&self, packet: RtpPacket) {
        let mut state = self.state.lock();
        if state.context.is_none() {
            return;
        }

        // A gap means reference frames are gone until the next keyframe.
        if state.last_frame_seq != 0
            && packet.header.seq != 0
            && state.last_frame_seq.wrapping_add(1) != packet.header.seq
        {
            state.key_frame_needed = true;
        }
        state.last_frame_seq = packet.header.seq;

        if state.key_frame_needed {
            if !packet.payload.is_empty() && is_key_frame(&packet.payload) {
                state.key_frame_needed = false;
            } else {
                let seq = state.last_frame_seq;
                return self.request_key_frame(&mut state, seq);
            }
        }

        let output = state.output;
        let resolution = state.resolution;
        let receiver = state.receiver.clone();

        let mut frames = Vec::new();
        let mut decode_failed = false;
        if let Some(context) = state.context.as_mut() {
            unsafe {
                let res = ffi::vpx_codec_decode(
                    &mut context.ctx,
                    packet.payload.as_ptr(),
                    packet.payload.len() as c_uint,
                    ptr::null_mut(),
                    0,
                );
                if res != ffi::vpx_codec_err_t::VPX_CODEC_OK {
                    decode_failed = true;
                } else {
                    let mut iter: ffi::vpx_codec_iter_t = ptr::null();
                    loop {
                        let img = ffi::vpx_codec_get_frame(&mut context.ctx, &mut iter);
                        if img.is_null() {
                            break;
                        }
                        if let Some(frame) = convert_frame(&*img, output, resolution) {
                            frames.push(frame);
                        }
                    }
                }
            }
        }

        if decode_failed {
            error!("VideoDecoder :: decode failed, requesting key frame");
            let seq = state.last_frame_seq;
            return self.request_key_frame(&mut state, seq);
        }
        drop(state);

        let Some(receiver) = receiver else { return };
        for frame in frames {
            receiver.send_packet(Packet::Rtp(RtpPacket::new(packet.header, frame)), None);
        }
    }
}

impl PacketSink for VideoDecoder {
    fn send_packet(&self, packet: Packet, _addr: Option<&Address>) {
        if let Packet::Rtp(packet) = packet {
            self.decode(packet);
        }
    }
}

/// Repack a decoded libvpx image into the configured output layout.
unsafe fn convert_frame(
    img: &ffi::vpx_image_t,
    output: ColorSpace,
    resolution: Resolution,
) -> Option<Bytes> {
    let width = img.d_w as usize;
    let height = img.d_h as usize;
    if width * height * output.bytes_per_pixel()
        > resolution.width() as usize * resolution.height() as usize * 4
    {
        return None;
    }

    match output {
        ColorSpace::I420 => {
            let mut out = Vec::with_capacity(width * height * 3 / 2);
            for plane in 0..3usize {
                let (plane_w, plane_h) = if plane == 0 {
                    (width, height)
                } else {
                    (width.div_ceil(2), height.div_ceil(2))
                };
                let stride = img.stride[plane] as usize;
                for row in 0..plane_h {
                    let src = std::slice::from_raw_parts(
                        img.planes[plane].add(row * stride) as *const u8,
                        plane_w,
                    );
                    out.extend_from_slice(src);
                }
            }
            Some(Bytes::from(out))
        }
        ColorSpace::Rgb24 | ColorSpace::Rgb32 => {
            let bpp = if output == ColorSpace::Rgb24 { 3 } else { 4 };
            let mut out = vec![0u8; width * height * bpp];
            let y_stride = img.stride[0] as usize;
            let u_stride = img.stride[1] as usize;
            let v_stride = img.stride[2] as usize;
            for row in 0..height {
                for col in 0..width {
                    let y = *img.planes[0].add(row * y_stride + col) as f32;
                    let u = *img.planes[1].add((row / 2) * u_stride + col / 2) as f32 - 128.0;
                    let v = *img.planes[2].add((row / 2) * v_stride + col / 2) as f32 - 128.0;

                    let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
                    let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
                    let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;

                    let at = (row * width + col) * bpp;
                    out[at] = r;
                    out[at + 1] = g;
                    out[at + 2] = b;
                    if bpp == 4 {
                        out[at + 3] = 255;
                    }
                }
            }
            Some(Bytes::from(out))
        }
    }
}
