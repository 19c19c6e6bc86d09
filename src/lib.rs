use anyhow::{anyhow, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::DecoderOptions,
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<EngineState>>,
    control: Arc<Mutex<()>>,
    streams: Arc<Mutex<StreamSet>>,
    monitor: Arc<Mutex<Option<SessionMonitor>>>,
    active_generation: Arc<AtomicU64>,
    preload_epoch: Arc<AtomicU64>,
    stream_errors: Arc<AtomicU64>,
    loader: Arc<dyn TrackLoader>,
    backend: Arc<dyn StreamBackend>,
}

#[derive(Default)]
pub struct StreamSet {
    handles: Vec<StreamHandle>,
}

pub struct StreamHandle {
    device_id: usize,
    stream: Option<cpal::Stream>,
}

// cpal::Stream is !Send/Sync on some platforms; we guard access via a mutex.
unsafe impl Send for StreamSet {}
unsafe impl Sync for StreamSet {}

impl StreamSet {
    pub fn new(handles: Vec<StreamHandle>) -> Self {
        StreamSet { handles }
    }

    fn stop_all(self) {
        for handle in &self.handles {
            if let Some(stream) = &handle.stream {
                if let Err(err) = stream.pause() {
                    warn!("pause failed on device {}: {}", handle.device_id, err);
                }
            }
        }
        // dropping the handles tears the platform streams down; cpal joins the
        // callback on drop, so buffers released afterwards are never in use
    }
}

impl StreamHandle {
    pub fn new(device_id: usize, stream: Option<cpal::Stream>) -> Self {
        StreamHandle { device_id, stream }
    }
}

struct SessionMonitor {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SessionMonitor {
    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: usize,
    pub name: String,
    pub hostapi: String,
    pub default_samplerate: u32,
    pub max_output_channels: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: u64,
    pub file_ref: String,
    pub output_channel: u16,
    #[serde(default)]
    pub is_stereo: bool,
    #[serde(default = "default_gain")]
    pub gain: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongDescriptor {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub tempo: f64,
    pub tracks: Vec<TrackDescriptor>,
}

fn default_gain() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelSpec {
    List(Vec<u16>),
    Range(String),
}

impl ChannelSpec {
    fn resolve(&self) -> Result<Vec<u16>, EngineError> {
        match self {
            ChannelSpec::List(list) => {
                if list.is_empty() {
                    return Err(EngineError::Config("empty channel list".to_string()));
                }
                for &channel in list {
                    if channel == 0 {
                        return Err(EngineError::Config(
                            "channel numbers are 1-based".to_string(),
                        ));
                    }
                }
                let mut seen = list.clone();
                seen.sort_unstable();
                seen.dedup();
                if seen.len() != list.len() {
                    return Err(EngineError::Config(
                        "duplicate channel in device mapping".to_string(),
                    ));
                }
                Ok(list.clone())
            }
            ChannelSpec::Range(spec) => parse_channels(spec),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMapEntry {
    pub device_id: usize,
    pub logical_channels: ChannelSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOutputConfig {
    #[serde(default)]
    pub outputs: Vec<DeviceMapEntry>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_master_volume")]
    pub master_volume: f32,
    #[serde(default = "default_bus_size")]
    pub bus_size: u16,
    #[serde(default = "default_resample_quality")]
    pub resample_quality: String,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_master_volume() -> f32 {
    1.0
}

fn default_bus_size() -> u16 {
    DEFAULT_BUS_SIZE
}

fn default_resample_quality() -> String {
    "hq".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Playing,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct NowPlaying {
    pub song_id: u64,
    pub song_name: String,
    pub tempo: f64,
    pub duration_seconds: f64,
    pub index: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub state: SessionState,
    pub song_id: Option<u64>,
    pub song_name: Option<String>,
    pub elapsed_seconds: f64,
    pub duration_seconds: Option<f64>,
    pub index: Option<i64>,
    pub stream_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeReason {
    UnsupportedFormat,
    CorruptData,
    IoFailure,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{message}")]
    Decode { reason: DecodeReason, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("no usable audio output: {0}")]
    NoAudioDevice(String),
    #[error("engine is busy with another control call")]
    Busy,
}

impl EngineError {
    fn decode(reason: DecodeReason, message: impl Into<String>) -> Self {
        EngineError::Decode {
            reason,
            message: message.into(),
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            EngineError::Decode { .. } => "decode_error",
            EngineError::Config(_) => "config_error",
            EngineError::NoAudioDevice(_) => "no_audio_device",
            EngineError::Busy => "busy",
        }
    }

    fn http_status(&self) -> StatusCode {
        match self {
            EngineError::Decode { .. } | EngineError::Config(_) => StatusCode::BAD_REQUEST,
            EngineError::NoAudioDevice(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Busy => StatusCode::CONFLICT,
        }
    }
}

pub struct EngineHandle {
    shared: SharedState,
    server_thread: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl EngineHandle {
    pub fn new() -> Result<Self> {
        Ok(Self {
            shared: create_shared_state(),
            server_thread: Arc::new(Mutex::new(None)),
        })
    }

    pub fn start_http_server(&self, port: u16) -> Result<()> {
        let mut guard = self.server_thread.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let handle = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    error!("failed to build runtime: {}", err);
                    return;
                }
            };
            if let Err(err) = runtime.block_on(run_http_server(Some(shared), Some(port))) {
                error!("backline engine http server stopped: {}", err);
            }
        });
        *guard = Some(handle);
        Ok(())
    }

    pub fn configure(&self, config: DeviceOutputConfig) -> Result<(), EngineError> {
        configure_impl(&self.shared, config)
    }

    pub fn preload(&self, song: &SongDescriptor) -> Result<u64, EngineError> {
        preload_impl(&self.shared, song)
    }

    pub fn clear_preload(&self) {
        clear_preload_impl(&self.shared)
    }

    pub fn play(&self, song: &SongDescriptor, expected_index: Option<i64>) -> Result<NowPlaying, EngineError> {
        play_impl(&self.shared, song, expected_index)
    }

    pub fn stop(&self) -> Result<(), EngineError> {
        stop_impl(&self.shared)
    }

    pub fn status(&self) -> StatusView {
        status_impl(&self.shared)
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        enumerate_devices()
    }
}

const DEFAULT_SAMPLE_RATE: u32 = 48_000;
const DEFAULT_BUS_SIZE: u16 = 64;
const MAX_TRACK_GAIN: f32 = 2.0;
const MONO_DOWNMIX_SCALE: f32 = 0.707;
const MONITOR_POLL_MS: u64 = 25;
const CONVERT_SCRATCH_FRAMES: usize = 8_192;
const DEFAULT_HTTP_PORT: u16 = 55_560;

#[derive(Clone)]
struct AppliedConfig {
    sample_rate: u32,
    master_volume: f32,
    bus_size: u16,
    resample_quality: String,
}

struct PreloadSlot {
    song_id: u64,
    config_revision: u64,
    song: Arc<RoutedSong>,
}

struct ActiveSession {
    song: Arc<RoutedSong>,
    clock: Arc<SessionClock>,
    index: Option<i64>,
}

struct EngineState {
    session_state: SessionState,
    config: AppliedConfig,
    config_revision: u64,
    output_map: DeviceOutputMap,
    preload: Option<PreloadSlot>,
    session: Option<ActiveSession>,
}

pub fn create_shared_state() -> SharedState {
    create_shared_state_with(Arc::new(SymphoniaLoader), Arc::new(CpalStreamBackend))
}

pub fn create_shared_state_with(
    loader: Arc<dyn TrackLoader>,
    backend: Arc<dyn StreamBackend>,
) -> SharedState {
    SharedState {
        inner: Arc::new(Mutex::new(EngineState {
            session_state: SessionState::Idle,
            config: AppliedConfig {
                sample_rate: DEFAULT_SAMPLE_RATE,
                master_volume: 1.0,
                bus_size: DEFAULT_BUS_SIZE,
                resample_quality: "hq".to_string(),
            },
            config_revision: 0,
            output_map: DeviceOutputMap::empty(DEFAULT_BUS_SIZE),
            preload: None,
            session: None,
        })),
        control: Arc::new(Mutex::new(())),
        streams: Arc::new(Mutex::new(StreamSet::default())),
        monitor: Arc::new(Mutex::new(None)),
        active_generation: Arc::new(AtomicU64::new(0)),
        preload_epoch: Arc::new(AtomicU64::new(0)),
        stream_errors: Arc::new(AtomicU64::new(0)),
        loader,
        backend,
    }
}

#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
    pub duration: f64,
}

pub trait TrackLoader: Send + Sync {
    fn load(
        &self,
        file_ref: &str,
        target_rate: u32,
        want_stereo: bool,
        quality: &str,
    ) -> Result<DecodedAudio, EngineError>;
}

pub struct SymphoniaLoader;

impl TrackLoader for SymphoniaLoader {
    fn load(
        &self,
        file_ref: &str,
        target_rate: u32,
        want_stereo: bool,
        quality: &str,
    ) -> Result<DecodedAudio, EngineError> {
        let decoded = decode_file(file_ref)?;
        let want = if want_stereo { 2 } else { 1 };
        let coerced = coerce_channels(&decoded.samples, decoded.channels, want);
        let samples = if decoded.sample_rate != target_rate {
            resample_audio(&coerced, want, decoded.sample_rate, target_rate, quality).map_err(
                |err| {
                    EngineError::decode(
                        DecodeReason::UnsupportedFormat,
                        format!("resample {}: {}", file_ref, err),
                    )
                },
            )?
        } else {
            coerced
        };
        let frames = samples.len() / want;
        Ok(DecodedAudio {
            samples,
            sample_rate: target_rate,
            channels: want,
            duration: frames as f64 / target_rate as f64,
        })
    }
}

fn classify_probe_error(path: &str, err: SymphoniaError) -> EngineError {
    match err {
        SymphoniaError::IoError(io) => {
            EngineError::decode(DecodeReason::IoFailure, format!("read {}: {}", path, io))
        }
        SymphoniaError::Unsupported(what) => EngineError::decode(
            DecodeReason::UnsupportedFormat,
            format!("{}: unsupported format ({})", path, what),
        ),
        other => EngineError::decode(DecodeReason::CorruptData, format!("{}: {}", path, other)),
    }
}

fn decode_file(path: &str) -> Result<DecodedAudio, EngineError> {
    let file = File::open(path).map_err(|err| {
        EngineError::decode(DecodeReason::IoFailure, format!("open {}: {}", path, err))
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = Path::new(path).extension().and_then(|v| v.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|err| classify_probe_error(path, err))?;
    let mut format = probed.format;
    let track = format.default_track().ok_or_else(|| {
        EngineError::decode(
            DecodeReason::UnsupportedFormat,
            format!("{}: no default audio track", path),
        )
    })?;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
    let channels = codec_params.channels.map(|c| c.count()).unwrap_or(2).max(1);
    let gapless_delay = codec_params.delay.unwrap_or(0) as usize;
    let gapless_padding = codec_params.padding.unwrap_or(0) as usize;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|err| classify_probe_error(path, err))?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(err) => return Err(classify_probe_error(path, err)),
        };
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // a bad packet means a damaged file, not a shorter song
            Err(SymphoniaError::DecodeError(what)) => {
                return Err(EngineError::decode(
                    DecodeReason::CorruptData,
                    format!("{}: {}", path, what),
                ));
            }
            Err(SymphoniaError::ResetRequired) => {
                return Err(EngineError::decode(
                    DecodeReason::CorruptData,
                    format!("{}: codec reset mid-stream", path),
                ));
            }
            Err(err) => return Err(classify_probe_error(path, err)),
        };
        let spec = *decoded.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    if gapless_delay > 0 || gapless_padding > 0 {
        samples = apply_gapless_trim(samples, channels, gapless_delay, gapless_padding);
    }

    let frames = samples.len() / channels.max(1);
    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
        duration: if sample_rate > 0 {
            frames as f64 / sample_rate as f64
        } else {
            0.0
        },
    })
}

fn apply_gapless_trim(
    samples: Vec<f32>,
    channels: usize,
    delay_frames: usize,
    padding_frames: usize,
) -> Vec<f32> {
    let channels = channels.max(1);
    let frames = samples.len() / channels;
    let start = delay_frames.min(frames);
    let end = frames.saturating_sub(padding_frames).max(start);
    samples[start * channels..end * channels].to_vec()
}


fn coerce_channels(samples: &[f32], channels: usize, want: usize) -> Vec<f32> {
    if channels == 0 || samples.is_empty() {
        return Vec::new();
    }
    if channels == want {
        return samples.to_vec();
    }
    let frames = samples.len() / channels;
    let mut out = vec![0.0f32; frames * want];
    match want {
        1 => {
            if channels == 2 {
                for frame in 0..frames {
                    let base = frame * 2;
                    out[frame] = (samples[base] + samples[base + 1]) * 0.5;
                }
            } else {
                // surround sources fold to mono with a pad-law attenuation
                for frame in 0..frames {
                    let base = frame * channels;
                    let mut sum = 0.0f32;
                    for ch in 0..channels {
                        sum += samples[base + ch];
                    }
                    out[frame] = sum / channels as f32 * MONO_DOWNMIX_SCALE;
                }
            }
        }
        _ => {
            if channels == 1 {
                for frame in 0..frames {
                    out[frame * 2] = samples[frame];
                    out[frame * 2 + 1] = samples[frame];
                }
            } else {
                for frame in 0..frames {
                    let base = frame * channels;
                    out[frame * 2] = samples[base];
                    out[frame * 2 + 1] = samples[base + 1];
                }
            }
        }
    }
    out
}


fn normalize_resample_quality(value: &str) -> String {
    let normalized = value.to_lowercase();
    match normalized.as_str() {
        "low" | "std" | "hq" | "uhq" => normalized,
        _ => "hq".to_string(),
    }
}

fn get_sinc_params(quality: &str, ratio: f64) -> SincInterpolationParameters {
    let f_cutoff = if ratio < 1.0 { 0.90 } else { 0.95 };
    match quality {
        "low" => SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 64,
            window: WindowFunction::Hann,
        },
        "std" => SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::Blackman,
        },
        "hq" => SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        },
        _ => SincInterpolationParameters {
            sinc_len: 512,
            f_cutoff,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 512,
            window: WindowFunction::BlackmanHarris2,
        },
    }
}

fn resample_audio(
    data: &[f32],
    channels: usize,
    from_rate: u32,
    to_rate: u32,
    quality: &str,
) -> Result<Vec<f32>> {
    if data.is_empty() || channels == 0 || from_rate == 0 || to_rate == 0 {
        return Ok(data.to_vec());
    }
    if from_rate == to_rate {
        return Ok(data.to_vec());
    }

    let frames = data.len() / channels;
    if frames == 0 {
        return Ok(Vec::new());
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let params = get_sinc_params(quality, ratio);

    let mut waves_in: Vec<Vec<f64>> = vec![Vec::with_capacity(frames); channels];
    for frame in data.chunks_exact(channels) {
        for (ch, &sample) in frame.iter().enumerate() {
            waves_in[ch].push(sample as f64);
        }
    }

    let mut resampler = SincFixedIn::new(ratio, 2.0, params, frames, channels)
        .map_err(|err| anyhow!("resampler init failed: {}", err))?;
    let waves_out = resampler
        .process(&waves_in, None)
        .map_err(|err| anyhow!("resampler process failed: {}", err))?;

    let out_frames = waves_out.first().map_or(0, |v| v.len());
    let mut output = vec![0.0f32; out_frames * channels];
    for i in 0..out_frames {
        for (ch, channel_data) in waves_out.iter().enumerate() {
            if let Some(sample) = channel_data.get(i) {
                output[i * channels + ch] = *sample as f32;
            }
        }
    }

    Ok(output)
}


pub fn parse_channels(spec: &str) -> Result<Vec<u16>, EngineError> {
    let parse_one = |value: &str| -> Result<u16, EngineError> {
        let trimmed = value.trim();
        let channel = trimmed
            .parse::<u16>()
            .map_err(|_| EngineError::Config(format!("bad channel number {:?}", trimmed)))?;
        if channel == 0 {
            return Err(EngineError::Config("channel numbers are 1-based".to_string()));
        }
        Ok(channel)
    };

    let mut channels: Vec<u16> = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(EngineError::Config(format!(
                "empty segment in channel list {:?}",
                spec
            )));
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_one(lo)?;
                let hi = parse_one(hi)?;
                if hi < lo {
                    return Err(EngineError::Config(format!(
                        "reversed channel range {}-{}",
                        lo, hi
                    )));
                }
                channels.extend(lo..=hi);
            }
            None => channels.push(parse_one(part)?),
        }
    }
    channels.sort_unstable();
    channels.dedup();
    Ok(channels)
}

pub fn format_channels(channels: &[u16]) -> String {
    let mut sorted = channels.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut parts: Vec<String> = Vec::new();
    let mut i = 0usize;
    while i < sorted.len() {
        let start = sorted[i];
        let mut end = start;
        while i + 1 < sorted.len() && sorted[i + 1] == end + 1 {
            end = sorted[i + 1];
            i += 1;
        }
        if end > start {
            parts.push(format!("{}-{}", start, end));
        } else {
            parts.push(start.to_string());
        }
        i += 1;
    }
    parts.join(",")
}

pub fn normalize_channel_string(spec: &str) -> Result<String, EngineError> {
    Ok(format_channels(&parse_channels(spec)?))
}


#[derive(Debug, Clone)]
struct RoutedLane {
    // 0-based after the boundary conversion
    logical_channel: u16,
    samples: Vec<f32>,
}

#[derive(Debug, Clone)]
struct RoutedTrack {
    frames: usize,
    lanes: Vec<RoutedLane>,
}

fn validate_track_assignment(track: &TrackDescriptor, bus_size: u16) -> Result<(), EngineError> {
    let assigned = track.output_channel;
    if assigned == 0 || assigned > bus_size {
        return Err(EngineError::Config(format!(
            "track {}: output channel {} outside bus 1..={}",
            track.id, assigned, bus_size
        )));
    }
    if track.is_stereo && assigned == bus_size {
        return Err(EngineError::Config(format!(
            "track {}: stereo pair needs channels {} and {}, bus ends at {}",
            track.id,
            assigned,
            u32::from(assigned) + 1,
            bus_size
        )));
    }
    Ok(())
}

fn route_track(
    decoded: &DecodedAudio,
    track: &TrackDescriptor,
    bus_size: u16,
) -> Result<RoutedTrack, EngineError> {
    validate_track_assignment(track, bus_size)?;
    let assigned = track.output_channel;
    let gain = track.gain.clamp(0.0, MAX_TRACK_GAIN);
    let channels = decoded.channels.max(1);
    let frames = decoded.samples.len() / channels;
    let mut lanes = Vec::with_capacity(if track.is_stereo { 2 } else { 1 });
    if track.is_stereo {
        let right_offset = channels.min(2) - 1;
        let mut left = vec![0.0f32; frames];
        let mut right = vec![0.0f32; frames];
        for frame in 0..frames {
            let base = frame * channels;
            left[frame] = decoded.samples[base] * gain;
            right[frame] = decoded.samples[base + right_offset] * gain;
        }
        lanes.push(RoutedLane {
            logical_channel: assigned - 1,
            samples: left,
        });
        lanes.push(RoutedLane {
            logical_channel: assigned,
            samples: right,
        });
    } else {
        let mut lane = vec![0.0f32; frames];
        for frame in 0..frames {
            lane[frame] = decoded.samples[frame * channels] * gain;
        }
        lanes.push(RoutedLane {
            logical_channel: assigned - 1,
            samples: lane,
        });
    }
    Ok(RoutedTrack { frames, lanes })
}


#[derive(Debug, Clone)]
pub struct DeviceOutputMap {
    bus_size: u16,
    assignments: HashMap<u16, (usize, u16)>,
    widths: HashMap<usize, u16>,
}

impl DeviceOutputMap {
    fn empty(bus_size: u16) -> Self {
        DeviceOutputMap {
            bus_size,
            assignments: HashMap::new(),
            widths: HashMap::new(),
        }
    }

    pub fn build(entries: &[DeviceMapEntry], bus_size: u16) -> Result<Self, EngineError> {
        if bus_size == 0 {
            return Err(EngineError::Config("bus size must be at least 1".to_string()));
        }
        let mut assignments: HashMap<u16, (usize, u16)> = HashMap::new();
        let mut widths: HashMap<usize, u16> = HashMap::new();
        for entry in entries {
            if widths.contains_key(&entry.device_id) {
                return Err(EngineError::Config(format!(
                    "device {} appears twice in output mapping",
                    entry.device_id
                )));
            }
            let channels = entry.logical_channels.resolve()?;
            for (hw_index, &logical) in channels.iter().enumerate() {
                if logical > bus_size {
                    return Err(EngineError::Config(format!(
                        "device {}: logical channel {} outside bus 1..={}",
                        entry.device_id, logical, bus_size
                    )));
                }
                let key = logical - 1;
                if let Some((other, _)) = assignments.get(&key) {
                    return Err(EngineError::Config(format!(
                        "logical channel {} mapped to devices {} and {}",
                        logical, other, entry.device_id
                    )));
                }
                assignments.insert(key, (entry.device_id, hw_index as u16));
            }
            widths.insert(entry.device_id, channels.len() as u16);
        }
        Ok(DeviceOutputMap {
            bus_size,
            assignments,
            widths,
        })
    }

    pub fn physical_offset_for(&self, logical_channel: u16) -> Option<(usize, u16)> {
        self.assignments.get(&logical_channel).copied()
    }

    fn device_width(&self, device_id: usize) -> Option<u16> {
        self.widths.get(&device_id).copied()
    }
}

#[cfg(test)]
mod device_map_tests {
    use super::{ChannelSpec, DeviceMapEntry, DeviceOutputMap};

    fn entry(device_id: usize, spec: &str) -> DeviceMapEntry {
        DeviceMapEntry {
            device_id,
            logical_channels: ChannelSpec::Range(spec.to_string()),
        }
    }

    #[test]
    fn resolves_hardware_offsets() {
        let map = DeviceOutputMap::build(&[entry(0, "1-8"), entry(1, "9-16")], 16).unwrap();
        // logical channel 1 (0-based 0) is devA hardware channel 0
        assert_eq!(map.physical_offset_for(0), Some((0, 0)));
        assert_eq!(map.physical_offset_for(7), Some((0, 7)));
        // logical channel 9 (0-based 8) starts devB at hardware channel 0
        assert_eq!(map.physical_offset_for(8), Some((1, 0)));
        assert_eq!(map.physical_offset_for(15), Some((1, 7)));
        assert_eq!(map.device_width(0), Some(8));
        assert_eq!(map.device_width(1), Some(8));
    }

    #[test]
    fn list_order_defines_hardware_position() {
        let map = DeviceOutputMap::build(
            &[DeviceMapEntry {
                device_id: 3,
                logical_channels: ChannelSpec::List(vec![5, 2]),
            }],
            16,
        )
        .unwrap();
        assert_eq!(map.physical_offset_for(4), Some((3, 0)));
        assert_eq!(map.physical_offset_for(1), Some((3, 1)));
        assert_eq!(map.device_width(3), Some(2));
    }

    #[test]
    fn unmapped_channels_resolve_to_none() {
        let map = DeviceOutputMap::build(&[entry(0, "1-8")], 16).unwrap();
        assert_eq!(map.physical_offset_for(8), None);
        assert_eq!(map.physical_offset_for(15), None);
    }

    #[test]
    fn overlapping_devices_are_rejected() {
        let err = DeviceOutputMap::build(&[entry(0, "1-8"), entry(1, "8-16")], 16).unwrap_err();
        assert!(err.to_string().contains("mapped to devices"));
    }

    #[test]
    fn repeated_device_entries_are_rejected() {
        assert!(DeviceOutputMap::build(&[entry(0, "1-2"), entry(0, "3-4")], 16).is_err());
    }

    #[test]
    fn channels_beyond_bus_are_rejected() {
        assert!(DeviceOutputMap::build(&[entry(0, "15-17")], 16).is_err());
        assert!(DeviceOutputMap::build(&[entry(0, "1-4")], 0).is_err());
    }
}

#[derive(Debug)]
pub struct DeviceBuffer {
    pub device_id: usize,
    pub channels: u16,
    pub samples: Vec<f32>,
}

#[derive(Debug)]
pub struct RoutedSong {
    pub song_id: u64,
    pub song_name: String,
    pub tempo: f64,
    pub sample_rate: u32,
    pub total_frames: usize,
    pub duration_seconds: f64,
    pub device_buffers: Vec<DeviceBuffer>,
}

fn premix_song(
    song: &SongDescriptor,
    routed: &[RoutedTrack],
    map: &DeviceOutputMap,
    sample_rate: u32,
    master_volume: f32,
) -> RoutedSong {
    let total_frames = routed.iter().map(|track| track.frames).max().unwrap_or(0);
    let mut buffers: BTreeMap<usize, DeviceBuffer> = BTreeMap::new();
    for track in routed {
        for lane in &track.lanes {
            let (device_id, hw_index) = match map.physical_offset_for(lane.logical_channel) {
                Some(target) => target,
                // unmapped channels stay silent but still count toward duration
                None => continue,
            };
            let width = map.device_width(device_id).unwrap_or(hw_index + 1) as usize;
            let buffer = buffers.entry(device_id).or_insert_with(|| DeviceBuffer {
                device_id,
                channels: width as u16,
                samples: vec![0.0f32; total_frames * width],
            });
            let stride = buffer.channels as usize;
            for (frame, &sample) in lane.samples.iter().enumerate() {
                buffer.samples[frame * stride + hw_index as usize] += sample;
            }
        }
    }
    let master = master_volume.clamp(0.0, MAX_TRACK_GAIN);
    let mut device_buffers: Vec<DeviceBuffer> = buffers.into_values().collect();
    for buffer in &mut device_buffers {
        for sample in buffer.samples.iter_mut() {
            *sample = (*sample * master).clamp(-1.0, 1.0);
        }
    }
    RoutedSong {
        song_id: song.id,
        song_name: song.name.clone(),
        tempo: song.tempo,
        sample_rate,
        total_frames,
        duration_seconds: if sample_rate > 0 {
            total_frames as f64 / sample_rate as f64
        } else {
            0.0
        },
        device_buffers,
    }
}


pub struct SessionClock {
    generation: u64,
    total_frames: usize,
    cursor: AtomicUsize,
    gate: AtomicBool,
    done: AtomicBool,
}

impl SessionClock {
    fn new(generation: u64, total_frames: usize) -> Self {
        SessionClock {
            generation,
            total_frames,
            cursor: AtomicUsize::new(0),
            gate: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    fn elapsed_seconds(&self, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        self.cursor.load(Ordering::Acquire).min(self.total_frames) as f64 / sample_rate as f64
    }
}

// Runs on the platform audio thread. Reads immutable premixed buffers and
// atomics only: no allocation, no locks, no I/O. Exactly one stream per
// session advances the shared cursor; every other stream just reads it.
pub fn render_device_block(
    song: &RoutedSong,
    buffer_index: usize,
    stream_channels: usize,
    clock: &SessionClock,
    active_generation: &AtomicU64,
    advance_cursor: bool,
    data: &mut [f32],
) {
    if stream_channels == 0 || data.is_empty() {
        return;
    }
    if active_generation.load(Ordering::Acquire) != clock.generation
        || !clock.gate.load(Ordering::Acquire)
    {
        data.fill(0.0);
        return;
    }
    let buffer = match song.device_buffers.get(buffer_index) {
        Some(buffer) => buffer,
        None => {
            data.fill(0.0);
            return;
        }
    };
    let frames = data.len() / stream_channels;
    let cursor = clock.cursor.load(Ordering::Acquire);
    if cursor >= clock.total_frames {
        data.fill(0.0);
        clock.done.store(true, Ordering::Release);
        return;
    }
    let width = buffer.channels as usize;
    let avail = frames.min(clock.total_frames - cursor);
    if width == stream_channels {
        let src_start = cursor * width;
        data[..avail * width].copy_from_slice(&buffer.samples[src_start..src_start + avail * width]);
    } else {
        for frame in 0..avail {
            let src_base = (cursor + frame) * width;
            let dst_base = frame * stream_channels;
            for ch in 0..stream_channels {
                data[dst_base + ch] = if ch < width {
                    buffer.samples[src_base + ch]
                } else {
                    0.0
                };
            }
        }
    }
    data[avail * stream_channels..].fill(0.0);
    if advance_cursor {
        let next = cursor + frames;
        clock.cursor.store(next, Ordering::Release);
        if next >= clock.total_frames {
            clock.done.store(true, Ordering::Release);
        }
    }
}


pub trait StreamBackend: Send + Sync {
    fn open_streams(
        &self,
        song: &Arc<RoutedSong>,
        clock: &Arc<SessionClock>,
        active_generation: &Arc<AtomicU64>,
        stream_errors: &Arc<AtomicU64>,
    ) -> Result<StreamSet, EngineError>;
}

pub struct CpalStreamBackend;

impl StreamBackend for CpalStreamBackend {
    fn open_streams(
        &self,
        song: &Arc<RoutedSong>,
        clock: &Arc<SessionClock>,
        active_generation: &Arc<AtomicU64>,
        stream_errors: &Arc<AtomicU64>,
    ) -> Result<StreamSet, EngineError> {
        let mut handles = Vec::with_capacity(song.device_buffers.len());
        for (index, buffer) in song.device_buffers.iter().enumerate() {
            let device = find_device_by_id(buffer.device_id).ok_or_else(|| {
                EngineError::NoAudioDevice(format!("output device {} not found", buffer.device_id))
            })?;
            let stream = build_device_stream(
                &device,
                song,
                index,
                clock,
                active_generation,
                stream_errors,
                index == 0,
            )?;
            handles.push(StreamHandle::new(buffer.device_id, Some(stream)));
        }
        // all streams exist before any starts; the caller opens the gate after
        for handle in &handles {
            if let Some(stream) = &handle.stream {
                stream.play().map_err(|err| {
                    EngineError::NoAudioDevice(format!(
                        "start stream on device {}: {}",
                        handle.device_id, err
                    ))
                })?;
            }
        }
        Ok(StreamSet::new(handles))
    }
}

fn negotiate_stream_config(
    device: &cpal::Device,
    want_channels: u16,
    want_rate: u32,
) -> Result<(cpal::StreamConfig, cpal::SampleFormat), EngineError> {
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());
    let default_config = device.default_output_config().map_err(|err| {
        EngineError::NoAudioDevice(format!("query device {}: {}", name, err))
    })?;

    let mut best: Option<cpal::SupportedStreamConfigRange> = None;
    if let Ok(supported) = device.supported_output_configs() {
        for range in supported {
            if range.channels() < want_channels {
                continue;
            }
            if want_rate < range.min_sample_rate().0 || want_rate > range.max_sample_rate().0 {
                continue;
            }
            let better = match &best {
                Some(current) => range.channels() < current.channels(),
                None => true,
            };
            if better {
                best = Some(range);
            }
        }
    }
    if let Some(range) = best {
        let sample_format = range.sample_format();
        let config = range.with_sample_rate(cpal::SampleRate(want_rate)).config();
        return Ok((config, sample_format));
    }
    if default_config.channels() >= want_channels && default_config.sample_rate().0 == want_rate {
        warn!("device {}: falling back to default output config", name);
        return Ok((default_config.config(), default_config.sample_format()));
    }
    Err(EngineError::NoAudioDevice(format!(
        "device {}: no output config with {} channels at {} Hz",
        name, want_channels, want_rate
    )))
}

fn build_device_stream(
    device: &cpal::Device,
    song: &Arc<RoutedSong>,
    buffer_index: usize,
    clock: &Arc<SessionClock>,
    active_generation: &Arc<AtomicU64>,
    stream_errors: &Arc<AtomicU64>,
    advance_cursor: bool,
) -> Result<cpal::Stream, EngineError> {
    let buffer = &song.device_buffers[buffer_index];
    let (config, sample_format) = negotiate_stream_config(device, buffer.channels, song.sample_rate)?;
    let stream_channels = config.channels as usize;
    let device_id = buffer.device_id;

    let song = song.clone();
    let clock = clock.clone();
    let generation = active_generation.clone();
    let errors = stream_errors.clone();

    let stream = match sample_format {
        cpal::SampleFormat::F32 => {
            let err_fn = {
                let errors = errors.clone();
                move |err| {
                    errors.fetch_add(1, Ordering::Relaxed);
                    error!("stream error on device {}: {}", device_id, err);
                }
            };
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _| {
                    render_device_block(
                        &song,
                        buffer_index,
                        stream_channels,
                        &clock,
                        &generation,
                        advance_cursor,
                        data,
                    );
                },
                err_fn,
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let err_fn = {
                let errors = errors.clone();
                move |err| {
                    errors.fetch_add(1, Ordering::Relaxed);
                    error!("stream error on device {}: {}", device_id, err);
                }
            };
            // sized up front so the callback does not allocate
            let mut scratch = vec![0.0f32; CONVERT_SCRATCH_FRAMES * stream_channels];
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _| {
                    if scratch.len() < data.len() {
                        scratch.resize(data.len(), 0.0);
                    }
                    let block = &mut scratch[..data.len()];
                    render_device_block(
                        &song,
                        buffer_index,
                        stream_channels,
                        &clock,
                        &generation,
                        advance_cursor,
                        block,
                    );
                    for (dst, src) in data.iter_mut().zip(block.iter()) {
                        *dst = cpal::Sample::from_sample(*src);
                    }
                },
                err_fn,
                None,
            )
        }
        cpal::SampleFormat::U16 => {
            let err_fn = {
                let errors = errors.clone();
                move |err| {
                    errors.fetch_add(1, Ordering::Relaxed);
                    error!("stream error on device {}: {}", device_id, err);
                }
            };
            let mut scratch = vec![0.0f32; CONVERT_SCRATCH_FRAMES * stream_channels];
            device.build_output_stream(
                &config,
                move |data: &mut [u16], _| {
                    if scratch.len() < data.len() {
                        scratch.resize(data.len(), 0.0);
                    }
                    let block = &mut scratch[..data.len()];
                    render_device_block(
                        &song,
                        buffer_index,
                        stream_channels,
                        &clock,
                        &generation,
                        advance_cursor,
                        block,
                    );
                    for (dst, src) in data.iter_mut().zip(block.iter()) {
                        *dst = cpal::Sample::from_sample(*src);
                    }
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(EngineError::NoAudioDevice(format!(
                "device {}: unsupported sample format {:?}",
                device_id, other
            )))
        }
    };

    stream.map_err(|err| {
        EngineError::NoAudioDevice(format!("open stream on device {}: {}", device_id, err))
    })
}

fn enumerate_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    let mut index = 0usize;
    for host_id in cpal::available_hosts() {
        if let Ok(host) = cpal::host_from_id(host_id) {
            if let Ok(outputs) = host.output_devices() {
                for device in outputs {
                    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
                    let (default_samplerate, mut max_output_channels) = device
                        .default_output_config()
                        .map(|c| (c.sample_rate().0, c.channels()))
                        .unwrap_or((DEFAULT_SAMPLE_RATE, 0));
                    if let Ok(supported) = device.supported_output_configs() {
                        for range in supported {
                            max_output_channels = max_output_channels.max(range.channels());
                        }
                    }
                    devices.push(DeviceInfo {
                        id: index,
                        name,
                        hostapi: format!("{:?}", host_id),
                        default_samplerate,
                        max_output_channels,
                    });
                    index += 1;
                }
            }
        }
    }
    devices
}

fn find_device_by_id(target: usize) -> Option<cpal::Device> {
    let mut index = 0usize;
    for host_id in cpal::available_hosts() {
        if let Ok(host) = cpal::host_from_id(host_id) {
            if let Ok(devices) = host.output_devices() {
                for device in devices {
                    if index == target {
                        return Some(device);
                    }
                    index += 1;
                }
            }
        }
    }
    None
}

fn build_routed_song(
    shared: &SharedState,
    song: &SongDescriptor,
    config: &AppliedConfig,
    map: &DeviceOutputMap,
) -> Result<RoutedSong, EngineError> {
    if song.tracks.is_empty() {
        return Err(EngineError::Config(format!("song {} has no tracks", song.id)));
    }
    // validate every assignment before decoding anything
    let mut occupied: Vec<u16> = Vec::new();
    for track in &song.tracks {
        validate_track_assignment(track, map.bus_size)?;
        let mut claim = |channel: u16| -> Result<(), EngineError> {
            if occupied.contains(&channel) {
                return Err(EngineError::Config(format!(
                    "logical channel {} assigned to more than one track in song {}",
                    channel, song.id
                )));
            }
            occupied.push(channel);
            Ok(())
        };
        claim(track.output_channel)?;
        if track.is_stereo {
            claim(track.output_channel + 1)?;
        }
    }

    let mut routed = Vec::with_capacity(song.tracks.len());
    for track in &song.tracks {
        let decoded = shared.loader.load(
            &track.file_ref,
            config.sample_rate,
            track.is_stereo,
            &config.resample_quality,
        )?;
        routed.push(route_track(&decoded, track, map.bus_size)?);
    }
    Ok(premix_song(song, &routed, map, config.sample_rate, config.master_volume))
}

fn configure_impl(shared: &SharedState, config: DeviceOutputConfig) -> Result<(), EngineError> {
    let _guard = shared.control.try_lock().map_err(|_| EngineError::Busy)?;
    let map = DeviceOutputMap::build(&config.outputs, config.bus_size)?;
    stop_session_guarded(shared);
    for entry in &config.outputs {
        if let Ok(channels) = entry.logical_channels.resolve() {
            info!(
                "output device {} serves channels {}",
                entry.device_id,
                format_channels(&channels)
            );
        }
    }
    let mut state = shared.inner.lock().unwrap();
    state.config = AppliedConfig {
        sample_rate: config.sample_rate.max(8_000),
        master_volume: config.master_volume.clamp(0.0, MAX_TRACK_GAIN),
        bus_size: config.bus_size,
        resample_quality: normalize_resample_quality(&config.resample_quality),
    };
    state.output_map = map;
    state.config_revision += 1;
    // a preload made under the old outputs is stale
    state.preload = None;
    info!(
        "output config applied: {} Hz, bus {}, {} device(s)",
        state.config.sample_rate,
        state.config.bus_size,
        state.output_map.widths.len()
    );
    Ok(())
}

fn preload_impl(shared: &SharedState, song: &SongDescriptor) -> Result<u64, EngineError> {
    let (config, map, revision) = {
        let _guard = shared.control.try_lock().map_err(|_| EngineError::Busy)?;
        let mut state = shared.inner.lock().unwrap();
        if let Some(slot) = &state.preload {
            if slot.song_id == song.id && slot.config_revision == state.config_revision {
                return Ok(song.id);
            }
        }
        // evict before the slow decode, not after
        state.preload = None;
        (state.config.clone(), state.output_map.clone(), state.config_revision)
    };
    let epoch = shared.preload_epoch.fetch_add(1, Ordering::AcqRel) + 1;

    let routed = build_routed_song(shared, song, &config, &map)?;

    let mut state = shared.inner.lock().unwrap();
    if shared.preload_epoch.load(Ordering::Acquire) != epoch || state.config_revision != revision {
        info!("preload of song {} superseded, result discarded", song.id);
        return Ok(song.id);
    }
    info!(
        "preloaded song {} ({:.2} s across {} device buffer(s))",
        song.id,
        routed.duration_seconds,
        routed.device_buffers.len()
    );
    state.preload = Some(PreloadSlot {
        song_id: song.id,
        config_revision: revision,
        song: Arc::new(routed),
    });
    Ok(song.id)
}

fn clear_preload_impl(shared: &SharedState) {
    // also discards any preload decode still in flight
    shared.preload_epoch.fetch_add(1, Ordering::AcqRel);
    let mut state = shared.inner.lock().unwrap();
    if state.preload.take().is_some() {
        info!("preload cache cleared");
    }
}

fn play_impl(
    shared: &SharedState,
    song: &SongDescriptor,
    expected_index: Option<i64>,
) -> Result<NowPlaying, EngineError> {
    let _guard = shared.control.try_lock().map_err(|_| EngineError::Busy)?;
    // a new song replaces whatever is currently sounding
    stop_session_guarded(shared);

    let (config, map, cached) = {
        let mut state = shared.inner.lock().unwrap();
        state.session_state = SessionState::Starting;
        let matches = state.preload.as_ref().map_or(false, |slot| {
            slot.song_id == song.id && slot.config_revision == state.config_revision
        });
        let cached = if matches {
            state.preload.take().map(|slot| slot.song)
        } else {
            None
        };
        (state.config.clone(), state.output_map.clone(), cached)
    };

    let routed = match cached {
        Some(routed) => {
            info!("promoting preloaded song {}", song.id);
            routed
        }
        None => match build_routed_song(shared, song, &config, &map) {
            Ok(routed) => Arc::new(routed),
            Err(err) => {
                fail_start(shared);
                return Err(err);
            }
        },
    };

    if routed.device_buffers.is_empty() {
        fail_start(shared);
        return Err(EngineError::NoAudioDevice(format!(
            "no configured device covers any channel of song {}",
            song.id
        )));
    }

    let generation = shared.active_generation.fetch_add(1, Ordering::AcqRel) + 1;
    let clock = Arc::new(SessionClock::new(generation, routed.total_frames));
    let set = match shared.backend.open_streams(
        &routed,
        &clock,
        &shared.active_generation,
        &shared.stream_errors,
    ) {
        Ok(set) => set,
        Err(err) => {
            // half-built streams must not outlive a failed start
            shared.active_generation.fetch_add(1, Ordering::AcqRel);
            fail_start(shared);
            return Err(err);
        }
    };
    let stream_count = set.handles.len();
    *shared.streams.lock().unwrap() = set;
    clock.gate.store(true, Ordering::Release);
    *shared.monitor.lock().unwrap() = Some(spawn_session_monitor(shared, clock.clone()));

    let now = NowPlaying {
        song_id: routed.song_id,
        song_name: routed.song_name.clone(),
        tempo: routed.tempo,
        duration_seconds: routed.duration_seconds,
        index: expected_index,
    };
    {
        let mut state = shared.inner.lock().unwrap();
        state.session_state = SessionState::Playing;
        state.session = Some(ActiveSession {
            song: routed,
            clock,
            index: expected_index,
        });
    }
    info!(
        "playing song {} ({:.2} s, {} stream(s), generation {})",
        now.song_id, now.duration_seconds, stream_count, generation
    );
    Ok(now)
}

fn fail_start(shared: &SharedState) {
    let mut state = shared.inner.lock().unwrap();
    state.session_state = SessionState::Idle;
}

fn stop_impl(shared: &SharedState) -> Result<(), EngineError> {
    let _guard = shared.control.try_lock().map_err(|_| EngineError::Busy)?;
    stop_session_guarded(shared);
    Ok(())
}

fn stop_session_guarded(shared: &SharedState) {
    {
        let mut state = shared.inner.lock().unwrap();
        if state.session.is_none() && state.session_state == SessionState::Idle {
            return;
        }
        state.session_state = SessionState::Stopping;
    }
    // callbacks observe the stale generation and fall silent immediately
    shared.active_generation.fetch_add(1, Ordering::AcqRel);
    let set = std::mem::take(&mut *shared.streams.lock().unwrap());
    set.stop_all();
    if let Some(mut monitor) = shared.monitor.lock().unwrap().take() {
        monitor.halt();
    }
    let mut state = shared.inner.lock().unwrap();
    state.session = None;
    state.session_state = SessionState::Idle;
    info!("playback session stopped");
}

fn finish_session_if_current(shared: &SharedState, generation: u64) -> bool {
    match shared.control.try_lock() {
        Ok(_guard) => {
            if shared.active_generation.load(Ordering::Acquire) == generation {
                info!("session generation {} reached end of song", generation);
                stop_session_guarded(shared);
            }
            true
        }
        Err(_) => false,
    }
}

fn spawn_session_monitor(shared: &SharedState, clock: Arc<SessionClock>) -> SessionMonitor {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let shared = shared.clone();
    let thread = thread::spawn(move || loop {
        if flag.load(Ordering::Acquire) {
            break;
        }
        if shared.active_generation.load(Ordering::Acquire) != clock.generation {
            break;
        }
        if clock.done.load(Ordering::Acquire) {
            // a concurrent control call wins the race; retry on the next tick
            if finish_session_if_current(&shared, clock.generation) {
                break;
            }
        }
        thread::sleep(Duration::from_millis(MONITOR_POLL_MS));
    });
    SessionMonitor {
        stop,
        thread: Some(thread),
    }
}

fn status_impl(shared: &SharedState) -> StatusView {
    let state = shared.inner.lock().unwrap();
    let (song_id, song_name, elapsed_seconds, duration_seconds, index) = match &state.session {
        Some(active) => (
            Some(active.song.song_id),
            Some(active.song.song_name.clone()),
            active.clock.elapsed_seconds(active.song.sample_rate),
            Some(active.song.duration_seconds),
            active.index,
        ),
        None => (None, None, 0.0, None, None),
    };
    StatusView {
        state: state.session_state,
        song_id,
        song_name,
        elapsed_seconds,
        duration_seconds,
        index,
        stream_errors: shared.stream_errors.load(Ordering::Relaxed),
    }
}

#[derive(Deserialize)]
struct PlayRequest {
    song: SongDescriptor,
    expected_index: Option<i64>,
}

fn error_body(err: &EngineError) -> (StatusCode, Json<Value>) {
    (
        err.http_status(),
        Json(json!({
            "status": "error",
            "error_kind": err.error_kind(),
            "message": err.to_string(),
        })),
    )
}

async fn status_handler(State(shared): State<SharedState>) -> impl IntoResponse {
    let view = status_impl(&shared);
    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "state": view.state,
            "song_id": view.song_id,
            "song_name": view.song_name,
            "elapsed_seconds": view.elapsed_seconds,
            "duration_seconds": view.duration_seconds,
            "index": view.index,
            "stream_errors": view.stream_errors,
        })),
    )
}

async fn devices_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "success", "devices": enumerate_devices() })),
    )
}

async fn preload_handler(
    State(shared): State<SharedState>,
    Json(song): Json<SongDescriptor>,
) -> impl IntoResponse {
    match preload_impl(&shared, &song) {
        Ok(song_id) => (
            StatusCode::OK,
            Json(json!({ "status": "success", "song_id": song_id })),
        ),
        Err(err) => error_body(&err),
    }
}

async fn preload_clear_handler(State(shared): State<SharedState>) -> impl IntoResponse {
    clear_preload_impl(&shared);
    (StatusCode::OK, Json(json!({ "status": "success" })))
}

async fn play_handler(
    State(shared): State<SharedState>,
    Json(req): Json<PlayRequest>,
) -> impl IntoResponse {
    match play_impl(&shared, &req.song, req.expected_index) {
        Ok(now) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "song_id": now.song_id,
                "song_name": now.song_name,
                "tempo": now.tempo,
                "duration_seconds": now.duration_seconds,
                "index": now.index,
            })),
        ),
        Err(err) => error_body(&err),
    }
}

async fn stop_handler(State(shared): State<SharedState>) -> impl IntoResponse {
    match stop_impl(&shared) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "success", "ok": true })),
        ),
        Err(err) => error_body(&err),
    }
}

async fn config_handler(
    State(shared): State<SharedState>,
    Json(config): Json<DeviceOutputConfig>,
) -> impl IntoResponse {
    match configure_impl(&shared, config) {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "success" }))),
        Err(err) => error_body(&err),
    }
}

pub async fn run_http_server(shared: Option<SharedState>, port: Option<u16>) -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let port = port
        .or_else(|| {
            std::env::var("BACKLINE_ENGINE_PORT")
                .ok()
                .and_then(|v| v.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_HTTP_PORT);

    let shared = match shared {
        Some(shared) => shared,
        None => create_shared_state(),
    };

    let app = Router::new()
        .route("/status", get(status_handler))
        .route("/devices", get(devices_handler))
        .route("/preload", post(preload_handler))
        .route("/preload/clear", post(preload_clear_handler))
        .route("/play", post(play_handler))
        .route("/stop", post(stop_handler))
        .route("/config", post(config_handler))
        .with_state(shared);

    let addr = format!("127.0.0.1:{}", port);
    info!("backline engine listening on {}", addr);
    println!("BACKLINE_ENGINE_READY");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingLoader {
        calls: AtomicUsize,
    }

    impl TrackLoader for CountingLoader {
        fn load(
            &self,
            file_ref: &str,
            target_rate: u32,
            want_stereo: bool,
            _quality: &str,
        ) -> Result<DecodedAudio, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut frames = 480usize;
            for part in file_ref.split(':') {
                if let Some(value) = part.strip_prefix("frames=") {
                    frames = value.parse().unwrap();
                }
                if let Some(value) = part.strip_prefix("sleep_ms=") {
                    thread::sleep(Duration::from_millis(value.parse().unwrap()));
                }
            }
            let channels = if want_stereo { 2 } else { 1 };
            Ok(DecodedAudio {
                samples: vec![0.5; frames * channels],
                sample_rate: target_rate,
                channels,
                duration: frames as f64 / target_rate as f64,
            })
        }
    }

    #[derive(Default)]
    struct RecordingBackend {
        opened: Mutex<Vec<Vec<usize>>>,
    }

    impl StreamBackend for RecordingBackend {
        fn open_streams(
            &self,
            song: &Arc<RoutedSong>,
            _clock: &Arc<SessionClock>,
            _active_generation: &Arc<AtomicU64>,
            _stream_errors: &Arc<AtomicU64>,
        ) -> Result<StreamSet, EngineError> {
            let ids: Vec<usize> = song.device_buffers.iter().map(|b| b.device_id).collect();
            self.opened.lock().unwrap().push(ids.clone());
            Ok(StreamSet::new(
                ids.into_iter().map(|id| StreamHandle::new(id, None)).collect(),
            ))
        }
    }

    fn test_config() -> DeviceOutputConfig {
        DeviceOutputConfig {
            outputs: vec![
                DeviceMapEntry {
                    device_id: 0,
                    logical_channels: ChannelSpec::Range("1-8".to_string()),
                },
                DeviceMapEntry {
                    device_id: 1,
                    logical_channels: ChannelSpec::Range("9-16".to_string()),
                },
            ],
            sample_rate: 48_000,
            master_volume: 1.0,
            bus_size: 16,
            resample_quality: "hq".to_string(),
        }
    }

    fn engine() -> (SharedState, Arc<CountingLoader>, Arc<RecordingBackend>) {
        let loader = Arc::new(CountingLoader::default());
        let backend = Arc::new(RecordingBackend::default());
        let shared = create_shared_state_with(loader.clone(), backend.clone());
        configure_impl(&shared, test_config()).unwrap();
        (shared, loader, backend)
    }

    fn click_and_band(id: u64) -> SongDescriptor {
        SongDescriptor {
            id,
            name: format!("song-{}", id),
            tempo: 120.0,
            tracks: vec![
                TrackDescriptor {
                    id: 1,
                    file_ref: "frames=480".to_string(),
                    output_channel: 1,
                    is_stereo: false,
                    gain: 1.0,
                },
                TrackDescriptor {
                    id: 2,
                    file_ref: "frames=576".to_string(),
                    output_channel: 3,
                    is_stereo: true,
                    gain: 1.0,
                },
            ],
        }
    }

    #[test]
    fn play_then_status_reports_playing() {
        let (shared, _, backend) = engine();
        let song = click_and_band(7);
        let now = play_impl(&shared, &song, Some(2)).unwrap();
        assert_eq!(now.song_id, 7);
        assert_eq!(now.song_name, "song-7");
        assert!((now.duration_seconds - 576.0 / 48_000.0).abs() < 1e-9);
        let view = status_impl(&shared);
        assert_eq!(view.state, SessionState::Playing);
        assert_eq!(view.song_id, Some(7));
        assert_eq!(view.index, Some(2));
        // the band track covers only device 0 channels, so device 1 gets no stream
        assert_eq!(*backend.opened.lock().unwrap(), vec![vec![0]]);
    }

    #[test]
    fn stop_is_idempotent() {
        let (shared, _, _) = engine();
        stop_impl(&shared).unwrap();
        play_impl(&shared, &click_and_band(1), None).unwrap();
        stop_impl(&shared).unwrap();
        stop_impl(&shared).unwrap();
        let view = status_impl(&shared);
        assert_eq!(view.state, SessionState::Idle);
        assert_eq!(view.song_id, None);
        assert_eq!(view.elapsed_seconds, 0.0);
    }

    #[test]
    fn preload_then_play_reuses_decoded_song() {
        let (shared, loader, _) = engine();
        let song = click_and_band(3);
        assert_eq!(preload_impl(&shared, &song).unwrap(), 3);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
        play_impl(&shared, &song, None).unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
        // promotion consumed the cache entry
        assert!(shared.inner.lock().unwrap().preload.is_none());
    }

    #[test]
    fn preload_is_idempotent_for_same_song() {
        let (shared, loader, _) = engine();
        let song = click_and_band(3);
        preload_impl(&shared, &song).unwrap();
        preload_impl(&shared, &song).unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn playing_a_different_song_skips_the_cache() {
        let (shared, loader, _) = engine();
        preload_impl(&shared, &click_and_band(3)).unwrap();
        play_impl(&shared, &click_and_band(4), None).unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 4);
        assert_eq!(status_impl(&shared).song_id, Some(4));
        // song 3 stays cached and still promotes later
        stop_impl(&shared).unwrap();
        play_impl(&shared, &click_and_band(3), None).unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn play_replaces_current_session() {
        let (shared, _, backend) = engine();
        play_impl(&shared, &click_and_band(1), None).unwrap();
        play_impl(&shared, &click_and_band(2), None).unwrap();
        assert_eq!(status_impl(&shared).song_id, Some(2));
        assert_eq!(backend.opened.lock().unwrap().len(), 2);
    }

    #[test]
    fn concurrent_control_calls_are_busy() {
        let (shared, _, _) = engine();
        let guard = shared.control.lock().unwrap();
        let err = play_impl(&shared, &click_and_band(1), None).unwrap_err();
        assert!(matches!(err, EngineError::Busy));
        assert_eq!(err.error_kind(), "busy");
        assert!(matches!(stop_impl(&shared).unwrap_err(), EngineError::Busy));
        drop(guard);
        play_impl(&shared, &click_and_band(1), None).unwrap();
    }

    #[test]
    fn stereo_overflow_fails_without_opening_streams() {
        let (shared, loader, backend) = engine();
        let song = SongDescriptor {
            id: 9,
            name: "edge".to_string(),
            tempo: 100.0,
            tracks: vec![TrackDescriptor {
                id: 1,
                file_ref: "frames=480".to_string(),
                output_channel: 16,
                is_stereo: true,
                gain: 1.0,
            }],
        };
        let err = play_impl(&shared, &song, None).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert_eq!(err.error_kind(), "config_error");
        // rejected before any decode or stream work
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
        assert!(backend.opened.lock().unwrap().is_empty());
        assert_eq!(status_impl(&shared).state, SessionState::Idle);
    }

    #[test]
    fn overlapping_track_assignment_is_rejected() {
        let (shared, _, _) = engine();
        let song = SongDescriptor {
            id: 9,
            name: "edge".to_string(),
            tempo: 100.0,
            tracks: vec![
                TrackDescriptor {
                    id: 1,
                    file_ref: "frames=480".to_string(),
                    output_channel: 2,
                    is_stereo: true,
                    gain: 1.0,
                },
                TrackDescriptor {
                    id: 2,
                    file_ref: "frames=480".to_string(),
                    output_channel: 3,
                    is_stereo: false,
                    gain: 1.0,
                },
            ],
        };
        let err = play_impl(&shared, &song, None).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn unconfigured_engine_reports_no_device() {
        let loader = Arc::new(CountingLoader::default());
        let backend = Arc::new(RecordingBackend::default());
        let shared = create_shared_state_with(loader, backend.clone());
        let err = play_impl(&shared, &click_and_band(1), None).unwrap_err();
        assert!(matches!(err, EngineError::NoAudioDevice(_)));
        assert_eq!(err.error_kind(), "no_audio_device");
        assert!(backend.opened.lock().unwrap().is_empty());
        assert_eq!(status_impl(&shared).state, SessionState::Idle);
    }

    #[test]
    fn configure_invalidates_preload() {
        let (shared, loader, _) = engine();
        preload_impl(&shared, &click_and_band(5)).unwrap();
        configure_impl(&shared, test_config()).unwrap();
        play_impl(&shared, &click_and_band(5), None).unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn bad_configure_keeps_previous_mapping() {
        let (shared, _, _) = engine();
        let mut bad = test_config();
        bad.outputs[1].logical_channels = ChannelSpec::Range("8-16".to_string());
        let err = configure_impl(&shared, bad).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        // the old mapping still drives playback
        play_impl(&shared, &click_and_band(1), None).unwrap();
        assert_eq!(status_impl(&shared).state, SessionState::Playing);
    }

    #[test]
    fn configure_stops_active_session() {
        let (shared, _, _) = engine();
        play_impl(&shared, &click_and_band(1), None).unwrap();
        configure_impl(&shared, test_config()).unwrap();
        assert_eq!(status_impl(&shared).state, SessionState::Idle);
    }

    #[test]
    fn finished_session_returns_to_idle() {
        let (shared, _, _) = engine();
        play_impl(&shared, &click_and_band(6), None).unwrap();
        let clock = {
            let state = shared.inner.lock().unwrap();
            state.session.as_ref().unwrap().clock.clone()
        };
        clock.cursor.store(clock.total_frames, Ordering::Release);
        clock.done.store(true, Ordering::Release);
        // the monitor thread may beat us to the teardown; both paths end idle
        finish_session_if_current(&shared, clock.generation);
        for _ in 0..200 {
            if status_impl(&shared).state == SessionState::Idle {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let view = status_impl(&shared);
        assert_eq!(view.state, SessionState::Idle);
        assert_eq!(view.song_id, None);
    }

    #[test]
    fn status_elapsed_follows_cursor() {
        let (shared, _, _) = engine();
        play_impl(&shared, &click_and_band(6), None).unwrap();
        let clock = {
            let state = shared.inner.lock().unwrap();
            state.session.as_ref().unwrap().clock.clone()
        };
        clock.cursor.store(240, Ordering::Release);
        let view = status_impl(&shared);
        assert!((view.elapsed_seconds - 240.0 / 48_000.0).abs() < 1e-9);
        assert_eq!(view.duration_seconds, Some(576.0 / 48_000.0));
    }

    #[test]
    fn superseded_preload_is_discarded() {
        let (shared, loader, _) = engine();
        let slow = SongDescriptor {
            id: 11,
            name: "slow".to_string(),
            tempo: 90.0,
            tracks: vec![TrackDescriptor {
                id: 1,
                file_ref: "frames=480:sleep_ms=200".to_string(),
                output_channel: 1,
                is_stereo: false,
                gain: 1.0,
            }],
        };
        let worker = {
            let shared = shared.clone();
            thread::spawn(move || preload_impl(&shared, &slow))
        };
        // wait until the slow decode is underway, then preload another song
        while loader.calls.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(2));
        }
        preload_impl(&shared, &click_and_band(12)).unwrap();
        worker.join().unwrap().unwrap();
        let state = shared.inner.lock().unwrap();
        assert_eq!(state.preload.as_ref().map(|slot| slot.song_id), Some(12));
    }

    #[test]
    fn clear_preload_drops_entry() {
        let (shared, loader, _) = engine();
        preload_impl(&shared, &click_and_band(2)).unwrap();
        clear_preload_impl(&shared);
        play_impl(&shared, &click_and_band(2), None).unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn empty_song_is_a_config_error() {
        let (shared, _, _) = engine();
        let song = SongDescriptor {
            id: 1,
            name: "empty".to_string(),
            tempo: 0.0,
            tracks: Vec::new(),
        };
        assert!(matches!(
            play_impl(&shared, &song, None).unwrap_err(),
            EngineError::Config(_)
        ));
    }
}
