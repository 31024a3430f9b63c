use crate::api::preview::EncodedBytes;
use crate::audio::decoder::{AudioDecoder, DecodedClip};
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Something that can play mixed voices.
pub trait OutputDevice: Send + Sync {
    fn resume(&self) -> AppResult<()>;
    fn is_running(&self) -> bool;
    /// The platform took the device away; a new one must be opened.
    fn is_closed(&self) -> bool;
    fn submit(&self, voice: Arc<Voice>);
}

type Opener = Box<dyn Fn() -> AppResult<Arc<dyn OutputDevice>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Uninitialized,
    Open,
    Closed,
}

/// Result of borrowing the shared context.
#[derive(Clone)]
pub enum ContextHandle {
    Available(Arc<DecodeContext>),
    /// No decoding/output capability on this platform.
    Unavailable,
}

/// Process-wide decode and mixing context. One output is opened lazily and
/// shared by every session; it is never closed by us, and if the platform
/// loses the device the next `get()` opens a fresh one. New contexts start
/// suspended and must be resumed inside the tap before decoding.
pub struct SharedDecodeContext {
    slot: Mutex<Option<Arc<DecodeContext>>>,
    opener: Opener,
}

static GLOBAL: OnceLock<Arc<SharedDecodeContext>> = OnceLock::new();

impl SharedDecodeContext {
    /// The process-wide context backed by the default cpal output device.
    pub fn global() -> Arc<SharedDecodeContext> {
        Arc::clone(GLOBAL.get_or_init(|| {
            Arc::new(Self::with_opener(|| {
                CpalOutput::open().map(|output| Arc::new(output) as Arc<dyn OutputDevice>)
            }))
        }))
    }

    pub fn with_opener<F>(opener: F) -> Self
    where
        F: Fn() -> AppResult<Arc<dyn OutputDevice>> + Send + Sync + 'static,
    {
        Self {
            slot: Mutex::new(None),
            opener: Box::new(opener),
        }
    }

    /// Get the open context, opening a new one if there is none or the last
    /// one was closed underneath us.
    pub fn get(&self) -> ContextHandle {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(ctx) = slot.as_ref() {
            if !ctx.is_closed() {
                return ContextHandle::Available(Arc::clone(ctx));
            }
            log::info!("Decode context was closed, reopening");
        }

        match (self.opener)() {
            Ok(output) => {
                let ctx = Arc::new(DecodeContext { output });
                *slot = Some(Arc::clone(&ctx));
                ContextHandle::Available(ctx)
            }
            Err(e) => {
                log::warn!("Decode context unavailable: {}", e);
                *slot = None;
                ContextHandle::Unavailable
            }
        }
    }

    pub fn state(&self) -> ContextState {
        let slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        match slot.as_ref() {
            None => ContextState::Uninitialized,
            Some(ctx) if ctx.is_closed() => ContextState::Closed,
            Some(_) => ContextState::Open,
        }
    }
}

pub struct DecodeContext {
    output: Arc<dyn OutputDevice>,
}

impl DecodeContext {
    /// Must run synchronously inside the gesture that requested playback.
    pub fn resume(&self) -> AppResult<()> {
        self.output.resume()
    }

    pub fn is_running(&self) -> bool {
        self.output.is_running()
    }

    pub fn is_closed(&self) -> bool {
        self.output.is_closed()
    }

    /// Decode a whole encoded buffer off the async threads. The buffer is
    /// consumed; callers wanting to decode again need their own copy.
    pub async fn decode(
        &self,
        bytes: EncodedBytes,
        extension: Option<&'static str>,
    ) -> AppResult<Arc<DecodedClip>> {
        if !self.output.is_running() {
            return Err(AppError::Suspended);
        }

        let clip = tokio::task::spawn_blocking(move || AudioDecoder::decode_all(bytes, extension))
            .await
            .map_err(|e| AppError::Decode(format!("Decode task failed: {}", e)))??;

        log::debug!(
            "Decoded clip: {:.2}s at {} Hz, {} ch",
            clip.duration_seconds(),
            clip.sample_rate,
            clip.channels
        );
        Ok(Arc::new(clip))
    }

    pub fn create_one_shot(&self, clip: Arc<DecodedClip>, gain: f32) -> OneShotNode {
        OneShotNode {
            voice: Arc::new(Voice::new(clip, gain)),
            output: Arc::clone(&self.output),
            started: false,
        }
    }
}

/// A decoded clip routed through a gain stage. Starts at most once.
pub struct OneShotNode {
    voice: Arc<Voice>,
    output: Arc<dyn OutputDevice>,
    started: bool,
}

impl OneShotNode {
    pub fn start(&mut self) -> AppResult<()> {
        if self.started {
            return Err(AppError::NodeSpent);
        }
        self.started = true;
        self.output.submit(Arc::clone(&self.voice));
        Ok(())
    }

    pub fn stop(&mut self) {
        self.voice.stop();
    }

    pub fn is_playing(&self) -> bool {
        self.started && !self.voice.is_finished()
    }
}

impl Drop for OneShotNode {
    fn drop(&mut self) {
        self.voice.stop();
    }
}

/// Playback cursor over a decoded clip, mixed by the output callback.
pub struct Voice {
    clip: Arc<DecodedClip>,
    gain: f32,
    /// Position in source frames.
    cursor: Mutex<f64>,
    stopped: AtomicBool,
}

impl Voice {
    fn new(clip: Arc<DecodedClip>, gain: f32) -> Self {
        Self {
            clip,
            gain: gain.clamp(0.0, 1.0),
            cursor: Mutex::new(0.0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return true;
        }
        let cursor = *self.cursor.lock().unwrap_or_else(|p| p.into_inner());
        cursor as usize >= self.clip.frames()
    }

    /// Add this voice into an interleaved buffer, resampling linearly and
    /// mapping channels. Returns false once there is nothing left to play.
    pub fn mix_into(&self, out: &mut [f32], out_channels: usize, out_rate: u32) -> bool {
        if self.stopped.load(Ordering::Relaxed) || out_channels == 0 || out_rate == 0 {
            return false;
        }

        let clip = &*self.clip;
        let frames = clip.frames();
        let src_channels = clip.channels.max(1);
        let step = clip.sample_rate as f64 / out_rate as f64;
        let mut cursor = self.cursor.lock().unwrap_or_else(|p| p.into_inner());

        for frame in out.chunks_mut(out_channels) {
            let index = *cursor as usize;
            if index >= frames {
                return false;
            }
            let frac = (*cursor - index as f64) as f32;
            let next = (index + 1).min(frames - 1);

            for (ch, sample) in frame.iter_mut().enumerate() {
                let src_ch = ch.min(src_channels - 1);
                let a = clip.samples[index * src_channels + src_ch];
                let b = clip.samples[next * src_channels + src_ch];
                *sample += (a + (b - a) * frac) * self.gain;
            }
            *cursor += step;
        }

        (*cursor as usize) < frames
    }
}

/// Sums the live voices for one output callback.
#[derive(Default)]
pub struct Mixer {
    voices: Mutex<Vec<Arc<Voice>>>,
}

impl Mixer {
    pub fn add(&self, voice: Arc<Voice>) {
        self.voices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(voice);
    }

    pub fn render(&self, out: &mut [f32], channels: usize, sample_rate: u32) {
        out.fill(0.0);
        let mut voices = self.voices.lock().unwrap_or_else(|p| p.into_inner());
        voices.retain(|voice| voice.mix_into(out, channels, sample_rate));
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }

    pub fn active_voices(&self) -> usize {
        self.voices.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Wrapper to make cpal::Stream Send+Sync.
/// The stream is only played and dropped through `CpalOutput`, which owns it
/// for the lifetime of the context.
struct SendStream(cpal::Stream);
unsafe impl Send for SendStream {}
unsafe impl Sync for SendStream {}

pub struct CpalOutput {
    stream: Mutex<SendStream>,
    mixer: Arc<Mixer>,
    running: AtomicBool,
    closed: Arc<AtomicBool>,
}

impl CpalOutput {
    /// Open the default output device, paused.
    pub fn open() -> AppResult<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AppError::Audio("No output device available".into()))?;

        let supported = device
            .default_output_config()
            .map_err(|e| AppError::Audio(format!("No default output config: {}", e)))?;
        let config = supported.config();
        let channels = config.channels as usize;
        let sample_rate = config.sample_rate.0;

        let mixer = Arc::new(Mixer::default());
        let closed = Arc::new(AtomicBool::new(false));

        let mixer_clone = Arc::clone(&mixer);
        let closed_clone = Arc::clone(&closed);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mixer_clone.render(data, channels, sample_rate);
                },
                move |err| {
                    log::error!("cpal output error: {}", err);
                    if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                        closed_clone.store(true, Ordering::SeqCst);
                    }
                },
                None,
            )
            .map_err(|e| AppError::Audio(format!("Failed to build output stream: {}", e)))?;

        // Some hosts start streams eagerly; hold it until a gesture resumes us.
        let _ = stream.pause();

        log::info!(
            "Opened decode context: {} Hz, {} ch ({:?})",
            sample_rate,
            channels,
            supported.sample_format()
        );

        Ok(Self {
            stream: Mutex::new(SendStream(stream)),
            mixer,
            running: AtomicBool::new(false),
            closed,
        })
    }
}

impl OutputDevice for CpalOutput {
    fn resume(&self) -> AppResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let stream = self.stream.lock().unwrap_or_else(|p| p.into_inner());
        stream
            .0
            .play()
            .map_err(|e| AppError::Audio(format!("Failed to resume output: {}", e)))?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.is_closed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn submit(&self, voice: Arc<Voice>) {
        self.mixer.add(voice);
    }
}
