use crate::audio::decoder::{extension_hint, AudioDecoder};
use crate::audio::stream_source::{progressive_pair, ProgressiveSource, ProgressiveWriter};
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tokio::sync::mpsc;

/// Reported when an element cannot load or keep playing its source.
#[derive(Debug, Clone)]
pub struct MediaError {
    pub src: String,
    pub message: String,
}

pub type MediaErrorSender = mpsc::UnboundedSender<MediaError>;

/// A streaming media element: give it a URL and it fetches and plays the
/// bytes itself. Load failures arrive asynchronously on the error channel the
/// element was built with.
pub trait MediaElement: Send {
    fn set_src(&mut self, url: &str);
    fn src(&self) -> Option<&str>;
    fn play(&mut self);
    fn pause(&mut self);
    /// Return to position 0 without changing the paused state.
    fn rewind(&mut self);
    fn set_volume(&mut self, volume: f32);
    fn is_paused(&self) -> bool;
}

/// Builds an element wired to the given error channel.
pub type ElementFactory = Arc<dyn Fn(MediaErrorSender) -> Box<dyn MediaElement> + Send + Sync>;

/// Factory for `StreamingElement`s sharing one HTTP client.
pub fn streaming_factory(http: reqwest::Client, runtime: tokio::runtime::Handle) -> ElementFactory {
    Arc::new(move |errors| {
        Box::new(StreamingElement::new(http.clone(), runtime.clone(), errors))
            as Box<dyn MediaElement>
    })
}

/// Shared ring buffer between the decode thread and the cpal callback.
struct SampleRing {
    buffer: VecDeque<f32>,
    finished: bool,
}

const MAX_RING_SAMPLES: usize = 176400;

type Ring = Arc<(Mutex<SampleRing>, Condvar)>;

/// What an output needs to drain the decode thread's ring.
struct OutputFeed {
    channels: usize,
    sample_rate: u32,
    ring: Ring,
    volume: Arc<Mutex<f32>>,
    playing: Arc<AtomicBool>,
}

/// Opens a device output for one element. The returned handle keeps it open
/// and is dropped on the decode thread that created it.
type OutputOpener = Arc<dyn Fn(&OutputFeed) -> AppResult<Box<dyn Any>> + Send + Sync>;

fn cpal_opener() -> OutputOpener {
    Arc::new(|feed: &OutputFeed| open_stream(feed).map(|stream| Box::new(stream) as Box<dyn Any>))
}

/// Progressive download + symphonia decode + cpal output for one URL.
pub struct StreamingElement {
    http: reqwest::Client,
    runtime: tokio::runtime::Handle,
    errors: MediaErrorSender,
    src: Option<String>,
    volume: Arc<Mutex<f32>>,
    playing: Arc<AtomicBool>,
    /// Set by `rewind`; the decode thread seeks to 0 and clears it.
    rewind_requested: Arc<AtomicBool>,
    stop_signal: Arc<AtomicBool>,
    ring: Ring,
    opener: OutputOpener,
    worker: Option<std::thread::JoinHandle<()>>,
    download: Option<tokio::task::JoinHandle<()>>,
}

impl StreamingElement {
    pub fn new(
        http: reqwest::Client,
        runtime: tokio::runtime::Handle,
        errors: MediaErrorSender,
    ) -> Self {
        Self::with_opener(http, runtime, errors, cpal_opener())
    }

    fn with_opener(
        http: reqwest::Client,
        runtime: tokio::runtime::Handle,
        errors: MediaErrorSender,
        opener: OutputOpener,
    ) -> Self {
        Self {
            http,
            runtime,
            errors,
            src: None,
            volume: Arc::new(Mutex::new(1.0)),
            playing: Arc::new(AtomicBool::new(false)),
            rewind_requested: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(AtomicBool::new(false)),
            ring: new_ring(),
            opener,
            worker: None,
            download: None,
        }
    }

    fn is_loaded(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    fn load(&mut self, src: String) {
        let (source, writer) = progressive_pair();
        self.download = Some(
            self.runtime
                .spawn(download(self.http.clone(), src.clone(), writer)),
        );

        self.stop_signal = Arc::new(AtomicBool::new(false));
        self.ring = new_ring();
        self.rewind_requested.store(false, Ordering::SeqCst);

        let worker = Worker {
            src,
            source,
            ring: Arc::clone(&self.ring),
            volume: Arc::clone(&self.volume),
            playing: Arc::clone(&self.playing),
            rewind_requested: Arc::clone(&self.rewind_requested),
            stop_signal: Arc::clone(&self.stop_signal),
            opener: Arc::clone(&self.opener),
            errors: self.errors.clone(),
        };
        self.worker = Some(std::thread::spawn(move || worker.run()));
    }

    /// Tear down the current load. Does not wait for the decode thread; it
    /// notices the stop signal or the aborted download on its own.
    fn stop_internal(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
        self.wake_worker();

        if let Some(download) = self.download.take() {
            download.abort();
        }
        self.worker = None;
    }
}

impl StreamingElement {
    /// Notify under the ring lock so a flag change is never missed between
    /// the worker's check and its wait.
    fn wake_worker(&self) {
        let (lock, cvar) = &*self.ring;
        let _ring = lock.lock().unwrap_or_else(|p| p.into_inner());
        cvar.notify_all();
    }
}

fn new_ring() -> Ring {
    Arc::new((
        Mutex::new(SampleRing {
            buffer: VecDeque::with_capacity(88200),
            finished: false,
        }),
        Condvar::new(),
    ))
}

impl MediaElement for StreamingElement {
    fn set_src(&mut self, url: &str) {
        if self.src.as_deref() == Some(url) {
            return;
        }
        self.stop_internal();
        self.src = Some(url.to_string());
    }

    fn src(&self) -> Option<&str> {
        self.src.as_deref()
    }

    fn play(&mut self) {
        let Some(src) = self.src.clone() else {
            log::warn!("play() without a source");
            return;
        };
        if !self.is_loaded() {
            self.stop_internal();
            self.load(src);
        }
        self.playing.store(true, Ordering::SeqCst);
        self.wake_worker();
    }

    /// Pausing also releases the device output; `play` reopens it.
    fn pause(&mut self) {
        self.playing.store(false, Ordering::SeqCst);
        self.wake_worker();
    }

    fn rewind(&mut self) {
        if self.is_loaded() {
            self.rewind_requested.store(true, Ordering::SeqCst);
            self.wake_worker();
        }
    }

    fn set_volume(&mut self, volume: f32) {
        *self.volume.lock().unwrap_or_else(|p| p.into_inner()) = volume.clamp(0.0, 1.0);
    }

    fn is_paused(&self) -> bool {
        !self.playing.load(Ordering::SeqCst)
    }
}

impl Drop for StreamingElement {
    fn drop(&mut self) {
        self.stop_internal();
    }
}

async fn download(http: reqwest::Client, url: String, writer: ProgressiveWriter) {
    use futures_util::StreamExt;

    log::debug!("Streaming preview: {}...", log_prefix(&url));
    let response = match http.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            writer.set_error(format!("Failed to start download: {}", e));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        log::warn!("Preview stream failed: HTTP {}", status);
        writer.set_error(format!("Download failed: HTTP {}", status));
        return;
    }

    let mut stream = response.bytes_stream();
    let mut total_bytes = 0u64;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                total_bytes += bytes.len() as u64;
                if writer.write_bytes(&bytes).is_err() {
                    log::debug!("Preview stream: reader closed after {} bytes", total_bytes);
                    return;
                }
            }
            Err(e) => {
                writer.set_error(format!("Download error: {}", e));
                return;
            }
        }
    }
    log::debug!("Preview stream complete: {} bytes", total_bytes);
    writer.finish();
}

/// At most the first 100 characters of `url`.
fn log_prefix(url: &str) -> &str {
    url.char_indices().nth(100).map_or(url, |(i, _)| &url[..i])
}

struct Worker {
    src: String,
    source: ProgressiveSource,
    ring: Ring,
    volume: Arc<Mutex<f32>>,
    playing: Arc<AtomicBool>,
    rewind_requested: Arc<AtomicBool>,
    stop_signal: Arc<AtomicBool>,
    opener: OutputOpener,
    errors: MediaErrorSender,
}

impl Worker {
    fn run(self) {
        let stop_signal = Arc::clone(&self.stop_signal);
        let errors = self.errors.clone();
        let src = self.src.clone();

        if let Err(e) = self.play_through() {
            if stop_signal.load(Ordering::SeqCst) {
                log::debug!("Element stopped before load finished: {}", e);
                return;
            }
            log::warn!("Preview element failed for {}: {}", src, e);
            let _ = errors.send(MediaError {
                src,
                message: e.to_string(),
            });
        }
    }

    fn play_through(self) -> AppResult<()> {
        let extension = extension_hint(&self.src);
        let mut decoder = AudioDecoder::new(Box::new(self.source), extension)?;
        let feed = OutputFeed {
            channels: decoder.channels(),
            sample_rate: decoder.sample_rate(),
            ring: Arc::clone(&self.ring),
            volume: Arc::clone(&self.volume),
            playing: Arc::clone(&self.playing),
        };
        let mut output: Option<Box<dyn Any>> = None;

        loop {
            if self.stop_signal.load(Ordering::Relaxed) {
                break;
            }

            if self.rewind_requested.swap(false, Ordering::SeqCst) {
                {
                    let (lock, cvar) = &*self.ring;
                    let mut ring = lock.lock().unwrap_or_else(|p| p.into_inner());
                    ring.buffer.clear();
                    ring.finished = false;
                    cvar.notify_all();
                }
                if let Err(e) = decoder.seek(0.0) {
                    log::warn!("Rewind failed: {}", e);
                }
                continue;
            }

            if !self.playing.load(Ordering::SeqCst) {
                if output.take().is_some() {
                    log::debug!("Released output for paused {}", log_prefix(&self.src));
                }
                let (lock, cvar) = &*self.ring;
                let mut ring = lock.lock().unwrap_or_else(|p| p.into_inner());
                while !self.playing.load(Ordering::SeqCst)
                    && !self.stop_signal.load(Ordering::Relaxed)
                    && !self.rewind_requested.load(Ordering::Relaxed)
                {
                    ring = cvar.wait(ring).unwrap_or_else(|p| p.into_inner());
                }
                continue;
            }

            if output.is_none() {
                output = Some((self.opener)(&feed)?);
            }

            {
                let (lock, cvar) = &*self.ring;
                let mut ring = lock.lock().unwrap_or_else(|p| p.into_inner());
                while (ring.buffer.len() >= MAX_RING_SAMPLES || ring.finished)
                    && self.playing.load(Ordering::SeqCst)
                    && !self.stop_signal.load(Ordering::Relaxed)
                    && !self.rewind_requested.load(Ordering::Relaxed)
                {
                    ring = cvar.wait(ring).unwrap_or_else(|p| p.into_inner());
                }
            }

            if self.stop_signal.load(Ordering::Relaxed)
                || self.rewind_requested.load(Ordering::Relaxed)
                || !self.playing.load(Ordering::SeqCst)
            {
                continue;
            }

            match decoder.decode_next()? {
                Some(decoded) => {
                    let (lock, cvar) = &*self.ring;
                    let mut ring = lock.lock().unwrap_or_else(|p| p.into_inner());
                    ring.buffer.extend(decoded.samples.iter());
                    cvar.notify_all();
                }
                None => {
                    // An ended element can still be rewound and replayed.
                    let (lock, cvar) = &*self.ring;
                    let mut ring = lock.lock().unwrap_or_else(|p| p.into_inner());
                    ring.finished = true;
                    cvar.notify_all();
                }
            }
        }

        drop(output);
        Ok(())
    }
}

fn open_stream(feed: &OutputFeed) -> AppResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AppError::Audio("No output device available".into()))?;

    let stream_config = cpal::StreamConfig {
        channels: feed.channels as u16,
        sample_rate: cpal::SampleRate(feed.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let ring = Arc::clone(&feed.ring);
    let volume = Arc::clone(&feed.volume);
    let playing = Arc::clone(&feed.playing);
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if !playing.load(Ordering::Relaxed) {
                    data.fill(0.0);
                    return;
                }

                let vol = *volume.lock().unwrap_or_else(|p| p.into_inner());
                let (lock, cvar) = &*ring;
                let mut ring = lock.lock().unwrap_or_else(|p| p.into_inner());
                for sample in data.iter_mut() {
                    *sample = ring.buffer.pop_front().unwrap_or(0.0) * vol;
                }
                cvar.notify_all();
            },
            |err| {
                log::error!("cpal output error: {}", err);
            },
            None,
        )
        .map_err(|e| AppError::Audio(format!("Failed to build output stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| AppError::Audio(format!("Failed to start playback: {}", e)))?;
    Ok(stream)
}
