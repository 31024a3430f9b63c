// Fakes and helpers shared by the unit tests.

use crate::api::preview::{ByteFetcher, EncodedBytes, PreviewResolver};
use crate::audio::capability::PlaybackCapability;
use crate::audio::context::{Mixer, OutputDevice, SharedDecodeContext, Voice};
use crate::audio::element::{ElementFactory, MediaElement, MediaError, MediaErrorSender};
use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::events::{StateChangedPayload, EVENT_CAPACITY};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};

pub(crate) const VOLUME: f32 = 0.4;

/// Poll `cond` until it holds, failing the test after about two seconds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not met in time");
}

/// Everything published so far, without waiting.
pub(crate) fn drain(rx: &mut broadcast::Receiver<StateChangedPayload>) -> Vec<StateChangedPayload> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// A 16-bit PCM WAV of a short square wave.
pub(crate) fn wav_bytes(sample_rate: u32, channels: u16, frames: u32) -> Vec<u8> {
    let bytes_per_sample = 2u16;
    let block_align = channels * bytes_per_sample;
    let data_len = frames * block_align as u32;

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&(bytes_per_sample * 8).to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for frame in 0..frames {
        let value: i16 = if (frame / 50) % 2 == 0 { 8000 } else { -8000 };
        for _ in 0..channels {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

/// Serves each connection with the response picked by `respond`, which
/// receives the request line. Returns the base address and a hit counter.
pub(crate) async fn serve<F>(respond: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(&str) -> (u16, &'static str, Vec<u8>) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let line = request.lines().next().unwrap_or_default().to_string();
                let (status, content_type, body) = respond(&line);
                let head = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    status,
                    content_type,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), hits)
}

/// In-memory output device driven by explicit `render` calls.
#[derive(Default)]
pub(crate) struct TestOutput {
    pub running: AtomicBool,
    pub closed: AtomicBool,
    pub resumes: AtomicUsize,
    pub mixer: Mixer,
}

impl OutputDevice for TestOutput {
    fn resume(&self) -> AppResult<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn submit(&self, voice: Arc<Voice>) {
        self.mixer.add(voice);
    }
}

pub(crate) type Outputs = Arc<Mutex<Vec<Arc<TestOutput>>>>;

/// A shared context whose opener hands out `TestOutput`s, recording each.
pub(crate) fn test_context() -> (Arc<SharedDecodeContext>, Outputs) {
    let opened: Outputs = Arc::default();
    let record = Arc::clone(&opened);
    let shared = SharedDecodeContext::with_opener(move || {
        let output = Arc::new(TestOutput::default());
        record.lock().unwrap().push(Arc::clone(&output));
        Ok(output as Arc<dyn OutputDevice>)
    });
    (Arc::new(shared), opened)
}

/// Relay stand-in that counts requests and can be held back once.
pub(crate) struct CountingFetcher {
    bytes: EncodedBytes,
    fetches: AtomicUsize,
    fail: AtomicBool,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl CountingFetcher {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: EncodedBytes::from(bytes),
            fetches: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }

    /// Hold the next fetch until the returned sender fires.
    pub fn gate(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ByteFetcher for CountingFetcher {
    fn fetch<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, AppResult<EncodedBytes>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Relay { status: 502 });
            }
            Ok(self.bytes.clone())
        }
        .boxed()
    }
}

pub(crate) enum Reply {
    Now(Option<String>),
    Later(oneshot::Receiver<Option<String>>),
}

/// Resolver that answers from a script and records each call's bust flag.
#[derive(Default)]
pub(crate) struct ScriptedResolver {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<bool>>,
}

impl ScriptedResolver {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::default(),
        }
    }

    pub fn urls(urls: &[&str]) -> Self {
        Self::new(
            urls.iter()
                .map(|url| Reply::Now(Some(url.to_string())))
                .collect(),
        )
    }

    /// Queue a reply answered later through the returned sender.
    pub fn push_later(&self) -> oneshot::Sender<Option<String>> {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().unwrap().push_back(Reply::Later(rx));
        tx
    }

    pub fn calls(&self) -> Vec<bool> {
        self.calls.lock().unwrap().clone()
    }
}

impl PreviewResolver for ScriptedResolver {
    fn resolve<'a>(
        &'a self,
        _title: &'a str,
        _artist: &'a str,
        bust_cache: bool,
    ) -> BoxFuture<'a, Option<String>> {
        self.calls.lock().unwrap().push(bust_cache);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Now(None));
        async move {
            match reply {
                Reply::Now(url) => url,
                Reply::Later(rx) => rx.await.unwrap_or(None),
            }
        }
        .boxed()
    }
}

/// Records what sessions do to their elements and lets tests inject errors.
#[derive(Clone, Default)]
pub(crate) struct ElementProbe {
    log: Arc<Mutex<Vec<String>>>,
    senders: Arc<Mutex<Vec<MediaErrorSender>>>,
}

impl ElementProbe {
    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Report a load failure for `src` from every element built so far.
    pub fn fail(&self, src: &str) {
        for sender in self.senders.lock().unwrap().iter() {
            let _ = sender.send(MediaError {
                src: src.to_string(),
                message: "MEDIA_ERR_SRC_NOT_SUPPORTED".into(),
            });
        }
    }

    pub fn factory(&self) -> ElementFactory {
        let probe = self.clone();
        Arc::new(move |errors| {
            probe.senders.lock().unwrap().push(errors);
            Box::new(FakeElement {
                log: Arc::clone(&probe.log),
                src: None,
                paused: true,
            }) as Box<dyn MediaElement>
        })
    }
}

struct FakeElement {
    log: Arc<Mutex<Vec<String>>>,
    src: Option<String>,
    paused: bool,
}

impl FakeElement {
    fn record(&self, what: &str) {
        let src = self.src.as_deref().unwrap_or("-");
        self.log.lock().unwrap().push(format!("{} {}", what, src));
    }
}

impl MediaElement for FakeElement {
    fn set_src(&mut self, url: &str) {
        self.src = Some(url.to_string());
        self.record("src");
    }

    fn src(&self) -> Option<&str> {
        self.src.as_deref()
    }

    fn play(&mut self) {
        self.paused = false;
        self.record("play");
    }

    fn pause(&mut self) {
        self.paused = true;
        self.record("pause");
    }

    fn rewind(&mut self) {
        self.record("rewind");
    }

    fn set_volume(&mut self, volume: f32) {
        self.record(&format!("volume={}", volume));
    }

    fn is_paused(&self) -> bool {
        self.paused
    }
}

pub(crate) struct Harness {
    pub engine: Arc<Engine>,
    pub resolver: Arc<ScriptedResolver>,
    pub fetcher: Arc<CountingFetcher>,
    pub elements: ElementProbe,
    pub outputs: Outputs,
}

pub(crate) fn harness(capability: PlaybackCapability, resolver: ScriptedResolver) -> Harness {
    let resolver = Arc::new(resolver);
    let fetcher = Arc::new(CountingFetcher::new(wav_bytes(8000, 1, 8000)));
    let elements = ElementProbe::default();
    let (decode_context, outputs) = test_context();

    let engine = Engine {
        resolver: Arc::clone(&resolver) as Arc<dyn PreviewResolver>,
        fetcher: Arc::clone(&fetcher) as Arc<dyn ByteFetcher>,
        decode_context,
        elements: elements.factory(),
        capability,
        volume_ceiling: VOLUME,
        max_retries: 2,
        events: broadcast::channel(EVENT_CAPACITY).0,
    };

    Harness {
        engine: Arc::new(engine),
        resolver,
        fetcher,
        elements,
        outputs,
    }
}
