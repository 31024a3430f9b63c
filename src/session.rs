use crate::api::models::{PreviewResolution, Track, TrackId};
use crate::audio::context::{ContextHandle, DecodeContext, OneShotNode};
use crate::audio::decoder::{extension_hint, DecodedClip};
use crate::audio::element::{MediaElement, MediaError};
use crate::audio::prefetch::PrefetchBuffer;
use crate::engine::Engine;
use crate::error::AppResult;
use crate::events::{PlaybackState, StateChangedPayload};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What is currently producing sound, chosen at the ready -> playing step.
enum Playback {
    Direct,
    Decoded(OneShotNode),
}

struct SessionInner {
    state: PlaybackState,
    resolution: PreviewResolution,
    /// Sequence number of the newest resolution; older answers are dropped.
    seq: u64,
    /// Same idea for decode attempts.
    decode_seq: u64,
    active: bool,
    exhausted: bool,
    /// The decode context cannot exist here; no preview for this session.
    disabled: bool,
    disposed: bool,
    playback: Option<Playback>,
    element: Option<Box<dyn MediaElement>>,
    clip: Option<(String, Arc<DecodedClip>)>,
    resolve_task: Option<JoinHandle<()>>,
    decode_task: Option<JoinHandle<()>>,
    element_errors: Option<JoinHandle<()>>,
}

struct SessionCore {
    track: Track,
    engine: Arc<Engine>,
    token: watch::Receiver<Option<TrackId>>,
    prefetch: PrefetchBuffer,
    inner: Mutex<SessionInner>,
}

/// Per-card playback state machine. Resolves a preview URL on mount and
/// plays it whenever the shelf hands this card the active token, either
/// through a streaming media element (hover clients) or as a decoded one-shot
/// node (touch clients).
pub struct PlaybackSession {
    core: Arc<SessionCore>,
}

impl PlaybackSession {
    /// Create the session and start resolving its preview. Needs a tokio
    /// runtime.
    pub fn mount(
        track: Track,
        engine: Arc<Engine>,
        token: watch::Receiver<Option<TrackId>>,
    ) -> Self {
        let prefetch = PrefetchBuffer::new(Arc::clone(&engine.fetcher));
        let core = Arc::new(SessionCore {
            track,
            engine,
            token,
            prefetch,
            inner: Mutex::new(SessionInner {
                state: PlaybackState::Idle,
                resolution: PreviewResolution::default(),
                seq: 0,
                decode_seq: 0,
                active: false,
                exhausted: false,
                disabled: false,
                disposed: false,
                playback: None,
                element: None,
                clip: None,
                resolve_task: None,
                decode_task: None,
                element_errors: None,
            }),
        });

        {
            let mut inner = core.lock();
            core.begin_resolution(&mut inner, false);
        }
        Self { core }
    }

    pub fn track(&self) -> &Track {
        &self.core.track
    }

    pub fn id(&self) -> &str {
        &self.core.track.id
    }

    pub fn state(&self) -> PlaybackState {
        self.core.lock().state
    }

    pub fn resolution(&self) -> PreviewResolution {
        self.core.lock().resolution.clone()
    }

    /// Whether the card should present itself as having a preview. Stays
    /// true while a cache-busting retry is being resolved.
    pub fn has_preview(&self) -> bool {
        let inner = self.core.lock();
        if inner.exhausted || inner.disabled {
            return false;
        }
        let retrying = inner.state == PlaybackState::Resolving && inner.resolution.attempt > 0;
        inner.resolution.url.is_some() || retrying
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// Throw away the current URL and resolve a fresh one.
    pub fn refresh(&self) {
        let mut inner = self.core.lock();
        if inner.disposed || inner.disabled {
            return;
        }
        inner.resolution.attempt = 0;
        inner.exhausted = false;
        self.core.begin_resolution(&mut inner, false);
    }

    /// Called by the shelf, synchronously, whenever this session gains or
    /// loses the active token. On touch clients this is the gesture handler,
    /// so the decode context is resumed here before anything suspends.
    pub fn set_active(&self, active: bool) {
        let mut inner = self.core.lock();
        if inner.disposed {
            return;
        }

        if !active {
            inner.active = false;
            self.core.stop_playback(&mut inner);
            return;
        }

        if inner.active && inner.state == PlaybackState::Playing {
            return;
        }
        inner.active = true;

        if !self.core.engine.capability.can_hover() {
            let Some(ctx) = self.core.borrow_context(&mut inner) else {
                return;
            };
            resume_context(&ctx);
        }

        let state = inner.state;
        match state {
            PlaybackState::Ready | PlaybackState::Stopped if inner.resolution.url.is_some() => {
                self.core.start_playback(&mut inner);
            }
            state => log::debug!(
                "{} active while {:?}; will play once a preview is ready",
                self.core.track.id,
                state
            ),
        }
    }

    /// Cancel all in-flight work and release every playback handle. Later
    /// completions are ignored.
    pub fn unmount(self) {
        drop(self);
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

fn resume_context(ctx: &DecodeContext) {
    if ctx.is_running() {
        return;
    }
    if let Err(e) = ctx.resume() {
        log::warn!("Failed to resume decode context: {}", e);
    }
}

impl SessionCore {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, inner: &mut SessionInner, state: PlaybackState) {
        if inner.state == state {
            return;
        }
        log::debug!("{}: {:?} -> {:?}", self.track.id, inner.state, state);
        inner.state = state;
        let _ = self.engine.events.send(StateChangedPayload {
            track_id: self.track.id.clone(),
            state,
        });
    }

    fn holds_token(&self) -> bool {
        self.token.borrow().as_deref() == Some(self.track.id.as_str())
    }

    fn begin_resolution(self: &Arc<Self>, inner: &mut SessionInner, bust_cache: bool) {
        if inner.disposed || inner.disabled {
            return;
        }
        inner.seq += 1;
        let seq = inner.seq;
        if let Some(task) = inner.resolve_task.take() {
            task.abort();
        }
        self.discard_media(inner);
        self.set_state(inner, PlaybackState::Resolving);

        let weak = Arc::downgrade(self);
        let resolver = Arc::clone(&self.engine.resolver);
        let title = self.track.title.clone();
        let artist = self.track.artist.clone();
        inner.resolve_task = Some(tokio::spawn(async move {
            let url = resolver.resolve(&title, &artist, bust_cache).await;
            if let Some(core) = weak.upgrade() {
                core.on_resolved(seq, url);
            }
        }));
    }

    fn on_resolved(self: &Arc<Self>, seq: u64, url: Option<String>) {
        let mut inner = self.lock();
        if inner.disposed || seq != inner.seq {
            log::debug!("{}: dropping stale resolution #{}", self.track.id, seq);
            return;
        }
        inner.resolve_task = None;

        let Some(url) = url else {
            log::debug!("{}: no preview available", self.track.id);
            inner.resolution.url = None;
            self.set_state(&mut inner, PlaybackState::Idle);
            return;
        };

        log::debug!("{}: resolved preview #{}", self.track.id, seq);
        inner.resolution.url = Some(url.clone());
        self.set_state(&mut inner, PlaybackState::Ready);

        if !self.engine.capability.can_hover() {
            self.prefetch.warm(&url);
        }
        if inner.active {
            self.start_playback(&mut inner);
        }
    }

    /// Borrow the shared decode context, disabling this session for good if
    /// the platform has none.
    fn borrow_context(&self, inner: &mut SessionInner) -> Option<Arc<DecodeContext>> {
        match self.engine.decode_context.get() {
            ContextHandle::Available(ctx) => Some(ctx),
            ContextHandle::Unavailable => {
                log::info!("{}: no decode context, previews disabled", self.track.id);
                inner.disabled = true;
                self.discard_media(inner);
                self.set_state(inner, PlaybackState::Idle);
                None
            }
        }
    }

    fn start_playback(self: &Arc<Self>, inner: &mut SessionInner) {
        let Some(url) = inner.resolution.url.clone() else {
            return;
        };

        if self.engine.capability.can_hover() {
            self.ensure_element(inner);
            if let Some(element) = inner.element.as_mut() {
                element.set_src(&url);
                element.set_volume(self.engine.volume_ceiling);
                element.play();
            }
            inner.playback = Some(Playback::Direct);
            self.set_state(inner, PlaybackState::Playing);
            return;
        }

        let Some(ctx) = self.borrow_context(inner) else {
            return;
        };
        resume_context(&ctx);

        let cached = inner
            .clip
            .as_ref()
            .filter(|(clip_url, _)| *clip_url == url)
            .map(|(_, clip)| Arc::clone(clip));
        if let Some(clip) = cached {
            self.start_node(inner, &ctx, clip);
            return;
        }

        if inner.decode_task.is_some() {
            return;
        }

        inner.decode_seq += 1;
        let decode_seq = inner.decode_seq;
        let seq = inner.seq;
        let prefetch = self.prefetch.clone();
        let weak = Arc::downgrade(self);
        inner.decode_task = Some(tokio::spawn(async move {
            let result: AppResult<Arc<DecodedClip>> = async {
                let bytes = prefetch.take_or_fetch(&url).await?;
                ctx.decode(bytes, extension_hint(&url)).await
            }
            .await;
            if let Some(core) = weak.upgrade() {
                core.on_decoded(seq, decode_seq, url, ctx, result);
            }
        }));
    }

    fn on_decoded(
        self: &Arc<Self>,
        seq: u64,
        decode_seq: u64,
        url: String,
        ctx: Arc<DecodeContext>,
        result: AppResult<Arc<DecodedClip>>,
    ) {
        let mut inner = self.lock();
        if inner.disposed || inner.seq != seq || inner.decode_seq != decode_seq {
            return;
        }
        inner.decode_task = None;

        let clip = match result {
            Ok(clip) => clip,
            Err(e) => {
                self.fail(&mut inner, &format!("decode failed: {}", e));
                return;
            }
        };
        inner.clip = Some((url, Arc::clone(&clip)));

        if !inner.active || !self.holds_token() {
            log::debug!("{}: decoded after losing the token, not starting", self.track.id);
            return;
        }
        self.start_node(&mut inner, &ctx, clip);
    }

    fn start_node(self: &Arc<Self>, inner: &mut SessionInner, ctx: &DecodeContext, clip: Arc<DecodedClip>) {
        let mut node = ctx.create_one_shot(clip, self.engine.volume_ceiling);
        match node.start() {
            Ok(()) => {
                inner.playback = Some(Playback::Decoded(node));
                self.set_state(inner, PlaybackState::Playing);
            }
            Err(e) => self.fail(inner, &format!("node failed to start: {}", e)),
        }
    }

    fn ensure_element(self: &Arc<Self>, inner: &mut SessionInner) {
        if inner.element.is_some() {
            return;
        }
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel::<MediaError>();
        inner.element = Some((self.engine.elements)(errors_tx));

        let weak = Arc::downgrade(self);
        inner.element_errors = Some(tokio::spawn(async move {
            while let Some(error) = errors_rx.recv().await {
                let Some(core) = weak.upgrade() else {
                    break;
                };
                core.on_media_error(error);
            }
        }));
    }

    fn on_media_error(self: &Arc<Self>, error: MediaError) {
        let mut inner = self.lock();
        if inner.disposed || inner.resolution.url.as_deref() != Some(error.src.as_str()) {
            log::debug!("{}: ignoring error for stale source", self.track.id);
            return;
        }
        self.fail(&mut inner, &format!("element error: {}", error.message));
    }

    /// Recoverable failure: drop everything tied to the current URL and
    /// re-resolve with cache busting, up to `max_retries` times per
    /// activation. The count starts over after a play is stopped normally.
    fn fail(self: &Arc<Self>, inner: &mut SessionInner, reason: &str) {
        if inner.disposed {
            return;
        }
        log::warn!(
            "{}: preview failed (attempt {}): {}",
            self.track.id,
            inner.resolution.attempt,
            reason
        );
        self.set_state(inner, PlaybackState::Error);
        self.discard_media(inner);

        if inner.resolution.attempt >= self.engine.max_retries {
            log::info!("{}: giving up on preview", self.track.id);
            inner.exhausted = true;
            self.set_state(inner, PlaybackState::Idle);
            return;
        }
        inner.resolution.attempt += 1;
        self.begin_resolution(inner, true);
    }

    fn halt_output(&self, inner: &mut SessionInner) {
        if let Some(task) = inner.decode_task.take() {
            task.abort();
            inner.decode_seq += 1;
        }
        match inner.playback.take() {
            Some(Playback::Direct) => {
                if let Some(element) = inner.element.as_mut() {
                    element.pause();
                    element.rewind();
                }
            }
            Some(Playback::Decoded(mut node)) => node.stop(),
            None => {}
        }
    }

    fn stop_playback(&self, inner: &mut SessionInner) {
        self.halt_output(inner);
        if inner.state == PlaybackState::Playing {
            inner.resolution.attempt = 0;
            self.set_state(inner, PlaybackState::Stopped);
        }
    }

    /// Forget the URL and everything derived from it.
    fn discard_media(&self, inner: &mut SessionInner) {
        self.halt_output(inner);
        inner.resolution.url = None;
        inner.clip = None;
        self.prefetch.invalidate();
    }

    fn dispose(&self) {
        let mut inner = self.lock();
        if inner.disposed {
            return;
        }
        self.halt_output(&mut inner);
        inner.disposed = true;
        inner.seq += 1;
        for task in [
            inner.resolve_task.take(),
            inner.decode_task.take(),
            inner.element_errors.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        inner.element = None;
        inner.clip = None;
        inner.resolution.url = None;
        self.prefetch.invalidate();
        log::debug!("{}: unmounted", self.track.id);
    }
}
