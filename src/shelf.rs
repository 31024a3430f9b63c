use crate::api::models::{Track, TrackId};
use crate::engine::Engine;
use crate::events::{PlaybackState, StateChangedPayload};
use crate::session::PlaybackSession;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// One card as reported by `RecordShelf::snapshot`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardState {
    pub track: Track,
    pub state: PlaybackState,
    pub has_preview: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelfState {
    pub active_id: Option<TrackId>,
    pub cards: Vec<CardState>,
}

/// A row of cards sharing one active-preview token. At most one card holds
/// the token, and only the holder may be playing.
pub struct RecordShelf {
    engine: Arc<Engine>,
    token: watch::Sender<Option<TrackId>>,
    sessions: Vec<PlaybackSession>,
}

impl RecordShelf {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            token: watch::channel(None).0,
            sessions: Vec::new(),
        }
    }

    /// Show `tracks`. Cards already mounted under the same id keep their
    /// session; the rest are unmounted.
    pub fn mount(&mut self, tracks: Vec<Track>) {
        let mut previous = std::mem::take(&mut self.sessions);

        for track in tracks {
            let kept = previous
                .iter()
                .position(|s| s.id() == track.id && s.track() == &track)
                .map(|i| previous.swap_remove(i));
            let session = kept.unwrap_or_else(|| {
                PlaybackSession::mount(track, Arc::clone(&self.engine), self.token.subscribe())
            });
            self.sessions.push(session);
        }

        let active = self.active_id();
        if active.is_some_and(|id| self.session(&id).is_none()) {
            self.token.send_replace(None);
        }
        log::debug!(
            "Mounted {} cards ({} unmounted)",
            self.sessions.len(),
            previous.len()
        );
        // Dropping a session unmounts it.
        drop(previous);
    }

    pub fn unmount(&mut self) {
        self.token.send_replace(None);
        self.sessions.clear();
    }

    pub fn active_id(&self) -> Option<TrackId> {
        self.token.borrow().clone()
    }

    /// Hand the token to `id` (or nobody). The old holder is stopped before
    /// the new one starts, within this call.
    pub fn set_active(&self, id: Option<&str>) {
        if let Some(id) = id {
            if self.session(id).is_none() {
                log::debug!("Ignoring activation of unknown card {}", id);
                return;
            }
        }

        let previous = self.token.send_replace(id.map(str::to_string));
        if let Some(prev) = previous.as_deref().filter(|prev| Some(*prev) != id) {
            if let Some(session) = self.session(prev) {
                session.set_active(false);
            }
        }
        if let Some(session) = id.and_then(|id| self.session(id)) {
            session.set_active(true);
        }
    }

    pub fn hover_enter(&self, id: &str) {
        self.set_active(Some(id));
    }

    pub fn hover_leave(&self, id: &str) {
        if self.active_id().as_deref() == Some(id) {
            self.set_active(None);
        }
    }

    /// Tapping the holder clears the token; tapping anything else takes it.
    pub fn tap(&self, id: &str) {
        if self.active_id().as_deref() == Some(id) {
            self.set_active(None);
        } else {
            self.set_active(Some(id));
        }
    }

    pub fn refresh(&self, id: &str) {
        match self.session(id) {
            Some(session) => session.refresh(),
            None => log::debug!("Ignoring refresh of unknown card {}", id),
        }
    }

    pub fn session(&self, id: &str) -> Option<&PlaybackSession> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    pub fn sessions(&self) -> &[PlaybackSession] {
        &self.sessions
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedPayload> {
        self.engine.subscribe()
    }

    pub fn snapshot(&self) -> ShelfState {
        ShelfState {
            active_id: self.active_id(),
            cards: self
                .sessions
                .iter()
                .map(|s| CardState {
                    track: s.track().clone(),
                    state: s.state(),
                    has_preview: s.has_preview(),
                })
                .collect(),
        }
    }
}

impl Drop for RecordShelf {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capability::PlaybackCapability;
    use crate::test_support::{drain, harness, wait_until, Harness, ScriptedResolver};

    const U1: &str = "https://cdn.example/one.mp3";
    const U2: &str = "https://cdn.example/two.mp3";

    fn tracks() -> Vec<Track> {
        vec![
            Track::new("a", "Blue in Green", "Miles Davis"),
            Track::new("b", "Naima", "John Coltrane"),
        ]
    }

    async fn ready_shelf(h: &Harness) -> RecordShelf {
        let mut shelf = RecordShelf::new(Arc::clone(&h.engine));
        shelf.mount(tracks());
        wait_until(|| {
            shelf
                .sessions()
                .iter()
                .all(|s| s.state() == PlaybackState::Ready)
        })
        .await;
        shelf
    }

    #[tokio::test]
    async fn hovering_another_card_stops_the_first_before_starting() {
        let h = harness(PlaybackCapability::Hover, ScriptedResolver::urls(&[U1, U2]));
        let shelf = ready_shelf(&h).await;
        let mut events = shelf.subscribe();

        shelf.hover_enter("a");
        shelf.hover_enter("b");

        assert_eq!(shelf.active_id().as_deref(), Some("b"));
        assert!(!shelf.session("a").unwrap().is_playing());
        assert!(shelf.session("b").unwrap().is_playing());

        let seen: Vec<(String, PlaybackState)> = drain(&mut events)
            .into_iter()
            .map(|e| (e.track_id, e.state))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), PlaybackState::Playing),
                ("a".to_string(), PlaybackState::Stopped),
                ("b".to_string(), PlaybackState::Playing),
            ]
        );
    }

    #[tokio::test]
    async fn hover_leave_only_clears_the_holder() {
        let h = harness(PlaybackCapability::Hover, ScriptedResolver::urls(&[U1, U2]));
        let shelf = ready_shelf(&h).await;

        shelf.hover_enter("a");
        shelf.hover_leave("b");
        assert!(shelf.session("a").unwrap().is_playing());

        shelf.hover_leave("a");
        assert_eq!(shelf.active_id(), None);
        assert_eq!(shelf.session("a").unwrap().state(), PlaybackState::Stopped);
    }

    #[tokio::test]
    async fn taps_toggle_and_keep_a_single_voice() {
        let h = harness(PlaybackCapability::TouchPrimary, ScriptedResolver::urls(&[U1, U2]));
        let shelf = ready_shelf(&h).await;

        shelf.tap("a");
        wait_until(|| shelf.session("a").unwrap().is_playing()).await;

        let output = Arc::clone(&h.outputs.lock().unwrap()[0]);
        let mut buf = vec![0.0f32; 64];

        shelf.tap("b");
        assert_eq!(shelf.session("a").unwrap().state(), PlaybackState::Stopped);
        output.mixer.render(&mut buf, 1, 8000);
        assert!(buf.iter().all(|s| *s == 0.0), "a is silent before b is submitted");
        assert_eq!(output.mixer.active_voices(), 0);

        wait_until(|| shelf.session("b").unwrap().is_playing()).await;
        assert!(!shelf.session("a").unwrap().is_playing());
        output.mixer.render(&mut buf, 1, 8000);
        assert_eq!(output.mixer.active_voices(), 1);
        assert!(buf.iter().any(|s| *s != 0.0));

        shelf.tap("b");
        assert_eq!(shelf.active_id(), None);
        assert!(shelf.sessions().iter().all(|s| !s.is_playing()));
        assert_eq!(h.outputs.lock().unwrap().len(), 1, "one context for the shelf");
    }

    #[tokio::test]
    async fn unknown_ids_are_ignored() {
        let h = harness(PlaybackCapability::Hover, ScriptedResolver::urls(&[U1, U2]));
        let shelf = ready_shelf(&h).await;

        shelf.hover_enter("a");
        shelf.hover_enter("missing");
        shelf.tap("missing");
        shelf.refresh("missing");

        assert_eq!(shelf.active_id().as_deref(), Some("a"));
        assert!(shelf.session("a").unwrap().is_playing());
        assert_eq!(h.resolver.calls().len(), 2);
    }

    #[tokio::test]
    async fn remounting_keeps_surviving_cards_and_drops_the_rest() {
        let h = harness(PlaybackCapability::Hover, ScriptedResolver::urls(&[U1, U2]));
        let mut shelf = ready_shelf(&h).await;
        shelf.hover_enter("b");

        shelf.mount(vec![Track::new("a", "Blue in Green", "Miles Davis")]);
        assert_eq!(shelf.sessions().len(), 1);
        assert_eq!(shelf.active_id(), None);
        assert_eq!(shelf.session("a").unwrap().state(), PlaybackState::Ready);
        assert_eq!(h.resolver.calls().len(), 2, "surviving card is not re-resolved");

        let snapshot = shelf.snapshot();
        assert_eq!(snapshot.cards.len(), 1);
        assert!(snapshot.cards[0].has_preview);
    }
}
