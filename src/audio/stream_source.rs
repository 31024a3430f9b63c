use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// How far the download may run ahead of the reader.
const MAX_AHEAD_BYTES: usize = 4 * 1024 * 1024;

#[derive(Default)]
struct Progress {
    data: Vec<u8>,
    position: usize,
    finished: bool,
    error: Option<String>,
    reader_dropped: bool,
}

type Shared = Arc<(Mutex<Progress>, Condvar)>;

fn lock(shared: &Shared) -> MutexGuard<'_, Progress> {
    shared.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reader half of a progressive HTTP download, usable as a symphonia
/// `MediaSource`. Reads block until bytes arrive, the download ends or fails.
/// Everything downloaded is retained so the decoder can seek backwards.
pub struct ProgressiveSource {
    shared: Shared,
}

/// Writer half, fed by the download task.
pub struct ProgressiveWriter {
    shared: Shared,
}

pub fn progressive_pair() -> (ProgressiveSource, ProgressiveWriter) {
    let shared: Shared = Arc::new((Mutex::new(Progress::default()), Condvar::new()));
    (
        ProgressiveSource {
            shared: Arc::clone(&shared),
        },
        ProgressiveWriter { shared },
    )
}

impl Read for ProgressiveSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let cvar = &self.shared.1;
        let mut state = lock(&self.shared);

        while state.position >= state.data.len() && !state.finished && state.error.is_none() {
            state = cvar.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
        }

        if let Some(ref err) = state.error {
            return Err(io::Error::new(io::ErrorKind::Other, err.clone()));
        }

        let available = state.data.len().saturating_sub(state.position);
        let to_read = buf.len().min(available);
        let start = state.position;
        buf[..to_read].copy_from_slice(&state.data[start..start + to_read]);
        state.position += to_read;

        cvar.notify_all();
        Ok(to_read)
    }
}

impl Seek for ProgressiveSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut state = lock(&self.shared);

        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => state.position as i64 + offset,
            SeekFrom::End(offset) => state.data.len() as i64 + offset,
        };

        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Seek to negative position",
            ));
        }

        state.position = new_pos as usize;
        self.shared.1.notify_all();
        Ok(state.position as u64)
    }
}

impl symphonia::core::io::MediaSource for ProgressiveSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        let state = lock(&self.shared);
        state.finished.then_some(state.data.len() as u64)
    }
}

impl Drop for ProgressiveSource {
    fn drop(&mut self) {
        lock(&self.shared).reader_dropped = true;
        self.shared.1.notify_all();
    }
}

impl Drop for ProgressiveWriter {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        if !state.finished {
            state.error = Some("download aborted".into());
            state.finished = true;
        }
        drop(state);
        self.shared.1.notify_all();
    }
}

impl ProgressiveWriter {
    /// Append a chunk. Fails once the reader has gone away, which is the
    /// download task's cue to stop.
    pub fn write_bytes(&self, chunk: &[u8]) -> Result<(), String> {
        let cvar = &self.shared.1;
        let mut state = lock(&self.shared);

        while state.data.len().saturating_sub(state.position) >= MAX_AHEAD_BYTES
            && !state.reader_dropped
        {
            state = cvar.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
        }

        if state.reader_dropped {
            return Err("reader closed".into());
        }

        state.data.extend_from_slice(chunk);
        cvar.notify_all();
        Ok(())
    }

    pub fn finish(&self) {
        lock(&self.shared).finished = true;
        self.shared.1.notify_all();
    }

    pub fn set_error(&self, error: String) {
        let mut state = lock(&self.shared);
        state.error = Some(error);
        state.finished = true;
        drop(state);
        self.shared.1.notify_all();
    }
}
