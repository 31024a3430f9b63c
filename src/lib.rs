pub mod api;
pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod session;
pub mod shelf;

#[cfg(test)]
mod test_support;

pub use api::models::{Track, TrackId};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{AppError, AppResult};
pub use events::{PlaybackState, StateChangedPayload};
pub use session::PlaybackSession;
pub use shelf::RecordShelf;

/// Install the process logger. `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("preview_shelf=info"),
    )
    .try_init();
}
