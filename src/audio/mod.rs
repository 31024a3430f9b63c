pub mod capability;
pub mod context;
pub mod decoder;
pub mod element;
pub mod prefetch;
pub mod stream_source;
