use crate::config::InputModality;
use serde::Serialize;
use std::sync::OnceLock;

const INPUT_DEVICES_PATH: &str = "/proc/bus/input/devices";

/// How previews can be played on this client, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackCapability {
    /// A pointer that can hover: stream through a media element.
    Hover,
    /// Touch only: fetch, decode and play a one-shot node from the tap.
    TouchPrimary,
}

static DETECTED: OnceLock<PlaybackCapability> = OnceLock::new();

impl PlaybackCapability {
    /// Detect once and cache. Later calls ignore `modality` and return the
    /// first answer; input changes mid-session are not re-evaluated.
    pub fn detect(modality: InputModality) -> Self {
        *DETECTED.get_or_init(|| {
            let capability = match modality {
                InputModality::Hover => PlaybackCapability::Hover,
                InputModality::Touch => PlaybackCapability::TouchPrimary,
                InputModality::Auto => std::fs::read_to_string(INPUT_DEVICES_PATH)
                    .map(|listing| classify_input_devices(&listing))
                    .unwrap_or(PlaybackCapability::Hover),
            };
            log::info!("Playback capability: {:?} (modality {:?})", capability, modality);
            capability
        })
    }

    pub fn can_hover(self) -> bool {
        self == PlaybackCapability::Hover
    }
}

/// Classify a Linux input device listing. Any pointer means hover; a
/// touchscreen without a pointer means touch-primary.
pub fn classify_input_devices(listing: &str) -> PlaybackCapability {
    let mut has_pointer = false;
    let mut has_touch = false;

    for block in listing.split("\n\n") {
        let mut name = "";
        let mut handlers = "";
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("N: Name=") {
                name = rest.trim_matches('"');
            } else if let Some(rest) = line.strip_prefix("H: Handlers=") {
                handlers = rest;
            }
        }

        let name = name.to_lowercase();
        let is_touch = name.contains("touchscreen") || name.contains("touch screen");
        if is_touch {
            has_touch = true;
        } else if handlers.split_whitespace().any(|h| h.starts_with("mouse")) {
            has_pointer = true;
        }
    }

    if has_touch && !has_pointer {
        PlaybackCapability::TouchPrimary
    } else {
        PlaybackCapability::Hover
    }
}
