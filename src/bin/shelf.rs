use preview_shelf::{AppResult, Engine, EngineConfig, RecordShelf, Track};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const USAGE: &str = "usage: shelf \"Title - Artist\" [\"Title - Artist\" ...]";
const HELP: &str = "commands: hover N | leave N | tap N | refresh N | status | quit";

fn parse_track(index: usize, arg: &str) -> Option<Track> {
    let (title, artist) = arg.split_once(" - ")?;
    Some(Track::new((index + 1).to_string(), title.trim(), artist.trim()))
}

#[tokio::main]
async fn main() -> AppResult<()> {
    preview_shelf::init_logging();

    let tracks: Vec<Track> = std::env::args()
        .skip(1)
        .enumerate()
        .filter_map(|(i, arg)| {
            let track = parse_track(i, &arg);
            if track.is_none() {
                log::warn!("Skipping \"{}\": expected \"Title - Artist\"", arg);
            }
            track
        })
        .collect();
    if tracks.is_empty() {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    }

    let config = EngineConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config: {}. Using defaults.", e);
        EngineConfig::default()
    });
    let engine = Arc::new(Engine::from_config(&config)?);

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("[{}] {:?}", event.track_id, event.state);
        }
    });

    let mut shelf = RecordShelf::new(engine);
    shelf.mount(tracks);
    for session in shelf.sessions() {
        let track = session.track();
        println!("{}: {} - {}", track.id, track.title, track.artist);
    }
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("hover"), Some(id)) => shelf.hover_enter(id),
            (Some("leave"), Some(id)) => shelf.hover_leave(id),
            (Some("tap"), Some(id)) => shelf.tap(id),
            (Some("refresh"), Some(id)) => shelf.refresh(id),
            (Some("status"), None) => println!("{}", serde_json::to_string_pretty(&shelf.snapshot())?),
            (Some("quit"), None) => break,
            (None, _) => {}
            _ => println!("{}", HELP),
        }
    }

    shelf.unmount();
    Ok(())
}
