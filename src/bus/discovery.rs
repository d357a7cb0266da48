use std::time::Duration;

use tracing::{info, instrument, warn};

use super::{BusError, Finder, SourceDescriptor};

/// Stream name inside the first parentheses of a display name.
///
/// `"STUDIO-PC (Camera 1)"` yields `Some("Camera 1")`.
pub fn extract_source_name(display_name: &str) -> Option<&str> {
    let start = display_name.find('(')? + 1;
    let len = display_name[start..].find(')')?;
    Some(&display_name[start..start + len])
}

/// Poll the finder until the source list settles, then return it.
///
/// Each poll waits up to `wait`; polling stops once the finder reports no
/// further changes or after `attempts` polls.
#[instrument(skip(finder))]
pub fn discover<F: Finder>(
    finder: &F,
    wait: Duration,
    attempts: u32,
) -> Result<Vec<SourceDescriptor>, BusError> {
    info!("Waiting for sources...");

    for _ in 0..attempts.max(1) {
        if !finder.wait_for_sources(wait) {
            break;
        }
    }

    let sources = finder.current_sources();
    if sources.is_empty() {
        return Err(BusError::NoSources);
    }

    for source in &sources {
        info!(name = %source.name, address = %source.address, "Found source");
    }
    Ok(sources)
}

/// Pick the input source: the first one, or the one whose stream name matches
pub fn select_source<'a>(
    sources: &'a [SourceDescriptor],
    input: Option<&str>,
) -> Result<&'a SourceDescriptor, BusError> {
    let Some(wanted) = input.filter(|name| !name.is_empty()) else {
        return sources.first().ok_or(BusError::NoSources);
    };

    sources
        .iter()
        .find(|source| extract_source_name(&source.name) == Some(wanted))
        .ok_or_else(|| {
            warn!(
                input = wanted,
                count = sources.len(),
                "Input source not found"
            );
            BusError::SourceNotFound {
                name: wanted.to_string(),
                available: sources.iter().map(|source| source.name.clone()).collect(),
            }
        })
}
