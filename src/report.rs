use log::{error, info, warn};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Methods,
    Manifest,
    Resources,
    Libraries,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Methods => "protection code",
            Category::Manifest => "manifest",
            Category::Resources => "file paths configuration",
            Category::Libraries => "native libraries",
        };
        f.write_str(name)
    }
}

/// Something the patch engine wants the user to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchEvent {
    Started(Category),
    Patched {
        category: Category,
        path: PathBuf,
        detail: String,
    },
    AlreadyPatched {
        category: Category,
        path: PathBuf,
        detail: String,
    },
    Skipped {
        category: Category,
        path: PathBuf,
        reason: String,
    },
    Failed {
        category: Category,
        path: PathBuf,
        error: String,
    },
    LibraryCopied {
        library: String,
        abi: String,
    },
    ArchitectureSkipped {
        abi: String,
        reason: String,
    },
    Warning(String),
}

impl fmt::Display for PatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchEvent::Started(category) => write!(f, "Patching {category}..."),
            PatchEvent::Patched { path, detail, .. } => {
                write!(f, "Patched {}: {detail}", path.display())
            }
            PatchEvent::AlreadyPatched { path, detail, .. } => {
                write!(f, "Already patched {}: {detail}", path.display())
            }
            PatchEvent::Skipped { path, reason, .. } => {
                write!(f, "Skipped {}: {reason}", path.display())
            }
            PatchEvent::Failed { path, error, .. } => {
                write!(f, "Failed to patch {}: {error}", path.display())
            }
            PatchEvent::LibraryCopied { library, abi } => {
                write!(f, "Copied {library} to {abi} architecture")
            }
            PatchEvent::ArchitectureSkipped { abi, reason } => {
                write!(f, "Not copying libraries into {abi}: {reason}")
            }
            PatchEvent::Warning(message) => f.write_str(message),
        }
    }
}

/// Sink for engine events. Components receive one by reference instead of
/// reaching for a global logger.
pub trait Reporter: Send + Sync {
    fn report(&self, event: PatchEvent);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: PatchEvent) {
        match &event {
            PatchEvent::Started(_) => info!("→ {event}"),
            PatchEvent::Patched { .. }
            | PatchEvent::AlreadyPatched { .. }
            | PatchEvent::LibraryCopied { .. } => info!("✓ {event}"),
            PatchEvent::Skipped { .. }
            | PatchEvent::ArchitectureSkipped { .. }
            | PatchEvent::Warning(_) => warn!("{event}"),
            PatchEvent::Failed { .. } => error!("{event}"),
        }
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: std::sync::Mutex<Vec<PatchEvent>>,
}

#[cfg(test)]
impl RecordingReporter {
    pub fn events(&self) -> Vec<PatchEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PatchEvent::Warning(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
impl Reporter for RecordingReporter {
    fn report(&self, event: PatchEvent) {
        self.events.lock().unwrap().push(event);
    }
}
