//! Nag notices: the reminder text posted into an incident room.

use breakbot_core::config::{NagKind, PriorityConfig};

use crate::nag::Nag;

/// A reminder ready to be sent to a room.
#[derive(Debug, Clone)]
pub struct NagNotice {
    pub room: String,
    pub kind: NagKind,
    pub text: String,
}

impl NagNotice {
    pub fn new(room: &str, priority: &PriorityConfig, nag: &Nag) -> Self {
        let emoji = if priority.high_priority { "🚨" } else { "⏰" };
        let ago = human_duration(nag.elapsed_secs);
        let body = match nag.kind {
            NagKind::NeedsInitialComm => format!(
                "No comm update has been posted since this {} incident started {ago} ago. \
                 Please post an initial comm update.",
                priority.name
            ),
            NagKind::NeedsCommUpdate => format!(
                "The last comm update was {ago} ago. {} incidents should post one at least every {}.",
                priority.name,
                human_duration(nag.threshold_secs)
            ),
            NagKind::NoPoint => format!(
                "This {} incident has had no point assigned for {ago}. Who is point?",
                priority.name
            ),
            NagKind::NoComms => format!(
                "Nothing has been logged on this {} incident for {ago}. How is it going?",
                priority.name
            ),
        };
        Self {
            room: room.to_string(),
            kind: nag.kind,
            text: format!("{emoji} {body}"),
        }
    }
}

/// Coarse "1h 5m" style rendering.
pub fn human_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}
