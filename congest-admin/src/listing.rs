//! Text rendering of congestion entries for operators.
//!
//! One `|` separated line per entry:
//! `ts|line|host|ip|scheme|prefix|state|F|M`, extended with rising verbosity by
//! the formatted last-congestion time, the key, the newest failure time, and
//! finally `events|refcount|active`.

use chrono::{DateTime, Local, TimeZone, Utc};
use congest_core::EntrySnapshot;
use std::fmt::Write;

/// Highest verbosity level.
pub const MAX_VERBOSITY: u8 = 4;

/// How entry lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingFormat {
    /// 0 through [`MAX_VERBOSITY`].
    pub verbosity: u8,
    /// Render times in local time rather than UTC.
    pub local_time: bool,
}

fn or_blank(value: Option<String>) -> String {
    value.unwrap_or_else(|| " ".to_string())
}

fn format_time<Tz: TimeZone>(tz: &Tz, secs: i64) -> Option<String>
where
    Tz::Offset: std::fmt::Display,
{
    let utc = DateTime::<Utc>::from_timestamp(secs, 0)?;
    Some(utc.with_timezone(tz).format("%Y/%m/%d %H:%M:%S").to_string())
}

/// Render one entry line, without the trailing newline.
pub fn format_entry(snap: &EntrySnapshot, format: ListingFormat) -> String {
    let mut line = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}",
        snap.timestamp,
        snap.rule_line,
        or_blank(snap.hostname.clone()),
        or_blank(snap.ip.map(|ip| ip.to_string())),
        snap.scheme.as_label(),
        or_blank(snap.prefix.clone()),
        snap.state.letter(),
        snap.congested_rejections,
        snap.capacity_rejections,
    );
    if format.verbosity == 0 {
        return line;
    }

    let when = if snap.congested {
        if format.local_time {
            format_time(&Local, snap.last_congested)
        } else {
            format_time(&Utc, snap.last_congested)
        }
    } else {
        None
    };
    let _ = write!(line, "|{}", or_blank(when));
    if format.verbosity > 1 {
        let _ = write!(line, "|{}", snap.key);
    }
    if format.verbosity > 2 {
        let _ = write!(line, "|{}", snap.last_event);
    }
    if format.verbosity > 3 {
        let _ = write!(
            line,
            "|{}|{}|{}",
            snap.events, snap.ref_count, snap.active_connections
        );
    }
    line
}
