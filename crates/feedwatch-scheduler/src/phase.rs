use chrono::{DateTime, Datelike, Utc};

use feedwatch_core::PhaseKind;

use crate::types::SchedulePhase;

/// Map the calendar month onto a season phase.
///
/// Months 9–12 are the regular season, 8 is pre-season and 1–7 off-season.
/// Acceleration follows the externally supplied live-game signal regardless
/// of phase.
pub fn resolve(now: DateTime<Utc>, live_game_window_active: bool) -> SchedulePhase {
    let kind = match now.month() {
        9..=12 => PhaseKind::Regular,
        8 => PhaseKind::PreSeason,
        _ => PhaseKind::OffSeason,
    };
    SchedulePhase::new(kind, live_game_window_active)
}
