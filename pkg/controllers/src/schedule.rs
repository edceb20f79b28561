//! Daily schedule compiled from strategy windows.
//!
//! Each window becomes a trigger that fires once a day at the window's start
//! time. The window in force at any instant is found through the triggers'
//! next fire times, see [`active_entry_at`].

use chrono::{FixedOffset, Local, NaiveDateTime, NaiveTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use pkg_types::hpa::ScalingSpec;
use pkg_types::strategy::StrategySet;
use pkg_types::validate::validate_scaling_spec;

use crate::error::ScalingError;

/// A `validTime` value that is not `HH:MM-HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal validTime '{valid_time}': expected HH:MM-HH:MM")]
pub struct ScheduleParseError {
    pub valid_time: String,
}

impl ScheduleParseError {
    pub fn new(valid_time: impl Into<String>) -> Self {
        Self {
            valid_time: valid_time.into(),
        }
    }
}

/// Parsed `start-end` interval. `end` is `None` for `24:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTime {
    pub start: NaiveTime,
    pub end: Option<NaiveTime>,
}

/// Parse `H:MM-HH:MM`. Hours are 0-23 (the end may also be `24:00`), minutes 0-59.
pub fn parse_valid_time(valid_time: &str) -> Result<WindowTime, ScheduleParseError> {
    let err = || ScheduleParseError::new(valid_time);
    let pieces: Vec<&str> = valid_time.trim().split('-').collect();
    let [start, end] = pieces.as_slice() else {
        return Err(err());
    };
    let start = parse_clock(start).ok_or_else(err)?;
    let end = match end.trim() {
        "24:00" => None,
        other => Some(parse_clock(other).ok_or_else(err)?),
    };
    Ok(WindowTime { start, end })
}

fn parse_clock(s: &str) -> Option<NaiveTime> {
    let (hour, minute) = s.trim().split_once(':')?;
    if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
        return None;
    }
    if !hour.chars().chain(minute.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)
}

/// Source of the wall-clock time the schedule is evaluated in.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// System time, either local or at a fixed offset from UTC.
pub struct SystemClock {
    offset: Option<FixedOffset>,
}

impl SystemClock {
    pub fn local() -> Self {
        Self { offset: None }
    }

    /// Returns `None` when the offset is out of range.
    pub fn with_utc_offset_minutes(minutes: i32) -> Option<Self> {
        let offset = FixedOffset::east_opt(minutes.checked_mul(60)?)?;
        Some(Self {
            offset: Some(offset),
        })
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        match self.offset {
            Some(offset) => Utc::now().with_timezone(&offset).naive_local(),
            None => Local::now().naive_local(),
        }
    }
}

/// Next time a trigger at `start` fires strictly after `now`: today if the
/// start is still ahead, tomorrow otherwise.
pub fn next_daily_fire(start: NaiveTime, now: NaiveDateTime) -> NaiveDateTime {
    let today = now.date().and_time(start);
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

/// One compiled daily trigger.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub id: usize,
    pub valid_time: String,
    pub start: NaiveTime,
    pub spec: Arc<ScalingSpec>,
    /// Next fire time, maintained while the schedule runs.
    pub next: NaiveDateTime,
}

/// The window in force at `now`.
///
/// A trigger whose start already passed today has its next fire pushed to
/// tomorrow, so the trigger that started most recently is the one whose next
/// fire lies furthest ahead. That makes the active window the entry with the
/// *maximum* next fire time. Picking the soonest one would select the window
/// that is about to begin instead.
pub fn active_entry_at(entries: &[ScheduleEntry], now: NaiveDateTime) -> Option<&ScheduleEntry> {
    entries
        .iter()
        .map(|entry| (next_daily_fire(entry.start, now), entry))
        .filter(|(next, _)| *next > now)
        .max_by_key(|(next, _)| *next)
        .map(|(_, entry)| entry)
}

/// Compile windows into triggers.
///
/// Windows with an unparsable `validTime`, an inconsistent spec, or a start
/// time already taken by an earlier window are skipped with a warning. An
/// empty result fails: with the first parse error when every window was
/// malformed, as a configuration error otherwise.
pub fn compile(set: &StrategySet, now: NaiveDateTime) -> Result<Vec<ScheduleEntry>, ScalingError> {
    let mut entries = Vec::with_capacity(set.strategies.len());
    let mut starts = HashSet::new();
    let mut parse_errors = Vec::new();

    for window in &set.strategies {
        let time = match parse_valid_time(&window.valid_time) {
            Ok(t) => t,
            Err(e) => {
                warn!("Skipping strategy window: {}", e);
                parse_errors.push(e);
                continue;
            }
        };
        if let Err(e) = validate_scaling_spec(&window.spec) {
            warn!("Skipping strategy window '{}': {}", window.valid_time, e);
            continue;
        }
        if !starts.insert(time.start) {
            warn!(
                "Skipping strategy window '{}': start time {} is already scheduled",
                window.valid_time,
                time.start.format("%H:%M")
            );
            continue;
        }
        debug!(
            "Compiled trigger for window '{}' (daily at {})",
            window.valid_time,
            time.start.format("%H:%M")
        );
        entries.push(ScheduleEntry {
            id: entries.len(),
            valid_time: window.valid_time.clone(),
            start: time.start,
            spec: Arc::new(window.spec.clone()),
            next: next_daily_fire(time.start, now),
        });
    }

    if entries.is_empty() {
        if !set.strategies.is_empty() && parse_errors.len() == set.strategies.len() {
            return Err(parse_errors.swap_remove(0).into());
        }
        return Err(ScalingError::Config(format!(
            "none of the {} strategy windows could be scheduled",
            set.strategies.len()
        )));
    }
    Ok(entries)
}

/// A set of daily triggers plus the fingerprint of the source they came from.
#[derive(Debug, Default)]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
    fingerprint: Option<String>,
    running: bool,
    generation: u64,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of rebuilds so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.fingerprint = None;
    }

    /// Install freshly compiled triggers. The schedule must be stopped first.
    pub fn install(&mut self, entries: Vec<ScheduleEntry>, fingerprint: String) {
        debug_assert!(!self.running, "install on a running schedule");
        self.entries = entries;
        self.fingerprint = Some(fingerprint);
        self.generation += 1;
    }

    /// Start firing, computing every trigger's next fire from `now`.
    pub fn start(&mut self, now: NaiveDateTime) {
        for entry in &mut self.entries {
            entry.next = next_daily_fire(entry.start, now);
        }
        self.running = true;
    }

    pub fn resolve_current(&self, now: NaiveDateTime) -> Option<&ScheduleEntry> {
        if !self.running {
            return None;
        }
        active_entry_at(&self.entries, now)
    }

    /// Earliest pending fire time.
    pub fn next_trigger(&self) -> Option<NaiveDateTime> {
        if !self.running {
            return None;
        }
        self.entries.iter().map(|e| e.next).min()
    }

    /// Fire every trigger due at `now` and return the window now in force.
    pub fn take_due(&mut self, now: NaiveDateTime) -> Option<ScheduleEntry> {
        if !self.running {
            return None;
        }
        let mut fired = false;
        for entry in self.entries.iter_mut().filter(|e| e.next <= now) {
            entry.next = next_daily_fire(entry.start, now);
            fired = true;
        }
        if !fired {
            return None;
        }
        active_entry_at(&self.entries, now).cloned()
    }
}

/// Schedule shared between a task loop and concurrent readers.
///
/// A reload holds the write lock for the whole stop/clear/rebuild/restart
/// sequence, so readers never see a half-built schedule.
#[derive(Clone, Default)]
pub struct SharedSchedule {
    inner: Arc<RwLock<Schedule>>,
}

impl SharedSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the installed schedule was built from content with this fingerprint.
    pub async fn is_current(&self, fingerprint: &str) -> bool {
        self.inner.read().await.fingerprint() == Some(fingerprint)
    }

    /// Rebuild from `set` and return the window in force at `now`.
    ///
    /// Compilation happens before the old schedule is touched: if it fails the
    /// previous triggers keep running.
    pub async fn reload(
        &self,
        set: &StrategySet,
        fingerprint: String,
        now: NaiveDateTime,
    ) -> Result<Option<ScheduleEntry>, ScalingError> {
        let entries = compile(set, now)?;
        let mut schedule = self.inner.write().await;
        schedule.stop();
        schedule.clear();
        schedule.install(entries, fingerprint);
        schedule.start(now);
        info!(
            "Schedule rebuilt with {} triggers (generation {})",
            schedule.entries().len(),
            schedule.generation()
        );
        Ok(schedule.resolve_current(now).cloned())
    }

    pub async fn resolve_current(&self, now: NaiveDateTime) -> Option<ScheduleEntry> {
        self.inner.read().await.resolve_current(now).cloned()
    }

    pub async fn next_trigger(&self) -> Option<NaiveDateTime> {
        self.inner.read().await.next_trigger()
    }

    pub async fn take_due(&self, now: NaiveDateTime) -> Option<ScheduleEntry> {
        self.inner.write().await.take_due(now)
    }

    pub async fn stop(&self) {
        self.inner.write().await.stop();
    }

    pub async fn trigger_count(&self) -> usize {
        self.inner.read().await.entries().len()
    }

    pub async fn generation(&self) -> u64 {
        self.inner.read().await.generation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pkg_types::strategy::StrategyWindow;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn spec(min: u32) -> ScalingSpec {
        ScalingSpec {
            min_replicas: min,
            max_replicas: min + 10,
            ..Default::default()
        }
    }

    fn window(valid_time: &str, min: u32) -> StrategyWindow {
        StrategyWindow {
            valid_time: valid_time.to_string(),
            spec: spec(min),
        }
    }

    fn set(windows: Vec<StrategyWindow>) -> StrategySet {
        StrategySet {
            strategies: windows,
            ..Default::default()
        }
    }

    /// A = min 1, B = min 2, C = min 3.
    fn abc() -> StrategySet {
        set(vec![
            window("0:00-09:30", 1),
            window("09:30-20:00", 2),
            window("20:00-24:00", 3),
        ])
    }

    fn active_min(entries: &[ScheduleEntry], now: NaiveDateTime) -> u32 {
        active_entry_at(entries, now).unwrap().spec.min_replicas
    }

    #[test]
    fn parse_start_times() {
        let t = parse_valid_time("0:00-09:30").unwrap();
        assert_eq!(t.start, NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        assert_eq!(t.end, NaiveTime::from_hms_opt(9, 30, 0));

        let t = parse_valid_time("9:30-20:00").unwrap();
        assert_eq!(t.start, NaiveTime::from_hms_opt(9, 30, 0).unwrap());

        let t = parse_valid_time("20:00-24:00").unwrap();
        assert_eq!(t.start, NaiveTime::from_hms_opt(20, 0, 0).unwrap());
        assert_eq!(t.end, None);
    }

    #[test]
    fn parse_rejects_malformed_values() {
        for bad in [
            "", "0930", "9:30", "9:30-", "-9:30", "9:30-10:00-11:00", "25:00-26:00",
            "9:60-10:00", "a:bc-10:00", "24:00-24:00", "9:3-10:00", "123:00-10:00",
        ] {
            let err = parse_valid_time(bad).unwrap_err();
            assert_eq!(err.valid_time, bad);
        }
    }

    #[test]
    fn resolves_the_window_that_began_most_recently() {
        let entries = compile(&abc(), at(0, 0)).unwrap();
        assert_eq!(active_min(&entries, at(12, 0)), 2);
        assert_eq!(active_min(&entries, at(5, 0)), 1);
        assert_eq!(active_min(&entries, at(23, 0)), 3);
    }

    #[test]
    fn window_is_active_from_its_exact_start() {
        let entries = compile(&abc(), at(0, 0)).unwrap();
        assert_eq!(active_min(&entries, at(9, 30)), 2);
        assert_eq!(active_min(&entries, at(9, 29)), 1);
        assert_eq!(active_min(&entries, at(0, 0)), 1);
    }

    #[test]
    fn soonest_next_fire_would_pick_the_wrong_window() {
        let entries = compile(&abc(), at(0, 0)).unwrap();
        let now = at(12, 0);
        let soonest = entries
            .iter()
            .min_by_key(|e| next_daily_fire(e.start, now))
            .unwrap();
        assert_eq!(soonest.spec.min_replicas, 3);
        assert_eq!(active_min(&entries, now), 2);
    }

    #[test]
    fn wraps_across_midnight_for_every_minute_of_the_day() {
        // No window starts at midnight, so early hours belong to the last window of the previous day.
        let starts = [(6, 15), (13, 0), (22, 45)];
        let windows = starts
            .iter()
            .enumerate()
            .map(|(i, (h, m))| window(&format!("{}:{:02}-23:59", h, m), i as u32 + 1))
            .collect();
        let entries = compile(&set(windows), at(0, 0)).unwrap();

        for minute in 0..24 * 60 {
            let now = at(minute / 60, minute % 60);
            let expected = starts
                .iter()
                .enumerate()
                .filter(|(_, (h, m))| h * 60 + m <= minute)
                .map(|(i, _)| i as u32 + 1)
                .last()
                .unwrap_or(starts.len() as u32);
            assert_eq!(
                active_min(&entries, now),
                expected,
                "wrong window at {}",
                now.format("%H:%M")
            );
        }
    }

    #[test]
    fn compile_skips_malformed_and_duplicate_windows() {
        let windows = set(vec![
            window("0:00-09:30", 1),
            window("9h30-20:00", 2),
            window("00:00-12:00", 3),
            StrategyWindow {
                valid_time: "20:00-24:00".to_string(),
                spec: ScalingSpec {
                    min_replicas: 9,
                    max_replicas: 1,
                    ..Default::default()
                },
            },
            window("21:00-24:00", 4),
        ]);
        let entries = compile(&windows, at(8, 0)).unwrap();
        let kept: Vec<&str> = entries.iter().map(|e| e.valid_time.as_str()).collect();
        assert_eq!(kept, vec!["0:00-09:30", "21:00-24:00"]);
        assert_eq!(entries[1].id, 1);
    }

    #[test]
    fn compile_fails_when_nothing_is_schedulable() {
        let err = compile(&set(vec![window("nope", 1), window("25:00-26:00", 2)]), at(8, 0))
            .unwrap_err();
        assert!(matches!(
            err,
            ScalingError::ScheduleParse(ref e) if e.valid_time == "nope"
        ));

        let bad_spec = StrategyWindow {
            valid_time: "08:00-10:00".to_string(),
            spec: ScalingSpec {
                min_replicas: 9,
                max_replicas: 1,
                ..Default::default()
            },
        };
        let err = compile(&set(vec![window("nope", 1), bad_spec]), at(8, 0)).unwrap_err();
        assert!(matches!(err, ScalingError::Config(_)));
        assert!(matches!(
            compile(&set(vec![]), at(8, 0)),
            Err(ScalingError::Config(_))
        ));
    }

    #[test]
    fn triggers_fire_at_window_boundaries() {
        let mut schedule = Schedule::new();
        schedule.install(compile(&abc(), at(8, 0)).unwrap(), "fp".to_string());
        schedule.start(at(8, 0));

        assert_eq!(schedule.next_trigger(), Some(at(9, 30)));
        assert!(schedule.take_due(at(9, 0)).is_none());

        let fired = schedule.take_due(at(9, 30)).unwrap();
        assert_eq!(fired.spec.min_replicas, 2);
        assert_eq!(schedule.next_trigger(), Some(at(20, 0)));

        let fired = schedule.take_due(at(20, 0)).unwrap();
        assert_eq!(fired.spec.min_replicas, 3);
        assert_eq!(schedule.next_trigger(), Some(at(0, 0) + chrono::Duration::days(1)));
    }

    #[test]
    fn stopped_schedule_resolves_nothing() {
        let mut schedule = Schedule::new();
        schedule.install(compile(&abc(), at(8, 0)).unwrap(), "fp".to_string());
        assert!(schedule.resolve_current(at(8, 0)).is_none());
        schedule.start(at(8, 0));
        assert!(schedule.resolve_current(at(8, 0)).is_some());
        schedule.stop();
        assert!(schedule.resolve_current(at(8, 0)).is_none());
        assert!(schedule.next_trigger().is_none());
    }

    #[tokio::test]
    async fn reload_rebuilds_and_resolves_immediately() {
        let shared = SharedSchedule::new();
        let active = shared.reload(&abc(), "fp-1".to_string(), at(12, 0)).await.unwrap();
        assert_eq!(active.unwrap().spec.min_replicas, 2);
        assert_eq!(shared.trigger_count().await, 3);
        assert_eq!(shared.generation().await, 1);
        assert!(shared.is_current("fp-1").await);

        let changed = set(vec![window("0:00-11:00", 5), window("11:00-24:00", 7)]);
        let active = shared.reload(&changed, "fp-2".to_string(), at(12, 0)).await.unwrap();
        assert_eq!(active.unwrap().spec.min_replicas, 7);
        assert_eq!(shared.trigger_count().await, 2);
        assert_eq!(shared.generation().await, 2);
        assert!(!shared.is_current("fp-1").await);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_schedule() {
        let shared = SharedSchedule::new();
        shared.reload(&abc(), "fp-1".to_string(), at(12, 0)).await.unwrap();

        let broken = set(vec![window("garbage", 1)]);
        assert!(shared.reload(&broken, "fp-2".to_string(), at(12, 0)).await.is_err());
        assert!(shared.is_current("fp-1").await);
        assert_eq!(shared.resolve_current(at(12, 0)).await.unwrap().spec.min_replicas, 2);
    }

    #[test]
    fn clock_offsets() {
        assert!(SystemClock::with_utc_offset_minutes(480).is_some());
        assert!(SystemClock::with_utc_offset_minutes(-300).is_some());
        assert!(SystemClock::with_utc_offset_minutes(24 * 60).is_none());
    }
}
