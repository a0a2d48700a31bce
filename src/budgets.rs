//! Evaluation of NodePool disruption budgets.
//!
//! A budget caps how many nodes of a pool may be disrupting concurrently
//! for a given reason. Budgets activate on cron windows evaluated in the
//! budget's time zone; inactive budgets impose no cap.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use thiserror::Error;

use crate::apis::nodepool::{Budget, DisruptionReason, NodePool};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BudgetError {
    #[error("unparseable cron schedule {0:?}")]
    Schedule(String),

    #[error("budget schedule and duration must be set together")]
    ScheduleWithoutDuration,

    #[error("unparseable percentage {0:?}")]
    Percentage(String),

    #[error("unknown time zone {0:?}")]
    TimeZone(String),

    #[error("unparseable datetime {0:?}")]
    DateTime(String),

    #[error("unparseable duration {0:?}")]
    Duration(String),
}

/// The API surface speaks standard 5-field cron; the `cron` crate wants a
/// seconds field, so one is prepended. `@hourly`-style shortcuts pass
/// through unchanged.
pub fn parse_schedule(s: &str) -> Result<Schedule, BudgetError> {
    let normalized = if s.starts_with('@') {
        s.to_string()
    } else {
        format!("0 {s}")
    };
    Schedule::from_str(&normalized).map_err(|_| BudgetError::Schedule(s.to_string()))
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, BudgetError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| BudgetError::DateTime(s.to_string()))
}

/// Whether the budget's window is open at `now`.
///
/// Active iff `now` falls within `[start, end]` and, when a schedule is
/// set, within `(fire, fire + duration)` of some cron fire, evaluated in
/// the budget's tz (UTC by default). A budget with no scheduling fields is
/// always active.
pub fn budget_is_active(budget: &Budget, now: DateTime<Utc>) -> Result<bool, BudgetError> {
    if let Some(start) = &budget.start_date_time
        && now < parse_rfc3339(start)?
    {
        return Ok(false);
    }
    if let Some(end) = &budget.end_date_time
        && now > parse_rfc3339(end)?
    {
        return Ok(false);
    }
    match (&budget.schedule, &budget.duration) {
        (None, None) => Ok(true),
        (Some(schedule), Some(duration)) => {
            let schedule = parse_schedule(schedule)?;
            let duration = humantime::parse_duration(duration)
                .map_err(|_| BudgetError::Duration(duration.clone()))?;
            let duration = ChronoDuration::from_std(duration)
                .map_err(|_| BudgetError::Duration(format!("{duration:?}")))?;
            let tz: Tz = match &budget.tz {
                Some(tz) => tz
                    .parse()
                    .map_err(|_| BudgetError::TimeZone(tz.clone()))?,
                None => chrono_tz::UTC,
            };
            // Active iff some fire landed in (now - duration, now]. A fire
            // in that interval necessarily keeps its window open at `now`,
            // and windows roll over day boundaries for free.
            let window_start = (now - duration).with_timezone(&tz);
            let next_fire = schedule.after(&window_start).next();
            Ok(next_fire
                .map(|fire| fire.with_timezone(&Utc) <= now)
                .unwrap_or(false))
        }
        _ => Err(BudgetError::ScheduleWithoutDuration),
    }
}

/// Resolve a budget's node cap against the pool's current size.
/// Percentages round up.
pub fn resolve_nodes(nodes: &IntOrString, pool_size: usize) -> Result<i32, BudgetError> {
    match nodes {
        IntOrString::Int(n) => Ok(*n),
        IntOrString::String(s) => {
            let pct: i64 = s
                .strip_suffix('%')
                .and_then(|p| p.trim().parse().ok())
                .ok_or_else(|| BudgetError::Percentage(s.clone()))?;
            Ok(((pct * pool_size as i64 + 99) / 100) as i32)
        }
    }
}

fn budget_applies_to(budget: &Budget, reason: &DisruptionReason) -> bool {
    match budget.reasons() {
        None => true,
        Some(reasons) => reasons
            .iter()
            .any(|r| r == reason || *r == DisruptionReason::All),
    }
}

pub const STANDARD_REASONS: [DisruptionReason; 4] = [
    DisruptionReason::Empty,
    DisruptionReason::Underutilized,
    DisruptionReason::Drifted,
    DisruptionReason::Expired,
];

/// Per-reason allowance: the minimum cap among active budgets covering the
/// reason, or `i32::MAX` when no active budget applies.
pub fn allowed_disruptions(
    budgets: &[Budget],
    now: DateTime<Utc>,
    pool_size: usize,
) -> Result<BTreeMap<DisruptionReason, i32>, BudgetError> {
    let mut out: BTreeMap<DisruptionReason, i32> = STANDARD_REASONS
        .iter()
        .cloned()
        .map(|r| (r, i32::MAX))
        .collect();
    for budget in budgets {
        if !budget_is_active(budget, now)? {
            continue;
        }
        let cap = resolve_nodes(&budget.nodes, pool_size)?;
        for (reason, allowed) in out.iter_mut() {
            if budget_applies_to(budget, reason) {
                *allowed = (*allowed).min(cap);
            }
        }
    }
    Ok(out)
}

/// The allowance actually available to new commands: the budget cap minus
/// nodes already disrupting or NotReady in the pool, clamped at zero.
pub fn build_disruption_budgets(
    pool: &NodePool,
    now: DateTime<Utc>,
    pool_size: usize,
    already_disrupting: usize,
) -> Result<BTreeMap<DisruptionReason, i32>, BudgetError> {
    let mut allowed = allowed_disruptions(&pool.spec.disruption.budgets, now, pool_size)?;
    for cap in allowed.values_mut() {
        *cap = cap.saturating_sub(already_disrupting as i32).max(0);
    }
    Ok(allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn budget(nodes: IntOrString) -> Budget {
        Budget {
            nodes,
            schedule: None,
            duration: None,
            reasons: None,
            start_date_time: None,
            end_date_time: None,
            tz: None,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn budget_without_schedule_is_always_active() {
        assert!(budget_is_active(&budget(IntOrString::Int(3)), at(4, 0)).unwrap());
    }

    #[test]
    fn cron_window_opens_and_closes() {
        let mut b = budget(IntOrString::Int(3));
        b.schedule = Some("0 9 * * *".to_string());
        b.duration = Some("8h".to_string());
        assert!(!budget_is_active(&b, at(8, 59)).unwrap());
        assert!(budget_is_active(&b, at(9, 0)).unwrap());
        assert!(budget_is_active(&b, at(16, 59)).unwrap());
        assert!(!budget_is_active(&b, at(17, 1)).unwrap());
    }

    #[test]
    fn cron_window_rolls_over_midnight() {
        let mut b = budget(IntOrString::Int(1));
        b.schedule = Some("0 22 * * *".to_string());
        b.duration = Some("4h".to_string());
        assert!(budget_is_active(&b, at(23, 30)).unwrap());
        assert!(budget_is_active(&b, at(1, 30)).unwrap());
        assert!(!budget_is_active(&b, at(3, 30)).unwrap());
    }

    #[test]
    fn tz_shifts_the_window() {
        let mut b = budget(IntOrString::Int(1));
        b.schedule = Some("0 9 * * *".to_string());
        b.duration = Some("1h".to_string());
        b.tz = Some("America/New_York".to_string());
        // 09:00 New York in March (EDT, UTC-4) is 13:00 UTC.
        assert!(!budget_is_active(&b, at(9, 30)).unwrap());
        assert!(budget_is_active(&b, at(13, 30)).unwrap());
    }

    #[test]
    fn start_end_bounds_gate_activity() {
        let mut b = budget(IntOrString::Int(1));
        b.start_date_time = Some("2026-03-10T06:00:00Z".to_string());
        b.end_date_time = Some("2026-03-10T12:00:00Z".to_string());
        assert!(!budget_is_active(&b, at(5, 0)).unwrap());
        assert!(budget_is_active(&b, at(7, 0)).unwrap());
        assert!(!budget_is_active(&b, at(13, 0)).unwrap());
    }

    #[test]
    fn schedule_without_duration_is_rejected() {
        let mut b = budget(IntOrString::Int(1));
        b.schedule = Some("@daily".to_string());
        assert_eq!(
            budget_is_active(&b, at(0, 30)),
            Err(BudgetError::ScheduleWithoutDuration)
        );
    }

    #[test]
    fn percentage_rounds_up() {
        assert_eq!(resolve_nodes(&IntOrString::String("30%".into()), 10).unwrap(), 3);
        assert_eq!(resolve_nodes(&IntOrString::String("25%".into()), 10).unwrap(), 3);
        assert_eq!(resolve_nodes(&IntOrString::String("10%".into()), 0).unwrap(), 0);
        assert_eq!(resolve_nodes(&IntOrString::Int(5), 10).unwrap(), 5);
    }

    #[test]
    fn allowance_is_min_across_active_budgets() {
        let mut five = budget(IntOrString::Int(5));
        five.reasons = Some(vec!["Drifted".to_string()]);
        let mut three = budget(IntOrString::Int(3));
        three.reasons = Some(vec!["Drifted".to_string()]);

        let allowed = allowed_disruptions(&[five, three], at(12, 0), 10).unwrap();
        assert_eq!(allowed[&DisruptionReason::Drifted], 3);
        // Other reasons have no applicable budget.
        assert_eq!(allowed[&DisruptionReason::Empty], i32::MAX);
    }

    #[test]
    fn expired_schedule_restores_looser_cap() {
        let five = budget(IntOrString::Int(5));
        let mut three = budget(IntOrString::Int(3));
        three.schedule = Some("0 9 * * *".to_string());
        three.duration = Some("2h".to_string());

        let budgets = vec![five, three];
        let during = allowed_disruptions(&budgets, at(10, 0), 10).unwrap();
        assert_eq!(during[&DisruptionReason::Drifted], 3);
        let after = allowed_disruptions(&budgets, at(12, 0), 10).unwrap();
        assert_eq!(after[&DisruptionReason::Drifted], 5);
    }

    #[test]
    fn zero_nodes_budget_blocks_everything() {
        let mut zero = budget(IntOrString::Int(0));
        zero.reasons = Some(vec![
            "Empty".to_string(),
            "Underutilized".to_string(),
            "Drifted".to_string(),
            "Expired".to_string(),
        ]);
        let allowed = allowed_disruptions(&[zero], at(12, 0), 10).unwrap();
        for reason in STANDARD_REASONS {
            assert_eq!(allowed[&reason], 0, "{reason} should be blocked");
        }
    }

    #[test]
    fn all_reason_covers_everything() {
        let mut b = budget(IntOrString::Int(2));
        b.reasons = Some(vec!["All".to_string()]);
        let allowed = allowed_disruptions(&[b], at(12, 0), 10).unwrap();
        for reason in STANDARD_REASONS {
            assert_eq!(allowed[&reason], 2);
        }
    }

    #[test]
    fn builder_subtracts_in_flight_disruptions() {
        let mut pool = NodePool::new("pool-a", Default::default());
        pool.spec.disruption.budgets = vec![budget(IntOrString::Int(3))];
        let allowed = build_disruption_budgets(&pool, at(12, 0), 10, 2).unwrap();
        assert_eq!(allowed[&DisruptionReason::Empty], 1);
        let clamped = build_disruption_budgets(&pool, at(12, 0), 10, 7).unwrap();
        assert_eq!(clamped[&DisruptionReason::Empty], 0);
    }
}
