use anyhow::{bail, Context, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use std::str::FromStr;

/// A parsed six-field cron expression: `sec min hour dom month dow`.
///
/// Fields accept `*`, single values, ranges (`a-b`), steps (`*/n`, `a-b/n`,
/// `a/n`), and comma lists. Day-of-week runs Sunday=0 through 6, with 7
/// accepted as an alias for Sunday. When both day fields are restricted the
/// expression matches on either, the standard cron rule.
#[derive(Debug, Clone)]
pub struct CronExpr {
    seconds: u64,
    minutes: u64,
    hours: u64,
    dom: u64,
    months: u64,
    dow: u64,
    dom_all: bool,
    dow_all: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 {
            bail!(
                "cron expression {expr:?} has {} fields, expected 6 (sec min hour dom month dow)",
                fields.len()
            );
        }

        let seconds = parse_field(fields[0], 0, 59)?;
        let minutes = parse_field(fields[1], 0, 59)?;
        let hours = parse_field(fields[2], 0, 23)?;
        let dom = parse_field(fields[3], 1, 31)?;
        let months = parse_field(fields[4], 1, 12)?;
        let mut dow = parse_field(fields[5], 0, 7)?;

        // Fold 7 (alias for Sunday) into bit 0.
        if dow & (1 << 7) != 0 {
            dow = (dow & !(1 << 7)) | 1;
        }

        Ok(Self {
            seconds,
            minutes,
            hours,
            dom,
            months,
            dow,
            dom_all: fields[3] == "*",
            dow_all: fields[5] == "*",
        })
    }

    /// The first matching instant strictly after `after`, or `None` when the
    /// expression never matches within the search horizon.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = after.with_nanosecond(0).unwrap_or(after) + Duration::seconds(1);
        let limit = after + Duration::days(365 * 5);

        while t <= limit {
            if !bit(self.months, t.month()) {
                t = start_of_next_month(&t)?;
                continue;
            }
            if !self.match_day(&t) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !bit(self.seconds, t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }

        None
    }

    fn match_day(&self, t: &NaiveDateTime) -> bool {
        let dom_match = bit(self.dom, t.day());
        let dow_match = bit(self.dow, t.weekday().num_days_from_sunday());
        match (self.dom_all, self.dow_all) {
            (true, true) => true,
            (false, true) => dom_match,
            (true, false) => dow_match,
            (false, false) => dom_match || dow_match,
        }
    }
}

impl FromStr for CronExpr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[inline]
fn bit(mask: u64, v: u32) -> bool {
    mask & (1u64 << v) != 0
}

fn start_of_next_month(t: &NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<u64> {
    let mut mask = 0u64;

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (
                range,
                step.parse::<u32>()
                    .with_context(|| format!("bad step in cron field {part:?}"))?,
            ),
            None => (part, 1),
        };
        if step == 0 {
            bail!("zero step in cron field {part:?}");
        }

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = a
                .parse::<u32>()
                .with_context(|| format!("bad range in cron field {part:?}"))?;
            let hi = b
                .parse::<u32>()
                .with_context(|| format!("bad range in cron field {part:?}"))?;
            (lo, hi)
        } else {
            let v = range
                .parse::<u32>()
                .with_context(|| format!("bad value in cron field {part:?}"))?;
            // "a/n" extends to the top of the field, as in standard cron.
            if part.contains('/') {
                (v, max)
            } else {
                (v, v)
            }
        };

        if lo < min || hi > max || lo > hi {
            bail!("cron field {part:?} out of range {min}-{max}");
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1u64 << v;
            v += step;
        }
    }

    if mask == 0 {
        bail!("empty cron field {field:?}");
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn every_second() {
        let expr = CronExpr::parse("* * * * * *").unwrap();
        let from = at(2024, 3, 10, 12, 0, 0);
        assert_eq!(expr.next_after(from), Some(at(2024, 3, 10, 12, 0, 1)));
    }

    #[test]
    fn top_of_minute() {
        let expr = CronExpr::parse("0 * * * * *").unwrap();
        let from = at(2024, 3, 10, 12, 0, 30);
        assert_eq!(expr.next_after(from), Some(at(2024, 3, 10, 12, 1, 0)));
    }

    #[test]
    fn fixed_time_of_day_rolls_over() {
        let expr = CronExpr::parse("30 5 12 * * *").unwrap();
        let from = at(2024, 3, 10, 13, 0, 0);
        assert_eq!(expr.next_after(from), Some(at(2024, 3, 11, 12, 5, 30)));
    }

    #[test]
    fn month_boundary() {
        let expr = CronExpr::parse("0 0 0 1 * *").unwrap();
        let from = at(2024, 2, 15, 8, 0, 0);
        assert_eq!(expr.next_after(from), Some(at(2024, 3, 1, 0, 0, 0)));
    }

    #[test]
    fn steps_and_lists() {
        let expr = CronExpr::parse("0 */15 * * * *").unwrap();
        let from = at(2024, 3, 10, 12, 16, 0);
        assert_eq!(expr.next_after(from), Some(at(2024, 3, 10, 12, 30, 0)));

        let expr = CronExpr::parse("0 5,35 * * * *").unwrap();
        let from = at(2024, 3, 10, 12, 6, 0);
        assert_eq!(expr.next_after(from), Some(at(2024, 3, 10, 12, 35, 0)));
    }

    #[test]
    fn dow_matches_or_dom() {
        // 2024-03-10 is a Sunday; dow 1 = Monday, dom 12 also restricted.
        let expr = CronExpr::parse("0 0 0 12 * 1").unwrap();
        let from = at(2024, 3, 10, 0, 0, 0);
        // Monday the 11th comes before the 12th.
        assert_eq!(expr.next_after(from), Some(at(2024, 3, 11, 0, 0, 0)));
        assert_eq!(
            expr.next_after(at(2024, 3, 11, 0, 0, 0)),
            Some(at(2024, 3, 12, 0, 0, 0))
        );
    }

    #[test]
    fn sunday_alias() {
        let a = CronExpr::parse("0 0 0 * * 0").unwrap();
        let b = CronExpr::parse("0 0 0 * * 7").unwrap();
        let from = at(2024, 3, 8, 0, 0, 0);
        assert_eq!(a.next_after(from), b.next_after(from));
    }

    #[test]
    fn rejects_malformed() {
        assert!(CronExpr::parse("* * * * *").is_err());
        assert!(CronExpr::parse("61 * * * * *").is_err());
        assert!(CronExpr::parse("* * * 0 * *").is_err());
        assert!(CronExpr::parse("*/0 * * * * *").is_err());
        assert!(CronExpr::parse("a * * * * *").is_err());
    }
}
