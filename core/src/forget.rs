use crate::snapshot::Snapshot;
use crate::{Error, Result, SnapshotID};
use chrono::{DateTime, Datelike, Days, Duration, Months, Timelike, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Retention rules applied per host and path set. A snapshot survives if
/// any rule selects it; zero counts disable a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForgetPolicy {
    pub keep_last: u32,
    pub keep_hourly: u32,
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
    /// Keeps everything taken within this span of the group's newest snapshot.
    pub keep_within: Option<KeepWithin>,
    /// Keeps snapshots carrying every one of these tags.
    pub keep_tags: Vec<String>,
}

impl ForgetPolicy {
    pub fn is_empty(&self) -> bool {
        self.keep_last == 0
            && self.keep_hourly == 0
            && self.keep_daily == 0
            && self.keep_weekly == 0
            && self.keep_monthly == 0
            && self.keep_yearly == 0
            && self.keep_within.is_none()
            && self.keep_tags.is_empty()
    }

    /// Splits one group into kept and removable snapshots, both newest first.
    pub fn apply(&self, mut snapshots: Vec<Snapshot>) -> (Vec<Snapshot>, Vec<Snapshot>) {
        snapshots.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| a.id.cmp(&b.id)));
        let Some(latest) = snapshots.first().map(|s| s.time) else {
            return (Vec::new(), Vec::new());
        };
        let cutoff = self.keep_within.and_then(|w| w.cutoff(latest));

        let mut buckets = [
            Bucket::new(self.keep_last, |_, nr| nr as i64),
            Bucket::new(self.keep_hourly, |t, _| {
                t.year() as i64 * 1_000_000 + t.month() as i64 * 10_000 + t.day() as i64 * 100 + t.hour() as i64
            }),
            Bucket::new(self.keep_daily, |t, _| {
                t.year() as i64 * 10_000 + t.month() as i64 * 100 + t.day() as i64
            }),
            Bucket::new(self.keep_weekly, |t, _| {
                let week = t.iso_week();
                week.year() as i64 * 100 + week.week() as i64
            }),
            Bucket::new(self.keep_monthly, |t, _| t.year() as i64 * 100 + t.month() as i64),
            Bucket::new(self.keep_yearly, |t, _| t.year() as i64),
        ];

        let oldest = snapshots.len() - 1;
        let (mut keep, mut remove) = (Vec::new(), Vec::new());
        for (nr, snapshot) in snapshots.into_iter().enumerate() {
            let mut kept = !self.keep_tags.is_empty() && self.keep_tags.iter().all(|t| snapshot.has_tag(t));
            if cutoff.is_some_and(|cutoff| snapshot.time > cutoff) {
                kept = true;
            }
            for bucket in &mut buckets {
                // Every bucket with count left also takes the oldest snapshot.
                if bucket.count > 0 {
                    let key = (bucket.key)(snapshot.time, nr);
                    if bucket.last != Some(key) || nr == oldest {
                        bucket.last = Some(key);
                        bucket.count -= 1;
                        kept = true;
                    }
                }
            }
            if kept {
                keep.push(snapshot);
            } else {
                remove.push(snapshot);
            }
        }
        (keep, remove)
    }
}

struct Bucket {
    count: u32,
    key: fn(DateTime<Utc>, usize) -> i64,
    last: Option<i64>,
}

impl Bucket {
    fn new(count: u32, key: fn(DateTime<Utc>, usize) -> i64) -> Self {
        Self { count, key, last: None }
    }
}

/// A calendar span written as `1y6m`, `14d`, `2d12h` and so on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepWithin {
    pub years: u32,
    pub months: u32,
    pub days: u32,
    pub hours: u32,
}

impl KeepWithin {
    fn cutoff(&self, latest: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let months = self.years.checked_mul(12)?.checked_add(self.months)?;
        latest
            .checked_sub_months(Months::new(months))?
            .checked_sub_days(Days::new(self.days as u64))?
            .checked_sub_signed(Duration::hours(self.hours as i64))
    }
}

impl FromStr for KeepWithin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidParams(format!("invalid keep-within duration '{}'", s));
        let mut within = KeepWithin::default();
        let mut digits = String::new();
        let mut units = 0;
        for c in s.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let value: u32 = digits.parse().map_err(|_| invalid())?;
            digits.clear();
            units += 1;
            let slot = match c {
                'y' => &mut within.years,
                'm' => &mut within.months,
                'd' => &mut within.days,
                'h' => &mut within.hours,
                _ => return Err(invalid()),
            };
            *slot = slot.checked_add(value).ok_or_else(invalid)?;
        }
        if !digits.is_empty() || units == 0 {
            return Err(invalid());
        }
        Ok(within)
    }
}

impl fmt::Display for KeepWithin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}y{}m{}d{}h", self.years, self.months, self.days, self.hours)
    }
}

/// Snapshots sharing a hostname and path set.
#[derive(Debug, Clone)]
pub struct ForgetGroup {
    pub hostname: String,
    pub paths: Vec<String>,
    pub keep: Vec<Snapshot>,
    pub remove: Vec<Snapshot>,
}

#[derive(Debug, Clone, Default)]
pub struct ForgetSummary {
    pub groups: Vec<ForgetGroup>,
    /// Snapshots deleted, or that would be deleted on a dry run.
    pub removed: Vec<SnapshotID>,
    /// Deletions the backend refused; those snapshots are still present.
    pub failed: Vec<SnapshotID>,
    pub dry_run: bool,
}

pub(crate) fn group_snapshots(snapshots: Vec<Snapshot>) -> BTreeMap<(String, Vec<String>), Vec<Snapshot>> {
    let mut groups: BTreeMap<(String, Vec<String>), Vec<Snapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        let mut paths = snapshot.paths.clone();
        paths.sort();
        groups
            .entry((snapshot.hostname.clone(), paths))
            .or_default()
            .push(snapshot);
    }
    groups
}
