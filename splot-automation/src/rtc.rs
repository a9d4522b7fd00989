//! The shared clock variable set automation programs evaluate with.
//!
//! | name      | meaning                                   |
//! |-----------|-------------------------------------------|
//! | `rtc.tod` | time of day in fractional hours           |
//! | `rtc.dow` | day of week, Monday = 0                   |
//! | `rtc.dom` | day of month, 1 based                     |
//! | `rtc.doy` | day of year, 1 based                      |
//! | `rtc.moy` | month of year, 1 based                    |
//! | `rtc.awm` | aligned week of month, 1 based            |
//! | `rtc.wom` | calendar week of month, 1 based           |
//! | `rtc.woy` | ISO week of year                          |
//! | `rtc.y`   | year                                      |
use arcstr::ArcStr;
use chrono::{DateTime, Datelike, Local, Timelike};
use splot_value::Value;

pub fn clock_vars(now: DateTime<Local>) -> Vec<(ArcStr, Value)> {
    let tod = now.hour() as f64
        + now.minute() as f64 / 60.
        + now.second() as f64 / 3600.;
    let dom = now.day() as i64;
    let first_offset = now
        .with_day(1)
        .map(|d| d.weekday().num_days_from_monday() as i64)
        .unwrap_or(0);
    vec![
        (arcstr::literal!("rtc.tod"), Value::F64(tod)),
        (
            arcstr::literal!("rtc.dow"),
            Value::I64(now.weekday().num_days_from_monday() as i64),
        ),
        (arcstr::literal!("rtc.dom"), Value::I64(dom)),
        (arcstr::literal!("rtc.doy"), Value::I64(now.ordinal() as i64)),
        (arcstr::literal!("rtc.moy"), Value::I64(now.month() as i64)),
        (arcstr::literal!("rtc.awm"), Value::I64((dom - 1) / 7 + 1)),
        (
            arcstr::literal!("rtc.wom"),
            Value::I64((dom + first_offset - 1) / 7 + 1),
        ),
        (
            arcstr::literal!("rtc.woy"),
            Value::I64(now.iso_week().week() as i64),
        ),
        (arcstr::literal!("rtc.y"), Value::I64(now.year() as i64)),
    ]
}

/// The evaluation environment for schedule and predicate programs:
/// the clock variables plus the timer's fire count.
pub fn program_vars(count: i64) -> fxhash::FxHashMap<ArcStr, Value> {
    let mut vars = fxhash::FxHashMap::default();
    for (k, v) in clock_vars(Local::now()) {
        vars.insert(k, v);
    }
    vars.insert(arcstr::literal!("c"), Value::I64(count));
    vars
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn clock_vars_are_consistent() {
        // Wednesday 2026-08-12 06:30:00
        let t = Local.with_ymd_and_hms(2026, 8, 12, 6, 30, 0).unwrap();
        let vars: fxhash::FxHashMap<ArcStr, Value> =
            clock_vars(t).into_iter().collect();
        assert_eq!(vars["rtc.dow"], Value::I64(2));
        assert_eq!(vars["rtc.dom"], Value::I64(12));
        assert_eq!(vars["rtc.moy"], Value::I64(8));
        assert_eq!(vars["rtc.awm"], Value::I64(2));
        assert_eq!(vars["rtc.y"], Value::I64(2026));
        assert!((vars["rtc.tod"].cast_f64().unwrap() - 6.5).abs() < 1e-9);
        // 2026-08-01 is a Saturday, so the 12th falls in week 3
        assert_eq!(vars["rtc.wom"], Value::I64(3));
    }
}
