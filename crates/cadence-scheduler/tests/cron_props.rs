//! Property tests for next-fire computation

use cadence_scheduler::CronExpr;
use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use proptest::prelude::*;

fn field(min: u32, max: u32) -> impl Strategy<Value = String> {
    prop_oneof![
        Just("*".to_string()),
        (min..=max).prop_map(|v| v.to_string()),
        (min..=max, min..=max).prop_map(|(a, b)| format!("{}-{}", a.min(b), a.max(b))),
        (1u32..=max.min(12)).prop_map(|s| format!("*/{s}")),
        proptest::collection::vec(min..=max, 1..4).prop_map(|vs| {
            vs.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
        }),
    ]
}

fn expression() -> impl Strategy<Value = String> {
    (field(0, 59), field(0, 23), field(1, 28), field(1, 12), field(0, 7))
        .prop_map(|(mi, h, dom, mo, dow)| format!("{mi} {h} {dom} {mo} {dow}"))
}

/// Expressions that fire at least daily, so brute force stays cheap
fn daily_expression() -> impl Strategy<Value = String> {
    (field(0, 59), field(0, 23)).prop_map(|(mi, h)| format!("{mi} {h} * * *"))
}

fn instant() -> impl Strategy<Value = DateTime<Utc>> {
    // 2000-01-01 .. ~2090
    (946_684_800i64..3_786_912_000i64).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn next_fire_is_after_and_matches(expr in expression(), t in instant()) {
        let cron = CronExpr::parse(&expr).unwrap();
        let next = cron.next_after(t).unwrap();
        prop_assert!(next > t);
        prop_assert_eq!(next.second(), 0);
        prop_assert!(cron.matches(next));
    }

    #[test]
    fn next_fire_is_the_earliest(expr in daily_expression(), t in instant()) {
        let cron = CronExpr::parse(&expr).unwrap();
        let next = cron.next_after(t).unwrap();
        prop_assert!(next - t <= Duration::days(1));

        let mut cursor = t.with_second(0).unwrap().with_nanosecond(0).unwrap() + Duration::minutes(1);
        while cursor < next {
            prop_assert!(!cron.matches(cursor), "{} matches earlier at {}", expr, cursor);
            cursor += Duration::minutes(1);
        }
    }
}
