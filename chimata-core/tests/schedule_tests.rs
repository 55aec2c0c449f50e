//! Period expression parsing: accepted forms and error reporting.

use std::time::Duration;

use chimata_core::{Schedule, ScheduleError};
use rstest::rstest;

#[rstest]
#[case("* * * * *")]
#[case("*/5 * * * *")]
#[case("0 3 * * 1-5")]
#[case("15,45 */2 1 JAN,jul *")]
#[case("0 0 ? * SUN")]
#[case("5/10 * * * *")]
#[case("@yearly")]
#[case("@annually")]
#[case("@monthly")]
#[case("@weekly")]
#[case("@daily")]
#[case("@midnight")]
#[case("@hourly")]
#[case("@every 1s")]
fn accepts(#[case] expr: &str) {
    assert!(Schedule::parse(expr).is_ok(), "should parse: {expr}");
}

#[rstest]
#[case("", ScheduleError::Empty)]
#[case("* * * *", ScheduleError::FieldCount { found: 4 })]
#[case("* * * * * *", ScheduleError::FieldCount { found: 6 })]
fn rejects_shape(#[case] expr: &str, #[case] expected: ScheduleError) {
    assert_eq!(Schedule::parse(expr).unwrap_err(), expected);
}

#[rstest]
#[case("60 * * * *", "minute")]
#[case("* 24 * * *", "hour")]
#[case("* * 0 * *", "day-of-month")]
#[case("* * * 13 *", "month")]
#[case("* * * * 8", "day-of-week")]
#[case("*/0 * * * *", "minute")]
#[case("10-5 * * * *", "minute")]
#[case("* * * FOO *", "month")]
fn rejects_field(#[case] expr: &str, #[case] field: &str) {
    match Schedule::parse(expr).unwrap_err() {
        ScheduleError::Field { field: got, .. } => assert_eq!(got, field, "expr: {expr}"),
        other => panic!("expected field error for {expr}, got {other:?}"),
    }
}

#[rstest]
#[case("@every", "missing duration")]
#[case("@every 10", "missing unit")]
#[case("@every 5d", "unknown unit")]
#[case("@every m", "expected a number")]
fn rejects_bad_interval(#[case] expr: &str, #[case] reason: &str) {
    let err = Schedule::parse(expr).unwrap_err();
    assert!(err.to_string().contains(reason), "got: {err}");
}

#[test]
fn unknown_descriptor_is_named() {
    let err = Schedule::parse("@fortnightly").unwrap_err();
    assert_eq!(err, ScheduleError::UnknownDescriptor("@fortnightly".to_string()));
}

#[test]
fn compound_interval() {
    assert_eq!(
        Schedule::parse("@every 2h15m30s").unwrap(),
        Schedule::Every(Duration::from_secs(2 * 3600 + 15 * 60 + 30))
    );
}
