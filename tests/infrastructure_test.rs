//! Test to verify test infrastructure works correctly

mod common;

use common::builders::{measurement_series, MeasurementBuilder, BASE_TIMESTAMP_SECS};

#[test]
fn test_infrastructure_setup() {
    // Test that builders work
    let m = MeasurementBuilder::new().offset(10).weight(64.2).build();

    assert_eq!(m.timestamp_millis(), (BASE_TIMESTAMP_SECS + 10) * 1000);
    common::assert_float_eq(m.weight_kg(), 64.2, 1e-9);
}

#[test]
fn test_measurement_series() {
    let series = measurement_series(5);
    assert_eq!(series.len(), 5);
    assert!(series
        .windows(2)
        .all(|w| w[1].timestamp_millis() - w[0].timestamp_millis() == 1000));
    common::assert_float_eq(series[4].weight_kg(), 70.4, 1e-9);
}

#[test]
fn test_float_comparison() {
    common::assert_float_eq(1.0, 1.0000001, 0.001);
}

#[test]
#[should_panic]
fn test_float_comparison_fails() {
    common::assert_float_eq(1.0, 2.0, 0.001);
}
