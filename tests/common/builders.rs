//! Test data builders for creating test objects

use smartscale::Measurement;

/// 2023-11-14 22:13:20 UTC
pub const BASE_TIMESTAMP_SECS: i64 = 1_700_000_000;

/// Builder for creating test Measurements
pub struct MeasurementBuilder {
    seconds: i64,
    weight_kg: f64,
}

impl Default for MeasurementBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementBuilder {
    pub fn new() -> Self {
        Self {
            seconds: BASE_TIMESTAMP_SECS,
            weight_kg: 72.5,
        }
    }

    pub fn seconds(mut self, seconds: i64) -> Self {
        self.seconds = seconds;
        self
    }

    pub fn offset(mut self, seconds: i64) -> Self {
        self.seconds = BASE_TIMESTAMP_SECS + seconds;
        self
    }

    pub fn weight(mut self, weight_kg: f64) -> Self {
        self.weight_kg = weight_kg;
        self
    }

    /// The helper's JSON line for this reading
    pub fn line(&self) -> String {
        serde_json::json!({ "timestamp": self.seconds, "weight": self.weight_kg }).to_string()
    }

    pub fn build(self) -> Measurement {
        Measurement::new(self.seconds * 1000, self.weight_kg).expect("valid test measurement")
    }
}

/// `count` readings one second apart, weights rising by 0.1 kg
pub fn measurement_series(count: usize) -> Vec<Measurement> {
    (0..count)
        .map(|i| {
            MeasurementBuilder::new()
                .offset(i as i64)
                .weight(70.0 + i as f64 * 0.1)
                .build()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_builder() {
        let m = MeasurementBuilder::new().offset(5).weight(80.25).build();

        assert_eq!(m.timestamp_millis(), (BASE_TIMESTAMP_SECS + 5) * 1000);
        assert_eq!(m.weight_kg(), 80.25);
    }

    #[test]
    fn test_builder_line_decodes() {
        let builder = MeasurementBuilder::new().weight(1.5);
        let decoded = smartscale::decode_line(&builder.line()).unwrap();
        assert_eq!(decoded, builder.build());
    }
}
