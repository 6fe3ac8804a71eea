use serde::Serialize;

/// One reading on its way to the telemetry endpoint. Built per send cycle
/// and discarded after transmission; there is no backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetrySample {
    pub nom: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub valeur: String,
    #[serde(skip)]
    pub recorded_at_epoch: i64,
}

impl TelemetrySample {
    pub fn new(
        nom: impl Into<String>,
        kind: impl Into<String>,
        value: f32,
        recorded_at_epoch: i64,
    ) -> Self {
        Self {
            nom: nom.into(),
            kind: kind.into(),
            valeur: format!("{value:.1}"),
            recorded_at_epoch,
        }
    }
}

/// The sensor capability reports failures as NaN.
pub fn reading_is_valid(value: f32) -> bool {
    value.is_finite()
}

/// Fixed-interval send policy, checked on every control-loop tick.
#[derive(Debug, Clone, Copy)]
pub struct TelemetrySchedule {
    interval_ms: u64,
    last_send_ms: u64,
}

impl TelemetrySchedule {
    pub const DEFAULT_INTERVAL_MS: u64 = 60_000;

    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_send_ms: 0,
        }
    }

    pub fn due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_send_ms) >= self.interval_ms
    }

    /// Called only after a cycle actually dispatched its samples. A cycle
    /// aborted on an invalid reading leaves the schedule due, so the read
    /// is retried on the next tick.
    pub fn mark_sent(&mut self, now_ms: u64) {
        self.last_send_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_value_is_formatted_to_one_decimal() {
        let sample = TelemetrySample::new("salon", "temperature", 22.46, 0);
        assert_eq!(sample.valeur, "22.5");

        let sample = TelemetrySample::new("salon", "humidite", 40.0, 0);
        assert_eq!(sample.valeur, "40.0");
    }

    #[test]
    fn sample_serializes_with_wire_keys_only() {
        let sample = TelemetrySample::new("salon", "temperature", 21.0, 1_700_000_000);
        let value = serde_json::to_value(&sample).unwrap();

        assert_eq!(value["nom"], "salon");
        assert_eq!(value["type"], "temperature");
        assert_eq!(value["valeur"], "21.0");
        assert!(value.get("recorded_at_epoch").is_none());
    }

    #[test]
    fn nan_reading_is_invalid() {
        assert!(!reading_is_valid(f32::NAN));
        assert!(reading_is_valid(21.5));
    }

    #[test]
    fn schedule_is_not_due_before_the_interval() {
        let schedule = TelemetrySchedule::new(60_000);
        assert!(!schedule.due(59_999));
        assert!(schedule.due(60_000));
    }

    #[test]
    fn mark_sent_defers_the_next_cycle() {
        let mut schedule = TelemetrySchedule::new(60_000);
        schedule.mark_sent(60_000);

        assert!(!schedule.due(119_999));
        assert!(schedule.due(120_000));
    }

    #[test]
    fn aborted_cycle_stays_due() {
        let mut schedule = TelemetrySchedule::new(60_000);
        schedule.mark_sent(60_000);

        // The cycle at 120s aborts on an invalid reading: mark_sent is not
        // called, so the very next tick is still due.
        assert!(schedule.due(120_000));
        assert!(schedule.due(120_200));
    }
}
