//! Sample and log extraction from a run's raw output (§4.B).
//!
//! Fans out over decoded Prometheus samples rather than JSONPath/regex
//! rules: one typed result per rule, collected rather than short-circuited;
//! each `SampleProcessor` gets a look at every sample and decides
//! independently whether it cares.

pub mod logfmt;
pub mod metrics;

use std::time::Duration;

pub use logfmt::{decode_logfmt, LogfmtError};
pub use metrics::{decode_metrics, MetricSample, MetricsDecodeError};

/// Receives every decoded sample in a metrics stream. Implementors keep
/// their own running state and are queried after the full stream is fed.
pub trait SampleProcessor {
    fn process(&mut self, sample: &MetricSample);
}

/// Accumulates every sample as a constant, label-carrying metric so it can
/// be registered as an unchecked collector without declaring descriptors
/// up front (§4.B "Generic collector").
#[derive(Debug, Default)]
pub struct GenericCollector {
    pub samples: Vec<MetricSample>,
}

impl SampleProcessor for GenericCollector {
    fn process(&mut self, sample: &MetricSample) {
        self.samples.push(sample.clone());
    }
}

/// Latches `failure=true` if any `probe_checks_total{result="fail"}` sample
/// has a non-zero value.
#[derive(Debug, Default)]
pub struct CheckResultCollector {
    pub failure: bool,
}

impl SampleProcessor for CheckResultCollector {
    fn process(&mut self, sample: &MetricSample) {
        if sample.name == "probe_checks_total"
            && sample.labels.get("result").map(String::as_str) == Some("fail")
            && sample.value != 0.0
        {
            self.failure = true;
        }
    }
}

/// Extracts `probe_script_duration_seconds` as a `Duration`.
#[derive(Debug, Default)]
pub struct DurationCollector {
    pub duration: Option<Duration>,
}

impl SampleProcessor for DurationCollector {
    fn process(&mut self, sample: &MetricSample) {
        if sample.name == "probe_script_duration_seconds" {
            self.duration = Some(Duration::from_secs_f64(sample.value.max(0.0)));
        }
    }
}

/// Runs `buf` through every processor in one pass (§4.E step 5: generic +
/// check-result + duration collectors share a single decode).
pub fn fan_out(buf: &[u8], processors: &mut [&mut dyn SampleProcessor]) -> Result<(), MetricsDecodeError> {
    for sample in decode_metrics(buf)? {
        for p in processors.iter_mut() {
            p.process(&sample);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_feeds_all_processors() {
        let body = "probe_checks_total{result=\"fail\"} 1\nprobe_script_duration_seconds 2.5\n";
        let mut generic = GenericCollector::default();
        let mut check = CheckResultCollector::default();
        let mut duration = DurationCollector::default();
        fan_out(
            body.as_bytes(),
            &mut [&mut generic, &mut check, &mut duration],
        )
        .unwrap();

        assert_eq!(generic.samples.len(), 2);
        assert!(check.failure);
        assert_eq!(duration.duration, Some(Duration::from_secs_f64(2.5)));
    }

    #[test]
    fn check_result_collector_ignores_zero_value() {
        let body = "probe_checks_total{result=\"fail\"} 0\n";
        let mut check = CheckResultCollector::default();
        fan_out(body.as_bytes(), &mut [&mut check]).unwrap();
        assert!(!check.failure);
    }
}
