//! Prometheus text-exposition decode via the `prometheus-parse` crate
//! (§4.B implementation note).

use std::collections::HashMap;
use std::io::BufRead;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsDecodeError {
    #[error("prometheus text decode failed: {0}")]
    Parse(String),
}

/// One decoded sample, flattened to a scalar value regardless of the
/// exposition-format metric kind (counter/gauge/untyped/histogram bucket/
/// summary quantile) — the processors in this module only need name,
/// labels, and a single float.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub labels: HashMap<String, String>,
}

pub fn decode_metrics(buf: &[u8]) -> Result<Vec<MetricSample>, MetricsDecodeError> {
    let lines = buf.lines().map(|l| l.map_err(|e| e.to_string()));
    let lines = lines.map(|r| r.map_err(std::io::Error::other));
    let scrape = prometheus_parse::Scrape::parse(lines)
        .map_err(|e| MetricsDecodeError::Parse(e.to_string()))?;

    Ok(scrape
        .samples
        .into_iter()
        .map(|s| {
            let value = match &s.value {
                prometheus_parse::Value::Counter(v) => *v,
                prometheus_parse::Value::Gauge(v) => *v,
                prometheus_parse::Value::Untyped(v) => *v,
                prometheus_parse::Value::Histogram(buckets) => {
                    buckets.iter().map(|b| b.count).sum()
                }
                prometheus_parse::Value::Summary(quantiles) => {
                    quantiles.iter().map(|q| q.count).sum()
                }
            };
            MetricSample {
                name: s.metric,
                value,
                labels: s.labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_gauge_with_labels() {
        let body = b"probe_success 1\nprobe_checks_total{result=\"fail\"} 1\n";
        let samples = decode_metrics(body).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name, "probe_success");
        assert_eq!(samples[1].labels.get("result"), Some(&"fail".to_string()));
    }

    #[test]
    fn malformed_stream_is_a_decode_error() {
        let body = b"this is not a valid exposition line at all {{{\n";
        assert!(decode_metrics(body).is_err());
    }
}
