use serde::{Deserialize, Serialize};

/// A single host-vitals sample (spec §3, §4.K).
///
/// Network counters are cumulative since boot/interface-up. A `reset`
/// sample is one where the prior sample's counter was higher than this
/// one's (counter wrapped or interface reset) — its derived rate is
/// clamped to zero rather than reported negative (spec §9).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VitalsSample {
  pub timestamp: chrono::DateTime<chrono::Utc>,
  pub cpu_percent: f32,
  pub mem_percent: f32,
  pub disk_percent: f32,
  pub net_bytes_in_cumulative: u64,
  pub net_bytes_out_cumulative: u64,
  #[serde(default)]
  pub reset: bool,
}

/// Rates derived client-side from two adjacent cumulative samples.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VitalsRate {
  pub net_bytes_in_per_sec: f64,
  pub net_bytes_out_per_sec: f64,
}

impl VitalsSample {
  /// Derive a rate against the immediately preceding sample. The first
  /// sample after start (no `prior`) has no rate.
  pub fn rate_since(&self, prior: Option<&VitalsSample>) -> Option<VitalsRate> {
    let prior = prior?;
    let dt = (self.timestamp - prior.timestamp).num_milliseconds();
    if dt <= 0 {
      return None;
    }
    let dt_secs = dt as f64 / 1000.0;
    let rate = |cur: u64, prev: u64| -> f64 {
      if cur < prev {
        0.0
      } else {
        (cur - prev) as f64 / dt_secs
      }
    };
    Some(VitalsRate {
      net_bytes_in_per_sec: rate(
        self.net_bytes_in_cumulative,
        prior.net_bytes_in_cumulative,
      ),
      net_bytes_out_per_sec: rate(
        self.net_bytes_out_cumulative,
        prior.net_bytes_out_cumulative,
      ),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn sample(ts_offset_secs: i64, bytes_in: u64, bytes_out: u64) -> VitalsSample {
    VitalsSample {
      timestamp: chrono::DateTime::UNIX_EPOCH + Duration::seconds(ts_offset_secs),
      cpu_percent: 0.0,
      mem_percent: 0.0,
      disk_percent: 0.0,
      net_bytes_in_cumulative: bytes_in,
      net_bytes_out_cumulative: bytes_out,
      reset: false,
    }
  }

  #[test]
  fn first_sample_has_no_rate() {
    let s = sample(0, 100, 200);
    assert!(s.rate_since(None).is_none());
  }

  #[test]
  fn rate_is_delta_over_time() {
    let prior = sample(0, 1000, 2000);
    let cur = sample(10, 2000, 2500);
    let rate = cur.rate_since(Some(&prior)).unwrap();
    assert_eq!(rate.net_bytes_in_per_sec, 100.0);
    assert_eq!(rate.net_bytes_out_per_sec, 50.0);
  }

  #[test]
  fn counter_reset_clamps_to_zero() {
    let prior = sample(0, 5000, 5000);
    let cur = sample(10, 100, 100);
    let rate = cur.rate_since(Some(&prior)).unwrap();
    assert_eq!(rate.net_bytes_in_per_sec, 0.0);
    assert_eq!(rate.net_bytes_out_per_sec, 0.0);
  }
}
