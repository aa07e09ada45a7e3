//! Vitals collector (spec §4.K): periodically samples host CPU/mem/disk
//! and cumulative network counters via `sysinfo`, persists to the
//! embedded store, and enforces a retention window. Entirely inert when
//! monitoring is disabled — no sampling, no query surface, no buffer.

use std::path::Path;

use chrono::Utc;
use ontree_entities::{EngineError, VitalsSample};
use sysinfo::{Disks, Networks, System};

use crate::bootstrap::db::Db;

#[derive(Clone)]
pub struct VitalsCollector {
  db: Db,
  interval: std::time::Duration,
  retention: chrono::Duration,
}

impl VitalsCollector {
  pub fn new(db: Db, interval_secs: u64, retention_days: u32) -> Self {
    Self {
      db,
      interval: std::time::Duration::from_secs(interval_secs.max(1)),
      retention: chrono::Duration::days(retention_days as i64),
    }
  }

  /// Runs the sampling loop until `cancel` is cancelled. Callers only
  /// spawn this when monitoring is enabled (spec §9: disabled means no
  /// collection at all, not a paused collector).
  pub async fn run(&self, cancel: tokio_util::sync::CancellationToken, root_disk: &Path) {
    let mut sys = System::new_all();
    let mut last_prune = Utc::now() - self.retention - chrono::Duration::days(1);
    loop {
      if cancel.is_cancelled() {
        return;
      }
      if let Err(err) = self.sample_once(&mut sys, root_disk).await {
        tracing::warn!(error = %err, "vitals sample failed");
      }
      if Utc::now() - last_prune > chrono::Duration::hours(1) {
        let cutoff = Utc::now() - self.retention;
        match self.db.prune_vitals_older_than(cutoff).await {
          Ok(n) if n > 0 => tracing::debug!(pruned = n, "pruned stale vitals samples"),
          Err(err) => tracing::warn!(error = %err, "vitals prune failed"),
          _ => {}
        }
        last_prune = Utc::now();
      }
      tokio::select! {
        _ = tokio::time::sleep(self.interval) => {}
        _ = cancel.cancelled() => return,
      }
    }
  }

  async fn sample_once(&self, sys: &mut System, root_disk: &Path) -> Result<(), EngineError> {
    sys.refresh_cpu_usage();
    sys.refresh_memory();
    let cpu_percent = sys.global_cpu_usage();
    let mem_percent = if sys.total_memory() > 0 {
      sys.used_memory() as f32 / sys.total_memory() as f32 * 100.0
    } else {
      0.0
    };

    let disks = Disks::new_with_refreshed_list();
    let disk_percent = disk_usage_percent(&disks, root_disk);

    let networks = Networks::new_with_refreshed_list();
    let (bytes_in, bytes_out) = networks
      .values()
      .fold((0u64, 0u64), |(rx, tx), data| (rx + data.total_received(), tx + data.total_transmitted()));

    let prior = self.db.latest_vitals_sample().await?;
    let reset = prior.as_ref().is_some_and(|p| bytes_in < p.net_bytes_in_cumulative || bytes_out < p.net_bytes_out_cumulative);

    let sample = VitalsSample {
      timestamp: Utc::now(),
      cpu_percent,
      mem_percent,
      disk_percent,
      net_bytes_in_cumulative: bytes_in,
      net_bytes_out_cumulative: bytes_out,
      reset,
    };
    self.db.insert_vitals_sample(sample).await
  }

  /// Decimated read for `[from, to]` — downsamples to at most
  /// `max_points` by taking every Nth row, always keeping the last.
  pub async fn query_range(
    &self,
    from: chrono::DateTime<Utc>,
    to: chrono::DateTime<Utc>,
    max_points: usize,
  ) -> Result<Vec<VitalsSample>, EngineError> {
    let rows = self.db.query_vitals_range(from, to).await?;
    Ok(decimate(rows, max_points))
  }
}

fn disk_usage_percent(disks: &Disks, root_disk: &Path) -> f32 {
  let best = disks
    .list()
    .iter()
    .filter(|d| root_disk.starts_with(d.mount_point()))
    .max_by_key(|d| d.mount_point().as_os_str().len());
  let Some(disk) = best else { return 0.0 };
  let total = disk.total_space();
  if total == 0 {
    return 0.0;
  }
  let used = total.saturating_sub(disk.available_space());
  used as f32 / total as f32 * 100.0
}

fn decimate(rows: Vec<VitalsSample>, max_points: usize) -> Vec<VitalsSample> {
  if max_points == 0 || rows.len() <= max_points {
    return rows;
  }
  let stride = rows.len().div_ceil(max_points);
  let mut out: Vec<VitalsSample> = rows.iter().step_by(stride).copied().collect();
  if let Some(last) = rows.last()
    && out.last().map(|s| s.timestamp) != Some(last.timestamp)
  {
    out.push(*last);
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample(ts_offset_secs: i64) -> VitalsSample {
    VitalsSample {
      timestamp: chrono::DateTime::UNIX_EPOCH + chrono::Duration::seconds(ts_offset_secs),
      cpu_percent: 0.0,
      mem_percent: 0.0,
      disk_percent: 0.0,
      net_bytes_in_cumulative: 0,
      net_bytes_out_cumulative: 0,
      reset: false,
    }
  }

  #[test]
  fn decimate_is_noop_under_limit() {
    let rows: Vec<_> = (0..5).map(sample).collect();
    assert_eq!(decimate(rows.clone(), 10).len(), 5);
  }

  #[test]
  fn decimate_downsamples_and_keeps_last() {
    let rows: Vec<_> = (0..100).map(sample).collect();
    let out = decimate(rows.clone(), 10);
    assert!(out.len() <= 11);
    assert_eq!(out.last().unwrap().timestamp, rows.last().unwrap().timestamp);
  }
}
