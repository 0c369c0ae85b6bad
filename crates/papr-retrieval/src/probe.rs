//! Resource probe: decides whether this host can run the local path.
//!
//! Thresholds default to 30 GiB free disk, 6 GiB available RAM and at most
//! 85 % memory in use. The probe never fails; sampling problems produce a
//! negative report with the reason.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::{info, warn};

use papr_types::Settings;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeThresholds {
    pub min_disk_gb: f64,
    pub min_ram_gb: f64,
    pub max_memory_percent: f64,
}

impl Default for ProbeThresholds {
    fn default() -> Self {
        Self {
            min_disk_gb: 30.0,
            min_ram_gb: 6.0,
            max_memory_percent: 85.0,
        }
    }
}

impl ProbeThresholds {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            min_disk_gb: settings.min_disk_gb,
            min_ram_gb: settings.min_ram_gb,
            max_memory_percent: settings.max_memory_percent,
        }
    }
}

/// Raw host measurements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub disk_gb: f64,
    pub ram_gb: f64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProbeDetails {
    pub disk_gb: f64,
    pub ram_gb: f64,
    pub memory_percent: f64,
    pub disk_ok: bool,
    pub ram_ok: bool,
    pub pressure_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub ok: bool,
    pub reason: String,
    pub details: ProbeDetails,
}

/// Source of host measurements.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<ResourceSample, String>;
}

/// Samples the real host with sysinfo. Disk space is measured on the volume
/// holding `path`.
pub struct SystemSampler {
    path: PathBuf,
}

impl SystemSampler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> Result<ResourceSample, String> {
        let mut sys = System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return Err("memory totals unavailable".to_string());
        }
        let available = sys.available_memory();
        let memory_percent = (total.saturating_sub(available)) as f64 / total as f64 * 100.0;

        let disks = Disks::new_with_refreshed_list();
        let target = existing_ancestor(&self.path);
        let disk = disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| format!("no disk found for {}", self.path.display()))?;

        Ok(ResourceSample {
            disk_gb: disk.available_space() as f64 / GIB,
            ram_gb: available as f64 / GIB,
            memory_percent,
        })
    }
}

fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .and_then(|p| p.canonicalize().ok())
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Fixed measurements, for tests and hosts with external monitoring.
pub struct StaticSampler(pub Result<ResourceSample, String>);

impl ResourceSampler for StaticSampler {
    fn sample(&self) -> Result<ResourceSample, String> {
        self.0.clone()
    }
}

pub struct ResourceProbe {
    thresholds: ProbeThresholds,
    sampler: Box<dyn ResourceSampler>,
}

impl ResourceProbe {
    pub fn new(thresholds: ProbeThresholds, sampler: Box<dyn ResourceSampler>) -> Self {
        Self {
            thresholds,
            sampler,
        }
    }

    /// Probe the host volume holding the data directory.
    pub fn system(settings: &Settings) -> Self {
        Self::new(
            ProbeThresholds::from_settings(settings),
            Box::new(SystemSampler::new(settings.expanded_data_dir())),
        )
    }

    pub fn thresholds(&self) -> &ProbeThresholds {
        &self.thresholds
    }

    pub fn check(&self) -> ProbeReport {
        match self.sampler.sample() {
            Ok(sample) => self.evaluate(sample),
            Err(reason) => {
                warn!(reason = %reason, "Resource sampling failed");
                ProbeReport {
                    ok: false,
                    reason: format!("resource sampling failed: {}", reason),
                    details: ProbeDetails::default(),
                }
            }
        }
    }

    pub fn evaluate(&self, sample: ResourceSample) -> ProbeReport {
        let t = &self.thresholds;
        let details = ProbeDetails {
            disk_gb: sample.disk_gb,
            ram_gb: sample.ram_gb,
            memory_percent: sample.memory_percent,
            disk_ok: sample.disk_gb >= t.min_disk_gb,
            ram_ok: sample.ram_gb >= t.min_ram_gb,
            pressure_ok: sample.memory_percent <= t.max_memory_percent,
        };

        let mut problems = Vec::new();
        if !details.disk_ok {
            problems.push(format!(
                "free disk {:.1} GiB < {:.1} GiB",
                sample.disk_gb, t.min_disk_gb
            ));
        }
        if !details.ram_ok {
            problems.push(format!(
                "available RAM {:.1} GiB < {:.1} GiB",
                sample.ram_gb, t.min_ram_gb
            ));
        }
        if !details.pressure_ok {
            problems.push(format!(
                "memory usage {:.0}% > {:.0}%",
                sample.memory_percent, t.max_memory_percent
            ));
        }

        let ok = problems.is_empty();
        let reason = if ok {
            "resources sufficient".to_string()
        } else {
            problems.join("; ")
        };
        ProbeReport {
            ok,
            reason,
            details,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    /// `PAPR_ONDEVICE_PROCESSING` was set
    Explicit,
    Probe,
}

/// Whether on-device processing is enabled, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnDeviceDecision {
    pub enabled: bool,
    pub source: DecisionSource,
    pub reason: String,
    pub report: Option<ProbeReport>,
}

/// Honor an explicit override, otherwise ask the probe.
pub fn auto_configure(settings: &Settings, probe: &ResourceProbe) -> OnDeviceDecision {
    let decision = match settings.ondevice_processing {
        Some(enabled) => OnDeviceDecision {
            enabled,
            source: DecisionSource::Explicit,
            reason: format!("PAPR_ONDEVICE_PROCESSING={}", enabled),
            report: None,
        },
        None => {
            let report = probe.check();
            OnDeviceDecision {
                enabled: report.ok,
                source: DecisionSource::Probe,
                reason: report.reason.clone(),
                report: Some(report),
            }
        }
    };
    info!(
        enabled = decision.enabled,
        source = ?decision.source,
        reason = %decision.reason,
        "On-device processing configured"
    );
    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(sample: Result<ResourceSample, String>) -> ResourceProbe {
        ResourceProbe::new(ProbeThresholds::default(), Box::new(StaticSampler(sample)))
    }

    fn healthy() -> ResourceSample {
        ResourceSample {
            disk_gb: 120.0,
            ram_gb: 12.0,
            memory_percent: 40.0,
        }
    }

    #[test]
    fn test_healthy_host_ok() {
        let report = probe(Ok(healthy())).check();
        assert!(report.ok);
        assert!(report.details.disk_ok && report.details.ram_ok && report.details.pressure_ok);
    }

    #[test]
    fn test_each_threshold_fails_independently() {
        let low_disk = probe(Ok(ResourceSample {
            disk_gb: 10.0,
            ..healthy()
        }))
        .check();
        assert!(!low_disk.ok);
        assert!(!low_disk.details.disk_ok);
        assert!(low_disk.reason.contains("free disk"));

        let low_ram = probe(Ok(ResourceSample {
            ram_gb: 2.0,
            ..healthy()
        }))
        .check();
        assert!(!low_ram.ok);
        assert!(!low_ram.details.ram_ok);

        let pressure = probe(Ok(ResourceSample {
            memory_percent: 93.0,
            ..healthy()
        }))
        .check();
        assert!(!pressure.ok);
        assert!(!pressure.details.pressure_ok);
        assert!(pressure.reason.contains("memory usage"));
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let report = probe(Ok(ResourceSample {
            disk_gb: 30.0,
            ram_gb: 6.0,
            memory_percent: 85.0,
        }))
        .check();
        assert!(report.ok);
    }

    #[test]
    fn test_sampling_failure_is_negative_report() {
        let report = probe(Err("no /proc".into())).check();
        assert!(!report.ok);
        assert!(report.reason.contains("no /proc"));
    }

    #[test]
    fn test_explicit_override_wins() {
        let failing = probe(Ok(ResourceSample {
            disk_gb: 1.0,
            ..healthy()
        }));
        let settings = Settings {
            ondevice_processing: Some(true),
            ..Settings::default()
        };
        let decision = auto_configure(&settings, &failing);
        assert!(decision.enabled);
        assert_eq!(decision.source, DecisionSource::Explicit);
        assert!(decision.report.is_none());

        let settings = Settings {
            ondevice_processing: Some(false),
            ..Settings::default()
        };
        assert!(!auto_configure(&settings, &probe(Ok(healthy()))).enabled);
    }

    #[test]
    fn test_absent_override_uses_probe() {
        let settings = Settings::default();
        let decision = auto_configure(&settings, &probe(Ok(healthy())));
        assert!(decision.enabled);
        assert_eq!(decision.source, DecisionSource::Probe);
        assert!(decision.report.unwrap().ok);
    }

    #[test]
    fn test_system_sampler_never_panics() {
        let sampler = SystemSampler::new(std::env::temp_dir().join("papr-probe-missing/child"));
        if let Ok(sample) = sampler.sample() {
            assert!(sample.memory_percent >= 0.0 && sample.memory_percent <= 100.0);
            assert!(sample.disk_gb >= 0.0);
        }
    }
}
