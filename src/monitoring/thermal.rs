/*!
 * Thermal Sampling
 *
 * Reads the hottest thermal zone under `/sys/class/thermal`. Hosts without
 * readable zones (containers, most x86 VMs) report `None` rather than an
 * error; admission decides what an unknown reading means.
 */

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::trace;

/// Source of the host temperature
#[async_trait]
pub trait ThermalSampler: Send + Sync {
    /// Current temperature in °C, or `None` if unknown
    async fn read_celsius(&self) -> Option<f64>;
}

/// Reads `thermal_zone*/temp` (millidegrees) and reports the maximum
#[derive(Debug, Clone)]
pub struct SysfsThermalSampler {
    root: PathBuf,
}

impl SysfsThermalSampler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ThermalSampler for SysfsThermalSampler {
    async fn read_celsius(&self) -> Option<f64> {
        let mut entries = tokio::fs::read_dir(&self.root).await.ok()?;
        let mut hottest: Option<f64> = None;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("thermal_zone") {
                continue;
            }
            let Ok(raw) = tokio::fs::read_to_string(entry.path().join("temp")).await else {
                continue;
            };
            if let Some(celsius) = parse_millidegrees(&raw) {
                hottest = Some(hottest.map_or(celsius, |h| h.max(celsius)));
            }
        }

        trace!(celsius = ?hottest, "Thermal sample");
        hottest
    }
}

/// Fixed, settable reading for tests and hosts without sensors
#[derive(Debug, Default)]
pub struct StaticThermalSampler {
    celsius: Mutex<Option<f64>>,
}

impl StaticThermalSampler {
    pub fn new(celsius: Option<f64>) -> Self {
        Self {
            celsius: Mutex::new(celsius),
        }
    }

    pub fn set(&self, celsius: Option<f64>) {
        *self.celsius.lock() = celsius;
    }
}

#[async_trait]
impl ThermalSampler for StaticThermalSampler {
    async fn read_celsius(&self) -> Option<f64> {
        *self.celsius.lock()
    }
}

/// Sysfs reports millidegrees; some drivers report plain degrees
fn parse_millidegrees(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    let celsius = if value.abs() > 1000.0 { value / 1000.0 } else { value };
    // Disconnected sensors commonly report absurd values
    (-40.0..=150.0).contains(&celsius).then_some(celsius)
}
