use regex::Regex;

use crate::metric::{MetricBatch, MetricPoint, MetricValue, Row};

/// Unit conversion applied to a source telemetry value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Identity,
    /// Raw bytes to megabytes, rounded to two decimals.
    BytesToMegabytes,
    /// Gigabytes to megabytes, rounded to two decimals.
    GigabytesToMegabytes,
}

impl Unit {
    fn apply(self, value: MetricValue) -> MetricValue {
        match self {
            Self::Identity => value,
            Self::BytesToMegabytes => MetricValue::Float(round2(value.as_f64() / 1e6)),
            Self::GigabytesToMegabytes => MetricValue::Float(round2(value.as_f64() * 1000.0)),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

struct GpuMapping {
    pattern: Regex,
    /// Destination key template; `{i}` is the captured device index.
    template: &'static str,
    unit: Unit,
}

/// Host-level scalar mappings: source key, destination key, conversion.
///
/// The `\.` path component in the disk keys is the source's encoding of
/// the root mount point.
const HOST_MAPPINGS: [(&str, &str, Unit); 7] = [
    ("system.cpu", "system/cpu_utilization_percentage", Unit::Identity),
    (
        "system.disk.\\.usageGB",
        "system/disk_usage_megabytes",
        Unit::GigabytesToMegabytes,
    ),
    (
        "system.disk.\\.usagePercent",
        "system/disk_usage_percentage",
        Unit::Identity,
    ),
    (
        "system.proc.memory.rssMB",
        "system/system_memory_usage_megabytes",
        Unit::Identity,
    ),
    (
        "system.memory",
        "system/system_memory_usage_percentage",
        Unit::Identity,
    ),
    (
        "system.network.recv",
        "system/network_receive_megabytes",
        Unit::BytesToMegabytes,
    ),
    (
        "system.network.sent",
        "system/network_transmit_megabytes",
        Unit::BytesToMegabytes,
    ),
];

/// Converts source system telemetry rows into destination metric points.
///
/// Device (GPU) metrics are matched per-index by regex and renamed to the
/// destination's flat `system/gpu_<i>_*` scheme; host metrics map
/// one-to-one. The source records no timestamps for telemetry, so the row
/// index doubles as both timestamp and sequence.
pub struct SystemMetricsMapper {
    gpu: Vec<GpuMapping>,
}

impl Default for SystemMetricsMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMetricsMapper {
    pub fn new() -> Self {
        // memoryAllocatedBytes must precede memoryAllocated: the shorter
        // pattern is unanchored on the right and matches both keys.
        let specs: [(&str, &str, Unit); 5] = [
            (
                r"system\.gpu\.(\d+)\.memoryAllocatedBytes",
                "system/gpu_{i}_memory_usage_megabytes",
                Unit::BytesToMegabytes,
            ),
            (
                r"system\.gpu\.(\d+)\.memoryAllocated$",
                "system/gpu_{i}_memory_usage_percentage",
                Unit::Identity,
            ),
            (
                r"system\.gpu\.(\d+)\.memory$",
                "system/gpu_{i}_utilization_percentage",
                Unit::Identity,
            ),
            (
                r"system\.gpu\.(\d+)\.powerWatts",
                "system/gpu_{i}_power_watts",
                Unit::Identity,
            ),
            (
                r"system\.gpu\.(\d+)\.powerPercent",
                "system/gpu_{i}_power_percentage",
                Unit::Identity,
            ),
        ];

        let gpu = specs
            .into_iter()
            .map(|(pattern, template, unit)| GpuMapping {
                pattern: Regex::new(pattern).expect("static pattern compiles"),
                template,
                unit,
            })
            .collect();

        Self { gpu }
    }

    /// Converts one telemetry row.
    ///
    /// The device sub-batch and the host sub-batch are returned together
    /// as one candidate so the accumulator's capacity check sees both at
    /// once and never splits them across a flush boundary.
    pub fn convert_row(&self, row: &Row, index: i64) -> MetricBatch {
        let mut points = self.convert_gpu(row, index);
        points.extend(self.convert_host(row, index));
        points
    }

    fn convert_gpu(&self, row: &Row, index: i64) -> MetricBatch {
        let mut points = Vec::new();
        for (key, raw) in row {
            let Some(value) = MetricValue::from_json(raw) else {
                continue;
            };
            for mapping in &self.gpu {
                let Some(captures) = mapping.pattern.captures(key) else {
                    continue;
                };
                let device = &captures[1];
                let dest_key = mapping.template.replace("{i}", device);
                points.push(MetricPoint::new(
                    dest_key,
                    mapping.unit.apply(value),
                    index,
                    index,
                ));
                break;
            }
        }
        points
    }

    fn convert_host(&self, row: &Row, index: i64) -> MetricBatch {
        let mut points = Vec::new();
        for (source_key, dest_key, unit) in HOST_MAPPINGS {
            let Some(raw) = row.get(source_key) else {
                continue;
            };
            let Some(value) = MetricValue::from_json(raw) else {
                continue;
            };
            points.push(MetricPoint::new(
                dest_key.to_string(),
                unit.apply(value),
                index,
                index,
            ));
        }
        points
    }
}
