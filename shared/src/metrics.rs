//! Metric row types for the Metric Collection & Retention Pipeline
//!
//! One type per table named in the persisted state layout. Time-series
//! tables (network_usage, cpu_stats, memory_stats, swap_areas,
//! disk_io_stats, pool_io_stats, arc_stats) are append-only and keyed by
//! `(host, scan_timestamp, entity_key)`; current-state tables
//! (network_interfaces, ip_addresses, routing_table, disks, zfs_datasets,
//! pci_devices) are replaced wholesale on each collection.

use serde::{Deserialize, Serialize};

/// Live network interface inventory row (current-state; replaced on each
/// `network-config` collection).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkInterface {
    pub host: String,
    pub link: String,
    pub class: String,
    pub state: String,
    pub over: Option<String>,
    pub speed_mbps: Option<f64>,
    pub mtu: Option<u32>,
    pub mac_address: Option<String>,
    pub scan_timestamp: i64,
}

/// One rx/tx sample for a link. `*_delta`, `*_bps` and `*_utilization_pct`
/// fields are only populated when a valid previous sample exists (§4.6.2);
/// `None` is written instead of NaN/Infinity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkUsage {
    pub host: String,
    pub link: String,
    pub rbytes: u64,
    pub obytes: u64,
    pub ipackets: u64,
    pub opackets: u64,
    pub ierrors: u64,
    pub oerrors: u64,
    pub rbytes_delta: Option<u64>,
    pub obytes_delta: Option<u64>,
    pub rx_bps: Option<f64>,
    pub tx_bps: Option<f64>,
    pub rx_mbps: Option<f64>,
    pub tx_mbps: Option<f64>,
    pub rx_utilization_pct: Option<f64>,
    pub tx_utilization_pct: Option<f64>,
    pub scan_timestamp: i64,
}

/// Current-state IP address assignment, replaced wholesale each collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpAddress {
    pub host: String,
    pub interface: String,
    pub address: String,
    pub address_type: String,
    pub state: String,
    pub scan_timestamp: i64,
}

/// Current-state routing table row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingTableEntry {
    pub host: String,
    pub destination: String,
    pub gateway: String,
    pub interface: Option<String>,
    pub flags: Option<String>,
    pub scan_timestamp: i64,
}

/// Per-core CPU utilization sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuStats {
    pub host: String,
    pub core_id: u32,
    pub user_pct: f64,
    pub system_pct: f64,
    pub idle_pct: f64,
    pub scan_timestamp: i64,
}

/// Host memory usage sample, all values in bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryStats {
    pub host: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub cached_bytes: Option<u64>,
    pub scan_timestamp: i64,
}

/// One swap device/file sample. Current-state identity is `(host, swapfile)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwapArea {
    pub host: String,
    pub swapfile: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub scan_timestamp: i64,
}

/// Current-state disk inventory row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Disk {
    pub host: String,
    pub device: String,
    pub vendor: Option<String>,
    pub size_bytes: Option<u64>,
    pub media_type: Option<String>,
    pub scan_timestamp: i64,
}

/// Per-device I/O throughput sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskIoStats {
    pub host: String,
    pub device: String,
    pub reads_per_sec: f64,
    pub writes_per_sec: f64,
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
    pub wait_queue_depth: Option<f64>,
    pub scan_timestamp: i64,
}

/// Per-zpool I/O throughput sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolIoStats {
    pub host: String,
    pub pool: String,
    pub reads_per_sec: f64,
    pub writes_per_sec: f64,
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
    pub scan_timestamp: i64,
}

/// ZFS ARC sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArcStats {
    pub host: String,
    pub arc_size_bytes: u64,
    pub target_size_bytes: u64,
    pub hit_ratio_pct: Option<f64>,
    pub scan_timestamp: i64,
}

/// Current-state ZFS dataset inventory row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZfsDataset {
    pub host: String,
    pub dataset: String,
    pub used_bytes: Option<u64>,
    pub available_bytes: Option<u64>,
    pub mountpoint: Option<String>,
    pub scan_timestamp: i64,
}

/// Current-state PCI device inventory row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PciDevice {
    pub host: String,
    pub slot: String,
    pub vendor_id: Option<String>,
    pub device_id: Option<String>,
    pub description: Option<String>,
    pub scan_timestamp: i64,
}

/// Host-level rollup updated by every collector on each successful run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostInfo {
    pub host: String,
    pub cpu_count: Option<u32>,
    pub total_memory_bytes: Option<u64>,
    pub network_accounting_enabled: bool,
    pub last_network_config_scan: Option<i64>,
    pub last_network_usage_scan: Option<i64>,
    pub last_cpu_scan: Option<i64>,
    pub last_memory_scan: Option<i64>,
    pub last_swap_scan: Option<i64>,
    pub last_storage_scan: Option<i64>,
    pub last_arc_scan: Option<i64>,
    pub last_error: Option<String>,
}

impl HostInfo {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            cpu_count: None,
            total_memory_bytes: None,
            network_accounting_enabled: false,
            last_network_config_scan: None,
            last_network_usage_scan: None,
            last_cpu_scan: None,
            last_memory_scan: None,
            last_swap_scan: None,
            last_storage_scan: None,
            last_arc_scan: None,
            last_error: None,
        }
    }
}

/// One bare (delta-free) counter pair used by collectors to compute
/// §4.6.2 bandwidth semantics against the last in-memory snapshot for an
/// entity, without a database round-trip.
#[derive(Debug, Clone, Copy)]
pub struct CounterSample {
    pub value: u64,
    pub scan_timestamp: i64,
}

/// Compute the delta fields for one pair of link counter samples per the
/// §4.6.2 contract: clamp negative deltas to zero, null out anything
/// non-finite or with a non-positive time delta.
pub fn compute_network_delta(
    current: (u64, u64, i64),
    previous: Option<(u64, u64, i64)>,
    speed_mbps: Option<f64>,
) -> (
    Option<u64>,
    Option<u64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
) {
    let (rbytes, obytes, t_c) = current;
    let Some((p_rbytes, p_obytes, t_p)) = previous else {
        return (None, None, None, None, None, None, None, None);
    };
    let time_delta = (t_c - t_p) as f64;
    if time_delta <= 0.0 {
        return (None, None, None, None, None, None, None, None);
    }

    let rbytes_delta = crate::utils::counter_delta(rbytes, p_rbytes);
    let obytes_delta = crate::utils::counter_delta(obytes, p_obytes);
    let rx_bps = crate::utils::bytes_per_second(rbytes_delta, time_delta);
    let tx_bps = crate::utils::bytes_per_second(obytes_delta, time_delta);
    let rx_mbps = round2(rx_bps * 8.0 / 1_000_000.0);
    let tx_mbps = round2(tx_bps * 8.0 / 1_000_000.0);

    let (rx_util, tx_util) = match speed_mbps.filter(|s| *s > 0.0) {
        Some(speed) => (
            finite_or_none(round2(crate::utils::utilization_percent(
                rx_bps,
                speed * 1_000_000.0,
            ))),
            finite_or_none(round2(crate::utils::utilization_percent(
                tx_bps,
                speed * 1_000_000.0,
            ))),
        ),
        None => (None, None),
    };

    (
        Some(rbytes_delta),
        Some(obytes_delta),
        finite_or_none(rx_bps),
        finite_or_none(tx_bps),
        finite_or_none(rx_mbps),
        finite_or_none(tx_mbps),
        rx_util,
        tx_util,
    )
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn finite_or_none(v: f64) -> Option<f64> {
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_scenario_from_spec_example() {
        // rbytes 1_000_000 -> 1_500_000, obytes 2_000_000 -> 2_100_000,
        // 10s apart, speed 1000 Mbps.
        let (rbytes_delta, obytes_delta, rx_bps, _tx_bps, rx_mbps, tx_mbps, rx_util, _tx_util) =
            compute_network_delta(
                (1_500_000, 2_100_000, 10),
                Some((1_000_000, 2_000_000, 0)),
                Some(1000.0),
            );
        assert_eq!(rbytes_delta, Some(500_000));
        assert_eq!(obytes_delta, Some(100_000));
        assert_eq!(rx_bps, Some(50_000.0));
        assert_eq!(rx_mbps, Some(0.40));
        assert_eq!(tx_mbps, Some(0.08));
        assert_eq!(rx_util, Some(0.04));
    }

    #[test]
    fn no_previous_sample_yields_all_none() {
        let result = compute_network_delta((1000, 2000, 10), None, Some(1000.0));
        assert_eq!(result.0, None);
        assert_eq!(result.2, None);
    }

    #[test]
    fn non_positive_time_delta_yields_all_none() {
        let result = compute_network_delta(
            (1500, 2500, 5),
            Some((1000, 2000, 5)),
            Some(1000.0),
        );
        assert_eq!(result.0, None);
    }

    #[test]
    fn counter_reset_clamps_to_zero_not_negative() {
        let (rbytes_delta, _, _, _, _, _, _, _) =
            compute_network_delta((100, 200, 20), Some((5000, 6000, 10)), None);
        assert_eq!(rbytes_delta, Some(0));
    }

    #[test]
    fn unknown_speed_yields_null_utilization() {
        let result = compute_network_delta((1_500_000, 2_100_000, 10), Some((1_000_000, 2_000_000, 0)), None);
        assert_eq!(result.6, None);
        assert_eq!(result.7, None);
    }
}
