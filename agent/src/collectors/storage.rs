//! Storage collector: disk inventory, ZFS dataset usage, per-device and
//! per-pool I/O throughput, and (piggybacked, since it shares this
//! collector's `host_info` column — see [`super`]'s module doc) PCI device
//! inventory.

use shared::metrics::{Disk, DiskIoStats, PciDevice, PoolIoStats, ZfsDataset};
use shared::utils::current_timestamp;
use tracing::debug;

use super::parse::{looks_like_header, parse_optional_int, parse_optional_string, split_escaped_colons, split_whitespace_fields};
use super::CollectorContext;
use crate::command::CommandSpec;
use crate::store::tables;

pub async fn collect(ctx: &CollectorContext) -> anyhow::Result<()> {
    let now = current_timestamp();

    let disks_out = ctx.command_runner.run_checked("diskinfo", &["-p"]).await.unwrap_or_default();
    let datasets_out = ctx
        .command_runner
        .run_checked("zfs", &["list", "-Hp", "-o", "name,used,available,mountpoint"])
        .await?;
    let pci_out = ctx.command_runner.run_checked("prtconf", &["-pv"]).await.unwrap_or_default();

    let disks = parse_disks(&disks_out, &ctx.host, now);
    let datasets = parse_datasets(&datasets_out, &ctx.host, now);
    let pci_devices = parse_pci_devices(&pci_out, &ctx.host, now);

    let disk_io_spec = CommandSpec::new("iostat", &["-xn", "1", "2"]);
    let disk_io_result = ctx.command_runner.run(&disk_io_spec).await;
    let disk_io = if disk_io_result.ok {
        parse_disk_io(&disk_io_result.stdout, &ctx.host, now)
    } else {
        debug!(stderr = %disk_io_result.stderr.trim(), "iostat failed, skipping disk i/o sample this pass");
        Vec::new()
    };

    let pool_io_out = ctx.command_runner.run_checked("zpool", &["iostat", "-Hp", "1", "2"]).await.unwrap_or_default();
    let pool_io = parse_pool_io(&pool_io_out, &ctx.host, now);

    let mut store = ctx.store.lock().await;
    let conn = store.get_connection()?;
    tables::storage::replace_disks(conn, &ctx.host, &disks)?;
    tables::storage::replace_zfs_datasets(conn, &ctx.host, &datasets)?;
    tables::pci::replace_devices(conn, &ctx.host, &pci_devices)?;
    if !disk_io.is_empty() {
        tables::storage::insert_disk_io_samples(conn, &disk_io)?;
    }
    if !pool_io.is_empty() {
        tables::storage::insert_pool_io_samples(conn, &pool_io)?;
    }

    Ok(())
}

/// `diskinfo -p`: `TYPE:VID:PID:SIZE:RMV:SSD:CYL:HEAD:SECTOR:CLUSTER:CPATH`
/// (the trailing CPATH field holds the device name).
fn parse_disks(output: &str, host: &str, now: i64) -> Vec<Disk> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let fields = split_escaped_colons(line);
        if fields.len() < 4 {
            debug!(line, "rejecting diskinfo row with unexpected column count");
            continue;
        }
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        if looks_like_header(&refs) {
            continue;
        }
        let device = fields.last().cloned().unwrap_or_default();
        if device.is_empty() {
            continue;
        }
        rows.push(Disk {
            host: host.to_string(),
            device,
            vendor: parse_optional_string(&fields[1]),
            size_bytes: parse_optional_int(&fields[3]),
            media_type: parse_optional_string(&fields[0]),
            scan_timestamp: now,
        });
    }
    rows
}

/// `zfs list -Hp`: tab-separated, no header, `-p` forces exact byte counts
/// instead of the human-readable `1.2G` the default output would use.
fn parse_datasets(output: &str, host: &str, now: i64) -> Vec<ZfsDataset> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 4 {
            debug!(line, "rejecting zfs dataset row with unexpected column count");
            continue;
        }
        rows.push(ZfsDataset {
            host: host.to_string(),
            dataset: fields[0].to_string(),
            used_bytes: parse_optional_int(fields[1]),
            available_bytes: parse_optional_int(fields[2]),
            mountpoint: parse_optional_string(fields[3]),
            scan_timestamp: now,
        });
    }
    rows
}

/// `iostat -xn` whitespace columns: `r/s w/s kr/s kw/s wait actv %w %b
/// device`. Two samples are printed (since-boot average, then the measured
/// interval); only the rows after the second header block are kept.
fn parse_disk_io(output: &str, host: &str, now: i64) -> Vec<DiskIoStats> {
    let header_index = output
        .lines()
        .enumerate()
        .filter(|(_, line)| looks_like_header(&split_whitespace_fields(line)))
        .map(|(i, _)| i)
        .last();
    let Some(header_index) = header_index else {
        return Vec::new();
    };

    let mut rows = Vec::new();
    for line in output.lines().skip(header_index + 1) {
        let fields = split_whitespace_fields(line);
        if fields.len() != 9 {
            continue;
        }
        if looks_like_header(&fields) {
            continue;
        }
        let parsed: Vec<Option<f64>> = fields[..6].iter().map(|f| f.parse::<f64>().ok()).collect();
        if parsed.iter().any(Option::is_none) {
            debug!(line, "rejecting iostat row with non-numeric field");
            continue;
        }
        rows.push(DiskIoStats {
            host: host.to_string(),
            device: fields[8].to_string(),
            reads_per_sec: parsed[0].unwrap(),
            writes_per_sec: parsed[1].unwrap(),
            read_bytes_per_sec: parsed[2].unwrap() * 1024.0,
            write_bytes_per_sec: parsed[3].unwrap() * 1024.0,
            wait_queue_depth: parsed[4],
            scan_timestamp: now,
        });
    }
    rows
}

/// `zpool iostat -Hp`: tab-separated, no header at all (`-H`), so there is
/// nothing to skip — every line is a record. Two samples are printed the
/// same way `iostat` does; only the final block is kept.
fn parse_pool_io(output: &str, host: &str, now: i64) -> Vec<PoolIoStats> {
    let lines: Vec<&str> = output.lines().collect();
    let pools_in_first_block = lines.iter().take_while(|l| !l.is_empty()).count();
    let final_block_start = if lines.len() > pools_in_first_block {
        lines.len().saturating_sub(pools_in_first_block)
    } else {
        0
    };

    let mut rows = Vec::new();
    for line in lines.iter().skip(final_block_start) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            debug!(line, "rejecting zpool iostat row with unexpected column count");
            continue;
        }
        let parsed: Vec<Option<f64>> = fields[3..7].iter().map(|f| f.parse::<f64>().ok()).collect();
        if parsed.iter().any(Option::is_none) {
            debug!(line, "rejecting zpool iostat row with non-numeric field");
            continue;
        }
        rows.push(PoolIoStats {
            host: host.to_string(),
            pool: fields[0].to_string(),
            reads_per_sec: parsed[0].unwrap(),
            writes_per_sec: parsed[1].unwrap(),
            read_bytes_per_sec: parsed[2].unwrap(),
            write_bytes_per_sec: parsed[3].unwrap(),
            scan_timestamp: now,
        });
    }
    rows
}

/// `prtconf -pv` is a device-tree dump, not a table: PCI nodes are
/// recognised by a `model` or `device-id`/`vendor-id` property nested under
/// them. This walks the indented property lines, tracking the nearest node
/// name above each property block as the device's slot identifier.
fn parse_pci_devices(output: &str, host: &str, now: i64) -> Vec<PciDevice> {
    let mut rows = Vec::new();
    let mut current_slot = String::new();
    let mut vendor_id = None;
    let mut device_id = None;
    let mut description = None;

    let flush = |rows: &mut Vec<PciDevice>, slot: &str, vendor_id: &mut Option<String>, device_id: &mut Option<String>, description: &mut Option<String>| {
        if vendor_id.is_some() || device_id.is_some() {
            rows.push(PciDevice {
                host: host.to_string(),
                slot: slot.to_string(),
                vendor_id: vendor_id.take(),
                device_id: device_id.take(),
                description: description.take(),
                scan_timestamp: now,
            });
        }
    };

    for line in output.lines() {
        let trimmed = line.trim_start();
        let depth = line.len() - trimmed.len();

        if depth == 4 && trimmed.ends_with(", instance #0 (driver not attached)") || (depth == 4 && trimmed.contains(", instance #")) {
            flush(&mut rows, &current_slot, &mut vendor_id, &mut device_id, &mut description);
            current_slot = trimmed.split(',').next().unwrap_or(trimmed).to_string();
            continue;
        }

        if let Some(value) = trimmed.strip_prefix("vendor-id:") {
            vendor_id = parse_optional_string(value);
        } else if let Some(value) = trimmed.strip_prefix("device-id:") {
            device_id = parse_optional_string(value);
        } else if let Some(value) = trimmed.strip_prefix("model:") {
            description = parse_optional_string(value.trim_matches('\''));
        }
    }
    flush(&mut rows, &current_slot, &mut vendor_id, &mut device_id, &mut description);

    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_datasets_reads_tab_separated_rows() {
        let out = "rpool/export\t1024\t2048\t/export\n";
        let rows = parse_datasets(out, "hv01", 1000);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].used_bytes, Some(1024));
        assert_eq!(rows[0].mountpoint.as_deref(), Some("/export"));
    }

    #[test]
    fn parse_datasets_rejects_wrong_column_count() {
        let out = "rpool/export\t1024\t2048\n";
        assert!(parse_datasets(out, "hv01", 1000).is_empty());
    }

    #[test]
    fn parse_pool_io_keeps_final_tab_separated_block() {
        let out = "rpool\t100\t900\t1\t2\t1000\t2000\n\
                    \n\
                    rpool\t100\t900\t5\t6\t5000\t6000\n";
        let rows = parse_pool_io(out, "hv01", 1000);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reads_per_sec, 5.0);
        assert_eq!(rows[0].writes_per_sec, 6.0);
    }
}
