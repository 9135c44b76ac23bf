//! Network configuration collector: link inventory, IP address assignment
//! and the routing table. All three are current-state snapshots, replaced
//! wholesale on the Store each pass (§6.1).

use shared::metrics::{IpAddress, NetworkInterface, RoutingTableEntry};
use shared::utils::current_timestamp;
use tracing::debug;

use super::parse::{looks_like_header, parse_optional_float, parse_optional_string, split_escaped_colons, split_whitespace_fields};
use super::CollectorContext;
use crate::command::CommandSpec;
use crate::store::tables;

pub async fn collect(ctx: &CollectorContext) -> anyhow::Result<()> {
    let now = current_timestamp();

    let links_out = ctx
        .command_runner
        .run_checked("dladm", &["show-link", "-p", "-o", "link,class,state,over,mtu"])
        .await?;
    let speeds_out = ctx
        .command_runner
        .run_checked("dladm", &["show-phys", "-p", "-o", "link,speed"])
        .await?;
    let macs_out = ctx
        .command_runner
        .run_checked("dladm", &["show-linkprop", "-c", "-o", "link,value", "-p", "mac-address"])
        .await
        .unwrap_or_default();
    let addrs_out = ctx
        .command_runner
        .run_checked("ipadm", &["show-addr", "-p", "-o", "addrobj,type,state,addr"])
        .await?;
    let routes_out = ctx.command_runner.run_checked("netstat", &["-rn", "-f", "inet"]).await?;

    let speeds = parse_speeds(&speeds_out);
    let macs = parse_macs(&macs_out);
    let interfaces = parse_interfaces(&links_out, &speeds, &macs, &ctx.host, now);
    let ip_addresses = parse_ip_addresses(&addrs_out, &ctx.host, now);
    let routes = parse_routes(&routes_out, &ctx.host, now);

    let mut store = ctx.store.lock().await;
    let conn = store.get_connection()?;
    tables::network::replace_interfaces(conn, &ctx.host, &interfaces)?;
    tables::network::replace_ip_addresses(conn, &ctx.host, &ip_addresses)?;
    tables::network::replace_routing_table(conn, &ctx.host, &routes)?;

    Ok(())
}

/// `link -> speed_mbps`, from `dladm show-phys -p -o link,speed` (speed is
/// reported in Mbps already).
fn parse_speeds(output: &str) -> std::collections::HashMap<String, f64> {
    let mut speeds = std::collections::HashMap::new();
    for line in output.lines() {
        let fields = split_escaped_colons(line);
        if fields.len() != 2 {
            continue;
        }
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        if looks_like_header(&refs) {
            continue;
        }
        if let Some(speed) = parse_optional_float(&fields[1]) {
            speeds.insert(fields[0].clone(), speed);
        }
    }
    speeds
}

/// `link -> mac address` from `dladm show-linkprop`'s `mac-address` rows.
fn parse_macs(output: &str) -> std::collections::HashMap<String, String> {
    let mut macs = std::collections::HashMap::new();
    for line in output.lines() {
        let fields = split_escaped_colons(line);
        if fields.len() != 2 {
            continue;
        }
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        if looks_like_header(&refs) {
            continue;
        }
        if let Some(mac) = parse_optional_string(&fields[1]) {
            macs.insert(fields[0].clone(), mac);
        }
    }
    macs
}

fn parse_interfaces(
    output: &str,
    speeds: &std::collections::HashMap<String, f64>,
    macs: &std::collections::HashMap<String, String>,
    host: &str,
    now: i64,
) -> Vec<NetworkInterface> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let fields = split_escaped_colons(line);
        if fields.len() != 5 {
            debug!(line, "rejecting network link row with unexpected column count");
            continue;
        }
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        if looks_like_header(&refs) {
            debug!(line, "rejecting network link row that looks like a header");
            continue;
        }
        let link = fields[0].clone();
        let mtu = parse_optional_string(&fields[4]).and_then(|v| v.parse::<u32>().ok());
        rows.push(NetworkInterface {
            host: host.to_string(),
            link: link.clone(),
            class: fields[1].clone(),
            state: fields[2].clone(),
            over: parse_optional_string(&fields[3]),
            speed_mbps: speeds.get(&link).copied(),
            mtu,
            mac_address: macs.get(&link).cloned(),
            scan_timestamp: now,
        });
    }
    rows
}

fn parse_ip_addresses(output: &str, host: &str, now: i64) -> Vec<IpAddress> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let fields = split_escaped_colons(line);
        if fields.len() != 4 {
            debug!(line, "rejecting ip address row with unexpected column count");
            continue;
        }
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        if looks_like_header(&refs) {
            debug!(line, "rejecting ip address row that looks like a header");
            continue;
        }
        // addrobj is typically "link/name"; the interface the address
        // belongs to is the part before the slash.
        let interface = fields[0].split('/').next().unwrap_or(&fields[0]).to_string();
        rows.push(IpAddress {
            host: host.to_string(),
            interface,
            address: fields[3].clone(),
            address_type: fields[1].clone(),
            state: fields[2].clone(),
            scan_timestamp: now,
        });
    }
    rows
}

/// `netstat -rn` doesn't honour a parseable mode: whitespace columns with a
/// header row (and often a blank separator row) to skip.
fn parse_routes(output: &str, host: &str, now: i64) -> Vec<RoutingTableEntry> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let fields = split_whitespace_fields(line);
        if fields.len() < 2 {
            continue;
        }
        if looks_like_header(&fields) {
            continue;
        }
        // Destination and gateway are always present; interface/flags vary
        // by platform column layout, so they're taken best-effort.
        rows.push(RoutingTableEntry {
            host: host.to_string(),
            destination: fields[0].to_string(),
            gateway: fields[1].to_string(),
            flags: fields.get(2).map(|s| s.to_string()),
            interface: fields.get(3).map(|s| s.to_string()),
            scan_timestamp: now,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_interfaces_builds_rows_and_joins_speed_and_mac() {
        let links = "net0:phys:up:--:1500\nvnic0:vnic:up:net0:1500\n";
        let mut speeds = std::collections::HashMap::new();
        speeds.insert("net0".to_string(), 1000.0);
        let mut macs = std::collections::HashMap::new();
        macs.insert("net0".to_string(), "2:a:b:c:d:e".to_string());

        let rows = parse_interfaces(links, &speeds, &macs, "hv01", 1000);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].speed_mbps, Some(1000.0));
        assert_eq!(rows[0].mac_address.as_deref(), Some("2:a:b:c:d:e"));
        assert_eq!(rows[1].over.as_deref(), Some("net0"));
        assert_eq!(rows[1].speed_mbps, None);
    }

    #[test]
    fn parse_interfaces_rejects_header_and_short_rows() {
        let links = "LINK:CLASS:STATE:OVER:MTU\nnet0:phys:up\n";
        let rows = parse_interfaces(links, &Default::default(), &Default::default(), "hv01", 1000);
        assert!(rows.is_empty());
    }

    #[test]
    fn parse_ip_addresses_splits_interface_from_addrobj() {
        let out = "net0/v4:static:ok:10.0.0.5/24\n";
        let rows = parse_ip_addresses(out, "hv01", 1000);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].interface, "net0");
        assert_eq!(rows[0].address, "10.0.0.5/24");
    }

    #[test]
    fn parse_routes_skips_header_row() {
        let out = "Destination   Gateway       Flags  Interface\n\
                    default        10.0.0.1      UG     net0\n";
        let rows = parse_routes(out, "hv01", 1000);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].destination, "default");
        assert_eq!(rows[0].gateway, "10.0.0.1");
        assert_eq!(rows[0].interface.as_deref(), Some("net0"));
    }
}
