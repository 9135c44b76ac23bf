//! Network usage collector: per-link byte/packet counters plus the §4.6.2
//! delta/bandwidth computation against the previous sample.

use shared::metrics::{compute_network_delta, NetworkUsage};
use shared::utils::current_timestamp;
use tracing::debug;

use super::parse::{looks_like_header, parse_non_negative_int, split_escaped_colons};
use super::CollectorContext;
use crate::store::tables;

pub async fn collect(ctx: &CollectorContext) -> anyhow::Result<()> {
    let now = current_timestamp();

    let counters_out = ctx
        .command_runner
        .run_checked(
            "dladm",
            &["show-link", "-s", "-p", "-o", "link,ipackets,rbytes,ierrors,opackets,obytes,oerrors"],
        )
        .await?;
    let speeds_out = ctx
        .command_runner
        .run_checked("dladm", &["show-phys", "-p", "-o", "link,speed"])
        .await?;

    let speeds = parse_speeds(&speeds_out);
    let counters = parse_counters(&counters_out);

    let mut store = ctx.store.lock().await;
    let conn = store.get_connection()?;

    for counter in counters {
        let previous = tables::network::latest_counters(conn, &ctx.host, &counter.link)?
            .into_iter()
            .next();
        let speed_mbps = speeds.get(&counter.link).copied();

        let (rbytes_delta, obytes_delta, rx_bps, tx_bps, rx_mbps, tx_mbps, rx_util, tx_util) =
            compute_network_delta((counter.rbytes, counter.obytes, now), previous, speed_mbps);

        let row = NetworkUsage {
            host: ctx.host.clone(),
            link: counter.link,
            rbytes: counter.rbytes,
            obytes: counter.obytes,
            ipackets: counter.ipackets,
            opackets: counter.opackets,
            ierrors: counter.ierrors,
            oerrors: counter.oerrors,
            rbytes_delta,
            obytes_delta,
            rx_bps,
            tx_bps,
            rx_mbps,
            tx_mbps,
            rx_utilization_pct: rx_util,
            tx_utilization_pct: tx_util,
            scan_timestamp: now,
        };
        tables::network::insert_usage_sample(conn, &row)?;
    }

    Ok(())
}

struct RawCounters {
    link: String,
    ipackets: u64,
    rbytes: u64,
    ierrors: u64,
    opackets: u64,
    obytes: u64,
    oerrors: u64,
}

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
        if let Ok(speed) = fields[1].trim().parse::<f64>() {
            speeds.insert(fields[0].clone(), speed);
        }
    }
    speeds
}

fn parse_counters(output: &str) -> Vec<RawCounters> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let fields = split_escaped_colons(line);
        if fields.len() != 7 {
            debug!(line, "rejecting network usage row with unexpected column count");
            continue;
        }
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        if looks_like_header(&refs) {
            debug!(line, "rejecting network usage row that looks like a header");
            continue;
        }

        let parsed = (
            parse_non_negative_int(&fields[1]),
            parse_non_negative_int(&fields[2]),
            parse_non_negative_int(&fields[3]),
            parse_non_negative_int(&fields[4]),
            parse_non_negative_int(&fields[5]),
            parse_non_negative_int(&fields[6]),
        );
        let (Some(ipackets), Some(rbytes), Some(ierrors), Some(opackets), Some(obytes), Some(oerrors)) = parsed
        else {
            debug!(line, "rejecting network usage row with non-numeric counter field");
            continue;
        };

        rows.push(RawCounters {
            link: fields[0].clone(),
            ipackets,
            rbytes,
            ierrors,
            opackets,
            obytes,
            oerrors,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_counters_accepts_well_formed_rows() {
        let out = "net0:1200:1500000:0:900:2100000:0\n";
        let rows = parse_counters(out);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].link, "net0");
        assert_eq!(rows[0].rbytes, 1_500_000);
        assert_eq!(rows[0].obytes, 2_100_000);
    }

    #[test]
    fn parse_counters_rejects_header_and_malformed_rows() {
        let out = "LINK:IPACKETS:RBYTES:IERRORS:OPACKETS:OBYTES:OERRORS\n\
                    net0:not-a-number:1500000:0:900:2100000:0\n\
                    net1:1200:1500000:0:900\n";
        let rows = parse_counters(out);
        assert!(rows.is_empty());
    }
}
