//! Swap area collector, backed by `swap -l`. `swap -l` reports sizes in
//! 512-byte blocks and has no parseable mode, so this is another
//! whitespace-column / header-skip parser.

use shared::metrics::SwapArea;
use shared::utils::current_timestamp;
use tracing::debug;

use super::parse::{looks_like_header, split_whitespace_fields};
use super::CollectorContext;
use crate::store::tables;

const BLOCK_SIZE_BYTES: u64 = 512;

pub async fn collect(ctx: &CollectorContext) -> anyhow::Result<()> {
    let now = current_timestamp();

    let out = ctx.command_runner.run_checked("swap", &["-l"]).await?;
    let rows = parse_swap_list(&out, &ctx.host, now);

    let mut store = ctx.store.lock().await;
    let conn = store.get_connection()?;
    tables::swap::insert_samples(conn, &rows)?;

    Ok(())
}

/// `swapfile dev swaplo blocks free`, header row included.
fn parse_swap_list(output: &str, host: &str, now: i64) -> Vec<SwapArea> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let fields = split_whitespace_fields(line);
        if fields.len() != 5 {
            debug!(line, "rejecting swap row with unexpected column count");
            continue;
        }
        if looks_like_header(&fields) {
            continue;
        }

        let (Ok(blocks), Ok(free)) = (fields[3].parse::<u64>(), fields[4].parse::<u64>()) else {
            debug!(line, "rejecting swap row with non-numeric block counts");
            continue;
        };

        rows.push(SwapArea {
            host: host.to_string(),
            swapfile: fields[0].to_string(),
            total_bytes: blocks * BLOCK_SIZE_BYTES,
            free_bytes: free * BLOCK_SIZE_BYTES,
            scan_timestamp: now,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_swap_list_skips_header_and_converts_blocks() {
        let out = "swapfile            dev  swaplo blocks   free\n\
                    /dev/zvol/dsk/rpool/swap 256,1     16  2097136 2097136\n";
        let rows = parse_swap_list(out, "hv01", 1000);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_bytes, 2_097_136 * BLOCK_SIZE_BYTES);
    }

    #[test]
    fn parse_swap_list_rejects_short_rows() {
        let out = "only three fields\n";
        assert!(parse_swap_list(out, "hv01", 1000).is_empty());
    }
}
