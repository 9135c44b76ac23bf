//! Per-core CPU utilization collector, backed by `mpstat`. `mpstat` has no
//! parseable mode of its own, so this leans on the whitespace-column /
//! header-skip half of the robustness contract rather than the
//! escaped-colon half `dladm`/`ipadm` get.

use shared::metrics::CpuStats;
use shared::utils::current_timestamp;
use tracing::debug;

use super::parse::{looks_like_header, split_whitespace_fields};
use super::CollectorContext;
use crate::command::CommandSpec;
use crate::store::tables;

pub async fn collect(ctx: &CollectorContext) -> anyhow::Result<()> {
    let now = current_timestamp();

    // A single one-second sample: the first interval mpstat prints is the
    // average since boot, the second is the interval just measured.
    let spec = CommandSpec::new("mpstat", &["1", "2"]);
    let result = ctx.command_runner.run(&spec).await;
    if !result.ok {
        anyhow::bail!("mpstat failed (exit {:?}): {}", result.exit_code, result.stderr.trim());
    }

    let samples = parse_mpstat(&result.stdout, &ctx.host, now);
    if samples.is_empty() {
        anyhow::bail!("mpstat produced no usable per-core rows");
    }

    let mut store = ctx.store.lock().await;
    let conn = store.get_connection()?;
    tables::cpu::insert_samples(conn, &samples)?;

    Ok(())
}

/// `mpstat`'s output repeats the full table once per sampling interval
/// requested; only the final (most recent) block is kept. Columns of
/// interest: `CPU`, `usr`, `sys`, `idl`.
fn parse_mpstat(output: &str, host: &str, now: i64) -> Vec<CpuStats> {
    let header_index = output
        .lines()
        .enumerate()
        .filter(|(_, line)| looks_like_header(&split_whitespace_fields(line)))
        .map(|(i, _)| i)
        .last();

    let Some(header_index) = header_index else {
        return Vec::new();
    };
    let header_fields = split_whitespace_fields(
        output.lines().nth(header_index).unwrap_or(""),
    );
    let Some((usr_idx, sys_idx, idl_idx)) = locate_columns(&header_fields) else {
        return Vec::new();
    };

    let mut rows = Vec::new();
    for line in output.lines().skip(header_index + 1) {
        let fields = split_whitespace_fields(line);
        if fields.is_empty() || looks_like_header(&fields) {
            continue;
        }
        let needed = usr_idx.max(sys_idx).max(idl_idx);
        if fields.len() <= needed {
            debug!(line, "rejecting mpstat row with too few columns");
            continue;
        }
        let core_id = match fields[0].trim().parse::<u32>() {
            Ok(id) => id,
            Err(_) => {
                debug!(line, "rejecting mpstat row with non-numeric core id");
                continue;
            }
        };
        let (Ok(user_pct), Ok(system_pct), Ok(idle_pct)) = (
            fields[usr_idx].trim().parse::<f64>(),
            fields[sys_idx].trim().parse::<f64>(),
            fields[idl_idx].trim().parse::<f64>(),
        ) else {
            debug!(line, "rejecting mpstat row with non-numeric utilization field");
            continue;
        };

        rows.push(CpuStats {
            host: host.to_string(),
            core_id,
            user_pct,
            system_pct,
            idle_pct,
            scan_timestamp: now,
        });
    }
    rows
}

fn locate_columns(header_fields: &[&str]) -> Option<(usize, usize, usize)> {
    let find = |name: &str| header_fields.iter().position(|f| f.eq_ignore_ascii_case(name));
    Some((find("usr")?, find("sys")?, find("idl")?))
}
