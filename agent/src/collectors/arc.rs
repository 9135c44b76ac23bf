//! ZFS ARC collector, backed by `kstat -p zfs:0:arcstats:`. `kstat -p`
//! already emits one `module:instance:name:statistic value` record per
//! line, so this is the escaped-colon parser family even though there's no
//! MAC address in sight — the module/name separator is the same `:`.

use shared::metrics::ArcStats;
use shared::utils::current_timestamp;
use tracing::debug;

use super::parse::split_escaped_colons;
use super::CollectorContext;
use crate::store::tables;

pub async fn collect(ctx: &CollectorContext) -> anyhow::Result<()> {
    let now = current_timestamp();

    let out = ctx.command_runner.run_checked("kstat", &["-p", "zfs:0:arcstats:"]).await?;
    let sample = parse_arcstats(&out, &ctx.host, now)
        .ok_or_else(|| anyhow::anyhow!("kstat produced no usable arcstats fields"))?;

    let mut store = ctx.store.lock().await;
    let conn = store.get_connection()?;
    tables::arc::insert_sample(conn, &sample)?;

    Ok(())
}

/// Each line is `zfs:0:arcstats:<statistic>\t<value>`. We only need `size`
/// and `c` (the ARC's current target size); `hits`/`misses` feed a
/// hit-ratio computed over the single sample (no delta needed: kstat's
/// `hits`/`misses` are already lifetime cumulative counters, and a ratio of
/// cumulative counters is a stable long-run hit rate, not a per-interval
/// rate the way network/CPU deltas are).
fn parse_arcstats(output: &str, host: &str, now: i64) -> Option<ArcStats> {
    let mut arc_size_bytes = None;
    let mut target_size_bytes = None;
    let mut hits = None;
    let mut misses = None;

    for line in output.lines() {
        let fields = split_escaped_colons(line);
        // zfs : 0 : arcstats : <statistic>\t<value>
        if fields.len() != 4 {
            debug!(line, "rejecting arcstats row with unexpected column count");
            continue;
        }
        let Some((stat, value)) = fields[3].split_once(char::is_whitespace) else {
            debug!(line, "rejecting arcstats row with no statistic/value separator");
            continue;
        };
        let stat = stat.trim();
        let Ok(value) = value.trim().parse::<u64>() else {
            debug!(line, "rejecting arcstats row with non-numeric value");
            continue;
        };

        match stat {
            "size" => arc_size_bytes = Some(value),
            "c" => target_size_bytes = Some(value),
            "hits" => hits = Some(value),
            "misses" => misses = Some(value),
            _ => {}
        }
    }

    let hit_ratio_pct = match (hits, misses) {
        (Some(h), Some(m)) if h + m > 0 => Some((h as f64 / (h + m) as f64) * 100.0),
        _ => None,
    };

    Some(ArcStats {
        host: host.to_string(),
        arc_size_bytes: arc_size_bytes?,
        target_size_bytes: target_size_bytes?,
        hit_ratio_pct,
        scan_timestamp: now,
    })
}
