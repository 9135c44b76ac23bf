//! Host memory collector, backed by `kstat`'s parseable mode
//! (`unix:0:system_pages:<statistic> <value>`, one per line). `kstat -p`
//! separates the statistic's dotted path from its value with whitespace
//! rather than a colon, so the value itself is parsed off the end of the
//! line instead of through [`super::parse::split_escaped_colons`].

use shared::metrics::MemoryStats;
use shared::utils::current_timestamp;

use super::CollectorContext;
use crate::store::tables;

const PAGE_SIZE_BYTES: u64 = 4096;

pub async fn collect(ctx: &CollectorContext) -> anyhow::Result<()> {
    let now = current_timestamp();

    let out = ctx
        .command_runner
        .run_checked("kstat", &["-p", "-m", "unix", "-n", "system_pages"])
        .await?;

    let pages = parse_system_pages(&out);
    let total_bytes = pages.total.ok_or_else(|| anyhow::anyhow!("kstat reported no pagestotal"))? * PAGE_SIZE_BYTES;
    let free_bytes = pages.free.unwrap_or(0) * PAGE_SIZE_BYTES;
    let used_bytes = total_bytes.saturating_sub(free_bytes);

    let row = MemoryStats {
        host: ctx.host.clone(),
        total_bytes,
        free_bytes,
        used_bytes,
        cached_bytes: pages.cachelist.map(|p| p * PAGE_SIZE_BYTES),
        scan_timestamp: now,
    };

    let mut store = ctx.store.lock().await;
    let conn = store.get_connection()?;
    tables::memory::insert_sample(conn, &row)?;

    Ok(())
}

#[derive(Default)]
struct SystemPages {
    total: Option<u64>,
    free: Option<u64>,
    cachelist: Option<u64>,
}

/// Each line looks like `unix:0:system_pages:pagestotal\t262144`: the
/// dotted kstat name (module:instance:name:statistic) followed by
/// whitespace and the value. Rows that don't split into exactly those two
/// parts, or whose value isn't a non-negative integer, are dropped.
fn parse_system_pages(output: &str) -> SystemPages {
    let mut pages = SystemPages::default();
    for line in output.lines() {
        let mut parts = line.splitn(2, char::is_whitespace);
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Some(statistic) = name.rsplit(':').next() else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        match statistic {
            "pagestotal" => pages.total = Some(value),
            "pagesfree" => pages.free = Some(value),
            "pageslocked" => {}
            "pagesio" | "pagescoalesce" => {}
            "freemem" => pages.free = pages.free.or(Some(value)),
            "physmem" => pages.total = pages.total.or(Some(value)),
            "availrmem" => pages.cachelist = Some(value),
            _ => {}
        }
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_system_pages_extracts_known_statistics() {
        let out = "unix:0:system_pages:pagestotal\t262144\n\
                    unix:0:system_pages:pagesfree\t40000\n\
                    unix:0:system_pages:availrmem\t90000\n";
        let pages = parse_system_pages(out);
        assert_eq!(pages.total, Some(262144));
        assert_eq!(pages.free, Some(40000));
        assert_eq!(pages.cachelist, Some(90000));
    }

    #[test]
    fn parse_system_pages_ignores_malformed_lines() {
        let out = "unix:0:system_pages:pagestotal not-a-number\nnonsense\n";
        let pages = parse_system_pages(out);
        assert_eq!(pages.total, None);
    }
}
