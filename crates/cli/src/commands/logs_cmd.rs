//! `logs tail [router]`, `logs last <n>`.

use std::io::{Read, Seek, SeekFrom};

use anyhow::bail;

use ploinky_gateway::LifecycleLog;

use super::workspace;

pub fn last(n: usize) -> anyhow::Result<()> {
    let paths = workspace()?;
    let log = LifecycleLog::new(paths.router_log());
    let records = log.last(n);
    if records.is_empty() {
        println!("no log records");
        return Ok(());
    }
    for record in records {
        println!("{record}");
    }
    Ok(())
}

/// Follow the router log, printing appended lines until interrupted.
pub fn tail(target: Option<&str>) -> anyhow::Result<()> {
    if let Some(target) = target
        && target != "router"
    {
        bail!("unknown log target '{target}' (only 'router' is available)");
    }
    let paths = workspace()?;
    let path = paths.router_log();

    let mut offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    loop {
        if let Ok(meta) = std::fs::metadata(&path) {
            let len = meta.len();
            if len < offset {
                // Log rotated or truncated; start over.
                offset = 0;
            }
            if len > offset
                && let Ok(mut file) = std::fs::File::open(&path)
                && file.seek(SeekFrom::Start(offset)).is_ok()
            {
                let mut chunk = String::new();
                if file.read_to_string(&mut chunk).is_ok() {
                    print!("{chunk}");
                    offset = len;
                }
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(500));
    }
}
