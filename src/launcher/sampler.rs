//! Resource sampling from `/proc`.

use std::collections::{HashMap, HashSet};

use nix::unistd::{sysconf, SysconfVar};

/// Usage of one process tree at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub rss_kb: u64,
    pub cpu_secs: f64,
    pub processes: usize,
}

#[derive(Debug, Clone, Copy)]
struct ProcStat {
    pid: u32,
    ppid: u32,
    session: u32,
    ticks: u64,
    rss_pages: u64,
}

fn parse_stat(text: &str) -> Option<ProcStat> {
    let open = text.find('(')?;
    let close = text.rfind(')')?;
    let pid = text[..open].trim().parse().ok()?;
    let fields: Vec<&str> = text[close + 1..].split_whitespace().collect();
    // fields[0] is the state, i.e. field 3 of proc(5)
    let field = |n: usize| fields.get(n - 3).and_then(|v| v.parse::<u64>().ok());
    Some(ProcStat {
        pid,
        ppid: field(4)? as u32,
        session: field(6)? as u32,
        ticks: field(14)? + field(15)?,
        rss_pages: field(24)?,
    })
}

fn read_all() -> Vec<ProcStat> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|e| std::fs::read_to_string(e.path().join("stat")).ok())
        .filter_map(|text| parse_stat(&text))
        .collect()
}

fn page_kb() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64 / 1024,
        _ => 4,
    }
}

fn clock_ticks() -> f64 {
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as f64,
        _ => 100.0,
    }
}

/// Sum usage over `root` and every process descended from it or sharing its
/// session. Returns `None` once nothing is left.
pub fn sample_tree(root: u32) -> Option<ResourceSample> {
    let stats = read_all();
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for stat in &stats {
        children.entry(stat.ppid).or_default().push(stat.pid);
    }

    let mut members: HashSet<u32> = stats
        .iter()
        .filter(|s| s.session == root)
        .map(|s| s.pid)
        .collect();
    let mut visited = HashSet::new();
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if !visited.insert(pid) {
            continue;
        }
        members.insert(pid);
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }

    let (page_kb, ticks) = (page_kb(), clock_ticks());
    let mut sample = ResourceSample::default();
    for stat in stats.iter().filter(|s| members.contains(&s.pid)) {
        sample.rss_kb += stat.rss_pages * page_kb;
        sample.cpu_secs += stat.ticks as f64 / ticks;
        sample.processes += 1;
    }
    (sample.processes > 0).then_some(sample)
}

/// One, five and fifteen minute load averages.
pub fn load_average() -> (f64, f64, f64) {
    let text = std::fs::read_to_string("/proc/loadavg").unwrap_or_default();
    let mut values = text
        .split_whitespace()
        .map(|v| v.parse::<f64>().unwrap_or(0.0));
    (
        values.next().unwrap_or(0.0),
        values.next().unwrap_or(0.0),
        values.next().unwrap_or(0.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_with_spaces_in_comm() {
        let text = "4242 (my (odd) cmd) S 1 4242 4242 0 -1 4194560 100 0 0 0 150 50 0 0 20 0 1 0 100 1000000 256 18446744073709551615";
        let stat = parse_stat(text).unwrap();
        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.session, 4242);
        assert_eq!(stat.ticks, 200);
        assert_eq!(stat.rss_pages, 256);
    }

    #[test]
    fn samples_own_process() {
        let sample = sample_tree(std::process::id()).unwrap();
        assert!(sample.processes >= 1);
        assert!(sample.rss_kb > 0);
    }
}
