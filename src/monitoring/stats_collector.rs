use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::messages::{CpuStats, MemoryStats, RelayStats};
use crate::server::AppState;

pub fn collect_stats(state: &AppState) -> RelayStats {
    let uptime = state.start_time.elapsed().as_millis() as u64;

    let (mem_used, _mem_free, mem_total) = read_memory_stats();

    let cores = num_cpus();
    let system_load = read_system_load();
    let process_load = (read_process_cpu_load() / cores as f64).clamp(0.0, 1.0);

    RelayStats {
        publishers: state.registry.connected_publishers() as i32,
        subscribers: state.registry.subscriber_count() as i32,
        tracked_drivers: state.store.len() as i32,
        uptime,
        memory: MemoryStats {
            free: mem_total.saturating_sub(mem_used),
            used: mem_used,
            total: mem_total,
        },
        cpu: CpuStats {
            cores,
            system_load,
            process_load,
        },
    }
}

fn read_system_load() -> f64 {
    static PREV_IDLE: AtomicU64 = AtomicU64::new(0);
    static PREV_TOTAL: AtomicU64 = AtomicU64::new(0);

    let stat = match std::fs::read_to_string("/proc/stat") {
        Ok(s) => s,
        Err(_) => return 0.0,
    };

    let first_line = stat.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 5 || parts[0] != "cpu" {
        return 0.0;
    }

    let mut total: u64 = 0;
    for part in &parts[1..] {
        total += part.parse::<u64>().unwrap_or(0);
    }
    // Idle is field 4 (0-indexed)
    let idle = parts[4].parse::<u64>().unwrap_or(0);

    let prev_idle = PREV_IDLE.swap(idle, Ordering::Relaxed);
    let prev_total = PREV_TOTAL.swap(total, Ordering::Relaxed);

    if prev_total == 0 {
        return 0.0;
    }

    let d_idle = idle.saturating_sub(prev_idle);
    let d_total = total.saturating_sub(prev_total);

    if d_total == 0 {
        return 0.0;
    }

    (d_total.saturating_sub(d_idle)) as f64 / d_total as f64
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1)
}

fn read_memory_stats() -> (u64, u64, u64) {
    let rss = std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| {
                    l.split_whitespace()
                        .nth(1)
                        .and_then(|v| v.parse::<u64>().ok())
                })
                .map(|kb| kb * 1024)
        })
        .unwrap_or(0);

    let (mut total, mut free) = (0u64, 0u64);
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        for line in meminfo.lines() {
            if line.starts_with("MemTotal:") {
                total = line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024;
            } else if line.starts_with("MemAvailable:") {
                free = line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024;
            }
        }
    }
    (rss, free, total)
}

/// Reads per-process CPU time from `/proc/self/stat` and computes the CPU
/// load fraction since the last call.
///
/// Linux always uses 100 ticks/sec for USER_HZ in /proc/self/stat, so a libc
/// dependency is avoided by hardcoding 100.
fn read_process_cpu_load() -> f64 {
    static PREV_CPU: AtomicU64 = AtomicU64::new(0);
    static PREV_WALL: AtomicU64 = AtomicU64::new(0);

    // The comm field (2nd) can contain spaces and parens; skip past the
    // closing ')'.
    let stat = match std::fs::read_to_string("/proc/self/stat") {
        Ok(s) => s,
        Err(_) => return 0.0,
    };
    let after_comm = match stat.rfind(')') {
        Some(i) => &stat[i + 1..],
        None => return 0.0,
    };

    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // After ')': state(0), ppid(1), ..., utime(11), stime(12)
    let utime: u64 = fields.get(11).and_then(|v| v.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|v| v.parse().ok()).unwrap_or(0);
    let cpu_ticks = utime + stime;

    let uptime_sec: f64 = std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))
        .unwrap_or(0.0);

    const USER_HZ: u64 = 100;
    let wall_ticks = (uptime_sec * USER_HZ as f64) as u64;

    let prev_cpu = PREV_CPU.swap(cpu_ticks, Ordering::Relaxed);
    let prev_wall = PREV_WALL.swap(wall_ticks, Ordering::Relaxed);

    // First call: no delta yet
    if prev_wall == 0 {
        return 0.0;
    }

    let d_cpu = cpu_ticks.saturating_sub(prev_cpu) as f64;
    let d_wall = wall_ticks.saturating_sub(prev_wall) as f64;

    if d_wall == 0.0 {
        return 0.0;
    }

    d_cpu / d_wall
}
