//! Host telemetry for the control plane, read from `/proc` and statvfs.

use std::collections::BTreeMap;

use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkTraffic {
    pub rx: u64,
    pub tx: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTicks {
    pub user: u64,
    pub system: u64,
    pub idle: u64,
}

fn parse_cpu_line(line: &str) -> Option<(String, CpuTicks)> {
    let mut fields = line.split_ascii_whitespace();
    let name = fields.next()?;
    if !name.starts_with("cpu") {
        return None;
    }
    let user = fields.next()?.parse().ok()?;
    let _nice: u64 = fields.next()?.parse().ok()?;
    let system = fields.next()?.parse().ok()?;
    let idle = fields.next()?.parse().ok()?;
    Some((name.to_string(), CpuTicks { user, system, idle }))
}

pub fn cpu_ticks_from(stat: &str) -> BTreeMap<String, CpuTicks> {
    stat.lines().filter_map(parse_cpu_line).collect()
}

/// Per-core CPU ticks split user/system/idle, plus the aggregate row.
pub fn cpu_info() -> Value {
    let stat = std::fs::read_to_string("/proc/stat").unwrap_or_default();
    cpu_info_from(&stat)
}

pub fn cpu_info_from(stat: &str) -> Value {
    let ticks = cpu_ticks_from(stat);
    let total = ticks.get("cpu").copied().unwrap_or_default();
    let cores: Vec<Value> = ticks
        .iter()
        .filter(|(name, _)| name.len() > 3)
        .map(|(name, t)| {
            json!({
                "id": &name[3..],
                "user": t.user,
                "system": t.system,
                "idle": t.idle,
            })
        })
        .collect();

    json!({
        "user": total.user,
        "system": total.system,
        "idle": total.idle,
        "cores": cores,
    })
}

/// Key figures from `/proc/meminfo`, in kilobytes.
pub fn memory_info() -> Value {
    let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
    memory_info_from(&meminfo)
}

pub fn memory_info_from(meminfo: &str) -> Value {
    let mut out = serde_json::Map::new();
    for line in meminfo.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let field = match key {
            "MemTotal" => "total",
            "MemFree" => "free",
            "MemAvailable" => "available",
            "Buffers" => "buffers",
            "Cached" => "cached",
            "SwapTotal" => "swap_total",
            "SwapFree" => "swap_free",
            _ => continue,
        };
        if let Some(kb) = rest.trim().split_ascii_whitespace().next() {
            if let Ok(v) = kb.parse::<u64>() {
                out.insert(field.to_string(), Value::from(v));
            }
        }
    }
    Value::Object(out)
}

/// Filesystem totals for the root mount, in bytes.
pub fn disk_info() -> Value {
    disk_info_for("/")
}

pub fn disk_info_for(path: &str) -> Value {
    let c_path = match std::ffi::CString::new(path) {
        Ok(p) => p,
        Err(_) => return json!({}),
    };
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) };
    if rc != 0 {
        return json!({});
    }

    let frsize = vfs.f_frsize as u64;
    let total = vfs.f_blocks as u64 * frsize;
    let available = vfs.f_bavail as u64 * frsize;
    let free = vfs.f_bfree as u64 * frsize;
    json!({
        "total": total,
        "available": available,
        "used": total - free,
    })
}

pub fn network_info(baseline: Option<NetworkTraffic>) -> Value {
    let dev = std::fs::read_to_string("/proc/net/dev").unwrap_or_default();
    network_info_from(&dev, baseline)
}

/// Per-interface rx/tx byte counters from `/proc/net/dev`. A baseline from a
/// previous reading is subtracted to yield deltas.
pub fn network_info_from(dev: &str, baseline: Option<NetworkTraffic>) -> Value {
    let base = baseline.unwrap_or_default();
    let mut out = Vec::new();
    for line in dev.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = counters.split_ascii_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let rx: u64 = fields[0].parse().unwrap_or(0);
        let tx: u64 = fields[8].parse().unwrap_or(0);
        out.push(json!({
            "name": name.trim(),
            "rx": rx.saturating_sub(base.rx),
            "tx": tx.saturating_sub(base.tx),
        }));
    }
    Value::Array(out)
}

/// Parse the `v=rx,tx` query value carrying a previous network reading.
pub fn parse_traffic_baseline(value: &str) -> Option<NetworkTraffic> {
    let (rx, tx) = value.split_once(',')?;
    Some(NetworkTraffic {
        rx: rx.trim().parse().ok()?,
        tx: tx.trim().parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "\
cpu  100 5 50 800 7 0 3 0 0 0
cpu0 60 3 30 400 4 0 2 0 0 0
cpu1 40 2 20 400 3 0 1 0 0 0
intr 12345
";

    #[test]
    fn cpu_rows_split_user_system_idle() {
        let info = cpu_info_from(STAT);
        assert_eq!(info["user"], 100);
        assert_eq!(info["system"], 50);
        assert_eq!(info["idle"], 800);
        let cores = info["cores"].as_array().unwrap();
        assert_eq!(cores.len(), 2);
        assert_eq!(cores[0]["id"], "0");
        assert_eq!(cores[1]["user"], 40);
    }

    #[test]
    fn meminfo_fields() {
        let info = memory_info_from(
            "MemTotal: 16000 kB\nMemFree: 4000 kB\nMemAvailable: 9000 kB\nDirty: 3 kB\n",
        );
        assert_eq!(info["total"], 16000);
        assert_eq!(info["available"], 9000);
        assert!(info.get("Dirty").is_none());
    }

    #[test]
    fn network_deltas_against_baseline() {
        let dev = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    5000      50    0    0    0     0          0         0     5000      50    0    0    0     0       0          0
  eth0:  120000    1000    0    0    0     0          0         0    80000     700    0    0    0     0       0          0
";
        let all = network_info_from(dev, None);
        assert_eq!(all[1]["name"], "eth0");
        assert_eq!(all[1]["rx"], 120000);

        let baseline = parse_traffic_baseline("20000,30000").unwrap();
        let delta = network_info_from(dev, Some(baseline));
        assert_eq!(delta[1]["rx"], 100000);
        assert_eq!(delta[1]["tx"], 50000);
        // Counters below the baseline clamp to zero rather than wrapping.
        assert_eq!(delta[0]["rx"], 0);
    }

    #[test]
    fn bad_baseline_is_rejected() {
        assert!(parse_traffic_baseline("x,y").is_none());
        assert!(parse_traffic_baseline("123").is_none());
    }

    #[test]
    fn disk_totals_are_consistent() {
        let info = disk_info_for("/");
        if let Some(total) = info["total"].as_u64() {
            assert!(total >= info["available"].as_u64().unwrap());
            assert!(total >= info["used"].as_u64().unwrap());
        }
    }
}
