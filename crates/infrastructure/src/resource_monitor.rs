use std::sync::Mutex;
use std::time::Instant;

use tracing::debug;

/// 一次资源采样
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub memory_mb: f64,
    pub mem_percent: f64,
    pub cpu_percent: f64,
}

/// 基于 `/proc` 的进程资源采样器
///
/// CPU使用率按两次采样之间的CPU时间与墙钟时间之比计算，首次采样为0。
/// 非Linux平台上所有值为0。
pub struct ResourceMonitor {
    last_cpu: Mutex<Option<(Instant, f64)>>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            last_cpu: Mutex::new(None),
        }
    }

    pub fn sample(&self) -> ResourceSample {
        let memory_mb = Self::resident_memory_mb().unwrap_or(0.0);
        let mem_percent = Self::total_memory_mb()
            .filter(|total| *total > 0.0)
            .map(|total| memory_mb / total * 100.0)
            .unwrap_or(0.0);
        let cpu_percent = self.cpu_percent();
        let sample = ResourceSample {
            memory_mb,
            mem_percent,
            cpu_percent,
        };
        debug!(?sample, "资源采样");
        sample
    }

    fn cpu_percent(&self) -> f64 {
        let Some(cpu_seconds) = Self::process_cpu_seconds() else {
            return 0.0;
        };
        let now = Instant::now();
        let Ok(mut last) = self.last_cpu.lock() else {
            return 0.0;
        };
        let percent = match *last {
            Some((at, previous)) => {
                let wall = now.duration_since(at).as_secs_f64();
                if wall > 0.0 {
                    ((cpu_seconds - previous) / wall * 100.0).max(0.0)
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *last = Some((now, cpu_seconds));
        percent
    }

    #[cfg(target_os = "linux")]
    fn resident_memory_mb() -> Option<f64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_kb_field(&status, "VmRSS:").map(|kb| kb / 1024.0)
    }

    #[cfg(target_os = "linux")]
    fn total_memory_mb() -> Option<f64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_kb_field(&meminfo, "MemTotal:").map(|kb| kb / 1024.0)
    }

    /// utime + stime，按常见的100 ticks/s换算
    #[cfg(target_os = "linux")]
    fn process_cpu_seconds() -> Option<f64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // 进程名可能包含空格，从最后一个右括号之后开始解析
        let rest = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: f64 = fields.get(11)?.parse().ok()?;
        let stime: f64 = fields.get(12)?.parse().ok()?;
        Some((utime + stime) / 100.0)
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_memory_mb() -> Option<f64> {
        None
    }

    #[cfg(not(target_os = "linux"))]
    fn total_memory_mb() -> Option<f64> {
        None
    }

    #[cfg(not(target_os = "linux"))]
    fn process_cpu_seconds() -> Option<f64> {
        None
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_kb_field(text: &str, field: &str) -> Option<f64> {
    text.lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse::<f64>().ok())
}
