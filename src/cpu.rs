use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// f64 stored as bits in an `AtomicU64`.
#[derive(Debug, Default)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(v: f64) -> Self {
        Self(AtomicU64::new(v.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::SeqCst)
    }

    /// CAS loop applying `f`; `f` returning `None` aborts without writing.
    /// Returns the value that was replaced.
    pub fn fetch_update<F>(&self, mut f: F) -> Result<f64, f64>
    where
        F: FnMut(f64) -> Option<f64>,
    {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                f(f64::from_bits(bits)).map(f64::to_bits)
            })
            .map(f64::from_bits)
            .map_err(f64::from_bits)
    }

    pub fn fetch_add(&self, delta: f64) -> f64 {
        // the closure never aborts
        match self.fetch_update(|v| Some(v + delta)) {
            Ok(v) | Err(v) => v,
        }
    }
}

/// Source of node-wide CPU idle measurements.
pub trait CpuSampler: Send + 'static {
    fn num_cpus(&self) -> f64;

    /// Idle capacity in core-equivalents over the period since the previous call.
    fn sample_idle(&mut self) -> io::Result<f64>;
}

/// Linux `/proc/stat` sampler.
pub struct ProcStatSampler {
    num_cpus: usize,
    last: Option<(u64, u64)>,
}

impl ProcStatSampler {
    pub fn new() -> Self {
        Self {
            num_cpus: num_cpus::get(),
            last: None,
        }
    }

    fn read_totals() -> io::Result<(u64, u64)> {
        let stat = std::fs::read_to_string("/proc/stat")?;
        parse_cpu_line(&stat).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "no aggregate cpu line in /proc/stat")
        })
    }
}

impl Default for ProcStatSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns `(idle, total)` jiffies from the aggregate `cpu` line.
fn parse_cpu_line(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    // guest time is already accounted in user/nice
    let total = fields.iter().take(8).sum();
    Some((idle, total))
}

impl CpuSampler for ProcStatSampler {
    fn num_cpus(&self) -> f64 {
        self.num_cpus as f64
    }

    fn sample_idle(&mut self) -> io::Result<f64> {
        let (idle, total) = Self::read_totals()?;
        let (prev_idle, prev_total) = self.last.replace((idle, total)).unwrap_or((0, 0));
        let d_total = total.saturating_sub(prev_total);
        if d_total == 0 {
            return Ok(self.num_cpus());
        }
        let d_idle = idle.saturating_sub(prev_idle);
        Ok(d_idle as f64 / d_total as f64 * self.num_cpus())
    }
}

struct CpuStatsInner {
    idle: AtomicF64,
}

/// Periodically refreshed idle-capacity reading.
pub struct CpuStats {
    inner: Arc<CpuStatsInner>,
    task: JoinHandle<()>,
}

impl CpuStats {
    /// Takes one sample synchronously, then keeps sampling every `interval`,
    /// calling `on_sample` with each new idle value.
    pub fn start<S, F>(mut sampler: S, interval: Duration, on_sample: F) -> io::Result<Self>
    where
        S: CpuSampler,
        F: Fn(f64) + Send + 'static,
    {
        let first = sampler.sample_idle()?;
        let inner = Arc::new(CpuStatsInner {
            idle: AtomicF64::new(first),
        });
        on_sample(first);

        let shared = inner.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match sampler.sample_idle() {
                    Ok(idle) => {
                        shared.idle.store(idle);
                        on_sample(idle);
                    }
                    Err(e) => log::warn!("failed to sample cpu stats: {}", e),
                }
            }
        });

        Ok(Self { inner, task })
    }

    pub fn cpu_idle(&self) -> f64 {
        self.inner.idle.load()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for CpuStats {
    fn drop(&mut self) {
        self.task.abort();
    }
}
