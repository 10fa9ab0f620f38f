//! CPU-cost admission control.
//!
//! Each ingress kind carries a configured cost in core-equivalents. An ingress
//! is admitted while the sampled idle capacity minus recent reservations stays
//! strictly above its cost. A reservation lives for one hold period, long
//! enough for the next CPU sample to reflect the new load.

use crate::config::CpuCostConfig;
use crate::cpu::{AtomicF64, CpuSampler, CpuStats};
use crate::errors::{IngressError, Result};
use crate::ingress::{IngressInfo, InputType};
use crate::metrics::NodeMetrics;
use std::sync::Arc;
use std::time::Duration;

const MIN_RTMP_CPU_COST: f64 = 1.0;
const MIN_WHIP_CPU_COST: f64 = 1.0;
const MIN_WHIP_BYPASS_CPU_COST: f64 = 0.05;

const RECOMMENDED_RTMP_CPU_COST: f64 = 2.0;
const RECOMMENDED_WHIP_CPU_COST: f64 = 2.0;
const RECOMMENDED_WHIP_BYPASS_CPU_COST: f64 = 0.1;
const RECOMMENDED_MIN_CPUS: f64 = 3.0;

pub struct Monitor {
    costs: CpuCostConfig,
    max_cost: f64,
    reservation_hold: Duration,
    stats: Arc<CpuStats>,
    pending: Arc<AtomicF64>,
    metrics: NodeMetrics,
}

impl Monitor {
    /// Validates the cost table against this node and starts sampling.
    /// Fails when the node could never admit even the cheapest ingress.
    pub fn start<S: CpuSampler>(
        costs: &CpuCostConfig,
        sampler: S,
        metrics: NodeMetrics,
    ) -> Result<Self> {
        let num_cpus = sampler.num_cpus();
        let max_cost = check_config(costs, num_cpus)?;

        let pending = Arc::new(AtomicF64::new(0.0));
        let stats = {
            let pending = pending.clone();
            let metrics = metrics.clone();
            CpuStats::start(sampler, costs.sample_interval(), move |idle| {
                let load = if num_cpus > 0.0 {
                    (num_cpus - idle) / num_cpus * 100.0
                } else {
                    0.0
                };
                metrics.cpu_load.set(load);
                publish_available(&metrics, idle, pending.load(), max_cost);
            })?
        };

        Ok(Self {
            costs: costs.clone(),
            max_cost,
            reservation_hold: costs.reservation_hold(),
            stats: Arc::new(stats),
            pending,
            metrics,
        })
    }

    pub fn stop(&self) {
        self.stats.stop();
    }

    pub fn max_cost(&self) -> f64 {
        self.max_cost
    }

    /// Whether the node has room for an ingress of any kind.
    pub fn can_accept_any(&self) -> bool {
        self.available_capacity() > self.max_cost
    }

    /// Idle core-equivalents not yet claimed by a reservation.
    pub fn available_capacity(&self) -> f64 {
        self.stats.cpu_idle() - self.pending.load()
    }

    pub fn cost_of(&self, info: &IngressInfo) -> f64 {
        match info.input_type {
            InputType::Rtmp => self.costs.rtmp_cpu_cost,
            InputType::Whip if info.bypass_transcoding => {
                self.costs.whip_bypass_transcoding_cpu_cost
            }
            InputType::Whip => self.costs.whip_cpu_cost,
        }
    }

    /// Reserves capacity for `info` if it fits. Never blocks.
    pub fn try_admit(&self, info: &IngressInfo) -> bool {
        let cost = self.cost_of(info);
        let idle = self.stats.cpu_idle();
        let admitted = self
            .pending
            .fetch_update(|pending| {
                if idle - pending > cost {
                    Some(pending + cost)
                } else {
                    None
                }
            })
            .is_ok();

        publish_available(&self.metrics, idle, self.pending.load(), self.max_cost);

        if admitted {
            let stats = self.stats.clone();
            let pending = self.pending.clone();
            let metrics = self.metrics.clone();
            let (hold, max_cost) = (self.reservation_hold, self.max_cost);
            tokio::spawn(async move {
                tokio::time::sleep(hold).await;
                pending.fetch_add(-cost);
                publish_available(&metrics, stats.cpu_idle(), pending.load(), max_cost);
            });
        } else {
            log::info!(
                "rejecting {} ingress {}: idle {:.2}, pending {:.2}, cost {:.2}",
                info.input_type,
                info.ingress_id,
                idle,
                self.pending.load(),
                cost
            );
        }

        let result = if admitted { "accepted" } else { "rejected" };
        self.metrics
            .admissions_total
            .with_label_values(&[info.input_type.label(), result])
            .inc();
        admitted
    }

    pub fn ingress_started(&self, info: &IngressInfo) {
        self.metrics
            .requests
            .with_label_values(&[info.input_type.label(), info.transcoding_label()])
            .inc();
    }

    pub fn ingress_ended(&self, info: &IngressInfo) {
        self.metrics
            .requests
            .with_label_values(&[info.input_type.label(), info.transcoding_label()])
            .dec();
    }
}

fn publish_available(metrics: &NodeMetrics, idle: f64, pending: f64, max_cost: f64) {
    metrics.available.set((idle - pending > max_cost) as i64);
}

/// Returns the largest configured cost.
fn check_config(costs: &CpuCostConfig, num_cpus: f64) -> Result<f64> {
    if costs.rtmp_cpu_cost < MIN_RTMP_CPU_COST {
        log::warn!(
            "rtmp cpu cost {} is below the minimum {}, recommended value is {}",
            costs.rtmp_cpu_cost,
            MIN_RTMP_CPU_COST,
            RECOMMENDED_RTMP_CPU_COST
        );
    }
    if costs.whip_cpu_cost < MIN_WHIP_CPU_COST {
        log::warn!(
            "whip cpu cost {} is below the minimum {}, recommended value is {}",
            costs.whip_cpu_cost,
            MIN_WHIP_CPU_COST,
            RECOMMENDED_WHIP_CPU_COST
        );
    }
    if costs.whip_bypass_transcoding_cpu_cost < MIN_WHIP_BYPASS_CPU_COST {
        log::warn!(
            "whip bypass transcoding cpu cost {} is below the minimum {}, recommended value is {}",
            costs.whip_bypass_transcoding_cpu_cost,
            MIN_WHIP_BYPASS_CPU_COST,
            RECOMMENDED_WHIP_BYPASS_CPU_COST
        );
    }

    let all = [
        costs.rtmp_cpu_cost,
        costs.whip_cpu_cost,
        costs.whip_bypass_transcoding_cpu_cost,
    ];
    if all.iter().any(|c| !c.is_finite() || *c <= 0.0) {
        return Err(IngressError::CapacityMisconfigured {
            message: format!("cpu costs must be positive, got {:?}", all),
        });
    }
    let max_cost = all.iter().copied().fold(f64::MIN, f64::max);
    let min_cost = all.iter().copied().fold(f64::MAX, f64::min);

    if num_cpus < min_cost {
        log::error!(
            "not enough cpu for any ingress: {} cpus, minimum cost {}",
            num_cpus,
            min_cost
        );
        return Err(IngressError::CapacityMisconfigured {
            message: format!(
                "{} cpus available, cheapest ingress needs {}",
                num_cpus, min_cost
            ),
        });
    }
    if num_cpus < max_cost {
        log::error!(
            "not enough cpu for some ingress types: {} cpus, max cost {}, recommended minimum {}",
            num_cpus,
            max_cost,
            max_cost.max(RECOMMENDED_MIN_CPUS)
        );
    }

    log::info!(
        "admission monitor: {} cpus, rtmp cost {}, whip cost {}, whip bypass cost {}",
        num_cpus,
        costs.rtmp_cpu_cost,
        costs.whip_cpu_cost,
        costs.whip_bypass_transcoding_cpu_cost
    );
    Ok(max_cost)
}
