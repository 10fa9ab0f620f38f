use anyhow::Result;
use chrono::Local;
use std::io::Write;
use std::sync::Arc;
use xingress::cpu::ProcStatSampler;
use xingress::info::{InfoService, RedisInfo};
use xingress::metrics::NodeMetrics;
use xingress::recorder::RecorderFactory;
use xingress::registry::SessionRegistry;
use xingress::service::Service;
use xingress::{ConnectionContext, Manager, Monitor};

#[tokio::main]
async fn main() -> Result<()> {
    let config = xingress::config::get_setting()?;

    let env = env_logger::Env::default()
        .filter_or(env_logger::DEFAULT_FILTER_ENV, config.log_level.clone());
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.module_path().unwrap_or("<unnamed>"),
                &record.args()
            )
        })
        .init();

    log::info!("starting ingress node {}", config.node_id);
    let metrics = NodeMetrics::new(&config.node_id)?;
    // 容量配置错误时直接退出, 不对外宣告可用
    let monitor = Arc::new(Monitor::start(
        &config.cpu_cost,
        ProcStatSampler::new(),
        metrics.clone(),
    )?);

    let info_service: Arc<dyn InfoService> = Arc::new(RedisInfo::new(&config.redis)?);
    let factory = Arc::new(RecorderFactory::new(&config.recorder.data_path));
    let registry = Arc::new(SessionRegistry::new());

    let manager = Manager::new(monitor.clone(), factory, info_service.clone());
    let manager_handle = manager.handle();

    let mut handles = Vec::new();
    handles.push(tokio::spawn(manager.run()));

    #[cfg(feature = "http-health")]
    {
        use xingress::health::{self, AdmissionCheck, HealthChecker, ProtocolErrorCheck};
        if config.health_port != 0 {
            let checker = HealthChecker::new()
                .add_check(Box::new(AdmissionCheck::new(monitor.clone())))
                .add_check(Box::new(ProtocolErrorCheck::new(metrics.clone(), 0.1)));
            let service = health::Service::new(Arc::new(checker), metrics.clone());
            let port = config.health_port;
            handles.push(tokio::spawn(async move {
                if let Err(e) = service.run(port).await {
                    log::error!("health service failed: {}", e);
                }
            }));
        }
    }

    let ctx = ConnectionContext {
        registry,
        info_service,
        manager_handle,
        metrics,
        read_timeout: config.rtmp.read_timeout(),
        sink_capacity: config.rtmp.sink_capacity,
    };
    let port = config.rtmp.port;
    handles.push(tokio::spawn(Service::new(ctx).run(port)));

    for handle in handles {
        handle.await?;
    }
    monitor.stop();
    Ok(())
}
