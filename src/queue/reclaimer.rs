//! 租约回收器
//! 周期扫描租约到期的任务，重新入队或送入死信

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use super::WorkQueue;

/// 启动租约回收循环
///
/// 每个实例都跑一份；结清脚本保证并发回收互不冲突。
pub fn spawn_lease_reclaimer(
    queue: Arc<dyn WorkQueue>,
    queues: Vec<String>,
    check_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(check_interval.max(Duration::from_millis(100)));
        loop {
            ticker.tick().await;

            for name in &queues {
                match queue.reclaim_expired(name).await {
                    Ok(0) => {}
                    Ok(reclaimed) => {
                        info!(queue = %name, reclaimed, "expired leases reclaimed");
                    }
                    Err(e) => {
                        warn!(queue = %name, error = %e, "lease reclaim failed");
                    }
                }
            }
        }
    })
}
