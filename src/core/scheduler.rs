//! 延时调度抽象
//!
//! 重连退避与发送节奏都通过 Scheduler 等待，测试时换成 ImmediateScheduler 即可不依赖真实时钟。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 可替换的延时源
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// 生产实现：tokio 定时器
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// 测试实现：记录每次请求的延时并立即返回
#[derive(Debug, Default, Clone)]
pub struct ImmediateScheduler {
    requested: Arc<Mutex<Vec<Duration>>>,
}

impl ImmediateScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 迄今为止请求过的所有延时（按请求顺序）
    pub fn requested(&self) -> Vec<Duration> {
        self.requested
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Scheduler for ImmediateScheduler {
    async fn sleep(&self, delay: Duration) {
        if let Ok(mut v) = self.requested.lock() {
            v.push(delay);
        }
        tokio::task::yield_now().await;
    }
}

/// 延时后执行 task；token 先被取消则 task 不会运行
pub fn schedule_cancellable<F>(
    scheduler: Arc<dyn Scheduler>,
    delay: Duration,
    token: CancellationToken,
    task: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = scheduler.sleep(delay) => {
                if !token.is_cancelled() {
                    task.await;
                }
            }
        }
    })
}
