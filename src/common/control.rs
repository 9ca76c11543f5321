// 传输暂停/恢复开关
//
// 全局性的尽力而为控制：上传/下载引擎在每个分片之间检查一次，
// 不承诺打断进行中的单个请求。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct PauseSwitch {
    paused: Arc<AtomicBool>,
}

impl PauseSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("传输已暂停");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("传输已恢复");
    }

    pub fn toggle(&self) {
        if self.is_paused() {
            self.resume();
        } else {
            self.pause();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// 阻塞到开关处于运行状态
    pub async fn wait_ready(&self) {
        while self.is_paused() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_toggle() {
        let switch = PauseSwitch::new();
        assert!(!switch.is_paused());
        switch.toggle();
        assert!(switch.is_paused());
        switch.toggle();
        assert!(!switch.is_paused());
    }

    #[tokio::test]
    async fn test_wait_ready_passes_when_running() {
        let switch = PauseSwitch::new();
        // 未暂停时立即返回
        tokio::time::timeout(Duration::from_millis(50), switch.wait_ready())
            .await
            .unwrap();
    }
}
