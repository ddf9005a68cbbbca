use async_trait::async_trait;

use crate::events::TaskEvent;
use crate::models::Task;

/// 任务迁移提交后调用的钩子，替代隐式的信号回调
///
/// 钩子在事务之外执行，失败不会回滚迁移。
#[async_trait]
pub trait TaskLifecycleHook: Send + Sync {
    fn name(&self) -> &str;

    async fn after_commit(&self, task: &Task, event: &TaskEvent);
}
