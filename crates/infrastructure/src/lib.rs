pub mod memory;
pub mod notifier;
pub mod observability;
pub mod provider;
pub mod queue;
pub mod resource_monitor;
pub mod sqlite;
pub mod testing;

pub use memory::InMemoryStore;
pub use notifier::{ChannelNotifier, LoggingMailSender, MailSender};
pub use observability::{install_prometheus_exporter, LoggingHook, MetricsCollector, StructuredLogger};
pub use provider::HttpProviderClient;
pub use queue::InMemoryTaskQueue;
pub use resource_monitor::{ResourceMonitor, ResourceSample};
pub use sqlite::SqliteStore;

use std::sync::Arc;

use taskhub_domain::Repositories;
use taskhub_errors::HubResult;

/// 按数据库URL构造存储：`memory://` 为进程内存储，否则为SQLite
pub async fn connect_repositories(
    url: &str,
    max_connections: u32,
    run_migrations: bool,
) -> HubResult<Repositories> {
    if url.starts_with("memory://") {
        return Ok(Repositories::from_store(Arc::new(InMemoryStore::new())));
    }
    let store = SqliteStore::connect(url, max_connections, run_migrations).await?;
    Ok(Repositories::from_store(Arc::new(store)))
}
