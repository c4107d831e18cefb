//! Protocol manager: dispatches operations to the pool for a device's
//! protocol. Built once at startup; the map never mutates afterwards, so
//! lookups are lock-free.

use crate::adapters::factory;
use crate::config::Config;
use crate::conn_pool::{AdapterFactory, ConnectionPool, PoolStats};
use crate::errors::PoolError;
use crate::model::{DataPoint, Device, Protocol, Tag, TagValue};
use crate::point_pool::PointPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pool key: Modbus TCP and RTU share the `modbus` pool and its config
fn pool_label(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::ModbusTcp | Protocol::ModbusRtu => "modbus",
        Protocol::Opcua => "opcua",
        Protocol::S7 => "s7",
    }
}

pub struct ProtocolManager {
    pools: HashMap<&'static str, Arc<ConnectionPool>>,
}

impl ProtocolManager {
    /// Build one pool per protocol from the service config
    pub fn new(config: &Config, points: Arc<PointPool>) -> Self {
        let mut pools = HashMap::new();

        let make_factory = |config: Config, points: Arc<PointPool>| -> AdapterFactory {
            Box::new(move |device| factory::create_adapter(device, &config, points.clone()))
        };

        pools.insert(
            "modbus",
            Arc::new(ConnectionPool::new(
                "modbus",
                config.modbus.clone(),
                make_factory(config.clone(), points.clone()),
            )),
        );
        pools.insert(
            "opcua",
            Arc::new(ConnectionPool::new(
                "opcua",
                config.opcua.pool.clone(),
                make_factory(config.clone(), points.clone()),
            )),
        );
        pools.insert(
            "s7",
            Arc::new(ConnectionPool::new(
                "s7",
                config.s7.clone(),
                make_factory(config.clone(), points),
            )),
        );

        Self { pools }
    }

    /// Assemble a manager from pre-built pools, keyed by their labels
    pub fn from_pools(pools: Vec<Arc<ConnectionPool>>) -> Self {
        Self {
            pools: pools.into_iter().map(|p| (p.label(), p)).collect(),
        }
    }

    fn pool(&self, protocol: Protocol) -> &Arc<ConnectionPool> {
        self.pools
            .get(pool_label(protocol))
            .expect("pools populated for every protocol at construction")
    }

    pub async fn read_tags(
        &self,
        device: &Arc<Device>,
        tags: &[Tag],
    ) -> Result<Vec<DataPoint>, PoolError> {
        self.pool(device.protocol).read_tags(device, tags).await
    }

    pub async fn write_tag(
        &self,
        device: &Arc<Device>,
        tag: &Tag,
        value: &TagValue,
    ) -> Result<(), PoolError> {
        self.pool(device.protocol).write_tag(device, tag, value).await
    }

    /// Start reaper/health-check loops on every pool
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.pools
            .values()
            .flat_map(|p| p.spawn_maintenance(shutdown.clone()))
            .collect()
    }

    pub async fn stats(&self) -> Vec<PoolStats> {
        let mut out = Vec::with_capacity(self.pools.len());
        for pool in self.pools.values() {
            out.push(pool.stats().await);
        }
        out.sort_by(|a, b| a.protocol.cmp(&b.protocol));
        out
    }

    pub async fn close_all(&self) {
        for pool in self.pools.values() {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_labels() {
        assert_eq!(pool_label(Protocol::ModbusTcp), "modbus");
        assert_eq!(pool_label(Protocol::ModbusRtu), "modbus");
        assert_eq!(pool_label(Protocol::Opcua), "opcua");
        assert_eq!(pool_label(Protocol::S7), "s7");
    }

    #[tokio::test]
    async fn test_manager_builds_all_pools() {
        let manager = ProtocolManager::new(&Config::default(), Arc::new(PointPool::new(16)));
        let stats = manager.stats().await;
        let names: Vec<&str> = stats.iter().map(|s| s.protocol.as_str()).collect();
        assert_eq!(names, vec!["modbus", "opcua", "s7"]);
    }
}
