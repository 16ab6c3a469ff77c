//! Unit tests for the connection pool

use super::*;
use crate::testing::{test_key_file, MockConnector};
use futures::future::join_all;
use std::path::PathBuf;
use tempfile::TempDir;

const MASTER: &str = "10.0.0.1";
const AGENT: &str = "10.0.3.17";

struct Fixture {
    connector: Arc<MockConnector>,
    pool: ConnectionPool,
    key: PathBuf,
    _dir: TempDir,
}

fn fixture(connector: MockConnector) -> Fixture {
    fixture_with_config(connector, PoolConfig::default())
}

fn fixture_with_config(connector: MockConnector, config: PoolConfig) -> Fixture {
    let connector = Arc::new(connector);
    let factory = TransportFactory::new(connector.clone());
    let pool = ConnectionPool::new(factory, Arc::new(MASTER.to_string()), config);
    let (dir, key) = test_key_file();
    Fixture {
        connector,
        pool,
        key,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_get_reuses_pooled_transport() {
    let f = fixture(MockConnector::new());

    let first = f.pool.get(MASTER, "core", &f.key).await.unwrap();
    let second = f.pool.get(MASTER, "core", &f.key).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(f.connector.connects(), 1);
    assert_eq!(f.connector.auth_attempts(), 1);
    assert_eq!(f.pool.len().await, 1);
}

#[tokio::test]
async fn test_usernames_are_pooled_separately() {
    let f = fixture(MockConnector::new());

    let core = f.pool.get(MASTER, "core", &f.key).await.unwrap();
    let root = f.pool.get(MASTER, "root", &f.key).await.unwrap();

    assert!(!Arc::ptr_eq(&core, &root));
    assert!(f.pool.contains(&PoolKey::new(MASTER, "core")).await);
    assert!(f.pool.contains(&PoolKey::new(MASTER, "root")).await);
    assert_eq!(f.pool.len().await, 2);
}

#[tokio::test]
async fn test_dead_transport_is_evicted_and_closed_once() {
    let f = fixture(MockConnector::new());

    let first = f.pool.get(MASTER, "core", &f.key).await.unwrap();
    let stale = f.connector.created_for(MASTER).remove(0);
    stale.set_active(false);

    let second = f.pool.get(MASTER, "core", &f.key).await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.is_active());
    assert_eq!(stale.close_count(), 1);
    assert_eq!(f.connector.connects(), 2);
    assert_eq!(f.pool.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_gets_authenticate_once() {
    let f = fixture(MockConnector::new().with_auth_delay(Duration::from_millis(200)));

    let results = join_all((0..8).map(|_| f.pool.get(MASTER, "core", &f.key))).await;
    let transports: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(f.connector.connects(), 1);
    assert_eq!(f.connector.auth_attempts(), 1);
    for transport in &transports[1..] {
        assert!(Arc::ptr_eq(&transports[0], transport));
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_agents_share_one_control_transport() {
    let f = fixture(MockConnector::new().with_auth_delay(Duration::from_millis(50)));
    let agents = ["10.0.3.1", "10.0.3.2", "10.0.3.3", "10.0.3.1"];

    let results = join_all(agents.iter().map(|host| f.pool.get(host, "core", &f.key))).await;
    for result in results {
        assert!(result.unwrap().info().is_proxied());
    }

    assert_eq!(f.connector.connects(), 1);
    assert_eq!(f.connector.tunnels(), 3);
    assert_eq!(f.connector.created_for(MASTER).len(), 1);
    assert_eq!(f.pool.len().await, 4);
}

#[tokio::test]
async fn test_agent_is_reached_through_control_node() {
    let f = fixture(MockConnector::new());

    let agent = f.pool.get(AGENT, "core", &f.key).await.unwrap();

    assert_eq!(agent.info().jump_host.as_deref(), Some(MASTER));
    assert!(agent.is_authenticated());
    assert!(f.pool.contains(&PoolKey::new(MASTER, "core")).await);

    // The control transport was created first and is reused afterwards.
    let created = f.connector.created();
    assert_eq!(created[0].info().host, MASTER);
    assert_eq!(created[1].info().host, AGENT);

    f.pool.get(MASTER, "core", &f.key).await.unwrap();
    assert_eq!(f.connector.connects(), 1);
}

#[tokio::test]
async fn test_control_node_is_never_proxied() {
    let f = fixture(MockConnector::new());

    let master = f.pool.get(MASTER, "core", &f.key).await.unwrap();

    assert!(!master.info().is_proxied());
    assert_eq!(f.connector.tunnels(), 0);
}

#[tokio::test]
async fn test_dead_control_transport_is_replaced_for_agents() {
    let f = fixture(MockConnector::new());

    f.pool.get(AGENT, "core", &f.key).await.unwrap();
    let old_master = f.connector.created_for(MASTER).remove(0);
    let old_agent = f.connector.created_for(AGENT).remove(0);
    old_master.set_active(false);

    let agent = f.pool.get(AGENT, "core", &f.key).await.unwrap();

    assert!(agent.is_active());
    assert_eq!(old_agent.close_count(), 1);
    assert_eq!(old_master.close_count(), 1);
    assert_eq!(f.connector.connects(), 2);
    assert_eq!(f.connector.tunnels(), 2);
}

#[tokio::test]
async fn test_control_auth_failure_aborts_agent() {
    let f = fixture(MockConnector::new().reject_host(MASTER));

    let err = f.pool.get(AGENT, "core", &f.key).await.unwrap_err();

    match err {
        TransportError::Authentication { host, username, .. } => {
            assert_eq!(host, MASTER);
            assert_eq!(username, "core");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(f.connector.tunnels(), 0);
    assert!(f.connector.created_for(AGENT).is_empty());
    assert!(f.pool.is_empty().await);
}

#[tokio::test]
async fn test_agent_auth_failure_keeps_control_transport() {
    let f = fixture(MockConnector::new().reject_host(AGENT));

    let err = f.pool.get(AGENT, "core", &f.key).await.unwrap_err();

    assert!(err.is_authentication());
    assert!(f.pool.contains(&PoolKey::new(MASTER, "core")).await);
    assert!(!f.pool.contains(&PoolKey::new(AGENT, "core")).await);
    assert_eq!(f.connector.created_for(AGENT)[0].close_count(), 1);
}

#[tokio::test]
async fn test_invalid_key_fails_before_connecting() {
    let f = fixture(MockConnector::new());
    let missing = f.key.with_file_name("does_not_exist");

    let err = f.pool.get(MASTER, "core", &missing).await.unwrap_err();

    assert!(matches!(err, TransportError::Credential { .. }));
    assert_eq!(f.connector.connects(), 0);
    assert!(f.pool.is_empty().await);
}

#[tokio::test]
async fn test_unreachable_agent_is_not_pooled() {
    let f = fixture(MockConnector::new().unreachable(AGENT));

    let err = f.pool.get(AGENT, "core", &f.key).await.unwrap_err();

    assert!(err.is_connection());
    assert!(!f.pool.contains(&PoolKey::new(AGENT, "core")).await);
    assert_eq!(f.pool.len().await, 1);
}

#[tokio::test]
async fn test_unresolvable_control_node() {
    struct NoLeader;

    #[async_trait]
    impl ControlNode for NoLeader {
        async fn address(&self) -> Result<String, TransportError> {
            Err(TransportError::Topology("no leader elected".to_string()))
        }
    }

    let connector = Arc::new(MockConnector::new());
    let pool = ConnectionPool::new(
        TransportFactory::new(connector.clone()),
        Arc::new(NoLeader),
        PoolConfig::default(),
    );
    let (_dir, key) = test_key_file();

    let err = pool.get(AGENT, "core", &key).await.unwrap_err();

    assert!(matches!(err, TransportError::Topology(_)));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_timeout() {
    let config = PoolConfig::default().with_acquire_timeout(Some(Duration::from_secs(1)));
    let f = fixture_with_config(
        MockConnector::new().with_connect_delay(Duration::from_secs(120)),
        config,
    );

    let err = f.pool.get(MASTER, "core", &f.key).await.unwrap_err();

    assert!(matches!(err, TransportError::Timeout(limit) if limit == Duration::from_secs(1)));
    assert!(f.pool.is_empty().await);
}

#[tokio::test]
async fn test_purge_single_key() {
    let f = fixture(MockConnector::new());
    f.pool.get(AGENT, "core", &f.key).await.unwrap();

    let closed = f.pool.purge(Some(&PoolKey::new(AGENT, "core"))).await.unwrap();

    assert_eq!(closed, 1);
    assert_eq!(f.connector.created_for(AGENT)[0].close_count(), 1);
    assert!(!f.connector.created_for(MASTER)[0].is_closed());
    assert!(f.pool.contains(&PoolKey::new(MASTER, "core")).await);

    let closed = f.pool.purge(Some(&PoolKey::new("10.9.9.9", "core"))).await.unwrap();
    assert_eq!(closed, 0);
}

#[tokio::test]
async fn test_evict_replaces_only_the_given_transport() {
    let f = fixture(MockConnector::new());
    let first = f.pool.get(MASTER, "core", &f.key).await.unwrap();

    assert!(f.pool.evict(&first).await.unwrap());
    assert!(first.is_closed());
    assert!(!f.pool.contains(&PoolKey::new(MASTER, "core")).await);

    let second = f.pool.get(MASTER, "core", &f.key).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    // A late eviction of the old handle leaves the replacement alone.
    assert!(!f.pool.evict(&first).await.unwrap());
    assert!(!second.is_closed());
    assert_eq!(f.connector.created_for(MASTER)[0].close_count(), 1);
}

#[tokio::test]
async fn test_purge_all_then_reconnect() {
    let f = fixture(MockConnector::new());
    f.pool.get(AGENT, "core", &f.key).await.unwrap();

    let closed = f.pool.purge(None).await.unwrap();

    assert_eq!(closed, 2);
    assert!(f.pool.is_empty().await);
    for transport in f.connector.created() {
        assert_eq!(transport.close_count(), 1);
    }

    f.pool.get(AGENT, "core", &f.key).await.unwrap();
    assert_eq!(f.connector.connects(), 2);
    assert_eq!(f.pool.len().await, 2);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let f = fixture(MockConnector::new());
    f.pool.get(MASTER, "core", &f.key).await.unwrap();
    f.pool.get(AGENT, "core", &f.key).await.unwrap();

    assert_eq!(f.pool.shutdown().await.unwrap(), 2);
    assert!(f.connector.created().iter().all(|t| t.is_closed()));
    assert_eq!(f.pool.shutdown().await.unwrap(), 0);
}

#[tokio::test]
async fn test_drop_closes_pooled_transports() {
    let f = fixture(MockConnector::new());
    f.pool.get(AGENT, "core", &f.key).await.unwrap();
    let connector = f.connector.clone();

    drop(f);

    for transport in connector.created() {
        assert_eq!(transport.close_count(), 1);
    }
}

#[tokio::test]
async fn test_stats() {
    let f = fixture(MockConnector::new());
    assert_eq!(f.pool.stats().await, PoolStats::default());

    f.pool.get(AGENT, "core", &f.key).await.unwrap();

    let stats = f.pool.stats().await;
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.authenticated, 2);
    assert_eq!(stats.proxied, 1);
    assert_eq!(stats.in_flight, 0);
}
