/*
 * Created on Sun Apr 21 2024
 *
 * This file is a part of Sable
 * Sable is a free and open-source Redis-compatible client runtime written
 * by Sayan Nandan ("the Author") with the vision to provide a fast, correct
 * and fully pipelined way to talk to modern key/value servers.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use {
    super::ConnectionPool,
    crate::{
        cluster::{self, ClusterRouter, NodeId},
        config::{CapacityMode, ClientConfig, RetryBackoff},
        error::Error,
        protocol::{resp3::Resp3Value, CommandToken},
        util::test_utils::{StubOptions, StubServer},
    },
    bytes::Bytes,
    std::time::{Duration, Instant},
    tokio::{net::TcpListener, time},
};

fn pool_config(server: &StubServer) -> ClientConfig {
    ClientConfig::new(server.node())
        .retry_timeout(Duration::from_secs(2))
        .retry_backoff(RetryBackoff::new(Duration::from_millis(10), 2))
}

async fn wait_for_idle(pool: &ConnectionPool, count: usize) {
    for _ in 0..400 {
        if pool.idle_count() >= count {
            return;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pool never reached {count} idle connections");
}

/// A port with nothing listening behind it
async fn dead_node() -> NodeId {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    NodeId::new(addr.ip().to_string(), addr.port())
}

#[tokio::test]
async fn empty_target_set_is_refused() {
    assert!(matches!(
        ConnectionPool::new(ClientConfig::default()),
        Err(Error::NoAvailableConnectionTargets)
    ));
}

#[tokio::test]
async fn lease_executes_and_returns() {
    let server = StubServer::start().await;
    let pool = ConnectionPool::new(pool_config(&server)).unwrap();
    let conn = pool.lease().await.unwrap();
    let reply = conn
        .execute(CommandToken::new("SET").arg("x").arg("1"))
        .await
        .unwrap();
    assert_eq!(
        reply,
        Resp3Value::SimpleString(Bytes::from_static(b"OK"))
    );
    let id = conn.id();
    drop(conn);
    wait_for_idle(&pool, 1).await;
    // the same physical connection is leased again
    let again = pool.lease().await.unwrap();
    assert_eq!(again.id(), id);
    drop(again);
    pool.close();
}

#[tokio::test]
async fn strict_capacity_times_out_then_recovers() {
    let server = StubServer::start().await;
    let config = pool_config(&server)
        .capacity_mode(CapacityMode::StrictMax(2))
        .retry_timeout(Duration::from_millis(50));
    let pool = ConnectionPool::new(config).unwrap();
    let l1 = pool.lease().await.unwrap();
    let l2 = pool.lease().await.unwrap();
    assert_eq!(pool.leased_count(), 2);
    // both held: a third caller must park and then time out
    let start = Instant::now();
    match pool.lease().await {
        Err(Error::TimedOutWaitingForConnection) => {}
        other => panic!("expected a lease timeout, got {other:?}"),
    }
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(40), "waited {waited:?}");
    assert!(waited < Duration::from_secs(1), "waited {waited:?}");
    // as soon as one lease returns, the next caller is served at once
    drop(l1);
    let l3 = pool.lease().await.unwrap();
    assert_eq!(pool.leased_count(), 2);
    drop(l2);
    drop(l3);
    pool.close();
}

#[tokio::test]
async fn waiter_is_woken_by_a_returned_lease() {
    let server = StubServer::start().await;
    let config = pool_config(&server).capacity_mode(CapacityMode::StrictMax(1));
    let pool = ConnectionPool::new(config).unwrap();
    let l1 = pool.lease().await.unwrap();
    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.lease().await.map(|l| l.id()) });
    time::sleep(Duration::from_millis(50)).await;
    let freed_id = l1.id();
    drop(l1);
    let woken_id = waiter.await.unwrap().unwrap();
    assert_eq!(woken_id, freed_id);
    pool.close();
}

#[tokio::test]
async fn preserved_mode_caps_idle_not_load() {
    let server = StubServer::start().await;
    let config = pool_config(&server).capacity_mode(CapacityMode::PreservedMax(1));
    let pool = ConnectionPool::new(config).unwrap();
    let l1 = pool.lease().await.unwrap();
    // a pinned lease beyond capacity opens a transient connection
    let l2 = pool.lease_to(&server.node()).await.unwrap();
    assert_ne!(l1.id(), l2.id());
    drop(l2); // idle has room: banked
    wait_for_idle(&pool, 1).await;
    drop(l1); // idle is full: closed instead
    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.idle_count(), 1);
    pool.close();
}

#[tokio::test]
async fn minimum_connections_floor_is_kept() {
    let server = StubServer::start().await;
    let config = pool_config(&server)
        .minimum_connections(2)
        .capacity_mode(CapacityMode::StrictMax(4));
    let pool = ConnectionPool::new(config).unwrap();
    wait_for_idle(&pool, 2).await;
    // kill one connection out from under the pool and watch it replace it
    let conn = pool.lease().await.unwrap();
    let _ = conn.dispatch(CommandToken::new("BYE"));
    for _ in 0..200 {
        if !conn.is_ready() {
            break;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!conn.is_ready());
    drop(conn);
    wait_for_idle(&pool, 2).await;
    pool.close();
}

#[tokio::test]
async fn unreachable_target_backs_off_until_the_deadline() {
    let node = dead_node().await;
    let config = ClientConfig::new(node)
        .retry_backoff(RetryBackoff::new(Duration::from_millis(5), 2))
        .retry_timeout(Duration::from_millis(150));
    let pool = ConnectionPool::new(config).unwrap();
    let start = Instant::now();
    match pool.lease().await {
        Err(Error::TimedOutWaitingForConnection) => {}
        other => panic!("expected a lease timeout, got {other:?}"),
    }
    assert!(start.elapsed() >= Duration::from_millis(140));
    pool.close();
}

#[tokio::test]
async fn backoff_delays_grow_and_reset() {
    let backoff = RetryBackoff::new(Duration::from_millis(100), 2);
    assert_eq!(backoff.delay(1), Duration::from_millis(100));
    assert_eq!(backoff.delay(2), Duration::from_millis(200));
    assert_eq!(backoff.delay(3), Duration::from_millis(400));
    assert_eq!(backoff.delay(10), Duration::from_millis(51_200));
}

#[tokio::test]
async fn closed_pool_fails_waiters_and_new_leases() {
    let server = StubServer::start().await;
    let config = pool_config(&server).capacity_mode(CapacityMode::StrictMax(1));
    let pool = ConnectionPool::new(config).unwrap();
    let l1 = pool.lease().await.unwrap();
    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.lease().await });
    time::sleep(Duration::from_millis(50)).await;
    pool.close();
    assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
    assert!(matches!(pool.lease().await, Err(Error::PoolClosed)));
    // the leased connection still works until returned
    assert!(l1.execute(CommandToken::new("PING")).await.is_ok());
    drop(l1);
}

#[tokio::test]
async fn target_updates_steer_future_connects() {
    let server_a = StubServer::start().await;
    let server_b = StubServer::start().await;
    let pool = ConnectionPool::new(pool_config(&server_a)).unwrap();
    let on_a = pool.lease().await.unwrap();
    assert_eq!(on_a.addr(), &server_a.node());
    pool.update_targets(vec![server_b.node()]);
    // the existing lease keeps serving its caller
    assert!(on_a.execute(CommandToken::new("PING")).await.is_ok());
    drop(on_a);
    // drain the banked connection so the next lease has to dial anew
    let banked = pool.lease().await.unwrap();
    let fresh = pool.lease().await.unwrap();
    assert_eq!(fresh.addr(), &server_b.node());
    drop(banked);
    drop(fresh);
    pool.close();
}

// cluster routing over the pool

#[tokio::test]
async fn moved_redirection_is_chased_and_recorded() {
    let server_b = StubServer::start().await;
    server_b.insert("{user:7}:name", "sayan");
    let slot = cluster::hash_slot(b"{user:7}:name");
    let server_a = StubServer::start_with(StubOptions {
        moved_to: Some((slot, server_b.node().to_string())),
        ..Default::default()
    })
    .await;
    let pool = ConnectionPool::new(pool_config(&server_a)).unwrap();
    let router = ClusterRouter::new();
    let value = cluster::execute_clustered(
        &pool,
        &router,
        b"{user:7}:name",
        CommandToken::new("GET").arg("{user:7}:name"),
    )
    .await
    .unwrap();
    assert_eq!(
        value,
        Resp3Value::BlobString(Bytes::from_static(b"sayan"))
    );
    // the MOVED landed in the routing table
    assert_eq!(
        router.node_for_key(b"{user:7}:name"),
        Some(server_b.node())
    );
    pool.close();
}

#[tokio::test]
async fn cluster_down_is_surfaced() {
    let server = StubServer::start_with(StubOptions {
        cluster_down: true,
        ..Default::default()
    })
    .await;
    let pool = ConnectionPool::new(pool_config(&server)).unwrap();
    let router = ClusterRouter::new();
    match cluster::execute_clustered(&pool, &router, b"k", CommandToken::new("GET").arg("k")).await
    {
        Err(Error::Server(msg)) => assert!(cluster::is_cluster_down(&msg)),
        other => panic!("expected CLUSTERDOWN to surface, got {other:?}"),
    }
    pool.close();
}

#[tokio::test]
async fn keys_sharing_a_tag_share_a_slot() {
    // the §8 shard-affinity scenario, pure and offline
    assert_eq!(
        cluster::hash_slot(b"{user:42}:name"),
        cluster::hash_slot(b"{user:42}:email")
    );
}
