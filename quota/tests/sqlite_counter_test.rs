use std::sync::Arc;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use uuid::Uuid;

use corelib::models::Resource;
use quota::{CounterKey, CounterStore, Period, SqliteCounterStore};

async fn setup_pool() -> AnyPool {
    sqlx::any::install_default_drivers();

    let db_name = Uuid::new_v4().to_string();
    let conn = format!("sqlite:file:{db_name}?mode=memory&cache=shared");

    AnyPoolOptions::new()
        .max_connections(5)
        .connect(&conn)
        .await
        .expect("connect sqlite memory db")
}

fn key(tenant_id: Uuid) -> CounterKey {
    CounterKey {
        tenant_id,
        resource: Resource::ApiCalls,
        period: Period::Hour,
        period_start_s: 1_710_507_600,
    }
}

#[tokio::test]
async fn conditional_increment_enforces_the_limit_in_sql() {
    let store = SqliteCounterStore::new(setup_pool().await).await.unwrap();
    let k = key(Uuid::new_v4());

    assert_eq!(store.try_increment(&k, 999, Some(1000)).await.unwrap(), Some(999));
    assert_eq!(store.try_increment(&k, 1, Some(1000)).await.unwrap(), Some(1000));
    assert_eq!(store.try_increment(&k, 1, Some(1000)).await.unwrap(), None);
    assert_eq!(store.get(&k).await.unwrap(), 1000);
}

#[tokio::test]
async fn unlimited_increment_and_saturating_decrement() {
    let store = SqliteCounterStore::new(setup_pool().await).await.unwrap();
    let k = key(Uuid::new_v4());

    assert_eq!(store.try_increment(&k, 7, None).await.unwrap(), Some(7));
    store.decrement(&k, 100).await.unwrap();
    assert_eq!(store.get(&k).await.unwrap(), 0);
}

#[tokio::test]
async fn counters_are_isolated_by_key() {
    let store = SqliteCounterStore::new(setup_pool().await).await.unwrap();
    let a = key(Uuid::new_v4());
    let mut b = key(Uuid::new_v4());
    b.period = Period::Day;
    b.period_start_s = 1_710_460_800;

    store.try_increment(&a, 5, None).await.unwrap();
    store.try_increment(&b, 9, None).await.unwrap();

    assert_eq!(store.get(&a).await.unwrap(), 5);
    assert_eq!(store.get(&b).await.unwrap(), 9);
}

#[tokio::test]
async fn concurrent_sql_reserves_at_the_boundary_admit_exactly_one() {
    let store = Arc::new(SqliteCounterStore::new(setup_pool().await).await.unwrap());
    let k = key(Uuid::new_v4());
    store.try_increment(&k, 999, Some(1000)).await.unwrap();

    let a = {
        let store = store.clone();
        tokio::spawn(async move { store.try_increment(&k, 1, Some(1000)).await.unwrap() })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move { store.try_increment(&k, 1, Some(1000)).await.unwrap() })
    };

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert!(a.is_some() ^ b.is_some(), "exactly one admission must win");
    assert_eq!(store.get(&k).await.unwrap(), 1000);
}
