use std::collections::{BTreeSet, HashMap};

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use uuid::Uuid;

use corelib::models::Resource;
use registry::{Plan, SqlxTenantDirectory, Tenant, TenantDirectory, TenantStatus};

/// Isolated in-memory DB per test.
/// Unique name prevents test interference during parallel execution;
/// `cache=shared` lets all connections in the pool see the same DB.
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

fn mk_tenant() -> Tenant {
    let mut quota_overrides = HashMap::new();
    quota_overrides.insert(Resource::ApiCalls, 5_000);
    quota_overrides.insert(Resource::Tokens, 2_000_000);

    Tenant {
        id: Uuid::new_v4(),
        name: "acme".to_string(),
        plan: Plan::Enterprise,
        status: TenantStatus::Active,
        weight_override: Some(12),
        data_region: "eu-west-1".to_string(),
        allowed_regions: BTreeSet::from(["eu-west-1".to_string(), "us-east-1".to_string()]),
        quota_overrides,
        fail_open_override: Some(false),
    }
}

#[tokio::test]
async fn tenant_row_round_trips() {
    let pool = setup_pool().await;
    let directory = SqlxTenantDirectory::without_session_binding(pool);
    directory.ensure_schema().await.unwrap();

    let tenant = mk_tenant();
    directory.insert(&tenant).await.unwrap();

    let loaded = directory
        .fetch_tenant(tenant.id)
        .await
        .unwrap()
        .expect("tenant exists");

    assert_eq!(loaded.name, "acme");
    assert_eq!(loaded.plan, Plan::Enterprise);
    assert_eq!(loaded.status, TenantStatus::Active);
    assert_eq!(loaded.weight(), 12);
    assert_eq!(loaded.data_region, "eu-west-1");
    assert!(loaded.region_allowed("us-east-1"));
    assert_eq!(loaded.quota_override(Resource::ApiCalls), Some(5_000));
    assert_eq!(loaded.fail_open_override, Some(false));
}

#[tokio::test]
async fn missing_tenant_is_none() {
    let pool = setup_pool().await;
    let directory = SqlxTenantDirectory::without_session_binding(pool);
    directory.ensure_schema().await.unwrap();

    assert!(directory.fetch_tenant(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn session_binding_failure_fails_closed() {
    // sqlite has no set_config; the binding statement fails, and the read
    // must fail with a bind error instead of proceeding unbound.
    let pool = setup_pool().await;
    let unbound = SqlxTenantDirectory::without_session_binding(pool.clone());
    unbound.ensure_schema().await.unwrap();
    let tenant = mk_tenant();
    unbound.insert(&tenant).await.unwrap();

    let binding = SqlxTenantDirectory::new(pool);
    let err = binding.fetch_tenant(tenant.id).await.unwrap_err();
    assert!(matches!(err, registry::RegistryError::TenantBind(_)));
}
