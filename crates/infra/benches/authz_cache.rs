use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use chrono::{Duration, TimeZone, Utc};
use keystone_auth::{Permission, PermissionSet, RoutePattern};
use keystone_core::{EmployeeId, ManualClock, RoleId};
use keystone_infra::authz_cache::AuthorizationCache;
use keystone_infra::permissions::InMemoryPermissionModel;
use keystone_infra::AuthzCacheConfig;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn setup(subjects: usize) -> (AuthorizationCache, Vec<EmployeeId>, PermissionSet) {
    let model = Arc::new(InMemoryPermissionModel::new());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
    let role = RoleId::new();
    model.grant_role(role, [Permission::new("admin_access"), Permission::new("reports.read")]);

    let employees: Vec<EmployeeId> = (0..subjects)
        .map(|_| {
            let employee = EmployeeId::new();
            model.assign_role(employee, role);
            employee
        })
        .collect();

    let config = AuthzCacheConfig {
        base_path: "/api/v1".to_string(),
        ..AuthzCacheConfig::default()
    }
    .with_route(RoutePattern::parse("/admin/*").unwrap(), Duration::seconds(30))
    .with_route(RoutePattern::parse("/reports/*").unwrap(), Duration::seconds(120));

    let required: PermissionSet = [Permission::new("admin_access")].into_iter().collect();
    (AuthorizationCache::new(model, clock, config), employees, required)
}

/// Cached decision: one map read under the read lock.
fn bench_cache_hit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("authz_cache_hit");

    for subjects in [1usize, 100, 10_000] {
        let (cache, employees, required) = setup(subjects);
        rt.block_on(async {
            for employee in &employees {
                cache.check(*employee, "/api/v1/admin/users", &required).await;
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(subjects), &subjects, |b, _| {
            let mut i = 0usize;
            b.to_async(&rt).iter(|| {
                let employee = employees[i % employees.len()];
                i += 1;
                let cache = cache.clone();
                let required = required.clone();
                async move { black_box(cache.check(employee, "/api/v1/admin/users", &required).await) }
            });
        });
    }

    group.finish();
}

/// Uncached decision: route match plus the relational lookup.
fn bench_cache_miss(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("authz_cache_miss");

    for subjects in [1usize, 100] {
        let (cache, employees, required) = setup(subjects);

        group.bench_with_input(BenchmarkId::from_parameter(subjects), &subjects, |b, _| {
            let mut i = 0usize;
            b.to_async(&rt).iter(|| {
                let employee = employees[i % employees.len()];
                i += 1;
                let cache = cache.clone();
                let required = required.clone();
                async move {
                    cache.clear();
                    black_box(cache.check(employee, "/api/v1/reports/monthly", &required).await)
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cache_hit, bench_cache_miss);
criterion_main!(benches);
