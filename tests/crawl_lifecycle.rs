//! End-to-end exercise of a single crawl cycle across repositories: a site
//! is registered, a page discovered, queued, processed, and the resulting
//! content change raises an alert that later escalates.

use std::collections::BTreeSet;

use philocrawl_core::models::{
    ChangeType, ContentChangeCreate, MonitoringConfig, PageCreate, PageMetadata, PolitenessConfig,
    SiteCreate, TaskCreate, TaskPriority, TaskStatus,
};
use philocrawl_core::repository::migrations::migrate;
use philocrawl_core::repository::Repositories;
use philocrawl_core::DbPool;

async fn repos() -> Repositories {
    let pool = DbPool::open_in_memory().unwrap();
    migrate(&pool).await.unwrap();
    Repositories::new(pool, philocrawl_core::config::RetentionConfig::default())
}

#[tokio::test]
async fn full_cycle_from_discovery_to_escalated_alert() {
    let repos = repos().await;

    let site_id = repos
        .sites
        .create_site(SiteCreate {
            name: "Internet Encyclopedia of Philosophy".into(),
            base_url: "https://iep.utm.edu".into(),
            allowed_domains: BTreeSet::from(["iep.utm.edu".to_string()]),
            start_urls: vec!["https://iep.utm.edu/".into()],
            allow_patterns: vec![],
            deny_patterns: vec![],
            politeness: PolitenessConfig::default(),
            monitoring: MonitoringConfig::default(),
            tags: vec!["encyclopedia".into()],
        })
        .await
        .unwrap();

    let page_id = repos
        .pages
        .create_page(PageCreate {
            site_id,
            url: "https://iep.utm.edu/spinoza".into(),
            title: Some("Spinoza".into()),
            content: Some("Baruch Spinoza was a Dutch philosopher...".into()),
            author: Some("Editorial Staff".into()),
            published_date: None,
            metadata: PageMetadata::default(),
        })
        .await
        .unwrap();

    let task_id = repos
        .queue
        .enqueue_task(TaskCreate {
            task_type: "extract_content".into(),
            priority: TaskPriority::new(5).unwrap(),
            payload: serde_json::json!({"page_id": page_id}),
            scheduled_at: None,
            max_retries: 3,
            dependencies: vec![],
        })
        .await
        .unwrap();

    let claimed = repos.queue.dequeue_next_task("worker-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, task_id);
    assert_eq!(claimed.status, TaskStatus::Processing);

    repos
        .queue
        .complete_task(task_id, serde_json::json!({"extracted": true}))
        .await
        .unwrap();

    let change_id = repos
        .changes
        .record_content_change(ContentChangeCreate {
            page_id,
            site_id,
            change_type: ChangeType::New,
            previous_hash: None,
            new_hash: Some("deadbeef".into()),
            context: serde_json::json!({"author_known": true, "philosophical_content": true}),
            url: None,
            title: None,
        })
        .await
        .unwrap();
    let unnotified = repos
        .changes
        .get_unnotified_changes(philocrawl_core::models::ChangePriority::Medium)
        .await
        .unwrap();
    assert!(unnotified.iter().any(|c| c.id == change_id));

    let alert_id = repos
        .alerts
        .create_alert(philocrawl_core::models::AlertCreate {
            alert_type: philocrawl_core::models::AlertType::HealthDegraded,
            site_id: Some(site_id),
            severity: philocrawl_core::models::AlertSeverity::High,
            message: "New philosophical content detected".into(),
            context: serde_json::json!({"page_id": page_id}),
        })
        .await
        .unwrap()
        .expect("alert was not suppressed");

    let active = repos.alerts.get_active_alerts(None).await.unwrap();
    assert!(active.iter().any(|a| a.id == alert_id));

    // Backdate the alert so escalation finds it past threshold, then escalate.
    let escalated = repos.alerts.escalate_unresolved_alerts(0).await.unwrap();
    assert!(escalated.iter().any(|a| a.id == alert_id));
    assert!(escalated.iter().find(|a| a.id == alert_id).unwrap().escalated);

    let resolved = repos.alerts.resolve_alert(alert_id, Some("content reviewed".into())).await.unwrap();
    assert!(resolved);
    let again = repos.alerts.resolve_alert(alert_id, None).await.unwrap();
    assert!(!again, "resolving an already-resolved alert must be a no-op");
}

#[tokio::test]
async fn retention_status_reflects_freshly_seeded_collections() {
    let repos = repos().await;
    repos
        .sites
        .create_site(SiteCreate {
            name: "Plato".into(),
            base_url: "https://plato.stanford.edu".into(),
            allowed_domains: BTreeSet::from(["plato.stanford.edu".to_string()]),
            start_urls: vec![],
            allow_patterns: vec![],
            deny_patterns: vec![],
            politeness: PolitenessConfig::default(),
            monitoring: MonitoringConfig::default(),
            tags: vec![],
        })
        .await
        .unwrap();

    let indexes = repos.retention.setup_ttl_indexes(false).await.unwrap();
    assert!(!indexes.is_empty());

    let statuses = repos.retention.get_retention_status().await.unwrap();
    assert!(statuses.iter().all(|s| s.ttl_index_exists));
}
