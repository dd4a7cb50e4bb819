use std::path::{Path, PathBuf};

use cashmap_adapters::UnitStatus;
use cashmap_core::Device;
use cashmap_storage::CampaignRepository;
use cashmap_sync::{RunStatus, SearchSnapshot, SyncConfig, SyncPipeline};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixture(relative: &str) -> String {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    std::fs::read_to_string(root.join(relative)).expect("fixture readable")
}

async fn mount_page(server: &MockServer, page: Option<&str>, fixture_name: &str) {
    mount_listing(server, "/shopping/shop/101", page, fixture_name).await;
}

async fn mount_listing(server: &MockServer, listing: &str, page: Option<&str>, fixture_name: &str) {
    let mock = Mock::given(method("GET")).and(path(listing));
    let mock = match page {
        None => mock.and(query_param_is_missing("page")),
        Some(page) => mock.and(query_param("page", page)),
    };
    mock.respond_with(
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/html; charset=utf-8")
            .set_body_string(fixture(fixture_name)),
    )
    .mount(server)
    .await;
}

const SHOPPING: &str = "      - key: shopping
        display_name: ショッピング
        url: /shopping/shop/101";

const SHOPPING_AND_CARD: &str = "      - key: shopping
        display_name: ショッピング
        url: /shopping/shop/101
      - key: card
        display_name: クレジットカード
        url: /card/list";

fn write_sources(workspace: &Path, base_url: &str) {
    write_sources_with(workspace, base_url, SHOPPING);
}

fn write_sources_with(workspace: &Path, base_url: &str, categories: &str) {
    let yaml = format!(
        r#"
sources:
  - name: chobirich
    display_name: ちょびリッチ
    base_url: {base_url}
    point_rate: 0.5
    categories:
{categories}
    pagination:
      kind: numeric
      param: page
      max_pages: 10
    device_profiles:
      - device: PC
        user_agent: cashmap-test-desktop
    extraction:
      item_selector: li.ad-category__ad
      name_selector: .ad-category__ad__name
      reward_selector: .ad-category__ad__pt
      link_selector: a[href*="/ad_details/"]
      source_key_pattern: /ad_details/(\d+)
      no_results_markers: ["該当する広告はありません"]
      blocked_markers: ["captcha-form"]
      name_suffixes: ["| ちょびリッチ"]
    delay:
      min_ms: 0
      max_ms: 0
"#
    );
    std::fs::write(workspace.join("sources.yaml"), yaml).expect("write sources.yaml");
}

async fn listing_server() -> MockServer {
    let server = MockServer::start().await;
    mount_page(&server, None, "chobirich/shopping_page1.html").await;
    mount_page(&server, Some("2"), "chobirich/shopping_page2.html").await;
    mount_page(&server, Some("3"), "chobirich/shopping_page2.html").await;
    server
}

async fn pipeline(workspace: &Path) -> SyncPipeline {
    SyncPipeline::from_config(SyncConfig::with_workspace(workspace))
        .await
        .expect("pipeline")
}

fn read_snapshot(path: &Path) -> SearchSnapshot {
    serde_json::from_str(&std::fs::read_to_string(path).expect("snapshot readable"))
        .expect("snapshot json")
}

#[tokio::test]
async fn overlapping_pages_publish_one_record_per_campaign() {
    let server = listing_server().await;
    let workspace = tempfile::tempdir().unwrap();
    write_sources(workspace.path(), &server.uri());

    let summary = pipeline(workspace.path())
        .await
        .run_once(CancellationToken::new())
        .await
        .expect("run");

    let report = &summary.report;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.raw_records, 6);
    assert_eq!(report.unique_records, 5);
    assert_eq!(report.collapsed_duplicates, 1);
    assert_eq!(report.parse_ambiguities, 1);
    assert_eq!(report.merge.as_ref().unwrap().inserted, 5);

    let snapshot = read_snapshot(&summary.snapshot_path);
    assert_eq!(snapshot.metadata.total_campaigns, 5);
    let uniqlo = snapshot
        .campaigns
        .iter()
        .filter(|c| c.destination_url.ends_with("/ad_details/50113/"))
        .collect::<Vec<_>>();
    assert_eq!(uniqlo.len(), 1);
    assert_eq!(uniqlo[0].display_name, "UNIQLO オンラインストア");
    assert_eq!(uniqlo[0].reward_yen, Some(1000.0));

    let game = snapshot
        .campaigns
        .iter()
        .find(|c| c.destination_url.ends_with("/ad_details/77001/"))
        .unwrap();
    assert_eq!(game.device, Device::Ios);
    assert_eq!(game.reward_normalized.amount, Some(62327.0));

    assert!(summary.reports_dir.join("run_report.json").exists());
    assert!(summary.reports_dir.join("daily_brief.md").exists());
}

#[tokio::test]
async fn identical_second_run_writes_nothing() {
    let server = listing_server().await;
    let workspace = tempfile::tempdir().unwrap();
    write_sources(workspace.path(), &server.uri());

    let first = pipeline(workspace.path())
        .await
        .run_once(CancellationToken::new())
        .await
        .unwrap();
    let second = pipeline(workspace.path())
        .await
        .run_once(CancellationToken::new())
        .await
        .unwrap();

    let merge = second.report.merge.as_ref().unwrap();
    assert_eq!(merge.writes, 0);
    assert_eq!(merge.unchanged, 5);
    assert_eq!(
        first.report.snapshot.as_ref().unwrap().version,
        second.report.snapshot.as_ref().unwrap().version
    );
}

#[tokio::test]
async fn cancelled_run_never_counts_misses() {
    let server = listing_server().await;
    let workspace = tempfile::tempdir().unwrap();
    write_sources(workspace.path(), &server.uri());
    pipeline(workspace.path())
        .await
        .run_once(CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let pipeline = pipeline(workspace.path()).await;
    let summary = pipeline.run_once(cancel).await.unwrap();

    assert_eq!(summary.report.status, RunStatus::Cancelled);
    let merge = summary.report.merge.as_ref().unwrap();
    assert_eq!(merge.miss_incremented, 0);
    assert_eq!(merge.out_of_scope, 5);

    let stored = pipeline.repository().list_all().await.unwrap();
    assert_eq!(stored.len(), 5);
    assert!(stored.iter().all(|c| c.active && c.miss_streak == 0));
    assert_eq!(read_snapshot(&summary.snapshot_path).metadata.total_campaigns, 5);
}

#[tokio::test]
async fn blocked_category_leaves_its_sibling_merged() {
    let server = MockServer::start().await;
    mount_page(&server, None, "chobirich/shopping_page1.html").await;
    mount_page(&server, Some("2"), "chobirich/shopping_empty.html").await;
    mount_listing(&server, "/card/list", None, "chobirich/card_page1.html").await;
    mount_listing(&server, "/card/list", Some("2"), "chobirich/shopping_empty.html").await;
    let workspace = tempfile::tempdir().unwrap();
    write_sources_with(workspace.path(), &server.uri(), SHOPPING_AND_CARD);

    let first = pipeline(workspace.path())
        .await
        .run_once(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.report.status, RunStatus::Completed);
    assert_eq!(first.report.merge.as_ref().unwrap().inserted, 5);

    // Next day the card listing denies access and two shopping campaigns are gone.
    server.reset().await;
    mount_page(&server, None, "chobirich/shopping_page2.html").await;
    mount_page(&server, Some("2"), "chobirich/shopping_empty.html").await;
    Mock::given(method("GET"))
        .and(path("/card/list"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let pipeline = pipeline(workspace.path()).await;
    let summary = pipeline.run_once(CancellationToken::new()).await.unwrap();

    let report = &summary.report;
    assert_eq!(report.status, RunStatus::Partial);
    let statuses = report
        .units
        .iter()
        .map(|u| (u.category.as_str(), u.status))
        .collect::<Vec<_>>();
    assert_eq!(
        statuses,
        vec![("shopping", UnitStatus::Completed), ("card", UnitStatus::Blocked)]
    );
    let merge = report.merge.as_ref().unwrap();
    assert_eq!(merge.inserted, 2);
    assert_eq!(merge.miss_incremented, 2);
    assert_eq!(merge.out_of_scope, 2);

    let stored = pipeline.repository().list_all().await.unwrap();
    assert_eq!(stored.len(), 7);
    let streak = |key: &str| {
        stored
            .iter()
            .find(|c| c.source_key.as_deref() == Some(key))
            .map(|c| (c.active, c.miss_streak))
    };
    assert_eq!(streak("35422"), Some((true, 1)));
    assert_eq!(streak("10288"), Some((true, 1)));
    assert_eq!(streak("50113"), Some((true, 0)));
    assert_eq!(streak("77001"), Some((true, 0)));
    assert_eq!(streak("60001"), Some((true, 0)));
    assert_eq!(streak("60002"), Some((true, 0)));
}
