mod common;

use common::{MockHcp, listing_xml};
use hcp_migrate::services::crawler::{
    CrawlOptions, CrawlReport, Crawler, root_path, write_listing,
};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

fn crawler(hcp: &MockHcp, workers: usize) -> Crawler {
    Crawler::new(
        hcp.client(),
        CrawlOptions {
            workers,
            output_buffer: 2,
        },
    )
}

async fn crawl_lines(hcp: &MockHcp, root: &str) -> (Vec<String>, CrawlReport) {
    let handle = crawler(hcp, 4).start(root, CancellationToken::new());
    let mut out = Vec::new();
    let report = write_listing(handle, &mut out).await.unwrap();
    let mut lines: Vec<String> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    lines.sort();
    (lines, report)
}

#[tokio::test]
async fn root_with_two_objects_and_one_subdirectory() {
    let hcp = MockHcp::start().await;
    hcp.state.add_listing(
        "/rest",
        listing_xml("/rest", &[("a.pdf", "object"), ("sub", "directory"), ("b.pdf", "object")]),
    );
    hcp.state
        .add_listing("/rest/sub", listing_xml("/rest/sub", &[("c.pdf", "object")]));

    let (lines, report) = crawl_lines(&hcp, "").await;

    assert_eq!(lines, vec!["/rest/a.pdf", "/rest/b.pdf", "/rest/sub/c.pdf"]);
    assert_eq!(report.directories_listed, 2);
    assert_eq!(report.objects_found, 3);
    assert_eq!(report.failed_listings, 0);
    assert!(!report.cancelled);
}

#[tokio::test]
async fn every_object_is_emitted_exactly_once() {
    let hcp = MockHcp::start().await;
    let mut expected = BTreeSet::new();
    let mut directories = vec!["/rest".to_string()];

    let top: Vec<String> = (0..5).map(|i| format!("d{i}")).collect();
    let top_entries: Vec<(&str, &str)> = top.iter().map(|d| (d.as_str(), "directory")).collect();
    hcp.state.add_listing("/rest", listing_xml("/rest", &top_entries));

    for dir in &top {
        let dir_path = format!("/rest/{dir}");
        directories.push(dir_path.clone());
        let names: Vec<String> = (0..4).map(|i| format!("o{i}.bin")).collect();
        let subs: Vec<String> = (0..3).map(|i| format!("s{i}")).collect();
        let mut entries: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "object")).collect();
        entries.extend(subs.iter().map(|s| (s.as_str(), "directory")));
        hcp.state.add_listing(&dir_path, listing_xml(&dir_path, &entries));
        expected.extend(names.iter().map(|n| format!("{dir_path}/{n}")));

        for sub in &subs {
            let sub_path = format!("{dir_path}/{sub}");
            directories.push(sub_path.clone());
            hcp.state.add_listing(
                &sub_path,
                listing_xml(&sub_path, &[("x.txt", "object"), ("y.txt", "object")]),
            );
            expected.insert(format!("{sub_path}/x.txt"));
            expected.insert(format!("{sub_path}/y.txt"));
        }
    }

    let (lines, report) = crawl_lines(&hcp, "").await;

    assert_eq!(lines.len(), 50);
    assert_eq!(lines.iter().cloned().collect::<BTreeSet<_>>(), expected);
    assert_eq!(report.objects_found, 50);
    assert_eq!(report.directories_listed, 21);
    for dir in &directories {
        assert_eq!(hcp.state.requests_for(dir), 1, "{dir} listed more than once");
    }
}

#[tokio::test]
async fn malformed_branch_is_abandoned_alone() {
    let hcp = MockHcp::start().await;
    hcp.state.add_listing(
        "/rest",
        listing_xml(
            "/rest",
            &[("good", "directory"), ("bad", "directory"), ("gone", "directory")],
        ),
    );
    hcp.state
        .add_listing("/rest/good", listing_xml("/rest/good", &[("ok.pdf", "object")]));
    hcp.state.add_listing(
        "/rest/bad",
        "<directory path=\"/rest/bad\"><entry urlName=\"x\" type=\"object\"></directory>".into(),
    );

    let (lines, report) = crawl_lines(&hcp, "").await;

    assert_eq!(lines, vec!["/rest/good/ok.pdf"]);
    assert_eq!(report.failed_listings, 2);
}

#[tokio::test]
async fn empty_root_finishes_with_nothing() {
    let hcp = MockHcp::start().await;
    hcp.state
        .add_listing("/rest", "<directory path=\"/rest\"/>".into());

    let (lines, report) = crawl_lines(&hcp, "").await;

    assert!(lines.is_empty());
    assert_eq!(report.directories_listed, 1);
    assert_eq!(report.objects_found, 0);
}

#[tokio::test]
async fn other_entry_kinds_are_dropped() {
    let hcp = MockHcp::start().await;
    hcp.state.add_listing(
        "/rest",
        listing_xml("/rest", &[("a.pdf", "object"), ("link", "symlink")]),
    );

    let (lines, report) = crawl_lines(&hcp, "").await;

    assert_eq!(lines, vec!["/rest/a.pdf"]);
    assert_eq!(report.dropped_entries, 1);
}

#[tokio::test]
async fn prefix_root_lists_below_the_namespace_path() {
    let hcp = MockHcp::start().await;
    hcp.state.add_listing(
        "/rest/reports",
        listing_xml("/rest/reports", &[("r.pdf", "object")]),
    );

    let root = root_path(&hcp.namespace_url(), Some("reports"));
    let (lines, _) = crawl_lines(&hcp, &root).await;

    assert_eq!(lines, vec!["/rest/reports/r.pdf"]);
    assert_eq!(hcp.state.requests_for("/rest"), 0);
}

#[tokio::test]
async fn rejected_credentials_fail_the_root_branch() {
    let hcp = MockHcp::start().await;
    hcp.state
        .add_listing("/rest", listing_xml("/rest", &[("a.pdf", "object")]));

    let handle = Crawler::new(hcp.client_with_token("HCP wrong:token"), CrawlOptions::default())
        .start("", CancellationToken::new());
    let mut out = Vec::new();
    let report = write_listing(handle, &mut out).await.unwrap();

    assert!(out.is_empty());
    assert_eq!(report.failed_listings, 1);
}

#[tokio::test]
async fn cancelled_crawl_issues_no_requests() {
    let hcp = MockHcp::start().await;
    hcp.state
        .add_listing("/rest", listing_xml("/rest", &[("a.pdf", "object")]));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let handle = crawler(&hcp, 2).start("", cancel);
    assert!(handle.next().await.is_none());
    let report = handle.finish().await.unwrap();

    assert_eq!(report.objects_found, 0);
    assert!(hcp.state.requests.lock().unwrap().is_empty());
}
