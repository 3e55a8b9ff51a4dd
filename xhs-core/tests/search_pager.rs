mod common;

use common::{malformed_response, search_response, text_at, Effect, MockDriver, Route, SEARCH_API};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use xhs_core::browser::{BrowserError, CapturedResponse};
use xhs_core::{
    CrawlerConfig, Distance, PacedPage, PacingGovernor, PacingSection, SearchPager, SearchQuery, SearchScope,
    SearchSection, SortMode,
};

const RESULTS: &str = r#"<html><body><div class="feeds-container">
    <section class="note-item"><a href="/explore/a1">a1</a></section>
</div></body></html>"#;

const RESULTS_WITH_MENU: &str = r#"<html><body>
  <div class="search-layout"><div class="filter">筛选</div></div>
  <div class="feeds-container"><section class="note-item"><a href="/explore/f0">f0</a></section></div>
</body></html>"#;

const MENU_OPEN: &str = r#"<html><body>
  <div class="search-layout"><div class="filter">筛选</div></div>
  <div class="filter-panel">
    <div class="filters"><span>不限</span><span>已看过</span><span>未看过</span><span>已关注</span></div>
    <div class="filters"><span>不限</span><span>同城</span><span>附近</span></div>
  </div>
  <div class="feeds-container"><section class="note-item"><a href="/explore/f0">f0</a></section></div>
</body></html>"#;

const RESULTS_AT_END: &str = r#"<html><body><div class="feeds-container">
    <section class="note-item"><a href="/explore/a1">a1</a></section>
</div><div class="end-container">- THE END -</div></body></html>"#;

fn search_config() -> SearchSection {
    let mut config = CrawlerConfig::without_delays().search;
    config.max_page_retries = 1;
    config
}

fn paced(driver: MockDriver) -> PacedPage<MockDriver> {
    PacedPage::new(driver, PacingGovernor::seeded(PacingSection::zero(), 7))
}

#[tokio::test(start_paused = true)]
async fn pages_are_yielded_in_order_with_their_page_numbers() {
    let driver = MockDriver::new()
        .route(Route::new("search_result", RESULTS).respond(search_response(&["a1", "a2"], true)))
        .on_bottom(Effect::responses(vec![search_response(&["b1", "b2", "b3"], true)]));
    let mut page = paced(driver.clone());
    let mut pager = SearchPager::new(&mut page, search_config(), SearchQuery::new("露营"), CancellationToken::new());

    let mut seen = Vec::new();
    while let Some(item) = pager.next().await.expect("search should not fail") {
        seen.push((item.note_id.clone(), item.page));
    }
    assert!(pager.is_finished());
    drop(pager);

    assert_eq!(
        seen,
        vec![
            ("a1".to_string(), 1),
            ("a2".to_string(), 1),
            ("b1".to_string(), 2),
            ("b2".to_string(), 2),
            ("b3".to_string(), 2),
        ]
    );
    assert!(seen.windows(2).all(|pair| pair[0].1 <= pair[1].1));
    assert_eq!(page.metrics().pages_yielded, 2);
    assert_eq!(page.metrics().items_yielded, 5);
    assert!(driver.state().visited[0].contains("keyword=%E9%9C%B2%E8%90%A5"));
}

#[tokio::test(start_paused = true)]
async fn empty_first_page_ends_without_error() {
    let driver = MockDriver::new()
        .route(Route::new("search_result", RESULTS).respond(search_response(&[], false)));
    let mut page = paced(driver.clone());
    let pager = SearchPager::new(&mut page, search_config(), SearchQuery::new("无结果"), CancellationToken::new());

    let results: Vec<_> = pager.into_stream().collect().await;
    assert!(results.is_empty());
    assert_eq!(driver.state().bottom_scrolls, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_finishes_the_current_page_only() {
    let driver = MockDriver::new()
        .route(Route::new("search_result", RESULTS).respond(search_response(&["a1", "a2", "a3"], true)))
        .on_bottom(Effect::responses(vec![search_response(&["b1"], true)]));
    let mut page = paced(driver.clone());
    let stop = CancellationToken::new();
    let mut pager = SearchPager::new(&mut page, search_config(), SearchQuery::new("露营"), stop.clone());

    let first = pager.next().await.unwrap().unwrap();
    assert_eq!(first.note_id, "a1");
    stop.cancel();

    let mut rest = Vec::new();
    while let Some(item) = pager.next().await.unwrap() {
        rest.push(item.note_id);
    }
    assert_eq!(rest, vec!["a2".to_string(), "a3".to_string()]);
    assert!(pager.is_finished());
    drop(pager);
    assert_eq!(driver.state().bottom_scrolls, 0);
    assert!(!driver.state().closed);
}

#[tokio::test(start_paused = true)]
async fn lost_page_is_skipped_after_bounded_retries() {
    let driver = MockDriver::new()
        .route(Route::new("search_result", RESULTS).respond(search_response(&["a1"], true)))
        .on_bottom(Effect::responses(vec![malformed_response()]))
        .on_bottom(Effect::responses(vec![malformed_response()]))
        .on_bottom(Effect::responses(vec![search_response(&["c1"], false)]));
    let mut page = paced(driver.clone());
    let mut pager = SearchPager::new(&mut page, search_config(), SearchQuery::new("露营"), CancellationToken::new());

    let mut seen = Vec::new();
    while let Some(item) = pager.next().await.expect("a lost page is not fatal") {
        seen.push((item.note_id, item.page));
    }
    drop(pager);

    assert_eq!(seen, vec![("a1".to_string(), 1), ("c1".to_string(), 3)]);
    assert_eq!(page.metrics().pages_skipped, 1);
    assert_eq!(page.metrics().retries, 1);
    assert_eq!(driver.state().bottom_scrolls, 3);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_response_is_an_access_fault() {
    let body = r#"{"code":300013,"success":false,"msg":"访问频次异常，请勿频繁操作"}"#;
    let driver = MockDriver::new()
        .route(Route::new("search_result", RESULTS).respond(CapturedResponse::new(SEARCH_API, 200, body)));
    let mut page = paced(driver);
    let mut pager = SearchPager::new(&mut page, search_config(), SearchQuery::new("露营"), CancellationToken::new());

    match pager.next().await {
        Err(BrowserError::RiskRestricted { code, .. }) => assert_eq!(code, "300013"),
        other => panic!("expected risk restriction, got {other:?}"),
    }
    assert!(pager.is_finished());
    drop(pager);
    assert_eq!(page.metrics().risk_detections, 1);
}

#[tokio::test(start_paused = true)]
async fn start_page_skips_earlier_pages_without_yielding_them() {
    let driver = MockDriver::new()
        .route(Route::new("search_result", RESULTS).respond(search_response(&["a1", "a2"], true)))
        .on_bottom(Effect::responses(vec![search_response(&["b1"], false)]));
    let mut page = paced(driver.clone());
    let query = SearchQuery::new("露营").start_page(2);
    let mut pager = SearchPager::new(&mut page, search_config(), query, CancellationToken::new());

    let mut seen = Vec::new();
    while let Some(item) = pager.next().await.unwrap() {
        seen.push((item.note_id, item.page));
    }
    drop(pager);

    assert_eq!(seen, vec![("b1".to_string(), 2)]);
    assert_eq!(page.metrics().pages_yielded, 1);
    assert_eq!(driver.state().bottom_scrolls, 1);
}

#[tokio::test(start_paused = true)]
async fn scope_and_distance_are_chosen_through_the_filter_menu() {
    let driver = MockDriver::new()
        .route(Route::new("search_result", RESULTS_WITH_MENU).respond(search_response(&["stale"], true)))
        .on_click(Effect::html(MENU_OPEN))
        .on_click(Effect::responses(vec![search_response(&["f1"], true)]))
        .on_click(Effect::responses(vec![search_response(&["f2"], false)]));
    let mut page = paced(driver.clone());
    let query = SearchQuery::new("咖啡")
        .sort(SortMode::Popularity)
        .scope(SearchScope::Followed)
        .distance(Distance::SameCity);
    let mut pager = SearchPager::new(&mut page, search_config(), query, CancellationToken::new());

    let mut seen = Vec::new();
    while let Some(item) = pager.next().await.unwrap() {
        seen.push(item.note_id);
    }
    drop(pager);

    // Each option click drains what the previous filter state produced.
    assert_eq!(seen, vec!["f2".to_string()]);
    let state = driver.state();
    let clicked: Vec<_> = state
        .clicks
        .iter()
        .map(|(selector, html)| text_at(html, selector).unwrap_or_default())
        .collect();
    assert_eq!(clicked, vec!["筛选", "已关注", "同城"]);
    assert!(state.visited[0].contains("sort=popularity_desc"));
}

#[tokio::test(start_paused = true)]
async fn end_marker_revealed_by_scrolling_ends_the_search() {
    let driver = MockDriver::new()
        .route(Route::new("search_result", RESULTS).respond(search_response(&["a1"], true)))
        .on_bottom(Effect {
            html: Some(RESULTS_AT_END.to_string()),
            responses: Vec::new(),
            height_growth: 900.0,
        });
    let mut page = paced(driver.clone());
    let mut pager = SearchPager::new(&mut page, search_config(), SearchQuery::new("露营"), CancellationToken::new());

    let mut seen = Vec::new();
    while let Some(item) = pager.next().await.expect("reaching the end is not an error") {
        seen.push(item.note_id);
    }
    drop(pager);

    assert_eq!(seen, vec!["a1".to_string()]);
    assert_eq!(page.metrics().retries, 0);
    assert_eq!(page.metrics().pages_skipped, 0);
    assert_eq!(driver.state().bottom_scrolls, 1);
}
