//! Two-tier comment collection over a flattened layout.
//!
//! A top-level `.comment-item` and its replies are siblings: the replies (and
//! the "展开 N 条回复" control) live in the `.reply-container` element that
//! immediately follows the comment block.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use scraper::ElementRef;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::browser::{BrowserError, BrowserResult, ErrorClass, PageDriver, ScrollTarget};
use crate::config::CommentSection;
use crate::dom::{
    css_path, first_attr, first_text, has_class, next_element_sibling, select_all_in, text_of,
    DomSnapshot,
};
use crate::pacing::PacedPage;

const SCROLL_CONTAINERS: [&str; 2] = [".note-scroller", ".comments-container"];
const TOTAL_SELECTORS: [&str; 3] = [".total-reply", ".comments-container .total", ".comment-count"];
const COMMENT_SELECTOR: &str = ".comment-item";
const REPLY_CONTAINER_CLASS: &str = "reply-container";
const REPLY_SELECTORS: [&str; 3] = [".comment-item", ".comment-item-sub", ".reply-item"];

const AUTHOR_SELECTORS: [&str; 4] = [".author .name", ".name", ".nickname", ".user-name"];
const CONTENT_SELECTORS: [&str; 4] = [".content .note-text", ".content", ".comment-content", ".note-text"];
const DATE_SELECTORS: [&str; 3] = [".info .date > span:first-child", ".date", ".comment-date"];
const LOCATION_SELECTORS: [&str; 1] = [".location"];
const LIKE_SELECTORS: [&str; 3] = [".like .count", ".like-count", ".like-wrapper .count"];
const PROFILE_LINK: [&str; 1] = ["a[href*='/user/profile/']"];

static ZH_REPLY_CONTROL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:展开\s*)?(\d+)\s*条回复$").expect("valid regex"));
static EN_REPLY_CONTROL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:(?:show|view)\s+)?(\d+)\s+repl(?:y|ies)$").expect("valid regex")
});
static COUNT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(万|w|k)?").expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Option<String>,
    pub author: Option<String>,
    pub author_id: Option<String>,
    pub text: Option<String>,
    pub date: Option<String>,
    pub like_count: Option<u64>,
    pub location: Option<String>,
    /// Reply-scoped records; always empty on a reply itself.
    #[serde(default)]
    pub replies: Vec<Comment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorPhase {
    Init,
    Scrolling,
    Parsed,
}

/// Parses counters such as `1234`, `1.2万`, `3k`, `10+`. Plain labels yield `None`.
pub fn parse_count(text: &str) -> Option<u64> {
    let captures = COUNT_TOKEN.captures(text.trim())?;
    let number: f64 = captures.get(1)?.as_str().parse().ok()?;
    let scale = match captures.get(2).map(|unit| unit.as_str()) {
        Some("万") | Some("w") => 10_000.0,
        Some("k") => 1_000.0,
        _ => 1.0,
    };
    Some((number * scale).round() as u64)
}

/// Number of scrolls to attempt for a thread of `total` comments.
pub fn plan_scrolls(total: Option<u64>, cap: usize, config: &CommentSection) -> usize {
    let per_scroll = config.comments_per_scroll.max(1) as u64;
    let needed = match total {
        Some(0) => return 0,
        Some(total) => (total / per_scroll + 1) as usize,
        None => config.default_scrolls,
    };
    needed.max(2).min(cap)
}

/// The reply count when `text` is an explicit "N replies" / "展开 N 条回复" control.
pub fn reply_control_count(text: &str) -> Option<u32> {
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    [&*ZH_REPLY_CONTROL, &*EN_REPLY_CONTROL]
        .iter()
        .find_map(|pattern| pattern.captures(&text))
        .and_then(|captures| captures.get(1))
        .and_then(|count| count.as_str().parse().ok())
}

/// Leaf-most element under `scope` whose text is an explicit reply-count control.
pub fn find_expand_control<'a>(scope: ElementRef<'a>) -> Option<(ElementRef<'a>, u32)> {
    scope
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter_map(|element| reply_control_count(&text_of(element)).map(|count| (element, count)))
        .find(|(element, _)| {
            !element
                .children()
                .filter_map(ElementRef::wrap)
                .any(|child| reply_control_count(&text_of(child)).is_some())
        })
}

fn is_inside_reply_container(element: ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| has_class(ancestor, REPLY_CONTAINER_CLASS))
}

/// Top-level comment blocks in document order.
pub fn top_level_blocks(dom: &DomSnapshot) -> Vec<ElementRef<'_>> {
    dom.select_all(COMMENT_SELECTOR)
        .into_iter()
        .filter(|block| !has_class(*block, "comment-item-sub") && !is_inside_reply_container(*block))
        .collect()
}

/// The `.reply-container` immediately following a comment block, if any.
pub fn reply_scope(block: ElementRef<'_>) -> Option<ElementRef<'_>> {
    next_element_sibling(block).filter(|sibling| has_class(*sibling, REPLY_CONTAINER_CLASS))
}

fn comment_id(block: ElementRef<'_>) -> Option<String> {
    ["data-id", "data-comment-id", "id"]
        .iter()
        .find_map(|attr| block.value().attr(attr))
        .map(|id| id.trim().trim_start_matches("comment-").to_string())
        .filter(|id| !id.is_empty())
}

/// Parses one comment or reply block; every field is optional.
pub fn parse_block(block: ElementRef<'_>) -> Comment {
    let location = first_text(block, &LOCATION_SELECTORS);
    let date = first_text(block, &DATE_SELECTORS).map(|date| match &location {
        Some(location) => date.trim_end_matches(location.as_str()).trim().to_string(),
        None => date,
    });
    let author_id = first_attr(block, &PROFILE_LINK, "href").and_then(|href| {
        href.split('?')
            .next()
            .and_then(|path| path.trim_end_matches('/').rsplit('/').next())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    });
    Comment {
        id: comment_id(block),
        author: first_text(block, &AUTHOR_SELECTORS),
        author_id,
        text: first_text(block, &CONTENT_SELECTORS),
        date: date.filter(|date| !date.is_empty()),
        like_count: first_text(block, &LIKE_SELECTORS).and_then(|likes| parse_count(&likes)),
        location,
        replies: Vec::new(),
    }
}

pub fn parse_replies(scope: ElementRef<'_>) -> Vec<Comment> {
    REPLY_SELECTORS
        .iter()
        .map(|selector| select_all_in(scope, selector))
        .find(|items| !items.is_empty())
        .unwrap_or_default()
        .into_iter()
        .map(parse_block)
        .collect()
}

/// Scrolls the comment region, parses top-level blocks and expands each
/// thread at most once.
pub struct CommentCollector<'a, D> {
    page: &'a mut PacedPage<D>,
    config: &'a CommentSection,
    phase: CollectorPhase,
}

impl<'a, D: PageDriver> CommentCollector<'a, D> {
    pub fn new(page: &'a mut PacedPage<D>, config: &'a CommentSection) -> Self {
        Self {
            page,
            config,
            phase: CollectorPhase::Init,
        }
    }

    pub fn phase(&self) -> CollectorPhase {
        self.phase
    }

    pub async fn collect(&mut self, max_scrolls: Option<usize>) -> BrowserResult<Vec<Comment>> {
        let (target, planned) = {
            let dom = self.page.snapshot().await?;
            let target = SCROLL_CONTAINERS
                .iter()
                .find(|selector| dom.exists(selector))
                .map(|selector| ScrollTarget::Element(selector.to_string()))
                .unwrap_or(ScrollTarget::Window);
            let total = dom
                .select_first(&TOTAL_SELECTORS)
                .and_then(|element| parse_count(&text_of(element)));
            let cap = max_scrolls.unwrap_or(self.config.max_scrolls);
            let planned = plan_scrolls(total, cap, self.config);
            debug!(?total, planned, "planned comment scrolls");
            (target, planned)
        };

        self.phase = CollectorPhase::Scrolling;
        self.scroll(&target, planned).await?;

        let mut comments = {
            let dom = self.page.snapshot().await?;
            top_level_blocks(&dom)
                .into_iter()
                .map(|block| {
                    let mut comment = parse_block(block);
                    if let Some(scope) = reply_scope(block) {
                        comment.replies = parse_replies(scope);
                    }
                    comment
                })
                .collect::<Vec<_>>()
        };

        if self.config.expand_replies {
            for index in 0..comments.len() {
                match self.expand(index, comments[index].id.as_deref()).await {
                    Ok(Some(replies)) => comments[index].replies = replies,
                    Ok(None) => {}
                    Err(err) if err.class() == ErrorClass::Ambiguity => {
                        warn!(index, error = %err, "skipping reply expansion");
                        self.page.metrics_mut().record_expansion(false);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        self.phase = CollectorPhase::Parsed;
        let replies: usize = comments.iter().map(|comment| comment.replies.len()).sum();
        info!(comments = comments.len(), replies, "comments parsed");
        Ok(comments)
    }

    async fn scroll(&mut self, target: &ScrollTarget, planned: usize) -> BrowserResult<()> {
        let mut known = top_level_blocks(&self.page.snapshot().await?).len();
        let mut stable = 0;
        for round in 0..planned {
            let delta = self.page.governor().between(600.0, 1200.0);
            self.page.scroll(target, delta).await?;
            if self.page.governor().chance(0.15) {
                self.page.scroll(target, -delta / 3.0).await?;
            }
            let count = top_level_blocks(&self.page.snapshot().await?).len();
            if count > known {
                known = count;
                stable = 0;
            } else {
                stable += 1;
                if stable >= self.config.stable_rounds.max(1) {
                    debug!(round, count, "comment list stopped growing");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Replies loaded by expanding comment `index`, or `None` when no expansion happened.
    async fn expand(&mut self, index: usize, id: Option<&str>) -> BrowserResult<Option<Vec<Comment>>> {
        let control = {
            let dom = self.page.snapshot().await?;
            let Some(block) = top_level_blocks(&dom).into_iter().nth(index) else {
                return Ok(None);
            };
            if id.is_some() && comment_id(block).as_deref() != id {
                return Err(BrowserError::Ambiguous(format!(
                    "comment {index} is no longer {}",
                    id.unwrap_or_default()
                )));
            }
            reply_scope(block)
                .and_then(find_expand_control)
                .map(|(control, count)| (css_path(control), count))
        };
        let Some((selector, count)) = control else {
            return Ok(None);
        };
        if count < self.config.min_reply_count {
            trace!(index, count, "reply count below expansion threshold");
            self.page.metrics_mut().record_expansion(false);
            return Ok(None);
        }
        if !self.page.click(&selector).await? {
            debug!(index, "expansion control vanished before click");
            self.page.metrics_mut().record_expansion(false);
            return Ok(None);
        }
        self.page.metrics_mut().record_expansion(true);
        self.page
            .pause(Duration::from_millis(self.config.settle_after_expand_ms))
            .await;

        let dom = self.page.snapshot().await?;
        let blocks = top_level_blocks(&dom);
        let expanded = match id {
            Some(id) => blocks
                .into_iter()
                .find(|block| comment_id(*block).as_deref() == Some(id)),
            None => blocks.into_iter().nth(index),
        };
        let replies = expanded
            .and_then(reply_scope)
            .map(parse_replies)
            .unwrap_or_default();
        debug!(index, expected = count, loaded = replies.len(), "expanded replies");
        Ok(Some(replies))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREAD: &str = r#"
        <html><body><div class="comments-container"><div class="list-container">
          <div class="parent-comment">
            <div class="comment-item" id="comment-c1">
              <a href="/user/profile/5f00aa?xsec_source=pc_note"><span class="name">阿柴</span></a>
              <div class="content"><span class="note-text">好看！</span></div>
              <div class="info"><div class="date"><span>3天前</span><span class="location">上海</span></div>
              <div class="interactions"><div class="like"><span class="count">1.2万</span></div>
              <div class="reply"><span class="count">Reply</span></div></div></div>
            </div>
            <div class="reply-container">
              <div class="list-container">
                <div class="comment-item comment-item-sub" id="comment-r1"><span class="name">小鱼</span><div class="content">同感</div></div>
              </div>
              <div class="show-more">展开 3 条回复</div>
            </div>
          </div>
          <div class="parent-comment">
            <div class="comment-item" data-id="c2"><span class="name">Ben</span><div class="content">nice</div></div>
          </div>
        </div></div></body></html>"#;

    #[test]
    fn counts_with_units() {
        assert_eq!(parse_count("1.2万"), Some(12_000));
        assert_eq!(parse_count("共 128 条评论"), Some(128));
        assert_eq!(parse_count("10+"), Some(10));
        assert_eq!(parse_count("赞"), None);
    }

    #[test]
    fn scroll_plan_is_adaptive_and_capped() {
        let config = CommentSection::default();
        assert_eq!(plan_scrolls(Some(0), 20, &config), 0);
        assert_eq!(plan_scrolls(Some(5), 20, &config), 2);
        assert_eq!(plan_scrolls(Some(120), 20, &config), 11);
        assert_eq!(plan_scrolls(Some(5_000), 20, &config), 20);
        assert_eq!(plan_scrolls(None, 20, &config), 2);
        assert_eq!(plan_scrolls(Some(120), 1, &config), 1);
    }

    #[test]
    fn reply_control_requires_explicit_count() {
        assert_eq!(reply_control_count("展开 3 条回复"), Some(3));
        assert_eq!(reply_control_count("12条回复"), Some(12));
        assert_eq!(reply_control_count("3 replies"), Some(3));
        assert_eq!(reply_control_count("View 1 reply"), Some(1));
        assert_eq!(reply_control_count("Reply"), None);
        assert_eq!(reply_control_count("回复"), None);
        assert_eq!(reply_control_count("展开更多回复"), None);
        assert_eq!(reply_control_count("展开 3 条回复 并且更多"), None);
    }

    #[test]
    fn parses_flattened_thread() {
        let dom = DomSnapshot::parse(THREAD);
        let blocks = top_level_blocks(&dom);
        assert_eq!(blocks.len(), 2);

        let first = parse_block(blocks[0]);
        assert_eq!(first.id.as_deref(), Some("c1"));
        assert_eq!(first.author.as_deref(), Some("阿柴"));
        assert_eq!(first.author_id.as_deref(), Some("5f00aa"));
        assert_eq!(first.text.as_deref(), Some("好看！"));
        assert_eq!(first.date.as_deref(), Some("3天前"));
        assert_eq!(first.location.as_deref(), Some("上海"));
        assert_eq!(first.like_count, Some(12_000));

        let scope = reply_scope(blocks[0]).unwrap();
        let replies = parse_replies(scope);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].author.as_deref(), Some("小鱼"));

        let (control, count) = find_expand_control(scope).unwrap();
        assert_eq!(count, 3);
        assert!(has_class(control, "show-more"));

        assert!(reply_scope(blocks[1]).is_none());
        assert_eq!(parse_block(blocks[1]).id.as_deref(), Some("c2"));
    }
}
