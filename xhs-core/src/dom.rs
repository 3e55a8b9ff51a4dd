//! Read-only queries over an HTML snapshot of the live page.
//!
//! Pipelines take a snapshot, decide on it, then act through the driver
//! using selectors produced here (`css_path`).

use scraper::{ElementRef, Html, Selector};

pub struct DomSnapshot {
    html: Html,
}

impl DomSnapshot {
    pub fn parse(html: &str) -> Self {
        Self {
            html: Html::parse_document(html),
        }
    }

    pub fn root(&self) -> ElementRef<'_> {
        self.html.root_element()
    }

    pub fn exists(&self, selector: &str) -> bool {
        self.select_first(&[selector]).is_some()
    }

    /// First match of the first selector (in priority order) that matches anything.
    pub fn select_first(&self, selectors: &[&str]) -> Option<ElementRef<'_>> {
        select_first_in(self.root(), selectors)
    }

    pub fn select_all(&self, selector: &str) -> Vec<ElementRef<'_>> {
        select_all_in(self.root(), selector)
    }

    pub fn body_text(&self) -> String {
        self.select_first(&["body"])
            .map(text_of)
            .unwrap_or_else(|| text_of(self.root()))
    }

    pub fn meta_content(&self, key: &str) -> Option<String> {
        let by_property = format!("meta[property=\"{key}\"]");
        let by_name = format!("meta[name=\"{key}\"]");
        [by_property, by_name].iter().find_map(|selector| {
            self.select_first(&[selector.as_str()])
                .and_then(|meta| meta.value().attr("content"))
                .map(|content| content.trim().to_string())
                .filter(|content| !content.is_empty())
        })
    }

    /// Deepest element under `scope` whose collapsed text equals `text`.
    pub fn find_by_exact_text(&self, scope: &str, text: &str) -> Option<ElementRef<'_>> {
        self.select_all(scope)
            .into_iter()
            .find_map(|scope| find_exact_text_in(scope, text))
    }

    pub fn script_bodies(&self) -> Vec<String> {
        self.select_all("script")
            .into_iter()
            .map(|script| script.text().collect::<String>())
            .collect()
    }
}

fn parse_selector(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::trace!(selector, error = %err, "ignoring unparsable selector");
            None
        }
    }
}

pub fn select_first_in<'a>(scope: ElementRef<'a>, selectors: &[&str]) -> Option<ElementRef<'a>> {
    selectors
        .iter()
        .filter_map(|selector| parse_selector(selector))
        .find_map(|selector| scope.select(&selector).next())
}

pub fn select_all_in<'a>(scope: ElementRef<'a>, selector: &str) -> Vec<ElementRef<'a>> {
    match parse_selector(selector) {
        Some(selector) => scope.select(&selector).collect(),
        None => Vec::new(),
    }
}

/// Visible text with whitespace runs collapsed to single spaces.
pub fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn first_text(scope: ElementRef<'_>, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|selector| {
        select_all_in(scope, selector)
            .into_iter()
            .map(text_of)
            .find(|text| !text.is_empty())
    })
}

pub fn first_attr(scope: ElementRef<'_>, selectors: &[&str], attr: &str) -> Option<String> {
    selectors.iter().find_map(|selector| {
        select_all_in(scope, selector).into_iter().find_map(|element| {
            element
                .value()
                .attr(attr)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
    })
}

pub fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|name| name == class)
}

/// The next sibling that is an element, skipping text and comment nodes.
pub fn next_element_sibling(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    element.next_siblings().find_map(ElementRef::wrap)
}

fn element_index(element: ElementRef<'_>) -> usize {
    1 + element
        .prev_siblings()
        .filter(|node| node.value().is_element())
        .count()
}

/// A selector addressing exactly this element in the same document.
pub fn css_path(element: ElementRef<'_>) -> String {
    let mut segments = Vec::new();
    let mut current = Some(element);
    while let Some(node) = current {
        let parent = node.parent().and_then(ElementRef::wrap);
        let name = node.value().name();
        match parent {
            Some(_) => segments.push(format!("{name}:nth-child({})", element_index(node))),
            None => segments.push(name.to_string()),
        }
        current = parent;
    }
    segments.reverse();
    segments.join(" > ")
}

pub fn find_exact_text_in<'a>(scope: ElementRef<'a>, text: &str) -> Option<ElementRef<'a>> {
    let wanted = text.split_whitespace().collect::<Vec<_>>().join(" ");
    scope
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|element| text_of(*element) == wanted)
        .find(|element| {
            !element
                .children()
                .filter_map(ElementRef::wrap)
                .any(|child| text_of(child) == wanted)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head>
          <title>夏日穿搭 - 小红书</title>
          <meta property="og:title" content="夏日穿搭分享">
        </head><body>
          <div class="list">
            <div class="comment-item" id="c1">first</div>
            <!-- separator -->
            text node
            <div class="reply-container"><span>展开 3 条回复</span></div>
            <div class="comment-item" id="c2">second</div>
          </div>
        </body></html>"#;

    #[test]
    fn next_sibling_skips_text_and_comments() {
        let dom = DomSnapshot::parse(PAGE);
        let first = dom.select_first(&["#c1"]).unwrap();
        let sibling = next_element_sibling(first).unwrap();
        assert!(has_class(sibling, "reply-container"));
    }

    #[test]
    fn css_path_addresses_the_same_element() {
        let dom = DomSnapshot::parse(PAGE);
        let target = dom.select_first(&["#c2"]).unwrap();
        let path = css_path(target);
        assert!(path.starts_with("html > body:nth-child(2)"));
        let found = dom.select_all(&path);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value().attr("id"), Some("c2"));
    }

    #[test]
    fn meta_and_exact_text_lookup() {
        let dom = DomSnapshot::parse(PAGE);
        assert_eq!(dom.meta_content("og:title").as_deref(), Some("夏日穿搭分享"));
        let control = dom.find_by_exact_text(".list", "展开 3 条回复").unwrap();
        assert_eq!(control.value().name(), "span");
        assert!(dom.find_by_exact_text(".list", "展开").is_none());
    }

    #[test]
    fn selector_priority_and_bad_selectors() {
        let dom = DomSnapshot::parse(PAGE);
        assert!(dom.select_first(&["###", "#missing"]).is_none());
        let hit = dom.select_first(&["#missing", ".comment-item"]).unwrap();
        assert_eq!(hit.value().attr("id"), Some("c1"));
    }
}
