use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlMetrics {
    pub navigations: u64,
    pub actions: u64,
    pub responses_captured: u64,
    pub pages_yielded: u64,
    pub pages_skipped: u64,
    pub items_yielded: u64,
    pub notes_fetched: u64,
    pub comments_collected: u64,
    pub expansions_performed: u64,
    pub expansions_skipped: u64,
    pub login_waits: u64,
    pub risk_detections: u64,
    pub retries: u64,
}

impl CrawlMetrics {
    pub fn record_navigation(&mut self) {
        self.navigations = self.navigations.saturating_add(1);
    }

    pub fn record_action(&mut self) {
        self.actions = self.actions.saturating_add(1);
    }

    pub fn record_response(&mut self) {
        self.responses_captured = self.responses_captured.saturating_add(1);
    }

    pub fn record_page(&mut self, items: usize) {
        self.pages_yielded = self.pages_yielded.saturating_add(1);
        self.items_yielded = self.items_yielded.saturating_add(items as u64);
    }

    pub fn record_page_skipped(&mut self) {
        self.pages_skipped = self.pages_skipped.saturating_add(1);
    }

    pub fn record_note(&mut self, comments: usize) {
        self.notes_fetched = self.notes_fetched.saturating_add(1);
        self.comments_collected = self.comments_collected.saturating_add(comments as u64);
    }

    pub fn record_expansion(&mut self, performed: bool) {
        if performed {
            self.expansions_performed = self.expansions_performed.saturating_add(1);
        } else {
            self.expansions_skipped = self.expansions_skipped.saturating_add(1);
        }
    }

    pub fn record_login_wait(&mut self) {
        self.login_waits = self.login_waits.saturating_add(1);
    }

    pub fn record_risk_detection(&mut self) {
        self.risk_detections = self.risk_detections.saturating_add(1);
    }

    pub fn record_retry(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }

    pub fn skip_rate(&self) -> f64 {
        let total = self.pages_yielded + self.pages_skipped;
        if total == 0 {
            0.0
        } else {
            (self.pages_skipped as f64 / total as f64) * 100.0
        }
    }
}
