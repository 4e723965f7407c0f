//! Rolling in-memory token counters, per domain and per upstream account.
//!
//! One-minute buckets over a five-hour window. Updates are associative and
//! monotonic within a bucket, so a mutex per key with relaxed read paths is
//! race-safe for quota reports and pool selection.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;

use prism_protocol::Usage;

const BUCKET_SECS: u64 = 60;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct WindowTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

#[derive(Debug, Default)]
struct Bucket {
    minute: u64,
    requests: u64,
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_input_tokens: u64,
    cache_read_input_tokens: u64,
}

#[derive(Default)]
struct Window {
    buckets: VecDeque<Bucket>,
}

impl Window {
    fn record(&mut self, minute: u64, usage: &Usage, window_minutes: u64) {
        match self.buckets.back_mut() {
            Some(bucket) if bucket.minute == minute => {
                bucket.requests += 1;
                bucket.input_tokens += usage.input_tokens;
                bucket.output_tokens += usage.output_tokens;
                bucket.cache_creation_input_tokens += usage.cache_creation_input_tokens;
                bucket.cache_read_input_tokens += usage.cache_read_input_tokens;
            }
            _ => self.buckets.push_back(Bucket {
                minute,
                requests: 1,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_creation_input_tokens: usage.cache_creation_input_tokens,
                cache_read_input_tokens: usage.cache_read_input_tokens,
            }),
        }
        self.prune(minute, window_minutes);
    }

    fn prune(&mut self, now_minute: u64, window_minutes: u64) {
        let cutoff = now_minute.saturating_sub(window_minutes);
        while self.buckets.front().is_some_and(|b| b.minute < cutoff) {
            self.buckets.pop_front();
        }
    }

    fn totals(&mut self, now_minute: u64, window_minutes: u64) -> WindowTotals {
        self.prune(now_minute, window_minutes);
        let mut totals = WindowTotals::default();
        for bucket in &self.buckets {
            totals.requests += bucket.requests;
            totals.input_tokens += bucket.input_tokens;
            totals.output_tokens += bucket.output_tokens;
            totals.cache_creation_input_tokens += bucket.cache_creation_input_tokens;
            totals.cache_read_input_tokens += bucket.cache_read_input_tokens;
        }
        totals
    }
}

pub struct TokenCounter {
    window_minutes: u64,
    domains: DashMap<String, Mutex<Window>>,
    accounts: DashMap<String, Mutex<Window>>,
}

impl TokenCounter {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_minutes: window_secs.div_ceil(BUCKET_SECS),
            domains: DashMap::new(),
            accounts: DashMap::new(),
        }
    }

    fn now_minute() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() / BUCKET_SECS)
            .unwrap_or(0)
    }

    pub fn record(&self, domain: &str, account_id: Option<&str>, usage: &Usage) {
        self.record_at(Self::now_minute(), domain, account_id, usage);
    }

    fn record_at(&self, minute: u64, domain: &str, account_id: Option<&str>, usage: &Usage) {
        self.domains
            .entry(domain.to_string())
            .or_default()
            .lock()
            .unwrap()
            .record(minute, usage, self.window_minutes);
        if let Some(account) = account_id {
            self.accounts
                .entry(account.to_string())
                .or_default()
                .lock()
                .unwrap()
                .record(minute, usage, self.window_minutes);
        }
    }

    /// Rolling output-token sum for one account (pool selection input).
    pub fn account_output_tokens(&self, account_id: &str) -> u64 {
        self.account_output_tokens_at(Self::now_minute(), account_id)
    }

    fn account_output_tokens_at(&self, minute: u64, account_id: &str) -> u64 {
        self.accounts
            .get(account_id)
            .map(|w| {
                w.lock()
                    .unwrap()
                    .totals(minute, self.window_minutes)
                    .output_tokens
            })
            .unwrap_or(0)
    }

    /// Rolling totals for one domain (quota short-circuit response).
    pub fn domain_totals(&self, domain: &str) -> WindowTotals {
        self.domain_totals_at(Self::now_minute(), domain)
    }

    fn domain_totals_at(&self, minute: u64, domain: &str) -> WindowTotals {
        self.domains
            .get(domain)
            .map(|w| w.lock().unwrap().totals(minute, self.window_minutes))
            .unwrap_or_default()
    }

    /// Snapshot of every domain, for `/token-stats`.
    pub fn all_domains(&self) -> Vec<(String, WindowTotals)> {
        let now = Self::now_minute();
        let mut stats: Vec<(String, WindowTotals)> = self
            .domains
            .iter()
            .map(|entry| {
                let totals = entry.value().lock().unwrap().totals(now, self.window_minutes);
                (entry.key().clone(), totals)
            })
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}
