use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use url::Url;

use crate::config::MirrorConfig;
use crate::registry::normalize;

#[derive(Debug, Clone, PartialEq)]
pub struct CrawlTask {
    pub address: Url,
    pub depth: usize,
    /// Page the link was discovered on; `None` for the seed.
    pub origin: Option<Url>,
}

/// Why a page link was never crawled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    DepthLimit,
    PageLimit,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedLink {
    pub address: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    Seen,
    DepthLimit,
    PageLimit,
    /// Not crawlable: foreign host or non-http scheme.
    Filtered,
}

/// Breadth-first page queue bounded by depth and page count.
#[derive(Debug)]
pub struct Frontier {
    queue: VecDeque<CrawlTask>,
    seen: HashSet<String>,
    scheduled: usize,
    max_depth: usize,
    max_pages: usize,
    seed_host: Option<String>,
    follow_external: bool,
    skipped: Vec<SkippedLink>,
}

impl Frontier {
    /// A frontier whose first scheduled page is `seed`. The seed itself is
    /// rendered outside the queue, so it is only marked, never queued.
    pub fn new(seed: &Url, config: &MirrorConfig) -> Self {
        let mut seen = HashSet::new();
        seen.insert(normalize(seed));
        Self {
            queue: VecDeque::new(),
            seen,
            scheduled: 1,
            max_depth: config.max_depth,
            max_pages: config.max_pages,
            seed_host: seed.host_str().map(str::to_ascii_lowercase),
            follow_external: config.follow_external_links,
            skipped: Vec::new(),
        }
    }

    pub fn offer(&mut self, link: &Url, parent_depth: usize, origin: &Url) -> Admission {
        if !matches!(link.scheme(), "http" | "https") {
            return Admission::Filtered;
        }
        if !self.follow_external && link.host_str().map(str::to_ascii_lowercase) != self.seed_host {
            return Admission::Filtered;
        }

        let key = normalize(link);
        if self.seen.contains(&key) {
            return Admission::Seen;
        }

        let depth = parent_depth + 1;
        let admission = if depth > self.max_depth {
            Admission::DepthLimit
        } else if self.scheduled >= self.max_pages {
            Admission::PageLimit
        } else {
            Admission::Queued
        };

        self.seen.insert(key.clone());
        match admission {
            Admission::Queued => {
                let mut address = link.clone();
                address.set_fragment(None);
                self.scheduled += 1;
                self.queue.push_back(CrawlTask {
                    address,
                    depth,
                    origin: Some(origin.clone()),
                });
            }
            Admission::DepthLimit => self.skip(key, SkipReason::DepthLimit),
            Admission::PageLimit => self.skip(key, SkipReason::PageLimit),
            Admission::Seen | Admission::Filtered => {}
        }
        admission
    }

    /// Record an address reached through a redirect so it is not crawled again.
    pub fn mark_seen(&mut self, address: &Url) {
        self.seen.insert(normalize(address));
    }

    pub fn next(&mut self) -> Option<CrawlTask> {
        self.queue.pop_front()
    }

    /// Empty the queue on shutdown. Every dropped task is recorded as a
    /// cancelled skip.
    pub fn drain(&mut self) -> Vec<CrawlTask> {
        let drained: Vec<CrawlTask> = self.queue.drain(..).collect();
        for task in &drained {
            self.skip(normalize(&task.address), SkipReason::Cancelled);
        }
        drained
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn scheduled(&self) -> usize {
        self.scheduled
    }

    pub fn skipped_links(&self) -> &[SkippedLink] {
        &self.skipped
    }

    fn skip(&mut self, address: String, reason: SkipReason) {
        self.skipped.push(SkippedLink { address, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn frontier(max_depth: usize, max_pages: usize) -> Frontier {
        let config = MirrorConfig {
            max_depth,
            max_pages,
            ..MirrorConfig::default()
        };
        Frontier::new(&url("https://example.com/"), &config)
    }

    #[test]
    fn test_breadth_first_order() {
        let mut frontier = frontier(3, 50);
        let seed = url("https://example.com/");
        assert_eq!(frontier.offer(&url("https://example.com/a"), 0, &seed), Admission::Queued);
        assert_eq!(frontier.offer(&url("https://example.com/b"), 0, &seed), Admission::Queued);

        let first = frontier.next().unwrap();
        assert_eq!(first.address.as_str(), "https://example.com/a");
        assert_eq!(first.depth, 1);
        assert_eq!(first.origin, Some(seed.clone()));
        frontier.offer(&url("https://example.com/a/deeper"), first.depth, &first.address);

        let order: Vec<String> = std::iter::from_fn(|| frontier.next()).map(|t| t.address.to_string()).collect();
        assert_eq!(order, vec!["https://example.com/b", "https://example.com/a/deeper"]);
    }

    #[test]
    fn test_duplicates_and_seed_are_seen() {
        let mut frontier = frontier(3, 50);
        let seed = url("https://example.com/");
        assert_eq!(frontier.offer(&url("https://example.com/#top"), 0, &seed), Admission::Seen);
        assert_eq!(frontier.offer(&url("https://example.com/a"), 0, &seed), Admission::Queued);
        assert_eq!(frontier.offer(&url("https://EXAMPLE.com/a/#x"), 0, &seed), Admission::Seen);
        assert_eq!(frontier.len(), 1);
    }

    #[test]
    fn test_depth_limit() {
        let mut frontier = frontier(1, 50);
        let seed = url("https://example.com/");
        assert_eq!(frontier.offer(&url("https://example.com/a"), 0, &seed), Admission::Queued);
        assert_eq!(frontier.offer(&url("https://example.com/a/b"), 1, &seed), Admission::DepthLimit);
        assert_eq!(frontier.offer(&url("https://example.com/a/b"), 1, &seed), Admission::Seen);
        assert_eq!(
            frontier.skipped_links(),
            &[SkippedLink {
                address: "https://example.com/a/b".into(),
                reason: SkipReason::DepthLimit
            }]
        );
    }

    #[test]
    fn test_zero_depth_crawls_only_the_seed() {
        let mut frontier = frontier(0, 50);
        let seed = url("https://example.com/");
        assert_eq!(frontier.offer(&url("https://example.com/a"), 0, &seed), Admission::DepthLimit);
        assert!(frontier.is_empty());
        assert_eq!(frontier.scheduled(), 1);
    }

    #[test]
    fn test_page_limit_counts_the_seed() {
        let mut frontier = frontier(5, 3);
        let seed = url("https://example.com/");
        let admissions: Vec<Admission> = (0..5)
            .map(|i| frontier.offer(&url(&format!("https://example.com/p{}", i)), 0, &seed))
            .collect();
        assert_eq!(
            admissions,
            vec![
                Admission::Queued,
                Admission::Queued,
                Admission::PageLimit,
                Admission::PageLimit,
                Admission::PageLimit
            ]
        );
        assert_eq!(frontier.scheduled(), 3);
        assert_eq!(frontier.skipped_links().len(), 3);
    }

    #[test]
    fn test_external_and_non_http_links_are_filtered() {
        let mut frontier = frontier(3, 50);
        let seed = url("https://example.com/");
        assert_eq!(frontier.offer(&url("https://other.org/a"), 0, &seed), Admission::Filtered);
        assert_eq!(frontier.offer(&url("ftp://example.com/a"), 0, &seed), Admission::Filtered);

        let config = MirrorConfig {
            follow_external_links: true,
            ..MirrorConfig::default()
        };
        let mut open = Frontier::new(&seed, &config);
        assert_eq!(open.offer(&url("https://other.org/a"), 0, &seed), Admission::Queued);
    }

    #[test]
    fn test_drain() {
        let mut frontier = frontier(3, 50);
        let seed = url("https://example.com/");
        frontier.offer(&url("https://example.com/a"), 0, &seed);
        frontier.offer(&url("https://example.com/b"), 0, &seed);
        assert_eq!(frontier.drain().len(), 2);
        assert!(frontier.next().is_none());
        assert!(frontier.skipped_links().iter().all(|s| s.reason == SkipReason::Cancelled));
        assert_eq!(frontier.skipped_links().len(), 2);
    }
}
