/// Spork routing
///
/// Sporks partition chain history: a block is only served by the endpoints
/// of the spork that produced it. The router is a static, ordered table
/// mapping height to a spork entry; all sub-calls for one block must go to
/// endpoints of that entry.

use std::time::Duration;

use crate::config::SporkEntry;
use crate::error::IndexError;

#[derive(Debug, Clone)]
pub struct SporkRouter {
    /// Sorted ascending by root_height.
    entries: Vec<SporkEntry>,
    /// Heights below this go through the raw decode path.
    crescendo_height: u64,
    default_timeout: Duration,
}

impl SporkRouter {
    pub fn new(
        mut entries: Vec<SporkEntry>,
        crescendo_height: u64,
        default_timeout: Duration,
    ) -> Result<Self, IndexError> {
        if entries.is_empty() {
            return Err(IndexError::Config("spork table must not be empty".into()));
        }
        entries.sort_by_key(|e| e.root_height);
        for pair in entries.windows(2) {
            if pair[0].root_height == pair[1].root_height {
                return Err(IndexError::Config(format!(
                    "duplicate spork root height {}",
                    pair[0].root_height
                )));
            }
        }
        for entry in &entries {
            if entry.endpoints.is_empty() {
                return Err(IndexError::Config(format!(
                    "spork {} has no endpoints",
                    entry.spork_id
                )));
            }
        }
        Ok(Self {
            entries,
            crescendo_height,
            default_timeout,
        })
    }

    /// The unique entry with the largest root_height at or below `height`.
    pub fn route_for(&self, height: u64) -> Result<&SporkEntry, IndexError> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.root_height <= height)
            .ok_or_else(|| {
                IndexError::Config(format!(
                    "height {} is below the first spork root {}",
                    height, self.entries[0].root_height
                ))
            })
    }

    /// True when transaction results at this height must bypass the modern
    /// codec and be decoded from raw bytes.
    pub fn uses_raw_decode(&self, height: u64) -> bool {
        height < self.crescendo_height
    }

    pub fn crescendo_height(&self) -> u64 {
        self.crescendo_height
    }

    /// Call timeout for a height: the routing entry's override, or the
    /// global default.
    pub fn timeout_for(&self, height: u64) -> Duration {
        self.route_for(height)
            .ok()
            .and_then(|e| e.rpc_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Split an inclusive window so no piece straddles a spork root. A
    /// window crossing a boundary becomes two windows, each routed to its
    /// own pool.
    pub fn split_window(&self, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        if lo > hi {
            return Vec::new();
        }
        let mut cuts: Vec<u64> = self
            .entries
            .iter()
            .map(|e| e.root_height)
            .filter(|r| *r > lo && *r <= hi)
            .collect();
        cuts.sort_unstable();

        let mut windows = Vec::with_capacity(cuts.len() + 1);
        let mut start = lo;
        for cut in cuts {
            windows.push((start, cut - 1));
            start = cut;
        }
        windows.push((start, hi));
        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, root: u64) -> SporkEntry {
        SporkEntry {
            spork_id: id.to_string(),
            root_height: root,
            endpoints: vec![format!("http://{id}:9000")],
            rpc_timeout_secs: None,
        }
    }

    fn router() -> SporkRouter {
        SporkRouter::new(
            vec![entry("s1", 0), entry("s2", 1000), entry("s3", 5000)],
            100,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[test]
    fn test_route_for_picks_largest_root_at_or_below() {
        let r = router();
        assert_eq!(r.route_for(0).unwrap().spork_id, "s1");
        assert_eq!(r.route_for(999).unwrap().spork_id, "s1");
        assert_eq!(r.route_for(1000).unwrap().spork_id, "s2");
        assert_eq!(r.route_for(4999).unwrap().spork_id, "s2");
        assert_eq!(r.route_for(5000).unwrap().spork_id, "s3");
        assert_eq!(r.route_for(u64::MAX).unwrap().spork_id, "s3");
    }

    #[test]
    fn test_route_below_first_root_is_an_error() {
        let r = SporkRouter::new(vec![entry("s1", 500)], 0, Duration::from_secs(30)).unwrap();
        assert!(r.route_for(499).is_err());
        assert!(r.route_for(500).is_ok());
    }

    #[test]
    fn test_uses_raw_decode_boundary() {
        let r = router();
        assert!(r.uses_raw_decode(99));
        assert!(!r.uses_raw_decode(100));
    }

    #[test]
    fn test_split_window_at_boundaries() {
        let r = router();
        // No boundary inside
        assert_eq!(r.split_window(10, 20), vec![(10, 20)]);
        // One boundary at 1000
        assert_eq!(r.split_window(995, 1005), vec![(995, 999), (1000, 1005)]);
        // Two boundaries
        assert_eq!(
            r.split_window(999, 5001),
            vec![(999, 999), (1000, 4999), (5000, 5001)]
        );
        // Window starting exactly on a root is not split
        assert_eq!(r.split_window(1000, 1010), vec![(1000, 1010)]);
        // Empty
        assert!(r.split_window(5, 4).is_empty());
    }

    #[test]
    fn test_per_spork_timeout_override() {
        let mut slow = entry("old", 0);
        slow.rpc_timeout_secs = Some(120);
        let r = SporkRouter::new(vec![slow, entry("new", 1000)], 0, Duration::from_secs(30)).unwrap();
        assert_eq!(r.timeout_for(10), Duration::from_secs(120));
        assert_eq!(r.timeout_for(2000), Duration::from_secs(30));
    }

    #[test]
    fn test_duplicate_roots_rejected() {
        let err = SporkRouter::new(
            vec![entry("a", 0), entry("b", 0)],
            0,
            Duration::from_secs(30),
        );
        assert!(err.is_err());
    }
}
