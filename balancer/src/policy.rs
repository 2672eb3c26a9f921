//! Backend selection

use crate::backend::BackendView;
use crate::config::Policy;
use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks backends according to the configured policy
///
/// Selection only reads `BackendView` copies; the router re-validates the
/// choice under the backend's lock when attaching.
pub struct Selector {
    policy: Policy,
    overload_multiplier: f64,
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(policy: Policy, overload_multiplier: f64) -> Self {
        Self {
            policy,
            overload_multiplier,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Index of the backend to try next, or None if none has room
    pub fn choose<R: Rng + ?Sized>(&self, views: &[BackendView], rng: &mut R) -> Option<usize> {
        match self.policy {
            Policy::RoundRobin => self.next_round_robin(views),
            Policy::LeastLoaded => least_loaded(views, self.overload_multiplier, rng),
        }
    }

    fn next_round_robin(&self, views: &[BackendView]) -> Option<usize> {
        if views.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % views.len();
        (0..views.len())
            .map(|offset| &views[(start + offset) % views.len()])
            .find(|view| view.has_room())
            .map(|view| view.index)
    }
}

fn least_loaded<R: Rng + ?Sized>(
    views: &[BackendView],
    overload_multiplier: f64,
    rng: &mut R,
) -> Option<usize> {
    let candidates: Vec<&BackendView> = views.iter().filter(|v| v.has_room()).collect();
    let candidate = *candidates.choose(rng)?;

    let healthy: Vec<&BackendView> = views.iter().filter(|v| v.healthy).collect();
    let average =
        healthy.iter().map(|v| v.load).sum::<usize>() as f64 / healthy.len().max(1) as f64;

    if candidate.load as f64 > average * overload_multiplier {
        let lightest = candidates
            .iter()
            .min_by_key(|v| (v.load, v.index))
            .map(|v| v.index)?;
        debug!(
            "Backend {} overloaded ({} vs average {:.1}), using backend {}",
            candidate.index, candidate.load, average, lightest
        );
        return Some(lightest);
    }

    Some(candidate.index)
}
