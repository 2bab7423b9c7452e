//! Smooth weighted round-robin schedule construction.
//!
//! Backends are laid out on the ring in proportion to their rate limits:
//! a backend rated 20 req/s appears twice as often as one rated 10 req/s.
//! Weights are first reduced by their gcd so the ring is as short as
//! possible, then ordered with the classic smooth WRR credit scan so no
//! backend gets a long consecutive run while another is due.

use std::sync::Arc;

use super::Node;
use super::ring::Ring;

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn gcd_all(weights: &[u64]) -> u64 {
    weights.iter().copied().fold(0, gcd)
}

/// Compute the slot order for the given weights.
///
/// Returns a sequence of indices into `weights` of length
/// `sum(w_i / gcd)`, in which index `i` occurs exactly `w_i / gcd` times,
/// interleaved smoothly. Zero weights never occur in practice (the catalog
/// enforces `rate_limit >= 1`) and yield no slots.
pub fn smooth_weighted_order(weights: &[u64]) -> Vec<usize> {
    let divisor = gcd_all(weights);
    if divisor == 0 {
        return Vec::new();
    }

    let ratios: Vec<i64> = weights.iter().map(|w| (w / divisor) as i64).collect();
    let total: i64 = ratios.iter().sum();

    let mut credits = vec![0i64; ratios.len()];
    let mut order = Vec::with_capacity(total as usize);

    for _ in 0..total {
        let mut best = None;
        for (i, ratio) in ratios.iter().enumerate() {
            if *ratio == 0 {
                continue;
            }
            credits[i] += ratio;
            // Ties break toward the lowest index.
            match best {
                Some((_, best_credit)) if credits[i] <= best_credit => {}
                _ => best = Some((i, credits[i])),
            }
        }
        if let Some((selected, _)) = best {
            credits[selected] -= total;
            order.push(selected);
        }
    }

    order
}

/// Build a dispatch ring from the given nodes, weighted by rate limit.
///
/// Every slot for a node clones the same `Arc`, so an activity flip on the
/// node is observed by all of its occurrences. An empty node list yields
/// an empty ring. Slots are inserted in reverse so that a head-first lap
/// of the ring reads in schedule order.
pub fn build_ring(nodes: &[Arc<Node>]) -> Ring<Arc<Node>> {
    let mut ring = Ring::new();
    let weights: Vec<u64> = nodes.iter().map(|n| u64::from(n.rate_limit())).collect();
    for idx in smooth_weighted_order(&weights).into_iter().rev() {
        ring.add(Arc::clone(&nodes[idx]));
    }
    ring
}
