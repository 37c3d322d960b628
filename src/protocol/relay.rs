//! Bandwidth-weighted relay selection
//!
//! Picks exits, guards and middles from a [`Consensus`], weighting each
//! candidate by its measured bandwidth times the consensus coefficient for
//! its flags in the requested position.

use super::consensus::{Consensus, RouterStatus};
use crate::error::{Result, TorError};
use rand::Rng;

/// Three hops of a circuit, entry first
#[derive(Debug, Clone, Copy)]
pub struct CircuitPath<'a> {
    pub guard: &'a RouterStatus,
    pub middle: &'a RouterStatus,
    pub exit: &'a RouterStatus,
}

/// Relay selector over one consensus snapshot
pub struct RelaySelector<'a> {
    consensus: &'a Consensus,
}

impl<'a> RelaySelector<'a> {
    pub fn new(consensus: &'a Consensus) -> Self {
        Self { consensus }
    }

    /// Select an exit relay for `port`
    ///
    /// Candidates must be Exit, Running, Valid and Fast, not BadExit, and
    /// allow `port`; with `require_stable` they must also be Stable.
    pub fn select_exit<R: Rng + ?Sized>(
        &self,
        port: u16,
        require_stable: bool,
        rng: &mut R,
    ) -> Result<&'a RouterStatus> {
        let w = &self.consensus.weights;
        let candidates = self.consensus.relays.iter().filter_map(|r| {
            let f = &r.flags;
            if !f.exit || f.bad_exit || !usable(r) || !r.ports.is_allowed(port) {
                return None;
            }
            if require_stable && !f.stable {
                return None;
            }
            let coeff = if f.guard { w.wed } else { w.wee };
            Some((r, weight(coeff, r)))
        });

        pick_weighted(candidates, rng).ok_or(TorError::NoEligibleRelay("exit"))
    }

    /// Select a guard relay outside the exit's network bucket
    ///
    /// A non-empty `or_ports` restricts candidates to those OR ports.
    pub fn select_guard<R: Rng + ?Sized>(
        &self,
        exit_ip_level: u32,
        or_ports: &[u16],
        rng: &mut R,
    ) -> Result<&'a RouterStatus> {
        let w = &self.consensus.weights;
        let candidates = self.consensus.relays.iter().filter_map(|r| {
            if !r.flags.guard || r.ip_level == exit_ip_level {
                return None;
            }
            if !or_ports.is_empty() && !or_ports.contains(&r.or_port) {
                return None;
            }
            let coeff = if r.flags.exit { w.wgd } else { w.wgg };
            Some((r, weight(coeff, r)))
        });

        pick_weighted(candidates, rng).ok_or(TorError::NoEligibleRelay("guard"))
    }

    /// Select a middle relay outside both the exit's and guard's buckets
    ///
    /// Candidates must be Running, Valid and Fast.
    pub fn select_middle<R: Rng + ?Sized>(
        &self,
        exit_ip_level: u32,
        guard_ip_level: u32,
        require_stable: bool,
        rng: &mut R,
    ) -> Result<&'a RouterStatus> {
        let w = &self.consensus.weights;
        let candidates = self.consensus.relays.iter().filter_map(|r| {
            let f = &r.flags;
            if !usable(r) || r.ip_level == exit_ip_level || r.ip_level == guard_ip_level {
                return None;
            }
            if require_stable && !f.stable {
                return None;
            }
            let coeff = match (f.guard, f.exit) {
                (true, true) => w.wmd,
                (false, true) => w.wme,
                (true, false) => w.wmg,
                (false, false) => w.wmm,
            };
            Some((r, weight(coeff, r)))
        });

        pick_weighted(candidates, rng).ok_or(TorError::NoEligibleRelay("middle"))
    }

    /// Select a full path: exit first, then a guard, then a middle
    pub fn select_path<R: Rng + ?Sized>(
        &self,
        port: u16,
        require_stable: bool,
        rng: &mut R,
    ) -> Result<CircuitPath<'a>> {
        let exit = self.select_exit(port, require_stable, rng)?;
        let guard = self.select_guard(exit.ip_level, &[], rng)?;
        let middle = self.select_middle(exit.ip_level, guard.ip_level, require_stable, rng)?;

        log::debug!("Selected path: {} -> {} -> {}", guard, middle, exit);
        Ok(CircuitPath {
            guard,
            middle,
            exit,
        })
    }
}

fn usable(relay: &RouterStatus) -> bool {
    relay.flags.running && relay.flags.valid && relay.flags.fast
}

fn weight(coeff: u32, relay: &RouterStatus) -> u64 {
    coeff as u64 * relay.bandwidth as u64
}

/// Draw one item with probability proportional to its weight
///
/// The draw is uniform over `1..=total`; candidates are walked in order,
/// subtracting each weight until the draw is used up. `None` if there are
/// no candidates or every weight is zero.
pub fn pick_weighted<T, I, R>(candidates: I, rng: &mut R) -> Option<T>
where
    I: IntoIterator<Item = (T, u64)>,
    R: Rng + ?Sized,
{
    let candidates: Vec<(T, u64)> = candidates.into_iter().collect();
    let total: u64 = candidates.iter().map(|(_, w)| *w).sum();
    if total == 0 {
        return None;
    }

    let mut draw = rng.gen_range(1..=total);
    for (item, w) in candidates {
        if draw <= w {
            return Some(item);
        }
        draw -= w;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::consensus::{BandwidthWeights, PortSet, RouterFlags};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::Ipv4Addr;

    fn relay(n: u8, flags: &str, bandwidth: u32) -> RouterStatus {
        let mut r = RouterStatus::new(
            &format!("relay{}", n),
            [n; 20],
            Ipv4Addr::new(10, n, 0, 1),
            9001,
        );
        r.flags = RouterFlags::from_words(flags);
        r.bandwidth = bandwidth;
        r.ports = PortSet::from_policy("accept 80,443").unwrap();
        r
    }

    #[test]
    fn test_pick_weighted_frequency() {
        let weights = [(0usize, 1u64), (1, 2), (2, 3), (3, 4), (4, 10)];
        let total: u64 = weights.iter().map(|(_, w)| w).sum();
        let mut rng = StdRng::seed_from_u64(20_000);
        let mut counts = [0u32; 5];

        let draws = 100_000;
        for _ in 0..draws {
            let i = pick_weighted(weights.iter().copied(), &mut rng).unwrap();
            counts[i] += 1;
        }

        for (i, w) in weights {
            let expected = w as f64 / total as f64;
            let observed = counts[i] as f64 / draws as f64;
            assert!(
                (observed - expected).abs() < 0.01,
                "relay {}: observed {} expected {}",
                i,
                observed,
                expected
            );
        }
    }

    #[test]
    fn test_pick_weighted_empty_and_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(pick_weighted(Vec::<(u8, u64)>::new(), &mut rng), None);
        assert_eq!(pick_weighted(vec![(1u8, 0), (2, 0)], &mut rng), None);

        // Zero-weight candidates are never drawn
        for _ in 0..100 {
            assert_eq!(pick_weighted(vec![(1u8, 0), (2, 5), (3, 0)], &mut rng), Some(2));
        }
    }

    #[test]
    fn test_select_exit_filters() {
        let consensus = Consensus::new(
            vec![
                relay(1, "Exit BadExit Running Valid Fast", 100),
                relay(2, "Exit Running Fast", 100),
                relay(3, "Guard Valid", 100),
                relay(4, "Exit Running Valid Fast", 100),
            ],
            BandwidthWeights::default(),
        );
        let selector = RelaySelector::new(&consensus);
        let mut rng = StdRng::seed_from_u64(2);

        for _ in 0..50 {
            assert_eq!(selector.select_exit(443, false, &mut rng).unwrap().nickname, "relay4");
        }

        // No exit allows port 22
        assert!(matches!(
            selector.select_exit(22, false, &mut rng),
            Err(TorError::NoEligibleRelay("exit"))
        ));

        // Not stable
        assert!(selector.select_exit(443, true, &mut rng).is_err());
    }

    #[test]
    fn test_select_exit_zero_weight() {
        let weights = BandwidthWeights {
            wee: 0,
            ..BandwidthWeights::default()
        };
        let consensus = Consensus::new(vec![relay(1, "Exit Running Valid Fast", 100)], weights);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            RelaySelector::new(&consensus).select_exit(80, false, &mut rng),
            Err(TorError::NoEligibleRelay(_))
        ));
    }

    #[test]
    fn test_select_guard_avoids_exit_bucket() {
        let exit = relay(1, "Exit Running Valid Fast", 100);
        let mut same_bucket = relay(2, "Guard Valid", 100);
        same_bucket.address = Ipv4Addr::new(10, 1, 0, 77);
        same_bucket.ip_level = exit.ip_level;
        let mut other_port = relay(3, "Guard Valid", 100);
        other_port.or_port = 443;

        let consensus = Consensus::new(
            vec![exit.clone(), same_bucket, other_port, relay(4, "Guard Valid", 100)],
            BandwidthWeights::default(),
        );
        let selector = RelaySelector::new(&consensus);
        let mut rng = StdRng::seed_from_u64(4);

        for _ in 0..50 {
            let guard = selector.select_guard(exit.ip_level, &[], &mut rng).unwrap();
            assert_ne!(guard.nickname, "relay2");
            let guard = selector.select_guard(exit.ip_level, &[443], &mut rng).unwrap();
            assert_eq!(guard.nickname, "relay3");
        }
        assert!(selector.select_guard(exit.ip_level, &[80], &mut rng).is_err());
    }

    #[test]
    fn test_select_middle_weights_by_role() {
        // Only Wmm is non-zero, so only the flagless relay can win
        let weights = BandwidthWeights {
            wmd: 0,
            wme: 0,
            wmg: 0,
            ..BandwidthWeights::default()
        };
        let consensus = Consensus::new(
            vec![
                relay(1, "Exit Guard Running Valid Fast", 100),
                relay(2, "Exit Running Valid Fast", 100),
                relay(3, "Guard Running Valid Fast", 100),
                relay(4, "Running Valid Fast", 1),
            ],
            weights,
        );
        let selector = RelaySelector::new(&consensus);
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..50 {
            assert_eq!(selector.select_middle(0, 0, false, &mut rng).unwrap().nickname, "relay4");
        }
    }

    #[test]
    fn test_select_path_distinct_buckets() {
        let consensus = Consensus::new(
            vec![
                relay(1, "Exit Running Valid Fast Stable", 500),
                relay(2, "Guard Running Valid Fast Stable", 500),
                relay(3, "Guard Running Valid Fast Stable", 500),
                relay(4, "Running Valid Fast Stable", 500),
                relay(5, "Running Valid Fast Stable", 500),
            ],
            BandwidthWeights::default(),
        );
        let selector = RelaySelector::new(&consensus);
        let mut rng = StdRng::seed_from_u64(6);

        for _ in 0..100 {
            let path = selector.select_path(443, true, &mut rng).unwrap();
            assert_eq!(path.exit.nickname, "relay1");
            assert!(path.guard.flags.guard);
            assert_ne!(path.guard.ip_level, path.exit.ip_level);
            assert_ne!(path.middle.ip_level, path.exit.ip_level);
            assert_ne!(path.middle.ip_level, path.guard.ip_level);
        }
    }
}
