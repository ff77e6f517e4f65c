use crate::common::Address;

use super::HopSpec;

/// One negotiation phase: ask `hop` to open a tunnel toward `tunnel_target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub hop: HopSpec,
    pub tunnel_target: Address,
}

/// The route through a proxy chain: A -> B -> C -> target.
///
/// The physical connection goes to the first hop (or straight to the target
/// for an empty chain); hop `i` is then asked to tunnel toward hop `i + 1`,
/// and the last hop toward the final target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPlan {
    first_dial: Address,
    target: Address,
    steps: Vec<PlanStep>,
}

impl TunnelPlan {
    pub fn new(hops: &[HopSpec], target: &Address) -> Self {
        let steps = hops
            .iter()
            .enumerate()
            .map(|(idx, hop)| PlanStep {
                hop: hop.clone(),
                tunnel_target: hops
                    .get(idx + 1)
                    .map(|next| next.address.clone())
                    .unwrap_or_else(|| target.clone()),
            })
            .collect();

        let first_dial = hops
            .first()
            .map(|hop| hop.address.clone())
            .unwrap_or_else(|| target.clone());

        Self {
            first_dial,
            target: target.clone(),
            steps,
        }
    }

    /// Where the physical connection is opened.
    pub fn first_dial(&self) -> &Address {
        &self.first_dial
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn tunnel_target(&self, index: usize) -> Option<&Address> {
        self.steps.get(index).map(|step| &step.tunnel_target)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hops(n: usize) -> Vec<HopSpec> {
        (0..n)
            .map(|i| {
                let addr = Address::new(&format!("proxy{}.local", i), 1000 + i as u16);
                if i % 2 == 0 {
                    HopSpec::socks5(addr)
                } else {
                    HopSpec::http(addr)
                }
            })
            .collect()
    }

    #[test]
    fn empty_chain_dials_target_directly() {
        let target = Address::new("example.com", 443);
        let plan = TunnelPlan::new(&[], &target);
        assert!(plan.is_empty());
        assert_eq!(plan.first_dial(), &target);
        assert_eq!(plan.tunnel_target(0), None);
    }

    #[test]
    fn single_hop_tunnels_to_target() {
        let target = Address::new("example.com", 443);
        let chain = hops(1);
        let plan = TunnelPlan::new(&chain, &target);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.first_dial(), &chain[0].address);
        assert_eq!(plan.tunnel_target(0), Some(&target));
    }

    #[test]
    fn each_hop_tunnels_to_the_next() {
        let target = Address::new("h", 9);
        for n in 1..6 {
            let chain = hops(n);
            let plan = TunnelPlan::new(&chain, &target);
            assert_eq!(plan.len(), n);
            assert_eq!(plan.first_dial(), &chain[0].address);
            for i in 0..n {
                let expected = if i + 1 < n {
                    &chain[i + 1].address
                } else {
                    &target
                };
                assert_eq!(plan.tunnel_target(i), Some(expected), "n={} i={}", n, i);
                assert_eq!(plan.steps()[i].hop, chain[i]);
            }
            assert_eq!(plan.tunnel_target(n), None);
        }
    }

    #[test]
    fn plan_keeps_final_target() {
        let target = Address::new("10.1.1.1", 22);
        let plan = TunnelPlan::new(&hops(3), &target);
        assert_eq!(plan.target(), &target);
    }
}
