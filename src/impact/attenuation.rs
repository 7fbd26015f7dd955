//! Per-hop attenuation for impact propagation
//!
//! A score crossing an edge is scaled by the edge weight and by
//! `1 / (depth + 1) * relationship_multiplier(kind)`, so both distance and the
//! kind of relationship dampen the signal.

use crate::model::RelationKind;

/// Fixed per-relationship multiplier.
///
/// # Examples
///
/// ```
/// use sikg::impact::attenuation::relationship_multiplier;
/// use sikg::model::RelationKind;
///
/// assert_eq!(relationship_multiplier(RelationKind::Tests), 1.0);
/// assert_eq!(relationship_multiplier(RelationKind::Imports), 0.6);
/// assert_eq!(relationship_multiplier(RelationKind::Unknown), 0.5);
/// ```
pub fn relationship_multiplier(kind: RelationKind) -> f64 {
    match kind {
        RelationKind::Tests | RelationKind::IsTestedBy => 1.0,
        RelationKind::Calls | RelationKind::InheritsFrom | RelationKind::Modifies => 0.9,
        RelationKind::Uses | RelationKind::BelongsTo => 0.8,
        RelationKind::DependsOn => 0.7,
        RelationKind::Imports => 0.6,
        RelationKind::Unknown => 0.5,
    }
}

/// Attenuation applied when leaving a node at `depth` through an edge of `kind`.
///
/// # Examples
///
/// ```
/// use sikg::impact::attenuation::attenuation;
/// use sikg::model::RelationKind;
///
/// assert_eq!(attenuation(0, RelationKind::Tests), 1.0);
/// assert_eq!(attenuation(1, RelationKind::Tests), 0.5);
/// assert!((attenuation(0, RelationKind::Calls) - 0.9).abs() < 1e-12);
/// ```
pub fn attenuation(depth: usize, kind: RelationKind) -> f64 {
    (1.0 / (depth as f64 + 1.0)) * relationship_multiplier(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipliers_are_bounded() {
        for kind in RelationKind::ALL {
            let m = relationship_multiplier(kind);
            assert!(m > 0.0 && m <= 1.0, "{kind} multiplier {m}");
        }
    }

    #[test]
    fn attenuation_decreases_with_depth() {
        for kind in RelationKind::ALL {
            let mut last = f64::INFINITY;
            for depth in 0..6 {
                let a = attenuation(depth, kind);
                assert!(a < last);
                last = a;
            }
        }
    }

    #[test]
    fn attenuation_third_hop_depends_on() {
        let a = attenuation(2, RelationKind::DependsOn);
        assert!((a - 0.7 / 3.0).abs() < 1e-12);
    }
}
