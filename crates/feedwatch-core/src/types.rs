use serde::{Deserialize, Serialize};
use std::fmt;

/// Business criticality of a data source.
///
/// The derived ordering is the dispatch order: `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Critical,
    High,
    Standard,
    Low,
}

impl PriorityTier {
    pub const ALL: [PriorityTier; 4] = [
        PriorityTier::Critical,
        PriorityTier::High,
        PriorityTier::Standard,
        PriorityTier::Low,
    ];

    /// Whether live-game acceleration shortens this tier's cadence.
    ///
    /// Standard and low tiers keep their base cadence to hold API spend down.
    pub fn is_accelerated(self) -> bool {
        matches!(self, PriorityTier::Critical | PriorityTier::High)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityTier::Critical => "critical",
            PriorityTier::High => "high",
            PriorityTier::Standard => "standard",
            PriorityTier::Low => "low",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PriorityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(PriorityTier::Critical),
            "high" => Ok(PriorityTier::High),
            "standard" => Ok(PriorityTier::Standard),
            "low" => Ok(PriorityTier::Low),
            other => Err(format!("unknown priority tier: {other}")),
        }
    }
}

/// Coarse operational regime of the football calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    /// September through December.
    Regular,
    /// August.
    PreSeason,
    /// January through July.
    OffSeason,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Regular => "regular",
            PhaseKind::PreSeason => "pre-season",
            PhaseKind::OffSeason => "off-season",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering_matches_dispatch_priority() {
        let mut tiers = vec![
            PriorityTier::Low,
            PriorityTier::Critical,
            PriorityTier::Standard,
            PriorityTier::High,
        ];
        tiers.sort();
        assert_eq!(tiers, PriorityTier::ALL.to_vec());
    }

    #[test]
    fn only_critical_and_high_accelerate() {
        assert!(PriorityTier::Critical.is_accelerated());
        assert!(PriorityTier::High.is_accelerated());
        assert!(!PriorityTier::Standard.is_accelerated());
        assert!(!PriorityTier::Low.is_accelerated());
    }

    #[test]
    fn phase_serializes_kebab_case() {
        let json = serde_json::to_string(&PhaseKind::PreSeason).unwrap();
        assert_eq!(json, "\"pre-season\"");
        let back: PhaseKind = serde_json::from_str("\"off-season\"").unwrap();
        assert_eq!(back, PhaseKind::OffSeason);
    }

    #[test]
    fn tier_round_trips_through_str() {
        for tier in PriorityTier::ALL {
            assert_eq!(tier.as_str().parse::<PriorityTier>().unwrap(), tier);
        }
        assert!("urgent".parse::<PriorityTier>().is_err());
    }
}
