use serde::Serialize;

/// A GICS sector as stored in the sector map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GicsSector {
    pub code: &'static str,
    pub label: &'static str,
}

/// Closed vocabulary from provider sector names to GICS sectors.
pub const GICS_SECTORS: &[(&str, GicsSector)] = &[
    (
        "communication services",
        GicsSector {
            code: "50",
            label: "Communication Services",
        },
    ),
    (
        "consumer cyclical",
        GicsSector {
            code: "25",
            label: "Consumer Discretionary",
        },
    ),
    (
        "consumer defensive",
        GicsSector {
            code: "30",
            label: "Consumer Staples",
        },
    ),
    (
        "energy",
        GicsSector {
            code: "10",
            label: "Energy",
        },
    ),
    (
        "financial services",
        GicsSector {
            code: "40",
            label: "Financials",
        },
    ),
    (
        "healthcare",
        GicsSector {
            code: "35",
            label: "Health Care",
        },
    ),
    (
        "industrials",
        GicsSector {
            code: "20",
            label: "Industrials",
        },
    ),
    (
        "technology",
        GicsSector {
            code: "45",
            label: "Information Technology",
        },
    ),
    (
        "basic materials",
        GicsSector {
            code: "15",
            label: "Materials",
        },
    ),
    (
        "real estate",
        GicsSector {
            code: "60",
            label: "Real Estate",
        },
    ),
    (
        "utilities",
        GicsSector {
            code: "55",
            label: "Utilities",
        },
    ),
];

/// Map a raw provider sector onto the vocabulary. Matching ignores case and
/// surrounding whitespace; absent or unknown sectors yield `None`.
pub fn classify_sector(raw: Option<&str>) -> Option<GicsSector> {
    let key = raw?.trim().to_lowercase();
    if key.is_empty() {
        return None;
    }

    GICS_SECTORS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, sector)| *sector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_provider_names_to_gics_pairs() {
        assert_eq!(
            classify_sector(Some(" Technology ")),
            Some(GicsSector {
                code: "45",
                label: "Information Technology",
            })
        );
        assert_eq!(
            classify_sector(Some("CONSUMER CYCLICAL")).map(|sector| sector.code),
            Some("25")
        );
    }

    #[test]
    fn unknown_or_missing_sector_is_unmapped() {
        assert_eq!(classify_sector(None), None);
        assert_eq!(classify_sector(Some("")), None);
        assert_eq!(classify_sector(Some("Information Technology")), None);
        assert_eq!(classify_sector(Some("Crypto")), None);
    }

    #[test]
    fn every_emitted_pair_comes_from_the_vocabulary() {
        let inputs = [
            "technology",
            "Healthcare",
            "financial services",
            "Financial",
            "tech",
            "utilities ",
            "Real  Estate",
        ];

        for input in inputs {
            if let Some(sector) = classify_sector(Some(input)) {
                assert!(GICS_SECTORS.iter().any(|(_, known)| *known == sector));
            }
        }
    }

    #[test]
    fn vocabulary_codes_are_unique() {
        let mut codes: Vec<_> = GICS_SECTORS.iter().map(|(_, sector)| sector.code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), GICS_SECTORS.len());
    }
}
