//! Premium detection: keyword matching with a border-color fallback.

use anyhow::Result;
use regex::Regex;

/// Channel spread below which an RGB triple counts as neutral gray.
const GRAY_SPREAD: i64 = 8;

/// Decides whether a card is premium from its text fields and, when those
/// are inconclusive, from the color of its frame.
#[derive(Debug)]
pub struct Classifier {
    words: Vec<String>,
    rgb: Regex,
}

impl Classifier {
    /// Build a classifier over an already lower-cased keyword list.
    pub fn new(words: &[String]) -> Result<Self> {
        Ok(Self {
            words: words.to_vec(),
            rgb: Regex::new(r"rgb\(\s*(\d+),\s*(\d+),\s*(\d+)\s*\)")?,
        })
    }

    /// Keyword path: true if any keyword is a substring of title or badge,
    /// case-insensitively. A positive here short-circuits the visual probe.
    pub fn keyword_premium(&self, title: &str, badge: &str) -> bool {
        let t = title.to_lowercase();
        let b = badge.to_lowercase();
        self.words.iter().any(|w| t.contains(w.as_str()) || b.contains(w.as_str()))
    }

    /// Visual path over the probed frame color string.
    ///
    /// `None` means the live probe failed or returned nothing; both fail
    /// open. Only an explicit `transparent`/`none` or a near-gray RGB
    /// triple count as not premium - the bias is to over-buy, not to miss.
    pub fn border_premium(&self, probed: Option<&str>) -> bool {
        let color = match probed {
            Some(c) if !c.trim().is_empty() => c.to_lowercase(),
            _ => return true,
        };
        if color.contains("transparent") || color.trim() == "none" {
            return false;
        }
        if let Some(caps) = self.rgb.captures(&color) {
            let parsed: Option<(i64, i64, i64)> = (|| {
                let r = caps.get(1)?.as_str().parse().ok()?;
                let g = caps.get(2)?.as_str().parse().ok()?;
                let b = caps.get(3)?.as_str().parse().ok()?;
                Some((r, g, b))
            })();
            return match parsed {
                Some((r, g, b)) => {
                    let near_gray = (r - g).abs() < GRAY_SPREAD
                        && (g - b).abs() < GRAY_SPREAD
                        && (r - b).abs() < GRAY_SPREAD;
                    !near_gray
                }
                // Numeric overflow in a capture: unparseable, fail open.
                None => true,
            };
        }
        // No rgb() triple at all - gradients, named colors, whatever.
        true
    }
}

/// Split a comma-separated keyword option into trimmed, lower-cased,
/// non-empty entries.
pub fn parse_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(words: &[&str]) -> Classifier {
        let words: Vec<String> = words.iter().map(|w| w.to_string()).collect();
        Classifier::new(&words).unwrap()
    }

    #[test]
    fn keyword_matches_title_substring() {
        let c = classifier(&["premium", "премиум"]);
        assert!(c.keyword_premium("Premium Star", ""));
        assert!(c.keyword_premium("SUPER-PREMIUM BOX", ""));
        assert!(!c.keyword_premium("Cool Gift", ""));
    }

    #[test]
    fn keyword_matches_badge_when_title_empty() {
        let c = classifier(&["premium", "премиум"]);
        assert!(c.keyword_premium("", "премиум"));
        assert!(c.keyword_premium("", "ПРЕМИУМ"));
        assert!(!c.keyword_premium("", "limited"));
    }

    #[test]
    fn empty_keyword_list_never_matches() {
        let c = classifier(&[]);
        assert!(!c.keyword_premium("Premium Star", "premium"));
    }

    #[test]
    fn border_fails_open_on_missing_signal() {
        let c = classifier(&[]);
        assert!(c.border_premium(None));
        assert!(c.border_premium(Some("")));
        assert!(c.border_premium(Some("   ")));
    }

    #[test]
    fn border_rejects_transparent_and_none() {
        let c = classifier(&[]);
        assert!(!c.border_premium(Some("transparent")));
        assert!(!c.border_premium(Some("none")));
        assert!(!c.border_premium(Some("  none  ")));
    }

    #[test]
    fn border_rejects_near_gray() {
        let c = classifier(&[]);
        assert!(!c.border_premium(Some("rgb(128, 128, 128)")));
        assert!(!c.border_premium(Some("rgb(120, 125, 127)")));
        assert!(!c.border_premium(Some("rgb(0, 0, 0)")));
    }

    #[test]
    fn border_accepts_colored_triples() {
        let c = classifier(&[]);
        assert!(c.border_premium(Some("rgb(255, 0, 0)")));
        assert!(c.border_premium(Some("rgb(200, 150, 40)")));
        // Spread of exactly 8 is already colored.
        assert!(c.border_premium(Some("rgb(100, 108, 100)")));
    }

    #[test]
    fn border_spread_below_threshold_is_gray() {
        let c = classifier(&[]);
        assert!(!c.border_premium(Some("rgb(100, 107, 100)")));
    }

    #[test]
    fn border_reads_triple_inside_shadow_string() {
        let c = classifier(&[]);
        assert!(c.border_premium(Some("rgb(255, 64, 0) 0px 0px 6px 2px")));
        assert!(!c.border_premium(Some("rgb(80, 80, 80) 0px 1px 2px")));
    }

    #[test]
    fn border_fails_open_without_rgb_form() {
        let c = classifier(&[]);
        assert!(c.border_premium(Some("gold")));
        assert!(c.border_premium(Some("linear-gradient(45deg, red, blue)")));
        // rgba() does not match the rgb() pattern and falls through open.
        assert!(c.border_premium(Some("rgba(0, 0, 0, 0.5)")));
    }

    #[test]
    fn parse_keywords_trims_lowers_and_drops_empties() {
        assert_eq!(
            parse_keywords(" Premium , ПРЕМИУМ ,, rare "),
            vec!["premium", "премиум", "rare"]
        );
        assert!(parse_keywords("").is_empty());
        assert!(parse_keywords(" , ,").is_empty());
    }

    #[test]
    fn scenario_keywords_flag_expected_items() {
        let c = classifier(&["premium", "премиум"]);
        assert!(!c.keyword_premium("Cool Gift", ""));
        assert!(c.keyword_premium("Premium Star", ""));
        assert!(c.keyword_premium("", "премиум"));
    }
}
