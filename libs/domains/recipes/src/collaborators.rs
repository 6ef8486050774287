//! Narrow contracts for the two out-of-scope collaborators named in
//! SPEC_FULL.md §1: "clean HTML → text" and "parse line → segments". The
//! spec treats both as external; what's provided here are the trait
//! seams plus a minimal reference implementation so the note/ingredient
//! pipelines are runnable end to end without a real HTML cleaner or
//! ingredient grammar plugged in.

use regex::Regex;
use std::sync::LazyLock;

/// Clean-HTML → text contract consumed by `CLEAN_HTML`.
pub trait HtmlCleaner: Send + Sync {
    fn clean(&self, raw_html: &str) -> String;
}

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").expect("valid regex"));

/// Strips tags and collapses whitespace. Not an HTML parser — a stand-in
/// for the real cleaner consumed via the contract above.
#[derive(Default)]
pub struct NaiveHtmlCleaner;

impl HtmlCleaner for NaiveHtmlCleaner {
    fn clean(&self, raw_html: &str) -> String {
        let without_tags = TAG_RE.replace_all(raw_html, "\n");
        let lines: Vec<String> = without_tags
            .lines()
            .map(|line| WHITESPACE_RE.replace_all(line.trim(), " ").to_string())
            .filter(|line| !line.is_empty())
            .collect();
        lines.join("\n")
    }
}

/// One classified token within a parsed ingredient line. `rule_id`
/// identifies which grammar rule matched; the ordered sequence of
/// `rule_id`s across a line is the pattern-tracker's primary key (spec
/// §3: "the exact ordered sequence of ruleIds is the primary key").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngredientSegment {
    pub rule_id: String,
    pub text: String,
}

/// Parse-line → segments contract consumed by `PARSE_INGREDIENT_LINE`.
pub trait IngredientLineParser: Send + Sync {
    fn parse(&self, raw_text: &str) -> Vec<IngredientSegment>;
}

static QUANTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:[./]\d+)?)$").expect("valid regex"));
static UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(cup|cups|tsp|tbsp|teaspoon|tablespoon|oz|ounce|ounces|g|kg|ml|l|lb|lbs|pound|pounds|pinch|clove|cloves)s?$")
        .expect("valid regex")
});

/// Whitespace-tokenizing classifier: the first numeric token is
/// `QUANTITY`, a following unit word is `UNIT`, everything else is
/// folded into one trailing `INGREDIENT` segment. A stand-in for the
/// real ingredient grammar, consumed via the contract above.
#[derive(Default)]
pub struct NaiveIngredientLineParser;

impl IngredientLineParser for NaiveIngredientLineParser {
    fn parse(&self, raw_text: &str) -> Vec<IngredientSegment> {
        let mut segments = Vec::new();
        let mut rest: Vec<&str> = Vec::new();

        for (idx, token) in raw_text.split_whitespace().enumerate() {
            if idx == 0 && QUANTITY_RE.is_match(token) {
                segments.push(IngredientSegment {
                    rule_id: "QUANTITY".to_string(),
                    text: token.to_string(),
                });
                continue;
            }
            if segments.len() == 1 && UNIT_RE.is_match(token) {
                segments.push(IngredientSegment {
                    rule_id: "UNIT".to_string(),
                    text: token.to_string(),
                });
                continue;
            }
            rest.push(token);
        }

        if !rest.is_empty() {
            segments.push(IngredientSegment {
                rule_id: "INGREDIENT".to_string(),
                text: rest.join(" "),
            });
        }

        segments
    }
}
