//! Parsing of free-form assessor replies
//!
//! The assessor is asked for a JSON object, but replies often wrap it in prose
//! or skip JSON entirely. The first `{ ... }` span is tried first; failing
//! that, labelled values are scraped from the text. A reply from which no
//! score, risk level or verdict can be recovered yields `None`.

use std::sync::OnceLock;

use exec_common::policy::risk_level_for_score;
use exec_common::RiskLevel;
use regex::Regex;
use serde_json::Value;

use crate::assessment::{clamp_score, AssessorVerdict, RiskAssessment};

struct TextPatterns {
    json_block: Regex,
    risk_level: Regex,
    score: Regex,
    score_fraction: Regex,
    verdict: Regex,
    bullet: Regex,
    summary: Regex,
}

fn text_patterns() -> &'static TextPatterns {
    static PATTERNS: OnceLock<TextPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |re: &str| Regex::new(re).expect("static pattern is valid");
        TextPatterns {
            json_block: compile(r"\{[\s\S]*\}"),
            risk_level: compile(r"(?i)(?:risk\s*level|risk):\s*\**\s*(LOW|MEDIUM|HIGH)"),
            score: compile(r"(?i)(?:security\s*score|score):\s*\**\s*(\d+)"),
            score_fraction: compile(r"(\d+)\s*/\s*100"),
            verdict: compile(r"(?i)(?:verdict|overall\s*verdict):\s*\**\s*(SAFE|UNSAFE)"),
            bullet: compile(r"^\s*[-•*]\s*(.+)$"),
            summary: compile(r"(?i)(?:summary|conclusion):\s*(.+)"),
        }
    })
}

/// Default score implied by a risk level alone
pub fn score_for_risk_level(level: RiskLevel) -> u8 {
    match level {
        RiskLevel::Low => 85,
        RiskLevel::Medium => 65,
        RiskLevel::High => 25,
    }
}

/// Default score implied by a verdict alone
pub fn score_for_verdict(verdict: AssessorVerdict) -> u8 {
    match verdict {
        AssessorVerdict::Safe => 85,
        AssessorVerdict::Unsafe => 25,
    }
}

fn parse_risk_level(raw: &str) -> Option<RiskLevel> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "LOW" => Some(RiskLevel::Low),
        "MEDIUM" => Some(RiskLevel::Medium),
        "HIGH" => Some(RiskLevel::High),
        _ => None,
    }
}

fn parse_verdict(raw: &str) -> Option<AssessorVerdict> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "SAFE" => Some(AssessorVerdict::Safe),
        "UNSAFE" => Some(AssessorVerdict::Unsafe),
        _ => None,
    }
}

/// Fill in whatever the reply left out. Score wins over level, level over verdict.
fn complete(
    score: Option<u8>,
    risk_level: Option<RiskLevel>,
    verdict: Option<AssessorVerdict>,
    risk_factors: Vec<String>,
    recommendations: Vec<String>,
    summary: Option<String>,
) -> Option<RiskAssessment> {
    let security_score = score
        .or_else(|| risk_level.map(score_for_risk_level))
        .or_else(|| verdict.map(score_for_verdict))?;

    Some(RiskAssessment {
        risk_level: risk_level.unwrap_or_else(|| risk_level_for_score(security_score)),
        security_score,
        verdict: verdict.unwrap_or_else(|| AssessorVerdict::for_score(security_score)),
        risk_factors,
        recommendations,
        summary: summary.unwrap_or_else(|| "Security analysis completed".to_string()),
    })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn field<'a>(object: &'a serde_json::Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| object.get(*name))
}

fn parse_json_reply(text: &str) -> Option<RiskAssessment> {
    let block = text_patterns().json_block.find(text)?;
    let value: Value = serde_json::from_str(block.as_str()).ok()?;
    let object = value.as_object()?;

    let score = match field(object, &["securityScore", "security_score", "score"]) {
        Some(Value::Number(n)) => n.as_f64().map(clamp_score),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().map(clamp_score),
        _ => None,
    };
    let risk_level = field(object, &["riskLevel", "risk_level"])
        .and_then(Value::as_str)
        .and_then(parse_risk_level);
    let verdict = field(object, &["verdict"])
        .and_then(Value::as_str)
        .and_then(parse_verdict);
    let summary = field(object, &["summary"])
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    complete(
        score,
        risk_level,
        verdict,
        string_list(field(object, &["riskFactors", "risk_factors"])),
        string_list(field(object, &["recommendations"])),
        summary,
    )
}

fn parse_text_reply(text: &str) -> Option<RiskAssessment> {
    let patterns = text_patterns();

    let risk_level = patterns
        .risk_level
        .captures(text)
        .and_then(|c| parse_risk_level(&c[1]));
    let score = patterns
        .score
        .captures(text)
        .or_else(|| patterns.score_fraction.captures(text))
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(clamp_score);
    let verdict = patterns
        .verdict
        .captures(text)
        .and_then(|c| parse_verdict(&c[1]));
    let summary = patterns
        .summary
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty());

    #[derive(PartialEq)]
    enum Section {
        RiskFactors,
        Recommendations,
    }

    let mut section = Section::RiskFactors;
    let mut risk_factors = Vec::new();
    let mut recommendations = Vec::new();

    for line in text.lines() {
        if let Some(captures) = patterns.bullet.captures(line) {
            let item = captures[1].trim().to_string();
            if section == Section::Recommendations {
                recommendations.push(item);
            } else {
                risk_factors.push(item);
            }
            continue;
        }

        let lower = line.to_ascii_lowercase();
        if lower.contains("recommendation") {
            section = Section::Recommendations;
        } else if lower.contains("risk factor") {
            section = Section::RiskFactors;
        }
    }

    complete(
        score,
        risk_level,
        verdict,
        risk_factors,
        recommendations,
        summary,
    )
}

/// Recover a [`RiskAssessment`] from an assessor reply, or `None` if nothing usable was found.
pub fn parse_assessor_reply(text: &str) -> Option<RiskAssessment> {
    parse_json_reply(text).or_else(|| parse_text_reply(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clean_json() {
        let reply = r#"{"riskLevel":"LOW","securityScore":92,"verdict":"SAFE","riskFactors":[],"recommendations":["Pin versions"],"summary":"Pure computation."}"#;
        let a = parse_assessor_reply(reply).unwrap();
        assert_eq!(a.security_score, 92);
        assert_eq!(a.risk_level, RiskLevel::Low);
        assert_eq!(a.verdict, AssessorVerdict::Safe);
        assert_eq!(a.recommendations, vec!["Pin versions".to_string()]);
        assert_eq!(a.summary, "Pure computation.");
    }

    #[test]
    fn test_parse_json_wrapped_in_prose() {
        let reply = "Here is my analysis:\n```json\n{\"riskLevel\": \"HIGH\", \"securityScore\": \"12\", \"verdict\": \"UNSAFE\", \"riskFactors\": [\"shell access\"]}\n```\nThanks.";
        let a = parse_assessor_reply(reply).unwrap();
        assert_eq!(a.security_score, 12);
        assert_eq!(a.risk_level, RiskLevel::High);
        assert_eq!(a.risk_factors, vec!["shell access".to_string()]);
    }

    #[test]
    fn test_json_score_is_clamped() {
        let a = parse_assessor_reply(r#"{"securityScore": 140}"#).unwrap();
        assert_eq!(a.security_score, 100);
        assert_eq!(a.risk_level, RiskLevel::Low);
        assert_eq!(a.verdict, AssessorVerdict::Safe);
    }

    #[test]
    fn test_json_without_score_uses_risk_level_default() {
        let a = parse_assessor_reply(r#"{"riskLevel":"MEDIUM"}"#).unwrap();
        assert_eq!(a.security_score, 65);
        assert_eq!(a.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_parse_text_reply() {
        let reply = "Risk Level: HIGH\nSecurity Score: 20\nVerdict: UNSAFE\n\nRisk factors:\n- Executes shell commands\n- Reads /etc/passwd\n\nRecommendations:\n* Remove os.system\n\nSummary: The code tries to escape the sandbox.";
        let a = parse_assessor_reply(reply).unwrap();
        assert_eq!(a.security_score, 20);
        assert_eq!(a.risk_level, RiskLevel::High);
        assert_eq!(a.verdict, AssessorVerdict::Unsafe);
        assert_eq!(a.risk_factors.len(), 2);
        assert_eq!(a.recommendations, vec!["Remove os.system".to_string()]);
        assert_eq!(a.summary, "The code tries to escape the sandbox.");
    }

    #[test]
    fn test_text_fraction_score() {
        let a = parse_assessor_reply("I would rate this 75/100 overall.").unwrap();
        assert_eq!(a.security_score, 75);
        assert_eq!(a.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_text_verdict_only() {
        let a = parse_assessor_reply("Overall verdict: UNSAFE").unwrap();
        assert_eq!(a.security_score, 25);
        assert_eq!(a.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_unusable_reply() {
        assert!(parse_assessor_reply("I cannot help with that.").is_none());
        assert!(parse_assessor_reply("").is_none());
    }
}
