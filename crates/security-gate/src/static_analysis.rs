//! Deterministic static analyzer used when the external assessor is unavailable
//!
//! Scoring starts at 100. Every distinct finding records a risk factor and
//! deducts a fixed weight:
//!
//! | finding | weight |
//! |---|---|
//! | denylisted import | 15 |
//! | command execution | 20 |
//! | raw file operation | 10 |
//! | raw network call | 15 |
//!
//! The final score maps to risk level and verdict with the same thresholds
//! the external assessor uses.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use exec_common::policy::risk_level_for_score;
use regex::Regex;

use crate::assessment::{AssessorVerdict, RiskAssessment};

pub const IMPORT_WEIGHT: u8 = 15;
pub const COMMAND_WEIGHT: u8 = 20;
pub const FILE_WEIGHT: u8 = 10;
pub const NETWORK_WEIGHT: u8 = 15;

/// Modules whose import alone is a risk factor
pub const DENYLISTED_MODULES: &[&str] = &[
    "os", "subprocess", "sys", "socket", "requests", "urllib", "http", "ftplib", "smtplib",
    "pickle", "marshal",
];

struct CallPattern {
    label: &'static str,
    regex: &'static str,
}

const COMMAND_PATTERNS: &[CallPattern] = &[
    CallPattern { label: "os.system", regex: r"\bos\.system\s*\(" },
    CallPattern { label: "os.popen", regex: r"\bos\.popen\s*\(" },
    CallPattern { label: "subprocess.", regex: r"\bsubprocess\." },
    CallPattern { label: "exec(", regex: r"\bexec\s*\(" },
    CallPattern { label: "eval(", regex: r"\beval\s*\(" },
];

const FILE_PATTERNS: &[CallPattern] = &[
    CallPattern { label: "open(", regex: r"\bopen\s*\(" },
    CallPattern { label: "file(", regex: r"\bfile\s*\(" },
    CallPattern { label: "read(", regex: r"\bread\s*\(" },
    CallPattern { label: "write(", regex: r"\bwrite\s*\(" },
    CallPattern { label: "remove(", regex: r"\bremove\s*\(" },
    CallPattern { label: "delete(", regex: r"\bdelete\s*\(" },
];

const NETWORK_PATTERNS: &[CallPattern] = &[
    CallPattern { label: "requests.", regex: r"\brequests\." },
    CallPattern { label: "urllib.", regex: r"\burllib\." },
    CallPattern { label: "socket.", regex: r"\bsocket\." },
    CallPattern { label: "http.", regex: r"\bhttp\." },
];

struct CompiledPatterns {
    command: Vec<(&'static str, Regex)>,
    file: Vec<(&'static str, Regex)>,
    network: Vec<(&'static str, Regex)>,
}

fn compile(patterns: &[CallPattern]) -> Vec<(&'static str, Regex)> {
    patterns
        .iter()
        .map(|p| (p.label, Regex::new(p.regex).expect("static pattern is valid")))
        .collect()
}

fn patterns() -> &'static CompiledPatterns {
    static PATTERNS: OnceLock<CompiledPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| CompiledPatterns {
        command: compile(COMMAND_PATTERNS),
        file: compile(FILE_PATTERNS),
        network: compile(NETWORK_PATTERNS),
    })
}

/// Static analyzer over Python source text
#[derive(Debug, Clone, Default)]
pub struct StaticAnalyzer;

impl StaticAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, code: &str) -> RiskAssessment {
        let mut risk_factors = Vec::new();
        let mut deductions: u32 = 0;

        let imported = imported_modules(code);
        for module in DENYLISTED_MODULES {
            if imported.contains(*module) {
                risk_factors.push(format!("Dangerous import detected: {}", module));
                deductions += u32::from(IMPORT_WEIGHT);
            }
        }

        let compiled = patterns();
        let groups = [
            (compiled.command.as_slice(), "System command usage", COMMAND_WEIGHT),
            (compiled.file.as_slice(), "File operation detected", FILE_WEIGHT),
            (compiled.network.as_slice(), "Network operation detected", NETWORK_WEIGHT),
        ];
        for (group, description, weight) in groups {
            for (label, regex) in group {
                if regex.is_match(code) {
                    risk_factors.push(format!("{}: {}", description, label));
                    deductions += u32::from(weight);
                }
            }
        }

        let score = 100u32.saturating_sub(deductions) as u8;

        let recommendations = if risk_factors.is_empty() {
            Vec::new()
        } else {
            vec![
                "Review and minimize use of system-level operations".to_string(),
                "Consider using safer alternatives for identified operations".to_string(),
                "Implement additional sandboxing measures".to_string(),
            ]
        };

        RiskAssessment {
            risk_level: risk_level_for_score(score),
            security_score: score,
            verdict: AssessorVerdict::for_score(score),
            summary: format!(
                "Static analysis completed. Found {} potential security concerns.",
                risk_factors.len()
            ),
            risk_factors,
            recommendations,
        }
    }
}

/// Top-level module names from `import a, b.c as d` and `from x.y import z` lines
fn imported_modules(code: &str) -> BTreeSet<String> {
    let mut modules = BTreeSet::new();

    for line in code.lines() {
        let line = line.trim();
        let line = line.split('#').next().unwrap_or_default().trim_end();

        if let Some(rest) = line.strip_prefix("import ") {
            for item in rest.split(',') {
                if let Some(name) = top_level(item) {
                    modules.insert(name);
                }
            }
        } else if let Some(rest) = line.strip_prefix("from ") {
            if let Some(name) = rest.split_whitespace().next().and_then(top_level) {
                modules.insert(name);
            }
        }
    }

    modules
}

fn top_level(item: &str) -> Option<String> {
    let name = item.split_whitespace().next()?;
    let top = name.split('.').next()?;
    if top.is_empty() {
        None
    } else {
        Some(top.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exec_common::RiskLevel;

    #[test]
    fn test_clean_code_scores_full_marks() {
        let result = StaticAnalyzer::new().analyze("import numpy as np\nprint(np.ones(3))\n");
        assert_eq!(result.security_score, 100);
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert_eq!(result.verdict, AssessorVerdict::Safe);
        assert!(result.risk_factors.is_empty());
        assert!(result.recommendations.is_empty());
    }

    #[test]
    fn test_denylisted_import_plus_shell_call() {
        let code = "import os\nos.system('rm -rf /')\n";
        let result = StaticAnalyzer::new().analyze(code);

        assert!(result.security_score <= 100 - 35);
        assert!(result.risk_factors.len() >= 2);
        assert!(result
            .risk_factors
            .contains(&"Dangerous import detected: os".to_string()));
        assert!(result
            .risk_factors
            .contains(&"System command usage: os.system".to_string()));
        assert_eq!(result.security_score, 65);
        assert_eq!(result.risk_level, RiskLevel::Medium);
        assert_eq!(result.verdict, AssessorVerdict::Unsafe);
    }

    #[test]
    fn test_each_pattern_counts_once() {
        let code = "import os\nimport os\nos.system('a')\nos.system('b')\n";
        let result = StaticAnalyzer::new().analyze(code);
        assert_eq!(result.risk_factors.len(), 2);
        assert_eq!(result.security_score, 65);
    }

    #[test]
    fn test_score_floors_at_zero() {
        let code = r#"
import os, sys, socket, subprocess, requests, pickle
from urllib import request
subprocess.run(['ls'])
os.system('id')
eval('1')
exec('x=1')
f = open('/etc/passwd')
f.read()
requests.get('http://x')
socket.socket()
"#;
        let result = StaticAnalyzer::new().analyze(code);
        assert_eq!(result.security_score, 0);
        assert_eq!(result.risk_level, RiskLevel::High);
        assert_eq!(result.verdict, AssessorVerdict::Unsafe);
    }

    #[test]
    fn test_deterministic() {
        let code = "import socket\nsocket.create_connection(('a', 1))\n";
        let analyzer = StaticAnalyzer::new();
        assert_eq!(analyzer.analyze(code), analyzer.analyze(code));
    }

    #[test]
    fn test_import_parsing() {
        let modules = imported_modules(
            "import numpy as np, os.path\nfrom http.client import HTTPConnection\n  import sys  # comment\n",
        );
        assert!(modules.contains("numpy"));
        assert!(modules.contains("os"));
        assert!(modules.contains("http"));
        assert!(modules.contains("sys"));
        assert!(!modules.contains("osx"));
    }

    #[test]
    fn test_word_boundaries_avoid_false_positives() {
        let code = "import pandas as pd\ndf = pd.read_csv('x.csv')\nimport ast\nast.literal_eval('1')\n";
        let result = StaticAnalyzer::new().analyze(code);
        assert_eq!(result.security_score, 100, "{:?}", result.risk_factors);
    }
}
