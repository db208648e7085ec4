use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources. Nothing else is scanned.
const SOURCE_ROOTS: [&str; 4] = ["lme", "cli", "tests", "benches"];

// One source policy: a line regex, a filter that confirms a regex hit is a real
// violation, and the advice printed when it is.
struct Policy {
    title: &'static str,
    pattern: &'static str,
    confirm: fn(&str) -> bool,
    advice: &'static str,
}

const POLICIES: [Policy; 4] = [
    Policy {
        title: "underscore-prefixed identifiers",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        confirm: is_underscore_identifier_in_code,
        advice: "Underscore-prefixed names are not allowed. Use the value or remove it completely.",
    },
    Policy {
        title: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        confirm: always,
        advice: "Dead code must be used or deleted, not silenced.",
    },
    Policy {
        title: "comments narrating edits",
        pattern: r"(//|/\*).*\b(?:FIXED|FIX|FIXES|CORRECTED|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFY|UPDATED|UPDATE)\b",
        confirm: always,
        advice: "Comments describe the code as it is, not the history of how it got there.",
    },
    Policy {
        title: "shouting comments",
        pattern: r"(//|/\*).*",
        confirm: is_all_caps_or_starred_comment,
        advice: "Comments may not be written entirely in capitals, and '**' is only allowed in doc comments.",
    },
];

struct PolicyCollector<'p> {
    policy: &'p Policy,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl<'p> PolicyCollector<'p> {
    fn new(policy: &'p Policy, file_path: &Path) -> Self {
        Self {
            policy,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let mut msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.policy.title,
            self.file_path.display()
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str(&format!("\n⚠️ {}\n", self.policy.advice));
        Some(msg)
    }
}

impl Sink for PolicyCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.policy.confirm)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn always(_: &str) -> bool {
    true
}

fn is_comment_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*")
}

fn is_underscore_identifier_in_code(line: &str) -> bool {
    if is_comment_line(line) {
        return false;
    }
    // Odd-numbered pieces between double quotes are string contents.
    let in_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !in_string
}

fn comment_body(line: &str) -> Option<&str> {
    let start = line.find("//").or_else(|| line.find("/*"))?;
    let body = line[start..].trim_start_matches(['/', '*', '!']);
    Some(body.trim_end_matches("*/").trim())
}

fn is_all_caps_or_starred_comment(line: &str) -> bool {
    let Some(body) = comment_body(line) else {
        return false;
    };
    let is_doc = line.trim_start().starts_with("///") || line.trim_start().starts_with("//!");
    if !is_doc && body.contains("**") {
        return true;
    }
    let mut letters = body.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS.into_iter().flat_map(|root| {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn enforce(policy: &Policy) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(policy.pattern)?;
    let mut searcher = Searcher::new();

    for path in rust_sources() {
        let mut collector = PolicyCollector::new(policy, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(msg) = collector.error_message() {
            return Err(msg.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    for policy in &POLICIES {
        if let Err(e) = enforce(policy) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
