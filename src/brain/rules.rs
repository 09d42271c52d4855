use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// One rule file from the brain directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Rule name (from front matter or the file name)
    pub name: String,
    /// Short description
    pub description: String,
    /// Instructions handed to the model
    pub content: String,
}

/// Every rule the brain currently answers with.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: BTreeMap<String, Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: Rule) {
        info!("Loaded rule: {} ({})", rule.name, rule.description);
        self.rules.insert(rule.name.clone(), rule);
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule text appended to the system prompt, in name order.
    pub fn build_context(&self) -> String {
        let mut context = String::new();
        for rule in self.rules.values() {
            context.push_str(&format!("## {}\n", rule.name));
            context.push_str(&format!("{}\n\n", rule.content));
        }
        context
    }
}

/// Load every `*.md` rule file in `dir`.
///
/// A rule file may start with front matter:
/// ```markdown
/// ---
/// name: greetings
/// description: How to say hello
/// ---
/// Greet people by name.
/// ```
pub async fn load_rules_from_dir(dir: &Path) -> Result<RuleSet> {
    let mut rules = RuleSet::new();

    if !dir.exists() {
        info!("Rules directory not found: {}, skipping", dir.display());
        return Ok(rules);
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read rules directory: {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }

        match load_rule_file(&path).await {
            Ok(rule) => rules.register(rule),
            Err(e) => warn!("Failed to load rule from {}: {}", path.display(), e),
        }
    }

    info!("Loaded {} rules from {}", rules.len(), dir.display());
    Ok(rules)
}

async fn load_rule_file(path: &Path) -> Result<Rule> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read rule file: {}", path.display()))?;

    if let Some(stripped) = content.strip_prefix("---") {
        if let Some(end) = stripped.find("---") {
            let front_matter = stripped[..end].trim();
            let body = stripped[end + 3..].trim().to_string();

            let name = extract_field(front_matter, "name").unwrap_or_else(|| name_from_path(path));
            let description = extract_field(front_matter, "description")
                .unwrap_or_else(|| first_line_or_heading(&body));

            return Ok(Rule {
                name,
                description,
                content: body,
            });
        }
    }

    Ok(Rule {
        name: name_from_path(path),
        description: first_line_or_heading(&content),
        content: content.trim().to_string(),
    })
}

/// Extract a simple `key: value` from front matter
fn extract_field(front_matter: &str, key: &str) -> Option<String> {
    let prefix = format!("{}:", key);
    for line in front_matter.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(&prefix) {
            let value = rest.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn name_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unnamed")
        .to_string()
}

/// Get the first heading or first line as a description
fn first_line_or_heading(content: &str) -> String {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(heading) = line.strip_prefix('#') {
            return heading.trim().trim_start_matches('#').trim().to_string();
        }
        return line.to_string();
    }
    "No description".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let rules = load_rules_from_dir(&dir.path().join("nope")).await.unwrap();
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn test_loads_markdown_with_and_without_front_matter() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("greet.md"),
            "---\nname: greetings\ndescription: \"How to say hi\"\n---\nSay hi back.\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("tone.md"), "# Tone\nBe brief.\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let rules = load_rules_from_dir(dir.path()).await.unwrap();
        assert_eq!(rules.len(), 2);

        let greet = rules.get("greetings").unwrap();
        assert_eq!(greet.description, "How to say hi");
        assert_eq!(greet.content, "Say hi back.");

        let tone = rules.get("tone").unwrap();
        assert_eq!(tone.description, "Tone");

        let context = rules.build_context();
        assert!(context.find("## greetings").unwrap() < context.find("## tone").unwrap());
    }
}
