//! Markdown document model: fenced code blocks and frontmatter.
//!
//! Only the pieces the execution engine consumes are modeled here. A
//! block carries its language tag, the attribute object from the info
//! string, its content, and a copy of the document frontmatter so that
//! later stages need no back-reference to the document.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use pulldown_cmark::CodeBlockKind;
use pulldown_cmark::Event;
use pulldown_cmark::Options;
use pulldown_cmark::Parser;
use pulldown_cmark::Tag;
use pulldown_cmark::TagEnd;
use serde::Deserialize;

use crate::Result;
use crate::RunbookErr;

/// Document-level defaults from the leading `---` YAML fence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Frontmatter {
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Attributes from the JSON object in a fence info string, e.g.
/// ```` ```sh {"name":"deploy","interactive":true} ````.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Attributes {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub interactive: Option<bool>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CodeBlock {
    language: String,
    attributes: Attributes,
    name: String,
    lines: Vec<String>,
    content: String,
    frontmatter: Frontmatter,
}

impl CodeBlock {
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Resolved block name: the `name` attribute, or a slug derived from
    /// the first content line, deduplicated within the document.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<&str> {
        self.attributes.id.as_deref()
    }

    /// Block-level interpreter override.
    pub fn interpreter(&self) -> Option<&str> {
        self.attributes.interpreter.as_deref()
    }

    pub fn cwd(&self) -> Option<&str> {
        self.attributes.cwd.as_deref()
    }

    pub fn interactive(&self) -> bool {
        self.attributes.interactive.unwrap_or(false)
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn frontmatter(&self) -> &Frontmatter {
        &self.frontmatter
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

#[derive(Debug, Clone, Default)]
pub struct Document {
    frontmatter: Frontmatter,
    blocks: Vec<CodeBlock>,
}

impl Document {
    pub fn parse(source: &str) -> Self {
        let frontmatter = parse_frontmatter(source).unwrap_or_default();

        let mut blocks = Vec::new();
        let mut names_counter: HashMap<String, usize> = HashMap::new();
        let mut current: Option<(String, String)> = None;

        for event in Parser::new_ext(source, Options::empty()) {
            match event {
                Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                    current = Some((info.to_string(), String::new()));
                }
                Event::Text(text) => {
                    if let Some((_, content)) = current.as_mut() {
                        content.push_str(&text);
                    }
                }
                Event::End(TagEnd::CodeBlock) => {
                    if let Some((info, content)) = current.take() {
                        blocks.push(new_code_block(
                            &info,
                            content,
                            &frontmatter,
                            &mut names_counter,
                        ));
                    }
                }
                _ => {}
            }
        }

        Self {
            frontmatter,
            blocks,
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path).map_err(|source| RunbookErr::DocumentRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&source))
    }

    pub fn frontmatter(&self) -> &Frontmatter {
        &self.frontmatter
    }

    pub fn code_blocks(&self) -> &[CodeBlock] {
        &self.blocks
    }

    pub fn lookup(&self, name: &str) -> Vec<&CodeBlock> {
        self.blocks.iter().filter(|b| b.name() == name).collect()
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<&CodeBlock> {
        self.blocks.iter().find(|b| b.id() == Some(id))
    }
}

fn new_code_block(
    info: &str,
    content: String,
    frontmatter: &Frontmatter,
    names_counter: &mut HashMap<String, usize>,
) -> CodeBlock {
    let (language, attributes) = parse_info_string(info);

    let base_name = match &attributes.name {
        Some(name) if !name.is_empty() => name.clone(),
        _ => name_from_content(&content),
    };
    let counter = names_counter.entry(base_name.clone()).or_insert(0);
    *counter += 1;
    let name = if *counter == 1 {
        base_name
    } else {
        format!("{base_name}-{counter}")
    };

    let lines = content.lines().map(str::to_owned).collect();

    CodeBlock {
        language,
        attributes,
        name,
        lines,
        content,
        frontmatter: frontmatter.clone(),
    }
}

fn parse_info_string(info: &str) -> (String, Attributes) {
    let (language, rest) = match info.find('{') {
        Some(idx) => (&info[..idx], Some(&info[idx..])),
        None => (info, None),
    };
    let language = language
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_owned();

    let attributes = rest
        .and_then(|raw| serde_json::from_str::<Attributes>(raw.trim()).ok())
        .unwrap_or_default();

    (language, attributes)
}

/// Derives a stable, human-readable name from the first content line,
/// e.g. `echo "hello"` becomes `echo-hello`.
fn name_from_content(content: &str) -> String {
    let first_line = content
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default();

    let mut words = Vec::new();
    for word in first_line.split_whitespace().take(2) {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect::<String>()
            .to_ascii_lowercase();
        if !cleaned.is_empty() {
            words.push(cleaned);
        }
    }

    if words.is_empty() {
        "block".to_owned()
    } else {
        words.join("-")
    }
}

fn parse_frontmatter(source: &str) -> Option<Frontmatter> {
    let rest = source.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---").or_else(|| rest.find("\r\n---"))?;
    serde_yaml::from_str(&rest[..end]).ok()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    const SOURCE: &str = r#"---
shell: bash
cwd: /tmp
---

# Example

```sh {"name":"echo-test"}
echo -n test
```

```python {"name":"py","interactive":true,"cwd":"scripts"}
print('test')
```

```js
console.log('1')
```
"#;

    #[test]
    fn parses_frontmatter() {
        let doc = Document::parse(SOURCE);
        assert_eq!(
            doc.frontmatter(),
            &Frontmatter {
                shell: Some("bash".to_owned()),
                cwd: Some("/tmp".to_owned()),
            }
        );
    }

    #[test]
    fn parses_blocks_with_attributes() {
        let doc = Document::parse(SOURCE);
        let blocks = doc.code_blocks();
        assert_eq!(blocks.len(), 3);

        assert_eq!(blocks[0].language(), "sh");
        assert_eq!(blocks[0].name(), "echo-test");
        assert_eq!(blocks[0].lines(), ["echo -n test"]);
        assert_eq!(blocks[0].content(), "echo -n test\n");
        assert!(!blocks[0].interactive());

        assert_eq!(blocks[1].language(), "python");
        assert!(blocks[1].interactive());
        assert_eq!(blocks[1].cwd(), Some("scripts"));
        assert_eq!(blocks[1].frontmatter().shell.as_deref(), Some("bash"));
    }

    #[test]
    fn derives_and_deduplicates_names() {
        let doc = Document::parse(
            "```sh\necho one\n```\n\n```sh\necho one\n```\n\n```sh\necho two\n```\n",
        );
        let names: Vec<&str> = doc.code_blocks().iter().map(CodeBlock::name).collect();
        assert_eq!(names, ["echo-one", "echo-one-2", "echo-two"]);
    }

    #[test]
    fn lookup_by_name_and_id() {
        let doc = Document::parse("```sh {\"name\":\"a\",\"id\":\"01H\"}\necho a\n```\n");
        assert_eq!(doc.lookup("a").len(), 1);
        assert!(doc.lookup("missing").is_empty());
        assert!(doc.lookup_by_id("01H").is_some());
    }

    #[test]
    fn document_without_frontmatter() {
        let doc = Document::parse("```sh\necho hi\n```\n");
        assert_eq!(doc.frontmatter(), &Frontmatter::default());
    }
}
