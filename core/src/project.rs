//! Project discovery: walk a directory tree for Markdown documents and
//! collect their code blocks as runnable tasks.

use std::path::Path;
use std::path::PathBuf;

use ignore::WalkBuilder;
use tracing::debug;

use crate::Result;
use crate::RunbookErr;
use crate::document::CodeBlock;
use crate::document::Document;

const MARKDOWN_EXTENSIONS: &[&str] = &["md", "mdx", "markdown"];

/// One runnable code block found in a project.
#[derive(Debug, Clone)]
pub struct Task {
    pub filename: PathBuf,
    pub block: CodeBlock,
}

impl Task {
    pub fn id(&self) -> String {
        format!("{}:{}", self.filename.display(), self.block.name())
    }
}

/// Walks `root` for Markdown files, respecting `.gitignore`, and returns
/// every code block found. Unreadable files are skipped.
pub fn load_tasks(root: &Path) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();

    for entry in WalkBuilder::new(root).build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!("skipping walk entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        let is_markdown = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MARKDOWN_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
        if !is_markdown {
            continue;
        }

        let document = match Document::open(path) {
            Ok(document) => document,
            Err(err) => {
                debug!("skipping {}: {err}", path.display());
                continue;
            }
        };
        for block in document.code_blocks() {
            tasks.push(Task {
                filename: path.to_path_buf(),
                block: block.clone(),
            });
        }
    }

    Ok(tasks)
}

/// Narrows `tasks` down to the single block matching `name`, optionally
/// restricted to files whose path ends with `file_query`. Zero matches
/// and multiple matches are distinct failures; an ambiguous name must be
/// qualified by the caller rather than silently running the first hit.
pub fn lookup_task<'a>(
    tasks: &'a [Task],
    file_query: Option<&str>,
    name: &str,
) -> Result<&'a Task> {
    let matches: Vec<&Task> = tasks
        .iter()
        .filter(|task| match file_query {
            Some(query) if !query.is_empty() => task.filename.ends_with(query),
            _ => true,
        })
        .filter(|task| task.block.name() == name)
        .collect();

    match matches.as_slice() {
        [] => Err(RunbookErr::BlockNotFound(name.to_owned())),
        [task] => Ok(task),
        _ => Err(RunbookErr::AmbiguousBlock {
            name: name.to_owned(),
            count: matches.len(),
        }),
    }
}
