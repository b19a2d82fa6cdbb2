//! Per-agent long-term memory: a file-system-backed blob, fully rewritten
//! by the `save_memory` built-in tool (C4, spec.md §4.6).

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::MemoryError;

/// `load(agentName) → string` / `save(agentName, content, maxLines)`
/// against `<workspace>/.memory/<agentName>.md`.
pub struct LongTermMemory {
    root: PathBuf,
}

impl LongTermMemory {
    /// `workspace` is the operator's workspace root; memory files live
    /// under `<workspace>/.memory/`.
    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self { root: workspace.as_ref().join(".memory") }
    }

    fn path_for(&self, agent_name: &str) -> PathBuf {
        self.root.join(format!("{agent_name}.md"))
    }

    /// Reads the blob for `agent_name`; empty string if absent.
    pub async fn load(&self, agent_name: &str) -> Result<String, MemoryError> {
        match tokio::fs::read_to_string(self.path_for(agent_name)).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the entire blob, truncated to the last `max_lines`
    /// newline-terminated lines, written atomically (write-then-rename).
    pub async fn save(&self, agent_name: &str, content: &str, max_lines: usize) -> Result<(), MemoryError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let truncated = truncate_to_last_lines(content, max_lines);

        let dest = self.path_for(agent_name);
        let tmp = dest.with_extension("md.tmp");
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(truncated.as_bytes()).await?;
        f.flush().await?;
        drop(f);
        tokio::fs::rename(&tmp, &dest).await?;
        Ok(())
    }
}

/// Keeps at most `max_lines` trailing lines. A no-op when `content`
/// already has `<= max_lines` lines (spec.md §8 round-trip invariant).
fn truncate_to_last_lines(content: &str, max_lines: usize) -> String {
    if max_lines == 0 {
        return String::new();
    }
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() <= max_lines {
        return content.to_string();
    }
    let start = lines.len() - max_lines;
    lines[start..].join("\n")
}

/// Builds the fixed instruction block appended to the system prompt when
/// long-term memory is enabled (spec.md §6, literal template).
pub fn memory_instruction_block(content: &str, max_lines: usize) -> String {
    let body = if content.trim().is_empty() {
        "(empty - no memories saved yet)".to_string()
    } else {
        content.to_string()
    };
    format!(
        "<long_term_memory>\n{body}\n</long_term_memory>\n\n\
         <memory_instructions>\n\
         You have a long-term memory blob capped at {max_lines} lines. Use the `save_memory` tool to persist \
         facts, preferences, or context you want to remember across conversations. Calling `save_memory` \
         REPLACES the entire blob — always include everything from the current memory that you still want \
         kept, plus whatever is new.\n\
         </memory_instructions>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn load_returns_empty_string_when_absent() {
        let dir = tempdir().unwrap();
        let mem = LongTermMemory::new(dir.path());
        assert_eq!(mem.load("nope").await.unwrap(), "");
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let mem = LongTermMemory::new(dir.path());
        mem.save("a", "line1\nline2", 100).await.unwrap();
        assert_eq!(mem.load("a").await.unwrap(), "line1\nline2");
    }

    #[tokio::test]
    async fn save_truncates_to_last_max_lines() {
        let dir = tempdir().unwrap();
        let mem = LongTermMemory::new(dir.path());
        let content = (1..=10).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        mem.save("a", &content, 3).await.unwrap();
        let loaded = mem.load("a").await.unwrap();
        assert_eq!(loaded, "line8\nline9\nline10");
        assert!(loaded.lines().count() <= 3);
    }

    #[tokio::test]
    async fn save_is_noop_shaped_when_already_under_cap() {
        let dir = tempdir().unwrap();
        let mem = LongTermMemory::new(dir.path());
        mem.save("a", "one\ntwo", 100).await.unwrap();
        let loaded_once = mem.load("a").await.unwrap();
        mem.save("a", &loaded_once, 100).await.unwrap();
        assert_eq!(mem.load("a").await.unwrap(), loaded_once);
    }

    #[test]
    fn memory_instruction_block_handles_empty_content() {
        let block = memory_instruction_block("", 50);
        assert!(block.contains("(empty - no memories saved yet)"));
        assert!(block.contains("50 lines"));
    }
}
