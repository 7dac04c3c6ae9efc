//! Top-level command orchestration shared by the CLI surface.

pub mod cache;
pub mod run;
pub mod tool;

pub use run::{run_script_command, RunRequest};
pub use tool::{run_tool_command, ToolRequest};

/// Split a comma-separated flag value, trimming whitespace and dropping
/// empty entries.
#[must_use]
pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_csv_trims_and_drops_empties() {
        assert_eq!(
            split_csv("a.example, b.example ,,c.example"),
            vec!["a.example", "b.example", "c.example"]
        );
        assert!(split_csv("").is_empty());
        assert!(split_csv(" , ").is_empty());
    }
}
