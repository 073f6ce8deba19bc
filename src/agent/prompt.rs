//! System-instruction assembly.

use std::path::Path;

use chrono::Local;

/// Renders the system instruction for one run, interpolated with the
/// live capability names and a few environment facts.
pub fn system_prompt(tool_names: &[String], workdir: &Path) -> String {
    let tools_line = if tool_names.is_empty() {
        "No tools are available for this run; answer from your own knowledge.".to_string()
    } else {
        format!(
            "You may call these tools when they help: {}.",
            tool_names.join(", ")
        )
    };
    format!(
        "You are a capable assistant that completes tasks step by step, \
         calling tools where they genuinely help and answering directly \
         where they do not.\n\
         {tools_line}\n\
         When a tool call is declined by policy, do not retry it or look \
         for workarounds; explain the refusal instead.\n\
         Today's date is {date}. The working directory is {workdir}.",
        tools_line = tools_line,
        date = Local::now().format("%Y-%m-%d"),
        workdir = workdir.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn prompt_names_every_tool() {
        let names = vec!["search".to_string(), "read_file".to_string()];
        let prompt = system_prompt(&names, &PathBuf::from("/work"));
        assert!(prompt.contains("search, read_file"));
        assert!(prompt.contains("/work"));
    }

    #[test]
    fn toolless_runs_get_the_fallback_line() {
        let prompt = system_prompt(&[], &PathBuf::from("/work"));
        assert!(prompt.contains("No tools are available"));
    }
}
