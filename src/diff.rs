use regex::Regex;

/// A contiguous change block within one file of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub file_path: String,
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    pub header: String,
    pub content: String,
}

/// All changes to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub old_path: Option<String>,
    pub new_path: String,
    pub hunks: Vec<Hunk>,
    pub is_new_file: bool,
    pub is_deleted: bool,
}

/// A function or method touched by added lines, extracted heuristically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFunction {
    pub file: String,
    pub function: String,
    pub line: u32,
}

/// Parse a unified diff into per-file hunk sequences.
///
/// The parser is total: malformed input never fails, it just yields fewer
/// hunks. Binary markers and unrecognized lines are ignored.
pub fn parse_diff(diff_text: &str) -> Vec<FileDiff> {
    if diff_text.trim().is_empty() {
        return Vec::new();
    }

    let file_header_re = Regex::new(r"^diff --git a/(.*) b/(.*)$").unwrap();
    let hunk_header_re = Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@(.*)$").unwrap();

    let mut file_diffs: Vec<FileDiff> = Vec::new();
    let mut current_file: Option<FileDiff> = None;
    let mut current_header: Option<String> = None;
    let mut current_lines: Vec<String> = Vec::new();

    fn save_hunk(
        file: &mut Option<FileDiff>,
        header: &mut Option<String>,
        lines: &mut Vec<String>,
        hunk_header_re: &Regex,
    ) {
        if let (Some(file), Some(header_line)) = (file.as_mut(), header.as_deref())
            && !lines.is_empty()
            && let Some(caps) = hunk_header_re.captures(header_line)
        {
            let num = |i: usize, default: u32| {
                caps.get(i)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(default)
            };
            file.hunks.push(Hunk {
                file_path: file.new_path.clone(),
                old_start: num(1, 0),
                old_lines: num(2, 1),
                new_start: num(3, 0),
                new_lines: num(4, 1),
                header: header_line.to_string(),
                content: lines.join("\n"),
            });
        }
        *header = None;
        lines.clear();
    }

    for line in diff_text.split('\n') {
        if let Some(caps) = file_header_re.captures(line) {
            save_hunk(
                &mut current_file,
                &mut current_header,
                &mut current_lines,
                &hunk_header_re,
            );
            if let Some(file) = current_file.take() {
                file_diffs.push(file);
            }
            current_file = Some(FileDiff {
                old_path: Some(caps[1].to_string()),
                new_path: caps[2].to_string(),
                hunks: Vec::new(),
                is_new_file: false,
                is_deleted: false,
            });
            continue;
        }

        if let Some(file) = current_file.as_mut() {
            if line.starts_with("new file mode") {
                file.is_new_file = true;
                file.old_path = None;
                continue;
            }
            if line.starts_with("deleted file mode") {
                file.is_deleted = true;
                continue;
            }
        }

        if hunk_header_re.is_match(line) {
            save_hunk(
                &mut current_file,
                &mut current_header,
                &mut current_lines,
                &hunk_header_re,
            );
            current_header = Some(line.to_string());
            continue;
        }

        if current_header.is_some()
            && (line.starts_with('+') || line.starts_with('-') || line.starts_with(' '))
        {
            current_lines.push(line.to_string());
        }
    }

    save_hunk(
        &mut current_file,
        &mut current_header,
        &mut current_lines,
        &hunk_header_re,
    );
    if let Some(file) = current_file.take() {
        file_diffs.push(file);
    }

    file_diffs
}

/// Render parsed diffs as the Markdown/fenced-diff layout fed to the
/// identification stage.
pub fn format_hunks(file_diffs: &[FileDiff]) -> String {
    if file_diffs.is_empty() {
        return "No changes found.".to_string();
    }

    let mut out: Vec<String> = Vec::new();
    for file in file_diffs {
        let status = if file.is_new_file {
            " (NEW FILE)"
        } else if file.is_deleted {
            " (DELETED)"
        } else {
            ""
        };
        out.push(format!("\n### File: {}{}\n", file.new_path, status));

        for (i, hunk) in file.hunks.iter().enumerate() {
            let last = hunk.new_start + hunk.new_lines.saturating_sub(1);
            out.push(format!(
                "\n#### Hunk {} (lines {}-{}):\n",
                i + 1,
                hunk.new_start,
                last
            ));
            out.push("```diff".to_string());
            out.push(hunk.content.clone());
            out.push("```\n".to_string());
        }
    }

    out.join("\n")
}

/// Extract names of functions touched by `+` lines.
///
/// Per-language regex heuristics only; never trusted for correctness.
pub fn changed_functions(file_diffs: &[FileDiff]) -> Vec<ChangedFunction> {
    let python_re = Regex::new(r"^\+\s*(?:async\s+)?def\s+(\w+)\s*\(").unwrap();
    let script_re = Regex::new(
        r"^\+\s*(?:async\s+)?(?:function\s+(\w+)|(\w+)\s*(?:=|:)\s*(?:async\s+)?(?:function|\([^)]*\)\s*=>))",
    )
    .unwrap();

    let mut found = Vec::new();
    for file in file_diffs {
        let ext = file.new_path.rsplit('.').next().unwrap_or("");
        let pattern = match ext {
            "py" => &python_re,
            "js" | "jsx" | "ts" | "tsx" => &script_re,
            _ => continue,
        };

        for hunk in &file.hunks {
            for line in hunk.content.split('\n') {
                if let Some(caps) = pattern.captures(line) {
                    let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str());
                    if let Some(name) = name {
                        found.push(ChangedFunction {
                            file: file.new_path.clone(),
                            function: name.to_string(),
                            line: hunk.new_start,
                        });
                    }
                }
            }
        }
    }
    found
}
