//! 执行证据抽取
//!
//! 从执行端自由文本里按显式规则表（模式 + 权重 + 类别）抽取：文件路径
//! （绝对 > 相对 > 裸文件名）、shell 命令（反引号 > $/> 前缀 > CLI 动词
//! 行）、结果块（围栏代码 > 标注段 > 状态行）与一段尽力而为的摘要。
//! 产出有界去重的集合；score 是相对完整度信号，不是校准过的概率。

use regex::Regex;
use serde::Serialize;

/// 抽取结果
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct Evidence {
    pub files: Vec<String>,
    pub commands: Vec<String>,
    pub outputs: Vec<String>,
    pub summary: String,
    pub score: f32,
}

const MAX_FILES: usize = 8;
const MAX_COMMANDS: usize = 8;
const MAX_OUTPUTS: usize = 5;
const MAX_OUTPUT_CHARS: usize = 500;
const MAX_SUMMARY_CHARS: usize = 300;

struct WeightedRule {
    pattern: Regex,
    weight: u32,
}

fn rules(defs: &[(&str, u32)]) -> Vec<WeightedRule> {
    defs.iter()
        .map(|(p, w)| WeightedRule {
            pattern: Regex::new(p).expect("invalid evidence pattern"),
            weight: *w,
        })
        .collect()
}

/// 主入口：空输入返回全空 + score 0
pub fn extract_evidence(text: &str) -> Evidence {
    if text.trim().is_empty() {
        return Evidence::default();
    }

    let file_rules = rules(&[
        // 绝对路径
        (
            r#"(?:^|[\s('"`])((?:/|~/)[A-Za-z0-9_./-]+\.[A-Za-z][A-Za-z0-9]{0,7})\b"#,
            3,
        ),
        // 相对路径（至少一层目录）
        (
            r#"(?:^|[\s('"`])([A-Za-z0-9_.-]+(?:/[A-Za-z0-9_.-]+)+\.[A-Za-z][A-Za-z0-9]{0,7})\b"#,
            2,
        ),
        // 裸文件名
        (
            r#"(?:^|[\s('"`])([A-Za-z0-9_-]+\.[A-Za-z][A-Za-z0-9]{0,7})\b"#,
            1,
        ),
    ]);
    let command_rules = rules(&[
        (r"`([^`\n]{2,120})`", 3),
        (r"(?m)^\s*[$>]\s+(\S[^\n]{1,160})$", 2),
        (
            r"(?m)^((?:npm|npx|pip3?|python3?|cargo|git|docker|kubectl|make|curl|wget|brew|apt(?:-get)?|systemctl|node|yarn|pnpm|go|rustc|ls|cat|grep|mkdir|cp|mv|chmod)\s+[^\n]{1,160})$",
            1,
        ),
    ]);
    let output_rules = rules(&[
        (r"(?s)```[A-Za-z0-9]*\n(.*?)```", 3),
        (r"(?mi)^(?:OUTPUT|RESULT|RESULTS|STATUS)\s*[:\-]\s*(.+)$", 2),
        (
            r"(?mi)^(.*\b(?:successful|succeeded|passed|completed|failed|error)\b.*)$",
            1,
        ),
    ]);

    // 裸文件名误报多，用这个再校验反引号内容是否其实是文件
    let looks_like_file =
        Regex::new(r"^[A-Za-z0-9_./~-]+\.[A-Za-z][A-Za-z0-9]{0,7}$").unwrap();

    let mut files: Vec<String> = Vec::new();
    let mut files_best = 0u32;
    for rule in &file_rules {
        for caps in rule.pattern.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                let name = m.as_str().to_string();
                if !files.contains(&name) {
                    files.push(name);
                    files_best = files_best.max(rule.weight);
                }
            }
        }
    }
    files.truncate(MAX_FILES);

    let mut commands: Vec<String> = Vec::new();
    let mut commands_best = 0u32;
    for rule in &command_rules {
        for caps in rule.pattern.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                let cmd = m.as_str().trim().to_string();
                // 反引号里只是个文件名的话归给 files，不算命令
                if !cmd.contains(' ') && looks_like_file.is_match(&cmd) {
                    if !files.contains(&cmd) && files.len() < MAX_FILES {
                        files.push(cmd);
                    }
                    continue;
                }
                if !commands.contains(&cmd) {
                    commands.push(cmd);
                    commands_best = commands_best.max(rule.weight);
                }
            }
        }
    }
    commands.truncate(MAX_COMMANDS);

    let mut outputs: Vec<String> = Vec::new();
    let mut outputs_best = 0u32;
    for rule in &output_rules {
        for caps in rule.pattern.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                let chunk: String = m.as_str().trim().chars().take(MAX_OUTPUT_CHARS).collect();
                if chunk.is_empty() {
                    continue;
                }
                if !outputs.contains(&chunk) {
                    outputs.push(chunk);
                    outputs_best = outputs_best.max(rule.weight);
                }
            }
        }
        if outputs.len() >= MAX_OUTPUTS {
            break;
        }
    }
    outputs.truncate(MAX_OUTPUTS);

    let (summary, summary_tier) = best_summary(text);

    // 各类别取最佳命中档位（0..=3），平均后归一到 [0,1]
    let score = (files_best + commands_best + outputs_best + summary_tier) as f32 / 12.0;

    Evidence {
        files,
        commands,
        outputs,
        summary,
        score,
    }
}

/// 摘要优先级：显式 SUMMARY 段 > 动作动词句 > 首个较长段落 > 开头几行
fn best_summary(text: &str) -> (String, u32) {
    let summary_section =
        Regex::new(r"(?is)(?:^|\n)\s*SUMMARY\s*[:\-]?\s*(.{10,400}?)(?:\n\n|$)").unwrap();
    if let Some(caps) = summary_section.captures(text) {
        if let Some(m) = caps.get(1) {
            return (truncate(m.as_str().trim(), 400), 3);
        }
    }

    let action_verb = Regex::new(
        r"^(?:Created|Updated|Installed|Ran|Executed|Fixed|Added|Removed|Configured|Built|Deployed|Modified|Implemented|Verified|Completed)\b",
    )
    .unwrap();
    for sentence in text.split_inclusive(['.', '!', '?', '\n']) {
        let s = sentence.trim().trim_end_matches(['.', '!', '?']);
        if s.len() >= 10 && action_verb.is_match(s) {
            return (truncate(s, MAX_SUMMARY_CHARS), 2);
        }
    }

    for paragraph in text.split("\n\n") {
        let p = paragraph.trim();
        if p.chars().count() >= 60 {
            return (truncate(p, MAX_SUMMARY_CHARS), 1);
        }
    }

    let head: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(3)
        .collect();
    if head.is_empty() {
        (String::new(), 0)
    } else {
        (truncate(head.join(" ").trim(), MAX_SUMMARY_CHARS), 1)
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_and_command_extraction() {
        let ev = extract_evidence("Ran `npm install` and created src/app.js");
        assert!(ev.files.contains(&"src/app.js".to_string()));
        assert!(ev.commands.contains(&"npm install".to_string()));
        assert!(ev.score > 0.0);
    }

    #[test]
    fn test_empty_input_contract() {
        let expected = Evidence {
            files: vec![],
            commands: vec![],
            outputs: vec![],
            summary: String::new(),
            score: 0.0,
        };
        assert_eq!(extract_evidence(""), expected);
        assert_eq!(extract_evidence("   \n  "), expected);
    }

    #[test]
    fn test_absolute_relative_and_bare_paths() {
        let ev = extract_evidence("Wrote /etc/nginx/nginx.conf then docs/readme.md and notes.txt");
        assert!(ev.files.contains(&"/etc/nginx/nginx.conf".to_string()));
        assert!(ev.files.contains(&"docs/readme.md".to_string()));
        assert!(ev.files.contains(&"notes.txt".to_string()));
    }

    #[test]
    fn test_prefixed_and_verb_commands() {
        let text = "$ git status\n> cargo build --release\nnpm run lint\n";
        let ev = extract_evidence(text);
        assert!(ev.commands.contains(&"git status".to_string()));
        assert!(ev.commands.contains(&"cargo build --release".to_string()));
        assert!(ev.commands.contains(&"npm run lint".to_string()));
    }

    #[test]
    fn test_fenced_and_labeled_outputs() {
        let text = "Result: 42 tests passed\n```\nall green\n```\n";
        let ev = extract_evidence(text);
        assert!(ev.outputs.iter().any(|o| o.contains("all green")));
        assert!(ev.outputs.iter().any(|o| o.contains("42 tests passed")));
    }

    #[test]
    fn test_backticked_filename_counts_as_file_not_command() {
        let ev = extract_evidence("Edited `config.toml` to change the port");
        assert!(ev.files.contains(&"config.toml".to_string()));
        assert!(!ev.commands.contains(&"config.toml".to_string()));
    }

    #[test]
    fn test_explicit_summary_section_wins() {
        let text = "Did many things.\n\nSUMMARY: deployed the service to staging\n\nmore text";
        let ev = extract_evidence(text);
        assert!(ev.summary.contains("deployed the service to staging"));
    }

    #[test]
    fn test_action_verb_sentence_summary() {
        let ev = extract_evidence("Created the database schema and seeded test data.");
        assert!(ev.summary.starts_with("Created the database schema"));
    }

    #[test]
    fn test_bounds_are_enforced() {
        let many_files: String = (0..20).map(|i| format!("file{}.js ", i)).collect();
        let ev = extract_evidence(&many_files);
        assert!(ev.files.len() <= 8);

        let many_cmds: String = (0..20).map(|i| format!("`run thing{}`\n", i)).collect();
        let ev = extract_evidence(&many_cmds);
        assert!(ev.commands.len() <= 8);
    }

    #[test]
    fn test_version_numbers_not_files() {
        let ev = extract_evidence("upgraded to version 3.5 today");
        assert!(!ev.files.iter().any(|f| f == "3.5"));
    }

    #[test]
    fn test_score_grows_with_evidence_quality() {
        let weak = extract_evidence("some vague text about doing work without specifics here");
        let strong = extract_evidence(
            "SUMMARY: done\n\nRan `npm test`.\nCreated src/lib.rs\n```\n10 passed\n```",
        );
        assert!(strong.score > weak.score);
        assert!(strong.score <= 1.0);
    }
}
