//! 自适应执行模式选择
//!
//! 固定策略：第 3 个循环强制 resource_specific，第 6 个循环强制
//! tool_specific，其余一律 normal。`recommend` 读取会话追踪数据产出
//! 约束建议；无数据时降级为「完全访问」并给出人类可读的原因，注入
//! 执行端提示词。强制循环用命令式措辞，其余循环只给推荐。

use serde::Serialize;

use crate::session::tracker::SessionStore;

/// 执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Normal,
    ResourceSpecific,
    ToolSpecific,
}

impl ExecutionMode {
    pub fn describe(&self) -> &'static str {
        match self {
            ExecutionMode::Normal => "full access to all resources",
            ExecutionMode::ResourceSpecific => "restricted to specific resource servers",
            ExecutionMode::ToolSpecific => "focused on specific tools",
        }
    }
}

/// 纯函数：循环号 → 模式
pub fn mode(cycle: u32) -> ExecutionMode {
    match cycle {
        3 => ExecutionMode::ResourceSpecific,
        6 => ExecutionMode::ToolSpecific,
        _ => ExecutionMode::Normal,
    }
}

/// 模式建议：约束列表 + 措辞依据
#[derive(Debug, Clone)]
pub struct ModeAdvice {
    pub mode: ExecutionMode,
    pub resources: Vec<String>,
    pub tools: Vec<String>,
    pub reason: String,
    /// 强制循环（3/6）上约束是要求而非建议
    pub enforced: bool,
}

/// 读取追踪数据产出本循环的约束建议
pub fn recommend(store: &SessionStore, session_id: &str, cycle: u32) -> ModeAdvice {
    let record = store.get(session_id);
    let selected = mode(cycle);

    let record = match record {
        Some(r) => r,
        None => {
            return ModeAdvice {
                mode: ExecutionMode::Normal,
                resources: Vec::new(),
                tools: Vec::new(),
                reason: "New session - full access to all resources".to_string(),
                enforced: false,
            }
        }
    };

    match selected {
        ExecutionMode::ResourceSpecific => {
            // 最常用的前 3 个资源（集合按首次出现排序）
            let top: Vec<String> = record.used_resources.iter().take(3).cloned().collect();
            if top.is_empty() {
                return ModeAdvice {
                    mode: ExecutionMode::Normal,
                    resources: Vec::new(),
                    tools: Vec::new(),
                    reason: format!(
                        "Cycle {}: no resource usage observed yet - full access granted",
                        cycle
                    ),
                    enforced: false,
                };
            }
            ModeAdvice {
                reason: format!(
                    "Cycle {}: restricting to the most used resource servers: {}",
                    cycle,
                    top.join(", ")
                ),
                mode: ExecutionMode::ResourceSpecific,
                resources: top,
                tools: Vec::new(),
                enforced: true,
            }
        }
        ExecutionMode::ToolSpecific => {
            // 最近使用的 3 个工具
            let recent: Vec<String> = record
                .used_tools
                .iter()
                .rev()
                .take(3)
                .rev()
                .cloned()
                .collect();
            if recent.is_empty() {
                return ModeAdvice {
                    mode: ExecutionMode::Normal,
                    resources: Vec::new(),
                    tools: Vec::new(),
                    reason: format!(
                        "Cycle {}: no tool usage observed yet - full access granted",
                        cycle
                    ),
                    enforced: false,
                };
            }
            ModeAdvice {
                reason: format!(
                    "Cycle {}: restricting to the most recently used tools: {}",
                    cycle,
                    recent.join(", ")
                ),
                mode: ExecutionMode::ToolSpecific,
                resources: Vec::new(),
                tools: recent,
                enforced: true,
            }
        }
        ExecutionMode::Normal => {
            let suggested_resources: Vec<String> =
                record.used_resources.iter().take(5).cloned().collect();
            let suggested_tools: Vec<String> = record
                .used_tools
                .iter()
                .rev()
                .take(5)
                .rev()
                .cloned()
                .collect();
            ModeAdvice {
                mode: ExecutionMode::Normal,
                resources: suggested_resources,
                tools: suggested_tools,
                reason: "Recommendations based on previous usage".to_string(),
                enforced: false,
            }
        }
    }
}

impl ModeAdvice {
    /// 渲染为注入执行端提示词的约束段落
    pub fn render(&self) -> String {
        match self.mode {
            ExecutionMode::ResourceSpecific if self.enforced => format!(
                "[ADAPTIVE MODE] MANDATORY: use ONLY these resource servers: {}. Do not use any others.",
                self.resources.join(", ")
            ),
            ExecutionMode::ToolSpecific if self.enforced => format!(
                "[ADAPTIVE MODE] MANDATORY: use ONLY these tools, step by step: {}. Follow formal step-by-step instructions without deviation.",
                self.tools.join(", ")
            ),
            _ => {
                let mut out = format!("[ADAPTIVE MODE] {}.", self.reason);
                if !self.resources.is_empty() {
                    out.push_str(&format!(
                        " Recommended resource servers: {}.",
                        self.resources.join(", ")
                    ));
                }
                if !self.tools.is_empty() {
                    out.push_str(&format!(" Recommended tools: {}.", self.tools.join(", ")));
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_is_pure_and_fixed() {
        for c in 0..20 {
            let expected = match c {
                3 => ExecutionMode::ResourceSpecific,
                6 => ExecutionMode::ToolSpecific,
                _ => ExecutionMode::Normal,
            };
            assert_eq!(mode(c), expected);
            // 再调一次结果相同
            assert_eq!(mode(c), expected);
        }
    }

    #[test]
    fn test_recommend_unknown_session_full_access() {
        let store = SessionStore::new(3600);
        let advice = recommend(&store, "nobody", 3);
        assert_eq!(advice.mode, ExecutionMode::Normal);
        assert!(!advice.enforced);
        assert!(advice.reason.contains("full access"));
    }

    #[test]
    fn test_cycle3_top_resources_mandatory() {
        let store = SessionStore::new(3600);
        store.update_cycle("s", 1);
        store.analyze(
            "connected to alpha\nconnected to beta\nconnected to gamma\nconnected to delta",
            "s",
        );
        let advice = recommend(&store, "s", 3);
        assert_eq!(advice.mode, ExecutionMode::ResourceSpecific);
        assert!(advice.enforced);
        assert_eq!(advice.resources, vec!["alpha", "beta", "gamma"]);
        assert!(advice.render().contains("use ONLY these resource servers"));
    }

    #[test]
    fn test_cycle6_recent_tools_mandatory() {
        let store = SessionStore::new(3600);
        store.update_cycle("s", 1);
        for t in ["one_tool", "two_tool", "three_tool", "four_tool"] {
            store.analyze(&format!("use_tool: {}", t), "s");
        }
        let advice = recommend(&store, "s", 6);
        assert_eq!(advice.mode, ExecutionMode::ToolSpecific);
        assert!(advice.enforced);
        assert_eq!(advice.tools, vec!["two_tool", "three_tool", "four_tool"]);
        assert!(advice.render().contains("use ONLY these tools"));
    }

    #[test]
    fn test_forced_cycle_without_data_degrades_with_reason() {
        let store = SessionStore::new(3600);
        store.update_cycle("s", 1);
        let advice = recommend(&store, "s", 6);
        assert_eq!(advice.mode, ExecutionMode::Normal);
        assert!(!advice.enforced);
        assert!(advice.reason.contains("no tool usage observed"));
    }

    #[test]
    fn test_normal_cycle_gives_recommendations_only() {
        let store = SessionStore::new(3600);
        store.update_cycle("s", 1);
        store.analyze("use_tool: hammer\nconnected to forge", "s");
        let advice = recommend(&store, "s", 2);
        assert_eq!(advice.mode, ExecutionMode::Normal);
        assert!(!advice.enforced);
        let rendered = advice.render();
        assert!(rendered.contains("Recommended"));
        assert!(!rendered.contains("MANDATORY"));
    }
}
