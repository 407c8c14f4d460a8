//! Named sub-agent registry.
//!
//! Each orchestrator phase looks up a named sub-agent (`preview-agent`,
//! `blueprint-agent`, ...) sharing a capability record: a role, a system
//! prompt and a tool allowlist. Read-only agents never receive writing
//! tools.

use std::collections::HashMap;

/// Role a sub-agent plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Ask,
    Preview,
    Blueprint,
    Scaffold,
    Coding,
    Debugging,
    Review,
    Compression,
}

/// Read-only tool set for exploration agents.
const READ_ONLY_TOOLS: &[&str] = &["read", "glob", "grep", "list", "codesearch"];

/// Full tool set for implementing agents.
const FULL_TOOLS: &[&str] = &[
    "read",
    "glob",
    "grep",
    "list",
    "codesearch",
    "write",
    "edit",
    "notebookedit",
];

/// Capability record for one named sub-agent.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub name: &'static str,
    pub role: AgentRole,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
}

impl AgentSpec {
    fn new(name: &'static str, role: AgentRole, system_prompt: &str, tools: &[&str]) -> Self {
        Self {
            name,
            role,
            system_prompt: system_prompt.to_string(),
            allowed_tools: tools.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Whether this agent may write files.
    pub fn can_write(&self) -> bool {
        self.allowed_tools.iter().any(|t| t == "write" || t == "edit")
    }
}

/// Registry mapping agent name to its capability record.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: HashMap<&'static str, AgentSpec>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        let specs = vec![
            AgentSpec::new(
                "ask-agent",
                AgentRole::Ask,
                "You are the ask-agent. Ask one clarification question at a time about the \
                 user's objective. When you understand enough to plan, reply with a technical \
                 summary and the line `enough: true`.",
                READ_ONLY_TOOLS,
            ),
            AgentSpec::new(
                "preview-agent",
                AgentRole::Preview,
                "You are the preview-agent. Explore the codebase read-only and report the \
                 structure, conventions and extension points relevant to the objective. Do not \
                 modify anything.",
                READ_ONLY_TOOLS,
            ),
            AgentSpec::new(
                "blueprint-agent",
                AgentRole::Blueprint,
                "You are the blueprint-agent. Produce an architecture overview followed by a \
                 stage plan as JSON inside a ```stage-plan fence. Stages run sequentially; \
                 tasks within a stage run in parallel and must own disjoint files.",
                READ_ONLY_TOOLS,
            ),
            AgentSpec::new(
                "scaffold-agent",
                AgentRole::Scaffold,
                "You are the scaffold-agent. Create stub files for every planned file with \
                 inline comments describing intended signatures and behavior. No \
                 implementations.",
                FULL_TOOLS,
            ),
            AgentSpec::new(
                "coding-agent",
                AgentRole::Coding,
                "You are the coding-agent. Implement exactly your assigned task within its \
                 planned files. Publish integration-relevant values with \
                 [TASK_BROADCAST: key=value]. When the whole objective is demonstrably done, \
                 include [TASK_COMPLETE].",
                FULL_TOOLS,
            ),
            AgentSpec::new(
                "debugging-agent",
                AgentRole::Debugging,
                "You are the debugging-agent. Diagnose and fix failures across the modified \
                 files. If a coding task must be redone, emit [RETURN TO STAGE n] and one \
                 [FAILED_TASK: id] line per task. When the stage is verified, emit \
                 [STAGE n/m: NAME - COMPLETE].",
                FULL_TOOLS,
            ),
            AgentSpec::new(
                "review-agent",
                AgentRole::Review,
                "You are the review-agent. Audit the modified files against the objective and \
                 acceptance checks. Flag broken tasks with [FAILED_TASK: id] lines; change \
                 nothing yourself.",
                READ_ONLY_TOOLS,
            ),
            AgentSpec::new(
                "compression-agent",
                AgentRole::Compression,
                "You are the compression-agent. Rewrite the provided working context, keeping \
                 concrete decisions, file paths and signatures, errors and their resolutions, \
                 cross-task dependencies and test outcomes. Drop exploration logs, reasoning \
                 chains and repetition.",
                &[],
            ),
        ];

        Self {
            agents: specs.into_iter().map(|s| (s.name, s)).collect(),
        }
    }
}

impl AgentRegistry {
    /// Look up an agent by name.
    pub fn get(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.get(name)
    }

    /// Look up an agent, failing loudly for unknown names. Registry keys
    /// are compile-time constants, so a miss is a programming error.
    pub fn expect(&self, name: &str) -> &AgentSpec {
        self.agents
            .get(name)
            .unwrap_or_else(|| panic!("unknown sub-agent: {name}"))
    }

    /// All registered agent names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.agents.keys().copied().collect();
        names.sort();
        names
    }
}
