//! Static catalog of known agents.

/// How the supervisor talks to an agent once it is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentDialect {
    /// One CLI subprocess per turn, NDJSON on stdout.
    StreamJson,
    /// Persistent JSON-RPC connection to the supervised process.
    Acp,
}

/// One entry in the catalog.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    /// Stable identifier clients use (`claude-code`, `codex`, ...).
    pub id: &'static str,
    /// Binary name resolved on PATH.
    pub binary: &'static str,
    /// Launch arguments for the long-lived service process.
    pub launch_args: &'static [&'static str],
    /// Extra arguments for a single streamed turn (StreamJson dialect).
    pub turn_args: &'static [&'static str],
    /// Fixed port the health endpoint answers on.
    pub health_port: u16,
    /// Package the binary ships in, for operator-facing errors.
    pub package: &'static str,
    pub dialect: AgentDialect,
}

/// All agents this server knows how to supervise.
pub const CATALOG: &[AgentSpec] = &[
    AgentSpec {
        id: "claude-code",
        binary: "claude",
        launch_args: &["serve"],
        turn_args: &["-p", "--verbose", "--output-format", "stream-json"],
        health_port: 41300,
        package: "@anthropic-ai/claude-code",
        dialect: AgentDialect::StreamJson,
    },
    AgentSpec {
        id: "codex",
        binary: "codex",
        launch_args: &["serve"],
        turn_args: &["exec", "--json"],
        health_port: 41301,
        package: "@openai/codex",
        dialect: AgentDialect::StreamJson,
    },
    AgentSpec {
        id: "gemini-cli",
        binary: "gemini",
        launch_args: &["--experimental-acp"],
        turn_args: &[],
        health_port: 41302,
        package: "@google/gemini-cli",
        dialect: AgentDialect::Acp,
    },
    AgentSpec {
        id: "opencode",
        binary: "opencode",
        launch_args: &["serve", "--port", "41303"],
        turn_args: &["run", "--print-logs", "--format", "json"],
        health_port: 41303,
        package: "opencode-ai",
        dialect: AgentDialect::StreamJson,
    },
];

/// Look up an agent by its public identifier.
pub fn find(agent_id: &str) -> Option<&'static AgentSpec> {
    CATALOG.iter().find(|spec| spec.id == agent_id)
}
