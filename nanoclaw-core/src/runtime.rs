use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Claude,
    Codex,
    Opencode,
}

impl RuntimeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Claude => "claude",
            RuntimeKind::Codex => "codex",
            RuntimeKind::Opencode => "opencode",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(RuntimeKind::Claude),
            "codex" => Some(RuntimeKind::Codex),
            "opencode" => Some(RuntimeKind::Opencode),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Container,
    EphemeralVm,
    PersistentVm,
    InProcess,
}

impl SandboxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxKind::Container => "container",
            SandboxKind::EphemeralVm => "ephemeral_vm",
            SandboxKind::PersistentVm => "persistent_vm",
            SandboxKind::InProcess => "in_process",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "container" | "docker" => Some(SandboxKind::Container),
            "vibe" | "ephemeral_vm" => Some(SandboxKind::EphemeralVm),
            "persistent_vm" | "tart" => Some(SandboxKind::PersistentVm),
            "in_process" | "inprocess" => Some(SandboxKind::InProcess),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_kind_roundtrips() {
        for kind in [RuntimeKind::Claude, RuntimeKind::Codex, RuntimeKind::Opencode] {
            assert_eq!(RuntimeKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn sandbox_kind_accepts_legacy_aliases() {
        assert_eq!(SandboxKind::parse("docker"), Some(SandboxKind::Container));
        assert_eq!(SandboxKind::parse("tart"), Some(SandboxKind::PersistentVm));
        assert_eq!(SandboxKind::parse("bogus"), None);
    }
}
