//! Runtime configuration for executing submitted programs
//!
//! A runtime is the interpreter a program is handed to. The set of runtime ids is
//! closed; the command used for each one comes from a TOML table so the
//! interpreter path can change without a rebuild.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

/// Placeholder in a run command that is replaced by the program text
const CODE_PLACEHOLDER: &str = "{code}";

/// Supported execution environments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeId {
    #[serde(rename = "python3")]
    Python3,
}

impl RuntimeId {
    pub const ALL: [RuntimeId; 1] = [RuntimeId::Python3];

    /// Stable wire token
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeId::Python3 => "python3",
        }
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeId {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuntimeId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| RegistryError::UnknownRuntime(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown runtime: {0}")]
    UnknownRuntime(String),
    #[error("invalid run command for {runtime}: {reason}")]
    InvalidCommand { runtime: RuntimeId, reason: String },
    #[error("token {token} is bound to both {first} and {second}")]
    DuplicateToken {
        token: String,
        first: RuntimeId,
        second: RuntimeId,
    },
    #[error("failed to read runtime table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse runtime table: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How to launch one runtime
#[derive(Debug, Clone)]
pub struct RuntimeSpec {
    id: RuntimeId,
    /// Interpreter path or name
    program: String,
    /// Argument template; one entry is the code placeholder
    args: Vec<String>,
}

impl RuntimeSpec {
    fn parse(id: RuntimeId, run_command: &str) -> Result<Self, RegistryError> {
        let mut parts = run_command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| RegistryError::InvalidCommand {
            runtime: id,
            reason: "command is empty".into(),
        })?;
        if program == CODE_PLACEHOLDER {
            return Err(RegistryError::InvalidCommand {
                runtime: id,
                reason: format!("{} cannot be the program", CODE_PLACEHOLDER),
            });
        }

        let args: Vec<String> = parts.collect();
        if !args.iter().any(|a| a == CODE_PLACEHOLDER) {
            return Err(RegistryError::InvalidCommand {
                runtime: id,
                reason: format!("missing {} placeholder", CODE_PLACEHOLDER),
            });
        }

        Ok(Self { id, program, args })
    }

    pub fn id(&self) -> RuntimeId {
        self.id
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments with the program text substituted in
    pub fn args_for(&self, code: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                if a == CODE_PLACEHOLDER {
                    code.to_string()
                } else {
                    a.clone()
                }
            })
            .collect()
    }

    /// Build the command that runs `code` inline (no temp file)
    pub fn command(&self, code: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args_for(code));
        cmd
    }
}

/// Raw TOML configuration for a runtime
#[derive(Debug, Deserialize)]
struct RawRuntimeConfig {
    run_command: String,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Loaded runtime table
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    specs: HashMap<RuntimeId, RuntimeSpec>,
    /// Lowercase token (id or alias) -> runtime
    tokens: HashMap<String, RuntimeId>,
}

impl RuntimeRegistry {
    /// Runtime table compiled into the binary
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_toml_str(include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/files/runtimes.toml"
        )))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RegistryError> {
        let raw_configs: HashMap<String, RawRuntimeConfig> = toml::from_str(content)?;

        let mut specs = HashMap::new();
        let mut tokens: HashMap<String, RuntimeId> = HashMap::new();

        for (name, raw) in raw_configs {
            let id: RuntimeId = name.to_lowercase().parse()?;
            let spec = RuntimeSpec::parse(id, &raw.run_command)?;

            let names = std::iter::once(id.as_str().to_string())
                .chain(raw.aliases.iter().map(|a| a.to_lowercase()));
            for token in names {
                match tokens.get(&token) {
                    Some(&existing) if existing != id => {
                        return Err(RegistryError::DuplicateToken {
                            token,
                            first: existing,
                            second: id,
                        });
                    }
                    _ => {
                        tokens.insert(token, id);
                    }
                }
            }

            specs.insert(id, spec);
        }

        Ok(Self { specs, tokens })
    }

    /// Look up a runtime by id or alias, ignoring case
    pub fn resolve(&self, token: &str) -> Option<&RuntimeSpec> {
        let id = self.tokens.get(&token.trim().to_lowercase())?;
        self.specs.get(id)
    }

    pub fn get(&self, id: RuntimeId) -> Option<&RuntimeSpec> {
        self.specs.get(&id)
    }

    /// All accepted tokens, sorted
    pub fn supported(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tokens.keys().cloned().collect();
        names.sort();
        names
    }
}
