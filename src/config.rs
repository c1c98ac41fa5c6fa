use std::path::{Path, PathBuf};

use crate::local::{CommandCompiler, Preprocessor};
use crate::remote::chunk::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};

/// Environment version requested when no archive is configured.
pub const ANY_ENVIRONMENT: &str = "*";

const ARCHIVE_SUFFIX: &str = ".tar.bz2";

/// Build environment the workers must run this job in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Archive streamed to workers that lack the environment.
    pub archive: Option<PathBuf>,
    /// Version identifier sent to the scheduler.
    pub version: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            archive: None,
            version: ANY_ENVIRONMENT.to_string(),
        }
    }
}

impl EnvironmentConfig {
    /// Derive the version from an archive path.
    ///
    /// `/envs/gcc-12.tar.bz2` names version `gcc-12`; any other path is used verbatim.
    pub fn from_archive(archive: impl Into<PathBuf>) -> Self {
        let archive = archive.into();
        let raw = archive.to_string_lossy().into_owned();
        let version = match raw.strip_suffix(ARCHIVE_SUFFIX) {
            Some(stem) if !stem.is_empty() => Path::new(stem)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| stem.to_string()),
            _ => raw,
        };
        Self {
            archive: Some(archive),
            version,
        }
    }
}

/// The local compiler command, shared by preprocessing and local fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            program: "cc".to_string(),
            args: Vec::new(),
        }
    }
}

impl ToolchainConfig {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `<program> <args...> -E <input>`
    pub fn preprocessor(&self) -> Preprocessor {
        let mut args = self.args.clone();
        args.push("-E".to_string());
        Preprocessor::new(self.program.clone(), args)
    }

    /// `<program> <args...> -c <input> -o <output>`
    pub fn local_compiler(&self) -> CommandCompiler {
        CommandCompiler::new(self.program.clone(), self.args.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Scheduler address in host:port form.
    pub scheduler_addr: String,
    pub environment: EnvironmentConfig,
    /// Copies requested per job; copy 0 is the one the user sees.
    pub redundancy: u32,
    pub chunk_size: usize,
    pub toolchain: ToolchainConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scheduler_addr: "127.0.0.1:8765".to_string(),
            environment: EnvironmentConfig::default(),
            redundancy: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_scheduler(mut self, addr: impl Into<String>) -> Self {
        self.scheduler_addr = addr.into();
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentConfig) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_redundancy(mut self, copies: u32) -> Self {
        self.redundancy = copies.max(1);
        self
    }

    /// Clamped so that every chunk fits in a single frame.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    pub fn with_toolchain(mut self, toolchain: ToolchainConfig) -> Self {
        self.toolchain = toolchain;
        self
    }
}
