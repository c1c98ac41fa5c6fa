use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rkyv::{Archive, Deserialize, Serialize};

/// Source language of a compile job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum Language {
    C,
    Cxx,
    ObjC,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cxx => "c++",
            Language::ObjC => "objective-c",
        }
    }

    /// Guess the language from a source file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "c" | "i" => Some(Language::C),
            "cc" | "cpp" | "cxx" | "C" | "c++" | "ii" => Some(Language::Cxx),
            "m" | "mi" => Some(Language::ObjC),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c" => Ok(Language::C),
            "c++" | "cxx" | "cpp" => Ok(Language::Cxx),
            "objective-c" | "objc" => Ok(Language::ObjC),
            other => Err(format!("unknown language: {other}")),
        }
    }
}

/// One compile job as seen by a single attempt.
///
/// The job id and environment version come from the scheduler's assignment
/// and are set at most once per attempt via [`CompileJob::assign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub language: Language,
    /// Flags the worker passes to its compiler (no input/output paths).
    pub remote_flags: Vec<String>,
    environment_version: String,
    job_id: Option<u32>,
}

impl CompileJob {
    pub fn new(
        input_file: impl Into<PathBuf>,
        output_file: impl Into<PathBuf>,
        language: Language,
    ) -> Self {
        Self {
            input_file: input_file.into(),
            output_file: output_file.into(),
            language,
            remote_flags: Vec::new(),
            environment_version: String::new(),
            job_id: None,
        }
    }

    pub fn with_remote_flags(mut self, flags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.remote_flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn job_id(&self) -> Option<u32> {
        self.job_id
    }

    pub fn environment_version(&self) -> &str {
        &self.environment_version
    }

    /// Record the scheduler's decision for this attempt.
    ///
    /// Returns false (and leaves the job untouched) if it was already assigned.
    pub fn assign(&mut self, job_id: u32, environment_version: impl Into<String>) -> bool {
        if self.job_id.is_some() {
            tracing::warn!(
                job_id,
                existing = ?self.job_id,
                "Ignoring second assignment for the same attempt"
            );
            return false;
        }
        self.job_id = Some(job_id);
        self.environment_version = environment_version.into();
        true
    }

    /// Clone this job as redundant copy `index`.
    ///
    /// Copy 0 keeps the real output path; every other copy writes into
    /// `private_dir` so that only the primary touches the user-visible file.
    pub fn copy_for(&self, index: usize, private_dir: &Path) -> Self {
        let mut copy = self.clone();
        copy.job_id = None;
        if index > 0 {
            copy.output_file = private_dir.join(format!("copy_{index:02}.o"));
        }
        copy
    }
}
