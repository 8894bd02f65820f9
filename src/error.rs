use thiserror::Error;

/// The closed set of failure categories. Every kind maps to a fixed process
/// exit code that must stay stable across releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Usage,
    InvalidInput,
    PathOutsideRoot,
    PackageRejected,
    NotAGitRepo,
    UnexpectedFormat,
    UnsupportedFeature,
    ExecutableNotFound,
    ChecksumVerificationFailed,
    InvalidChecksum,
    MissingChecksum,
    LockfileNotFound,
    InvalidLockfileFormat,
    Fetch,
    PackageManager,
    Git,
    GitRemoteNotFound,
    GitInvalidRevision,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 18] = [
        Self::Usage,
        Self::InvalidInput,
        Self::PathOutsideRoot,
        Self::PackageRejected,
        Self::NotAGitRepo,
        Self::UnexpectedFormat,
        Self::UnsupportedFeature,
        Self::ExecutableNotFound,
        Self::ChecksumVerificationFailed,
        Self::InvalidChecksum,
        Self::MissingChecksum,
        Self::LockfileNotFound,
        Self::InvalidLockfileFormat,
        Self::Fetch,
        Self::PackageManager,
        Self::Git,
        Self::GitRemoteNotFound,
        Self::GitInvalidRevision,
    ];

    pub fn exit_code(self) -> i32 {
        match self {
            Self::Usage => 2,
            Self::InvalidInput => 3,
            Self::PathOutsideRoot => 4,
            Self::PackageRejected => 5,
            Self::NotAGitRepo => 6,
            Self::UnexpectedFormat => 7,
            Self::UnsupportedFeature => 8,
            Self::ExecutableNotFound => 9,
            Self::ChecksumVerificationFailed => 10,
            Self::InvalidChecksum => 11,
            Self::MissingChecksum => 12,
            Self::LockfileNotFound => 13,
            Self::InvalidLockfileFormat => 14,
            Self::Fetch => 15,
            Self::PackageManager => 16,
            Self::Git => 17,
            Self::GitRemoteNotFound => 18,
            Self::GitInvalidRevision => 19,
        }
    }
}

/// A classified failure with a user-facing reason and an optional suggested
/// fix. Subprocess failures additionally carry captured stderr.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct Error {
    kind: ErrorKind,
    reason: String,
    solution: Option<String>,
    docs: Option<String>,
    stderr: Option<String>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            solution: None,
            docs: None,
            stderr: None,
        }
    }

    pub fn with_solution(mut self, solution: impl Into<String>) -> Self {
        self.solution = Some(solution.into());
        self
    }

    pub fn with_docs(mut self, docs: impl Into<String>) -> Self {
        self.docs = Some(docs.into());
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, reason)
    }

    pub fn package_rejected(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::PackageRejected, reason)
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFeature, reason)
    }

    pub fn fetch(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fetch, reason).with_solution(
            "The error might be intermittent, please try again.\n\
             If the issue persists, check the URL and your network configuration.",
        )
    }

    pub fn package_manager(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::PackageManager, reason).with_solution(
            "The output of the failing command should provide more details.\n\
             The failure may also be intermittent, please try again.",
        )
    }

    pub fn lockfile_not_found(path: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::LockfileNotFound,
            format!("lockfile not found: {path}"),
        )
        .with_solution(
            "Make sure the lockfile is checked in to your repository, \
             or point the package input at the correct lockfile path.",
        )
    }

    pub fn invalid_lockfile(path: impl std::fmt::Display, detail: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::InvalidLockfileFormat,
            format!("invalid lockfile {path}: {detail}"),
        )
        .with_solution("Check the lockfile format and whether any required keys are missing.")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }

    /// The full user-facing rendering: reason, indented solution hint,
    /// docs link, and any captured subprocess stderr.
    pub fn friendly_msg(&self) -> String {
        let mut msg = self.reason.clone();
        if let Some(solution) = &self.solution {
            for line in solution.lines() {
                msg.push_str("\n  ");
                msg.push_str(line.trim_start());
            }
        }
        if let Some(docs) = &self.docs {
            msg.push_str("\n  Docs: ");
            msg.push_str(docs);
        }
        if let Some(stderr) = &self.stderr
            && !stderr.trim().is_empty()
        {
            msg.push_str("\nstderr:\n");
            msg.push_str(stderr.trim_end());
        }
        msg
    }
}
