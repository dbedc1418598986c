#![forbid(unsafe_code)]

pub mod graph;

pub mod keys {
    /// Stable unique identifier for one tracked job execution.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct JobKey(String);

    impl JobKey {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, JobKeyError> {
            let value = value.into();
            validate_job_key(&value)?;
            Ok(Self(value))
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum JobKeyError {
        Empty,
        TooLong,
        ContainsWhitespace,
        ContainsControl,
    }

    impl JobKeyError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::Empty => "job key must not be empty",
                Self::TooLong => "job key is too long",
                Self::ContainsWhitespace => "job key must not contain whitespace",
                Self::ContainsControl => "job key contains control characters",
            }
        }
    }

    fn validate_job_key(value: &str) -> Result<(), JobKeyError> {
        if value.is_empty() {
            return Err(JobKeyError::Empty);
        }
        if value.len() > 256 {
            return Err(JobKeyError::TooLong);
        }
        if value.chars().any(|c| c.is_whitespace()) {
            return Err(JobKeyError::ContainsWhitespace);
        }
        if value.chars().any(|c| c.is_control()) {
            return Err(JobKeyError::ContainsControl);
        }
        Ok(())
    }

    /// Replaces characters outside `[A-Za-z0-9_.-]` with `+` so arbitrary
    /// program names can be embedded in generated job keys.
    pub fn escape_key_fragment(input: &str) -> String {
        input
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '+'
                }
            })
            .collect()
    }

    /// Name of a recorded, replayable job sequence.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct SequenceName(String);

    impl SequenceName {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, SequenceNameError> {
            let value = value.into();
            validate_sequence_name(&value)?;
            Ok(Self(value))
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum SequenceNameError {
        Empty,
        TooLong,
        InvalidChar { ch: char, index: usize },
    }

    impl SequenceNameError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::Empty => "sequence name must not be empty",
                Self::TooLong => "sequence name is too long (max 255 characters)",
                Self::InvalidChar { .. } => {
                    "sequence name may only contain letters, digits, '_', '-' and '.'"
                }
            }
        }
    }

    fn validate_sequence_name(value: &str) -> Result<(), SequenceNameError> {
        if value.is_empty() {
            return Err(SequenceNameError::Empty);
        }
        if value.len() > 255 {
            return Err(SequenceNameError::TooLong);
        }
        for (index, ch) in value.chars().enumerate() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.') {
                continue;
            }
            return Err(SequenceNameError::InvalidChar { ch, index });
        }
        Ok(())
    }

}

pub mod model {
    /// Job lifecycle state, derived from timestamps and the exit code.
    ///
    /// `Succeeded` and `Failed` are terminal; transitions only move forward.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum JobStatus {
        Pending,
        Running,
        Succeeded,
        Failed,
    }

    impl JobStatus {
        pub fn as_str(self) -> &'static str {
            match self {
                JobStatus::Pending => "pending",
                JobStatus::Running => "running",
                JobStatus::Succeeded => "succeeded",
                JobStatus::Failed => "failed",
            }
        }

        pub fn is_terminal(self) -> bool {
            matches!(self, JobStatus::Succeeded | JobStatus::Failed)
        }
    }

    /// What a dependency edge requires of the job it points at.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum DepPredicate {
        /// Satisfied once the dependency is terminal, whatever its exit code.
        AnyExit,
        /// Satisfied only when the dependency succeeded (exit code 0).
        SuccessOnly,
    }

    impl DepPredicate {
        pub fn as_str(self) -> &'static str {
            match self {
                DepPredicate::AnyExit => "any_exit",
                DepPredicate::SuccessOnly => "success_only",
            }
        }

        pub fn parse(value: &str) -> Option<Self> {
            match value {
                "any_exit" => Some(DepPredicate::AnyExit),
                "success_only" => Some(DepPredicate::SuccessOnly),
                _ => None,
            }
        }
    }

    /// One dependency edge: the key this job waits for, plus its predicate.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct DepEdge {
        pub on: String,
        pub predicate: DepPredicate,
    }

    pub fn derive_status(
        start_time_ms: Option<i64>,
        stop_time_ms: Option<i64>,
        exit_code: Option<i64>,
    ) -> JobStatus {
        if stop_time_ms.is_some() {
            if exit_code == Some(0) {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed
            }
        } else if start_time_ms.is_some() {
            JobStatus::Running
        } else {
            JobStatus::Pending
        }
    }

    /// Display form of an argument vector, quoting shell-sensitive parts.
    pub fn cmd_display(cmd: &[String]) -> String {
        cmd.iter()
            .map(|arg| quote_arg(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn quote_arg(arg: &str) -> String {
        let safe = !arg.is_empty()
            && arg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '='));
        if safe {
            arg.to_string()
        } else {
            format!("'{}'", arg.replace('\'', "'\\''"))
        }
    }

}
