// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Accumulation of resource validation problems.
//!
//! Resource validation does not stop at the first problem. Instead, problems
//! are reported to a [ValidationContext] so that a scan of a whole bundle can
//! describe every violation. Once the scan completes, the context is converted
//! into a single terminal error.

use {
    crate::error::{CodeSignError, ErrorKind},
    log::warn,
    serde::Serialize,
    std::fmt::{Display, Formatter},
};

/// The kind of a problem with a sealed resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum ProblemKind {
    /// Resource content does not match its seal.
    Altered,
    /// A required sealed resource does not exist.
    Missing,
    /// A resource exists that is not sealed.
    Added,
    /// The type of a resource changed (e.g. a file became a symlink).
    BadKind,
    /// A nested code object failed validation.
    BadNestedCode,
}

impl ProblemKind {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            // A changed resource type is a form of alteration.
            Self::Altered | Self::BadKind => ErrorKind::ResourceAltered,
            Self::Missing => ErrorKind::ResourceMissing,
            Self::Added => ErrorKind::ResourceAdded,
            Self::BadNestedCode => ErrorKind::BadNestedCode,
        }
    }
}

impl Display for ProblemKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Altered => "resource modified:",
            Self::Missing => "resource missing:",
            Self::Added => "resource added:",
            Self::BadKind => "resource type changed:",
            Self::BadNestedCode => "nested code invalid:",
        })
    }
}

/// A problem with a single resource.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ResourceProblem {
    pub kind: ProblemKind,
    /// Path relative to the resource root, `/` separated.
    pub path: String,
    /// Extra human readable detail.
    pub detail: Option<String>,
}

/// Receives resource validation problems.
pub trait ValidationContext {
    fn report_problem(&mut self, problem: ResourceProblem);

    /// Convert accumulated state into a final result.
    fn finish(self) -> Result<(), CodeSignError>;
}

/// A [ValidationContext] that records every problem.
///
/// The kind of the first problem recorded becomes the kind of the terminal
/// error.
#[derive(Clone, Debug, Default)]
pub struct CollectingContext {
    problems: Vec<ResourceProblem>,
    tolerate_sc_info: bool,
}

impl CollectingContext {
    /// Construct an instance honoring the legacy `SC_Info/` tolerance policy.
    pub fn with_legacy_sc_info_tolerance(tolerate: bool) -> Self {
        Self {
            problems: vec![],
            tolerate_sc_info: tolerate,
        }
    }

    pub fn problems(&self) -> &[ResourceProblem] {
        &self.problems
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Whether a path falls under the legacy `SC_Info/` store metadata carve-out.
fn is_legacy_sc_info_path(path: &str) -> bool {
    path.starts_with("SC_Info/")
        && [".sinf", ".supf", ".supp", ".supx"]
            .iter()
            .any(|ext| path.ends_with(ext))
}

impl ValidationContext for CollectingContext {
    fn report_problem(&mut self, problem: ResourceProblem) {
        if self.tolerate_sc_info && is_legacy_sc_info_path(&problem.path) {
            warn!(
                "ignoring {} {} under legacy SC_Info policy",
                problem.kind, problem.path
            );
            return;
        }

        self.problems.push(problem);
    }

    fn finish(self) -> Result<(), CodeSignError> {
        match self.problems.first() {
            None => Ok(()),
            Some(first) => Err(CodeSignError::ResourceEnvelope {
                kind: first.kind,
                problems: self.problems,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(kind: ProblemKind, path: &str) -> ResourceProblem {
        ResourceProblem {
            kind,
            path: path.to_string(),
            detail: None,
        }
    }

    #[test]
    fn first_problem_sets_kind() {
        let mut context = CollectingContext::default();
        context.report_problem(problem(ProblemKind::Missing, "a"));
        context.report_problem(problem(ProblemKind::Added, "b"));

        let err = context.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceMissing);
        assert_eq!(err.resource_problems().len(), 2);
        assert_eq!(err.resource_problems()[1].path, "b");
    }

    #[test]
    fn empty_is_ok() {
        assert!(CollectingContext::default().finish().is_ok());
    }

    #[test]
    fn legacy_sc_info() {
        let mut context = CollectingContext::with_legacy_sc_info_tolerance(true);
        context.report_problem(problem(ProblemKind::Altered, "SC_Info/Manifest.sinf"));
        assert!(context.is_empty());
        context.report_problem(problem(ProblemKind::Altered, "SC_Info/other.plist"));
        assert_eq!(context.problems().len(), 1);

        let mut context = CollectingContext::default();
        context.report_problem(problem(ProblemKind::Altered, "SC_Info/Manifest.sinf"));
        assert_eq!(context.problems().len(), 1);
    }
}
