pub mod base_images_phase;
pub mod build_phase;
pub mod conveyor;
pub mod dimg;
pub mod graph;
pub mod image;
pub mod push_phase;
pub mod signatures_phase;
pub mod stage;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

pub use conveyor::Conveyor;
pub use dimg::Dimg;

/// Options for the build phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// On failure, keep the failed container alive and surface a shell
    /// handle on the failed state.
    pub introspect_after_error: bool,
    /// On failure, re-prepare the stage without the failing instructions and
    /// surface a shell handle on the clean state.
    pub introspect_before_error: bool,
}

/// Options for the push phase.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub tags_by_scheme: BTreeMap<TagScheme, Vec<String>>,
    /// Also push every stage of every image as `dimgstage-<signature>`.
    pub with_stages: bool,
}

/// The closed set of tag schemes a publication can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TagScheme {
    Custom,
    Ci,
    GitBranch,
    GitTag,
    GitCommit,
}

impl TagScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagScheme::Custom => "custom",
            TagScheme::Ci => "ci",
            TagScheme::GitBranch => "git_branch",
            TagScheme::GitTag => "git_tag",
            TagScheme::GitCommit => "git_commit",
        }
    }
}

impl std::fmt::Display for TagScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sweep over all images performing a specific transformation. Phases
/// run sequentially in a fixed order; a failing phase aborts the rest.
#[async_trait]
pub trait Phase {
    fn name(&self) -> &'static str;
    async fn run(&mut self, conveyor: &mut Conveyor) -> Result<()>;
}

/// User-facing build narrative line, in the classic `# ...` style.
pub(crate) fn narrate(line: impl AsRef<str>) {
    use owo_colors::OwoColorize;
    println!("{}", format!("# {}", line.as_ref()).bold());
}
