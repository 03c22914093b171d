use crate::docker::BuildRecipe;

/// Handle into the Conveyor's image cache: the container-engine image that
/// would materialize one stage. The Conveyor guarantees at most one handle
/// per name; stages refer to handles by name only.
#[derive(Debug, Clone)]
pub struct StageImage {
    name: String,
    from: Option<String>,
    id: Option<String>,
    pub recipe: BuildRecipe,
}

impl StageImage {
    pub fn new(from: Option<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from,
            id: None,
            recipe: BuildRecipe::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent image name, when this handle was created on top of another.
    pub fn from_name(&self) -> Option<&str> {
        self.from.as_deref()
    }

    /// Engine id of the materialized image; `None` until built or resolved
    /// from the local store.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    pub fn is_materialized(&self) -> bool {
        self.id.is_some()
    }
}
