use crate::step::{Sequence, Step};
use serde::{Deserialize, Serialize};

/// Named sequence of microstep leaves, itself usable as a workflow leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macrostep {
    pub name: String,
    pub tasks: Sequence,
}

impl Macrostep {
    pub fn new(name: impl Into<String>, tasks: impl IntoIterator<Item = Step>) -> Self {
        Self {
            name: name.into(),
            tasks: tasks.into_iter().collect(),
        }
    }
}
