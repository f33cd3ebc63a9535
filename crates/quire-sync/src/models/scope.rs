//! Update streams an account syncs

use std::fmt;

use super::ids::Guid;
use super::LinkedNotebook;

/// Which update stream an operation belongs to: the account's own data, or
/// one linked notebook reached through another account's note store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Own,
    Linked(Box<LinkedNotebook>),
}

impl Scope {
    pub fn linked(notebook: LinkedNotebook) -> Self {
        Self::Linked(Box::new(notebook))
    }

    /// Guid of the linked notebook, `None` for the own account.
    pub fn guid(&self) -> Option<&Guid> {
        match self {
            Self::Own => None,
            Self::Linked(notebook) => notebook.meta.guid.as_ref(),
        }
    }

    pub const fn linked_notebook(&self) -> Option<&LinkedNotebook> {
        match self {
            Self::Own => None,
            Self::Linked(notebook) => Some(notebook),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.guid() {
            Some(guid) => write!(f, "linked:{guid}"),
            None => f.write_str("own"),
        }
    }
}
