use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of an authoring session (one replica's lifetime of edits).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identity of one atomic edit. Un-revisioned (local, not yet committed)
/// content is represented by `Option::<RevisionTag>::None` wherever a tag is optional.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RevisionTag {
    pub session: SessionId,
    pub seq: u64,
}

impl RevisionTag {
    pub fn new(session: SessionId, seq: u64) -> Self {
        Self { session, seq }
    }
}

impl fmt::Display for RevisionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.seq)
    }
}

/// Changeset-local id. Unique within the revision that allocated it.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct ChangesetLocalId(pub u32);

impl ChangesetLocalId {
    pub fn offset(self, by: u32) -> Self {
        Self(self.0 + by)
    }
}

/// Address of one indivisible sub-change within a revision.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ChangeAtomId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<RevisionTag>,
    pub local_id: ChangesetLocalId,
}

impl ChangeAtomId {
    pub fn new(revision: Option<RevisionTag>, local_id: u32) -> Self {
        Self {
            revision,
            local_id: ChangesetLocalId(local_id),
        }
    }

    /// The id `by` positions after this one within the same revision.
    pub fn offset(self, by: u32) -> Self {
        Self {
            revision: self.revision,
            local_id: self.local_id.offset(by),
        }
    }

    /// Fills in `revision` when this id has none yet.
    pub fn tagged(self, revision: Option<RevisionTag>) -> Self {
        Self {
            revision: self.revision.or(revision),
            local_id: self.local_id,
        }
    }
}

/// Identity of a nested node change inside a changeset's node table.
pub type NodeId = ChangeAtomId;

/// Id of content that is not attached under the document root.
pub type DetachedNodeId = ChangeAtomId;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Key of a field under a node.
    FieldKey
);
string_id!(
    /// Name of a node type declared in the stored schema.
    TreeNodeSchemaIdentifier
);
string_id!(
    /// Identifier of a field kind (see `change::field_kind`).
    FieldKindIdentifier
);

impl FieldKey {
    /// Key of the field holding the document content.
    pub fn root() -> Self {
        Self::new("rootFieldKey")
    }
}

impl TreeNodeSchemaIdentifier {
    /// Type of the placeholder node above the root and detached fields.
    pub fn above_root() -> Self {
        Self::new("sharedtree.placeholder.aboveRoot")
    }
}
