//! Neutral tree representation and the cursor protocol shared by every store.

pub mod cursor;
pub mod map_tree;
pub mod path;
pub mod value;

pub use cursor::{CursorLocationType, StackCursor, TreeCursor, TreeNodeLike};
pub use map_tree::{
    cursor_for_map_tree, cursor_for_map_tree_field, map_tree_field_from_cursor,
    map_tree_from_cursor, MapTree,
};
pub use path::{FieldUpPath, PathStep, UpPath};
pub use value::{Value, ValueSchema};
