pub mod buffer;
pub mod bindings;

pub use bindings::{FieldBindings, FieldSlot};
pub use buffer::{ElementType, FieldBuffer, SharedBuffer};
