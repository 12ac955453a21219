pub mod add_fields;
pub mod group;
pub mod limit;
pub mod lookup;
pub mod project;
pub mod replace_root;
pub mod skip;
pub mod sort;
pub mod unwind;
