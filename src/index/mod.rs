pub mod states;
pub mod neighbors;
pub mod kd_tree;
