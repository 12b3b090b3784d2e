//! Cell handles.

pub mod cell;

pub use cell::CellRef;
