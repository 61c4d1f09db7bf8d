pub mod birthdeath;
pub mod comb;
pub mod error_model;
pub mod estimate;
pub mod family;
pub mod io;
pub mod likelihood;
pub mod matrix;
pub mod opt;
pub mod progress;
pub mod pvalue;
pub mod tree;

pub use matrix::SquareMatrix;
pub use tree::{FamilySizeRange, PhyloTree};
