pub mod design;
pub mod fit;
pub mod formula;
pub mod linalg;
pub mod metadata;
pub mod solver;
