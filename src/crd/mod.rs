mod tenant;

pub use tenant::*;
