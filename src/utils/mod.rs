pub mod regex;
pub mod subprocess;
