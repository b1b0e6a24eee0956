pub mod enumerator;
pub mod properties;
