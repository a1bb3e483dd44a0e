pub mod blob;
pub mod source;
