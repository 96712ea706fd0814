pub mod blob;
pub mod postgres;
