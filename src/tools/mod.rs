mod error;
pub use error::*;

mod file_backend;
pub use file_backend::*;

mod store;
pub use store::*;
