pub mod discovery;
pub mod hashing;

pub use discovery::{discover_images, has_image_extension, walk_images};
pub use hashing::file_md5;
